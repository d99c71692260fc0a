//! Error types for the daemon

use courier_core::{ConfigError, StoreError};
use courier_runtime::EngineError;
use courier_runtime::metrics::MetricsError;
use thiserror::Error;

/// Everything that can stop `courierd` or end a supervised worker run.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration could not be read
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The store could not be opened or prepared
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The worker failed
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The Prometheus exporter could not be installed
    #[error(transparent)]
    Metrics(#[from] MetricsError),

    /// `COURIER_METRICS_ADDR` is not a socket address
    #[error("Invalid metrics address {addr:?}: {source}")]
    MetricsAddr {
        /// Raw value
        addr: String,
        /// Parse failure
        source: std::net::AddrParseError,
    },

    /// A listener, signal handler or thread could not be set up
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The task waiting on the supervisor failed
    #[error("Supervisor task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_errors_keep_their_message() {
        let config = DaemonError::from(ConfigError::Invalid {
            name: "COURIER_TTL",
            value: "soon".to_string(),
            reason: "expected a number, found \"soon\"".to_string(),
        });
        assert!(config.to_string().starts_with("Invalid value for COURIER_TTL"));

        let store = DaemonError::from(StoreError::Database("Failed to connect: refused".to_string()));
        assert_eq!(store.to_string(), "Database error: Failed to connect: refused");

        let engine = DaemonError::from(EngineError::ArenaInUse(2));
        assert!(matches!(engine, DaemonError::Engine(_)));
    }

    #[test]
    fn bad_metrics_address_names_the_value() {
        let addr = "localhost".to_string();
        let source = addr.parse::<std::net::SocketAddr>().unwrap_err();
        let error = DaemonError::MetricsAddr { addr, source };
        assert!(error.to_string().starts_with("Invalid metrics address \"localhost\""));
    }
}
