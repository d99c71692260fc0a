//! Prometheus metrics for the dispatch engine.
//!
//! The engine records through the `metrics` facade unconditionally; nothing
//! is exported until a [`MetricsServer`] installs the Prometheus recorder.
//!
//! # Example
//!
//! ```rust,no_run
//! use courier_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Serve `server.render()` at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use courier_core::CompletionOutcome;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder plus the address it is meant to be scraped on.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a metrics server for `addr` (e.g. `0.0.0.0:9090`).
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Address the endpoint should listen on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Describe the engine's metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns an error if the recorder cannot be built or installed.
    ///
    /// # Note
    ///
    /// A recorder can be installed once per process. If one already is (e.g.
    /// in tests), this logs a warning, succeeds, and [`render`](Self::render)
    /// returns `None`.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!(
        "courier_requests_consumed_total",
        "Total number of queued requests claimed by batch intake"
    );
    describe_counter!(
        "courier_responses_total",
        "Total number of outcomes written, labelled by outcome"
    );
    describe_counter!(
        "courier_timeouts_total",
        "Total number of transfers that hit their own timeout"
    );
    describe_counter!(
        "courier_responses_expired_total",
        "Total number of stored responses deleted by the expiry sweep"
    );
    describe_gauge!(
        "courier_transfers_in_flight",
        "Transfers handed to the multiplexer and not yet drained"
    );
    describe_histogram!(
        "courier_cycle_duration_seconds",
        "Wall time of one dispatch cycle"
    );
}

/// Dispatch engine metrics recorder.
pub struct DispatchMetrics;

impl DispatchMetrics {
    /// Record rows claimed by one intake.
    pub fn record_consumed(count: usize) {
        counter!("courier_requests_consumed_total").increment(count as u64);
    }

    /// Record one written outcome.
    pub fn record_outcome(outcome: &CompletionOutcome) {
        counter!("courier_responses_total", "outcome" => outcome.kind()).increment(1);
        if outcome.timed_out() {
            counter!("courier_timeouts_total").increment(1);
        }
    }

    /// Record rows deleted by the expiry sweep.
    pub fn record_expired(count: u64) {
        counter!("courier_responses_expired_total").increment(count);
    }

    /// Publish the current number of in-flight transfers.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_in_flight(count: usize) {
        gauge!("courier_transfers_in_flight").set(count as f64);
    }

    /// Record one cycle's duration.
    pub fn record_cycle(duration: Duration) {
        histogram!("courier_cycle_duration_seconds").record(duration.as_secs_f64());
    }
}
