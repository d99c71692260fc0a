//! Error types for the `PostgreSQL` store

use courier_core::StoreError;
use thiserror::Error;

/// Failures specific to the `PostgreSQL` store.
///
/// Every variant converts into the engine-facing [`StoreError`], so `?` works
/// inside functions that return it.
#[derive(Debug, Error)]
pub enum PgStoreError {
    /// The private runtime could not be built
    #[error("Failed to build store runtime: {0}")]
    Runtime(#[source] std::io::Error),

    /// The pool could not connect
    #[error("Failed to connect: {0}")]
    Connect(#[source] sqlx::Error),

    /// A schema migration failed
    #[error("Migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// The wake listener could not connect or subscribe
    #[error("Wake listener failed: {0}")]
    Listener(#[source] sqlx::Error),

    /// A statement failed
    #[error("{0}")]
    Query(#[from] sqlx::Error),

    /// Response headers could not be encoded or decoded
    #[error("Invalid response headers: {0}")]
    Headers(#[from] serde_json::Error),
}

impl From<PgStoreError> for StoreError {
    fn from(error: PgStoreError) -> Self {
        match error {
            PgStoreError::Runtime(_) => Self::Runtime(error.to_string()),
            PgStoreError::Headers(_) => Self::Serialization(error.to_string()),
            PgStoreError::Connect(_)
            | PgStoreError::Migrate(_)
            | PgStoreError::Listener(_)
            | PgStoreError::Query(_) => Self::Database(error.to_string()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn converts_into_store_error_kinds() {
        let runtime = PgStoreError::Runtime(std::io::Error::other("no threads"));
        assert!(matches!(
            StoreError::from(runtime),
            StoreError::Runtime(m) if m == "Failed to build store runtime: no threads"
        ));

        let headers = PgStoreError::from(serde_json::from_str::<u8>("x").unwrap_err());
        assert!(matches!(
            StoreError::from(headers),
            StoreError::Serialization(m) if m.starts_with("Invalid response headers")
        ));

        let connect = PgStoreError::Connect(sqlx::Error::PoolTimedOut);
        assert!(matches!(
            StoreError::from(connect),
            StoreError::Database(m) if m.starts_with("Failed to connect")
        ));

        let query = PgStoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(StoreError::from(query), StoreError::Database(_)));
    }
}
