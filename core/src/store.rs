//! The external queue / response store contract.
//!
//! The engine talks to exactly one store through three operations: claim a
//! batch of pending rows, record one outcome, and expire old outcomes.
//!
//! # Implementations
//!
//! - `PgDispatchStore` (in `courier-postgres`): production store on the
//!   `net.http_request_queue` / `net._http_response` tables
//! - `InMemoryDispatchStore` (in `courier-testing`): deterministic store for
//!   engine tests
//!
//! # Synchronous by construction
//!
//! The engine is a single-threaded event loop whose only suspension point is
//! the event-source wait. Store calls therefore block the loop. Async
//! implementations drive their own runtime inside each call.

use crate::outcome::CompletionOutcome;
use crate::request::QueueRow;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by store implementations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The database rejected a statement or the connection failed.
    #[error("Database error: {0}")]
    Database(String),

    /// A value could not be encoded for storage.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The store's private runtime could not be created.
    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Durable request queue plus response store.
pub trait DispatchStore {
    /// Atomically read-and-remove up to `limit` pending rows, oldest id first.
    ///
    /// `accept` runs while the claim is still open. The rows are removed from
    /// the queue only if `accept` returns `Ok`; on `Err` the claim is rolled
    /// back and every row stays pending. A row is never handed to two
    /// concurrent claims.
    ///
    /// # Errors
    ///
    /// Returns the error produced by `accept`, or a [`StoreError`] converted
    /// into `E` if the claim itself fails.
    fn consume_requests<T, E, F>(&mut self, limit: usize, accept: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce(Vec<QueueRow>) -> Result<T, E>;

    /// Persist one completion outcome.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    fn insert_outcome(&mut self, outcome: &CompletionOutcome) -> Result<(), StoreError>;

    /// Delete up to `limit` stored outcomes older than `ttl`, oldest first.
    ///
    /// Returns the number of deleted rows.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the delete fails.
    fn expire_responses(&mut self, ttl: Duration, limit: usize) -> Result<u64, StoreError>;
}
