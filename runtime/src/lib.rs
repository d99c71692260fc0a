//! # Courier Runtime
//!
//! The single-threaded dispatch engine behind courier.
//!
//! One [`Worker`] repeatedly claims a batch of queued requests from a
//! [`DispatchStore`](courier_core::DispatchStore), runs every request of the
//! batch concurrently over libcurl's multi interface, and writes exactly one
//! [`CompletionOutcome`](courier_core::CompletionOutcome) per request back to
//! the store.
//!
//! ## Core Components
//!
//! - **Event source** ([`event`]): `epoll` + `timerfd` on Linux, `kqueue`
//!   elsewhere, behind one [`Monitor`](event::Monitor) type
//! - **Multiplexer** ([`multiplexer`]): owns the libcurl multi handle,
//!   answers its socket and timer callbacks, and drives transfers on readiness
//! - **Transfer binding** ([`transfer`]): one configured easy handle per request
//! - **Batch intake** ([`intake`]) and **completion drain** ([`drain`])
//! - **Timeout diagnostics** ([`diagnostics`]): where the time of a timed-out
//!   transfer went
//! - **Outer loop** ([`worker`]): the cycle, its wake/reload/restart/shutdown
//!   controls and the published worker status
//!
//! ## Example
//!
//! ```ignore
//! use courier_core::WorkerConfig;
//! use courier_runtime::{Worker, WorkerHandle};
//!
//! let handle = WorkerHandle::new();
//! let mut worker = Worker::new(store, WorkerConfig::from_env()?, handle.clone())?;
//!
//! // From another thread: handle.wake(), handle.reload(..), handle.shutdown()
//! let exit = worker.run()?;
//! ```

/// Per-batch ownership of tracked transfers
pub mod arena;

/// Timeout diagnostics
pub mod diagnostics;

/// Completion drain
pub mod drain;

/// Readiness notification facade
pub mod event;

/// Batch intake
pub mod intake;

/// Prometheus metrics for the dispatch engine
pub mod metrics;

/// Socket-action driver over the libcurl multi interface
pub mod multiplexer;

/// Transfer engine binding
pub mod transfer;

/// Outer loop and its control handle
pub mod worker;

/// Error types for the dispatch engine
pub mod error {
    use courier_core::{RowError, StoreError};
    use thiserror::Error;

    /// Errors that abort a dispatch cycle.
    ///
    /// Per-transfer network failures are never reported here; they become
    /// failure outcomes in the store. Everything in this enum means the batch
    /// could not be processed as a whole and the worker should be restarted.
    #[derive(Error, Debug)]
    pub enum EngineError {
        /// A claimed row failed validation
        ///
        /// The claim is rolled back, so the row stays queued.
        #[error("Invalid queue row: {0}")]
        Row(#[from] RowError),

        /// The store failed
        #[error(transparent)]
        Store(#[from] StoreError),

        /// libcurl refused to create or configure a transfer
        #[error("Transfer setup failed: {0}")]
        Transfer(#[from] curl::Error),

        /// The libcurl multi handle failed
        #[error("Multiplexer failed: {0}")]
        Multi(#[from] curl::MultiError),

        /// The event source failed
        #[error("Event source failed: {0}")]
        EventSource(#[from] std::io::Error),

        /// The batch arena was reset while transfers were still in flight
        #[error("Batch arena still holds {0} in-flight transfers")]
        ArenaInUse(usize),

        /// libcurl reported a transfer this engine does not track
        #[error("Unknown transfer token {0}")]
        UnknownTransfer(usize),
    }
}

pub use error::EngineError;
pub use multiplexer::Multiplexer;
pub use transfer::{TrackedTransfer, TransferOptions};
pub use worker::{CycleReport, Worker, WorkerExit, WorkerHandle, WorkerStatus};
