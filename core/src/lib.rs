//! # Courier Core
//!
//! Data model, store contract and configuration for the courier HTTP
//! dispatch engine.
//!
//! This crate has no I/O of its own. It defines:
//!
//! - **Requests**: [`QueueRow`] as read from the durable queue and the
//!   validated [`PendingRequest`] the engine dispatches
//! - **Outcomes**: [`CompletionOutcome`], the terminal record written once per
//!   transfer, with order-preserving [`ResponseHeaders`]
//! - **Store contract**: the [`DispatchStore`] trait implemented by the
//!   Postgres store (`courier-postgres`) and the in-memory store
//!   (`courier-testing`)
//! - **Configuration**: [`WorkerConfig`], read at cycle boundaries
//!
//! ## Example
//!
//! ```
//! use courier_core::{HttpMethod, PendingRequest, QueueRow};
//!
//! let row = QueueRow {
//!     id: Some(7),
//!     method: Some("get".to_string()),
//!     url: Some("http://localhost:8080/ok".to_string()),
//!     timeout_milliseconds: Some(1000),
//!     headers: Some(vec!["Accept: application/json".to_string()]),
//!     body: None,
//! };
//!
//! let request = PendingRequest::try_from(row).unwrap();
//! assert_eq!(request.method, HttpMethod::Get);
//! ```

/// Worker configuration and its environment loader
pub mod config;

/// Completion outcomes and response headers
pub mod outcome;

/// Queue rows and validated pending requests
pub mod request;

/// The external queue / response store contract
pub mod store;

pub use config::{ConfigError, WorkerConfig};
pub use outcome::{CompletionOutcome, FailureOutcome, ResponseHeaders, SuccessOutcome};
pub use request::{HttpMethod, PendingRequest, QueueRow, RowError};
pub use store::{DispatchStore, StoreError};

/// Version string sent in the `User-Agent` header of every transfer.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
