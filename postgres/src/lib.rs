//! `PostgreSQL` request queue and response store for the courier dispatch engine.
//!
//! This crate provides the production [`DispatchStore`](courier_core::DispatchStore)
//! on two tables in the `net` schema:
//!
//! - `net.http_request_queue`: pending requests, claimed oldest id first
//! - `net._http_response`: one row per finished transfer, expired by age
//!
//! Alongside the store it offers the submission side ([`PgDispatchStore::enqueue`]),
//! result lookup ([`PgDispatchStore::fetch_response`], or
//! [`PgDispatchStore::collect_response`] to wait for it) and a
//! [`WakeListener`] that turns `courier_wake` notifications into worker wake-ups.
//!
//! # Example
//!
//! ```ignore
//! use courier_postgres::{NewRequest, PgDispatchStore};
//!
//! let mut store = PgDispatchStore::connect("postgres://localhost/mydb")?;
//! store.migrate()?;
//! let id = store.enqueue(&NewRequest::get("https://example.com"))?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Store-specific errors
pub mod error;

/// Wake-up notifications
pub mod listener;

/// Submission and lookup records
pub mod records;

/// The `PostgreSQL` dispatch store
pub mod store;

pub use error::PgStoreError;
pub use listener::{WAKE_CHANNEL, WakeListener};
pub use records::{CollectedResponse, NewRequest, RequestStatus, StoredResponse};
pub use store::PgDispatchStore;
