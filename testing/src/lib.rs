//! # Courier Testing
//!
//! Test doubles for the courier dispatch engine.
//!
//! This crate provides:
//! - [`InMemoryDispatchStore`]: a transactional in-memory queue/response store
//! - [`MockServer`]: an `axum` HTTP server with fixed routes, started on its
//!   own thread so synchronous engine tests can call it
//!
//! ## Example
//!
//! ```no_run
//! use courier_testing::{InMemoryDispatchStore, MockServer};
//!
//! let server = MockServer::start().unwrap();
//! let mut store = InMemoryDispatchStore::new();
//! store.enqueue("GET", &server.url("/json"), &[], None, 1000);
//! // ... run one worker cycle over `store` ...
//! ```

/// In-memory dispatch store
pub mod store;

/// Mock HTTP server
pub mod server;

pub use server::MockServer;
pub use store::InMemoryDispatchStore;
