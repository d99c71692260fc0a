//! # Courier Daemon
//!
//! Process-level plumbing around the dispatch worker: the supervision thread
//! with its restart back-off, and the signal and metrics wiring used by the
//! `courierd` binary.
//!
//! | Signal | Effect |
//! |--------|--------|
//! | `SIGHUP` | re-read `.env` and the environment, reload the worker |
//! | `SIGUSR1` | restart the worker (new connection, new multiplexer) |
//! | `SIGTERM`, Ctrl-C | shut down after the current batch |

/// Daemon errors
pub mod error;

/// Worker supervision
pub mod supervisor;

/// Signal handling
pub mod signals;

pub use error::DaemonError;
pub use supervisor::{RestartPolicy, Supervisor};
