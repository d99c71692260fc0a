//! Readiness notification facade.
//!
//! The multiplexer only ever sees a [`Monitor`], a buffer of [`ReadyEvent`]s
//! and a [`Readiness`] mask. Which kernel facility backs them is fixed per
//! build:
//!
//! - Linux: `epoll` with a `timerfd` registered as an ordinary readable fd
//! - macOS / iOS / FreeBSD: `kqueue` with an `EVFILT_TIMER` filter
//!
//! In both variants the single timer is delivered through the same wait call
//! as socket readiness, so the event loop has one code path for "something
//! happened". The contract shared by both variants:
//!
//! | Operation | Meaning |
//! |-----------|---------|
//! | [`Monitor::new`] | create the monitor (and its timer) |
//! | [`Monitor::wait`] | block until events arrive or the wait times out; `EINTR` is retried |
//! | [`ReadyEvent::is_timer`] / [`ReadyEvent::socket`] / [`ReadyEvent::readiness`] | decode one event |
//! | [`Monitor::register`] / [`Monitor::reregister`] / [`Monitor::deregister`] | socket interest changes |
//! | [`Monitor::arm_timer`] / [`Monitor::disarm_timer`] | the single timer |
//! | `Drop` | release the kernel objects |

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
pub use epoll::{Events, Monitor, ReadyEvent};

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
mod kqueue;
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
pub use kqueue::{Events, Monitor, ReadyEvent};

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd"
)))]
compile_error!("no event loop implementation available for this platform");

/// Socket interest requested by the transfer engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    /// Wake when the socket is readable
    Read,
    /// Wake when the socket is writable
    Write,
    /// Wake on either
    ReadWrite,
}

impl Interest {
    /// Whether read readiness is wanted.
    #[must_use]
    pub const fn readable(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    /// Whether write readiness is wanted.
    #[must_use]
    pub const fn writable(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// What a ready socket can do, in the transfer engine's vocabulary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Data can be read (`CURL_CSELECT_IN`)
    pub input: bool,
    /// Data can be written (`CURL_CSELECT_OUT`)
    pub output: bool,
    /// The socket reported an error or hang-up (`CURL_CSELECT_ERR`)
    pub error: bool,
}
