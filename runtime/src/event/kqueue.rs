//! `kqueue` event source (macOS, iOS, FreeBSD).
//!
//! Sockets are watched through separate `EVFILT_READ` / `EVFILT_WRITE`
//! filters keyed by the fd. The timer is an `EVFILT_TIMER` one-shot filter
//! with a fixed ident; it lives in a different filter namespace, so it cannot
//! collide with a socket of the same number.

#![allow(unsafe_code)]

use super::{Interest, Readiness};
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

const TIMER_IDENT: libc::uintptr_t = 1;

/// A `kqueue` instance.
#[derive(Debug)]
pub struct Monitor {
    kq: OwnedFd,
}

impl Monitor {
    /// Create the kqueue. The timer filter is added lazily on first arm.
    ///
    /// # Errors
    ///
    /// Returns the OS error from `kqueue()`.
    pub fn new() -> io::Result<Self> {
        // SAFETY: plain syscall, no pointers involved.
        let fd = cvt(unsafe { libc::kqueue() })?;
        // SAFETY: `fd` was just returned by the kernel and is owned by no one else.
        let kq = unsafe { OwnedFd::from_raw_fd(fd) };
        // SAFETY: `fd` is a valid descriptor owned by `kq`.
        cvt(unsafe { libc::fcntl(kq.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) })?;
        Ok(Self { kq })
    }

    /// Block until at least one event is ready or `timeout` elapses.
    ///
    /// `None` waits indefinitely. A wait interrupted by a signal is retried.
    ///
    /// # Errors
    ///
    /// Returns the OS error from `kevent`.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let ts = timeout.map(|t| libc::timespec {
            tv_sec: libc::time_t::try_from(t.as_secs()).unwrap_or(libc::time_t::MAX),
            tv_nsec: t.subsec_nanos() as _,
        });
        let ts_ptr = ts.as_ref().map_or(ptr::null(), ptr::from_ref);
        let max_events = libc::c_int::try_from(events.buf.len()).unwrap_or(libc::c_int::MAX);

        loop {
            // SAFETY: the change list is empty; `events.buf` holds
            // `max_events` initialised slots; `ts_ptr` is null or points at
            // `ts`, which outlives the call.
            let n = unsafe {
                libc::kevent(
                    self.kq.as_raw_fd(),
                    ptr::null(),
                    0,
                    events.buf.as_mut_ptr(),
                    max_events,
                    ts_ptr,
                )
            };
            match cvt(n) {
                Ok(n) => {
                    events.len = usize::try_from(n).unwrap_or(0);
                    return Ok(events.len);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    events.len = 0;
                    return Err(e);
                }
            }
        }
    }

    /// Start watching `fd`.
    ///
    /// # Errors
    ///
    /// Returns the OS error from `kevent`.
    pub fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if interest.readable() {
            self.apply(socket_change(fd, libc::EVFILT_READ, libc::EV_ADD))?;
        }
        if interest.writable() {
            self.apply(socket_change(fd, libc::EVFILT_WRITE, libc::EV_ADD))?;
        }
        Ok(())
    }

    /// Change the interest of an already watched `fd`.
    ///
    /// Filters that are no longer wanted are deleted, new ones added.
    ///
    /// # Errors
    ///
    /// Returns the OS error from `kevent`.
    pub fn reregister(&self, fd: RawFd, previous: Interest, interest: Interest) -> io::Result<()> {
        if previous.readable() && !interest.readable() {
            self.apply_ignoring_missing(socket_change(fd, libc::EVFILT_READ, libc::EV_DELETE))?;
        }
        if previous.writable() && !interest.writable() {
            self.apply_ignoring_missing(socket_change(fd, libc::EVFILT_WRITE, libc::EV_DELETE))?;
        }
        if interest.readable() && !previous.readable() {
            self.apply(socket_change(fd, libc::EVFILT_READ, libc::EV_ADD))?;
        }
        if interest.writable() && !previous.writable() {
            self.apply(socket_change(fd, libc::EVFILT_WRITE, libc::EV_ADD))?;
        }
        Ok(())
    }

    /// Stop watching `fd`.
    ///
    /// # Errors
    ///
    /// Returns the OS error from `kevent`.
    pub fn deregister(&self, fd: RawFd, previous: Interest) -> io::Result<()> {
        if previous.readable() {
            self.apply_ignoring_missing(socket_change(fd, libc::EVFILT_READ, libc::EV_DELETE))?;
        }
        if previous.writable() {
            self.apply_ignoring_missing(socket_change(fd, libc::EVFILT_WRITE, libc::EV_DELETE))?;
        }
        Ok(())
    }

    /// Fire the timer once after `after`, replacing any pending expiry.
    ///
    /// # Errors
    ///
    /// Returns the OS error from `kevent`.
    pub fn arm_timer(&self, after: Duration) -> io::Result<()> {
        let mut change = zeroed_kevent();
        change.ident = TIMER_IDENT;
        change.filter = libc::EVFILT_TIMER;
        change.flags = libc::EV_ADD | libc::EV_ONESHOT;
        change.fflags = libc::NOTE_NSECONDS;
        change.data = i64::try_from(after.as_nanos()).unwrap_or(i64::MAX) as _;
        self.apply(change)
    }

    /// Cancel any pending timer expiry. Disarming an unarmed timer is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the OS error from `kevent`.
    pub fn disarm_timer(&self) -> io::Result<()> {
        let mut change = zeroed_kevent();
        change.ident = TIMER_IDENT;
        change.filter = libc::EVFILT_TIMER;
        change.flags = libc::EV_DELETE;
        self.apply_ignoring_missing(change)
    }

    /// One-shot filters need no acknowledgement.
    pub fn acknowledge_timer(&self) {}

    fn apply(&self, change: libc::kevent) -> io::Result<()> {
        // SAFETY: one valid change, no event list requested.
        cvt(unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                &raw const change,
                1,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        })
        .map(drop)
    }

    fn apply_ignoring_missing(&self, change: libc::kevent) -> io::Result<()> {
        match self.apply(change) {
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            other => other,
        }
    }
}

fn zeroed_kevent() -> libc::kevent {
    // SAFETY: all-zero is a valid `kevent` (null udata, no flags).
    unsafe { std::mem::zeroed() }
}

fn socket_change(fd: RawFd, filter: i16, flags: u16) -> libc::kevent {
    let mut change = zeroed_kevent();
    change.ident = libc::uintptr_t::try_from(fd).unwrap_or_default();
    change.filter = filter as _;
    change.flags = flags as _;
    change
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Reusable buffer the wait call fills.
pub struct Events {
    buf: Vec<libc::kevent>,
    len: usize,
}

// SAFETY: the only pointer in a `kevent` is `udata`, which this module never
// sets and never dereferences.
unsafe impl Send for Events {}

impl Events {
    /// Buffer able to receive `capacity` events per wait (at least one).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![zeroed_kevent(); capacity.max(1)],
            len: 0,
        }
    }

    /// Events delivered by the last wait.
    pub fn iter(&self) -> impl Iterator<Item = ReadyEvent> + '_ {
        self.buf[..self.len].iter().copied().map(ReadyEvent)
    }

    /// Number of events delivered by the last wait.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the last wait timed out without events.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Events")
            .field("capacity", &self.buf.len())
            .field("len", &self.len)
            .finish()
    }
}

/// One readiness notification.
#[derive(Clone, Copy)]
pub struct ReadyEvent(libc::kevent);

impl ReadyEvent {
    /// Whether this is the monitor's timer.
    #[must_use]
    pub fn is_timer(&self) -> bool {
        self.0.filter == libc::EVFILT_TIMER
    }

    /// The socket this event is about. Meaningless for the timer.
    #[must_use]
    pub fn socket(&self) -> RawFd {
        RawFd::try_from(self.0.ident).unwrap_or(-1)
    }

    /// Readiness mask to hand to the transfer engine.
    #[must_use]
    pub fn readiness(&self) -> Readiness {
        Readiness {
            input: self.0.filter == libc::EVFILT_READ,
            output: self.0.filter == libc::EVFILT_WRITE,
            error: self.0.flags & libc::EV_ERROR != 0,
        }
    }
}

impl fmt::Debug for ReadyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_timer() {
            return f.write_str("ReadyEvent(timer)");
        }
        f.debug_struct("ReadyEvent")
            .field("socket", &self.socket())
            .field("readiness", &self.readiness())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn timer_fires_once() {
        let monitor = Monitor::new().unwrap();
        let mut events = Events::with_capacity(4);

        monitor.arm_timer(Duration::from_nanos(1)).unwrap();
        let n = monitor.wait(&mut events, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(n, 1);
        assert!(events.iter().all(|e| e.is_timer()));

        let n = monitor.wait(&mut events, Some(Duration::from_millis(10))).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn disarm_without_arm_is_harmless() {
        let monitor = Monitor::new().unwrap();
        monitor.disarm_timer().unwrap();
    }

    #[test]
    fn writable_socket_is_reported() {
        let monitor = Monitor::new().unwrap();
        let mut events = Events::with_capacity(4);
        let (_a, b) = UnixStream::pair().unwrap();

        monitor.register(b.as_raw_fd(), Interest::Write).unwrap();
        monitor.wait(&mut events, Some(Duration::from_secs(1))).unwrap();
        let event = events.iter().next().unwrap();
        assert_eq!(event.socket(), b.as_raw_fd());
        assert!(event.readiness().output);

        monitor.deregister(b.as_raw_fd(), Interest::Write).unwrap();
        let n = monitor.wait(&mut events, Some(Duration::from_millis(10))).unwrap();
        assert_eq!(n, 0);
    }
}
