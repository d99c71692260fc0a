//! `epoll` + `timerfd` event source (Linux).

#![allow(unsafe_code)]

use super::{Interest, Readiness};
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Token carried by the timer's registration. Socket registrations carry the
/// (non-negative) fd itself, so the two can never collide.
const TIMER_TOKEN: u64 = u64::MAX;

/// An `epoll` instance plus the `timerfd` registered in it.
#[derive(Debug)]
pub struct Monitor {
    epoll: OwnedFd,
    timer: OwnedFd,
}

impl Monitor {
    /// Create the epoll instance and its timer; the timer starts disarmed.
    ///
    /// # Errors
    ///
    /// Returns the OS error if either descriptor cannot be created.
    pub fn new() -> io::Result<Self> {
        // SAFETY: plain syscall, no pointers involved.
        let epfd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        // SAFETY: `epfd` was just returned by the kernel and is owned by no one else.
        let epoll = unsafe { OwnedFd::from_raw_fd(epfd) };

        // SAFETY: plain syscall, no pointers involved.
        let tfd = cvt(unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        })?;
        // SAFETY: as above.
        let timer = unsafe { OwnedFd::from_raw_fd(tfd) };

        let monitor = Self { epoll, timer };
        monitor.ctl(
            libc::EPOLL_CTL_ADD,
            monitor.timer.as_raw_fd(),
            libc::EPOLLIN as u32,
            TIMER_TOKEN,
        )?;
        Ok(monitor)
    }

    /// Block until at least one event is ready or `timeout` elapses.
    ///
    /// `None` waits indefinitely. Sub-millisecond timeouts round up so a
    /// pending deadline never turns into a busy loop. A wait interrupted by a
    /// signal is retried.
    ///
    /// # Errors
    ///
    /// Returns the OS error from `epoll_wait`.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = timeout.map_or(-1, |t| {
            i32::try_from(t.as_nanos().div_ceil(1_000_000)).unwrap_or(i32::MAX)
        });
        let max_events = i32::try_from(events.buf.len()).unwrap_or(i32::MAX);

        loop {
            // SAFETY: `events.buf` holds `max_events` initialised slots and
            // outlives the call.
            let n = unsafe {
                libc::epoll_wait(
                    self.epoll.as_raw_fd(),
                    events.buf.as_mut_ptr(),
                    max_events,
                    timeout_ms,
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
    /// Returns the OS error from `epoll_ctl`.
    pub fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest_mask(interest), token(fd))
    }

    /// Change the interest of an already watched `fd`.
    ///
    /// # Errors
    ///
    /// Returns the OS error from `epoll_ctl`.
    pub fn reregister(&self, fd: RawFd, _previous: Interest, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest_mask(interest), token(fd))
    }

    /// Stop watching `fd`.
    ///
    /// # Errors
    ///
    /// Returns the OS error from `epoll_ctl`.
    pub fn deregister(&self, fd: RawFd, _previous: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, token(fd))
    }

    /// Fire the timer once after `after`.
    ///
    /// A zero duration disarms a timerfd, so callers that mean "now" must pass
    /// a positive duration.
    ///
    /// # Errors
    ///
    /// Returns the OS error from `timerfd_settime`.
    pub fn arm_timer(&self, after: Duration) -> io::Result<()> {
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: libc::time_t::try_from(after.as_secs()).unwrap_or(libc::time_t::MAX),
                tv_nsec: libc::c_long::try_from(after.subsec_nanos()).unwrap_or(0),
            },
        };
        self.settime(&spec)
    }

    /// Cancel any pending timer expiry.
    ///
    /// # Errors
    ///
    /// Returns the OS error from `timerfd_settime`.
    pub fn disarm_timer(&self) -> io::Result<()> {
        // SAFETY: all-zero is a valid `itimerspec` and means "disarmed".
        let spec: libc::itimerspec = unsafe { std::mem::zeroed() };
        self.settime(&spec)
    }

    /// Consume the timer's expiration count so a level-triggered wait stops
    /// reporting it.
    pub fn acknowledge_timer(&self) {
        let mut expirations = [0u8; 8];
        // SAFETY: the buffer is 8 writable bytes, the size a timerfd read needs.
        // The fd is non-blocking; EAGAIN just means there was nothing to consume.
        let _ = unsafe {
            libc::read(
                self.timer.as_raw_fd(),
                expirations.as_mut_ptr().cast(),
                expirations.len(),
            )
        };
    }

    fn settime(&self, spec: &libc::itimerspec) -> io::Result<()> {
        // SAFETY: `spec` is a valid itimerspec; the old value is not requested.
        cvt(unsafe {
            libc::timerfd_settime(self.timer.as_raw_fd(), 0, spec, std::ptr::null_mut())
        })
        .map(drop)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        let mut event = libc::epoll_event { events, u64: token };
        // SAFETY: `event` is a valid epoll_event; the kernel copies it.
        cvt(unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &raw mut event) }).map(drop)
    }
}

fn interest_mask(interest: Interest) -> u32 {
    let mut mask = 0;
    if interest.readable() {
        mask |= libc::EPOLLIN as u32;
    }
    if interest.writable() {
        mask |= libc::EPOLLOUT as u32;
    }
    mask
}

fn token(fd: RawFd) -> u64 {
    // A negative descriptor is rejected by epoll_ctl itself.
    u64::try_from(fd).unwrap_or_default()
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
    buf: Vec<libc::epoll_event>,
    len: usize,
}

impl Events {
    /// Buffer able to receive `capacity` events per wait (at least one).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![libc::epoll_event { events: 0, u64: 0 }; capacity.max(1)],
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
pub struct ReadyEvent(libc::epoll_event);

impl ReadyEvent {
    /// Whether this is the monitor's timer.
    #[must_use]
    pub fn is_timer(&self) -> bool {
        let token = self.0.u64;
        token == TIMER_TOKEN
    }

    /// The socket this event is about. Meaningless for the timer.
    #[must_use]
    pub fn socket(&self) -> RawFd {
        let token = self.0.u64;
        RawFd::try_from(token).unwrap_or(-1)
    }

    /// Readiness mask to hand to the transfer engine.
    #[must_use]
    pub fn readiness(&self) -> Readiness {
        let bits = self.0.events;
        let input = bits & libc::EPOLLIN as u32 != 0;
        let output = bits & libc::EPOLLOUT as u32 != 0;
        Readiness {
            input,
            output,
            error: !input && !output,
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
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    #[test]
    fn socket_tokens_stay_clear_of_the_timer() {
        assert_eq!(token(0), 0);
        assert_eq!(token(RawFd::MAX), u64::from(u32::MAX >> 1));
        assert_ne!(token(RawFd::MAX), TIMER_TOKEN);
    }

    #[test]
    fn timer_fires_through_wait() {
        let monitor = Monitor::new().unwrap();
        let mut events = Events::with_capacity(4);

        monitor.arm_timer(Duration::from_nanos(1)).unwrap();
        let n = monitor.wait(&mut events, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(n, 1);
        assert!(events.iter().all(|e| e.is_timer()));

        monitor.acknowledge_timer();
        let n = monitor.wait(&mut events, Some(Duration::from_millis(10))).unwrap();
        assert_eq!(n, 0, "acknowledged timer must not be reported again");
    }

    #[test]
    fn disarmed_timer_stays_quiet() {
        let monitor = Monitor::new().unwrap();
        let mut events = Events::with_capacity(4);

        monitor.arm_timer(Duration::from_millis(20)).unwrap();
        monitor.disarm_timer().unwrap();
        let n = monitor.wait(&mut events, Some(Duration::from_millis(50))).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn socket_readiness_maps_to_input_and_output() {
        let monitor = Monitor::new().unwrap();
        let mut events = Events::with_capacity(4);
        let (mut a, b) = UnixStream::pair().unwrap();

        monitor.register(b.as_raw_fd(), Interest::Write).unwrap();
        monitor.wait(&mut events, Some(Duration::from_secs(1))).unwrap();
        let event = events.iter().next().unwrap();
        assert!(!event.is_timer());
        assert_eq!(event.socket(), b.as_raw_fd());
        assert!(event.readiness().output);
        assert!(!event.readiness().input);

        a.write_all(b"x").unwrap();
        monitor
            .reregister(b.as_raw_fd(), Interest::Write, Interest::Read)
            .unwrap();
        monitor.wait(&mut events, Some(Duration::from_secs(1))).unwrap();
        let event = events.iter().next().unwrap();
        assert!(event.readiness().input);
        assert!(!event.readiness().error);

        monitor.deregister(b.as_raw_fd(), Interest::Read).unwrap();
        let n = monitor.wait(&mut events, Some(Duration::from_millis(10))).unwrap();
        assert_eq!(n, 0);
    }
}
