//! Socket-action driver over the libcurl multi interface.
//!
//! libcurl tells the application which sockets it wants watched, and when it
//! next needs a timeout tick, through two callbacks. Both land in the
//! [`Reactor`], which mirrors them into the event source. The
//! [`Multiplexer`] then blocks on the event source and feeds every readiness
//! event back into libcurl, draining finished transfers after each one.
//!
//! The callbacks cannot return errors to the driver, so a failing event
//! source call is parked in the reactor and raised by the driver right after
//! the libcurl call that triggered it.

use crate::arena::BatchArena;
use crate::drain::drain_completed;
use crate::error::EngineError;
use crate::event::{Events, Interest, Monitor};
use crate::metrics::DispatchMetrics;
use crate::transfer::{ResponseSink, TrackedTransfer};
use courier_core::{DispatchStore, PendingRequest};
use curl::easy::Easy2;
use curl::multi::{Events as CurlEvents, Multi, SocketEvents};
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Smallest timer libcurl's "time out now" is mapped to.
///
/// A zero expiry means "disarm" to `timerfd`, so "now" becomes "next tick".
pub const IMMEDIATE: Duration = Duration::from_nanos(1);

/// Upper bound on one wait, after which libcurl gets a timeout tick anyway.
const WAIT_CEILING: Duration = Duration::from_secs(1);

/// Interest change requested by libcurl's socket callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketInterest {
    /// Watch for readability
    Read,
    /// Watch for writability
    Write,
    /// Watch for both
    ReadWrite,
    /// Stop watching
    Remove,
}

impl SocketInterest {
    fn interest(self) -> Option<Interest> {
        match self {
            Self::Read => Some(Interest::Read),
            Self::Write => Some(Interest::Write),
            Self::ReadWrite => Some(Interest::ReadWrite),
            Self::Remove => None,
        }
    }
}

impl From<SocketEvents> for SocketInterest {
    fn from(events: SocketEvents) -> Self {
        if events.remove() {
            Self::Remove
        } else if events.input_and_output() {
            Self::ReadWrite
        } else if events.output() {
            Self::Write
        } else {
            Self::Read
        }
    }
}

/// Last request of libcurl's timer callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimerState {
    /// No tick wanted
    #[default]
    Disarmed,
    /// Tick wanted after this long
    Armed(Duration),
}

#[derive(Debug, Default)]
struct ReactorState {
    registrations: HashMap<RawFd, Interest>,
    timer: TimerState,
    failure: Option<io::Error>,
}

/// Event-source state shared with libcurl's callbacks.
#[derive(Debug)]
pub struct Reactor {
    monitor: Monitor,
    state: Mutex<ReactorState>,
}

impl Reactor {
    /// Wrap a fresh monitor.
    #[must_use]
    pub fn new(monitor: Monitor) -> Self {
        Self {
            monitor,
            state: Mutex::new(ReactorState::default()),
        }
    }

    /// The underlying event source.
    #[must_use]
    pub const fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    fn lock(&self) -> MutexGuard<'_, ReactorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply one socket callback.
    ///
    /// The first call for a descriptor registers it, [`SocketInterest::Remove`]
    /// deregisters it and forgets the entry, anything else changes the
    /// interest of the existing registration.
    pub fn on_socket(&self, fd: RawFd, requested: SocketInterest) {
        let mut state = self.lock();
        let previous = state.registrations.get(&fd).copied();

        let result = match (previous, requested.interest()) {
            (None, Some(interest)) => {
                debug!(fd, ?interest, "registering socket");
                self.monitor
                    .register(fd, interest)
                    .map(|()| drop(state.registrations.insert(fd, interest)))
            }
            (Some(previous), Some(interest)) => {
                debug!(fd, ?interest, "modifying socket");
                self.monitor
                    .reregister(fd, previous, interest)
                    .map(|()| drop(state.registrations.insert(fd, interest)))
            }
            (Some(previous), None) => {
                debug!(fd, "removing socket");
                state.registrations.remove(&fd);
                match self.monitor.deregister(fd, previous) {
                    // libcurl may already have closed the descriptor.
                    Err(e) if matches!(e.raw_os_error(), Some(libc::EBADF | libc::ENOENT)) => {
                        Ok(())
                    }
                    other => other,
                }
            }
            (None, None) => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("removal requested for unregistered socket {fd}"),
            )),
        };

        if let Err(e) = result {
            state.failure.get_or_insert(e);
        }
    }

    /// Apply one timer callback.
    ///
    /// `Some(0)` is armed as [`IMMEDIATE`]; `None` disarms.
    pub fn on_timer(&self, timeout: Option<Duration>) {
        let mut state = self.lock();
        let next = match timeout {
            Some(after) if after.is_zero() => TimerState::Armed(IMMEDIATE),
            Some(after) => TimerState::Armed(after),
            None => TimerState::Disarmed,
        };
        trace!(?next, "timer callback");

        let result = match next {
            TimerState::Armed(after) => self.monitor.arm_timer(after),
            TimerState::Disarmed => self.monitor.disarm_timer(),
        };
        match result {
            Ok(()) => state.timer = next,
            Err(e) => {
                state.failure.get_or_insert(e);
            }
        }
    }

    /// Note that the armed timer fired.
    pub fn timer_fired(&self) {
        self.monitor.acknowledge_timer();
        self.lock().timer = TimerState::Disarmed;
    }

    /// Interest currently registered for `fd`.
    #[must_use]
    pub fn registration(&self, fd: RawFd) -> Option<Interest> {
        self.lock().registrations.get(&fd).copied()
    }

    /// Number of registered sockets.
    #[must_use]
    pub fn registration_count(&self) -> usize {
        self.lock().registrations.len()
    }

    /// Current timer request.
    #[must_use]
    pub fn timer(&self) -> TimerState {
        self.lock().timer
    }

    /// Raise an error parked by a callback, if any.
    ///
    /// # Errors
    ///
    /// Returns the first event-source error seen since the last call.
    pub fn take_failure(&self) -> io::Result<()> {
        self.lock().failure.take().map_or(Ok(()), Err)
    }
}

/// The libcurl multi handle plus everything needed to drive it.
pub struct Multiplexer {
    // Dropped before `multi`.
    transfers: BatchArena<TrackedTransfer>,
    multi: Multi,
    reactor: Arc<Reactor>,
    running: u32,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("reactor", &self.reactor)
            .field("in_flight", &self.transfers.live())
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

impl Multiplexer {
    /// Create the event source and the multi handle and wire the callbacks.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::EventSource`] or [`EngineError::Multi`] if either
    /// cannot be created.
    pub fn new() -> Result<Self, EngineError> {
        let reactor = Arc::new(Reactor::new(Monitor::new()?));
        let mut multi = Multi::new();

        let sockets = Arc::clone(&reactor);
        multi.socket_function(move |fd, events, _token| {
            sockets.on_socket(fd, SocketInterest::from(events));
        })?;

        let timer = Arc::clone(&reactor);
        multi.timer_function(move |timeout| {
            timer.on_timer(timeout);
            true
        })?;

        Ok(Self {
            transfers: BatchArena::new(),
            multi,
            reactor,
            running: 0,
        })
    }

    /// The callback-side state.
    #[must_use]
    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    /// Transfers added and not yet drained.
    #[must_use]
    pub const fn in_flight(&self) -> usize {
        self.transfers.live()
    }

    /// Running-handle count reported by the last libcurl call.
    #[must_use]
    pub const fn running(&self) -> u32 {
        self.running
    }

    /// Start tracking `easy` as the transfer for `request`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Multi`] if libcurl refuses the handle, or the
    /// parked error of a callback it triggered.
    pub fn add(
        &mut self,
        request: &PendingRequest,
        easy: Easy2<ResponseSink>,
    ) -> Result<usize, EngineError> {
        let token = self.transfers.next_token();
        let mut handle = self.multi.add2(easy)?;
        if let Err(e) = handle.set_token(token) {
            drop(self.multi.remove2(handle));
            return Err(e.into());
        }
        self.transfers.insert(TrackedTransfer::new(request, handle));
        self.reactor.take_failure()?;

        debug!(request_id = request.id, token, url = %request.url, "transfer added");
        DispatchMetrics::set_in_flight(self.in_flight());
        Ok(token)
    }

    /// Remove every tracked transfer without producing outcomes.
    ///
    /// Used when a batch is abandoned before its claim commits, so the rows
    /// are still queued.
    pub fn abort_all(&mut self) {
        for transfer in self.transfers.drain() {
            let id = transfer.id;
            if let Err(e) = self.multi.remove2(transfer.into_handle()) {
                warn!(request_id = id, error = %e, "failed to remove aborted transfer");
            }
        }
        self.running = 0;
        DispatchMetrics::set_in_flight(0);
        if let Err(e) = self.reactor.take_failure() {
            warn!(error = %e, "event source error while aborting batch");
        }
    }

    /// Drive every tracked transfer to completion, writing outcomes to
    /// `store` as they finish.
    ///
    /// Returns the number of outcomes written.
    ///
    /// # Errors
    ///
    /// Returns the first structural error: event source, multi handle, or
    /// store. Transfers still tracked at that point stay tracked.
    pub fn drive<S: DispatchStore>(&mut self, store: &mut S) -> Result<usize, EngineError> {
        let mut events = Events::with_capacity(self.in_flight() + 1);
        let mut completed = 0;

        while self.in_flight() > 0 {
            let timeout = match self.reactor.timer() {
                TimerState::Armed(after) => after.min(WAIT_CEILING),
                TimerState::Disarmed => WAIT_CEILING,
            };
            self.reactor.monitor().wait(&mut events, Some(timeout))?;

            if events.is_empty() {
                self.running = self.multi.timeout()?;
                self.reactor.take_failure()?;
                completed += drain_completed(self, store)?;
                continue;
            }

            for event in events.iter() {
                if event.is_timer() {
                    self.reactor.timer_fired();
                    self.running = self.multi.timeout()?;
                } else {
                    let readiness = event.readiness();
                    let mut mask = CurlEvents::new();
                    mask.input(readiness.input)
                        .output(readiness.output)
                        .error(readiness.error);
                    self.running = self.multi.action(event.socket(), &mask)?;
                }
                self.reactor.take_failure()?;
                completed += drain_completed(self, store)?;
            }
        }

        Ok(completed)
    }

    /// Finished-transfer notifications not yet drained, as
    /// `(token, result)` pairs.
    pub(crate) fn finished(&self) -> Vec<(usize, Result<(), curl::Error>)> {
        let mut done = Vec::new();
        self.multi.messages(|message| match message.token() {
            Ok(token) => {
                if let Some(result) = message.result() {
                    done.push((token, result));
                }
            }
            Err(e) => warn!(error = %e, "completion message without token"),
        });
        done
    }

    /// The transfer behind `token`, still registered with the multi handle.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownTransfer`] if nothing is tracked under
    /// `token`.
    pub(crate) fn transfer_mut(
        &mut self,
        token: usize,
    ) -> Result<&mut TrackedTransfer, EngineError> {
        self.transfers
            .get_mut(token)
            .ok_or(EngineError::UnknownTransfer(token))
    }

    /// Stop tracking the transfer behind `token` and release it.
    ///
    /// The handle leaves the multi handle here and is cleaned up when it
    /// drops at the end of the call.
    pub(crate) fn detach(&mut self, token: usize) -> Result<(), EngineError> {
        let transfer = self.transfers.take(token)?;
        drop(self.multi.remove2(transfer.into_handle())?);
        self.reactor.take_failure()?;
        DispatchMetrics::set_in_flight(self.in_flight());
        Ok(())
    }

    /// Release the batch arena once every transfer has been drained.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ArenaInUse`] if transfers are still tracked.
    pub fn reset_batch(&mut self) -> Result<(), EngineError> {
        self.transfers.reset()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn reactor() -> Reactor {
        Reactor::new(Monitor::new().unwrap())
    }

    #[test]
    fn register_modify_remove_leaves_no_entry() {
        let reactor = reactor();
        let (_a, b) = UnixStream::pair().unwrap();
        let fd = b.as_raw_fd();

        reactor.on_socket(fd, SocketInterest::Read);
        assert_eq!(reactor.registration(fd), Some(Interest::Read));

        reactor.on_socket(fd, SocketInterest::ReadWrite);
        assert_eq!(reactor.registration(fd), Some(Interest::ReadWrite));

        reactor.on_socket(fd, SocketInterest::Remove);
        assert_eq!(reactor.registration(fd), None);
        assert_eq!(reactor.registration_count(), 0);
        reactor.take_failure().unwrap();
    }

    #[test]
    fn socket_can_be_registered_again_after_removal() {
        let reactor = reactor();
        let (_a, b) = UnixStream::pair().unwrap();
        let fd = b.as_raw_fd();

        for _ in 0..3 {
            reactor.on_socket(fd, SocketInterest::Write);
            reactor.on_socket(fd, SocketInterest::Remove);
        }
        assert_eq!(reactor.registration_count(), 0);
        reactor.take_failure().unwrap();
    }

    #[test]
    fn second_removal_is_reported() {
        let reactor = reactor();
        let (_a, b) = UnixStream::pair().unwrap();
        let fd = b.as_raw_fd();

        reactor.on_socket(fd, SocketInterest::Read);
        reactor.on_socket(fd, SocketInterest::Remove);
        reactor.on_socket(fd, SocketInterest::Remove);

        let err = reactor.take_failure().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        // Reported once.
        reactor.take_failure().unwrap();
    }

    #[test]
    fn zero_timeout_arms_immediate_tick() {
        let reactor = reactor();
        reactor.on_timer(Some(Duration::ZERO));
        assert_eq!(reactor.timer(), TimerState::Armed(IMMEDIATE));

        let mut events = Events::with_capacity(2);
        reactor
            .monitor()
            .wait(&mut events, Some(Duration::from_secs(1)))
            .unwrap();
        assert!(events.iter().any(|e| e.is_timer()));
        reactor.timer_fired();
        assert_eq!(reactor.timer(), TimerState::Disarmed);
    }

    #[test]
    fn timer_callback_arms_and_disarms() {
        let reactor = reactor();
        reactor.on_timer(Some(Duration::from_millis(250)));
        assert_eq!(
            reactor.timer(),
            TimerState::Armed(Duration::from_millis(250))
        );

        reactor.on_timer(None);
        assert_eq!(reactor.timer(), TimerState::Disarmed);

        let mut events = Events::with_capacity(2);
        let n = reactor
            .monitor()
            .wait(&mut events, Some(Duration::from_millis(20)))
            .unwrap();
        assert_eq!(n, 0);
        reactor.take_failure().unwrap();
    }

    #[test]
    fn empty_multiplexer_has_nothing_to_drive() {
        let mut mux = Multiplexer::new().unwrap();
        assert_eq!(mux.in_flight(), 0);
        assert!(mux.finished().is_empty());
        mux.reset_batch().unwrap();
    }
}
