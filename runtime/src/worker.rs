//! Outer loop and its control handle.
//!
//! A [`Worker`] owns the store and the multiplexer and runs on one thread.
//! Everything other threads may do to it goes through a cloneable
//! [`WorkerHandle`]:
//!
//! ```text
//! NotYet ──run()──▶ Running ──shutdown()/restart()/error──▶ Exited
//! ```
//!
//! One cycle ([`Worker::run_cycle`]):
//!
//! 1. expire stored responses older than the TTL (bounded by batch size)
//! 2. claim up to `batch_size` queued requests and register their transfers
//! 3. drive the batch until every transfer has an outcome in the store
//! 4. reset the batch arena
//!
//! Between cycles the loop applies a pending configuration, honours a
//! restart or shutdown request, and sleeps up to `idle_wait` only if the
//! previous cycle found nothing to do.

use crate::error::EngineError;
use crate::intake::consume_batch;
use crate::metrics::DispatchMetrics;
use crate::multiplexer::Multiplexer;
use crate::transfer::TransferOptions;
use courier_core::{DispatchStore, WorkerConfig};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Lifecycle state published by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// The loop has not started yet
    NotYet,
    /// The loop is running
    Running,
    /// The loop has returned
    Exited,
}

/// Why [`Worker::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Stop for good
    Shutdown,
    /// Rebuild the worker (new connection, new multiplexer) and start again
    Restart,
}

/// What one cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Stored responses deleted by the expiry sweep
    pub expired: u64,
    /// Queued requests claimed
    pub consumed: usize,
    /// Outcomes written
    pub completed: usize,
}

impl CycleReport {
    /// Nothing consumed and nothing expired.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.consumed == 0 && self.expired == 0
    }
}

#[derive(Debug)]
struct Control {
    status: WorkerStatus,
    woken: bool,
    config: Option<WorkerConfig>,
    exit: Option<WorkerExit>,
}

#[derive(Debug)]
struct Shared {
    control: Mutex<Control>,
    changed: Condvar,
}

/// Cross-thread control of a [`Worker`].
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    shared: Arc<Shared>,
}

impl Default for WorkerHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerHandle {
    /// Create a handle in the [`WorkerStatus::NotYet`] state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                control: Mutex::new(Control {
                    status: WorkerStatus::NotYet,
                    woken: false,
                    config: None,
                    exit: None,
                }),
                changed: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Control> {
        self.shared
            .control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, f: impl FnOnce(&mut Control)) {
        f(&mut self.lock());
        self.shared.changed.notify_all();
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn status(&self) -> WorkerStatus {
        self.lock().status
    }

    /// Block until the worker is running or `timeout` elapses.
    ///
    /// Returns whether the worker is running.
    #[must_use]
    pub fn wait_until_running(&self, timeout: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .shared
            .changed
            .wait_timeout_while(guard, timeout, |c| c.status == WorkerStatus::NotYet)
            .unwrap_or_else(PoisonError::into_inner);
        guard.status == WorkerStatus::Running
    }

    /// Cut the current idle sleep short.
    pub fn wake(&self) {
        self.update(|c| c.woken = true);
    }

    /// Hand a new configuration to the worker; it applies at the next cycle
    /// boundary.
    pub fn reload(&self, config: WorkerConfig) {
        self.update(|c| {
            c.config = Some(config);
            c.woken = true;
        });
    }

    /// Ask the worker to exit with [`WorkerExit::Restart`].
    ///
    /// Ignored if a shutdown is already pending.
    pub fn restart(&self) {
        self.update(|c| {
            c.exit.get_or_insert(WorkerExit::Restart);
        });
    }

    /// Ask the worker to exit with [`WorkerExit::Shutdown`].
    pub fn shutdown(&self) {
        self.update(|c| c.exit = Some(WorkerExit::Shutdown));
    }

    /// Whether a shutdown has been requested.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.lock().exit == Some(WorkerExit::Shutdown)
    }

    fn begin(&self) {
        self.update(|c| c.status = WorkerStatus::Running);
    }

    fn finish(&self) {
        self.update(|c| c.status = WorkerStatus::Exited);
    }

    fn sleep(&self, idle_wait: Duration) {
        let guard = self.lock();
        let (mut guard, _) = self
            .shared
            .changed
            .wait_timeout_while(guard, idle_wait, |c| {
                !c.woken && c.config.is_none() && c.exit.is_none()
            })
            .unwrap_or_else(PoisonError::into_inner);
        guard.woken = false;
    }

    /// Take the configuration handed over by [`reload`](Self::reload) and
    /// not yet applied.
    pub fn take_reload(&self) -> Option<WorkerConfig> {
        self.lock().config.take()
    }

    /// Wait up to `delay` between two worker runs.
    ///
    /// Returns early on an exit request and consumes a pending restart.
    /// Returns `true` if a shutdown is pending.
    pub fn back_off(&self, delay: Duration) -> bool {
        let guard = self.lock();
        let (mut guard, _) = self
            .shared
            .changed
            .wait_timeout_while(guard, delay, |c| c.exit.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        match guard.exit {
            Some(WorkerExit::Shutdown) => true,
            Some(WorkerExit::Restart) => {
                guard.exit = None;
                false
            }
            None => false,
        }
    }

    /// The pending exit request. A restart is consumed by being taken; a
    /// shutdown stays pending.
    fn take_exit(&self) -> Option<WorkerExit> {
        let mut control = self.lock();
        let exit = control.exit;
        if exit == Some(WorkerExit::Restart) {
            control.exit = None;
        }
        exit
    }
}

/// Identifies this worker and the libcurl it links against.
#[must_use]
pub fn banner() -> String {
    format!(
        "courier {} worker using libcurl {}",
        courier_core::VERSION,
        curl::Version::get().version()
    )
}

/// The dispatch engine's outer loop.
pub struct Worker<S> {
    store: S,
    mux: Multiplexer,
    config: WorkerConfig,
    handle: WorkerHandle,
}

impl<S> std::fmt::Debug for Worker<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("mux", &self.mux)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: DispatchStore> Worker<S> {
    /// Create a worker over `store`, controlled through `handle`.
    ///
    /// # Errors
    ///
    /// Returns an error if the multiplexer cannot be created.
    pub fn new(store: S, config: WorkerConfig, handle: WorkerHandle) -> Result<Self, EngineError> {
        Ok(Self {
            store,
            mux: Multiplexer::new()?,
            config,
            handle,
        })
    }

    /// Control handle for this worker.
    #[must_use]
    pub const fn handle(&self) -> &WorkerHandle {
        &self.handle
    }

    /// Configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// The store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// The store, mutably.
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Consume the worker and return its store.
    pub fn into_store(self) -> S {
        self.store
    }

    /// The multiplexer.
    #[must_use]
    pub const fn multiplexer(&self) -> &Multiplexer {
        &self.mux
    }

    /// Run cycles until a shutdown or restart is requested.
    ///
    /// The handle reports [`WorkerStatus::Running`] while this runs and
    /// [`WorkerStatus::Exited`] once it returns, error or not.
    ///
    /// # Errors
    ///
    /// Returns the structural error that aborted a cycle.
    pub fn run(&mut self) -> Result<WorkerExit, EngineError> {
        self.handle.begin();
        info!(
            worker = %banner(),
            batch_size = self.config.batch_size,
            ttl_secs = self.config.ttl.as_secs(),
            "worker started"
        );

        let result = self.run_loop();

        self.handle.finish();
        match &result {
            Ok(exit) => info!(?exit, "worker exited"),
            Err(e) => tracing::error!(error = %e, "worker aborted"),
        }
        result
    }

    fn run_loop(&mut self) -> Result<WorkerExit, EngineError> {
        let mut idle = false;
        loop {
            if idle {
                self.handle.sleep(self.config.idle_wait);
            }
            if let Some(config) = self.handle.take_reload() {
                self.apply_config(config);
            }
            if let Some(exit) = self.handle.take_exit() {
                return Ok(exit);
            }
            idle = self.run_cycle()?.is_idle();
        }
    }

    fn apply_config(&mut self, config: WorkerConfig) {
        if config.database_url != self.config.database_url {
            warn!("database_url changed; takes effect on the next restart");
        }
        info!(
            batch_size = config.batch_size,
            ttl_secs = config.ttl.as_secs(),
            "configuration reloaded"
        );
        self.config = config;
    }

    fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            verbose: self.config.verbose_transfers
                || tracing::enabled!(target: "courier_runtime::transfer", tracing::Level::DEBUG),
        }
    }

    /// Run exactly one cycle.
    ///
    /// # Errors
    ///
    /// Returns the structural error that aborted the cycle. Any transfer
    /// still tracked at that point is removed without an outcome.
    pub fn run_cycle(&mut self) -> Result<CycleReport, EngineError> {
        let started = Instant::now();
        let result = self.cycle();
        if result.is_err() {
            self.mux.abort_all();
            if let Err(e) = self.mux.reset_batch() {
                warn!(error = %e, "batch arena not released");
            }
        }
        DispatchMetrics::record_cycle(started.elapsed());
        result
    }

    fn cycle(&mut self) -> Result<CycleReport, EngineError> {
        let expired = self
            .store
            .expire_responses(self.config.ttl, self.config.batch_size)?;
        if expired > 0 {
            warn!(expired, "expired stored responses");
            DispatchMetrics::record_expired(expired);
        }

        let options = self.transfer_options();
        let consumed = consume_batch(
            &mut self.store,
            &mut self.mux,
            self.config.batch_size,
            options,
        )?;

        let completed = if consumed > 0 {
            self.mux.drive(&mut self.store)?
        } else {
            0
        };
        self.mux.reset_batch()?;

        let report = CycleReport {
            expired,
            consumed,
            completed,
        };
        debug!(?report, "cycle finished");
        Ok(report)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use courier_testing::InMemoryDispatchStore;
    use std::thread;

    fn worker() -> Worker<InMemoryDispatchStore> {
        Worker::new(
            InMemoryDispatchStore::new(),
            WorkerConfig {
                idle_wait: Duration::from_millis(20),
                ..WorkerConfig::default()
            },
            WorkerHandle::new(),
        )
        .unwrap()
    }

    #[test]
    fn idle_cycle_reports_nothing() {
        let mut worker = worker();
        let report = worker.run_cycle().unwrap();
        assert!(report.is_idle());
        assert_eq!(report.completed, 0);
    }

    #[test]
    fn banner_names_libcurl_version() {
        let banner = banner();
        assert!(banner.starts_with(&format!("courier {} worker", courier_core::VERSION)));
        assert!(banner.ends_with(curl::Version::get().version()));
    }

    #[test]
    fn shutdown_before_run_exits_immediately() {
        let mut worker = worker();
        let handle = worker.handle().clone();
        handle.shutdown();

        assert_eq!(worker.run().unwrap(), WorkerExit::Shutdown);
        assert_eq!(handle.status(), WorkerStatus::Exited);
    }

    #[test]
    fn handle_drives_status_and_exit() {
        let handle = WorkerHandle::new();
        assert_eq!(handle.status(), WorkerStatus::NotYet);
        assert!(!handle.wait_until_running(Duration::from_millis(10)));

        let worker_handle = handle.clone();
        let join = thread::spawn(move || {
            let mut worker = Worker::new(
                InMemoryDispatchStore::new(),
                WorkerConfig {
                    idle_wait: Duration::from_millis(20),
                    ..WorkerConfig::default()
                },
                worker_handle,
            )
            .unwrap();
            worker.run().unwrap()
        });

        assert!(handle.wait_until_running(Duration::from_secs(5)));
        handle.restart();
        assert_eq!(join.join().unwrap(), WorkerExit::Restart);
        assert_eq!(handle.status(), WorkerStatus::Exited);
    }

    #[test]
    fn restart_requested_before_run_is_honored() {
        let mut worker = worker();
        let handle = worker.handle().clone();
        handle.restart();

        assert_eq!(worker.run().unwrap(), WorkerExit::Restart);
        assert_eq!(handle.take_exit(), None);

        // A second request during the rebuild reaches the next run.
        handle.restart();
        assert_eq!(worker.run().unwrap(), WorkerExit::Restart);
    }

    #[test]
    fn restart_does_not_override_shutdown() {
        let handle = WorkerHandle::new();
        handle.shutdown();
        handle.restart();
        assert!(handle.is_shutting_down());
        assert_eq!(handle.take_exit(), Some(WorkerExit::Shutdown));
        assert_eq!(handle.take_exit(), Some(WorkerExit::Shutdown));
    }

    #[test]
    fn reload_applies_at_cycle_boundary() {
        let mut worker = worker();
        let handle = worker.handle().clone();
        handle.reload(WorkerConfig {
            batch_size: 7,
            ..WorkerConfig::default()
        });
        handle.shutdown();

        worker.run().unwrap();
        assert_eq!(worker.config().batch_size, 7);
    }

    #[test]
    fn back_off_consumes_restart_and_reports_shutdown() {
        let handle = WorkerHandle::new();
        handle.restart();
        let started = Instant::now();
        assert!(!handle.back_off(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(handle.take_exit(), None);

        assert!(!handle.back_off(Duration::from_millis(10)));

        handle.shutdown();
        assert!(handle.back_off(Duration::from_secs(5)));
        assert!(handle.is_shutting_down());
    }

    #[test]
    fn pending_reload_can_be_taken_once() {
        let handle = WorkerHandle::new();
        assert!(handle.take_reload().is_none());
        handle.reload(WorkerConfig {
            batch_size: 3,
            ..WorkerConfig::default()
        });
        assert_eq!(handle.take_reload().map(|c| c.batch_size), Some(3));
        assert!(handle.take_reload().is_none());
    }

    #[test]
    fn wake_cuts_sleep_short() {
        let handle = WorkerHandle::new();
        handle.wake();
        let started = Instant::now();
        handle.sleep(Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!handle.lock().woken);
    }
}
