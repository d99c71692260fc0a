//! Worker supervision with exponential back-off.
//!
//! The worker runs on a dedicated OS thread. A structural error ends the
//! worker; the supervisor logs it, waits according to its [`RestartPolicy`]
//! and builds a fresh worker (new store connection, new multiplexer). A
//! restart request rebuilds it immediately, and a shutdown request ends
//! supervision.
//!
//! # Example
//!
//! ```rust
//! use courier_daemon::supervisor::RestartPolicy;
//! use std::time::Duration;
//!
//! let policy = RestartPolicy::builder()
//!     .initial_delay(Duration::from_millis(250))
//!     .max_delay(Duration::from_secs(30))
//!     .multiplier(2.0)
//!     .build();
//!
//! assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
//! ```

use crate::error::DaemonError;
use courier_core::{ConfigError, DispatchStore, StoreError, WorkerConfig};
use courier_runtime::{EngineError, Worker, WorkerExit, WorkerHandle};
use std::env;
use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Back-off between worker restarts after a failure.
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    /// Delay after the first failure
    pub initial_delay: Duration,

    /// Upper bound for any delay
    pub max_delay: Duration,

    /// Growth factor per consecutive failure
    pub multiplier: f64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl RestartPolicy {
    /// Create a new restart policy builder.
    #[must_use]
    pub fn builder() -> RestartPolicyBuilder {
        RestartPolicyBuilder::default()
    }

    /// Load the policy from the process environment.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `COURIER_RESTART_DELAY_MS` | `500` |
    /// | `COURIER_RESTART_MAX_DELAY_MS` | `60000` |
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a variable is not a number of
    /// milliseconds.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load the policy through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a variable cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let millis = |name: &'static str, default: Duration| match lookup(name) {
            None => Ok(default),
            Some(value) => value
                .trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| ConfigError::Invalid {
                    name,
                    value,
                    reason: e.to_string(),
                }),
        };

        let defaults = Self::default();
        Ok(Self {
            initial_delay: millis("COURIER_RESTART_DELAY_MS", defaults.initial_delay)?,
            max_delay: millis("COURIER_RESTART_MAX_DELAY_MS", defaults.max_delay)?,
            multiplier: defaults.multiplier,
        })
    }

    /// Delay before restart number `attempt` (0-based) in a run of
    /// consecutive failures.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Builder for [`RestartPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RestartPolicyBuilder {
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
    multiplier: Option<f64>,
}

impl RestartPolicyBuilder {
    /// Set the delay after the first failure.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Set the upper bound for any delay.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Set the growth factor.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Build the policy, filling unset fields with defaults.
    #[must_use]
    pub fn build(self) -> RestartPolicy {
        let defaults = RestartPolicy::default();
        RestartPolicy {
            initial_delay: self.initial_delay.unwrap_or(defaults.initial_delay),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
            multiplier: self.multiplier.unwrap_or(defaults.multiplier),
        }
    }
}

/// How one supervised run ended.
#[derive(Debug)]
enum RunEnd {
    Exit(WorkerExit),
    Failed(DaemonError),
}

/// The supervision thread.
#[derive(Debug)]
pub struct Supervisor {
    thread: JoinHandle<()>,
}

impl Supervisor {
    /// Start supervising on a new thread named `courier-worker`.
    ///
    /// `connect` builds the store for each worker run from the configuration
    /// in effect. Store and worker are created on the supervision thread and
    /// never leave it.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the thread cannot be spawned.
    pub fn spawn<S, F>(
        handle: WorkerHandle,
        config: WorkerConfig,
        policy: RestartPolicy,
        connect: F,
    ) -> io::Result<Self>
    where
        S: DispatchStore,
        F: FnMut(&WorkerConfig) -> Result<S, StoreError> + Send + 'static,
    {
        let thread = thread::Builder::new()
            .name("courier-worker".to_string())
            .spawn(move || supervise(&handle, config, &policy, connect))?;
        Ok(Self { thread })
    }

    /// Whether the supervision thread has returned.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the supervision thread to return.
    pub fn join(self) {
        if self.thread.join().is_err() {
            tracing::error!("Supervision thread panicked");
        }
    }
}

/// Run workers until a shutdown is requested.
pub fn supervise<S, F>(
    handle: &WorkerHandle,
    mut config: WorkerConfig,
    policy: &RestartPolicy,
    mut connect: F,
) where
    S: DispatchStore,
    F: FnMut(&WorkerConfig) -> Result<S, StoreError>,
{
    let mut failures = 0;
    loop {
        if let Some(reloaded) = handle.take_reload() {
            config = reloaded;
        }

        match run_once(handle, &mut config, &mut connect) {
            RunEnd::Exit(WorkerExit::Shutdown) => break,
            RunEnd::Exit(WorkerExit::Restart) => {
                failures = 0;
                tracing::info!("Restarting worker");
            }
            RunEnd::Failed(error) => {
                let delay = policy.delay_for_attempt(failures);
                failures += 1;
                tracing::error!(
                    attempt = failures,
                    delay_ms = delay.as_millis(),
                    error = %error,
                    "Worker failed, restarting after back-off"
                );
                if handle.back_off(delay) {
                    break;
                }
            }
        }
    }
    tracing::info!("Supervision stopped");
}

fn run_once<S, F>(handle: &WorkerHandle, config: &mut WorkerConfig, connect: &mut F) -> RunEnd
where
    S: DispatchStore,
    F: FnMut(&WorkerConfig) -> Result<S, StoreError>,
{
    if handle.is_shutting_down() {
        return RunEnd::Exit(WorkerExit::Shutdown);
    }

    let store = match connect(config) {
        Ok(store) => store,
        Err(e) => return RunEnd::Failed(e.into()),
    };

    let mut worker = match Worker::new(store, config.clone(), handle.clone()) {
        Ok(worker) => worker,
        Err(e) => return RunEnd::Failed(e.into()),
    };

    let result: Result<WorkerExit, EngineError> = worker.run();
    config.clone_from(worker.config());
    match result {
        Ok(exit) => RunEnd::Exit(exit),
        Err(e) => RunEnd::Failed(e.into()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use courier_runtime::WorkerStatus;
    use courier_testing::InMemoryDispatchStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn quick_config() -> WorkerConfig {
        WorkerConfig {
            idle_wait: Duration::from_millis(10),
            ..WorkerConfig::default()
        }
    }

    #[test]
    fn delay_grows_and_is_capped() {
        let policy = RestartPolicy::builder()
            .initial_delay(Duration::from_millis(100))
            .multiplier(2.0)
            .max_delay(Duration::from_millis(500))
            .build();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(10_000), Duration::from_millis(500));
    }

    #[test]
    fn policy_reads_environment_lookup() {
        let policy = RestartPolicy::from_lookup(|name| match name {
            "COURIER_RESTART_DELAY_MS" => Some("40".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(policy.initial_delay, Duration::from_millis(40));
        assert_eq!(policy.max_delay, RestartPolicy::default().max_delay);

        let err = RestartPolicy::from_lookup(|name| {
            (name == "COURIER_RESTART_MAX_DELAY_MS").then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                name: "COURIER_RESTART_MAX_DELAY_MS",
                ..
            }
        ));
    }

    #[test]
    fn shutdown_before_start_never_connects() {
        let handle = WorkerHandle::new();
        handle.shutdown();
        let connects = AtomicUsize::new(0);

        supervise(&handle, quick_config(), &RestartPolicy::default(), |_| {
            connects.fetch_add(1, Ordering::SeqCst);
            Ok(InMemoryDispatchStore::new())
        });

        assert_eq!(connects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn connection_failures_back_off_until_shutdown() {
        let handle = WorkerHandle::new();
        let connects = Arc::new(AtomicUsize::new(0));
        let policy = RestartPolicy::builder()
            .initial_delay(Duration::from_millis(5))
            .max_delay(Duration::from_millis(20))
            .build();

        let counter = Arc::clone(&connects);
        let supervisor = Supervisor::spawn(handle.clone(), quick_config(), policy, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<InMemoryDispatchStore, _>(StoreError::Database("refused".to_string()))
        })
        .unwrap();

        let started = Instant::now();
        while connects.load(Ordering::SeqCst) < 3 {
            assert!(started.elapsed() < Duration::from_secs(5), "no retries");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(handle.status(), WorkerStatus::NotYet);

        handle.shutdown();
        supervisor.join();
    }

    #[test]
    fn failed_connect_ends_run_with_store_error() {
        let handle = WorkerHandle::new();
        let mut config = quick_config();
        let end = run_once(&handle, &mut config, &mut |_: &WorkerConfig| {
            Err::<InMemoryDispatchStore, _>(StoreError::Database("refused".to_string()))
        });
        assert!(matches!(
            end,
            RunEnd::Failed(DaemonError::Store(StoreError::Database(ref m))) if m == "refused"
        ));
        assert_eq!(handle.status(), WorkerStatus::NotYet);
    }

    #[test]
    fn restart_rebuilds_worker_with_reloaded_config() {
        let handle = WorkerHandle::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        let log = Arc::clone(&seen);
        let supervisor = Supervisor::spawn(
            handle.clone(),
            quick_config(),
            RestartPolicy::default(),
            move |config: &WorkerConfig| {
                log.lock().unwrap().push(config.database_url.clone());
                Ok(InMemoryDispatchStore::new())
            },
        )
        .unwrap();

        assert!(handle.wait_until_running(Duration::from_secs(5)));
        handle.reload(WorkerConfig {
            database_url: "postgres://replica/db".to_string(),
            ..quick_config()
        });
        handle.restart();

        let started = Instant::now();
        while seen.lock().unwrap().len() < 2 {
            assert!(started.elapsed() < Duration::from_secs(5), "not rebuilt");
            thread::sleep(Duration::from_millis(5));
        }

        handle.shutdown();
        supervisor.join();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], WorkerConfig::default().database_url);
        assert_eq!(seen[1], "postgres://replica/db");
    }
}
