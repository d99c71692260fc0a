//! Signal handling for the worker.

use courier_core::WorkerConfig;
use courier_runtime::WorkerHandle;
use std::io;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

/// What a received signal asks of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Re-read configuration
    Reload,
    /// Rebuild the worker
    Restart,
    /// Stop for good
    Shutdown,
}

/// Apply `action` to the worker behind `handle`.
///
/// Returns `true` once the worker has been told to shut down.
pub fn apply(handle: &WorkerHandle, action: SignalAction) -> bool {
    match action {
        SignalAction::Reload => {
            if let Err(e) = dotenvy::dotenv_override() {
                if !e.not_found() {
                    warn!(error = %e, "Failed to read .env");
                }
            }
            match WorkerConfig::from_env() {
                Ok(config) => {
                    info!("Reloading configuration");
                    handle.reload(config);
                }
                Err(e) => warn!(error = %e, "Keeping current configuration"),
            }
            false
        }
        SignalAction::Restart => {
            info!("Restart requested");
            handle.restart();
            false
        }
        SignalAction::Shutdown => {
            info!("Shutdown requested");
            handle.shutdown();
            true
        }
    }
}

/// Forward `SIGHUP`, `SIGUSR1`, `SIGTERM` and Ctrl-C to the worker until a
/// shutdown has been requested.
///
/// # Errors
///
/// Returns an I/O error if a signal handler cannot be installed.
pub async fn forward(handle: WorkerHandle) -> io::Result<()> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut user1 = signal(SignalKind::user_defined1())?;
    let mut terminate = signal(SignalKind::terminate())?;

    loop {
        let action = tokio::select! {
            _ = hangup.recv() => SignalAction::Reload,
            _ = user1.recv() => SignalAction::Restart,
            _ = terminate.recv() => SignalAction::Shutdown,
            result = tokio::signal::ctrl_c() => {
                result?;
                SignalAction::Shutdown
            }
        };
        if apply(&handle, action) {
            return Ok(());
        }
    }
}
