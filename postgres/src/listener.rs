//! Wake-up notifications over `LISTEN` / `NOTIFY`.

use crate::error::PgStoreError;
use courier_core::StoreError;
use sqlx::postgres::PgListener;

/// Channel notified by [`PgDispatchStore::enqueue`](crate::PgDispatchStore::enqueue).
pub const WAKE_CHANNEL: &str = "courier_wake";

/// Listens on [`WAKE_CHANNEL`] so an idle worker can start its next cycle
/// as soon as work is queued.
///
/// Unlike the store this is async; it runs on the supervisor's runtime.
pub struct WakeListener {
    listener: PgListener,
}

impl std::fmt::Debug for WakeListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeListener")
            .field("channel", &WAKE_CHANNEL)
            .finish_non_exhaustive()
    }
}

impl WakeListener {
    /// Connect and subscribe.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the connection or `LISTEN` fails.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let mut listener = PgListener::connect(database_url)
            .await
            .map_err(PgStoreError::Listener)?;
        listener
            .listen(WAKE_CHANNEL)
            .await
            .map_err(PgStoreError::Listener)?;
        Ok(Self { listener })
    }

    /// Wait for the next notification.
    ///
    /// The listener reconnects by itself after a dropped connection; a wake
    /// may be missed in that window, which the worker's idle timeout covers.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if receiving fails.
    pub async fn recv(&mut self) -> Result<(), StoreError> {
        self.listener
            .recv()
            .await
            .map(|_| ())
            .map_err(|e| PgStoreError::Listener(e).into())
    }

    /// Call `on_wake` for every notification until receiving fails.
    ///
    /// # Errors
    ///
    /// Returns the first receive error.
    pub async fn forward<F: FnMut()>(mut self, mut on_wake: F) -> Result<(), StoreError> {
        loop {
            self.recv().await?;
            tracing::trace!("Wake notification");
            on_wake();
        }
    }
}
