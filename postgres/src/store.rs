//! The `PostgreSQL` dispatch store.
//!
//! The engine is synchronous, so the store owns a private current-thread
//! tokio runtime and blocks on it for every statement. It must therefore be
//! created and used outside of any other tokio runtime; the worker thread is
//! such a place.

use crate::error::PgStoreError;
use crate::listener::WAKE_CHANNEL;
use crate::records::{ClaimedRow, CollectedResponse, NewRequest, StoredResponse};
use chrono::{DateTime, Utc};
use courier_core::{CompletionOutcome, DispatchStore, QueueRow, ResponseHeaders, StoreError};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;

const COLLECT_POLL_INTERVAL: Duration = Duration::from_millis(50);

const CLAIM_REQUESTS: &str = r"
    WITH rows AS (
        SELECT id FROM net.http_request_queue ORDER BY id LIMIT $1
    )
    DELETE FROM net.http_request_queue q
    USING rows
    WHERE q.id = rows.id
    RETURNING
        q.id,
        q.method,
        q.url,
        q.timeout_milliseconds,
        array(SELECT key || ': ' || value FROM jsonb_each_text(q.headers)) AS headers,
        q.body
";

const EXPIRE_RESPONSES: &str = r"
    WITH rows AS (
        SELECT ctid FROM net._http_response
        WHERE created < now() - make_interval(secs => $1)
        ORDER BY created
        LIMIT $2
    )
    DELETE FROM net._http_response r
    USING rows
    WHERE r.ctid = rows.ctid
";

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Dispatch store on the `net` schema.
///
/// # Example
///
/// ```ignore
/// use courier_postgres::PgDispatchStore;
///
/// let mut store = PgDispatchStore::connect("postgres://localhost/mydb")?;
/// store.migrate()?;
/// ```
pub struct PgDispatchStore {
    runtime: Runtime,
    pool: PgPool,
}

impl std::fmt::Debug for PgDispatchStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgDispatchStore")
            .field("pool_size", &self.pool.size())
            .finish_non_exhaustive()
    }
}

impl PgDispatchStore {
    /// Connect to `database_url`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Runtime`] if the private runtime cannot be built
    /// and [`StoreError::Database`] if the connection fails.
    ///
    /// # Panics
    ///
    /// Panics if called from within a tokio runtime.
    pub fn connect(database_url: &str) -> Result<Self, StoreError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(PgStoreError::Runtime)?;

        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(2)
                    .acquire_timeout(Duration::from_secs(10))
                    .connect(database_url),
            )
            .map_err(PgStoreError::Connect)?;

        tracing::debug!("Connected dispatch store");
        Ok(Self { runtime, pool })
    }

    /// Create the `net` schema, the queue and the response table if missing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a migration fails.
    pub fn migrate(&self) -> Result<(), StoreError> {
        self.runtime
            .block_on(sqlx::migrate!("./migrations").run(&self.pool))
            .map_err(PgStoreError::from)?;
        Ok(())
    }

    /// Get the underlying connection pool.
    ///
    /// The pool is bound to the store's runtime; drive queries on it with
    /// [`block_on`](Self::block_on).
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run `future` to completion on the store's runtime.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Queue a request and notify listening workers.
    ///
    /// The insert and the notification commit together.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails.
    pub fn enqueue(&self, request: &NewRequest) -> Result<i64, StoreError> {
        let id = self.runtime.block_on(async {
            let mut tx = self.pool.begin().await?;

            let (id,): (i64,) = sqlx::query_as(
                "INSERT INTO net.http_request_queue (method, url, headers, body, timeout_milliseconds)
                 VALUES ($1, $2, $3, $4, $5)
                 RETURNING id",
            )
            .bind(&request.method)
            .bind(&request.url)
            .bind(Json(&request.headers))
            .bind(request.body.as_deref())
            .bind(request.timeout_milliseconds)
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query("SELECT pg_notify($1, '')")
                .bind(WAKE_CHANNEL)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok::<_, PgStoreError>(id)
        })?;
        Ok(id)
    }

    /// Look up the stored outcome of request `id` without waiting for it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails and
    /// [`StoreError::Serialization`] if the stored headers are not a JSON
    /// object.
    pub fn fetch_response(&self, id: i64) -> Result<Option<StoredResponse>, StoreError> {
        type Row = (
            i64,
            Option<i32>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<bool>,
            Option<String>,
            DateTime<Utc>,
        );

        let row: Option<Row> = self
            .runtime
            .block_on(
                sqlx::query_as(
                    "SELECT id, status_code, content_type, headers::text, content, timed_out, error_msg, created
                     FROM net._http_response
                     WHERE id = $1
                     ORDER BY created DESC
                     LIMIT 1",
                )
                .bind(id)
                .fetch_optional(&self.pool),
            )
            .map_err(PgStoreError::Query)?;

        let Some((id, status_code, content_type, headers, content, timed_out, error_msg, created)) =
            row
        else {
            return Ok(None);
        };

        let headers = headers
            .as_deref()
            .map(ResponseHeaders::from_json)
            .transpose()
            .map_err(PgStoreError::Headers)?;

        Ok(Some(StoredResponse {
            id,
            status_code,
            content_type,
            headers,
            content,
            timed_out,
            error_msg,
            created,
        }))
    }

    /// Look up the outcome of request `id`, polling for up to `wait` until
    /// the worker has stored it.
    ///
    /// With `wait` of `None` this is a single lookup. A request with no
    /// stored outcome by the deadline is reported as
    /// [`RequestStatus::Pending`](crate::RequestStatus::Pending).
    ///
    /// # Errors
    ///
    /// Returns the error of the underlying [`fetch_response`](Self::fetch_response).
    pub fn collect_response(
        &self,
        id: i64,
        wait: Option<Duration>,
    ) -> Result<CollectedResponse, StoreError> {
        let deadline = wait.map(|wait| Instant::now() + wait);
        loop {
            if let Some(stored) = self.fetch_response(id)? {
                return Ok(CollectedResponse::from(stored));
            }
            let remaining = deadline
                .map(|deadline| deadline.saturating_duration_since(Instant::now()))
                .unwrap_or_default();
            if remaining.is_zero() {
                return Ok(CollectedResponse::pending());
            }
            self.runtime
                .block_on(tokio::time::sleep(remaining.min(COLLECT_POLL_INTERVAL)));
        }
    }
}

impl DispatchStore for PgDispatchStore {
    fn consume_requests<T, E, F>(&mut self, limit: usize, accept: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce(Vec<QueueRow>) -> Result<T, E>,
    {
        let (tx, claimed) = self
            .runtime
            .block_on(async {
                let mut tx = self.pool.begin().await?;
                let claimed: Vec<ClaimedRow> = sqlx::query_as(CLAIM_REQUESTS)
                    .bind(to_i64(limit))
                    .fetch_all(&mut *tx)
                    .await?;
                Ok::<_, PgStoreError>((tx, claimed))
            })
            .map_err(StoreError::from)?;

        let rows: Vec<QueueRow> = claimed.into_iter().map(QueueRow::from).collect();
        let count = rows.len();

        match accept(rows) {
            Ok(value) => {
                self.runtime
                    .block_on(tx.commit())
                    .map_err(|e| StoreError::from(PgStoreError::Query(e)))?;
                if count > 0 {
                    tracing::debug!(count, "Claimed requests");
                }
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.runtime.block_on(tx.rollback()) {
                    tracing::warn!(error = %rollback, "Failed to roll back claim");
                }
                Err(e)
            }
        }
    }

    fn insert_outcome(&mut self, outcome: &CompletionOutcome) -> Result<(), StoreError> {
        let query = match outcome {
            CompletionOutcome::Success(success) => {
                let headers = success
                    .headers
                    .to_json()
                    .map_err(PgStoreError::Headers)?;
                sqlx::query(
                    "INSERT INTO net._http_response (id, status_code, content, headers, content_type, timed_out)
                     VALUES ($1, $2, $3, $4::json, $5, false)",
                )
                .bind(success.id)
                .bind(i32::try_from(success.status_code).unwrap_or(i32::MAX))
                .bind(success.body.clone())
                .bind(headers)
                .bind(success.content_type.clone())
            }
            CompletionOutcome::Failure(failure) => sqlx::query(
                "INSERT INTO net._http_response (id, timed_out, error_msg)
                 VALUES ($1, $2, $3)",
            )
            .bind(failure.id)
            .bind(failure.timed_out)
            .bind(failure.error_message.clone()),
        };

        self.runtime
            .block_on(query.execute(&self.pool))
            .map_err(PgStoreError::Query)?;
        Ok(())
    }

    fn expire_responses(&mut self, ttl: Duration, limit: usize) -> Result<u64, StoreError> {
        let result = self
            .runtime
            .block_on(
                sqlx::query(EXPIRE_RESPONSES)
                    .bind(ttl.as_secs_f64())
                    .bind(to_i64(limit))
                    .execute(&self.pool),
            )
            .map_err(PgStoreError::Query)?;
        Ok(result.rows_affected())
    }
}
