//! In-memory dispatch store.

use courier_core::{CompletionOutcome, DispatchStore, QueueRow, StoreError};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct StoredOutcome {
    outcome: CompletionOutcome,
    created: Instant,
}

/// Deterministic [`DispatchStore`] for engine tests.
///
/// Behaves like the Postgres store where it matters to the engine: claims
/// are oldest-first and transactional (a failed `accept` puts every claimed
/// row back at the head of the queue), and expiry removes the oldest
/// outcomes first.
///
/// # Example
///
/// ```
/// use courier_testing::InMemoryDispatchStore;
///
/// let mut store = InMemoryDispatchStore::new();
/// let id = store.enqueue("GET", "http://localhost/ok", &[], None, 1000);
/// assert_eq!(store.pending(), 1);
/// assert!(store.response(id).is_none());
/// ```
#[derive(Debug, Clone)]
pub struct InMemoryDispatchStore {
    queue: VecDeque<QueueRow>,
    next_id: i64,
    responses: Vec<StoredOutcome>,
    fail_inserts: bool,
}

impl Default for InMemoryDispatchStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDispatchStore {
    /// Create an empty store.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            next_id: 1,
            responses: Vec::new(),
            fail_inserts: false,
        }
    }

    /// Queue a request and return its id.
    pub fn enqueue(
        &mut self,
        method: &str,
        url: &str,
        headers: &[&str],
        body: Option<&str>,
        timeout_milliseconds: i32,
    ) -> i64 {
        let id = self.next_id;
        self.push_row(QueueRow {
            id: Some(id),
            method: Some(method.to_string()),
            url: Some(url.to_string()),
            timeout_milliseconds: Some(timeout_milliseconds),
            headers: Some(headers.iter().map(|h| (*h).to_string()).collect()),
            body: body.map(str::to_string),
        });
        id
    }

    /// Queue a raw row as-is, including null columns.
    pub fn push_row(&mut self, row: QueueRow) {
        if let Some(id) = row.id {
            self.next_id = self.next_id.max(id + 1);
        }
        self.queue.push_back(row);
    }

    /// Number of queued rows.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Every stored outcome, in insertion order.
    #[must_use]
    pub fn responses(&self) -> Vec<&CompletionOutcome> {
        self.responses.iter().map(|s| &s.outcome).collect()
    }

    /// Stored outcome for `id`, if any.
    #[must_use]
    pub fn response(&self, id: i64) -> Option<&CompletionOutcome> {
        self.responses
            .iter()
            .map(|s| &s.outcome)
            .find(|o| o.id() == id)
    }

    /// Store an outcome as if it had been written `age` ago.
    pub fn insert_aged(&mut self, outcome: CompletionOutcome, age: Duration) {
        let now = Instant::now();
        self.responses.push(StoredOutcome {
            outcome,
            created: now.checked_sub(age).unwrap_or(now),
        });
    }

    /// Make every following [`DispatchStore::insert_outcome`] fail.
    pub fn fail_inserts(&mut self, fail: bool) {
        self.fail_inserts = fail;
    }
}

impl DispatchStore for InMemoryDispatchStore {
    fn consume_requests<T, E, F>(&mut self, limit: usize, accept: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce(Vec<QueueRow>) -> Result<T, E>,
    {
        let take = limit.min(self.queue.len());
        let claimed: Vec<QueueRow> = self.queue.drain(..take).collect();

        match accept(claimed.clone()) {
            Ok(value) => Ok(value),
            Err(e) => {
                for row in claimed.into_iter().rev() {
                    self.queue.push_front(row);
                }
                Err(e)
            }
        }
    }

    fn insert_outcome(&mut self, outcome: &CompletionOutcome) -> Result<(), StoreError> {
        if self.fail_inserts {
            return Err(StoreError::Database("insert rejected".to_string()));
        }
        self.responses.push(StoredOutcome {
            outcome: outcome.clone(),
            created: Instant::now(),
        });
        Ok(())
    }

    fn expire_responses(&mut self, ttl: Duration, limit: usize) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut expired: Vec<usize> = self
            .responses
            .iter()
            .enumerate()
            .filter(|(_, s)| now.duration_since(s.created) > ttl)
            .map(|(i, _)| i)
            .collect();
        expired.sort_by_key(|&i| self.responses[i].created);
        expired.truncate(limit);
        expired.sort_unstable();

        for &index in expired.iter().rev() {
            self.responses.remove(index);
        }
        Ok(expired.len() as u64)
    }
}
