//! Rows going into the queue and coming out of the response table.

use chrono::{DateTime, Utc};
use courier_core::{CompletionOutcome, FailureOutcome, QueueRow, ResponseHeaders, SuccessOutcome};
use serde_json::{Map, Value};

/// Default total timeout for submitted requests.
pub const DEFAULT_TIMEOUT_MILLISECONDS: i32 = 5000;

/// A request to submit to the queue.
///
/// Header names are unique on the way in; the queue stores them as a JSON
/// object.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRequest {
    /// Free-text method; validated by the worker, not on submission
    pub method: String,
    /// Target URL
    pub url: String,
    /// Request headers
    pub headers: Map<String, Value>,
    /// Request body
    pub body: Option<String>,
    /// Total transfer timeout
    pub timeout_milliseconds: i32,
}

impl NewRequest {
    fn new(method: &str, url: impl Into<String>) -> Self {
        Self {
            method: method.to_string(),
            url: url.into(),
            headers: Map::new(),
            body: None,
            timeout_milliseconds: DEFAULT_TIMEOUT_MILLISECONDS,
        }
    }

    /// A `GET` without body.
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    /// A `POST` carrying `body`, sent as `application/json` unless a
    /// `Content-Type` header is set afterwards.
    #[must_use]
    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        let mut request = Self::new("POST", url).with_header("Content-Type", "application/json");
        request.body = Some(body.into());
        request
    }

    /// A `DELETE` without body.
    #[must_use]
    pub fn delete(url: impl Into<String>) -> Self {
        Self::new("DELETE", url)
    }

    /// Set a header, replacing any previous value under the same name.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), Value::String(value.into()));
        self
    }

    /// Replace the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Replace the timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout_milliseconds: i32) -> Self {
        self.timeout_milliseconds = timeout_milliseconds;
        self
    }
}

/// A row of `net._http_response`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
    /// Request identifier
    pub id: i64,
    /// HTTP status; absent for failures
    pub status_code: Option<i32>,
    /// `Content-Type` reported by the server
    pub content_type: Option<String>,
    /// Response headers in receipt order, duplicates included
    pub headers: Option<ResponseHeaders>,
    /// Response body text
    pub content: Option<String>,
    /// Whether the transfer hit its timeout; absent for successes
    pub timed_out: Option<bool>,
    /// Failure message; absent for successes
    pub error_msg: Option<String>,
    /// When the outcome was written
    pub created: DateTime<Utc>,
}

impl StoredResponse {
    /// Rebuild the outcome the worker stored.
    ///
    /// Returns `None` for rows that are neither a success (status present)
    /// nor a failure (error message present).
    #[must_use]
    pub fn outcome(&self) -> Option<CompletionOutcome> {
        if let Some(status_code) = self.status_code {
            return Some(CompletionOutcome::Success(SuccessOutcome {
                id: self.id,
                status_code: u32::try_from(status_code).unwrap_or_default(),
                headers: self.headers.clone().unwrap_or_default(),
                body: self.content.clone(),
                content_type: self.content_type.clone(),
            }));
        }
        self.error_msg.as_ref().map(|message| {
            CompletionOutcome::Failure(FailureOutcome {
                id: self.id,
                timed_out: self.timed_out.unwrap_or(false),
                error_message: message.clone(),
            })
        })
    }
}

/// Where a submitted request stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// No outcome stored yet
    Pending,
    /// The transfer completed with an HTTP response
    Success,
    /// The transfer failed
    Error,
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pending => "PENDING",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
        })
    }
}

/// Result of [`PgDispatchStore::collect_response`](crate::PgDispatchStore::collect_response).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedResponse {
    /// Where the request stands
    pub status: RequestStatus,
    /// `"ok"`, `"request is pending"` or the stored failure message
    pub message: String,
    /// The stored response; present only on success
    pub response: Option<StoredResponse>,
}

impl CollectedResponse {
    /// No outcome has been stored for the request yet.
    #[must_use]
    pub fn pending() -> Self {
        Self {
            status: RequestStatus::Pending,
            message: "request is pending".to_string(),
            response: None,
        }
    }
}

impl From<StoredResponse> for CollectedResponse {
    fn from(stored: StoredResponse) -> Self {
        match stored.error_msg {
            Some(message) => Self {
                status: RequestStatus::Error,
                message,
                response: None,
            },
            None => Self {
                status: RequestStatus::Success,
                message: "ok".to_string(),
                response: Some(stored),
            },
        }
    }
}

/// Columns returned by the claiming query.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ClaimedRow {
    pub id: Option<i64>,
    pub method: Option<String>,
    pub url: Option<String>,
    pub timeout_milliseconds: Option<i32>,
    pub headers: Option<Vec<String>>,
    pub body: Option<String>,
}

impl From<ClaimedRow> for QueueRow {
    fn from(row: ClaimedRow) -> Self {
        Self {
            id: row.id,
            method: row.method,
            url: row.url,
            timeout_milliseconds: row.timeout_milliseconds,
            headers: row.headers,
            body: row.body,
        }
    }
}
