//! Queue rows and validated pending requests.
//!
//! A [`QueueRow`] is exactly what the store hands back from the claiming
//! query: every column nullable, the method still free text. Converting it
//! into a [`PendingRequest`] is where row validation happens. A failed
//! conversion is never a per-row skip; the caller aborts the whole batch
//! because a malformed row means the queue schema has been tampered with.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Row validation errors.
///
/// Both variants are fatal to the batch being claimed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RowError {
    /// A required column was null.
    #[error("{0} cannot be null")]
    NullColumn(&'static str),

    /// The method is not one of GET, POST, DELETE.
    #[error("Unsupported request method {0}")]
    UnsupportedMethod(String),

    /// The timeout is negative.
    #[error("timeout_milliseconds must not be negative, got {0}")]
    NegativeTimeout(i32),
}

/// HTTP methods the engine accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    /// `GET`, optionally carrying a body
    Get,
    /// `POST`, zero-length when no body is given
    Post,
    /// `DELETE`, optionally carrying a body
    Delete,
}

impl HttpMethod {
    /// Canonical upper-case verb.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = RowError;

    /// Methods are matched case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("GET") {
            Ok(Self::Get)
        } else if s.eq_ignore_ascii_case("POST") {
            Ok(Self::Post)
        } else if s.eq_ignore_ascii_case("DELETE") {
            Ok(Self::Delete)
        } else {
            Err(RowError::UnsupportedMethod(s.to_string()))
        }
    }
}

/// One row returned by the claiming query, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueRow {
    /// Request identifier assigned by the store
    pub id: Option<i64>,
    /// Free-text method
    pub method: Option<String>,
    /// Target URL
    pub url: Option<String>,
    /// Total transfer timeout
    pub timeout_milliseconds: Option<i32>,
    /// Request headers as `"Name: value"` lines
    pub headers: Option<Vec<String>>,
    /// Request body
    pub body: Option<String>,
}

/// A validated request ready to become a tracked transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    /// Request identifier assigned by the store
    pub id: i64,
    /// Whitelisted method
    pub method: HttpMethod,
    /// Target URL
    pub url: String,
    /// Request headers as `"Name: value"` lines, in submission order
    pub headers: Vec<String>,
    /// Request body
    pub body: Option<String>,
    /// Total transfer timeout; zero means no limit
    pub timeout_milliseconds: i32,
}

impl TryFrom<QueueRow> for PendingRequest {
    type Error = RowError;

    fn try_from(row: QueueRow) -> Result<Self, Self::Error> {
        let id = row.id.ok_or(RowError::NullColumn("id"))?;
        let timeout_milliseconds = row
            .timeout_milliseconds
            .ok_or(RowError::NullColumn("timeout_milliseconds"))?;
        let method = row.method.ok_or(RowError::NullColumn("method"))?;
        let url = row.url.ok_or(RowError::NullColumn("url"))?;

        if timeout_milliseconds < 0 {
            return Err(RowError::NegativeTimeout(timeout_milliseconds));
        }

        Ok(Self {
            id,
            method: method.parse()?,
            url,
            headers: row.headers.unwrap_or_default(),
            body: row.body,
            timeout_milliseconds,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn row(method: &str) -> QueueRow {
        QueueRow {
            id: Some(1),
            method: Some(method.to_string()),
            url: Some("http://localhost/".to_string()),
            timeout_milliseconds: Some(500),
            headers: None,
            body: None,
        }
    }

    #[test]
    fn methods_are_case_insensitive() {
        assert_eq!("get".parse::<HttpMethod>().unwrap(), HttpMethod::Get);
        assert_eq!("Post".parse::<HttpMethod>().unwrap(), HttpMethod::Post);
        assert_eq!("DELETE".parse::<HttpMethod>().unwrap(), HttpMethod::Delete);
    }

    #[test]
    fn patch_is_rejected() {
        let err = PendingRequest::try_from(row("PATCH")).unwrap_err();
        assert_eq!(err, RowError::UnsupportedMethod("PATCH".to_string()));
        assert_eq!(err.to_string(), "Unsupported request method PATCH");
    }

    #[test]
    fn null_columns_are_reported_by_name() {
        let mut r = row("GET");
        r.url = None;
        assert_eq!(
            PendingRequest::try_from(r).unwrap_err(),
            RowError::NullColumn("url")
        );

        let mut r = row("GET");
        r.id = None;
        assert_eq!(
            PendingRequest::try_from(r).unwrap_err(),
            RowError::NullColumn("id")
        );

        let mut r = row("GET");
        r.timeout_milliseconds = None;
        assert_eq!(
            PendingRequest::try_from(r).unwrap_err().to_string(),
            "timeout_milliseconds cannot be null"
        );
    }

    #[test]
    fn missing_headers_become_empty() {
        let request = PendingRequest::try_from(row("GET")).unwrap();
        assert!(request.headers.is_empty());
        assert!(request.body.is_none());
    }

    #[test]
    fn negative_timeout_is_rejected() {
        let mut r = row("GET");
        r.timeout_milliseconds = Some(-5);
        assert_eq!(
            PendingRequest::try_from(r).unwrap_err(),
            RowError::NegativeTimeout(-5)
        );
    }
}
