//! Completion outcomes.
//!
//! Exactly one [`CompletionOutcome`] is produced per tracked transfer. A
//! transfer that reached the server and got any HTTP status back, including
//! 4xx and 5xx, is a [`SuccessOutcome`]; only transport-level failures
//! (DNS, connect, TLS, timeout, malformed reply) are a [`FailureOutcome`].

use serde::ser::{Serialize, SerializeMap, Serializer};

/// Response headers in receipt order.
///
/// Repeated names are kept as separate entries rather than merged, since
/// headers such as `Set-Cookie` carry distinct values per occurrence. The
/// JSON form is an object that may contain the same key more than once, which
/// the `json` column type of the response store preserves verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHeaders(Vec<(String, String)>);

impl ResponseHeaders {
    /// Create an empty header list.
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Append one header, keeping any earlier header with the same name.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Append to the value of the most recent header (obsolete line folding).
    ///
    /// Returns `false` when there is no header to continue.
    pub fn continue_last(&mut self, continuation: &str) -> bool {
        match self.0.last_mut() {
            Some((_, value)) => {
                if !value.is_empty() {
                    value.push(' ');
                }
                value.push_str(continuation);
                true
            }
            None => false,
        }
    }

    /// Drop every header (a new response block is starting).
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// First value for `name`, compared case-insensitively.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `name` in receipt order, compared case-insensitively.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Iterate over `(name, value)` pairs in receipt order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of header entries, duplicates included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no header was received.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Render as a JSON object text, duplicate keys included.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if a header cannot be encoded.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a JSON object text, keeping duplicate keys in document order.
    ///
    /// Non-string values are rendered with their JSON text.
    ///
    /// # Errors
    ///
    /// Returns the deserializer error if the text is not a JSON object.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let pairs: DuplicateKeyObject = serde_json::from_str(text)?;
        Ok(Self(pairs.0))
    }
}

impl Serialize for ResponseHeaders {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl FromIterator<(String, String)> for ResponseHeaders {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

struct DuplicateKeyObject(Vec<(String, String)>);

impl<'de> serde::Deserialize<'de> for DuplicateKeyObject {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;

        impl<'de> serde::de::Visitor<'de> for Visitor {
            type Value = DuplicateKeyObject;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a JSON object of header names to values")
            }

            fn visit_map<A: serde::de::MapAccess<'de>>(
                self,
                mut access: A,
            ) -> Result<Self::Value, A::Error> {
                let mut pairs = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, value)) =
                    access.next_entry::<String, serde_json::Value>()?
                {
                    let value = match value {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    pairs.push((name, value));
                }
                Ok(DuplicateKeyObject(pairs))
            }
        }

        deserializer.deserialize_map(Visitor)
    }
}

/// A transfer that received an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuccessOutcome {
    /// Request identifier
    pub id: i64,
    /// HTTP status code of the final response
    pub status_code: u32,
    /// Headers of the final response
    pub headers: ResponseHeaders,
    /// Response body; `None` when zero bytes were received
    pub body: Option<String>,
    /// `Content-Type` of the final response, if any
    pub content_type: Option<String>,
}

/// A transfer that failed below the HTTP layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureOutcome {
    /// Request identifier
    pub id: i64,
    /// Whether the failure was the transfer's own timeout
    pub timed_out: bool,
    /// Human-readable failure description
    pub error_message: String,
}

/// The terminal record for one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// An HTTP response was received (any status code)
    Success(SuccessOutcome),
    /// The transfer failed before a response was received
    Failure(FailureOutcome),
}

impl CompletionOutcome {
    /// Request identifier this outcome belongs to.
    #[must_use]
    pub const fn id(&self) -> i64 {
        match self {
            Self::Success(s) => s.id,
            Self::Failure(f) => f.id,
        }
    }

    /// Whether the transfer hit its own timeout.
    #[must_use]
    pub const fn timed_out(&self) -> bool {
        match self {
            Self::Success(_) => false,
            Self::Failure(f) => f.timed_out,
        }
    }

    /// Whether this is a [`SuccessOutcome`].
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Short label used in logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Failure(f) if f.timed_out => "timeout",
            Self::Failure(_) => "failure",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_headers_survive_json() {
        let mut headers = ResponseHeaders::new();
        headers.push("Set-Cookie", "a=1");
        headers.push("Content-Type", "text/plain");
        headers.push("Set-Cookie", "b=2");

        let json = headers.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"Set-Cookie":"a=1","Content-Type":"text/plain","Set-Cookie":"b=2"}"#
        );

        let parsed = ResponseHeaders::from_json(&json).unwrap();
        assert_eq!(parsed, headers);
        assert_eq!(
            parsed.get_all("set-cookie").collect::<Vec<_>>(),
            vec!["a=1", "b=2"]
        );
    }

    #[test]
    fn header_lookup_ignores_case() {
        let headers: ResponseHeaders =
            [("X-Test".to_string(), "1".to_string())].into_iter().collect();
        assert_eq!(headers.get("x-test"), Some("1"));
        assert_eq!(headers.get("x-other"), None);
    }

    #[test]
    fn continuation_extends_last_value() {
        let mut headers = ResponseHeaders::new();
        assert!(!headers.continue_last("orphan"));
        headers.push("X-Long", "first");
        assert!(headers.continue_last("second"));
        assert_eq!(headers.get("x-long"), Some("first second"));
    }

    #[test]
    fn outcome_accessors() {
        let timeout = CompletionOutcome::Failure(FailureOutcome {
            id: 3,
            timed_out: true,
            error_message: "Timeout of 1 ms reached".to_string(),
        });
        assert_eq!(timeout.id(), 3);
        assert!(timeout.timed_out());
        assert_eq!(timeout.kind(), "timeout");

        let ok = CompletionOutcome::Success(SuccessOutcome {
            id: 4,
            status_code: 404,
            headers: ResponseHeaders::new(),
            body: None,
            content_type: None,
        });
        assert!(ok.is_success());
        assert!(!ok.timed_out());
        assert_eq!(ok.kind(), "success");
    }
}
