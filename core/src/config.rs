//! Worker configuration.
//!
//! Loads configuration from environment variables with sensible defaults.
//! The worker re-reads it at cycle boundaries when asked to reload.

use std::env;
use std::time::Duration;
use thiserror::Error;

/// Largest accepted batch size.
pub const MAX_BATCH_SIZE: usize = i16::MAX as usize;

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The variable is set but its value cannot be parsed.
    #[error("Invalid value for {name}: {value:?} ({reason})")]
    Invalid {
        /// Variable name
        name: &'static str,
        /// Raw value
        value: String,
        /// What is wrong with it
        reason: String,
    },
}

/// Configuration consumed by the outer loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Retention of stored responses before the expiry sweep deletes them
    pub ttl: Duration,
    /// Rows claimed per cycle; also bounds rows expired per cycle
    pub batch_size: usize,
    /// Connection string of the queue / response database
    pub database_url: String,
    /// Longest sleep between cycles when nothing wakes the worker
    pub idle_wait: Duration,
    /// Enable libcurl's verbose trace on every transfer
    pub verbose_transfers: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(6 * 60 * 60),
            batch_size: 200,
            database_url: "postgres://postgres@localhost:5432/postgres".to_string(),
            idle_wait: Duration::from_millis(1000),
            verbose_transfers: false,
        }
    }
}

impl WorkerConfig {
    /// Load configuration from the process environment.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `COURIER_TTL` | `6 hours` |
    /// | `COURIER_BATCH_SIZE` | `200` |
    /// | `DATABASE_URL` | `postgres://postgres@localhost:5432/postgres` |
    /// | `COURIER_IDLE_WAIT_MS` | `1000` |
    /// | `COURIER_VERBOSE_TRANSFERS` | `false` |
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a variable is set to a value that
    /// cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a variable cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let ttl = match lookup("COURIER_TTL") {
            Some(raw) => parse_interval(&raw).map_err(|reason| ConfigError::Invalid {
                name: "COURIER_TTL",
                value: raw,
                reason,
            })?,
            None => defaults.ttl,
        };

        let batch_size = match lookup("COURIER_BATCH_SIZE") {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(n) if n <= MAX_BATCH_SIZE => n,
                Ok(_) => {
                    return Err(ConfigError::Invalid {
                        name: "COURIER_BATCH_SIZE",
                        value: raw,
                        reason: format!("must be at most {MAX_BATCH_SIZE}"),
                    });
                }
                Err(e) => {
                    return Err(ConfigError::Invalid {
                        name: "COURIER_BATCH_SIZE",
                        value: raw,
                        reason: e.to_string(),
                    });
                }
            },
            None => defaults.batch_size,
        };

        let idle_wait = match lookup("COURIER_IDLE_WAIT_MS") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| ConfigError::Invalid {
                    name: "COURIER_IDLE_WAIT_MS",
                    value: raw,
                    reason: e.to_string(),
                })?,
            None => defaults.idle_wait,
        };

        let verbose_transfers = match lookup("COURIER_VERBOSE_TRANSFERS") {
            Some(raw) => parse_bool(&raw).ok_or_else(|| ConfigError::Invalid {
                name: "COURIER_VERBOSE_TRANSFERS",
                value: raw,
                reason: "expected true/false".to_string(),
            })?,
            None => defaults.verbose_transfers,
        };

        Ok(Self {
            ttl,
            batch_size,
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            idle_wait,
            verbose_transfers,
        })
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse interval text such as `"6 hours"`, `"30 min"`, `"90 s"` or
/// `"1 day 2 hours"`.
///
/// # Errors
///
/// Returns a description of the first component that cannot be parsed.
pub fn parse_interval(raw: &str) -> Result<Duration, String> {
    let mut tokens = raw.split_whitespace().peekable();
    let mut total = Duration::ZERO;
    let mut seen = false;

    while let Some(token) = tokens.next() {
        // Accept both "90s" and "90 s".
        let split = token
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(token.len());
        let (digits, attached_unit) = token.split_at(split);
        let amount: u64 = digits
            .parse()
            .map_err(|_| format!("expected a number, found {token:?}"))?;

        let unit = if attached_unit.is_empty() {
            tokens
                .next()
                .ok_or_else(|| format!("missing unit after {amount}"))?
        } else {
            attached_unit
        };

        let seconds_per_unit = match unit.to_ascii_lowercase().as_str() {
            "s" | "sec" | "secs" | "second" | "seconds" => 1,
            "m" | "min" | "mins" | "minute" | "minutes" => 60,
            "h" | "hr" | "hrs" | "hour" | "hours" => 60 * 60,
            "d" | "day" | "days" => 24 * 60 * 60,
            other => return Err(format!("unknown unit {other:?}")),
        };

        total = amount
            .checked_mul(seconds_per_unit)
            .and_then(|secs| total.checked_add(Duration::from_secs(secs)))
            .ok_or_else(|| format!("interval {raw:?} is too large"))?;
        seen = true;
    }

    if seen {
        Ok(total)
    } else {
        Err("empty interval".to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = WorkerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, WorkerConfig::default());
        assert_eq!(config.ttl, Duration::from_secs(21_600));
        assert_eq!(config.batch_size, 200);
    }

    #[test]
    fn values_are_read() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("COURIER_TTL", "30 minutes"),
            ("COURIER_BATCH_SIZE", "50"),
            ("DATABASE_URL", "postgres://db/x"),
            ("COURIER_IDLE_WAIT_MS", "250"),
            ("COURIER_VERBOSE_TRANSFERS", "yes"),
        ]))
        .unwrap();

        assert_eq!(config.ttl, Duration::from_secs(1800));
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.database_url, "postgres://db/x");
        assert_eq!(config.idle_wait, Duration::from_millis(250));
        assert!(config.verbose_transfers);
    }

    #[test]
    fn oversized_batch_is_rejected() {
        let err = WorkerConfig::from_lookup(lookup(&[("COURIER_BATCH_SIZE", "40000")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                name: "COURIER_BATCH_SIZE",
                ..
            }
        ));
    }

    #[test]
    fn interval_forms() {
        assert_eq!(parse_interval("6 hours").unwrap(), Duration::from_secs(21_600));
        assert_eq!(parse_interval("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(
            parse_interval("1 day 2 hours").unwrap(),
            Duration::from_secs(26 * 3600)
        );
        assert!(parse_interval("").is_err());
        assert!(parse_interval("5 fortnights").is_err());
        assert!(parse_interval("hours").is_err());
        assert!(parse_interval("5").is_err());
    }

    #[test]
    fn overflowing_interval_is_rejected() {
        assert!(parse_interval("18446744073709551615 s 1 s").is_err());
        assert!(parse_interval("18446744073709551615 days").is_err());

        let err = WorkerConfig::from_lookup(lookup(&[(
            "COURIER_TTL",
            "18446744073709551615 s 1 s",
        )]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "COURIER_TTL", .. }));
    }
}
