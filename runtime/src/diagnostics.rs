//! Timeout diagnostics.
//!
//! When a transfer hits its own timeout, the stored error message says where
//! the time went. The phase is inferred from which timing samples libcurl had
//! recorded when the timeout fired:
//!
//! | Phase | Condition | dns | handshake | http |
//! |-------|-----------|-----|-----------|------|
//! | [`TimeoutPhase::Dns`] | namelookup = 0 and connect = 0 | total | 0 | 0 |
//! | [`TimeoutPhase::Handshake`] | pretransfer = 0 | namelookup | total − namelookup | 0 |
//! | [`TimeoutPhase::Http`] | pretransfer > 0 | namelookup | (connect − namelookup) + max(0, appconnect − connect) | total − pretransfer |

use curl::easy::{Easy2, Handler};
use std::fmt;
use std::time::Duration;

/// Cumulative timing samples of one transfer, each measured from its start.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransferTimings {
    /// Name resolution completed
    pub namelookup: Duration,
    /// TCP connect completed
    pub connect: Duration,
    /// TLS handshake completed; zero for plain HTTP
    pub appconnect: Duration,
    /// Request about to be sent
    pub pretransfer: Duration,
    /// First response byte received
    pub starttransfer: Duration,
    /// Total elapsed
    pub total: Duration,
}

impl TransferTimings {
    /// Read the samples from a finished transfer.
    ///
    /// A sample that libcurl cannot report is taken as zero, which is also
    /// what libcurl reports for a phase that was never reached.
    pub fn from_transfer<H: Handler>(easy: &mut Easy2<H>) -> Self {
        Self {
            namelookup: easy.namelookup_time().unwrap_or_default(),
            connect: easy.connect_time().unwrap_or_default(),
            appconnect: easy.appconnect_time().unwrap_or_default(),
            pretransfer: easy.pretransfer_time().unwrap_or_default(),
            starttransfer: easy.starttransfer_time().unwrap_or_default(),
            total: easy.total_time().unwrap_or_default(),
        }
    }

    /// Which phase the transfer was in when it timed out.
    #[must_use]
    pub fn phase(&self) -> TimeoutPhase {
        if self.namelookup.is_zero() && self.connect.is_zero() {
            TimeoutPhase::Dns
        } else if self.pretransfer.is_zero() {
            TimeoutPhase::Handshake
        } else {
            TimeoutPhase::Http
        }
    }

    /// Split the total time across the three phases.
    #[must_use]
    pub fn breakdown(&self) -> TimeoutBreakdown {
        let namelookup = self.namelookup.as_secs_f64();
        let connect = self.connect.as_secs_f64();
        let appconnect = self.appconnect.as_secs_f64();
        let pretransfer = self.pretransfer.as_secs_f64();
        let total = self.total.as_secs_f64();

        let phase = self.phase();
        let (dns, handshake, http) = match phase {
            TimeoutPhase::Dns => (total, 0.0, 0.0),
            TimeoutPhase::Handshake => (namelookup, total - namelookup, 0.0),
            // A plain HTTP connection reports appconnect = 0.
            TimeoutPhase::Http => (
                namelookup,
                (connect - namelookup) + (appconnect - connect).max(0.0),
                total - pretransfer,
            ),
        };

        TimeoutBreakdown {
            phase,
            total_ms: total * 1000.0,
            dns_ms: dns * 1000.0,
            handshake_ms: handshake * 1000.0,
            http_ms: http * 1000.0,
        }
    }
}

/// Phase a transfer was in when its timeout fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// Name resolution never completed
    Dns,
    /// TCP connect or TLS handshake never completed
    Handshake,
    /// The request was sent but the response did not finish
    Http,
}

/// Time spent per phase, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeoutBreakdown {
    /// Phase the timeout fired in
    pub phase: TimeoutPhase,
    /// Total elapsed time
    pub total_ms: f64,
    /// Name resolution time
    pub dns_ms: f64,
    /// TCP connect plus TLS handshake time
    pub handshake_ms: f64,
    /// Request/response time
    pub http_ms: f64,
}

impl TimeoutBreakdown {
    /// Render the stored error message for a transfer whose configured
    /// timeout was `timeout_ms`.
    #[must_use]
    pub fn message(&self, timeout_ms: i32) -> String {
        format!("Timeout of {timeout_ms} ms reached. {self}")
    }
}

impl fmt::Display for TimeoutBreakdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Total time: {:.6} ms (DNS time: {:.6} ms, TCP/SSL handshake time: {:.6} ms, HTTP Request/Response time: {:.6} ms)",
            self.total_ms, self.dns_ms, self.handshake_ms, self.http_ms
        )
    }
}
