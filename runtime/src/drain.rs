//! Completion drain.
//!
//! Turns every transfer libcurl reports as finished into exactly one
//! [`CompletionOutcome`] and writes it to the store.

use crate::diagnostics::TransferTimings;
use crate::error::EngineError;
use crate::metrics::DispatchMetrics;
use crate::multiplexer::Multiplexer;
use crate::transfer::TrackedTransfer;
use courier_core::{
    CompletionOutcome, DispatchStore, FailureOutcome, SuccessOutcome,
};
use tracing::{debug, warn};

/// Write one outcome per finished transfer and release the transfer.
///
/// Calling this with nothing finished writes nothing. Returns the number of
/// outcomes written.
///
/// # Errors
///
/// Returns [`EngineError::Store`] if an outcome cannot be written, or the
/// multiplexer error raised while detaching the transfer. A transfer whose
/// outcome was not written stays tracked.
pub fn drain_completed<S: DispatchStore>(
    mux: &mut Multiplexer,
    store: &mut S,
) -> Result<usize, EngineError> {
    let finished = mux.finished();
    let count = finished.len();

    for (token, result) in finished {
        let transfer = mux.transfer_mut(token)?;
        let outcome = build_outcome(transfer, result);

        match &outcome {
            CompletionOutcome::Success(s) => {
                debug!(
                    request_id = s.id,
                    method = %transfer.method,
                    url = %transfer.url,
                    status_code = s.status_code,
                    "transfer completed"
                );
            }
            CompletionOutcome::Failure(f) => {
                warn!(
                    request_id = f.id,
                    method = %transfer.method,
                    url = %transfer.url,
                    timed_out = f.timed_out,
                    error = %f.error_message,
                    "transfer failed"
                );
            }
        }

        // Persisted before the handle leaves the multi handle.
        store.insert_outcome(&outcome)?;
        DispatchMetrics::record_outcome(&outcome);
        mux.detach(token)?;
    }

    Ok(count)
}

fn build_outcome(
    transfer: &mut TrackedTransfer,
    result: Result<(), curl::Error>,
) -> CompletionOutcome {
    let id = transfer.id;
    let timeout_milliseconds = transfer.timeout_milliseconds;
    let easy = transfer.easy_mut();

    match result {
        Ok(()) => {
            let status_code = match response_status(id, easy.response_code()) {
                Ok(status_code) => status_code,
                Err(failure) => return CompletionOutcome::Failure(failure),
            };
            let content_type = easy
                .content_type()
                .ok()
                .flatten()
                .map(str::to_string);
            let sink = easy.get_mut();
            CompletionOutcome::Success(SuccessOutcome {
                id,
                status_code,
                headers: sink.take_headers(),
                body: body_text(sink.take_body()),
                content_type,
            })
        }
        Err(e) if e.is_operation_timedout() => {
            let breakdown = TransferTimings::from_transfer(easy).breakdown();
            CompletionOutcome::Failure(FailureOutcome {
                id,
                timed_out: true,
                error_message: breakdown.message(timeout_milliseconds),
            })
        }
        Err(e) => CompletionOutcome::Failure(FailureOutcome {
            id,
            timed_out: false,
            error_message: e.description().to_string(),
        }),
    }
}

/// Status code of a finished transfer, or the failure to record when libcurl
/// cannot report one.
fn response_status(id: i64, code: Result<u32, curl::Error>) -> Result<u32, FailureOutcome> {
    code.map_err(|e| {
        warn!(request_id = id, error = %e, "response code unavailable");
        FailureOutcome {
            id,
            timed_out: false,
            error_message: e.description().to_string(),
        }
    })
}

/// Convert accumulated body bytes to storable text.
///
/// Zero bytes is `None`, never `""`. Invalid UTF-8 and NUL bytes, which a
/// Postgres `text` column rejects, become U+FFFD.
#[must_use]
pub fn body_text(bytes: Vec<u8>) -> Option<String> {
    if bytes.is_empty() {
        return None;
    }
    let text = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    };
    if text.contains('\0') {
        Some(text.replace('\0', "\u{FFFD}"))
    } else {
        Some(text)
    }
}
