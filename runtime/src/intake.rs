//! Batch intake.

use crate::error::EngineError;
use crate::metrics::DispatchMetrics;
use crate::multiplexer::Multiplexer;
use crate::transfer::{TransferOptions, create_transfer};
use courier_core::{DispatchStore, PendingRequest};
use tracing::{debug, error};

/// Claim up to `limit` queued rows and hand one transfer per row to `mux`.
///
/// All rows are validated before the first transfer is created, and the claim
/// commits only after every transfer is registered. If anything fails, the
/// claim is rolled back, the rows stay queued, and transfers already handed
/// to `mux` are removed again.
///
/// Returns the number of rows consumed.
///
/// # Errors
///
/// - [`EngineError::Row`]: a row has a null column or an unsupported method
/// - [`EngineError::Transfer`] / [`EngineError::Multi`]: a transfer could not
///   be created or registered
/// - [`EngineError::Store`]: the claim itself failed
pub fn consume_batch<S: DispatchStore>(
    store: &mut S,
    mux: &mut Multiplexer,
    limit: usize,
    options: TransferOptions,
) -> Result<usize, EngineError> {
    let result = store.consume_requests(limit, |rows| {
        let requests = rows
            .into_iter()
            .map(PendingRequest::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        for request in &requests {
            let easy = create_transfer(request, options)?;
            mux.add(request, easy)?;
        }
        Ok::<_, EngineError>(requests.len())
    });

    match result {
        Ok(consumed) => {
            if consumed > 0 {
                debug!(batch = consumed, "batch consumed");
                DispatchMetrics::record_consumed(consumed);
            }
            Ok(consumed)
        }
        Err(e) => {
            error!(error = %e, "batch intake failed, claim rolled back");
            mux.abort_all();
            Err(e)
        }
    }
}
