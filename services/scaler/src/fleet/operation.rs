//! Waiting for provider operations.
//!
//! Polling is a liveness loop, not a generic retry wrapper: only an
//! in-progress operation is polled again. Reported errors and failed status
//! queries end the wait immediately.

use async_trait::async_trait;
use gce_scaler_reconcile::{next_poll_action, BackoffPolicy, OperationObservation, PollAction};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::FleetError;

/// Reads the current state of an operation.
#[async_trait]
pub trait OperationPoller: Send + Sync {
    async fn poll(&self, operation: &str) -> Result<OperationObservation, FleetError>;
}

/// Poll `operation` until it reaches a terminal state.
pub async fn wait_for_operation<P>(
    poller: &P,
    operation: &str,
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
) -> Result<(), FleetError>
where
    P: OperationPoller + ?Sized,
{
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        let observation = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FleetError::Cancelled),
            result = poller.poll(operation) => result?,
        };

        debug!(operation, status = %observation.status, attempt, "Operation status");

        match next_poll_action(&observation, attempt, started.elapsed(), policy) {
            PollAction::Succeeded => return Ok(()),
            PollAction::Failed(issues) => {
                return Err(FleetError::Operation {
                    operation: operation.to_string(),
                    issues,
                });
            }
            PollAction::TimedOut { elapsed } => {
                return Err(FleetError::OperationTimedOut {
                    operation: operation.to_string(),
                    elapsed,
                });
            }
            PollAction::RetryAfter(delay) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(FleetError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}
