//! Operation tracker.
//!
//! Polls a remote operation until it is terminal. Each iteration sleeps for
//! the policy interval and then refetches the handle. Transient refetch
//! failures consume the retry budget; anything else ends tracking at once.
//! The sleep is the only suspension point and is raced against the
//! caller's [`Cancellation`], so an operation that stays pending forever can
//! still be abandoned.

use crate::api::CloudApi;
use crate::cancel::Cancellation;
use crate::classify::{classify, ErrorClass};
use crate::error::{ControlError, Result};
use crate::lifecycle;
use crate::operation::OperationHandle;
use crate::types::RetryPolicy;

/// Poll `handle` until it is terminal.
///
/// An already-terminal handle is returned as is, without any remote call.
/// The returned handle may carry any terminal status; use
/// [`track_to_success`] to turn an error status into an error.
///
/// # Errors
///
/// - `ControlError::Transient` once `policy.max_attempts` transient refetch
///   failures have occurred, carrying the last of them.
/// - `ControlError::OperationNotFound` if the operation disappears.
/// - `ControlError::Api` for any other refetch failure.
/// - `ControlError::Cancelled` if `cancel` fires or its deadline passes.
/// - `ControlError::Internal` if the API returns an inconsistent refresh.
pub async fn track<A>(
    api: &A,
    handle: OperationHandle,
    policy: &RetryPolicy,
    cancel: &Cancellation,
) -> Result<OperationHandle>
where
    A: CloudApi + ?Sized,
{
    if handle.is_terminal() {
        return Ok(handle);
    }

    let mut handle = handle;
    let mut failures = 0u32;

    loop {
        if let Err(reason) = cancel.sleep(policy.interval()).await {
            tracing::warn!(
                operation_id = %handle.id,
                target = %handle.target_label(),
                progress = handle.progress(),
                reason = %reason,
                "Stopped waiting for operation"
            );
            return Err(ControlError::Cancelled {
                context: format!(
                    "waiting for operation {} on {} (last seen at {}%)",
                    handle.id,
                    handle.target_label(),
                    handle.progress()
                ),
                reason,
            });
        }

        match api.refetch_operation(handle.id).await {
            Ok(next) => {
                lifecycle::validate_refresh(&handle, &next)?;
                handle = next;

                tracing::debug!(
                    operation_id = %handle.id,
                    target = %handle.target_label(),
                    progress = handle.progress(),
                    "Polled operation"
                );

                if handle.is_terminal() {
                    return Ok(handle);
                }
            }
            Err(err) => match classify(None, &err) {
                ErrorClass::Transient => {
                    failures += 1;
                    if failures >= policy.max_attempts {
                        return Err(ControlError::Transient {
                            context: format!(
                                "polling operation {} for {} (last seen at {}%)",
                                handle.id,
                                handle.target_label(),
                                handle.progress()
                            ),
                            attempts: failures,
                            source: err,
                        });
                    }
                    tracing::warn!(
                        operation_id = %handle.id,
                        target = %handle.target_label(),
                        attempt = failures,
                        max_attempts = policy.max_attempts,
                        error = %err,
                        "Transient failure while polling operation, retrying"
                    );
                }
                ErrorClass::NotFound => {
                    return Err(ControlError::OperationNotFound {
                        operation: handle.id,
                        target: handle.target_label(),
                    });
                }
                ErrorClass::Validation | ErrorClass::Fatal | ErrorClass::Cancelled => {
                    return Err(ControlError::Api {
                        context: format!(
                            "polling operation {} for {}",
                            handle.id,
                            handle.target_label()
                        ),
                        source: err,
                    });
                }
            },
        }
    }
}

/// Poll `handle` until it is terminal and require the success status.
///
/// # Errors
///
/// Everything [`track`] returns, plus `ControlError::OperationFailed` for
/// the error status and `ControlError::UnknownStatus` for unrecognised ones.
pub async fn track_to_success<A>(
    api: &A,
    handle: OperationHandle,
    policy: &RetryPolicy,
    cancel: &Cancellation,
) -> Result<OperationHandle>
where
    A: CloudApi + ?Sized,
{
    let handle = track(api, handle, policy, cancel).await?;
    let outcome = handle.into_outcome();
    match &outcome {
        Ok(done) => tracing::debug!(
            operation_id = %done.id,
            target = %done.target_label(),
            "Operation succeeded"
        ),
        Err(e) => tracing::warn!(error = %e, "Operation did not succeed"),
    }
    outcome
}
