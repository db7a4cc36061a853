//! Error types for the converge engine.
//!
//! Every variant renders the object kind, the local name and the remote id
//! involved, so a failure can be diagnosed from its message alone.

use converge_core::{OperationId, ResourceKind, Target};
use thiserror::Error;

use crate::api::ApiError;
use crate::cancel::CancelReason;
use crate::plan::{MemberChange, MemberFailure};

/// A result type using `ControlError`.
pub type Result<T> = std::result::Result<T, ControlError>;

/// Errors that can occur while converging a resource.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The resource no longer exists remotely; the local identity is stale.
    #[error("{0} not found on the remote side; the local identity is stale")]
    NotFound(Target),

    /// The operation being tracked no longer exists remotely.
    #[error("operation {operation} for {target} no longer exists on the remote side")]
    OperationNotFound {
        /// The operation that vanished.
        operation: OperationId,
        /// The object the operation was mutating.
        target: String,
    },

    /// No member was available to fill an unset relationship slot.
    #[error("no available {kind} to attach under {scope}")]
    NoneAvailable {
        /// Kind of member that was requested.
        kind: ResourceKind,
        /// Where candidates were looked up.
        scope: String,
    },

    /// A retryable transport fault persisted past the retry budget.
    #[error("{context}: transient failure after {attempts} attempt(s): {source}")]
    Transient {
        /// What was being attempted.
        context: String,
        /// How many attempts failed.
        attempts: u32,
        /// The last underlying error.
        #[source]
        source: ApiError,
    },

    /// The remote operation finished with the error sentinel.
    #[error("operation {operation} for {target} failed with status {code}")]
    OperationFailed {
        /// The failed operation.
        operation: OperationId,
        /// The object the operation was mutating.
        target: String,
        /// Status code reported by the remote side.
        code: i32,
    },

    /// The remote operation finished with a status converge does not know.
    #[error("operation {operation} for {target} finished with unrecognised status {code}")]
    UnknownStatus {
        /// The operation.
        operation: OperationId,
        /// The object the operation was mutating.
        target: String,
        /// Status code reported by the remote side.
        code: i32,
    },

    /// The desired configuration violates a remote precondition.
    #[error("invalid configuration for {target}: {reason}")]
    Validation {
        /// The object being configured.
        target: String,
        /// What is wrong.
        reason: String,
    },

    /// The requested change is intentionally not implemented.
    #[error("{feature} is not supported for {target}")]
    Unsupported {
        /// The object being configured.
        target: String,
        /// The change that was requested.
        feature: String,
    },

    /// Some relationship changes failed while others were applied.
    #[error("{owner}: {}", summarize(.applied, .failures))]
    PartialFailure {
        /// The resource whose relationships were being reconciled.
        owner: Target,
        /// Changes that were applied successfully.
        applied: Vec<MemberChange>,
        /// Changes that failed, with their errors.
        failures: Vec<MemberFailure>,
    },

    /// A wait was abandoned because of cancellation or a deadline.
    #[error("{context}: {reason}")]
    Cancelled {
        /// What was being waited on.
        context: String,
        /// Why the wait was abandoned.
        reason: CancelReason,
    },

    /// The API rejected a request for a non-retryable reason.
    #[error("{context}: {source}")]
    Api {
        /// What was being attempted.
        context: String,
        /// The underlying error.
        #[source]
        source: ApiError,
    },

    /// The resource still exists after the delete confirmation budget ran out.
    #[error("{target} still exists after {attempts} delete confirmation attempt(s)")]
    DeleteUnconfirmed {
        /// The object being deleted.
        target: String,
        /// How many confirmation reads were made.
        attempts: u32,
    },

    /// Core error (identifier handling).
    #[error(transparent)]
    Core(#[from] converge_core::CoreError),

    /// Invalid engine configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

fn summarize(applied: &[MemberChange], failures: &[MemberFailure]) -> String {
    let details = failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    format!(
        "{} of {} relationship change(s) failed: {details}",
        failures.len(),
        failures.len() + applied.len()
    )
}

impl ControlError {
    /// Returns true if the error means the local identity should be dropped.
    #[must_use]
    pub const fn is_stale_identity(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true if retrying the whole operation later may succeed.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::PartialFailure { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Relation;
    use converge_core::ResourceId;

    fn volume() -> Target {
        Target::new(ResourceKind::Volume, "data", ResourceId::new(11))
    }

    #[test]
    fn not_found_names_the_target() {
        let err = ControlError::NotFound(volume());
        assert!(err.is_stale_identity());
        assert_eq!(
            err.to_string(),
            "volume \"data\" (id 11) not found on the remote side; the local identity is stale"
        );
    }

    #[test]
    fn partial_failure_lists_members() {
        let err = ControlError::PartialFailure {
            owner: volume(),
            applied: vec![MemberChange::detach(
                Relation::VolumeConnections,
                ResourceId::new(1),
            )],
            failures: vec![MemberFailure::new(
                MemberChange::attach(Relation::VolumeConnections, ResourceId::new(4)),
                ControlError::Api {
                    context: "attaching instance 4".to_string(),
                    source: ApiError::status(500, "boom"),
                },
            )],
        };

        let msg = err.to_string();
        assert!(msg.starts_with("volume \"data\" (id 11): 1 of 2 relationship change(s) failed"));
        assert!(msg.contains("attach instance 4 (volume-connections)"));
        assert!(msg.contains("boom"));
        assert!(err.is_retriable());
        assert!(!err.is_stale_identity());
    }

    #[test]
    fn transient_exposes_source() {
        use std::error::Error as _;

        let err = ControlError::Transient {
            context: "polling op-3".to_string(),
            attempts: 5,
            source: ApiError::transport(crate::api::TransportFault::Eof, "closed"),
        };
        assert!(err.is_retriable());
        assert!(err.source().is_some());
        assert!(err.to_string().contains("after 5 attempt(s)"));
    }
}
