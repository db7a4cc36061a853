//! Remote operation handles.
//!
//! Every mutation accepted by the control plane is represented by an
//! operation ("ticket"). The handle is immutable once issued except for its
//! progress, status code and completion timestamp, which change as the
//! remote side works through it. A handle is terminal exactly when its
//! completion timestamp is set.

use chrono::{DateTime, Utc};
use converge_core::{OperationId, ResourceId};
use serde::{Deserialize, Serialize};

use crate::error::{ControlError, Result};

/// Status code the remote side reports for a successful operation.
pub const STATUS_SUCCESS: i32 = 136;

/// Status code the remote side reports for a failed operation.
pub const STATUS_ERROR: i32 = 137;

/// A handle to a remote asynchronous operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationHandle {
    /// Operation id.
    pub id: OperationId,
    /// Remote id of the object being mutated.
    pub target_id: ResourceId,
    /// Remote name of the object being mutated.
    pub target_name: String,
    /// Progress reported by the remote side (0-100).
    #[serde(default)]
    pub progress: u8,
    /// Raw status code; only meaningful once the operation is terminal.
    #[serde(default)]
    pub status_code: i32,
    /// When the operation finished, if it has.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Interpreted status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationStatus {
    /// Still running.
    Pending,
    /// Finished successfully.
    Success,
    /// Finished with an error.
    Error,
    /// Finished with a status code converge does not recognise.
    Unknown(i32),
}

impl OperationStatus {
    /// Interpret a terminal status code.
    #[must_use]
    pub const fn from_terminal_code(code: i32) -> Self {
        match code {
            STATUS_SUCCESS => Self::Success,
            STATUS_ERROR => Self::Error,
            other => Self::Unknown(other),
        }
    }

    /// Returns true for every status except `Pending`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl OperationHandle {
    /// A freshly issued, still running handle.
    #[must_use]
    pub fn pending(id: OperationId, target_id: ResourceId, target_name: impl Into<String>) -> Self {
        Self {
            id,
            target_id,
            target_name: target_name.into(),
            progress: 0,
            status_code: 0,
            completed_at: None,
        }
    }

    /// Mark the handle as finished with the given status code.
    #[must_use]
    pub fn completed(mut self, status_code: i32) -> Self {
        self.progress = 100;
        self.status_code = status_code;
        self.completed_at = Some(Utc::now());
        self
    }

    /// Returns true once the remote side has set a completion timestamp.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Interpreted status.
    #[must_use]
    pub const fn status(&self) -> OperationStatus {
        if self.completed_at.is_some() {
            OperationStatus::from_terminal_code(self.status_code)
        } else {
            OperationStatus::Pending
        }
    }

    /// Progress clamped to 0-100.
    #[must_use]
    pub fn progress(&self) -> u8 {
        self.progress.min(100)
    }

    /// Short description of the mutated object for messages.
    #[must_use]
    pub fn target_label(&self) -> String {
        format!("\"{}\" (id {})", self.target_name, self.target_id)
    }

    /// Convert a terminal handle into a result.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::OperationFailed` for the error sentinel,
    /// `ControlError::UnknownStatus` for unrecognised codes and
    /// `ControlError::Internal` if the handle is not terminal yet.
    pub fn into_outcome(self) -> Result<Self> {
        match self.status() {
            OperationStatus::Success => Ok(self),
            OperationStatus::Error => Err(ControlError::OperationFailed {
                operation: self.id,
                target: self.target_label(),
                code: self.status_code,
            }),
            OperationStatus::Unknown(code) => Err(ControlError::UnknownStatus {
                operation: self.id,
                target: self.target_label(),
                code,
            }),
            OperationStatus::Pending => Err(ControlError::Internal(format!(
                "operation {} for {} inspected before completion",
                self.id,
                self.target_label()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> OperationHandle {
        OperationHandle::pending(OperationId::new(1), ResourceId::new(10), "data")
    }

    #[test]
    fn pending_handle_is_not_terminal() {
        let h = handle();
        assert!(!h.is_terminal());
        assert_eq!(h.status(), OperationStatus::Pending);
    }

    #[test]
    fn status_code_ignored_until_terminal() {
        let mut h = handle();
        h.status_code = STATUS_ERROR;
        assert_eq!(h.status(), OperationStatus::Pending);
    }

    #[test]
    fn terminal_statuses() {
        assert_eq!(
            handle().completed(STATUS_SUCCESS).status(),
            OperationStatus::Success
        );
        assert_eq!(
            handle().completed(STATUS_ERROR).status(),
            OperationStatus::Error
        );
        assert_eq!(
            handle().completed(42).status(),
            OperationStatus::Unknown(42)
        );
    }

    #[test]
    fn outcome_success() {
        let h = handle().completed(STATUS_SUCCESS);
        assert_eq!(h.clone().into_outcome().unwrap(), h);
    }

    #[test]
    fn outcome_error_carries_code_and_context() {
        let err = handle().completed(STATUS_ERROR).into_outcome().unwrap_err();
        match &err {
            ControlError::OperationFailed { code, .. } => assert_eq!(*code, STATUS_ERROR),
            other => panic!("expected OperationFailed, got {other:?}"),
        }
        let msg = err.to_string();
        assert!(msg.contains("op-1"));
        assert!(msg.contains("\"data\" (id 10)"));
    }

    #[test]
    fn outcome_unknown_is_an_error() {
        let err = handle().completed(99).into_outcome().unwrap_err();
        assert!(matches!(err, ControlError::UnknownStatus { code: 99, .. }));
    }

    #[test]
    fn outcome_pending_is_internal_error() {
        assert!(matches!(
            handle().into_outcome(),
            Err(ControlError::Internal(_))
        ));
    }

    #[test]
    fn handle_deserializes_without_optional_fields() {
        let json = r#"{"id": 5, "target_id": 7, "target_name": "web"}"#;
        let h: OperationHandle = serde_json::from_str(json).unwrap();
        assert_eq!(h.id, OperationId::new(5));
        assert!(!h.is_terminal());
    }
}
