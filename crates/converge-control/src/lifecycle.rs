//! Operation and power lifecycles.
//!
//! # Operation lifecycle
//!
//! ```text
//!              ┌───────────┐
//!              │  Pending  │◄──── refetch (progress may change)
//!              └─────┬─────┘
//!                    │ completion timestamp set
//!       ┌────────────┼──────────────┐
//!       ▼            ▼              ▼
//!  ┌─────────┐  ┌─────────┐  ┌──────────────┐
//!  │ Success │  │  Error  │  │ Unknown(code)│
//!  └─────────┘  └─────────┘  └──────────────┘
//! ```
//!
//! Terminal states are final: a refetch that turns a terminal handle back
//! into a pending one, or that returns a different operation, is rejected.
//!
//! # Power bracketing
//!
//! Only instances observed `Running` are powered off before a mutation that
//! needs them stopped, and only those are powered back on afterwards.

use crate::api::PowerState;
use crate::error::{ControlError, Result};
use crate::operation::OperationHandle;

/// Validate that `next` is a legal refresh of `previous`.
///
/// # Errors
///
/// Returns `ControlError::Internal` if the refresh refers to another
/// operation or target, or if a terminal operation became pending again.
pub fn validate_refresh(previous: &OperationHandle, next: &OperationHandle) -> Result<()> {
    if next.id != previous.id {
        return Err(ControlError::Internal(format!(
            "refetch of operation {} for {} returned operation {}",
            previous.id,
            previous.target_label(),
            next.id
        )));
    }
    if next.target_id != previous.target_id {
        return Err(ControlError::Internal(format!(
            "operation {} changed target from {} to {}",
            previous.id,
            previous.target_label(),
            next.target_label()
        )));
    }
    if previous.is_terminal() && !next.is_terminal() {
        return Err(ControlError::Internal(format!(
            "operation {} for {} reverted from terminal to pending",
            previous.id,
            previous.target_label()
        )));
    }
    Ok(())
}

/// Returns true if an instance in this state must be powered off (and later
/// powered back on) around a mutation that requires it stopped.
#[must_use]
pub const fn should_power_off(state: PowerState) -> bool {
    matches!(state, PowerState::Running)
}

/// Returns true if the instance is already in a state that tolerates the
/// mutation without intervention.
#[must_use]
pub const fn is_stopped(state: PowerState) -> bool {
    matches!(state, PowerState::Stopped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{STATUS_ERROR, STATUS_SUCCESS};
    use converge_core::{OperationId, ResourceId};

    fn pending() -> OperationHandle {
        OperationHandle::pending(OperationId::new(1), ResourceId::new(2), "data")
    }

    #[test]
    fn progress_refresh_is_valid() {
        let mut next = pending();
        next.progress = 40;
        assert!(validate_refresh(&pending(), &next).is_ok());
        assert!(validate_refresh(&pending(), &pending().completed(STATUS_SUCCESS)).is_ok());
    }

    #[test]
    fn different_operation_is_rejected() {
        let other = OperationHandle::pending(OperationId::new(9), ResourceId::new(2), "data");
        let err = validate_refresh(&pending(), &other).unwrap_err();
        assert!(err.to_string().contains("returned operation op-9"));
    }

    #[test]
    fn different_target_is_rejected() {
        let other = OperationHandle::pending(OperationId::new(1), ResourceId::new(3), "data");
        assert!(validate_refresh(&pending(), &other).is_err());
    }

    #[test]
    fn terminal_never_reverts() {
        let done = pending().completed(STATUS_ERROR);
        assert!(validate_refresh(&done, &pending()).is_err());
        assert!(validate_refresh(&done, &done).is_ok());
    }

    #[test]
    fn power_predicates() {
        assert!(should_power_off(PowerState::Running));
        assert!(!should_power_off(PowerState::Stopped));
        assert!(!should_power_off(PowerState::Transitioning));
        assert!(!should_power_off(PowerState::Unknown));
        assert!(is_stopped(PowerState::Stopped));
        assert!(!is_stopped(PowerState::Running));
    }
}
