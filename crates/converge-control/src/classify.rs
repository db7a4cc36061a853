//! Error classification.
//!
//! Failures coming back from the API are sorted into a small number of
//! classes that decide what happens next: retry, drop the local identity,
//! or propagate.

use converge_core::Target;

use crate::api::{ApiError, TransportFault};
use crate::error::ControlError;

/// How a failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// The object is gone remotely; never retried.
    NotFound,
    /// A connection-level fault; retried under a bounded budget.
    Transient,
    /// The request violates a remote precondition; never retried.
    Validation,
    /// Anything else; propagated immediately.
    Fatal,
    /// The wait was abandoned by the caller or a deadline.
    Cancelled,
}

/// Classify an API failure.
///
/// `status` overrides whatever status the error itself carries, which lets
/// callers that only hold a raw status code classify it the same way.
#[must_use]
pub fn classify(status: Option<u16>, err: &ApiError) -> ErrorClass {
    match status.or_else(|| err.http_status()) {
        Some(404) => return ErrorClass::NotFound,
        Some(400 | 409 | 422) => return ErrorClass::Validation,
        Some(429 | 502 | 503 | 504) => return ErrorClass::Transient,
        Some(_) => return ErrorClass::Fatal,
        None => {}
    }

    match err {
        ApiError::Transport {
            fault: TransportFault::Eof | TransportFault::ConnectionReset | TransportFault::Timeout,
            ..
        } => ErrorClass::Transient,
        ApiError::Transport { .. } | ApiError::Decode(_) | ApiError::Status { .. } => {
            ErrorClass::Fatal
        }
    }
}

impl ControlError {
    /// Build a contextual error from an API failure against `target`.
    ///
    /// `action` describes what was being attempted, e.g. `"resizing"`.
    #[must_use]
    pub fn from_api(target: &Target, action: &str, err: ApiError) -> Self {
        match classify(None, &err) {
            ErrorClass::NotFound => Self::NotFound(target.clone()),
            ErrorClass::Validation => Self::Validation {
                target: target.to_string(),
                reason: format!("{action} was rejected: {err}"),
            },
            ErrorClass::Transient => Self::Transient {
                context: format!("{action} {target}"),
                attempts: 1,
                source: err,
            },
            ErrorClass::Fatal | ErrorClass::Cancelled => Self::Api {
                context: format!("{action} {target}"),
                source: err,
            },
        }
    }

    /// The class of an already-built error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound(_) | Self::OperationNotFound { .. } | Self::NoneAvailable { .. } => {
                ErrorClass::NotFound
            }
            Self::Transient { .. } => ErrorClass::Transient,
            Self::Validation { .. } | Self::Unsupported { .. } | Self::Config(_) => {
                ErrorClass::Validation
            }
            Self::Cancelled { .. } => ErrorClass::Cancelled,
            Self::Api { source, .. } => classify(None, source),
            Self::OperationFailed { .. }
            | Self::UnknownStatus { .. }
            | Self::PartialFailure { .. }
            | Self::DeleteUnconfirmed { .. }
            | Self::Core(_)
            | Self::Internal(_) => ErrorClass::Fatal,
        }
    }
}
