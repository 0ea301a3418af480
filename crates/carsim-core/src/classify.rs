//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Broker connection supervision and data-point publishing."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Fatal/retryable classification of broker RPC failures.

use strum::Display;
use tonic::{Code, Status};
use tracing::{error, warn};

/// Whether an RPC failure means the session itself is unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum FailureClass {
    /// The connection is broken; fall back to the supervisor's retry loop.
    Fatal,
    /// The call failed but the connection is presumed healthy.
    Retryable,
}

impl FailureClass {
    /// Shorthand for `== FailureClass::Fatal`.
    pub fn is_fatal(self) -> bool {
        matches!(self, FailureClass::Fatal)
    }
}

/// Classify a bare status code.
pub fn classify_code(code: Code) -> FailureClass {
    match code {
        Code::Unavailable | Code::Unknown | Code::Unauthenticated | Code::Internal => {
            FailureClass::Fatal
        }
        _ => FailureClass::Retryable,
    }
}

/// Classify a failed RPC.
pub fn classify(status: &Status) -> FailureClass {
    classify_code(status.code())
}

/// Classify a failed RPC and log it at a severity matching the class.
pub fn log_failure(operation: &str, status: &Status) -> FailureClass {
    let class = classify(status);
    match class {
        FailureClass::Fatal => error!(
            operation,
            code = ?status.code(),
            details = status.message(),
            "{} aborted due to RpcError",
            operation
        ),
        FailureClass::Retryable => warn!(
            operation,
            code = ?status.code(),
            details = status.message(),
            "unhandled RpcError during {}",
            operation
        ),
    }
    class
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_breaking_codes_are_fatal() {
        for code in [
            Code::Unavailable,
            Code::Unknown,
            Code::Unauthenticated,
            Code::Internal,
        ] {
            assert_eq!(classify_code(code), FailureClass::Fatal, "{code:?}");
        }
    }

    #[test]
    fn everything_else_is_retryable() {
        for code in [
            Code::Ok,
            Code::Cancelled,
            Code::InvalidArgument,
            Code::DeadlineExceeded,
            Code::NotFound,
            Code::AlreadyExists,
            Code::PermissionDenied,
            Code::ResourceExhausted,
            Code::FailedPrecondition,
            Code::Aborted,
            Code::OutOfRange,
            Code::Unimplemented,
            Code::DataLoss,
        ] {
            assert_eq!(classify_code(code), FailureClass::Retryable, "{code:?}");
        }
    }

    #[test]
    fn log_failure_returns_the_classification() {
        assert!(log_failure("feeding", &Status::internal("boom")).is_fatal());
        assert!(!log_failure("feeding", &Status::not_found("no such id")).is_fatal());
        assert_eq!(FailureClass::Retryable.to_string(), "retryable");
    }
}
