//! CSI error types.
//!
//! All errors leaving the `libesan` services are represented by the
//! [`CsiError`] enum, which derives [`thiserror::Error`] for ergonomic error
//! handling.  Each variant maps onto exactly one gRPC status [`Code`] and
//! converts into a [`tonic::Status`] at the socket; backend and OS failures
//! are translated into this taxonomy before they reach a caller, with the raw
//! text kept only as the human-readable detail.

use std::fmt;

use thiserror::Error;

/// RPC status codes, numbered as in the gRPC status code table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    /// The operation completed successfully.
    Ok = 0,
    /// Client specified an invalid argument.
    InvalidArgument = 3,
    /// Some requested entity was not found.
    NotFound = 5,
    /// Some entity that we attempted to create already exists.
    AlreadyExists = 6,
    /// Some resource has been exhausted.
    ResourceExhausted = 8,
    /// The system is not in a state required for the operation's execution.
    FailedPrecondition = 9,
    /// The operation was aborted.
    Aborted = 10,
    /// Operation was attempted past the valid range.
    OutOfRange = 11,
    /// Operation is not implemented or not supported.
    Unimplemented = 12,
    /// Internal error.
    Internal = 13,
    /// The service is currently unavailable.
    Unavailable = 14,
}

impl Code {
    /// Whether a caller may retry the same request unchanged after backoff.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Code::Aborted | Code::Unavailable)
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::Ok => "OK",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
        };
        f.write_str(name)
    }
}

/// Unified error type for CSI operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CsiError {
    /// Missing or malformed request field.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A volume, snapshot or publication the operation requires is unknown.
    #[error("not found: {0}")]
    NotFound(String),

    /// A name or id collides with an existing object created with different
    /// parameters.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The request is valid but the current state forbids it.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// A size lies outside the permitted range.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// The array ran out of capacity or quota.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A conflicting operation on the same resource is still in flight.
    #[error("aborted: {0}")]
    Aborted(String),

    /// Transient backend or network failure.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The driver or backend does not support the operation.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// A mount operation failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// A socket transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// The RPC status code this error surfaces as.
    pub fn code(&self) -> Code {
        match self {
            Self::InvalidArgument(_) => Code::InvalidArgument,
            Self::NotFound(_) => Code::NotFound,
            Self::AlreadyExists(_) => Code::AlreadyExists,
            Self::FailedPrecondition(_) => Code::FailedPrecondition,
            Self::OutOfRange(_) => Code::OutOfRange,
            Self::ResourceExhausted(_) => Code::ResourceExhausted,
            Self::Aborted(_) => Code::Aborted,
            Self::Unavailable(_) | Self::TransportError(_) => Code::Unavailable,
            Self::Unimplemented(_) => Code::Unimplemented,
            Self::MountFailed { .. } | Self::UnmountFailed { .. } | Self::Internal(_) => {
                Code::Internal
            }
        }
    }

    /// Shorthand for the volume flavour of [`CsiError::NotFound`].
    pub fn volume_not_found(volume_id: impl fmt::Display) -> Self {
        Self::NotFound(format!("volume {volume_id} not found"))
    }

    /// Create a [`CsiError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<tokio::task::JoinError> for CsiError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Internal(format!("operation task failed: {e}"))
    }
}

impl From<Code> for tonic::Code {
    fn from(code: Code) -> Self {
        match code {
            Code::Ok => tonic::Code::Ok,
            Code::InvalidArgument => tonic::Code::InvalidArgument,
            Code::NotFound => tonic::Code::NotFound,
            Code::AlreadyExists => tonic::Code::AlreadyExists,
            Code::ResourceExhausted => tonic::Code::ResourceExhausted,
            Code::FailedPrecondition => tonic::Code::FailedPrecondition,
            Code::Aborted => tonic::Code::Aborted,
            Code::OutOfRange => tonic::Code::OutOfRange,
            Code::Unimplemented => tonic::Code::Unimplemented,
            Code::Internal => tonic::Code::Internal,
            Code::Unavailable => tonic::Code::Unavailable,
        }
    }
}

impl From<CsiError> for tonic::Status {
    fn from(e: CsiError) -> Self {
        tonic::Status::new(e.code().into(), e.to_string())
    }
}

/// The client-side view of a failed call.  Codes the services never return
/// (`UNKNOWN`, `DEADLINE_EXCEEDED`, ...) become [`CsiError::Internal`].
impl From<tonic::Status> for CsiError {
    fn from(status: tonic::Status) -> Self {
        let message = status.message().to_owned();
        match status.code() {
            tonic::Code::InvalidArgument => Self::InvalidArgument(message),
            tonic::Code::NotFound => Self::NotFound(message),
            tonic::Code::AlreadyExists => Self::AlreadyExists(message),
            tonic::Code::FailedPrecondition => Self::FailedPrecondition(message),
            tonic::Code::OutOfRange => Self::OutOfRange(message),
            tonic::Code::ResourceExhausted => Self::ResourceExhausted(message),
            tonic::Code::Aborted => Self::Aborted(message),
            tonic::Code::Unavailable => Self::Unavailable(message),
            tonic::Code::Unimplemented => Self::Unimplemented(message),
            _ => Self::Internal(format!("{}: {message}", status.code())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CsiError::volume_not_found("vol-123");
        assert_eq!(err.to_string(), "not found: volume vol-123 not found");
    }

    #[test]
    fn mount_failures_are_internal() {
        let err = CsiError::MountFailed {
            path: "/mnt/test".into(),
            reason: "permission denied".into(),
        };
        assert_eq!(err.code(), Code::Internal);
        assert!(!err.code().is_retryable());
    }

    #[test]
    fn retryable_codes() {
        assert!(CsiError::Aborted("busy".into()).code().is_retryable());
        assert!(CsiError::transport("reset").code().is_retryable());
        assert!(!CsiError::AlreadyExists("x".into()).code().is_retryable());
        assert_eq!(Code::FailedPrecondition as i32, 9);
        assert_eq!(Code::OutOfRange.to_string(), "OUT_OF_RANGE");
    }

    #[test]
    fn errors_become_grpc_statuses() {
        let status = tonic::Status::from(CsiError::volume_not_found("vol-7"));
        assert_eq!(status.code(), tonic::Code::NotFound);
        assert!(status.message().contains("vol-7"));

        let status = tonic::Status::from(CsiError::MountFailed {
            path: "/mnt/a".into(),
            reason: "busy".into(),
        });
        assert_eq!(status.code(), tonic::Code::Internal);

        let back = CsiError::from(tonic::Status::failed_precondition("volume is published"));
        assert_eq!(back, CsiError::FailedPrecondition("volume is published".into()));
        let unknown = CsiError::from(tonic::Status::deadline_exceeded("slow"));
        assert_eq!(unknown.code(), Code::Internal);
    }
}
