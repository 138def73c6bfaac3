use crate::types::{DataType, Device};

pub type Result<T> = std::result::Result<T, FusorError>;

/// Errors surfaced by the enqueue API, negotiation, and execution layers.
///
/// Variants are `Clone` so one execution status can be delivered to every
/// completion callback of a fused group.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FusorError {
    #[error("fusor has not been initialized; construct a Fusor runtime first")]
    NotInitialized,

    #[error(
        "fusor has been shut down; this was caused by a shutdown request or a \
         fatal error on one of the ranks"
    )]
    ShutDown,

    #[error(
        "tensor {name} already has an outstanding operation; use a different \
         tensor name or wait for the previous operation to complete"
    )]
    DuplicateName { name: String },

    #[error("precondition violated: {0}")]
    PreconditionError(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to allocate {requested_bytes} bytes on {device}: {reason}")]
    AllocationFailed {
        device: Device,
        requested_bytes: usize,
        reason: String,
    },

    #[error("unsupported data type: {dtype} for operation {op}")]
    UnsupportedDType { dtype: DataType, op: &'static str },

    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error("{operation} failed: {reason}")]
    CollectiveFailed {
        operation: &'static str,
        reason: String,
    },

    #[error("message encode failed: {0}")]
    EncodeFailed(String),

    #[error("message decode failed: {0}")]
    DecodeFailed(String),

    #[error("unknown error: {0}")]
    UnknownError(String),
}

impl FusorError {
    /// Create a `DuplicateName` error for the given tensor name.
    pub fn duplicate(name: impl Into<String>) -> Self {
        Self::DuplicateName { name: name.into() }
    }

    /// Create a `CollectiveFailed` error with the failing call's name.
    pub fn collective(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::CollectiveFailed {
            operation,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_name_display() {
        let e = FusorError::duplicate("grad/dense_1");
        assert!(e.to_string().contains("grad/dense_1"));
        assert!(e.to_string().contains("outstanding"));
    }

    #[test]
    fn test_collective_failed_display() {
        let e = FusorError::collective("reduce_scatter", "peer hung up");
        assert_eq!(e.to_string(), "reduce_scatter failed: peer hung up");
    }

    #[test]
    fn test_allocation_failed_display() {
        let e = FusorError::AllocationFailed {
            device: Device::Accelerator(1),
            requested_bytes: 1024,
            reason: "out of memory".into(),
        };
        assert!(e.to_string().contains("accelerator:1"));
        assert!(e.to_string().contains("1024"));
    }

    #[test]
    fn test_errors_are_cloneable() {
        let e = FusorError::ShutDown;
        let copy = e.clone();
        assert_eq!(e, copy);
    }
}
