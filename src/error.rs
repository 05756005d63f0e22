//! Error types for the semaphore engine.
//!
//! Every failure the engine can report surfaces synchronously from the call
//! that detects it. Commands that fail after enqueue mark their completion
//! event as failed instead; a blocking wait or `finish` then returns the
//! stored error.
//!
//! # Design Notes
//! - Variants with `detail` carry human-readable context and are not stable
//!   for machine parsing.
//! - The enum is `Clone` so a single command failure can be surfaced to every
//!   holder of the completion event. I/O failures from the sync-fd bridge are
//!   therefore captured as `(op, message)` rather than as a live `io::Error`.
//! - `#[non_exhaustive]` so new failure modes can be added without breaking
//!   callers; consumers should include a fallback match arm.

use std::fmt;
use std::io;

/// Errors reported by semaphore, queue, and bridge operations.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum SemError {
    /// Malformed, unknown, duplicated, or conflicting creation properties.
    InvalidProperty { detail: String },
    /// Device not part of the owning context, or excluded by the semaphore's
    /// device list.
    InvalidDevice,
    /// Use after release to refcount zero, wrong context, or an object left
    /// unusable by a fatal handle condition.
    InvalidSemaphore,
    /// Export or import requested for a handle kind the semaphore (or the
    /// context's capability set) does not enable.
    UnsupportedHandleType,
    /// Query buffer size does not match the parameter's natural size.
    SizeMismatch { expected: usize, got: usize },
    /// Misuse detected at best effort: dependency on a failed event, empty
    /// target list, teardown while commands were outstanding, and similar.
    InvalidOperation { detail: String },
    /// A syscall in the sync-fd bridge failed.
    HandleIo { op: &'static str, message: String },
}

impl SemError {
    /// Creates an `InvalidProperty` with context.
    #[inline]
    pub fn invalid_property(detail: impl Into<String>) -> Self {
        Self::InvalidProperty {
            detail: detail.into(),
        }
    }

    /// Creates an `InvalidOperation` with context.
    #[inline]
    pub fn invalid_operation(detail: impl Into<String>) -> Self {
        Self::InvalidOperation {
            detail: detail.into(),
        }
    }

    /// Captures a failed syscall from the sync-fd bridge.
    ///
    /// The original `io::Error` is flattened to its message so the error
    /// stays `Clone`.
    #[inline]
    pub fn handle_io(op: &'static str, err: io::Error) -> Self {
        Self::HandleIo {
            op,
            message: err.to_string(),
        }
    }
}

impl fmt::Display for SemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidProperty { detail } => write!(f, "invalid property: {detail}"),
            Self::InvalidDevice => write!(f, "device not valid for this context or semaphore"),
            Self::InvalidSemaphore => write!(f, "semaphore is invalid or has been released"),
            Self::UnsupportedHandleType => write!(f, "handle type not enabled for this semaphore"),
            Self::SizeMismatch { expected, got } => {
                write!(f, "size mismatch: expected {expected} bytes, got {got}")
            }
            Self::InvalidOperation { detail } => write!(f, "invalid operation: {detail}"),
            Self::HandleIo { op, message } => write!(f, "sync fd {op} failed: {message}"),
        }
    }
}

impl std::error::Error for SemError {}
