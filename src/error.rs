//! Crate-wide error type.
//!
//! Every fallible operation in the engine returns [`Result`]. Shape problems
//! are detected before any kernel runs, so an `Err` never leaves a result
//! tensor half written.

use crate::backend::{Backend, Op};
use crate::shape::Shape;

/// All errors that can occur within the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An operand or result does not have the shape the operation requires.
    #[error("{op}: expected shape {expected}, got {got}")]
    ShapeMismatch {
        op: &'static str,
        expected: Shape,
        got: Shape,
    },

    /// Two operands cannot be combined (non-broadcastable axes differ).
    #[error("{op}: incompatible operands {lhs} and {rhs}")]
    IncompatibleShapes {
        op: &'static str,
        lhs: Shape,
        rhs: Shape,
    },

    /// Reshape target does not describe the same number of elements.
    #[error("cannot reshape {from} into {dims:?}: {reason}")]
    InvalidReshape {
        from: Shape,
        dims: [isize; 4],
        reason: &'static str,
    },

    /// Kernel/filter window that cannot slide over the input.
    #[error("invalid window: {0}")]
    InvalidWindow(String),

    /// Merge, stack or concat called with no tensors.
    #[error("{op}: at least one tensor is required")]
    EmptyInput { op: &'static str },

    /// Constructor data does not fill the shape exactly.
    #[error("shape {shape} requires {expected} values, got {got}")]
    LengthMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Batch index past the batch axis.
    #[error("batch index {index} out of range for batch size {batch}")]
    BatchOutOfRange { index: usize, batch: usize },

    /// Serialized tensor data that cannot be decoded.
    #[error("corrupt tensor data: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The requested backend was not compiled in.
    #[error("backend {0} is not available in this build")]
    BackendUnavailable(Backend),

    /// A kernel was requested from a backend that does not implement it.
    #[error("{backend} backend does not implement {op}")]
    Unsupported { op: Op, backend: Backend },

    /// Fatal device failure. Never retried.
    #[cfg(feature = "wgpu")]
    #[error(transparent)]
    Gpu(#[from] crate::ops::wgpu::GpuFailure),

    #[error("failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Convenience result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
