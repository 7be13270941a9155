//! # Operation Dispatch Layer
//!
//! This module defines the kernel capability interface and its three
//! implementations:
//!
//! - [`cpu`]: single-threaded reference kernels; the semantic oracle
//! - [`parallel`]: `rayon` kernels over disjoint output partitions
//! - [`wgpu`] *(opt-in)*: WGSL compute shaders on a `wgpu` device
//! - [`dispatch`]: the execution [`Context`](dispatch::Context) that routes
//!   each operation to the first backend in its fallback chain implementing it
//!
//! ## Calling Convention
//!
//! Every kernel writes into a caller-supplied result tensor whose shape has
//! already been validated by the `Tensor` method that routed the call. Kernels
//! never resize their output and never see aliased operands: the borrow
//! checker forbids passing the result as one of the inputs, which gradient
//! kernels rely on because they zero the result before accumulating into it.
//!
//! ## Extending the Backend
//!
//! To add a new operation:
//!
//! 1. Add a variant to [`Op`] and a default method to [`Kernels`]
//! 2. Implement it in one or more backends
//! 3. Add shape checks and the `op`/`op_into` pair on `Tensor`
//! 4. List it in the backend operation table

pub mod cpu;
pub mod dispatch;
pub mod parallel;
#[cfg(feature = "wgpu")]
pub mod wgpu;

use crate::backend::{Backend, Op};
use crate::error::{Error, Result};
use crate::padding::Window;
use crate::tensor::Tensor;
use core::fmt;

/// Reduction applied over each pooling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PoolType {
    /// Largest value in the window; out-of-bounds positions read `f32::MIN`.
    #[default]
    Max,
    /// Window sum divided by `filter²`; out-of-bounds positions read 0.
    Avg,
}

impl fmt::Display for PoolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Max => "max",
            Self::Avg => "avg",
        })
    }
}

/// Capability interface implemented independently by each backend.
///
/// Every method has a default that reports [`Error::Unsupported`], so a
/// backend only overrides what it implements directly. The dispatcher never
/// calls an operation on a backend whose [`Backend::direct_ops`] table does
/// not list it.
///
/// Operands and results are whole tensors so device backends can reach their
/// device mirrors. Host backends may assume every operand is host-readable.
pub trait Kernels: Send + Sync + fmt::Debug {
    /// Which backend these kernels belong to.
    fn backend(&self) -> Backend;

    /// `out = alpha * a + beta * b`, replicating a batch-1 operand across the
    /// other operand's batches.
    fn add(&self, a: &Tensor, alpha: f32, b: &Tensor, beta: f32, out: &mut Tensor) -> Result<()> {
        let _ = (a, alpha, b, beta, out);
        Err(self.unsupported(Op::Add))
    }

    /// `out = a - b` with the same batch broadcast as [`Kernels::add`].
    fn sub(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        let _ = (a, b, out);
        Err(self.unsupported(Op::Sub))
    }

    /// `out = a * b` elementwise over equal shapes.
    fn mul_elementwise(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        let _ = (a, b, out);
        Err(self.unsupported(Op::MulElementwise))
    }

    /// `out = a / b` elementwise over equal shapes.
    fn div(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        let _ = (a, b, out);
        Err(self.unsupported(Op::Div))
    }

    /// Per-(depth, batch) matrix product; a batch-1 side is shared by all slots.
    fn matmul(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        let _ = (a, b, out);
        Err(self.unsupported(Op::MatMul))
    }

    /// Swaps width and height of every (depth, batch) slice.
    fn transpose(&self, input: &Tensor, out: &mut Tensor) -> Result<()> {
        let _ = (input, out);
        Err(self.unsupported(Op::Transpose))
    }

    /// Direct correlation of `input` with `kernels` (no kernel flip).
    fn conv2d(&self, input: &Tensor, kernels: &Tensor, window: &Window, out: &mut Tensor) -> Result<()> {
        let _ = (input, kernels, window, out);
        Err(self.unsupported(Op::Conv2D))
    }

    /// Gradient of [`Kernels::conv2d`] with respect to its input.
    ///
    /// `window` is the forward window; `out` has the forward input's shape.
    fn conv2d_input_gradient(
        &self,
        output_gradient: &Tensor,
        kernels: &Tensor,
        window: &Window,
        out: &mut Tensor,
    ) -> Result<()> {
        let _ = (output_gradient, kernels, window, out);
        Err(self.unsupported(Op::Conv2DInputGradient))
    }

    /// Gradient of [`Kernels::conv2d`] with respect to its kernels.
    ///
    /// `out` has the kernels' shape.
    fn conv2d_kernels_gradient(
        &self,
        input: &Tensor,
        output_gradient: &Tensor,
        window: &Window,
        out: &mut Tensor,
    ) -> Result<()> {
        let _ = (input, output_gradient, window, out);
        Err(self.unsupported(Op::Conv2DKernelsGradient))
    }

    /// Square-window pooling.
    fn pool(&self, input: &Tensor, window: &Window, kind: PoolType, out: &mut Tensor) -> Result<()> {
        let _ = (input, window, kind, out);
        Err(self.unsupported(Op::Pool))
    }

    /// Gradient of [`Kernels::pool`] given the forward input and output.
    fn pool_gradient(
        &self,
        input: &Tensor,
        output: &Tensor,
        output_gradient: &Tensor,
        window: &Window,
        kind: PoolType,
        out: &mut Tensor,
    ) -> Result<()> {
        let _ = (input, output, output_gradient, window, kind, out);
        Err(self.unsupported(Op::PoolGradient))
    }

    #[doc(hidden)]
    fn unsupported(&self, op: Op) -> Error {
        Error::Unsupported {
            op,
            backend: self.backend(),
        }
    }
}
