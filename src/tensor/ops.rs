//! Backend-routed tensor operations.
//!
//! Every operation comes in two forms:
//!
//! - `op_into(ctx, ..., &mut result)` writes into a caller-supplied tensor of
//!   exactly the result shape, for allocation-free hot paths;
//! - `op(ctx, ...)` allocates and returns the result.
//!
//! Shapes are validated here, once, before any backend is involved, so a
//! backend kernel can assume well-formed operands. A result of length zero
//! makes the call a no-op.

use super::Tensor;
use crate::backend::Op;
use crate::error::{Error, Result};
use crate::ops::dispatch::Context;
use crate::ops::PoolType;
use crate::padding::{PaddingType, Window};
use crate::shape::Shape;

fn expect_shape(op: &'static str, expected: Shape, got: Shape) -> Result<()> {
    if expected == got && expected.batch() == got.batch() {
        Ok(())
    } else {
        Err(Error::ShapeMismatch { op, expected, got })
    }
}

/// Result shape of an add/sub: equal per-batch layouts, batches equal or one of them 1.
fn broadcast_shape(op: &'static str, lhs: Shape, rhs: Shape) -> Result<Shape> {
    let same_layout = lhs.width() == rhs.width() && lhs.height() == rhs.height() && lhs.depth() == rhs.depth();
    let (a, b) = (lhs.batch(), rhs.batch());
    if same_layout && (a == b || a == 1 || b == 1) {
        Ok(lhs.with_batch(a.max(b)))
    } else {
        Err(Error::IncompatibleShapes { op, lhs, rhs })
    }
}

fn same_shape(op: &'static str, lhs: Shape, rhs: Shape) -> Result<Shape> {
    if lhs == rhs && lhs.batch() == rhs.batch() {
        Ok(lhs)
    } else {
        Err(Error::IncompatibleShapes { op, lhs, rhs })
    }
}

fn matmul_shape(lhs: Shape, rhs: Shape) -> Result<Shape> {
    let (a, b) = (lhs.batch(), rhs.batch());
    if lhs.width() != rhs.height() || lhs.depth() != rhs.depth() || !(a == b || a == 1 || b == 1) {
        return Err(Error::IncompatibleShapes {
            op: "matmul",
            lhs,
            rhs,
        });
    }
    Ok(Shape::new(rhs.width(), lhs.height(), lhs.depth(), a.max(b)))
}

fn conv_window(input: Shape, kernels: Shape, stride: usize, padding: PaddingType) -> Result<Window> {
    if kernels.depth() != input.depth() {
        return Err(Error::IncompatibleShapes {
            op: "conv2d",
            lhs: input,
            rhs: kernels,
        });
    }
    Window::new(input, kernels.width(), kernels.height(), stride, padding)
}

fn conv_output_shape(input: Shape, kernels: Shape, window: &Window) -> Shape {
    Shape::new(window.out_w, window.out_h, kernels.batch(), input.batch())
}

fn pool_output_shape(input: Shape, window: &Window) -> Shape {
    Shape::new(window.out_w, window.out_h, input.depth(), input.batch())
}

impl Tensor {
    /// `self + other`; a batch-1 operand is replicated across the other's batches.
    ///
    /// # Errors
    ///
    /// [`Error::IncompatibleShapes`] unless the per-batch layouts match and the
    /// batches are equal or one of them is 1.
    pub fn add(&self, ctx: &Context, other: &Self) -> Result<Self> {
        self.add_scaled(ctx, 1.0, other, 1.0)
    }

    /// # Errors
    ///
    /// See [`Tensor::add`]; also [`Error::ShapeMismatch`] for a wrong result shape.
    pub fn add_into(&self, ctx: &Context, other: &Self, result: &mut Self) -> Result<()> {
        self.add_scaled_into(ctx, 1.0, other, 1.0, result)
    }

    /// `alpha * self + beta * other` with the same broadcast as [`Tensor::add`].
    ///
    /// # Errors
    ///
    /// See [`Tensor::add`].
    pub fn add_scaled(&self, ctx: &Context, alpha: f32, other: &Self, beta: f32) -> Result<Self> {
        let mut result = Self::zeros(broadcast_shape("add", self.shape, other.shape)?);
        self.add_scaled_into(ctx, alpha, other, beta, &mut result)?;
        Ok(result)
    }

    /// # Errors
    ///
    /// See [`Tensor::add_into`].
    pub fn add_scaled_into(&self, ctx: &Context, alpha: f32, other: &Self, beta: f32, result: &mut Self) -> Result<()> {
        expect_shape("add", broadcast_shape("add", self.shape, other.shape)?, result.shape)?;
        if result.is_empty() {
            return Ok(());
        }
        let d = ctx.dispatch(Op::Add);
        let (a, b) = (d.operand(self)?, d.operand(other)?);
        d.output(result);
        d.kernels().add(&a, alpha, &b, beta, result)
    }

    /// `self - other` with the same broadcast as [`Tensor::add`].
    ///
    /// # Errors
    ///
    /// See [`Tensor::add`].
    pub fn sub(&self, ctx: &Context, other: &Self) -> Result<Self> {
        let mut result = Self::zeros(broadcast_shape("sub", self.shape, other.shape)?);
        self.sub_into(ctx, other, &mut result)?;
        Ok(result)
    }

    /// # Errors
    ///
    /// See [`Tensor::add_into`].
    pub fn sub_into(&self, ctx: &Context, other: &Self, result: &mut Self) -> Result<()> {
        expect_shape("sub", broadcast_shape("sub", self.shape, other.shape)?, result.shape)?;
        if result.is_empty() {
            return Ok(());
        }
        let d = ctx.dispatch(Op::Sub);
        let (a, b) = (d.operand(self)?, d.operand(other)?);
        d.output(result);
        d.kernels().sub(&a, &b, result)
    }

    /// Elementwise product of two tensors of equal shape.
    ///
    /// # Errors
    ///
    /// [`Error::IncompatibleShapes`] if the shapes differ.
    pub fn mul_elementwise(&self, ctx: &Context, other: &Self) -> Result<Self> {
        let mut result = Self::zeros(same_shape("mul_elementwise", self.shape, other.shape)?);
        self.mul_elementwise_into(ctx, other, &mut result)?;
        Ok(result)
    }

    /// # Errors
    ///
    /// See [`Tensor::mul_elementwise`].
    pub fn mul_elementwise_into(&self, ctx: &Context, other: &Self, result: &mut Self) -> Result<()> {
        expect_shape(
            "mul_elementwise",
            same_shape("mul_elementwise", self.shape, other.shape)?,
            result.shape,
        )?;
        if result.is_empty() {
            return Ok(());
        }
        let d = ctx.dispatch(Op::MulElementwise);
        let (a, b) = (d.operand(self)?, d.operand(other)?);
        d.output(result);
        d.kernels().mul_elementwise(&a, &b, result)
    }

    /// Elementwise quotient of two tensors of equal shape.
    ///
    /// # Errors
    ///
    /// [`Error::IncompatibleShapes`] if the shapes differ.
    pub fn div(&self, ctx: &Context, other: &Self) -> Result<Self> {
        let mut result = Self::zeros(same_shape("div", self.shape, other.shape)?);
        self.div_into(ctx, other, &mut result)?;
        Ok(result)
    }

    /// # Errors
    ///
    /// See [`Tensor::div`].
    pub fn div_into(&self, ctx: &Context, other: &Self, result: &mut Self) -> Result<()> {
        expect_shape("div", same_shape("div", self.shape, other.shape)?, result.shape)?;
        if result.is_empty() {
            return Ok(());
        }
        let d = ctx.dispatch(Op::Div);
        let (a, b) = (d.operand(self)?, d.operand(other)?);
        d.output(result);
        d.kernels().div(&a, &b, result)
    }

    /// Writes `f(v)` for every element into `result`, which must have `self`'s
    /// shape. Runs on the host.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] for a wrong result shape; device readback failures.
    pub fn map_into(&self, f: impl Fn(f32) -> f32, result: &mut Self) -> Result<()> {
        expect_shape("map", self.shape, result.shape)?;
        let src = self.host_view()?;
        for (o, &v) in result.overwrite().iter_mut().zip(src.values()) {
            *o = f(v);
        }
        Ok(())
    }

    /// [`Tensor::add_scalar`] into `result`.
    ///
    /// # Errors
    ///
    /// See [`Tensor::map_into`].
    pub fn add_scalar_into(&self, scalar: f32, result: &mut Self) -> Result<()> {
        self.map_into(|v| v + scalar, result)
    }

    /// [`Tensor::sub_scalar`] into `result`.
    ///
    /// # Errors
    ///
    /// See [`Tensor::map_into`].
    pub fn sub_scalar_into(&self, scalar: f32, result: &mut Self) -> Result<()> {
        self.map_into(|v| v - scalar, result)
    }

    /// [`Tensor::mul_scalar`] into `result`.
    ///
    /// # Errors
    ///
    /// See [`Tensor::map_into`].
    pub fn mul_scalar_into(&self, scalar: f32, result: &mut Self) -> Result<()> {
        self.map_into(|v| v * scalar, result)
    }

    /// [`Tensor::div_scalar`] into `result`.
    ///
    /// # Errors
    ///
    /// See [`Tensor::map_into`].
    pub fn div_scalar_into(&self, scalar: f32, result: &mut Self) -> Result<()> {
        self.map_into(|v| v / scalar, result)
    }

    /// Matrix product of every (depth, batch) slot, each a `height × width` matrix.
    ///
    /// Requires `self.width == other.height` and equal depths. Batches must be
    /// equal, or one side has batch 1 and is shared by every slot of the
    /// other. The result has shape `(other.width, self.height, depth, max batch)`.
    ///
    /// # Errors
    ///
    /// [`Error::IncompatibleShapes`] when the operands cannot be multiplied.
    pub fn matmul(&self, ctx: &Context, other: &Self) -> Result<Self> {
        let mut result = Self::zeros(matmul_shape(self.shape, other.shape)?);
        self.matmul_into(ctx, other, &mut result)?;
        Ok(result)
    }

    /// # Errors
    ///
    /// See [`Tensor::matmul`]; also [`Error::ShapeMismatch`] for a wrong result shape.
    pub fn matmul_into(&self, ctx: &Context, other: &Self, result: &mut Self) -> Result<()> {
        expect_shape("matmul", matmul_shape(self.shape, other.shape)?, result.shape)?;
        if result.is_empty() {
            return Ok(());
        }
        let d = ctx.dispatch(Op::MatMul);
        let (a, b) = (d.operand(self)?, d.operand(other)?);
        d.output(result);
        d.kernels().matmul(&a, &b, result)
    }

    /// Swaps width and height of every (depth, batch) slice.
    ///
    /// # Errors
    ///
    /// Only backend failures.
    pub fn transposed(&self, ctx: &Context) -> Result<Self> {
        let s = self.shape;
        let mut result = Self::zeros(Shape::new(s.height(), s.width(), s.depth(), s.batch()));
        self.transpose_into(ctx, &mut result)?;
        Ok(result)
    }

    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] unless `result` is `(height, width, depth, batch)`.
    pub fn transpose_into(&self, ctx: &Context, result: &mut Self) -> Result<()> {
        let s = self.shape;
        expect_shape(
            "transpose",
            Shape::new(s.height(), s.width(), s.depth(), s.batch()),
            result.shape,
        )?;
        if result.is_empty() {
            return Ok(());
        }
        let d = ctx.dispatch(Op::Transpose);
        let input = d.operand(self)?;
        d.output(result);
        d.kernels().transpose(&input, result)
    }

    /// 2-D correlation of `self` with `kernels` (no kernel flip).
    ///
    /// `kernels` has shape `(kW, kH, self.depth, outputChannels)`; the result
    /// has shape `(outW, outH, outputChannels, self.batch)` with the output
    /// extent given by `padding`. Out-of-bounds input reads are 0.
    ///
    /// # Errors
    ///
    /// - [`Error::IncompatibleShapes`] when the kernel depth differs from the input depth
    /// - [`Error::InvalidWindow`] for stride 0 or an oversized `Valid` kernel
    pub fn conv2d(&self, ctx: &Context, kernels: &Self, stride: usize, padding: PaddingType) -> Result<Self> {
        let window = conv_window(self.shape, kernels.shape, stride, padding)?;
        let mut result = Self::zeros(conv_output_shape(self.shape, kernels.shape, &window));
        self.conv2d_into(ctx, kernels, stride, padding, &mut result)?;
        Ok(result)
    }

    /// # Errors
    ///
    /// See [`Tensor::conv2d`]; also [`Error::ShapeMismatch`] for a wrong result shape.
    pub fn conv2d_into(
        &self,
        ctx: &Context,
        kernels: &Self,
        stride: usize,
        padding: PaddingType,
        result: &mut Self,
    ) -> Result<()> {
        let window = conv_window(self.shape, kernels.shape, stride, padding)?;
        expect_shape(
            "conv2d",
            conv_output_shape(self.shape, kernels.shape, &window),
            result.shape,
        )?;
        if result.is_empty() {
            return Ok(());
        }
        let d = ctx.dispatch(Op::Conv2D);
        let (input, kernels) = (d.operand(self)?, d.operand(kernels)?);
        d.output(result);
        d.kernels().conv2d(&input, &kernels, &window, result)
    }

    /// Gradient of [`Tensor::conv2d`] with respect to its input.
    ///
    /// `self` is the gradient of the convolution output; `input_shape`,
    /// `stride` and `padding` describe the forward call. The result has
    /// `input_shape`.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] when `self` is not the forward output shape;
    /// window errors as in [`Tensor::conv2d`].
    pub fn conv2d_input_gradient(
        &self,
        ctx: &Context,
        kernels: &Self,
        input_shape: impl Into<Shape>,
        stride: usize,
        padding: PaddingType,
    ) -> Result<Self> {
        let mut result = Self::zeros(input_shape);
        self.conv2d_input_gradient_into(ctx, kernels, stride, padding, &mut result)?;
        Ok(result)
    }

    /// Writes the input gradient into `result`, which must have the forward
    /// input's shape. `result` is fully overwritten.
    ///
    /// # Errors
    ///
    /// See [`Tensor::conv2d_input_gradient`].
    pub fn conv2d_input_gradient_into(
        &self,
        ctx: &Context,
        kernels: &Self,
        stride: usize,
        padding: PaddingType,
        result: &mut Self,
    ) -> Result<()> {
        let window = conv_window(result.shape, kernels.shape, stride, padding)?;
        expect_shape(
            "conv2d_input_gradient",
            conv_output_shape(result.shape, kernels.shape, &window),
            self.shape,
        )?;
        if result.is_empty() {
            return Ok(());
        }
        let d = ctx.dispatch(Op::Conv2DInputGradient);
        let (gradient, kernels) = (d.operand(self)?, d.operand(kernels)?);
        d.output(result);
        d.kernels().conv2d_input_gradient(&gradient, &kernels, &window, result)
    }

    /// Gradient of [`Tensor::conv2d`] with respect to its kernels.
    ///
    /// `self` is the forward input and `output_gradient` the gradient of the
    /// convolution output. The result has `kernels_shape`, i.e.
    /// `(kW, kH, self.depth, outputChannels)`.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] when `output_gradient` is not the forward
    /// output shape; window errors as in [`Tensor::conv2d`].
    pub fn conv2d_kernels_gradient(
        &self,
        ctx: &Context,
        output_gradient: &Self,
        kernels_shape: impl Into<Shape>,
        stride: usize,
        padding: PaddingType,
    ) -> Result<Self> {
        let mut result = Self::zeros(kernels_shape);
        self.conv2d_kernels_gradient_into(ctx, output_gradient, stride, padding, &mut result)?;
        Ok(result)
    }

    /// Writes the kernels gradient into `result`, which must have the kernels'
    /// shape. `result` is fully overwritten, not accumulated into.
    ///
    /// # Errors
    ///
    /// See [`Tensor::conv2d_kernels_gradient`].
    pub fn conv2d_kernels_gradient_into(
        &self,
        ctx: &Context,
        output_gradient: &Self,
        stride: usize,
        padding: PaddingType,
        result: &mut Self,
    ) -> Result<()> {
        let window = conv_window(self.shape, result.shape, stride, padding)?;
        expect_shape(
            "conv2d_kernels_gradient",
            conv_output_shape(self.shape, result.shape, &window),
            output_gradient.shape,
        )?;
        if result.is_empty() {
            return Ok(());
        }
        let d = ctx.dispatch(Op::Conv2DKernelsGradient);
        let (input, gradient) = (d.operand(self)?, d.operand(output_gradient)?);
        d.output(result);
        d.kernels().conv2d_kernels_gradient(&input, &gradient, &window, result)
    }

    /// Square-window pooling over every (depth, batch) plane.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidWindow`] for stride 0, filter 0 or an oversized `Valid` filter.
    pub fn pool(&self, ctx: &Context, filter: usize, stride: usize, kind: PoolType, padding: PaddingType) -> Result<Self> {
        let window = Window::new(self.shape, filter, filter, stride, padding)?;
        let mut result = Self::zeros(pool_output_shape(self.shape, &window));
        self.pool_into(ctx, filter, stride, kind, padding, &mut result)?;
        Ok(result)
    }

    /// # Errors
    ///
    /// See [`Tensor::pool`]; also [`Error::ShapeMismatch`] for a wrong result shape.
    pub fn pool_into(
        &self,
        ctx: &Context,
        filter: usize,
        stride: usize,
        kind: PoolType,
        padding: PaddingType,
        result: &mut Self,
    ) -> Result<()> {
        let window = Window::new(self.shape, filter, filter, stride, padding)?;
        expect_shape("pool", pool_output_shape(self.shape, &window), result.shape)?;
        if result.is_empty() {
            return Ok(());
        }
        let d = ctx.dispatch(Op::Pool);
        let input = d.operand(self)?;
        d.output(result);
        d.kernels().pool(&input, &window, kind, result)
    }

    /// Gradient of [`Tensor::pool`] with respect to its input.
    ///
    /// `self` is the forward input, `output` the forward result and
    /// `output_gradient` its gradient. Max pooling routes each window's
    /// gradient to every position equal to the recorded maximum; average
    /// pooling spreads it evenly. Overlapping windows accumulate.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] when `output` or `output_gradient` is not the
    /// forward output shape; window errors as in [`Tensor::pool`].
    #[allow(clippy::too_many_arguments)]
    pub fn pool_gradient(
        &self,
        ctx: &Context,
        output: &Self,
        output_gradient: &Self,
        filter: usize,
        stride: usize,
        kind: PoolType,
        padding: PaddingType,
    ) -> Result<Self> {
        let mut result = Self::zeros(self.shape);
        self.pool_gradient_into(ctx, output, output_gradient, filter, stride, kind, padding, &mut result)?;
        Ok(result)
    }

    /// Writes the pooling gradient into `result` (the input's shape). `result`
    /// is zeroed before accumulation.
    ///
    /// # Errors
    ///
    /// See [`Tensor::pool_gradient`].
    #[allow(clippy::too_many_arguments)]
    pub fn pool_gradient_into(
        &self,
        ctx: &Context,
        output: &Self,
        output_gradient: &Self,
        filter: usize,
        stride: usize,
        kind: PoolType,
        padding: PaddingType,
        result: &mut Self,
    ) -> Result<()> {
        let window = Window::new(self.shape, filter, filter, stride, padding)?;
        let pooled = pool_output_shape(self.shape, &window);
        expect_shape("pool_gradient", pooled, output.shape)?;
        expect_shape("pool_gradient", pooled, output_gradient.shape)?;
        expect_shape("pool_gradient", self.shape, result.shape)?;
        if result.is_empty() {
            return Ok(());
        }
        let d = ctx.dispatch(Op::PoolGradient);
        let (input, output, gradient) = (d.operand(self)?, d.operand(output)?, d.operand(output_gradient)?);
        d.output(result);
        d.kernels()
            .pool_gradient(&input, &output, &gradient, &window, kind, result)
    }
}
