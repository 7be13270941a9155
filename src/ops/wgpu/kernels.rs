use super::{gpu, Gpu, GpuFailure, Params, Shader};
use crate::backend::Backend;
use crate::error::Result;
use crate::ops::{Kernels, PoolType};
use crate::padding::Window;
use crate::tensor::Tensor;

/// Compute-shader kernels on the process-wide GPU.
///
/// Operands are uploaded when their host copy is authoritative; results stay
/// on the device until read back.
#[derive(Debug, Clone, Copy)]
pub struct GpuKernels {
    gpu: &'static Gpu,
}

impl GpuKernels {
    /// Acquires the GPU, initializing it on first use.
    ///
    /// # Errors
    ///
    /// Fails if no adapter or device is available.
    pub fn new() -> std::result::Result<Self, GpuFailure> {
        Ok(Self { gpu: gpu()? })
    }

    fn launch(&self, shader: Shader, params: Params, inputs: &[&Tensor], out: &mut Tensor) -> Result<()> {
        let buffers = inputs
            .iter()
            .map(|t| t.device_input())
            .collect::<Result<Vec<_>>>()?;
        let dst = out.device_output()?;
        self.gpu.run(shader, &params, &buffers, &dst, out.len())?;
        out.mark_device_written();
        Ok(())
    }
}

fn window_params(params: Params, window: &Window) -> Params {
    params
        .u(window.kernel_w)
        .u(window.kernel_h)
        .u(window.out_w)
        .u(window.out_h)
        .u(window.stride)
        .u(window.pad_x)
        .u(window.pad_y)
}

fn pool_kind(kind: PoolType) -> usize {
    match kind {
        PoolType::Max => 0,
        PoolType::Avg => 1,
    }
}

impl Kernels for GpuKernels {
    fn backend(&self) -> Backend {
        Backend::Gpu
    }

    fn add(&self, a: &Tensor, alpha: f32, b: &Tensor, beta: f32, out: &mut Tensor) -> Result<()> {
        let params = Params::new()
            .u(out.len())
            .u(a.len())
            .u(b.len())
            .f(alpha)
            .f(beta);
        self.launch(Shader::Add, params, &[a, b], out)
    }

    fn matmul(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        let (sa, sb) = (a.shape(), b.shape());
        let params = Params::new()
            .u(out.len())
            .u(sa.width())
            .u(sa.height())
            .u(sb.width())
            .u(sa.depth())
            .u(sa.batch())
            .u(sb.batch());
        self.launch(Shader::MatMul, params, &[a, b], out)
    }

    fn transpose(&self, input: &Tensor, out: &mut Tensor) -> Result<()> {
        let s = input.shape();
        let params = Params::new().u(out.len()).u(s.width()).u(s.height());
        self.launch(Shader::Transpose, params, &[input], out)
    }

    fn conv2d(&self, input: &Tensor, kernels: &Tensor, window: &Window, out: &mut Tensor) -> Result<()> {
        let s = input.shape();
        let params = Params::new()
            .u(out.len())
            .u(s.width())
            .u(s.height())
            .u(s.depth())
            .u(kernels.shape().batch());
        self.launch(Shader::Conv2D, window_params(params, window), &[input, kernels], out)
    }

    fn conv2d_input_gradient(
        &self,
        output_gradient: &Tensor,
        kernels: &Tensor,
        window: &Window,
        out: &mut Tensor,
    ) -> Result<()> {
        let rotated = kernels.host_view()?.rotated180();
        let s = out.shape();
        let params = Params::new()
            .u(out.len())
            .u(s.width())
            .u(s.height())
            .u(s.depth())
            .u(kernels.shape().batch());
        self.launch(
            Shader::Conv2DInputGradient,
            window_params(params, window),
            &[output_gradient, &rotated],
            out,
        )
    }

    fn conv2d_kernels_gradient(
        &self,
        input: &Tensor,
        output_gradient: &Tensor,
        window: &Window,
        out: &mut Tensor,
    ) -> Result<()> {
        let s = input.shape();
        let params = Params::new()
            .u(out.len())
            .u(s.width())
            .u(s.height())
            .u(s.depth())
            .u(out.shape().batch())
            .u(s.batch());
        self.launch(
            Shader::Conv2DKernelsGradient,
            window_params(params, window),
            &[input, output_gradient],
            out,
        )
    }

    fn pool(&self, input: &Tensor, window: &Window, kind: PoolType, out: &mut Tensor) -> Result<()> {
        let s = input.shape();
        let params = Params::new()
            .u(out.len())
            .u(s.width())
            .u(s.height())
            .u(pool_kind(kind));
        self.launch(Shader::Pool, window_params(params, window), &[input], out)
    }

    fn pool_gradient(
        &self,
        input: &Tensor,
        output: &Tensor,
        output_gradient: &Tensor,
        window: &Window,
        kind: PoolType,
        out: &mut Tensor,
    ) -> Result<()> {
        let s = input.shape();
        let params = Params::new()
            .u(out.len())
            .u(s.width())
            .u(s.height())
            .u(pool_kind(kind));
        self.launch(
            Shader::PoolGradient,
            window_params(params, window),
            &[input, output, output_gradient],
            out,
        )
    }
}
