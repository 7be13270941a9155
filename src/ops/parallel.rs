//! Data-parallel CPU backend.
//!
//! Every kernel splits its output into disjoint partitions and hands them to
//! [`rayon`](https://docs.rs/rayon); each task writes only its own partition,
//! so no locking is needed and results are identical to the reference
//! backend's. Partitioning:
//!
//! - elementwise: contiguous chunks of the flat index range
//! - matmul: output rows
//! - transpose, conv2d, conv2d input gradient, pool, pool gradient: output
//!   planes (channel × batch)
//! - conv2d kernels gradient: one whole kernel (output channel) per task
//!
//! Work runs on the global rayon pool unless the kernels were built with a
//! dedicated one (see [`ContextBuilder::threads`](super::dispatch::ContextBuilder::threads)).

use super::cpu;
use super::{Kernels, PoolType};
use crate::backend::Backend;
use crate::error::Result;
use crate::padding::Window;
use crate::tensor::Tensor;
use rayon::prelude::*;
use rayon::ThreadPool;
use std::sync::Arc;

/// Elements per task for elementwise kernels.
const CHUNK: usize = 4096;

/// `rayon`-backed kernels.
#[derive(Debug, Clone, Default)]
pub struct ParallelKernels {
    pool: Option<Arc<ThreadPool>>,
}

impl ParallelKernels {
    /// Kernels running on the global rayon pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Kernels running on a dedicated pool.
    #[must_use]
    pub fn with_pool(pool: Arc<ThreadPool>) -> Self {
        Self { pool: Some(pool) }
    }

    /// Number of worker threads kernels will fan out to.
    #[must_use]
    pub fn threads(&self) -> usize {
        self.pool
            .as_ref()
            .map_or_else(rayon::current_num_threads, |pool| pool.current_num_threads())
    }

    fn install<R: Send>(&self, f: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(f),
            None => f(),
        }
    }
}

impl Kernels for ParallelKernels {
    fn backend(&self) -> Backend {
        Backend::MultiCpu
    }

    fn add(&self, a: &Tensor, alpha: f32, b: &Tensor, beta: f32, out: &mut Tensor) -> Result<()> {
        let (a, b) = (a.values(), b.values());
        self.install(|| {
            out.values_mut()
                .par_chunks_mut(CHUNK)
                .enumerate()
                .for_each(|(i, chunk)| cpu::add_range(a, alpha, b, beta, i * CHUNK, chunk));
        });
        Ok(())
    }

    fn sub(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        let (a, b) = (a.values(), b.values());
        self.install(|| {
            out.values_mut()
                .par_chunks_mut(CHUNK)
                .enumerate()
                .for_each(|(i, chunk)| cpu::add_range(a, 1.0, b, -1.0, i * CHUNK, chunk));
        });
        Ok(())
    }

    fn mul_elementwise(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        let (a, b) = (a.values(), b.values());
        self.install(|| {
            out.values_mut()
                .par_chunks_mut(CHUNK)
                .enumerate()
                .for_each(|(i, chunk)| cpu::zip_range(a, b, i * CHUNK, chunk, |x, y| x * y));
        });
        Ok(())
    }

    fn div(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        let (a, b) = (a.values(), b.values());
        self.install(|| {
            out.values_mut()
                .par_chunks_mut(CHUNK)
                .enumerate()
                .for_each(|(i, chunk)| cpu::zip_range(a, b, i * CHUNK, chunk, |x, y| x / y));
        });
        Ok(())
    }

    fn matmul(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        let row_len = out.shape().width();
        let (sa, sb) = (a.shape(), b.shape());
        let (a, b) = (a.values(), b.values());
        self.install(|| {
            out.values_mut()
                .par_chunks_mut(row_len)
                .enumerate()
                .for_each(|(row, chunk)| cpu::matmul_row(a, sa, b, sb, row, chunk));
        });
        Ok(())
    }

    fn transpose(&self, input: &Tensor, out: &mut Tensor) -> Result<()> {
        let shape = input.shape();
        let input = input.values();
        self.install(|| {
            out.values_mut()
                .par_chunks_mut(shape.plane_len())
                .enumerate()
                .for_each(|(plane, chunk)| cpu::transpose_plane(input, shape, plane, chunk));
        });
        Ok(())
    }

    fn conv2d(&self, input: &Tensor, kernels: &Tensor, window: &Window, out: &mut Tensor) -> Result<()> {
        let plane_len = out.shape().plane_len();
        let (si, sk) = (input.shape(), kernels.shape());
        let (input, kernels) = (input.values(), kernels.values());
        self.install(|| {
            out.values_mut()
                .par_chunks_mut(plane_len)
                .enumerate()
                .for_each(|(plane, chunk)| cpu::conv2d_plane(input, si, kernels, sk, window, plane, chunk));
        });
        Ok(())
    }

    fn conv2d_input_gradient(
        &self,
        output_gradient: &Tensor,
        kernels: &Tensor,
        window: &Window,
        out: &mut Tensor,
    ) -> Result<()> {
        let rotated = kernels.rotated180();
        let si = out.shape();
        let (sg, sk) = (output_gradient.shape(), rotated.shape());
        let (gradient, rotated) = (output_gradient.values(), rotated.values());
        self.install(|| {
            out.values_mut()
                .par_chunks_mut(si.plane_len())
                .enumerate()
                .for_each(|(plane, chunk)| {
                    cpu::conv2d_input_gradient_plane(gradient, sg, rotated, sk, si, window, plane, chunk);
                });
        });
        Ok(())
    }

    fn conv2d_kernels_gradient(
        &self,
        input: &Tensor,
        output_gradient: &Tensor,
        window: &Window,
        out: &mut Tensor,
    ) -> Result<()> {
        let kernel_len = out.shape().batch_len();
        let (si, sg) = (input.shape(), output_gradient.shape());
        let (input, gradient) = (input.values(), output_gradient.values());
        self.install(|| {
            out.values_mut()
                .par_chunks_mut(kernel_len)
                .enumerate()
                .for_each(|(channel, chunk)| {
                    cpu::conv2d_kernels_gradient_channel(input, si, gradient, sg, window, channel, chunk);
                });
        });
        Ok(())
    }

    fn pool(&self, input: &Tensor, window: &Window, kind: PoolType, out: &mut Tensor) -> Result<()> {
        let plane_len = out.shape().plane_len();
        let shape = input.shape();
        let input = input.values();
        self.install(|| {
            out.values_mut()
                .par_chunks_mut(plane_len)
                .enumerate()
                .for_each(|(plane, chunk)| cpu::pool_plane(input, shape, window, kind, plane, chunk));
        });
        Ok(())
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
        let (si, so) = (input.shape(), output.shape());
        let (input, output, gradient) = (input.values(), output.values(), output_gradient.values());
        self.install(|| {
            out.values_mut()
                .par_chunks_mut(si.plane_len())
                .enumerate()
                .for_each(|(plane, chunk)| {
                    cpu::pool_gradient_plane(input, si, output, gradient, so, window, kind, plane, chunk);
                });
        });
        Ok(())
    }
}
