//! Execution context.
//!
//! A [`Context`] names the active backend and owns the chain of kernel
//! implementations its operations are served from. It is passed explicitly to
//! every backend-routed `Tensor` operation, replacing a process-wide backend
//! switch: two contexts on different backends can be used side by side.
//!
//! For each operation the context walks its chain, which mirrors the
//! fallback table in [`crate::backend`], and runs the first backend listing
//! the operation among its direct ops:
//!
//! ```text
//! Gpu ──▶ MultiCpu ──▶ Cpu
//! ```
//!
//! # Example
//! ```rust
//! use neurite::{Backend, Context, Tensor};
//!
//! let ctx = Context::new(Backend::MultiCpu)?;
//! let a = Tensor::filled((4, 4), 1.0);
//! let b = a.add(&ctx, &a)?;
//! assert!(b.values().iter().all(|&v| v == 2.0));
//! # Ok::<(), neurite::Error>(())
//! ```

use super::cpu::CpuKernels;
use super::parallel::ParallelKernels;
use super::Kernels;
use crate::backend::{Backend, Op};
use crate::error::Result;
use crate::tensor::Tensor;
use log::{debug, trace};
use std::borrow::Cow;
use std::sync::Arc;

/// Explicit execution context selecting the backend for tensor operations.
///
/// Cheap to clone; clones share their kernels (and thread pool, if any).
#[derive(Debug, Clone)]
pub struct Context {
    backend: Backend,
    chain: Vec<Arc<dyn Kernels>>,
}

impl Context {
    /// Creates a context for `backend` with default settings.
    ///
    /// # Errors
    ///
    /// - [`Error::BackendUnavailable`](crate::Error::BackendUnavailable) for
    ///   `Gpu` when the crate was built without the `wgpu` feature
    /// - [`Error::Gpu`](crate::Error) when no adapter or device can be acquired
    pub fn new(backend: Backend) -> Result<Self> {
        ContextBuilder::new(backend).build()
    }

    /// Reference single-threaded context. Infallible.
    #[must_use]
    pub fn cpu() -> Self {
        Self::from_chain(Backend::Cpu, vec![Arc::new(CpuKernels)])
    }

    /// Data-parallel context on the global rayon pool. Infallible.
    #[must_use]
    pub fn parallel() -> Self {
        Self::from_chain(
            Backend::MultiCpu,
            vec![Arc::new(ParallelKernels::new()), Arc::new(CpuKernels)],
        )
    }

    fn from_chain(backend: Backend, chain: Vec<Arc<dyn Kernels>>) -> Self {
        debug!(
            "created {backend} context (chain: {})",
            chain
                .iter()
                .map(|k| k.backend().to_string())
                .collect::<Vec<_>>()
                .join(" -> ")
        );
        Self { backend, chain }
    }

    /// The backend this context was created for.
    #[must_use]
    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// The kernels that will execute `op`.
    #[must_use]
    pub fn kernels_for(&self, op: Op) -> &dyn Kernels {
        let kernels = self
            .chain
            .iter()
            .find(|k| k.backend().implements(op))
            .unwrap_or_else(|| &self.chain[self.chain.len() - 1]);
        if kernels.backend() != self.backend {
            trace!("{op}: {} falls back to {}", self.backend, kernels.backend());
        }
        kernels.as_ref()
    }

    pub(crate) fn dispatch(&self, op: Op) -> Dispatch<'_> {
        let kernels = self.kernels_for(op);
        trace!("dispatching {op} to {}", kernels.backend());
        Dispatch { kernels }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::cpu()
    }
}

/// Builder for [`Context`] with optional runtime configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextBuilder {
    backend: Backend,
    threads: Option<usize>,
}

impl ContextBuilder {
    #[must_use]
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            threads: None,
        }
    }

    /// Runs parallel kernels on a dedicated pool of `threads` workers instead
    /// of the global rayon pool. `0` lets rayon pick.
    #[must_use]
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Builds the context.
    ///
    /// # Errors
    ///
    /// See [`Context::new`]; also fails if the dedicated pool cannot be built.
    pub fn build(self) -> Result<Context> {
        let parallel = || -> Result<ParallelKernels> {
            Ok(match self.threads {
                Some(threads) => {
                    let pool = rayon::ThreadPoolBuilder::new()
                        .num_threads(threads)
                        .thread_name(|i| format!("neurite-worker-{i}"))
                        .build()?;
                    debug!("built dedicated pool with {} threads", pool.current_num_threads());
                    ParallelKernels::with_pool(Arc::new(pool))
                }
                None => ParallelKernels::new(),
            })
        };

        match self.backend {
            Backend::Cpu => Ok(Context::cpu()),
            Backend::MultiCpu => Ok(Context::from_chain(
                Backend::MultiCpu,
                vec![Arc::new(parallel()?), Arc::new(CpuKernels)],
            )),
            #[cfg(feature = "wgpu")]
            Backend::Gpu => {
                let gpu = super::wgpu::GpuKernels::new()?;
                Ok(Context::from_chain(
                    Backend::Gpu,
                    vec![Arc::new(gpu), Arc::new(parallel()?), Arc::new(CpuKernels)],
                ))
            }
            #[cfg(not(feature = "wgpu"))]
            Backend::Gpu => Err(crate::Error::BackendUnavailable(Backend::Gpu)),
        }
    }
}

/// One routed kernel call: the chosen kernels plus operand preparation.
pub(crate) struct Dispatch<'c> {
    kernels: &'c dyn Kernels,
}

impl<'c> Dispatch<'c> {
    pub(crate) fn kernels(&self) -> &'c dyn Kernels {
        self.kernels
    }

    /// Makes `tensor` readable by the chosen kernels.
    ///
    /// Device kernels take operands as they are. Host kernels need the host
    /// copy, which is read back into a temporary when the tensor is
    /// device-resident.
    pub(crate) fn operand<'t>(&self, tensor: &'t Tensor) -> Result<Cow<'t, Tensor>> {
        if self.kernels.backend().is_device() {
            Ok(Cow::Borrowed(tensor))
        } else {
            tensor.host_view()
        }
    }

    /// Prepares `result` to be fully overwritten by the chosen kernels.
    pub(crate) fn output(&self, result: &mut Tensor) {
        if !self.kernels.backend().is_device() {
            result.claim_host();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_every_op_to_the_active_backend_on_cpu() {
        let ctx = Context::parallel();
        for op in Op::ALL {
            assert_eq!(ctx.kernels_for(op).backend(), Backend::MultiCpu);
        }
        assert_eq!(Context::default().backend(), Backend::Cpu);
    }

    #[test]
    fn dedicated_pool_honours_thread_count() {
        let ctx = ContextBuilder::new(Backend::MultiCpu).threads(2).build().unwrap();
        assert_eq!(ctx.backend(), Backend::MultiCpu);
    }

    #[cfg(not(feature = "wgpu"))]
    #[test]
    fn gpu_is_unavailable_without_feature() {
        assert!(matches!(
            Context::new(Backend::Gpu),
            Err(crate::Error::BackendUnavailable(Backend::Gpu))
        ));
    }
}
