//! Backend selection and the per-backend operation table.
//!
//! This module defines the available computation backends and, for each of
//! them, exactly which kernels it implements directly. Anything a backend
//! does not implement is served by the next backend in its fallback chain:
//!
//! ```text
//! Gpu ──▶ MultiCpu ──▶ Cpu
//! ```
//!
//! # Supported Backends
//!
//! - `Cpu`: single-threaded reference kernels (default). Defines the
//!   semantics every other backend must reproduce.
//! - `MultiCpu`: data-parallel kernels on a `rayon` thread pool.
//! - `Gpu`: `wgpu` compute shaders (requires the `wgpu` feature).
//!
//! The active backend is not process-wide state: it is carried by an
//! explicit [`Context`](crate::Context) value.

use core::convert::TryFrom;
use core::fmt;
use core::str::FromStr;

/// Enumeration of supported computation backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Backend {
    /// Single-threaded reference kernels (default).
    #[default]
    Cpu = 0,
    /// Data-parallel CPU kernels.
    MultiCpu,
    /// GPU kernels using `wgpu`.
    Gpu,
}

impl TryFrom<u8> for Backend {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Cpu),
            1 => Ok(Self::MultiCpu),
            2 => Ok(Self::Gpu),
            _ => Err(()),
        }
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "multicpu" | "multi_cpu" | "multi-cpu" | "parallel" => Ok(Self::MultiCpu),
            "gpu" | "wgpu" => Ok(Self::Gpu),
            other => Err(format!("unknown backend `{other}`")),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cpu => "cpu",
            Self::MultiCpu => "multi-cpu",
            Self::Gpu => "gpu",
        })
    }
}

/// Kernels routed through a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Add,
    Sub,
    MulElementwise,
    Div,
    MatMul,
    Transpose,
    Conv2D,
    Conv2DInputGradient,
    Conv2DKernelsGradient,
    Pool,
    PoolGradient,
}

impl Op {
    /// Every backend-routed operation.
    pub const ALL: [Self; 11] = [
        Self::Add,
        Self::Sub,
        Self::MulElementwise,
        Self::Div,
        Self::MatMul,
        Self::Transpose,
        Self::Conv2D,
        Self::Conv2DInputGradient,
        Self::Conv2DKernelsGradient,
        Self::Pool,
        Self::PoolGradient,
    ];
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::MulElementwise => "mul_elementwise",
            Self::Div => "div",
            Self::MatMul => "matmul",
            Self::Transpose => "transpose",
            Self::Conv2D => "conv2d",
            Self::Conv2DInputGradient => "conv2d_input_gradient",
            Self::Conv2DKernelsGradient => "conv2d_kernels_gradient",
            Self::Pool => "pool",
            Self::PoolGradient => "pool_gradient",
        })
    }
}

/// Operations the GPU backend implements itself; the rest come from `MultiCpu`.
const GPU_OPS: &[Op] = &[
    Op::MatMul,
    Op::Add,
    Op::Transpose,
    Op::Conv2D,
    Op::Conv2DInputGradient,
    Op::Conv2DKernelsGradient,
    Op::Pool,
    Op::PoolGradient,
];

impl Backend {
    /// Operations this backend implements directly.
    #[must_use]
    pub const fn direct_ops(self) -> &'static [Op] {
        match self {
            Self::Cpu | Self::MultiCpu => &Op::ALL,
            Self::Gpu => GPU_OPS,
        }
    }

    /// Whether `op` runs on this backend's own kernels.
    #[must_use]
    pub fn implements(self, op: Op) -> bool {
        self.direct_ops().contains(&op)
    }

    /// Backend that serves operations this one does not implement.
    #[must_use]
    pub const fn fallback(self) -> Option<Self> {
        match self {
            Self::Cpu => None,
            Self::MultiCpu => Some(Self::Cpu),
            Self::Gpu => Some(Self::MultiCpu),
        }
    }

    /// The backend that will actually execute `op` when `self` is active.
    #[must_use]
    pub fn resolve(self, op: Op) -> Self {
        let mut backend = self;
        while !backend.implements(op) {
            match backend.fallback() {
                Some(next) => backend = next,
                None => break,
            }
        }
        backend
    }

    /// Whether this backend's kernels operate on device memory.
    #[must_use]
    pub const fn is_device(self) -> bool {
        matches!(self, Self::Gpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_falls_back_to_parallel_cpu() {
        assert_eq!(Backend::Gpu.resolve(Op::MatMul), Backend::Gpu);
        assert_eq!(Backend::Gpu.resolve(Op::Sub), Backend::MultiCpu);
        assert_eq!(Backend::Gpu.resolve(Op::Div), Backend::MultiCpu);
        assert_eq!(Backend::MultiCpu.resolve(Op::Sub), Backend::MultiCpu);
        assert_eq!(Backend::Cpu.resolve(Op::PoolGradient), Backend::Cpu);
    }

    #[test]
    fn cpu_backends_implement_everything() {
        for op in Op::ALL {
            assert!(Backend::Cpu.implements(op));
            assert!(Backend::MultiCpu.implements(op));
        }
    }

    #[test]
    fn parses_and_round_trips_names() {
        for b in [Backend::Cpu, Backend::MultiCpu, Backend::Gpu] {
            assert_eq!(b.to_string().parse::<Backend>().unwrap(), b);
            assert_eq!(Backend::try_from(b as u8).unwrap(), b);
        }
        assert!("tpu".parse::<Backend>().is_err());
        assert!(Backend::try_from(7).is_err());
    }
}
