//! `wgpu` compute backend.
//!
//! This module implements compute kernels on the GPU using WGPU + WGSL. It
//! handles device initialization, shader precompilation (via `lazy_static`),
//! buffer transfer and compute dispatch for:
//!
//! - `add`: scaled elementwise sum with batch broadcast
//! - `matmul`: per-slot matrix multiplication
//! - `transpose`
//! - `conv2d`, `conv2d_input_gradient`, `conv2d_kernels_gradient`
//! - `pool`, `pool_gradient`
//!
//! Every shader invocation owns exactly one output element; gradients are
//! written as gathers so no two invocations ever write the same location.
//!
//! The device, queue and pipelines are created once per process on first use,
//! like a driver handle. Tensor values live in per-tensor device mirrors (see
//! [`Residency`](crate::Residency)) and are only read back on request.

mod kernels;

pub use kernels::GpuKernels;

use briny::prelude::*;
use log::{debug, trace};
use std::sync::mpsc;
use wgpu::util::DeviceExt;

/// Invocations per workgroup; must match `@workgroup_size` in every shader.
const WORKGROUP_SIZE: u32 = 64;

/// Per-dimension workgroup limit guaranteed by `wgpu::Limits::default()`.
const MAX_GROUPS_PER_DIM: u32 = 65_535;

/// Adapter or device acquisition failure.
#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    #[error("no suitable adapter: {0}")]
    Adapter(#[from] wgpu::RequestAdapterError),
    #[error("device request failed: {0}")]
    Device(#[from] wgpu::RequestDeviceError),
}

/// Fatal failure of the GPU backend. Never retried.
#[derive(Debug, thiserror::Error)]
pub enum GpuFailure {
    #[error(transparent)]
    Gpu(#[from] GpuError),
    /// A shader source was rejected before compilation.
    #[error("shader `{0}` failed validation")]
    Validation(String),
    #[error("device poll failed: {0}")]
    Poll(#[from] wgpu::PollError),
    #[error("buffer mapping failed: {0}")]
    Map(#[from] wgpu::BufferAsyncError),
    /// Initialization failed earlier in the process; the GPU stays unusable.
    #[error("GPU unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Dispatch(String),
}

/// Compute shaders, one per GPU-implemented operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Shader {
    Add,
    MatMul,
    Transpose,
    Conv2D,
    Conv2DInputGradient,
    Conv2DKernelsGradient,
    Pool,
    PoolGradient,
}

impl Shader {
    const ALL: [Self; 8] = [
        Self::Add,
        Self::MatMul,
        Self::Transpose,
        Self::Conv2D,
        Self::Conv2DInputGradient,
        Self::Conv2DKernelsGradient,
        Self::Pool,
        Self::PoolGradient,
    ];

    fn label(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::MatMul => "matmul",
            Self::Transpose => "transpose",
            Self::Conv2D => "conv2d",
            Self::Conv2DInputGradient => "conv2d_input_grad",
            Self::Conv2DKernelsGradient => "conv2d_kernels_grad",
            Self::Pool => "pool",
            Self::PoolGradient => "pool_grad",
        }
    }

    fn source(self) -> &'static str {
        match self {
            Self::Add => include_str!("shaders/add.wgsl"),
            Self::MatMul => include_str!("shaders/matmul.wgsl"),
            Self::Transpose => include_str!("shaders/transpose.wgsl"),
            Self::Conv2D => include_str!("shaders/conv2d.wgsl"),
            Self::Conv2DInputGradient => include_str!("shaders/conv2d_input_grad.wgsl"),
            Self::Conv2DKernelsGradient => include_str!("shaders/conv2d_kernels_grad.wgsl"),
            Self::Pool => include_str!("shaders/pool.wgsl"),
            Self::PoolGradient => include_str!("shaders/pool_grad.wgsl"),
        }
    }

    /// Number of read-only storage inputs (bindings `1..=inputs`).
    fn inputs(self) -> u32 {
        match self {
            Self::Transpose | Self::Pool => 1,
            Self::PoolGradient => 3,
            _ => 2,
        }
    }
}

/// Upper bound on bundled shader size.
const MAX_SHADER_BYTES: usize = 64 * 1024;

/// Tokens no bundled shader may contain.
const FORBIDDEN_TOKENS: [&str; 6] = ["asm", "unsafe", "ptr", "std::", "import", "#include"];

/// WGSL source checked before it reaches the driver.
///
/// Accepts only single-file compute shaders with a `main` entry point.
pub struct WgslSource<'a>(pub &'a str);

impl Validate for WgslSource<'_> {
    fn validate(&self) -> Result<(), ValidationError> {
        let src = self.0;
        let well_formed = src.len() <= MAX_SHADER_BYTES
            && src.contains("fn main")
            && !FORBIDDEN_TOKENS.iter().any(|token| src.contains(token));
        if well_formed {
            Ok(())
        } else {
            Err(ValidationError)
        }
    }
}

/// Validates a WGSL shader and compiles it on `device`.
///
/// # Errors
///
/// [`GpuFailure::Validation`] if the source does not pass [`WgslSource`] checks.
pub fn load_shader(device: &wgpu::Device, label: &str, source: &str) -> Result<wgpu::ShaderModule, GpuFailure> {
    WgslSource(source)
        .validate()
        .map_err(|_| GpuFailure::Validation(label.to_owned()))?;

    Ok(device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    }))
}

struct Pipeline {
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

fn buffer_entry(binding: u32, ty: wgpu::BufferBindingType) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl Pipeline {
    /// Layout: binding 0 uniform parameters, then the read-only inputs, then
    /// the read-write output.
    fn new(device: &wgpu::Device, shader: Shader) -> Result<Self, GpuFailure> {
        let label = shader.label();
        let module = load_shader(device, label, shader.source())?;

        let inputs = shader.inputs();
        let mut entries = vec![buffer_entry(0, wgpu::BufferBindingType::Uniform)];
        entries.extend((1..=inputs).map(|b| buffer_entry(b, wgpu::BufferBindingType::Storage { read_only: true })));
        entries.push(buffer_entry(
            inputs + 1,
            wgpu::BufferBindingType::Storage { read_only: false },
        ));

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(&format!("{label}_bgl")),
            entries: &entries,
        });
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(&format!("{label}_pipeline_layout")),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(&format!("{label}_pipeline")),
            layout: Some(&layout),
            module: &module,
            entry_point: Some("main"),
            cache: None,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        });

        Ok(Self {
            bind_group_layout,
            pipeline,
        })
    }
}

/// Uniform parameter block, sixteen 32-bit words filled in declaration order
/// of the shader's `Params` struct.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Params {
    words: [u32; 16],
    used: usize,
}

impl Params {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends an unsigned word.
    pub(crate) fn u(mut self, value: usize) -> Self {
        self.words[self.used] = value as u32;
        self.used += 1;
        self
    }

    /// Appends a float word.
    pub(crate) fn f(mut self, value: f32) -> Self {
        self.words[self.used] = value.to_bits();
        self.used += 1;
        self
    }
}

/// Process-wide device handle: adapter, queue and one pipeline per [`Shader`].
pub struct Gpu {
    device: wgpu::Device,
    queue: wgpu::Queue,
    info: wgpu::AdapterInfo,
    pipelines: Vec<Pipeline>,
}

impl std::fmt::Debug for Gpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gpu")
            .field("adapter", &self.info.name)
            .field("backend", &self.info.backend)
            .finish_non_exhaustive()
    }
}

lazy_static::lazy_static! {
    static ref GPU: Result<Gpu, String> = Gpu::new().map_err(|e| e.to_string());
}

/// The process-wide GPU, initializing it on first use.
///
/// # Errors
///
/// Fails (every time) if no adapter or device could be acquired.
pub fn gpu() -> Result<&'static Gpu, GpuFailure> {
    GPU.as_ref().map_err(|msg| GpuFailure::Unavailable(msg.clone()))
}

impl Gpu {
    /// Selects the default adapter, creates a device + queue and compiles
    /// every pipeline.
    ///
    /// Uses `pollster::block_on` to wait synchronously for the async WGPU
    /// calls.
    ///
    /// # Errors
    ///
    /// Adapter or device acquisition failure, or a shader failing validation.
    pub fn new() -> Result<Self, GpuFailure> {
        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
            .map_err(GpuError::from)?;
        let info = adapter.get_info();
        debug!("selected GPU adapter {} ({:?})", info.name, info.backend);

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("neurite"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .map_err(GpuError::from)?;

        let pipelines = Shader::ALL
            .iter()
            .map(|&shader| Pipeline::new(&device, shader))
            .collect::<Result<Vec<_>, _>>()?;
        debug!("compiled {} compute pipelines", pipelines.len());

        Ok(Self {
            device,
            queue,
            info,
            pipelines,
        })
    }

    fn pipeline(&self, shader: Shader) -> &Pipeline {
        &self.pipelines[shader as usize]
    }

    /// Storage buffer for `len` floats. Never zero-sized so it can always be bound.
    pub(crate) fn create_storage(&self, len: usize) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("tensor"),
            size: (len.max(1) * 4) as u64,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    pub(crate) fn upload(&self, buffer: &wgpu::Buffer, values: &[f32]) {
        if values.is_empty() {
            return;
        }
        trace!("uploading {} values", values.len());
        self.queue.write_buffer(buffer, 0, bytemuck::cast_slice(values));
    }

    /// Blocks until the first `len` floats of `buffer` are readable on the host.
    ///
    /// # Errors
    ///
    /// Device poll or buffer mapping failure.
    pub(crate) fn download(&self, buffer: &wgpu::Buffer, len: usize) -> Result<Vec<f32>, GpuFailure> {
        if len == 0 {
            return Ok(Vec::new());
        }
        trace!("reading back {len} values");
        let size = (len * 4) as u64;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("readback") });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::PollType::Wait)?;
        rx.recv()
            .map_err(|_| GpuFailure::Dispatch("buffer mapping was abandoned".to_owned()))??;

        let values = {
            let data = slice.get_mapped_range();
            data.chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect()
        };
        staging.unmap();
        Ok(values)
    }

    /// Device-side copy of the first `len` floats of `buffer`.
    pub(crate) fn duplicate(&self, buffer: &wgpu::Buffer, len: usize) -> wgpu::Buffer {
        let copy = self.create_storage(len);
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("duplicate") });
        encoder.copy_buffer_to_buffer(buffer, 0, &copy, 0, (len.max(1) * 4) as u64);
        self.queue.submit(Some(encoder.finish()));
        copy
    }

    /// Records and submits one dispatch of `shader` covering `invocations`
    /// output elements. Does not wait for completion.
    ///
    /// # Errors
    ///
    /// Fails if the dispatch exceeds the device's workgroup grid.
    pub(crate) fn run(
        &self,
        shader: Shader,
        params: &Params,
        inputs: &[wgpu::Buffer],
        output: &wgpu::Buffer,
        invocations: usize,
    ) -> Result<(), GpuFailure> {
        debug_assert_eq!(inputs.len() as u32, shader.inputs());
        let groups = u32::try_from(invocations.div_ceil(WORKGROUP_SIZE as usize))
            .map_err(|_| GpuFailure::Dispatch(format!("{invocations} invocations exceed the dispatch grid")))?;
        let x = groups.clamp(1, MAX_GROUPS_PER_DIM);
        let y = groups.div_ceil(x);
        if y > MAX_GROUPS_PER_DIM {
            return Err(GpuFailure::Dispatch(format!(
                "{invocations} invocations exceed the dispatch grid"
            )));
        }

        let pipeline = self.pipeline(shader);
        let uniform = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("params"),
            contents: bytemuck::cast_slice(&params.words),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: uniform.as_entire_binding(),
        }];
        for (i, buffer) in inputs.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: i as u32 + 1,
                resource: buffer.as_entire_binding(),
            });
        }
        entries.push(wgpu::BindGroupEntry {
            binding: inputs.len() as u32 + 1,
            resource: output.as_entire_binding(),
        });

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(shader.label()),
            layout: &pipeline.bind_group_layout,
            entries: &entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(shader.label()) });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(shader.label()),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(x, y, 1);
        }
        self.queue.submit(Some(encoder.finish()));
        trace!("submitted {} over {x}x{y} workgroups", shader.label());
        Ok(())
    }
}
