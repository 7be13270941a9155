//! Host/device residency.
//!
//! With the `wgpu` feature every tensor may own one device buffer mirroring
//! its host values. A per-tensor flag records which copy is authoritative:
//!
//! - `Host`: host values are current; the device buffer is absent or stale.
//! - `Device`: a GPU kernel wrote the buffer; host values are stale.
//! - `Synced`: both copies hold the same values.
//!
//! Host writes mark `Host`. GPU kernels upload `Host` operands before use and
//! mark their results `Device`. Nothing is read back implicitly except when a
//! host kernel receives a device-resident operand, which reads it into a
//! temporary and logs a warning.
//!
//! Without the `wgpu` feature every tensor is permanently `Host`.

use super::Tensor;
use crate::error::Result;
use std::borrow::Cow;

/// Which copy of a tensor's values is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Residency {
    #[default]
    Host,
    Device,
    Synced,
}

#[cfg(feature = "wgpu")]
pub(crate) use mirror::DeviceMirror;

#[cfg(feature = "wgpu")]
mod mirror {
    use super::Residency;
    use crate::ops::wgpu::gpu;
    use std::sync::{Mutex, MutexGuard, PoisonError};

    #[derive(Default)]
    pub(crate) struct MirrorState {
        pub(crate) buffer: Option<wgpu::Buffer>,
        pub(crate) residency: Residency,
    }

    /// Lazily created device copy of a tensor's values.
    ///
    /// Uploads happen through `&Tensor` (an operand may be read by many
    /// kernels), so the state sits behind a mutex.
    #[derive(Default)]
    pub(crate) struct DeviceMirror {
        state: Mutex<MirrorState>,
    }

    impl DeviceMirror {
        pub(crate) fn lock(&self) -> MutexGuard<'_, MirrorState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        pub(crate) fn get_mut(&mut self) -> &mut MirrorState {
            self.state.get_mut().unwrap_or_else(PoisonError::into_inner)
        }

        pub(crate) fn residency(&self) -> Residency {
            self.lock().residency
        }

        /// Copy for a cloned tensor; device data is copied on the device.
        pub(crate) fn duplicate(&self, len: usize) -> Self {
            let state = self.lock();
            let copied = match (&state.buffer, state.residency) {
                (Some(buffer), Residency::Device) => gpu().ok().map(|gpu| MirrorState {
                    buffer: Some(gpu.duplicate(buffer, len)),
                    residency: Residency::Device,
                }),
                _ => None,
            };
            Self {
                state: Mutex::new(copied.unwrap_or_default()),
            }
        }
    }
}

impl Tensor {
    /// Which copy of the values is authoritative.
    #[must_use]
    pub fn residency(&self) -> Residency {
        #[cfg(feature = "wgpu")]
        {
            self.mirror.residency()
        }
        #[cfg(not(feature = "wgpu"))]
        {
            Residency::Host
        }
    }

    pub(crate) fn assert_host_readable(&self) {
        assert!(
            self.residency() != Residency::Device,
            "tensor {} is device-resident; call sync_to_host() before reading host values",
            self.shape
        );
    }

    /// Marks the host copy authoritative without reading the device copy back.
    ///
    /// Only valid when the caller is about to overwrite every element.
    pub(crate) fn claim_host(&mut self) {
        #[cfg(feature = "wgpu")]
        {
            self.mirror.get_mut().residency = Residency::Host;
        }
    }

    /// Host values to be fully overwritten.
    pub(crate) fn overwrite(&mut self) -> &mut [f32] {
        self.claim_host();
        &mut self.values
    }

    /// Reads device-resident values back into host memory.
    ///
    /// # Errors
    ///
    /// Fails when the device readback fails.
    pub fn sync_to_host(&mut self) -> Result<()> {
        #[cfg(feature = "wgpu")]
        {
            let len = self.shape.len();
            let state = self.mirror.get_mut();
            if state.residency == Residency::Device {
                if let Some(buffer) = &state.buffer {
                    let values = gpu()?.download(buffer, len)?;
                    self.values.copy_from_slice(&values);
                }
                state.residency = Residency::Synced;
            }
        }
        Ok(())
    }

    /// Uploads host values to the device if the device copy is missing or stale.
    ///
    /// Without the `wgpu` feature this is a no-op.
    ///
    /// # Errors
    ///
    /// Fails when no GPU is available.
    pub fn sync_to_device(&self) -> Result<()> {
        #[cfg(feature = "wgpu")]
        {
            self.device_input()?;
        }
        Ok(())
    }

    /// The tensor with host-readable values, reading a device-resident tensor
    /// back into a temporary copy.
    pub(crate) fn host_view(&self) -> Result<Cow<'_, Tensor>> {
        #[cfg(feature = "wgpu")]
        {
            let state = self.mirror.lock();
            if state.residency == Residency::Device {
                if let Some(buffer) = &state.buffer {
                    log::warn!(
                        "implicit device readback of {} tensor for a host kernel",
                        self.shape
                    );
                    let values = gpu()?.download(buffer, self.shape.len())?;
                    return Ok(Cow::Owned(Tensor::from_parts(self.shape, values)));
                }
            }
        }
        Ok(Cow::Borrowed(self))
    }
}

#[cfg(feature = "wgpu")]
use crate::ops::wgpu::gpu;

#[cfg(feature = "wgpu")]
impl Tensor {
    /// Device buffer holding current values, uploading them if needed.
    pub(crate) fn device_input(&self) -> Result<wgpu::Buffer> {
        let mut state = self.mirror.lock();
        if state.residency != Residency::Host {
            if let Some(buffer) = &state.buffer {
                return Ok(buffer.clone());
            }
        }
        let gpu = gpu()?;
        let buffer = state
            .buffer
            .get_or_insert_with(|| gpu.create_storage(self.shape.len()))
            .clone();
        gpu.upload(&buffer, &self.values);
        state.residency = Residency::Synced;
        Ok(buffer)
    }

    /// Device buffer a kernel may overwrite completely.
    ///
    /// Call [`Tensor::mark_device_written`] after the kernel is submitted.
    pub(crate) fn device_output(&mut self) -> Result<wgpu::Buffer> {
        let len = self.shape.len();
        let state = self.mirror.get_mut();
        if let Some(buffer) = &state.buffer {
            return Ok(buffer.clone());
        }
        let buffer = gpu()?.create_storage(len);
        state.buffer = Some(buffer.clone());
        Ok(buffer)
    }

    pub(crate) fn mark_device_written(&mut self) {
        self.mirror.get_mut().residency = Residency::Device;
    }
}
