//! Owning wrappers around device handles
//!
//! Each wrapper owns exactly one handle and destroys it when dropped. They are
//! not `Clone`.

use crate::{
    error::{CrateResult, ParticlesError},
    gpu::{BufferRole, GpuDevice, Timeout},
};

/// CPU-observable completion signal
pub struct Fence<D: GpuDevice> {
    device: D,
    handle: D::Fence,
}

impl<D: GpuDevice> Fence<D> {
    pub fn new(device: &D, signaled: bool) -> CrateResult<Self> {
        let handle = device.create_fence(signaled)?;
        Ok(Self {
            device: device.clone(),
            handle,
        })
    }

    pub fn handle(&self) -> D::Fence {
        self.handle
    }

    pub fn wait(&self, timeout: Timeout) -> CrateResult<bool> {
        self.device.wait_for_fence(self.handle, timeout)
    }

    pub fn reset(&self) -> CrateResult<()> {
        self.device.reset_fence(self.handle)
    }

    pub fn is_signaled(&self) -> CrateResult<bool> {
        self.device.fence_signaled(self.handle)
    }
}

impl<D: GpuDevice> Drop for Fence<D> {
    fn drop(&mut self) {
        self.device.destroy_fence(self.handle);
    }
}

/// GPU-side ordering signal
pub struct Semaphore<D: GpuDevice> {
    device: D,
    handle: D::Semaphore,
}

impl<D: GpuDevice> Semaphore<D> {
    pub fn new(device: &D) -> CrateResult<Self> {
        let handle = device.create_semaphore()?;
        Ok(Self {
            device: device.clone(),
            handle,
        })
    }

    pub fn handle(&self) -> D::Semaphore {
        self.handle
    }
}

impl<D: GpuDevice> Drop for Semaphore<D> {
    fn drop(&mut self) {
        self.device.destroy_semaphore(self.handle);
    }
}

/// A buffer together with its memory, tagged with its byte size
pub struct DeviceBuffer<D: GpuDevice> {
    device: D,
    handle: D::Buffer,
    size: u64,
    role: BufferRole,
}

impl<D: GpuDevice> DeviceBuffer<D> {
    pub fn new(device: &D, size: u64, role: BufferRole) -> CrateResult<Self> {
        let handle = device.create_buffer(size, role)?;
        Ok(Self {
            device: device.clone(),
            handle,
            size,
            role,
        })
    }

    pub fn handle(&self) -> D::Buffer {
        self.handle
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn role(&self) -> BufferRole {
        self.role
    }

    /// Fill the buffer from host memory. Only staging buffers are host-visible.
    pub fn write(&self, bytes: &[u8]) -> CrateResult<()> {
        let len = bytes.len() as u64;
        if len > self.size {
            return Err(ParticlesError::BufferOverflow {
                len,
                size: self.size,
            });
        }
        self.device.write_buffer(self.handle, bytes)
    }
}

impl<D: GpuDevice> Drop for DeviceBuffer<D> {
    fn drop(&mut self) {
        self.device.destroy_buffer(self.handle);
    }
}

impl<D: GpuDevice> std::fmt::Debug for DeviceBuffer<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("role", &self.role)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runners::headless::HeadlessDevice;

    #[test]
    fn handles_are_destroyed_on_drop() {
        let device = HeadlessDevice::new();
        {
            let _fence = Fence::new(&device, true).unwrap();
            let _semaphore = Semaphore::new(&device).unwrap();
            let _buffer = DeviceBuffer::new(&device, 64, BufferRole::Vertex).unwrap();
            let live = device.live();
            assert_eq!((live.fences, live.semaphores, live.vertex_buffers), (1, 1, 1));
        }
        assert!(device.live().is_empty());
    }

    #[test]
    fn oversized_write_is_rejected_before_reaching_the_device() {
        let device = HeadlessDevice::new();
        let staging = DeviceBuffer::new(&device, 4, BufferRole::Staging).unwrap();
        let err = staging.write(&[0u8; 8]).unwrap_err();
        assert!(matches!(err, ParticlesError::BufferOverflow { len: 8, size: 4 }));
        assert_eq!(device.buffer_contents(staging.handle()).unwrap(), vec![0u8; 4]);
    }
}
