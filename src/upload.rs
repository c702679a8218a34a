//! Host to device particle upload
//!
//! Every upload goes through a transient staging buffer: create, fill, copy
//! into the persistent device-local vertex buffer, destroy. The copy blocks
//! until the queue is idle, so when `upload` returns the persistent buffer
//! holds exactly the snapshot.

use crate::{
    error::CrateResult,
    gpu::{BufferRole, GpuDevice},
    resources::DeviceBuffer,
};
use shared::Particle;
use tracing::{debug, trace};

/// Counters describing what the channel has done so far
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct UploadStats {
    /// Successful uploads
    pub uploads: u64,
    /// Persistent buffer (re)allocations
    pub allocations: u64,
    /// Staging buffers created
    pub staging_allocations: u64,
}

pub struct UploadChannel<D: GpuDevice> {
    device: D,
    current: Option<DeviceBuffer<D>>,
    vertex_count: u32,
    stats: UploadStats,
}

impl<D: GpuDevice> UploadChannel<D> {
    pub fn new(device: &D) -> Self {
        Self {
            device: device.clone(),
            current: None,
            vertex_count: 0,
            stats: UploadStats::default(),
        }
    }

    /// Make `snapshot` the contents of the persistent vertex buffer.
    ///
    /// When the byte size changes the persistent buffer is replaced, but the
    /// replacement only becomes current after it has been filled; on any
    /// failure the previous buffer stays current and untouched.
    pub fn upload(&mut self, snapshot: &[Particle]) -> CrateResult<()> {
        if snapshot.is_empty() {
            return self.release();
        }
        let bytes: &[u8] = bytemuck::cast_slice(snapshot);
        let size = bytes.len() as u64;

        let staging = DeviceBuffer::new(&self.device, size, BufferRole::Staging)?;
        self.stats.staging_allocations += 1;
        staging.write(bytes)?;

        match self.current.as_ref() {
            Some(current) if current.size() == size => {
                self.device.copy_buffer(staging.handle(), current.handle(), size)?;
            }
            _ => {
                let replacement = DeviceBuffer::new(&self.device, size, BufferRole::Vertex)?;
                self.device
                    .copy_buffer(staging.handle(), replacement.handle(), size)?;
                // The copy waited for the queue to go idle, so the old buffer
                // is no longer referenced by any in-flight frame.
                let previous = self.current.replace(replacement);
                self.stats.allocations += 1;
                debug!(
                    previous = previous.as_ref().map(|b| b.size()),
                    size, "recreated particle vertex buffer"
                );
            }
        }

        self.vertex_count = snapshot.len() as u32;
        self.stats.uploads += 1;
        trace!(size, "uploaded particle snapshot");
        Ok(())
    }

    /// Drop the persistent buffer once the device no longer uses it
    pub fn release(&mut self) -> CrateResult<()> {
        if self.current.is_some() {
            self.device.wait_idle()?;
            self.current = None;
            debug!("released particle vertex buffer");
        }
        self.vertex_count = 0;
        Ok(())
    }

    pub fn buffer(&self) -> Option<&DeviceBuffer<D>> {
        self.current.as_ref()
    }

    /// Number of particles the persistent buffer holds
    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn stats(&self) -> UploadStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runners::headless::{HeadlessDevice, HeadlessOp};
    use glam::Vec2;

    fn snapshot(count: usize, seed: f32) -> Vec<Particle> {
        (0..count)
            .map(|i| {
                Particle::new(
                    Vec2::new(seed + i as f32, 10.0),
                    Vec2::new(1.0, -1.0),
                    [0.5, 0.5, 0.5, 1.0],
                    2.0,
                )
            })
            .collect()
    }

    fn device_bytes(device: &HeadlessDevice, channel: &UploadChannel<HeadlessDevice>) -> Vec<u8> {
        device
            .buffer_contents(channel.buffer().unwrap().handle())
            .unwrap()
    }

    #[test]
    fn same_size_reuses_the_persistent_buffer() {
        let device = HeadlessDevice::new();
        let mut channel = UploadChannel::new(&device);
        channel.upload(&snapshot(3, 0.0)).unwrap();
        let first = channel.buffer().unwrap().handle();

        let next = snapshot(3, 5.0);
        channel.upload(&next).unwrap();
        assert_eq!(channel.buffer().unwrap().handle(), first);
        assert_eq!(channel.stats().allocations, 1);
        assert_eq!(device.counters().vertex_allocations, 1);
        assert_eq!(device_bytes(&device, &channel), bytemuck::cast_slice(&next));
    }

    #[test]
    fn new_size_reallocates_exactly_once() {
        let device = HeadlessDevice::new();
        let mut channel = UploadChannel::new(&device);
        channel.upload(&snapshot(3, 0.0)).unwrap();
        channel.upload(&snapshot(5, 0.0)).unwrap();
        channel.upload(&snapshot(5, 1.0)).unwrap();

        assert_eq!(channel.stats().allocations, 2);
        assert_eq!(channel.vertex_count(), 5);
        assert_eq!(channel.buffer().unwrap().size(), 5 * Particle::STRIDE as u64);
        // The old buffer is gone, only one persistent buffer is alive.
        assert_eq!(device.live().vertex_buffers, 1);
    }

    #[test]
    fn staging_buffers_are_transient() {
        let device = HeadlessDevice::new();
        let mut channel = UploadChannel::new(&device);
        for i in 0..4 {
            channel.upload(&snapshot(2, i as f32)).unwrap();
            assert_eq!(device.live().staging_buffers, 0);
        }
        assert_eq!(channel.stats().staging_allocations, 4);
        assert_eq!(device.counters().copies, 4);
    }

    #[test]
    fn failed_resize_leaves_previous_buffer_current() {
        let device = HeadlessDevice::new();
        let mut channel = UploadChannel::new(&device);
        let original = snapshot(3, 0.0);
        channel.upload(&original).unwrap();
        let handle = channel.buffer().unwrap().handle();

        device.fail_on(HeadlessOp::CopyBuffer, 1);
        assert!(channel.upload(&snapshot(4, 9.0)).is_err());

        assert_eq!(channel.buffer().unwrap().handle(), handle);
        assert_eq!(channel.vertex_count(), 3);
        assert_eq!(device_bytes(&device, &channel), bytemuck::cast_slice(&original));
        let live = device.live();
        assert_eq!((live.staging_buffers, live.vertex_buffers), (0, 1));

        device.fail_on(HeadlessOp::CreateVertexBuffer, 1);
        assert!(channel.upload(&snapshot(4, 9.0)).is_err());
        assert_eq!(channel.buffer().unwrap().handle(), handle);

        device.fail_on(HeadlessOp::WriteBuffer, 1);
        assert!(channel.upload(&snapshot(3, 9.0)).is_err());
        assert_eq!(device_bytes(&device, &channel), bytemuck::cast_slice(&original));
        assert_eq!(device.live().staging_buffers, 0);
    }

    #[test]
    fn empty_snapshot_releases_the_buffer() {
        let device = HeadlessDevice::new();
        let mut channel = UploadChannel::new(&device);
        channel.upload(&snapshot(3, 0.0)).unwrap();
        channel.upload(&[]).unwrap();
        assert!(channel.buffer().is_none());
        assert_eq!(channel.vertex_count(), 0);
        assert!(device.live().is_empty());
    }
}
