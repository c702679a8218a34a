//! Backend seam between the frame loop and a GPU implementation
//!
//! The frame pacing, upload and orchestration code is generic over these two
//! traits:
//! - [`GpuDevice`] creates and drives synchronization primitives and buffers
//! - [`PresentationSurface`] owns the swapchain-dependent resources and talks
//!   to the presentation engine
//!
//! `runners::ash` and `graphics` implement them on top of Vulkan;
//! `runners::headless` implements them in-process for tests.

use crate::error::CrateResult;
use std::fmt::Debug;
use std::time::Duration;

/// How long a host-side fence wait may block
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Timeout {
    /// Block until the fence signals, however long that takes
    #[default]
    Infinite,
    /// Give up after the given duration
    After(Duration),
}

impl Timeout {
    /// Timeout in nanoseconds, `u64::MAX` meaning "forever"
    pub fn as_nanos(self) -> u64 {
        match self {
            Timeout::Infinite => u64::MAX,
            Timeout::After(d) => u64::try_from(d.as_nanos()).unwrap_or(u64::MAX),
        }
    }
}

/// What a buffer is used for, which decides its memory placement
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BufferRole {
    /// Host-visible, coherent, transfer source
    Staging,
    /// Device-local vertex buffer, transfer destination
    Vertex,
}

/// Width and height of a framebuffer in pixels
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// A minimised window reports a zero-area framebuffer
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Result of asking the presentation engine for the next image
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Acquire {
    /// An image was acquired; its semaphore will be signalled. `suboptimal`
    /// means the surface no longer matches the swapchain exactly.
    Ready { image_index: u32, suboptimal: bool },
    /// The swapchain is stale and must be rebuilt; nothing was acquired.
    OutOfDate,
}

/// Result of queueing an image for presentation
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PresentStatus {
    Presented,
    /// Presented, but the swapchain should be rebuilt
    Suboptimal,
    /// Not presented; the swapchain must be rebuilt
    OutOfDate,
}

impl PresentStatus {
    pub fn is_stale(self) -> bool {
        !matches!(self, PresentStatus::Presented)
    }
}

/// Everything the presentation layer needs to record and submit one frame
#[derive(Debug)]
pub struct DrawSubmission<D: GpuDevice> {
    /// Frame slot being recorded, selects the command buffer
    pub slot: usize,
    pub image_index: u32,
    /// Persistent particle buffer, absent when there is nothing to draw
    pub vertex_buffer: Option<D::Buffer>,
    pub vertex_count: u32,
    /// Signalled by the acquire; the submission waits on it
    pub wait_semaphore: D::Semaphore,
    /// Signalled by the submission; present waits on it
    pub signal_semaphore: D::Semaphore,
    /// Signalled when the submitted work completes
    pub fence: D::Fence,
}

/// Device-level operations used by frame pacing and buffer uploads.
///
/// Implementations are cheap handles (`Clone` shares the underlying device),
/// so RAII wrappers in [`crate::resources`] can keep one to destroy their
/// handle on drop.
pub trait GpuDevice: Clone {
    type Fence: Copy + Debug + PartialEq;
    type Semaphore: Copy + Debug + PartialEq;
    type Buffer: Copy + Debug + PartialEq;

    fn create_fence(&self, signaled: bool) -> CrateResult<Self::Fence>;
    /// Wait for the fence. Returns `Ok(false)` if the timeout expired first.
    fn wait_for_fence(&self, fence: Self::Fence, timeout: Timeout) -> CrateResult<bool>;
    fn reset_fence(&self, fence: Self::Fence) -> CrateResult<()>;
    fn fence_signaled(&self, fence: Self::Fence) -> CrateResult<bool>;
    fn destroy_fence(&self, fence: Self::Fence);

    fn create_semaphore(&self) -> CrateResult<Self::Semaphore>;
    fn destroy_semaphore(&self, semaphore: Self::Semaphore);

    fn create_buffer(&self, size: u64, role: BufferRole) -> CrateResult<Self::Buffer>;
    /// Copy `bytes` into the start of a host-visible buffer
    fn write_buffer(&self, buffer: Self::Buffer, bytes: &[u8]) -> CrateResult<()>;
    /// Record a one-shot copy, submit it, and block until the queue is idle
    fn copy_buffer(&self, src: Self::Buffer, dst: Self::Buffer, size: u64) -> CrateResult<()>;
    fn destroy_buffer(&self, buffer: Self::Buffer);

    fn wait_idle(&self) -> CrateResult<()>;
    fn device_name(&self) -> String;
}

/// The swapchain side of the frame loop.
///
/// Implementors own the swapchain, its image views, the depth buffer and the
/// framebuffers, and rebuild all of them together.
pub trait PresentationSurface {
    type Device: GpuDevice;

    /// Current size of the window's framebuffer (not of the swapchain)
    fn framebuffer_extent(&self) -> Extent;

    fn acquire_next_image(
        &mut self,
        image_acquired: <Self::Device as GpuDevice>::Semaphore,
    ) -> CrateResult<Acquire>;

    fn record_and_submit(&mut self, submission: DrawSubmission<Self::Device>) -> CrateResult<()>;

    fn present(
        &mut self,
        image_index: u32,
        render_finished: <Self::Device as GpuDevice>::Semaphore,
    ) -> CrateResult<PresentStatus>;

    /// Rebuild every swapchain-dependent resource for the current framebuffer
    /// extent. Callers guarantee the device is idle.
    fn rebuild(&mut self) -> CrateResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_nanos() {
        assert_eq!(Timeout::Infinite.as_nanos(), u64::MAX);
        assert_eq!(Timeout::After(Duration::from_millis(3)).as_nanos(), 3_000_000);
        assert_eq!(Timeout::After(Duration::MAX).as_nanos(), u64::MAX);
    }

    #[test]
    fn zero_area_extent_is_empty() {
        assert!(Extent::new(0, 600).is_empty());
        assert!(Extent::new(800, 0).is_empty());
        assert!(!Extent::new(800, 600).is_empty());
    }

    #[test]
    fn only_plain_present_is_fresh() {
        assert!(!PresentStatus::Presented.is_stale());
        assert!(PresentStatus::Suboptimal.is_stale());
        assert!(PresentStatus::OutOfDate.is_stale());
    }
}
