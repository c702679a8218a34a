//! The per-frame sequence
//!
//! wait fence -> acquire image -> upload -> reset fence -> record and submit
//! -> present -> advance.
//!
//! A stale swapchain discovered at acquire abandons the frame before anything
//! is submitted; one discovered at present is rebuilt after the frame was
//! queued. Either way at most one rebuild happens per frame.

use crate::{
    error::CrateResult,
    frame_sync::FrameSync,
    gpu::{Acquire, DrawSubmission, GpuDevice, PresentStatus, PresentationSurface, Timeout},
    upload::{UploadChannel, UploadStats},
};
use shared::Particle;
use tracing::{debug, info, trace, warn};

/// Where in the frame the swapchain was found stale
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StaleStage {
    Acquire,
    Present,
}

/// What happened to one call of [`FrameOrchestrator::draw_frame`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame reached the screen. `rebuilt` is set when present reported
    /// the swapchain suboptimal (or a resize was pending) and it was rebuilt.
    Presented { image_index: u32, rebuilt: bool },
    /// Nothing was presented; the swapchain was rebuilt instead
    Rebuilt { stage: StaleStage },
    /// The framebuffer has no area (minimised window)
    Skipped,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub presented: u64,
    pub rebuilds: u64,
    pub skipped: u64,
}

pub struct FrameOrchestrator<S: PresentationSurface> {
    device: S::Device,
    sync: FrameSync<S::Device>,
    upload: UploadChannel<S::Device>,
    surface: S,
    fence_timeout: Timeout,
    framebuffer_resized: bool,
    stats: FrameStats,
}

impl<S: PresentationSurface> FrameOrchestrator<S> {
    pub fn new(device: &S::Device, surface: S, frames_in_flight: usize) -> CrateResult<Self> {
        Ok(Self {
            device: device.clone(),
            sync: FrameSync::new(device, frames_in_flight)?,
            upload: UploadChannel::new(device),
            surface,
            fence_timeout: Timeout::Infinite,
            framebuffer_resized: false,
            stats: FrameStats::default(),
        })
    }

    pub fn with_fence_timeout(mut self, timeout: Timeout) -> Self {
        self.fence_timeout = timeout;
        self
    }

    /// Record that the window's framebuffer changed size. The swapchain is
    /// rebuilt at the next acquire or present.
    pub fn notify_resized(&mut self) {
        self.framebuffer_resized = true;
    }

    /// Initial upload, done once before the first frame
    pub fn prime(&mut self, snapshot: &[Particle]) -> CrateResult<()> {
        self.upload.upload(snapshot)?;
        info!(
            particles = snapshot.len(),
            "uploaded initial particle snapshot"
        );
        Ok(())
    }

    /// Render `snapshot` into the next swapchain image
    pub fn draw_frame(&mut self, snapshot: &[Particle]) -> CrateResult<FrameOutcome> {
        if self.surface.framebuffer_extent().is_empty() {
            // Rebuild once the window has an area again.
            self.framebuffer_resized = true;
            self.stats.skipped += 1;
            trace!("framebuffer has no area, skipping frame");
            return Ok(FrameOutcome::Skipped);
        }

        let slot = self.sync.current();
        self.sync.wait(slot, self.fence_timeout)?;

        let image_acquired = self.sync.image_acquired(slot)?;
        let image_index = match self.surface.acquire_next_image(image_acquired)? {
            Acquire::OutOfDate => {
                debug!(slot, "swapchain out of date at acquire");
                self.rebuild_swapchain()?;
                return Ok(FrameOutcome::Rebuilt {
                    stage: StaleStage::Acquire,
                });
            }
            Acquire::Ready {
                image_index,
                suboptimal,
            } if suboptimal || self.framebuffer_resized => {
                debug!(slot, image_index, suboptimal, "abandoning acquired image");
                if !self.rebuild_swapchain()? {
                    self.device.wait_idle()?;
                }
                // The acquire still signals this semaphore and no submission
                // is going to wait on it. Replaced only once the device is idle.
                self.sync.renew_image_acquired(slot)?;
                return Ok(FrameOutcome::Rebuilt {
                    stage: StaleStage::Acquire,
                });
            }
            Acquire::Ready { image_index, .. } => image_index,
        };

        self.upload.upload(snapshot)?;

        self.sync.reset(slot)?;

        let render_finished = self.sync.render_finished(slot)?;
        self.surface.record_and_submit(DrawSubmission {
            slot,
            image_index,
            vertex_buffer: self.upload.buffer().map(|buffer| buffer.handle()),
            vertex_count: self.upload.vertex_count(),
            wait_semaphore: image_acquired,
            signal_semaphore: render_finished,
            fence: self.sync.in_flight(slot)?,
        })?;
        trace!(slot, image_index, "submitted frame");

        let status = self.surface.present(image_index, render_finished)?;
        let rebuilt = if status.is_stale() || self.framebuffer_resized {
            debug!(slot, ?status, "swapchain stale at present");
            self.rebuild_swapchain()?
        } else {
            false
        };

        self.sync.advance();

        Ok(match status {
            PresentStatus::OutOfDate => FrameOutcome::Rebuilt {
                stage: StaleStage::Present,
            },
            PresentStatus::Presented | PresentStatus::Suboptimal => {
                self.stats.presented += 1;
                FrameOutcome::Presented {
                    image_index,
                    rebuilt,
                }
            }
        })
    }

    /// Wait for the device to go idle and rebuild every swapchain-dependent
    /// resource.
    ///
    /// Returns `false` if the framebuffer currently has no area; the rebuild
    /// then stays pending.
    pub fn rebuild_swapchain(&mut self) -> CrateResult<bool> {
        let extent = self.surface.framebuffer_extent();
        if extent.is_empty() {
            self.framebuffer_resized = true;
            debug!("deferring swapchain rebuild until the framebuffer has an area");
            return Ok(false);
        }
        self.device.wait_idle()?;
        self.surface.rebuild()?;
        self.framebuffer_resized = false;
        self.stats.rebuilds += 1;
        info!(
            width = extent.width,
            height = extent.height,
            rebuilds = self.stats.rebuilds,
            "rebuilt swapchain"
        );
        Ok(true)
    }

    /// Wait for all in-flight frames and release the particle buffer
    pub fn shutdown(&mut self) -> CrateResult<()> {
        self.device.wait_idle()?;
        self.upload.release()
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    pub fn upload_stats(&self) -> UploadStats {
        self.upload.stats()
    }

    pub fn current_slot(&self) -> usize {
        self.sync.current()
    }

    pub fn rebuild_pending(&self) -> bool {
        self.framebuffer_resized
    }

    pub fn device(&self) -> &S::Device {
        &self.device
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }
}

impl<S: PresentationSurface> Drop for FrameOrchestrator<S> {
    fn drop(&mut self) {
        // Semaphores and fences must not be destroyed while frames are in flight.
        if let Err(err) = self.device.wait_idle() {
            warn!("wait for device idle failed during teardown: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        gpu::Extent,
        runners::headless::{Completion, HeadlessDevice, HeadlessOp, HeadlessSurface},
    };
    use glam::Vec2;

    fn particles(count: usize) -> Vec<Particle> {
        (0..count)
            .map(|i| {
                Particle::new(
                    Vec2::new(10.0 + i as f32, 10.0),
                    Vec2::new(5.0, 5.0),
                    [1.0; 4],
                    2.0,
                )
            })
            .collect()
    }

    fn orchestrator(surface: HeadlessSurface) -> FrameOrchestrator<HeadlessSurface> {
        let device = surface.device().clone();
        FrameOrchestrator::new(&device, surface, 2).unwrap()
    }

    #[test]
    fn healthy_frames_rotate_slots_and_present() {
        let device = HeadlessDevice::new();
        let mut frames = orchestrator(HeadlessSurface::new(device, Extent::new(100, 100)));
        let snapshot = particles(3);
        frames.prime(&snapshot).unwrap();

        let slots: Vec<_> = (0..4)
            .map(|_| {
                let slot = frames.current_slot();
                let outcome = frames.draw_frame(&snapshot).unwrap();
                assert!(matches!(
                    outcome,
                    FrameOutcome::Presented { rebuilt: false, .. }
                ));
                slot
            })
            .collect();
        assert_eq!(slots, vec![0, 1, 0, 1]);
        assert_eq!(frames.surface().presented(), &[0, 1, 2, 0]);
        assert!(frames.surface().draws().iter().all(|d| d.vertex_count == 3));
        assert_eq!(frames.stats().rebuilds, 0);
    }

    #[test]
    fn suboptimal_acquire_renews_the_semaphore_and_rebuilds() {
        let device = HeadlessDevice::new();
        let surface =
            HeadlessSurface::new(device.clone(), Extent::new(100, 100)).suboptimal_on_acquire(1);
        let mut frames = orchestrator(surface);
        let snapshot = particles(2);

        assert_eq!(
            frames.draw_frame(&snapshot).unwrap(),
            FrameOutcome::Rebuilt {
                stage: StaleStage::Acquire
            }
        );
        // The same slot is used again and its acquire must not trip over
        // the signal left behind by the abandoned image.
        assert_eq!(frames.current_slot(), 0);
        assert!(matches!(
            frames.draw_frame(&snapshot).unwrap(),
            FrameOutcome::Presented { .. }
        ));
        assert_eq!(device.live().semaphores, 4);
    }

    #[test]
    fn abandoned_semaphore_outlives_the_idle_wait() {
        let device = HeadlessDevice::with_completion(Completion::Manual);
        let surface =
            HeadlessSurface::new(device.clone(), Extent::new(100, 100)).suboptimal_on_acquire(2);
        let mut frames = orchestrator(surface);
        let snapshot = particles(2);
        frames.prime(&snapshot).unwrap();

        frames.draw_frame(&snapshot).unwrap();
        assert_eq!(device.pending_submissions(), 1);
        assert_eq!(
            frames.draw_frame(&snapshot).unwrap(),
            FrameOutcome::Rebuilt {
                stage: StaleStage::Acquire
            }
        );
        assert_eq!(frames.surface().rebuilds(), 1);
        assert_eq!(device.counters().destroyed_in_use, 0);

        assert!(matches!(
            frames.draw_frame(&snapshot).unwrap(),
            FrameOutcome::Presented { .. }
        ));
    }

    #[test]
    fn stale_present_rebuilds_only_after_in_flight_frames_finish() {
        let device = HeadlessDevice::with_completion(Completion::Manual);
        let surface =
            HeadlessSurface::new(device.clone(), Extent::new(100, 100)).stale_on_present(2);
        let mut frames = orchestrator(surface);
        let snapshot = particles(3);
        frames.prime(&snapshot).unwrap();

        frames.draw_frame(&snapshot).unwrap();
        let idles = device.counters().wait_idles;
        assert_eq!(
            frames.draw_frame(&snapshot).unwrap(),
            FrameOutcome::Rebuilt {
                stage: StaleStage::Present
            }
        );
        assert_eq!(frames.surface().rebuilds(), 1);
        assert_eq!(device.counters().wait_idles, idles + 1);
        assert_eq!(device.pending_submissions(), 0);
        assert_eq!(device.counters().destroyed_in_use, 0);
    }

    #[test]
    fn empty_snapshot_releases_the_buffer_after_in_flight_frames() {
        let device = HeadlessDevice::with_completion(Completion::Manual);
        let mut frames = orchestrator(HeadlessSurface::new(device.clone(), Extent::new(100, 100)));
        frames.prime(&particles(5)).unwrap();
        frames.draw_frame(&particles(5)).unwrap();
        assert_eq!(device.pending_submissions(), 1);

        frames.draw_frame(&[]).unwrap();
        assert_eq!(device.counters().destroyed_in_use, 0);
        assert_eq!(device.live().vertex_buffers, 0);
        let last = frames.surface().draws().last().copied().unwrap();
        assert_eq!((last.vertex_count, last.vertex_buffer), (0, None));
    }

    #[test]
    fn shutdown_with_a_frame_in_flight_waits_before_releasing() {
        let device = HeadlessDevice::with_completion(Completion::Manual);
        let mut frames = orchestrator(HeadlessSurface::new(device.clone(), Extent::new(100, 100)));
        frames.prime(&particles(4)).unwrap();
        frames.draw_frame(&particles(4)).unwrap();
        assert_eq!(device.pending_submissions(), 1);

        frames.shutdown().unwrap();
        assert_eq!(device.pending_submissions(), 0);
        assert_eq!(device.live().vertex_buffers, 0);
        assert_eq!(device.counters().destroyed_in_use, 0);
        drop(frames);
        assert!(device.live().is_empty());
        assert_eq!(device.counters().destroyed_in_use, 0);
    }

    #[test]
    fn suboptimal_present_still_counts_as_presented() {
        let device = HeadlessDevice::new();
        let surface =
            HeadlessSurface::new(device, Extent::new(100, 100)).suboptimal_on_present(1);
        let mut frames = orchestrator(surface);
        assert_eq!(
            frames.draw_frame(&particles(1)).unwrap(),
            FrameOutcome::Presented {
                image_index: 0,
                rebuilt: true
            }
        );
        assert_eq!(frames.stats().presented, 1);
        assert_eq!(frames.stats().rebuilds, 1);
    }

    #[test]
    fn minimised_window_skips_and_keeps_the_rebuild_pending() {
        let device = HeadlessDevice::new();
        let mut frames = orchestrator(HeadlessSurface::new(device, Extent::new(100, 100)));
        let snapshot = particles(2);

        frames.surface_mut().resize_window(Extent::new(0, 0));
        frames.notify_resized();
        assert_eq!(frames.draw_frame(&snapshot).unwrap(), FrameOutcome::Skipped);
        assert!(!frames.rebuild_swapchain().unwrap());
        assert!(frames.rebuild_pending());
        assert_eq!(frames.surface().rebuilds(), 0);

        frames.surface_mut().resize_window(Extent::new(50, 40));
        assert!(matches!(
            frames.draw_frame(&snapshot).unwrap(),
            FrameOutcome::Rebuilt { .. }
        ));
        assert!(!frames.rebuild_pending());
        assert_eq!(frames.surface().swapchain().extent, Extent::new(50, 40));
        assert!(matches!(
            frames.draw_frame(&snapshot).unwrap(),
            FrameOutcome::Presented { .. }
        ));
    }

    #[test]
    fn upload_failure_is_fatal_and_leaves_the_fence_armed() {
        let device = HeadlessDevice::new();
        let mut frames = orchestrator(HeadlessSurface::new(device.clone(), Extent::new(100, 100)));
        device.fail_on(HeadlessOp::CreateStagingBuffer, 1);
        assert!(frames.draw_frame(&particles(2)).is_err());
        assert_eq!(device.counters().submissions, 0);
        // The fence was never reset, so it is still signaled for the next attempt.
        assert!(frames.sync.is_signaled(0).unwrap());
    }

    #[test]
    fn shutdown_releases_everything_but_sync_objects() {
        let device = HeadlessDevice::new();
        let mut frames = orchestrator(HeadlessSurface::new(device.clone(), Extent::new(100, 100)));
        frames.prime(&particles(4)).unwrap();
        frames.draw_frame(&particles(4)).unwrap();
        frames.shutdown().unwrap();
        assert_eq!(device.live().vertex_buffers, 0);
        drop(frames);
        assert!(device.live().is_empty());
    }
}
