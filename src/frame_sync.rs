//! Per-frame-in-flight synchronization
//!
//! Every frame slot owns a fence the host waits on before reusing the slot,
//! plus two semaphores that order the GPU work of a frame:
//! image acquired -> render -> render finished -> present.
//!
//! Fences are created signaled so the very first wait on each slot returns
//! immediately. A fence may only be reset after a wait on it has observed the
//! signaled state; resetting earlier could re-arm a fence the GPU is still
//! going to signal for older work.

use crate::{
    error::{CrateResult, ParticlesError},
    gpu::{GpuDevice, Timeout},
    resources::{Fence, Semaphore},
};
use tracing::{debug, trace};

struct FrameSlot<D: GpuDevice> {
    in_flight: Fence<D>,
    image_acquired: Semaphore<D>,
    render_finished: Semaphore<D>,
    /// Set when a wait observed the fence signaled, cleared by reset
    observed: bool,
}

impl<D: GpuDevice> FrameSlot<D> {
    fn new(device: &D) -> CrateResult<Self> {
        Ok(Self {
            in_flight: Fence::new(device, true)?,
            image_acquired: Semaphore::new(device)?,
            render_finished: Semaphore::new(device)?,
            observed: false,
        })
    }
}

/// N rotating sets of frame synchronization primitives
pub struct FrameSync<D: GpuDevice> {
    device: D,
    slots: Vec<FrameSlot<D>>,
    current: usize,
}

impl<D: GpuDevice> FrameSync<D> {
    /// Create `frames_in_flight` slots.
    ///
    /// Construction is all-or-nothing: when any primitive fails to create,
    /// the ones already created are dropped (and destroyed) before the error
    /// is returned.
    pub fn new(device: &D, frames_in_flight: usize) -> CrateResult<Self> {
        if frames_in_flight == 0 {
            return Err(ParticlesError::NoFrameSlots);
        }
        let slots = (0..frames_in_flight)
            .map(|_| FrameSlot::new(device))
            .collect::<CrateResult<Vec<_>>>()?;
        debug!(frames_in_flight, "created frame synchronization slots");
        Ok(Self {
            device: device.clone(),
            slots,
            current: 0,
        })
    }

    /// Index of the slot the host is currently recording into
    pub fn current(&self) -> usize {
        self.current
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, slot: usize) -> CrateResult<&FrameSlot<D>> {
        self.slots.get(slot).ok_or(ParticlesError::SlotOutOfRange {
            slot,
            count: self.slots.len(),
        })
    }

    fn slot_mut(&mut self, slot: usize) -> CrateResult<&mut FrameSlot<D>> {
        let count = self.slots.len();
        self.slots
            .get_mut(slot)
            .ok_or(ParticlesError::SlotOutOfRange { slot, count })
    }

    /// Block until all work submitted under `slot`'s fence has completed
    pub fn wait(&mut self, slot: usize, timeout: Timeout) -> CrateResult<()> {
        let frame = self.slot_mut(slot)?;
        if !frame.in_flight.wait(timeout)? {
            return Err(ParticlesError::FenceTimeout { slot });
        }
        frame.observed = true;
        trace!(slot, "frame fence signaled");
        Ok(())
    }

    /// Re-arm `slot`'s fence. Fails without touching the fence unless a
    /// wait has observed it signaled since the last reset.
    pub fn reset(&mut self, slot: usize) -> CrateResult<()> {
        let frame = self.slot_mut(slot)?;
        if !frame.observed {
            return Err(ParticlesError::FenceNotWaited { slot });
        }
        frame.in_flight.reset()?;
        frame.observed = false;
        Ok(())
    }

    /// Rotate to the next slot
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
    }

    /// Swap in a fresh image-acquired semaphore for `slot`.
    ///
    /// Needed when an acquire signaled the semaphore but the frame was then
    /// abandoned: a binary semaphore with a signal nobody waits on cannot be
    /// handed to the next acquire.
    pub fn renew_image_acquired(&mut self, slot: usize) -> CrateResult<()> {
        let fresh = Semaphore::new(&self.device)?;
        self.slot_mut(slot)?.image_acquired = fresh;
        debug!(slot, "renewed image-acquired semaphore");
        Ok(())
    }

    pub fn in_flight(&self, slot: usize) -> CrateResult<D::Fence> {
        Ok(self.slot(slot)?.in_flight.handle())
    }

    pub fn image_acquired(&self, slot: usize) -> CrateResult<D::Semaphore> {
        Ok(self.slot(slot)?.image_acquired.handle())
    }

    pub fn render_finished(&self, slot: usize) -> CrateResult<D::Semaphore> {
        Ok(self.slot(slot)?.render_finished.handle())
    }

    pub fn is_signaled(&self, slot: usize) -> CrateResult<bool> {
        self.slot(slot)?.in_flight.is_signaled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runners::headless::{Completion, HeadlessDevice, HeadlessOp};
    use std::{thread, time::Duration};

    fn submit_on(device: &HeadlessDevice, sync: &FrameSync<HeadlessDevice>, slot: usize) {
        let wait = sync.image_acquired(slot).unwrap();
        device.signal_semaphore(wait, "test").unwrap();
        device
            .submit(
                wait,
                sync.render_finished(slot).unwrap(),
                sync.in_flight(slot).unwrap(),
            )
            .unwrap();
    }

    #[test]
    fn fences_start_signaled() {
        let device = HeadlessDevice::new();
        let mut sync = FrameSync::new(&device, 2).unwrap();
        for slot in 0..2 {
            assert!(sync.is_signaled(slot).unwrap());
            sync.wait(slot, Timeout::After(Duration::ZERO)).unwrap();
        }
    }

    #[test]
    fn fence_is_unsignaled_after_reset_for_every_rotation() {
        let device = HeadlessDevice::with_completion(Completion::Manual);
        let mut sync = FrameSync::new(&device, 2).unwrap();
        for _ in 0..6 {
            let slot = sync.current();
            sync.wait(slot, Timeout::Infinite).unwrap();
            sync.reset(slot).unwrap();
            assert!(!sync.is_signaled(slot).unwrap());
            submit_on(&device, &sync, slot);
            device.complete_pending();
            sync.advance();
        }
        assert_eq!(device.counters().submissions, 6);
    }

    #[test]
    fn reset_without_observed_wait_is_rejected() {
        let device = HeadlessDevice::new();
        let mut sync = FrameSync::new(&device, 2).unwrap();
        let err = sync.reset(1).unwrap_err();
        assert!(matches!(err, ParticlesError::FenceNotWaited { slot: 1 }));
        // The fence was left alone.
        assert!(sync.is_signaled(1).unwrap());

        sync.wait(1, Timeout::Infinite).unwrap();
        sync.reset(1).unwrap();
        assert!(matches!(
            sync.reset(1),
            Err(ParticlesError::FenceNotWaited { slot: 1 })
        ));
    }

    #[test]
    fn wait_blocks_until_the_gpu_completes() {
        let device = HeadlessDevice::with_completion(Completion::Manual);
        let mut sync = FrameSync::new(&device, 2).unwrap();
        sync.wait(0, Timeout::Infinite).unwrap();
        sync.reset(0).unwrap();
        submit_on(&device, &sync, 0);

        let gpu = device.clone();
        let completer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            gpu.complete_pending()
        });

        assert_eq!(device.pending_submissions(), 1);
        sync.wait(0, Timeout::Infinite).unwrap();
        assert_eq!(device.pending_submissions(), 0);
        assert_eq!(completer.join().unwrap(), 1);
    }

    #[test]
    fn bounded_wait_reports_timeout() {
        let device = HeadlessDevice::with_completion(Completion::Manual);
        let mut sync = FrameSync::new(&device, 2).unwrap();
        sync.wait(1, Timeout::Infinite).unwrap();
        sync.reset(1).unwrap();
        submit_on(&device, &sync, 1);

        let err = sync
            .wait(1, Timeout::After(Duration::from_millis(10)))
            .unwrap_err();
        assert!(matches!(err, ParticlesError::FenceTimeout { slot: 1 }));
        // A timed-out wait does not license a reset.
        assert!(sync.reset(1).is_err());
    }

    #[test]
    fn advance_rotates_round_robin() {
        let device = HeadlessDevice::new();
        let mut sync = FrameSync::new(&device, 3).unwrap();
        let seen: Vec<_> = (0..7)
            .map(|_| {
                let slot = sync.current();
                sync.advance();
                slot
            })
            .collect();
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn construction_is_atomic() {
        let device = HeadlessDevice::new();
        // Second slot's render-finished semaphore.
        device.fail_on(HeadlessOp::CreateSemaphore, 4);
        assert!(FrameSync::new(&device, 2).is_err());
        assert!(device.live().is_empty());

        device.fail_on(HeadlessOp::CreateFence, 2);
        assert!(FrameSync::new(&device, 2).is_err());
        assert!(device.live().is_empty());
    }

    #[test]
    fn zero_slots_rejected() {
        let device = HeadlessDevice::new();
        assert!(matches!(
            FrameSync::new(&device, 0),
            Err(ParticlesError::NoFrameSlots)
        ));
    }

    #[test]
    fn out_of_range_slot() {
        let device = HeadlessDevice::new();
        let mut sync = FrameSync::new(&device, 2).unwrap();
        assert!(matches!(
            sync.wait(2, Timeout::Infinite),
            Err(ParticlesError::SlotOutOfRange { slot: 2, count: 2 })
        ));
    }

    #[test]
    fn renewed_semaphore_is_a_new_unsignaled_handle() {
        let device = HeadlessDevice::new();
        let mut sync = FrameSync::new(&device, 2).unwrap();
        let old = sync.image_acquired(0).unwrap();
        device.signal_semaphore(old, "test").unwrap();

        sync.renew_image_acquired(0).unwrap();
        let fresh = sync.image_acquired(0).unwrap();
        assert_ne!(old, fresh);
        assert!(!device.semaphore_signaled(fresh));
        assert_eq!(device.live().semaphores, 4);
    }
}
