//! Headless in-process GPU
//!
//! [`HeadlessDevice`] models the parts of a Vulkan device the frame loop
//! depends on: fences that only signal once submitted work completes, binary
//! semaphores with their "must be unsignaled before use" rules, host-visible
//! and device-local buffers with real contents, and a queue that can complete
//! work immediately or only when told to. [`HeadlessSurface`] is a scripted
//! presentation engine.
//!
//! Failures can be injected per operation to exercise error paths. Objects
//! destroyed while pending work still uses them are counted in
//! [`DeviceCounters::destroyed_in_use`], and rebuilding the surface with
//! frames in flight is an error.

use crate::{
    error::{CrateResult, ParticlesError},
    gpu::{
        Acquire, BufferRole, DrawSubmission, Extent, GpuDevice, PresentStatus,
        PresentationSurface, Timeout,
    },
};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::Arc,
    time::Instant,
};
use tracing::warn;

// Raw result codes reported for injected and detected failures.
const ERROR_OUT_OF_DEVICE_MEMORY: i32 = -2;
const ERROR_DEVICE_LOST: i32 = -4;
const ERROR_VALIDATION: i32 = -1_000_011_001;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct HeadlessFence(u64);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct HeadlessSemaphore(u64);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct HeadlessBuffer(u64);

/// When submitted work completes
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Completion {
    /// Work completes as part of the submit call
    Immediate,
    /// Work stays in flight until [`HeadlessDevice::complete_pending`] (or a
    /// queue/device idle wait) runs
    Manual,
}

/// Operations that can be made to fail
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum HeadlessOp {
    CreateFence,
    CreateSemaphore,
    CreateStagingBuffer,
    CreateVertexBuffer,
    WriteBuffer,
    CopyBuffer,
    Submit,
}

/// Resources currently alive on the device
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LiveResources {
    pub fences: usize,
    pub semaphores: usize,
    pub staging_buffers: usize,
    pub vertex_buffers: usize,
}

impl LiveResources {
    pub fn is_empty(&self) -> bool {
        *self == LiveResources::default()
    }
}

/// Running totals since the device was created
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceCounters {
    pub staging_allocations: u64,
    pub vertex_allocations: u64,
    pub copies: u64,
    pub submissions: u64,
    pub completed_submissions: u64,
    pub wait_idles: u64,
    /// Fences, semaphores or buffers destroyed while pending work used them
    pub destroyed_in_use: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum SemaphoreState {
    Unsignaled,
    /// A signal operation has been submitted but not executed yet
    Pending,
    Signaled,
}

struct BufferRecord {
    role: BufferRole,
    data: Vec<u8>,
}

struct Submission {
    fence: Option<u64>,
    signal: Vec<u64>,
    /// Buffers read by the submitted commands
    buffers: Vec<u64>,
}

struct State {
    next_id: u64,
    completion: Completion,
    fences: HashMap<u64, bool>,
    semaphores: HashMap<u64, SemaphoreState>,
    buffers: HashMap<u64, BufferRecord>,
    pending: VecDeque<Submission>,
    /// Semaphores signaled from outside the queue whose signal has not landed yet
    pending_signals: Vec<u64>,
    failures: HashMap<HeadlessOp, usize>,
    counters: DeviceCounters,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_failure(&mut self, op: HeadlessOp, origin: &str, code: i32) -> CrateResult<()> {
        if let Some(remaining) = self.failures.get_mut(&op) {
            if *remaining <= 1 {
                self.failures.remove(&op);
                return Err(ParticlesError::gpu(origin, code, "injected failure"));
            }
            *remaining -= 1;
        }
        Ok(())
    }

    fn land_signal(&mut self, semaphore: u64) {
        // A semaphore already consumed by a queued wait stays unsignaled.
        if let Some(state) = self.semaphores.get_mut(&semaphore) {
            if *state == SemaphoreState::Pending {
                *state = SemaphoreState::Signaled;
            }
        }
    }

    fn complete(&mut self, submission: Submission) {
        if let Some(fence) = submission.fence {
            if let Some(signaled) = self.fences.get_mut(&fence) {
                *signaled = true;
            }
        }
        for semaphore in submission.signal {
            self.land_signal(semaphore);
        }
        self.counters.completed_submissions += 1;
    }

    /// Finish all outstanding work. Returns how many queue submissions completed.
    fn drain(&mut self) -> usize {
        for semaphore in std::mem::take(&mut self.pending_signals) {
            self.land_signal(semaphore);
        }
        let mut completed = 0;
        while let Some(submission) = self.pending.pop_front() {
            self.complete(submission);
            completed += 1;
        }
        completed
    }

    fn note_destroyed_in_use(&mut self, kind: &str, id: u64) {
        self.counters.destroyed_in_use += 1;
        warn!(id, "{kind} destroyed while pending GPU work still uses it");
    }

    fn consume_semaphore(&mut self, semaphore: u64, origin: &str) -> CrateResult<()> {
        match self.semaphores.get_mut(&semaphore) {
            Some(state @ (SemaphoreState::Pending | SemaphoreState::Signaled)) => {
                *state = SemaphoreState::Unsignaled;
                Ok(())
            }
            Some(SemaphoreState::Unsignaled) => Err(ParticlesError::gpu(
                origin,
                ERROR_VALIDATION,
                "wait on a semaphore with no signal operation",
            )),
            None => Err(ParticlesError::gpu(origin, ERROR_VALIDATION, "unknown semaphore")),
        }
    }
}

struct Shared {
    state: Mutex<State>,
    completed: Condvar,
}

/// Simulated device. Clones share the same device state.
#[derive(Clone)]
pub struct HeadlessDevice {
    shared: Arc<Shared>,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessDevice {
    /// A device whose submitted work completes immediately
    pub fn new() -> Self {
        Self::with_completion(Completion::Immediate)
    }

    pub fn with_completion(completion: Completion) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    next_id: 0,
                    completion,
                    fences: HashMap::new(),
                    semaphores: HashMap::new(),
                    buffers: HashMap::new(),
                    pending: VecDeque::new(),
                    pending_signals: Vec::new(),
                    failures: HashMap::new(),
                    counters: DeviceCounters::default(),
                }),
                completed: Condvar::new(),
            }),
        }
    }

    pub fn set_completion(&self, completion: Completion) {
        self.shared.state.lock().completion = completion;
    }

    /// Make the `nth` next call of `op` fail (1 = the very next call)
    pub fn fail_on(&self, op: HeadlessOp, nth: usize) {
        self.shared.state.lock().failures.insert(op, nth.max(1));
    }

    /// Execute every in-flight submission and wake fence waiters.
    /// Returns how many submissions completed.
    pub fn complete_pending(&self) -> usize {
        let completed = self.shared.state.lock().drain();
        self.shared.completed.notify_all();
        completed
    }

    /// Execute the oldest in-flight submission, if any
    pub fn complete_one(&self) -> bool {
        let done = {
            let mut state = self.shared.state.lock();
            match state.pending.pop_front() {
                Some(submission) => {
                    state.complete(submission);
                    true
                }
                None => false,
            }
        };
        self.shared.completed.notify_all();
        done
    }

    pub fn pending_submissions(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    pub fn live(&self) -> LiveResources {
        let state = self.shared.state.lock();
        let count = |role| state.buffers.values().filter(|b| b.role == role).count();
        LiveResources {
            fences: state.fences.len(),
            semaphores: state.semaphores.len(),
            staging_buffers: count(BufferRole::Staging),
            vertex_buffers: count(BufferRole::Vertex),
        }
    }

    pub fn counters(&self) -> DeviceCounters {
        self.shared.state.lock().counters
    }

    pub fn buffer_contents(&self, buffer: HeadlessBuffer) -> Option<Vec<u8>> {
        self.shared
            .state
            .lock()
            .buffers
            .get(&buffer.0)
            .map(|record| record.data.clone())
    }

    pub fn semaphore_signaled(&self, semaphore: HeadlessSemaphore) -> bool {
        matches!(
            self.shared.state.lock().semaphores.get(&semaphore.0),
            Some(SemaphoreState::Signaled | SemaphoreState::Pending)
        )
    }

    /// Signal from outside any queue, as an image acquire does.
    /// The semaphore must be unsignaled with nothing pending. With manual
    /// completion the signal only lands once the device is drained.
    pub fn signal_semaphore(&self, semaphore: HeadlessSemaphore, origin: &str) -> CrateResult<()> {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        match state.semaphores.get_mut(&semaphore.0) {
            Some(s @ SemaphoreState::Unsignaled) => {
                match state.completion {
                    Completion::Immediate => *s = SemaphoreState::Signaled,
                    Completion::Manual => {
                        *s = SemaphoreState::Pending;
                        state.pending_signals.push(semaphore.0);
                    }
                }
                Ok(())
            }
            Some(_) => Err(ParticlesError::gpu(
                origin,
                ERROR_VALIDATION,
                "semaphore already has a pending or completed signal",
            )),
            None => Err(ParticlesError::gpu(origin, ERROR_VALIDATION, "unknown semaphore")),
        }
    }

    fn consume_semaphore(&self, semaphore: HeadlessSemaphore, origin: &str) -> CrateResult<()> {
        self.shared.state.lock().consume_semaphore(semaphore.0, origin)
    }

    /// Queue a frame submission: wait on one semaphore, signal another and a fence
    pub fn submit(
        &self,
        wait: HeadlessSemaphore,
        signal: HeadlessSemaphore,
        fence: HeadlessFence,
    ) -> CrateResult<()> {
        self.submit_draw(wait, signal, fence, None)
    }

    /// [`submit`](Self::submit) for commands that read `vertex_buffer`
    pub fn submit_draw(
        &self,
        wait: HeadlessSemaphore,
        signal: HeadlessSemaphore,
        fence: HeadlessFence,
        vertex_buffer: Option<HeadlessBuffer>,
    ) -> CrateResult<()> {
        {
            let mut state = self.shared.state.lock();
            state.check_failure(HeadlessOp::Submit, "vkQueueSubmit", ERROR_DEVICE_LOST)?;
            match state.fences.get(&fence.0) {
                Some(false) => {}
                Some(true) => {
                    return Err(ParticlesError::gpu(
                        "vkQueueSubmit",
                        ERROR_VALIDATION,
                        "fence submitted while still signaled",
                    ))
                }
                None => {
                    return Err(ParticlesError::gpu(
                        "vkQueueSubmit",
                        ERROR_VALIDATION,
                        "unknown fence",
                    ))
                }
            }
            state.consume_semaphore(wait.0, "vkQueueSubmit")?;
            match state.semaphores.get_mut(&signal.0) {
                Some(s) => *s = SemaphoreState::Pending,
                None => {
                    return Err(ParticlesError::gpu(
                        "vkQueueSubmit",
                        ERROR_VALIDATION,
                        "unknown semaphore",
                    ))
                }
            }
            state.counters.submissions += 1;
            let submission = Submission {
                fence: Some(fence.0),
                signal: vec![signal.0],
                buffers: vertex_buffer.into_iter().map(|buffer| buffer.0).collect(),
            };
            match state.completion {
                Completion::Immediate => state.complete(submission),
                Completion::Manual => state.pending.push_back(submission),
            }
        }
        self.shared.completed.notify_all();
        Ok(())
    }
}

impl GpuDevice for HeadlessDevice {
    type Fence = HeadlessFence;
    type Semaphore = HeadlessSemaphore;
    type Buffer = HeadlessBuffer;

    fn create_fence(&self, signaled: bool) -> CrateResult<HeadlessFence> {
        let mut state = self.shared.state.lock();
        state.check_failure(
            HeadlessOp::CreateFence,
            "vkCreateFence",
            ERROR_OUT_OF_DEVICE_MEMORY,
        )?;
        let id = state.next_id();
        state.fences.insert(id, signaled);
        Ok(HeadlessFence(id))
    }

    fn wait_for_fence(&self, fence: HeadlessFence, timeout: Timeout) -> CrateResult<bool> {
        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::After(d) => Instant::now().checked_add(d),
        };
        let mut state = self.shared.state.lock();
        loop {
            match state.fences.get(&fence.0) {
                Some(true) => return Ok(true),
                Some(false) => {}
                None => {
                    return Err(ParticlesError::gpu(
                        "vkWaitForFences",
                        ERROR_VALIDATION,
                        "unknown fence",
                    ))
                }
            }
            let will_signal = state
                .pending
                .iter()
                .any(|submission| submission.fence == Some(fence.0));
            if !will_signal && deadline.is_none() {
                // A real device would hang here forever.
                return Err(ParticlesError::gpu(
                    "vkWaitForFences",
                    ERROR_DEVICE_LOST,
                    "waiting on a fence with no pending signal",
                ));
            }
            match deadline {
                None => self.shared.completed.wait(&mut state),
                Some(deadline) => {
                    if self
                        .shared
                        .completed
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        return Ok(state.fences.get(&fence.0).copied().unwrap_or(false));
                    }
                }
            }
        }
    }

    fn reset_fence(&self, fence: HeadlessFence) -> CrateResult<()> {
        let mut state = self.shared.state.lock();
        if state.pending.iter().any(|s| s.fence == Some(fence.0)) {
            return Err(ParticlesError::gpu(
                "vkResetFences",
                ERROR_VALIDATION,
                "fence reset while its submission is in flight",
            ));
        }
        match state.fences.get_mut(&fence.0) {
            Some(signaled) => {
                *signaled = false;
                Ok(())
            }
            None => Err(ParticlesError::gpu(
                "vkResetFences",
                ERROR_VALIDATION,
                "unknown fence",
            )),
        }
    }

    fn fence_signaled(&self, fence: HeadlessFence) -> CrateResult<bool> {
        self.shared
            .state
            .lock()
            .fences
            .get(&fence.0)
            .copied()
            .ok_or_else(|| {
                ParticlesError::gpu("vkGetFenceStatus", ERROR_VALIDATION, "unknown fence")
            })
    }

    fn destroy_fence(&self, fence: HeadlessFence) {
        let mut state = self.shared.state.lock();
        if state.pending.iter().any(|s| s.fence == Some(fence.0)) {
            state.note_destroyed_in_use("fence", fence.0);
        }
        state.fences.remove(&fence.0);
    }

    fn create_semaphore(&self) -> CrateResult<HeadlessSemaphore> {
        let mut state = self.shared.state.lock();
        state.check_failure(
            HeadlessOp::CreateSemaphore,
            "vkCreateSemaphore",
            ERROR_OUT_OF_DEVICE_MEMORY,
        )?;
        let id = state.next_id();
        state.semaphores.insert(id, SemaphoreState::Unsignaled);
        Ok(HeadlessSemaphore(id))
    }

    fn destroy_semaphore(&self, semaphore: HeadlessSemaphore) {
        let mut state = self.shared.state.lock();
        let signal_pending = state.semaphores.get(&semaphore.0) == Some(&SemaphoreState::Pending)
            || state.pending.iter().any(|s| s.signal.contains(&semaphore.0));
        if signal_pending {
            state.note_destroyed_in_use("semaphore", semaphore.0);
        }
        state.semaphores.remove(&semaphore.0);
    }

    fn create_buffer(&self, size: u64, role: BufferRole) -> CrateResult<HeadlessBuffer> {
        let mut state = self.shared.state.lock();
        let op = match role {
            BufferRole::Staging => HeadlessOp::CreateStagingBuffer,
            BufferRole::Vertex => HeadlessOp::CreateVertexBuffer,
        };
        state.check_failure(op, "vkAllocateMemory", ERROR_OUT_OF_DEVICE_MEMORY)?;
        let id = state.next_id();
        state.buffers.insert(
            id,
            BufferRecord {
                role,
                data: vec![0; size as usize],
            },
        );
        match role {
            BufferRole::Staging => state.counters.staging_allocations += 1,
            BufferRole::Vertex => state.counters.vertex_allocations += 1,
        }
        Ok(HeadlessBuffer(id))
    }

    fn write_buffer(&self, buffer: HeadlessBuffer, bytes: &[u8]) -> CrateResult<()> {
        let mut state = self.shared.state.lock();
        state.check_failure(
            HeadlessOp::WriteBuffer,
            "vkMapMemory",
            ERROR_OUT_OF_DEVICE_MEMORY,
        )?;
        let record = state.buffers.get_mut(&buffer.0).ok_or_else(|| {
            ParticlesError::gpu("vkMapMemory", ERROR_VALIDATION, "unknown buffer")
        })?;
        if record.role != BufferRole::Staging {
            return Err(ParticlesError::gpu(
                "vkMapMemory",
                ERROR_VALIDATION,
                "memory is not host visible",
            ));
        }
        if bytes.len() > record.data.len() {
            return Err(ParticlesError::BufferOverflow {
                len: bytes.len() as u64,
                size: record.data.len() as u64,
            });
        }
        record.data[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn copy_buffer(&self, src: HeadlessBuffer, dst: HeadlessBuffer, size: u64) -> CrateResult<()> {
        {
            let mut state = self.shared.state.lock();
            state.check_failure(HeadlessOp::CopyBuffer, "vkQueueSubmit", ERROR_DEVICE_LOST)?;
            let size = size as usize;
            let source = match state.buffers.get(&src.0) {
                Some(record) if record.data.len() >= size => record.data[..size].to_vec(),
                _ => {
                    return Err(ParticlesError::gpu(
                        "vkCmdCopyBuffer",
                        ERROR_VALIDATION,
                        "source buffer missing or too small",
                    ))
                }
            };
            match state.buffers.get_mut(&dst.0) {
                Some(record) if record.data.len() >= size => {
                    record.data[..size].copy_from_slice(&source)
                }
                _ => {
                    return Err(ParticlesError::gpu(
                        "vkCmdCopyBuffer",
                        ERROR_VALIDATION,
                        "destination buffer missing or too small",
                    ))
                }
            }
            state.counters.copies += 1;
            // Waiting for the queue to go idle also retires every frame in flight.
            state.drain();
        }
        self.shared.completed.notify_all();
        Ok(())
    }

    fn destroy_buffer(&self, buffer: HeadlessBuffer) {
        let mut state = self.shared.state.lock();
        if state.pending.iter().any(|s| s.buffers.contains(&buffer.0)) {
            state.note_destroyed_in_use("buffer", buffer.0);
        }
        state.buffers.remove(&buffer.0);
    }

    fn wait_idle(&self) -> CrateResult<()> {
        {
            let mut state = self.shared.state.lock();
            state.counters.wait_idles += 1;
            state.drain();
        }
        self.shared.completed.notify_all();
        Ok(())
    }

    fn device_name(&self) -> String {
        "Headless".to_string()
    }
}

/// Swapchain parameters the headless surface was last built with
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HeadlessSwapchain {
    pub extent: Extent,
    pub image_count: u32,
}

/// One recorded draw submission
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RecordedDraw {
    pub slot: usize,
    pub image_index: u32,
    pub vertex_count: u32,
    pub vertex_buffer: Option<HeadlessBuffer>,
}

/// Scripted presentation engine.
///
/// Acquire and present calls are numbered from 1; staleness can be scripted
/// for specific call numbers. A window extent that no longer matches the
/// swapchain also makes acquire report out-of-date, like a real surface.
pub struct HeadlessSurface {
    device: HeadlessDevice,
    window_extent: Extent,
    swapchain: HeadlessSwapchain,
    next_image: u32,
    acquire_calls: u64,
    present_calls: u64,
    stale_acquires: BTreeSet<u64>,
    suboptimal_acquires: BTreeSet<u64>,
    stale_presents: BTreeSet<u64>,
    suboptimal_presents: BTreeSet<u64>,
    presented: Vec<u32>,
    draws: Vec<RecordedDraw>,
    rebuilds: u64,
}

impl HeadlessSurface {
    pub fn new(device: HeadlessDevice, extent: Extent) -> Self {
        Self {
            device,
            window_extent: extent,
            swapchain: HeadlessSwapchain {
                extent,
                image_count: 3,
            },
            next_image: 0,
            acquire_calls: 0,
            present_calls: 0,
            stale_acquires: BTreeSet::new(),
            suboptimal_acquires: BTreeSet::new(),
            stale_presents: BTreeSet::new(),
            suboptimal_presents: BTreeSet::new(),
            presented: Vec::new(),
            draws: Vec::new(),
            rebuilds: 0,
        }
    }

    /// Acquire call number `call` reports out-of-date
    pub fn stale_on_acquire(mut self, call: u64) -> Self {
        self.stale_acquires.insert(call);
        self
    }

    /// Acquire call number `call` succeeds but reports suboptimal
    pub fn suboptimal_on_acquire(mut self, call: u64) -> Self {
        self.suboptimal_acquires.insert(call);
        self
    }

    /// Present call number `call` reports out-of-date and presents nothing
    pub fn stale_on_present(mut self, call: u64) -> Self {
        self.stale_presents.insert(call);
        self
    }

    /// Present call number `call` presents but reports suboptimal
    pub fn suboptimal_on_present(mut self, call: u64) -> Self {
        self.suboptimal_presents.insert(call);
        self
    }

    /// Simulate the user resizing (or minimising) the window
    pub fn resize_window(&mut self, extent: Extent) {
        self.window_extent = extent;
    }

    pub fn swapchain(&self) -> HeadlessSwapchain {
        self.swapchain
    }

    /// Image indices that were actually presented, in order
    pub fn presented(&self) -> &[u32] {
        &self.presented
    }

    pub fn draws(&self) -> &[RecordedDraw] {
        &self.draws
    }

    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    pub fn acquire_calls(&self) -> u64 {
        self.acquire_calls
    }

    pub fn device(&self) -> &HeadlessDevice {
        &self.device
    }
}

impl PresentationSurface for HeadlessSurface {
    type Device = HeadlessDevice;

    fn framebuffer_extent(&self) -> Extent {
        self.window_extent
    }

    fn acquire_next_image(&mut self, image_acquired: HeadlessSemaphore) -> CrateResult<Acquire> {
        self.acquire_calls += 1;
        let call = self.acquire_calls;
        if self.stale_acquires.contains(&call) || self.window_extent != self.swapchain.extent {
            return Ok(Acquire::OutOfDate);
        }
        self.device
            .signal_semaphore(image_acquired, "vkAcquireNextImageKHR")?;
        let image_index = self.next_image;
        self.next_image = (self.next_image + 1) % self.swapchain.image_count;
        Ok(Acquire::Ready {
            image_index,
            suboptimal: self.suboptimal_acquires.contains(&call),
        })
    }

    fn record_and_submit(&mut self, submission: DrawSubmission<HeadlessDevice>) -> CrateResult<()> {
        if submission.image_index >= self.swapchain.image_count {
            return Err(ParticlesError::gpu(
                "vkCmdBeginRenderPass",
                ERROR_VALIDATION,
                "image index out of range",
            ));
        }
        self.device.submit_draw(
            submission.wait_semaphore,
            submission.signal_semaphore,
            submission.fence,
            submission.vertex_buffer,
        )?;
        self.draws.push(RecordedDraw {
            slot: submission.slot,
            image_index: submission.image_index,
            vertex_count: submission.vertex_count,
            vertex_buffer: submission.vertex_buffer,
        });
        Ok(())
    }

    fn present(
        &mut self,
        image_index: u32,
        render_finished: HeadlessSemaphore,
    ) -> CrateResult<PresentStatus> {
        self.present_calls += 1;
        let call = self.present_calls;
        self.device
            .consume_semaphore(render_finished, "vkQueuePresentKHR")?;
        if self.stale_presents.contains(&call) {
            return Ok(PresentStatus::OutOfDate);
        }
        self.presented.push(image_index);
        if self.suboptimal_presents.contains(&call) {
            Ok(PresentStatus::Suboptimal)
        } else {
            Ok(PresentStatus::Presented)
        }
    }

    fn rebuild(&mut self) -> CrateResult<()> {
        let in_flight = self.device.pending_submissions();
        if in_flight > 0 {
            return Err(ParticlesError::gpu(
                "vkCreateSwapchainKHR",
                ERROR_VALIDATION,
                format!("swapchain rebuilt with {in_flight} submissions in flight"),
            ));
        }
        self.swapchain = HeadlessSwapchain {
            extent: self.window_extent,
            image_count: self.swapchain.image_count,
        };
        self.next_image = 0;
        self.rebuilds += 1;
        Ok(())
    }
}
