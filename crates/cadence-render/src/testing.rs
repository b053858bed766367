// SPDX-License-Identifier: CEPL-1.0
//! Deterministic in-memory GPU for driving the core without a driver.
//!
//! [`FakeGpu`] keeps a simulated queue timeline: a submission retires once
//! `latency` later submissions have been issued, or as soon as the CPU blocks
//! on it (fence wait, queue or device idle). Copies recorded into command
//! buffers are applied to fake memory at retire time. Contract breaches that a
//! real driver would turn into hangs or validation errors are counted in
//! [`Violations`] instead.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use crate::error::{FatalError, GpuError};
use crate::frame_loop::{FrameContext, FrameRecorder};
use crate::gpu::{
    check_write, BufferUsage, ColorFormat, ColorSpace, CommandPoolUsage, DescriptorKind, GpuDevice,
    ImageLayout, LayoutBinding, MemoryLocation, PoolSize, PresentMode, PresentationEngine,
    QueueKind, Submission, SurfaceCapabilities, SurfaceFormat, SurfaceSupport, SwapchainDesc,
    TextureFormat,
};
use crate::surface::SurfaceProvider;
use crate::swapchain::SwapchainManager;
use crate::RenderSize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FakeHandle(pub u64);

/// Next result of `acquire_next_image`. Unscripted calls behave as `Ready`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireScript {
    Ready,
    Suboptimal,
    OutOfDate,
    /// No image ever becomes available: `NotReady` for a zero timeout,
    /// `Timeout` otherwise.
    NeverSignal,
    Fail(GpuError),
}

/// Next result of `queue_present`. Unscripted calls behave as `Success`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentScript {
    Success,
    Suboptimal,
    OutOfDate,
    Fail(GpuError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FakeEvent {
    WaitFence(FakeHandle),
    ResetFence(FakeHandle),
    ResetCommandBuffer(FakeHandle),
    Submit {
        id: u64,
        queue: QueueKind,
        fence: Option<FakeHandle>,
    },
    Retire {
        id: u64,
    },
    Acquire(Result<u32, GpuError>),
    Present(u32),
    CreateSwapchain {
        swapchain: FakeHandle,
        old: Option<FakeHandle>,
        image_count: u32,
    },
    QueueWaitIdle(QueueKind),
    DeviceWaitIdle,
    /// A recorded layout transition executed on the timeline.
    Transition {
        image: FakeHandle,
        from: ImageLayout,
        to: ImageLayout,
    },
    /// A recorded buffer-to-image copy executed on the timeline.
    CopyToImage {
        src: FakeHandle,
        image: FakeHandle,
    },
    Destroy {
        kind: &'static str,
        handle: FakeHandle,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Violations {
    /// Fence waits on an unsignaled fence that no submission will signal.
    pub stalled_fence_waits: u32,
    pub submit_with_signaled_fence: u32,
    pub reset_in_flight_fence: u32,
    pub reset_in_flight_command_buffer: u32,
    /// Queue waits (submit or present) on a semaphore nothing signaled.
    pub unsignaled_semaphore_waits: u32,
    /// Acquire asked to signal a semaphore that still holds a signal.
    pub signaled_semaphore_reuse: u32,
    pub image_layout_mismatches: u32,
    pub double_destroys: u32,
}

impl Violations {
    pub fn is_clean(&self) -> bool {
        *self == Violations::default()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorWrite {
    pub set: FakeHandle,
    pub binding: u32,
    pub buffer: FakeHandle,
    pub range: u64,
}

#[derive(Clone, Copy, Debug)]
enum Command {
    CopyBuffer {
        src: FakeHandle,
        dst: FakeHandle,
        size: u64,
    },
    Transition {
        image: FakeHandle,
        from: ImageLayout,
        to: ImageLayout,
    },
    CopyBufferToImage {
        src: FakeHandle,
        dst: FakeHandle,
    },
}

#[derive(Default)]
struct FenceState {
    signaled: bool,
    pending: Option<u64>,
}

struct CommandBufferState {
    pool: FakeHandle,
    commands: Vec<Command>,
    in_flight: bool,
}

struct Pending {
    id: u64,
    fence: Option<FakeHandle>,
    command_buffers: Vec<FakeHandle>,
    commands: Vec<Command>,
    remaining: u32,
}

struct BufferState {
    memory: FakeHandle,
}

struct ImageState {
    memory: FakeHandle,
    layout: ImageLayout,
}

struct PoolState {
    max_sets: u32,
    capacity: BTreeMap<DescriptorKind, u32>,
    sets: u32,
    used: BTreeMap<DescriptorKind, u32>,
}

struct SwapchainState {
    images: Vec<FakeHandle>,
    acquired: Vec<bool>,
    cursor: usize,
}

struct State {
    next_id: u64,
    live: HashMap<FakeHandle, &'static str>,
    fences: HashMap<FakeHandle, FenceState>,
    semaphores: HashMap<FakeHandle, bool>,
    command_buffers: HashMap<FakeHandle, CommandBufferState>,
    pending: VecDeque<Pending>,
    next_submission: u64,
    latency: u32,
    hung: bool,
    buffers: HashMap<FakeHandle, BufferState>,
    memory: HashMap<FakeHandle, Vec<u8>>,
    images: HashMap<FakeHandle, ImageState>,
    /// `(location, allocations to let through first)`.
    failing_allocations: Vec<(MemoryLocation, u32)>,
    fragmented_sets: u32,
    /// Pool resets to let through before one fails.
    failing_pool_reset: Option<u32>,
    set_layouts: HashMap<FakeHandle, Vec<LayoutBinding>>,
    pools: HashMap<FakeHandle, PoolState>,
    pools_created: u32,
    pool_resets: u32,
    descriptor_writes: Vec<DescriptorWrite>,
    surface: SurfaceSupport,
    swapchains: HashMap<FakeHandle, SwapchainState>,
    swapchains_created: u32,
    acquire_script: VecDeque<AcquireScript>,
    present_script: VecDeque<PresentScript>,
    presented: Vec<u32>,
    fence_waits: u32,
    events: Vec<FakeEvent>,
    violations: Violations,
}

impl State {
    fn alloc(&mut self, kind: &'static str) -> FakeHandle {
        self.next_id += 1;
        let handle = FakeHandle(self.next_id);
        self.live.insert(handle, kind);
        handle
    }

    fn forget(&mut self, kind: &'static str, handle: FakeHandle) {
        if self.live.remove(&handle).is_none() {
            self.violations.double_destroys += 1;
        }
        self.events.push(FakeEvent::Destroy { kind, handle });
    }

    fn retire_front(&mut self) {
        let Some(done) = self.pending.pop_front() else {
            return;
        };
        if let Some(fence) = done.fence {
            if let Some(state) = self.fences.get_mut(&fence) {
                state.signaled = true;
                state.pending = None;
            }
        }
        for cmd in &done.command_buffers {
            if let Some(state) = self.command_buffers.get_mut(cmd) {
                state.in_flight = false;
            }
        }
        for command in done.commands {
            self.apply(command);
        }
        self.events.push(FakeEvent::Retire { id: done.id });
    }

    fn retire_through(&mut self, id: u64) {
        while self.pending.front().is_some_and(|p| p.id <= id) {
            self.retire_front();
        }
    }

    fn retire_all(&mut self) {
        while !self.pending.is_empty() {
            self.retire_front();
        }
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::CopyBuffer { src, dst, size } => {
                let (Some(src), Some(dst)) = (self.buffers.get(&src), self.buffers.get(&dst))
                else {
                    return;
                };
                let (src, dst) = (src.memory, dst.memory);
                self.copy_memory(src, dst, size as usize);
            }
            Command::Transition { image, from, to } => {
                self.events.push(FakeEvent::Transition { image, from, to });
                if let Some(state) = self.images.get_mut(&image) {
                    if state.layout != from {
                        self.violations.image_layout_mismatches += 1;
                    }
                    state.layout = to;
                }
            }
            Command::CopyBufferToImage { src, dst } => {
                self.events.push(FakeEvent::CopyToImage { src, image: dst });
                let Some(src) = self.buffers.get(&src).map(|b| b.memory) else {
                    return;
                };
                let Some(image) = self.images.get(&dst) else {
                    return;
                };
                if image.layout != ImageLayout::TransferDst {
                    self.violations.image_layout_mismatches += 1;
                }
                let dst = image.memory;
                let len = self.memory.get(&dst).map_or(0, Vec::len);
                self.copy_memory(src, dst, len);
            }
        }
    }

    fn copy_memory(&mut self, src: FakeHandle, dst: FakeHandle, len: usize) {
        let Some(bytes) = self.memory.get(&src).map(|m| m[..len.min(m.len())].to_vec()) else {
            return;
        };
        if let Some(target) = self.memory.get_mut(&dst) {
            let n = bytes.len().min(target.len());
            target[..n].copy_from_slice(&bytes[..n]);
        }
    }

    fn take_allocation_failure(&mut self, location: MemoryLocation) -> bool {
        let Some(i) = self
            .failing_allocations
            .iter()
            .position(|(l, _)| *l == location)
        else {
            return false;
        };
        if self.failing_allocations[i].1 == 0 {
            self.failing_allocations.remove(i);
            true
        } else {
            self.failing_allocations[i].1 -= 1;
            false
        }
    }
}

/// Surface reported by a fresh [`FakeGpu`]: 2..=4 images at 800x600,
/// sRGB BGRA and FIFO plus mailbox.
pub fn default_surface_support() -> SurfaceSupport {
    SurfaceSupport {
        capabilities: SurfaceCapabilities {
            min_image_count: 2,
            max_image_count: 4,
            current_extent: Some(RenderSize::new(800, 600)),
            min_extent: RenderSize::new(1, 1),
            max_extent: RenderSize::new(4096, 4096),
        },
        formats: vec![
            SurfaceFormat {
                format: ColorFormat::Bgra8Unorm,
                color_space: ColorSpace::SrgbNonlinear,
            },
            SurfaceFormat {
                format: ColorFormat::Bgra8Srgb,
                color_space: ColorSpace::SrgbNonlinear,
            },
        ],
        present_modes: vec![PresentMode::Fifo, PresentMode::Mailbox],
    }
}

pub struct FakeGpu {
    state: RefCell<State>,
}

impl Default for FakeGpu {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeGpu {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(State {
                next_id: 0,
                live: HashMap::new(),
                fences: HashMap::new(),
                semaphores: HashMap::new(),
                command_buffers: HashMap::new(),
                pending: VecDeque::new(),
                next_submission: 0,
                latency: 0,
                hung: false,
                buffers: HashMap::new(),
                memory: HashMap::new(),
                images: HashMap::new(),
                failing_allocations: Vec::new(),
                fragmented_sets: 0,
                failing_pool_reset: None,
                set_layouts: HashMap::new(),
                pools: HashMap::new(),
                pools_created: 0,
                pool_resets: 0,
                descriptor_writes: Vec::new(),
                surface: default_surface_support(),
                swapchains: HashMap::new(),
                swapchains_created: 0,
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                presented: Vec::new(),
                fence_waits: 0,
                events: Vec::new(),
                violations: Violations::default(),
            }),
        }
    }

    /// A submission retires after `latency` further submissions.
    pub fn with_latency(latency: u32) -> Self {
        let gpu = Self::new();
        gpu.set_latency(latency);
        gpu
    }

    pub fn set_latency(&self, latency: u32) {
        self.state.borrow_mut().latency = latency;
    }

    /// Pending submissions never retire; fence waits on them time out.
    pub fn hang(&self) {
        self.state.borrow_mut().hung = true;
    }

    pub fn script_acquire(&self, script: impl IntoIterator<Item = AcquireScript>) {
        self.state.borrow_mut().acquire_script.extend(script);
    }

    pub fn script_present(&self, script: impl IntoIterator<Item = PresentScript>) {
        self.state.borrow_mut().present_script.extend(script);
    }

    /// The next buffer allocation in `location` fails with out-of-device-memory.
    pub fn fail_next_allocation(&self, location: MemoryLocation) {
        self.fail_allocation(location, 0);
    }

    /// Lets `skip` allocations in `location` through, then fails one.
    pub fn fail_allocation(&self, location: MemoryLocation, skip: u32) {
        self.state
            .borrow_mut()
            .failing_allocations
            .push((location, skip));
    }

    /// The next `count` descriptor set allocations report a fragmented pool.
    pub fn fragment_descriptor_allocations(&self, count: u32) {
        self.state.borrow_mut().fragmented_sets += count;
    }

    /// Lets `skip` descriptor pool resets through, then fails one with
    /// out-of-device-memory. The failed pool keeps its sets.
    pub fn fail_pool_reset(&self, skip: u32) {
        self.state.borrow_mut().failing_pool_reset = Some(skip);
    }

    pub fn set_surface_support(&self, support: SurfaceSupport) {
        self.state.borrow_mut().surface = support;
    }

    pub fn set_current_extent(&self, extent: Option<RenderSize>) {
        self.state.borrow_mut().surface.capabilities.current_extent = extent;
    }

    pub fn retire_all(&self) {
        self.state.borrow_mut().retire_all();
    }

    pub fn violations(&self) -> Violations {
        self.state.borrow().violations
    }

    pub fn events(&self) -> Vec<FakeEvent> {
        self.state.borrow().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.borrow_mut().events.clear();
    }

    pub fn live_objects(&self) -> usize {
        self.state.borrow().live.len()
    }

    pub fn live_of_kind(&self, kind: &str) -> usize {
        self.state
            .borrow()
            .live
            .values()
            .filter(|k| **k == kind)
            .count()
    }

    pub fn is_live(&self, handle: FakeHandle) -> bool {
        self.state.borrow().live.contains_key(&handle)
    }

    pub fn submission_count(&self) -> u64 {
        self.state.borrow().next_submission
    }

    pub fn pending_submissions(&self) -> usize {
        self.state.borrow().pending.len()
    }

    pub fn fence_waits(&self) -> u32 {
        self.state.borrow().fence_waits
    }

    pub fn fence_signaled(&self, fence: FakeHandle) -> bool {
        self.state
            .borrow()
            .fences
            .get(&fence)
            .is_some_and(|f| f.signaled)
    }

    pub fn pools_created(&self) -> u32 {
        self.state.borrow().pools_created
    }

    pub fn pool_resets(&self) -> u32 {
        self.state.borrow().pool_resets
    }

    pub fn descriptor_writes(&self) -> Vec<DescriptorWrite> {
        self.state.borrow().descriptor_writes.clone()
    }

    pub fn buffer_contents(&self, buffer: FakeHandle) -> Option<Vec<u8>> {
        let state = self.state.borrow();
        let memory = state.buffers.get(&buffer)?.memory;
        state.memory.get(&memory).cloned()
    }

    pub fn image_contents(&self, image: FakeHandle) -> Option<Vec<u8>> {
        let state = self.state.borrow();
        let memory = state.images.get(&image)?.memory;
        state.memory.get(&memory).cloned()
    }

    pub fn image_layout(&self, image: FakeHandle) -> Option<ImageLayout> {
        self.state.borrow().images.get(&image).map(|i| i.layout)
    }

    pub fn presented(&self) -> Vec<u32> {
        self.state.borrow().presented.clone()
    }

    pub fn swapchains_created(&self) -> u32 {
        self.state.borrow().swapchains_created
    }
}

impl GpuDevice for FakeGpu {
    type Fence = FakeHandle;
    type Semaphore = FakeHandle;
    type CommandPool = FakeHandle;
    type CommandBuffer = FakeHandle;
    type Buffer = FakeHandle;
    type Image = FakeHandle;
    type Memory = FakeHandle;
    type DescriptorSetLayout = FakeHandle;
    type DescriptorPool = FakeHandle;
    type DescriptorSet = FakeHandle;

    fn queue_family(&self, _queue: QueueKind) -> u32 {
        0
    }

    fn create_fence(&self, signaled: bool) -> Result<FakeHandle, GpuError> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        let fence = s.alloc("fence");
        s.fences.insert(
            fence,
            FenceState {
                signaled,
                pending: None,
            },
        );
        Ok(fence)
    }

    fn wait_for_fence(&self, fence: FakeHandle, _timeout: Duration) -> Result<(), GpuError> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        s.fence_waits += 1;
        s.events.push(FakeEvent::WaitFence(fence));
        let (signaled, pending) = match s.fences.get(&fence) {
            Some(f) => (f.signaled, f.pending),
            None => return Err(GpuError::Native(-1)),
        };
        if signaled {
            return Ok(());
        }
        match pending {
            Some(_) if s.hung => Err(GpuError::Timeout),
            Some(id) => {
                s.retire_through(id);
                Ok(())
            }
            None => {
                s.violations.stalled_fence_waits += 1;
                Err(GpuError::Timeout)
            }
        }
    }

    fn reset_fence(&self, fence: FakeHandle) -> Result<(), GpuError> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        s.events.push(FakeEvent::ResetFence(fence));
        let in_flight = match s.fences.get_mut(&fence) {
            Some(f) => {
                f.signaled = false;
                f.pending.is_some()
            }
            None => return Err(GpuError::Native(-1)),
        };
        if in_flight {
            s.violations.reset_in_flight_fence += 1;
        }
        Ok(())
    }

    fn destroy_fence(&self, fence: FakeHandle) {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        s.fences.remove(&fence);
        s.forget("fence", fence);
    }

    fn create_semaphore(&self) -> Result<FakeHandle, GpuError> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        let semaphore = s.alloc("semaphore");
        s.semaphores.insert(semaphore, false);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: FakeHandle) {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        s.semaphores.remove(&semaphore);
        s.forget("semaphore", semaphore);
    }

    fn create_command_pool(
        &self,
        _queue: QueueKind,
        _usage: CommandPoolUsage,
    ) -> Result<FakeHandle, GpuError> {
        Ok(self.state.borrow_mut().alloc("command pool"))
    }

    fn destroy_command_pool(&self, pool: FakeHandle) {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        let owned: Vec<FakeHandle> = s
            .command_buffers
            .iter()
            .filter(|(_, c)| c.pool == pool)
            .map(|(h, _)| *h)
            .collect();
        for cmd in owned {
            s.command_buffers.remove(&cmd);
            s.live.remove(&cmd);
        }
        s.forget("command pool", pool);
    }

    fn allocate_command_buffer(&self, pool: FakeHandle) -> Result<FakeHandle, GpuError> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        let cmd = s.alloc("command buffer");
        s.command_buffers.insert(
            cmd,
            CommandBufferState {
                pool,
                commands: Vec::new(),
                in_flight: false,
            },
        );
        Ok(cmd)
    }

    fn free_command_buffer(&self, _pool: FakeHandle, cmd: FakeHandle) {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        s.command_buffers.remove(&cmd);
        s.forget("command buffer", cmd);
    }

    fn reset_command_buffer(&self, cmd: FakeHandle) -> Result<(), GpuError> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        s.events.push(FakeEvent::ResetCommandBuffer(cmd));
        let in_flight = match s.command_buffers.get_mut(&cmd) {
            Some(c) => {
                c.commands.clear();
                c.in_flight
            }
            None => return Err(GpuError::Native(-1)),
        };
        if in_flight {
            s.violations.reset_in_flight_command_buffer += 1;
        }
        Ok(())
    }

    fn begin_command_buffer(&self, cmd: FakeHandle, _one_time: bool) -> Result<(), GpuError> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        let in_flight = match s.command_buffers.get_mut(&cmd) {
            Some(c) => {
                c.commands.clear();
                c.in_flight
            }
            None => return Err(GpuError::Native(-1)),
        };
        if in_flight {
            s.violations.reset_in_flight_command_buffer += 1;
        }
        Ok(())
    }

    fn end_command_buffer(&self, cmd: FakeHandle) -> Result<(), GpuError> {
        if self.state.borrow().command_buffers.contains_key(&cmd) {
            Ok(())
        } else {
            Err(GpuError::Native(-1))
        }
    }

    fn submit(&self, queue: QueueKind, submission: &Submission<'_, Self>) -> Result<(), GpuError> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;

        for (semaphore, _) in submission.wait {
            match s.semaphores.get_mut(semaphore) {
                Some(signaled) if *signaled => *signaled = false,
                _ => s.violations.unsignaled_semaphore_waits += 1,
            }
        }
        for semaphore in submission.signal {
            if let Some(signaled) = s.semaphores.get_mut(semaphore) {
                *signaled = true;
            }
        }

        let id = s.next_submission;
        s.next_submission += 1;

        if let Some(fence) = submission.fence {
            let (signaled, in_flight) = match s.fences.get(&fence) {
                Some(f) => (f.signaled, f.pending.is_some()),
                None => return Err(GpuError::Native(-1)),
            };
            if signaled || in_flight {
                s.violations.submit_with_signaled_fence += 1;
            }
            if let Some(f) = s.fences.get_mut(&fence) {
                f.pending = Some(id);
            }
        }

        let mut commands = Vec::new();
        for cmd in submission.command_buffers {
            if let Some(state) = s.command_buffers.get_mut(cmd) {
                state.in_flight = true;
                commands.extend(state.commands.iter().copied());
            }
        }

        for p in s.pending.iter_mut() {
            p.remaining = p.remaining.saturating_sub(1);
        }
        let remaining = s.latency;
        s.pending.push_back(Pending {
            id,
            fence: submission.fence,
            command_buffers: submission.command_buffers.to_vec(),
            commands,
            remaining,
        });
        s.events.push(FakeEvent::Submit {
            id,
            queue,
            fence: submission.fence,
        });

        if !s.hung {
            while s.pending.front().is_some_and(|p| p.remaining == 0) {
                s.retire_front();
            }
        }
        Ok(())
    }

    fn queue_wait_idle(&self, queue: QueueKind) -> Result<(), GpuError> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        s.events.push(FakeEvent::QueueWaitIdle(queue));
        if s.hung && !s.pending.is_empty() {
            return Err(GpuError::DeviceLost);
        }
        s.retire_all();
        Ok(())
    }

    fn wait_idle(&self) -> Result<(), GpuError> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        s.events.push(FakeEvent::DeviceWaitIdle);
        if s.hung && !s.pending.is_empty() {
            return Err(GpuError::DeviceLost);
        }
        s.retire_all();
        Ok(())
    }

    fn create_buffer(
        &self,
        size: u64,
        _usage: BufferUsage,
        location: MemoryLocation,
    ) -> Result<(FakeHandle, FakeHandle), GpuError> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        if s.take_allocation_failure(location) {
            return Err(GpuError::OutOfDeviceMemory);
        }
        let buffer = s.alloc("buffer");
        let memory = s.alloc("memory");
        s.memory.insert(memory, vec![0; size as usize]);
        s.buffers.insert(buffer, BufferState { memory });
        Ok((buffer, memory))
    }

    fn destroy_buffer(&self, buffer: FakeHandle, memory: FakeHandle) {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        s.buffers.remove(&buffer);
        s.memory.remove(&memory);
        s.forget("buffer", buffer);
        s.forget("memory", memory);
    }

    fn write_memory(&self, memory: FakeHandle, offset: u64, data: &[u8]) -> Result<(), GpuError> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        let target = s.memory.get_mut(&memory).ok_or(GpuError::MemoryMapFailed)?;
        check_write(target.len() as u64, offset, data.len())?;
        let start = offset as usize;
        target[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn cmd_copy_buffer(&self, cmd: FakeHandle, src: FakeHandle, dst: FakeHandle, size: u64) {
        if let Some(c) = self.state.borrow_mut().command_buffers.get_mut(&cmd) {
            c.commands.push(Command::CopyBuffer { src, dst, size });
        }
    }

    fn create_image(
        &self,
        extent: RenderSize,
        format: TextureFormat,
    ) -> Result<(FakeHandle, FakeHandle), GpuError> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        if s.take_allocation_failure(MemoryLocation::DeviceLocal) {
            return Err(GpuError::OutOfDeviceMemory);
        }
        let image = s.alloc("image");
        let memory = s.alloc("memory");
        let len = extent.width as u64 * extent.height as u64 * format.bytes_per_pixel();
        s.memory.insert(memory, vec![0; len as usize]);
        s.images.insert(
            image,
            ImageState {
                memory,
                layout: ImageLayout::Undefined,
            },
        );
        Ok((image, memory))
    }

    fn destroy_image(&self, image: FakeHandle, memory: FakeHandle) {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        s.images.remove(&image);
        s.memory.remove(&memory);
        s.forget("image", image);
        s.forget("memory", memory);
    }

    fn cmd_transition_image(
        &self,
        cmd: FakeHandle,
        image: FakeHandle,
        from: ImageLayout,
        to: ImageLayout,
    ) {
        if let Some(c) = self.state.borrow_mut().command_buffers.get_mut(&cmd) {
            c.commands.push(Command::Transition { image, from, to });
        }
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: FakeHandle,
        src: FakeHandle,
        dst: FakeHandle,
        _extent: RenderSize,
    ) {
        if let Some(c) = self.state.borrow_mut().command_buffers.get_mut(&cmd) {
            c.commands.push(Command::CopyBufferToImage { src, dst });
        }
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[LayoutBinding],
    ) -> Result<FakeHandle, GpuError> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        let layout = s.alloc("descriptor set layout");
        s.set_layouts.insert(layout, bindings.to_vec());
        Ok(layout)
    }

    fn destroy_descriptor_set_layout(&self, layout: FakeHandle) {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        s.set_layouts.remove(&layout);
        s.forget("descriptor set layout", layout);
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[PoolSize],
    ) -> Result<FakeHandle, GpuError> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        let pool = s.alloc("descriptor pool");
        let mut capacity = BTreeMap::new();
        for size in sizes {
            *capacity.entry(size.kind).or_insert(0) += size.count;
        }
        s.pools.insert(
            pool,
            PoolState {
                max_sets,
                capacity,
                sets: 0,
                used: BTreeMap::new(),
            },
        );
        s.pools_created += 1;
        Ok(pool)
    }

    fn reset_descriptor_pool(&self, pool: FakeHandle) -> Result<(), GpuError> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        match s.failing_pool_reset {
            Some(0) => {
                s.failing_pool_reset = None;
                return Err(GpuError::OutOfDeviceMemory);
            }
            Some(n) => s.failing_pool_reset = Some(n - 1),
            None => {}
        }
        let state = s.pools.get_mut(&pool).ok_or(GpuError::Native(-1))?;
        state.sets = 0;
        state.used.clear();
        s.pool_resets += 1;
        Ok(())
    }

    fn destroy_descriptor_pool(&self, pool: FakeHandle) {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        s.pools.remove(&pool);
        s.forget("descriptor pool", pool);
    }

    fn allocate_descriptor_set(
        &self,
        pool: FakeHandle,
        layout: FakeHandle,
    ) -> Result<FakeHandle, GpuError> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        if s.fragmented_sets > 0 {
            s.fragmented_sets -= 1;
            return Err(GpuError::FragmentedPool);
        }
        let bindings = s.set_layouts.get(&layout).cloned().ok_or(GpuError::Native(-1))?;
        let state = s.pools.get_mut(&pool).ok_or(GpuError::Native(-1))?;
        if state.sets >= state.max_sets {
            return Err(GpuError::OutOfPoolMemory);
        }
        for b in &bindings {
            let used = state.used.get(&b.kind).copied().unwrap_or(0);
            let cap = state.capacity.get(&b.kind).copied().unwrap_or(0);
            if used + b.count > cap {
                return Err(GpuError::OutOfPoolMemory);
            }
        }
        for b in &bindings {
            *state.used.entry(b.kind).or_insert(0) += b.count;
        }
        state.sets += 1;
        s.next_id += 1;
        Ok(FakeHandle(s.next_id))
    }

    fn write_buffer_descriptor(
        &self,
        set: FakeHandle,
        binding: &LayoutBinding,
        buffer: FakeHandle,
        range: u64,
    ) {
        self.state.borrow_mut().descriptor_writes.push(DescriptorWrite {
            set,
            binding: binding.binding,
            buffer,
            range,
        });
    }
}

impl PresentationEngine for FakeGpu {
    type Swapchain = FakeHandle;
    type ImageView = FakeHandle;

    fn surface_support(&self) -> Result<SurfaceSupport, GpuError> {
        Ok(self.state.borrow().surface.clone())
    }

    fn create_swapchain(
        &self,
        desc: &SwapchainDesc,
        old: Option<FakeHandle>,
    ) -> Result<FakeHandle, GpuError> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        let swapchain = s.alloc("swapchain");
        let images: Vec<FakeHandle> = (0..desc.image_count)
            .map(|_| {
                s.next_id += 1;
                FakeHandle(s.next_id)
            })
            .collect();
        s.swapchains.insert(
            swapchain,
            SwapchainState {
                acquired: vec![false; images.len()],
                images,
                cursor: 0,
            },
        );
        s.swapchains_created += 1;
        s.events.push(FakeEvent::CreateSwapchain {
            swapchain,
            old,
            image_count: desc.image_count,
        });
        Ok(swapchain)
    }

    fn swapchain_images(&self, swapchain: FakeHandle) -> Result<Vec<FakeHandle>, GpuError> {
        self.state
            .borrow()
            .swapchains
            .get(&swapchain)
            .map(|sc| sc.images.clone())
            .ok_or(GpuError::SurfaceLost)
    }

    fn destroy_swapchain(&self, swapchain: FakeHandle) {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        s.swapchains.remove(&swapchain);
        s.forget("swapchain", swapchain);
    }

    fn create_image_view(
        &self,
        _image: FakeHandle,
        _format: SurfaceFormat,
    ) -> Result<FakeHandle, GpuError> {
        Ok(self.state.borrow_mut().alloc("image view"))
    }

    fn destroy_image_view(&self, view: FakeHandle) {
        self.state.borrow_mut().forget("image view", view);
    }

    fn acquire_next_image(
        &self,
        swapchain: FakeHandle,
        timeout: Duration,
        signal: FakeHandle,
    ) -> Result<(u32, bool), GpuError> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        let script = s.acquire_script.pop_front().unwrap_or(AcquireScript::Ready);
        let starved = if timeout.is_zero() {
            GpuError::NotReady
        } else {
            GpuError::Timeout
        };

        let result = match script {
            AcquireScript::OutOfDate => Err(GpuError::OutOfDate),
            AcquireScript::Fail(err) => Err(err),
            AcquireScript::NeverSignal => Err(starved),
            AcquireScript::Ready | AcquireScript::Suboptimal => {
                let sc = s.swapchains.get_mut(&swapchain).ok_or(GpuError::SurfaceLost)?;
                let n = sc.images.len();
                let free = (0..n)
                    .map(|i| (sc.cursor + i) % n)
                    .find(|&i| !sc.acquired[i]);
                match free {
                    Some(i) => {
                        sc.acquired[i] = true;
                        sc.cursor = (i + 1) % n;
                        Ok((i as u32, script == AcquireScript::Suboptimal))
                    }
                    None => Err(starved),
                }
            }
        };

        if result.is_ok() {
            match s.semaphores.get_mut(&signal) {
                Some(signaled) if *signaled => s.violations.signaled_semaphore_reuse += 1,
                Some(signaled) => *signaled = true,
                None => {}
            }
        }
        s.events.push(FakeEvent::Acquire(result.map(|(i, _)| i)));
        result
    }

    fn queue_present(
        &self,
        swapchain: FakeHandle,
        image_index: u32,
        wait: FakeHandle,
    ) -> Result<bool, GpuError> {
        let mut guard = self.state.borrow_mut();
        let s = &mut *guard;
        match s.semaphores.get_mut(&wait) {
            Some(signaled) if *signaled => *signaled = false,
            _ => s.violations.unsignaled_semaphore_waits += 1,
        }
        if let Some(sc) = s.swapchains.get_mut(&swapchain) {
            if let Some(slot) = sc.acquired.get_mut(image_index as usize) {
                *slot = false;
            }
        }
        s.presented.push(image_index);
        s.events.push(FakeEvent::Present(image_index));

        match s.present_script.pop_front().unwrap_or(PresentScript::Success) {
            PresentScript::Success => Ok(false),
            PresentScript::Suboptimal => Ok(true),
            PresentScript::OutOfDate => Err(GpuError::OutOfDate),
            PresentScript::Fail(err) => Err(err),
        }
    }
}

/// Recorder that records nothing and remembers what it was asked to do.
#[derive(Debug, Default)]
pub struct CountingRecorder {
    /// `(slot, image_index, frame_number)` per recorded frame.
    pub frames: Vec<(usize, u32, u64)>,
    pub rebuilds: u32,
    pub releases: u32,
    pub last_extent: Option<RenderSize>,
}

impl<D: PresentationEngine> FrameRecorder<D> for CountingRecorder {
    fn rebuild_targets(
        &mut self,
        _device: &D,
        swapchain: &SwapchainManager<D>,
    ) -> Result<(), FatalError> {
        self.rebuilds += 1;
        self.last_extent = Some(swapchain.extent());
        Ok(())
    }

    fn record(&mut self, _device: &D, frame: &FrameContext<'_, D>) -> Result<(), FatalError> {
        self.frames
            .push((frame.slot, frame.image_index, frame.frame_number));
        Ok(())
    }

    fn release_targets(&mut self, _device: &D) {
        self.releases += 1;
    }
}

/// Scripted window: closes after a number of polls and can change size at
/// given polls.
#[derive(Debug)]
pub struct FakeSurface {
    size: RenderSize,
    close_after: Option<u32>,
    polls: u32,
    resizes: Vec<(u32, RenderSize)>,
}

impl FakeSurface {
    pub fn new(size: RenderSize) -> Self {
        Self {
            size,
            close_after: None,
            polls: 0,
            resizes: Vec::new(),
        }
    }

    pub fn close_after_polls(mut self, polls: u32) -> Self {
        self.close_after = Some(polls);
        self
    }

    /// After the `poll`-th call to `poll_events` the framebuffer is `size`.
    pub fn resize_at(mut self, poll: u32, size: RenderSize) -> Self {
        self.resizes.push((poll, size));
        self
    }

    pub fn polls(&self) -> u32 {
        self.polls
    }
}

impl SurfaceProvider for FakeSurface {
    fn should_close(&self) -> bool {
        self.close_after.is_some_and(|n| self.polls >= n)
    }

    fn poll_events(&mut self) {
        self.polls += 1;
        let polls = self.polls;
        if let Some((_, size)) = self.resizes.iter().find(|(at, _)| *at == polls) {
            self.size = *size;
        }
    }

    fn framebuffer_size(&self) -> RenderSize {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submission_retires_after_latency() {
        let gpu = FakeGpu::with_latency(1);
        let fence = gpu.create_fence(false).unwrap();
        let submission = Submission::<FakeGpu> {
            wait: &[],
            command_buffers: &[],
            signal: &[],
            fence: Some(fence),
        };
        gpu.submit(QueueKind::Graphics, &submission).unwrap();
        assert!(!gpu.fence_signaled(fence));

        let empty = Submission::<FakeGpu> {
            wait: &[],
            command_buffers: &[],
            signal: &[],
            fence: None,
        };
        gpu.submit(QueueKind::Graphics, &empty).unwrap();
        assert!(gpu.fence_signaled(fence));
        assert!(gpu.violations().is_clean());
    }

    #[test]
    fn waiting_on_an_orphan_fence_is_counted() {
        let gpu = FakeGpu::new();
        let fence = gpu.create_fence(false).unwrap();
        let err = gpu.wait_for_fence(fence, Duration::from_secs(1)).unwrap_err();
        assert_eq!(err, GpuError::Timeout);
        assert_eq!(gpu.violations().stalled_fence_waits, 1);
    }

    #[test]
    fn double_destroy_is_counted() {
        let gpu = FakeGpu::new();
        let semaphore = gpu.create_semaphore().unwrap();
        gpu.destroy_semaphore(semaphore);
        gpu.destroy_semaphore(semaphore);
        assert_eq!(gpu.violations().double_destroys, 1);
        assert_eq!(gpu.live_objects(), 0);
    }

    #[test]
    fn surface_closes_after_scripted_polls() {
        let mut surface = FakeSurface::new(RenderSize::new(64, 64))
            .close_after_polls(2)
            .resize_at(1, RenderSize::new(0, 0));
        assert!(!surface.should_close());
        surface.poll_events();
        assert!(surface.framebuffer_size().is_empty());
        surface.poll_events();
        assert!(surface.should_close());
    }
}
