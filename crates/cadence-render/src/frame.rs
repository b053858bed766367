// SPDX-License-Identifier: CEPL-1.0
use std::time::Duration;

use tracing::trace;

use crate::error::{FatalError, GpuError, RenderResult};
use crate::gpu::{CommandPoolUsage, GpuDevice, PipelineStages, QueueKind, Submission};
use crate::lifetime::ResourceLifetimeRegistry;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Recording,
    Submitted,
}

/// Per-frame synchronization objects and command buffer.
///
/// The fence starts signaled so the first wait on a fresh slot returns at
/// once. The command buffer is only reset after that wait.
pub struct FrameSlot<D: GpuDevice> {
    index: usize,
    in_flight: D::Fence,
    image_available: D::Semaphore,
    render_finished: D::Semaphore,
    command_pool: D::CommandPool,
    cmd: D::CommandBuffer,
    state: SlotState,
}

impl<D: GpuDevice> FrameSlot<D> {
    pub fn new(
        device: &D,
        index: usize,
        registry: &mut ResourceLifetimeRegistry<D>,
    ) -> RenderResult<Self> {
        let command_pool = device
            .create_command_pool(QueueKind::Graphics, CommandPoolUsage::Resettable)
            .map_err(FatalError::creation("frame command pool"))?;
        registry.register(move |d: &D| d.destroy_command_pool(command_pool));

        let cmd = device
            .allocate_command_buffer(command_pool)
            .map_err(FatalError::creation("frame command buffer"))?;

        let in_flight = device
            .create_fence(true)
            .map_err(FatalError::creation("frame fence"))?;
        registry.register(move |d: &D| d.destroy_fence(in_flight));

        let image_available = device
            .create_semaphore()
            .map_err(FatalError::creation("image-available semaphore"))?;
        registry.register(move |d: &D| d.destroy_semaphore(image_available));

        let render_finished = device
            .create_semaphore()
            .map_err(FatalError::creation("render-finished semaphore"))?;
        registry.register(move |d: &D| d.destroy_semaphore(render_finished));

        Ok(Self {
            index,
            in_flight,
            image_available,
            render_finished,
            command_pool,
            cmd,
            state: SlotState::Idle,
        })
    }

    /// Blocks until the slot's previous submission retired. Expiry is fatal.
    pub fn wait(&mut self, device: &D, timeout: Duration) -> RenderResult<()> {
        match device.wait_for_fence(self.in_flight, timeout) {
            Ok(()) => {
                self.state = SlotState::Idle;
                Ok(())
            }
            Err(GpuError::Timeout) => Err(FatalError::FenceTimeout {
                slot: self.index,
                timeout,
            }),
            Err(e) => Err(FatalError::device("wait for frame fence")(e)),
        }
    }

    /// `Idle -> Recording`. Only valid once [`wait`](Self::wait) returned and
    /// an image was acquired for this frame.
    pub fn begin(&mut self, device: &D) -> RenderResult<D::CommandBuffer> {
        debug_assert_eq!(self.state, SlotState::Idle, "slot {} not idle", self.index);
        device
            .reset_fence(self.in_flight)
            .map_err(FatalError::device("reset frame fence"))?;
        device
            .reset_command_buffer(self.cmd)
            .map_err(FatalError::device("reset frame command buffer"))?;
        device
            .begin_command_buffer(self.cmd, true)
            .map_err(FatalError::device("begin frame command buffer"))?;
        self.state = SlotState::Recording;
        Ok(self.cmd)
    }

    /// `Recording -> Submitted`: waits on image-available at colour output,
    /// signals render-finished and the slot fence.
    pub fn submit(&mut self, device: &D) -> RenderResult<()> {
        debug_assert_eq!(self.state, SlotState::Recording);
        device
            .end_command_buffer(self.cmd)
            .map_err(FatalError::device("end frame command buffer"))?;
        let submission = Submission::<D> {
            wait: &[(self.image_available, PipelineStages::COLOR_ATTACHMENT_OUTPUT)],
            command_buffers: &[self.cmd],
            signal: &[self.render_finished],
            fence: Some(self.in_flight),
        };
        device
            .submit(QueueKind::Graphics, &submission)
            .map_err(FatalError::device("graphics queue submit"))?;
        self.state = SlotState::Submitted;
        trace!(slot = self.index, "submitted");
        Ok(())
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn fence(&self) -> D::Fence {
        self.in_flight
    }

    pub fn image_available(&self) -> D::Semaphore {
        self.image_available
    }

    pub fn render_finished(&self) -> D::Semaphore {
        self.render_finished
    }

    pub fn command_pool(&self) -> D::CommandPool {
        self.command_pool
    }

    pub fn command_buffer(&self) -> D::CommandBuffer {
        self.cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeGpu;

    #[test]
    fn fresh_slot_wait_returns_immediately() {
        let gpu = FakeGpu::new();
        let mut registry = ResourceLifetimeRegistry::new("test");
        let mut slot = FrameSlot::new(&gpu, 0, &mut registry).unwrap();

        slot.wait(&gpu, Duration::from_secs(1)).unwrap();
        assert_eq!(slot.state(), SlotState::Idle);
        assert!(gpu.violations().is_clean());

        registry.flush_all(&gpu);
        // The command buffer dies with its pool.
        assert_eq!(gpu.live_objects(), 0);
    }

    #[test]
    fn hung_gpu_turns_into_fence_timeout() {
        let gpu = FakeGpu::with_latency(5);
        let mut registry = ResourceLifetimeRegistry::new("test");
        let mut slot = FrameSlot::new(&gpu, 1, &mut registry).unwrap();

        slot.wait(&gpu, Duration::from_secs(1)).unwrap();
        slot.begin(&gpu).unwrap();
        let sem = slot.image_available();
        // Stand in for the presentation engine's acquire signal.
        gpu.submit(
            QueueKind::Graphics,
            &Submission::<FakeGpu> {
                wait: &[],
                command_buffers: &[],
                signal: &[sem],
                fence: None,
            },
        )
        .unwrap();
        slot.submit(&gpu).unwrap();
        gpu.hang();

        let err = slot.wait(&gpu, Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, FatalError::FenceTimeout { slot: 1, .. }));
        registry.flush_all(&gpu);
    }
}
