// SPDX-License-Identifier: CEPL-1.0
//! Round-robin frame driver.
//!
//! One iteration: wait on the slot fence, acquire an image, reset the fence,
//! re-record the slot's command buffer, submit, present. The fence is reset
//! only once an image is in hand; an acquire that times out or reports an
//! out-of-date surface leaves it signaled, so the next wait on the slot can
//! never block on work that was not submitted.

use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::error::{FatalError, RenderResult};
use crate::frame::FrameSlot;
use crate::gpu::{GpuDevice, PresentationEngine};
use crate::lifetime::ResourceLifetimeRegistry;
use crate::surface::SurfaceProvider;
use crate::swapchain::{AcquireResult, PresentResult, SwapchainManager};
use crate::{RenderSize, MAX_FRAMES_IN_FLIGHT};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameLoopConfig {
    pub frames_in_flight: usize,
    /// Per-frame fence wait. Expiry means the device is lost or hung.
    pub fence_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl Default for FrameLoopConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: MAX_FRAMES_IN_FLIGHT,
            fence_timeout: Duration::from_secs(10),
            acquire_timeout: Duration::from_secs(1),
        }
    }
}

/// What one call to [`FrameLoop::draw_frame`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented { slot: usize, image_index: u32 },
    /// No image became available; nothing was submitted.
    AcquireTimeout,
    /// The swapchain and the recorder's targets were rebuilt; nothing was
    /// submitted.
    SwapchainRecreated,
    /// Zero-sized framebuffer.
    Paused,
}

/// Everything a recorder needs to fill one frame's command buffer.
pub struct FrameContext<'a, D: PresentationEngine> {
    pub cmd: D::CommandBuffer,
    pub slot: usize,
    pub image_index: u32,
    pub frame_number: u64,
    pub swapchain: &'a SwapchainManager<D>,
}

/// Records draw commands and owns the swapchain-dependent objects
/// (framebuffers, render pass, pipeline) that must follow recreation.
pub trait FrameRecorder<D: PresentationEngine> {
    /// Builds image-dependent objects for the current swapchain. Called after
    /// every recreation with the device idle.
    fn rebuild_targets(&mut self, device: &D, swapchain: &SwapchainManager<D>)
        -> RenderResult<()>;

    /// Fills `frame.cmd`, already begun. The slot's previous submission has
    /// retired, so per-slot resources may be rewritten here.
    fn record(&mut self, device: &D, frame: &FrameContext<'_, D>) -> RenderResult<()>;

    /// Destroys image-dependent objects. The device is idle.
    fn release_targets(&mut self, device: &D);
}

pub struct FrameLoop<D: GpuDevice> {
    slots: Vec<FrameSlot<D>>,
    config: FrameLoopConfig,
    frame_number: u64,
    recreate_pending: bool,
}

impl<D: PresentationEngine> FrameLoop<D> {
    pub fn new(
        device: &D,
        config: FrameLoopConfig,
        registry: &mut ResourceLifetimeRegistry<D>,
    ) -> RenderResult<Self> {
        debug_assert!(config.frames_in_flight > 0);
        let slots = (0..config.frames_in_flight)
            .map(|i| FrameSlot::new(device, i, registry))
            .collect::<RenderResult<Vec<_>>>()?;
        info!(slots = slots.len(), "frame loop ready");
        Ok(Self {
            slots,
            config,
            frame_number: 0,
            recreate_pending: false,
        })
    }

    pub fn config(&self) -> &FrameLoopConfig {
        &self.config
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn slots(&self) -> &[FrameSlot<D>] {
        &self.slots
    }

    /// Index of the slot the next frame will use.
    pub fn current_slot(&self) -> usize {
        (self.frame_number % self.slots.len() as u64) as usize
    }

    /// Rebuild the swapchain before the next frame (window resized).
    pub fn request_recreate(&mut self) {
        self.recreate_pending = true;
    }

    pub fn draw_frame<R: FrameRecorder<D>>(
        &mut self,
        device: &D,
        swapchain: &mut SwapchainManager<D>,
        recorder: &mut R,
        framebuffer: RenderSize,
    ) -> RenderResult<FrameOutcome> {
        if framebuffer.is_empty() {
            trace!("framebuffer is empty; paused");
            return Ok(FrameOutcome::Paused);
        }
        if self.recreate_pending {
            self.recreate(device, swapchain, recorder, framebuffer)?;
            return Ok(FrameOutcome::SwapchainRecreated);
        }

        let slot_index = self.current_slot();
        let slot = &mut self.slots[slot_index];
        slot.wait(device, self.config.fence_timeout)?;

        let image_index = match swapchain.acquire_next_image(
            device,
            slot.image_available(),
            self.config.acquire_timeout,
        )? {
            AcquireResult::Ready {
                image_index,
                suboptimal,
            } => {
                if suboptimal {
                    self.recreate_pending = true;
                }
                image_index
            }
            AcquireResult::Timeout => return Ok(FrameOutcome::AcquireTimeout),
            AcquireResult::OutOfDate => {
                debug!("acquire reported out-of-date surface");
                self.recreate(device, swapchain, recorder, framebuffer)?;
                return Ok(FrameOutcome::SwapchainRecreated);
            }
        };

        let slot = &mut self.slots[slot_index];
        let cmd = slot.begin(device)?;
        recorder.record(
            device,
            &FrameContext {
                cmd,
                slot: slot_index,
                image_index,
                frame_number: self.frame_number,
                swapchain: &*swapchain,
            },
        )?;
        slot.submit(device)?;

        match swapchain.present(device, image_index, slot.render_finished())? {
            PresentResult::Success => {}
            PresentResult::OutOfDate => {
                debug!("present reported out-of-date surface");
                self.recreate_pending = true;
            }
        }

        self.frame_number += 1;
        Ok(FrameOutcome::Presented {
            slot: slot_index,
            image_index,
        })
    }

    /// Waits on every slot's fence.
    pub fn drain(&mut self, device: &D) -> RenderResult<()> {
        for slot in &mut self.slots {
            slot.wait(device, self.config.fence_timeout)?;
        }
        Ok(())
    }

    fn recreate<R: FrameRecorder<D>>(
        &mut self,
        device: &D,
        swapchain: &mut SwapchainManager<D>,
        recorder: &mut R,
        framebuffer: RenderSize,
    ) -> RenderResult<()> {
        self.drain(device)?;
        device
            .wait_idle()
            .map_err(FatalError::device("device wait idle"))?;
        recorder.release_targets(device);
        swapchain.recreate(device, framebuffer)?;
        recorder.rebuild_targets(device, swapchain)?;
        self.recreate_pending = false;
        Ok(())
    }

    /// Runs until the surface asks to close or `max_frames` frames were
    /// presented, then drains. Returns the number of presented frames.
    pub fn run<S, R>(
        &mut self,
        device: &D,
        swapchain: &mut SwapchainManager<D>,
        recorder: &mut R,
        surface: &mut S,
        max_frames: Option<u64>,
    ) -> RenderResult<u64>
    where
        S: SurfaceProvider,
        R: FrameRecorder<D>,
    {
        let mut presented = 0u64;
        let mut last_size = surface.framebuffer_size();
        let mut timeouts = 0u32;

        while !surface.should_close() {
            if max_frames.is_some_and(|max| presented >= max) {
                break;
            }
            surface.poll_events();
            let size = surface.framebuffer_size();
            if size != last_size {
                debug!(width = size.width, height = size.height, "framebuffer resized");
                last_size = size;
                if !size.is_empty() {
                    self.request_recreate();
                }
            }

            match self.draw_frame(device, swapchain, recorder, size)? {
                FrameOutcome::Presented { .. } => {
                    presented += 1;
                    timeouts = 0;
                }
                FrameOutcome::AcquireTimeout => {
                    timeouts += 1;
                    if timeouts % 60 == 0 {
                        warn!(timeouts, "swapchain image acquisition keeps timing out");
                    }
                }
                FrameOutcome::SwapchainRecreated | FrameOutcome::Paused => {}
            }
        }

        self.drain(device)?;
        info!(presented, frames = self.frame_number, "frame loop stopped");
        Ok(presented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::PresentMode;
    use crate::testing::{AcquireScript, CountingRecorder, FakeEvent, FakeGpu};

    fn setup(
        gpu: &FakeGpu,
        frames_in_flight: usize,
    ) -> (
        ResourceLifetimeRegistry<FakeGpu>,
        FrameLoop<FakeGpu>,
        SwapchainManager<FakeGpu>,
        CountingRecorder,
    ) {
        let mut registry = ResourceLifetimeRegistry::new("test");
        let config = FrameLoopConfig {
            frames_in_flight,
            ..FrameLoopConfig::default()
        };
        let frames = FrameLoop::new(gpu, config, &mut registry).unwrap();
        let swapchain =
            SwapchainManager::new(gpu, RenderSize::new(800, 600), PresentMode::Fifo).unwrap();
        let mut recorder = CountingRecorder::default();
        recorder.rebuild_targets(gpu, &swapchain).unwrap();
        (registry, frames, swapchain, recorder)
    }

    const SIZE: RenderSize = RenderSize::new(800, 600);

    #[test]
    fn fence_is_not_reset_when_acquire_times_out() {
        let gpu = FakeGpu::new();
        let (mut registry, mut frames, mut sc, mut rec) = setup(&gpu, 2);
        gpu.script_acquire([AcquireScript::NeverSignal]);

        let outcome = frames.draw_frame(&gpu, &mut sc, &mut rec, SIZE).unwrap();
        assert_eq!(outcome, FrameOutcome::AcquireTimeout);
        assert_eq!(frames.frame_number(), 0);
        assert!(!gpu
            .events()
            .iter()
            .any(|e| matches!(e, FakeEvent::ResetFence(_))));

        // Same slot again: the fence is still signaled, nothing stalls.
        let outcome = frames.draw_frame(&gpu, &mut sc, &mut rec, SIZE).unwrap();
        assert_eq!(
            outcome,
            FrameOutcome::Presented {
                slot: 0,
                image_index: 0
            }
        );
        assert!(gpu.violations().is_clean());

        frames.drain(&gpu).unwrap();
        sc.destroy(&gpu);
        registry.flush_all(&gpu);
    }

    #[test]
    fn zero_size_pauses_without_touching_the_gpu() {
        let gpu = FakeGpu::new();
        let (mut registry, mut frames, mut sc, mut rec) = setup(&gpu, 2);
        gpu.clear_events();

        let outcome = frames
            .draw_frame(&gpu, &mut sc, &mut rec, RenderSize::new(0, 600))
            .unwrap();
        assert_eq!(outcome, FrameOutcome::Paused);
        assert!(gpu.events().is_empty());

        sc.destroy(&gpu);
        registry.flush_all(&gpu);
    }

    #[test]
    fn suboptimal_acquire_presents_then_recreates() {
        let gpu = FakeGpu::new();
        let (mut registry, mut frames, mut sc, mut rec) = setup(&gpu, 2);
        gpu.script_acquire([AcquireScript::Suboptimal]);

        assert!(matches!(
            frames.draw_frame(&gpu, &mut sc, &mut rec, SIZE).unwrap(),
            FrameOutcome::Presented { slot: 0, .. }
        ));
        assert_eq!(
            frames.draw_frame(&gpu, &mut sc, &mut rec, SIZE).unwrap(),
            FrameOutcome::SwapchainRecreated
        );
        assert_eq!(rec.rebuilds, 2);
        assert_eq!(rec.releases, 1);
        assert!(matches!(
            frames.draw_frame(&gpu, &mut sc, &mut rec, SIZE).unwrap(),
            FrameOutcome::Presented { slot: 1, .. }
        ));
        assert!(gpu.violations().is_clean());

        frames.drain(&gpu).unwrap();
        sc.destroy(&gpu);
        registry.flush_all(&gpu);
    }
}
