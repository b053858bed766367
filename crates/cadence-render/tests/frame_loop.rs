// SPDX-License-Identifier: CEPL-1.0
use std::time::Duration;

use cadence_render::gpu::{GpuDevice, PresentMode, SurfaceCapabilities};
use cadence_render::swapchain::{choose_extent, choose_image_count};
use cadence_render::testing::{
    AcquireScript, CountingRecorder, FakeEvent, FakeGpu, FakeSurface, PresentScript,
};
use cadence_render::{
    AcquireResult, FatalError, FrameLoop, FrameLoopConfig, FrameOutcome, FrameRecorder,
    RenderSize, ResourceLifetimeRegistry, SwapchainManager,
};

const SIZE: RenderSize = RenderSize::new(800, 600);

struct Rig {
    registry: ResourceLifetimeRegistry<FakeGpu>,
    frames: FrameLoop<FakeGpu>,
    swapchain: SwapchainManager<FakeGpu>,
    recorder: CountingRecorder,
}

impl Rig {
    fn new(gpu: &FakeGpu, frames_in_flight: usize) -> Self {
        let mut registry = ResourceLifetimeRegistry::new("rig");
        let config = FrameLoopConfig {
            frames_in_flight,
            fence_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_millis(100),
        };
        let frames = FrameLoop::new(gpu, config, &mut registry).unwrap();
        let swapchain = SwapchainManager::new(gpu, SIZE, PresentMode::Fifo).unwrap();
        let mut recorder = CountingRecorder::default();
        recorder.rebuild_targets(gpu, &swapchain).unwrap();
        Self {
            registry,
            frames,
            swapchain,
            recorder,
        }
    }

    fn draw(&mut self, gpu: &FakeGpu) -> FrameOutcome {
        self.frames
            .draw_frame(gpu, &mut self.swapchain, &mut self.recorder, SIZE)
            .unwrap()
    }

    fn shutdown(mut self, gpu: &FakeGpu) {
        self.frames.drain(gpu).unwrap();
        gpu.wait_idle().unwrap();
        self.recorder.release_targets(gpu);
        self.swapchain.destroy(gpu);
        self.registry.flush_all(gpu);
    }
}

#[test]
fn two_slots_with_immediate_fences_alternate() {
    let gpu = FakeGpu::new();
    let mut rig = Rig::new(&gpu, 2);

    let slots: Vec<usize> = (0..3)
        .map(|_| match rig.draw(&gpu) {
            FrameOutcome::Presented { slot, .. } => slot,
            other => panic!("unexpected outcome {other:?}"),
        })
        .collect();

    assert_eq!(slots, vec![0, 1, 0]);
    assert_eq!(rig.frames.frame_number(), 3);
    assert!(gpu.violations().is_clean());
    rig.shutdown(&gpu);
}

#[test]
fn delayed_gpu_never_reuses_a_busy_slot() {
    for (slots, latency) in [(2, 1), (2, 4), (3, 2), (1, 3)] {
        let gpu = FakeGpu::with_latency(latency);
        let mut rig = Rig::new(&gpu, slots);

        for _ in 0..25 {
            assert!(matches!(rig.draw(&gpu), FrameOutcome::Presented { .. }));
        }

        let v = gpu.violations();
        assert_eq!(v.stalled_fence_waits, 0, "slots={slots} latency={latency}");
        assert_eq!(v.reset_in_flight_command_buffer, 0);
        assert_eq!(v.reset_in_flight_fence, 0);
        assert!(v.is_clean(), "{v:?}");
        rig.shutdown(&gpu);
        assert_eq!(gpu.live_objects(), 0);
    }
}

#[test]
fn frame_numbers_and_slots_reach_the_recorder() {
    let gpu = FakeGpu::with_latency(1);
    let mut rig = Rig::new(&gpu, 2);
    for _ in 0..4 {
        rig.draw(&gpu);
    }
    let seen: Vec<(usize, u64)> = rig.recorder.frames.iter().map(|f| (f.0, f.2)).collect();
    assert_eq!(seen, vec![(0, 0), (1, 1), (0, 2), (1, 3)]);
    rig.shutdown(&gpu);
}

#[test]
fn acquire_returns_timeout_instead_of_blocking() {
    let gpu = FakeGpu::new();
    let swapchain = SwapchainManager::new(&gpu, SIZE, PresentMode::Fifo).unwrap();
    let semaphores: Vec<_> = (0..4).map(|_| gpu.create_semaphore().unwrap()).collect();

    // Hold every image; a zero timeout must not wait for one to come back.
    for sem in &semaphores[..3] {
        assert!(matches!(
            swapchain
                .acquire_next_image(&gpu, *sem, Duration::ZERO)
                .unwrap(),
            AcquireResult::Ready { .. }
        ));
    }
    assert_eq!(
        swapchain
            .acquire_next_image(&gpu, semaphores[3], Duration::ZERO)
            .unwrap(),
        AcquireResult::Timeout
    );

    gpu.script_acquire([AcquireScript::NeverSignal]);
    assert_eq!(
        swapchain
            .acquire_next_image(&gpu, semaphores[3], Duration::from_millis(50))
            .unwrap(),
        AcquireResult::Timeout
    );
}

#[test]
fn acquire_timeout_skips_the_frame_and_keeps_the_slot() {
    let gpu = FakeGpu::with_latency(2);
    let mut rig = Rig::new(&gpu, 2);
    rig.draw(&gpu);
    gpu.script_acquire([AcquireScript::NeverSignal, AcquireScript::NeverSignal]);

    assert_eq!(rig.draw(&gpu), FrameOutcome::AcquireTimeout);
    assert_eq!(rig.draw(&gpu), FrameOutcome::AcquireTimeout);
    assert!(matches!(
        rig.draw(&gpu),
        FrameOutcome::Presented { slot: 1, .. }
    ));
    assert!(gpu.violations().is_clean());
    rig.shutdown(&gpu);
}

#[test]
fn surface_capabilities_pick_count_and_extent() {
    let caps = SurfaceCapabilities {
        min_image_count: 2,
        max_image_count: 4,
        current_extent: Some(RenderSize::new(800, 600)),
        min_extent: RenderSize::new(1, 1),
        max_extent: RenderSize::new(4096, 4096),
    };
    assert_eq!(choose_image_count(&caps), 3);
    assert_eq!(choose_extent(&caps, RenderSize::new(1280, 720)), SIZE);

    let gpu = FakeGpu::new();
    let swapchain = SwapchainManager::new(&gpu, RenderSize::new(1280, 720), PresentMode::Fifo)
        .unwrap();
    assert_eq!(swapchain.image_count(), 3);
    assert_eq!(swapchain.views().len(), 3);
    assert_eq!(swapchain.extent(), SIZE);
    swapchain.destroy(&gpu);
}

#[test]
fn out_of_date_acquire_recreates_after_draining() {
    let gpu = FakeGpu::with_latency(3);
    let mut rig = Rig::new(&gpu, 2);
    rig.draw(&gpu);
    rig.draw(&gpu);
    let old = rig.swapchain.handle();
    gpu.clear_events();

    gpu.set_current_extent(Some(RenderSize::new(640, 480)));
    gpu.script_acquire([AcquireScript::OutOfDate]);
    assert_eq!(rig.draw(&gpu), FrameOutcome::SwapchainRecreated);

    let events = gpu.events();
    let created = events
        .iter()
        .position(|e| matches!(e, FakeEvent::CreateSwapchain { old: Some(h), .. } if *h == old))
        .expect("swapchain recreated with the old handle");
    let old_destroyed = events
        .iter()
        .position(|e| matches!(e, FakeEvent::Destroy { kind: "swapchain", handle } if *handle == old))
        .expect("old swapchain destroyed");
    let idle = events
        .iter()
        .position(|e| *e == FakeEvent::DeviceWaitIdle)
        .expect("device idle before recreation");
    assert!(idle < created && created < old_destroyed);
    assert_eq!(gpu.pending_submissions(), 0);

    assert_eq!(rig.recorder.rebuilds, 2);
    assert_eq!(rig.recorder.releases, 1);
    assert_eq!(rig.recorder.last_extent, Some(RenderSize::new(640, 480)));
    assert_eq!(rig.swapchain.generation(), 1);

    assert!(matches!(rig.draw(&gpu), FrameOutcome::Presented { .. }));
    assert!(gpu.violations().is_clean());
    rig.shutdown(&gpu);
}

#[test]
fn out_of_date_present_recreates_before_next_frame() {
    let gpu = FakeGpu::new();
    let mut rig = Rig::new(&gpu, 2);
    gpu.script_present([PresentScript::OutOfDate]);

    assert!(matches!(rig.draw(&gpu), FrameOutcome::Presented { .. }));
    assert_eq!(rig.draw(&gpu), FrameOutcome::SwapchainRecreated);
    assert_eq!(gpu.swapchains_created(), 2);
    assert!(matches!(rig.draw(&gpu), FrameOutcome::Presented { .. }));
    rig.shutdown(&gpu);
}

#[test]
fn hung_device_is_fatal_fence_timeout() {
    let gpu = FakeGpu::with_latency(10);
    let mut rig = Rig::new(&gpu, 2);
    rig.draw(&gpu);
    rig.draw(&gpu);
    gpu.hang();

    let err = rig
        .frames
        .draw_frame(&gpu, &mut rig.swapchain, &mut rig.recorder, SIZE)
        .unwrap_err();
    assert!(matches!(err, FatalError::FenceTimeout { slot: 0, .. }));
    assert!(err.to_string().contains("device lost or hung"));
}

#[test]
fn run_follows_the_surface_and_drains() {
    let gpu = FakeGpu::with_latency(2);
    let mut rig = Rig::new(&gpu, 2);
    let mut surface = FakeSurface::new(SIZE)
        .resize_at(3, RenderSize::new(0, 0))
        .resize_at(5, RenderSize::new(1024, 768))
        .close_after_polls(9);
    gpu.set_current_extent(None);

    let presented = rig
        .frames
        .run(
            &gpu,
            &mut rig.swapchain,
            &mut rig.recorder,
            &mut surface,
            None,
        )
        .unwrap();

    // Polls 1-2 draw, 3-4 pause, 5 recreates, 6-9 draw.
    assert_eq!(presented, 6);
    assert_eq!(rig.swapchain.extent(), RenderSize::new(1024, 768));
    assert_eq!(gpu.pending_submissions(), 0);
    assert!(gpu.violations().is_clean());
    rig.shutdown(&gpu);
    assert_eq!(gpu.live_objects(), 0);
}

#[test]
fn run_stops_at_frame_limit() {
    let gpu = FakeGpu::new();
    let mut rig = Rig::new(&gpu, 2);
    let mut surface = FakeSurface::new(SIZE);

    let presented = rig
        .frames
        .run(
            &gpu,
            &mut rig.swapchain,
            &mut rig.recorder,
            &mut surface,
            Some(5),
        )
        .unwrap();
    assert_eq!(presented, 5);
    assert_eq!(surface.polls(), 5);
    rig.shutdown(&gpu);
}

#[test]
fn shutdown_waits_on_every_fence_before_destroying() {
    let gpu = FakeGpu::with_latency(5);
    let mut rig = Rig::new(&gpu, 2);
    rig.draw(&gpu);
    rig.draw(&gpu);
    assert_eq!(gpu.pending_submissions(), 2);
    gpu.clear_events();

    rig.shutdown(&gpu);

    let events = gpu.events();
    let first_destroy = events
        .iter()
        .position(|e| matches!(e, FakeEvent::Destroy { .. }))
        .unwrap();
    let waits = events[..first_destroy]
        .iter()
        .filter(|e| matches!(e, FakeEvent::WaitFence(_)))
        .count();
    assert_eq!(waits, 2);
    assert!(gpu.violations().is_clean());
    assert_eq!(gpu.live_objects(), 0);
}
