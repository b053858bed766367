// SPDX-License-Identifier: CEPL-1.0
//! Demo scene: a coloured quad spinning about its normal.

use std::time::Instant;

use cadence_core::FpsCounter;
use cadence_render::{FrameContext, FrameRecorder, RenderResult, SwapchainManager, Vertex};
use cadence_render_vk::{DeviceContext, MeshRenderer};
use glam::{Mat4, Vec3};

pub fn quad() -> (Vec<Vertex>, Vec<u16>) {
    let vertices = vec![
        Vertex::new([-0.5, -0.5, 0.0], [1.0, 0.0, 0.0]),
        Vertex::new([0.5, -0.5, 0.0], [0.0, 1.0, 0.0]),
        Vertex::new([0.5, 0.5, 0.0], [0.0, 0.0, 1.0]),
        Vertex::new([-0.5, 0.5, 0.0], [1.0, 1.0, 1.0]),
    ];
    (vertices, vec![0, 1, 2, 2, 3, 0])
}

/// Perspective camera at z = 2 looking at the origin, quad rotated by
/// `seconds`. Vulkan clip space: Y points down.
pub fn mvp(seconds: f32, aspect: f32) -> Mat4 {
    let mut proj = Mat4::perspective_rh(45f32.to_radians(), aspect, 0.1, 10.0);
    proj.y_axis.y *= -1.0;
    let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 2.0), Vec3::ZERO, Vec3::Y);
    let model = Mat4::from_rotation_z(seconds * 0.8);
    proj * view * model
}

/// Feeds the mesh renderer a fresh transform every frame.
pub struct SpinningQuad {
    renderer: MeshRenderer,
    start: Instant,
    fps: FpsCounter,
}

impl SpinningQuad {
    pub fn new(renderer: MeshRenderer) -> Self {
        Self {
            renderer,
            start: Instant::now(),
            fps: FpsCounter::default(),
        }
    }
}

impl FrameRecorder<DeviceContext> for SpinningQuad {
    fn rebuild_targets(
        &mut self,
        ctx: &DeviceContext,
        swapchain: &SwapchainManager<DeviceContext>,
    ) -> RenderResult<()> {
        self.renderer.rebuild_targets(ctx, swapchain)
    }

    fn record(
        &mut self,
        ctx: &DeviceContext,
        frame: &FrameContext<'_, DeviceContext>,
    ) -> RenderResult<()> {
        let extent = frame.swapchain.extent();
        let aspect = extent.width as f32 / extent.height.max(1) as f32;
        let now = Instant::now();
        self.renderer.set_transform(
            mvp(now.duration_since(self.start).as_secs_f32(), aspect).to_cols_array_2d(),
        );
        self.renderer.record(ctx, frame)?;
        self.fps.tick(now);
        Ok(())
    }

    fn release_targets(&mut self, ctx: &DeviceContext) {
        self.renderer.release_targets(ctx);
    }
}
