// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use cadence_render::gpu::ShaderStages;
use cadence_render::{
    DescriptorPoolAllocator, DescriptorSetLayout, FatalError, FrameContext, FrameRecorder,
    GpuError, Mesh, RenderResult, ResourceLifetimeRegistry, ShaderBinary, ShaderResource,
    SlotUniforms, SwapchainManager, UploadContext, Vertex,
};
use tracing::{debug, trace, warn};

use crate::context::DeviceContext;
use crate::convert::{extent_2d, vk_format};
use crate::pipeline::{create_pipeline_layout, RenderTargets};

const IDENTITY: [[f32; 4]; 4] = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

/// Inputs for [`MeshRenderer::new`].
pub struct MeshRendererDesc {
    pub vertex_shader: ShaderBinary,
    pub fragment_shader: ShaderBinary,
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u16>,
    pub clear_color: [f32; 4],
    /// One uniform buffer and descriptor set per frame slot.
    pub frames_in_flight: usize,
    pub max_sets_per_pool: u32,
}

/// Draws one indexed mesh with a per-slot MVP uniform.
///
/// Long-lived objects (mesh buffers, descriptor layout and pools, pipeline
/// layout, uniforms) are registered in the caller's registry. Render pass,
/// framebuffers and pipeline live in [`RenderTargets`] and follow the
/// swapchain through `rebuild_targets` / `release_targets`.
pub struct MeshRenderer {
    vertex_shader: ShaderBinary,
    fragment_shader: ShaderBinary,
    clear_color: [f32; 4],
    set_layout: DescriptorSetLayout<DeviceContext>,
    allocator: DescriptorPoolAllocator<DeviceContext>,
    pipeline_layout: vk::PipelineLayout,
    uniforms: SlotUniforms<DeviceContext>,
    mesh: Mesh<DeviceContext>,
    transform: [[f32; 4]; 4],
    targets: Option<RenderTargets>,
}

impl MeshRenderer {
    pub fn new(
        ctx: &DeviceContext,
        upload: &UploadContext<DeviceContext>,
        registry: &mut ResourceLifetimeRegistry<DeviceContext>,
        desc: MeshRendererDesc,
    ) -> RenderResult<Self> {
        let mesh = Mesh::new(ctx, upload, registry, desc.vertices, desc.indices)?;

        let set_layout = DescriptorSetLayout::new(
            ctx,
            vec![ShaderResource::uniform("transform", 0, ShaderStages::VERTEX)],
            registry,
        )?;
        let mut allocator = DescriptorPoolAllocator::new(&set_layout, desc.max_sets_per_pool);
        let uniforms = SlotUniforms::new(
            ctx,
            &mut allocator,
            registry,
            desc.frames_in_flight,
            std::mem::size_of::<[[f32; 4]; 4]>() as u64,
        )?;

        let pipeline_layout = create_pipeline_layout(ctx, set_layout.handle())?;
        registry.register(move |d: &DeviceContext| unsafe {
            d.device().destroy_pipeline_layout(pipeline_layout, None)
        });

        debug!(
            vertices = mesh.vertices().len(),
            indices = mesh.index_count(),
            slots = uniforms.len(),
            "mesh renderer ready"
        );
        Ok(Self {
            vertex_shader: desc.vertex_shader,
            fragment_shader: desc.fragment_shader,
            clear_color: desc.clear_color,
            set_layout,
            allocator,
            pipeline_layout,
            uniforms,
            mesh,
            transform: IDENTITY,
            targets: None,
        })
    }

    /// Column-major model-view-projection written before the next recording.
    pub fn set_transform(&mut self, mvp: [[f32; 4]; 4]) {
        self.transform = mvp;
    }

    pub fn mesh(&self) -> &Mesh<DeviceContext> {
        &self.mesh
    }

    pub fn set_layout(&self) -> &DescriptorSetLayout<DeviceContext> {
        &self.set_layout
    }

    pub fn descriptor_pools(&self) -> &DescriptorPoolAllocator<DeviceContext> {
        &self.allocator
    }

    pub fn targets(&self) -> Option<&RenderTargets> {
        self.targets.as_ref()
    }
}

impl FrameRecorder<DeviceContext> for MeshRenderer {
    fn rebuild_targets(
        &mut self,
        ctx: &DeviceContext,
        swapchain: &SwapchainManager<DeviceContext>,
    ) -> RenderResult<()> {
        if let Some(old) = self.targets.take() {
            old.destroy(ctx);
        }
        self.targets = Some(RenderTargets::new(
            ctx,
            swapchain.views(),
            vk_format(swapchain.format().format),
            extent_2d(swapchain.extent()),
            self.pipeline_layout,
            (&self.vertex_shader, &self.fragment_shader),
        )?);
        Ok(())
    }

    fn record(&mut self, ctx: &DeviceContext, frame: &FrameContext<'_, DeviceContext>) -> RenderResult<()> {
        self.uniforms
            .write(ctx, frame.slot, bytemuck::bytes_of(&self.transform))?;

        let Some(targets) = &self.targets else {
            return Err(FatalError::Device {
                operation: "record without render targets",
                source: GpuError::NotReady,
            });
        };
        let device = ctx.device();
        let cmd = frame.cmd;
        let extent = targets.extent();

        let clears = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.clear_color,
            },
        }];
        let rp_begin = vk::RenderPassBeginInfo {
            s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
            render_pass: targets.render_pass(),
            framebuffer: targets.framebuffer(frame.image_index),
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            },
            clear_value_count: clears.len() as u32,
            p_clear_values: clears.as_ptr(),
            ..Default::default()
        };
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        let set = self.uniforms.set(frame.slot)?;

        // SAFETY: `cmd` is in the recording state and every bound object
        // outlives the submission (registry or current targets).
        unsafe {
            device.cmd_begin_render_pass(cmd, &rp_begin, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, targets.pipeline());
            device.cmd_set_viewport(cmd, 0, std::slice::from_ref(&viewport));
            device.cmd_set_scissor(cmd, 0, std::slice::from_ref(&scissor));
            device.cmd_bind_vertex_buffers(cmd, 0, &[self.mesh.vertex_buffer().handle()], &[0]);
            device.cmd_bind_index_buffer(
                cmd,
                self.mesh.index_buffer().handle(),
                0,
                vk::IndexType::UINT16,
            );
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline_layout,
                0,
                &[set],
                &[],
            );
            device.cmd_draw_indexed(cmd, self.mesh.index_count(), 1, 0, 0, 0);
            device.cmd_end_render_pass(cmd);
        }
        trace!(
            frame = frame.frame_number,
            slot = frame.slot,
            image = frame.image_index,
            "recorded"
        );
        Ok(())
    }

    fn release_targets(&mut self, ctx: &DeviceContext) {
        if let Some(targets) = self.targets.take() {
            targets.destroy(ctx);
        }
    }
}

impl Drop for MeshRenderer {
    fn drop(&mut self) {
        if self.targets.is_some() {
            warn!("mesh renderer dropped with live render targets; call release_targets first");
        }
    }
}
