// SPDX-License-Identifier: CEPL-1.0
//! Render pass, framebuffers and the mesh pipeline.
//!
//! All three depend on the swapchain format or image views and are rebuilt as
//! one [`RenderTargets`] bundle after every swapchain recreation. The
//! pipeline layout only depends on the descriptor-set layout and outlives
//! recreation.

use ash::vk;
use cadence_render::gpu::ShaderStage;
use cadence_render::{FatalError, GpuError, RenderResult, ShaderBinary, Vertex};
use tracing::debug;

use crate::context::DeviceContext;
use crate::convert::{gpu_error, VkResultExt};

/// Vertex binding 0: `Vertex { position, color }`, both `vec3`.
pub fn vertex_input() -> (
    vk::VertexInputBindingDescription,
    [vk::VertexInputAttributeDescription; 2],
) {
    let binding = vk::VertexInputBindingDescription {
        binding: 0,
        stride: std::mem::size_of::<Vertex>() as u32,
        input_rate: vk::VertexInputRate::VERTEX,
    };
    let attributes = [
        vk::VertexInputAttributeDescription {
            location: 0,
            binding: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: std::mem::offset_of!(Vertex, position) as u32,
        },
        vk::VertexInputAttributeDescription {
            location: 1,
            binding: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: std::mem::offset_of!(Vertex, color) as u32,
        },
    ];
    (binding, attributes)
}

unsafe fn create_render_pass(
    device: &ash::Device,
    format: vk::Format,
) -> Result<vk::RenderPass, GpuError> {
    // Render pass: single color attachment -> present
    let color_att = vk::AttachmentDescription {
        format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        ..Default::default()
    };
    let att_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let subpass = vk::SubpassDescription {
        pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
        color_attachment_count: 1,
        p_color_attachments: &att_ref,
        ..Default::default()
    };
    // The layout transition must wait for the acquire semaphore's stage.
    let dependency = vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        src_access_mask: vk::AccessFlags::empty(),
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ..Default::default()
    };
    let rp_info = vk::RenderPassCreateInfo {
        s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
        attachment_count: 1,
        p_attachments: &color_att,
        subpass_count: 1,
        p_subpasses: &subpass,
        dependency_count: 1,
        p_dependencies: &dependency,
        ..Default::default()
    };
    unsafe { device.create_render_pass(&rp_info, None) }.gpu()
}

unsafe fn create_framebuffers(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    views: &[vk::ImageView],
    extent: vk::Extent2D,
) -> Result<Vec<vk::Framebuffer>, GpuError> {
    let mut framebuffers = Vec::with_capacity(views.len());
    for view in views {
        let fb_info = vk::FramebufferCreateInfo {
            s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
            render_pass,
            attachment_count: 1,
            p_attachments: view,
            width: extent.width,
            height: extent.height,
            layers: 1,
            ..Default::default()
        };
        match unsafe { device.create_framebuffer(&fb_info, None) } {
            Ok(fb) => framebuffers.push(fb),
            Err(e) => {
                for fb in framebuffers {
                    unsafe { device.destroy_framebuffer(fb, None) };
                }
                return Err(gpu_error(e));
            }
        }
    }
    Ok(framebuffers)
}

unsafe fn create_shader_module(
    device: &ash::Device,
    shader: &ShaderBinary,
) -> Result<vk::ShaderModule, GpuError> {
    let ci = vk::ShaderModuleCreateInfo {
        s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
        p_code: shader.words.as_ptr(),
        code_size: shader.words.len() * 4,
        ..Default::default()
    };
    unsafe { device.create_shader_module(&ci, None) }.gpu()
}

/// Pipeline layout with one descriptor set (per-slot uniforms).
pub fn create_pipeline_layout(
    ctx: &DeviceContext,
    set_layout: vk::DescriptorSetLayout,
) -> RenderResult<vk::PipelineLayout> {
    let layout_info = vk::PipelineLayoutCreateInfo {
        s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
        set_layout_count: 1,
        p_set_layouts: &set_layout,
        ..Default::default()
    };
    unsafe { ctx.device().create_pipeline_layout(&layout_info, None) }
        .gpu()
        .map_err(FatalError::creation("pipeline layout"))
}

unsafe fn create_pipeline(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    layout: vk::PipelineLayout,
    vert: &ShaderBinary,
    frag: &ShaderBinary,
) -> Result<vk::Pipeline, GpuError> {
    debug_assert_eq!(vert.stage, ShaderStage::Vertex);
    debug_assert_eq!(frag.stage, ShaderStage::Fragment);

    // --- Shader modules (destroyed before return) ---
    let vs = unsafe { create_shader_module(device, vert) }?;
    let fs = match unsafe { create_shader_module(device, frag) } {
        Ok(fs) => fs,
        Err(e) => {
            unsafe { device.destroy_shader_module(vs, None) };
            return Err(e);
        }
    };
    let entry = c"main";
    let stages = [
        vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: vk::ShaderStageFlags::VERTEX,
            module: vs,
            p_name: entry.as_ptr(),
            ..Default::default()
        },
        vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: vk::ShaderStageFlags::FRAGMENT,
            module: fs,
            p_name: entry.as_ptr(),
            ..Default::default()
        },
    ];

    // --- Fixed-function state ---
    let (vb, va) = vertex_input();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VERTEX_INPUT_STATE_CREATE_INFO,
        vertex_binding_description_count: 1,
        p_vertex_binding_descriptions: &vb,
        vertex_attribute_description_count: va.len() as u32,
        p_vertex_attribute_descriptions: va.as_ptr(),
        ..Default::default()
    };
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
        topology: vk::PrimitiveTopology::TRIANGLE_LIST,
        ..Default::default()
    };
    // Viewport and scissor are set per frame from the swapchain extent.
    let dyn_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_DYNAMIC_STATE_CREATE_INFO,
        dynamic_state_count: dyn_states.len() as u32,
        p_dynamic_states: dyn_states.as_ptr(),
        ..Default::default()
    };
    let viewport_state = vk::PipelineViewportStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VIEWPORT_STATE_CREATE_INFO,
        viewport_count: 1,
        scissor_count: 1,
        ..Default::default()
    };
    let raster = vk::PipelineRasterizationStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_RASTERIZATION_STATE_CREATE_INFO,
        polygon_mode: vk::PolygonMode::FILL,
        cull_mode: vk::CullModeFlags::NONE,
        front_face: vk::FrontFace::COUNTER_CLOCKWISE,
        line_width: 1.0,
        ..Default::default()
    };
    let multisample = vk::PipelineMultisampleStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_MULTISAMPLE_STATE_CREATE_INFO,
        rasterization_samples: vk::SampleCountFlags::TYPE_1,
        ..Default::default()
    };
    let color_blend_att = vk::PipelineColorBlendAttachmentState {
        color_write_mask: vk::ColorComponentFlags::R
            | vk::ColorComponentFlags::G
            | vk::ColorComponentFlags::B
            | vk::ColorComponentFlags::A,
        blend_enable: vk::FALSE,
        ..Default::default()
    };
    let color_blend = vk::PipelineColorBlendStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_COLOR_BLEND_STATE_CREATE_INFO,
        attachment_count: 1,
        p_attachments: &color_blend_att,
        ..Default::default()
    };

    let pipeline_info = vk::GraphicsPipelineCreateInfo {
        s_type: vk::StructureType::GRAPHICS_PIPELINE_CREATE_INFO,
        stage_count: stages.len() as u32,
        p_stages: stages.as_ptr(),
        p_vertex_input_state: &vertex_input,
        p_input_assembly_state: &input_assembly,
        p_viewport_state: &viewport_state,
        p_rasterization_state: &raster,
        p_multisample_state: &multisample,
        p_color_blend_state: &color_blend,
        p_dynamic_state: &dynamic_state,
        layout,
        render_pass,
        subpass: 0,
        ..Default::default()
    };

    let created = unsafe {
        device.create_graphics_pipelines(
            vk::PipelineCache::null(),
            std::slice::from_ref(&pipeline_info),
            None,
        )
    };
    unsafe {
        device.destroy_shader_module(vs, None);
        device.destroy_shader_module(fs, None);
    }
    match created {
        Ok(pipelines) => Ok(pipelines[0]),
        Err((_, err)) => Err(gpu_error(err)),
    }
}

/// Everything that must follow the swapchain's images and format.
#[derive(Debug)]
pub struct RenderTargets {
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
    pipeline: vk::Pipeline,
    extent: vk::Extent2D,
}

impl RenderTargets {
    pub fn new(
        ctx: &DeviceContext,
        views: &[vk::ImageView],
        format: vk::Format,
        extent: vk::Extent2D,
        layout: vk::PipelineLayout,
        shaders: (&ShaderBinary, &ShaderBinary),
    ) -> RenderResult<Self> {
        let device = ctx.device();
        // SAFETY: views belong to the live swapchain; partial results are
        // destroyed before any error is returned.
        unsafe {
            let render_pass =
                create_render_pass(device, format).map_err(FatalError::creation("render pass"))?;
            let framebuffers = match create_framebuffers(device, render_pass, views, extent) {
                Ok(f) => f,
                Err(e) => {
                    device.destroy_render_pass(render_pass, None);
                    return Err(FatalError::creation("framebuffers")(e));
                }
            };
            let pipeline = match create_pipeline(device, render_pass, layout, shaders.0, shaders.1)
            {
                Ok(p) => p,
                Err(e) => {
                    for &fb in &framebuffers {
                        device.destroy_framebuffer(fb, None);
                    }
                    device.destroy_render_pass(render_pass, None);
                    return Err(FatalError::creation("graphics pipeline")(e));
                }
            };
            debug!(
                framebuffers = framebuffers.len(),
                width = extent.width,
                height = extent.height,
                "render targets built"
            );
            Ok(Self {
                render_pass,
                framebuffers,
                pipeline,
                extent,
            })
        }
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn framebuffer(&self, image_index: u32) -> vk::Framebuffer {
        self.framebuffers[image_index as usize]
    }

    pub fn pipeline(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Pipeline first, then framebuffers, then the render pass they use.
    pub fn destroy(self, ctx: &DeviceContext) {
        let device = ctx.device();
        // SAFETY: the device is idle when targets are released.
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            for fb in self.framebuffers {
                device.destroy_framebuffer(fb, None);
            }
            device.destroy_render_pass(self.render_pass, None);
        }
    }
}
