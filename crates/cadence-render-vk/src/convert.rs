// SPDX-License-Identifier: CEPL-1.0
//! Conversions between `cadence-render` enums and raw `vk` values.

use std::time::Duration;

use ash::vk;
use cadence_render::gpu::{
    BufferUsage, ColorFormat, ColorSpace, DescriptorKind, ImageLayout, MemoryLocation,
    PipelineStages, PresentMode, ShaderStages, SurfaceFormat, TextureFormat,
};
use cadence_render::{GpuError, RenderSize};

/// Typed view of a native result code.
pub fn gpu_error(result: vk::Result) -> GpuError {
    match result {
        vk::Result::TIMEOUT => GpuError::Timeout,
        vk::Result::NOT_READY => GpuError::NotReady,
        vk::Result::ERROR_OUT_OF_DATE_KHR => GpuError::OutOfDate,
        vk::Result::ERROR_SURFACE_LOST_KHR => GpuError::SurfaceLost,
        vk::Result::ERROR_OUT_OF_POOL_MEMORY => GpuError::OutOfPoolMemory,
        vk::Result::ERROR_FRAGMENTED_POOL => GpuError::FragmentedPool,
        vk::Result::ERROR_DEVICE_LOST => GpuError::DeviceLost,
        vk::Result::ERROR_OUT_OF_HOST_MEMORY => GpuError::OutOfHostMemory,
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => GpuError::OutOfDeviceMemory,
        vk::Result::ERROR_MEMORY_MAP_FAILED => GpuError::MemoryMapFailed,
        other => GpuError::Native(other.as_raw()),
    }
}

/// `?`-friendly mapping for `VkResult`.
pub(crate) trait VkResultExt<T> {
    fn gpu(self) -> Result<T, GpuError>;
}

impl<T> VkResultExt<T> for ash::prelude::VkResult<T> {
    fn gpu(self) -> Result<T, GpuError> {
        self.map_err(gpu_error)
    }
}

/// Nanoseconds for a wait call, saturating at the "forever" value.
pub fn timeout_ns(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}

pub fn buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::empty();
    if usage.contains(BufferUsage::VERTEX) {
        flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(BufferUsage::INDEX) {
        flags |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(BufferUsage::TRANSFER_SRC) {
        flags |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(BufferUsage::TRANSFER_DST) {
        flags |= vk::BufferUsageFlags::TRANSFER_DST;
    }
    flags
}

pub fn memory_properties(location: MemoryLocation) -> vk::MemoryPropertyFlags {
    match location {
        MemoryLocation::HostVisible => {
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
        }
        MemoryLocation::DeviceLocal => vk::MemoryPropertyFlags::DEVICE_LOCAL,
    }
}

/// First memory type allowed by `type_bits` that carries every flag in `req`.
pub fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    req: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..props.memory_type_count).find(|&i| {
        (type_bits & (1 << i)) != 0 && props.memory_types[i as usize].property_flags.contains(req)
    })
}

pub fn pipeline_stages(stages: PipelineStages) -> vk::PipelineStageFlags {
    let mut flags = vk::PipelineStageFlags::empty();
    if stages.contains(PipelineStages::TOP_OF_PIPE) {
        flags |= vk::PipelineStageFlags::TOP_OF_PIPE;
    }
    if stages.contains(PipelineStages::TRANSFER) {
        flags |= vk::PipelineStageFlags::TRANSFER;
    }
    if stages.contains(PipelineStages::FRAGMENT_SHADER) {
        flags |= vk::PipelineStageFlags::FRAGMENT_SHADER;
    }
    if stages.contains(PipelineStages::COLOR_ATTACHMENT_OUTPUT) {
        flags |= vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
    }
    flags
}

pub fn shader_stages(stages: ShaderStages) -> vk::ShaderStageFlags {
    let mut flags = vk::ShaderStageFlags::empty();
    if stages.contains(ShaderStages::VERTEX) {
        flags |= vk::ShaderStageFlags::VERTEX;
    }
    if stages.contains(ShaderStages::FRAGMENT) {
        flags |= vk::ShaderStageFlags::FRAGMENT;
    }
    flags
}

pub fn descriptor_type(kind: DescriptorKind) -> vk::DescriptorType {
    match kind {
        DescriptorKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorKind::UniformBufferDynamic => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        DescriptorKind::StorageBufferDynamic => vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
        DescriptorKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
    }
}

pub fn texture_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
    }
}

pub fn image_layout(layout: ImageLayout) -> vk::ImageLayout {
    match layout {
        ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
        ImageLayout::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ImageLayout::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    }
}

/// Access masks and stages for a layout transition barrier:
/// `(src_access, dst_access, src_stage, dst_stage)`.
pub fn transition_masks(
    from: ImageLayout,
    to: ImageLayout,
) -> (
    vk::AccessFlags,
    vk::AccessFlags,
    vk::PipelineStageFlags,
    vk::PipelineStageFlags,
) {
    let (src_access, src_stage) = match from {
        ImageLayout::Undefined => (vk::AccessFlags::empty(), vk::PipelineStageFlags::TOP_OF_PIPE),
        ImageLayout::TransferDst => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        ImageLayout::ShaderReadOnly => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
    };
    let (dst_access, dst_stage) = match to {
        ImageLayout::Undefined => (vk::AccessFlags::empty(), vk::PipelineStageFlags::TOP_OF_PIPE),
        ImageLayout::TransferDst => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        ImageLayout::ShaderReadOnly => (
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
    };
    (src_access, dst_access, src_stage, dst_stage)
}

pub fn color_format(format: vk::Format) -> ColorFormat {
    match format {
        vk::Format::B8G8R8A8_SRGB => ColorFormat::Bgra8Srgb,
        vk::Format::B8G8R8A8_UNORM => ColorFormat::Bgra8Unorm,
        vk::Format::R8G8B8A8_SRGB => ColorFormat::Rgba8Srgb,
        vk::Format::R8G8B8A8_UNORM => ColorFormat::Rgba8Unorm,
        other => ColorFormat::Other(other.as_raw()),
    }
}

pub fn vk_format(format: ColorFormat) -> vk::Format {
    match format {
        ColorFormat::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
        ColorFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        ColorFormat::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        ColorFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        ColorFormat::Other(raw) => vk::Format::from_raw(raw),
    }
}

pub fn color_space(space: vk::ColorSpaceKHR) -> ColorSpace {
    match space {
        vk::ColorSpaceKHR::SRGB_NONLINEAR => ColorSpace::SrgbNonlinear,
        other => ColorSpace::Other(other.as_raw()),
    }
}

pub fn vk_color_space(space: ColorSpace) -> vk::ColorSpaceKHR {
    match space {
        ColorSpace::SrgbNonlinear => vk::ColorSpaceKHR::SRGB_NONLINEAR,
        ColorSpace::Other(raw) => vk::ColorSpaceKHR::from_raw(raw),
    }
}

pub fn surface_format(format: vk::SurfaceFormatKHR) -> SurfaceFormat {
    SurfaceFormat {
        format: color_format(format.format),
        color_space: color_space(format.color_space),
    }
}

/// `None` for modes the core does not model (shared refresh modes).
pub fn present_mode(mode: vk::PresentModeKHR) -> Option<PresentMode> {
    match mode {
        vk::PresentModeKHR::IMMEDIATE => Some(PresentMode::Immediate),
        vk::PresentModeKHR::MAILBOX => Some(PresentMode::Mailbox),
        vk::PresentModeKHR::FIFO => Some(PresentMode::Fifo),
        vk::PresentModeKHR::FIFO_RELAXED => Some(PresentMode::FifoRelaxed),
        _ => None,
    }
}

pub fn vk_present_mode(mode: PresentMode) -> vk::PresentModeKHR {
    match mode {
        PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
        PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentMode::Fifo => vk::PresentModeKHR::FIFO,
        PresentMode::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
    }
}

/// The surface reports `u32::MAX` when the swapchain picks its own size.
pub fn current_extent(extent: vk::Extent2D) -> Option<RenderSize> {
    (extent.width != u32::MAX).then(|| render_size(extent))
}

pub fn render_size(extent: vk::Extent2D) -> RenderSize {
    RenderSize::new(extent.width, extent.height)
}

pub fn extent_2d(size: RenderSize) -> vk::Extent2D {
    vk::Extent2D {
        width: size.width,
        height: size.height,
    }
}

// Debug-name helpers for log lines.
pub fn pm_name(mode: PresentMode) -> &'static str {
    match mode {
        PresentMode::Immediate => "IMMEDIATE",
        PresentMode::Mailbox => "MAILBOX",
        PresentMode::Fifo => "FIFO",
        PresentMode::FifoRelaxed => "FIFO_RELAXED",
    }
}

pub fn fmt_name(format: ColorFormat) -> String {
    match format {
        ColorFormat::Bgra8Srgb => "B8G8R8A8_SRGB".into(),
        ColorFormat::Bgra8Unorm => "B8G8R8A8_UNORM".into(),
        ColorFormat::Rgba8Srgb => "R8G8B8A8_SRGB".into(),
        ColorFormat::Rgba8Unorm => "R8G8B8A8_UNORM".into(),
        ColorFormat::Other(raw) => format!("0x{raw:x}"),
    }
}
