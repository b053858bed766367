// SPDX-License-Identifier: CEPL-1.0
//! Device seam between the synchronization core and a concrete GPU API.
//!
//! Native handles are associated `Copy` types: the Vulkan backend plugs raw
//! `vk::*` handles in directly, the fake GPU uses integer ids. Every method
//! that talks to the driver reports a typed [`GpuError`]; callers attach the
//! resource or operation name when they escalate it.

use std::fmt::Debug;
use std::time::Duration;

use bitflags::bitflags;

use crate::error::GpuError;
use crate::RenderSize;

/// Queue capability a submission targets. Backends may alias families.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Present,
    Transfer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandPoolUsage {
    /// Individual command buffers are reset and re-recorded (frame slots).
    Resettable,
    /// Short-lived one-shot command buffers (uploads).
    Transient,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    HostVisible,
    DeviceLocal,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const TRANSFER_SRC = 1 << 3;
        const TRANSFER_DST = 1 << 4;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PipelineStages: u32 {
        const TOP_OF_PIPE = 1 << 0;
        const TRANSFER = 1 << 1;
        const FRAGMENT_SHADER = 1 << 2;
        const COLOR_ATTACHMENT_OUTPUT = 1 << 3;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl From<ShaderStage> for ShaderStages {
    fn from(stage: ShaderStage) -> Self {
        match stage {
            ShaderStage::Vertex => ShaderStages::VERTEX,
            ShaderStage::Fragment => ShaderStages::FRAGMENT,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DescriptorKind {
    UniformBuffer,
    UniformBufferDynamic,
    StorageBuffer,
    StorageBufferDynamic,
    CombinedImageSampler,
}

/// One binding slot of a descriptor-set layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayoutBinding {
    pub binding: u32,
    pub kind: DescriptorKind,
    pub count: u32,
    pub stages: ShaderStages,
}

/// Descriptor capacity of one kind inside a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolSize {
    pub kind: DescriptorKind,
    pub count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextureFormat {
    Rgba8Srgb,
    Rgba8Unorm,
}

impl TextureFormat {
    pub fn bytes_per_pixel(self) -> u64 {
        match self {
            TextureFormat::Rgba8Srgb | TextureFormat::Rgba8Unorm => 4,
        }
    }
}

/// Rejects a host write of `len` bytes at `offset` that would not fit in an
/// allocation of `size` bytes. Backends call this before mapping.
pub fn check_write(size: u64, offset: u64, len: usize) -> Result<(), GpuError> {
    let len = len as u64;
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(GpuError::WriteOutOfBounds { offset, len, size }),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageLayout {
    Undefined,
    TransferDst,
    ShaderReadOnly,
}

/// One queue submission. Waits pair a semaphore with the stage that blocks
/// on it.
pub struct Submission<'a, D: GpuDevice> {
    pub wait: &'a [(D::Semaphore, PipelineStages)],
    pub command_buffers: &'a [D::CommandBuffer],
    pub signal: &'a [D::Semaphore],
    pub fence: Option<D::Fence>,
}

/// Logical device plus its allocator and queues.
///
/// Methods take `&self`: the core drives everything from one submission
/// thread and never shares a device across threads.
pub trait GpuDevice: Sized + 'static {
    type Fence: Copy + Eq + Debug + 'static;
    type Semaphore: Copy + Eq + Debug + 'static;
    type CommandPool: Copy + Eq + Debug + 'static;
    type CommandBuffer: Copy + Eq + Debug + 'static;
    type Buffer: Copy + Eq + Debug + 'static;
    type Image: Copy + Eq + Debug + 'static;
    type Memory: Copy + Eq + Debug + 'static;
    type DescriptorSetLayout: Copy + Eq + Debug + 'static;
    type DescriptorPool: Copy + Eq + Debug + 'static;
    type DescriptorSet: Copy + Eq + Debug + 'static;

    /// Queue family index serving `queue`; resolved once at device creation.
    fn queue_family(&self, queue: QueueKind) -> u32;

    fn create_fence(&self, signaled: bool) -> Result<Self::Fence, GpuError>;
    /// Blocks until `fence` is signaled. Expiry reports [`GpuError::Timeout`].
    fn wait_for_fence(&self, fence: Self::Fence, timeout: Duration) -> Result<(), GpuError>;
    fn reset_fence(&self, fence: Self::Fence) -> Result<(), GpuError>;
    fn destroy_fence(&self, fence: Self::Fence);

    fn create_semaphore(&self) -> Result<Self::Semaphore, GpuError>;
    fn destroy_semaphore(&self, semaphore: Self::Semaphore);

    fn create_command_pool(
        &self,
        queue: QueueKind,
        usage: CommandPoolUsage,
    ) -> Result<Self::CommandPool, GpuError>;
    fn destroy_command_pool(&self, pool: Self::CommandPool);
    fn allocate_command_buffer(
        &self,
        pool: Self::CommandPool,
    ) -> Result<Self::CommandBuffer, GpuError>;
    fn free_command_buffer(&self, pool: Self::CommandPool, cmd: Self::CommandBuffer);
    fn reset_command_buffer(&self, cmd: Self::CommandBuffer) -> Result<(), GpuError>;
    fn begin_command_buffer(&self, cmd: Self::CommandBuffer, one_time: bool)
        -> Result<(), GpuError>;
    fn end_command_buffer(&self, cmd: Self::CommandBuffer) -> Result<(), GpuError>;

    fn submit(&self, queue: QueueKind, submission: &Submission<'_, Self>) -> Result<(), GpuError>;
    fn queue_wait_idle(&self, queue: QueueKind) -> Result<(), GpuError>;
    fn wait_idle(&self) -> Result<(), GpuError>;

    fn create_buffer(
        &self,
        size: u64,
        usage: BufferUsage,
        location: MemoryLocation,
    ) -> Result<(Self::Buffer, Self::Memory), GpuError>;
    fn destroy_buffer(&self, buffer: Self::Buffer, memory: Self::Memory);
    /// Map, copy, unmap. `memory` must be host visible.
    fn write_memory(&self, memory: Self::Memory, offset: u64, data: &[u8]) -> Result<(), GpuError>;
    fn cmd_copy_buffer(
        &self,
        cmd: Self::CommandBuffer,
        src: Self::Buffer,
        dst: Self::Buffer,
        size: u64,
    );

    fn create_image(
        &self,
        extent: RenderSize,
        format: TextureFormat,
    ) -> Result<(Self::Image, Self::Memory), GpuError>;
    fn destroy_image(&self, image: Self::Image, memory: Self::Memory);
    fn cmd_transition_image(
        &self,
        cmd: Self::CommandBuffer,
        image: Self::Image,
        from: ImageLayout,
        to: ImageLayout,
    );
    fn cmd_copy_buffer_to_image(
        &self,
        cmd: Self::CommandBuffer,
        src: Self::Buffer,
        dst: Self::Image,
        extent: RenderSize,
    );

    fn create_descriptor_set_layout(
        &self,
        bindings: &[LayoutBinding],
    ) -> Result<Self::DescriptorSetLayout, GpuError>;
    fn destroy_descriptor_set_layout(&self, layout: Self::DescriptorSetLayout);
    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[PoolSize],
    ) -> Result<Self::DescriptorPool, GpuError>;
    fn reset_descriptor_pool(&self, pool: Self::DescriptorPool) -> Result<(), GpuError>;
    fn destroy_descriptor_pool(&self, pool: Self::DescriptorPool);
    /// Fails with [`GpuError::OutOfPoolMemory`] or [`GpuError::FragmentedPool`]
    /// when `pool` cannot hold another set of `layout`.
    fn allocate_descriptor_set(
        &self,
        pool: Self::DescriptorPool,
        layout: Self::DescriptorSetLayout,
    ) -> Result<Self::DescriptorSet, GpuError>;
    fn write_buffer_descriptor(
        &self,
        set: Self::DescriptorSet,
        binding: &LayoutBinding,
        buffer: Self::Buffer,
        range: u64,
    );
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColorFormat {
    Bgra8Srgb,
    Bgra8Unorm,
    Rgba8Srgb,
    Rgba8Unorm,
    Other(i32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColorSpace {
    SrgbNonlinear,
    Other(i32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfaceFormat {
    pub format: ColorFormat,
    pub color_space: ColorSpace,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PresentMode {
    Immediate,
    Mailbox,
    Fifo,
    FifoRelaxed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SurfaceCapabilities {
    pub min_image_count: u32,
    /// Zero means the surface sets no upper bound.
    pub max_image_count: u32,
    /// `None` when the surface reports the undefined-extent sentinel and lets
    /// the swapchain pick its size.
    pub current_extent: Option<RenderSize>,
    pub min_extent: RenderSize,
    pub max_extent: RenderSize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SurfaceSupport {
    pub capabilities: SurfaceCapabilities,
    pub formats: Vec<SurfaceFormat>,
    pub present_modes: Vec<PresentMode>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapchainDesc {
    pub image_count: u32,
    pub format: SurfaceFormat,
    pub present_mode: PresentMode,
    pub extent: RenderSize,
}

/// Presentation half of a device: surface queries and the swapchain.
pub trait PresentationEngine: GpuDevice {
    type Swapchain: Copy + Eq + Debug + 'static;
    type ImageView: Copy + Eq + Debug + 'static;

    fn surface_support(&self) -> Result<SurfaceSupport, GpuError>;
    fn create_swapchain(
        &self,
        desc: &SwapchainDesc,
        old: Option<Self::Swapchain>,
    ) -> Result<Self::Swapchain, GpuError>;
    fn swapchain_images(&self, swapchain: Self::Swapchain) -> Result<Vec<Self::Image>, GpuError>;
    fn destroy_swapchain(&self, swapchain: Self::Swapchain);
    fn create_image_view(
        &self,
        image: Self::Image,
        format: SurfaceFormat,
    ) -> Result<Self::ImageView, GpuError>;
    fn destroy_image_view(&self, view: Self::ImageView);

    /// Returns the image index and whether the swapchain is suboptimal.
    /// Reports [`GpuError::Timeout`] / [`GpuError::NotReady`] when no image
    /// became available within `timeout`, [`GpuError::OutOfDate`] when the
    /// surface changed.
    fn acquire_next_image(
        &self,
        swapchain: Self::Swapchain,
        timeout: Duration,
        signal: Self::Semaphore,
    ) -> Result<(u32, bool), GpuError>;

    /// Returns whether the swapchain is suboptimal.
    fn queue_present(
        &self,
        swapchain: Self::Swapchain,
        image_index: u32,
        wait: Self::Semaphore,
    ) -> Result<bool, GpuError>;
}
