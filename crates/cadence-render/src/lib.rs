// SPDX-License-Identifier: CEPL-1.0
//! Backend-agnostic frame loop core.
//!
//! ```text
//! GpuDevice / PresentationEngine      (backend: cadence-render-vk, testing::FakeGpu)
//! ├── ResourceLifetimeRegistry        LIFO teardown, flushed once at shutdown
//! ├── DescriptorPoolAllocator         free/used pool lists
//! ├── Buffer / Mesh / Texture         staged uploads via UploadContext
//! ├── SlotUniforms                    per-slot uniform buffer + descriptor set
//! ├── SwapchainManager                acquire / present / recreate
//! └── FrameLoop                       N FrameSlots, round-robin by frame number
//! ```
#![deny(unsafe_op_in_unsafe_fn)]

pub mod descriptor;
pub mod error;
pub mod frame;
pub mod frame_loop;
pub mod gpu;
pub mod lifetime;
pub mod resource;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod uniforms;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use descriptor::{
    DescriptorPoolAllocator, DescriptorSet, DescriptorSetLayout, ResourceMode, SetAllocation,
    ShaderResource,
};
pub use error::{FatalError, GpuError, RenderResult, ResourceCreationError, UploadStage};
pub use frame::{FrameSlot, SlotState};
pub use frame_loop::{FrameContext, FrameLoop, FrameLoopConfig, FrameOutcome, FrameRecorder};
pub use gpu::{GpuDevice, PresentationEngine, QueueKind};
pub use lifetime::ResourceLifetimeRegistry;
pub use resource::{Buffer, BufferKind, Mesh, Texture, UploadContext, Vertex};
pub use shader::{ShaderBinary, ShaderError, ShaderLibrary};
pub use surface::SurfaceProvider;
pub use swapchain::{AcquireResult, PresentResult, SwapchainManager};
pub use uniforms::SlotUniforms;

/// Frames the CPU may record ahead of the GPU.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }
}
