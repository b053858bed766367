// SPDX-License-Identifier: CEPL-1.0
//! Vulkan backend for `cadence-render`, built on `ash`.
//!
//! [`DeviceContext`] implements the core's device and presentation traits
//! with raw `vk` handles; [`MeshRenderer`] is a [`cadence_render::FrameRecorder`]
//! that owns the render pass, framebuffers and pipeline.
#![deny(unsafe_op_in_unsafe_fn)]

pub mod context;
pub mod convert;
mod device;
pub mod pipeline;
mod present;
pub mod renderer;

pub use context::{select_queue_families, DeviceContext, QueueFamilies};
pub use convert::gpu_error;
pub use pipeline::RenderTargets;
pub use renderer::{MeshRenderer, MeshRendererDesc};
