// SPDX-License-Identifier: CEPL-1.0
//! Error types shared by every backend.
//!
//! Two tiers: [`FatalError`] ends the frame loop (initialisation, allocation,
//! device loss), while transient presentation statuses are plain enums
//! returned by the swapchain manager and never travel through these types.

use std::time::Duration;

use thiserror::Error;

/// Typed native result code reported by a backend call.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum GpuError {
    #[error("timeout expired")]
    Timeout,
    #[error("not ready")]
    NotReady,
    #[error("surface out of date")]
    OutOfDate,
    #[error("surface lost")]
    SurfaceLost,
    #[error("descriptor pool out of memory")]
    OutOfPoolMemory,
    #[error("descriptor pool fragmented")]
    FragmentedPool,
    #[error("device lost")]
    DeviceLost,
    #[error("out of host memory")]
    OutOfHostMemory,
    #[error("out of device memory")]
    OutOfDeviceMemory,
    #[error("memory map failed")]
    MemoryMapFailed,
    #[error("no memory type satisfies the request")]
    NoSuitableMemoryType,
    #[error("write of {len} bytes at offset {offset} overruns a {size}-byte allocation")]
    WriteOutOfBounds { offset: u64, len: u64, size: u64 },
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("native error code {0}")]
    Native(i32),
}

impl GpuError {
    /// Pool exhaustion is the only allocation failure the descriptor
    /// allocator recovers from.
    pub fn is_pool_exhaustion(self) -> bool {
        matches!(self, GpuError::OutOfPoolMemory | GpuError::FragmentedPool)
    }
}

/// Step of a staged upload that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStage {
    /// Input rejected before any GPU object was created.
    Validation,
    StagingAllocation,
    StagingWrite,
    DeviceAllocation,
    Transfer,
}

impl std::fmt::Display for UploadStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UploadStage::Validation => "input validation",
            UploadStage::StagingAllocation => "staging allocation",
            UploadStage::StagingWrite => "staging write",
            UploadStage::DeviceAllocation => "device-local allocation",
            UploadStage::Transfer => "staging transfer",
        };
        f.write_str(s)
    }
}

/// A resource wrapper could not be built. Nothing was registered for
/// destruction when this is returned.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("failed to create {resource} ({stage}): {source}")]
pub struct ResourceCreationError {
    pub resource: &'static str,
    pub stage: UploadStage,
    #[source]
    pub source: GpuError,
}

#[derive(Debug, Error)]
pub enum FatalError {
    #[error("failed to create {resource}: {source}")]
    Creation {
        resource: &'static str,
        #[source]
        source: GpuError,
    },

    #[error("{operation} failed: {source}")]
    Device {
        operation: &'static str,
        #[source]
        source: GpuError,
    },

    #[error("fence wait for frame slot {slot} timed out after {timeout:?}; device lost or hung")]
    FenceTimeout { slot: usize, timeout: Duration },

    #[error("descriptor set allocation failed on a fresh pool: {source}")]
    DescriptorPoolExhausted {
        #[source]
        source: GpuError,
    },

    #[error("frame slot {slot} out of range ({slots} slots)")]
    SlotOutOfRange { slot: usize, slots: usize },

    #[error("surface reports no formats")]
    NoSurfaceFormat,

    #[error(transparent)]
    Resource(#[from] ResourceCreationError),
}

impl FatalError {
    pub fn creation(resource: &'static str) -> impl FnOnce(GpuError) -> FatalError {
        move |source| FatalError::Creation { resource, source }
    }

    pub fn device(operation: &'static str) -> impl FnOnce(GpuError) -> FatalError {
        move |source| FatalError::Device { operation, source }
    }
}

pub type RenderResult<T> = std::result::Result<T, FatalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhaustion_classification() {
        assert!(GpuError::OutOfPoolMemory.is_pool_exhaustion());
        assert!(GpuError::FragmentedPool.is_pool_exhaustion());
        assert!(!GpuError::OutOfDeviceMemory.is_pool_exhaustion());
        assert!(!GpuError::Native(-13).is_pool_exhaustion());
    }

    #[test]
    fn fatal_error_names_resource_and_code() {
        let err = FatalError::creation("command pool")(GpuError::OutOfHostMemory);
        assert_eq!(
            err.to_string(),
            "failed to create command pool: out of host memory"
        );

        let err: FatalError = ResourceCreationError {
            resource: "mesh vertex buffer",
            stage: UploadStage::StagingAllocation,
            source: GpuError::OutOfDeviceMemory,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "failed to create mesh vertex buffer (staging allocation): out of device memory"
        );
    }
}
