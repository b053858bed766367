// SPDX-License-Identifier: CEPL-1.0
//! GPU-resident resource wrappers built outside the frame loop.
//!
//! Device-local data goes through a host-visible staging buffer and a one-shot
//! copy that is waited on before the constructor returns. A wrapper registers
//! its destructor only once it is fully built; on any failure the partially
//! created objects are destroyed on the spot and nothing is registered.

use bytemuck::{Pod, Zeroable};
use tracing::debug;

use crate::error::{GpuError, ResourceCreationError, UploadStage};
use crate::gpu::{
    check_write, BufferUsage, CommandPoolUsage, GpuDevice, ImageLayout, MemoryLocation, QueueKind,
    Submission, TextureFormat,
};
use crate::lifetime::ResourceLifetimeRegistry;
use crate::RenderSize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferKind {
    Vertex,
    Index,
    Uniform,
    Staging,
}

impl BufferKind {
    pub fn usage(self) -> BufferUsage {
        match self {
            BufferKind::Vertex => BufferUsage::VERTEX | BufferUsage::TRANSFER_DST,
            BufferKind::Index => BufferUsage::INDEX | BufferUsage::TRANSFER_DST,
            BufferKind::Uniform => BufferUsage::UNIFORM,
            BufferKind::Staging => BufferUsage::TRANSFER_SRC,
        }
    }

    pub fn location(self) -> MemoryLocation {
        match self {
            BufferKind::Vertex | BufferKind::Index => MemoryLocation::DeviceLocal,
            BufferKind::Uniform | BufferKind::Staging => MemoryLocation::HostVisible,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 3],
}

impl Vertex {
    pub const fn new(position: [f32; 3], color: [f32; 3]) -> Self {
        Self { position, color }
    }
}

/// Transient command pool for blocking one-shot submissions.
pub struct UploadContext<D: GpuDevice> {
    pool: D::CommandPool,
}

impl<D: GpuDevice> UploadContext<D> {
    pub fn new(
        device: &D,
        registry: &mut ResourceLifetimeRegistry<D>,
    ) -> Result<Self, ResourceCreationError> {
        let pool = device
            .create_command_pool(QueueKind::Graphics, CommandPoolUsage::Transient)
            .map_err(|source| ResourceCreationError {
                resource: "upload command pool",
                stage: UploadStage::Transfer,
                source,
            })?;
        registry.register(move |d: &D| d.destroy_command_pool(pool));
        Ok(Self { pool })
    }

    /// Records `record` into a fresh command buffer, submits it to the
    /// graphics queue and waits for the queue to go idle.
    pub fn immediate_submit(
        &self,
        device: &D,
        record: impl FnOnce(D::CommandBuffer),
    ) -> Result<(), GpuError> {
        let cmd = device.allocate_command_buffer(self.pool)?;
        let result = (|| {
            device.begin_command_buffer(cmd, true)?;
            record(cmd);
            device.end_command_buffer(cmd)?;
            let submission = Submission::<D> {
                wait: &[],
                command_buffers: &[cmd],
                signal: &[],
                fence: None,
            };
            device.submit(QueueKind::Graphics, &submission)?;
            device.queue_wait_idle(QueueKind::Graphics)
        })();
        device.free_command_buffer(self.pool, cmd);
        result
    }
}

fn creation_error(
    resource: &'static str,
    stage: UploadStage,
) -> impl FnOnce(GpuError) -> ResourceCreationError {
    move |source| ResourceCreationError {
        resource,
        stage,
        source,
    }
}

/// Input rejected before anything was created.
fn invalid(resource: &'static str, what: &'static str) -> ResourceCreationError {
    ResourceCreationError {
        resource,
        stage: UploadStage::Validation,
        source: GpuError::InvalidInput(what),
    }
}

/// Host-visible staging buffer holding `data`. Destroyed by the caller.
fn create_staging<D: GpuDevice>(
    device: &D,
    resource: &'static str,
    data: &[u8],
) -> Result<(D::Buffer, D::Memory), ResourceCreationError> {
    let (buffer, memory) = device
        .create_buffer(
            data.len() as u64,
            BufferKind::Staging.usage(),
            BufferKind::Staging.location(),
        )
        .map_err(creation_error(resource, UploadStage::StagingAllocation))?;
    if let Err(source) = device.write_memory(memory, 0, data) {
        device.destroy_buffer(buffer, memory);
        return Err(creation_error(resource, UploadStage::StagingWrite)(source));
    }
    Ok((buffer, memory))
}

/// Device-local copy of `data`, not yet registered.
fn upload_to_device<D: GpuDevice>(
    device: &D,
    upload: &UploadContext<D>,
    resource: &'static str,
    kind: BufferKind,
    data: &[u8],
) -> Result<(D::Buffer, D::Memory), ResourceCreationError> {
    let size = data.len() as u64;
    let (staging, staging_memory) = create_staging(device, resource, data)?;

    let (buffer, memory) =
        match device.create_buffer(size, kind.usage(), MemoryLocation::DeviceLocal) {
            Ok(pair) => pair,
            Err(source) => {
                device.destroy_buffer(staging, staging_memory);
                return Err(creation_error(resource, UploadStage::DeviceAllocation)(source));
            }
        };

    let copied = upload.immediate_submit(device, |cmd| {
        device.cmd_copy_buffer(cmd, staging, buffer, size)
    });
    device.destroy_buffer(staging, staging_memory);
    if let Err(source) = copied {
        device.destroy_buffer(buffer, memory);
        return Err(creation_error(resource, UploadStage::Transfer)(source));
    }
    Ok((buffer, memory))
}

pub struct Buffer<D: GpuDevice> {
    buffer: D::Buffer,
    memory: D::Memory,
    size: u64,
    kind: BufferKind,
}

impl<D: GpuDevice> Buffer<D> {
    /// Buffer of `kind` holding `data`. Vertex and index data is staged into
    /// device-local memory; uniform and staging data is written in place.
    pub fn with_data(
        device: &D,
        upload: &UploadContext<D>,
        registry: &mut ResourceLifetimeRegistry<D>,
        resource: &'static str,
        kind: BufferKind,
        data: &[u8],
    ) -> Result<Self, ResourceCreationError> {
        if data.is_empty() {
            return Err(invalid(resource, "empty buffer data"));
        }
        let size = data.len() as u64;
        let (buffer, memory) = match kind.location() {
            MemoryLocation::DeviceLocal => upload_to_device(device, upload, resource, kind, data)?,
            MemoryLocation::HostVisible => {
                let (buffer, memory) = device
                    .create_buffer(size, kind.usage(), MemoryLocation::HostVisible)
                    .map_err(creation_error(resource, UploadStage::DeviceAllocation))?;
                if let Err(source) = device.write_memory(memory, 0, data) {
                    device.destroy_buffer(buffer, memory);
                    return Err(creation_error(resource, UploadStage::StagingWrite)(source));
                }
                (buffer, memory)
            }
        };
        Ok(Self::register(registry, buffer, memory, size, kind))
    }

    /// Zeroed host-visible uniform buffer of `size` bytes.
    pub fn uniform(
        device: &D,
        registry: &mut ResourceLifetimeRegistry<D>,
        resource: &'static str,
        size: u64,
    ) -> Result<Self, ResourceCreationError> {
        if size == 0 {
            return Err(invalid(resource, "zero-sized uniform buffer"));
        }
        let kind = BufferKind::Uniform;
        let (buffer, memory) = device
            .create_buffer(size, kind.usage(), kind.location())
            .map_err(creation_error(resource, UploadStage::DeviceAllocation))?;
        Ok(Self::register(registry, buffer, memory, size, kind))
    }

    fn register(
        registry: &mut ResourceLifetimeRegistry<D>,
        buffer: D::Buffer,
        memory: D::Memory,
        size: u64,
        kind: BufferKind,
    ) -> Self {
        registry.register(move |d: &D| d.destroy_buffer(buffer, memory));
        Self {
            buffer,
            memory,
            size,
            kind,
        }
    }

    /// Synchronous write into a uniform buffer. Data larger than the buffer
    /// is rejected with [`GpuError::WriteOutOfBounds`].
    pub fn update(&self, device: &D, data: &[u8]) -> Result<(), GpuError> {
        debug_assert_eq!(
            self.kind,
            BufferKind::Uniform,
            "update is only valid on uniform buffers"
        );
        check_write(self.size, 0, data.len())?;
        device.write_memory(self.memory, 0, data)
    }

    pub fn handle(&self) -> D::Buffer {
        self.buffer
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }
}

/// Indexed triangle mesh with CPU mirrors of its data.
pub struct Mesh<D: GpuDevice> {
    vertices: Vec<Vertex>,
    indices: Vec<u16>,
    vertex_buffer: Buffer<D>,
    index_buffer: Buffer<D>,
}

impl<D: GpuDevice> Mesh<D> {
    pub fn new(
        device: &D,
        upload: &UploadContext<D>,
        registry: &mut ResourceLifetimeRegistry<D>,
        vertices: Vec<Vertex>,
        indices: Vec<u16>,
    ) -> Result<Self, ResourceCreationError> {
        if vertices.is_empty() {
            return Err(invalid("mesh vertex buffer", "mesh without vertices"));
        }
        if indices.is_empty() {
            return Err(invalid("mesh index buffer", "mesh without indices"));
        }
        if indices.iter().any(|&i| i as usize >= vertices.len()) {
            return Err(invalid("mesh index buffer", "index past the last vertex"));
        }
        let vertex_bytes: &[u8] = bytemuck::cast_slice(&vertices);
        let index_bytes: &[u8] = bytemuck::cast_slice(&indices);

        let (vb, vb_memory) = upload_to_device(
            device,
            upload,
            "mesh vertex buffer",
            BufferKind::Vertex,
            vertex_bytes,
        )?;
        let (ib, ib_memory) = match upload_to_device(
            device,
            upload,
            "mesh index buffer",
            BufferKind::Index,
            index_bytes,
        ) {
            Ok(pair) => pair,
            Err(e) => {
                device.destroy_buffer(vb, vb_memory);
                return Err(e);
            }
        };

        let vertex_buffer = Buffer::register(
            registry,
            vb,
            vb_memory,
            vertex_bytes.len() as u64,
            BufferKind::Vertex,
        );
        let index_buffer = Buffer::register(
            registry,
            ib,
            ib_memory,
            index_bytes.len() as u64,
            BufferKind::Index,
        );
        debug!(
            vertices = vertices.len(),
            indices = indices.len(),
            "mesh uploaded"
        );
        Ok(Self {
            vertices,
            indices,
            vertex_buffer,
            index_buffer,
        })
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn indices(&self) -> &[u16] {
        &self.indices
    }

    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }

    pub fn vertex_buffer(&self) -> &Buffer<D> {
        &self.vertex_buffer
    }

    pub fn index_buffer(&self) -> &Buffer<D> {
        &self.index_buffer
    }
}

/// Sampled 2D image, left in shader-read-only layout.
pub struct Texture<D: GpuDevice> {
    image: D::Image,
    extent: RenderSize,
    format: TextureFormat,
}

impl<D: GpuDevice> Texture<D> {
    pub fn from_rgba8(
        device: &D,
        upload: &UploadContext<D>,
        registry: &mut ResourceLifetimeRegistry<D>,
        extent: RenderSize,
        format: TextureFormat,
        pixels: &[u8],
    ) -> Result<Self, ResourceCreationError> {
        const RESOURCE: &str = "texture";
        if extent.is_empty() {
            return Err(invalid(RESOURCE, "zero-sized texture"));
        }
        let expected = extent.width as u64 * extent.height as u64 * format.bytes_per_pixel();
        if pixels.len() as u64 != expected {
            return Err(invalid(RESOURCE, "pixel data does not match the extent"));
        }

        let (staging, staging_memory) = create_staging(device, RESOURCE, pixels)?;
        let (image, memory) = match device.create_image(extent, format) {
            Ok(pair) => pair,
            Err(source) => {
                device.destroy_buffer(staging, staging_memory);
                return Err(creation_error(RESOURCE, UploadStage::DeviceAllocation)(source));
            }
        };

        let copied = upload.immediate_submit(device, |cmd| {
            device.cmd_transition_image(
                cmd,
                image,
                ImageLayout::Undefined,
                ImageLayout::TransferDst,
            );
            device.cmd_copy_buffer_to_image(cmd, staging, image, extent);
            device.cmd_transition_image(
                cmd,
                image,
                ImageLayout::TransferDst,
                ImageLayout::ShaderReadOnly,
            );
        });
        device.destroy_buffer(staging, staging_memory);
        if let Err(source) = copied {
            device.destroy_image(image, memory);
            return Err(creation_error(RESOURCE, UploadStage::Transfer)(source));
        }

        registry.register(move |d: &D| d.destroy_image(image, memory));
        Ok(Self {
            image,
            extent,
            format,
        })
    }

    pub fn image(&self) -> D::Image {
        self.image
    }

    pub fn extent(&self) -> RenderSize {
        self.extent
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeGpu;

    #[test]
    fn vertex_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<Vertex>(), 24);
        let v = [Vertex::new([1.0, 2.0, 3.0], [0.5, 0.5, 0.5])];
        let bytes: &[u8] = bytemuck::cast_slice(&v);
        assert_eq!(&bytes[..4], &1.0f32.to_ne_bytes());
    }

    #[test]
    fn kinds_map_to_memory_locations() {
        assert_eq!(BufferKind::Vertex.location(), MemoryLocation::DeviceLocal);
        assert_eq!(BufferKind::Index.location(), MemoryLocation::DeviceLocal);
        assert_eq!(BufferKind::Uniform.location(), MemoryLocation::HostVisible);
        assert!(BufferKind::Staging.usage().contains(BufferUsage::TRANSFER_SRC));
    }

    #[test]
    fn staged_buffer_reaches_device_memory() {
        let gpu = FakeGpu::new();
        let mut registry = ResourceLifetimeRegistry::new("test");
        let upload = UploadContext::new(&gpu, &mut registry).unwrap();
        let data: Vec<u8> = (0..64).collect();

        let buffer = Buffer::with_data(
            &gpu,
            &upload,
            &mut registry,
            "test buffer",
            BufferKind::Vertex,
            &data,
        )
        .unwrap();

        assert_eq!(gpu.buffer_contents(buffer.handle()), Some(data));
        // Upload pool plus the final buffer; staging is already gone.
        assert_eq!(registry.len(), 2);
        assert_eq!(gpu.live_of_kind("buffer"), 1);

        registry.flush_all(&gpu);
        assert_eq!(gpu.live_objects(), 0);
    }

    #[test]
    fn failed_device_allocation_frees_staging() {
        let gpu = FakeGpu::new();
        let mut registry = ResourceLifetimeRegistry::new("test");
        let upload = UploadContext::new(&gpu, &mut registry).unwrap();
        gpu.fail_next_allocation(MemoryLocation::DeviceLocal);

        let err = Buffer::with_data(
            &gpu,
            &upload,
            &mut registry,
            "test buffer",
            BufferKind::Index,
            &[1, 2, 3, 4],
        )
        .err()
        .unwrap();
        assert_eq!(err.stage, UploadStage::DeviceAllocation);
        assert_eq!(err.source, GpuError::OutOfDeviceMemory);
        assert_eq!(registry.len(), 1);
        assert_eq!(gpu.live_of_kind("buffer"), 0);

        registry.flush_all(&gpu);
    }

    #[test]
    fn uniform_update_is_visible_immediately() {
        let gpu = FakeGpu::new();
        let mut registry = ResourceLifetimeRegistry::new("test");
        let ubo = Buffer::uniform(&gpu, &mut registry, "ubo", 16).unwrap();
        ubo.update(&gpu, &[7; 16]).unwrap();
        assert_eq!(gpu.buffer_contents(ubo.handle()), Some(vec![7; 16]));
        registry.flush_all(&gpu);
    }

    #[test]
    fn oversized_uniform_update_is_rejected() {
        let gpu = FakeGpu::new();
        let mut registry = ResourceLifetimeRegistry::new("test");
        let ubo = Buffer::uniform(&gpu, &mut registry, "ubo", 16).unwrap();
        ubo.update(&gpu, &[3; 16]).unwrap();

        let err = ubo.update(&gpu, &[9; 32]).err();
        assert_eq!(
            err,
            Some(GpuError::WriteOutOfBounds {
                offset: 0,
                len: 32,
                size: 16
            })
        );
        assert_eq!(gpu.buffer_contents(ubo.handle()), Some(vec![3; 16]));
        registry.flush_all(&gpu);
    }

    #[test]
    fn empty_buffers_are_rejected_before_allocation() {
        let gpu = FakeGpu::new();
        let mut registry = ResourceLifetimeRegistry::new("test");
        let upload = UploadContext::new(&gpu, &mut registry).unwrap();
        let live = gpu.live_objects();

        let err = Buffer::with_data(
            &gpu,
            &upload,
            &mut registry,
            "empty",
            BufferKind::Vertex,
            &[],
        )
        .err()
        .unwrap();
        assert_eq!(err.stage, UploadStage::Validation);
        assert!(matches!(err.source, GpuError::InvalidInput(_)));

        let err = Buffer::uniform(&gpu, &mut registry, "ubo", 0).err().unwrap();
        assert_eq!(err.stage, UploadStage::Validation);

        assert_eq!(gpu.live_objects(), live);
        assert_eq!(registry.len(), 1);
        registry.flush_all(&gpu);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "uniform buffers")]
    fn update_on_vertex_buffer_asserts() {
        let gpu = FakeGpu::new();
        let mut registry = ResourceLifetimeRegistry::new("test");
        let upload = UploadContext::new(&gpu, &mut registry).unwrap();
        let vb = Buffer::with_data(
            &gpu,
            &upload,
            &mut registry,
            "vb",
            BufferKind::Vertex,
            &[0; 8],
        )
        .unwrap();
        let _ = vb.update(&gpu, &[1; 8]);
    }

    #[test]
    fn texture_upload_transitions_layouts() {
        let gpu = FakeGpu::new();
        let mut registry = ResourceLifetimeRegistry::new("test");
        let upload = UploadContext::new(&gpu, &mut registry).unwrap();
        let pixels: Vec<u8> = (0..16u8).collect();

        let tex = Texture::from_rgba8(
            &gpu,
            &upload,
            &mut registry,
            RenderSize::new(2, 2),
            TextureFormat::Rgba8Srgb,
            &pixels,
        )
        .unwrap();

        assert_eq!(gpu.image_layout(tex.image()), Some(ImageLayout::ShaderReadOnly));
        assert_eq!(gpu.image_contents(tex.image()), Some(pixels));
        assert!(gpu.violations().is_clean());
        registry.flush_all(&gpu);
        assert_eq!(gpu.live_objects(), 0);
    }
}
