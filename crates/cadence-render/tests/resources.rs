// SPDX-License-Identifier: CEPL-1.0
use cadence_render::gpu::{ImageLayout, MemoryLocation, TextureFormat};
use cadence_render::testing::{FakeEvent, FakeGpu};
use cadence_render::{
    GpuError, Mesh, RenderSize, ResourceLifetimeRegistry, Texture, UploadContext, UploadStage,
    Vertex,
};

fn grid(n: usize) -> (Vec<Vertex>, Vec<u16>) {
    let vertices = (0..n)
        .map(|i| {
            let f = i as f32;
            Vertex::new([f, f * 0.5, 0.0], [1.0, 0.0, f / n as f32])
        })
        .collect();
    let indices = (0..n as u16).collect();
    (vertices, indices)
}

#[test]
fn mesh_with_failed_staging_registers_nothing() {
    let gpu = FakeGpu::new();
    let mut registry = ResourceLifetimeRegistry::new("scene");
    let upload = UploadContext::new(&gpu, &mut registry).unwrap();
    let before = registry.len();
    let live_before = gpu.live_objects();

    gpu.fail_next_allocation(MemoryLocation::HostVisible);
    let (vertices, indices) = grid(100);
    let err = Mesh::new(&gpu, &upload, &mut registry, vertices, indices)
        .err()
        .expect("staging allocation failure");

    assert_eq!(err.stage, UploadStage::StagingAllocation);
    assert_eq!(err.resource, "mesh vertex buffer");
    assert_eq!(registry.len(), before);
    assert_eq!(gpu.live_objects(), live_before);

    registry.flush_all(&gpu);
    assert_eq!(gpu.live_objects(), 0);
}

#[test]
fn mesh_with_failed_index_upload_releases_vertex_buffer() {
    let gpu = FakeGpu::new();
    let mut registry = ResourceLifetimeRegistry::new("scene");
    let upload = UploadContext::new(&gpu, &mut registry).unwrap();
    let before = registry.len();
    let live_before = gpu.live_objects();

    // Vertex buffer goes through, index buffer allocation fails.
    gpu.fail_allocation(MemoryLocation::DeviceLocal, 1);
    let (vertices, indices) = grid(8);
    let err = Mesh::new(&gpu, &upload, &mut registry, vertices, indices)
        .err()
        .expect("index allocation failure");

    assert_eq!(err.resource, "mesh index buffer");
    assert_eq!(err.stage, UploadStage::DeviceAllocation);
    assert_eq!(registry.len(), before);
    assert_eq!(gpu.live_objects(), live_before);
    assert_eq!(gpu.live_of_kind("buffer"), 0);

    registry.flush_all(&gpu);
    assert_eq!(gpu.live_objects(), 0);
}

#[test]
fn mesh_keeps_cpu_mirrors_and_device_copies() {
    let gpu = FakeGpu::new();
    let mut registry = ResourceLifetimeRegistry::new("scene");
    let upload = UploadContext::new(&gpu, &mut registry).unwrap();
    let (vertices, indices) = grid(100);

    let mesh = Mesh::new(&gpu, &upload, &mut registry, vertices.clone(), indices.clone()).unwrap();

    assert_eq!(mesh.vertices(), vertices.as_slice());
    assert_eq!(mesh.index_count(), 100);
    assert_eq!(mesh.vertex_buffer().size(), 100 * 24);
    assert_eq!(mesh.index_buffer().size(), 200);
    assert_eq!(
        gpu.buffer_contents(mesh.vertex_buffer().handle()),
        Some(bytemuck::cast_slice::<Vertex, u8>(&vertices).to_vec())
    );
    assert_eq!(
        gpu.buffer_contents(mesh.index_buffer().handle()),
        Some(bytemuck::cast_slice::<u16, u8>(&indices).to_vec())
    );

    registry.flush_all(&gpu);
    assert_eq!(gpu.live_objects(), 0);
}

#[test]
fn registry_tears_resources_down_newest_first() {
    let gpu = FakeGpu::new();
    let mut registry = ResourceLifetimeRegistry::new("scene");
    let upload = UploadContext::new(&gpu, &mut registry).unwrap();
    let (vertices, indices) = grid(4);
    let first = Mesh::new(&gpu, &upload, &mut registry, vertices.clone(), indices.clone()).unwrap();
    let second = Mesh::new(&gpu, &upload, &mut registry, vertices, indices).unwrap();
    gpu.clear_events();

    registry.flush_all(&gpu);

    let destroyed: Vec<_> = gpu
        .events()
        .into_iter()
        .filter_map(|e| match e {
            FakeEvent::Destroy {
                kind: "buffer",
                handle,
            } => Some(handle),
            _ => None,
        })
        .collect();
    assert_eq!(
        destroyed,
        vec![
            second.index_buffer().handle(),
            second.vertex_buffer().handle(),
            first.index_buffer().handle(),
            first.vertex_buffer().handle(),
        ]
    );
    assert!(matches!(
        gpu.events().last(),
        Some(FakeEvent::Destroy {
            kind: "command pool",
            ..
        })
    ));
}

#[test]
fn malformed_meshes_are_rejected_before_allocation() {
    let gpu = FakeGpu::new();
    let mut registry = ResourceLifetimeRegistry::new("scene");
    let upload = UploadContext::new(&gpu, &mut registry).unwrap();
    let before = registry.len();
    let live_before = gpu.live_objects();
    let (vertices, _) = grid(4);

    let cases = [
        (Vec::new(), vec![0u16], "mesh vertex buffer"),
        (vertices.clone(), Vec::new(), "mesh index buffer"),
        (vertices, vec![0, 1, 4], "mesh index buffer"),
    ];
    for (vertices, indices, resource) in cases {
        let err = Mesh::new(&gpu, &upload, &mut registry, vertices, indices)
            .err()
            .expect("malformed mesh");
        assert_eq!(err.stage, UploadStage::Validation);
        assert_eq!(err.resource, resource);
        assert!(matches!(err.source, GpuError::InvalidInput(_)));
    }

    assert_eq!(registry.len(), before);
    assert_eq!(gpu.live_objects(), live_before);
    assert_eq!(gpu.submission_count(), 0);
    registry.flush_all(&gpu);
}

fn checker(extent: RenderSize) -> Vec<u8> {
    (0..extent.width * extent.height)
        .flat_map(|i| if i % 2 == 0 { [255, 255, 255, 255] } else { [0, 0, 0, 255] })
        .collect()
}

#[test]
fn texture_upload_runs_transition_copy_transition() {
    let gpu = FakeGpu::new();
    let mut registry = ResourceLifetimeRegistry::new("scene");
    let upload = UploadContext::new(&gpu, &mut registry).unwrap();
    let extent = RenderSize::new(4, 2);
    let pixels = checker(extent);
    gpu.clear_events();

    let tex = Texture::from_rgba8(
        &gpu,
        &upload,
        &mut registry,
        extent,
        TextureFormat::Rgba8Srgb,
        &pixels,
    )
    .unwrap();

    let image = tex.image();
    let image_ops: Vec<_> = gpu
        .events()
        .into_iter()
        .filter(|e| match e {
            FakeEvent::Transition { image: i, .. } | FakeEvent::CopyToImage { image: i, .. } => {
                *i == image
            }
            _ => false,
        })
        .collect();
    assert_eq!(image_ops.len(), 3);
    assert_eq!(
        image_ops[0],
        FakeEvent::Transition {
            image,
            from: ImageLayout::Undefined,
            to: ImageLayout::TransferDst,
        }
    );
    assert!(matches!(image_ops[1], FakeEvent::CopyToImage { .. }));
    assert_eq!(
        image_ops[2],
        FakeEvent::Transition {
            image,
            from: ImageLayout::TransferDst,
            to: ImageLayout::ShaderReadOnly,
        }
    );
    assert_eq!(gpu.image_contents(image), Some(pixels));
    assert!(gpu.violations().is_clean());
    // Staging buffer is gone once the constructor returns.
    assert_eq!(gpu.live_of_kind("buffer"), 0);

    registry.flush_all(&gpu);
    assert_eq!(gpu.live_objects(), 0);
}

#[test]
fn texture_with_failed_allocation_leaves_nothing_behind() {
    let gpu = FakeGpu::new();
    let mut registry = ResourceLifetimeRegistry::new("scene");
    let upload = UploadContext::new(&gpu, &mut registry).unwrap();
    let before = registry.len();
    let live_before = gpu.live_objects();
    let extent = RenderSize::new(2, 2);
    let pixels = checker(extent);

    for (location, stage) in [
        (MemoryLocation::HostVisible, UploadStage::StagingAllocation),
        (MemoryLocation::DeviceLocal, UploadStage::DeviceAllocation),
    ] {
        gpu.fail_next_allocation(location);
        let err = Texture::from_rgba8(
            &gpu,
            &upload,
            &mut registry,
            extent,
            TextureFormat::Rgba8Unorm,
            &pixels,
        )
        .err()
        .expect("allocation failure");
        assert_eq!(err.resource, "texture");
        assert_eq!(err.stage, stage);
        assert_eq!(registry.len(), before);
        assert_eq!(gpu.live_objects(), live_before);
    }

    registry.flush_all(&gpu);
    assert_eq!(gpu.live_objects(), 0);
}

#[test]
fn texture_with_mismatched_pixels_is_rejected() {
    let gpu = FakeGpu::new();
    let mut registry = ResourceLifetimeRegistry::new("scene");
    let upload = UploadContext::new(&gpu, &mut registry).unwrap();
    let live_before = gpu.live_objects();

    let short = checker(RenderSize::new(2, 1));
    let err = Texture::from_rgba8(
        &gpu,
        &upload,
        &mut registry,
        RenderSize::new(2, 2),
        TextureFormat::Rgba8Srgb,
        &short,
    )
    .err()
    .expect("short pixel data");
    assert_eq!(err.stage, UploadStage::Validation);

    let err = Texture::from_rgba8(
        &gpu,
        &upload,
        &mut registry,
        RenderSize::new(0, 4),
        TextureFormat::Rgba8Srgb,
        &[],
    )
    .err()
    .expect("zero-sized texture");
    assert_eq!(err.stage, UploadStage::Validation);

    assert_eq!(gpu.live_objects(), live_before);
    registry.flush_all(&gpu);
    assert_eq!(gpu.live_objects(), 0);
}
