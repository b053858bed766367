// SPDX-License-Identifier: CEPL-1.0
use cadence_render::gpu::{DescriptorKind, ShaderStages};
use cadence_render::testing::FakeGpu;
use cadence_render::{
    DescriptorPoolAllocator, DescriptorSet, DescriptorSetLayout, FatalError, GpuError,
    ResourceLifetimeRegistry, SetAllocation, ShaderResource,
};

const MAX_SETS: u32 = 3;

fn layout(
    gpu: &FakeGpu,
    registry: &mut ResourceLifetimeRegistry<FakeGpu>,
) -> DescriptorSetLayout<FakeGpu> {
    DescriptorSetLayout::new(
        gpu,
        vec![
            ShaderResource::uniform("camera", 0, ShaderStages::VERTEX),
            ShaderResource::uniform("material", 1, ShaderStages::FRAGMENT),
        ],
        registry,
    )
    .unwrap()
}

#[test]
fn full_pool_triggers_exactly_one_pick() {
    let gpu = FakeGpu::new();
    let mut registry = ResourceLifetimeRegistry::new("descriptors");
    let layout = layout(&gpu, &mut registry);
    let mut alloc = DescriptorPoolAllocator::new(&layout, MAX_SETS);

    for _ in 0..MAX_SETS {
        alloc.allocate_set(&gpu, &mut registry).unwrap();
    }
    assert_eq!(alloc.pool_picks(), 1);
    assert_eq!(gpu.pools_created(), 1);

    // The current pool holds exactly MAX_SETS sets now.
    alloc.allocate_set(&gpu, &mut registry).unwrap();
    assert_eq!(alloc.pool_picks(), 2);
    assert_eq!(gpu.pools_created(), 2);
    assert_eq!(alloc.used_pools().len(), 2);

    registry.flush_all(&gpu);
    assert_eq!(gpu.live_objects(), 0);
}

#[test]
fn capacity_table_covers_every_binding() {
    let gpu = FakeGpu::new();
    let mut registry = ResourceLifetimeRegistry::new("descriptors");
    let layout = layout(&gpu, &mut registry);
    let alloc = DescriptorPoolAllocator::new(&layout, MAX_SETS);

    assert_eq!(alloc.capacity().len(), 1);
    assert_eq!(alloc.capacity()[0].kind, DescriptorKind::UniformBuffer);
    assert_eq!(alloc.capacity()[0].count, 2 * MAX_SETS);
    registry.flush_all(&gpu);
}

#[test]
fn reset_pools_is_idempotent() {
    let gpu = FakeGpu::new();
    let mut registry = ResourceLifetimeRegistry::new("descriptors");
    let layout = layout(&gpu, &mut registry);
    let mut alloc = DescriptorPoolAllocator::new(&layout, MAX_SETS);
    for _ in 0..(MAX_SETS * 2 + 1) {
        alloc.allocate_set(&gpu, &mut registry).unwrap();
    }
    assert_eq!(alloc.used_pools().len(), 3);

    alloc.reset_pools(&gpu).unwrap();
    let used_once = alloc.used_pools().to_vec();
    let mut free_once = alloc.free_pools().to_vec();
    alloc.reset_pools(&gpu).unwrap();
    let mut free_twice = alloc.free_pools().to_vec();

    assert!(used_once.is_empty());
    assert_eq!(alloc.used_pools(), used_once.as_slice());
    free_once.sort();
    free_twice.sort();
    assert_eq!(free_once, free_twice);
    assert_eq!(free_twice.len(), 3);
    assert_eq!(gpu.pool_resets(), 3);

    // Recycled pools are reused before any new pool is created.
    for _ in 0..(MAX_SETS * 3) {
        alloc.allocate_set(&gpu, &mut registry).unwrap();
    }
    assert_eq!(gpu.pools_created(), 3);
    assert!(alloc.free_pools().is_empty());

    registry.flush_all(&gpu);
    assert_eq!(gpu.live_objects(), 0);
}

#[test]
fn second_exhaustion_is_fatal() {
    let gpu = FakeGpu::new();
    let mut registry = ResourceLifetimeRegistry::new("descriptors");
    let layout = layout(&gpu, &mut registry);
    let mut alloc = DescriptorPoolAllocator::new(&layout, MAX_SETS);

    gpu.fragment_descriptor_allocations(2);
    let err = alloc.allocate_set(&gpu, &mut registry).err();

    assert!(matches!(
        err,
        Some(FatalError::DescriptorPoolExhausted {
            source: GpuError::FragmentedPool
        })
    ));
    assert_eq!(alloc.pool_picks(), 2);

    // The allocator stays usable once the pool recovers.
    alloc.allocate_set(&gpu, &mut registry).unwrap();
    registry.flush_all(&gpu);
}

#[test]
fn exhaustion_is_reported_without_retry() {
    let gpu = FakeGpu::new();
    let mut registry = ResourceLifetimeRegistry::new("descriptors");
    let layout = layout(&gpu, &mut registry);
    let mut alloc = DescriptorPoolAllocator::new(&layout, 1);

    alloc.allocate_set(&gpu, &mut registry).unwrap();
    assert_eq!(
        alloc.try_allocate_set(&gpu, &mut registry).unwrap(),
        SetAllocation::NeedsNewPool(GpuError::OutOfPoolMemory)
    );
    assert_eq!(alloc.pool_picks(), 1);
    registry.flush_all(&gpu);
}

#[test]
fn set_write_buffer_targets_every_buffer_binding() {
    use cadence_render::Buffer;

    let gpu = FakeGpu::new();
    let mut registry = ResourceLifetimeRegistry::new("descriptors");
    let layout = layout(&gpu, &mut registry);
    let mut alloc = DescriptorPoolAllocator::new(&layout, MAX_SETS);
    let ubo = Buffer::uniform(&gpu, &mut registry, "ubo", 128).unwrap();

    let set = DescriptorSet::allocate(&gpu, &mut alloc, &mut registry).unwrap();
    set.write_buffer(&gpu, &ubo);

    let writes = gpu.descriptor_writes();
    let bindings: Vec<u32> = writes.iter().map(|w| w.binding).collect();
    assert_eq!(bindings, vec![0, 1]);
    assert!(writes
        .iter()
        .all(|w| w.set == set.handle() && w.buffer == ubo.handle() && w.range == 128));

    registry.flush_all(&gpu);
    assert_eq!(gpu.live_objects(), 0);
}

#[test]
fn failed_reset_keeps_every_pool_accounted_for() {
    let gpu = FakeGpu::new();
    let mut registry = ResourceLifetimeRegistry::new("descriptors");
    let layout = layout(&gpu, &mut registry);
    let mut alloc = DescriptorPoolAllocator::new(&layout, 1);
    for _ in 0..3 {
        alloc.allocate_set(&gpu, &mut registry).unwrap();
    }
    let created = alloc.used_pools().to_vec();
    assert_eq!(created.len(), 3);
    let failing = created[1];

    // Second reset fails; the third pool must still be reset and recycled.
    gpu.fail_pool_reset(1);
    let err = alloc.reset_pools(&gpu).err();

    assert!(matches!(
        err,
        Some(FatalError::Device {
            source: GpuError::OutOfDeviceMemory,
            ..
        })
    ));
    assert_eq!(alloc.used_pools(), &[failing]);
    assert_eq!(alloc.free_pools().len(), 2);
    let mut all: Vec<_> = alloc
        .used_pools()
        .iter()
        .chain(alloc.free_pools())
        .copied()
        .collect();
    all.sort();
    let mut expected = created.clone();
    expected.sort();
    assert_eq!(all, expected);
    assert_eq!(gpu.pool_resets(), 2);

    // A later reset retries the pool that failed.
    alloc.reset_pools(&gpu).unwrap();
    assert!(alloc.used_pools().is_empty());
    assert_eq!(alloc.free_pools().len(), 3);
    assert_eq!(gpu.pools_created(), 3);

    registry.flush_all(&gpu);
    assert_eq!(gpu.live_objects(), 0);
}
