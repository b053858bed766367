// SPDX-License-Identifier: CEPL-1.0
//! Descriptor layouts, a growable pool allocator and set wrappers.
//!
//! Pools are fixed capacity: `max_sets` sets and, per descriptor kind, the
//! layout's per-set demand times `max_sets`. When the current pool is full the
//! allocator moves to a recycled or new pool and retries once. Every pool it
//! creates is destroyed by the lifetime registry at shutdown.

use std::collections::BTreeMap;

use tracing::{debug, trace, warn};

use crate::error::{FatalError, GpuError, RenderResult};
use crate::gpu::{DescriptorKind, GpuDevice, LayoutBinding, PoolSize, ShaderStages};
use crate::lifetime::ResourceLifetimeRegistry;
use crate::resource::Buffer;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceMode {
    Static,
    /// Buffer bindings become their dynamic-offset variant.
    Dynamic,
}

/// A named binding as declared by a shader.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderResource {
    pub name: String,
    pub binding: u32,
    pub kind: DescriptorKind,
    pub count: u32,
    pub stages: ShaderStages,
    pub mode: ResourceMode,
}

impl ShaderResource {
    pub fn uniform(name: impl Into<String>, binding: u32, stages: ShaderStages) -> Self {
        Self {
            name: name.into(),
            binding,
            kind: DescriptorKind::UniformBuffer,
            count: 1,
            stages,
            mode: ResourceMode::Static,
        }
    }

    fn layout_binding(&self) -> LayoutBinding {
        let kind = match (self.mode, self.kind) {
            (ResourceMode::Dynamic, DescriptorKind::UniformBuffer) => {
                DescriptorKind::UniformBufferDynamic
            }
            (ResourceMode::Dynamic, DescriptorKind::StorageBuffer) => {
                DescriptorKind::StorageBufferDynamic
            }
            (_, kind) => kind,
        };
        LayoutBinding {
            binding: self.binding,
            kind,
            count: self.count,
            stages: self.stages,
        }
    }
}

/// Per-kind descriptor totals for a pool holding `max_sets` sets of a layout.
pub fn capacity_table(bindings: &[LayoutBinding], max_sets: u32) -> Vec<PoolSize> {
    let mut totals: BTreeMap<DescriptorKind, u32> = BTreeMap::new();
    for b in bindings {
        *totals.entry(b.kind).or_insert(0) += b.count * max_sets;
    }
    totals
        .into_iter()
        .map(|(kind, count)| PoolSize { kind, count })
        .collect()
}

pub struct DescriptorSetLayout<D: GpuDevice> {
    handle: D::DescriptorSetLayout,
    resources: Vec<ShaderResource>,
    bindings: Vec<LayoutBinding>,
}

impl<D: GpuDevice> DescriptorSetLayout<D> {
    pub fn new(
        device: &D,
        resources: Vec<ShaderResource>,
        registry: &mut ResourceLifetimeRegistry<D>,
    ) -> RenderResult<Self> {
        debug_assert!(
            {
                let mut seen: Vec<u32> = resources.iter().map(|r| r.binding).collect();
                seen.sort_unstable();
                seen.windows(2).all(|w| w[0] != w[1])
            },
            "duplicate binding index in descriptor set layout"
        );
        let bindings: Vec<LayoutBinding> =
            resources.iter().map(ShaderResource::layout_binding).collect();
        let handle = device
            .create_descriptor_set_layout(&bindings)
            .map_err(FatalError::creation("descriptor set layout"))?;
        registry.register(move |d: &D| d.destroy_descriptor_set_layout(handle));
        Ok(Self {
            handle,
            resources,
            bindings,
        })
    }

    pub fn handle(&self) -> D::DescriptorSetLayout {
        self.handle
    }

    pub fn bindings(&self) -> &[LayoutBinding] {
        &self.bindings
    }

    pub fn binding(&self, index: u32) -> Option<&LayoutBinding> {
        self.bindings.iter().find(|b| b.binding == index)
    }

    pub fn binding_by_name(&self, name: &str) -> Option<&LayoutBinding> {
        let resource = self.resource(name)?;
        self.binding(resource.binding)
    }

    pub fn resource(&self, name: &str) -> Option<&ShaderResource> {
        self.resources.iter().find(|r| r.name == name)
    }
}

/// Result of a single allocation attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetAllocation<S> {
    Allocated(S),
    /// The current pool is out of memory or fragmented.
    NeedsNewPool(GpuError),
}

/// Growable set of descriptor pools for one layout.
pub struct DescriptorPoolAllocator<D: GpuDevice> {
    layout: D::DescriptorSetLayout,
    bindings: Vec<LayoutBinding>,
    max_sets: u32,
    sizes: Vec<PoolSize>,
    current: Option<D::DescriptorPool>,
    used: Vec<D::DescriptorPool>,
    free: Vec<D::DescriptorPool>,
    picks: u32,
}

impl<D: GpuDevice> DescriptorPoolAllocator<D> {
    /// No pool is created until the first allocation.
    pub fn new(layout: &DescriptorSetLayout<D>, max_sets: u32) -> Self {
        debug_assert!(max_sets > 0);
        Self {
            layout: layout.handle(),
            bindings: layout.bindings().to_vec(),
            max_sets,
            sizes: capacity_table(layout.bindings(), max_sets),
            current: None,
            used: Vec::new(),
            free: Vec::new(),
            picks: 0,
        }
    }

    /// Pool with spare capacity, creating the first one lazily.
    pub fn current_pool(
        &mut self,
        device: &D,
        registry: &mut ResourceLifetimeRegistry<D>,
    ) -> RenderResult<D::DescriptorPool> {
        match self.current {
            Some(pool) => Ok(pool),
            None => self.pick_pool(device, registry),
        }
    }

    /// Makes a recycled pool, or a new one, current and marks it used.
    pub fn pick_pool(
        &mut self,
        device: &D,
        registry: &mut ResourceLifetimeRegistry<D>,
    ) -> RenderResult<D::DescriptorPool> {
        self.picks += 1;
        let pool = match self.free.pop() {
            Some(pool) => pool,
            None => {
                let pool = device
                    .create_descriptor_pool(self.max_sets, &self.sizes)
                    .map_err(FatalError::creation("descriptor pool"))?;
                registry.register(move |d: &D| d.destroy_descriptor_pool(pool));
                debug!(
                    pools = self.used.len() + 1,
                    max_sets = self.max_sets,
                    "descriptor pool created"
                );
                pool
            }
        };
        self.used.push(pool);
        self.current = Some(pool);
        Ok(pool)
    }

    /// One attempt against the current pool.
    pub fn try_allocate_set(
        &mut self,
        device: &D,
        registry: &mut ResourceLifetimeRegistry<D>,
    ) -> RenderResult<SetAllocation<D::DescriptorSet>> {
        let pool = self.current_pool(device, registry)?;
        match device.allocate_descriptor_set(pool, self.layout) {
            Ok(set) => Ok(SetAllocation::Allocated(set)),
            Err(e) if e.is_pool_exhaustion() => Ok(SetAllocation::NeedsNewPool(e)),
            Err(e) => Err(FatalError::device("allocate descriptor set")(e)),
        }
    }

    /// Allocates a set, moving to another pool once on exhaustion. A second
    /// exhaustion in a row is fatal.
    pub fn allocate_set(
        &mut self,
        device: &D,
        registry: &mut ResourceLifetimeRegistry<D>,
    ) -> RenderResult<D::DescriptorSet> {
        if let SetAllocation::Allocated(set) = self.try_allocate_set(device, registry)? {
            return Ok(set);
        }
        trace!("descriptor pool exhausted; picking another");
        self.pick_pool(device, registry)?;
        match self.try_allocate_set(device, registry)? {
            SetAllocation::Allocated(set) => Ok(set),
            SetAllocation::NeedsNewPool(source) => {
                Err(FatalError::DescriptorPoolExhausted { source })
            }
        }
    }

    /// Resets every used pool and recycles it. Sets allocated from them
    /// become invalid.
    ///
    /// Every pool is attempted. A pool whose reset fails stays on the used
    /// list and the first failure is returned.
    pub fn reset_pools(&mut self, device: &D) -> RenderResult<()> {
        let mut first_err = None;
        for pool in std::mem::take(&mut self.used) {
            match device.reset_descriptor_pool(pool) {
                Ok(()) => self.free.push(pool),
                Err(e) => {
                    warn!(?e, "descriptor pool reset failed; pool stays in use");
                    self.used.push(pool);
                    first_err.get_or_insert(e);
                }
            }
        }
        self.current = None;
        match first_err {
            Some(e) => Err(FatalError::device("reset descriptor pool")(e)),
            None => Ok(()),
        }
    }

    pub fn layout_bindings(&self) -> &[LayoutBinding] {
        &self.bindings
    }

    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }

    pub fn capacity(&self) -> &[PoolSize] {
        &self.sizes
    }

    pub fn used_pools(&self) -> &[D::DescriptorPool] {
        &self.used
    }

    pub fn free_pools(&self) -> &[D::DescriptorPool] {
        &self.free
    }

    /// Number of `pick_pool` calls so far.
    pub fn pool_picks(&self) -> u32 {
        self.picks
    }
}

/// A set allocated from a [`DescriptorPoolAllocator`]. Freed with its pool.
pub struct DescriptorSet<D: GpuDevice> {
    handle: D::DescriptorSet,
    bindings: Vec<LayoutBinding>,
}

impl<D: GpuDevice> DescriptorSet<D> {
    pub fn allocate(
        device: &D,
        allocator: &mut DescriptorPoolAllocator<D>,
        registry: &mut ResourceLifetimeRegistry<D>,
    ) -> RenderResult<Self> {
        let handle = allocator.allocate_set(device, registry)?;
        Ok(Self {
            handle,
            bindings: allocator.layout_bindings().to_vec(),
        })
    }

    pub fn handle(&self) -> D::DescriptorSet {
        self.handle
    }

    /// Points every buffer binding of the layout at `buffer`, whole range.
    pub fn write_buffer(&self, device: &D, buffer: &Buffer<D>) {
        for binding in &self.bindings {
            match binding.kind {
                DescriptorKind::UniformBuffer
                | DescriptorKind::UniformBufferDynamic
                | DescriptorKind::StorageBuffer
                | DescriptorKind::StorageBufferDynamic => {
                    device.write_buffer_descriptor(
                        self.handle,
                        binding,
                        buffer.handle(),
                        buffer.size(),
                    );
                }
                DescriptorKind::CombinedImageSampler => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeGpu;

    fn resources() -> Vec<ShaderResource> {
        vec![
            ShaderResource::uniform("camera", 0, ShaderStages::VERTEX),
            ShaderResource {
                name: "albedo".into(),
                binding: 1,
                kind: DescriptorKind::CombinedImageSampler,
                count: 2,
                stages: ShaderStages::FRAGMENT,
                mode: ResourceMode::Static,
            },
        ]
    }

    #[test]
    fn capacity_table_scales_with_max_sets() {
        let bindings = [
            LayoutBinding {
                binding: 0,
                kind: DescriptorKind::UniformBuffer,
                count: 1,
                stages: ShaderStages::VERTEX,
            },
            LayoutBinding {
                binding: 1,
                kind: DescriptorKind::UniformBuffer,
                count: 2,
                stages: ShaderStages::FRAGMENT,
            },
        ];
        assert_eq!(
            capacity_table(&bindings, 5),
            vec![PoolSize {
                kind: DescriptorKind::UniformBuffer,
                count: 15
            }]
        );
    }

    #[test]
    fn dynamic_mode_selects_dynamic_kind() {
        let mut r = ShaderResource::uniform("model", 3, ShaderStages::VERTEX);
        r.mode = ResourceMode::Dynamic;
        assert_eq!(r.layout_binding().kind, DescriptorKind::UniformBufferDynamic);
    }

    #[test]
    fn layout_lookup_by_name_and_index() {
        let gpu = FakeGpu::new();
        let mut registry = ResourceLifetimeRegistry::new("test");
        let layout = DescriptorSetLayout::new(&gpu, resources(), &mut registry).unwrap();

        assert_eq!(layout.binding_by_name("albedo").map(|b| b.count), Some(2));
        assert_eq!(
            layout.binding(0).map(|b| b.kind),
            Some(DescriptorKind::UniformBuffer)
        );
        assert!(layout.binding_by_name("missing").is_none());
        assert!(layout.binding(7).is_none());

        registry.flush_all(&gpu);
        assert_eq!(gpu.live_objects(), 0);
    }

    #[test]
    fn first_pool_is_created_lazily() {
        let gpu = FakeGpu::new();
        let mut registry = ResourceLifetimeRegistry::new("test");
        let layout = DescriptorSetLayout::new(&gpu, resources(), &mut registry).unwrap();
        let mut alloc = DescriptorPoolAllocator::new(&layout, 4);
        assert_eq!(gpu.pools_created(), 0);

        let first = alloc.current_pool(&gpu, &mut registry).unwrap();
        assert_eq!(alloc.current_pool(&gpu, &mut registry).unwrap(), first);
        assert_eq!(gpu.pools_created(), 1);
        assert_eq!(alloc.used_pools(), &[first]);

        registry.flush_all(&gpu);
    }

    #[test]
    fn fragmentation_is_recovered_once() {
        let gpu = FakeGpu::new();
        let mut registry = ResourceLifetimeRegistry::new("test");
        let layout = DescriptorSetLayout::new(&gpu, resources(), &mut registry).unwrap();
        let mut alloc = DescriptorPoolAllocator::new(&layout, 4);

        gpu.fragment_descriptor_allocations(1);
        alloc.allocate_set(&gpu, &mut registry).unwrap();
        assert_eq!(alloc.pool_picks(), 2);
        assert_eq!(alloc.used_pools().len(), 2);

        registry.flush_all(&gpu);
    }
}
