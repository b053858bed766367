// SPDX-License-Identifier: CEPL-1.0
use crate::descriptor::{DescriptorPoolAllocator, DescriptorSet};
use crate::error::{FatalError, RenderResult};
use crate::gpu::GpuDevice;
use crate::lifetime::ResourceLifetimeRegistry;
use crate::resource::Buffer;

/// One uniform buffer and bound descriptor set per frame slot.
///
/// A slot's buffer is rewritten only while recording that slot, after its
/// fence wait, so the GPU never reads a buffer the CPU is writing.
pub struct SlotUniforms<D: GpuDevice> {
    slots: Vec<(Buffer<D>, DescriptorSet<D>)>,
}

impl<D: GpuDevice> SlotUniforms<D> {
    pub fn new(
        device: &D,
        allocator: &mut DescriptorPoolAllocator<D>,
        registry: &mut ResourceLifetimeRegistry<D>,
        slot_count: usize,
        size: u64,
    ) -> RenderResult<Self> {
        let mut slots = Vec::with_capacity(slot_count);
        for _ in 0..slot_count {
            let buffer = Buffer::uniform(device, registry, "per-slot uniform buffer", size)?;
            let set = DescriptorSet::allocate(device, allocator, registry)?;
            set.write_buffer(device, &buffer);
            slots.push((buffer, set));
        }
        Ok(Self { slots })
    }

    fn slot(&self, slot: usize) -> RenderResult<&(Buffer<D>, DescriptorSet<D>)> {
        self.slots.get(slot).ok_or(FatalError::SlotOutOfRange {
            slot,
            slots: self.slots.len(),
        })
    }

    pub fn write(&self, device: &D, slot: usize, data: &[u8]) -> RenderResult<()> {
        self.slot(slot)?
            .0
            .update(device, data)
            .map_err(FatalError::device("uniform buffer update"))
    }

    pub fn set(&self, slot: usize) -> RenderResult<D::DescriptorSet> {
        Ok(self.slot(slot)?.1.handle())
    }

    pub fn buffer(&self, slot: usize) -> Option<&Buffer<D>> {
        self.slots.get(slot).map(|(buffer, _)| buffer)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
