// SPDX-License-Identifier: CEPL-1.0
//! `GpuDevice` over raw `vk` handles.
//!
//! Handle arguments come from the core's wrappers, which create each object
//! once and destroy it once; that ownership is what makes the `unsafe` calls
//! below sound.

use std::collections::HashMap;
use std::sync::{MutexGuard, PoisonError};
use std::time::Duration;

use ash::vk;
use cadence_render::gpu::{
    check_write, BufferUsage, CommandPoolUsage, GpuDevice, ImageLayout, LayoutBinding, MemoryLocation,
    PoolSize, Submission, TextureFormat,
};
use cadence_render::{GpuError, QueueKind, RenderSize};

use crate::context::DeviceContext;
use crate::convert::{
    buffer_usage, descriptor_type, find_memory_type, image_layout, memory_properties,
    pipeline_stages, shader_stages, texture_format, timeout_ns, transition_masks, VkResultExt,
};

const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

impl DeviceContext {
    fn allocate_for(
        &self,
        req: vk::MemoryRequirements,
        location: MemoryLocation,
    ) -> Result<vk::DeviceMemory, GpuError> {
        let mem_type = find_memory_type(
            &self.memory,
            req.memory_type_bits,
            memory_properties(location),
        )
        .ok_or(GpuError::NoSuitableMemoryType)?;
        let mai = vk::MemoryAllocateInfo {
            s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
            allocation_size: req.size,
            memory_type_index: mem_type,
            ..Default::default()
        };
        unsafe { self.device.allocate_memory(&mai, None) }.gpu()
    }

    fn host_sizes(&self) -> MutexGuard<'_, HashMap<vk::DeviceMemory, u64>> {
        self.host_sizes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl GpuDevice for DeviceContext {
    type Fence = vk::Fence;
    type Semaphore = vk::Semaphore;
    type CommandPool = vk::CommandPool;
    type CommandBuffer = vk::CommandBuffer;
    type Buffer = vk::Buffer;
    type Image = vk::Image;
    type Memory = vk::DeviceMemory;
    type DescriptorSetLayout = vk::DescriptorSetLayout;
    type DescriptorPool = vk::DescriptorPool;
    type DescriptorSet = vk::DescriptorSet;

    fn queue_family(&self, queue: QueueKind) -> u32 {
        self.families.get(queue)
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence, GpuError> {
        let ci = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: if signaled {
                vk::FenceCreateFlags::SIGNALED
            } else {
                vk::FenceCreateFlags::empty()
            },
            ..Default::default()
        };
        unsafe { self.device.create_fence(&ci, None) }.gpu()
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout: Duration) -> Result<(), GpuError> {
        unsafe {
            self.device
                .wait_for_fences(std::slice::from_ref(&fence), true, timeout_ns(timeout))
        }
        .gpu()
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<(), GpuError> {
        unsafe { self.device.reset_fences(std::slice::from_ref(&fence)) }.gpu()
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore, GpuError> {
        let ci = vk::SemaphoreCreateInfo::default();
        unsafe { self.device.create_semaphore(&ci, None) }.gpu()
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn create_command_pool(
        &self,
        queue: QueueKind,
        usage: CommandPoolUsage,
    ) -> Result<vk::CommandPool, GpuError> {
        let flags = match usage {
            CommandPoolUsage::Resettable => vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            CommandPoolUsage::Transient => vk::CommandPoolCreateFlags::TRANSIENT,
        };
        let ci = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            flags,
            queue_family_index: self.families.get(queue),
            ..Default::default()
        };
        unsafe { self.device.create_command_pool(&ci, None) }.gpu()
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer, GpuError> {
        let ai = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        let bufs = unsafe { self.device.allocate_command_buffers(&ai) }.gpu()?;
        Ok(bufs[0])
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, cmd: vk::CommandBuffer) {
        unsafe {
            self.device
                .free_command_buffers(pool, std::slice::from_ref(&cmd))
        };
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<(), GpuError> {
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
        }
        .gpu()
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, one_time: bool) -> Result<(), GpuError> {
        let bi = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            flags: if one_time {
                vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
            } else {
                vk::CommandBufferUsageFlags::empty()
            },
            ..Default::default()
        };
        unsafe { self.device.begin_command_buffer(cmd, &bi) }.gpu()
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<(), GpuError> {
        unsafe { self.device.end_command_buffer(cmd) }.gpu()
    }

    fn submit(&self, queue: QueueKind, submission: &Submission<'_, Self>) -> Result<(), GpuError> {
        let wait_semaphores: Vec<vk::Semaphore> =
            submission.wait.iter().map(|(s, _)| *s).collect();
        let wait_stages: Vec<vk::PipelineStageFlags> = submission
            .wait
            .iter()
            .map(|(_, stage)| pipeline_stages(*stage))
            .collect();
        let si = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: wait_semaphores.len() as u32,
            p_wait_semaphores: wait_semaphores.as_ptr(),
            p_wait_dst_stage_mask: wait_stages.as_ptr(),
            command_buffer_count: submission.command_buffers.len() as u32,
            p_command_buffers: submission.command_buffers.as_ptr(),
            signal_semaphore_count: submission.signal.len() as u32,
            p_signal_semaphores: submission.signal.as_ptr(),
            ..Default::default()
        };
        unsafe {
            self.device.queue_submit(
                self.queue(queue),
                std::slice::from_ref(&si),
                submission.fence.unwrap_or_default(),
            )
        }
        .gpu()
    }

    fn queue_wait_idle(&self, queue: QueueKind) -> Result<(), GpuError> {
        unsafe { self.device.queue_wait_idle(self.queue(queue)) }.gpu()
    }

    fn wait_idle(&self) -> Result<(), GpuError> {
        unsafe { self.device.device_wait_idle() }.gpu()
    }

    fn create_buffer(
        &self,
        size: u64,
        usage: BufferUsage,
        location: MemoryLocation,
    ) -> Result<(vk::Buffer, vk::DeviceMemory), GpuError> {
        let bci = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            size,
            usage: buffer_usage(usage),
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let buf = unsafe { self.device.create_buffer(&bci, None) }.gpu()?;
        let req = unsafe { self.device.get_buffer_memory_requirements(buf) };
        let mem = match self.allocate_for(req, location) {
            Ok(m) => m,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buf, None) };
                return Err(e);
            }
        };
        if let Err(e) = unsafe { self.device.bind_buffer_memory(buf, mem, 0) } {
            unsafe {
                self.device.destroy_buffer(buf, None);
                self.device.free_memory(mem, None);
            }
            return Err(crate::convert::gpu_error(e));
        }
        if location == MemoryLocation::HostVisible {
            self.host_sizes().insert(mem, size);
        }
        Ok((buf, mem))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer, memory: vk::DeviceMemory) {
        self.host_sizes().remove(&memory);
        unsafe {
            self.device.destroy_buffer(buffer, None);
            self.device.free_memory(memory, None);
        }
    }

    fn write_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: u64,
        data: &[u8],
    ) -> Result<(), GpuError> {
        let size = self
            .host_sizes()
            .get(&memory)
            .copied()
            .ok_or(GpuError::MemoryMapFailed)?;
        check_write(size, offset, data.len())?;
        if data.is_empty() {
            return Ok(());
        }
        // Host-coherent memory: no flush after the copy.
        unsafe {
            let ptr = self
                .device
                .map_memory(
                    memory,
                    offset,
                    data.len() as vk::DeviceSize,
                    vk::MemoryMapFlags::empty(),
                )
                .gpu()?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.cast::<u8>(), data.len());
            self.device.unmap_memory(memory);
        }
        Ok(())
    }

    fn cmd_copy_buffer(&self, cmd: vk::CommandBuffer, src: vk::Buffer, dst: vk::Buffer, size: u64) {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        unsafe {
            self.device
                .cmd_copy_buffer(cmd, src, dst, std::slice::from_ref(&region))
        };
    }

    fn create_image(
        &self,
        extent: RenderSize,
        format: TextureFormat,
    ) -> Result<(vk::Image, vk::DeviceMemory), GpuError> {
        let ci = vk::ImageCreateInfo {
            s_type: vk::StructureType::IMAGE_CREATE_INFO,
            image_type: vk::ImageType::TYPE_2D,
            format: texture_format(format),
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        let image = unsafe { self.device.create_image(&ci, None) }.gpu()?;
        let req = unsafe { self.device.get_image_memory_requirements(image) };
        let mem = match self.allocate_for(req, MemoryLocation::DeviceLocal) {
            Ok(m) => m,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };
        if let Err(e) = unsafe { self.device.bind_image_memory(image, mem, 0) } {
            unsafe {
                self.device.destroy_image(image, None);
                self.device.free_memory(mem, None);
            }
            return Err(crate::convert::gpu_error(e));
        }
        Ok((image, mem))
    }

    fn destroy_image(&self, image: vk::Image, memory: vk::DeviceMemory) {
        unsafe {
            self.device.destroy_image(image, None);
            self.device.free_memory(memory, None);
        }
    }

    fn cmd_transition_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        from: ImageLayout,
        to: ImageLayout,
    ) {
        let (src_access, dst_access, src_stage, dst_stage) = transition_masks(from, to);
        let barrier = vk::ImageMemoryBarrier {
            s_type: vk::StructureType::IMAGE_MEMORY_BARRIER,
            src_access_mask: src_access,
            dst_access_mask: dst_access,
            old_layout: image_layout(from),
            new_layout: image_layout(to),
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            image,
            subresource_range: COLOR_RANGE,
            ..Default::default()
        };
        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                std::slice::from_ref(&barrier),
            )
        };
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        extent: RenderSize,
    ) {
        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
        };
        unsafe {
            self.device.cmd_copy_buffer_to_image(
                cmd,
                src,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                std::slice::from_ref(&region),
            )
        };
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[LayoutBinding],
    ) -> Result<vk::DescriptorSetLayout, GpuError> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| vk::DescriptorSetLayoutBinding {
                binding: b.binding,
                descriptor_type: descriptor_type(b.kind),
                descriptor_count: b.count,
                stage_flags: shader_stages(b.stages),
                ..Default::default()
            })
            .collect();
        let ci = vk::DescriptorSetLayoutCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_LAYOUT_CREATE_INFO,
            binding_count: vk_bindings.len() as u32,
            p_bindings: vk_bindings.as_ptr(),
            ..Default::default()
        };
        unsafe { self.device.create_descriptor_set_layout(&ci, None) }.gpu()
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[PoolSize],
    ) -> Result<vk::DescriptorPool, GpuError> {
        let vk_sizes: Vec<vk::DescriptorPoolSize> = sizes
            .iter()
            .map(|s| vk::DescriptorPoolSize {
                ty: descriptor_type(s.kind),
                descriptor_count: s.count,
            })
            .collect();
        let ci = vk::DescriptorPoolCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
            max_sets,
            pool_size_count: vk_sizes.len() as u32,
            p_pool_sizes: vk_sizes.as_ptr(),
            ..Default::default()
        };
        unsafe { self.device.create_descriptor_pool(&ci, None) }.gpu()
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<(), GpuError> {
        unsafe {
            self.device
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())
        }
        .gpu()
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, GpuError> {
        let ai = vk::DescriptorSetAllocateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
            descriptor_pool: pool,
            descriptor_set_count: 1,
            p_set_layouts: &layout,
            ..Default::default()
        };
        let sets = unsafe { self.device.allocate_descriptor_sets(&ai) }.gpu()?;
        Ok(sets[0])
    }

    fn write_buffer_descriptor(
        &self,
        set: vk::DescriptorSet,
        binding: &LayoutBinding,
        buffer: vk::Buffer,
        range: u64,
    ) {
        let info = vk::DescriptorBufferInfo {
            buffer,
            offset: 0,
            range,
        };
        let write = vk::WriteDescriptorSet {
            s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
            dst_set: set,
            dst_binding: binding.binding,
            dst_array_element: 0,
            descriptor_count: 1,
            descriptor_type: descriptor_type(binding.kind),
            p_buffer_info: &info,
            ..Default::default()
        };
        unsafe {
            self.device
                .update_descriptor_sets(std::slice::from_ref(&write), &[])
        };
    }
}
