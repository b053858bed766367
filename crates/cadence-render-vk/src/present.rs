// SPDX-License-Identifier: CEPL-1.0
use std::time::Duration;

use ash::vk;
use cadence_render::gpu::{
    PresentationEngine, SurfaceCapabilities, SurfaceFormat, SurfaceSupport, SwapchainDesc,
};
use cadence_render::GpuError;
use tracing::debug;

use crate::context::DeviceContext;
use crate::convert::{
    current_extent, extent_2d, present_mode, render_size, surface_format, timeout_ns,
    vk_color_space, vk_format, vk_present_mode, VkResultExt,
};

impl PresentationEngine for DeviceContext {
    type Swapchain = vk::SwapchainKHR;
    type ImageView = vk::ImageView;

    fn surface_support(&self) -> Result<SurfaceSupport, GpuError> {
        let (caps, formats, modes) = unsafe {
            (
                self.surface_loader
                    .get_physical_device_surface_capabilities(self.phys, self.surface)
                    .gpu()?,
                self.surface_loader
                    .get_physical_device_surface_formats(self.phys, self.surface)
                    .gpu()?,
                self.surface_loader
                    .get_physical_device_surface_present_modes(self.phys, self.surface)
                    .gpu()?,
            )
        };
        Ok(SurfaceSupport {
            capabilities: SurfaceCapabilities {
                min_image_count: caps.min_image_count,
                max_image_count: caps.max_image_count,
                current_extent: current_extent(caps.current_extent),
                min_extent: render_size(caps.min_image_extent),
                max_extent: render_size(caps.max_image_extent),
            },
            formats: formats.into_iter().map(surface_format).collect(),
            present_modes: modes.into_iter().filter_map(present_mode).collect(),
        })
    }

    fn create_swapchain(
        &self,
        desc: &SwapchainDesc,
        old: Option<vk::SwapchainKHR>,
    ) -> Result<vk::SwapchainKHR, GpuError> {
        let caps = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.phys, self.surface)
        }
        .gpu()?;

        // Images cross from the graphics to the present family when they differ.
        let family_indices = [self.families.graphics, self.families.present];
        let (sharing_mode, index_count) = if self.families.graphics == self.families.present {
            (vk::SharingMode::EXCLUSIVE, 0)
        } else {
            (vk::SharingMode::CONCURRENT, family_indices.len() as u32)
        };

        let ci = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface: self.surface,
            min_image_count: desc.image_count,
            image_format: vk_format(desc.format.format),
            image_color_space: vk_color_space(desc.format.color_space),
            image_extent: extent_2d(desc.extent),
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            image_sharing_mode: sharing_mode,
            queue_family_index_count: index_count,
            p_queue_family_indices: family_indices.as_ptr(),
            pre_transform: caps.current_transform,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode: vk_present_mode(desc.present_mode),
            clipped: vk::TRUE,
            old_swapchain: old.unwrap_or_default(),
            ..Default::default()
        };
        let swapchain = unsafe { self.swapchain_loader.create_swapchain(&ci, None) }.gpu()?;
        debug!(?swapchain, retired = ?old, "swapchain created");
        Ok(swapchain)
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>, GpuError> {
        unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }.gpu()
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        format: SurfaceFormat,
    ) -> Result<vk::ImageView, GpuError> {
        let ci = vk::ImageViewCreateInfo {
            s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
            image,
            view_type: vk::ImageViewType::TYPE_2D,
            format: vk_format(format.format),
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            },
            ..Default::default()
        };
        unsafe { self.device.create_image_view(&ci, None) }.gpu()
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout: Duration,
        signal: vk::Semaphore,
    ) -> Result<(u32, bool), GpuError> {
        unsafe {
            self.swapchain_loader.acquire_next_image(
                swapchain,
                timeout_ns(timeout),
                signal,
                vk::Fence::null(),
            )
        }
        .gpu()
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<bool, GpuError> {
        let present = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            swapchain_count: 1,
            p_swapchains: &swapchain,
            p_image_indices: &image_index,
            ..Default::default()
        };
        unsafe {
            self.swapchain_loader
                .queue_present(self.queue(cadence_render::QueueKind::Present), &present)
        }
        .gpu()
    }
}
