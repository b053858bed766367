// SPDX-License-Identifier: CEPL-1.0
//! Presentable image chain: selection rules, acquire/present, recreation.

use std::time::Duration;

use tracing::{debug, info, trace};

use crate::error::{FatalError, GpuError, RenderResult};
use crate::gpu::{
    ColorFormat, ColorSpace, PresentMode, PresentationEngine, SurfaceCapabilities,
    SurfaceFormat, SwapchainDesc,
};
use crate::RenderSize;

/// Outcome of an acquire. Only `Ready` hands out an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireResult {
    Ready { image_index: u32, suboptimal: bool },
    /// The surface changed; recreate the swapchain and every
    /// image-dependent object.
    OutOfDate,
    /// No image within the timeout. Retry next iteration.
    Timeout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentResult {
    Success,
    /// Out of date or suboptimal; recreate before the next frame.
    OutOfDate,
}

/// Surface minimum plus one, capped by the maximum when there is one.
pub fn choose_image_count(caps: &SurfaceCapabilities) -> u32 {
    let desired = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        desired.min(caps.max_image_count)
    } else {
        desired
    }
}

/// The surface's current extent, or the framebuffer size clamped to the
/// surface limits when the surface leaves the choice to us.
pub fn choose_extent(caps: &SurfaceCapabilities, framebuffer: RenderSize) -> RenderSize {
    match caps.current_extent {
        Some(extent) => extent,
        None => RenderSize {
            width: framebuffer
                .width
                .clamp(caps.min_extent.width, caps.max_extent.width),
            height: framebuffer
                .height
                .clamp(caps.min_extent.height, caps.max_extent.height),
        },
    }
}

pub fn choose_surface_format(formats: &[SurfaceFormat]) -> Option<SurfaceFormat> {
    formats
        .iter()
        .copied()
        .find(|f| f.format == ColorFormat::Bgra8Srgb && f.color_space == ColorSpace::SrgbNonlinear)
        .or_else(|| formats.first().copied())
}

/// FIFO is always supported, so it is the fallback.
pub fn choose_present_mode(available: &[PresentMode], preferred: PresentMode) -> PresentMode {
    if available.contains(&preferred) {
        preferred
    } else {
        PresentMode::Fifo
    }
}

struct Chain<D: PresentationEngine> {
    handle: D::Swapchain,
    images: Vec<D::Image>,
    views: Vec<D::ImageView>,
    format: SurfaceFormat,
    present_mode: PresentMode,
    extent: RenderSize,
}

fn build_chain<D: PresentationEngine>(
    device: &D,
    framebuffer: RenderSize,
    preferred: PresentMode,
    old: Option<D::Swapchain>,
) -> RenderResult<Chain<D>> {
    let support = device
        .surface_support()
        .map_err(FatalError::device("query surface support"))?;
    let format = choose_surface_format(&support.formats).ok_or(FatalError::NoSurfaceFormat)?;
    let present_mode = choose_present_mode(&support.present_modes, preferred);
    let desc = SwapchainDesc {
        image_count: choose_image_count(&support.capabilities),
        format,
        present_mode,
        extent: choose_extent(&support.capabilities, framebuffer),
    };

    let handle = device
        .create_swapchain(&desc, old)
        .map_err(FatalError::creation("swapchain"))?;
    let images = match device.swapchain_images(handle) {
        Ok(images) => images,
        Err(e) => {
            device.destroy_swapchain(handle);
            return Err(FatalError::device("get swapchain images")(e));
        }
    };

    let mut views = Vec::with_capacity(images.len());
    for &image in &images {
        match device.create_image_view(image, format) {
            Ok(view) => views.push(view),
            Err(e) => {
                for view in views {
                    device.destroy_image_view(view);
                }
                device.destroy_swapchain(handle);
                return Err(FatalError::creation("swapchain image view")(e));
            }
        }
    }

    info!(
        images = images.len(),
        format = ?format.format,
        present_mode = ?present_mode,
        width = desc.extent.width,
        height = desc.extent.height,
        "swapchain ready"
    );

    Ok(Chain {
        handle,
        images,
        views,
        format,
        present_mode,
        extent: desc.extent,
    })
}

/// Owns the swapchain and its image views.
///
/// Views are swapchain scoped: they are destroyed on recreation, never through
/// the lifetime registry.
pub struct SwapchainManager<D: PresentationEngine> {
    chain: Chain<D>,
    preferred_present_mode: PresentMode,
    generation: u64,
}

impl<D: PresentationEngine> SwapchainManager<D> {
    pub fn new(
        device: &D,
        framebuffer: RenderSize,
        preferred_present_mode: PresentMode,
    ) -> RenderResult<Self> {
        let chain = build_chain(device, framebuffer, preferred_present_mode, None)?;
        Ok(Self {
            chain,
            preferred_present_mode,
            generation: 0,
        })
    }

    /// Replaces the chain. The caller must have drained every frame slot: the
    /// old views and swapchain are destroyed before this returns.
    pub fn recreate(&mut self, device: &D, framebuffer: RenderSize) -> RenderResult<()> {
        let chain = build_chain(
            device,
            framebuffer,
            self.preferred_present_mode,
            Some(self.chain.handle),
        )?;
        let old = std::mem::replace(&mut self.chain, chain);
        for view in old.views {
            device.destroy_image_view(view);
        }
        device.destroy_swapchain(old.handle);
        self.generation += 1;
        debug!(generation = self.generation, "swapchain recreated");
        Ok(())
    }

    pub fn acquire_next_image(
        &self,
        device: &D,
        signal: D::Semaphore,
        timeout: Duration,
    ) -> RenderResult<AcquireResult> {
        match device.acquire_next_image(self.chain.handle, timeout, signal) {
            Ok((image_index, suboptimal)) => {
                debug_assert!((image_index as usize) < self.chain.images.len());
                Ok(AcquireResult::Ready {
                    image_index,
                    suboptimal,
                })
            }
            Err(GpuError::OutOfDate) => Ok(AcquireResult::OutOfDate),
            Err(GpuError::Timeout | GpuError::NotReady) => {
                trace!(?timeout, "acquire timed out");
                Ok(AcquireResult::Timeout)
            }
            Err(e) => Err(FatalError::device("acquire next image")(e)),
        }
    }

    pub fn present(
        &self,
        device: &D,
        image_index: u32,
        wait: D::Semaphore,
    ) -> RenderResult<PresentResult> {
        match device.queue_present(self.chain.handle, image_index, wait) {
            Ok(false) => Ok(PresentResult::Success),
            Ok(true) | Err(GpuError::OutOfDate) => Ok(PresentResult::OutOfDate),
            Err(e) => Err(FatalError::device("queue present")(e)),
        }
    }

    /// Destroys views and the swapchain. The device must be idle.
    pub fn destroy(self, device: &D) {
        for view in self.chain.views {
            device.destroy_image_view(view);
        }
        device.destroy_swapchain(self.chain.handle);
    }

    pub fn handle(&self) -> D::Swapchain {
        self.chain.handle
    }

    pub fn images(&self) -> &[D::Image] {
        &self.chain.images
    }

    pub fn views(&self) -> &[D::ImageView] {
        debug_assert_eq!(self.chain.images.len(), self.chain.views.len());
        &self.chain.views
    }

    pub fn image_count(&self) -> u32 {
        self.chain.images.len() as u32
    }

    pub fn format(&self) -> SurfaceFormat {
        self.chain.format
    }

    pub fn present_mode(&self) -> PresentMode {
        self.chain.present_mode
    }

    pub fn extent(&self) -> RenderSize {
        self.chain.extent
    }

    /// Bumped by every recreation.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}
