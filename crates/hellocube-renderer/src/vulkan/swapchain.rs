//! Vulkan swapchain on the context's window surface.

use ash::vk;
use log::debug;
use std::sync::Arc;

use super::{resource_error, VulkanContext};
use crate::error::{RenderError, Result};
use crate::hal::{ChainDesc, ChainStatus, SubmitSync, SurfaceCaps, SurfaceHal};
use crate::scene::Extent2D;

/// A swapchain image and the view rendered into.
pub struct SwapchainTarget {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
}

/// Swapchain plus the binary semaphores that order acquire, render and present.
///
/// Acquire signals a spare semaphore, which is then swapped into the slot of
/// the image it returned, so the semaphore a frame waits on always belongs to
/// its image.
pub struct VulkanSurface {
    ctx: Arc<VulkanContext>,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    acquire_semaphores: Vec<vk::Semaphore>,
    spare_acquire: vk::Semaphore,
    render_finished: Vec<vk::Semaphore>,
}

impl VulkanSurface {
    /// Wraps the surface owned by `ctx`. No chain exists until the first `create_chain`.
    pub fn new(ctx: Arc<VulkanContext>) -> Self {
        Self {
            ctx,
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            acquire_semaphores: Vec::new(),
            spare_acquire: vk::Semaphore::null(),
            render_finished: Vec::new(),
        }
    }

    unsafe fn create_semaphore(&self) -> Result<vk::Semaphore> {
        self.ctx
            .device
            .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
            .map_err(|e| resource_error("Failed to create semaphore", e))
    }

    /// One acquire and one render-finished semaphore per image, plus the spare.
    unsafe fn create_sync_objects(&mut self, count: usize) -> Result<()> {
        self.spare_acquire = self.create_semaphore()?;
        for _ in 0..count {
            let acquire = self.create_semaphore()?;
            self.acquire_semaphores.push(acquire);
            let finished = self.create_semaphore()?;
            self.render_finished.push(finished);
        }
        Ok(())
    }

    unsafe fn destroy_sync_objects(&mut self) {
        let device = &self.ctx.device;
        for semaphore in self.acquire_semaphores.drain(..).chain(self.render_finished.drain(..)) {
            device.destroy_semaphore(semaphore, None);
        }
        if self.spare_acquire != vk::Semaphore::null() {
            device.destroy_semaphore(self.spare_acquire, None);
            self.spare_acquire = vk::Semaphore::null();
        }
    }

    unsafe fn create_image_view(&self, image: vk::Image, format: vk::Format) -> Result<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        self.ctx
            .device
            .create_image_view(&create_info, None)
            .map_err(|e| resource_error("Failed to create image view", e))
    }
}

/// Result of waiting for presents on the old chain before it is destroyed.
fn check_drained(result: ash::prelude::VkResult<()>) -> Result<()> {
    result.map_err(|e| resource_error("Failed to drain present queue", e))
}

fn to_extent(extent: vk::Extent2D) -> Extent2D {
    Extent2D::new(extent.width, extent.height)
}

impl SurfaceHal for VulkanSurface {
    type Format = vk::SurfaceFormatKHR;
    type PresentMode = vk::PresentModeKHR;
    type Semaphore = vk::Semaphore;
    type Target = SwapchainTarget;

    const LOW_LATENCY_MODE: vk::PresentModeKHR = vk::PresentModeKHR::MAILBOX;
    const FALLBACK_MODE: vk::PresentModeKHR = vk::PresentModeKHR::FIFO;

    fn capabilities(&mut self) -> Result<SurfaceCaps<vk::SurfaceFormatKHR, vk::PresentModeKHR>> {
        let ctx = &self.ctx;
        unsafe {
            let caps = ctx
                .surface_loader
                .get_physical_device_surface_capabilities(ctx.physical_device, ctx.surface)
                .map_err(|e| resource_error("Failed to get surface capabilities", e))?;
            let formats = ctx
                .surface_loader
                .get_physical_device_surface_formats(ctx.physical_device, ctx.surface)
                .map_err(|e| resource_error("Failed to get surface formats", e))?;
            let present_modes = ctx
                .surface_loader
                .get_physical_device_surface_present_modes(ctx.physical_device, ctx.surface)
                .map_err(|e| resource_error("Failed to get present modes", e))?;

            // u32::MAX means the swapchain decides the extent.
            let current_extent = (caps.current_extent.width != u32::MAX).then(|| to_extent(caps.current_extent));

            Ok(SurfaceCaps {
                formats,
                present_modes,
                min_image_count: caps.min_image_count,
                max_image_count: caps.max_image_count,
                current_extent,
                min_extent: to_extent(caps.min_image_extent),
                max_extent: to_extent(caps.max_image_extent),
            })
        }
    }

    fn is_preferred_format(format: &vk::SurfaceFormatKHR) -> bool {
        matches!(format.format, vk::Format::B8G8R8A8_SRGB | vk::Format::R8G8B8A8_SRGB)
            && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
    }

    fn create_chain(
        &mut self,
        desc: &ChainDesc<vk::SurfaceFormatKHR, vk::PresentModeKHR>,
    ) -> Result<Vec<SwapchainTarget>> {
        let ctx = Arc::clone(&self.ctx);
        let families = ctx.queue_families;
        let shared_families = [families.graphics, families.present];
        let old_swapchain = self.swapchain;

        let mut create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(ctx.surface)
            .min_image_count(desc.image_count)
            .image_format(desc.format.format)
            .image_color_space(desc.format.color_space)
            .image_extent(vk::Extent2D { width: desc.extent.width, height: desc.extent.height })
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(vk::SurfaceTransformFlagsKHR::IDENTITY)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        create_info = if families.graphics != families.present {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&shared_families)
        } else {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        unsafe {
            if let Ok(caps) = ctx
                .surface_loader
                .get_physical_device_surface_capabilities(ctx.physical_device, ctx.surface)
            {
                create_info = create_info.pre_transform(caps.current_transform);
            }

            let swapchain = ctx
                .swapchain_loader
                .create_swapchain(&create_info, None)
                .map_err(|e| resource_error("Failed to create swapchain", e))?;

            // Presents against the old chain may still hold its semaphores.
            if old_swapchain != vk::SwapchainKHR::null() {
                if let Err(e) = check_drained(ctx.device.queue_wait_idle(ctx.present_queue)) {
                    ctx.swapchain_loader.destroy_swapchain(swapchain, None);
                    return Err(e);
                }
                ctx.swapchain_loader.destroy_swapchain(old_swapchain, None);
            }
            self.destroy_sync_objects();
            self.swapchain = swapchain;

            self.images = ctx
                .swapchain_loader
                .get_swapchain_images(swapchain)
                .map_err(|e| resource_error("Failed to get swapchain images", e))?;
            self.create_sync_objects(self.images.len())?;

            let images = self.images.clone();
            let mut targets = Vec::with_capacity(images.len());
            for image in images {
                match self.create_image_view(image, desc.format.format) {
                    Ok(view) => targets.push(SwapchainTarget { image, view, format: desc.format.format }),
                    Err(e) => {
                        self.release_targets(targets);
                        return Err(e);
                    }
                }
            }
            debug!("Swapchain {:?} has {} images", swapchain, targets.len());
            Ok(targets)
        }
    }

    fn release_targets(&mut self, targets: Vec<SwapchainTarget>) {
        for target in targets {
            unsafe {
                self.ctx.device.destroy_image_view(target.view, None);
            }
        }
    }

    fn destroy_chain(&mut self) {
        unsafe {
            let _ = self.ctx.device.queue_wait_idle(self.ctx.present_queue);
            self.destroy_sync_objects();
            if self.swapchain != vk::SwapchainKHR::null() {
                self.ctx.swapchain_loader.destroy_swapchain(self.swapchain, None);
                self.swapchain = vk::SwapchainKHR::null();
            }
        }
        self.images.clear();
    }

    fn acquire_next(&mut self) -> Result<(u32, ChainStatus)> {
        let result = unsafe {
            self.ctx.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                self.spare_acquire,
                vk::Fence::null(),
            )
        };

        let (index, suboptimal) = match result {
            Ok(acquired) => acquired,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => return Ok((0, ChainStatus::OutOfDate)),
            Err(e) => return Err(resource_error("Failed to acquire swapchain image", e)),
        };

        let slot = self.acquire_semaphores.get_mut(index as usize).ok_or_else(|| {
            RenderError::ResourceCreation(format!("acquired image {} outside the chain", index))
        })?;
        std::mem::swap(slot, &mut self.spare_acquire);

        let status = if suboptimal { ChainStatus::Suboptimal } else { ChainStatus::Optimal };
        Ok((index, status))
    }

    fn submit_sync(&self, image: u32) -> SubmitSync<vk::Semaphore> {
        SubmitSync {
            wait: self.acquire_semaphores.get(image as usize).copied(),
            signal: self.render_finished.get(image as usize).copied(),
        }
    }

    fn present(&mut self, image: u32) -> Result<ChainStatus> {
        let wait_semaphores: Vec<vk::Semaphore> =
            self.render_finished.get(image as usize).copied().into_iter().collect();
        let swapchains = [self.swapchain];
        let image_indices = [image];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe {
            self.ctx
                .swapchain_loader
                .queue_present(self.ctx.present_queue, &present_info)
        };

        match result {
            Ok(false) => Ok(ChainStatus::Optimal),
            Ok(true) => Ok(ChainStatus::Suboptimal),
            Err(e) => ChainStatus::from_error(resource_error("Failed to present", e)),
        }
    }
}

impl Drop for VulkanSurface {
    fn drop(&mut self) {
        self.destroy_chain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefers_srgb_nonlinear() {
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        assert!(VulkanSurface::is_preferred_format(&srgb));
        assert!(!VulkanSurface::is_preferred_format(&unorm));
    }

    #[test]
    fn test_failed_drain_surfaces_device_loss() {
        assert!(check_drained(Ok(())).is_ok());
        let err = check_drained(Err(vk::Result::ERROR_DEVICE_LOST)).unwrap_err();
        assert!(matches!(err, RenderError::DeviceLost(_)));
        let err = check_drained(Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY)).unwrap_err();
        assert!(matches!(err, RenderError::ResourceCreation(ref m) if m.contains("present queue")));
    }

    #[test]
    fn test_present_mode_constants() {
        assert_eq!(VulkanSurface::LOW_LATENCY_MODE, vk::PresentModeKHR::MAILBOX);
        assert_eq!(VulkanSurface::FALLBACK_MODE, vk::PresentModeKHR::FIFO);
    }
}
