//! Vulkan 1.3 backend.
//!
//! Dynamic rendering and synchronization2 throughout; a timeline semaphore
//! per queue serves as the monotonic fence.

pub mod backend;
pub mod context;
pub mod memory;
pub mod pipeline;
pub mod queue;
pub mod swapchain;

pub use backend::VulkanBackend;
pub use context::{QueueFamilyIndices, VulkanContext};
pub use memory::{DepthImage, GpuBuffer, VulkanDevice};
pub use pipeline::CubePipeline;
pub use queue::{CommandContext, VulkanQueue};
pub use swapchain::{SwapchainTarget, VulkanSurface};

use ash::vk;
use std::ffi::CStr;

use crate::error::RenderError;
use crate::hal::Hal;

/// Required Vulkan version.
pub const REQUIRED_VK_VERSION: u32 = vk::make_api_version(0, 1, 3, 0);

/// Application name for Vulkan instance.
pub const APP_NAME: &CStr = c"hellocube";

/// Engine name for Vulkan instance.
pub const ENGINE_NAME: &CStr = c"hellocube";

pub const ENGINE_VERSION: u32 = vk::make_api_version(0, 1, 0, 0);

/// Depth buffer format.
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Map a failed call to the error kind of the stage it happened in.
///
/// Device loss and swapchain status codes keep their own kinds regardless of stage.
pub(crate) fn vk_error(
    what: &str,
    result: vk::Result,
    stage: fn(String) -> RenderError,
) -> RenderError {
    match result {
        vk::Result::ERROR_DEVICE_LOST => RenderError::DeviceLost(format!("{}: {:?}", what, result)),
        vk::Result::ERROR_OUT_OF_DATE_KHR => RenderError::SwapchainOutOfDate,
        vk::Result::SUBOPTIMAL_KHR => RenderError::SwapchainSuboptimal,
        _ => stage(format!("{}: {:?}", what, result)),
    }
}

/// [`vk_error`] for resource creation and command submission.
pub(crate) fn resource_error(what: &str, result: vk::Result) -> RenderError {
    vk_error(what, result, RenderError::ResourceCreation)
}

/// [`vk_error`] for instance and device bring-up.
pub(crate) fn device_error(what: &str, result: vk::Result) -> RenderError {
    vk_error(what, result, RenderError::DeviceCreation)
}

/// Backend marker binding the Vulkan queue, surface and device.
pub enum Vulkan {}

impl Hal for Vulkan {
    type Queue = VulkanQueue;
    type Surface = VulkanSurface;
    type Device = VulkanDevice;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::ChainStatus;

    #[test]
    fn test_device_lost_keeps_its_kind() {
        let err = resource_error("queue submit", vk::Result::ERROR_DEVICE_LOST);
        assert!(matches!(err, RenderError::DeviceLost(_)));
        let err = device_error("create device", vk::Result::ERROR_DEVICE_LOST);
        assert!(matches!(err, RenderError::DeviceLost(_)));
    }

    #[test]
    fn test_out_of_date_maps_to_swapchain_error() {
        let err = resource_error("present", vk::Result::ERROR_OUT_OF_DATE_KHR);
        assert!(matches!(err, RenderError::SwapchainOutOfDate));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_present_status_codes_map_to_chain_status() {
        let status = ChainStatus::from_error(resource_error("present", vk::Result::SUBOPTIMAL_KHR));
        assert_eq!(status.unwrap(), ChainStatus::Suboptimal);
        let status =
            ChainStatus::from_error(resource_error("present", vk::Result::ERROR_OUT_OF_DATE_KHR));
        assert_eq!(status.unwrap(), ChainStatus::OutOfDate);
        let status = ChainStatus::from_error(resource_error("present", vk::Result::ERROR_DEVICE_LOST));
        assert!(matches!(status, Err(RenderError::DeviceLost(_))));
    }

    #[test]
    fn test_other_codes_follow_stage() {
        let err = resource_error("create buffer", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert!(matches!(err, RenderError::ResourceCreation(ref m) if m.contains("create buffer")));
        let err = device_error("create instance", vk::Result::ERROR_INCOMPATIBLE_DRIVER);
        assert!(matches!(err, RenderError::DeviceCreation(_)));
    }
}
