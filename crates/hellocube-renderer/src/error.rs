//! Error taxonomy shared by every backend.

use thiserror::Error;

/// Errors surfaced by the device, swapchain and frame lifecycle.
///
/// `SwapchainOutOfDate` and `SwapchainSuboptimal` are produced by the hardware
/// layer but consumed by [`crate::swapchain::SwapchainManager`]; they never
/// reach the caller of [`crate::frame::FrameRenderer::tick`].
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no suitable adapter: {0}")]
    AdapterNotFound(String),

    #[error("device creation failed: {0}")]
    DeviceCreation(String),

    #[error("resource creation failed: {0}")]
    ResourceCreation(String),

    #[error("swapchain is out of date")]
    SwapchainOutOfDate,

    #[error("swapchain is suboptimal")]
    SwapchainSuboptimal,

    #[error("failed to load shader '{name}': {reason}")]
    ShaderLoad { name: String, reason: String },

    #[error("device lost: {0}")]
    DeviceLost(String),

    #[error("device hung: fence value {value} not reached (completed {completed})")]
    DeviceHung { value: u64, completed: u64 },
}

impl RenderError {
    /// Whether the swapchain manager can recover from this error by recreating the chain.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::SwapchainOutOfDate | Self::SwapchainSuboptimal)
    }
}

pub type Result<T> = std::result::Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swapchain_errors_are_recoverable() {
        assert!(RenderError::SwapchainOutOfDate.is_recoverable());
        assert!(RenderError::SwapchainSuboptimal.is_recoverable());
    }

    #[test]
    fn test_device_errors_are_fatal() {
        assert!(!RenderError::DeviceLost("removed".into()).is_recoverable());
        assert!(!RenderError::DeviceHung { value: 3, completed: 1 }.is_recoverable());
        assert!(!RenderError::AdapterNotFound("none".into()).is_recoverable());
    }

    #[test]
    fn test_display_names_fence_values() {
        let msg = RenderError::DeviceHung { value: 7, completed: 4 }.to_string();
        assert!(msg.contains('7'));
        assert!(msg.contains('4'));
    }

    #[test]
    fn test_shader_error_display() {
        let err = RenderError::ShaderLoad { name: "cube.vert".into(), reason: "missing".into() };
        assert_eq!(err.to_string(), "failed to load shader 'cube.vert': missing");
    }
}
