//! [`RenderBackend`] on Vulkan.

use log::info;
use std::sync::Arc;

use super::{Vulkan, VulkanContext, VulkanDevice, VulkanQueue, VulkanSurface};
use crate::adapter::AdapterRequest;
use crate::backend::{NativeWindow, RenderBackend};
use crate::config::RenderConfig;
use crate::error::{RenderError, Result};
use crate::frame::{FrameOutcome, FrameRenderer, FrameStats};
use crate::hal::QueueKind;
use crate::shader::{ShaderSource, CUBE_FRAGMENT_SHADER, CUBE_VERTEX_SHADER};

/// Vulkan renderer. Nothing touches the driver until [`RenderBackend::init`].
#[derive(Default)]
pub struct VulkanBackend {
    renderer: Option<FrameRenderer<Vulkan>>,
    context: Option<Arc<VulkanContext>>,
}

impl VulkanBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RenderBackend for VulkanBackend {
    fn backend_name(&self) -> &'static str {
        "vulkan"
    }

    fn init(
        &mut self,
        window: &NativeWindow,
        config: &RenderConfig,
        shaders: &dyn ShaderSource,
    ) -> Result<()> {
        let (display, handle) = match (window.display, window.window) {
            (Some(display), Some(handle)) => (display, handle),
            _ => {
                return Err(RenderError::DeviceCreation(
                    "Vulkan backend needs a native window".into(),
                ))
            }
        };

        // Shaders first so a bad shader directory fails before any device work.
        let vertex_spirv = shaders.load(CUBE_VERTEX_SHADER)?;
        let fragment_spirv = shaders.load(CUBE_FRAGMENT_SHADER)?;

        let request = AdapterRequest {
            prefer_software: config.prefer_software_adapter,
            require_discrete: config.require_discrete_gpu,
        };
        let ctx = Arc::new(unsafe { VulkanContext::new(display, handle, request, config.validation)? });

        let device = VulkanDevice::new(Arc::clone(&ctx), vertex_spirv, fragment_spirv)?;
        let graphics = VulkanQueue::new(Arc::clone(&ctx), QueueKind::Graphics)?;
        let copy = VulkanQueue::new(Arc::clone(&ctx), QueueKind::Copy)?;
        let surface = VulkanSurface::new(Arc::clone(&ctx));

        let config = RenderConfig {
            width: window.width,
            height: window.height,
            ..config.clone()
        };
        let renderer = FrameRenderer::new(device, graphics, copy, surface, &config)?;
        info!(
            "Vulkan backend ready on {} ({}x{})",
            ctx.adapter.name,
            renderer.extent().width,
            renderer.extent().height
        );

        self.renderer = Some(renderer);
        self.context = Some(ctx);
        Ok(())
    }

    fn tick(&mut self) -> Result<FrameOutcome> {
        self.renderer
            .as_mut()
            .ok_or_else(|| RenderError::DeviceLost("backend not initialized".into()))?
            .tick()
    }

    fn on_resize(&mut self, width: u32, height: u32) {
        if let Some(renderer) = self.renderer.as_mut() {
            renderer.on_resize(width, height);
        }
    }

    fn cleanup(&mut self) -> Result<()> {
        let result = match self.renderer.take() {
            Some(mut renderer) => renderer.cleanup(),
            None => Ok(()),
        };
        // Last reference: tears down device, surface and instance.
        self.context = None;
        result
    }

    fn stats(&self) -> Option<&FrameStats> {
        self.renderer.as_ref().map(|r| r.stats())
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            log::warn!("Vulkan cleanup failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::ShaderDir;

    #[test]
    fn test_new_is_lazy() {
        let backend = VulkanBackend::new();
        assert!(backend.context.is_none());
        assert!(backend.stats().is_none());
    }

    #[test]
    fn test_init_without_window_fails_cleanly() {
        let mut backend = VulkanBackend::new();
        let err = backend
            .init(&NativeWindow::headless(64, 64), &RenderConfig::default(), &ShaderDir::new("unused"))
            .unwrap_err();
        assert!(matches!(err, RenderError::DeviceCreation(_)));
        assert!(backend.tick().is_err());
        backend.cleanup().unwrap();
    }
}
