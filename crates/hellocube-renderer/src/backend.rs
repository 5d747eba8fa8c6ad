//! Application-facing lifecycle shared by every backend.

use log::info;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::config::{BackendKind, RenderConfig};
use crate::error::{RenderError, Result};
use crate::frame::{FrameOutcome, FrameRenderer, FrameStats};
use crate::hal::QueueKind;
use crate::shader::ShaderSource;
use crate::sim::{RetirePolicy, Sim, SimGpu};
use crate::vulkan::VulkanBackend;

/// The window the renderer draws into.
#[derive(Debug, Clone, Copy)]
pub struct NativeWindow {
    pub display: Option<RawDisplayHandle>,
    pub window: Option<RawWindowHandle>,
    /// Client area size in physical pixels.
    pub width: u32,
    pub height: u32,
}

impl NativeWindow {
    pub fn new(display: RawDisplayHandle, window: RawWindowHandle, width: u32, height: u32) -> Self {
        Self {
            display: Some(display),
            window: Some(window),
            width,
            height,
        }
    }

    /// A window with no native handles, for backends that never present.
    pub fn headless(width: u32, height: u32) -> Self {
        Self { display: None, window: None, width, height }
    }
}

/// Lifecycle driven by the application shell.
pub trait RenderBackend {
    fn backend_name(&self) -> &'static str;

    /// Create the device, swapchain and scene resources for `window`.
    fn init(
        &mut self,
        window: &NativeWindow,
        config: &RenderConfig,
        shaders: &dyn ShaderSource,
    ) -> Result<()>;

    fn tick(&mut self) -> Result<FrameOutcome>;

    /// Record a new client size; applied on the next tick.
    fn on_resize(&mut self, width: u32, height: u32);

    /// Wait for the GPU and release everything. Safe to call more than once.
    fn cleanup(&mut self) -> Result<()>;

    fn stats(&self) -> Option<&FrameStats>;
}

/// Construct the backend selected by `kind`.
pub fn create_backend(kind: BackendKind) -> Box<dyn RenderBackend> {
    match kind {
        BackendKind::Vulkan => Box::new(VulkanBackend::new()),
        BackendKind::Null => Box::new(NullBackend::new()),
    }
}

fn not_initialized() -> RenderError {
    RenderError::DeviceLost("backend not initialized".into())
}

/// Runs the full frame protocol against the simulated GPU.
pub struct NullBackend {
    gpu: SimGpu,
    renderer: Option<FrameRenderer<Sim>>,
}

impl NullBackend {
    pub fn new() -> Self {
        Self {
            gpu: SimGpu::new(RetirePolicy::Immediate),
            renderer: None,
        }
    }

    pub fn gpu(&self) -> &SimGpu {
        &self.gpu
    }
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderBackend for NullBackend {
    fn backend_name(&self) -> &'static str {
        "null"
    }

    fn init(
        &mut self,
        window: &NativeWindow,
        config: &RenderConfig,
        _shaders: &dyn ShaderSource,
    ) -> Result<()> {
        let config = RenderConfig {
            width: window.width,
            height: window.height,
            ..config.clone()
        };
        let renderer = FrameRenderer::new(
            self.gpu.device(),
            self.gpu.queue(QueueKind::Graphics),
            self.gpu.queue(QueueKind::Copy),
            self.gpu.surface(),
            &config,
        )?;
        info!("Null backend ready ({}x{})", renderer.extent().width, renderer.extent().height);
        self.renderer = Some(renderer);
        Ok(())
    }

    fn tick(&mut self) -> Result<FrameOutcome> {
        self.renderer.as_mut().ok_or_else(not_initialized)?.tick()
    }

    fn on_resize(&mut self, width: u32, height: u32) {
        if let Some(renderer) = self.renderer.as_mut() {
            renderer.on_resize(width, height);
        }
    }

    fn cleanup(&mut self) -> Result<()> {
        match self.renderer.take() {
            Some(mut renderer) => renderer.cleanup(),
            None => Ok(()),
        }
    }

    fn stats(&self) -> Option<&FrameStats> {
        self.renderer.as_ref().map(|r| r.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shader::ShaderDir;

    #[test]
    fn test_null_backend_lifecycle() {
        let mut backend = NullBackend::new();
        assert_eq!(backend.backend_name(), "null");
        assert!(backend.tick().is_err());

        let shaders = ShaderDir::new("does-not-exist");
        backend
            .init(&NativeWindow::headless(640, 480), &RenderConfig::default(), &shaders)
            .unwrap();
        for _ in 0..5 {
            assert_eq!(backend.tick().unwrap(), FrameOutcome::Presented);
        }
        backend.on_resize(320, 240);
        backend.tick().unwrap();
        assert_eq!(backend.stats().unwrap().recreations, 1);

        backend.cleanup().unwrap();
        backend.cleanup().unwrap();
        assert_eq!(backend.gpu().live_buffers(), 0);
        assert_eq!(backend.gpu().violations().total(), 0);
    }

    #[test]
    fn test_backend_factory() {
        assert_eq!(create_backend(BackendKind::Null).backend_name(), "null");
        assert_eq!(create_backend(BackendKind::Vulkan).backend_name(), "vulkan");
    }
}
