// Entry point: a winit window driving the spinning-cube renderer.
//
// The event loop runs in poll mode. Every iteration requests a redraw, and
// each RedrawRequested renders exactly one frame. Resizes are forwarded to
// the renderer and applied on its next frame.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use log::{error, info, warn};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use hellocube_renderer::{create_backend, NativeWindow, RenderBackend, RenderConfig, ShaderDir};

const WINDOW_TITLE: &str = "hellocube";

/// Application state for the winit event loop.
struct HelloCubeApp {
    config: RenderConfig,
    // Declared before `window` so the renderer is torn down first.
    backend: Option<Box<dyn RenderBackend>>,
    window: Option<Window>,
    minimized: bool,
    last_fps: f64,
    failed: bool,
}

impl HelloCubeApp {
    fn new(config: RenderConfig) -> Self {
        Self {
            config,
            backend: None,
            window: None,
            minimized: false,
            last_fps: 0.0,
            failed: false,
        }
    }

    /// Create the window and bring the backend up on it.
    fn init(&mut self, event_loop: &ActiveEventLoop) -> anyhow::Result<()> {
        let attributes = Window::default_attributes()
            .with_title(WINDOW_TITLE)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));
        let window = event_loop.create_window(attributes).context("Failed to create window")?;

        let size = window.inner_size();
        let native = NativeWindow::new(
            window.display_handle().context("No display handle")?.as_raw(),
            window.window_handle().context("No window handle")?.as_raw(),
            size.width,
            size.height,
        );

        let mut backend = create_backend(self.config.backend);
        let shaders = ShaderDir::new(&self.config.shader_dir);
        backend
            .init(&native, &self.config, &shaders)
            .with_context(|| format!("Failed to initialize {} backend", backend.backend_name()))?;

        info!("Rendering with {} backend", backend.backend_name());
        self.backend = Some(backend);
        self.window = Some(window);
        Ok(())
    }

    /// Stop the loop and release the GPU. `failed` selects the exit code.
    fn shutdown(&mut self, event_loop: &ActiveEventLoop, failed: bool) {
        self.failed |= failed;
        if let Some(mut backend) = self.backend.take() {
            if let Err(e) = backend.cleanup() {
                warn!("Cleanup failed: {}", e);
            }
        }
        event_loop.exit();
    }

    fn render_frame(&mut self, event_loop: &ActiveEventLoop) {
        if self.minimized {
            return;
        }
        let Some(backend) = self.backend.as_mut() else {
            return;
        };

        if let Err(e) = backend.tick() {
            if e.is_recoverable() {
                warn!("Frame dropped: {}", e);
                return;
            }
            error!("Frame failed: {}", e);
            self.shutdown(event_loop, true);
            return;
        }

        let fps = backend.stats().map_or(0.0, |s| s.fps);
        if fps != self.last_fps {
            self.last_fps = fps;
            if let Some(window) = self.window.as_ref() {
                window.set_title(&format!("{} - {:.0} fps", WINDOW_TITLE, fps));
            }
        }
    }
}

impl ApplicationHandler for HelloCubeApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.backend.is_some() || self.failed {
            return;
        }
        if let Err(e) = self.init(event_loop) {
            error!("{:#}", e);
            self.shutdown(event_loop, true);
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                self.shutdown(event_loop, false);
            }

            WindowEvent::Resized(size) => {
                self.minimized = size.width == 0 || size.height == 0;
                if let Some(backend) = self.backend.as_mut() {
                    backend.on_resize(size.width, size.height);
                }
            }

            WindowEvent::RedrawRequested => {
                self.render_frame(event_loop);
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = self.window.as_ref() {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(mut backend) = self.backend.take() {
            if let Some(stats) = backend.stats() {
                info!(
                    "{} frames presented, {} skipped, {} swapchain recreations",
                    stats.presented, stats.skipped, stats.recreations
                );
            }
            if let Err(e) = backend.cleanup() {
                warn!("Cleanup failed: {}", e);
            }
        }
    }
}

/// Shader directory: HELLOCUBE_SHADER_DIR, else the SPIR-V compiled by build.rs.
fn resolve_shader_dir(config: &mut RenderConfig) {
    if std::env::var_os("HELLOCUBE_SHADER_DIR").is_some() {
        return;
    }
    if let Some(dir) = option_env!("HELLOCUBE_SPIRV_DIR") {
        config.shader_dir = PathBuf::from(dir);
    }
}

fn run() -> anyhow::Result<bool> {
    let mut config = RenderConfig::from_env();
    resolve_shader_dir(&mut config);
    info!(
        "Starting {}x{}, {} buffers, vsync {}, shaders in {}",
        config.width,
        config.height,
        config.buffer_count,
        config.vsync,
        config.shader_dir.display()
    );

    let event_loop = EventLoop::new().context("Failed to create event loop")?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = HelloCubeApp::new(config);
    event_loop.run_app(&mut app).context("Event loop failed")?;
    Ok(!app.failed)
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
