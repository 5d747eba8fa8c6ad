//! Per-frame render/present loop.
//!
//! One `tick` is: apply pending resize, acquire, wait for the slot's previous
//! frame, update the transform, record, submit, present. Anything that makes
//! the swapchain stale is handled before the next acquire, never mid-frame.

use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::RenderConfig;
use crate::error::{RenderError, Result};
use crate::hal::{BufferUsage, ChainStatus, DeviceHal, FrameDraw, Hal, QueueKind};
use crate::queue::CommandQueue;
use crate::scene::{self, Extent2D, SceneClock, CUBE_INDICES, CUBE_VERTICES};
use crate::swapchain::SwapchainManager;
use crate::upload;

type Buffer<H> = <<H as Hal>::Device as DeviceHal>::Buffer;
type DepthTarget<H> = <<H as Hal>::Device as DeviceHal>::DepthTarget;

/// What happened to a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    /// Nothing reached the screen: the chain was out of date at acquire or present.
    Skipped,
}

/// Running frame counters.
#[derive(Debug, Clone, Default)]
pub struct FrameStats {
    pub presented: u64,
    pub skipped: u64,
    pub recreations: u64,
    /// Frames per second over the last complete one-second window.
    pub fps: f64,
    window_frames: u32,
    window_start: Option<Instant>,
}

impl FrameStats {
    /// Count a presented frame. Returns the new FPS figure when a one-second
    /// window closes.
    pub fn frame_presented(&mut self, now: Instant) -> Option<f64> {
        self.presented += 1;
        self.window_frames += 1;
        let start = *self.window_start.get_or_insert(now);
        let elapsed = now.saturating_duration_since(start);
        if elapsed < Duration::from_secs(1) {
            return None;
        }
        self.fps = self.window_frames as f64 / elapsed.as_secs_f64();
        self.window_frames = 0;
        self.window_start = Some(now);
        Some(self.fps)
    }
}

/// Drives one cube through the swapchain of a single backend.
pub struct FrameRenderer<H: Hal> {
    device: H::Device,
    graphics: CommandQueue<H::Queue>,
    copy: CommandQueue<H::Queue>,
    swapchain: SwapchainManager<H::Surface>,
    depth: Option<DepthTarget<H>>,
    /// Swapchain generation the depth buffer and fence slots were built for.
    chain_generation: u64,
    vertices: Option<Buffer<H>>,
    indices: Option<Buffer<H>>,
    /// Fence value of the last submission that rendered into each image.
    frame_fences: Vec<u64>,
    pending_resize: Option<Extent2D>,
    clear_color: [f32; 4],
    clock: SceneClock,
    stats: FrameStats,
    cleaned_up: bool,
}

impl<H: Hal> FrameRenderer<H> {
    /// Build the swapchain, depth buffer and cube geometry.
    ///
    /// Geometry is uploaded through `copy` and waited on before the first frame.
    pub fn new(
        device: H::Device,
        graphics: H::Queue,
        copy: H::Queue,
        surface: H::Surface,
        config: &RenderConfig,
    ) -> Result<Self> {
        let graphics = CommandQueue::new(graphics, config.wait_timeout());
        let copy = CommandQueue::new(copy, config.wait_timeout());
        let swapchain = SwapchainManager::create(
            surface,
            config.width,
            config.height,
            config.buffer_count,
            config.vsync,
        )?;

        let mut renderer = Self {
            device,
            graphics,
            copy,
            swapchain,
            depth: None,
            chain_generation: 0,
            vertices: None,
            indices: None,
            frame_fences: Vec::new(),
            pending_resize: None,
            clear_color: config.clear_color,
            clock: SceneClock::start(),
            stats: FrameStats::default(),
            cleaned_up: false,
        };
        // On failure `Drop` releases whatever was created.
        renderer.sync_chain_dependents()?;
        renderer.upload_geometry()?;
        Ok(renderer)
    }

    fn upload_geometry(&mut self) -> Result<()> {
        let vertices = upload::upload_slice(
            &mut self.device,
            &mut self.copy,
            &CUBE_VERTICES,
            BufferUsage::Vertex,
            "cube vertices",
        )?;
        let indices = upload::upload_slice(
            &mut self.device,
            &mut self.copy,
            &CUBE_INDICES,
            BufferUsage::Index,
            "cube indices",
        );
        let indices = match indices {
            Ok(pending) => pending,
            Err(e) => {
                self.vertices = Some(vertices.finish(&mut self.device, &self.copy)?);
                return Err(e);
            }
        };

        // The graphics queue may only read the buffers after the copy queue is done.
        self.vertices = Some(vertices.finish(&mut self.device, &self.copy)?);
        self.indices = Some(indices.finish(&mut self.device, &self.copy)?);
        debug!("Cube geometry uploaded");
        Ok(())
    }

    /// Rebuild the depth buffer and fence slots after a swapchain (re)creation.
    fn sync_chain_dependents(&mut self) -> Result<()> {
        let generation = self.swapchain.generation();
        if generation == self.chain_generation {
            return Ok(());
        }

        if let Some(format) = self.swapchain.format() {
            self.device.prepare_for_format(format)?;
        }

        // Recreation flushed the queue, so nothing still reads the old depth buffer.
        if let Some(old) = self.depth.take() {
            self.device.destroy_depth_target(old);
        }
        self.depth = Some(self.device.create_depth_target(self.swapchain.extent())?);

        let retired = self.graphics.last_signaled();
        let images = self.swapchain.image_count();
        if !self.frame_fences.is_empty() && self.frame_fences.len() != images {
            warn!("Frame slots resized from {} to {}", self.frame_fences.len(), images);
        }
        self.frame_fences.clear();
        self.frame_fences.resize(images, retired);

        self.chain_generation = generation;
        Ok(())
    }

    /// Request a resize, applied at the start of the next tick. Zero-area
    /// requests (minimised window) are ignored.
    pub fn on_resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            debug!("Ignoring resize to {}x{}", width, height);
            return;
        }
        debug!("Resize to {}x{} deferred to next frame", width, height);
        self.pending_resize = Some(Extent2D::new(width, height));
    }

    /// Apply a pending resize and any recreation left over from the last present.
    fn prepare_chain(&mut self) -> Result<()> {
        if let Some(extent) = self.pending_resize.take() {
            if self.swapchain.resize(&mut self.graphics, extent.width, extent.height)? {
                self.stats.recreations += 1;
            }
        }
        if self.swapchain.recreate_if_stale(&mut self.graphics)? {
            self.stats.recreations += 1;
        }
        self.sync_chain_dependents()
    }

    /// Render and present one frame.
    pub fn tick(&mut self) -> Result<FrameOutcome> {
        if self.cleaned_up {
            return Err(RenderError::DeviceLost("renderer already cleaned up".into()));
        }

        self.prepare_chain()?;

        let (index, status) = self.swapchain.acquire_next()?;
        if status == ChainStatus::OutOfDate {
            self.prepare_chain()?;
            self.stats.skipped += 1;
            return Ok(FrameOutcome::Skipped);
        }

        let slot = index as usize;
        let slot_fence = *self.frame_fences.get(slot).ok_or_else(|| {
            RenderError::ResourceCreation(format!("acquired image {} has no frame slot", index))
        })?;
        self.graphics.wait(slot_fence)?;

        let extent = self.swapchain.extent();
        let mvp = scene::mvp(self.clock.elapsed(), extent);

        let (vertices, indices) = match (self.vertices.as_ref(), self.indices.as_ref()) {
            (Some(v), Some(i)) => (v, i),
            _ => return Err(RenderError::ResourceCreation("cube geometry missing".into())),
        };
        let target = self.swapchain.target(index).ok_or_else(|| {
            RenderError::ResourceCreation(format!("no render target for image {}", index))
        })?;

        let mut recording = self.graphics.acquire_context()?;
        self.device.record_frame(
            recording.context_mut(),
            &FrameDraw {
                target,
                depth: self.depth.as_ref(),
                extent,
                clear_color: self.clear_color,
                mvp,
                vertices,
                indices,
                index_count: CUBE_INDICES.len() as u32,
            },
        );

        let sync = self.swapchain.submit_sync(index);
        let fence = self.graphics.submit_with(recording, sync)?;
        self.frame_fences[slot] = fence;

        if self.swapchain.present(index)? == ChainStatus::OutOfDate {
            self.stats.skipped += 1;
            return Ok(FrameOutcome::Skipped);
        }

        if let Some(fps) = self.stats.frame_presented(Instant::now()) {
            info!("FPS: {:.1}", fps);
        }
        Ok(FrameOutcome::Presented)
    }

    /// Flush both queues and release the depth buffer, geometry and swapchain.
    /// Safe to call more than once.
    pub fn cleanup(&mut self) -> Result<()> {
        if self.cleaned_up {
            return Ok(());
        }
        self.cleaned_up = true;

        let mut first_error = self.graphics.flush().err();
        if let Err(e) = self.copy.flush() {
            first_error.get_or_insert(e);
        }

        // Acquired chain, depth, vertices, indices; released in reverse.
        for buffer in [self.indices.take(), self.vertices.take()].into_iter().flatten() {
            self.device.destroy_buffer(buffer);
        }
        if let Some(depth) = self.depth.take() {
            self.device.destroy_depth_target(depth);
        }
        if let Err(e) = self.swapchain.destroy(&mut self.graphics) {
            first_error.get_or_insert(e);
        }

        info!(
            "Renderer cleaned up after {} frames ({} skipped, {} swapchain recreations)",
            self.stats.presented, self.stats.skipped, self.stats.recreations
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }

    pub fn extent(&self) -> Extent2D {
        self.swapchain.extent()
    }

    pub fn swapchain(&self) -> &SwapchainManager<H::Surface> {
        &self.swapchain
    }

    pub fn device(&self) -> &H::Device {
        &self.device
    }

    pub fn queue(&self, kind: QueueKind) -> &CommandQueue<H::Queue> {
        match kind {
            QueueKind::Graphics => &self.graphics,
            QueueKind::Copy => &self.copy,
        }
    }

    /// Fence value guarding reuse of `slot`.
    pub fn frame_fence(&self, slot: usize) -> Option<u64> {
        self.frame_fences.get(slot).copied()
    }
}

impl<H: Hal> Drop for FrameRenderer<H> {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            warn!("Renderer cleanup failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{RetirePolicy, Sim, SimGpu, SimRelease};

    fn renderer_with(gpu: &SimGpu, config: &RenderConfig) -> FrameRenderer<Sim> {
        FrameRenderer::new(
            gpu.device(),
            gpu.queue(QueueKind::Graphics),
            gpu.queue(QueueKind::Copy),
            gpu.surface(),
            config,
        )
        .unwrap()
    }

    fn renderer(gpu: &SimGpu) -> FrameRenderer<Sim> {
        renderer_with(gpu, &RenderConfig::default())
    }

    // ============================================================
    // FrameStats
    // ============================================================

    #[test]
    fn test_fps_reported_once_per_second() {
        let mut stats = FrameStats::default();
        let start = Instant::now();
        for i in 0..59 {
            assert!(stats.frame_presented(start + Duration::from_millis(i * 16)).is_none());
        }
        let fps = stats.frame_presented(start + Duration::from_secs(1)).unwrap();
        assert!((fps - 60.0).abs() < 1e-9);
        assert_eq!(stats.presented, 60);
        assert!(stats.frame_presented(start + Duration::from_millis(1016)).is_none());
    }

    // ============================================================
    // Frame loop
    // ============================================================

    #[test]
    fn test_initial_chain_and_geometry() {
        let gpu = SimGpu::new(RetirePolicy::Immediate);
        let renderer = renderer(&gpu);

        let chains = gpu.chains();
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].image_count, 3);
        assert_eq!(chains[0].extent, Extent2D::new(800, 600));
        assert_eq!(gpu.depth_extents(), vec![Extent2D::new(800, 600)]);
        // Vertex and index buffers; both staging buffers released.
        assert_eq!(gpu.live_buffers(), 2);
        assert_eq!(renderer.device().format(), renderer.swapchain().format());
    }

    #[test]
    fn test_tick_records_and_presents() {
        let gpu = SimGpu::new(RetirePolicy::Immediate);
        let mut renderer = renderer(&gpu);

        for _ in 0..4 {
            assert_eq!(renderer.tick().unwrap(), FrameOutcome::Presented);
        }
        assert_eq!(gpu.presented(), vec![0, 1, 2, 0]);

        let frames = gpu.frames();
        assert_eq!(frames.len(), 4);
        let frame = &frames[0];
        assert_eq!(frame.extent, Extent2D::new(800, 600));
        assert_eq!(frame.depth_extent, Some(Extent2D::new(800, 600)));
        assert_eq!(frame.clear_color, [0.4, 0.6, 0.9, 1.0]);
        assert_eq!(frame.index_count, 36);
        assert_eq!(renderer.stats().presented, 4);
        assert_eq!(gpu.violations().total(), 0);
    }

    #[test]
    fn test_slot_fence_tracks_last_submission() {
        let gpu = SimGpu::new(RetirePolicy::Immediate);
        let mut renderer = renderer(&gpu);
        renderer.tick().unwrap();
        let fence = renderer.frame_fence(0).unwrap();
        assert_eq!(fence, renderer.queue(QueueKind::Graphics).last_signaled());
    }

    #[test]
    fn test_minimised_window_does_not_recreate() {
        let gpu = SimGpu::new(RetirePolicy::Immediate);
        let mut renderer = renderer(&gpu);

        renderer.on_resize(0, 0);
        renderer.tick().unwrap();
        renderer.tick().unwrap();
        assert_eq!(gpu.chains().len(), 1);

        renderer.on_resize(1024, 768);
        renderer.tick().unwrap();
        let chains = gpu.chains();
        assert_eq!(chains.len(), 2);
        assert_eq!(chains[1].extent, Extent2D::new(1024, 768));
        assert_eq!(chains[1].image_count, 3);
        assert_eq!(renderer.extent(), Extent2D::new(1024, 768));
        assert_eq!(gpu.live_targets(), 3);
        assert_eq!(gpu.violations().total(), 0);
    }

    #[test]
    fn test_resize_recreates_depth_buffer() {
        let gpu = SimGpu::new(RetirePolicy::Immediate);
        let mut renderer = renderer(&gpu);
        renderer.on_resize(640, 480);
        renderer.tick().unwrap();

        assert_eq!(
            gpu.depth_extents(),
            vec![Extent2D::new(800, 600), Extent2D::new(640, 480)]
        );
        assert_eq!(gpu.live_depth_targets(), 1);
        assert_eq!(gpu.frames().last().unwrap().depth_extent, Some(Extent2D::new(640, 480)));
    }

    #[test]
    fn test_repeated_resize_requests_coalesce() {
        let gpu = SimGpu::new(RetirePolicy::Immediate);
        let mut renderer = renderer(&gpu);
        renderer.on_resize(640, 480);
        renderer.on_resize(1024, 768);
        renderer.tick().unwrap();
        renderer.on_resize(1024, 768);
        renderer.tick().unwrap();

        let chains = gpu.chains();
        assert_eq!(chains.len(), 2);
        assert_eq!(chains[1].extent, Extent2D::new(1024, 768));
        assert_eq!(renderer.stats().recreations, 1);
    }

    #[test]
    fn test_out_of_date_present_recreates_before_next_acquire() {
        let gpu = SimGpu::new(RetirePolicy::Immediate);
        let mut renderer = renderer(&gpu);

        renderer.tick().unwrap();
        gpu.script_present(ChainStatus::OutOfDate);
        assert_eq!(renderer.tick().unwrap(), FrameOutcome::Skipped);
        assert_eq!(gpu.chains().len(), 1);

        assert_eq!(renderer.tick().unwrap(), FrameOutcome::Presented);
        assert_eq!(gpu.chains().len(), 2);
        // The new chain starts over at image 0 and is what the frame rendered into.
        let last = gpu.frames().last().cloned().unwrap();
        assert_eq!(last.chain, 2);
        assert_eq!(last.image, 0);
        assert_eq!(gpu.violations().total(), 0);
    }

    #[test]
    fn test_out_of_date_acquire_records_nothing() {
        let gpu = SimGpu::new(RetirePolicy::Immediate);
        let mut renderer = renderer(&gpu);

        renderer.tick().unwrap();
        let recorded = gpu.frames().len();
        let signaled = gpu.signaled(QueueKind::Graphics);

        gpu.script_acquire(ChainStatus::OutOfDate);
        assert_eq!(renderer.tick().unwrap(), FrameOutcome::Skipped);
        assert_eq!(gpu.frames().len(), recorded);
        assert_eq!(gpu.chains().len(), 2);
        // Only the recreation flush touched the fence.
        assert_eq!(gpu.signaled(QueueKind::Graphics), signaled + 1);

        assert_eq!(renderer.tick().unwrap(), FrameOutcome::Presented);
        assert_eq!(gpu.frames().len(), recorded + 1);
    }

    #[test]
    fn test_suboptimal_acquire_renders_then_recreates() {
        let gpu = SimGpu::new(RetirePolicy::Immediate);
        let mut renderer = renderer(&gpu);

        gpu.script_acquire(ChainStatus::Suboptimal);
        assert_eq!(renderer.tick().unwrap(), FrameOutcome::Presented);
        assert_eq!(gpu.chains().len(), 1);
        renderer.tick().unwrap();
        assert_eq!(gpu.chains().len(), 2);
    }

    #[test]
    fn test_suboptimal_present_recreates_before_next_acquire() {
        let gpu = SimGpu::new(RetirePolicy::Immediate);
        let mut renderer = renderer(&gpu);

        renderer.tick().unwrap();
        gpu.script_present(ChainStatus::Suboptimal);
        assert_eq!(renderer.tick().unwrap(), FrameOutcome::Presented);
        assert!(renderer.swapchain().is_stale());
        assert_eq!(renderer.stats().recreations, 0);
        let generation = renderer.swapchain().generation();

        assert_eq!(renderer.tick().unwrap(), FrameOutcome::Presented);
        assert_eq!(renderer.stats().recreations, 1);
        assert_eq!(renderer.swapchain().generation(), generation + 1);
        assert!(!renderer.swapchain().is_stale());
        // The frame after the suboptimal present rendered into the new chain.
        assert_eq!(gpu.chains().len(), 2);
        assert_eq!(gpu.frames().last().map(|f| f.chain), Some(2));
        assert_eq!(gpu.violations().total(), 0);
    }

    #[test]
    fn test_graphics_contexts_recycled_across_frames() {
        let gpu = SimGpu::new(RetirePolicy::Immediate);
        let mut renderer = renderer(&gpu);
        for _ in 0..30 {
            renderer.tick().unwrap();
        }
        assert!(renderer.queue(QueueKind::Graphics).contexts_created() <= 2);
        assert_eq!(gpu.reuse_violations(), 0);
    }

    #[test]
    fn test_hung_gpu_surfaces_as_error() {
        let gpu = SimGpu::new(RetirePolicy::Immediate);
        let config = RenderConfig {
            fence_timeout: Duration::from_millis(5),
            ..RenderConfig::default()
        };
        let mut renderer = renderer_with(&gpu, &config);
        gpu.set_retire_policy(RetirePolicy::Manual);

        // Fill every slot, then wrap around to a slot whose fence never retires.
        for _ in 0..3 {
            renderer.tick().unwrap();
        }
        let err = renderer.tick().unwrap_err();
        assert!(matches!(err, RenderError::DeviceHung { .. }));
        gpu.retire_all();
    }

    #[test]
    fn test_cleanup_releases_everything() {
        let gpu = SimGpu::new(RetirePolicy::Immediate);
        let mut renderer = renderer(&gpu);
        renderer.tick().unwrap();
        renderer.cleanup().unwrap();

        assert_eq!(gpu.live_buffers(), 0);
        assert_eq!(gpu.live_depth_targets(), 0);
        assert_eq!(gpu.live_targets(), 0);
        assert!(renderer.tick().is_err());
        renderer.cleanup().unwrap();
    }

    #[test]
    fn test_cleanup_releases_in_reverse_order() {
        let gpu = SimGpu::new(RetirePolicy::Immediate);
        let mut renderer = renderer(&gpu);
        renderer.tick().unwrap();
        let before = gpu.releases().len();
        renderer.cleanup().unwrap();

        assert_eq!(
            gpu.releases()[before..],
            [
                SimRelease::Buffer("cube indices".into()),
                SimRelease::Buffer("cube vertices".into()),
                SimRelease::DepthTarget,
                SimRelease::Targets,
                SimRelease::Chain,
            ]
        );
    }

    #[test]
    fn test_drop_cleans_up() {
        let gpu = SimGpu::new(RetirePolicy::Immediate);
        {
            let mut renderer = renderer(&gpu);
            renderer.tick().unwrap();
        }
        assert_eq!(gpu.live_buffers(), 0);
        assert_eq!(gpu.live_contexts(), 0);
    }
}
