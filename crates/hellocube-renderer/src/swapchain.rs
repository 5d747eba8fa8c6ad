//! Swapchain and backbuffer management.
//!
//! The chain is never resized in place: any size change, out-of-date report or
//! deferred suboptimal report tears down the per-image targets after a queue
//! flush and builds a new chain. Each rebuild bumps [`SwapchainManager::generation`]
//! so owners of size-dependent resources (the depth buffer) know to follow.

use log::{debug, info, warn};

use crate::error::{RenderError, Result};
use crate::hal::{ChainDesc, ChainStatus, QueueHal, SubmitSync, SurfaceCaps, SurfaceHal};
use crate::queue::CommandQueue;
use crate::scene::Extent2D;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainState {
    Uninitialized,
    Ready,
    Recreating,
    Destroyed,
}

/// Preferred format if the surface offers it, else the first one listed.
pub fn choose_format<F: Copy>(formats: &[F], is_preferred: impl Fn(&F) -> bool) -> Option<F> {
    formats
        .iter()
        .find(|f| is_preferred(*f))
        .or_else(|| formats.first())
        .copied()
}

/// Low-latency mode when vsync is off and the surface supports it, else the fallback.
pub fn choose_present_mode<M: Copy + PartialEq>(
    modes: &[M],
    vsync: bool,
    low_latency: M,
    fallback: M,
) -> M {
    if !vsync && modes.contains(&low_latency) {
        low_latency
    } else {
        fallback
    }
}

/// `min(max(desired, min), max)`, where a `max` of zero means unbounded.
pub fn clamp_image_count(desired: u32, min: u32, max: u32) -> u32 {
    let count = desired.max(min);
    if max > 0 {
        count.min(max)
    } else {
        count
    }
}

/// Extent for a new chain: the surface's own extent when it dictates one,
/// otherwise the request clamped to the supported range. Never zero.
pub fn clamp_extent<F, M>(requested: Extent2D, caps: &SurfaceCaps<F, M>) -> Extent2D {
    let extent = match caps.current_extent {
        Some(current) => current,
        None => Extent2D::new(
            requested.width.clamp(caps.min_extent.width, caps.max_extent.width.max(caps.min_extent.width)),
            requested.height.clamp(caps.min_extent.height, caps.max_extent.height.max(caps.min_extent.height)),
        ),
    };
    extent.at_least_one()
}

pub struct SwapchainManager<S: SurfaceHal> {
    surface: S,
    state: SwapchainState,
    targets: Vec<S::Target>,
    format: Option<S::Format>,
    present_mode: S::PresentMode,
    extent: Extent2D,
    /// Last size asked for, already clamped to at least 1x1.
    requested: Extent2D,
    desired_images: u32,
    vsync: bool,
    stale: bool,
    generation: u64,
}

impl<S: SurfaceHal> SwapchainManager<S> {
    /// Build the initial chain on `surface`.
    pub fn create(surface: S, width: u32, height: u32, buffer_count: u32, vsync: bool) -> Result<Self> {
        let mut manager = Self {
            surface,
            state: SwapchainState::Uninitialized,
            targets: Vec::new(),
            format: None,
            present_mode: S::FALLBACK_MODE,
            extent: Extent2D::default(),
            requested: Extent2D::new(width, height).at_least_one(),
            desired_images: buffer_count,
            vsync,
            stale: false,
            generation: 0,
        };
        manager.build_chain()?;
        manager.state = SwapchainState::Ready;
        Ok(manager)
    }

    fn build_chain(&mut self) -> Result<()> {
        let caps = self.surface.capabilities()?;

        let format = choose_format(&caps.formats, S::is_preferred_format).ok_or_else(|| {
            RenderError::ResourceCreation("surface reports no formats".into())
        })?;
        let present_mode = choose_present_mode(
            &caps.present_modes,
            self.vsync,
            S::LOW_LATENCY_MODE,
            S::FALLBACK_MODE,
        );
        let image_count =
            clamp_image_count(self.desired_images, caps.min_image_count, caps.max_image_count);
        let extent = clamp_extent(self.requested, &caps);

        let desc = ChainDesc { format, present_mode, image_count, extent };
        let targets = self.surface.create_chain(&desc)?;

        if !self.targets.is_empty() && self.targets.len() != targets.len() {
            warn!(
                "Swapchain image count changed from {} to {}",
                self.targets.len(),
                targets.len()
            );
        }

        self.targets = targets;
        self.format = Some(format);
        self.present_mode = present_mode;
        self.extent = extent;
        self.stale = false;
        self.generation += 1;

        info!(
            "Swapchain created: {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            self.targets.len(),
            format,
            present_mode
        );
        Ok(())
    }

    fn release_targets(&mut self) {
        let targets = std::mem::take(&mut self.targets);
        if !targets.is_empty() {
            self.surface.release_targets(targets);
        }
    }

    /// Flush, drop every reference into the old chain and build a new one.
    fn recreate<Q: QueueHal>(&mut self, queue: &mut CommandQueue<Q>) -> Result<()> {
        if self.state == SwapchainState::Destroyed {
            return Err(RenderError::ResourceCreation("swapchain already destroyed".into()));
        }
        self.state = SwapchainState::Recreating;
        queue.flush()?;
        self.release_targets();
        self.build_chain()?;
        self.state = SwapchainState::Ready;
        Ok(())
    }

    /// Acquire the next image. An out-of-date or suboptimal result marks the
    /// chain stale; only out-of-date makes the returned index unusable.
    pub fn acquire_next(&mut self) -> Result<(u32, ChainStatus)> {
        if self.state != SwapchainState::Ready {
            return Ok((0, ChainStatus::OutOfDate));
        }
        let (index, status) = self.surface.acquire_next()?;
        if status != ChainStatus::Optimal {
            debug!("Acquire reported {:?}", status);
            self.stale = true;
        }
        Ok((index, status))
    }

    pub fn present(&mut self, index: u32) -> Result<ChainStatus> {
        let status = self.surface.present(index)?;
        if status != ChainStatus::Optimal {
            debug!("Present reported {:?}", status);
            self.stale = true;
        }
        Ok(status)
    }

    /// Recreate the chain at `width` x `height` (each clamped to at least 1).
    /// Returns `false` without touching the GPU when nothing would change:
    /// the request is unchanged and the live chain already has that size.
    pub fn resize<Q: QueueHal>(
        &mut self,
        queue: &mut CommandQueue<Q>,
        width: u32,
        height: u32,
    ) -> Result<bool> {
        let requested = Extent2D::new(width, height).at_least_one();
        if self.state == SwapchainState::Ready
            && !self.stale
            && requested == self.requested
            && requested == self.extent
        {
            return Ok(false);
        }
        self.requested = requested;
        self.recreate(queue)?;
        Ok(true)
    }

    /// Recreate if an earlier acquire or present reported the chain stale.
    pub fn recreate_if_stale<Q: QueueHal>(&mut self, queue: &mut CommandQueue<Q>) -> Result<bool> {
        if !self.stale || self.state == SwapchainState::Destroyed {
            return Ok(false);
        }
        info!("Recreating stale swapchain");
        self.recreate(queue)?;
        Ok(true)
    }

    /// Flush and release the chain. Safe to call more than once.
    pub fn destroy<Q: QueueHal>(&mut self, queue: &mut CommandQueue<Q>) -> Result<()> {
        if self.state == SwapchainState::Destroyed {
            return Ok(());
        }
        let flushed = queue.flush();
        self.release_targets();
        self.surface.destroy_chain();
        self.state = SwapchainState::Destroyed;
        flushed.map(|_| ())
    }

    pub fn state(&self) -> SwapchainState {
        self.state
    }

    pub fn extent(&self) -> Extent2D {
        self.extent
    }

    pub fn format(&self) -> Option<S::Format> {
        self.format
    }

    pub fn present_mode(&self) -> S::PresentMode {
        self.present_mode
    }

    pub fn image_count(&self) -> usize {
        self.targets.len()
    }

    /// Incremented on every (re)creation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn target(&self, index: u32) -> Option<&S::Target> {
        self.targets.get(index as usize)
    }

    pub fn submit_sync(&self, index: u32) -> SubmitSync<S::Semaphore> {
        self.surface.submit_sync(index)
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }
}

impl<S: SurfaceHal> Drop for SwapchainManager<S> {
    fn drop(&mut self) {
        if self.state != SwapchainState::Destroyed {
            self.release_targets();
            self.surface.destroy_chain();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::QueueKind;
    use crate::sim::{RetirePolicy, SimFormat, SimGpu, SimPresentMode, SimQueue, SimSurface};

    fn setup() -> (SimGpu, CommandQueue<SimQueue>, SwapchainManager<SimSurface>) {
        let gpu = SimGpu::new(RetirePolicy::Immediate);
        let queue = CommandQueue::new(gpu.queue(QueueKind::Graphics), None);
        let chain = SwapchainManager::create(gpu.surface(), 800, 600, 3, false).unwrap();
        (gpu, queue, chain)
    }

    #[test]
    fn test_choose_format_prefers_srgb() {
        let formats = [SimFormat::Rgba8Unorm, SimFormat::Bgra8Srgb];
        assert_eq!(choose_format(&formats, |f| *f == SimFormat::Bgra8Srgb), Some(SimFormat::Bgra8Srgb));
        let formats = [SimFormat::Rgba8Unorm, SimFormat::Bgra8Unorm];
        assert_eq!(choose_format(&formats, |f| *f == SimFormat::Bgra8Srgb), Some(SimFormat::Rgba8Unorm));
        assert_eq!(choose_format::<SimFormat>(&[], |_| true), None);
    }

    #[test]
    fn test_choose_present_mode() {
        let modes = [SimPresentMode::Fifo, SimPresentMode::Mailbox];
        let pick = |modes: &[SimPresentMode], vsync| {
            choose_present_mode(modes, vsync, SimPresentMode::Mailbox, SimPresentMode::Fifo)
        };
        assert_eq!(pick(&modes, false), SimPresentMode::Mailbox);
        assert_eq!(pick(&modes, true), SimPresentMode::Fifo);
        assert_eq!(pick(&[SimPresentMode::Fifo], false), SimPresentMode::Fifo);
    }

    #[test]
    fn test_clamp_image_count() {
        assert_eq!(clamp_image_count(3, 2, 3), 3);
        assert_eq!(clamp_image_count(5, 2, 3), 3);
        assert_eq!(clamp_image_count(1, 2, 3), 2);
        assert_eq!(clamp_image_count(8, 2, 0), 8);
    }

    #[test]
    fn test_clamp_extent_follows_surface_when_dictated() {
        let mut caps = crate::sim::SimGpu::new(RetirePolicy::Immediate).surface().capabilities().unwrap();
        assert_eq!(clamp_extent(Extent2D::new(640, 480), &caps), Extent2D::new(640, 480));
        caps.current_extent = Some(Extent2D::new(1280, 720));
        assert_eq!(clamp_extent(Extent2D::new(640, 480), &caps), Extent2D::new(1280, 720));
        caps.current_extent = Some(Extent2D::new(0, 0));
        assert_eq!(clamp_extent(Extent2D::new(640, 480), &caps), Extent2D::new(1, 1));
    }

    #[test]
    fn test_create_picks_expected_chain() {
        let (gpu, _queue, chain) = setup();
        assert_eq!(chain.state(), SwapchainState::Ready);
        assert_eq!(chain.image_count(), 3);
        assert_eq!(chain.extent(), Extent2D::new(800, 600));
        assert_eq!(chain.format(), Some(SimFormat::Bgra8Srgb));
        assert_eq!(chain.present_mode(), SimPresentMode::Mailbox);
        assert_eq!(chain.generation(), 1);
        assert_eq!(gpu.chains().len(), 1);
    }

    #[test]
    fn test_vsync_selects_fifo() {
        let gpu = SimGpu::new(RetirePolicy::Immediate);
        let chain = SwapchainManager::create(gpu.surface(), 800, 600, 3, true).unwrap();
        assert_eq!(chain.present_mode(), SimPresentMode::Fifo);
    }

    #[test]
    fn test_resize_is_idempotent() {
        let (gpu, mut queue, mut chain) = setup();
        assert!(chain.resize(&mut queue, 1024, 768).unwrap());
        let signaled = queue.last_signaled();

        assert!(!chain.resize(&mut queue, 1024, 768).unwrap());
        assert_eq!(queue.last_signaled(), signaled);
        assert_eq!(gpu.chains().len(), 2);
        assert_eq!(chain.generation(), 2);
    }

    #[test]
    fn test_resize_flushes_and_recreates() {
        let (gpu, mut queue, mut chain) = setup();
        let before = queue.last_signaled();
        chain.resize(&mut queue, 1024, 768).unwrap();
        assert!(queue.last_signaled() > before);
        assert_eq!(chain.extent(), Extent2D::new(1024, 768));
        assert_eq!(gpu.live_targets(), 3);
        assert_eq!(gpu.violations().total(), 0);
    }

    #[test]
    fn test_zero_resize_clamps_to_one_pixel() {
        let (gpu, mut queue, mut chain) = setup();
        chain.resize(&mut queue, 0, 0).unwrap();
        assert_eq!(chain.extent(), Extent2D::new(1, 1));
        assert!(gpu.chains().iter().all(|c| !c.extent.is_empty()));
        assert_eq!(gpu.violations().zero_extent, 0);
    }

    #[test]
    fn test_out_of_date_present_marks_stale() {
        let (gpu, mut queue, mut chain) = setup();
        gpu.script_present(ChainStatus::OutOfDate);

        let (index, status) = chain.acquire_next().unwrap();
        assert_eq!(status, ChainStatus::Optimal);
        assert_eq!(chain.present(index).unwrap(), ChainStatus::OutOfDate);
        assert!(chain.is_stale());

        assert!(chain.recreate_if_stale(&mut queue).unwrap());
        assert!(!chain.recreate_if_stale(&mut queue).unwrap());
        assert_eq!(chain.generation(), 2);
    }

    #[test]
    fn test_suboptimal_acquire_still_usable() {
        let (gpu, _queue, mut chain) = setup();
        gpu.script_acquire(ChainStatus::Suboptimal);
        let (index, status) = chain.acquire_next().unwrap();
        assert_eq!(status, ChainStatus::Suboptimal);
        assert!(chain.target(index).is_some());
        assert!(chain.is_stale());
    }

    #[test]
    fn test_stale_resize_to_same_size_still_recreates() {
        let (gpu, mut queue, mut chain) = setup();
        gpu.script_acquire(ChainStatus::OutOfDate);
        chain.acquire_next().unwrap();
        assert!(chain.resize(&mut queue, 800, 600).unwrap());
        assert!(!chain.is_stale());
    }

    #[test]
    fn test_resize_after_surface_dictated_extent() {
        let (gpu, mut queue, mut chain) = setup();

        gpu.set_surface_extent(Some(Extent2D::new(1024, 768)));
        gpu.script_acquire(ChainStatus::OutOfDate);
        chain.acquire_next().unwrap();
        assert!(chain.recreate_if_stale(&mut queue).unwrap());
        assert_eq!(chain.extent(), Extent2D::new(1024, 768));

        gpu.set_surface_extent(None);
        assert!(chain.resize(&mut queue, 800, 600).unwrap());
        assert_eq!(chain.extent(), Extent2D::new(800, 600));
        assert!(!chain.resize(&mut queue, 800, 600).unwrap());
        assert_eq!(gpu.chains().len(), 3);
    }

    #[test]
    fn test_destroy_releases_targets() {
        let (gpu, mut queue, mut chain) = setup();
        chain.destroy(&mut queue).unwrap();
        assert_eq!(chain.state(), SwapchainState::Destroyed);
        assert_eq!(gpu.live_targets(), 0);
        chain.destroy(&mut queue).unwrap();
        assert!(chain.resize(&mut queue, 640, 480).is_err());
    }
}
