use crate::error::Result;
use crate::hal::{ChainDesc, ChainStatus, SubmitSync, SurfaceCaps, SurfaceHal};
use crate::scene::Extent2D;

use super::{SimGpu, SimRelease};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFormat {
    Rgba8Unorm,
    Bgra8Unorm,
    Bgra8Srgb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimPresentMode {
    Fifo,
    Mailbox,
    Immediate,
}

/// A plain windowed surface: sRGB available, FIFO and mailbox, 2..=3 images.
pub(super) fn default_caps() -> SurfaceCaps<SimFormat, SimPresentMode> {
    SurfaceCaps {
        formats: vec![SimFormat::Bgra8Unorm, SimFormat::Bgra8Srgb],
        present_modes: vec![SimPresentMode::Fifo, SimPresentMode::Mailbox],
        min_image_count: 2,
        max_image_count: 3,
        current_extent: None,
        min_extent: Extent2D::new(1, 1),
        max_extent: Extent2D::new(16384, 16384),
    }
}

/// Render target of one swapchain image.
#[derive(Debug, PartialEq, Eq)]
pub struct SimTarget {
    pub image: u32,
    pub chain: u64,
}

struct Chain {
    image_count: u32,
    next_image: u32,
}

pub struct SimSurface {
    gpu: SimGpu,
    chain: Option<Chain>,
}

impl SimSurface {
    pub(super) fn new(gpu: SimGpu) -> Self {
        Self { gpu, chain: None }
    }
}

impl SurfaceHal for SimSurface {
    type Format = SimFormat;
    type PresentMode = SimPresentMode;
    type Semaphore = ();
    type Target = SimTarget;

    const LOW_LATENCY_MODE: SimPresentMode = SimPresentMode::Mailbox;
    const FALLBACK_MODE: SimPresentMode = SimPresentMode::Fifo;

    fn capabilities(&mut self) -> Result<SurfaceCaps<SimFormat, SimPresentMode>> {
        Ok(self.gpu.lock().caps.clone())
    }

    fn is_preferred_format(format: &SimFormat) -> bool {
        *format == SimFormat::Bgra8Srgb
    }

    fn create_chain(
        &mut self,
        desc: &ChainDesc<SimFormat, SimPresentMode>,
    ) -> Result<Vec<SimTarget>> {
        let mut state = self.gpu.lock();
        if !state.idle() {
            state.violations.busy_recreate += 1;
        }
        if state.live_targets > 0 {
            state.violations.leaked_targets += 1;
        }
        if desc.extent.is_empty() {
            state.violations.zero_extent += 1;
        }

        state.chain_generation += 1;
        state.chains.push(*desc);
        state.live_targets += desc.image_count as usize;
        let chain = state.chain_generation;

        self.chain = Some(Chain {
            image_count: desc.image_count,
            next_image: 0,
        });
        Ok((0..desc.image_count).map(|image| SimTarget { image, chain }).collect())
    }

    fn release_targets(&mut self, targets: Vec<SimTarget>) {
        let mut state = self.gpu.lock();
        state.live_targets = state.live_targets.saturating_sub(targets.len());
        state.releases.push(SimRelease::Targets);
    }

    fn destroy_chain(&mut self) {
        if self.chain.take().is_some() {
            self.gpu.lock().releases.push(SimRelease::Chain);
        }
    }

    fn acquire_next(&mut self) -> Result<(u32, ChainStatus)> {
        let status = self
            .gpu
            .lock()
            .acquire_script
            .pop_front()
            .unwrap_or(ChainStatus::Optimal);

        let chain = match self.chain.as_mut() {
            Some(chain) if status != ChainStatus::OutOfDate => chain,
            _ => return Ok((0, ChainStatus::OutOfDate)),
        };
        let image = chain.next_image;
        chain.next_image = (chain.next_image + 1) % chain.image_count.max(1);
        Ok((image, status))
    }

    fn submit_sync(&self, _image: u32) -> SubmitSync<()> {
        SubmitSync { wait: Some(()), signal: Some(()) }
    }

    fn present(&mut self, image: u32) -> Result<ChainStatus> {
        let mut state = self.gpu.lock();
        let status = state.present_script.pop_front().unwrap_or(ChainStatus::Optimal);
        if status != ChainStatus::OutOfDate {
            state.presented.push(image);
        }
        Ok(status)
    }
}
