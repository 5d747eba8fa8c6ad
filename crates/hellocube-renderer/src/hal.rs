//! Hardware seams.
//!
//! The queue, swapchain, upload and frame logic is written once against these
//! traits. Each backend (`vulkan`, `sim`) implements them for its own handles.

use std::fmt::Debug;
use std::time::Duration;

use crate::error::{RenderError, Result};
use crate::scene::Extent2D;

/// Kind of hardware queue a [`QueueHal`] drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Graphics,
    Copy,
}

/// Binary semaphores attached to a single submission.
#[derive(Debug, Clone, Copy)]
pub struct SubmitSync<S> {
    /// Semaphore the submission waits on before colour output.
    pub wait: Option<S>,
    /// Semaphore signalled when the submission completes.
    pub signal: Option<S>,
}

impl<S> Default for SubmitSync<S> {
    fn default() -> Self {
        Self { wait: None, signal: None }
    }
}

/// A hardware command queue paired with a monotonic fence.
pub trait QueueHal {
    /// Allocator + command list pair.
    type Context;
    type Semaphore: Copy;

    fn kind(&self) -> QueueKind;

    /// Create a context that is already open for recording.
    fn create_context(&mut self) -> Result<Self::Context>;

    /// Reset a retired context and reopen it for recording.
    fn reset_context(&mut self, context: &mut Self::Context) -> Result<()>;

    /// Close the context, submit it and signal the fence to `signal_value` on completion.
    fn execute(
        &mut self,
        context: &mut Self::Context,
        signal_value: u64,
        sync: SubmitSync<Self::Semaphore>,
    ) -> Result<()>;

    /// Signal the fence to `value` once all prior work on the queue completes.
    fn signal(&mut self, value: u64) -> Result<()>;

    /// Latest fence value the GPU reports as completed.
    fn completed_value(&self) -> Result<u64>;

    /// Block until the fence reaches `value`. Returns `false` on timeout.
    fn wait_for_value(&self, value: u64, timeout: Option<Duration>) -> Result<bool>;

    fn destroy_context(&mut self, context: Self::Context);
}

/// Status reported by acquire and present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStatus {
    Optimal,
    /// Usable, but the chain should be recreated at the next opportunity.
    Suboptimal,
    /// Unusable until the chain is recreated.
    OutOfDate,
}

impl ChainStatus {
    /// The status a recoverable swapchain error stands for. Other errors pass through.
    pub fn from_error(err: RenderError) -> Result<Self> {
        if !err.is_recoverable() {
            return Err(err);
        }
        Ok(match err {
            RenderError::SwapchainSuboptimal => Self::Suboptimal,
            _ => Self::OutOfDate,
        })
    }
}

/// What a surface can do right now.
#[derive(Debug, Clone)]
pub struct SurfaceCaps<F, M> {
    pub formats: Vec<F>,
    pub present_modes: Vec<M>,
    pub min_image_count: u32,
    /// Zero means no upper bound.
    pub max_image_count: u32,
    /// Extent dictated by the surface, if any.
    pub current_extent: Option<Extent2D>,
    pub min_extent: Extent2D,
    pub max_extent: Extent2D,
}

/// Parameters for one swapchain (re)creation.
#[derive(Debug, Clone, Copy)]
pub struct ChainDesc<F, M> {
    pub format: F,
    pub present_mode: M,
    pub image_count: u32,
    pub extent: Extent2D,
}

/// A presentation surface and the swapchain built on it.
pub trait SurfaceHal {
    type Format: Copy + Debug;
    type PresentMode: Copy + PartialEq + Debug;
    type Semaphore: Copy;
    /// Per-image render target view.
    type Target;

    /// Low-latency, non-blocking present mode preferred when vsync is off.
    const LOW_LATENCY_MODE: Self::PresentMode;
    /// Present mode that every surface supports.
    const FALLBACK_MODE: Self::PresentMode;

    fn capabilities(&mut self) -> Result<SurfaceCaps<Self::Format, Self::PresentMode>>;

    /// Whether `format` is the preferred 8-bit sRGB format.
    fn is_preferred_format(format: &Self::Format) -> bool;

    /// Create the chain, retiring any previous one. Returns one target per image.
    fn create_chain(
        &mut self,
        desc: &ChainDesc<Self::Format, Self::PresentMode>,
    ) -> Result<Vec<Self::Target>>;

    /// Release the per-image targets of the current chain.
    fn release_targets(&mut self, targets: Vec<Self::Target>);

    /// Release the chain itself.
    fn destroy_chain(&mut self);

    fn acquire_next(&mut self) -> Result<(u32, ChainStatus)>;

    /// Semaphores the submission rendering into `image` must wait on and signal.
    fn submit_sync(&self, image: u32) -> SubmitSync<Self::Semaphore>;

    fn present(&mut self, image: u32) -> Result<ChainStatus>;
}

/// Buffer usage for uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    Vertex,
    Index,
    Staging,
}

/// Where a buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// GPU-local, not CPU-visible.
    GpuOnly,
    /// CPU-visible upload memory.
    CpuToGpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: BufferUsage,
    pub memory: MemoryKind,
}

/// Everything needed to record one frame.
pub struct FrameDraw<'a, D: DeviceHal + ?Sized> {
    pub target: &'a D::Target,
    pub depth: Option<&'a D::DepthTarget>,
    pub extent: Extent2D,
    pub clear_color: [f32; 4],
    pub mvp: glam::Mat4,
    pub vertices: &'a D::Buffer,
    pub indices: &'a D::Buffer,
    pub index_count: u32,
}

/// Resource creation and command recording.
pub trait DeviceHal {
    type Context;
    type Target;
    type Format;
    type Buffer;
    type DepthTarget;

    /// Called after every swapchain (re)creation, before any frame targets it.
    fn prepare_for_format(&mut self, format: Self::Format) -> Result<()>;

    fn create_buffer(&mut self, desc: &BufferDesc, name: &str) -> Result<Self::Buffer>;

    /// Copy `data` into a CPU-visible buffer.
    fn write_buffer(&mut self, buffer: &mut Self::Buffer, data: &[u8]) -> Result<()>;

    fn record_copy(
        &mut self,
        context: &mut Self::Context,
        src: &Self::Buffer,
        dst: &Self::Buffer,
        size: u64,
    );

    fn destroy_buffer(&mut self, buffer: Self::Buffer);

    fn create_depth_target(&mut self, extent: Extent2D) -> Result<Self::DepthTarget>;

    fn destroy_depth_target(&mut self, depth: Self::DepthTarget);

    fn record_frame(&mut self, context: &mut Self::Context, frame: &FrameDraw<'_, Self>);
}

/// Binds one backend's queue, surface and device implementations together.
pub trait Hal {
    type Queue: QueueHal;
    type Surface: SurfaceHal<Semaphore = <Self::Queue as QueueHal>::Semaphore>;
    type Device: DeviceHal<
        Context = <Self::Queue as QueueHal>::Context,
        Target = <Self::Surface as SurfaceHal>::Target,
        Format = <Self::Surface as SurfaceHal>::Format,
    >;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swapchain_errors_become_statuses() {
        assert_eq!(
            ChainStatus::from_error(RenderError::SwapchainOutOfDate).unwrap(),
            ChainStatus::OutOfDate
        );
        assert_eq!(
            ChainStatus::from_error(RenderError::SwapchainSuboptimal).unwrap(),
            ChainStatus::Suboptimal
        );
    }

    #[test]
    fn test_fatal_errors_pass_through() {
        let err = ChainStatus::from_error(RenderError::DeviceLost("removed".into())).unwrap_err();
        assert!(matches!(err, RenderError::DeviceLost(_)));
    }
}
