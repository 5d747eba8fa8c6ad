//! Headless backend.
//!
//! A deterministic stand-in for a GPU: fences, swapchain and resources are
//! plain state behind one shared lock. Besides backing the `null` render
//! backend it checks the lifecycle rules every real driver relies on
//! (contexts reset only after their fence retired, chains recreated only on
//! an idle device, no render target used after its chain was replaced) and
//! counts violations.

mod device;
mod queue;
mod surface;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::hal::{ChainDesc, ChainStatus, Hal, QueueKind, SurfaceCaps};
use crate::scene::Extent2D;

pub use device::{SimBuffer, SimDepth, SimDevice};
pub use queue::{SimContext, SimQueue};
pub use surface::{SimFormat, SimPresentMode, SimSurface, SimTarget};

/// How submitted work retires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetirePolicy {
    /// Work completes as soon as it is submitted.
    Immediate,
    /// Work completes only through [`SimGpu::retire`].
    Manual,
}

/// One recorded frame, as seen by the simulated GPU.
#[derive(Debug, Clone, PartialEq)]
pub struct SimFrame {
    pub image: u32,
    pub chain: u64,
    pub extent: Extent2D,
    pub depth_extent: Option<Extent2D>,
    pub clear_color: [f32; 4],
    pub index_count: u32,
    pub mvp: glam::Mat4,
}

#[derive(Debug, Default, Clone, Copy)]
struct Timeline {
    completed: u64,
    signaled: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Violations {
    /// A context was reset while its fence value had not retired.
    pub context_reuse: usize,
    /// A chain was (re)created while work was still in flight.
    pub busy_recreate: usize,
    /// A chain was (re)created while targets of the previous chain were alive.
    pub leaked_targets: usize,
    /// A frame was recorded against a target of a replaced chain.
    pub stale_target: usize,
    /// A chain was requested with a zero-sized extent.
    pub zero_extent: usize,
}

impl Violations {
    pub fn total(&self) -> usize {
        self.context_reuse
            + self.busy_recreate
            + self.leaked_targets
            + self.stale_target
            + self.zero_extent
    }
}

/// A resource handed back to the simulated GPU, in release order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimRelease {
    /// Buffer, by debug name.
    Buffer(String),
    DepthTarget,
    /// The per-image targets of a chain.
    Targets,
    Chain,
}

struct SimState {
    policy: RetirePolicy,
    graphics: Timeline,
    copy: Timeline,
    /// Values signalled with no work attached, pending retirement.
    bare_signals: Vec<(QueueKind, u64)>,

    next_context_id: usize,
    context_tags: HashMap<usize, (QueueKind, u64)>,
    live_contexts: usize,

    next_buffer_id: u64,
    buffers: HashMap<u64, Vec<u8>>,
    depth_extents: Vec<Extent2D>,
    live_depth_targets: usize,

    caps: SurfaceCaps<SimFormat, SimPresentMode>,
    acquire_script: VecDeque<ChainStatus>,
    present_script: VecDeque<ChainStatus>,
    chains: Vec<ChainDesc<SimFormat, SimPresentMode>>,
    chain_generation: u64,
    live_targets: usize,
    presented: Vec<u32>,
    frames: Vec<SimFrame>,
    releases: Vec<SimRelease>,

    violations: Violations,
}

impl SimState {
    fn timeline(&self, kind: QueueKind) -> &Timeline {
        match kind {
            QueueKind::Graphics => &self.graphics,
            QueueKind::Copy => &self.copy,
        }
    }

    fn timeline_mut(&mut self, kind: QueueKind) -> &mut Timeline {
        match kind {
            QueueKind::Graphics => &mut self.graphics,
            QueueKind::Copy => &mut self.copy,
        }
    }

    fn idle(&self) -> bool {
        self.graphics.completed >= self.graphics.signaled
            && self.copy.completed >= self.copy.signaled
    }

    fn retire(&mut self, kind: QueueKind, value: u64) {
        let timeline = self.timeline_mut(kind);
        let target = value.min(timeline.signaled);
        if target > timeline.completed {
            timeline.completed = target;
        }
        self.drain_bare_signals();
    }

    /// Bare signals retire as soon as every earlier value on their queue has.
    fn drain_bare_signals(&mut self) {
        loop {
            let next = self.bare_signals.iter().position(|&(kind, value)| {
                self.timeline(kind).completed + 1 >= value
            });
            match next {
                Some(i) => {
                    let (kind, value) = self.bare_signals.swap_remove(i);
                    let timeline = self.timeline_mut(kind);
                    timeline.completed = timeline.completed.max(value);
                }
                None => break,
            }
        }
    }
}

struct Shared {
    state: Mutex<SimState>,
    retired: Condvar,
}

/// Handle to a simulated GPU. Clones share the same device.
#[derive(Clone)]
pub struct SimGpu {
    shared: Arc<Shared>,
}

impl SimGpu {
    pub fn new(policy: RetirePolicy) -> Self {
        let state = SimState {
            policy,
            graphics: Timeline::default(),
            copy: Timeline::default(),
            bare_signals: Vec::new(),
            next_context_id: 0,
            context_tags: HashMap::new(),
            live_contexts: 0,
            next_buffer_id: 0,
            buffers: HashMap::new(),
            depth_extents: Vec::new(),
            live_depth_targets: 0,
            caps: surface::default_caps(),
            acquire_script: VecDeque::new(),
            present_script: VecDeque::new(),
            chains: Vec::new(),
            chain_generation: 0,
            live_targets: 0,
            presented: Vec::new(),
            frames: Vec::new(),
            releases: Vec::new(),
            violations: Violations::default(),
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                retired: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.shared.state.lock()
    }

    fn notify(&self) {
        self.shared.retired.notify_all();
    }

    pub fn queue(&self, kind: QueueKind) -> SimQueue {
        SimQueue::new(self.clone(), kind)
    }

    pub fn surface(&self) -> SimSurface {
        SimSurface::new(self.clone())
    }

    pub fn device(&self) -> SimDevice {
        SimDevice::new(self.clone())
    }

    /// Mark work on `kind` complete up to `value` (clamped to what was submitted).
    pub fn retire(&self, kind: QueueKind, value: u64) {
        self.lock().retire(kind, value);
        self.notify();
    }

    /// Complete everything submitted so far on every queue.
    pub fn retire_all(&self) {
        {
            let mut state = self.lock();
            for kind in [QueueKind::Graphics, QueueKind::Copy] {
                let signaled = state.timeline(kind).signaled;
                state.retire(kind, signaled);
            }
        }
        self.notify();
    }

    pub fn set_retire_policy(&self, policy: RetirePolicy) {
        self.lock().policy = policy;
    }

    pub fn completed(&self, kind: QueueKind) -> u64 {
        self.lock().timeline(kind).completed
    }

    pub fn signaled(&self, kind: QueueKind) -> u64 {
        self.lock().timeline(kind).signaled
    }

    /// Replace the surface capabilities reported from now on.
    pub fn set_caps(&self, caps: SurfaceCaps<SimFormat, SimPresentMode>) {
        self.lock().caps = caps;
    }

    /// Make the surface dictate its extent, as a window manager would.
    pub fn set_surface_extent(&self, extent: Option<Extent2D>) {
        self.lock().caps.current_extent = extent;
    }

    /// Queue a status for the next acquire. Unscripted acquires are optimal.
    pub fn script_acquire(&self, status: ChainStatus) {
        self.lock().acquire_script.push_back(status);
    }

    /// Queue a status for the next present. Unscripted presents are optimal.
    pub fn script_present(&self, status: ChainStatus) {
        self.lock().present_script.push_back(status);
    }

    /// Every release so far, oldest first.
    pub fn releases(&self) -> Vec<SimRelease> {
        self.lock().releases.clone()
    }

    pub fn violations(&self) -> Violations {
        self.lock().violations
    }

    pub fn reuse_violations(&self) -> usize {
        self.lock().violations.context_reuse
    }

    pub fn live_contexts(&self) -> usize {
        self.lock().live_contexts
    }

    pub fn live_buffers(&self) -> usize {
        self.lock().buffers.len()
    }

    pub fn buffer_contents(&self, id: u64) -> Option<Vec<u8>> {
        self.lock().buffers.get(&id).cloned()
    }

    pub fn live_depth_targets(&self) -> usize {
        self.lock().live_depth_targets
    }

    /// Extents of every depth target ever created, in order.
    pub fn depth_extents(&self) -> Vec<Extent2D> {
        self.lock().depth_extents.clone()
    }

    pub fn live_targets(&self) -> usize {
        self.lock().live_targets
    }

    /// Every chain ever created, in order.
    pub fn chains(&self) -> Vec<ChainDesc<SimFormat, SimPresentMode>> {
        self.lock().chains.clone()
    }

    /// Images presented successfully, in order.
    pub fn presented(&self) -> Vec<u32> {
        self.lock().presented.clone()
    }

    pub fn frames(&self) -> Vec<SimFrame> {
        self.lock().frames.clone()
    }
}

/// Backend marker binding the simulated queue, surface and device.
pub enum Sim {}

impl Hal for Sim {
    type Queue = SimQueue;
    type Surface = SimSurface;
    type Device = SimDevice;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retire_is_clamped_to_signaled() {
        let gpu = SimGpu::new(RetirePolicy::Manual);
        gpu.retire(QueueKind::Graphics, 10);
        assert_eq!(gpu.completed(QueueKind::Graphics), 0);
    }

    #[test]
    fn test_bare_signal_retires_behind_prior_work() {
        let gpu = SimGpu::new(RetirePolicy::Manual);
        {
            let mut state = gpu.lock();
            state.graphics.signaled = 3;
            state.bare_signals.push((QueueKind::Graphics, 4));
            state.graphics.signaled = 4;
        }
        gpu.retire(QueueKind::Graphics, 2);
        assert_eq!(gpu.completed(QueueKind::Graphics), 2);
        gpu.retire(QueueKind::Graphics, 3);
        assert_eq!(gpu.completed(QueueKind::Graphics), 4);
    }

    #[test]
    fn test_violations_start_clean() {
        let gpu = SimGpu::new(RetirePolicy::Immediate);
        assert_eq!(gpu.violations().total(), 0);
    }
}
