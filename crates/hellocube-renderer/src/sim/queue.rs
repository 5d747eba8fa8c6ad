use std::time::{Duration, Instant};

use crate::error::{RenderError, Result};
use crate::hal::{QueueHal, QueueKind, SubmitSync};

use super::{RetirePolicy, SimFrame, SimGpu};

/// Simulated allocator + command list.
#[derive(Debug)]
pub struct SimContext {
    id: usize,
    open: bool,
    pub(super) copies: Vec<(u64, u64, u64)>,
    pub(super) frames: Vec<SimFrame>,
}

impl SimContext {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.open
    }
}

pub struct SimQueue {
    gpu: SimGpu,
    kind: QueueKind,
}

impl SimQueue {
    pub(super) fn new(gpu: SimGpu, kind: QueueKind) -> Self {
        Self { gpu, kind }
    }
}

impl QueueHal for SimQueue {
    type Context = SimContext;
    type Semaphore = ();

    fn kind(&self) -> QueueKind {
        self.kind
    }

    fn create_context(&mut self) -> Result<SimContext> {
        let mut state = self.gpu.lock();
        let id = state.next_context_id;
        state.next_context_id += 1;
        state.live_contexts += 1;
        Ok(SimContext {
            id,
            open: true,
            copies: Vec::new(),
            frames: Vec::new(),
        })
    }

    fn reset_context(&mut self, context: &mut SimContext) -> Result<()> {
        let mut state = self.gpu.lock();
        if let Some(&(kind, value)) = state.context_tags.get(&context.id) {
            if state.timeline(kind).completed < value {
                state.violations.context_reuse += 1;
            }
        }
        context.open = true;
        context.copies.clear();
        context.frames.clear();
        Ok(())
    }

    fn execute(
        &mut self,
        context: &mut SimContext,
        signal_value: u64,
        _sync: SubmitSync<()>,
    ) -> Result<()> {
        if !context.open {
            return Err(RenderError::DeviceLost(format!(
                "context {} submitted without being reopened",
                context.id
            )));
        }
        context.open = false;

        {
            let mut state = self.gpu.lock();
            for &(src, dst, size) in &context.copies {
                let bytes = state
                    .buffers
                    .get(&src)
                    .map(|data| data[..(size as usize).min(data.len())].to_vec())
                    .unwrap_or_default();
                if let Some(dst) = state.buffers.get_mut(&dst) {
                    let n = bytes.len().min(dst.len());
                    dst[..n].copy_from_slice(&bytes[..n]);
                }
            }
            state.frames.extend(context.frames.drain(..));
            state.context_tags.insert(context.id, (self.kind, signal_value));

            let policy = state.policy;
            let timeline = state.timeline_mut(self.kind);
            timeline.signaled = timeline.signaled.max(signal_value);
            if policy == RetirePolicy::Immediate {
                timeline.completed = timeline.completed.max(signal_value);
            }
        }
        self.gpu.notify();
        Ok(())
    }

    fn signal(&mut self, value: u64) -> Result<()> {
        {
            let mut state = self.gpu.lock();
            let policy = state.policy;
            let timeline = state.timeline_mut(self.kind);
            timeline.signaled = timeline.signaled.max(value);
            if policy == RetirePolicy::Immediate {
                timeline.completed = timeline.completed.max(value);
            } else {
                state.bare_signals.push((self.kind, value));
                state.drain_bare_signals();
            }
        }
        self.gpu.notify();
        Ok(())
    }

    fn completed_value(&self) -> Result<u64> {
        Ok(self.gpu.lock().timeline(self.kind).completed)
    }

    fn wait_for_value(&self, value: u64, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.gpu.lock();
        while state.timeline(self.kind).completed < value {
            match deadline {
                None => self.gpu.shared.retired.wait(&mut state),
                Some(deadline) => {
                    if self.gpu.shared.retired.wait_until(&mut state, deadline).timed_out() {
                        return Ok(state.timeline(self.kind).completed >= value);
                    }
                }
            }
        }
        Ok(true)
    }

    fn destroy_context(&mut self, context: SimContext) {
        let mut state = self.gpu.lock();
        state.context_tags.remove(&context.id);
        state.live_contexts = state.live_contexts.saturating_sub(1);
    }
}
