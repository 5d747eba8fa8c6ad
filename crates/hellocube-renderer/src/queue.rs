//! Command submission queue with fence-tracked context reuse.
//!
//! Recording contexts (allocator + command list) are handed out from a FIFO of
//! previously submitted contexts. The oldest one is reused only once the fence
//! value it was tagged with has retired; otherwise a fresh context is created.
//! Acquiring a context never waits on the GPU.

use std::collections::VecDeque;
use std::time::Duration;

use log::{debug, warn};

use crate::error::{RenderError, Result};
use crate::hal::{QueueHal, QueueKind, SubmitSync};

/// A context checked out of a [`CommandQueue`], open for recording.
///
/// It can only be closed by handing it back through [`CommandQueue::submit`].
pub struct Recording<C> {
    context: C,
}

impl<C> Recording<C> {
    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }
}

struct InFlight<C> {
    fence_value: u64,
    context: C,
}

/// Hardware queue plus its monotonic fence counter.
pub struct CommandQueue<Q: QueueHal> {
    hal: Q,
    /// Last value handed to the fence.
    fence_value: u64,
    in_flight: VecDeque<InFlight<Q::Context>>,
    default_timeout: Option<Duration>,
    contexts_created: usize,
}

impl<Q: QueueHal> CommandQueue<Q> {
    /// Wrap a hardware queue. `default_timeout` bounds [`wait`](Self::wait) and
    /// [`flush`](Self::flush); `None` waits forever.
    pub fn new(hal: Q, default_timeout: Option<Duration>) -> Self {
        Self {
            hal,
            fence_value: 0,
            in_flight: VecDeque::new(),
            default_timeout,
            contexts_created: 0,
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.hal.kind()
    }

    pub fn hal(&self) -> &Q {
        &self.hal
    }

    pub fn hal_mut(&mut self) -> &mut Q {
        &mut self.hal
    }

    /// Get a context ready for recording.
    pub fn acquire_context(&mut self) -> Result<Recording<Q::Context>> {
        let oldest_retired = match self.in_flight.front() {
            Some(entry) => self.hal.completed_value()? >= entry.fence_value,
            None => false,
        };

        if oldest_retired {
            if let Some(mut entry) = self.in_flight.pop_front() {
                if let Err(e) = self.hal.reset_context(&mut entry.context) {
                    self.hal.destroy_context(entry.context);
                    return Err(e);
                }
                return Ok(Recording { context: entry.context });
            }
        }

        let context = self.hal.create_context()?;
        self.contexts_created += 1;
        debug!(
            "{:?} queue: allocated recording context #{} ({} in flight)",
            self.hal.kind(),
            self.contexts_created,
            self.in_flight.len()
        );
        Ok(Recording { context })
    }

    /// Close and submit a context. Returns the fence value marking its completion.
    pub fn submit(&mut self, recording: Recording<Q::Context>) -> Result<u64> {
        self.submit_with(recording, SubmitSync::default())
    }

    /// Submit with binary semaphores attached (swapchain acquire/present hand-off).
    pub fn submit_with(
        &mut self,
        recording: Recording<Q::Context>,
        sync: SubmitSync<Q::Semaphore>,
    ) -> Result<u64> {
        let mut context = recording.context;
        let value = self.fence_value + 1;

        if let Err(e) = self.hal.execute(&mut context, value, sync) {
            self.hal.destroy_context(context);
            return Err(e);
        }

        self.fence_value = value;
        self.in_flight.push_back(InFlight { fence_value: value, context });
        Ok(value)
    }

    /// Signal the next fence value with no work attached.
    pub fn signal(&mut self) -> Result<u64> {
        let value = self.fence_value + 1;
        self.hal.signal(value)?;
        self.fence_value = value;
        Ok(value)
    }

    pub fn completed_value(&self) -> Result<u64> {
        self.hal.completed_value()
    }

    pub fn last_signaled(&self) -> u64 {
        self.fence_value
    }

    pub fn is_complete(&self, value: u64) -> Result<bool> {
        Ok(self.hal.completed_value()? >= value)
    }

    /// Block until `value` retires. Expiry of `timeout` is reported as
    /// [`RenderError::DeviceHung`]; `None` waits without bound.
    pub fn wait_for(&self, value: u64, timeout: Option<Duration>) -> Result<()> {
        if self.is_complete(value)? {
            return Ok(());
        }
        if self.hal.wait_for_value(value, timeout)? {
            return Ok(());
        }
        Err(RenderError::DeviceHung {
            value,
            completed: self.hal.completed_value()?,
        })
    }

    /// [`wait_for`](Self::wait_for) with the queue's default timeout.
    pub fn wait(&self, value: u64) -> Result<()> {
        self.wait_for(value, self.default_timeout)
    }

    /// Signal and wait: every piece of work submitted so far has completed on return.
    pub fn flush(&mut self) -> Result<u64> {
        let value = self.signal()?;
        self.wait(value)?;
        Ok(value)
    }

    /// Number of contexts ever created by this queue.
    pub fn contexts_created(&self) -> usize {
        self.contexts_created
    }

    /// Contexts submitted and waiting for reuse.
    pub fn pooled(&self) -> usize {
        self.in_flight.len()
    }
}

impl<Q: QueueHal> Drop for CommandQueue<Q> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("{:?} queue: flush before teardown failed: {}", self.hal.kind(), e);
        }
        for entry in self.in_flight.drain(..) {
            self.hal.destroy_context(entry.context);
        }
    }
}
