//! Vulkan queue with a timeline semaphore as its fence.

use ash::vk;
use std::sync::Arc;
use std::time::Duration;

use super::{resource_error, VulkanContext};
use crate::error::{RenderError, Result};
use crate::hal::{QueueHal, QueueKind, SubmitSync};

/// Transient command pool with one primary command buffer.
pub struct CommandContext {
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
}

impl CommandContext {
    pub fn cmd(&self) -> vk::CommandBuffer {
        self.cmd
    }
}

/// A device queue plus the timeline semaphore it signals.
pub struct VulkanQueue {
    ctx: Arc<VulkanContext>,
    kind: QueueKind,
    queue: vk::Queue,
    family: u32,
    timeline: vk::Semaphore,
}

impl VulkanQueue {
    /// Wrap the context's graphics or copy queue.
    pub fn new(ctx: Arc<VulkanContext>, kind: QueueKind) -> Result<Self> {
        let (queue, family) = match kind {
            QueueKind::Graphics => (ctx.graphics_queue, ctx.queue_families.graphics),
            QueueKind::Copy => (
                ctx.transfer_queue.unwrap_or(ctx.graphics_queue),
                ctx.queue_families.copy(),
            ),
        };

        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);

        let timeline = unsafe {
            ctx.device
                .create_semaphore(&create_info, None)
                .map_err(|e| resource_error("Failed to create timeline semaphore", e))?
        };

        Ok(Self { ctx, kind, queue, family, timeline })
    }

    unsafe fn begin(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        self.ctx
            .device
            .begin_command_buffer(cmd, &begin_info)
            .map_err(|e| resource_error("Failed to begin command buffer", e))
    }

    /// Submit `command_buffers`, waiting on `wait` and signalling the
    /// timeline to `value` plus the optional binary semaphore.
    unsafe fn submit(
        &self,
        command_buffers: &[vk::CommandBuffer],
        value: u64,
        sync: SubmitSync<vk::Semaphore>,
    ) -> Result<()> {
        let wait_semaphores: Vec<vk::Semaphore> = sync.wait.into_iter().collect();
        let wait_values = vec![0u64; wait_semaphores.len()];
        let wait_stages = vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT; wait_semaphores.len()];

        let mut signal_semaphores = vec![self.timeline];
        let mut signal_values = vec![value];
        if let Some(binary) = sync.signal {
            signal_semaphores.push(binary);
            signal_values.push(0);
        }

        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::default()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info);

        self.ctx
            .device
            .queue_submit(self.queue, &[submit_info], vk::Fence::null())
            .map_err(|e| resource_error("Failed to submit to queue", e))
    }
}

impl QueueHal for VulkanQueue {
    type Context = CommandContext;
    type Semaphore = vk::Semaphore;

    fn kind(&self) -> QueueKind {
        self.kind
    }

    fn create_context(&mut self) -> Result<CommandContext> {
        unsafe {
            let pool_info = vk::CommandPoolCreateInfo::default()
                .queue_family_index(self.family)
                .flags(vk::CommandPoolCreateFlags::TRANSIENT);
            let pool = self
                .ctx
                .device
                .create_command_pool(&pool_info, None)
                .map_err(|e| resource_error("Failed to create command pool", e))?;

            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let cmd = match self.ctx.device.allocate_command_buffers(&alloc_info) {
                Ok(buffers) => buffers[0],
                Err(e) => {
                    self.ctx.device.destroy_command_pool(pool, None);
                    return Err(resource_error("Failed to allocate command buffer", e));
                }
            };

            let context = CommandContext { pool, cmd };
            if let Err(e) = self.begin(cmd) {
                self.destroy_context(context);
                return Err(e);
            }
            Ok(context)
        }
    }

    fn reset_context(&mut self, context: &mut CommandContext) -> Result<()> {
        unsafe {
            self.ctx
                .device
                .reset_command_pool(context.pool, vk::CommandPoolResetFlags::empty())
                .map_err(|e| resource_error("Failed to reset command pool", e))?;
            self.begin(context.cmd)
        }
    }

    fn execute(
        &mut self,
        context: &mut CommandContext,
        signal_value: u64,
        sync: SubmitSync<vk::Semaphore>,
    ) -> Result<()> {
        unsafe {
            self.ctx
                .device
                .end_command_buffer(context.cmd)
                .map_err(|e| resource_error("Failed to end command buffer", e))?;
            self.submit(&[context.cmd], signal_value, sync)
        }
    }

    fn signal(&mut self, value: u64) -> Result<()> {
        unsafe { self.submit(&[], value, SubmitSync::default()) }
    }

    fn completed_value(&self) -> Result<u64> {
        unsafe {
            self.ctx
                .device
                .get_semaphore_counter_value(self.timeline)
                .map_err(|e| resource_error("Failed to query timeline value", e))
        }
    }

    fn wait_for_value(&self, value: u64, timeout: Option<Duration>) -> Result<bool> {
        let timeout_ns = timeout.map_or(u64::MAX, |t| u64::try_from(t.as_nanos()).unwrap_or(u64::MAX));
        let semaphores = [self.timeline];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);

        match unsafe { self.ctx.device.wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(vk::Result::ERROR_DEVICE_LOST) => {
                Err(RenderError::DeviceLost(format!("lost while waiting for fence value {}", value)))
            }
            Err(e) => Err(resource_error("Failed to wait on timeline", e)),
        }
    }

    fn destroy_context(&mut self, context: CommandContext) {
        // Freeing the pool frees its command buffer.
        unsafe {
            self.ctx.device.destroy_command_pool(context.pool, None);
        }
    }
}

impl Drop for VulkanQueue {
    fn drop(&mut self) {
        unsafe {
            let _ = self.ctx.device.queue_wait_idle(self.queue);
            self.ctx.device.destroy_semaphore(self.timeline, None);
        }
    }
}
