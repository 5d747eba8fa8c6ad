//! Staged uploads into GPU-local buffers.

use bytemuck::Pod;
use log::debug;

use crate::error::{RenderError, Result};
use crate::hal::{BufferDesc, BufferUsage, DeviceHal, MemoryKind, QueueHal};
use crate::queue::CommandQueue;

/// An upload submitted to a queue but not yet known to be complete.
///
/// The destination must not be used by another queue until [`finish`](Self::finish)
/// has waited on the copy's fence value.
#[must_use = "the staging buffer is only released by `finish`"]
pub struct PendingUpload<B> {
    destination: B,
    staging: B,
    fence_value: u64,
}

impl<B> PendingUpload<B> {
    pub fn fence_value(&self) -> u64 {
        self.fence_value
    }

    pub fn is_ready<Q: QueueHal>(&self, queue: &CommandQueue<Q>) -> Result<bool> {
        queue.is_complete(self.fence_value)
    }

    /// Wait for the copy, release the staging buffer and hand back the destination.
    pub fn finish<D, Q>(self, device: &mut D, queue: &CommandQueue<Q>) -> Result<B>
    where
        D: DeviceHal<Buffer = B>,
        Q: QueueHal,
    {
        queue.wait(self.fence_value)?;
        device.destroy_buffer(self.staging);
        Ok(self.destination)
    }
}

/// Create a GPU-local buffer holding `data`.
///
/// The bytes go through a CPU-visible staging buffer and a copy recorded on
/// `queue`. Nothing waits here; the returned [`PendingUpload`] carries the
/// fence value to wait on.
pub fn upload_buffer<D, Q>(
    device: &mut D,
    queue: &mut CommandQueue<Q>,
    data: &[u8],
    usage: BufferUsage,
    name: &str,
) -> Result<PendingUpload<D::Buffer>>
where
    D: DeviceHal<Context = Q::Context>,
    Q: QueueHal,
{
    if data.is_empty() {
        return Err(RenderError::ResourceCreation(format!("{}: nothing to upload", name)));
    }
    let size = data.len() as u64;

    let destination = device.create_buffer(
        &BufferDesc { size, usage, memory: MemoryKind::GpuOnly },
        name,
    )?;
    let mut staging = match device.create_buffer(
        &BufferDesc { size, usage: BufferUsage::Staging, memory: MemoryKind::CpuToGpu },
        &format!("{} staging", name),
    ) {
        Ok(buffer) => buffer,
        Err(e) => {
            device.destroy_buffer(destination);
            return Err(e);
        }
    };

    let submitted = device.write_buffer(&mut staging, data).and_then(|()| {
        let mut recording = queue.acquire_context()?;
        device.record_copy(recording.context_mut(), &staging, &destination, size);
        queue.submit(recording)
    });

    match submitted {
        Ok(fence_value) => {
            debug!("{}: {} bytes queued for upload (fence {})", name, size, fence_value);
            Ok(PendingUpload { destination, staging, fence_value })
        }
        Err(e) => {
            device.destroy_buffer(staging);
            device.destroy_buffer(destination);
            Err(e)
        }
    }
}

/// [`upload_buffer`] for a slice of plain-old-data values.
pub fn upload_slice<T, D, Q>(
    device: &mut D,
    queue: &mut CommandQueue<Q>,
    items: &[T],
    usage: BufferUsage,
    name: &str,
) -> Result<PendingUpload<D::Buffer>>
where
    T: Pod,
    D: DeviceHal<Context = Q::Context>,
    Q: QueueHal,
{
    upload_buffer(device, queue, bytemuck::cast_slice(items), usage, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::QueueKind;
    use crate::scene::{CUBE_INDICES, CUBE_VERTICES};
    use crate::sim::{RetirePolicy, SimGpu};
    use std::time::Duration;

    #[test]
    fn test_upload_lands_in_destination() {
        let gpu = SimGpu::new(RetirePolicy::Immediate);
        let mut device = gpu.device();
        let mut queue = CommandQueue::new(gpu.queue(QueueKind::Copy), None);

        let pending =
            upload_slice(&mut device, &mut queue, &CUBE_VERTICES, BufferUsage::Vertex, "vertices").unwrap();
        assert_eq!(gpu.live_buffers(), 2);

        let buffer = pending.finish(&mut device, &queue).unwrap();
        assert_eq!(buffer.desc.memory, MemoryKind::GpuOnly);
        assert_eq!(buffer.desc.usage, BufferUsage::Vertex);
        assert_eq!(
            gpu.buffer_contents(buffer.id).unwrap(),
            bytemuck::cast_slice::<_, u8>(&CUBE_VERTICES).to_vec()
        );
        assert_eq!(gpu.live_buffers(), 1);
    }

    #[test]
    fn test_upload_does_not_wait() {
        let gpu = SimGpu::new(RetirePolicy::Manual);
        let mut device = gpu.device();
        let mut queue = CommandQueue::new(gpu.queue(QueueKind::Copy), None);

        let pending =
            upload_slice(&mut device, &mut queue, &CUBE_INDICES, BufferUsage::Index, "indices").unwrap();
        assert!(!pending.is_ready(&queue).unwrap());

        gpu.retire(QueueKind::Copy, pending.fence_value());
        assert!(pending.is_ready(&queue).unwrap());
        pending.finish(&mut device, &queue).unwrap();
    }

    #[test]
    fn test_finish_times_out_as_device_hung() {
        let gpu = SimGpu::new(RetirePolicy::Manual);
        let mut device = gpu.device();
        let mut queue = CommandQueue::new(gpu.queue(QueueKind::Copy), Some(Duration::from_millis(5)));

        let pending = upload_buffer(&mut device, &mut queue, &[1, 2, 3, 4], BufferUsage::Vertex, "v").unwrap();
        let err = pending.finish(&mut device, &queue).err().unwrap();
        assert!(matches!(err, RenderError::DeviceHung { .. }));
        gpu.retire_all();
    }

    #[test]
    fn test_empty_upload_is_rejected() {
        let gpu = SimGpu::new(RetirePolicy::Immediate);
        let mut device = gpu.device();
        let mut queue = CommandQueue::new(gpu.queue(QueueKind::Copy), None);
        assert!(upload_buffer(&mut device, &mut queue, &[], BufferUsage::Index, "empty").is_err());
        assert_eq!(gpu.live_buffers(), 0);
    }
}
