use crate::error::{RenderError, Result};
use crate::hal::{BufferDesc, DeviceHal, FrameDraw, MemoryKind};
use crate::scene::Extent2D;

use super::{SimContext, SimFormat, SimFrame, SimGpu, SimRelease, SimTarget};

#[derive(Debug)]
pub struct SimBuffer {
    pub id: u64,
    pub desc: BufferDesc,
    pub name: String,
}

#[derive(Debug)]
pub struct SimDepth {
    pub extent: Extent2D,
}

pub struct SimDevice {
    gpu: SimGpu,
    format: Option<SimFormat>,
}

impl SimDevice {
    pub(super) fn new(gpu: SimGpu) -> Self {
        Self { gpu, format: None }
    }

    /// Format the device last prepared its pipeline for.
    pub fn format(&self) -> Option<SimFormat> {
        self.format
    }
}

impl DeviceHal for SimDevice {
    type Context = SimContext;
    type Target = SimTarget;
    type Format = SimFormat;
    type Buffer = SimBuffer;
    type DepthTarget = SimDepth;

    fn prepare_for_format(&mut self, format: SimFormat) -> Result<()> {
        self.format = Some(format);
        Ok(())
    }

    fn create_buffer(&mut self, desc: &BufferDesc, name: &str) -> Result<SimBuffer> {
        if desc.size == 0 {
            return Err(RenderError::ResourceCreation(format!("{}: zero-sized buffer", name)));
        }
        let mut state = self.gpu.lock();
        let id = state.next_buffer_id;
        state.next_buffer_id += 1;
        state.buffers.insert(id, vec![0; desc.size as usize]);
        Ok(SimBuffer { id, desc: *desc, name: name.to_string() })
    }

    fn write_buffer(&mut self, buffer: &mut SimBuffer, data: &[u8]) -> Result<()> {
        if buffer.desc.memory != MemoryKind::CpuToGpu {
            return Err(RenderError::ResourceCreation(format!(
                "{}: buffer is not CPU-visible",
                buffer.name
            )));
        }
        if data.len() as u64 > buffer.desc.size {
            return Err(RenderError::ResourceCreation(format!(
                "{}: {} bytes do not fit in {}",
                buffer.name,
                data.len(),
                buffer.desc.size
            )));
        }
        let mut state = self.gpu.lock();
        if let Some(contents) = state.buffers.get_mut(&buffer.id) {
            contents[..data.len()].copy_from_slice(data);
        }
        Ok(())
    }

    fn record_copy(&mut self, context: &mut SimContext, src: &SimBuffer, dst: &SimBuffer, size: u64) {
        context.copies.push((src.id, dst.id, size));
    }

    fn destroy_buffer(&mut self, buffer: SimBuffer) {
        let mut state = self.gpu.lock();
        state.buffers.remove(&buffer.id);
        state.releases.push(SimRelease::Buffer(buffer.name));
    }

    fn create_depth_target(&mut self, extent: Extent2D) -> Result<SimDepth> {
        let mut state = self.gpu.lock();
        state.depth_extents.push(extent);
        state.live_depth_targets += 1;
        Ok(SimDepth { extent })
    }

    fn destroy_depth_target(&mut self, _depth: SimDepth) {
        let mut state = self.gpu.lock();
        state.live_depth_targets = state.live_depth_targets.saturating_sub(1);
        state.releases.push(SimRelease::DepthTarget);
    }

    fn record_frame(&mut self, context: &mut SimContext, frame: &FrameDraw<'_, Self>) {
        {
            let mut state = self.gpu.lock();
            if frame.target.chain != state.chain_generation {
                state.violations.stale_target += 1;
            }
        }
        context.frames.push(SimFrame {
            image: frame.target.image,
            chain: frame.target.chain,
            extent: frame.extent,
            depth_extent: frame.depth.map(|d| d.extent),
            clear_color: frame.clear_color,
            index_count: frame.index_count,
            mvp: frame.mvp,
        });
    }
}
