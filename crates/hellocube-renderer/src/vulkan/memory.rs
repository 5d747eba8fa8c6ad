//! Buffers, depth images and frame recording on top of gpu-allocator.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation;
use log::{error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;

use super::{resource_error, CommandContext, CubePipeline, SwapchainTarget, VulkanContext, DEPTH_FORMAT};
use crate::error::{RenderError, Result};
use crate::hal::{BufferDesc, BufferUsage, DeviceHal, FrameDraw, MemoryKind};
use crate::scene::Extent2D;

/// GPU buffer with associated memory.
pub struct GpuBuffer {
    pub handle: vk::Buffer,
    pub allocation: Option<Allocation>,
    pub size: vk::DeviceSize,
}

/// Depth attachment sized to the swapchain.
pub struct DepthImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub allocation: Option<Allocation>,
    pub extent: Extent2D,
}

/// Resource creation and command recording for the cube.
pub struct VulkanDevice {
    allocator: Mutex<Allocator>,
    pipeline: Option<CubePipeline>,
    vertex_spirv: Vec<u32>,
    fragment_spirv: Vec<u32>,
    /// Families sharing buffers; more than one means concurrent sharing.
    buffer_families: Vec<u32>,
    ctx: Arc<VulkanContext>,
}

fn usage_flags(usage: BufferUsage) -> vk::BufferUsageFlags {
    match usage {
        BufferUsage::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        BufferUsage::Index => vk::BufferUsageFlags::INDEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
        BufferUsage::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
    }
}

fn memory_location(memory: MemoryKind) -> MemoryLocation {
    match memory {
        MemoryKind::GpuOnly => MemoryLocation::GpuOnly,
        MemoryKind::CpuToGpu => MemoryLocation::CpuToGpu,
    }
}

fn allocation_error(what: &str, e: gpu_allocator::AllocationError) -> RenderError {
    RenderError::ResourceCreation(format!("{}: {}", what, e))
}

impl VulkanDevice {
    /// Create the allocator. The pipeline is built once the swapchain format is known.
    pub fn new(ctx: Arc<VulkanContext>, vertex_spirv: Vec<u32>, fragment_spirv: Vec<u32>) -> Result<Self> {
        let mut debug_settings = gpu_allocator::AllocatorDebugSettings::default();
        debug_settings.log_memory_information = cfg!(debug_assertions);
        debug_settings.log_leaks_on_shutdown = true;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: ctx.instance.clone(),
            device: ctx.device.clone(),
            physical_device: ctx.physical_device,
            debug_settings,
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| allocation_error("Failed to create allocator", e))?;

        let families = ctx.queue_families;
        let mut buffer_families = vec![families.graphics];
        if families.copy() != families.graphics {
            buffer_families.push(families.copy());
        }

        Ok(Self {
            allocator: Mutex::new(allocator),
            pipeline: None,
            vertex_spirv,
            fragment_spirv,
            buffer_families,
            ctx,
        })
    }

    pub fn pipeline(&self) -> Option<&CubePipeline> {
        self.pipeline.as_ref()
    }

    unsafe fn free_allocation(&self, allocation: Option<Allocation>) {
        if let Some(allocation) = allocation {
            if let Err(e) = self.allocator.lock().free(allocation) {
                warn!("Failed to free GPU allocation: {}", e);
            }
        }
    }

    unsafe fn create_depth_view(&self, image: vk::Image) -> Result<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(DEPTH_FORMAT)
            .subresource_range(depth_range());
        self.ctx
            .device
            .create_image_view(&view_info, None)
            .map_err(|e| resource_error("Failed to create depth view", e))
    }
}

fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn depth_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::DEPTH,
        ..color_range()
    }
}

impl DeviceHal for VulkanDevice {
    type Context = CommandContext;
    type Target = SwapchainTarget;
    type Format = vk::SurfaceFormatKHR;
    type Buffer = GpuBuffer;
    type DepthTarget = DepthImage;

    fn prepare_for_format(&mut self, format: vk::SurfaceFormatKHR) -> Result<()> {
        if self.pipeline.as_ref().is_some_and(|p| p.color_format == format.format) {
            return Ok(());
        }
        unsafe {
            let pipeline = CubePipeline::new(
                &self.ctx.device,
                format.format,
                DEPTH_FORMAT,
                &self.vertex_spirv,
                &self.fragment_spirv,
            )?;
            if let Some(old) = self.pipeline.replace(pipeline) {
                // Only reached after the swapchain flush, so the old pipeline is idle.
                old.destroy(&self.ctx.device);
            }
        }
        info!("Cube pipeline built for {:?}", format.format);
        Ok(())
    }

    fn create_buffer(&mut self, desc: &BufferDesc, name: &str) -> Result<GpuBuffer> {
        unsafe {
            let mut buffer_info = vk::BufferCreateInfo::default()
                .size(desc.size.max(1))
                .usage(usage_flags(desc.usage));
            buffer_info = if self.buffer_families.len() > 1 {
                buffer_info
                    .sharing_mode(vk::SharingMode::CONCURRENT)
                    .queue_family_indices(&self.buffer_families)
            } else {
                buffer_info.sharing_mode(vk::SharingMode::EXCLUSIVE)
            };

            let handle = self
                .ctx
                .device
                .create_buffer(&buffer_info, None)
                .map_err(|e| resource_error("Failed to create buffer", e))?;

            let requirements = self.ctx.device.get_buffer_memory_requirements(handle);
            let allocation = self.allocator.lock().allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: memory_location(desc.memory),
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            });
            let allocation = match allocation {
                Ok(allocation) => allocation,
                Err(e) => {
                    self.ctx.device.destroy_buffer(handle, None);
                    return Err(allocation_error("Failed to allocate buffer memory", e));
                }
            };

            if let Err(e) = self
                .ctx
                .device
                .bind_buffer_memory(handle, allocation.memory(), allocation.offset())
            {
                self.ctx.device.destroy_buffer(handle, None);
                self.free_allocation(Some(allocation));
                return Err(resource_error("Failed to bind buffer memory", e));
            }

            Ok(GpuBuffer { handle, allocation: Some(allocation), size: desc.size })
        }
    }

    fn write_buffer(&mut self, buffer: &mut GpuBuffer, data: &[u8]) -> Result<()> {
        if data.len() as u64 > buffer.size {
            return Err(RenderError::ResourceCreation(format!(
                "write of {} bytes into a {} byte buffer",
                data.len(),
                buffer.size
            )));
        }
        let mapped = buffer
            .allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .ok_or_else(|| RenderError::ResourceCreation("buffer is not CPU-visible".into()))?;
        mapped[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn record_copy(&mut self, context: &mut CommandContext, src: &GpuBuffer, dst: &GpuBuffer, size: u64) {
        let region = vk::BufferCopy { src_offset: 0, dst_offset: 0, size };
        unsafe {
            self.ctx.device.cmd_copy_buffer(context.cmd(), src.handle, dst.handle, &[region]);
        }
    }

    fn destroy_buffer(&mut self, mut buffer: GpuBuffer) {
        unsafe {
            self.ctx.device.destroy_buffer(buffer.handle, None);
            self.free_allocation(buffer.allocation.take());
        }
    }

    fn create_depth_target(&mut self, extent: Extent2D) -> Result<DepthImage> {
        let extent = extent.at_least_one();
        unsafe {
            let image_info = vk::ImageCreateInfo::default()
                .image_type(vk::ImageType::TYPE_2D)
                .format(DEPTH_FORMAT)
                .extent(vk::Extent3D { width: extent.width, height: extent.height, depth: 1 })
                .mip_levels(1)
                .array_layers(1)
                .samples(vk::SampleCountFlags::TYPE_1)
                .tiling(vk::ImageTiling::OPTIMAL)
                .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .initial_layout(vk::ImageLayout::UNDEFINED);

            let image = self
                .ctx
                .device
                .create_image(&image_info, None)
                .map_err(|e| resource_error("Failed to create depth image", e))?;

            let requirements = self.ctx.device.get_image_memory_requirements(image);
            let allocation = match self.allocator.lock().allocate(&AllocationCreateDesc {
                name: "depth",
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            }) {
                Ok(allocation) => allocation,
                Err(e) => {
                    self.ctx.device.destroy_image(image, None);
                    return Err(allocation_error("Failed to allocate depth memory", e));
                }
            };

            let bound = self
                .ctx
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .map_err(|e| resource_error("Failed to bind depth memory", e));
            let view = bound.and_then(|_| self.create_depth_view(image));
            match view {
                Ok(view) => Ok(DepthImage { image, view, allocation: Some(allocation), extent }),
                Err(e) => {
                    self.ctx.device.destroy_image(image, None);
                    self.free_allocation(Some(allocation));
                    Err(e)
                }
            }
        }
    }

    fn destroy_depth_target(&mut self, mut depth: DepthImage) {
        unsafe {
            self.ctx.device.destroy_image_view(depth.view, None);
            self.ctx.device.destroy_image(depth.image, None);
            self.free_allocation(depth.allocation.take());
        }
    }

    fn record_frame(&mut self, context: &mut CommandContext, frame: &FrameDraw<'_, Self>) {
        let device = &self.ctx.device;
        let cmd = context.cmd();
        let extent = vk::Extent2D { width: frame.extent.width, height: frame.extent.height };

        unsafe {
            let mut to_attachment = vec![vk::ImageMemoryBarrier2::default()
                .src_stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
                .src_access_mask(vk::AccessFlags2::NONE)
                .dst_stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
                .dst_access_mask(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .image(frame.target.image)
                .subresource_range(color_range())];
            if let Some(depth) = frame.depth {
                let tests = vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS;
                to_attachment.push(
                    vk::ImageMemoryBarrier2::default()
                        .src_stage_mask(tests)
                        .src_access_mask(vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE)
                        .dst_stage_mask(tests)
                        .dst_access_mask(
                            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
                        )
                        .old_layout(vk::ImageLayout::UNDEFINED)
                        .new_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
                        .image(depth.image)
                        .subresource_range(depth_range()),
                );
            }
            device.cmd_pipeline_barrier2(
                cmd,
                &vk::DependencyInfo::default().image_memory_barriers(&to_attachment),
            );

            let color_attachments = [vk::RenderingAttachmentInfo::default()
                .image_view(frame.target.view)
                .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::STORE)
                .clear_value(vk::ClearValue {
                    color: vk::ClearColorValue { float32: frame.clear_color },
                })];
            let depth_attachment = frame.depth.map(|depth| {
                vk::RenderingAttachmentInfo::default()
                    .image_view(depth.view)
                    .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .clear_value(vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
                    })
            });

            let mut rendering_info = vk::RenderingInfo::default()
                .render_area(vk::Rect2D { offset: vk::Offset2D { x: 0, y: 0 }, extent })
                .layer_count(1)
                .color_attachments(&color_attachments);
            if let Some(depth_attachment) = depth_attachment.as_ref() {
                rendering_info = rendering_info.depth_attachment(depth_attachment);
            }

            device.cmd_begin_rendering(cmd, &rendering_info);

            match self.pipeline.as_ref() {
                Some(pipeline) => {
                    device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline.pipeline);
                    device.cmd_set_viewport(
                        cmd,
                        0,
                        &[vk::Viewport {
                            x: 0.0,
                            y: 0.0,
                            width: extent.width as f32,
                            height: extent.height as f32,
                            min_depth: 0.0,
                            max_depth: 1.0,
                        }],
                    );
                    device.cmd_set_scissor(cmd, 0, &[vk::Rect2D { offset: vk::Offset2D { x: 0, y: 0 }, extent }]);
                    device.cmd_bind_vertex_buffers(cmd, 0, &[frame.vertices.handle], &[0]);
                    device.cmd_bind_index_buffer(cmd, frame.indices.handle, 0, vk::IndexType::UINT16);
                    device.cmd_push_constants(
                        cmd,
                        pipeline.layout,
                        vk::ShaderStageFlags::VERTEX,
                        0,
                        bytemuck::cast_slice(&frame.mvp.to_cols_array()),
                    );
                    device.cmd_draw_indexed(cmd, frame.index_count, 1, 0, 0, 0);
                }
                None => error!("Frame recorded before the pipeline was built; clearing only"),
            }

            device.cmd_end_rendering(cmd);

            let to_present = [vk::ImageMemoryBarrier2::default()
                .src_stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)
                .src_access_mask(vk::AccessFlags2::COLOR_ATTACHMENT_WRITE)
                .dst_stage_mask(vk::PipelineStageFlags2::BOTTOM_OF_PIPE)
                .dst_access_mask(vk::AccessFlags2::NONE)
                .old_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                .image(frame.target.image)
                .subresource_range(color_range())];
            device.cmd_pipeline_barrier2(cmd, &vk::DependencyInfo::default().image_memory_barriers(&to_present));
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            unsafe {
                self.ctx.wait_idle();
                pipeline.destroy(&self.ctx.device);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_flags() {
        assert!(usage_flags(BufferUsage::Vertex).contains(vk::BufferUsageFlags::TRANSFER_DST));
        assert!(usage_flags(BufferUsage::Index).contains(vk::BufferUsageFlags::INDEX_BUFFER));
        assert_eq!(usage_flags(BufferUsage::Staging), vk::BufferUsageFlags::TRANSFER_SRC);
    }

    #[test]
    fn test_memory_location() {
        assert_eq!(memory_location(MemoryKind::GpuOnly), MemoryLocation::GpuOnly);
        assert_eq!(memory_location(MemoryKind::CpuToGpu), MemoryLocation::CpuToGpu);
    }
}
