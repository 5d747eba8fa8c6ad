//! Graphics pipeline for the cube.

use ash::vk;
use std::mem::size_of;

use super::resource_error;
use crate::error::Result;
use crate::scene::Vertex;

/// Size of the MVP push constant.
pub const PUSH_CONSTANT_SIZE: u32 = size_of::<[f32; 16]>() as u32;

/// Pipeline and layout for a given colour/depth attachment pair.
pub struct CubePipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub color_format: vk::Format,
}

impl CubePipeline {
    /// Build the pipeline for dynamic rendering into `color_format` + `depth_format`.
    ///
    /// # Safety
    /// `device` must be a valid device with dynamic rendering enabled.
    pub unsafe fn new(
        device: &ash::Device,
        color_format: vk::Format,
        depth_format: vk::Format,
        vertex_spirv: &[u32],
        fragment_spirv: &[u32],
    ) -> Result<Self> {
        let push_ranges = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::VERTEX)
            .offset(0)
            .size(PUSH_CONSTANT_SIZE)];
        let layout_info = vk::PipelineLayoutCreateInfo::default().push_constant_ranges(&push_ranges);
        let layout = device
            .create_pipeline_layout(&layout_info, None)
            .map_err(|e| resource_error("Failed to create pipeline layout", e))?;

        match Self::create_pipeline(device, layout, color_format, depth_format, vertex_spirv, fragment_spirv) {
            Ok(pipeline) => Ok(Self { pipeline, layout, color_format }),
            Err(e) => {
                device.destroy_pipeline_layout(layout, None);
                Err(e)
            }
        }
    }

    unsafe fn create_shader_module(device: &ash::Device, code: &[u32]) -> Result<vk::ShaderModule> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(code);
        device
            .create_shader_module(&create_info, None)
            .map_err(|e| resource_error("Failed to create shader module", e))
    }

    unsafe fn create_pipeline(
        device: &ash::Device,
        layout: vk::PipelineLayout,
        color_format: vk::Format,
        depth_format: vk::Format,
        vertex_spirv: &[u32],
        fragment_spirv: &[u32],
    ) -> Result<vk::Pipeline> {
        let vert_module = Self::create_shader_module(device, vertex_spirv)?;
        let frag_module = match Self::create_shader_module(device, fragment_spirv) {
            Ok(module) => module,
            Err(e) => {
                device.destroy_shader_module(vert_module, None);
                return Err(e);
            }
        };

        let entry_name = c"main";
        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vert_module)
                .name(entry_name),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(frag_module)
                .name(entry_name),
        ];

        // Position then colour, both vec3.
        let binding_desc = [vk::VertexInputBindingDescription::default()
            .binding(0)
            .stride(size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)];

        let attr_descs = [
            vk::VertexInputAttributeDescription::default()
                .binding(0)
                .location(0)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(0),
            vk::VertexInputAttributeDescription::default()
                .binding(0)
                .location(1)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(12),
        ];

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&binding_desc)
            .vertex_attribute_descriptions(&attr_descs);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let color_formats = [color_format];
        let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(depth_format);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info);

        let result = device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None);

        device.destroy_shader_module(vert_module, None);
        device.destroy_shader_module(frag_module, None);

        let pipelines = result.map_err(|(_, e)| resource_error("Failed to create graphics pipeline", e))?;
        Ok(pipelines[0])
    }

    /// # Safety
    /// The GPU must no longer be using the pipeline.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.layout, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_constant_holds_one_matrix() {
        assert_eq!(PUSH_CONSTANT_SIZE, 64);
        assert_eq!(size_of::<Vertex>(), 24);
    }
}
