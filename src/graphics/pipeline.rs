//! Render pass and graphics pipeline for drawing particles as points
//!
//! The vertex shader reads `Particle` records straight from the vertex
//! buffer (position at location 0, color at 1, velocity at 2) and receives
//! the framebuffer size through a [`ViewportPush`] push constant. Viewport
//! and scissor are dynamic, so only a change of surface format requires a
//! new pipeline.

use crate::{
    error::CrateResult,
    graphics::{device::VulkanContext, error::{GraphicsError, VkResultExt}},
};
use ash::vk;
use shared::{Particle, ViewportPush};
use std::{path::Path, sync::Arc};
use tracing::debug;

const ENTRY_POINT: &std::ffi::CStr = c"main";

/// Read a SPIR-V file into words
pub fn load_spirv(path: &Path) -> CrateResult<Vec<u32>> {
    let shader_error = |source| GraphicsError::Shader {
        path: path.to_path_buf(),
        source,
    };
    let mut file = std::fs::File::open(path).map_err(shader_error)?;
    Ok(ash::util::read_spv(&mut file).map_err(shader_error)?)
}

/// Binding and attribute descriptions matching the `Particle` layout
pub fn vertex_input() -> (
    vk::VertexInputBindingDescription,
    [vk::VertexInputAttributeDescription; 3],
) {
    let binding = vk::VertexInputBindingDescription::default()
        .binding(0)
        .stride(Particle::STRIDE)
        .input_rate(vk::VertexInputRate::VERTEX);
    let attributes = [
        vk::VertexInputAttributeDescription::default()
            .location(0)
            .binding(0)
            .format(vk::Format::R32G32_SFLOAT)
            .offset(Particle::POSITION_OFFSET),
        vk::VertexInputAttributeDescription::default()
            .location(1)
            .binding(0)
            .format(vk::Format::R32G32B32A32_SFLOAT)
            .offset(Particle::COLOR_OFFSET),
        vk::VertexInputAttributeDescription::default()
            .location(2)
            .binding(0)
            .format(vk::Format::R32G32_SFLOAT)
            .offset(Particle::VELOCITY_OFFSET),
    ];
    (binding, attributes)
}

struct ShaderModule<'a> {
    device: &'a ash::Device,
    module: vk::ShaderModule,
}

impl<'a> ShaderModule<'a> {
    fn new(device: &'a ash::Device, code: &[u32]) -> CrateResult<Self> {
        let module = unsafe {
            device.create_shader_module(&vk::ShaderModuleCreateInfo::default().code(code), None)
        }
        .context("vkCreateShaderModule")?;
        Ok(Self { device, module })
    }
}

impl Drop for ShaderModule<'_> {
    fn drop(&mut self) {
        unsafe { self.device.destroy_shader_module(self.module, None) };
    }
}

/// Render pass, layout and pipeline for one color/depth format pair
pub struct ParticlePipeline {
    ctx: Arc<VulkanContext>,
    render_pass: vk::RenderPass,
    layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    color_format: vk::Format,
}

impl ParticlePipeline {
    pub fn new(
        ctx: &Arc<VulkanContext>,
        color_format: vk::Format,
        depth_format: vk::Format,
        vertex_spirv: &[u32],
        fragment_spirv: &[u32],
    ) -> CrateResult<Self> {
        // Null handles until created; Drop skips them.
        let mut this = Self {
            ctx: ctx.clone(),
            render_pass: vk::RenderPass::null(),
            layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            color_format,
        };
        this.render_pass = create_render_pass(ctx.device(), color_format, depth_format)?;
        this.layout = unsafe {
            ctx.device().create_pipeline_layout(
                &vk::PipelineLayoutCreateInfo::default().push_constant_ranges(&[
                    vk::PushConstantRange::default()
                        .stage_flags(vk::ShaderStageFlags::VERTEX)
                        .offset(0)
                        .size(std::mem::size_of::<ViewportPush>() as u32),
                ]),
                None,
            )
        }
        .context("vkCreatePipelineLayout")?;
        this.pipeline = this.create_pipeline(vertex_spirv, fragment_spirv)?;
        debug!(?color_format, ?depth_format, "created particle pipeline");
        Ok(this)
    }

    fn create_pipeline(&self, vertex_spirv: &[u32], fragment_spirv: &[u32]) -> CrateResult<vk::Pipeline> {
        let device = self.ctx.device();
        let vertex = ShaderModule::new(device, vertex_spirv)?;
        let fragment = ShaderModule::new(device, fragment_spirv)?;
        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex.module)
                .name(ENTRY_POINT),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment.module)
                .name(ENTRY_POINT),
        ];

        let (binding, attributes) = vertex_input();
        let bindings = [binding];
        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);
        // Each particle is rendered as a single point
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::POINT_LIST);
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS);
        let blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)];
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(self.layout)
            .render_pass(self.render_pass)
            .subpass(0);

        let pipelines = unsafe {
            device.create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
        }
        .map_err(|(_, e)| e)
        .context("vkCreateGraphicsPipelines")?;
        Ok(pipelines[0])
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn pipeline(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn color_format(&self) -> vk::Format {
        self.color_format
    }
}

impl Drop for ParticlePipeline {
    fn drop(&mut self) {
        let device = self.ctx.device();
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
            device.destroy_render_pass(self.render_pass, None);
        }
    }
}

fn create_render_pass(
    device: &ash::Device,
    color_format: vk::Format,
    depth_format: vk::Format,
) -> CrateResult<vk::RenderPass> {
    let attachments = [
        vk::AttachmentDescription::default()
            .format(color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR),
        vk::AttachmentDescription::default()
            .format(depth_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
    ];
    let color_refs = [vk::AttachmentReference::default()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)];
    let depth_ref = vk::AttachmentReference::default()
        .attachment(1)
        .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
    let subpasses = [vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs)
        .depth_stencil_attachment(&depth_ref)];
    let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
    let dependencies = [vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(stages)
        .dst_stage_mask(stages)
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )];

    unsafe {
        device.create_render_pass(
            &vk::RenderPassCreateInfo::default()
                .attachments(&attachments)
                .subpasses(&subpasses)
                .dependencies(&dependencies),
            None,
        )
    }
    .context("vkCreateRenderPass")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_follow_particle_layout() {
        let (binding, attributes) = vertex_input();
        assert_eq!(binding.stride, 36);
        let by_location: Vec<_> = attributes
            .iter()
            .map(|a| (a.location, a.offset, a.format))
            .collect();
        assert_eq!(
            by_location,
            vec![
                (0, 0, vk::Format::R32G32_SFLOAT),
                (1, 16, vk::Format::R32G32B32A32_SFLOAT),
                (2, 8, vk::Format::R32G32_SFLOAT),
            ]
        );
    }

    #[test]
    fn missing_shader_reports_its_path() {
        let err = load_spirv(Path::new("does/not/exist.spv")).unwrap_err();
        assert!(err.to_string().contains("does/not/exist.spv"));
    }
}
