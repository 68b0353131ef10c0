use std::path::Path;
use std::sync::Arc;
use ash::vk;
use crate::renderer::descriptors::layout::{DescriptorSetLayout, DescriptorSetLayoutBuilder};
use crate::renderer::error::{HriError, Result};
use crate::renderer::frame::frame::ActiveFrame;
use crate::renderer::resources::image::ImageResource;
use crate::renderer::resources::sampler::{ImageSampler, SamplerConfig};
use crate::renderer::shaders::ShaderDatabase;
use crate::renderer::shaders::pipeline::{GraphicsPipelineBuilder, PipelineLayoutBuilder};
use crate::renderer::shaders::shader::Shader;
use crate::renderer::subsystems::{set_full_viewport, PipelineBinding, RenderSubsystem};

/// Draws the render result onto the swapchain image with a fullscreen triangle
pub struct PresentationSubsystem {
    pipeline: PipelineBinding,
    render_result_set: Option<vk::DescriptorSet>,
    render_result_set_layout: DescriptorSetLayout,
    render_result_sampler: ImageSampler,
    device: Arc<ash::Device>,
}

impl PresentationSubsystem {
    pub const PIPELINE_NAME: &'static str = "PresentPipeline";
    pub const VERTEX_SHADER: &'static str = "PresentVert";
    pub const FRAGMENT_SHADER: &'static str = "PresentFrag";

    pub fn new(
        shader_db: &mut ShaderDatabase,
        render_pass: vk::RenderPass,
        shader_dir: &Path,
    ) -> Result<Self> {
        let device = shader_db.device().clone();

        let render_result_set_layout = DescriptorSetLayoutBuilder::new()
            .add_binding(0, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 1, vk::ShaderStageFlags::FRAGMENT)
            .build(device.clone())?;
        let layout = PipelineLayoutBuilder::new()
            .add_descriptor_set_layout(render_result_set_layout.handle)
            .build(device.clone())?;

        shader_db.register_shader(
            Self::VERTEX_SHADER,
            Shader::load_file(device.clone(), shader_dir.join("present.vert.spv"), vk::ShaderStageFlags::VERTEX)?,
        );
        shader_db.register_shader(
            Self::FRAGMENT_SHADER,
            Shader::load_file(device.clone(), shader_dir.join("present.frag.spv"), vk::ShaderStageFlags::FRAGMENT)?,
        );
        let pso = shader_db.create_pipeline(
            Self::PIPELINE_NAME,
            &[Self::VERTEX_SHADER, Self::FRAGMENT_SHADER],
            &Self::pipeline_config(render_pass),
            Arc::new(layout),
        )?;

        let render_result_sampler = ImageSampler::new(Self::sampler_config(), device.clone())?;

        Ok(Self {
            pipeline: PipelineBinding::from(pso),
            render_result_set: None,
            render_result_set_layout,
            render_result_sampler,
            device,
        })
    }

    /// Pick up a pipeline recreated under the same name
    pub fn refresh_pipeline(&mut self, shader_db: &ShaderDatabase) -> Result<bool> {
        self.pipeline.refresh(shader_db, Self::PIPELINE_NAME)
    }

    /// No vertex input; the vertex shader derives the triangle from the vertex index
    pub fn pipeline_config(render_pass: vk::RenderPass) -> GraphicsPipelineBuilder {
        let mut config = GraphicsPipelineBuilder::new(render_pass, 0);
        config
            .add_dynamic_state(vk::DynamicState::VIEWPORT)
            .add_dynamic_state(vk::DynamicState::SCISSOR);
        config.rasterization_state = GraphicsPipelineBuilder::init_rasterization_state(
            false,
            vk::PolygonMode::FILL,
            vk::CullModeFlags::NONE,
            vk::FrontFace::COUNTER_CLOCKWISE,
        );
        config
    }

    pub fn sampler_config() -> SamplerConfig {
        SamplerConfig::linear().with_address_mode(vk::SamplerAddressMode::CLAMP_TO_EDGE)
    }

    /// Image info for binding 0 of the render result set
    pub fn render_result_info(&self, render_result: &ImageResource) -> vk::DescriptorImageInfo {
        render_result.sampled_descriptor_info(
            &self.render_result_sampler,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
    }

    pub fn render_result_set_layout(&self) -> &DescriptorSetLayout {
        &self.render_result_set_layout
    }

    /// Set sampling the image to present this frame
    pub fn prepare(&mut self, render_result_set: vk::DescriptorSet) {
        self.render_result_set = Some(render_result_set);
    }
}

impl RenderSubsystem for PresentationSubsystem {
    fn record(&mut self, frame: &ActiveFrame) -> Result<()> {
        let set = self
            .render_result_set
            .take()
            .ok_or_else(|| HriError::precondition("Presentation recorded without a render result set"))?;

        set_full_viewport(&self.device, frame);
        self.pipeline.bind(&self.device, frame.command_buffer);
        self.pipeline.bind_descriptor_set(&self.device, frame.command_buffer, 0, set);
        unsafe {
            self.device.cmd_draw(frame.command_buffer, 3, 1, 0, 0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;
    use super::*;

    #[test]
    fn fullscreen_pipeline_has_no_vertex_input() {
        let config = PresentationSubsystem::pipeline_config(vk::RenderPass::from_raw(9));
        assert!(config.vertex_input_bindings.is_empty());
        assert_eq!(config.depth_stencil_state.depth_test_enable, vk::FALSE);
        assert_eq!(config.color_blend_attachments.len(), 1);
        assert!(config
            .validate(&[vk::ShaderStageFlags::VERTEX, vk::ShaderStageFlags::FRAGMENT])
            .is_ok());
    }

    #[test]
    fn render_result_is_sampled_without_wrapping() {
        let config = PresentationSubsystem::sampler_config();
        assert_eq!(config.mag_filter, vk::Filter::LINEAR);
        assert_eq!(config.address_mode_u, vk::SamplerAddressMode::CLAMP_TO_EDGE);
        assert_eq!(config.address_mode_v, vk::SamplerAddressMode::CLAMP_TO_EDGE);
    }
}
