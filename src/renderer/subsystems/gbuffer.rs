use std::mem::{offset_of, size_of};
use std::path::Path;
use std::sync::Arc;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};
use crate::renderer::descriptors::layout::{DescriptorSetLayout, DescriptorSetLayoutBuilder};
use crate::renderer::error::{HriError, Result};
use crate::renderer::frame::frame::ActiveFrame;
use crate::renderer::shaders::ShaderDatabase;
use crate::renderer::shaders::pipeline::{GraphicsPipelineBuilder, PipelineLayoutBuilder};
use crate::renderer::shaders::shader::Shader;
use crate::renderer::subsystems::{set_full_viewport, PipelineBinding, RenderSubsystem};

/// Color targets written by the G-buffer pass: albedo, normal, position
pub const GBUFFER_COLOR_ATTACHMENT_COUNT: usize = 3;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GBufferVertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub tangent: Vec3,
    pub texture_coord: Vec2,
}

impl GBufferVertex {
    pub fn input_binding() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    pub fn input_attributes() -> [vk::VertexInputAttributeDescription; 4] {
        let attribute = |location, format, offset: usize| vk::VertexInputAttributeDescription {
            location,
            binding: 0,
            format,
            offset: offset as u32,
        };
        [
            attribute(0, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, position)),
            attribute(1, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, normal)),
            attribute(2, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, tangent)),
            attribute(3, vk::Format::R32G32_SFLOAT, offset_of!(Self, texture_coord)),
        ]
    }
}

/// One indexed mesh draw; indices are `u32`
#[derive(Debug, Clone, Copy)]
pub struct GBufferDraw {
    pub vertex_buffer: vk::Buffer,
    pub index_buffer: vk::Buffer,
    pub index_count: u32,
    /// Bound at set 1
    pub object_set: vk::DescriptorSet,
}

/// Rasterizes caller-supplied meshes into the G-buffer attachments.
///
/// Draws and the scene descriptor set are handed in through `prepare` every frame and dropped
/// after recording.
pub struct GBufferLayoutSubsystem {
    pipeline: PipelineBinding,
    scene_set: Option<vk::DescriptorSet>,
    draws: Vec<GBufferDraw>,
    scene_set_layout: DescriptorSetLayout,
    object_set_layout: DescriptorSetLayout,
    device: Arc<ash::Device>,
}

impl GBufferLayoutSubsystem {
    pub const PIPELINE_NAME: &'static str = "GBufferLayoutPipeline";
    pub const VERTEX_SHADER: &'static str = "StaticVert";
    pub const FRAGMENT_SHADER: &'static str = "GBufferLayoutFrag";

    pub fn new(
        shader_db: &mut ShaderDatabase,
        render_pass: vk::RenderPass,
        shader_dir: &Path,
    ) -> Result<Self> {
        let device = shader_db.device().clone();

        let scene_set_layout = DescriptorSetLayoutBuilder::new()
            .add_binding(0, vk::DescriptorType::UNIFORM_BUFFER, 1, vk::ShaderStageFlags::VERTEX)
            .build(device.clone())?;
        let object_set_layout = DescriptorSetLayoutBuilder::new()
            .add_binding(0, vk::DescriptorType::UNIFORM_BUFFER, 1, vk::ShaderStageFlags::VERTEX)
            .build(device.clone())?;
        let layout = PipelineLayoutBuilder::new()
            .add_descriptor_set_layout(scene_set_layout.handle)
            .add_descriptor_set_layout(object_set_layout.handle)
            .build(device.clone())?;

        shader_db.register_shader(
            Self::VERTEX_SHADER,
            Shader::load_file(device.clone(), shader_dir.join("static.vert.spv"), vk::ShaderStageFlags::VERTEX)?,
        );
        shader_db.register_shader(
            Self::FRAGMENT_SHADER,
            Shader::load_file(device.clone(), shader_dir.join("gbuffer_layout.frag.spv"), vk::ShaderStageFlags::FRAGMENT)?,
        );
        let pso = shader_db.create_pipeline(
            Self::PIPELINE_NAME,
            &[Self::VERTEX_SHADER, Self::FRAGMENT_SHADER],
            &Self::pipeline_config(render_pass),
            Arc::new(layout),
        )?;

        Ok(Self {
            pipeline: PipelineBinding::from(pso),
            scene_set: None,
            draws: Vec::new(),
            scene_set_layout,
            object_set_layout,
            device,
        })
    }

    /// Pick up a pipeline recreated under the same name
    pub fn refresh_pipeline(&mut self, shader_db: &ShaderDatabase) -> Result<bool> {
        self.pipeline.refresh(shader_db, Self::PIPELINE_NAME)
    }

    pub fn pipeline_config(render_pass: vk::RenderPass) -> GraphicsPipelineBuilder {
        let mut config = GraphicsPipelineBuilder::new(render_pass, 0);
        config
            .add_vertex_binding(GBufferVertex::input_binding())
            .add_dynamic_state(vk::DynamicState::VIEWPORT)
            .add_dynamic_state(vk::DynamicState::SCISSOR);
        for attribute in GBufferVertex::input_attributes() {
            config.add_vertex_attribute(attribute);
        }
        config.rasterization_state = GraphicsPipelineBuilder::init_rasterization_state(
            false,
            vk::PolygonMode::FILL,
            vk::CullModeFlags::NONE,
            vk::FrontFace::COUNTER_CLOCKWISE,
        );
        config.depth_stencil_state =
            GraphicsPipelineBuilder::init_depth_stencil_state(true, true, vk::CompareOp::LESS);
        config.color_blend_attachments =
            vec![GraphicsPipelineBuilder::init_color_blend_attachment_state(false); GBUFFER_COLOR_ATTACHMENT_COUNT];
        config
    }

    pub fn scene_set_layout(&self) -> &DescriptorSetLayout {
        &self.scene_set_layout
    }

    pub fn object_set_layout(&self) -> &DescriptorSetLayout {
        &self.object_set_layout
    }

    /// Hand in this frame's scene set and draw list
    pub fn prepare(&mut self, scene_set: vk::DescriptorSet, draws: Vec<GBufferDraw>) {
        self.scene_set = Some(scene_set);
        self.draws = draws;
    }
}

impl RenderSubsystem for GBufferLayoutSubsystem {
    fn record(&mut self, frame: &ActiveFrame) -> Result<()> {
        let scene_set = self
            .scene_set
            .take()
            .ok_or_else(|| HriError::precondition("G-buffer pass recorded without a scene descriptor set"))?;
        let draws = std::mem::take(&mut self.draws);
        let command_buffer = frame.command_buffer;

        set_full_viewport(&self.device, frame);
        self.pipeline.bind(&self.device, command_buffer);
        self.pipeline.bind_descriptor_set(&self.device, command_buffer, 0, scene_set);

        for draw in &draws {
            self.pipeline.bind_descriptor_set(&self.device, command_buffer, 1, draw.object_set);
            unsafe {
                self.device.cmd_bind_vertex_buffers(command_buffer, 0, &[draw.vertex_buffer], &[0]);
                self.device.cmd_bind_index_buffer(command_buffer, draw.index_buffer, 0, vk::IndexType::UINT32);
                self.device.cmd_draw_indexed(command_buffer, draw.index_count, 1, 0, 0, 0);
            }
        }

        log::trace!("G-buffer pass recorded {} draws", draws.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;
    use super::*;

    #[test]
    fn vertex_layout_matches_struct() {
        assert_eq!(GBufferVertex::input_binding().stride, 44);
        let offsets: Vec<_> = GBufferVertex::input_attributes().iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 12, 24, 36]);
    }

    #[test]
    fn pipeline_config_validates_with_dynamic_viewport() {
        let config = GBufferLayoutSubsystem::pipeline_config(vk::RenderPass::from_raw(7));
        let (viewport, scissor) = config
            .validate(&[vk::ShaderStageFlags::VERTEX, vk::ShaderStageFlags::FRAGMENT])
            .unwrap();

        assert_eq!(viewport.width, 1.0);
        assert_eq!(scissor.extent.width, 1);
        assert_eq!(config.color_blend_attachments.len(), GBUFFER_COLOR_ATTACHMENT_COUNT);
        assert_eq!(config.depth_stencil_state.depth_compare_op, vk::CompareOp::LESS);
    }
}
