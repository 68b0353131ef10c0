use std::sync::Arc;
use ash::vk;
use crate::renderer::error::{HriError, Result};
use crate::renderer::shaders::shader::Shader;

pub const DEFAULT_VIEWPORT_MIN_DEPTH: f32 = 0.0;
pub const DEFAULT_VIEWPORT_MAX_DEPTH: f32 = 1.0;

/// Owned pipeline layout, shared by the pipelines created with it
pub struct PipelineLayout {
    pub handle: vk::PipelineLayout,
    device: Arc<ash::Device>,
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline_layout(self.handle, None);
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct PipelineLayoutBuilder {
    set_layouts: Vec<vk::DescriptorSetLayout>,
    push_constant_ranges: Vec<vk::PushConstantRange>,
}

impl PipelineLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_descriptor_set_layout(&mut self, layout: vk::DescriptorSetLayout) -> &mut Self {
        self.set_layouts.push(layout);
        self
    }

    pub fn add_push_constant_range(
        &mut self,
        stages: vk::ShaderStageFlags,
        offset: u32,
        size: u32,
    ) -> &mut Self {
        self.push_constant_ranges.push(vk::PushConstantRange {
            stage_flags: stages,
            offset,
            size,
        });
        self
    }

    pub fn validate(&self) -> Result<()> {
        for range in &self.push_constant_ranges {
            if range.stage_flags.is_empty() {
                return Err(HriError::precondition("Push constant range has no shader stages"));
            }
            if range.size == 0 || range.size % 4 != 0 || range.offset % 4 != 0 {
                return Err(HriError::precondition(format!(
                    "Push constant range (offset {}, size {}) must be non-empty and 4-byte aligned",
                    range.offset,
                    range.size,
                )));
            }
        }
        Ok(())
    }

    pub fn build(&self, device: Arc<ash::Device>) -> Result<PipelineLayout> {
        self.validate()?;

        let create_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&self.set_layouts)
            .push_constant_ranges(&self.push_constant_ranges);
        let handle = unsafe {
            device.create_pipeline_layout(&create_info, None)?
        };

        Ok(PipelineLayout { handle, device })
    }
}

/// Fixed-function state of a graphics pipeline.
///
/// Viewport and scissor may be left unset when they are dynamic state; a 1x1 placeholder
/// is used at build time in that case.
#[derive(Debug, Clone)]
pub struct GraphicsPipelineBuilder {
    pub vertex_input_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_input_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub input_assembly_state: vk::PipelineInputAssemblyStateCreateInfo<'static>,
    pub viewport: Option<vk::Viewport>,
    pub scissor: Option<vk::Rect2D>,
    pub rasterization_state: vk::PipelineRasterizationStateCreateInfo<'static>,
    pub multisample_state: vk::PipelineMultisampleStateCreateInfo<'static>,
    pub depth_stencil_state: vk::PipelineDepthStencilStateCreateInfo<'static>,
    pub color_blend_attachments: Vec<vk::PipelineColorBlendAttachmentState>,
    pub dynamic_states: Vec<vk::DynamicState>,
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
}

impl Default for GraphicsPipelineBuilder {
    fn default() -> Self {
        Self {
            vertex_input_bindings: Vec::new(),
            vertex_input_attributes: Vec::new(),
            input_assembly_state: Self::init_input_assembly_state(vk::PrimitiveTopology::TRIANGLE_LIST, false),
            viewport: None,
            scissor: None,
            rasterization_state: Self::init_rasterization_state(
                false,
                vk::PolygonMode::FILL,
                vk::CullModeFlags::BACK,
                vk::FrontFace::COUNTER_CLOCKWISE,
            ),
            multisample_state: Self::init_multisample_state(vk::SampleCountFlags::TYPE_1),
            depth_stencil_state: Self::init_depth_stencil_state(false, false, vk::CompareOp::ALWAYS),
            color_blend_attachments: vec![Self::init_color_blend_attachment_state(false)],
            dynamic_states: Vec::new(),
            render_pass: vk::RenderPass::null(),
            subpass: 0,
        }
    }
}

impl GraphicsPipelineBuilder {
    pub fn new(render_pass: vk::RenderPass, subpass: u32) -> Self {
        Self {
            render_pass,
            subpass,
            ..Default::default()
        }
    }

    pub fn init_input_assembly_state(
        topology: vk::PrimitiveTopology,
        primitive_restart: bool,
    ) -> vk::PipelineInputAssemblyStateCreateInfo<'static> {
        vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(topology)
            .primitive_restart_enable(primitive_restart)
    }

    /// Viewport covering `width` x `height` with the default depth range
    pub fn init_default_viewport(width: f32, height: f32) -> vk::Viewport {
        vk::Viewport {
            x: 0.0,
            y: 0.0,
            width,
            height,
            min_depth: DEFAULT_VIEWPORT_MIN_DEPTH,
            max_depth: DEFAULT_VIEWPORT_MAX_DEPTH,
        }
    }

    pub fn init_default_scissor(width: u32, height: u32) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D { width, height },
        }
    }

    pub fn init_rasterization_state(
        discard: bool,
        polygon_mode: vk::PolygonMode,
        cull_mode: vk::CullModeFlags,
        front_face: vk::FrontFace,
    ) -> vk::PipelineRasterizationStateCreateInfo<'static> {
        vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(discard)
            .polygon_mode(polygon_mode)
            .line_width(1.0)
            .cull_mode(cull_mode)
            .front_face(front_face)
            .depth_bias_enable(false)
    }

    pub fn init_multisample_state(
        samples: vk::SampleCountFlags,
    ) -> vk::PipelineMultisampleStateCreateInfo<'static> {
        vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(samples)
            .sample_shading_enable(false)
            .min_sample_shading(1.0)
    }

    pub fn init_depth_stencil_state(
        depth_test: bool,
        depth_write: bool,
        compare_op: vk::CompareOp,
    ) -> vk::PipelineDepthStencilStateCreateInfo<'static> {
        vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(depth_test)
            .depth_write_enable(depth_write)
            .depth_compare_op(compare_op)
            .depth_bounds_test_enable(false)
            .min_depth_bounds(0.0)
            .max_depth_bounds(1.0)
            .stencil_test_enable(false)
    }

    /// Alpha blending when `blend` is set, plain overwrite otherwise
    pub fn init_color_blend_attachment_state(blend: bool) -> vk::PipelineColorBlendAttachmentState {
        vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(blend)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
            .alpha_blend_op(vk::BlendOp::ADD)
    }

    pub fn add_vertex_binding(&mut self, binding: vk::VertexInputBindingDescription) -> &mut Self {
        self.vertex_input_bindings.push(binding);
        self
    }

    pub fn add_vertex_attribute(&mut self, attribute: vk::VertexInputAttributeDescription) -> &mut Self {
        self.vertex_input_attributes.push(attribute);
        self
    }

    pub fn set_viewport(&mut self, viewport: vk::Viewport) -> &mut Self {
        self.viewport = Some(viewport);
        self
    }

    pub fn set_scissor(&mut self, scissor: vk::Rect2D) -> &mut Self {
        self.scissor = Some(scissor);
        self
    }

    pub fn add_dynamic_state(&mut self, state: vk::DynamicState) -> &mut Self {
        if !self.dynamic_states.contains(&state) {
            self.dynamic_states.push(state);
        }
        self
    }

    /// Check the builder against the stages it will be built with and resolve viewport/scissor
    pub fn validate(&self, stages: &[vk::ShaderStageFlags]) -> Result<(vk::Viewport, vk::Rect2D)> {
        if stages.is_empty() {
            return Err(HriError::precondition("Graphics pipeline needs at least one shader stage"));
        }
        if !stages.contains(&vk::ShaderStageFlags::VERTEX) {
            return Err(HriError::precondition("Graphics pipeline has no vertex stage"));
        }
        if let Some(stage) = stages.iter().find(|s| !is_graphics_stage(**s)) {
            return Err(HriError::precondition(format!(
                "Stage {stage:?} cannot be used in a graphics pipeline",
            )));
        }
        if self.render_pass == vk::RenderPass::null() {
            return Err(HriError::precondition("Graphics pipeline has no render pass"));
        }

        for attribute in &self.vertex_input_attributes {
            if !self.vertex_input_bindings.iter().any(|b| b.binding == attribute.binding) {
                return Err(HriError::precondition(format!(
                    "Vertex attribute at location {} uses undeclared binding {}",
                    attribute.location,
                    attribute.binding,
                )));
            }
        }

        let viewport = match self.viewport {
            Some(viewport) => viewport,
            None if self.dynamic_states.contains(&vk::DynamicState::VIEWPORT) => {
                Self::init_default_viewport(1.0, 1.0)
            }
            None => {
                return Err(HriError::precondition(
                    "Viewport is neither set nor dynamic, use init_default_viewport",
                ));
            }
        };
        let scissor = match self.scissor {
            Some(scissor) => scissor,
            None if self.dynamic_states.contains(&vk::DynamicState::SCISSOR) => {
                Self::init_default_scissor(1, 1)
            }
            None => {
                return Err(HriError::precondition(
                    "Scissor is neither set nor dynamic, use init_default_scissor",
                ));
            }
        };

        Ok((viewport, scissor))
    }

    pub fn build(
        &self,
        device: &ash::Device,
        pipeline_cache: vk::PipelineCache,
        shaders: &[&Shader],
        layout: vk::PipelineLayout,
    ) -> Result<vk::Pipeline> {
        let stage_flags: Vec<_> = shaders.iter().map(|s| s.stage).collect();
        let (viewport, scissor) = self.validate(&stage_flags)?;

        let stages: Vec<_> = shaders.iter().map(|s| s.stage_info()).collect();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&self.vertex_input_bindings)
            .vertex_attribute_descriptions(&self.vertex_input_attributes);
        let viewports = [viewport];
        let scissors = [scissor];
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewports(&viewports)
            .scissors(&scissors);
        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .logic_op(vk::LogicOp::COPY)
            .attachments(&self.color_blend_attachments);
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::default()
            .dynamic_states(&self.dynamic_states);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&self.input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&self.rasterization_state)
            .multisample_state(&self.multisample_state)
            .depth_stencil_state(&self.depth_stencil_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(self.render_pass)
            .subpass(self.subpass);

        let pipelines = unsafe {
            device
                .create_graphics_pipelines(pipeline_cache, &[pipeline_info], None)
                .map_err(|(_, err)| err)?
        };
        pipelines
            .first()
            .copied()
            .ok_or_else(|| HriError::precondition("Driver returned no graphics pipeline"))
    }
}

fn is_graphics_stage(stage: vk::ShaderStageFlags) -> bool {
    vk::ShaderStageFlags::ALL_GRAPHICS.contains(stage)
}

/// Compute pipeline for a single compute shader
pub fn build_compute_pipeline(
    device: &ash::Device,
    pipeline_cache: vk::PipelineCache,
    shader: &Shader,
    layout: vk::PipelineLayout,
) -> Result<vk::Pipeline> {
    if shader.stage != vk::ShaderStageFlags::COMPUTE {
        return Err(HriError::precondition(format!(
            "Compute pipeline needs a compute shader, got {:?}",
            shader.stage,
        )));
    }

    let pipeline_info = vk::ComputePipelineCreateInfo::default()
        .stage(shader.stage_info())
        .layout(layout);
    let pipelines = unsafe {
        device
            .create_compute_pipelines(pipeline_cache, &[pipeline_info], None)
            .map_err(|(_, err)| err)?
    };
    pipelines
        .first()
        .copied()
        .ok_or_else(|| HriError::precondition("Driver returned no compute pipeline"))
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;
    use super::*;

    const VERTEX_FRAGMENT: [vk::ShaderStageFlags; 2] =
        [vk::ShaderStageFlags::VERTEX, vk::ShaderStageFlags::FRAGMENT];

    fn builder() -> GraphicsPipelineBuilder {
        GraphicsPipelineBuilder::new(vk::RenderPass::from_raw(3), 0)
    }

    #[test]
    fn unset_viewport_requires_dynamic_state() {
        let mut builder = builder();
        assert!(builder.validate(&VERTEX_FRAGMENT).is_err());

        builder
            .add_dynamic_state(vk::DynamicState::VIEWPORT)
            .add_dynamic_state(vk::DynamicState::SCISSOR);
        let (viewport, scissor) = builder.validate(&VERTEX_FRAGMENT).unwrap();
        assert_eq!(viewport.width, 1.0);
        assert_eq!(scissor.extent.width, 1);
    }

    #[test]
    fn explicit_viewport_is_kept() {
        let mut builder = builder();
        builder
            .set_viewport(GraphicsPipelineBuilder::init_default_viewport(800.0, 600.0))
            .set_scissor(GraphicsPipelineBuilder::init_default_scissor(800, 600));
        let (viewport, scissor) = builder.validate(&VERTEX_FRAGMENT).unwrap();
        assert_eq!(viewport.height, 600.0);
        assert_eq!(viewport.max_depth, DEFAULT_VIEWPORT_MAX_DEPTH);
        assert_eq!(scissor.extent.height, 600);
    }

    #[test]
    fn stages_are_checked() {
        let mut builder = builder();
        builder
            .set_viewport(GraphicsPipelineBuilder::init_default_viewport(1.0, 1.0))
            .set_scissor(GraphicsPipelineBuilder::init_default_scissor(1, 1));

        assert!(builder.validate(&[]).is_err());
        assert!(builder.validate(&[vk::ShaderStageFlags::FRAGMENT]).is_err());
        assert!(builder
            .validate(&[vk::ShaderStageFlags::VERTEX, vk::ShaderStageFlags::COMPUTE])
            .is_err());
        assert!(builder.validate(&[vk::ShaderStageFlags::VERTEX]).is_ok());
    }

    #[test]
    fn render_pass_and_vertex_bindings_are_checked() {
        let mut builder = GraphicsPipelineBuilder::default();
        builder
            .add_dynamic_state(vk::DynamicState::VIEWPORT)
            .add_dynamic_state(vk::DynamicState::SCISSOR);
        assert!(builder.validate(&VERTEX_FRAGMENT).is_err());

        builder.render_pass = vk::RenderPass::from_raw(1);
        builder.add_vertex_attribute(vk::VertexInputAttributeDescription {
            location: 0,
            binding: 1,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: 0,
        });
        assert!(builder.validate(&VERTEX_FRAGMENT).is_err());

        builder.add_vertex_binding(vk::VertexInputBindingDescription {
            binding: 1,
            stride: 12,
            input_rate: vk::VertexInputRate::VERTEX,
        });
        assert!(builder.validate(&VERTEX_FRAGMENT).is_ok());
    }

    #[test]
    fn dynamic_states_are_deduplicated() {
        let mut builder = builder();
        builder
            .add_dynamic_state(vk::DynamicState::VIEWPORT)
            .add_dynamic_state(vk::DynamicState::VIEWPORT);
        assert_eq!(builder.dynamic_states.len(), 1);
    }

    #[test]
    fn push_constant_ranges_must_be_aligned() {
        let mut layout = PipelineLayoutBuilder::new();
        layout.add_push_constant_range(vk::ShaderStageFlags::VERTEX, 0, 64);
        assert!(layout.validate().is_ok());

        layout.add_push_constant_range(vk::ShaderStageFlags::FRAGMENT, 64, 6);
        assert!(layout.validate().is_err());

        let mut layout = PipelineLayoutBuilder::new();
        layout.add_push_constant_range(vk::ShaderStageFlags::empty(), 0, 16);
        assert!(layout.validate().is_err());
    }
}
