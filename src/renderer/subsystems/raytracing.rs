use std::sync::Arc;
use ash::khr::ray_tracing_pipeline;
use ash::vk;
use crate::renderer::core::context::RenderContext;
use crate::renderer::error::{HriError, Result};
use crate::renderer::frame::frame::ActiveFrame;
use crate::renderer::raytracing::pipeline::{RayTracingPipelineBuilder, ShaderGroup, ShaderGroupKind};
use crate::renderer::raytracing::sbt::ShaderBindingTable;
use crate::renderer::shaders::ShaderDatabase;
use crate::renderer::shaders::pipeline::PipelineLayout;
use crate::renderer::subsystems::{PipelineBinding, RenderSubsystem};

/// Names of registered shaders making up the ray tracing pipeline
#[derive(Debug, Clone)]
pub struct RayTracingShaders<'a> {
    pub raygen: &'a str,
    pub miss: Vec<&'a str>,
    /// Each becomes a triangle hit group
    pub closest_hit: Vec<&'a str>,
}

/// Dispatches one ray per pixel of the frame over the pipeline's shader binding table
pub struct RayTracingSubsystem {
    pipeline: PipelineBinding,
    descriptor_set: Option<vk::DescriptorSet>,
    sbt: ShaderBindingTable,
    loader: ray_tracing_pipeline::Device,
    device: Arc<ash::Device>,
}

impl RayTracingSubsystem {
    pub const PIPELINE_NAME: &'static str = "RayTracingPipeline";

    pub fn new(
        ctx: &RenderContext,
        shader_db: &mut ShaderDatabase,
        shaders: &RayTracingShaders,
        layout: Arc<PipelineLayout>,
        max_recursion_depth: u32,
    ) -> Result<Self> {
        let ray_tracing = ctx.ray_tracing()?;

        let (pipeline, groups) = {
            let mut builder = RayTracingPipelineBuilder::new();
            let raygen = builder.add_shader_stage(shader_db.get_shader(shaders.raygen)?);
            builder.add_group(ShaderGroup::General(raygen));
            for name in &shaders.miss {
                let stage = builder.add_shader_stage(shader_db.get_shader(name)?);
                builder.add_group(ShaderGroup::General(stage));
            }
            for name in &shaders.closest_hit {
                let stage = builder.add_shader_stage(shader_db.get_shader(name)?);
                builder.add_group(ShaderGroup::TrianglesHit {
                    closest_hit: Some(stage),
                    any_hit: None,
                });
            }
            builder.set_max_recursion_depth(max_recursion_depth);
            builder.build(
                &ray_tracing.pipeline,
                &ray_tracing.properties,
                shader_db.pipeline_cache(),
                layout.handle,
            )?
        };

        let pso = shader_db.register_pipeline(
            Self::PIPELINE_NAME,
            vk::PipelineBindPoint::RAY_TRACING_KHR,
            pipeline,
            layout,
        );
        let pipeline = PipelineBinding::from(pso);
        let sbt = ShaderBindingTable::new(ctx, pipeline.pipeline, &groups)?;

        Ok(Self {
            pipeline,
            descriptor_set: None,
            sbt,
            loader: ray_tracing.pipeline.clone(),
            device: ctx.device.clone(),
        })
    }

    pub fn shader_binding_table(&self) -> &ShaderBindingTable {
        &self.sbt
    }

    /// Set with the TLAS and output image for this frame
    pub fn prepare(&mut self, descriptor_set: vk::DescriptorSet) {
        self.descriptor_set = Some(descriptor_set);
    }
}

impl RenderSubsystem for RayTracingSubsystem {
    fn record(&mut self, frame: &ActiveFrame) -> Result<()> {
        let set = self
            .descriptor_set
            .take()
            .ok_or_else(|| HriError::precondition("Ray tracing recorded without a descriptor set"))?;

        self.pipeline.bind(&self.device, frame.command_buffer);
        self.pipeline.bind_descriptor_set(&self.device, frame.command_buffer, 0, set);
        unsafe {
            self.loader.cmd_trace_rays(
                frame.command_buffer,
                &self.sbt.region(ShaderGroupKind::Raygen),
                &self.sbt.region(ShaderGroupKind::Miss),
                &self.sbt.region(ShaderGroupKind::Hit),
                &self.sbt.region(ShaderGroupKind::Callable),
                frame.extent.width,
                frame.extent.height,
                1,
            );
        }
        Ok(())
    }
}
