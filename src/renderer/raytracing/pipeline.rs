use ash::khr::ray_tracing_pipeline;
use ash::vk;
use crate::renderer::error::{HriError, Result};
use crate::renderer::raytracing::RayTracingProperties;
use crate::renderer::shaders::shader::Shader;

/// Shader group referencing stage indices of the builder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderGroup {
    /// Raygen, miss or callable stage
    General(u32),
    TrianglesHit {
        closest_hit: Option<u32>,
        any_hit: Option<u32>,
    },
    ProceduralHit {
        intersection: u32,
        closest_hit: Option<u32>,
        any_hit: Option<u32>,
    },
}

/// Which table region a group's handle belongs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderGroupKind {
    Raygen,
    Miss,
    Hit,
    Callable,
}

/// Group indices of a pipeline, grouped per region in creation order
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShaderGroupLayout {
    pub raygen: Vec<u32>,
    pub miss: Vec<u32>,
    pub hit: Vec<u32>,
    pub callable: Vec<u32>,
}

impl ShaderGroupLayout {
    pub fn groups(&self, kind: ShaderGroupKind) -> &[u32] {
        match kind {
            ShaderGroupKind::Raygen => &self.raygen,
            ShaderGroupKind::Miss => &self.miss,
            ShaderGroupKind::Hit => &self.hit,
            ShaderGroupKind::Callable => &self.callable,
        }
    }

    pub fn group_count(&self) -> usize {
        self.raygen.len() + self.miss.len() + self.hit.len() + self.callable.len()
    }
}

#[derive(Default)]
pub struct RayTracingPipelineBuilder<'s> {
    stages: Vec<&'s Shader>,
    groups: Vec<ShaderGroup>,
    max_recursion_depth: u32,
    dynamic_states: Vec<vk::DynamicState>,
    flags: vk::PipelineCreateFlags,
}

impl<'s> RayTracingPipelineBuilder<'s> {
    pub fn new() -> Self {
        Self {
            max_recursion_depth: 1,
            ..Default::default()
        }
    }

    /// Returns the stage index used by groups
    pub fn add_shader_stage(&mut self, shader: &'s Shader) -> u32 {
        self.stages.push(shader);
        (self.stages.len() - 1) as u32
    }

    pub fn add_group(&mut self, group: ShaderGroup) -> &mut Self {
        self.groups.push(group);
        self
    }

    pub fn set_max_recursion_depth(&mut self, depth: u32) -> &mut Self {
        self.max_recursion_depth = depth;
        self
    }

    pub fn add_dynamic_state(&mut self, state: vk::DynamicState) -> &mut Self {
        if !self.dynamic_states.contains(&state) {
            self.dynamic_states.push(state);
        }
        self
    }

    pub fn set_flags(&mut self, flags: vk::PipelineCreateFlags) -> &mut Self {
        self.flags = flags;
        self
    }

    fn stage_flags(&self, index: u32) -> Result<vk::ShaderStageFlags> {
        self.stages
            .get(index as usize)
            .map(|shader| shader.stage)
            .ok_or_else(|| HriError::precondition(format!(
                "Shader group references stage {index} but only {} stages were added",
                self.stages.len(),
            )))
    }

    fn expect_stage(&self, index: u32, expected: vk::ShaderStageFlags) -> Result<()> {
        let stage = self.stage_flags(index)?;
        if stage != expected {
            return Err(HriError::precondition(format!(
                "Stage {index} is {stage:?} where {expected:?} was expected",
            )));
        }
        Ok(())
    }

    fn expect_optional(&self, index: Option<u32>, expected: vk::ShaderStageFlags) -> Result<()> {
        match index {
            Some(index) => self.expect_stage(index, expected),
            None => Ok(()),
        }
    }

    /// Check groups against their stages and sort them into table regions
    pub fn validate(&self, properties: &RayTracingProperties) -> Result<ShaderGroupLayout> {
        if self.max_recursion_depth > properties.max_ray_recursion_depth {
            return Err(HriError::DeviceLimit(format!(
                "Ray recursion depth {} exceeds the device limit of {}",
                self.max_recursion_depth,
                properties.max_ray_recursion_depth,
            )));
        }

        let mut layout = ShaderGroupLayout::default();
        for (group_index, group) in self.groups.iter().enumerate() {
            let group_index = group_index as u32;
            match *group {
                ShaderGroup::General(stage) => {
                    let flags = self.stage_flags(stage)?;
                    if flags == vk::ShaderStageFlags::RAYGEN_KHR {
                        layout.raygen.push(group_index);
                    } else if flags == vk::ShaderStageFlags::MISS_KHR {
                        layout.miss.push(group_index);
                    } else if flags == vk::ShaderStageFlags::CALLABLE_KHR {
                        layout.callable.push(group_index);
                    } else {
                        return Err(HriError::precondition(format!(
                            "General group {group_index} uses a {flags:?} stage",
                        )));
                    }
                }
                ShaderGroup::TrianglesHit { closest_hit, any_hit } => {
                    if closest_hit.is_none() && any_hit.is_none() {
                        return Err(HriError::precondition(format!(
                            "Hit group {group_index} has no shaders",
                        )));
                    }
                    self.expect_optional(closest_hit, vk::ShaderStageFlags::CLOSEST_HIT_KHR)?;
                    self.expect_optional(any_hit, vk::ShaderStageFlags::ANY_HIT_KHR)?;
                    layout.hit.push(group_index);
                }
                ShaderGroup::ProceduralHit { intersection, closest_hit, any_hit } => {
                    self.expect_stage(intersection, vk::ShaderStageFlags::INTERSECTION_KHR)?;
                    self.expect_optional(closest_hit, vk::ShaderStageFlags::CLOSEST_HIT_KHR)?;
                    self.expect_optional(any_hit, vk::ShaderStageFlags::ANY_HIT_KHR)?;
                    layout.hit.push(group_index);
                }
            }
        }

        if layout.raygen.is_empty() {
            return Err(HriError::precondition("Ray tracing pipeline has no raygen group"));
        }
        Ok(layout)
    }

    pub fn build(
        &self,
        loader: &ray_tracing_pipeline::Device,
        properties: &RayTracingProperties,
        cache: vk::PipelineCache,
        layout: vk::PipelineLayout,
    ) -> Result<(vk::Pipeline, ShaderGroupLayout)> {
        let group_layout = self.validate(properties)?;

        let stages: Vec<_> = self.stages.iter().map(|shader| shader.stage_info()).collect();
        let groups: Vec<_> = self.groups.iter().map(group_create_info).collect();
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::default()
            .dynamic_states(&self.dynamic_states);

        let create_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .flags(self.flags)
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(self.max_recursion_depth)
            .dynamic_state(&dynamic_state)
            .layout(layout);

        let pipeline = unsafe {
            loader
                .create_ray_tracing_pipelines(
                    vk::DeferredOperationKHR::null(),
                    cache,
                    std::slice::from_ref(&create_info),
                    None,
                )
                .map_err(|(_, err)| err)?
        }
        .into_iter()
        .next()
        .ok_or_else(|| HriError::precondition("No ray tracing pipeline returned"))?;

        log::debug!(
            "Created ray tracing pipeline with {} stages and {} groups",
            stages.len(),
            groups.len(),
        );

        Ok((pipeline, group_layout))
    }
}

fn group_create_info(group: &ShaderGroup) -> vk::RayTracingShaderGroupCreateInfoKHR<'static> {
    let unused = vk::SHADER_UNUSED_KHR;
    let (ty, general, closest, any, intersection) = match *group {
        ShaderGroup::General(stage) => (
            vk::RayTracingShaderGroupTypeKHR::GENERAL,
            stage,
            unused,
            unused,
            unused,
        ),
        ShaderGroup::TrianglesHit { closest_hit, any_hit } => (
            vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP,
            unused,
            closest_hit.unwrap_or(unused),
            any_hit.unwrap_or(unused),
            unused,
        ),
        ShaderGroup::ProceduralHit { intersection, closest_hit, any_hit } => (
            vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP,
            unused,
            closest_hit.unwrap_or(unused),
            any_hit.unwrap_or(unused),
            intersection,
        ),
    };

    vk::RayTracingShaderGroupCreateInfoKHR::default()
        .ty(ty)
        .general_shader(general)
        .closest_hit_shader(closest)
        .any_hit_shader(any)
        .intersection_shader(intersection)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties() -> RayTracingProperties {
        RayTracingProperties {
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 32,
            shader_group_base_alignment: 64,
            max_shader_group_stride: 4096,
            max_ray_recursion_depth: 4,
            min_scratch_offset_alignment: 128,
        }
    }

    #[test]
    fn unused_group_slots_are_marked() {
        let info = group_create_info(&ShaderGroup::TrianglesHit {
            closest_hit: Some(3),
            any_hit: None,
        });
        assert_eq!(info.ty, vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP);
        assert_eq!(info.general_shader, vk::SHADER_UNUSED_KHR);
        assert_eq!(info.closest_hit_shader, 3);
        assert_eq!(info.any_hit_shader, vk::SHADER_UNUSED_KHR);

        let info = group_create_info(&ShaderGroup::ProceduralHit {
            intersection: 5,
            closest_hit: None,
            any_hit: Some(6),
        });
        assert_eq!(info.intersection_shader, 5);
        assert_eq!(info.any_hit_shader, 6);
    }

    #[test]
    fn recursion_depth_is_checked_against_device() {
        let mut builder = RayTracingPipelineBuilder::new();
        builder.set_max_recursion_depth(8);
        assert!(matches!(
            builder.validate(&properties()),
            Err(HriError::DeviceLimit(_)),
        ));
    }

    #[test]
    fn pipeline_without_raygen_is_rejected() {
        let builder = RayTracingPipelineBuilder::new();
        assert!(matches!(
            builder.validate(&properties()),
            Err(HriError::Precondition(_)),
        ));
    }

    #[test]
    fn group_with_missing_stage_is_rejected() {
        let mut builder = RayTracingPipelineBuilder::new();
        builder.add_group(ShaderGroup::General(0));
        assert!(builder.validate(&properties()).is_err());
    }

    #[test]
    fn empty_hit_group_is_rejected() {
        let mut builder = RayTracingPipelineBuilder::new();
        builder.add_group(ShaderGroup::TrianglesHit {
            closest_hit: None,
            any_hit: None,
        });
        assert!(builder.validate(&properties()).is_err());
    }

    #[test]
    fn dynamic_states_are_deduplicated() {
        let mut builder = RayTracingPipelineBuilder::new();
        builder
            .add_dynamic_state(vk::DynamicState::RAY_TRACING_PIPELINE_STACK_SIZE_KHR)
            .add_dynamic_state(vk::DynamicState::RAY_TRACING_PIPELINE_STACK_SIZE_KHR);
        assert_eq!(builder.dynamic_states.len(), 1);
    }

    #[test]
    fn layout_lookup_by_kind() {
        let layout = ShaderGroupLayout {
            raygen: vec![0],
            miss: vec![1, 2],
            hit: vec![3],
            callable: vec![],
        };
        assert_eq!(layout.groups(ShaderGroupKind::Miss), &[1, 2]);
        assert_eq!(layout.group_count(), 4);
    }
}
