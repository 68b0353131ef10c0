pub mod acceleration_structure;
pub mod pipeline;
pub mod sbt;

use ash::vk;

/// Device limits that shape acceleration structure builds and the shader binding table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RayTracingProperties {
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
    pub max_shader_group_stride: u32,
    pub max_ray_recursion_depth: u32,
    pub min_scratch_offset_alignment: u32,
}

impl RayTracingProperties {
    pub fn query(
        instance: &ash::Instance,
        physical: vk::PhysicalDevice,
    ) -> Self {
        let mut pipeline_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut as_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        {
            let mut props2 = vk::PhysicalDeviceProperties2::default()
                .push_next(&mut pipeline_props)
                .push_next(&mut as_props);
            unsafe {
                instance.get_physical_device_properties2(physical, &mut props2);
            }
        }

        Self {
            shader_group_handle_size: pipeline_props.shader_group_handle_size,
            shader_group_handle_alignment: pipeline_props.shader_group_handle_alignment,
            shader_group_base_alignment: pipeline_props.shader_group_base_alignment,
            max_shader_group_stride: pipeline_props.max_shader_group_stride,
            max_ray_recursion_depth: pipeline_props.max_ray_recursion_depth,
            min_scratch_offset_alignment: as_props.min_acceleration_structure_scratch_offset_alignment,
        }
    }
}

/// Ray tracing extension loaders, present only when the context enabled ray tracing
pub struct RayTracingContext {
    pub acceleration_structure: ash::khr::acceleration_structure::Device,
    pub pipeline: ash::khr::ray_tracing_pipeline::Device,
    pub properties: RayTracingProperties,
}

impl RayTracingContext {
    pub fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        physical: vk::PhysicalDevice,
    ) -> Self {
        let properties = RayTracingProperties::query(instance, physical);
        log::info!("Ray tracing enabled: {:?}", properties);

        Self {
            acceleration_structure: ash::khr::acceleration_structure::Device::new(instance, device),
            pipeline: ash::khr::ray_tracing_pipeline::Device::new(instance, device),
            properties,
        }
    }
}
