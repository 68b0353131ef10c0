use std::ffi::{c_char, CStr};
use ash::vk;
use crate::renderer::core::queue::{resolve_queue_families, QueueCapabilities, ResolvedQueueFamilies};
use crate::renderer::error::{HriError, Result};

/// Physical device chosen for the context together with its queue families
pub struct PhysicalDeviceSelection {
    pub physical: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub families: ResolvedQueueFamilies,
}

impl PhysicalDeviceSelection {
    pub fn name(&self) -> String {
        self.properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "<unnamed device>".to_string())
    }
}

/// Device extensions every context needs, plus the ray tracing set when requested
pub fn required_device_extensions(
    presentable: bool,
    ray_tracing: bool,
    extra: &[&'static CStr],
) -> Vec<&'static CStr> {
    let mut exts = Vec::new();
    if presentable {
        exts.push(ash::khr::swapchain::NAME);
    }
    if ray_tracing {
        exts.extend([
            ash::khr::acceleration_structure::NAME,
            ash::khr::ray_tracing_pipeline::NAME,
            ash::khr::deferred_host_operations::NAME,
        ]);
    }

    #[cfg(target_os = "macos")]
    exts.push(ash::khr::portability_subset::NAME);

    for ext in extra {
        if !exts.contains(ext) {
            exts.push(ext);
        }
    }
    exts
}

/// Lower is better, discrete GPUs first
pub fn device_type_rank(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 0,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        vk::PhysicalDeviceType::CPU => 3,
        vk::PhysicalDeviceType::OTHER => 4,
        _ => 5,
    }
}

pub fn select_physical_device(
    instance: &ash::Instance,
    surface: Option<(vk::SurfaceKHR, &ash::khr::surface::Instance)>,
    required_extensions: &[&'static CStr],
    required_queues: QueueCapabilities,
) -> Result<PhysicalDeviceSelection> {
    let required_queues = QueueCapabilities {
        present: required_queues.present && surface.is_some(),
        ..required_queues
    };
    let physical_devices = unsafe { instance.enumerate_physical_devices()? };

    physical_devices
        .into_iter()
        // Every required extension
        .filter(|device| {
            let supported_extensions = unsafe {
                instance
                    .enumerate_device_extension_properties(*device)
                    .unwrap_or_default()
            };
            required_extensions.iter().all(|req_ext| {
                let supported = supported_extensions
                    .iter()
                    .any(|sup| sup.extension_name_as_c_str().is_ok_and(|name| name == *req_ext));
                if !supported {
                    log::debug!("Device extension not supported: {:?}", req_ext);
                }
                supported
            })
        })
        // Queue families that satisfy the requested capabilities
        .filter_map(|device| {
            let props = unsafe {
                instance.get_physical_device_queue_family_properties(device)
            };
            let families = resolve_queue_families(
                &props,
                |index| match surface {
                    Some((surface, surface_loader)) => unsafe {
                        surface_loader
                            .get_physical_device_surface_support(device, index, surface)
                            .unwrap_or(false)
                    },
                    None => false,
                },
                required_queues,
            )?;
            let properties = unsafe { instance.get_physical_device_properties(device) };
            Some(PhysicalDeviceSelection {
                physical: device,
                properties,
                families,
            })
        })
        .min_by_key(|selection| device_type_rank(selection.properties.device_type))
        .ok_or_else(|| HriError::Unsupported("No suitable physical device found".to_string()))
}

pub fn create_logical_device(
    instance: &ash::Instance,
    selection: &PhysicalDeviceSelection,
    extensions: &[&'static CStr],
    ray_tracing: bool,
) -> Result<ash::Device> {
    let queue_priorities = [1.0];
    let queue_create_infos = selection
        .families
        .unique_families()
        .iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family.index)
                .queue_priorities(&queue_priorities)
        })
        .collect::<Vec<_>>();

    let enabled_extension_names = extensions
        .iter()
        .map(|ext| ext.as_ptr())
        .collect::<Vec<*const c_char>>();

    let features = unsafe {
        instance.get_physical_device_features(selection.physical)
    };
    let mut vulkan12_features = vk::PhysicalDeviceVulkan12Features::default()
        .buffer_device_address(true)
        .descriptor_indexing(true)
        .runtime_descriptor_array(true)
        .descriptor_binding_partially_bound(true)
        .descriptor_binding_variable_descriptor_count(true);
    let mut vulkan13_features = vk::PhysicalDeviceVulkan13Features::default()
        .synchronization2(true);
    let mut acceleration_structure_features =
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
            .acceleration_structure(true);
    let mut ray_tracing_pipeline_features =
        vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default()
            .ray_tracing_pipeline(true);

    let mut device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&enabled_extension_names)
        .enabled_features(&features)
        .push_next(&mut vulkan12_features)
        .push_next(&mut vulkan13_features);
    if ray_tracing {
        device_create_info = device_create_info
            .push_next(&mut acceleration_structure_features)
            .push_next(&mut ray_tracing_pipeline_features);
    }

    Ok(unsafe {
        instance.create_device(selection.physical, &device_create_info, None)?
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discrete_devices_rank_first() {
        let mut types = [
            vk::PhysicalDeviceType::CPU,
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            vk::PhysicalDeviceType::DISCRETE_GPU,
        ];
        types.sort_by_key(|t| device_type_rank(*t));
        assert_eq!(types[0], vk::PhysicalDeviceType::DISCRETE_GPU);
        assert_eq!(types[2], vk::PhysicalDeviceType::CPU);
    }

    #[test]
    fn ray_tracing_adds_its_extensions_once() {
        let exts = required_device_extensions(
            true,
            true,
            &[ash::khr::acceleration_structure::NAME],
        );
        assert!(exts.contains(&ash::khr::swapchain::NAME));
        assert!(exts.contains(&ash::khr::ray_tracing_pipeline::NAME));
        assert_eq!(
            exts.iter().filter(|e| **e == ash::khr::acceleration_structure::NAME).count(),
            1,
        );

        let headless = required_device_extensions(false, false, &[]);
        assert!(!headless.contains(&ash::khr::swapchain::NAME));
    }
}
