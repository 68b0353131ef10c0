use std::ffi::CStr;
use std::sync::{Arc, Mutex};
use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use crate::renderer::config::{PresentSetup, VSyncMode};
use crate::renderer::core::device::{self, PhysicalDeviceSelection};
use crate::renderer::core::instance::{RenderInstance, SurfaceCreateFunc};
use crate::renderer::core::queue::{Queue, QueueCapabilities, RenderContextQueueState};
use crate::renderer::core::swapchain::{Surface, Swapchain};
use crate::renderer::error::{HriError, Result};
use crate::renderer::raytracing::RayTracingContext;
use crate::renderer::resources::buffer::{BufferCreateInfo, BufferResource};
use crate::renderer::resources::image::{ImageCreateInfo, ImageResource};
use crate::renderer::resources::sampler::{ImageSampler, SamplerConfig};

pub struct RenderContextCreateInfo {
    pub app_name: String,
    pub app_version: u32,
    /// `None` creates a headless context without a swapchain
    pub surface_create_func: Option<SurfaceCreateFunc>,
    pub initial_extent: vk::Extent2D,
    pub vsync_mode: VSyncMode,
    pub instance_extensions: Vec<&'static CStr>,
    pub device_extensions: Vec<&'static CStr>,
    pub required_queues: QueueCapabilities,
    pub enable_ray_tracing: bool,
}

impl Default for RenderContextCreateInfo {
    fn default() -> Self {
        Self {
            app_name: "hri".to_string(),
            app_version: vk::make_api_version(0, 0, 1, 0),
            surface_create_func: None,
            initial_extent: vk::Extent2D { width: 1280, height: 720 },
            vsync_mode: VSyncMode::default(),
            instance_extensions: Vec::new(),
            device_extensions: Vec::new(),
            required_queues: QueueCapabilities::default(),
            enable_ray_tracing: false,
        }
    }
}

/// Destroys the logical device once everything allocated from it is gone
struct DeviceOwner(Arc<ash::Device>);

impl Drop for DeviceOwner {
    fn drop(&mut self) {
        if Arc::strong_count(&self.0) > 2 {
            log::warn!("Destroying device while {} handles are still alive", Arc::strong_count(&self.0) - 2);
        }
        unsafe {
            self.0.destroy_device(None);
        }
    }
}

/// Owns the instance, device, queues, memory allocator and swapchain.
///
/// Every resource created from the context has to be dropped before the context itself.
pub struct RenderContext {
    // Field order is drop order
    swapchain: Option<Swapchain>,
    ray_tracing: Option<RayTracingContext>,
    memory_allocator: Arc<Mutex<Allocator>>,
    pub device: Arc<ash::Device>,
    device_owner: DeviceOwner,
    surface: Option<Surface>,
    instance: RenderInstance,

    pub physical: vk::PhysicalDevice,
    pub device_properties: vk::PhysicalDeviceProperties,
    pub queues: RenderContextQueueState,
    surface_extent: vk::Extent2D,
    vsync_mode: VSyncMode,
}

impl RenderContext {
    pub fn new(create_info: RenderContextCreateInfo) -> Result<Self> {
        let instance = RenderInstance::new(
            &create_info.app_name,
            create_info.app_version,
            &create_info.instance_extensions,
        )?;

        let surface = match create_info.surface_create_func {
            Some(create_surface) => Some(Surface {
                handle: create_surface(&instance.entry, &instance.instance)?,
                loader: ash::khr::surface::Instance::new(&instance.entry, &instance.instance),
            }),
            None => None,
        };

        let extensions = device::required_device_extensions(
            surface.is_some(),
            create_info.enable_ray_tracing,
            &create_info.device_extensions,
        );
        let selection = device::select_physical_device(
            &instance.instance,
            surface.as_ref().map(|s| (s.handle, &s.loader)),
            &extensions,
            create_info.required_queues,
        )?;
        log::info!(
            "Selected {} (graphics family {}, compute family {}, transfer family {})",
            selection.name(),
            selection.families.graphics.index,
            selection.families.compute.index,
            selection.families.transfer.index,
        );

        let logical_device = device::create_logical_device(
            &instance.instance,
            &selection,
            &extensions,
            create_info.enable_ray_tracing,
        )?;
        let device = Arc::new(logical_device);
        let device_owner = DeviceOwner(device.clone());
        let queues = RenderContextQueueState::new(&device, &selection.families);

        let memory_allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.instance.clone(),
            device: (*device).clone(),
            physical_device: selection.physical,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })?;

        let ray_tracing = create_info.enable_ray_tracing.then(|| {
            RayTracingContext::new(&instance.instance, &device, selection.physical)
        });

        let PhysicalDeviceSelection {
            physical,
            properties,
            ..
        } = selection;

        let mut ctx = Self {
            swapchain: None,
            ray_tracing,
            memory_allocator: Arc::new(Mutex::new(memory_allocator)),
            device,
            device_owner,
            surface,
            instance,

            physical,
            device_properties: properties,
            queues,
            surface_extent: create_info.initial_extent,
            vsync_mode: create_info.vsync_mode,
        };

        if ctx.surface.is_some() {
            ctx.swapchain = Some(ctx.build_swapchain(None)?);
        }

        Ok(ctx)
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance.instance
    }

    pub fn memory_allocator(&self) -> Arc<Mutex<Allocator>> {
        self.memory_allocator.clone()
    }

    pub fn swapchain(&self) -> Result<&Swapchain> {
        self.swapchain
            .as_ref()
            .ok_or_else(|| HriError::precondition("Context was created without a surface"))
    }

    pub fn ray_tracing(&self) -> Result<&RayTracingContext> {
        self.ray_tracing
            .as_ref()
            .ok_or_else(|| HriError::precondition("Ray tracing was not enabled for this context"))
    }

    pub fn present_queue(&self) -> &Queue {
        self.queues.present.as_ref().unwrap_or(&self.queues.graphics)
    }

    pub fn vsync_mode(&self) -> VSyncMode {
        self.vsync_mode
    }

    /// Window size used when the surface does not dictate the swapchain extent
    pub fn set_surface_extent(&mut self, extent: vk::Extent2D) {
        self.surface_extent = extent;
    }

    pub fn surface_extent(&self) -> vk::Extent2D {
        self.surface_extent
    }

    pub fn swap_present_setup(&self) -> Result<PresentSetup> {
        let surface = self
            .surface
            .as_ref()
            .ok_or_else(|| HriError::precondition("Context was created without a surface"))?;
        surface.present_setup(self.physical, self.vsync_mode)
    }

    /// Recreate the swapchain for the current surface state.
    ///
    /// Returns `false` while the surface has no area (e.g. a minimised window); the old
    /// swapchain is kept in that case.
    pub fn recreate_swapchain(&mut self) -> Result<bool> {
        self.wait_idle()?;

        let old = self.swapchain.take();
        match self.build_swapchain(old.as_ref()) {
            Ok(swapchain) => {
                drop(old);
                self.swapchain = Some(swapchain);
                Ok(true)
            }
            Err(HriError::SwapchainOutOfDate) => {
                self.swapchain = old;
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    pub fn set_vsync_mode(&mut self, vsync_mode: VSyncMode) -> Result<bool> {
        if self.vsync_mode == vsync_mode {
            return Ok(false);
        }
        self.vsync_mode = vsync_mode;
        self.recreate_swapchain()
    }

    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }

    pub fn create_buffer(&self, create_info: &BufferCreateInfo) -> Result<BufferResource> {
        BufferResource::new(
            create_info,
            self.memory_allocator.clone(),
            self.device.clone(),
        )
    }

    pub fn create_image(&self, create_info: &ImageCreateInfo) -> Result<ImageResource> {
        ImageResource::new(
            create_info,
            self.memory_allocator.clone(),
            self.device.clone(),
        )
    }

    pub fn create_sampler(&self, config: SamplerConfig) -> Result<ImageSampler> {
        ImageSampler::new(config, self.device.clone())
    }

    fn build_swapchain(&self, old: Option<&Swapchain>) -> Result<Swapchain> {
        let surface = self
            .surface
            .as_ref()
            .ok_or_else(|| HriError::precondition("Context was created without a surface"))?;
        let surface_format = match old {
            Some(old) => old.surface_format(),
            None => surface.select_format(self.physical)?,
        };
        let present_setup = surface.present_setup(self.physical, self.vsync_mode)?;

        Swapchain::new(
            surface,
            surface_format,
            present_setup,
            self.surface_extent,
            old,
            self.physical,
            &self.instance.instance,
            self.device.clone(),
        )
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        if let Err(err) = self.wait_idle() {
            log::error!("Failed to wait for device idle on shutdown: {err}");
        }
    }
}
