use std::sync::Arc;
use ash::prelude::VkResult;
use ash::vk;
use crate::renderer::config::{PresentSetup, VSyncMode};
use crate::renderer::error::{HriError, Result};

/// Surface the swapchain presents to, owned by the render context
pub struct Surface {
    pub handle: vk::SurfaceKHR,
    pub loader: ash::khr::surface::Instance,
}

impl Surface {
    pub fn capabilities(&self, physical: vk::PhysicalDevice) -> Result<vk::SurfaceCapabilitiesKHR> {
        Ok(unsafe {
            self.loader
                .get_physical_device_surface_capabilities(physical, self.handle)?
        })
    }

    pub fn present_setup(
        &self,
        physical: vk::PhysicalDevice,
        vsync_mode: VSyncMode,
    ) -> Result<PresentSetup> {
        let capabilities = self.capabilities(physical)?;
        let present_modes = unsafe {
            self.loader
                .get_physical_device_surface_present_modes(physical, self.handle)?
        };
        Ok(PresentSetup::resolve(vsync_mode, &capabilities, &present_modes))
    }

    pub fn select_format(&self, physical: vk::PhysicalDevice) -> Result<vk::SurfaceFormatKHR> {
        let formats = unsafe {
            self.loader
                .get_physical_device_surface_formats(physical, self.handle)?
        };
        choose_surface_format(&formats)
            .ok_or_else(|| HriError::Unsupported("Surface reports no formats".to_string()))
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.loader.destroy_surface(self.handle, None);
        }
    }
}

/// Prefer 8-bit sRGB BGRA, otherwise take whatever the surface lists first
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|format| {
            format.format == vk::Format::B8G8R8A8_SRGB
                && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// Surface extent, falling back to the requested size clamped into the surface limits
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    requested: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: requested.width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: requested.height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub loader: ash::khr::swapchain::Device,
    pub present_mode: vk::PresentModeKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,

    device: Arc<ash::Device>,
}

impl Swapchain {
    /// Build a swapchain for the surface, retiring `old_swapchain` if given.
    ///
    /// A zero-area surface reports `SwapchainOutOfDate` without creating anything.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        surface: &Surface,
        surface_format: vk::SurfaceFormatKHR,
        present_setup: PresentSetup,
        requested_extent: vk::Extent2D,
        old_swapchain: Option<&Swapchain>,
        physical: vk::PhysicalDevice,
        instance: &ash::Instance,
        device: Arc<ash::Device>,
    ) -> Result<Self> {
        let capabilities = surface.capabilities(physical)?;
        let extent = choose_extent(&capabilities, requested_extent);
        if extent.width == 0 || extent.height == 0 {
            return Err(HriError::SwapchainOutOfDate);
        }

        let identity = vk::SurfaceTransformFlagsKHR::IDENTITY;
        let pre_transform = match capabilities.supported_transforms.contains(identity) {
            true => identity,
            false => capabilities.current_transform,
        };

        let loader = old_swapchain
            .map(|old| old.loader.clone())
            .unwrap_or_else(|| ash::khr::swapchain::Device::new(instance, &device));
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.handle)
            .min_image_count(present_setup.image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_setup.present_mode)
            .clipped(true)
            .image_array_layers(1)
            .old_swapchain(old_swapchain.map_or(vk::SwapchainKHR::null(), |old| old.handle));

        let handle = unsafe { loader.create_swapchain(&create_info, None)? };

        let queried = unsafe { loader.get_swapchain_images(handle) };
        let (images, image_views) = match queried.and_then(|images| {
            let views = create_image_views(&images, surface_format.format, &device)?;
            Ok((images, views))
        }) {
            Ok(result) => result,
            Err(err) => {
                unsafe { loader.destroy_swapchain(handle, None) };
                return Err(err.into());
            }
        };

        log::info!(
            "Created swapchain {}x{} with {} images, present mode {:?}",
            extent.width,
            extent.height,
            images.len(),
            present_setup.present_mode,
        );

        Ok(Self {
            handle,
            loader,
            present_mode: present_setup.present_mode,
            images,
            image_views,
            extent,
            format: surface_format.format,
            color_space: surface_format.color_space,
            device,
        })
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn surface_format(&self) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format: self.format,
            color_space: self.color_space,
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for view in self.image_views.drain(..) {
                self.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.handle, None);
        }
    }
}

fn create_image_views(
    images: &[vk::Image],
    format: vk::Format,
    device: &ash::Device,
) -> VkResult<Vec<vk::ImageView>> {
    let mut views = Vec::with_capacity(images.len());
    for image in images {
        let view_info = vk::ImageViewCreateInfo::default()
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::R,
                g: vk::ComponentSwizzle::G,
                b: vk::ComponentSwizzle::B,
                a: vk::ComponentSwizzle::A,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image(*image);
        match unsafe { device.create_image_view(&view_info, None) } {
            Ok(view) => views.push(view),
            Err(err) => {
                for view in views {
                    unsafe { device.destroy_image_view(view, None) };
                }
                return Err(err);
            }
        }
    }
    Ok(views)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_srgb_bgra_surface_format() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(choose_surface_format(&formats).map(|f| f.format), Some(vk::Format::B8G8R8A8_SRGB));
        assert_eq!(choose_surface_format(&formats[..1]).map(|f| f.format), Some(vk::Format::R8G8B8A8_UNORM));
        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn extent_uses_current_extent_when_defined() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: 800, height: 600 },
            ..Default::default()
        };
        let extent = choose_extent(&caps, vk::Extent2D { width: 1920, height: 1080 });
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn extent_is_clamped_when_surface_defers_to_the_window() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: u32::MAX, height: u32::MAX },
            min_image_extent: vk::Extent2D { width: 16, height: 16 },
            max_image_extent: vk::Extent2D { width: 1024, height: 1024 },
            ..Default::default()
        };
        let extent = choose_extent(&caps, vk::Extent2D { width: 4096, height: 8 });
        assert_eq!((extent.width, extent.height), (1024, 16));
    }
}
