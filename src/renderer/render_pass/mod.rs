pub mod builder;
pub mod offscreen;
pub mod swapchain;

use std::sync::Arc;
use ash::vk;
use crate::renderer::core::context::RenderContext;
use crate::renderer::error::{HriError, Result};
use crate::renderer::frame::frame::ActiveFrame;
use crate::renderer::resources::image::{ImageCreateInfo, ImageResource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentType {
    Color,
    DepthStencil,
}

impl AttachmentType {
    pub fn default_clear_value(self) -> vk::ClearValue {
        match self {
            AttachmentType::Color => vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [0.0, 0.0, 0.0, 1.0],
                },
            },
            AttachmentType::DepthStencil => vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        }
    }

    /// Layout the attachment is in while the render pass writes it
    pub fn optimal_layout(self) -> vk::ImageLayout {
        match self {
            AttachmentType::Color => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            AttachmentType::DepthStencil => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        }
    }
}

/// Describes one attachment of a pass; used both for the render pass and its backing images
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderAttachmentConfig {
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub attachment_type: AttachmentType,
}

impl RenderAttachmentConfig {
    /// Cleared color target that can be sampled by later passes
    pub fn color(format: vk::Format) -> Self {
        Self {
            format,
            samples: vk::SampleCountFlags::TYPE_1,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            aspect: vk::ImageAspectFlags::COLOR,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            attachment_type: AttachmentType::Color,
        }
    }

    pub fn depth_stencil(format: vk::Format) -> Self {
        Self {
            format,
            samples: vk::SampleCountFlags::TYPE_1,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            aspect: crate::renderer::resources::image::aspect_for_format(format),
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            attachment_type: AttachmentType::DepthStencil,
        }
    }

    pub fn image_create_info(&self, name: impl Into<String>, extent: vk::Extent2D) -> ImageCreateInfo {
        let mut info = ImageCreateInfo::new_2d(name, self.format, extent, self.usage, self.aspect);
        info.samples = self.samples;
        info
    }
}

/// Owned render pass handle
pub struct RenderPass {
    pub handle: vk::RenderPass,
    device: Arc<ash::Device>,
}

impl RenderPass {
    pub(crate) fn from_raw(handle: vk::RenderPass, device: Arc<ash::Device>) -> Self {
        Self { handle, device }
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_render_pass(self.handle, None);
        }
    }
}

/// Images and framebuffers of a pass, created and destroyed as one unit
pub(crate) struct PassAttachments {
    pub images: Vec<ImageResource>,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub extent: vk::Extent2D,
    device: Arc<ash::Device>,
}

impl PassAttachments {
    pub fn new(images: Vec<ImageResource>, extent: vk::Extent2D, device: Arc<ash::Device>) -> Self {
        Self {
            images,
            framebuffers: Vec::new(),
            extent,
            device,
        }
    }

    pub fn add_framebuffer(
        &mut self,
        render_pass: vk::RenderPass,
        views: &[vk::ImageView],
    ) -> Result<()> {
        let framebuffer_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(views)
            .width(self.extent.width)
            .height(self.extent.height)
            .layers(1);
        let framebuffer = unsafe {
            self.device.create_framebuffer(&framebuffer_info, None)?
        };
        self.framebuffers.push(framebuffer);
        Ok(())
    }
}

impl Drop for PassAttachments {
    fn drop(&mut self) {
        for framebuffer in self.framebuffers.drain(..) {
            unsafe {
                self.device.destroy_framebuffer(framebuffer, None);
            }
        }
    }
}

/// State shared by every render pass resource manager
pub struct PassCommon {
    render_pass: vk::RenderPass,
    configs: Vec<RenderAttachmentConfig>,
    clear_values: Vec<vk::ClearValue>,
    recording: Option<vk::CommandBuffer>,
    pub(crate) attachments: Option<PassAttachments>,
}

impl PassCommon {
    /// `leading_clear_values` covers attachments the manager does not allocate itself, e.g. the swapchain image
    pub fn new(
        render_pass: vk::RenderPass,
        configs: Vec<RenderAttachmentConfig>,
        leading_clear_values: &[vk::ClearValue],
    ) -> Self {
        let clear_values = leading_clear_values
            .iter()
            .copied()
            .chain(configs.iter().map(|c| c.attachment_type.default_clear_value()))
            .collect();

        Self {
            render_pass,
            configs,
            clear_values,
            recording: None,
            attachments: None,
        }
    }

    pub fn configs(&self) -> &[RenderAttachmentConfig] {
        &self.configs
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    fn mark_begin(&mut self, command_buffer: vk::CommandBuffer) -> Result<()> {
        if self.recording.is_some() {
            return Err(HriError::precondition("Render pass begun twice without ending it"));
        }
        self.recording = Some(command_buffer);
        Ok(())
    }

    fn mark_end(&mut self, command_buffer: vk::CommandBuffer) -> Result<()> {
        match self.recording {
            Some(recording) if recording == command_buffer => {
                self.recording = None;
                Ok(())
            }
            Some(_) => Err(HriError::precondition(
                "Render pass ended on a different command buffer than it was begun on",
            )),
            None => Err(HriError::precondition("Render pass ended without being begun")),
        }
    }
}

/// Creates, recreates and records the attachments of one render pass.
///
/// Attachment images are either all present or all absent; callers must not keep views or
/// images obtained from a manager across a resize.
pub trait RenderPassResourceManager {
    fn common(&self) -> &PassCommon;

    fn common_mut(&mut self) -> &mut PassCommon;

    /// Allocate every attachment image and framebuffer at `extent`
    fn create_resources(&mut self, ctx: &RenderContext, extent: vk::Extent2D) -> Result<()>;

    /// Framebuffer to render into for the given frame
    fn framebuffer_for(&self, frame: &ActiveFrame) -> Result<vk::Framebuffer>;

    /// Extent new resources are created at
    fn target_extent(&self, ctx: &RenderContext) -> Result<vk::Extent2D> {
        Ok(match ctx.swapchain() {
            Ok(swapchain) => swapchain.extent,
            Err(_) => ctx.surface_extent(),
        })
    }

    fn destroy_resources(&mut self) {
        self.common_mut().attachments = None;
    }

    /// Full teardown followed by creation, never patches existing objects
    fn recreate_resources(&mut self, ctx: &RenderContext) -> Result<()> {
        rebuild_resources(self, |manager| {
            let extent = manager.target_extent(ctx)?;
            manager.create_resources(ctx, extent)
        })
    }

    fn begin_render_pass(&mut self, device: &ash::Device, frame: &ActiveFrame) -> Result<()> {
        let framebuffer = self.framebuffer_for(frame)?;
        let extent = self.extent()?;
        let render_pass = self.render_pass();
        self.common_mut().mark_begin(frame.command_buffer)?;

        let common = self.common();
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            })
            .clear_values(&common.clear_values);
        unsafe {
            device.cmd_begin_render_pass(frame.command_buffer, &begin_info, vk::SubpassContents::INLINE);
        }
        Ok(())
    }

    fn end_render_pass(&mut self, device: &ash::Device, frame: &ActiveFrame) -> Result<()> {
        self.common_mut().mark_end(frame.command_buffer)?;
        unsafe {
            device.cmd_end_render_pass(frame.command_buffer);
        }
        Ok(())
    }

    fn set_clear_value(&mut self, attachment_index: usize, clear_value: vk::ClearValue) -> Result<()> {
        let slot = self
            .common_mut()
            .clear_values
            .get_mut(attachment_index)
            .ok_or_else(|| HriError::precondition(format!(
                "Attachment index {attachment_index} is out of range",
            )))?;
        *slot = clear_value;
        Ok(())
    }

    fn clear_values(&self) -> &[vk::ClearValue] {
        &self.common().clear_values
    }

    fn render_pass(&self) -> vk::RenderPass {
        self.common().render_pass
    }

    fn extent(&self) -> Result<vk::Extent2D> {
        self.common()
            .attachments
            .as_ref()
            .map(|a| a.extent)
            .ok_or_else(|| HriError::precondition("Render pass resources have not been created"))
    }

    fn framebuffer(&self, index: usize) -> Result<vk::Framebuffer> {
        self.common()
            .attachments
            .as_ref()
            .and_then(|a| a.framebuffers.get(index).copied())
            .ok_or_else(|| HriError::precondition(format!("No framebuffer at index {index}")))
    }

    /// Image backing the attachment created from the config at `index`
    fn attachment_resource(&self, index: usize) -> Result<&ImageResource> {
        self.common()
            .attachments
            .as_ref()
            .and_then(|a| a.images.get(index))
            .ok_or_else(|| HriError::precondition(format!("No attachment resource at index {index}")))
    }

    fn image_resource_views(&self) -> Vec<vk::ImageView> {
        self.common()
            .attachments
            .as_ref()
            .map(|a| a.images.iter().map(|image| image.view).collect())
            .unwrap_or_default()
    }
}

/// Tear down every attachment, then run `create`; a failed create leaves nothing behind
pub(crate) fn rebuild_resources<M, F>(manager: &mut M, create: F) -> Result<()>
where
    M: RenderPassResourceManager + ?Sized,
    F: FnOnce(&mut M) -> Result<()>,
{
    if manager.common().is_recording() {
        return Err(HriError::precondition("Cannot recreate resources while the pass is recording"));
    }
    manager.destroy_resources();
    if let Err(err) = create(manager) {
        manager.destroy_resources();
        return Err(err);
    }
    Ok(())
}

/// Allocate one image per config; either every image is created or none are kept
pub(crate) fn create_attachment_images(
    ctx: &RenderContext,
    configs: &[RenderAttachmentConfig],
    extent: vk::Extent2D,
    label: &str,
) -> Result<Vec<ImageResource>> {
    configs
        .iter()
        .enumerate()
        .map(|(index, config)| {
            ctx.create_image(&config.image_create_info(format!("{label} attachment {index}"), extent))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;
    use super::*;

    fn common() -> PassCommon {
        PassCommon::new(
            vk::RenderPass::from_raw(1),
            vec![
                RenderAttachmentConfig::color(vk::Format::R8G8B8A8_UNORM),
                RenderAttachmentConfig::depth_stencil(vk::Format::D32_SFLOAT),
            ],
            &[],
        )
    }

    #[test]
    fn clear_values_follow_attachment_types() {
        let common = PassCommon::new(
            vk::RenderPass::null(),
            vec![RenderAttachmentConfig::depth_stencil(vk::Format::D24_UNORM_S8_UINT)],
            &[AttachmentType::Color.default_clear_value()],
        );
        assert_eq!(common.clear_values.len(), 2);
        unsafe {
            assert_eq!(common.clear_values[0].color.float32, [0.0, 0.0, 0.0, 1.0]);
            assert_eq!(common.clear_values[1].depth_stencil.depth, 1.0);
        }
    }

    #[test]
    fn depth_config_derives_aspect() {
        let config = RenderAttachmentConfig::depth_stencil(vk::Format::D24_UNORM_S8_UINT);
        assert_eq!(config.aspect, vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL);

        let info = config.image_create_info("depth", vk::Extent2D { width: 64, height: 32 });
        assert_eq!(info.extent.depth, 1);
        assert_eq!(info.usage, vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT);
    }

    #[test]
    fn begin_and_end_must_pair_on_one_command_buffer() {
        let mut common = common();
        let cmd = vk::CommandBuffer::from_raw(5);
        common.mark_begin(cmd).unwrap();
        assert!(common.is_recording());

        let err = common.mark_begin(cmd).unwrap_err();
        assert!(matches!(err, HriError::Precondition(_)));
        assert!(common.mark_end(vk::CommandBuffer::from_raw(6)).is_err());

        common.mark_end(cmd).unwrap();
        assert!(!common.is_recording());
    }

    /// Stands in for a manager whose resources are tracked by extent instead of GPU objects
    struct ExtentOnlyPass {
        common: PassCommon,
        resources: Option<vk::Extent2D>,
        log: Vec<String>,
    }

    impl ExtentOnlyPass {
        fn created_at(extent: vk::Extent2D) -> Self {
            Self {
                common: common(),
                resources: Some(extent),
                log: Vec::new(),
            }
        }

        fn rebuild_at(&mut self, extent: vk::Extent2D, fail: bool) -> Result<()> {
            rebuild_resources(self, |pass| {
                pass.log.push(format!("create while holding {:?}", pass.resources));
                pass.resources = Some(extent);
                if fail {
                    return Err(HriError::DeviceLimit("out of device memory".into()));
                }
                Ok(())
            })
        }
    }

    impl RenderPassResourceManager for ExtentOnlyPass {
        fn common(&self) -> &PassCommon {
            &self.common
        }

        fn common_mut(&mut self) -> &mut PassCommon {
            &mut self.common
        }

        fn create_resources(&mut self, _ctx: &RenderContext, _extent: vk::Extent2D) -> Result<()> {
            Err(HriError::precondition("not backed by a device"))
        }

        fn framebuffer_for(&self, _frame: &ActiveFrame) -> Result<vk::Framebuffer> {
            Err(HriError::precondition("not backed by a device"))
        }

        fn destroy_resources(&mut self) {
            self.log.push("destroy".into());
            self.resources = None;
            self.common.attachments = None;
        }
    }

    const SMALL: vk::Extent2D = vk::Extent2D { width: 640, height: 480 };
    const LARGE: vk::Extent2D = vk::Extent2D { width: 1920, height: 1080 };

    #[test]
    fn recreation_releases_old_resources_before_creating() {
        let mut pass = ExtentOnlyPass::created_at(SMALL);
        pass.rebuild_at(LARGE, false).unwrap();

        assert_eq!(pass.log, vec!["destroy", "create while holding None"]);
        assert_eq!(pass.resources, Some(LARGE));
    }

    #[test]
    fn recreation_is_refused_while_recording() {
        let mut pass = ExtentOnlyPass::created_at(SMALL);
        pass.common.mark_begin(vk::CommandBuffer::from_raw(5)).unwrap();

        let err = pass.rebuild_at(LARGE, false).unwrap_err();
        assert!(matches!(err, HriError::Precondition(_)));
        assert!(pass.log.is_empty());
        assert_eq!(pass.resources, Some(SMALL));
    }

    #[test]
    fn failed_recreation_leaves_nothing_behind() {
        let mut pass = ExtentOnlyPass::created_at(SMALL);
        assert!(pass.rebuild_at(LARGE, true).is_err());

        assert_eq!(pass.resources, None);
        assert!(pass.common.attachments.is_none());
        assert_eq!(pass.log.last().map(String::as_str), Some("destroy"));
    }

    #[test]
    fn end_without_begin_is_misuse() {
        let mut common = common();
        assert!(common.mark_end(vk::CommandBuffer::from_raw(5)).is_err());
    }
}
