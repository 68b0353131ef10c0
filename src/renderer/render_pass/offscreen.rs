use ash::vk;
use crate::renderer::core::context::RenderContext;
use crate::renderer::error::Result;
use crate::renderer::frame::frame::ActiveFrame;
use crate::renderer::render_pass::{
    create_attachment_images,
    PassAttachments,
    PassCommon,
    RenderAttachmentConfig,
    RenderPass,
    RenderPassResourceManager,
};

/// Renders into images it allocates itself, one framebuffer shared by all frames
pub struct OffscreenPassResourceManager {
    common: PassCommon,
    fixed_extent: Option<vk::Extent2D>,
    // Dropped after the attachments referencing it
    render_pass: RenderPass,
}

impl OffscreenPassResourceManager {
    /// Resources follow the swapchain extent unless `fixed_extent` is given
    pub fn new(
        ctx: &RenderContext,
        render_pass: RenderPass,
        configs: Vec<RenderAttachmentConfig>,
        fixed_extent: Option<vk::Extent2D>,
    ) -> Result<Self> {
        let mut manager = Self {
            common: PassCommon::new(render_pass.handle, configs, &[]),
            fixed_extent,
            render_pass,
        };
        manager.recreate_resources(ctx)?;
        Ok(manager)
    }

    pub fn render_pass_handle(&self) -> &RenderPass {
        &self.render_pass
    }
}

impl RenderPassResourceManager for OffscreenPassResourceManager {
    fn common(&self) -> &PassCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut PassCommon {
        &mut self.common
    }

    fn target_extent(&self, ctx: &RenderContext) -> Result<vk::Extent2D> {
        if let Some(extent) = self.fixed_extent {
            return Ok(extent);
        }
        Ok(match ctx.swapchain() {
            Ok(swapchain) => swapchain.extent,
            Err(_) => ctx.surface_extent(),
        })
    }

    fn create_resources(&mut self, ctx: &RenderContext, extent: vk::Extent2D) -> Result<()> {
        let images = create_attachment_images(ctx, self.common.configs(), extent, "Offscreen")?;
        let views: Vec<_> = images.iter().map(|image| image.view).collect();

        let mut attachments = PassAttachments::new(images, extent, ctx.device.clone());
        attachments.add_framebuffer(self.render_pass.handle, &views)?;
        self.common.attachments = Some(attachments);

        log::debug!(
            "Created {} offscreen attachments at {}x{}",
            views.len(),
            extent.width,
            extent.height,
        );
        Ok(())
    }

    fn framebuffer_for(&self, _frame: &ActiveFrame) -> Result<vk::Framebuffer> {
        self.framebuffer(0)
    }
}
