use std::sync::Arc;
use ash::vk;
use crate::renderer::core::context::RenderContext;
use crate::renderer::error::Result;
use crate::renderer::frame::frame::ActiveFrame;
use crate::renderer::render_pass::builder::RenderPassBuilder;
use crate::renderer::render_pass::{
    create_attachment_images,
    AttachmentType,
    PassAttachments,
    PassCommon,
    RenderAttachmentConfig,
    RenderPass,
    RenderPassResourceManager,
};

/// Render pass whose first attachment is the swapchain image, followed by `extra` attachments
pub fn swapchain_render_pass(
    ctx: &RenderContext,
    extra: &[RenderAttachmentConfig],
) -> Result<RenderPass> {
    let swapchain = ctx.swapchain()?;

    let mut builder = RenderPassBuilder::new();
    builder
        .add_attachment(
            swapchain.format,
            vk::SampleCountFlags::TYPE_1,
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::AttachmentLoadOp::CLEAR,
            vk::AttachmentStoreOp::STORE,
        )
        .set_attachment_reference(
            AttachmentType::Color,
            vk::AttachmentReference {
                attachment: 0,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            },
        );

    for (index, config) in extra.iter().enumerate() {
        let layout = config.attachment_type.optimal_layout();
        builder
            .add_attachment_config(config, layout)
            .set_attachment_reference(
                config.attachment_type,
                vk::AttachmentReference {
                    attachment: index as u32 + 1,
                    layout,
                },
            );
    }

    // The image acquire semaphore is waited on at color output, the layout transition has to wait as well
    builder.add_dependency(vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        src_access_mask: vk::AccessFlags::empty(),
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        dependency_flags: vk::DependencyFlags::empty(),
    });

    builder.build(ctx.device.clone())
}

/// Renders into the swapchain images, one framebuffer per image.
///
/// Must be recreated whenever the swapchain is; extra attachments are shared by all framebuffers.
pub struct SwapchainPassResourceManager {
    common: PassCommon,
    render_pass: RenderPass,
}

impl SwapchainPassResourceManager {
    pub fn new(
        ctx: &RenderContext,
        render_pass: RenderPass,
        extra_configs: Vec<RenderAttachmentConfig>,
    ) -> Result<Self> {
        let mut manager = Self {
            common: PassCommon::new(
                render_pass.handle,
                extra_configs,
                &[AttachmentType::Color.default_clear_value()],
            ),
            render_pass,
        };
        manager.recreate_resources(ctx)?;
        Ok(manager)
    }

    pub fn framebuffer_count(&self) -> usize {
        self.common
            .attachments
            .as_ref()
            .map(|a| a.framebuffers.len())
            .unwrap_or(0)
    }
}

impl RenderPassResourceManager for SwapchainPassResourceManager {
    fn common(&self) -> &PassCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut PassCommon {
        &mut self.common
    }

    fn target_extent(&self, ctx: &RenderContext) -> Result<vk::Extent2D> {
        Ok(ctx.swapchain()?.extent)
    }

    fn create_resources(&mut self, ctx: &RenderContext, extent: vk::Extent2D) -> Result<()> {
        let swapchain = ctx.swapchain()?;
        let images = create_attachment_images(ctx, self.common.configs(), extent, "Swapchain pass")?;
        let extra_views: Vec<_> = images.iter().map(|image| image.view).collect();

        let mut attachments = PassAttachments::new(images, extent, Arc::clone(&ctx.device));
        for swap_view in &swapchain.image_views {
            let views: Vec<_> = std::iter::once(*swap_view)
                .chain(extra_views.iter().copied())
                .collect();
            attachments.add_framebuffer(self.render_pass.handle, &views)?;
        }
        self.common.attachments = Some(attachments);

        log::debug!(
            "Created {} swapchain framebuffers at {}x{}",
            swapchain.image_views.len(),
            extent.width,
            extent.height,
        );
        Ok(())
    }

    fn framebuffer_for(&self, frame: &ActiveFrame) -> Result<vk::Framebuffer> {
        self.framebuffer(frame.swap_image_index as usize)
    }
}
