use std::sync::Arc;
use ash::vk;
use crate::renderer::error::{HriError, Result};
use crate::renderer::render_pass::{AttachmentType, RenderAttachmentConfig, RenderPass};
use crate::renderer::resources::image::aspect_for_format;

#[derive(Debug, Default, Clone)]
struct SubpassData {
    color_attachments: Vec<vk::AttachmentReference>,
    depth_stencil_attachment: Option<vk::AttachmentReference>,
}

/// Accumulates attachments, subpasses and dependencies of a render pass.
///
/// A first subpass is open from the start, `next_subpass` opens another one.
#[derive(Debug, Clone)]
pub struct RenderPassBuilder {
    attachments: Vec<vk::AttachmentDescription>,
    subpasses: Vec<SubpassData>,
    dependencies: Vec<vk::SubpassDependency>,
}

impl Default for RenderPassBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderPassBuilder {
    pub fn new() -> Self {
        Self {
            attachments: Vec::new(),
            subpasses: vec![SubpassData::default()],
            dependencies: Vec::new(),
        }
    }

    pub fn add_attachment(
        &mut self,
        format: vk::Format,
        samples: vk::SampleCountFlags,
        final_layout: vk::ImageLayout,
        load_op: vk::AttachmentLoadOp,
        store_op: vk::AttachmentStoreOp,
    ) -> &mut Self {
        self.add_attachment_description(
            vk::AttachmentDescription::default()
                .format(format)
                .samples(samples)
                .load_op(load_op)
                .store_op(store_op)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(final_layout),
        )
    }

    pub fn add_attachment_description(&mut self, description: vk::AttachmentDescription) -> &mut Self {
        self.attachments.push(description);
        self
    }

    /// Attachment matching a manager's attachment config
    pub fn add_attachment_config(
        &mut self,
        config: &RenderAttachmentConfig,
        final_layout: vk::ImageLayout,
    ) -> &mut Self {
        self.add_attachment(config.format, config.samples, final_layout, config.load_op, config.store_op)
    }

    pub fn next_subpass(&mut self) -> &mut Self {
        self.subpasses.push(SubpassData::default());
        self
    }

    /// Reference an attachment from the current subpass; a second depth reference replaces the first
    pub fn set_attachment_reference(
        &mut self,
        attachment_type: AttachmentType,
        reference: vk::AttachmentReference,
    ) -> &mut Self {
        if let Some(subpass) = self.subpasses.last_mut() {
            match attachment_type {
                AttachmentType::Color => subpass.color_attachments.push(reference),
                AttachmentType::DepthStencil => subpass.depth_stencil_attachment = Some(reference),
            }
        }
        self
    }

    pub fn add_dependency(&mut self, dependency: vk::SubpassDependency) -> &mut Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn attachment_count(&self) -> usize {
        self.attachments.len()
    }

    pub fn subpass_count(&self) -> usize {
        self.subpasses.len()
    }

    pub fn validate(&self) -> Result<()> {
        if self.attachments.is_empty() {
            return Err(HriError::precondition("Render pass has no attachments"));
        }

        for (index, subpass) in self.subpasses.iter().enumerate() {
            if subpass.color_attachments.is_empty() && subpass.depth_stencil_attachment.is_none() {
                return Err(HriError::precondition(format!(
                    "Subpass {index} references no attachments",
                )));
            }

            for reference in &subpass.color_attachments {
                let format = self.referenced_format(index, reference)?;
                if aspect_for_format(format) != vk::ImageAspectFlags::COLOR {
                    return Err(HriError::precondition(format!(
                        "Subpass {index} uses depth/stencil attachment {} as color target",
                        reference.attachment,
                    )));
                }
            }

            if let Some(reference) = &subpass.depth_stencil_attachment {
                let format = self.referenced_format(index, reference)?;
                if aspect_for_format(format) == vk::ImageAspectFlags::COLOR {
                    return Err(HriError::precondition(format!(
                        "Subpass {index} uses color attachment {} as depth/stencil target",
                        reference.attachment,
                    )));
                }
            }
        }

        let subpass_count = self.subpasses.len() as u32;
        for dependency in &self.dependencies {
            let in_range = |subpass: u32| subpass == vk::SUBPASS_EXTERNAL || subpass < subpass_count;
            if !in_range(dependency.src_subpass) || !in_range(dependency.dst_subpass) {
                return Err(HriError::precondition("Subpass dependency references an unknown subpass"));
            }
        }

        Ok(())
    }

    pub fn build(&self, device: Arc<ash::Device>) -> Result<RenderPass> {
        self.validate()?;

        let subpasses: Vec<_> = self
            .subpasses
            .iter()
            .map(|subpass| {
                let description = vk::SubpassDescription::default()
                    .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
                    .color_attachments(&subpass.color_attachments);
                match &subpass.depth_stencil_attachment {
                    Some(depth) => description.depth_stencil_attachment(depth),
                    None => description,
                }
            })
            .collect();

        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&self.attachments)
            .subpasses(&subpasses)
            .dependencies(&self.dependencies);
        let handle = unsafe {
            device.create_render_pass(&create_info, None)?
        };

        Ok(RenderPass::from_raw(handle, device))
    }

    fn referenced_format(&self, subpass: usize, reference: &vk::AttachmentReference) -> Result<vk::Format> {
        self.attachments
            .get(reference.attachment as usize)
            .map(|a| a.format)
            .ok_or_else(|| HriError::precondition(format!(
                "Subpass {subpass} references missing attachment {}",
                reference.attachment,
            )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn color_ref(attachment: u32) -> vk::AttachmentReference {
        vk::AttachmentReference {
            attachment,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }
    }

    fn depth_ref(attachment: u32) -> vk::AttachmentReference {
        vk::AttachmentReference {
            attachment,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        }
    }

    fn gbuffer_builder() -> RenderPassBuilder {
        let mut builder = RenderPassBuilder::new();
        builder
            .add_attachment_config(
                &RenderAttachmentConfig::color(vk::Format::R16G16B16A16_SFLOAT),
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )
            .add_attachment_config(
                &RenderAttachmentConfig::depth_stencil(vk::Format::D32_SFLOAT),
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            )
            .set_attachment_reference(AttachmentType::Color, color_ref(0))
            .set_attachment_reference(AttachmentType::DepthStencil, depth_ref(1));
        builder
    }

    #[test]
    fn valid_pass_passes_validation() {
        let builder = gbuffer_builder();
        assert_eq!(builder.attachment_count(), 2);
        assert_eq!(builder.subpass_count(), 1);
        assert!(builder.validate().is_ok());
    }

    #[test]
    fn empty_builder_is_rejected() {
        assert!(RenderPassBuilder::new().validate().is_err());
    }

    #[test]
    fn subpass_without_references_is_rejected() {
        let mut builder = gbuffer_builder();
        builder.next_subpass();
        assert!(builder.validate().is_err());

        builder.set_attachment_reference(AttachmentType::Color, color_ref(0));
        assert!(builder.validate().is_ok());
    }

    #[test]
    fn reference_type_must_match_format() {
        let mut builder = gbuffer_builder();
        builder.set_attachment_reference(AttachmentType::Color, color_ref(1));
        assert!(builder.validate().is_err());

        let mut builder = gbuffer_builder();
        builder.set_attachment_reference(AttachmentType::DepthStencil, depth_ref(0));
        assert!(builder.validate().is_err());
    }

    #[test]
    fn out_of_range_references_are_rejected() {
        let mut builder = gbuffer_builder();
        builder.set_attachment_reference(AttachmentType::Color, color_ref(4));
        assert!(builder.validate().is_err());

        let mut builder = gbuffer_builder();
        builder.add_dependency(vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 3,
            ..Default::default()
        });
        assert!(builder.validate().is_err());
    }
}
