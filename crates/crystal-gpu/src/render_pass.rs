//! Render passes and framebuffers.
//!
//! A render pass has one subpass with a colour attachment and an optional
//! depth attachment. Framebuffers depend on their render pass and on every
//! attached image, so resizing a target invalidates them.

use std::sync::Arc;

use ash::vk;

use crate::context::GraphicsContext;
use crate::error::{GpuError, Result};
use crate::graph::{ResourceId, ResourceKind};
use crate::image::GpuImage;
use crate::resource::{GpuAllocatable, Registration};

/// Attachment description of a [`RenderPass`].
#[derive(Debug, Clone)]
pub struct RenderPassCreateInfo {
    pub label: String,
    pub color_format: vk::Format,
    pub depth_format: Option<vk::Format>,
    pub samples: vk::SampleCountFlags,
    /// Layout the colour attachment is left in.
    pub final_layout: vk::ImageLayout,
}

impl RenderPassCreateInfo {
    pub fn new(label: impl Into<String>, color_format: vk::Format) -> Self {
        Self {
            label: label.into(),
            color_format,
            depth_format: None,
            samples: vk::SampleCountFlags::TYPE_1,
            final_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        }
    }

    pub fn depth(mut self, format: vk::Format) -> Self {
        self.depth_format = Some(format);
        self
    }

    pub fn samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }

    pub fn final_layout(mut self, layout: vk::ImageLayout) -> Self {
        self.final_layout = layout;
        self
    }
}

/// Single-subpass render pass.
#[derive(Debug)]
pub struct RenderPass {
    registration: Registration,
    handle: vk::RenderPass,
    info: RenderPassCreateInfo,
}

impl RenderPass {
    pub fn create(ctx: &Arc<GraphicsContext>, info: &RenderPassCreateInfo) -> Result<Self> {
        let mut attachments = vec![vk::AttachmentDescription::default()
            .format(info.color_format)
            .samples(info.samples)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(info.final_layout)];
        if let Some(depth_format) = info.depth_format {
            attachments.push(
                vk::AttachmentDescription::default()
                    .format(depth_format)
                    .samples(info.samples)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
            );
        }

        let color_ref = vk::AttachmentReference::default()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        let depth_ref = vk::AttachmentReference::default()
            .attachment(1)
            .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(std::slice::from_ref(&color_ref));
        if info.depth_format.is_some() {
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }

        let dependency = vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .dst_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            );

        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(std::slice::from_ref(&subpass))
            .dependencies(std::slice::from_ref(&dependency));
        let handle = ctx.device().create_render_pass(&create_info)?;

        let registration = match Registration::new(ctx, ResourceKind::RenderPass, info.label.clone()) {
            Ok(registration) => registration,
            Err(e) => {
                ctx.device().destroy_render_pass(handle);
                return Err(e);
            }
        };

        Ok(Self {
            registration,
            handle,
            info: info.clone(),
        })
    }

    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    pub fn resource_id(&self) -> ResourceId {
        self.registration.id()
    }

    pub fn color_format(&self) -> vk::Format {
        self.info.color_format
    }

    pub fn depth_format(&self) -> Option<vk::Format> {
        self.info.depth_format
    }

    pub fn has_depth(&self) -> bool {
        self.info.depth_format.is_some()
    }

    pub fn samples(&self) -> vk::SampleCountFlags {
        self.info.samples
    }

    pub fn destroy(&mut self) -> Result<()> {
        self.registration.release()?;
        self.destroy_native();
        Ok(())
    }

    fn destroy_native(&mut self) {
        if self.handle != vk::RenderPass::null() {
            self.registration
                .context()
                .device()
                .destroy_render_pass(self.handle);
            self.handle = vk::RenderPass::null();
        }
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        self.destroy_native();
    }
}

/// Attachments bound to a render pass at one extent.
#[derive(Debug)]
pub struct Framebuffer {
    registration: Registration,
    handle: vk::Framebuffer,
    extent: vk::Extent2D,
}

impl Framebuffer {
    /// Create a framebuffer over `color` and optional `depth`.
    ///
    /// Attachments must share an extent and must exist before the framebuffer.
    pub fn create(
        ctx: &Arc<GraphicsContext>,
        label: impl Into<String>,
        render_pass: &RenderPass,
        color: &GpuImage,
        depth: Option<&GpuImage>,
    ) -> Result<Self> {
        let label = label.into();
        let extent = color.extent();
        if depth.is_some_and(|d| d.extent() != extent) {
            return Err(GpuError::InvalidState(format!(
                "framebuffer '{label}' attachments differ in extent"
            )));
        }
        if depth.is_some() != render_pass.has_depth() {
            return Err(GpuError::InvalidState(format!(
                "framebuffer '{label}' does not match the depth attachment of its render pass"
            )));
        }

        let mut views = vec![color.view()];
        let mut dependencies = vec![render_pass.resource_id(), color.resource_id()];
        if let Some(depth) = depth {
            views.push(depth.view());
            dependencies.push(depth.resource_id());
        }

        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass.handle())
            .attachments(&views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        let handle = ctx.device().create_framebuffer(&create_info)?;

        let registration = Registration::new(ctx, ResourceKind::Framebuffer, label)
            .and_then(|registration| {
                registration.depend_on_all(&dependencies)?;
                Ok(registration)
            });
        match registration {
            Ok(registration) => Ok(Self {
                registration,
                handle,
                extent,
            }),
            Err(e) => {
                ctx.device().destroy_framebuffer(handle);
                Err(e)
            }
        }
    }

    pub fn handle(&self) -> vk::Framebuffer {
        self.handle
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn resource_id(&self) -> ResourceId {
        self.registration.id()
    }

    /// False once an attachment was resized or released.
    pub fn is_valid(&self) -> bool {
        self.registration.is_valid()
    }

    pub fn destroy(&mut self) -> Result<()> {
        self.registration.release()?;
        self.destroy_native();
        Ok(())
    }

    fn destroy_native(&mut self) {
        if self.handle != vk::Framebuffer::null() {
            self.registration
                .context()
                .device()
                .destroy_framebuffer(self.handle);
            self.handle = vk::Framebuffer::null();
        }
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        self.destroy_native();
    }
}

/// One framebuffer per target image, all sharing `depth`.
pub fn create_framebuffers(
    ctx: &Arc<GraphicsContext>,
    render_pass: &RenderPass,
    targets: &[GpuImage],
    depth: Option<&GpuImage>,
) -> Result<Vec<Framebuffer>> {
    targets
        .iter()
        .enumerate()
        .map(|(i, target)| {
            Framebuffer::create(ctx, format!("framebuffer_{i}"), render_pass, target, depth)
        })
        .collect()
}

/// Replace `framebuffers` after the targets were resized.
///
/// The old framebuffers must not be in use by pending GPU work.
pub fn rebuild_framebuffers(
    ctx: &Arc<GraphicsContext>,
    framebuffers: &mut Vec<Framebuffer>,
    render_pass: &RenderPass,
    targets: &[GpuImage],
    depth: Option<&GpuImage>,
) -> Result<()> {
    for framebuffer in framebuffers.iter_mut() {
        framebuffer.destroy()?;
    }
    framebuffers.clear();
    *framebuffers = create_framebuffers(ctx, render_pass, targets, depth)?;
    tracing::debug!(count = framebuffers.len(), "rebuilt framebuffers");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::PhysicalDeviceInfo;
    use crate::context::GraphicsContextBuilder;
    use crate::image::ImageCreateInfo;

    const FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

    fn context() -> Arc<GraphicsContext> {
        GraphicsContextBuilder::new()
            .headless(PhysicalDeviceInfo::headless())
            .build()
            .unwrap()
    }

    fn target(ctx: &Arc<GraphicsContext>, label: &str) -> GpuImage {
        GpuImage::create(
            ctx,
            &ImageCreateInfo::new(label, 32, 32, FORMAT, vk::ImageUsageFlags::COLOR_ATTACHMENT),
        )
        .unwrap()
    }

    #[test]
    fn framebuffer_depends_on_pass_and_attachments() {
        let ctx = context();
        let color = target(&ctx, "color");
        let depth = GpuImage::create(
            &ctx,
            &ImageCreateInfo::depth("depth", 32, 32, vk::Format::D32_SFLOAT),
        )
        .unwrap();
        let pass = RenderPass::create(
            &ctx,
            &RenderPassCreateInfo::new("main", FORMAT).depth(vk::Format::D32_SFLOAT),
        )
        .unwrap();
        let framebuffer = Framebuffer::create(&ctx, "fb", &pass, &color, Some(&depth)).unwrap();

        let graph = ctx.graph();
        let id = framebuffer.resource_id();
        assert!(graph.depends_on(id, pass.resource_id()));
        assert!(graph.depends_on(id, color.resource_id()));
        assert!(graph.depends_on(id, depth.resource_id()));
    }

    #[test]
    fn depth_mismatch_is_rejected() {
        let ctx = context();
        let color = target(&ctx, "color");
        let pass = RenderPass::create(
            &ctx,
            &RenderPassCreateInfo::new("main", FORMAT).depth(vk::Format::D32_SFLOAT),
        )
        .unwrap();
        assert!(Framebuffer::create(&ctx, "fb", &pass, &color, None).is_err());
        assert_eq!(ctx.headless().unwrap().live_objects_of("framebuffer"), 0);
    }

    #[test]
    fn resize_then_rebuild_restores_validity() {
        let ctx = context();
        let mut targets = vec![target(&ctx, "t0"), target(&ctx, "t1")];
        let pass = RenderPass::create(&ctx, &RenderPassCreateInfo::new("main", FORMAT)).unwrap();
        let mut framebuffers = create_framebuffers(&ctx, &pass, &targets, None).unwrap();

        for t in &mut targets {
            t.resize(64, 48).unwrap();
        }
        assert!(framebuffers.iter().all(|fb| !fb.is_valid()));

        rebuild_framebuffers(&ctx, &mut framebuffers, &pass, &targets, None).unwrap();
        assert_eq!(framebuffers.len(), 2);
        assert!(framebuffers.iter().all(Framebuffer::is_valid));
        assert_eq!(framebuffers[0].extent(), vk::Extent2D { width: 64, height: 48 });
        assert_eq!(ctx.headless().unwrap().live_objects_of("framebuffer"), 2);
    }
}
