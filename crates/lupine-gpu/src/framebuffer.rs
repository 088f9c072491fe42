//! Per-swapchain-image framebuffers.

use crate::device::DeviceContext;
use crate::error::{GpuError, Result};
use crate::render_pass::{AttachmentKind, RenderPass};
use crate::swapchain::PresentationTarget;
use ash::vk;
use std::sync::Arc;

/// One framebuffer per presentation image, all compatible with one render pass.
///
/// Dimensions are baked at creation; a resized target needs a new set.
pub struct FrameBuffers {
    device: Arc<dyn DeviceContext>,
    framebuffers: Vec<vk::Framebuffer>,
    extent: vk::Extent2D,
}

impl FrameBuffers {
    /// Build one framebuffer per image view of `target`.
    ///
    /// The presented attachment (the resolve target when the pass resolves,
    /// else the color attachment) uses the image's view. Depth uses the
    /// target's depth view and a multisampled color attachment its
    /// multisample view.
    pub fn load(
        device: &Arc<dyn DeviceContext>,
        render_pass: &RenderPass,
        target: &dyn PresentationTarget,
    ) -> Result<Self> {
        if render_pass.handle() == vk::RenderPass::null() {
            return Err(GpuError::InvalidArgument(
                "Framebuffers need a live render pass".to_string(),
            ));
        }

        let resolves = render_pass
            .attachments()
            .iter()
            .any(|desc| desc.kind == AttachmentKind::Resolve);
        let extent = target.extent();
        let mut framebuffers = Vec::with_capacity(target.image_views().len());

        for &image_view in target.image_views() {
            let views = match attachment_views(render_pass, target, image_view, resolves) {
                Ok(views) => views,
                Err(e) => {
                    destroy_all(device.as_ref(), &framebuffers);
                    return Err(e);
                }
            };

            let create_info = vk::FramebufferCreateInfo::default()
                .render_pass(render_pass.handle())
                .attachments(&views)
                .width(extent.width)
                .height(extent.height)
                .layers(1);

            match unsafe { device.create_framebuffer(&create_info) } {
                Ok(framebuffer) => framebuffers.push(framebuffer),
                Err(e) => {
                    tracing::error!("Creating framebuffer on {} failed: {e}", device.name());
                    destroy_all(device.as_ref(), &framebuffers);
                    return Err(GpuError::creation("framebuffer", e));
                }
            }
        }

        tracing::debug!(
            "Created {} framebuffers ({}x{})",
            framebuffers.len(),
            extent.width,
            extent.height
        );

        Ok(Self {
            device: Arc::clone(device),
            framebuffers,
            extent,
        })
    }

    /// Framebuffer of image `index`.
    pub fn get(&self, index: usize) -> Option<vk::Framebuffer> {
        self.framebuffers.get(index).copied()
    }

    /// All framebuffer handles in image order.
    pub fn handles(&self) -> &[vk::Framebuffer] {
        &self.framebuffers
    }

    /// Dimensions every framebuffer was created with.
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Number of framebuffers.
    pub fn len(&self) -> usize {
        self.framebuffers.len()
    }

    /// Whether no framebuffers are held.
    pub fn is_empty(&self) -> bool {
        self.framebuffers.is_empty()
    }

    /// Destroy every framebuffer. Calling this again is a no-op.
    pub fn release(&mut self) {
        destroy_all(self.device.as_ref(), &self.framebuffers);
        self.framebuffers.clear();
    }
}

impl Drop for FrameBuffers {
    fn drop(&mut self) {
        self.release();
    }
}

fn attachment_views(
    render_pass: &RenderPass,
    target: &dyn PresentationTarget,
    image_view: vk::ImageView,
    resolves: bool,
) -> Result<Vec<vk::ImageView>> {
    render_pass
        .attachments()
        .iter()
        .map(|desc| match desc.kind {
            AttachmentKind::Color if resolves => target.multisample_view().ok_or_else(|| {
                GpuError::InvalidArgument("Target has no multisampled color view".to_string())
            }),
            AttachmentKind::Color | AttachmentKind::Resolve => Ok(image_view),
            AttachmentKind::Depth => target.depth_view().ok_or_else(|| {
                GpuError::InvalidArgument("Target has no depth view".to_string())
            }),
        })
        .collect()
}

fn destroy_all(device: &dyn DeviceContext, framebuffers: &[vk::Framebuffer]) {
    for &framebuffer in framebuffers {
        unsafe { device.destroy_framebuffer(framebuffer) };
    }
}
