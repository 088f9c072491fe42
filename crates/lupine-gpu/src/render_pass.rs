//! Render passes.

use crate::device::DeviceContext;
use crate::error::{GpuError, Result};
use crate::swapchain::PresentationTarget;
use ash::vk;
use std::collections::HashSet;
use std::sync::Arc;

/// Role of an attachment in the single subpass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentKind {
    /// Color output. Backed by the swapchain image unless the pass resolves.
    Color,
    /// Depth/stencil buffer.
    Depth,
    /// Single-sample resolve target of a multisampled color attachment.
    Resolve,
}

/// Description of one attachment.
///
/// A format of `UNDEFINED` is filled in from the presentation target by
/// [`resolve_formats`](Self::resolve_formats).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttachmentDesc {
    pub kind: AttachmentKind,
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

impl AttachmentDesc {
    /// Cleared color attachment presented at the end of the pass.
    pub fn color() -> Self {
        Self {
            kind: AttachmentKind::Color,
            format: vk::Format::UNDEFINED,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }

    /// Cleared depth attachment whose contents are discarded after the pass.
    pub fn depth() -> Self {
        Self {
            kind: AttachmentKind::Depth,
            format: vk::Format::UNDEFINED,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        }
    }

    /// Resolve target presented at the end of the pass.
    pub fn resolve() -> Self {
        Self {
            kind: AttachmentKind::Resolve,
            load_op: vk::AttachmentLoadOp::DONT_CARE,
            ..Self::color()
        }
    }

    /// Use an explicit format.
    pub fn with_format(mut self, format: vk::Format) -> Self {
        self.format = format;
        self
    }

    /// Use a sample count other than one.
    pub fn with_samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }

    /// Replace load and store operations.
    pub fn with_ops(
        mut self,
        load_op: vk::AttachmentLoadOp,
        store_op: vk::AttachmentStoreOp,
    ) -> Self {
        self.load_op = load_op;
        self.store_op = store_op;
        self
    }

    /// Fill `UNDEFINED` formats from the presentation target.
    pub fn resolve_formats(
        attachments: &[Self],
        target: &dyn PresentationTarget,
    ) -> Result<Vec<Self>> {
        attachments
            .iter()
            .map(|desc| {
                if desc.format != vk::Format::UNDEFINED {
                    return Ok(*desc);
                }
                let format = match desc.kind {
                    AttachmentKind::Color | AttachmentKind::Resolve => target.color_format(),
                    AttachmentKind::Depth => target.depth_format().ok_or_else(|| {
                        GpuError::InvalidArgument(
                            "Depth attachment requested but the target has no depth buffer"
                                .to_string(),
                        )
                    })?,
                };
                Ok(desc.with_format(format))
            })
            .collect()
    }
}

/// A single-subpass render pass together with its viewport and scissor.
///
/// Viewport and scissor are baked at load; a resized target needs a new pass.
pub struct RenderPass {
    device: Arc<dyn DeviceContext>,
    handle: vk::RenderPass,
    attachments: Vec<AttachmentDesc>,
    viewport: vk::Viewport,
    scissor: vk::Rect2D,
    active: HashSet<vk::CommandBuffer>,
}

impl RenderPass {
    /// Build a render pass for `attachments`.
    ///
    /// Takes exactly one color attachment, at most one depth attachment and at
    /// most one resolve attachment.
    pub fn load(
        device: &Arc<dyn DeviceContext>,
        viewport: vk::Viewport,
        scissor: vk::Rect2D,
        attachments: &[AttachmentDesc],
    ) -> Result<Self> {
        validate_attachments(attachments)?;

        let descriptions: Vec<vk::AttachmentDescription> = attachments
            .iter()
            .map(|desc| {
                vk::AttachmentDescription::default()
                    .format(desc.format)
                    .samples(desc.samples)
                    .load_op(desc.load_op)
                    .store_op(desc.store_op)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(desc.initial_layout)
                    .final_layout(desc.final_layout)
            })
            .collect();

        let refs_of = |kind: AttachmentKind, layout: vk::ImageLayout| {
            attachments
                .iter()
                .enumerate()
                .filter(|(_, desc)| desc.kind == kind)
                .map(|(index, _)| vk::AttachmentReference {
                    attachment: index as u32,
                    layout,
                })
                .collect::<Vec<_>>()
        };

        let color_refs = refs_of(
            AttachmentKind::Color,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        let resolve_refs = refs_of(
            AttachmentKind::Resolve,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        let depth_refs = refs_of(
            AttachmentKind::Depth,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        );

        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if !resolve_refs.is_empty() {
            subpass = subpass.resolve_attachments(&resolve_refs);
        }
        if let Some(depth_ref) = depth_refs.first() {
            subpass = subpass.depth_stencil_attachment(depth_ref);
        }

        // The depth image is shared by every framebuffer, so the previous
        // frame's depth writes must finish before this pass clears it.
        let attachment_stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
        let dependency = vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(attachment_stages)
            .dst_stage_mask(attachment_stages)
            .src_access_mask(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            );

        let subpasses = [subpass];
        let dependencies = [dependency];
        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&descriptions)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let handle = unsafe { device.create_render_pass(&create_info) }.map_err(|e| {
            tracing::error!("Creating render pass on {} failed: {e}", device.name());
            GpuError::creation("render pass", e)
        })?;

        tracing::debug!(
            "Render pass with {} attachments, {}x{}",
            attachments.len(),
            scissor.extent.width,
            scissor.extent.height
        );

        Ok(Self {
            device: Arc::clone(device),
            handle,
            attachments: attachments.to_vec(),
            viewport,
            scissor,
            active: HashSet::new(),
        })
    }

    /// Begin a render pass instance in `cmd`.
    ///
    /// Color and resolve attachments are cleared to `clear_color`, depth to
    /// `depth` and stencil to `stencil`.
    ///
    /// # Safety
    /// `cmd` must belong to this pass's device and be in the recording state.
    pub unsafe fn begin(
        &mut self,
        cmd: vk::CommandBuffer,
        framebuffer: vk::Framebuffer,
        clear_color: [f32; 4],
        depth: f32,
        stencil: u32,
    ) -> Result<()> {
        if self.handle == vk::RenderPass::null() {
            return Err(GpuError::InvalidState("Render pass released".to_string()));
        }
        if self.active.contains(&cmd) {
            return Err(GpuError::InvalidState(
                "Render pass already begun on this command buffer".to_string(),
            ));
        }

        let clear_values: Vec<vk::ClearValue> = self
            .attachments
            .iter()
            .map(|desc| match desc.kind {
                AttachmentKind::Depth => vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
                },
                AttachmentKind::Color | AttachmentKind::Resolve => vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: clear_color,
                    },
                },
            })
            .collect();

        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.handle)
            .framebuffer(framebuffer)
            .render_area(self.scissor)
            .clear_values(&clear_values);

        self.device.cmd_begin_render_pass(cmd, &begin_info);
        self.active.insert(cmd);

        Ok(())
    }

    /// End the render pass instance open in `cmd`.
    ///
    /// # Safety
    /// `cmd` must be the command buffer passed to [`begin`](Self::begin).
    pub unsafe fn end(&mut self, cmd: vk::CommandBuffer) -> Result<()> {
        if !self.active.remove(&cmd) {
            return Err(GpuError::InvalidState(
                "No render pass begun on this command buffer".to_string(),
            ));
        }
        self.device.cmd_end_render_pass(cmd);
        Ok(())
    }

    /// Whether a render pass instance is open in `cmd`.
    pub fn is_active(&self, cmd: vk::CommandBuffer) -> bool {
        self.active.contains(&cmd)
    }

    /// Forget an instance left open by an abandoned recording.
    pub(crate) fn abandon(&mut self, cmd: vk::CommandBuffer) {
        self.active.remove(&cmd);
    }

    /// Raw handle; null after release.
    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    /// Attachments in attachment-index order.
    pub fn attachments(&self) -> &[AttachmentDesc] {
        &self.attachments
    }

    /// Number of color attachments in the subpass.
    pub fn color_attachment_count(&self) -> usize {
        self.attachments
            .iter()
            .filter(|desc| desc.kind == AttachmentKind::Color)
            .count()
    }

    /// Whether the subpass has a depth attachment.
    pub fn has_depth(&self) -> bool {
        self.attachments
            .iter()
            .any(|desc| desc.kind == AttachmentKind::Depth)
    }

    /// Viewport baked at load.
    pub fn viewport(&self) -> vk::Viewport {
        self.viewport
    }

    /// Scissor baked at load; also the render area.
    pub fn scissor(&self) -> vk::Rect2D {
        self.scissor
    }

    /// Destroy the render pass. Calling this again is a no-op.
    pub fn release(&mut self) {
        if self.handle != vk::RenderPass::null() {
            unsafe { self.device.destroy_render_pass(self.handle) };
            self.handle = vk::RenderPass::null();
        }
        self.active.clear();
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        self.release();
    }
}

/// Viewport covering `extent` with the depth range `[0, 1]`.
pub fn full_viewport(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

/// Scissor covering `extent`.
pub fn full_scissor(extent: vk::Extent2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    }
}

fn validate_attachments(attachments: &[AttachmentDesc]) -> Result<()> {
    let count = |kind| attachments.iter().filter(|desc| desc.kind == kind).count();
    let (colors, depths, resolves) = (
        count(AttachmentKind::Color),
        count(AttachmentKind::Depth),
        count(AttachmentKind::Resolve),
    );

    // Framebuffers bind one presentation view per image, so a second color
    // attachment would alias it.
    if colors != 1 {
        return Err(GpuError::InvalidArgument(format!(
            "A render pass needs exactly one color attachment, got {colors}"
        )));
    }
    if depths > 1 {
        return Err(GpuError::InvalidArgument(
            "At most one depth attachment is supported".to_string(),
        ));
    }
    if resolves > 1 {
        return Err(GpuError::InvalidArgument(format!(
            "{resolves} resolve attachments for one color attachment"
        )));
    }
    if let Some(desc) = attachments
        .iter()
        .find(|desc| desc.format == vk::Format::UNDEFINED)
    {
        return Err(GpuError::InvalidArgument(format!(
            "{:?} attachment has no format",
            desc.kind
        )));
    }

    Ok(())
}
