//! Frame orchestration.
//!
//! [`FrameOrchestrator`] owns the render pass, the framebuffers, one command
//! buffer per presentation image and a ring of [`SyncSet`](crate::SyncSet)s.
//! Each frame it retires the current slot's previous submission, re-records
//! every command buffer if draw state changed, acquires an image, submits and
//! presents.
//!
//! A command buffer is never reset, re-recorded or re-submitted while a
//! submission that uses it is still pending on its fence.

use crate::buffer::Buffer;
use crate::command::CommandBuffers;
use crate::device::{DeviceContext, QueueSubmit};
use crate::error::{GpuError, Result};
use crate::framebuffer::FrameBuffers;
use crate::pipeline::Pipeline;
use crate::render_pass::{full_scissor, full_viewport, AttachmentDesc, RenderPass};
use crate::swapchain::PresentationTarget;
use crate::sync::FrameSyncManager;
use ash::vk;
use std::sync::Arc;

/// Cornflower blue, the default clear color.
pub const CORNFLOWER_BLUE: [f32; 4] = [100.0 / 255.0, 149.0 / 255.0, 237.0 / 255.0, 1.0];

/// Frame loop configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameConfig {
    /// Frames the CPU may run ahead of the GPU. Clamped to `1..=image count`.
    pub frames_in_flight: usize,
    /// Timeout for fence waits and image acquisition, in nanoseconds.
    pub fence_timeout_ns: u64,
    pub clear_color: [f32; 4],
    pub clear_depth: f32,
    pub clear_stencil: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            fence_timeout_ns: u64::MAX,
            clear_color: CORNFLOWER_BLUE,
            clear_depth: 1.0,
            clear_stencil: 0,
        }
    }
}

impl FrameConfig {
    /// Set the number of frames in flight.
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    /// Set the fence wait timeout.
    pub fn with_fence_timeout(mut self, timeout_ns: u64) -> Self {
        self.fence_timeout_ns = timeout_ns;
        self
    }

    /// Set the clear color.
    pub fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }

    /// Set the depth and stencil clear values.
    pub fn with_clear_depth_stencil(mut self, depth: f32, stencil: u32) -> Self {
        self.clear_depth = depth;
        self.clear_stencil = stencil;
        self
    }
}

/// Lifecycle of the command buffer of one presentation image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotState {
    /// Recorded (or never recorded) and not submitted.
    #[default]
    Idle,
    /// Between `begin` and `end`.
    Recording,
    /// Submitted; its fence has not been observed signaled yet.
    Submitted,
    /// Its last submission's fence has signaled.
    Retired,
}

/// Outcome of a presented frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReport {
    pub image_index: u32,
    pub frame_number: u64,
    /// Whether the command buffers were re-recorded for this frame.
    pub rerecorded: bool,
}

/// Result of [`FrameOrchestrator::render_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// The frame was submitted and presented.
    Presented(FrameReport),
    /// The target is out of date or suboptimal; call
    /// [`FrameOrchestrator::resize`] after rebuilding it. Carries the report
    /// when the frame was still submitted.
    NeedsResize(Option<FrameReport>),
}

impl FrameStatus {
    /// Whether the target has to be rebuilt.
    pub fn needs_resize(&self) -> bool {
        matches!(self, Self::NeedsResize(_))
    }

    /// Report of the submitted frame, if one was submitted.
    pub fn report(&self) -> Option<FrameReport> {
        match *self {
            Self::Presented(report) => Some(report),
            Self::NeedsResize(report) => report,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ImageSlot {
    state: SlotState,
    /// Frame slot whose fence guards the last submission of this image.
    fence_slot: Option<usize>,
}

/// Drives recording, submission, fence waits and presentation.
pub struct FrameOrchestrator {
    device: Arc<dyn DeviceContext>,
    config: FrameConfig,
    attachments: Vec<AttachmentDesc>,
    render_pass: RenderPass,
    framebuffers: FrameBuffers,
    commands: CommandBuffers,
    sync: FrameSyncManager,
    images: Vec<ImageSlot>,
    slot_pending: Vec<bool>,
    dirty: bool,
    needs_rebuild: bool,
    frame_number: u64,
    released: bool,
}

impl FrameOrchestrator {
    /// Build the render pass, framebuffers, command buffers and sync slots for `target`.
    ///
    /// Attachments with an `UNDEFINED` format take the target's formats.
    /// The command buffers start dirty, so the first frame records them.
    pub fn new(
        device: &Arc<dyn DeviceContext>,
        target: &dyn PresentationTarget,
        attachments: &[AttachmentDesc],
        config: FrameConfig,
    ) -> Result<Self> {
        let image_count = target.image_count();
        if image_count == 0 {
            return Err(GpuError::InvalidArgument(
                "Presentation target has no images".to_string(),
            ));
        }

        let (render_pass, framebuffers) = build_targets(device, target, attachments)?;
        let commands = CommandBuffers::load(device, image_count)?;
        let frames_in_flight = config.frames_in_flight.clamp(1, image_count);
        let sync = FrameSyncManager::new(device, frames_in_flight)?;

        tracing::info!(
            "Frame orchestrator: {} images, {} frames in flight",
            image_count,
            frames_in_flight
        );

        Ok(Self {
            device: Arc::clone(device),
            config,
            attachments: attachments.to_vec(),
            render_pass,
            framebuffers,
            commands,
            sync,
            images: vec![ImageSlot::default(); image_count],
            slot_pending: vec![false; frames_in_flight],
            dirty: true,
            needs_rebuild: false,
            frame_number: 0,
            released: false,
        })
    }

    /// Request a re-record of every command buffer before the next submission.
    pub fn mark_dirty(&mut self) {
        if !self.dirty {
            tracing::trace!("Command buffers marked dirty");
        }
        self.dirty = true;
    }

    /// Whether the next frame re-records.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// State of the command buffer of image `index`.
    pub fn slot_state(&self, index: usize) -> Option<SlotState> {
        self.images.get(index).map(|slot| slot.state)
    }

    /// Change the clear color; marks the command buffers dirty when it differs.
    pub fn set_clear_color(&mut self, color: [f32; 4]) {
        if self.config.clear_color != color {
            self.config.clear_color = color;
            self.mark_dirty();
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    /// Render pass every pipeline drawn by this orchestrator must be compatible with.
    pub fn render_pass(&self) -> &RenderPass {
        &self.render_pass
    }

    /// Current framebuffers.
    pub fn framebuffers(&self) -> &FrameBuffers {
        &self.framebuffers
    }

    /// Number of frames presented so far.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Effective number of frames in flight.
    pub fn frames_in_flight(&self) -> usize {
        self.sync.len()
    }

    /// Number of presentation images (and command buffers).
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Render and present one frame.
    ///
    /// `record` is invoked once per presentation image, only when the
    /// command buffers are dirty. `extra` command buffers are submitted after
    /// the frame's own buffer in the same submission and must stay valid
    /// until the frame's fence signals.
    ///
    /// Failures of fence waits, submission, acquisition or presentation are
    /// returned unchanged and never retried. A failure after an image was
    /// acquired leaves that image and its semaphore signal stranded, so every
    /// later call returns [`FrameStatus::NeedsResize`] until the target is
    /// rebuilt and [`resize`](Self::resize) has run.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn render_frame<F>(
        &mut self,
        target: &mut dyn PresentationTarget,
        mut record: F,
        extra: &[vk::CommandBuffer],
    ) -> Result<FrameStatus>
    where
        F: FnMut(&mut Recorder<'_>) -> Result<()>,
    {
        self.ensure_live()?;

        if self.needs_rebuild {
            tracing::debug!("Frame skipped until the presentation target is rebuilt");
            return Ok(FrameStatus::NeedsResize(None));
        }

        let slot = self.sync.current_frame();
        self.retire_slot(slot)?;

        // Recording happens before acquisition so a failing callback never
        // leaves an image acquired with nothing submitted for it.
        let rerecorded = self.dirty;
        if self.dirty {
            self.rerecord_all(&mut record)?;
        }

        let image_available = self.sync.current().image_available.handle();
        let render_finished = self.sync.current().render_finished.handle();
        let timeout = self.config.fence_timeout_ns;

        let acquired = match unsafe { target.acquire_next_image(image_available, timeout) } {
            Ok(acquired) => acquired,
            Err(GpuError::SwapchainOutOfDate) => {
                tracing::debug!("Presentation target out of date at acquire");
                return Ok(FrameStatus::NeedsResize(None));
            }
            Err(e) => {
                tracing::error!("Image acquisition failed: {e}");
                return Err(e);
            }
        };

        // From here on the acquire semaphore holds a signal and the image is
        // ours until presented. Failing before present strands both, and only
        // a rebuilt target and sync ring recover from that.
        if let Err(e) = self.submit_image(slot, acquired.index, extra) {
            self.needs_rebuild = true;
            tracing::warn!(
                "Frame {} failed after acquiring image {}; waiting for a rebuild",
                self.frame_number,
                acquired.index
            );
            return Err(e);
        }

        let report = FrameReport {
            image_index: acquired.index,
            frame_number: self.frame_number,
            rerecorded,
        };
        self.frame_number += 1;
        self.sync.advance();

        let queue = self.device.graphics_queue();
        let stale = match unsafe { target.present(queue, acquired.index, render_finished) } {
            Ok(suboptimal) => suboptimal || acquired.suboptimal,
            Err(GpuError::SwapchainOutOfDate) => {
                self.needs_rebuild = true;
                true
            }
            Err(e) => {
                tracing::error!("Presentation failed: {e}");
                self.needs_rebuild = true;
                return Err(e);
            }
        };

        if stale {
            tracing::debug!("Presentation target needs a rebuild");
            Ok(FrameStatus::NeedsResize(Some(report)))
        } else {
            Ok(FrameStatus::Presented(report))
        }
    }

    /// Whether a failed frame stranded an acquired image. Only
    /// [`resize`](Self::resize) clears this.
    pub fn needs_rebuild(&self) -> bool {
        self.needs_rebuild
    }

    /// Rebuild the render pass and framebuffers for a rebuilt target.
    ///
    /// Waits for every pending frame first. Command buffers and sync slots are
    /// recreated when the image count changed. Everything is re-recorded on
    /// the next frame. Pipelines built against the previous render pass stay
    /// usable since the new pass has the same attachments.
    pub fn resize(&mut self, target: &dyn PresentationTarget) -> Result<()> {
        self.ensure_live()?;
        self.wait_idle()?;

        let image_count = target.image_count();
        if image_count == 0 {
            return Err(GpuError::InvalidArgument(
                "Presentation target has no images".to_string(),
            ));
        }

        let (render_pass, framebuffers) = build_targets(&self.device, target, &self.attachments)?;
        self.framebuffers = framebuffers;
        self.render_pass = render_pass;

        if image_count != self.commands.len() {
            self.commands = CommandBuffers::load(&self.device, image_count)?;
        }

        // Acquire or present may have left a semaphore signaled with nothing
        // waiting on it; a fresh ring starts clean.
        let frames_in_flight = self.config.frames_in_flight.clamp(1, image_count);
        self.sync = FrameSyncManager::new(&self.device, frames_in_flight)?;
        self.slot_pending = vec![false; frames_in_flight];
        self.images = vec![ImageSlot::default(); image_count];

        self.dirty = true;
        self.needs_rebuild = false;

        let extent = self.framebuffers.extent();
        tracing::info!(
            "Resized frame targets to {}x{} ({} images)",
            extent.width,
            extent.height,
            image_count
        );

        Ok(())
    }

    /// Wait for every pending frame, then for the whole device.
    pub fn wait_idle(&mut self) -> Result<()> {
        for slot in 0..self.slot_pending.len() {
            self.retire_slot(slot)?;
        }
        unsafe { self.device.device_wait_idle() }
            .map_err(|e| GpuError::sync("device wait idle", e))
    }

    /// Wait for the GPU and destroy everything. Calling this again is a no-op.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.wait_idle() {
            tracing::warn!("Waiting for idle before release failed: {e}");
        }

        self.framebuffers.release();
        self.render_pass.release();
        self.commands.release();
        self.sync.release();
        self.released = true;

        tracing::debug!("Frame orchestrator released");
    }

    fn ensure_live(&self) -> Result<()> {
        if self.released {
            return Err(GpuError::InvalidState(
                "Frame orchestrator already released".to_string(),
            ));
        }
        Ok(())
    }

    /// Block on slot `slot`'s fence if it guards a submission, then mark the
    /// images it guarded retired.
    fn retire_slot(&mut self, slot: usize) -> Result<()> {
        if !self.slot_pending.get(slot).copied().unwrap_or(false) {
            return Ok(());
        }

        let fence = &self
            .sync
            .get(slot)
            .ok_or_else(|| GpuError::InvalidState(format!("No frame slot {slot}")))?
            .in_flight;
        fence.wait(self.config.fence_timeout_ns).map_err(|e| {
            tracing::error!("Waiting for frame slot {slot} failed: {e}");
            e
        })?;

        self.slot_pending[slot] = false;
        for image in &mut self.images {
            if image.fence_slot == Some(slot) {
                image.state = SlotState::Retired;
                image.fence_slot = None;
            }
        }

        Ok(())
    }

    fn rerecord_all<F>(&mut self, record: &mut F) -> Result<()>
    where
        F: FnMut(&mut Recorder<'_>) -> Result<()>,
    {
        for slot in 0..self.slot_pending.len() {
            self.retire_slot(slot)?;
        }

        tracing::debug!("Re-recording {} command buffers", self.images.len());

        for index in 0..self.images.len() {
            self.images[index].state = SlotState::Recording;
            let result = self.record_image(index, record);
            self.images[index].state = SlotState::Idle;

            if let Err(e) = result {
                tracing::error!("Recording command buffer {index} failed: {e}");
                if let Some(cmd) = self.commands.get(index) {
                    self.render_pass.abandon(cmd);
                }
                if let Err(reset_error) = self.commands.reset(index) {
                    tracing::warn!("Resetting command buffer {index} failed: {reset_error}");
                }
                return Err(e);
            }
        }

        self.dirty = false;
        Ok(())
    }

    /// Submit image `index`'s command buffer on frame slot `slot`.
    fn submit_image(&mut self, slot: usize, index: u32, extra: &[vk::CommandBuffer]) -> Result<()> {
        let Some(image) = self.images.get(index as usize).copied() else {
            return Err(GpuError::InvalidState(format!(
                "Acquired image {index} but only {} exist",
                self.images.len()
            )));
        };

        if let Some(other) = image.fence_slot {
            self.retire_slot(other)?;
        }

        let cmd = self.commands.get(index as usize).ok_or_else(|| {
            GpuError::InvalidState(format!("No command buffer for image {index}"))
        })?;

        let sync = self.sync.current();
        sync.in_flight.reset()?;

        let mut command_buffers = Vec::with_capacity(1 + extra.len());
        command_buffers.push(cmd);
        command_buffers.extend_from_slice(extra);

        let wait_semaphores = [sync.image_available.handle()];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [sync.render_finished.handle()];
        let submit = QueueSubmit {
            command_buffers: &command_buffers,
            wait_semaphores: &wait_semaphores,
            wait_stages: &wait_stages,
            signal_semaphores: &signal_semaphores,
            fence: sync.in_flight.handle(),
        };

        let queue = self.device.graphics_queue();
        unsafe { self.device.queue_submit(queue, &submit) }.map_err(|e| {
            tracing::error!(
                "Frame {} submission on {} failed: {e}",
                self.frame_number,
                self.device.name()
            );
            GpuError::submission(e)
        })?;

        self.slot_pending[slot] = true;
        self.images[index as usize] = ImageSlot {
            state: SlotState::Submitted,
            fence_slot: Some(slot),
        };
        Ok(())
    }

    fn record_image<F>(&mut self, index: usize, record: &mut F) -> Result<()>
    where
        F: FnMut(&mut Recorder<'_>) -> Result<()>,
    {
        let framebuffer = self.framebuffers.get(index).ok_or_else(|| {
            GpuError::InvalidState(format!("No framebuffer for image {index}"))
        })?;
        let cmd = self.commands.begin(index)?;

        let mut recorder = Recorder {
            device: self.device.as_ref(),
            render_pass: &mut self.render_pass,
            cmd,
            image_index: index as u32,
            framebuffer,
            config: &self.config,
        };
        record(&mut recorder)?;

        if self.render_pass.is_active(cmd) {
            return Err(GpuError::InvalidState(format!(
                "Render pass left open in command buffer {index}"
            )));
        }

        self.commands.end(index)
    }
}

impl Drop for FrameOrchestrator {
    fn drop(&mut self) {
        self.release();
    }
}

fn build_targets(
    device: &Arc<dyn DeviceContext>,
    target: &dyn PresentationTarget,
    attachments: &[AttachmentDesc],
) -> Result<(RenderPass, FrameBuffers)> {
    let resolved = AttachmentDesc::resolve_formats(attachments, target)?;
    let extent = target.extent();
    let render_pass = RenderPass::load(
        device,
        full_viewport(extent),
        full_scissor(extent),
        &resolved,
    )?;
    let framebuffers = FrameBuffers::load(device, &render_pass, target)?;
    Ok((render_pass, framebuffers))
}

/// Recording view of one command buffer, handed to the record callback.
pub struct Recorder<'a> {
    device: &'a dyn DeviceContext,
    render_pass: &'a mut RenderPass,
    cmd: vk::CommandBuffer,
    image_index: u32,
    framebuffer: vk::Framebuffer,
    config: &'a FrameConfig,
}

impl Recorder<'_> {
    /// The command buffer being recorded.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.cmd
    }

    /// Presentation image this command buffer renders to.
    pub fn image_index(&self) -> u32 {
        self.image_index
    }

    /// Framebuffer of [`image_index`](Self::image_index).
    pub fn framebuffer(&self) -> vk::Framebuffer {
        self.framebuffer
    }

    /// Render area of the pass.
    pub fn extent(&self) -> vk::Extent2D {
        self.render_pass.scissor().extent
    }

    /// Begin the render pass with the configured clear values and set the
    /// dynamic viewport and scissor.
    pub fn begin_render_pass(&mut self) -> Result<()> {
        self.begin_render_pass_with(
            self.config.clear_color,
            self.config.clear_depth,
            self.config.clear_stencil,
        )
    }

    /// Begin the render pass with explicit clear values.
    pub fn begin_render_pass_with(
        &mut self,
        clear_color: [f32; 4],
        depth: f32,
        stencil: u32,
    ) -> Result<()> {
        unsafe {
            self.render_pass
                .begin(self.cmd, self.framebuffer, clear_color, depth, stencil)?;
            self.device
                .cmd_set_viewport(self.cmd, &[self.render_pass.viewport()]);
            self.device
                .cmd_set_scissor(self.cmd, &[self.render_pass.scissor()]);
        }
        Ok(())
    }

    /// End the render pass.
    pub fn end_render_pass(&mut self) -> Result<()> {
        unsafe { self.render_pass.end(self.cmd) }
    }

    /// Bind `pipeline` and its descriptor sets.
    pub fn bind_pipeline(&self, pipeline: &Pipeline, descriptor_sets: &[vk::DescriptorSet]) {
        unsafe { pipeline.bind(self.cmd, descriptor_sets) };
    }

    /// Push `value` at offset 0 to every stage of the pipeline's push-constant ranges.
    pub fn push_constants<T: bytemuck::Pod>(&self, pipeline: &Pipeline, value: &T) -> Result<()> {
        let stages = pipeline.push_constant_stages();
        if stages.is_empty() {
            return Err(GpuError::InvalidArgument(
                "Pipeline layout has no push-constant ranges".to_string(),
            ));
        }
        self.push_constant_bytes(pipeline, stages, 0, bytemuck::bytes_of(value))
    }

    /// Push raw bytes to `stages` at `offset`.
    pub fn push_constant_bytes(
        &self,
        pipeline: &Pipeline,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) -> Result<()> {
        let end = u64::from(offset) + data.len() as u64;
        let covered = pipeline.push_constant_ranges().iter().any(|range| {
            range.stage_flags.contains(stages)
                && range.offset <= offset
                && u64::from(range.offset) + u64::from(range.size) >= end
        });
        if !covered {
            return Err(GpuError::InvalidArgument(format!(
                "Push constants {offset}..{end} for {stages:?} are outside the layout's ranges"
            )));
        }

        unsafe {
            self.device
                .cmd_push_constants(self.cmd, pipeline.layout(), stages, offset, data);
        }
        Ok(())
    }

    /// Bind a vertex buffer at `binding`.
    pub fn bind_vertex_buffer(&self, binding: u32, buffer: &Buffer, offset: vk::DeviceSize) {
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(self.cmd, binding, &[buffer.handle()], &[offset]);
        }
    }

    /// Bind an index buffer.
    pub fn bind_index_buffer(
        &self,
        buffer: &Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        unsafe {
            self.device
                .cmd_bind_index_buffer(self.cmd, buffer.handle(), offset, index_type);
        }
    }

    /// Non-indexed draw.
    pub fn draw(
        &self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw(
                self.cmd,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            );
        }
    }

    /// Indexed draw.
    pub fn draw_indexed(
        &self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw_indexed(
                self.cmd,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
    }
}

/// Typed push-constant value that marks the orchestrator dirty only when it changes.
#[derive(Debug, Clone, Copy)]
pub struct PushConstants<T> {
    value: T,
}

impl<T: bytemuck::Pod + PartialEq> PushConstants<T> {
    /// Wrap an initial value.
    pub fn new(value: T) -> Self {
        Self { value }
    }

    /// Current value.
    pub fn get(&self) -> &T {
        &self.value
    }

    /// Store `value`; returns whether it differed and the orchestrator was marked dirty.
    pub fn set(&mut self, value: T, frames: &mut FrameOrchestrator) -> bool {
        if self.value == value {
            return false;
        }
        self.value = value;
        frames.mark_dirty();
        true
    }

    /// Byte view of the current value.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(&self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = FrameConfig::default();
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.fence_timeout_ns, u64::MAX);
        assert_eq!(config.clear_color, CORNFLOWER_BLUE);
        assert_eq!((config.clear_depth, config.clear_stencil), (1.0, 0));

        let config = config
            .with_frames_in_flight(3)
            .with_clear_depth_stencil(0.0, 1);
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!((config.clear_depth, config.clear_stencil), (0.0, 1));
    }

    #[test]
    fn frame_status_accessors() {
        let report = FrameReport {
            image_index: 1,
            frame_number: 7,
            rerecorded: false,
        };
        assert!(!FrameStatus::Presented(report).needs_resize());
        assert_eq!(FrameStatus::Presented(report).report(), Some(report));
        assert!(FrameStatus::NeedsResize(None).needs_resize());
        assert_eq!(FrameStatus::NeedsResize(None).report(), None);
    }
}
