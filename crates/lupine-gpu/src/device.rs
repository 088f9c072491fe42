//! Device context boundary.
//!
//! Every resource in this crate is created, used and destroyed through a
//! [`DeviceContext`]. [`GpuContext`](crate::GpuContext) implements it on top of
//! `ash`; tests substitute a recording fake.
//!
//! Methods return raw [`VkResult`]s. Callers classify failures into
//! [`GpuError`](crate::GpuError) categories, so an implementation only reports
//! what the driver said.

use ash::prelude::VkResult;
use ash::vk;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-unique identity of a device context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u64);

impl DeviceId {
    /// Allocate a fresh identity.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// One queue submission.
#[derive(Debug, Clone, Copy)]
pub struct QueueSubmit<'a> {
    /// Command buffers executed in order.
    pub command_buffers: &'a [vk::CommandBuffer],
    /// Semaphores waited on before the stages in `wait_stages` run.
    pub wait_semaphores: &'a [vk::Semaphore],
    /// One stage mask per wait semaphore.
    pub wait_stages: &'a [vk::PipelineStageFlags],
    /// Semaphores signaled once the command buffers complete.
    pub signal_semaphores: &'a [vk::Semaphore],
    /// Fence signaled once the whole submission has retired, or null.
    pub fence: vk::Fence,
}

/// The logical/physical device pair and its graphics queue.
///
/// # Safety
/// All `unsafe` methods forward to the native API. Handles passed in must have
/// been created by this same context and must not have been destroyed, and
/// create-info structures must be valid for the native call. Destroying a
/// handle still referenced by in-flight GPU work is undefined.
pub trait DeviceContext: Send + Sync {
    /// Identity used to key per-device state such as pipeline caches.
    fn id(&self) -> DeviceId;

    /// Human-readable device name for diagnostics.
    fn name(&self) -> &str;

    /// Memory types and heaps of the physical device.
    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties;

    /// Queue used for graphics submissions and presentation.
    fn graphics_queue(&self) -> vk::Queue;

    /// Family index of [`graphics_queue`](Self::graphics_queue).
    fn graphics_queue_family(&self) -> u32;

    // Buffers and memory

    unsafe fn create_buffer(&self, info: &vk::BufferCreateInfo<'_>) -> VkResult<vk::Buffer>;
    unsafe fn buffer_memory_requirements(&self, buffer: vk::Buffer) -> vk::MemoryRequirements;
    unsafe fn allocate_memory(
        &self,
        info: &vk::MemoryAllocateInfo<'_>,
    ) -> VkResult<vk::DeviceMemory>;
    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()>;
    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<*mut u8>;
    unsafe fn flush_mapped_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()>;
    unsafe fn invalidate_mapped_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<()>;
    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory);
    unsafe fn destroy_buffer(&self, buffer: vk::Buffer);
    unsafe fn free_memory(&self, memory: vk::DeviceMemory);

    // Pipeline caches, shaders and pipelines

    unsafe fn create_pipeline_cache(&self, initial_data: &[u8]) -> VkResult<vk::PipelineCache>;
    unsafe fn pipeline_cache_data(&self, cache: vk::PipelineCache) -> VkResult<Vec<u8>>;
    unsafe fn destroy_pipeline_cache(&self, cache: vk::PipelineCache);
    unsafe fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule>;
    unsafe fn destroy_shader_module(&self, module: vk::ShaderModule);
    unsafe fn create_pipeline_layout(
        &self,
        info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> VkResult<vk::PipelineLayout>;
    unsafe fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    unsafe fn create_graphics_pipeline(
        &self,
        cache: vk::PipelineCache,
        info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> VkResult<vk::Pipeline>;
    unsafe fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    // Render passes and framebuffers

    unsafe fn create_render_pass(
        &self,
        info: &vk::RenderPassCreateInfo<'_>,
    ) -> VkResult<vk::RenderPass>;
    unsafe fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    unsafe fn create_framebuffer(
        &self,
        info: &vk::FramebufferCreateInfo<'_>,
    ) -> VkResult<vk::Framebuffer>;
    unsafe fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    // Command pools and recording

    unsafe fn create_command_pool(
        &self,
        info: &vk::CommandPoolCreateInfo<'_>,
    ) -> VkResult<vk::CommandPool>;
    unsafe fn destroy_command_pool(&self, pool: vk::CommandPool);
    unsafe fn allocate_command_buffers(
        &self,
        info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> VkResult<Vec<vk::CommandBuffer>>;
    unsafe fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]);
    unsafe fn begin_command_buffer(
        &self,
        cmd: vk::CommandBuffer,
        info: &vk::CommandBufferBeginInfo<'_>,
    ) -> VkResult<()>;
    unsafe fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()>;
    unsafe fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()>;

    unsafe fn cmd_begin_render_pass(
        &self,
        cmd: vk::CommandBuffer,
        info: &vk::RenderPassBeginInfo<'_>,
    );
    unsafe fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer);
    unsafe fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline);
    unsafe fn cmd_bind_descriptor_sets(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    );
    unsafe fn cmd_set_viewport(&self, cmd: vk::CommandBuffer, viewports: &[vk::Viewport]);
    unsafe fn cmd_set_scissor(&self, cmd: vk::CommandBuffer, scissors: &[vk::Rect2D]);
    unsafe fn cmd_push_constants(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    );
    unsafe fn cmd_bind_vertex_buffers(
        &self,
        cmd: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    );
    unsafe fn cmd_bind_index_buffer(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    );
    unsafe fn cmd_draw(
        &self,
        cmd: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );
    unsafe fn cmd_draw_indexed(
        &self,
        cmd: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
    unsafe fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );

    // Synchronization and submission

    unsafe fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    unsafe fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    unsafe fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    unsafe fn destroy_fence(&self, fence: vk::Fence);
    /// Block until `fence` is signaled or `timeout_ns` elapses (`TIMEOUT`).
    unsafe fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()>;
    unsafe fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;
    unsafe fn queue_submit(&self, queue: vk::Queue, submit: &QueueSubmit<'_>) -> VkResult<()>;
    unsafe fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()>;
    unsafe fn device_wait_idle(&self) -> VkResult<()>;
}
