//! GPU resource and frame synchronization layer for the Lupine engine.
//!
//! This crate provides:
//! - Memory-backed buffers with explicit memory type selection
//! - A shared registry of named pipeline caches
//! - Graphics pipeline state objects
//! - Render passes and per-image framebuffers
//! - Command buffers, semaphores and fences
//! - A frame orchestrator that records, submits and presents
//!
//! Everything talks to the GPU through the [`DeviceContext`] trait, which
//! [`GpuContext`] implements on top of Vulkan.

pub mod buffer;
pub mod command;
pub mod context;
pub mod device;
pub mod error;
pub mod frame;
pub mod framebuffer;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod pipeline_cache;
pub mod render_pass;
pub mod swapchain;
pub mod sync;

pub use buffer::Buffer;
pub use command::{CommandBuffers, CommandPool};
pub use context::{GpuContext, GpuContextBuilder};
pub use device::{DeviceContext, DeviceId, QueueSubmit};
pub use error::{GpuError, Result};
pub use frame::{
    FrameConfig, FrameOrchestrator, FrameReport, FrameStatus, PushConstants, Recorder, SlotState,
    CORNFLOWER_BLUE,
};
pub use framebuffer::FrameBuffers;
pub use memory::{select_memory_type, GpuAllocator, GpuImage};
pub use pipeline::{
    create_pipeline_layout, BlendState, DepthStencilConfig, InputAssemblyConfig,
    MultisampleConfig, Pipeline, PipelineConfig, PipelineLayoutDesc, RasterizationConfig,
    ShaderSet, ShaderStage, VertexInputLayout,
};
pub use pipeline_cache::PipelineCacheRegistry;
pub use render_pass::{full_scissor, full_viewport, AttachmentDesc, AttachmentKind, RenderPass};
pub use swapchain::{AcquiredImage, PresentationTarget, Swapchain};
pub use sync::{Fence, FrameSyncManager, Semaphore, SyncSet};

pub use ash::vk;
