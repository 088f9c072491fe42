//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    /// The device rejected construction of a buffer, pipeline, render pass,
    /// framebuffer, command pool or shader module.
    #[error("Failed to create {resource}: {source}")]
    ResourceCreation {
        resource: &'static str,
        source: vk::Result,
    },

    /// No memory type satisfies both the requirement mask and the requested properties.
    #[error("No memory type matches type bits {type_bits:#b} with properties {requested:?}")]
    MemoryTypeUnavailable {
        type_bits: u32,
        requested: vk::MemoryPropertyFlags,
    },

    /// Semaphore or fence creation, wait or reset failed.
    #[error("Synchronization failure during {operation}: {source}")]
    Synchronization {
        operation: &'static str,
        source: vk::Result,
    },

    /// The queue rejected a submission.
    #[error("Queue submission failed: {0}")]
    Submission(vk::Result),

    /// The device context is no longer valid; every resource must be re-created.
    #[error("Device lost")]
    DeviceLost,

    /// Host access was requested on memory that is not host-visible.
    #[error("Buffer memory is not host-visible; upload through a staging buffer")]
    HostAccessDenied,

    /// The swapchain no longer matches the surface and must be rebuilt.
    #[error("Swapchain out of date")]
    SwapchainOutOfDate,

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Memory allocation through the attachment allocator failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Invalid argument passed by the caller.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Vulkan error outside of the categories above.
    #[error("Vulkan error: {0}")]
    Vulkan(vk::Result),
}

impl GpuError {
    /// Creation failure for `resource`.
    pub fn creation(resource: &'static str, source: vk::Result) -> Self {
        match source {
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            source => Self::ResourceCreation { resource, source },
        }
    }

    /// Synchronization failure during `operation`.
    pub fn sync(operation: &'static str, source: vk::Result) -> Self {
        match source {
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            source => Self::Synchronization { operation, source },
        }
    }

    /// Queue submission failure.
    pub fn submission(source: vk::Result) -> Self {
        match source {
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            source => Self::Submission(source),
        }
    }

    /// Whether the error requires full device and resource re-acquisition.
    pub fn is_device_lost(&self) -> bool {
        matches!(self, Self::DeviceLost)
    }
}

impl From<vk::Result> for GpuError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::ERROR_OUT_OF_DATE_KHR => Self::SwapchainOutOfDate,
            other => Self::Vulkan(other),
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
