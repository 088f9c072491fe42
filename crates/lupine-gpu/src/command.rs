//! Command buffer management.

use crate::device::{DeviceContext, QueueSubmit};
use crate::error::{GpuError, Result};
use ash::vk;
use std::sync::Arc;

/// Command pool on the graphics queue family.
pub struct CommandPool {
    device: Arc<dyn DeviceContext>,
    pool: vk::CommandPool,
}

impl CommandPool {
    /// Create a new command pool.
    pub fn new(device: &Arc<dyn DeviceContext>, flags: vk::CommandPoolCreateFlags) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(device.graphics_queue_family())
            .flags(flags);

        let pool = unsafe { device.create_command_pool(&create_info) }
            .map_err(|e| GpuError::creation("command pool", e))?;

        Ok(Self {
            device: Arc::clone(device),
            pool,
        })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Allocate primary command buffers.
    pub fn allocate_command_buffers(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        if self.pool == vk::CommandPool::null() {
            return Err(GpuError::InvalidState("Command pool released".to_string()));
        }

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| GpuError::creation("command buffers", e))
    }

    /// Record, submit and wait for a throwaway command buffer.
    ///
    /// Blocks on the graphics queue, so this belongs to load-time work such as
    /// staging uploads.
    pub fn execute_single_time_commands<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&dyn DeviceContext, vk::CommandBuffer),
    {
        let cmd = self
            .allocate_command_buffers(1)?
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::InvalidState("No command buffer allocated".to_string()))?;

        let result = self.run_once(cmd, f);

        unsafe { self.device.free_command_buffers(self.pool, &[cmd]) };

        result
    }

    fn run_once<F>(&self, cmd: vk::CommandBuffer, f: F) -> Result<()>
    where
        F: FnOnce(&dyn DeviceContext, vk::CommandBuffer),
    {
        let device = self.device.as_ref();
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            device
                .begin_command_buffer(cmd, &begin_info)
                .map_err(GpuError::from)?;
            f(device, cmd);
            device.end_command_buffer(cmd).map_err(GpuError::from)?;

            let queue = device.graphics_queue();
            device
                .queue_submit(
                    queue,
                    &QueueSubmit {
                        command_buffers: &[cmd],
                        wait_semaphores: &[],
                        wait_stages: &[],
                        signal_semaphores: &[],
                        fence: vk::Fence::null(),
                    },
                )
                .map_err(GpuError::submission)?;
            device
                .queue_wait_idle(queue)
                .map_err(|e| GpuError::sync("queue wait idle", e))?;
        }

        Ok(())
    }

    /// Destroy the pool and every buffer allocated from it. Calling this again is a no-op.
    pub fn release(&mut self) {
        if self.pool != vk::CommandPool::null() {
            unsafe { self.device.destroy_command_pool(self.pool) };
            self.pool = vk::CommandPool::null();
        }
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        self.release();
    }
}

/// One re-recordable primary command buffer per swapchain image.
///
/// A buffer keeps whatever was last recorded into it; the GPU replays that
/// content on every submission until it is recorded again.
pub struct CommandBuffers {
    device: Arc<dyn DeviceContext>,
    pool: CommandPool,
    buffers: Vec<vk::CommandBuffer>,
    recording: Vec<bool>,
}

impl CommandBuffers {
    /// Create a pool and allocate `count` command buffers from it.
    pub fn load(device: &Arc<dyn DeviceContext>, count: usize) -> Result<Self> {
        if count == 0 {
            return Err(GpuError::InvalidArgument(
                "Command buffer count must be non-zero".to_string(),
            ));
        }

        let pool = CommandPool::new(device, vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)?;
        let buffers = pool.allocate_command_buffers(count as u32)?;

        tracing::debug!("Allocated {} command buffers on {}", count, device.name());

        Ok(Self {
            device: Arc::clone(device),
            pool,
            recording: vec![false; buffers.len()],
            buffers,
        })
    }

    /// Start recording buffer `index`, discarding its previous content.
    pub fn begin(&mut self, index: usize) -> Result<vk::CommandBuffer> {
        let cmd = self.checked(index)?;
        if self.recording[index] {
            return Err(GpuError::InvalidState(format!(
                "Command buffer {index} is already recording"
            )));
        }

        let begin_info = vk::CommandBufferBeginInfo::default();
        unsafe { self.device.begin_command_buffer(cmd, &begin_info) }.map_err(GpuError::from)?;
        self.recording[index] = true;

        Ok(cmd)
    }

    /// Finish recording buffer `index`.
    pub fn end(&mut self, index: usize) -> Result<()> {
        let cmd = self.checked(index)?;
        if !self.recording[index] {
            return Err(GpuError::InvalidState(format!(
                "Command buffer {index} is not recording"
            )));
        }

        self.recording[index] = false;
        unsafe { self.device.end_command_buffer(cmd) }.map_err(GpuError::from)
    }

    /// Return buffer `index` to the initial state, dropping a partial recording.
    pub fn reset(&mut self, index: usize) -> Result<()> {
        let cmd = self.checked(index)?;
        self.recording[index] = false;
        unsafe { self.device.reset_command_buffer(cmd) }.map_err(GpuError::from)
    }

    /// Buffer `index`.
    pub fn get(&self, index: usize) -> Option<vk::CommandBuffer> {
        self.buffers.get(index).copied()
    }

    /// Whether buffer `index` is between `begin` and `end`.
    pub fn is_recording(&self, index: usize) -> bool {
        self.recording.get(index).copied().unwrap_or(false)
    }

    /// Number of buffers.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether no buffers are held (only after release).
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Free the buffers and destroy the pool. Calling this again is a no-op.
    pub fn release(&mut self) {
        if !self.buffers.is_empty() && self.pool.handle() != vk::CommandPool::null() {
            unsafe {
                self.device
                    .free_command_buffers(self.pool.handle(), &self.buffers);
            }
        }
        self.buffers.clear();
        self.recording.clear();
        self.pool.release();
    }

    fn checked(&self, index: usize) -> Result<vk::CommandBuffer> {
        self.buffers.get(index).copied().ok_or_else(|| {
            GpuError::InvalidArgument(format!(
                "Command buffer index {index} out of range ({})",
                self.buffers.len()
            ))
        })
    }
}

impl Drop for CommandBuffers {
    fn drop(&mut self) {
        self.release();
    }
}
