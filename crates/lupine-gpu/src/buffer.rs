//! Memory-backed buffers.
//!
//! A [`Buffer`] owns one buffer handle and one dedicated device memory block.
//! The memory type is the first one allowed by the buffer's requirements whose
//! property flags contain every requested flag.

use crate::command::CommandPool;
use crate::device::DeviceContext;
use crate::error::{GpuError, Result};
use crate::memory::{memory_types, select_memory_type};
use ash::vk;
use std::sync::Arc;

/// A buffer with its dedicated memory allocation.
pub struct Buffer {
    device: Arc<dyn DeviceContext>,
    handle: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    memory_flags: vk::MemoryPropertyFlags,
    memory_type_index: u32,
    memory_type_flags: vk::MemoryPropertyFlags,
    bound: bool,
}

impl Buffer {
    /// Create a buffer of `size` bytes and allocate memory for it.
    ///
    /// The memory is not bound yet; call [`bind`](Self::bind) before use.
    /// Nothing is left allocated when this fails.
    pub fn load(
        device: &Arc<dyn DeviceContext>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        if size == 0 {
            return Err(GpuError::InvalidArgument(
                "Buffer size must be non-zero".to_string(),
            ));
        }

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = unsafe { device.create_buffer(&buffer_info) }.map_err(|e| {
            tracing::error!("Creating buffer on {} failed: {e}", device.name());
            GpuError::creation("buffer", e)
        })?;

        let requirements = unsafe { device.buffer_memory_requirements(handle) };
        let properties = device.memory_properties();

        let memory_type_index =
            match select_memory_type(&properties, requirements.memory_type_bits, memory_flags) {
                Ok(index) => index,
                Err(e) => {
                    tracing::error!(
                        "Could not create buffer on {}, requested memory properties {:?} not found",
                        device.name(),
                        memory_flags
                    );
                    unsafe { device.destroy_buffer(handle) };
                    return Err(e);
                }
            };
        let memory_type_flags =
            memory_types(&properties)[memory_type_index as usize].property_flags;

        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let memory = match unsafe { device.allocate_memory(&allocate_info) } {
            Ok(memory) => memory,
            Err(e) => {
                tracing::error!("Allocating buffer memory on {} failed: {e}", device.name());
                unsafe { device.destroy_buffer(handle) };
                return Err(GpuError::creation("buffer memory", e));
            }
        };

        tracing::trace!(
            "Buffer of {} bytes on memory type {} ({:?})",
            size,
            memory_type_index,
            memory_type_flags
        );

        Ok(Self {
            device: Arc::clone(device),
            handle,
            memory,
            size,
            usage,
            memory_flags,
            memory_type_index,
            memory_type_flags,
            bound: false,
        })
    }

    /// Create a host-visible, coherent transfer source.
    pub fn load_as_staging(device: &Arc<dyn DeviceContext>, size: vk::DeviceSize) -> Result<Self> {
        Self::load(
            device,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
    }

    /// Bind the allocated memory to the buffer at offset 0.
    pub fn bind(&mut self) -> Result<()> {
        self.ensure_live()?;
        if self.bound {
            return Err(GpuError::InvalidState("Buffer memory already bound".to_string()));
        }

        unsafe { self.device.bind_buffer_memory(self.handle, self.memory, 0) }
            .map_err(|e| GpuError::creation("buffer binding", e))?;
        self.bound = true;

        Ok(())
    }

    /// Copy `data` to the start of the buffer through a temporary mapping.
    ///
    /// The whole allocation is mapped and flushed, so the range stays valid on
    /// non-coherent memory whatever the buffer size. Rejected without side
    /// effects when the memory is not host-visible; such buffers are filled
    /// with [`upload_via_staging`](Self::upload_via_staging).
    pub fn set_data(&self, data: &[u8]) -> Result<()> {
        self.ensure_live()?;
        if !self.is_host_visible() {
            return Err(GpuError::HostAccessDenied);
        }
        if data.len() as u64 > self.size {
            return Err(GpuError::InvalidArgument(format!(
                "{} bytes do not fit a buffer of {} bytes",
                data.len(),
                self.size
            )));
        }

        unsafe {
            let ptr = self
                .device
                .map_memory(self.memory, 0, vk::WHOLE_SIZE)
                .map_err(|e| {
                    tracing::error!("Mapping buffer memory on {} failed: {e}", self.device.name());
                    GpuError::from(e)
                })?;

            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());

            let flushed = self
                .device
                .flush_mapped_memory(self.memory, 0, vk::WHOLE_SIZE);
            self.device.unmap_memory(self.memory);
            flushed.map_err(GpuError::from)?;
        }

        Ok(())
    }

    /// Write a slice of plain values to the start of the buffer.
    pub fn write<T: bytemuck::Pod>(&self, data: &[T]) -> Result<()> {
        self.set_data(bytemuck::cast_slice(data))
    }

    /// Copy the first `out.len()` bytes of the buffer into `out`.
    ///
    /// The mapping is invalidated first so device writes are visible on
    /// non-coherent memory.
    pub fn read_data(&self, out: &mut [u8]) -> Result<()> {
        self.ensure_live()?;
        if !self.is_host_visible() {
            return Err(GpuError::HostAccessDenied);
        }
        if out.len() as u64 > self.size {
            return Err(GpuError::InvalidArgument(format!(
                "Cannot read {} bytes from a buffer of {} bytes",
                out.len(),
                self.size
            )));
        }

        unsafe {
            let ptr = self
                .device
                .map_memory(self.memory, 0, vk::WHOLE_SIZE)
                .map_err(GpuError::from)?;
            if let Err(e) = self
                .device
                .invalidate_mapped_memory(self.memory, 0, vk::WHOLE_SIZE)
            {
                self.device.unmap_memory(self.memory);
                return Err(GpuError::from(e));
            }
            std::ptr::copy_nonoverlapping(ptr.cast_const(), out.as_mut_ptr(), out.len());
            self.device.unmap_memory(self.memory);
        }

        Ok(())
    }

    /// Fill a buffer through a temporary staging buffer and a blocking copy.
    ///
    /// The buffer must be bound and carry `TRANSFER_DST` usage.
    pub fn upload_via_staging(&self, pool: &CommandPool, data: &[u8]) -> Result<()> {
        self.ensure_live()?;
        if !self.bound {
            return Err(GpuError::InvalidState("Buffer memory is not bound".to_string()));
        }
        if !self.usage.contains(vk::BufferUsageFlags::TRANSFER_DST) {
            return Err(GpuError::InvalidArgument(
                "Staged uploads require TRANSFER_DST usage".to_string(),
            ));
        }
        if data.is_empty() || data.len() as u64 > self.size {
            return Err(GpuError::InvalidArgument(format!(
                "Upload of {} bytes into a buffer of {} bytes",
                data.len(),
                self.size
            )));
        }

        let mut staging = Self::load_as_staging(&self.device, data.len() as u64)?;
        staging.bind()?;
        staging.set_data(data)?;

        let region = vk::BufferCopy::default().size(data.len() as u64);
        let (src, dst) = (staging.handle, self.handle);
        let result = pool.execute_single_time_commands(|device, cmd| unsafe {
            device.cmd_copy_buffer(cmd, src, dst, &[region]);
        });

        staging.release();
        result
    }

    /// Destroy the buffer, then free its memory. Calling this again is a no-op.
    pub fn release(&mut self) {
        self.size = 0;
        self.bound = false;

        if self.handle != vk::Buffer::null() {
            unsafe { self.device.destroy_buffer(self.handle) };
            self.handle = vk::Buffer::null();
        }

        if self.memory != vk::DeviceMemory::null() {
            unsafe { self.device.free_memory(self.memory) };
            self.memory = vk::DeviceMemory::null();
        }
    }

    /// Whether [`release`](Self::release) has run.
    pub fn is_released(&self) -> bool {
        self.handle == vk::Buffer::null()
    }

    /// Size in bytes (0 after release).
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Usage flags requested at creation.
    pub fn usage_flags(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Memory property flags requested at creation.
    pub fn memory_flags(&self) -> vk::MemoryPropertyFlags {
        self.memory_flags
    }

    /// Property flags of the memory type actually chosen.
    pub fn memory_type_flags(&self) -> vk::MemoryPropertyFlags {
        self.memory_type_flags
    }

    /// Index of the memory type actually chosen.
    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    /// Raw buffer handle.
    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    /// Raw memory handle.
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Whether memory has been bound.
    pub fn is_bound(&self) -> bool {
        self.bound
    }

    fn is_host_visible(&self) -> bool {
        self.memory_type_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_released() {
            return Err(GpuError::InvalidState("Buffer already released".to_string()));
        }
        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.release();
    }
}
