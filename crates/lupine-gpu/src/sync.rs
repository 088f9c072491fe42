//! Synchronization primitives.
//!
//! Semaphores order queue operations on the GPU and are never observed by the
//! CPU. Fences are the only completion signal the CPU can block on.

use crate::device::DeviceContext;
use crate::error::{GpuError, Result};
use ash::vk;
use std::sync::Arc;

/// Owned binary semaphore.
pub struct Semaphore {
    device: Arc<dyn DeviceContext>,
    handle: vk::Semaphore,
}

impl Semaphore {
    /// Create a semaphore.
    pub fn new(device: &Arc<dyn DeviceContext>) -> Result<Self> {
        let handle = unsafe { device.create_semaphore() }
            .map_err(|e| GpuError::sync("semaphore creation", e))?;

        Ok(Self {
            device: Arc::clone(device),
            handle,
        })
    }

    /// Raw handle; null after release.
    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }

    /// Destroy the semaphore. Calling this again is a no-op.
    pub fn release(&mut self) {
        if self.handle != vk::Semaphore::null() {
            unsafe { self.device.destroy_semaphore(self.handle) };
            self.handle = vk::Semaphore::null();
        }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.release();
    }
}

/// Owned fence.
pub struct Fence {
    device: Arc<dyn DeviceContext>,
    handle: vk::Fence,
}

impl Fence {
    /// Create a fence, optionally already signaled.
    pub fn new(device: &Arc<dyn DeviceContext>, signaled: bool) -> Result<Self> {
        let handle = unsafe { device.create_fence(signaled) }
            .map_err(|e| GpuError::sync("fence creation", e))?;

        Ok(Self {
            device: Arc::clone(device),
            handle,
        })
    }

    /// Raw handle; null after release.
    pub fn handle(&self) -> vk::Fence {
        self.handle
    }

    /// Block until the fence is signaled.
    ///
    /// A timeout is reported as a synchronization failure and never retried.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait(&self, timeout_ns: u64) -> Result<()> {
        self.ensure_live()?;
        unsafe { self.device.wait_for_fence(self.handle, timeout_ns) }
            .map_err(|e| GpuError::sync("fence wait", e))
    }

    /// Reset the fence to the unsignaled state.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn reset(&self) -> Result<()> {
        self.ensure_live()?;
        unsafe { self.device.reset_fence(self.handle) }
            .map_err(|e| GpuError::sync("fence reset", e))
    }

    /// Destroy the fence. Calling this again is a no-op.
    pub fn release(&mut self) {
        if self.handle != vk::Fence::null() {
            unsafe { self.device.destroy_fence(self.handle) };
            self.handle = vk::Fence::null();
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.handle == vk::Fence::null() {
            return Err(GpuError::InvalidState("Fence already released".to_string()));
        }
        Ok(())
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.release();
    }
}

/// Synchronization resources of one frame slot.
pub struct SyncSet {
    /// Signaled by the presentation engine once the acquired image is available.
    pub image_available: Semaphore,
    /// Signaled when rendering completes; consumed by presentation.
    pub render_finished: Semaphore,
    /// Signaled when the slot's submission has fully retired.
    pub in_flight: Fence,
}

impl SyncSet {
    /// Create the semaphores and an unsignaled fence.
    ///
    /// The fence starts unsignaled because the orchestrator only waits on
    /// fences it has submitted.
    pub fn new(device: &Arc<dyn DeviceContext>) -> Result<Self> {
        Ok(Self {
            image_available: Semaphore::new(device)?,
            render_finished: Semaphore::new(device)?,
            in_flight: Fence::new(device, false)?,
        })
    }

    /// Destroy all three primitives. Calling this again is a no-op.
    pub fn release(&mut self) {
        self.image_available.release();
        self.render_finished.release();
        self.in_flight.release();
    }
}

/// Ring of frame slots.
pub struct FrameSyncManager {
    slots: Vec<SyncSet>,
    current: usize,
}

impl FrameSyncManager {
    /// Create `frames_in_flight` slots.
    pub fn new(device: &Arc<dyn DeviceContext>, frames_in_flight: usize) -> Result<Self> {
        if frames_in_flight == 0 {
            return Err(GpuError::InvalidArgument(
                "At least one frame slot is required".to_string(),
            ));
        }

        let slots = (0..frames_in_flight)
            .map(|_| SyncSet::new(device))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { slots, current: 0 })
    }

    /// Current slot's sync resources.
    pub fn current(&self) -> &SyncSet {
        &self.slots[self.current]
    }

    /// Slot by index.
    pub fn get(&self, slot: usize) -> Option<&SyncSet> {
        self.slots.get(slot)
    }

    /// Advance to the next slot.
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
    }

    /// Current slot index.
    pub fn current_frame(&self) -> usize {
        self.current
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether there are no slots (never true for a constructed manager).
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Destroy all slots. Calling this again is a no-op.
    pub fn release(&mut self) {
        for slot in &mut self.slots {
            slot.release();
        }
    }
}
