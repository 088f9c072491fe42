//! Named pipeline caches shared by every pipeline built on a device.

use crate::device::{DeviceContext, DeviceId};
use crate::error::{GpuError, Result};
use ash::vk;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

struct CacheEntry {
    device: Arc<dyn DeviceContext>,
    cache: vk::PipelineCache,
}

impl CacheEntry {
    fn destroy(self) {
        unsafe { self.device.destroy_pipeline_cache(self.cache) };
    }
}

#[derive(Default)]
struct Caches {
    live: HashMap<(DeviceId, String), CacheEntry>,
    // Replaced caches may still be in use by a concurrent pipeline build, so
    // they are only destroyed by the per-device release.
    retired: Vec<(DeviceId, CacheEntry)>,
}

/// Registry of pipeline caches keyed by device and name.
///
/// Lookups and inserts are serialized by one mutex; both happen at load time
/// only. Caches are destroyed solely by
/// [`release_all_pipeline_caches`](Self::release_all_pipeline_caches), which
/// must run before the device itself is destroyed.
#[derive(Default)]
pub struct PipelineCacheRegistry {
    caches: Mutex<Caches>,
}

impl PipelineCacheRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create, or replace, an empty cache called `name` on `device`.
    pub fn create_pipeline_cache(
        &self,
        device: &Arc<dyn DeviceContext>,
        name: &str,
    ) -> Result<vk::PipelineCache> {
        self.create_pipeline_cache_with_data(device, name, &[])
    }

    /// Create, or replace, a cache seeded with a blob previously produced by
    /// [`cache_data`](Self::cache_data). The blob format belongs to the driver.
    pub fn create_pipeline_cache_with_data(
        &self,
        device: &Arc<dyn DeviceContext>,
        name: &str,
        initial_data: &[u8],
    ) -> Result<vk::PipelineCache> {
        if name.is_empty() {
            return Err(GpuError::InvalidArgument(
                "Pipeline cache name must not be empty".to_string(),
            ));
        }

        let cache = unsafe { device.create_pipeline_cache(initial_data) }.map_err(|e| {
            tracing::error!("Creating pipeline cache '{name}' on {} failed: {e}", device.name());
            GpuError::creation("pipeline cache", e)
        })?;

        let entry = CacheEntry {
            device: Arc::clone(device),
            cache,
        };

        let mut caches = self.caches.lock();
        if let Some(previous) = caches.live.insert((device.id(), name.to_string()), entry) {
            tracing::debug!("Pipeline cache '{name}' replaced on {}", device.name());
            caches.retired.push((device.id(), previous));
        } else {
            tracing::debug!("Pipeline cache '{name}' created on {}", device.name());
        }

        Ok(cache)
    }

    /// Handle of the named cache, or a null handle when there is none.
    ///
    /// A miss means "build without a cache", never an error.
    pub fn get_pipeline_cache(&self, device: DeviceId, name: &str) -> vk::PipelineCache {
        self.caches
            .lock()
            .live
            .get(&(device, name.to_string()))
            .map_or(vk::PipelineCache::null(), |entry| entry.cache)
    }

    /// Whether a cache called `name` exists on `device`.
    pub fn contains(&self, device: DeviceId, name: &str) -> bool {
        self.caches
            .lock()
            .live
            .contains_key(&(device, name.to_string()))
    }

    /// Serialize the named cache so it can be persisted and fed back through
    /// [`create_pipeline_cache_with_data`](Self::create_pipeline_cache_with_data).
    pub fn cache_data(&self, device: DeviceId, name: &str) -> Result<Vec<u8>> {
        let caches = self.caches.lock();
        let entry = caches
            .live
            .get(&(device, name.to_string()))
            .ok_or_else(|| GpuError::InvalidArgument(format!("No pipeline cache '{name}'")))?;

        unsafe { entry.device.pipeline_cache_data(entry.cache) }.map_err(GpuError::from)
    }

    /// Number of live caches across all devices.
    pub fn len(&self) -> usize {
        self.caches.lock().live.len()
    }

    /// Whether the registry holds no live caches.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroy every cache, live or replaced, created on `device`.
    ///
    /// Returns the number of caches destroyed.
    pub fn release_all_pipeline_caches(&self, device: DeviceId) -> usize {
        let released: Vec<CacheEntry> = {
            let mut caches = self.caches.lock();

            let keys: Vec<_> = caches
                .live
                .keys()
                .filter(|(owner, _)| *owner == device)
                .cloned()
                .collect();
            let mut released: Vec<_> = keys
                .iter()
                .filter_map(|key| caches.live.remove(key))
                .collect();

            let (ours, others): (Vec<_>, Vec<_>) = std::mem::take(&mut caches.retired)
                .into_iter()
                .partition(|(owner, _)| *owner == device);
            caches.retired = others;
            released.extend(ours.into_iter().map(|(_, entry)| entry));

            released
        };

        let count = released.len();
        for entry in released {
            entry.destroy();
        }

        if count > 0 {
            tracing::debug!("Released {count} pipeline caches");
        }

        count
    }
}

impl Drop for PipelineCacheRegistry {
    fn drop(&mut self) {
        let caches = self.caches.get_mut();
        let leaked = caches.live.len() + caches.retired.len();
        if leaked > 0 {
            tracing::warn!("{leaked} pipeline caches were never released");
        }
    }
}
