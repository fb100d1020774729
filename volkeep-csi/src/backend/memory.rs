//! In-memory reference backend.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tonic::Status;
use tracing::{debug, info};

use super::Backend;
use crate::config::BackendConfig;
use crate::context::CallContext;

/// Keeps volume sizes in a map. Nothing survives a restart.
#[derive(Debug)]
pub struct MemoryBackend {
    config: BackendConfig,
    /// Allocated size per volume name.
    volumes: Mutex<HashMap<String, i64>>,
}

impl MemoryBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            volumes: Mutex::new(HashMap::new()),
        }
    }

    /// Size of `name`, if it exists.
    pub fn volume_size(&self, name: &str) -> Option<i64> {
        self.volumes().get(name).copied()
    }

    pub fn volume_count(&self) -> usize {
        self.volumes().len()
    }

    /// Bytes still available, `None` when unlimited.
    pub fn available_bytes(&self) -> Option<i64> {
        let used = used_bytes(&self.volumes());
        self.config.capacity_bytes.map(|cap| (cap - used).max(0))
    }

    /// Size to allocate for a request of `min_bytes`.
    fn allocation_size(&self, min_bytes: i64) -> Result<i64, Status> {
        if min_bytes < 0 {
            return Err(Status::invalid_argument(format!(
                "requested size must not be negative, got {min_bytes}"
            )));
        }
        if min_bytes == 0 {
            return Ok(self.config.default_volume_bytes);
        }
        round_up(min_bytes, self.config.allocation_unit_bytes).ok_or_else(|| {
            Status::out_of_range(format!("requested size {min_bytes} is too large"))
        })
    }

    fn volumes(&self) -> MutexGuard<'_, HashMap<String, i64>> {
        self.volumes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(BackendConfig::default())
    }
}

#[tonic::async_trait]
impl Backend for MemoryBackend {
    async fn create_volume(
        &self,
        _ctx: &CallContext,
        name: &str,
        min_bytes: i64,
    ) -> Result<i64, Status> {
        let size = self.allocation_size(min_bytes)?;
        let mut volumes = self.volumes();

        if let Some(&existing) = volumes.get(name) {
            if existing >= min_bytes {
                debug!(name, existing, "volume already exists");
                return Ok(existing);
            }
            return Err(Status::already_exists(format!(
                "volume {name} exists with {existing} bytes, smaller than the requested {min_bytes}"
            )));
        }

        if let Some(capacity) = self.config.capacity_bytes {
            let used = used_bytes(&volumes);
            if used.saturating_add(size) > capacity {
                return Err(Status::resource_exhausted(format!(
                    "cannot allocate {size} bytes for {name}: {} of {capacity} bytes free",
                    capacity - used
                )));
            }
        }

        volumes.insert(name.to_string(), size);
        info!(name, size, "volume allocated");
        Ok(size)
    }

    async fn delete_volume(&self, _ctx: &CallContext, name: &str) -> Result<(), Status> {
        if let Some(size) = self.volumes().remove(name) {
            info!(name, size, "volume released");
        }
        Ok(())
    }

    async fn check_volume_exists(&self, _ctx: &CallContext, id: &str) -> Result<(), Status> {
        if self.volumes().contains_key(id) {
            Ok(())
        } else {
            Err(Status::not_found(format!("volume {id} not found")))
        }
    }
}

fn used_bytes(volumes: &HashMap<String, i64>) -> i64 {
    volumes.values().copied().fold(0i64, i64::saturating_add)
}

/// Round `bytes` up to a multiple of `unit`.
fn round_up(bytes: i64, unit: i64) -> Option<i64> {
    let rem = bytes % unit;
    if rem == 0 {
        Some(bytes)
    } else {
        bytes.checked_add(unit - rem)
    }
}
