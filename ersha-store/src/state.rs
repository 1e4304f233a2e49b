use std::collections::HashMap;
use std::sync::Arc;

use ersha_core::{DataPoint, DeviceId};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::policy::StorageConfig;
use crate::stats::DeviceStatistics;

/// Where a configured device currently is in its buffer/flush cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DevicePhase {
    /// Configured, nothing admitted yet.
    Configured,
    /// Buffer empty after at least one admitted point.
    Idle,
    Buffering,
    Flushing,
}

/// Config, buffer and statistics of one device.
pub struct DeviceRecord {
    pub config: StorageConfig,
    pub buffer: Vec<DataPoint>,
    pub stats: DeviceStatistics,
    pub flushing: bool,
    /// Cancels the interval timer, if the device has one.
    pub timer: Option<CancellationToken>,
}

impl DeviceRecord {
    fn new(config: StorageConfig) -> Self {
        let stats = DeviceStatistics::empty(config.device_id.clone());
        Self {
            config,
            buffer: Vec::new(),
            stats,
            flushing: false,
            timer: None,
        }
    }

    pub fn phase(&self) -> DevicePhase {
        if self.flushing {
            DevicePhase::Flushing
        } else if !self.buffer.is_empty() {
            DevicePhase::Buffering
        } else if self.stats.total_data_points > 0 {
            DevicePhase::Idle
        } else {
            DevicePhase::Configured
        }
    }

    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

/// One entry of the device table.
///
/// `record` is held only for short bookkeeping sections. `flush_lock` is
/// held for a whole flush. Flush triggers take it with `try_lock`; clearing
/// and unregistering wait for it.
pub struct DeviceSlot {
    pub record: Mutex<DeviceRecord>,
    pub flush_lock: Mutex<()>,
}

impl DeviceSlot {
    fn new(config: StorageConfig) -> Self {
        Self {
            record: Mutex::new(DeviceRecord::new(config)),
            flush_lock: Mutex::new(()),
        }
    }
}

/// Shared table of every device known to the storage service.
#[derive(Default)]
pub struct DeviceTable {
    devices: RwLock<HashMap<DeviceId, Arc<DeviceSlot>>>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, device_id: &DeviceId) -> Option<Arc<DeviceSlot>> {
        let devices = self.devices.read().await;
        devices.get(device_id).cloned()
    }

    /// Get the slot for `config.device_id`, creating it from `config` if the
    /// device is new. The flag is `true` when a slot was created.
    pub async fn get_or_insert(&self, config: &StorageConfig) -> (Arc<DeviceSlot>, bool) {
        if let Some(slot) = self.get(&config.device_id).await {
            return (slot, false);
        }

        let mut devices = self.devices.write().await;
        // another task may have inserted between the two locks
        if let Some(slot) = devices.get(&config.device_id) {
            return (Arc::clone(slot), false);
        }
        let slot = Arc::new(DeviceSlot::new(config.clone()));
        devices.insert(config.device_id.clone(), Arc::clone(&slot));
        (slot, true)
    }

    pub async fn remove(&self, device_id: &DeviceId) -> Option<Arc<DeviceSlot>> {
        let mut devices = self.devices.write().await;
        devices.remove(device_id)
    }

    /// Snapshot of every slot, sorted by device id.
    pub async fn slots(&self) -> Vec<(DeviceId, Arc<DeviceSlot>)> {
        let devices = self.devices.read().await;
        let mut slots: Vec<_> = devices
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();
        slots.sort_by(|a, b| a.0.cmp(&b.0));
        slots
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
