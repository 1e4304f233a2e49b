use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use ersha_core::{DataPoint, DeviceId};

use crate::policy::StorageConfig;
use crate::query::QueryOptions;
use crate::storage::PointStorage;

/// In-memory storage implementation.
/// This is primarily intended for testing and as a reference
/// implementation of the PointStorage trait.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    points: Arc<Mutex<HashMap<DeviceId, Vec<DataPoint>>>>,
}

/// Error type for MemoryStorage
#[derive(Debug)]
pub enum MemoryStorageError {
    MutexPoisoned(String),
}

impl std::error::Error for MemoryStorageError {}

impl fmt::Display for MemoryStorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryStorageError::MutexPoisoned(msg) => write!(f, "Mutex poisoned: {}", msg),
        }
    }
}

impl<T> From<PoisonError<T>> for MemoryStorageError {
    fn from(err: PoisonError<T>) -> Self {
        MemoryStorageError::MutexPoisoned(err.to_string())
    }
}

#[async_trait]
impl PointStorage for MemoryStorage {
    type Error = MemoryStorageError;

    async fn persist(
        &self,
        device_id: &DeviceId,
        points: &[DataPoint],
        _config: &StorageConfig,
    ) -> Result<bool, Self::Error> {
        let mut map = self.points.lock()?;
        map.entry(device_id.clone())
            .or_default()
            .extend_from_slice(points);
        Ok(true)
    }

    async fn query(&self, options: &QueryOptions) -> Result<Vec<DataPoint>, Self::Error> {
        let map = self.points.lock()?;

        let matching = |points: &Vec<DataPoint>| {
            points
                .iter()
                .filter(|p| options.matches(p))
                .cloned()
                .collect::<Vec<_>>()
        };

        Ok(match &options.device_id {
            Some(id) => map.get(id).map(matching).unwrap_or_default(),
            None => map.values().flat_map(matching).collect(),
        })
    }

    async fn clear_before(
        &self,
        device_id: &DeviceId,
        cutoff: Option<jiff::Timestamp>,
    ) -> Result<bool, Self::Error> {
        let mut map = self.points.lock()?;

        match cutoff {
            Some(cutoff) => {
                if let Some(points) = map.get_mut(device_id) {
                    points.retain(|p| p.timestamp >= cutoff);
                }
            }
            None => {
                map.remove(device_id);
            }
        }

        Ok(true)
    }

    async fn count(&self, device_id: Option<&DeviceId>) -> Result<usize, Self::Error> {
        let map = self.points.lock()?;
        Ok(match device_id {
            Some(id) => map.get(id).map_or(0, Vec::len),
            None => map.values().map(Vec::len).sum(),
        })
    }
}
