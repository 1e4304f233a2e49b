pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use ersha_core::{DataPoint, DeviceId};

use crate::policy::StorageConfig;
use crate::query::QueryOptions;

/// Durable store for flushed telemetry.
///
/// Adapters only filter: `query` returns every persisted point accepted by
/// [`QueryOptions::matches`]. Ordering, aggregation and paging are applied by
/// the storage service after merging with still-buffered points.
#[async_trait]
pub trait PointStorage: Send + Sync + 'static {
    /// Error type specific to this storage implementation
    type Error: std::error::Error + Send + Sync + 'static;

    /// Persist one flushed batch. `Ok(false)` means the batch was not stored
    /// and will be retried.
    async fn persist(
        &self,
        device_id: &DeviceId,
        points: &[DataPoint],
        config: &StorageConfig,
    ) -> Result<bool, Self::Error>;

    /// Fetch persisted points matching the filters in `options`.
    async fn query(&self, options: &QueryOptions) -> Result<Vec<DataPoint>, Self::Error>;

    /// Delete a device's points older than `cutoff`, or all of them when no
    /// cutoff is given.
    async fn clear_before(
        &self,
        device_id: &DeviceId,
        cutoff: Option<jiff::Timestamp>,
    ) -> Result<bool, Self::Error>;

    /// Number of persisted points, optionally for one device.
    async fn count(&self, device_id: Option<&DeviceId>) -> Result<usize, Self::Error>;
}
