use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ersha_core::{DataPoint, DeviceId};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(60_000);
pub const DEFAULT_RETENTION_DAYS: u32 = 365;

/// Policy governing which points are admitted and when a buffer is flushed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageStrategy {
    /// Flush after every admitted point.
    RealTime,
    /// Flush once the buffer reaches the batch size.
    #[default]
    Batch,
    /// Admit numeric points only when they moved by at least the change threshold.
    Threshold,
    /// Admit points only when the value differs from the previous one.
    Change,
    /// Flush on a fixed timer.
    Interval,
    /// Admit according to a caller-provided predicate.
    Custom,
}

/// Transform applied to a batch before it is persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionAlgorithm {
    #[default]
    None,
    Delta,
    Rle,
    Dictionary,
    Lossy,
    Lossless,
}

/// Admission predicate for [`StorageStrategy::Custom`].
#[derive(Clone)]
pub struct CustomFilter(Arc<dyn Fn(&DataPoint) -> bool + Send + Sync>);

impl CustomFilter {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&DataPoint) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn admits(&self, point: &DataPoint) -> bool {
        (self.0)(point)
    }
}

impl fmt::Debug for CustomFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomFilter(..)")
    }
}

/// Per-device storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub device_id: DeviceId,
    #[serde(default)]
    pub strategy: StorageStrategy,
    #[serde(default)]
    pub compression: CompressionAlgorithm,
    /// Buffer length that triggers a flush under the batch strategy.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Flush period under the interval strategy.
    #[serde(default = "default_interval", with = "millis")]
    pub interval: Duration,
    /// Minimum absolute change under the threshold strategy.
    #[serde(default)]
    pub change_threshold: Option<f64>,
    /// Days persisted data is kept before the retention sweep purges it.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(skip)]
    pub custom_filter: Option<CustomFilter>,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_interval() -> Duration {
    DEFAULT_INTERVAL
}

fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

impl StorageConfig {
    /// Batch strategy, no compression, default sizes.
    pub fn new(device_id: impl Into<DeviceId>) -> Self {
        Self {
            device_id: device_id.into(),
            strategy: StorageStrategy::Batch,
            compression: CompressionAlgorithm::None,
            batch_size: DEFAULT_BATCH_SIZE,
            interval: DEFAULT_INTERVAL,
            change_threshold: None,
            retention_days: DEFAULT_RETENTION_DAYS,
            custom_filter: None,
        }
    }

    pub fn strategy(mut self, strategy: StorageStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn compression(mut self, compression: CompressionAlgorithm) -> Self {
        self.compression = compression;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn change_threshold(mut self, threshold: f64) -> Self {
        self.change_threshold = Some(threshold);
        self
    }

    pub fn retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    pub fn custom_filter<F>(mut self, f: F) -> Self
    where
        F: Fn(&DataPoint) -> bool + Send + Sync + 'static,
    {
        self.custom_filter = Some(CustomFilter::new(f));
        self
    }

    /// Check the config and replace zero values with defaults.
    pub fn normalize(mut self) -> Result<Self, StoreError> {
        if self.device_id.is_empty() {
            return Err(StoreError::MissingDeviceId);
        }

        if let Some(threshold) = self
            .change_threshold
            .filter(|t| !t.is_finite() || *t < 0.0)
        {
            return Err(StoreError::InvalidConfig(format!(
                "change threshold must be a non-negative number, got {threshold}"
            )));
        }

        if self.batch_size == 0 {
            self.batch_size = DEFAULT_BATCH_SIZE;
        }
        if self.interval.is_zero() {
            self.interval = DEFAULT_INTERVAL;
        }
        if self.retention_days == 0 {
            self.retention_days = DEFAULT_RETENTION_DAYS;
        }

        Ok(self)
    }
}
