use std::collections::BTreeMap;

use ersha_core::{DataPoint, DeviceId};
use serde::Serialize;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Running aggregates for one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatistics {
    pub device_id: DeviceId,
    pub total_data_points: u64,
    pub oldest_data_point: Option<jiff::Timestamp>,
    pub newest_data_point: Option<jiff::Timestamp>,
    /// Approximate size in bytes of every admitted point, serialized as JSON.
    pub storage_size: u64,
    /// Raw bytes over compressed bytes, across successful flushes.
    pub compression_ratio: f64,
    pub data_points_per_day: f64,
    pub sensor_type_counts: BTreeMap<String, u64>,
    /// Mean reported quality (0–100). Points without a quality do not count.
    pub data_quality_score: f64,
    #[serde(skip)]
    quality_samples: u64,
    #[serde(skip)]
    quality_sum: u64,
    #[serde(skip)]
    raw_bytes: u64,
    #[serde(skip)]
    compressed_bytes: u64,
}

impl DeviceStatistics {
    pub fn empty(device_id: DeviceId) -> Self {
        Self {
            device_id,
            total_data_points: 0,
            oldest_data_point: None,
            newest_data_point: None,
            storage_size: 0,
            compression_ratio: 1.0,
            data_points_per_day: 0.0,
            sensor_type_counts: BTreeMap::new(),
            data_quality_score: 100.0,
            quality_samples: 0,
            quality_sum: 0,
            raw_bytes: 0,
            compressed_bytes: 0,
        }
    }

    /// Account for one admitted point.
    pub fn record(&mut self, point: &DataPoint) {
        self.total_data_points += 1;
        *self
            .sensor_type_counts
            .entry(point.sensor_type.to_string())
            .or_default() += 1;

        self.newest_data_point = Some(point.timestamp);
        self.oldest_data_point = Some(match self.oldest_data_point {
            Some(oldest) => oldest.min(point.timestamp),
            None => point.timestamp,
        });

        self.storage_size += serialized_size(point);

        if let Some(quality) = point.quality {
            self.quality_samples += 1;
            self.quality_sum += u64::from(quality.0);
            self.data_quality_score = self.quality_sum as f64 / self.quality_samples as f64;
        }

        if let (Some(oldest), Some(newest)) = (self.oldest_data_point, self.newest_data_point) {
            let span_days = newest.duration_since(oldest).as_secs_f64() / SECONDS_PER_DAY;
            self.data_points_per_day = self.total_data_points as f64 / span_days.max(1.0);
        }
    }

    /// Account for one successfully persisted batch.
    pub fn record_flush(&mut self, raw_bytes: u64, compressed_bytes: u64) {
        self.raw_bytes += raw_bytes;
        self.compressed_bytes += compressed_bytes;
        if self.compressed_bytes > 0 {
            self.compression_ratio = self.raw_bytes as f64 / self.compressed_bytes as f64;
        }
    }
}

/// JSON-encoded length of a point, used as a storage size estimate.
pub fn serialized_size(point: &DataPoint) -> u64 {
    serde_json::to_vec(point).map_or(0, |bytes| bytes.len() as u64)
}

pub fn batch_size_bytes(points: &[DataPoint]) -> u64 {
    points.iter().map(serialized_size).sum()
}
