use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ersha_core::DeviceId;
use rand::Rng;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{Telemetry, TelemetrySource};

const SENSORS: [(&str, &str); 5] = [
    ("soil_moisture", "%"),
    ("soil_temp", "C"),
    ("air_temp", "C"),
    ("humidity", "%"),
    ("rainfall", "mm"),
];

#[derive(Debug, thiserror::Error)]
pub enum MockTelemetryError {
    #[error("mock telemetry source needs at least one device")]
    NoDevices,
    #[error("mock reading interval must be greater than zero")]
    ZeroInterval,
}

/// Telemetry source that generates random readings for simulated devices.
pub struct MockTelemetrySource {
    reading_interval: Duration,
    devices: Arc<Vec<MockDevice>>,
}

impl MockTelemetrySource {
    pub fn new(reading_interval_secs: u64, device_count: usize) -> Self {
        let devices = (0..device_count).map(MockDevice::new).collect();

        Self {
            reading_interval: Duration::from_secs(reading_interval_secs),
            devices: Arc::new(devices),
        }
    }

    /// Ids of every simulated device.
    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.devices.iter().map(|d| d.device_id.clone()).collect()
    }
}

/// A simulated device with a stable id.
struct MockDevice {
    device_id: DeviceId,
}

impl MockDevice {
    fn new(index: usize) -> Self {
        Self {
            device_id: DeviceId::from(format!("mock-device-{index}")),
        }
    }

    fn generate_item(&self, rng: &mut impl Rng, sensor_idx: usize) -> Value {
        let (sensor_type, unit) = SENSORS[sensor_idx];

        let value: f64 = match sensor_idx {
            0 => rng.random_range(20.0..80.0),
            1 => rng.random_range(15.0..35.0),
            2 => rng.random_range(10.0..40.0),
            3 => rng.random_range(30.0..90.0),
            _ => rng.random_range(0.0..50.0),
        };

        json!({
            "device_id": self.device_id,
            "timestamp": jiff::Timestamp::now().to_string(),
            "sensor_type": sensor_type,
            "value": (value * 100.0).round() / 100.0,
            "unit": unit,
            "quality": rng.random_range(85..=100),
        })
    }

    /// One reading from a random sensor, or a full sweep of every sensor.
    fn generate(&self) -> Telemetry {
        let mut rng = rand::rng();

        if rng.random_ratio(1, 4) {
            let items = (0..SENSORS.len())
                .map(|idx| self.generate_item(&mut rng, idx))
                .collect();
            Telemetry::Batch(items)
        } else {
            let idx = rng.random_range(0..SENSORS.len());
            Telemetry::Single(self.generate_item(&mut rng, idx))
        }
    }
}

#[async_trait]
impl TelemetrySource for MockTelemetrySource {
    type Error = MockTelemetryError;

    async fn start(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Telemetry>, Self::Error> {
        if self.devices.is_empty() {
            return Err(MockTelemetryError::NoDevices);
        }
        if self.reading_interval.is_zero() {
            return Err(MockTelemetryError::ZeroInterval);
        }

        let (tx, rx) = mpsc::channel(100);

        let devices = Arc::clone(&self.devices);
        let reading_interval = self.reading_interval;

        info!(
            device_count = devices.len(),
            reading_interval_secs = reading_interval.as_secs(),
            "Starting mock telemetry source"
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(reading_interval);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Mock telemetry generator shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        for device in devices.iter() {
                            if tx.send(device.generate()).await.is_err() {
                                info!("Channel closed, telemetry generator shutting down");
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn produces_valid_points() {
        let source = MockTelemetrySource::new(1, 2);
        let cancel = CancellationToken::new();
        let mut rx = source.start(cancel.clone()).await.unwrap();

        // first interval tick fires immediately, once per device
        for _ in 0..2 {
            let telemetry = rx.recv().await.unwrap();
            let points = telemetry.into_points();
            assert!(!points.is_empty());
            for point in points {
                assert!(point.device_id.as_str().starts_with("mock-device-"));
                assert!(point.value.as_f64().is_some());
                assert!(point.quality.is_some());
            }
        }

        cancel.cancel();
    }

    #[tokio::test]
    async fn rejects_empty_device_set() {
        let source = MockTelemetrySource::new(1, 0);
        let result = source.start(CancellationToken::new()).await;
        assert!(matches!(result, Err(MockTelemetryError::NoDevices)));
    }

    #[test]
    fn device_ids_are_stable() {
        let source = MockTelemetrySource::new(1, 3);
        let ids: Vec<_> = source.device_ids().iter().map(|d| d.to_string()).collect();
        assert_eq!(ids, vec!["mock-device-0", "mock-device-1", "mock-device-2"]);
    }
}
