pub mod mock;

use async_trait::async_trait;
use ersha_core::{DataPoint, DeviceId};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Raw telemetry as delivered by the network layer.
///
/// Items are untyped JSON and are validated when converted into points.
#[derive(Debug, Clone)]
pub enum Telemetry {
    Single(Value),
    Batch(Vec<Value>),
}

impl Telemetry {
    /// Convert into data points, dropping malformed items.
    pub fn into_points(self) -> Vec<DataPoint> {
        let items = match self {
            Telemetry::Single(item) => vec![item],
            Telemetry::Batch(items) => items,
        };
        let total = items.len();

        let points: Vec<DataPoint> = items.iter().filter_map(DataPoint::from_json).collect();
        if points.len() < total {
            debug!(
                dropped = total - points.len(),
                "Dropped malformed telemetry items"
            );
        }
        points
    }
}

/// Notifications from the device lifecycle manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    DeviceUnregistered { device_id: DeviceId },
}

/// Trait for sources of raw device telemetry.
///
/// Implementations spawn background tasks that send telemetry to an mpsc
/// channel. The receiver is returned from the `start` method.
#[async_trait]
pub trait TelemetrySource: Send + Sync + 'static {
    /// Error type for this telemetry source implementation.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Start producing telemetry.
    ///
    /// The background tasks will run until the cancellation token is cancelled.
    async fn start(&self, cancel: CancellationToken)
    -> Result<mpsc::Receiver<Telemetry>, Self::Error>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn single_item_is_validated() {
        let good = Telemetry::Single(json!({
            "device_id": "d1",
            "timestamp": "2026-01-01T00:00:00Z",
            "sensor_type": "temp",
            "value": 1.0,
        }));
        assert_eq!(good.into_points().len(), 1);

        let bad = Telemetry::Single(json!({ "device_id": "d1", "value": 1.0 }));
        assert!(bad.into_points().is_empty());
    }

    #[test]
    fn batch_drops_only_malformed_items() {
        let batch = Telemetry::Batch(vec![
            json!({
                "deviceId": "d1",
                "timestamp": "2026-01-01T00:00:00Z",
                "sensorType": "temp",
                "value": 1.0,
            }),
            json!("not an object"),
            json!({
                "deviceId": "d1",
                "timestamp": 12,
                "sensorType": "temp",
                "value": 1.0,
            }),
            json!({
                "deviceId": "d2",
                "timestamp": "2026-01-01T00:00:01Z",
                "sensorType": "door",
                "value": true,
            }),
        ]);

        let points = batch.into_points();
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].device_id.as_str(), "d2");
    }
}
