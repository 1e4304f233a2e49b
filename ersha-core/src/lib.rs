use std::collections::BTreeMap;
use std::fmt;

use ordered_float::NotNan;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

// We use `Box<str>` for strings that never grow after construction. This
// keeps points compact and avoids accidental cloning of large values.
type BoxStr = Box<str>;

/// Free-form metadata attached to a data point.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Identifier of a telemetry-producing device.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub BoxStr);

impl DeviceId {
    pub fn new(id: impl Into<BoxStr>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value.into_boxed_str())
    }
}

/// Unique identifier for a single telemetry sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PointId(pub Ulid);

/// Percentage value in the range 0–100 (inclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Percentage(pub u8);

impl Percentage {
    /// Clamp an arbitrary number into the 0–100 range.
    pub fn saturating(value: f64) -> Self {
        Self(value.clamp(0.0, 100.0).round() as u8)
    }
}

/// The measured value carried by a data point.
///
/// Numbers are never NaN, which lets two values be compared for equality
/// without surprises.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Number(NotNan<f64>),
    Text(BoxStr),
}

impl Scalar {
    /// Build a numeric scalar, returning `None` for NaN.
    pub fn number(value: f64) -> Option<Self> {
        NotNan::new(value).ok().map(Scalar::Number)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Number(n) => Some(n.into_inner()),
            _ => None,
        }
    }

    /// Parse a JSON value into a scalar. Arrays, objects and null are not scalars.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(Scalar::Bool(*b)),
            serde_json::Value::Number(n) => n.as_f64().and_then(Scalar::number),
            serde_json::Value::String(s) => Some(Scalar::Text(s.as_str().into())),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Number(n) => write!(f, "{n}"),
            Scalar::Text(s) => f.write_str(s),
        }
    }
}

/// A single telemetry sample reported by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Unique id for this sample, if the producer assigned one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<PointId>,
    /// Device that produced the sample.
    #[serde(alias = "deviceId")]
    pub device_id: DeviceId,
    /// Time the sample was taken.
    pub timestamp: jiff::Timestamp,
    /// Kind of sensor, e.g. "temperature".
    #[serde(alias = "sensorType")]
    pub sensor_type: BoxStr,
    /// Measured value.
    pub value: Scalar,
    /// Unit of the measured value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<BoxStr>,
    /// Producer-reported quality of the sample.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<Percentage>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl DataPoint {
    pub fn new(
        device_id: impl Into<DeviceId>,
        sensor_type: impl Into<BoxStr>,
        value: Scalar,
        timestamp: jiff::Timestamp,
    ) -> Self {
        Self {
            id: Some(PointId(Ulid::new())),
            device_id: device_id.into(),
            timestamp,
            sensor_type: sensor_type.into(),
            value,
            unit: None,
            quality: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_unit(mut self, unit: impl Into<BoxStr>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_quality(mut self, quality: Percentage) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Structurally validate an untyped telemetry item.
    ///
    /// The item must be an object carrying a string device id, a string
    /// timestamp, a string sensor type and a scalar `value`. Both snake_case
    /// and camelCase field names are accepted. Returns `None` for anything
    /// else; malformed items are never an error.
    pub fn from_json(item: &serde_json::Value) -> Option<Self> {
        let obj = item.as_object()?;
        let field = |snake: &str, camel: &str| obj.get(snake).or_else(|| obj.get(camel));

        let device_id = field("device_id", "deviceId")?.as_str()?;
        let timestamp = obj.get("timestamp")?.as_str()?.parse().ok()?;
        let sensor_type = field("sensor_type", "sensorType")?.as_str()?;
        let value = Scalar::from_json(obj.get("value")?)?;

        let id = obj
            .get("id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Ulid>().ok())
            .map(PointId);
        let unit = obj.get("unit").and_then(|v| v.as_str()).map(Into::into);
        let quality = obj
            .get("quality")
            .and_then(|v| v.as_f64())
            .map(Percentage::saturating);
        let metadata = obj
            .get("metadata")
            .and_then(|v| v.as_object())
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        Some(Self {
            id,
            device_id: DeviceId::new(device_id),
            timestamp,
            sensor_type: sensor_type.into(),
            value,
            unit,
            quality,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_json_accepts_camel_case_items() {
        let item = json!({
            "deviceId": "d1",
            "timestamp": "2026-01-02T03:04:05Z",
            "sensorType": "temperature",
            "value": 21.5,
            "unit": "C",
            "quality": 100,
            "metadata": { "source": "test" }
        });

        let point = DataPoint::from_json(&item).expect("valid point");
        assert_eq!(point.device_id.as_str(), "d1");
        assert_eq!(point.sensor_type.as_ref(), "temperature");
        assert_eq!(point.value.as_f64(), Some(21.5));
        assert_eq!(point.quality, Some(Percentage(100)));
        assert_eq!(point.metadata["source"], json!("test"));
    }

    #[test]
    fn from_json_rejects_malformed_items() {
        let missing_value = json!({
            "device_id": "d1",
            "timestamp": "2026-01-02T03:04:05Z",
            "sensor_type": "temperature"
        });
        let numeric_device = json!({
            "device_id": 7,
            "timestamp": "2026-01-02T03:04:05Z",
            "sensor_type": "temperature",
            "value": 1
        });
        let bad_timestamp = json!({
            "device_id": "d1",
            "timestamp": "yesterday",
            "sensor_type": "temperature",
            "value": 1
        });

        assert!(DataPoint::from_json(&missing_value).is_none());
        assert!(DataPoint::from_json(&numeric_device).is_none());
        assert!(DataPoint::from_json(&bad_timestamp).is_none());
        assert!(DataPoint::from_json(&json!([1, 2])).is_none());
    }

    #[test]
    fn json_round_trip_preserves_point() {
        let point = DataPoint::new(
            "d1",
            "humidity",
            Scalar::number(40.0).unwrap(),
            "2026-01-02T03:04:05Z".parse().unwrap(),
        )
        .with_unit("%")
        .with_metadata("site", json!("north"));

        let encoded = serde_json::to_string(&point).unwrap();
        let decoded: DataPoint = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, point);
    }

    #[test]
    fn scalar_rejects_nan() {
        assert!(Scalar::number(f64::NAN).is_none());
        assert!(Scalar::from_json(&json!(null)).is_none());
    }
}
