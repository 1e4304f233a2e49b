//! Serialization of query results for download.

use std::collections::HashSet;

use ersha_core::DataPoint;
use serde::Deserialize;
use serde_json::Value;

use crate::error::StoreError;

const METADATA_FIELD: &str = "metadata";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
    /// CSV bytes handed out as a binary payload.
    Excel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportPayload {
    Text(String),
    Binary(Vec<u8>),
}

impl ExportPayload {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ExportPayload::Text(text) => text.as_bytes(),
            ExportPayload::Binary(bytes) => bytes,
        }
    }
}

pub fn export(points: &[DataPoint], format: ExportFormat) -> Result<ExportPayload, StoreError> {
    match format {
        ExportFormat::Json => Ok(ExportPayload::Text(serde_json::to_string(points)?)),
        ExportFormat::Csv => Ok(ExportPayload::Text(to_csv(points)?)),
        ExportFormat::Excel => Ok(ExportPayload::Binary(to_csv(points)?.into_bytes())),
    }
}

/// Render points as CSV.
///
/// The header is every field name seen across the points, in first-seen
/// order, followed by one `metadata.<key>` column per metadata key. Absent
/// fields are left empty. An empty input renders as an empty string.
pub fn to_csv(points: &[DataPoint]) -> Result<String, StoreError> {
    if points.is_empty() {
        return Ok(String::new());
    }

    let objects = points
        .iter()
        .map(|p| match serde_json::to_value(p)? {
            Value::Object(map) => Ok(map),
            _ => Ok(serde_json::Map::new()),
        })
        .collect::<Result<Vec<_>, serde_json::Error>>()?;

    let mut seen = HashSet::new();
    let mut fields: Vec<String> = Vec::new();
    for object in &objects {
        for key in object.keys() {
            if seen.insert(key.clone()) {
                fields.push(key.clone());
            }
        }
        if let Some(Value::Object(metadata)) = object.get(METADATA_FIELD) {
            for key in metadata.keys() {
                let column = format!("{METADATA_FIELD}.{key}");
                if seen.insert(column.clone()) {
                    fields.push(column);
                }
            }
        }
    }

    let mut out = fields
        .iter()
        .map(|f| escape(f))
        .collect::<Vec<_>>()
        .join(",");

    for object in &objects {
        let row = fields
            .iter()
            .map(|field| {
                let value = match field.strip_prefix("metadata.") {
                    Some(key) => object
                        .get(METADATA_FIELD)
                        .and_then(|m| m.get(key)),
                    None => object.get(field.as_str()),
                };
                value.map(cell).unwrap_or_default()
            })
            .collect::<Vec<_>>()
            .join(",");
        out.push('\n');
        out.push_str(&row);
    }

    Ok(out)
}

fn cell(value: &Value) -> String {
    match value {
        Value::String(s) => escape(s),
        other => escape(&other.to_string()),
    }
}

fn escape(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use ersha_core::Scalar;
    use serde_json::json;

    use super::*;

    fn point(sensor: &str, value: f64) -> DataPoint {
        let mut p = DataPoint::new(
            "d1",
            sensor,
            Scalar::number(value).unwrap(),
            "2026-03-01T00:00:00Z".parse().unwrap(),
        );
        p.id = None;
        p
    }

    #[test]
    fn json_export_round_trips() {
        let points = vec![point("temp", 1.5), point("temp", 2.5).with_unit("C")];
        let ExportPayload::Text(text) = export(&points, ExportFormat::Json).unwrap() else {
            panic!("json export is text");
        };
        let back: Vec<DataPoint> = serde_json::from_str(&text).unwrap();
        assert_eq!(back, points);
    }

    #[test]
    fn csv_header_is_union_of_fields_and_metadata_keys() {
        let points = vec![
            point("temp", 1.0).with_metadata("a", json!(1)),
            point("temp", 2.0)
                .with_unit("C")
                .with_metadata("b", json!("x")),
        ];

        let csv = to_csv(&points).unwrap();
        let mut lines = csv.lines();
        let header: Vec<&str> = lines.next().unwrap().split(',').collect();

        for column in [
            "device_id",
            "timestamp",
            "sensor_type",
            "value",
            "unit",
            "metadata",
            "metadata.a",
            "metadata.b",
        ] {
            assert!(header.contains(&column), "missing column {column}");
        }
        assert_eq!(lines.count(), 2);
    }

    #[test]
    fn csv_leaves_absent_fields_empty() {
        let points = vec![point("temp", 1.0), point("temp", 2.0).with_unit("C")];
        let csv = to_csv(&points).unwrap();
        let lines: Vec<&str> = csv.lines().collect();

        let header: Vec<&str> = lines[0].split(',').collect();
        let unit = header.iter().position(|c| *c == "unit").unwrap();
        assert_eq!(lines[1].split(',').nth(unit), Some(""));
        assert_eq!(lines[2].split(',').nth(unit), Some("C"));
    }

    #[test]
    fn csv_quotes_cells_with_separators() {
        let p = point("temp", 1.0).with_metadata("note", json!("a,b"));
        let csv = to_csv(&[p]).unwrap();
        assert!(csv.contains("\"a,b\""));
        assert!(csv.contains("\"{\"\"note\"\":\"\"a,b\"\"}\""));
    }

    #[test]
    fn empty_input_exports_empty_csv() {
        assert_eq!(to_csv(&[]).unwrap(), "");
        assert_eq!(
            export(&[], ExportFormat::Excel).unwrap(),
            ExportPayload::Binary(Vec::new())
        );
    }
}
