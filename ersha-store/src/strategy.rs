//! Admission decisions.
//!
//! The evaluator never looks beyond what the caller hands it: the point under
//! consideration, the most recent buffered point of the same sensor type, and
//! the device config. The comparison window is therefore the device's
//! not-yet-flushed buffer. Once a batch is flushed the next point of each
//! sensor type is compared against nothing and admitted.

use ersha_core::DataPoint;

use crate::policy::{StorageConfig, StorageStrategy};

/// Decide whether `point` enters the device's buffer.
pub fn should_admit(
    point: &DataPoint,
    last_of_same_sensor: Option<&DataPoint>,
    config: Option<&StorageConfig>,
) -> bool {
    let Some(config) = config else {
        return true;
    };

    match config.strategy {
        StorageStrategy::RealTime | StorageStrategy::Batch | StorageStrategy::Interval => true,
        StorageStrategy::Threshold => {
            let (Some(value), Some(threshold)) = (point.value.as_f64(), config.change_threshold)
            else {
                return true;
            };
            match last_of_same_sensor.and_then(|last| last.value.as_f64()) {
                Some(last) => (value - last).abs() >= threshold,
                None => true,
            }
        }
        StorageStrategy::Change => match last_of_same_sensor {
            Some(last) => point.value != last.value,
            None => true,
        },
        StorageStrategy::Custom => config
            .custom_filter
            .as_ref()
            .is_none_or(|filter| filter.admits(point)),
    }
}

/// Most recent point with the same sensor type, scanning newest first.
pub fn last_of_sensor<'a, I>(points: I, sensor_type: &str) -> Option<&'a DataPoint>
where
    I: DoubleEndedIterator<Item = &'a DataPoint>,
{
    points.rev().find(|p| p.sensor_type.as_ref() == sensor_type)
}
