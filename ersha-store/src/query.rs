use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::time::Duration;

use ersha_core::{DataPoint, DeviceId, Metadata, Scalar};

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortBy {
    #[default]
    Timestamp,
    Value,
    SensorType,
    DeviceId,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Avg,
    Min,
    Max,
    Sum,
    Count,
}

impl AggregateFunction {
    fn name(self) -> &'static str {
        match self {
            AggregateFunction::Avg => "avg",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Count => "count",
        }
    }
}

/// Roll points up into fixed time windows per device and sensor type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aggregation {
    pub function: AggregateFunction,
    pub window: Duration,
}

impl Aggregation {
    /// Build an aggregation from a window such as `"30s"`, `"15m"`, `"1h"`,
    /// `"1d"` or `"1w"`.
    pub fn new(function: AggregateFunction, window: &str) -> Result<Self, StoreError> {
        Ok(Self {
            function,
            window: parse_window(window)?,
        })
    }
}

fn parse_window(window: &str) -> Result<Duration, StoreError> {
    let window = window.trim();
    let split = window
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| StoreError::InvalidQuery(format!("time window {window:?} has no unit")))?;
    let (amount, unit) = window.split_at(split);
    let amount: u64 = amount
        .parse()
        .map_err(|_| StoreError::InvalidQuery(format!("invalid time window {window:?}")))?;

    let unit_secs = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        "w" => 604_800,
        other => {
            return Err(StoreError::InvalidQuery(format!(
                "unknown time window unit {other:?}"
            )));
        }
    };

    if amount == 0 {
        return Err(StoreError::InvalidQuery("time window must be positive".into()));
    }

    let secs = amount
        .checked_mul(unit_secs)
        .ok_or_else(|| StoreError::InvalidQuery(format!("time window {window:?} is too large")))?;

    Ok(Duration::from_secs(secs))
}

/// Selection, ordering and paging applied to a data query.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub device_id: Option<DeviceId>,
    /// Inclusive lower bound.
    pub start_time: Option<jiff::Timestamp>,
    /// Inclusive upper bound.
    pub end_time: Option<jiff::Timestamp>,
    pub sensor_types: Option<Vec<String>>,
    pub skip: usize,
    pub limit: Option<usize>,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
    pub include_metadata: bool,
    /// Also return points still waiting in the ingestion buffer.
    pub include_buffered: bool,
    pub aggregation: Option<Aggregation>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            device_id: None,
            start_time: None,
            end_time: None,
            sensor_types: None,
            skip: 0,
            limit: None,
            sort_by: SortBy::Timestamp,
            sort_order: SortOrder::Asc,
            include_metadata: true,
            include_buffered: true,
            aggregation: None,
        }
    }
}

impl QueryOptions {
    pub fn builder() -> QueryOptionsBuilder {
        QueryOptionsBuilder::new()
    }

    /// Whether a point passes the device, time and sensor filters.
    pub fn matches(&self, point: &DataPoint) -> bool {
        if self
            .device_id
            .as_ref()
            .is_some_and(|id| *id != point.device_id)
        {
            return false;
        }
        if self.start_time.is_some_and(|start| point.timestamp < start) {
            return false;
        }
        if self.end_time.is_some_and(|end| point.timestamp > end) {
            return false;
        }
        match &self.sensor_types {
            Some(types) => types.iter().any(|t| t.as_str() == point.sensor_type.as_ref()),
            None => true,
        }
    }

    /// Filter, aggregate, sort and page a candidate set.
    pub fn apply(&self, points: Vec<DataPoint>) -> Result<Vec<DataPoint>, StoreError> {
        let mut selected: Vec<DataPoint> = points.into_iter().filter(|p| self.matches(p)).collect();

        if let Some(aggregation) = self.aggregation {
            selected = aggregate(selected, aggregation)?;
        }

        selected.sort_by(|a, b| {
            let ord = compare(a, b, self.sort_by);
            match self.sort_order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });

        let mut paged: Vec<DataPoint> = selected
            .into_iter()
            .skip(self.skip)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect();

        if !self.include_metadata {
            for point in paged.iter_mut() {
                point.metadata.clear();
            }
        }

        Ok(paged)
    }
}

fn compare(a: &DataPoint, b: &DataPoint, sort_by: SortBy) -> Ordering {
    match sort_by {
        SortBy::Timestamp => a.timestamp.cmp(&b.timestamp),
        SortBy::SensorType => a.sensor_type.cmp(&b.sensor_type),
        SortBy::DeviceId => a.device_id.cmp(&b.device_id),
        SortBy::Value => match (&a.value, &b.value) {
            (Scalar::Number(x), Scalar::Number(y)) => x.cmp(y),
            (Scalar::Number(_), _) => Ordering::Less,
            (_, Scalar::Number(_)) => Ordering::Greater,
            (x, y) => x.to_string().cmp(&y.to_string()),
        },
    }
}

#[derive(Default)]
struct Bucket {
    count: u64,
    numeric: Vec<f64>,
    unit: Option<Box<str>>,
}

fn aggregate(points: Vec<DataPoint>, aggregation: Aggregation) -> Result<Vec<DataPoint>, StoreError> {
    let window_secs = aggregation.window.as_secs().max(1) as i64;
    let mut buckets: BTreeMap<(DeviceId, Box<str>, i64), Bucket> = BTreeMap::new();

    for point in points {
        let start = point.timestamp.as_second().div_euclid(window_secs) * window_secs;
        let bucket = buckets
            .entry((point.device_id, point.sensor_type, start))
            .or_default();
        bucket.count += 1;
        if let Some(v) = point.value.as_f64() {
            bucket.numeric.push(v);
        }
        if bucket.unit.is_none() {
            bucket.unit = point.unit;
        }
    }

    let mut out = Vec::with_capacity(buckets.len());
    for ((device_id, sensor_type, start), bucket) in buckets {
        let value = match aggregation.function {
            AggregateFunction::Count => Some(bucket.count as f64),
            _ if bucket.numeric.is_empty() => None,
            AggregateFunction::Sum => Some(bucket.numeric.iter().sum()),
            AggregateFunction::Avg => {
                Some(bucket.numeric.iter().sum::<f64>() / bucket.numeric.len() as f64)
            }
            AggregateFunction::Min => bucket.numeric.iter().copied().reduce(f64::min),
            AggregateFunction::Max => bucket.numeric.iter().copied().reduce(f64::max),
        };
        let Some(value) = value.and_then(Scalar::number) else {
            continue;
        };

        let mut metadata = Metadata::new();
        metadata.insert("aggregation".into(), aggregation.function.name().into());
        metadata.insert("window_secs".into(), window_secs.into());
        metadata.insert("count".into(), bucket.count.into());

        out.push(DataPoint {
            id: None,
            device_id,
            timestamp: jiff::Timestamp::from_second(start)?,
            sensor_type,
            value,
            unit: bucket.unit,
            quality: None,
            metadata,
        });
    }

    Ok(out)
}

#[derive(Default)]
pub struct QueryOptionsBuilder {
    options: QueryOptions,
}

impl QueryOptionsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device(mut self, device_id: impl Into<DeviceId>) -> Self {
        self.options.device_id = Some(device_id.into());
        self
    }

    pub fn start_time(mut self, ts: jiff::Timestamp) -> Self {
        self.options.start_time = Some(ts);
        self
    }

    pub fn end_time(mut self, ts: jiff::Timestamp) -> Self {
        self.options.end_time = Some(ts);
        self
    }

    pub fn sensor_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.sensor_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.options.skip = skip;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.options.limit = Some(limit);
        self
    }

    pub fn sort(mut self, sort_by: SortBy, sort_order: SortOrder) -> Self {
        self.options.sort_by = sort_by;
        self.options.sort_order = sort_order;
        self
    }

    pub fn include_metadata(mut self, include: bool) -> Self {
        self.options.include_metadata = include;
        self
    }

    pub fn include_buffered(mut self, include: bool) -> Self {
        self.options.include_buffered = include;
        self
    }

    pub fn aggregation(mut self, aggregation: Aggregation) -> Self {
        self.options.aggregation = Some(aggregation);
        self
    }

    pub fn build(self) -> QueryOptions {
        self.options
    }
}
