use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use ersha_core::{DataPoint, DeviceId, Metadata, Percentage, PointId, Scalar};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::policy::CompressionAlgorithm;

/// What happens to a batch when every compression worker is busy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Queue the batch for later processing and hand the caller back the
    /// uncompressed points immediately.
    #[default]
    PassThrough,
    /// Queue the batch and wait until a worker has compressed it.
    Wait,
}

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("cannot {algorithm:?}-encode point from sensor {sensor_type}: {reason}")]
    Encode {
        algorithm: CompressionAlgorithm,
        sensor_type: String,
        reason: String,
    },
    #[error("malformed frame: {0}")]
    Decode(String),
    #[error("frame serialization failed: {0}")]
    Frame(#[from] postcard::Error),
    #[error("metadata serialization failed: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("compression worker failed: {0}")]
    Worker(String),
    #[error("compression task was dropped before completion")]
    Cancelled,
    #[error("compression pipeline state poisoned: {0}")]
    Poisoned(String),
}

impl<T> From<PoisonError<T>> for CompressionError {
    fn from(err: PoisonError<T>) -> Self {
        CompressionError::Poisoned(err.to_string())
    }
}

/// Encodes a batch into a byte frame and back.
///
/// Implementations run on blocking worker threads and may be CPU heavy.
pub trait Codec: Send + Sync + 'static {
    fn encode(
        &self,
        algorithm: CompressionAlgorithm,
        points: &[DataPoint],
    ) -> Result<Vec<u8>, CompressionError>;

    fn decode(&self, frame: &[u8]) -> Result<Vec<DataPoint>, CompressionError>;
}

/// A batch after it went through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Compressed {
    /// Points to persist, decoded back from the frame when one was built.
    pub points: Vec<DataPoint>,
    /// Length of the encoded frame. `None` if the batch was not encoded.
    pub frame_len: Option<u64>,
}

impl Compressed {
    fn unencoded(points: Vec<DataPoint>) -> Self {
        Self {
            points,
            frame_len: None,
        }
    }
}

/// Counters describing pipeline activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    /// Tasks that finished successfully, including queued bookkeeping tasks.
    pub completed: u64,
    pub failed: u64,
    /// Batches returned uncompressed because every worker was busy.
    pub passed_through: u64,
    /// Tasks currently waiting for a worker.
    pub queued: usize,
    /// Workers currently running a task.
    pub busy_workers: usize,
}

type Reply = oneshot::Sender<Result<Compressed, CompressionError>>;

struct Task {
    device_id: DeviceId,
    algorithm: CompressionAlgorithm,
    points: Vec<DataPoint>,
    reply: Option<Reply>,
}

struct Inner {
    busy: usize,
    queue: VecDeque<Task>,
    stats: PipelineStats,
}

struct Shared {
    codec: Arc<dyn Codec>,
    workers: usize,
    overflow: OverflowPolicy,
    inner: Mutex<Inner>,
}

/// Bounded pool of compression workers fed by a FIFO queue.
#[derive(Clone)]
pub struct CompressionPipeline {
    shared: Arc<Shared>,
}

impl CompressionPipeline {
    pub fn new(codec: Arc<dyn Codec>, workers: usize, overflow: OverflowPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                codec,
                workers: workers.max(1),
                overflow,
                inner: Mutex::new(Inner {
                    busy: 0,
                    queue: VecDeque::new(),
                    stats: PipelineStats::default(),
                }),
            }),
        }
    }

    /// Single worker running the built-in codec.
    pub fn builtin(overflow: OverflowPolicy) -> Self {
        Self::new(Arc::new(BuiltinCodec), 1, overflow)
    }

    pub fn overflow(&self) -> OverflowPolicy {
        self.shared.overflow
    }

    pub fn stats(&self) -> Result<PipelineStats, CompressionError> {
        let inner = self.shared.inner.lock()?;
        Ok(PipelineStats {
            queued: inner.queue.len(),
            busy_workers: inner.busy,
            ..inner.stats
        })
    }

    /// Compress a batch for `device_id`.
    ///
    /// With [`CompressionAlgorithm::None`] the batch is returned untouched.
    pub async fn compress(
        &self,
        device_id: &DeviceId,
        points: Vec<DataPoint>,
        algorithm: CompressionAlgorithm,
    ) -> Result<Compressed, CompressionError> {
        if algorithm == CompressionAlgorithm::None || points.is_empty() {
            return Ok(Compressed::unencoded(points));
        }

        // Ok: wait for a queued task. Err: run on a free worker right away.
        let waiting = {
            let mut inner = self.shared.inner.lock()?;
            if inner.busy < self.shared.workers {
                inner.busy += 1;
                Err(points)
            } else {
                match self.shared.overflow {
                    OverflowPolicy::PassThrough => {
                        inner.stats.passed_through += 1;
                        inner.queue.push_back(Task {
                            device_id: device_id.clone(),
                            algorithm,
                            points: points.clone(),
                            reply: None,
                        });
                        debug!(
                            device_id = %device_id,
                            queued = inner.queue.len(),
                            "compression workers busy, passing batch through"
                        );
                        return Ok(Compressed::unencoded(points));
                    }
                    OverflowPolicy::Wait => {
                        let (tx, rx) = oneshot::channel();
                        inner.queue.push_back(Task {
                            device_id: device_id.clone(),
                            algorithm,
                            points,
                            reply: Some(tx),
                        });
                        Ok(rx)
                    }
                }
            }
        };

        match waiting {
            Ok(rx) => rx.await.map_err(|_| CompressionError::Cancelled)?,
            Err(points) => {
                let slot = WorkerSlot(Arc::clone(&self.shared));
                let result = run_task(&self.shared, algorithm, points).await;
                self.shared.record(device_id, &result);
                drop(slot);
                result
            }
        }
    }
}

/// Marks one worker busy until dropped, then hands it to the next queued task.
struct WorkerSlot(Arc<Shared>);

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        Shared::release(&self.0);
    }
}

impl Shared {
    fn record(&self, device_id: &DeviceId, result: &Result<Compressed, CompressionError>) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        match result {
            Ok(_) => inner.stats.completed += 1,
            Err(e) => {
                inner.stats.failed += 1;
                warn!(device_id = %device_id, error = %e, "compression task failed");
            }
        }
    }

    /// Free a worker and start the oldest queued task on it, if any.
    fn release(shared: &Arc<Shared>) {
        let next = {
            let Ok(mut inner) = shared.inner.lock() else {
                return;
            };
            match inner.queue.pop_front() {
                Some(task) => Some(task),
                None => {
                    inner.busy = inner.busy.saturating_sub(1);
                    None
                }
            }
        };

        let Some(task) = next else {
            return;
        };

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(device_id = %task.device_id, "no runtime available for queued compression task");
            if let Ok(mut inner) = shared.inner.lock() {
                inner.busy = inner.busy.saturating_sub(1);
            }
            return;
        };

        let shared = Arc::clone(shared);
        handle.spawn(async move {
            let slot = WorkerSlot(Arc::clone(&shared));
            let result = run_task(&shared, task.algorithm, task.points).await;
            shared.record(&task.device_id, &result);
            drop(slot);
            if let Some(reply) = task.reply {
                let _ = reply.send(result);
            }
        });
    }
}

async fn run_task(
    shared: &Shared,
    algorithm: CompressionAlgorithm,
    points: Vec<DataPoint>,
) -> Result<Compressed, CompressionError> {
    let codec = Arc::clone(&shared.codec);
    tokio::task::spawn_blocking(move || {
        let frame = codec.encode(algorithm, &points)?;
        let points = codec.decode(&frame)?;
        Ok(Compressed {
            points,
            frame_len: Some(frame.len() as u64),
        })
    })
    .await
    .map_err(|e| CompressionError::Worker(e.to_string()))?
}

/// Columnar codec shipped with the pipeline.
///
/// Every algorithm interns strings into a dictionary and stores timestamps
/// as differences to the previous row. `Delta` additionally stores numbers
/// as differences of their bit patterns per sensor, `Rle` collapses runs of
/// equal values, and `Lossy` rounds numbers to two decimals before encoding.
/// Only `Lossy` changes the decoded readings.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinCodec;

const LOSSY_SCALE: f64 = 100.0;

#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    dictionary: Vec<String>,
    rows: Vec<Row>,
    values: Values,
}

#[derive(Debug, Serialize, Deserialize)]
struct Row {
    id: Option<u128>,
    device: u32,
    sensor: u32,
    unit: Option<u32>,
    /// Nanoseconds since the previous row, or since the epoch for the first.
    timestamp: i128,
    quality: Option<u8>,
    /// JSON object, empty when the point has no metadata.
    metadata: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum Value {
    Bool(bool),
    /// IEEE-754 bit pattern, or its difference to the previous one.
    Number(i64),
    Text(u32),
}

#[derive(Debug, Serialize, Deserialize)]
enum Values {
    Plain(Vec<Value>),
    Delta(Vec<Value>),
    Runs(Vec<(Value, u32)>),
}

#[derive(Default)]
struct Dictionary<'a> {
    index: HashMap<&'a str, u32>,
    strings: Vec<String>,
}

impl<'a> Dictionary<'a> {
    fn intern(&mut self, s: &'a str) -> u32 {
        if let Some(&idx) = self.index.get(s) {
            return idx;
        }
        let idx = self.strings.len() as u32;
        self.index.insert(s, idx);
        self.strings.push(s.to_owned());
        idx
    }
}

fn lookup(dictionary: &[String], idx: u32) -> Result<&str, CompressionError> {
    dictionary
        .get(idx as usize)
        .map(String::as_str)
        .ok_or_else(|| CompressionError::Decode(format!("string index {idx} out of range")))
}

impl Codec for BuiltinCodec {
    fn encode(
        &self,
        algorithm: CompressionAlgorithm,
        points: &[DataPoint],
    ) -> Result<Vec<u8>, CompressionError> {
        let points: Cow<'_, [DataPoint]> = match algorithm {
            CompressionAlgorithm::Lossy => Cow::Owned(lossy_round(points)?),
            _ => Cow::Borrowed(points),
        };

        let mut dictionary = Dictionary::default();
        let mut rows = Vec::with_capacity(points.len());
        let mut values = Vec::with_capacity(points.len());
        let mut previous = 0i128;

        for point in points.iter() {
            let nanos = point.timestamp.as_nanosecond();
            let metadata = if point.metadata.is_empty() {
                String::new()
            } else {
                serde_json::to_string(&point.metadata)?
            };
            rows.push(Row {
                id: point.id.map(|id| u128::from(id.0)),
                device: dictionary.intern(point.device_id.as_str()),
                sensor: dictionary.intern(&point.sensor_type),
                unit: point.unit.as_deref().map(|unit| dictionary.intern(unit)),
                timestamp: nanos - previous,
                quality: point.quality.map(|q| q.0),
                metadata,
            });
            previous = nanos;

            values.push(match &point.value {
                Scalar::Bool(b) => Value::Bool(*b),
                Scalar::Number(n) => Value::Number(n.into_inner().to_bits() as i64),
                Scalar::Text(text) => Value::Text(dictionary.intern(text)),
            });
        }

        let values = match algorithm {
            CompressionAlgorithm::Delta => Values::Delta(delta_encode(&rows, values)),
            CompressionAlgorithm::Rle => Values::Runs(run_length_encode(values)),
            _ => Values::Plain(values),
        };

        let frame = Frame {
            dictionary: dictionary.strings,
            rows,
            values,
        };
        Ok(postcard::to_stdvec(&frame)?)
    }

    fn decode(&self, frame: &[u8]) -> Result<Vec<DataPoint>, CompressionError> {
        let Frame {
            dictionary,
            rows,
            values,
        } = postcard::from_bytes(frame)?;

        let values = match values {
            Values::Plain(values) => values,
            Values::Delta(values) => delta_decode(&rows, values),
            Values::Runs(runs) => run_length_decode(runs),
        };
        if values.len() != rows.len() {
            return Err(CompressionError::Decode(format!(
                "{} values for {} rows",
                values.len(),
                rows.len()
            )));
        }

        let mut nanos = 0i128;
        let mut points = Vec::with_capacity(rows.len());
        for (row, value) in rows.into_iter().zip(values) {
            nanos += row.timestamp;
            let value = match value {
                Value::Bool(b) => Scalar::Bool(b),
                Value::Number(bits) => Scalar::number(f64::from_bits(bits as u64))
                    .ok_or_else(|| CompressionError::Decode("NaN in number column".into()))?,
                Value::Text(idx) => Scalar::Text(lookup(&dictionary, idx)?.into()),
            };
            let unit = match row.unit {
                Some(idx) => Some(lookup(&dictionary, idx)?.into()),
                None => None,
            };
            let metadata = if row.metadata.is_empty() {
                Metadata::new()
            } else {
                serde_json::from_str(&row.metadata)?
            };

            points.push(DataPoint {
                id: row.id.map(|raw| PointId(raw.into())),
                device_id: DeviceId::from(lookup(&dictionary, row.device)?),
                timestamp: jiff::Timestamp::from_nanosecond(nanos)
                    .map_err(|e| CompressionError::Decode(e.to_string()))?,
                sensor_type: lookup(&dictionary, row.sensor)?.into(),
                value,
                unit,
                quality: row.quality.map(Percentage),
                metadata,
            });
        }

        Ok(points)
    }
}

/// Replace numbers by the difference of their bit pattern to the previous
/// number of the same sensor. Wrapping arithmetic keeps this exact.
fn delta_encode(rows: &[Row], values: Vec<Value>) -> Vec<Value> {
    let mut previous: HashMap<u32, i64> = HashMap::new();
    rows.iter()
        .zip(values)
        .map(|(row, value)| match value {
            Value::Number(bits) => {
                let base = previous.insert(row.sensor, bits).unwrap_or(0);
                Value::Number(bits.wrapping_sub(base))
            }
            other => other,
        })
        .collect()
}

fn delta_decode(rows: &[Row], values: Vec<Value>) -> Vec<Value> {
    let mut previous: HashMap<u32, i64> = HashMap::new();
    rows.iter()
        .zip(values)
        .map(|(row, value)| match value {
            Value::Number(delta) => {
                let base = previous.get(&row.sensor).copied().unwrap_or(0);
                let bits = delta.wrapping_add(base);
                previous.insert(row.sensor, bits);
                Value::Number(bits)
            }
            other => other,
        })
        .collect()
}

fn run_length_encode(values: Vec<Value>) -> Vec<(Value, u32)> {
    let mut runs: Vec<(Value, u32)> = Vec::new();
    for value in values {
        match runs.last_mut() {
            Some((last, count)) if *last == value => *count += 1,
            _ => runs.push((value, 1)),
        }
    }
    runs
}

fn run_length_decode(runs: Vec<(Value, u32)>) -> Vec<Value> {
    runs.into_iter()
        .flat_map(|(value, count)| std::iter::repeat_n(value, count as usize))
        .collect()
}

fn lossy_round(points: &[DataPoint]) -> Result<Vec<DataPoint>, CompressionError> {
    points
        .iter()
        .cloned()
        .map(|mut point| {
            if let Some(value) = point.value.as_f64() {
                let rounded = (value * LOSSY_SCALE).round() / LOSSY_SCALE;
                if rounded.is_finite() {
                    point.value =
                        Scalar::number(rounded).ok_or_else(|| CompressionError::Encode {
                            algorithm: CompressionAlgorithm::Lossy,
                            sensor_type: point.sensor_type.to_string(),
                            reason: format!("rounding {value} produced NaN"),
                        })?;
                }
            }
            Ok(point)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn point(sensor: &str, value: f64, ts: &str) -> DataPoint {
        DataPoint::new("d1", sensor, Scalar::number(value).unwrap(), ts.parse().unwrap())
    }

    fn round_trip(algorithm: CompressionAlgorithm, points: &[DataPoint]) -> (Vec<DataPoint>, usize) {
        let frame = BuiltinCodec.encode(algorithm, points).unwrap();
        (BuiltinCodec.decode(&frame).unwrap(), frame.len())
    }

    fn mixed_batch() -> Vec<DataPoint> {
        let mut points = vec![
            point("temp", 20.0, "2026-01-01T00:00:00Z").with_unit("C"),
            point("hum", 50.0, "2026-01-01T00:00:01Z"),
            point("temp", 22.5, "2026-01-01T00:00:02Z").with_unit("C"),
            point("temp", 21.5, "2026-01-01T00:00:03Z").with_unit("C"),
            DataPoint::new(
                "d1",
                "door",
                Scalar::Text("open".into()),
                "2026-01-01T00:00:04Z".parse().unwrap(),
            ),
            DataPoint::new(
                "d1",
                "alarm",
                Scalar::Bool(true),
                "2026-01-01T00:00:05Z".parse().unwrap(),
            ),
        ];
        points[1].quality = Some(Percentage(87));
        points[2].metadata.insert("firmware".into(), json!({"version": "1.2.0"}));
        points
    }

    /// Codec that sleeps, then tags every point with the call order.
    struct SlowCodec {
        delay: Duration,
        calls: AtomicUsize,
    }

    impl Codec for SlowCodec {
        fn encode(
            &self,
            _algorithm: CompressionAlgorithm,
            points: &[DataPoint],
        ) -> Result<Vec<u8>, CompressionError> {
            std::thread::sleep(self.delay);
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let mut points = points.to_vec();
            for p in points.iter_mut() {
                p.metadata.insert("compressed_by_call".into(), call.into());
            }
            Ok(serde_json::to_vec(&points)?)
        }

        fn decode(&self, frame: &[u8]) -> Result<Vec<DataPoint>, CompressionError> {
            Ok(serde_json::from_slice(frame)?)
        }
    }

    fn slow_pipeline(overflow: OverflowPolicy) -> CompressionPipeline {
        CompressionPipeline::new(
            Arc::new(SlowCodec {
                delay: Duration::from_millis(100),
                calls: AtomicUsize::new(0),
            }),
            1,
            overflow,
        )
    }

    #[test]
    fn lossless_algorithms_decode_to_the_input() {
        let points = mixed_batch();
        for algorithm in [
            CompressionAlgorithm::Delta,
            CompressionAlgorithm::Rle,
            CompressionAlgorithm::Dictionary,
            CompressionAlgorithm::Lossless,
        ] {
            let (decoded, _) = round_trip(algorithm, &points);
            assert_eq!(decoded, points, "{algorithm:?}");
        }
    }

    #[test]
    fn frames_are_smaller_than_json() {
        let points: Vec<DataPoint> = (0..50)
            .map(|i| {
                let ts = jiff::Timestamp::from_second(1_767_225_600 + i).unwrap();
                DataPoint::new("d1", "temp", Scalar::number(20.0).unwrap(), ts)
            })
            .collect();
        let json_len = serde_json::to_vec(&points).unwrap().len();

        let (_, delta_len) = round_trip(CompressionAlgorithm::Delta, &points);
        let (_, rle_len) = round_trip(CompressionAlgorithm::Rle, &points);
        assert!(delta_len < json_len);
        // one run for the whole batch
        assert!(rle_len < delta_len);
    }

    #[test]
    fn delta_keeps_infinite_values_exact() {
        let points = vec![
            point("temp", f64::INFINITY, "2026-01-01T00:00:00Z"),
            point("temp", f64::NEG_INFINITY, "2026-01-01T00:00:01Z"),
            point("temp", -0.0, "2026-01-01T00:00:02Z"),
        ];
        let (decoded, _) = round_trip(CompressionAlgorithm::Delta, &points);
        assert_eq!(decoded, points);
    }

    #[test]
    fn rle_keeps_interleaved_sensors_in_order() {
        let points = vec![
            point("temp", 20.0, "2026-01-01T00:00:00Z"),
            point("temp", 20.0, "2026-01-01T00:00:01Z"),
            point("hum", 20.0, "2026-01-01T00:00:02Z"),
            point("temp", 21.0, "2026-01-01T00:00:03Z"),
            point("temp", 20.0, "2026-01-01T00:00:04Z"),
        ];
        let (decoded, _) = round_trip(CompressionAlgorithm::Rle, &points);
        assert_eq!(decoded, points);
    }

    #[test]
    fn lossy_rounds_to_two_decimals() {
        let points = vec![
            point("temp", 20.123_456, "2026-01-01T00:00:00Z"),
            point("temp", f64::MAX, "2026-01-01T00:00:01Z"),
        ];
        let (decoded, _) = round_trip(CompressionAlgorithm::Lossy, &points);
        assert_eq!(decoded[0].value.as_f64(), Some(20.12));
        assert_eq!(decoded[1].value.as_f64(), Some(f64::MAX));
        assert_eq!(decoded[0].timestamp, points[0].timestamp);
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let frame = BuiltinCodec
            .encode(CompressionAlgorithm::Lossless, &mixed_batch())
            .unwrap();
        let err = BuiltinCodec.decode(&frame[..frame.len() / 2]).unwrap_err();
        assert!(matches!(err, CompressionError::Frame(_)));
    }

    #[tokio::test]
    async fn none_is_pass_through() {
        let pipeline = CompressionPipeline::builtin(OverflowPolicy::PassThrough);
        let points = vec![point("temp", 20.0, "2026-01-01T00:00:00Z")];

        let out = pipeline
            .compress(&DeviceId::from("d1"), points.clone(), CompressionAlgorithm::None)
            .await
            .unwrap();

        assert_eq!(out.points, points);
        assert_eq!(out.frame_len, None);
        assert_eq!(pipeline.stats().unwrap().completed, 0);
    }

    #[tokio::test]
    async fn idle_worker_encodes_the_batch() {
        let pipeline = CompressionPipeline::builtin(OverflowPolicy::PassThrough);
        let points = mixed_batch();

        let out = pipeline
            .compress(&DeviceId::from("d1"), points.clone(), CompressionAlgorithm::Delta)
            .await
            .unwrap();

        assert_eq!(out.points, points);
        assert!(out.frame_len.is_some_and(|len| len > 0));
        assert_eq!(pipeline.stats().unwrap().completed, 1);
    }

    #[tokio::test]
    async fn busy_worker_passes_batch_through_and_drains_later() {
        let pipeline = slow_pipeline(OverflowPolicy::PassThrough);
        let device = DeviceId::from("d1");
        let first = vec![point("temp", 1.0, "2026-01-01T00:00:00Z")];
        let second = vec![point("temp", 2.0, "2026-01-01T00:00:01Z")];

        let (a, b) = tokio::join!(
            pipeline.compress(&device, first, CompressionAlgorithm::Lossless),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                pipeline
                    .compress(&device, second.clone(), CompressionAlgorithm::Lossless)
                    .await
            }
        );

        let a = a.unwrap();
        let b = b.unwrap();
        assert_eq!(a.points[0].metadata["compressed_by_call"], json!(0));
        // returned uncompressed
        assert_eq!(b.points, second);
        assert_eq!(b.frame_len, None);

        // the queued task still runs for bookkeeping
        tokio::time::sleep(Duration::from_millis(300)).await;
        let stats = pipeline.stats().unwrap();
        assert_eq!(stats.passed_through, 1);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.busy_workers, 0);
    }

    #[tokio::test]
    async fn wait_policy_returns_compressed_batches_in_order() {
        let pipeline = slow_pipeline(OverflowPolicy::Wait);
        let device = DeviceId::from("d1");

        let (a, b, c) = tokio::join!(
            pipeline.compress(
                &device,
                vec![point("temp", 1.0, "2026-01-01T00:00:00Z")],
                CompressionAlgorithm::Lossless
            ),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                pipeline
                    .compress(
                        &device,
                        vec![point("temp", 2.0, "2026-01-01T00:00:01Z")],
                        CompressionAlgorithm::Lossless,
                    )
                    .await
            },
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                pipeline
                    .compress(
                        &device,
                        vec![point("temp", 3.0, "2026-01-01T00:00:02Z")],
                        CompressionAlgorithm::Lossless,
                    )
                    .await
            }
        );

        assert_eq!(a.unwrap().points[0].metadata["compressed_by_call"], json!(0));
        assert_eq!(b.unwrap().points[0].metadata["compressed_by_call"], json!(1));
        assert_eq!(c.unwrap().points[0].metadata["compressed_by_call"], json!(2));

        let stats = pipeline.stats().unwrap();
        assert_eq!(stats.passed_through, 0);
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.busy_workers, 0);
    }
}
