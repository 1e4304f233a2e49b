use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use ersha_core::{DataPoint, DeviceId};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::compression::CompressionPipeline;
use crate::error::StoreError;
use crate::events::{EventBus, EventKind, ListenerId, StorageEvent};
use crate::export::{self, ExportFormat, ExportPayload};
use crate::policy::{StorageConfig, StorageStrategy};
use crate::query::QueryOptions;
use crate::state::{DevicePhase, DeviceSlot, DeviceTable};
use crate::stats::{DeviceStatistics, batch_size_bytes};
use crate::storage::PointStorage;
use crate::strategy::{last_of_sensor, should_admit};
use crate::telemetry::{LifecycleEvent, Telemetry};

/// Buffers device telemetry and moves it into a [`PointStorage`].
///
/// Cloning is cheap; all clones share the same device table, pipeline and
/// event bus.
pub struct StorageService<S: PointStorage> {
    inner: Arc<Inner<S>>,
}

struct Inner<S> {
    storage: S,
    devices: DeviceTable,
    pipeline: CompressionPipeline,
    events: EventBus,
    /// Parent of every interval timer.
    shutdown: CancellationToken,
}

impl<S: PointStorage> Clone for StorageService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: PointStorage> StorageService<S> {
    pub fn new(storage: S, pipeline: CompressionPipeline) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                devices: DeviceTable::new(),
                pipeline,
                events: EventBus::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn storage(&self) -> &S {
        &self.inner.storage
    }

    pub fn pipeline(&self) -> &CompressionPipeline {
        &self.inner.pipeline
    }

    fn emit(&self, event: StorageEvent) {
        self.inner.events.emit(event);
    }

    /// Register a handler for one kind of event.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&StorageEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, handler)
    }

    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.events.off(id)
    }

    /// Channel receiving every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.inner.events.subscribe()
    }

    /// Install `config` as the device's active configuration.
    ///
    /// Buffered points and statistics survive a reconfiguration. Any interval
    /// timer of the previous configuration is cancelled first.
    pub async fn configure_device_storage(&self, config: StorageConfig) -> Result<(), StoreError> {
        let config = config.normalize()?;
        let device_id = config.device_id.clone();
        let (slot, _) = self.inner.devices.get_or_insert(&config).await;

        let timer = {
            let mut record = slot.record.lock().await;
            record.cancel_timer();
            record.config = config.clone();

            if config.strategy == StorageStrategy::Interval {
                let token = self.inner.shutdown.child_token();
                record.timer = Some(token.clone());
                Some(token)
            } else {
                None
            }
        };

        if let Some(token) = timer {
            self.spawn_interval_flush(device_id.clone(), config.interval, token);
        }

        info!(
            device_id = %device_id,
            strategy = ?config.strategy,
            compression = ?config.compression,
            batch_size = config.batch_size,
            "Storage configured"
        );

        self.emit(StorageEvent::StorageConfigured {
            device_id,
            config,
            timestamp: jiff::Timestamp::now(),
        });

        Ok(())
    }

    fn spawn_interval_flush(&self, device_id: DeviceId, period: Duration, token: CancellationToken) {
        let weak: Weak<Inner<S>> = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        let service = StorageService { inner };
                        if let Err(e) = service.flush_device_data(&device_id).await {
                            warn!(device_id = %device_id, error = ?e, "Interval flush failed");
                        }
                    }
                }
            }

            debug!(device_id = %device_id, "Interval timer stopped");
        });
    }

    /// Slot for a device, created with the default config if it is new.
    async fn slot_or_default(&self, device_id: &DeviceId) -> Arc<DeviceSlot> {
        let config = StorageConfig::new(device_id.clone());
        let (slot, created) = self.inner.devices.get_or_insert(&config).await;

        if created {
            debug!(device_id = %device_id, "Using default storage config");
            self.emit(StorageEvent::StorageConfigured {
                device_id: device_id.clone(),
                config,
                timestamp: jiff::Timestamp::now(),
            });
        }

        slot
    }

    /// Offer one point to its device's buffer.
    ///
    /// Returns `Ok(false)` when the device's strategy rejects the point.
    pub async fn store_data_point(&self, point: DataPoint) -> Result<bool, StoreError> {
        let device_id = point.device_id.clone();
        let admission = self.admit_point(point).await?;
        if admission == Admission::AdmittedFlush {
            self.flush_device_data(&device_id).await?;
        }
        Ok(admission != Admission::Rejected)
    }

    async fn admit_point(&self, point: DataPoint) -> Result<Admission, StoreError> {
        if point.device_id.is_empty() {
            return Err(StoreError::MissingDeviceId);
        }

        let device_id = point.device_id.clone();
        let slot = self.slot_or_default(&device_id).await;

        let flush_now = {
            let mut record = slot.record.lock().await;
            let last = last_of_sensor(record.buffer.iter(), &point.sensor_type);
            if !should_admit(&point, last, Some(&record.config)) {
                debug!(device_id = %device_id, sensor_type = %point.sensor_type, "Point rejected");
                return Ok(Admission::Rejected);
            }

            record.buffer.push(point.clone());
            record.stats.record(&point);

            match record.config.strategy {
                StorageStrategy::RealTime => true,
                StorageStrategy::Batch => record.buffer.len() >= record.config.batch_size,
                _ => false,
            }
        };

        self.emit(StorageEvent::DataPointBuffered {
            device_id,
            point,
            timestamp: jiff::Timestamp::now(),
        });

        Ok(if flush_now {
            Admission::AdmittedFlush
        } else {
            Admission::Admitted
        })
    }

    /// Offer many points at once. Points without a device id are skipped.
    ///
    /// Returns the number of admitted points.
    pub async fn store_data_points(&self, points: Vec<DataPoint>) -> Result<usize, StoreError> {
        let (total, due) = self.admit_points(points).await;
        for device_id in due {
            self.flush_device_data(&device_id).await?;
        }
        Ok(total)
    }

    /// Admit a bulk input, returning the admitted count and the devices due
    /// for a flush.
    async fn admit_points(&self, points: Vec<DataPoint>) -> (usize, Vec<DeviceId>) {
        let mut groups: BTreeMap<DeviceId, Vec<DataPoint>> = BTreeMap::new();
        for point in points {
            if point.device_id.is_empty() {
                continue;
            }
            groups.entry(point.device_id.clone()).or_default().push(point);
        }

        let mut total = 0;
        let mut due = Vec::new();
        for (device_id, points) in groups {
            let slot = self.slot_or_default(&device_id).await;

            let (admitted, flush_now) = {
                let mut record = slot.record.lock().await;

                let mut survivors: Vec<DataPoint> = Vec::with_capacity(points.len());
                for point in points {
                    // earlier survivors of this call count as buffered
                    let last = last_of_sensor(survivors.iter(), &point.sensor_type)
                        .or_else(|| last_of_sensor(record.buffer.iter(), &point.sensor_type));
                    if should_admit(&point, last, Some(&record.config)) {
                        survivors.push(point);
                    }
                }

                for point in &survivors {
                    record.stats.record(point);
                }
                let admitted = survivors.len();
                record.buffer.extend(survivors);

                let flush_now = admitted > 0
                    && (record.config.strategy == StorageStrategy::RealTime
                        || record.buffer.len() >= record.config.batch_size);
                (admitted, flush_now)
            };

            if admitted == 0 {
                continue;
            }
            total += admitted;

            self.emit(StorageEvent::DataPointsBuffered {
                device_id: device_id.clone(),
                count: admitted,
                timestamp: jiff::Timestamp::now(),
            });

            if flush_now {
                due.push(device_id);
            }
        }

        (total, due)
    }

    /// Move a device's buffer through compression into storage.
    ///
    /// Returns `Ok(false)` if another flush of the same device is running or
    /// the batch could not be written. A failed batch is put back in front of
    /// anything buffered meanwhile.
    pub async fn flush_device_data(&self, device_id: &DeviceId) -> Result<bool, StoreError> {
        let Some(slot) = self.inner.devices.get(device_id).await else {
            return Ok(true);
        };

        let Ok(_flush_guard) = slot.flush_lock.try_lock() else {
            debug!(device_id = %device_id, "Flush already in progress");
            return Ok(false);
        };

        self.flush_locked(&slot, device_id).await
    }

    /// Flush body. The caller holds `slot.flush_lock`.
    async fn flush_locked(
        &self,
        slot: &DeviceSlot,
        device_id: &DeviceId,
    ) -> Result<bool, StoreError> {
        let (batch, config) = {
            let mut record = slot.record.lock().await;
            if record.buffer.is_empty() {
                return Ok(true);
            }
            record.flushing = true;
            (std::mem::take(&mut record.buffer), record.config.clone())
        };
        let count = batch.len();

        self.emit(StorageEvent::FlushStarted {
            device_id: device_id.clone(),
            count,
            timestamp: jiff::Timestamp::now(),
        });

        let outcome = self.write_batch(device_id, &batch, &config).await;

        let mut record = slot.record.lock().await;
        record.flushing = false;

        match outcome {
            Ok((raw_bytes, compressed_bytes)) => {
                record.stats.record_flush(raw_bytes, compressed_bytes);
                drop(record);

                info!(device_id = %device_id, count, "Flushed buffered points");
                self.emit(StorageEvent::FlushCompleted {
                    device_id: device_id.clone(),
                    success: true,
                    count,
                    timestamp: jiff::Timestamp::now(),
                });
                Ok(true)
            }
            Err(e) => {
                let newer = std::mem::replace(&mut record.buffer, batch);
                record.buffer.extend(newer);
                drop(record);

                warn!(device_id = %device_id, count, error = %e, "Flush failed, batch restored");
                self.emit(StorageEvent::FlushError {
                    device_id: device_id.clone(),
                    count,
                    error: e.to_string(),
                    timestamp: jiff::Timestamp::now(),
                });
                Ok(false)
            }
        }
    }

    /// Compress and persist one batch, returning raw and compressed sizes.
    /// A batch that was not encoded counts as its raw size.
    async fn write_batch(
        &self,
        device_id: &DeviceId,
        batch: &[DataPoint],
        config: &StorageConfig,
    ) -> Result<(u64, u64), StoreError> {
        let compressed = self
            .inner
            .pipeline
            .compress(device_id, batch.to_vec(), config.compression)
            .await?;

        let stored = self
            .inner
            .storage
            .persist(device_id, &compressed.points, config)
            .await
            .map_err(|e| StoreError::Persistence {
                device_id: device_id.clone(),
                source: Box::new(e),
            })?;

        if !stored {
            return Err(StoreError::Declined {
                device_id: device_id.clone(),
                count: compressed.points.len(),
            });
        }

        let raw_bytes = batch_size_bytes(batch);
        Ok((raw_bytes, compressed.frame_len.unwrap_or(raw_bytes)))
    }

    /// Persisted points merged with still-buffered ones, filtered, ordered and
    /// paged by `options`.
    pub async fn query_data(&self, options: &QueryOptions) -> Result<Vec<DataPoint>, StoreError> {
        let mut points = self
            .inner
            .storage
            .query(options)
            .await
            .map_err(|e| StoreError::Query(Box::new(e)))?;

        if options.include_buffered {
            let slots = match &options.device_id {
                Some(id) => self
                    .inner
                    .devices
                    .get(id)
                    .await
                    .map(|slot| vec![slot])
                    .unwrap_or_default(),
                None => self
                    .inner
                    .devices
                    .slots()
                    .await
                    .into_iter()
                    .map(|(_, slot)| slot)
                    .collect(),
            };

            for slot in slots {
                let record = slot.record.lock().await;
                points.extend(record.buffer.iter().filter(|p| options.matches(p)).cloned());
            }
        }

        let points = options.apply(points)?;

        self.emit(StorageEvent::DataQueried {
            device_id: options.device_id.clone(),
            result_count: points.len(),
            timestamp: jiff::Timestamp::now(),
        });

        Ok(points)
    }

    pub async fn export_data(
        &self,
        options: &QueryOptions,
        format: ExportFormat,
    ) -> Result<ExportPayload, StoreError> {
        let points = self.query_data(options).await?;
        export::export(&points, format)
    }

    pub async fn get_device_statistics(&self, device_id: &DeviceId) -> Option<DeviceStatistics> {
        let slot = self.inner.devices.get(device_id).await?;
        let record = slot.record.lock().await;
        Some(record.stats.clone())
    }

    pub async fn get_all_statistics(&self) -> BTreeMap<DeviceId, DeviceStatistics> {
        let mut all = BTreeMap::new();
        for (id, slot) in self.inner.devices.slots().await {
            let record = slot.record.lock().await;
            all.insert(id, record.stats.clone());
        }
        all
    }

    pub async fn device_phase(&self, device_id: &DeviceId) -> Option<DevicePhase> {
        let slot = self.inner.devices.get(device_id).await?;
        let record = slot.record.lock().await;
        Some(record.phase())
    }

    /// Number of points waiting in a device's buffer.
    pub async fn buffered_count(&self, device_id: &DeviceId) -> usize {
        match self.inner.devices.get(device_id).await {
            Some(slot) => slot.record.lock().await.buffer.len(),
            None => 0,
        }
    }

    /// Current config of every device.
    pub async fn device_configs(&self) -> Vec<StorageConfig> {
        let mut configs = Vec::new();
        for (_, slot) in self.inner.devices.slots().await {
            configs.push(slot.record.lock().await.config.clone());
        }
        configs
    }

    /// Drop a device's data.
    ///
    /// With a cutoff only older points are removed, from the buffer and from
    /// storage, and statistics are kept. Without one the buffer is emptied,
    /// statistics are reset and all persisted data is deleted.
    ///
    /// Waits for an in-flight flush of the device and blocks new ones until
    /// storage has been cleared.
    pub async fn clear_device_data(
        &self,
        device_id: &DeviceId,
        before: Option<jiff::Timestamp>,
    ) -> Result<bool, StoreError> {
        let slot = self.inner.devices.get(device_id).await;
        let _flush_guard = match &slot {
            Some(slot) => Some(slot.flush_lock.lock().await),
            None => None,
        };

        if let Some(slot) = &slot {
            let mut record = slot.record.lock().await;
            match before {
                Some(cutoff) => record.buffer.retain(|p| p.timestamp >= cutoff),
                None => {
                    record.buffer.clear();
                    record.stats = DeviceStatistics::empty(device_id.clone());
                }
            }
        }

        let cleared = self
            .inner
            .storage
            .clear_before(device_id, before)
            .await
            .map_err(|e| StoreError::Persistence {
                device_id: device_id.clone(),
                source: Box::new(e),
            })?;

        info!(device_id = %device_id, before = ?before, "Cleared device data");
        self.emit(StorageEvent::DataCleared {
            device_id: device_id.clone(),
            before,
            timestamp: jiff::Timestamp::now(),
        });

        Ok(cleared)
    }

    /// Forget a device: stop its timer, attempt a last flush and discard its
    /// state. Returns whether the last flush succeeded.
    pub async fn unregister_device(&self, device_id: &DeviceId) -> Result<bool, StoreError> {
        let Some(slot) = self.inner.devices.get(device_id).await else {
            return Ok(false);
        };

        slot.record.lock().await.cancel_timer();

        let flushed = {
            // waits for an in-flight flush, then keeps other flushes out
            let _flush_guard = slot.flush_lock.lock().await;
            let flushed = match self.flush_locked(&slot, device_id).await {
                Ok(flushed) => flushed,
                Err(e) => {
                    error!(device_id = %device_id, error = ?e, "Final flush failed");
                    false
                }
            };
            self.inner.devices.remove(device_id).await;
            flushed
        };

        let leftover = slot.record.lock().await.buffer.len();
        if leftover > 0 {
            warn!(device_id = %device_id, leftover, "Discarding unflushed points");
        }
        info!(device_id = %device_id, "Device unregistered");

        Ok(flushed)
    }

    /// Flush every device, returning how many could not be flushed.
    pub async fn flush_all(&self) -> usize {
        let mut failed = 0;
        for (id, _) in self.inner.devices.slots().await {
            match self.flush_device_data(&id).await {
                Ok(true) => {}
                Ok(false) => failed += 1,
                Err(e) => {
                    error!(device_id = %id, error = ?e, "Flush failed");
                    failed += 1;
                }
            }
        }
        failed
    }

    /// Stop every interval timer.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Feed telemetry and lifecycle notifications into the service until
    /// cancelled or both channels close.
    ///
    /// Points are admitted in arrival order. Flushes they trigger and
    /// unregistrations run as separate tasks, so a slow device does not hold
    /// up admission for the others. In-flight tasks finish before this returns.
    pub async fn run(
        &self,
        mut telemetry_rx: mpsc::Receiver<Telemetry>,
        mut lifecycle_rx: mpsc::Receiver<LifecycleEvent>,
        cancel: CancellationToken,
    ) {
        info!("Telemetry listener started");

        let mut tasks = JoinSet::new();
        let mut telemetry_open = true;
        let mut lifecycle_open = true;

        while telemetry_open || lifecycle_open {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Telemetry listener shutting down");
                    break;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = ?e, "Listener task panicked");
                    }
                }
                telemetry = telemetry_rx.recv(), if telemetry_open => {
                    match telemetry {
                        Some(telemetry) => {
                            for device_id in self.ingest(telemetry).await {
                                let service = self.clone();
                                tasks.spawn(async move {
                                    if let Err(e) = service.flush_device_data(&device_id).await {
                                        error!(device_id = %device_id, error = ?e, "Triggered flush failed");
                                    }
                                });
                            }
                        }
                        None => telemetry_open = false,
                    }
                }
                event = lifecycle_rx.recv(), if lifecycle_open => {
                    match event {
                        Some(LifecycleEvent::DeviceUnregistered { device_id }) => {
                            let service = self.clone();
                            tasks.spawn(async move {
                                if let Err(e) = service.unregister_device(&device_id).await {
                                    error!(device_id = %device_id, error = ?e, "Failed to unregister device");
                                }
                            });
                        }
                        None => lifecycle_open = false,
                    }
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = ?e, "Listener task panicked");
            }
        }
    }

    /// Admit telemetry, returning the devices due for a flush.
    async fn ingest(&self, telemetry: Telemetry) -> Vec<DeviceId> {
        match telemetry {
            Telemetry::Single(item) => {
                let Some(point) = DataPoint::from_json(&item) else {
                    debug!("Dropped malformed telemetry item");
                    return Vec::new();
                };
                let device_id = point.device_id.clone();
                match self.admit_point(point).await {
                    Ok(Admission::AdmittedFlush) => vec![device_id],
                    Ok(_) => Vec::new(),
                    Err(e) => {
                        error!(error = ?e, "Failed to store telemetry");
                        Vec::new()
                    }
                }
            }
            batch @ Telemetry::Batch(_) => {
                let points = batch.into_points();
                if points.is_empty() {
                    return Vec::new();
                }
                let (_, due) = self.admit_points(points).await;
                due
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Rejected,
    Admitted,
    /// Admitted and the device is due for a flush.
    AdmittedFlush,
}
