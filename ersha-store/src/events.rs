use std::sync::{Arc, RwLock};

use ersha_core::{DataPoint, DeviceId};
use tokio::sync::broadcast;

use crate::policy::StorageConfig;

const CHANNEL_CAPACITY: usize = 1024;

/// Events published by the storage service.
#[derive(Debug, Clone)]
pub enum StorageEvent {
    StorageConfigured {
        device_id: DeviceId,
        config: StorageConfig,
        timestamp: jiff::Timestamp,
    },
    DataPointBuffered {
        device_id: DeviceId,
        point: DataPoint,
        timestamp: jiff::Timestamp,
    },
    DataPointsBuffered {
        device_id: DeviceId,
        count: usize,
        timestamp: jiff::Timestamp,
    },
    FlushStarted {
        device_id: DeviceId,
        count: usize,
        timestamp: jiff::Timestamp,
    },
    FlushCompleted {
        device_id: DeviceId,
        success: bool,
        count: usize,
        timestamp: jiff::Timestamp,
    },
    FlushError {
        device_id: DeviceId,
        count: usize,
        error: String,
        timestamp: jiff::Timestamp,
    },
    DataQueried {
        device_id: Option<DeviceId>,
        result_count: usize,
        timestamp: jiff::Timestamp,
    },
    DataCleared {
        device_id: DeviceId,
        before: Option<jiff::Timestamp>,
        timestamp: jiff::Timestamp,
    },
}

/// Discriminant of [`StorageEvent`], used to register interest in one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StorageConfigured,
    DataPointBuffered,
    DataPointsBuffered,
    FlushStarted,
    FlushCompleted,
    FlushError,
    DataQueried,
    DataCleared,
}

impl StorageEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            StorageEvent::StorageConfigured { .. } => EventKind::StorageConfigured,
            StorageEvent::DataPointBuffered { .. } => EventKind::DataPointBuffered,
            StorageEvent::DataPointsBuffered { .. } => EventKind::DataPointsBuffered,
            StorageEvent::FlushStarted { .. } => EventKind::FlushStarted,
            StorageEvent::FlushCompleted { .. } => EventKind::FlushCompleted,
            StorageEvent::FlushError { .. } => EventKind::FlushError,
            StorageEvent::DataQueried { .. } => EventKind::DataQueried,
            StorageEvent::DataCleared { .. } => EventKind::DataCleared,
        }
    }

    pub fn device_id(&self) -> Option<&DeviceId> {
        match self {
            StorageEvent::StorageConfigured { device_id, .. }
            | StorageEvent::DataPointBuffered { device_id, .. }
            | StorageEvent::DataPointsBuffered { device_id, .. }
            | StorageEvent::FlushStarted { device_id, .. }
            | StorageEvent::FlushCompleted { device_id, .. }
            | StorageEvent::FlushError { device_id, .. }
            | StorageEvent::DataCleared { device_id, .. } => Some(device_id),
            StorageEvent::DataQueried { device_id, .. } => device_id.as_ref(),
        }
    }
}

/// Handle returned by [`EventBus::on`], used to remove the handler again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Handler = Arc<dyn Fn(&StorageEvent) + Send + Sync>;

struct Listener {
    id: ListenerId,
    kind: EventKind,
    handler: Handler,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<Listener>,
}

/// Event bus owned by one storage service.
///
/// Handlers registered with [`EventBus::on`] run synchronously on the
/// emitting task and must not block. [`EventBus::subscribe`] hands out a
/// channel receiver that sees every event.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StorageEvent>,
    listeners: Arc<RwLock<Listeners>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            listeners: Arc::new(RwLock::new(Listeners::default())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.sender.subscribe()
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&StorageEvent) + Send + Sync + 'static,
    {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let id = ListenerId(listeners.next_id);
        listeners.next_id += 1;
        listeners.entries.push(Listener {
            id,
            kind,
            handler: Arc::new(handler),
        });
        id
    }

    /// Remove a handler. Returns `false` if it was already removed.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = listeners.entries.len();
        listeners.entries.retain(|l| l.id != id);
        listeners.entries.len() != before
    }

    pub fn emit(&self, event: StorageEvent) {
        let kind = event.kind();
        let handlers: Vec<Handler> = {
            let listeners = self
                .listeners
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            listeners
                .entries
                .iter()
                .filter(|l| l.kind == kind)
                .map(|l| Arc::clone(&l.handler))
                .collect()
        };

        for handler in handlers {
            handler(&event);
        }

        // no receivers is fine
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
