pub mod api;
pub mod compression;
pub mod config;
pub mod error;
pub mod events;
pub mod export;
pub mod policy;
pub mod query;
pub mod retention;
pub mod service;
pub mod state;
pub mod stats;
pub mod storage;
pub mod strategy;
pub mod telemetry;

pub use compression::{BuiltinCodec, Codec, Compressed, CompressionPipeline, OverflowPolicy};
pub use config::{Config, PipelineConfig, ServerConfig, StorageBackend, TelemetryConfig};
pub use error::StoreError;
pub use events::{EventKind, ListenerId, StorageEvent};
pub use export::{ExportFormat, ExportPayload};
pub use policy::{CompressionAlgorithm, StorageConfig, StorageStrategy};
pub use query::{AggregateFunction, Aggregation, QueryOptions, SortBy, SortOrder};
pub use service::StorageService;
pub use state::DevicePhase;
pub use stats::DeviceStatistics;
pub use storage::PointStorage;
pub use storage::memory::MemoryStorage;
pub use storage::sqlite::SqliteStorage;
pub use telemetry::mock::MockTelemetrySource;
pub use telemetry::{LifecycleEvent, Telemetry, TelemetrySource};
