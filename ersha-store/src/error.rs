use ersha_core::DeviceId;

/// Boxed error returned by a persistence adapter.
pub type AdapterError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("data point or storage config is missing a device id")]
    MissingDeviceId,
    #[error("invalid storage config: {0}")]
    InvalidConfig(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("persistence error for device {device_id}: {source}")]
    Persistence {
        device_id: DeviceId,
        #[source]
        source: AdapterError,
    },
    #[error("storage declined {count} points for device {device_id}")]
    Declined { device_id: DeviceId, count: usize },
    #[error("query failed: {0}")]
    Query(#[source] AdapterError),
    #[error("compression failed: {0}")]
    Compression(#[from] crate::compression::CompressionError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("time arithmetic error: {0}")]
    Time(#[from] jiff::Error),
}
