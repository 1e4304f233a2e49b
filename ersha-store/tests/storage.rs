use ersha_core::{DataPoint, DeviceId, Scalar};
use ersha_store::query::QueryOptions;
use ersha_store::storage::memory::{MemoryStorage, MemoryStorageError};
use ersha_store::storage::sqlite::{SqliteStorage, SqliteStorageError};
use ersha_store::{PointStorage, StorageConfig};
use tempfile::NamedTempFile;

fn point_at(device: &str, sensor: &str, value: f64, ts: &str) -> DataPoint {
    DataPoint::new(device, sensor, Scalar::number(value).unwrap(), ts.parse().unwrap())
}

fn sample() -> Vec<DataPoint> {
    vec![
        point_at("d1", "temp", 20.0, "2026-01-01T00:00:00Z"),
        point_at("d1", "humidity", 40.0, "2026-01-02T00:00:00Z"),
        point_at("d1", "temp", 21.0, "2026-01-03T00:00:00Z"),
    ]
}

async fn persist_and_filter<S: PointStorage>(storage: &S) -> Result<(), S::Error> {
    let d1 = DeviceId::from("d1");
    let config = StorageConfig::new("d1");

    assert!(storage.persist(&d1, &sample(), &config).await?);
    let other = [point_at("d2", "temp", 5.0, "2026-01-02T00:00:00Z")];
    assert!(storage.persist(&DeviceId::from("d2"), &other, &config).await?);

    assert_eq!(storage.count(None).await?, 4);
    assert_eq!(storage.count(Some(&d1)).await?, 3);

    let all = storage.query(&QueryOptions::default()).await?;
    assert_eq!(all.len(), 4);

    let temps = storage
        .query(
            &QueryOptions::builder()
                .device("d1")
                .sensor_types(["temp"])
                .build(),
        )
        .await?;
    assert_eq!(temps.len(), 2);
    assert!(temps.iter().all(|p| p.sensor_type.as_ref() == "temp"));

    // both bounds are inclusive
    let ranged = storage
        .query(
            &QueryOptions::builder()
                .device("d1")
                .start_time("2026-01-02T00:00:00Z".parse().unwrap())
                .end_time("2026-01-03T00:00:00Z".parse().unwrap())
                .build(),
        )
        .await?;
    assert_eq!(ranged.len(), 2);

    Ok(())
}

async fn clear_before_cutoff<S: PointStorage>(storage: &S) -> Result<(), S::Error> {
    let d1 = DeviceId::from("d1");
    let config = StorageConfig::new("d1");
    storage.persist(&d1, &sample(), &config).await?;

    let cutoff = "2026-01-02T00:00:00Z".parse().unwrap();
    assert!(storage.clear_before(&d1, Some(cutoff)).await?);
    let left = storage.query(&QueryOptions::builder().device("d1").build()).await?;
    assert_eq!(left.len(), 2);
    assert!(left.iter().all(|p| p.timestamp >= cutoff));

    assert!(storage.clear_before(&d1, None).await?);
    assert_eq!(storage.count(Some(&d1)).await?, 0);

    // clearing an unknown device is not an error
    assert!(storage.clear_before(&DeviceId::from("ghost"), None).await?);

    Ok(())
}

/// memory storage tests
#[tokio::test]
async fn memory_persist_and_filter() -> Result<(), MemoryStorageError> {
    persist_and_filter(&MemoryStorage::default()).await
}

#[tokio::test]
async fn memory_clear_before_cutoff() -> Result<(), MemoryStorageError> {
    clear_before_cutoff(&MemoryStorage::default()).await
}

#[tokio::test]
async fn memory_clones_share_data() -> Result<(), MemoryStorageError> {
    let storage = MemoryStorage::default();
    let clone = storage.clone();
    storage
        .persist(&DeviceId::from("d1"), &sample(), &StorageConfig::new("d1"))
        .await?;
    assert_eq!(clone.count(None).await?, 3);
    Ok(())
}

/// sqlite storage tests
#[tokio::test]
async fn sqlite_persist_and_filter() -> Result<(), SqliteStorageError> {
    let storage = SqliteStorage::new_in_memory().await?;
    persist_and_filter(&storage).await
}

#[tokio::test]
async fn sqlite_clear_before_cutoff() -> Result<(), SqliteStorageError> {
    let storage = SqliteStorage::new_in_memory().await?;
    clear_before_cutoff(&storage).await
}

#[tokio::test]
async fn sqlite_round_trips_points() -> Result<(), SqliteStorageError> {
    let storage = SqliteStorage::new_in_memory().await?;
    let point = point_at("d1", "temp", 20.5, "2026-01-01T00:00:00.123456789Z")
        .with_unit("C")
        .with_metadata("source", serde_json::json!("bench"));

    storage
        .persist(&DeviceId::from("d1"), &[point.clone()], &StorageConfig::new("d1"))
        .await?;

    let back = storage.query(&QueryOptions::default()).await?;
    assert_eq!(back, vec![point]);
    Ok(())
}

#[tokio::test]
async fn sqlite_persistence_across_instances() -> Result<(), SqliteStorageError> {
    let temp_file = NamedTempFile::new().unwrap();
    let path = temp_file.path().to_str().unwrap();

    {
        let storage = SqliteStorage::new(path).await?;
        storage
            .persist(&DeviceId::from("d1"), &sample(), &StorageConfig::new("d1"))
            .await?;
    }

    let storage = SqliteStorage::new(path).await?;
    assert_eq!(storage.count(Some(&DeviceId::from("d1"))).await?, 3);
    Ok(())
}

#[tokio::test]
async fn sqlite_empty_batch() -> Result<(), SqliteStorageError> {
    let storage = SqliteStorage::new_in_memory().await?;
    assert!(
        storage
            .persist(&DeviceId::from("d1"), &[], &StorageConfig::new("d1"))
            .await?
    );
    assert_eq!(storage.count(None).await?, 0);
    Ok(())
}
