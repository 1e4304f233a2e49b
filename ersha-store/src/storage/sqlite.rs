use async_trait::async_trait;
use ersha_core::{DataPoint, DeviceId};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, migrate::Migrator};

use crate::policy::{CompressionAlgorithm, StorageConfig};
use crate::query::QueryOptions;
use crate::storage::PointStorage;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, thiserror::Error)]
pub enum SqliteStorageError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// SQLite-backed storage implementation.
/// Stores each point as a JSON blob next to the columns used for filtering.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Opens or creates a SQLite database at the given path.
    pub async fn new(path: impl AsRef<str>) -> Result<Self, SqliteStorageError> {
        let connection_string = format!("sqlite:{}?mode=rwc", path.as_ref());
        let pool = SqlitePoolOptions::new().connect(&connection_string).await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn new_in_memory() -> Result<Self, SqliteStorageError> {
        // every connection to :memory: is its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }
}

fn compression_label(algorithm: CompressionAlgorithm) -> &'static str {
    match algorithm {
        CompressionAlgorithm::None => "none",
        CompressionAlgorithm::Delta => "delta",
        CompressionAlgorithm::Rle => "rle",
        CompressionAlgorithm::Dictionary => "dictionary",
        CompressionAlgorithm::Lossy => "lossy",
        CompressionAlgorithm::Lossless => "lossless",
    }
}

#[async_trait]
impl PointStorage for SqliteStorage {
    type Error = SqliteStorageError;

    async fn persist(
        &self,
        device_id: &DeviceId,
        points: &[DataPoint],
        config: &StorageConfig,
    ) -> Result<bool, Self::Error> {
        let persisted_at = jiff::Timestamp::now().as_millisecond();
        let compression = compression_label(config.compression);
        let mut tx = self.pool.begin().await?;

        for point in points {
            let json = serde_json::to_string(point)?;

            sqlx::query(
                r#"
                INSERT INTO data_points (device_id, sensor_type, timestamp, compression, point_json, persisted_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(device_id.as_str())
            .bind(&*point.sensor_type)
            .bind(point.timestamp.as_millisecond())
            .bind(compression)
            .bind(json)
            .bind(persisted_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn query(&self, options: &QueryOptions) -> Result<Vec<DataPoint>, Self::Error> {
        let mut query_builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT point_json FROM data_points WHERE 1 = 1");

        if let Some(device_id) = &options.device_id {
            query_builder
                .push(" AND device_id = ")
                .push_bind(device_id.as_str().to_owned());
        }
        if let Some(start) = options.start_time {
            // millisecond columns; exact bounds are re-checked below
            query_builder
                .push(" AND timestamp >= ")
                .push_bind(start.as_millisecond() - 1);
        }
        if let Some(end) = options.end_time {
            query_builder
                .push(" AND timestamp <= ")
                .push_bind(end.as_millisecond() + 1);
        }
        if let Some(types) = options.sensor_types.as_ref().filter(|t| !t.is_empty()) {
            query_builder.push(" AND sensor_type IN (");
            let mut separated = query_builder.separated(", ");
            for sensor_type in types {
                separated.push_bind(sensor_type.clone());
            }
            separated.push_unseparated(")");
        }
        query_builder.push(" ORDER BY seq ASC");

        let rows = query_builder.build().fetch_all(&self.pool).await?;

        let mut points = Vec::with_capacity(rows.len());
        for row in rows {
            let json: String = row.try_get("point_json")?;
            let point: DataPoint = serde_json::from_str(&json)?;
            if options.matches(&point) {
                points.push(point);
            }
        }

        Ok(points)
    }

    async fn clear_before(
        &self,
        device_id: &DeviceId,
        cutoff: Option<jiff::Timestamp>,
    ) -> Result<bool, Self::Error> {
        match cutoff {
            Some(cutoff) => {
                sqlx::query("DELETE FROM data_points WHERE device_id = ? AND timestamp < ?")
                    .bind(device_id.as_str())
                    .bind(cutoff.as_millisecond())
                    .execute(&self.pool)
                    .await?;
            }
            None => {
                sqlx::query("DELETE FROM data_points WHERE device_id = ?")
                    .bind(device_id.as_str())
                    .execute(&self.pool)
                    .await?;
            }
        }

        Ok(true)
    }

    async fn count(&self, device_id: Option<&DeviceId>) -> Result<usize, Self::Error> {
        let count: i64 = match device_id {
            Some(id) => {
                sqlx::query("SELECT COUNT(*) FROM data_points WHERE device_id = ?")
                    .bind(id.as_str())
                    .fetch_one(&self.pool)
                    .await?
                    .try_get(0)?
            }
            None => {
                sqlx::query("SELECT COUNT(*) FROM data_points")
                    .fetch_one(&self.pool)
                    .await?
                    .try_get(0)?
            }
        };

        Ok(count as usize)
    }
}
