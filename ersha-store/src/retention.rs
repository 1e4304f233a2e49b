use std::time::Duration;

use jiff::SignedDuration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::service::StorageService;
use crate::storage::PointStorage;

/// Outcome of one retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub devices: usize,
    pub failed: usize,
}

/// Earliest timestamp still retained `retention_days` before `now`.
pub fn retention_cutoff(
    now: jiff::Timestamp,
    retention_days: u32,
) -> Result<jiff::Timestamp, StoreError> {
    let window = SignedDuration::from_hours(i64::from(retention_days) * 24);
    Ok(now.checked_sub(window)?)
}

/// Ask the storage adapter to drop persisted data older than each device's
/// retention window. Buffers and statistics are left alone.
pub async fn sweep<S: PointStorage>(service: &StorageService<S>) -> SweepReport {
    let now = jiff::Timestamp::now();
    let configs = service.device_configs().await;
    let mut report = SweepReport {
        devices: configs.len(),
        failed: 0,
    };

    for config in configs {
        let cutoff = match retention_cutoff(now, config.retention_days) {
            Ok(cutoff) => cutoff,
            Err(e) => {
                warn!(device_id = %config.device_id, error = ?e, "Cannot compute retention cutoff");
                report.failed += 1;
                continue;
            }
        };

        if let Err(e) = service
            .storage()
            .clear_before(&config.device_id, Some(cutoff))
            .await
        {
            warn!(device_id = %config.device_id, error = ?e, "Failed to purge expired data");
            report.failed += 1;
        }
    }

    report
}

/// Run [`sweep`] every `period` until cancelled.
pub async fn run_retention<S: PointStorage>(
    service: StorageService<S>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    // the first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Retention sweeper shutting down");
                break;
            }
            _ = interval.tick() => {
                let report = sweep(&service).await;
                info!(devices = report.devices, failed = report.failed, "Retention sweep finished");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cutoff_is_whole_days_back() {
        let now: jiff::Timestamp = "2026-03-10T12:00:00Z".parse().unwrap();
        let cutoff = retention_cutoff(now, 7).unwrap();
        assert_eq!(cutoff, "2026-03-03T12:00:00Z".parse().unwrap());
    }
}
