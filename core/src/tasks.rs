// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Background maintenance tasks.
//!
//! The retention sweep runs hourly: history rows older than the
//! configured window are purged and expired alarm mutes reaped. Failures
//! are logged and retried on the next round.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::repository::Repository;

/// Settings key overriding the configured retention window
pub const RETENTION_SETTING: &str = "metrics_retention_hours";

/// Sweep cadence
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Launch the hourly retention sweep.
pub fn spawn_retention_task(
    repo: Arc<dyn Repository>,
    default_retention_hours: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; clean up whatever an earlier
        // run left behind.
        loop {
            ticker.tick().await;
            run_sweep(&repo, default_retention_hours).await;
        }
    })
}

/// One retention round; errors are logged, never fatal.
pub async fn run_sweep(repo: &Arc<dyn Repository>, default_retention_hours: u64) {
    let hours = match repo.get_setting(RETENTION_SETTING).await {
        Ok(Some(raw)) => raw.parse().unwrap_or(default_retention_hours),
        Ok(None) => default_retention_hours,
        Err(e) => {
            error!(error = %e, "retention sweep could not read settings");
            default_retention_hours
        }
    };

    let now = Utc::now();
    let cutoff = now - ChronoDuration::hours(hours as i64);
    match repo.purge_older_than(cutoff).await {
        Ok(stats) if stats.total() > 0 => {
            info!(
                device_metrics = stats.device_metrics,
                prometheus_metrics = stats.prometheus_metrics,
                bandwidth = stats.bandwidth,
                status_events = stats.status_events,
                retention_hours = hours,
                "retention sweep purged history"
            );
        }
        Ok(_) => debug!(retention_hours = hours, "retention sweep found nothing to purge"),
        Err(e) => error!(error = %e, "retention purge failed"),
    }

    // Listing active mutes reaps the expired rows as a side effect.
    if let Err(e) = repo.list_alarm_mutes(now).await {
        error!(error = %e, "mute reaping failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::models::{Device, DeviceKind, DeviceMetricsSample};
    use crate::repository::MemoryRepository;

    #[tokio::test]
    async fn test_sweep_honours_settings_override() {
        let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
        let device = repo
            .upsert_device(Device::new("d", DeviceKind::GenericPing, None))
            .await
            .unwrap();

        for hours_ago in [100i64, 10, 1] {
            repo.append_metrics_sample(DeviceMetricsSample {
                device_id: device.id,
                cpu_percent: Some(1.0),
                memory_percent: None,
                disk_percent: None,
                ping_rtt_ms: None,
                uptime_seconds: None,
                timestamp: Utc::now() - ChronoDuration::hours(hours_ago),
            })
            .await
            .unwrap();
        }

        // Default (720h) keeps everything.
        run_sweep(&repo, 720).await;
        let kept = repo
            .list_metrics_samples(device.id, Utc::now() - ChronoDuration::days(30))
            .await
            .unwrap();
        assert_eq!(kept.len(), 3);

        // Settings override to 24h drops the oldest sample.
        repo.set_setting(RETENTION_SETTING, "24").await.unwrap();
        run_sweep(&repo, 720).await;
        let kept = repo
            .list_metrics_samples(device.id, Utc::now() - ChronoDuration::days(30))
            .await
            .unwrap();
        assert_eq!(kept.len(), 2);
    }
}
