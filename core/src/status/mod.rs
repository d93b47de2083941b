// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Status engine.
//!
//! Debounced status tracking per device. Samples arrive from the
//! scheduler; transitions follow the threshold table below, append a
//! status event (the chain invariant lives in the repository), and fan
//! out to subscribers (notification dispatcher, realtime bus).
//!
//! | from    | on                           | to      |
//! |---------|------------------------------|---------|
//! | any     | success                      | online  |
//! | online  | failure (1..N-1)             | warning |
//! | warning | failure (≥ N)                | offline |
//! | offline | success                      | online  |
//! | any     | last *success* older than S  | stale   |
//!
//! Per-device state updates are serialised by a per-device async mutex;
//! samples for different devices proceed independently.

pub mod metrics;
pub mod segments;

pub use metrics::{
    aggregate_bandwidth, aggregate_metrics, AggregatedBandwidthPoint, AggregatedMetricsPoint,
};
pub use segments::{derive_segments, online_ratio};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::probers::{ProbeError, ProbeSample};
use crate::repository::models::{
    Device, DeviceMetricsSample, DeviceStatus, DeviceStatusEvent, PrometheusMetricSample,
};
use crate::repository::{Repository, RepositoryResult};

/// Broadcast capacity for status changes
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Auth failures are logged once per device per this window
const AUTH_LOG_WINDOW: Duration = Duration::from_secs(3600);

/// Status transition published to subscribers
#[derive(Debug, Clone)]
pub struct StatusChange {
    /// Device snapshot taken at transition time.
    pub device: Device,
    pub event: DeviceStatusEvent,
}

/// Engine thresholds
#[derive(Debug, Clone, Copy)]
pub struct StatusThresholds {
    /// Consecutive failures before offline
    pub offline: u32,
    /// Consecutive failures before warning
    pub warning: u32,
    /// Age of the last successful sample before stale
    pub stale_age: Duration,
}

impl Default for StatusThresholds {
    fn default() -> Self {
        Self {
            offline: 3,
            warning: 1,
            stale_age: Duration::from_secs(90),
        }
    }
}

#[derive(Debug, Clone)]
struct DeviceRuntime {
    status: DeviceStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_sample_at: Option<DateTime<Utc>>,
    last_good_sample_at: Option<DateTime<Utc>>,
    last_auth_log_at: Option<DateTime<Utc>>,
}

impl DeviceRuntime {
    fn from_device(device: &Device) -> Self {
        Self {
            status: device.status,
            consecutive_failures: device.consecutive_failures,
            consecutive_successes: 0,
            last_sample_at: device.last_probed_at,
            last_good_sample_at: None,
            last_auth_log_at: None,
        }
    }
}

/// Debounced per-device status tracking
pub struct StatusEngine {
    repo: Arc<dyn Repository>,
    thresholds: parking_lot::RwLock<StatusThresholds>,
    runtimes: DashMap<Uuid, Arc<Mutex<DeviceRuntime>>>,
    changes_tx: broadcast::Sender<StatusChange>,
}

impl StatusEngine {
    pub fn new(repo: Arc<dyn Repository>, thresholds: StatusThresholds) -> Self {
        let (changes_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            repo,
            thresholds: parking_lot::RwLock::new(thresholds),
            runtimes: DashMap::new(),
            changes_tx,
        }
    }

    /// Subscribe to status transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.changes_tx.subscribe()
    }

    /// Current thresholds.
    pub fn thresholds(&self) -> StatusThresholds {
        *self.thresholds.read()
    }

    /// Adjust thresholds at runtime (settings API).
    pub fn update_thresholds(&self, update: impl FnOnce(&mut StatusThresholds)) {
        update(&mut self.thresholds.write());
    }

    fn runtime(&self, device: &Device) -> Arc<Mutex<DeviceRuntime>> {
        self.runtimes
            .entry(device.id)
            .or_insert_with(|| Arc::new(Mutex::new(DeviceRuntime::from_device(device))))
            .clone()
    }

    /// Record a successful sample: any state transitions to online.
    pub async fn record_success(
        &self,
        device: &Device,
        sample: &ProbeSample,
    ) -> RepositoryResult<Option<StatusChange>> {
        let runtime = self.runtime(device);
        let mut state = runtime.lock().await;
        let now = sample.collected_at;

        state.consecutive_failures = 0;
        state.consecutive_successes += 1;
        state.last_sample_at = Some(now);
        state.last_good_sample_at = Some(now);

        let previous = state.status;
        state.status = DeviceStatus::Online;

        let mut updated = device.clone();
        updated.status = DeviceStatus::Online;
        updated.consecutive_failures = 0;
        updated.last_probed_at = state.last_sample_at;
        if let Some(data) = &sample.device_data {
            updated.device_data = Some(data.clone());
        }
        self.repo.upsert_device(updated.clone()).await?;

        self.append_metrics(device.id, sample).await?;

        if previous != DeviceStatus::Online {
            let change = self
                .transition(&updated, previous, DeviceStatus::Online, now, None)
                .await?;
            return Ok(Some(change));
        }
        Ok(None)
    }

    /// Record a failed sample; debounced per the thresholds.
    pub async fn record_failure(
        &self,
        device: &Device,
        error: &ProbeError,
    ) -> RepositoryResult<Option<StatusChange>> {
        let runtime = self.runtime(device);
        let mut state = runtime.lock().await;
        let now = Utc::now();

        state.consecutive_failures += 1;
        state.consecutive_successes = 0;
        state.last_sample_at = Some(now);

        self.log_failure(device, error, &mut state, now);

        let thresholds = self.thresholds();
        let previous = state.status;
        let next = if state.consecutive_failures >= thresholds.offline {
            DeviceStatus::Offline
        } else if state.consecutive_failures >= thresholds.warning
            && previous != DeviceStatus::Offline
        {
            DeviceStatus::Warning
        } else {
            previous
        };
        state.status = next;

        let mut updated = device.clone();
        updated.status = next;
        updated.consecutive_failures = state.consecutive_failures;
        updated.last_probed_at = state.last_sample_at;
        self.repo.upsert_device(updated.clone()).await?;

        if next != previous {
            let change = self
                .transition(&updated, previous, next, now, Some(error.tag().to_string()))
                .await?;
            return Ok(Some(change));
        }
        Ok(None)
    }

    /// Sweep: devices whose newest *successful* sample is older than the
    /// stale threshold become stale. Failed probes refresh
    /// `last_sample_at` but not `last_good_sample_at`, so a device that
    /// keeps answering probes with errors still ages into stale.
    pub async fn mark_stale(&self, now: DateTime<Utc>) -> RepositoryResult<Vec<StatusChange>> {
        let mut changes = Vec::new();
        let devices = self.repo.list_devices().await?;
        for device in devices {
            if device.kind.is_placeholder() {
                continue;
            }
            let runtime = self.runtime(&device);
            let mut state = runtime.lock().await;
            if state.status == DeviceStatus::Stale || state.status == DeviceStatus::Unknown {
                continue;
            }
            let Some(last_good) = state.last_good_sample_at else { continue };
            let age = (now - last_good).to_std().unwrap_or_default();
            if age <= self.thresholds().stale_age {
                continue;
            }

            let previous = state.status;
            state.status = DeviceStatus::Stale;
            let mut updated = device.clone();
            updated.status = DeviceStatus::Stale;
            self.repo.upsert_device(updated.clone()).await?;
            changes.push(
                self.transition(&updated, previous, DeviceStatus::Stale, now, None)
                    .await?,
            );
        }
        Ok(changes)
    }

    async fn transition(
        &self,
        device: &Device,
        previous: DeviceStatus,
        next: DeviceStatus,
        at: DateTime<Utc>,
        message: Option<String>,
    ) -> RepositoryResult<StatusChange> {
        let event = DeviceStatusEvent {
            id: Uuid::new_v4(),
            device_id: device.id,
            previous_status: previous,
            new_status: next,
            created_at: at,
            message,
        };
        self.repo.record_status_event(event.clone()).await?;
        info!(
            device = %device.name,
            from = previous.as_str(),
            to = next.as_str(),
            "status transition"
        );

        let change = StatusChange {
            device: device.clone(),
            event,
        };
        let _ = self.changes_tx.send(change.clone());
        Ok(change)
    }

    async fn append_metrics(&self, device_id: Uuid, sample: &ProbeSample) -> RepositoryResult<()> {
        let data = sample.device_data.as_ref();
        let has_resources = data.map_or(false, |d| {
            d.cpu_percent.is_some()
                || d.memory_percent.is_some()
                || d.disk_percent.is_some()
                || d.uptime_seconds.is_some()
        });
        if has_resources || sample.rtt_ms.is_some() {
            self.repo
                .append_metrics_sample(DeviceMetricsSample {
                    device_id,
                    cpu_percent: data.and_then(|d| d.cpu_percent),
                    memory_percent: data.and_then(|d| d.memory_percent),
                    disk_percent: data.and_then(|d| d.disk_percent),
                    ping_rtt_ms: sample.rtt_ms,
                    uptime_seconds: data.and_then(|d| d.uptime_seconds),
                    timestamp: sample.collected_at,
                })
                .await?;
        }
        for reading in &sample.custom_metrics {
            self.repo
                .append_prometheus_sample(PrometheusMetricSample {
                    device_id,
                    metric_id: reading.metric_id.clone(),
                    value: reading.value,
                    raw_value: reading.raw_value,
                    timestamp: sample.collected_at,
                })
                .await?;
        }
        Ok(())
    }

    /// Transient failures are silent; auth failures log once per hour;
    /// the rest log at debug.
    fn log_failure(
        &self,
        device: &Device,
        error: &ProbeError,
        state: &mut DeviceRuntime,
        now: DateTime<Utc>,
    ) {
        if error.is_transient() {
            return;
        }
        if error.is_auth() {
            let due = state
                .last_auth_log_at
                .map_or(true, |last| (now - last).to_std().unwrap_or_default() > AUTH_LOG_WINDOW);
            if due {
                warn!(device = %device.name, error = %error, "authentication failing");
                state.last_auth_log_at = Some(now);
            }
            return;
        }
        debug!(device = %device.name, error = %error, "probe failed");
    }

    /// Forget runtime state for a removed device.
    pub fn forget(&self, device_id: Uuid) {
        self.runtimes.remove(&device_id);
    }
}
