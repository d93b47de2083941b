// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Probe scheduler.
//!
//! Fixed-schedule dispatch: tick `k` fires at `start + k * interval`
//! regardless of how long earlier ticks took, so slow cycles never push
//! the schedule. Overlapping dispatch is allowed; a per-device in-flight
//! set guarantees at most one concurrent probe per device, and a
//! semaphore caps total concurrency. Every probe runs under its own
//! deadline, so one slow device cannot starve the pool.
//!
//! Each tick also sweeps for stale devices (no successful sample within
//! the stale threshold).

use dashmap::DashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::MonitoringConfig;
use crate::probers::{Credentials, ProbeError, ProberFactory};
use crate::repository::models::Device;
use crate::repository::Repository;
use crate::resolver::ConnectionResolver;
use crate::status::StatusEngine;
use crate::traffic::Differencer;

/// Probe scheduler
pub struct ProbeScheduler {
    repo: Arc<dyn Repository>,
    factory: Arc<ProberFactory>,
    engine: Arc<StatusEngine>,
    differencer: Arc<Differencer>,
    resolver: Arc<ConnectionResolver>,
    config: MonitoringConfig,
    /// Live polling interval; `PUT /api/settings/polling_interval` updates
    /// it without a restart.
    interval_secs: AtomicU64,
    in_flight: Arc<DashSet<Uuid>>,
    permits: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    ticker: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ProbeScheduler {
    pub fn new(
        repo: Arc<dyn Repository>,
        factory: Arc<ProberFactory>,
        engine: Arc<StatusEngine>,
        differencer: Arc<Differencer>,
        resolver: Arc<ConnectionResolver>,
        config: MonitoringConfig,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            repo,
            factory,
            engine,
            differencer,
            resolver,
            interval_secs: AtomicU64::new(config.polling_interval_seconds),
            in_flight: Arc::new(DashSet::new()),
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            shutdown_tx,
            ticker: parking_lot::Mutex::new(None),
        })
    }

    /// Current polling interval.
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.load(Ordering::Relaxed))
    }

    /// Change the polling interval; takes effect from the next tick.
    pub fn set_polling_interval(&self, seconds: u64) {
        self.interval_secs.store(seconds, Ordering::Relaxed);
    }

    /// Launch the ticker. Idempotent: a running ticker is kept.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.ticker.lock();
        if guard.as_ref().map_or(false, |h| !h.is_finished()) {
            return;
        }
        let _ = self.shutdown_tx.send(false);

        let scheduler = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!(
            interval_secs = self.polling_interval().as_secs(),
            max_concurrency = self.config.max_concurrency,
            "probe scheduler starting"
        );

        *guard = Some(tokio::spawn(async move {
            // Schedule-based ticking: the next deadline advances by the
            // interval from the previous deadline, never from completion
            // time, so long ticks don't push the schedule.
            let mut next = Instant::now() + scheduler.polling_interval();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(next) => {
                        next += scheduler.polling_interval();
                        scheduler.run_tick().await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("scheduler ticker stopping");
                            return;
                        }
                    }
                }
            }
        }));
    }

    /// Stop ticking and drain in-flight probes up to the shutdown grace.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
        }

        let grace = self.config.shutdown_grace();
        let drained = tokio::time::timeout(grace, async {
            while !self.in_flight.is_empty() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        match drained {
            Ok(()) => info!("scheduler stopped, all probes drained"),
            Err(_) => warn!(
                remaining = self.in_flight.len(),
                "shutdown grace elapsed with probes still in flight"
            ),
        }
    }

    /// Probe one device immediately, outside the schedule.
    pub async fn trigger_once(&self, device_id: Uuid) -> Result<(), ProbeError> {
        let device = self
            .repo
            .get_device(device_id)
            .await
            .map_err(|e| ProbeError::Unsupported(e.to_string()))?;
        if device.kind.is_placeholder() {
            return Err(ProbeError::Unsupported(
                "placeholders are not probed".to_string(),
            ));
        }
        if !self.in_flight.insert(device_id) {
            return Err(ProbeError::Unsupported(
                "a probe for this device is already running".to_string(),
            ));
        }
        let result = self.probe_device(device).await;
        self.in_flight.remove(&device_id);
        result
    }

    /// One scheduler cycle: dispatch every pollable device, then sweep
    /// for staleness.
    async fn run_tick(self: &Arc<Self>) {
        if *self.shutdown_tx.subscribe().borrow() {
            return;
        }
        let devices = match self.repo.list_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                // Repository hiccups skip the cycle; the next tick retries.
                error!(error = %e, "failed to load devices for tick");
                return;
            }
        };

        let mut handles = Vec::new();
        for device in devices {
            if device.kind.is_placeholder() {
                continue;
            }
            // At most one concurrent probe per device.
            if !self.in_flight.insert(device.id) {
                debug!(device = %device.name, "probe still running, skipping");
                continue;
            }

            let scheduler = self.clone();
            let device_id = device.id;
            let handle = tokio::spawn(async move {
                let permit = scheduler.permits.clone().acquire_owned().await;
                if permit.is_ok() {
                    if let Err(e) = scheduler.probe_device(device).await {
                        debug!(error = %e, "probe pipeline error");
                    }
                }
                scheduler.in_flight.remove(&device_id);
            });
            handles.push((device_id, handle));
        }

        // Panics are isolated to their worker; the watcher just records
        // them and clears the in-flight slot.
        let scheduler = self.clone();
        tokio::spawn(async move {
            for (device_id, handle) in handles {
                if let Err(join_err) = handle.await {
                    if join_err.is_panic() {
                        error!(%device_id, "probe worker panicked");
                    }
                    scheduler.in_flight.remove(&device_id);
                }
            }
        });

        if let Ok(changes) = self.engine.mark_stale(chrono::Utc::now()).await {
            if !changes.is_empty() {
                debug!(count = changes.len(), "devices went stale");
            }
        }
    }

    /// Full pipeline for one device: resolve credentials, probe with a
    /// deadline, feed the status engine and differencer, run Proxmox
    /// side effects.
    async fn probe_device(&self, device: Device) -> Result<(), ProbeError> {
        let Some(prober) = self.factory.prober_for(device.kind) else {
            return Ok(());
        };
        let creds = self.effective_credentials(&device).await;
        let deadline = Instant::now() + self.config.probe_timeout();

        let outcome = tokio::time::timeout(
            self.config.probe_timeout(),
            prober.probe(&device, &creds, deadline),
        )
        .await
        .unwrap_or(Err(ProbeError::Timeout(self.config.probe_timeout())));

        match outcome {
            Ok(sample) => {
                if let Err(e) = self.engine.record_success(&device, &sample).await {
                    error!(device = %device.name, error = %e, "failed to record sample");
                }
                if let Err(e) = self.differencer.ingest_sample(device.id, &sample).await {
                    error!(device = %device.name, error = %e, "failed to difference counters");
                }
                if let Some(observation) = &sample.proxmox {
                    self.apply_proxmox(&device, observation).await;
                }
                Ok(())
            }
            Err(e) => {
                if let Err(repo_err) = self.engine.record_failure(&device, &e).await {
                    error!(device = %device.name, error = %repo_err, "failed to record failure");
                }
                Ok(())
            }
        }
    }

    /// Profile bag overlaid with the device's inline credentials.
    async fn effective_credentials(&self, device: &Device) -> Credentials {
        let profile = match device.credential_profile_id {
            Some(id) => self
                .repo
                .get_credential_profile(id)
                .await
                .ok()
                .map(|p| p.credentials),
            None => None,
        };
        Credentials::merged(profile.as_ref(), device.custom_credentials.as_ref())
    }

    /// Store the Proxmox observation and re-resolve dynamic connections.
    async fn apply_proxmox(
        &self,
        device: &Device,
        observation: &crate::probers::ProxmoxObservation,
    ) {
        let node = crate::repository::models::ProxmoxNode {
            id: Uuid::new_v4(),
            cluster_name: observation.cluster_name.clone(),
            node_name: observation.node_name.clone(),
            host_device_id: device.id,
            updated_at: chrono::Utc::now(),
        };
        if let Err(e) = self.repo.upsert_proxmox_node(node).await {
            error!(device = %device.name, error = %e, "failed to store Proxmox node");
        }
        if let Err(e) = self
            .repo
            .replace_proxmox_vms(device.id, observation.vms.clone())
            .await
        {
            error!(device = %device.name, error = %e, "failed to store Proxmox VMs");
        }
        if let Err(e) = self.resolver.resolve_all().await {
            error!(device = %device.name, error = %e, "dynamic connection resolution failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::models::{DeviceKind, DeviceStatus};
    use crate::repository::MemoryRepository;
    use crate::status::StatusThresholds;

    fn build(repo: Arc<MemoryRepository>, config: MonitoringConfig) -> Arc<ProbeScheduler> {
        let repo: Arc<dyn Repository> = repo;
        let engine = Arc::new(StatusEngine::new(
            repo.clone(),
            StatusThresholds {
                offline: config.offline_threshold,
                warning: config.warning_threshold,
                stale_age: config.stale_age(),
            },
        ));
        let differencer = Arc::new(Differencer::new(repo.clone(), config.stale_age()));
        let resolver = Arc::new(ConnectionResolver::new(repo.clone()));
        ProbeScheduler::new(
            repo,
            Arc::new(ProberFactory::default()),
            engine,
            differencer,
            resolver,
            config,
        )
    }

    #[tokio::test]
    async fn test_trigger_once_unreachable_device_records_failure() {
        let repo = Arc::new(MemoryRepository::new());
        // TEST-NET-1 address: never reachable, fails fast or times out.
        let device = repo
            .upsert_device(Device::new(
                "ghost",
                DeviceKind::GenericPing,
                Some("192.0.2.1".parse().unwrap()),
            ))
            .await
            .unwrap();

        let config = MonitoringConfig {
            probe_timeout_seconds: 2,
            ..MonitoringConfig::default()
        };
        let scheduler = build(repo.clone(), config);
        scheduler.trigger_once(device.id).await.unwrap();

        let stored = repo.get_device(device.id).await.unwrap();
        assert_eq!(stored.consecutive_failures, 1);
        assert_eq!(stored.status, DeviceStatus::Warning);
    }

    #[tokio::test]
    async fn test_trigger_once_rejects_placeholder_and_unknown() {
        let repo = Arc::new(MemoryRepository::new());
        let placeholder = repo
            .upsert_device(Device::new("note", DeviceKind::Placeholder, None))
            .await
            .unwrap();
        let scheduler = build(repo, MonitoringConfig::default());

        assert!(scheduler.trigger_once(placeholder.id).await.is_err());
        assert!(scheduler.trigger_once(Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn test_in_flight_guard_blocks_second_probe() {
        let repo = Arc::new(MemoryRepository::new());
        let device = repo
            .upsert_device(Device::new(
                "ghost",
                DeviceKind::GenericPing,
                Some("192.0.2.1".parse().unwrap()),
            ))
            .await
            .unwrap();
        let scheduler = build(repo, MonitoringConfig::default());

        scheduler.in_flight.insert(device.id);
        let err = scheduler.trigger_once(device.id).await.unwrap_err();
        assert!(matches!(err, ProbeError::Unsupported(_)));
        scheduler.in_flight.remove(&device.id);
    }

    #[tokio::test]
    async fn test_start_stop() {
        let repo = Arc::new(MemoryRepository::new());
        let scheduler = build(repo, MonitoringConfig::default());
        scheduler.start();
        // Starting twice is harmless.
        scheduler.start();
        scheduler.stop().await;
        assert!(scheduler.in_flight.is_empty());
    }
}
