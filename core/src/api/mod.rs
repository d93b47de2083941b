// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # HTTP API layer
//!
//! Assembles the monitoring engine behind an axum router: REST endpoints
//! under `/api`, the scanner's SSE stream, and the realtime WebSocket at
//! `/ws`. [`AppState`] owns every component and wires their lifecycles:
//!
//! ```text
//! Scheduler ──▶ Probers ──▶ Status Engine ──▶ Dispatcher ──▶ webhooks
//!     │              │            │
//!     │              └─▶ Differencer          Realtime Hub ──▶ /ws
//!     └─▶ Resolver                │
//!                             Repository ◀── REST handlers
//! ```

pub mod error;
pub mod models;
pub mod rest;
pub mod websocket;

pub use error::{ApiError, ApiResult};
pub use rest::build_router;

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::license::{LicenseError, LicenseGate};
use crate::notify::NotificationDispatcher;
use crate::probers::ProberFactory;
use crate::realtime::RealtimeHub;
use crate::repository::Repository;
use crate::resolver::ConnectionResolver;
use crate::scan::NetworkScanner;
use crate::scheduler::ProbeScheduler;
use crate::status::{StatusEngine, StatusThresholds};
use crate::tasks;
use crate::traffic::Differencer;

/// Shared server state: every component, fully wired.
pub struct AppState {
    pub config: Config,
    pub repo: Arc<dyn Repository>,
    pub engine: Arc<StatusEngine>,
    pub scheduler: Arc<ProbeScheduler>,
    pub scanner: Arc<NetworkScanner>,
    pub hub: Arc<RealtimeHub>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub license: Arc<LicenseGate>,
    background: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl AppState {
    /// Build and wire all components against the given repository.
    ///
    /// Persisted runtime settings (polling interval, offline threshold)
    /// override the configured baseline.
    pub async fn new(
        config: Config,
        repo: Arc<dyn Repository>,
    ) -> Result<Arc<Self>, LicenseError> {
        let license = Arc::new(LicenseGate::load(&config.license.file_path)?);
        info!(fingerprint = %license.fingerprint(), "license gate ready");

        let factory = Arc::new(ProberFactory::new(config.monitoring.detailed_probe_every));
        let engine = Arc::new(StatusEngine::new(
            repo.clone(),
            StatusThresholds {
                offline: config.monitoring.offline_threshold,
                warning: config.monitoring.warning_threshold,
                stale_age: config.monitoring.stale_age(),
            },
        ));
        let differencer = Arc::new(Differencer::new(repo.clone(), config.monitoring.stale_age()));
        let resolver = Arc::new(ConnectionResolver::new(repo.clone()));
        let scheduler = ProbeScheduler::new(
            repo.clone(),
            factory.clone(),
            engine.clone(),
            differencer,
            resolver,
            config.monitoring.clone(),
        );
        let scanner = Arc::new(NetworkScanner::new(repo.clone(), factory));
        let hub = Arc::new(RealtimeHub::new());
        let dispatcher = NotificationDispatcher::new(repo.clone());

        let state = Arc::new(Self {
            config,
            repo,
            engine,
            scheduler,
            scanner,
            hub,
            dispatcher,
            license,
            background: parking_lot::Mutex::new(Vec::new()),
        });
        state.hydrate_settings().await;
        Ok(state)
    }

    /// Apply persisted settings over the configured defaults.
    async fn hydrate_settings(&self) {
        if let Ok(Some(raw)) = self.repo.get_setting("polling_interval").await {
            match raw.parse::<u64>() {
                Ok(seconds)
                    if (crate::config::MIN_POLLING_INTERVAL
                        ..=crate::config::MAX_POLLING_INTERVAL)
                        .contains(&seconds) =>
                {
                    self.scheduler.set_polling_interval(seconds);
                }
                _ => warn!(value = %raw, "ignoring invalid persisted polling_interval"),
            }
        }
        if let Ok(Some(raw)) = self.repo.get_setting("offline_threshold").await {
            match raw.parse::<u32>() {
                Ok(threshold) if threshold >= 1 => {
                    self.engine.update_thresholds(|t| t.offline = threshold);
                }
                _ => warn!(value = %raw, "ignoring invalid persisted offline_threshold"),
            }
        }
    }

    /// Start the scheduler, notification intake, and retention sweep.
    pub fn start_background(self: &Arc<Self>) {
        self.scheduler.start();
        let mut background = self.background.lock();
        background.push(self.dispatcher.start(self.engine.subscribe()));
        background.push(tasks::spawn_retention_task(
            self.repo.clone(),
            self.config.retention.metrics_retention_hours,
        ));
    }

    /// Graceful shutdown: stop ticking, drain probes, drop tasks.
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
        info!("server state shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryRepository;

    async fn test_state() -> Arc<AppState> {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.license.file_path = dir.path().join("license.json");
        AppState::new(config, Arc::new(MemoryRepository::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_state_builds_and_shuts_down() {
        let state = test_state().await;
        state.start_background();
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_persisted_settings_hydrate() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.license.file_path = dir.path().join("license.json");

        let repo = Arc::new(MemoryRepository::new());
        use crate::repository::Repository as _;
        repo.set_setting("polling_interval", "60").await.unwrap();
        repo.set_setting("offline_threshold", "5").await.unwrap();

        let state = AppState::new(config, repo).await.unwrap();
        assert_eq!(
            state.scheduler.polling_interval(),
            std::time::Duration::from_secs(60)
        );
        assert_eq!(state.engine.thresholds().offline, 5);
    }
}
