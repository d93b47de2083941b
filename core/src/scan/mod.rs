// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Network scanner.
//!
//! Two-phase streaming discovery: a concurrent ping sweep over the
//! expanded range, then fingerprinting of every responder. Events stream
//! through an `mpsc` channel that the API layer renders as SSE; dropping
//! the receiver cancels the scan.

pub mod events;
pub mod fingerprint;
pub mod range;

pub use events::{Confidence, Fingerprint, ScanEvent};
pub use range::expand_range;

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info};
use uuid::Uuid;

use crate::probers::ProberFactory;
use crate::repository::models::{CredentialProfile, ScanProbeType};
use crate::repository::{Repository, RepositoryError};

/// Ping sweep concurrency
const SWEEP_CONCURRENCY: usize = 100;

/// Fingerprint phase concurrency
const FINGERPRINT_CONCURRENCY: usize = 16;

/// Per-host ping timeout during the sweep
const SWEEP_PING_TIMEOUT: Duration = Duration::from_secs(1);

/// A progress event is emitted every this many completions
const PROGRESS_EVERY: usize = 25;

/// Event channel depth
const CHANNEL_CAPACITY: usize = 256;

/// Scanner errors
#[derive(Debug, Error)]
pub enum ScanError {
    /// The range string could not be parsed
    #[error("Invalid IP range: {0}")]
    InvalidRange(String),

    /// The range expands beyond the host limit
    #[error("Range too large: {hosts} hosts (limit {})", range::MAX_HOSTS)]
    TooLarge { hosts: u64 },

    /// Persistence failure while preparing the scan
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// Scan parameters
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub ip_range: String,
    pub credential_profile_ids: Vec<Uuid>,
    pub probe_types: Vec<ScanProbeType>,
}

/// Two-phase network scanner
pub struct NetworkScanner {
    repo: Arc<dyn Repository>,
    factory: Arc<ProberFactory>,
    http: reqwest::Client,
}

impl NetworkScanner {
    pub fn new(repo: Arc<dyn Repository>, factory: Arc<ProberFactory>) -> Self {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap_or_default();
        Self { repo, factory, http }
    }

    /// Validate the request and launch the scan; events arrive on the
    /// returned channel.
    pub async fn start(&self, request: ScanRequest) -> Result<mpsc::Receiver<ScanEvent>, ScanError> {
        let ips = range::expand_range(&request.ip_range)?;
        let profiles = self.load_profiles(&request.credential_profile_ids).await?;
        let known_ips: HashSet<Ipv4Addr> = self
            .repo
            .list_devices()
            .await?
            .into_iter()
            .filter_map(|d| d.ip)
            .collect();

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let factory = self.factory.clone();
        let http = self.http.clone();
        let probe_types = if request.probe_types.is_empty() {
            vec![ScanProbeType::FindAll]
        } else {
            request.probe_types
        };
        tokio::spawn(async move {
            run_scan(ips, known_ips, profiles, probe_types, factory, http, tx).await;
        });
        Ok(rx)
    }

    /// Non-streaming variant: run to completion and return every event.
    pub async fn run_collected(&self, request: ScanRequest) -> Result<Vec<ScanEvent>, ScanError> {
        let mut rx = self.start(request).await?;
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        Ok(events)
    }

    async fn load_profiles(
        &self,
        ids: &[Uuid],
    ) -> Result<Vec<CredentialProfile>, ScanError> {
        let mut profiles = Vec::new();
        for id in ids {
            match self.repo.get_credential_profile(*id).await {
                Ok(profile) => profiles.push(profile),
                Err(e) if e.is_not_found() => {
                    debug!(%id, "scan requested with unknown credential profile");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(profiles)
    }
}

/// Send helper: a dropped receiver cancels the scan.
macro_rules! emit {
    ($tx:expr, $event:expr) => {
        if $tx.send($event).await.is_err() {
            debug!("scan receiver dropped, aborting");
            return;
        }
    };
}

#[allow(clippy::too_many_arguments)]
async fn run_scan(
    ips: Vec<Ipv4Addr>,
    known_ips: HashSet<Ipv4Addr>,
    profiles: Vec<CredentialProfile>,
    probe_types: Vec<ScanProbeType>,
    factory: Arc<ProberFactory>,
    http: reqwest::Client,
    tx: mpsc::Sender<ScanEvent>,
) {
    let total = ips.len();
    info!(total, "network scan starting");
    emit!(tx, ScanEvent::Start { total_ips: total });

    // Phase 1: ping sweep.
    let permits = Arc::new(Semaphore::new(SWEEP_CONCURRENCY));
    let mut sweep: JoinSet<(Ipv4Addr, Option<f64>)> = JoinSet::new();
    for ip in ips {
        let permits = permits.clone();
        let factory = factory.clone();
        sweep.spawn(async move {
            let _permit = permits.acquire_owned().await;
            let rtt = factory.ping().ping(ip, SWEEP_PING_TIMEOUT).await.ok();
            (ip, rtt)
        });
    }

    let mut responders = Vec::new();
    let mut completed = 0;
    while let Some(result) = sweep.join_next().await {
        completed += 1;
        if let Ok((ip, Some(rtt))) = result {
            emit!(
                tx,
                ScanEvent::PingFound {
                    ip: ip.to_string(),
                    rtt,
                    already_exists: known_ips.contains(&ip),
                }
            );
            responders.push(ip);
        }
        if completed % PROGRESS_EVERY == 0 || completed == total {
            emit!(
                tx,
                ScanEvent::Progress {
                    phase: "ping_sweep".to_string(),
                    completed,
                    total,
                    found: responders.len(),
                }
            );
        }
    }
    emit!(
        tx,
        ScanEvent::PhaseComplete {
            phase: "ping_sweep".to_string(),
            found: responders.len(),
        }
    );

    // Phase 2: fingerprint the responders.
    let discovered = responders.len();
    let found_total = responders.len();
    let permits = Arc::new(Semaphore::new(FINGERPRINT_CONCURRENCY));
    let profiles = Arc::new(profiles);
    let probe_types = Arc::new(probe_types);
    let mut prints: JoinSet<ScanEvent> = JoinSet::new();
    for ip in responders {
        let permits = permits.clone();
        let factory = factory.clone();
        let http = http.clone();
        let profiles = profiles.clone();
        let probe_types = probe_types.clone();
        prints.spawn(async move {
            let _permit = permits.acquire_owned().await;
            fingerprint::fingerprint_host(ip, &profiles, &probe_types, &factory, &http).await
        });
    }

    let mut completed = 0;
    while let Some(result) = prints.join_next().await {
        completed += 1;
        if let Ok(event) = result {
            emit!(tx, event);
        }
        if completed % PROGRESS_EVERY == 0 || completed == found_total {
            emit!(
                tx,
                ScanEvent::Progress {
                    phase: "fingerprint".to_string(),
                    completed,
                    total: found_total,
                    found: found_total,
                }
            );
        }
    }
    emit!(
        tx,
        ScanEvent::PhaseComplete {
            phase: "fingerprint".to_string(),
            found: found_total,
        }
    );

    info!(discovered, "network scan complete");
    emit!(tx, ScanEvent::Complete { discovered });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryRepository;

    fn scanner() -> NetworkScanner {
        NetworkScanner::new(
            Arc::new(MemoryRepository::new()),
            Arc::new(ProberFactory::default()),
        )
    }

    #[tokio::test]
    async fn test_invalid_range_fails_before_streaming() {
        let err = scanner()
            .start(ScanRequest {
                ip_range: "not-an-ip-range".to_string(),
                credential_profile_ids: Vec::new(),
                probe_types: vec![ScanProbeType::FindAll],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::InvalidRange(_)));
    }

    #[tokio::test]
    async fn test_localhost_scan_event_sequence() {
        let events = scanner()
            .run_collected(ScanRequest {
                ip_range: "127.0.0.1/32".to_string(),
                credential_profile_ids: Vec::new(),
                probe_types: vec![ScanProbeType::FindAll],
            })
            .await
            .unwrap();

        let names: Vec<&str> = events.iter().map(ScanEvent::name).collect();
        assert_eq!(names.first(), Some(&"start"));
        assert_eq!(names.last(), Some(&"complete"));
        assert!(names.contains(&"ping_found"), "sequence was {names:?}");
        assert!(names.contains(&"phase_complete"));
        assert!(names.contains(&"fingerprint_result"));

        // Ordering: every ping_found precedes phase_complete(ping_sweep),
        // every fingerprint_result follows it.
        let sweep_done = names.iter().position(|n| *n == "phase_complete").unwrap();
        let ping_found = names.iter().position(|n| *n == "ping_found").unwrap();
        let fingerprint = names
            .iter()
            .position(|n| *n == "fingerprint_result")
            .unwrap();
        assert!(ping_found < sweep_done);
        assert!(fingerprint > sweep_done);

        match events.last().unwrap() {
            ScanEvent::Complete { discovered } => assert_eq!(*discovered, 1),
            other => panic!("expected complete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unresponsive_range_completes_with_zero() {
        // TEST-NET-1: no responders expected.
        let events = scanner()
            .run_collected(ScanRequest {
                ip_range: "192.0.2.1-192.0.2.2".to_string(),
                credential_profile_ids: Vec::new(),
                probe_types: vec![ScanProbeType::FindAll],
            })
            .await
            .unwrap();

        match events.last().unwrap() {
            ScanEvent::Complete { discovered } => assert_eq!(*discovered, 0),
            other => panic!("expected complete, got {other:?}"),
        }
        assert!(!events.iter().any(|e| e.name() == "ping_found"));
    }
}
