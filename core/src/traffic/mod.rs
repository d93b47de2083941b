// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Link-counter differencer.
//!
//! Turns monotonically increasing interface octet counters into bits/sec
//! and utilisation for monitored connections. Counter state is persisted
//! with the connection row so rates survive restarts.
//!
//! A counter running backwards is a wrap only when the wrapped delta is
//! plausible for the link (less than ten intervals at line rate);
//! otherwise the device rebooted and the state is replaced without
//! emitting a sample.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::probers::types::{CounterBits, InterfaceCounters, ProbeSample};
use crate::repository::models::{
    BandwidthSample, Connection, CounterState, LinkStats, LogEntry, LogLevel, MonitoredEnd,
};
use crate::repository::{Repository, RepositoryResult};

/// Wrapped deltas above this many intervals at line rate are reboots.
const WRAP_PLAUSIBILITY_INTERVALS: f64 = 10.0;

/// Outcome of differencing one counter reading against stored state
#[derive(Debug, Clone, PartialEq)]
pub enum DiffOutcome {
    /// No previous state: stored, nothing emitted.
    First,
    /// The gap since the previous sample exceeded the stale threshold:
    /// state replaced, flagged stale, nothing emitted.
    Stale,
    /// A usable rate.
    Rate(LinkRate),
    /// Counters ran backwards implausibly (reboot): state replaced.
    Reset,
}

/// Computed link rate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkRate {
    pub in_bits_per_sec: f64,
    pub out_bits_per_sec: f64,
    /// Clamped to [0, 100].
    pub utilisation_percent: f64,
    /// True when the raw utilisation exceeded 100 and was clipped.
    pub clipped: bool,
}

/// Difference one reading against the previous state.
pub fn diff_counters(
    previous: &CounterState,
    in_octets: u64,
    out_octets: u64,
    bits: CounterBits,
    sampled_at: DateTime<Utc>,
    stale_gap: Duration,
    link_speed_bps: f64,
) -> DiffOutcome {
    let elapsed = (sampled_at - previous.sampled_at).num_milliseconds() as f64 / 1000.0;
    if elapsed <= 0.0 {
        return DiffOutcome::Reset;
    }
    if elapsed > stale_gap.as_secs_f64() {
        return DiffOutcome::Stale;
    }

    let delta_in = counter_delta(previous.in_octets, in_octets, bits, elapsed, link_speed_bps);
    let delta_out = counter_delta(previous.out_octets, out_octets, bits, elapsed, link_speed_bps);
    let (Some(delta_in), Some(delta_out)) = (delta_in, delta_out) else {
        return DiffOutcome::Reset;
    };

    let in_bps = delta_in as f64 * 8.0 / elapsed;
    let out_bps = delta_out as f64 * 8.0 / elapsed;
    let raw_utilisation = if link_speed_bps > 0.0 {
        100.0 * in_bps.max(out_bps) / link_speed_bps
    } else {
        0.0
    };

    DiffOutcome::Rate(LinkRate {
        in_bits_per_sec: in_bps,
        out_bits_per_sec: out_bps,
        utilisation_percent: raw_utilisation.clamp(0.0, 100.0),
        clipped: raw_utilisation > 100.0,
    })
}

/// Delta handling wrap-around; `None` means implausible (reboot).
fn counter_delta(
    previous: u64,
    current: u64,
    bits: CounterBits,
    elapsed_secs: f64,
    link_speed_bps: f64,
) -> Option<u64> {
    if current >= previous {
        return Some(current - previous);
    }
    let wrapped = (bits.modulus() - u128::from(previous) + u128::from(current)) as u64;
    let plausible_octets = WRAP_PLAUSIBILITY_INTERVALS * link_speed_bps * elapsed_secs / 8.0;
    if (wrapped as f64) < plausible_octets {
        Some(wrapped)
    } else {
        None
    }
}

/// Differencer service: applies [`diff_counters`] to monitored connections
/// and persists snapshots plus bandwidth history.
pub struct Differencer {
    repo: Arc<dyn Repository>,
    stale_gap: Duration,
}

impl Differencer {
    pub fn new(repo: Arc<dyn Repository>, stale_gap: Duration) -> Self {
        Self { repo, stale_gap }
    }

    /// Feed one probe sample to every connection monitoring `device_id`.
    pub async fn ingest_sample(
        &self,
        device_id: uuid::Uuid,
        sample: &ProbeSample,
    ) -> RepositoryResult<()> {
        if sample.interfaces.is_empty() {
            return Ok(());
        }
        let connections = self.repo.list_connections_monitoring(device_id).await?;
        for connection in connections {
            if let Some(counters) = monitored_counters(&connection, sample) {
                self.ingest(connection, counters, sample.collected_at).await?;
            }
        }
        Ok(())
    }

    /// Apply one counter reading to one connection.
    pub async fn ingest(
        &self,
        mut connection: Connection,
        counters: &InterfaceCounters,
        sampled_at: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        let new_state = CounterState {
            in_octets: counters.in_octets,
            out_octets: counters.out_octets,
            sampled_at,
        };

        let Some(previous) = connection.counter_state else {
            connection.counter_state = Some(new_state);
            self.repo.update_connection(connection).await?;
            return Ok(());
        };

        let outcome = diff_counters(
            &previous,
            counters.in_octets,
            counters.out_octets,
            counters.bits,
            sampled_at,
            self.stale_gap,
            connection.link_speed.bits_per_sec(),
        );
        connection.counter_state = Some(new_state);

        match outcome {
            DiffOutcome::First => unreachable!("previous state was present"),
            DiffOutcome::Stale => {
                debug!(connection_id = %connection.id, "sample gap exceeded stale threshold");
                self.repo.update_connection(connection).await?;
            }
            DiffOutcome::Reset => {
                debug!(connection_id = %connection.id, "counters reset, replacing state");
                self.repo.update_connection(connection).await?;
            }
            DiffOutcome::Rate(rate) => {
                if rate.clipped {
                    warn!(
                        connection_id = %connection.id,
                        in_bps = rate.in_bits_per_sec,
                        out_bps = rate.out_bits_per_sec,
                        "utilisation exceeded 100%, clipping"
                    );
                    self.repo
                        .append_log(LogEntry::new(
                            "traffic",
                            LogLevel::Warning,
                            format!(
                                "connection {} utilisation clipped to 100%",
                                connection.id
                            ),
                        ))
                        .await?;
                }
                let connection_id = connection.id;
                connection.link_stats = Some(LinkStats {
                    in_bits_per_sec: rate.in_bits_per_sec,
                    out_bits_per_sec: rate.out_bits_per_sec,
                    utilisation_percent: rate.utilisation_percent,
                    sampled_at,
                });
                self.repo.update_connection(connection).await?;
                self.repo
                    .append_bandwidth_sample(BandwidthSample {
                        connection_id,
                        in_bits_per_sec: rate.in_bits_per_sec,
                        out_bits_per_sec: rate.out_bits_per_sec,
                        utilisation_percent: rate.utilisation_percent,
                        timestamp: sampled_at,
                    })
                    .await?;
            }
        }
        Ok(())
    }
}

/// Pick the counter reading the connection monitors: SNMP index first,
/// then the monitored end's port name (Prometheus interfaces).
fn monitored_counters<'a>(
    connection: &Connection,
    sample: &'a ProbeSample,
) -> Option<&'a InterfaceCounters> {
    if let Some(index) = connection.monitor_snmp_index {
        return sample.counters_for_index(index);
    }
    let port = match connection.monitor_interface? {
        MonitoredEnd::Source => connection.source_port.as_deref()?,
        MonitoredEnd::Target => connection.target_port.as_deref()?,
    };
    sample
        .interfaces
        .iter()
        .find(|c| c.name.as_deref() == Some(port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::models::LinkSpeed;

    fn state(in_octets: u64, out_octets: u64, at_epoch: i64) -> CounterState {
        CounterState {
            in_octets,
            out_octets,
            sampled_at: DateTime::from_timestamp(at_epoch, 0).unwrap(),
        }
    }

    fn at(epoch: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(epoch, 0).unwrap()
    }

    #[test]
    fn test_plain_rate() {
        let outcome = diff_counters(
            &state(1000, 2000, 1000),
            11_000,
            22_000,
            CounterBits::Bits64,
            at(1010),
            Duration::from_secs(90),
            LinkSpeed::OneGig.bits_per_sec(),
        );
        let DiffOutcome::Rate(rate) = outcome else { panic!("expected rate") };
        assert_eq!(rate.in_bits_per_sec, 10_000.0 * 8.0 / 10.0);
        assert_eq!(rate.out_bits_per_sec, 20_000.0 * 8.0 / 10.0);
        assert!(!rate.clipped);
    }

    #[test]
    fn test_32bit_wrap() {
        // prev=4294967290 at t=1000, cur=10 at t=1010 → Δ=16 → 12.8 bps
        let outcome = diff_counters(
            &state(4_294_967_290, 0, 1000),
            10,
            0,
            CounterBits::Bits32,
            at(1010),
            Duration::from_secs(90),
            LinkSpeed::OneGig.bits_per_sec(),
        );
        let DiffOutcome::Rate(rate) = outcome else { panic!("expected rate") };
        assert!((rate.in_bits_per_sec - 12.8).abs() < 1e-9);
    }

    #[test]
    fn test_stale_gap_discards() {
        // prevAt=0, currentAt=300, staleGap=90 → stale, no rate
        let outcome = diff_counters(
            &state(0, 0, 0),
            1000,
            1000,
            CounterBits::Bits64,
            at(300),
            Duration::from_secs(90),
            LinkSpeed::OneGig.bits_per_sec(),
        );
        assert_eq!(outcome, DiffOutcome::Stale);
    }

    #[test]
    fn test_implausible_wrap_is_reset() {
        // A 64-bit counter "wrapping" by an enormous amount in 10s cannot
        // be traffic on a 1G link; treat as reboot.
        let outcome = diff_counters(
            &state(u64::MAX - 5, 0, 1000),
            u64::MAX / 2,
            0,
            CounterBits::Bits64,
            at(1010),
            Duration::from_secs(90),
            LinkSpeed::OneGig.bits_per_sec(),
        );
        assert_eq!(outcome, DiffOutcome::Reset);
    }

    #[test]
    fn test_plausible_32bit_wrap_on_fast_link() {
        // 10G link, 30s interval: a full 32-bit wrap plus some is plausible.
        let outcome = diff_counters(
            &state(4_000_000_000, 0, 0),
            500_000_000,
            0,
            CounterBits::Bits32,
            at(30),
            Duration::from_secs(90),
            LinkSpeed::TenGig.bits_per_sec(),
        );
        assert!(matches!(outcome, DiffOutcome::Rate(_)));
    }

    #[test]
    fn test_utilisation_clamped() {
        // 1000 octets/sec on a link declared 1G is fine; now force overflow
        // with a tiny link and huge delta.
        let outcome = diff_counters(
            &state(0, 0, 0),
            10_000_000_000,
            0,
            CounterBits::Bits64,
            at(10),
            Duration::from_secs(90),
            LinkSpeed::OneGig.bits_per_sec(),
        );
        let DiffOutcome::Rate(rate) = outcome else { panic!("expected rate") };
        assert_eq!(rate.utilisation_percent, 100.0);
        assert!(rate.clipped);
    }

    #[tokio::test]
    async fn test_ingest_persists_state_and_history() {
        use crate::repository::models::*;
        use crate::repository::MemoryRepository;

        let repo = Arc::new(MemoryRepository::new());
        let map = repo
            .upsert_map(MapRecord {
                id: uuid::Uuid::new_v4(),
                name: "m".to_string(),
                is_default: true,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let a = repo
            .upsert_device(Device::new("a", DeviceKind::GenericSnmp, None))
            .await
            .unwrap();
        let b = repo
            .upsert_device(Device::new("b", DeviceKind::GenericSnmp, None))
            .await
            .unwrap();
        let connection = repo
            .create_connection(Connection {
                id: uuid::Uuid::new_v4(),
                map_id: map.id,
                source_device_id: a.id,
                target_device_id: b.id,
                source_port: None,
                target_port: None,
                link_speed: LinkSpeed::OneGig,
                monitor_interface: Some(MonitoredEnd::Source),
                monitor_snmp_index: Some(2),
                link_stats: None,
                counter_state: None,
                is_dynamic: false,
                dynamic_type: None,
                dynamic_metadata: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let differencer = Differencer::new(repo.clone(), Duration::from_secs(90));
        let counters = InterfaceCounters {
            snmp_index: Some(2),
            name: None,
            in_octets: 1000,
            out_octets: 1000,
            bits: CounterBits::Bits64,
        };

        // First reading: state stored, no history.
        differencer
            .ingest(connection.clone(), &counters, at(1000))
            .await
            .unwrap();
        let stored = repo.get_connection(connection.id).await.unwrap();
        assert!(stored.counter_state.is_some());
        assert!(stored.link_stats.is_none());

        // Second reading ten seconds later: rate emitted.
        let counters = InterfaceCounters {
            in_octets: 11_000,
            out_octets: 21_000,
            ..counters
        };
        differencer
            .ingest(stored, &counters, at(1010))
            .await
            .unwrap();

        let stored = repo.get_connection(connection.id).await.unwrap();
        let stats = stored.link_stats.unwrap();
        assert_eq!(stats.in_bits_per_sec, 8000.0);
        assert_eq!(stats.out_bits_per_sec, 16000.0);

        let history = repo
            .list_bandwidth_samples(connection.id, at(0))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
    }
}
