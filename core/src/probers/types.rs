// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Shared probe sample types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::repository::models::{DeviceData, ProxmoxVm};

/// Bit width of an interface octet counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterBits {
    Bits32,
    Bits64,
}

impl CounterBits {
    /// The value at which the counter wraps back to zero.
    pub fn modulus(&self) -> u128 {
        match self {
            Self::Bits32 => 1u128 << 32,
            Self::Bits64 => 1u128 << 64,
        }
    }
}

/// Octet counter reading for one interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceCounters {
    pub snmp_index: Option<i32>,
    pub name: Option<String>,
    pub in_octets: u64,
    pub out_octets: u64,
    pub bits: CounterBits,
}

/// Reading of one user-declared Prometheus metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomMetricReading {
    pub metric_id: String,
    pub raw_value: f64,
    pub value: f64,
    /// Monotone counters are rate-converted by the differencer before display.
    pub is_counter: bool,
}

/// Proxmox cluster observation attached to a sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxmoxObservation {
    pub cluster_name: String,
    pub node_name: String,
    pub vms: Vec<ProxmoxVm>,
}

/// One probe attempt's successful outcome.
///
/// Failures are expressed as `Err(ProbeError)`; the scheduler converts those
/// into failed-sample records for the status engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSample {
    /// Round-trip time where the protocol measures one (ping, RouterOS).
    pub rtt_ms: Option<f64>,
    /// Refreshed protocol-specific snapshot.
    pub device_data: Option<DeviceData>,
    /// Interface octet counters for link monitoring.
    #[serde(default)]
    pub interfaces: Vec<InterfaceCounters>,
    /// User-declared Prometheus metric readings.
    #[serde(default)]
    pub custom_metrics: Vec<CustomMetricReading>,
    /// Present on Proxmox samples only.
    pub proxmox: Option<ProxmoxObservation>,
    pub collected_at: DateTime<Utc>,
}

impl ProbeSample {
    /// An empty successful sample stamped now.
    pub fn reachable() -> Self {
        Self {
            rtt_ms: None,
            device_data: None,
            interfaces: Vec::new(),
            custom_metrics: Vec::new(),
            proxmox: None,
            collected_at: Utc::now(),
        }
    }

    pub fn with_rtt(mut self, rtt_ms: f64) -> Self {
        self.rtt_ms = Some(rtt_ms);
        self
    }

    pub fn with_device_data(mut self, data: DeviceData) -> Self {
        self.device_data = Some(data);
        self
    }

    /// Counter reading for a given SNMP interface index, if sampled.
    pub fn counters_for_index(&self, snmp_index: i32) -> Option<&InterfaceCounters> {
        self.interfaces
            .iter()
            .find(|c| c.snmp_index == Some(snmp_index))
    }
}
