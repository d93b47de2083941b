// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Device probers.
//!
//! A prober collects one [`ProbeSample`] from a device over its native
//! protocol. Probers are independent of each other and of the scheduler;
//! the [`ProberFactory`] maps a [`DeviceKind`](crate::repository::DeviceKind)
//! to the prober responsible for it:
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │            Prober trait              │
//! │  (device, credentials, deadline)     │
//! │            → ProbeSample             │
//! └──────────────────────────────────────┘
//!     ↓         ↓        ↓        ↓       ↓
//!  RouterOS    SNMP   Prometheus Proxmox Ping
//! ```
//!
//! All I/O honours the dispatch deadline; a prober never outlives it by
//! more than one socket operation.

pub mod credentials;
pub mod error;
pub mod factory;
pub mod ping;
pub mod prometheus;
pub mod proxmox;
pub mod routeros;
pub mod snmp;
pub mod types;

pub use credentials::{
    Credentials, MikrotikCredentials, PrometheusCredentials, PrometheusMetricConfig,
    ProxmoxCredentials, SnmpCredentials,
};
pub use error::ProbeError;
pub use factory::ProberFactory;
pub use types::{CounterBits, CustomMetricReading, InterfaceCounters, ProbeSample, ProxmoxObservation};

use async_trait::async_trait;
use tokio::time::Instant;

use crate::repository::models::Device;

/// Protocol-specific sample collection.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Short protocol name used in logs and fingerprints.
    fn name(&self) -> &'static str;

    /// Collect one sample from `device`, finishing before `deadline`.
    async fn probe(
        &self,
        device: &Device,
        creds: &Credentials,
        deadline: Instant,
    ) -> Result<ProbeSample, ProbeError>;
}

/// Remaining budget until `deadline`, or a timeout error if spent.
pub(crate) fn remaining(deadline: Instant) -> Result<std::time::Duration, ProbeError> {
    let now = Instant::now();
    if now >= deadline {
        return Err(ProbeError::Timeout(std::time::Duration::ZERO));
    }
    Ok(deadline - now)
}
