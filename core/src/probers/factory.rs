// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Prober dispatch.
//!
//! Maps a device kind to the prober responsible for it. Probers are built
//! once and shared; they keep only per-device caches internally.

use std::sync::Arc;

use super::ping::PingProber;
use super::prometheus::PrometheusProber;
use super::proxmox::ProxmoxProber;
use super::routeros::RouterOsProber;
use super::snmp::SnmpProber;
use super::Prober;
use crate::repository::models::DeviceKind;

/// Factory holding one shared instance of every prober.
pub struct ProberFactory {
    routeros: Arc<RouterOsProber>,
    snmp: Arc<SnmpProber>,
    prometheus: Arc<PrometheusProber>,
    proxmox: Arc<ProxmoxProber>,
    ping: Arc<PingProber>,
}

impl ProberFactory {
    /// Build the default prober set.
    ///
    /// `detailed_probe_every` controls how often the RouterOS prober runs
    /// its detailed interface pass.
    pub fn new(detailed_probe_every: u32) -> Self {
        Self {
            routeros: Arc::new(RouterOsProber::new(detailed_probe_every)),
            snmp: Arc::new(SnmpProber::new()),
            prometheus: Arc::new(PrometheusProber::new()),
            proxmox: Arc::new(ProxmoxProber::new()),
            ping: Arc::new(PingProber::new()),
        }
    }

    /// The prober for a device kind; `None` for placeholders.
    pub fn prober_for(&self, kind: DeviceKind) -> Option<Arc<dyn Prober>> {
        match kind {
            DeviceKind::MikrotikRouter | DeviceKind::MikrotikSwitch | DeviceKind::AccessPoint => {
                Some(self.routeros.clone())
            }
            DeviceKind::GenericSnmp => Some(self.snmp.clone()),
            DeviceKind::GenericPrometheus | DeviceKind::Server => Some(self.prometheus.clone()),
            DeviceKind::Proxmox => Some(self.proxmox.clone()),
            DeviceKind::GenericPing => Some(self.ping.clone()),
            DeviceKind::Placeholder => None,
        }
    }

    /// Direct access to the ping prober (shared with the scanner).
    pub fn ping(&self) -> Arc<PingProber> {
        self.ping.clone()
    }

    /// Direct access to the SNMP prober (shared with the scanner).
    pub fn snmp(&self) -> Arc<SnmpProber> {
        self.snmp.clone()
    }

    /// Direct access to the RouterOS prober (shared with the scanner).
    pub fn routeros(&self) -> Arc<RouterOsProber> {
        self.routeros.clone()
    }
}

impl Default for ProberFactory {
    fn default() -> Self {
        Self::new(10)
    }
}
