// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Proxmox PVE prober.
//!
//! Talks HTTPS to `api2/json` on port 8006 with either an API token
//! (`Authorization: PVEAPIToken=<id>=<secret>`) or a cached ticket
//! (`POST /access/ticket`, 2 h expiry). Every probe:
//!
//! 1. reads `/version`, `/cluster/status` and `/nodes`,
//! 2. identifies which cluster node this credential represents (operator
//!    override, then node interface addresses, then cluster-status IPs),
//! 3. lists `/cluster/resources?type=vm` filtered to that node, and
//! 4. collects guest addresses from the QEMU agent / LXC interfaces.
//!
//! The resulting [`ProxmoxObservation`] feeds the VM inventory and the
//! dynamic connection resolver.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use super::error::ProbeError;
use super::types::{ProbeSample, ProxmoxObservation};
use super::{remaining, Credentials, Prober, ProxmoxCredentials};
use crate::repository::models::{Device, DeviceData, ProxmoxVm, VmStatus, VmType};

/// Tickets live two hours; refresh after ninety minutes.
const TICKET_REFRESH_AFTER_SECS: i64 = 90 * 60;

#[derive(Clone)]
struct CachedTicket {
    ticket: String,
    csrf_token: String,
    acquired_at: DateTime<Utc>,
}

/// Proxmox PVE REST prober
pub struct ProxmoxProber {
    verified: reqwest::Client,
    unverified: reqwest::Client,
    tickets: DashMap<Uuid, CachedTicket>,
}

impl ProxmoxProber {
    pub fn new() -> Self {
        let verified = reqwest::Client::builder().build().unwrap_or_default();
        // PVE ships self-signed certificates by default.
        let unverified = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap_or_default();
        Self {
            verified,
            unverified,
            tickets: DashMap::new(),
        }
    }

    fn client(&self, creds: &ProxmoxCredentials) -> &reqwest::Client {
        if creds.verify_ssl {
            &self.verified
        } else {
            &self.unverified
        }
    }

    /// Acquire (or reuse) a ticket for password-based credentials.
    async fn ticket(
        &self,
        device_id: Uuid,
        base: &str,
        creds: &ProxmoxCredentials,
        deadline: Instant,
    ) -> Result<CachedTicket, ProbeError> {
        if let Some(cached) = self.tickets.get(&device_id) {
            let age = (Utc::now() - cached.acquired_at).num_seconds();
            if age < TICKET_REFRESH_AFTER_SECS {
                return Ok(cached.clone());
            }
        }

        let username = creds.username.as_deref().unwrap_or_default();
        let password = creds.password.as_deref().unwrap_or_default();
        let user_at_realm = if username.contains('@') {
            username.to_string()
        } else {
            format!("{}@{}", username, creds.realm)
        };

        debug!(device_id = %device_id, "requesting PVE ticket");
        let response = self
            .client(creds)
            .post(format!("{base}/access/ticket"))
            .timeout(remaining(deadline)?)
            .form(&[("username", user_at_realm.as_str()), ("password", password)])
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ProbeError::Auth("ticket request rejected".to_string()));
        }
        if !response.status().is_success() {
            return Err(ProbeError::Protocol(format!(
                "ticket request returned {}",
                response.status()
            )));
        }
        let body: PveResponse<TicketData> = response.json().await?;
        let data = body
            .data
            .ok_or_else(|| ProbeError::Protocol("empty ticket response".to_string()))?;

        let cached = CachedTicket {
            ticket: data.ticket,
            csrf_token: data.csrf_token,
            acquired_at: Utc::now(),
        };
        self.tickets.insert(device_id, cached.clone());
        Ok(cached)
    }

    /// GET an API path, deserializing the `data` wrapper.
    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        base: &str,
        path: &str,
        device_id: Uuid,
        creds: &ProxmoxCredentials,
        deadline: Instant,
    ) -> Result<T, ProbeError> {
        let mut request = self
            .client(creds)
            .get(format!("{base}{path}"))
            .timeout(remaining(deadline)?);

        if creds.uses_token() {
            let id = creds.api_token_id.as_deref().unwrap_or_default();
            let secret = creds.api_token_secret.as_deref().unwrap_or_default();
            request = request.header("Authorization", format!("PVEAPIToken={id}={secret}"));
        } else {
            let ticket = self.ticket(device_id, base, creds, deadline).await?;
            request = request
                .header("Cookie", format!("PVEAuthCookie={}", ticket.ticket))
                .header("CSRFPreventionToken", ticket.csrf_token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            // A stale ticket also lands here; drop it so the next cycle
            // re-authenticates.
            self.tickets.remove(&device_id);
            return Err(ProbeError::Auth(format!("{path} returned {status}")));
        }
        if !status.is_success() {
            return Err(ProbeError::Protocol(format!("{path} returned {status}")));
        }
        let body: PveResponse<T> = response.json().await?;
        body.data
            .ok_or_else(|| ProbeError::Protocol(format!("{path} returned no data")))
    }

    /// Which cluster node does this credential represent?
    async fn identify_node(
        &self,
        device: &Device,
        base: &str,
        creds: &ProxmoxCredentials,
        nodes: &[NodeEntry],
        cluster: &[ClusterStatusEntry],
        deadline: Instant,
    ) -> Result<String, ProbeError> {
        if let Some(name) = &creds.override_node_name {
            return Ok(name.clone());
        }
        let device_ip = device.ip.map(|ip| ip.to_string()).unwrap_or_default();

        // Pass 1: node interface addresses.
        for node in nodes {
            let interfaces: Vec<NetworkInterface> = match self
                .get(
                    base,
                    &format!("/nodes/{}/network", node.node),
                    device.id,
                    creds,
                    deadline,
                )
                .await
            {
                Ok(interfaces) => interfaces,
                Err(e) if e.is_auth() => return Err(e),
                Err(_) => continue,
            };
            if interfaces
                .iter()
                .any(|iface| iface.address.as_deref() == Some(device_ip.as_str()))
            {
                return Ok(node.node.clone());
            }
        }

        // Pass 2: cluster-status IPs.
        if let Some(entry) = cluster
            .iter()
            .find(|entry| entry.ip.as_deref() == Some(device_ip.as_str()))
        {
            return Ok(entry.name.clone());
        }

        // A standalone host is unambiguous.
        if nodes.len() == 1 {
            return Ok(nodes[0].node.clone());
        }

        Err(ProbeError::Protocol(format!(
            "could not match credential IP {device_ip} to a cluster node"
        )))
    }

    /// Guest addresses for one VM; agent/interface errors are tolerated.
    async fn guest_addresses(
        &self,
        base: &str,
        node: &str,
        vm: &VmResource,
        device_id: Uuid,
        creds: &ProxmoxCredentials,
        deadline: Instant,
    ) -> (Vec<String>, Vec<String>) {
        let mut ips = Vec::new();
        let mut macs = Vec::new();

        match vm.kind.as_str() {
            "qemu" => {
                let result: Result<AgentInterfaces, _> = self
                    .get(
                        base,
                        &format!("/nodes/{node}/qemu/{}/agent/network-get-interfaces", vm.vmid),
                        device_id,
                        creds,
                        deadline,
                    )
                    .await;
                if let Ok(agent) = result {
                    for iface in agent.result {
                        if iface.name == "lo" {
                            continue;
                        }
                        if let Some(mac) = iface.hardware_address {
                            macs.push(mac);
                        }
                        for addr in iface.ip_addresses {
                            if addr.ip_address_type.as_deref() == Some("ipv4") {
                                ips.push(addr.ip_address);
                            }
                        }
                    }
                }
            }
            "lxc" => {
                let result: Result<Vec<LxcInterface>, _> = self
                    .get(
                        base,
                        &format!("/nodes/{node}/lxc/{}/interfaces", vm.vmid),
                        device_id,
                        creds,
                        deadline,
                    )
                    .await;
                if let Ok(interfaces) = result {
                    for iface in interfaces {
                        if iface.name == "lo" {
                            continue;
                        }
                        if let Some(mac) = iface.hwaddr {
                            macs.push(mac);
                        }
                        if let Some(inet) = iface.inet {
                            // "10.0.0.5/24" → "10.0.0.5"
                            ips.push(inet.split('/').next().unwrap_or(&inet).to_string());
                        }
                    }
                }
            }
            _ => {}
        }

        (ips, macs)
    }
}

impl Default for ProxmoxProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prober for ProxmoxProber {
    fn name(&self) -> &'static str {
        "proxmox"
    }

    async fn probe(
        &self,
        device: &Device,
        creds: &Credentials,
        deadline: Instant,
    ) -> Result<ProbeSample, ProbeError> {
        let ip = device
            .ip
            .ok_or_else(|| ProbeError::Credentials("device has no IP address".to_string()))?;
        let creds = ProxmoxCredentials::from_bag(creds)?;
        let base = format!("https://{}:{}/api2/json", ip, creds.port);

        let version: VersionData = self
            .get(&base, "/version", device.id, &creds, deadline)
            .await?;
        let cluster: Vec<ClusterStatusEntry> = self
            .get(&base, "/cluster/status", device.id, &creds, deadline)
            .await?;
        let nodes: Vec<NodeEntry> = self
            .get(&base, "/nodes", device.id, &creds, deadline)
            .await?;

        let cluster_name = cluster
            .iter()
            .find(|entry| entry.kind == "cluster")
            .map(|entry| entry.name.clone())
            .unwrap_or_else(|| "standalone".to_string());
        let node_name = self
            .identify_node(device, &base, &creds, &nodes, &cluster, deadline)
            .await?;
        trace!(device = %device.name, %cluster_name, %node_name, "identified PVE node");

        let mut data = DeviceData {
            version: Some(version.version),
            ..DeviceData::default()
        };
        if let Some(node) = nodes.iter().find(|n| n.node == node_name) {
            data.uptime_seconds = node.uptime;
            data.cpu_percent = node.cpu.map(|c| (c * 100.0).clamp(0.0, 100.0));
            data.memory_percent = match (node.mem, node.maxmem) {
                (Some(mem), Some(max)) if max > 0 => Some(100.0 * mem as f64 / max as f64),
                _ => None,
            };
            data.disk_percent = match (node.disk, node.maxdisk) {
                (Some(disk), Some(max)) if max > 0 => Some(100.0 * disk as f64 / max as f64),
                _ => None,
            };
        }

        let resources: Vec<VmResource> = self
            .get(
                &base,
                "/cluster/resources?type=vm",
                device.id,
                &creds,
                deadline,
            )
            .await?;

        let mut vms = Vec::new();
        for resource in resources.iter().filter(|r| r.node == node_name) {
            let status = match resource.status.as_str() {
                "running" => VmStatus::Running,
                "stopped" => VmStatus::Stopped,
                "paused" => VmStatus::Paused,
                _ => VmStatus::Unknown,
            };
            let vm_type = match resource.kind.as_str() {
                "qemu" => VmType::Qemu,
                "lxc" => VmType::Lxc,
                _ => continue,
            };
            let (ip_addresses, mac_addresses) = if status == VmStatus::Running {
                self.guest_addresses(&base, &node_name, resource, device.id, &creds, deadline)
                    .await
            } else {
                (Vec::new(), Vec::new())
            };

            vms.push(ProxmoxVm {
                id: Uuid::new_v4(),
                host_device_id: device.id,
                vmid: resource.vmid,
                name: resource
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("vm-{}", resource.vmid)),
                vm_type,
                status,
                cpu_percent: resource.cpu.map(|c| (c * 100.0).clamp(0.0, 100.0)),
                memory_percent: match (resource.mem, resource.maxmem) {
                    (Some(mem), Some(max)) if max > 0 => Some(100.0 * mem as f64 / max as f64),
                    _ => None,
                },
                ip_addresses,
                mac_addresses,
                updated_at: Utc::now(),
            });
        }

        let mut sample = ProbeSample::reachable().with_device_data(data);
        sample.proxmox = Some(ProxmoxObservation {
            cluster_name,
            node_name,
            vms,
        });
        Ok(sample)
    }
}

/// Every Proxmox API response wraps its payload in a `data` field.
#[derive(Debug, Deserialize)]
struct PveResponse<T> {
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct TicketData {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_token: String,
}

#[derive(Debug, Deserialize)]
struct VersionData {
    version: String,
}

#[derive(Debug, Deserialize)]
struct ClusterStatusEntry {
    #[serde(rename = "type")]
    kind: String,
    name: String,
    ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NodeEntry {
    node: String,
    uptime: Option<u64>,
    cpu: Option<f64>,
    mem: Option<u64>,
    maxmem: Option<u64>,
    disk: Option<u64>,
    maxdisk: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct NetworkInterface {
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VmResource {
    vmid: u32,
    name: Option<String>,
    node: String,
    status: String,
    #[serde(rename = "type")]
    kind: String,
    cpu: Option<f64>,
    mem: Option<u64>,
    maxmem: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct AgentInterfaces {
    result: Vec<AgentInterface>,
}

#[derive(Debug, Deserialize)]
struct AgentInterface {
    name: String,
    #[serde(rename = "hardware-address")]
    hardware_address: Option<String>,
    #[serde(rename = "ip-addresses", default)]
    ip_addresses: Vec<AgentAddress>,
}

#[derive(Debug, Deserialize)]
struct AgentAddress {
    #[serde(rename = "ip-address")]
    ip_address: String,
    #[serde(rename = "ip-address-type")]
    ip_address_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LxcInterface {
    name: String,
    hwaddr: Option<String>,
    inet: Option<String>,
}
