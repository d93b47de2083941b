// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Persistent entity models.
//!
//! These are the records exchanged with the [`Repository`](super::Repository)
//! trait. The backing store is an external collaborator; everything here is
//! plain serde data.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Device kind, selecting the prober used for it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    MikrotikRouter,
    MikrotikSwitch,
    GenericSnmp,
    GenericPrometheus,
    GenericPing,
    Server,
    Proxmox,
    AccessPoint,
    Placeholder,
}

impl DeviceKind {
    /// Placeholders are decorative map items: never probed, never licensed.
    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::Placeholder)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MikrotikRouter => "mikrotik_router",
            Self::MikrotikSwitch => "mikrotik_switch",
            Self::GenericSnmp => "generic_snmp",
            Self::GenericPrometheus => "generic_prometheus",
            Self::GenericPing => "generic_ping",
            Self::Server => "server",
            Self::Proxmox => "proxmox",
            Self::AccessPoint => "access_point",
            Self::Placeholder => "placeholder",
        }
    }
}

/// Monitored status of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Online,
    Warning,
    Stale,
    Offline,
    Unknown,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Warning => "warning",
            Self::Stale => "stale",
            Self::Offline => "offline",
            Self::Unknown => "unknown",
        }
    }
}

/// Link state of a single port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortStatus {
    Up,
    Down,
}

/// One physical or logical interface reported by a probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevicePort {
    pub name: String,
    pub default_name: Option<String>,
    pub status: PortStatus,
    pub speed: Option<String>,
    pub description: Option<String>,
    pub snmp_index: Option<i32>,
}

/// Protocol-specific snapshot refreshed on every successful probe
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceData {
    pub uptime_seconds: Option<u64>,
    pub model: Option<String>,
    pub version: Option<String>,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub disk_percent: Option<f64>,
    #[serde(default)]
    pub ports: Vec<DevicePort>,
}

/// Device record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: Uuid,
    pub name: String,
    pub kind: DeviceKind,
    pub ip: Option<Ipv4Addr>,
    pub status: DeviceStatus,
    pub last_probed_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub device_data: Option<DeviceData>,
    pub credential_profile_id: Option<Uuid>,
    /// Inline credential overrides; keys win over the profile's bag.
    pub custom_credentials: Option<serde_json::Value>,
    pub use_on_duty: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    /// Construct a new device with an unknown status and fresh timestamps.
    pub fn new(name: impl Into<String>, kind: DeviceKind, ip: Option<Ipv4Addr>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            ip,
            status: DeviceStatus::Unknown,
            last_probed_at: None,
            consecutive_failures: 0,
            device_data: None,
            credential_profile_id: None,
            custom_credentials: None,
            use_on_duty: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Credential profile kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    Mikrotik,
    Snmp,
    Prometheus,
    Proxmox,
}

/// Named, typed credential bag shared across devices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialProfile {
    pub id: Uuid,
    pub name: String,
    pub kind: CredentialKind,
    /// Opaque key/value bag; recognized keys depend on `kind`.
    pub credentials: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Topology canvas record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapRecord {
    pub id: Uuid,
    pub name: String,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
}

/// Position of a device on a map
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicePlacement {
    pub id: Uuid,
    pub device_id: Uuid,
    pub map_id: Uuid,
    pub x: f64,
    pub y: f64,
}

/// Nominal speed of a monitored link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkSpeed {
    #[serde(rename = "1G")]
    OneGig,
    #[serde(rename = "10G")]
    TenGig,
    #[serde(rename = "25G")]
    TwentyFiveGig,
    #[serde(rename = "40G")]
    FortyGig,
    #[serde(rename = "100G")]
    HundredGig,
}

impl LinkSpeed {
    /// Nominal capacity in bits per second.
    pub fn bits_per_sec(&self) -> f64 {
        match self {
            Self::OneGig => 1e9,
            Self::TenGig => 10e9,
            Self::TwentyFiveGig => 25e9,
            Self::FortyGig => 40e9,
            Self::HundredGig => 100e9,
        }
    }
}

/// Which end of a connection owns the monitored interface counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitoredEnd {
    Source,
    Target,
}

/// Rolling traffic snapshot persisted on the connection row
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkStats {
    pub in_bits_per_sec: f64,
    pub out_bits_per_sec: f64,
    pub utilisation_percent: f64,
    pub sampled_at: DateTime<Utc>,
}

/// Raw counter state carried between differencer samples.
///
/// Persisted with the connection so rates survive a restart.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CounterState {
    pub in_octets: u64,
    pub out_octets: u64,
    pub sampled_at: DateTime<Utc>,
}

/// Dynamic connection kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DynamicType {
    ProxmoxVmHost,
}

/// Metadata tracked for dynamically resolved connections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicMetadata {
    /// The device representing the VM; this endpoint never moves.
    pub vm_device_id: Uuid,
    /// Which endpoint of the connection is the VM.
    pub monitored_end: MonitoredEnd,
    pub last_resolved_host_device_id: Option<Uuid>,
}

/// Connection between two placed devices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: Uuid,
    pub map_id: Uuid,
    pub source_device_id: Uuid,
    pub target_device_id: Uuid,
    pub source_port: Option<String>,
    pub target_port: Option<String>,
    pub link_speed: LinkSpeed,
    /// Which endpoint's counters feed link telemetry, if any.
    pub monitor_interface: Option<MonitoredEnd>,
    pub monitor_snmp_index: Option<i32>,
    pub link_stats: Option<LinkStats>,
    pub counter_state: Option<CounterState>,
    pub is_dynamic: bool,
    pub dynamic_type: Option<DynamicType>,
    pub dynamic_metadata: Option<DynamicMetadata>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Connection {
    /// Endpoint pair + ports, order-insensitive. Two connections collide when
    /// their keys are equal.
    pub fn endpoint_key(&self) -> ((Uuid, Option<String>), (Uuid, Option<String>)) {
        let a = (self.source_device_id, self.source_port.clone());
        let b = (self.target_device_id, self.target_port.clone());
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }
}

/// Proxmox cluster node to host-device mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxmoxNode {
    pub id: Uuid,
    pub cluster_name: String,
    pub node_name: String,
    pub host_device_id: Uuid,
    pub updated_at: DateTime<Utc>,
}

/// Guest virtualization type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmType {
    Qemu,
    Lxc,
}

/// Guest run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    Running,
    Stopped,
    Paused,
    Unknown,
}

/// Virtual machine or container discovered on a Proxmox host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxmoxVm {
    pub id: Uuid,
    pub host_device_id: Uuid,
    pub vmid: u32,
    pub name: String,
    pub vm_type: VmType,
    pub status: VmStatus,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    #[serde(default)]
    pub mac_addresses: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only status transition record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStatusEvent {
    pub id: Uuid,
    pub device_id: Uuid,
    pub previous_status: DeviceStatus,
    pub new_status: DeviceStatus,
    pub created_at: DateTime<Utc>,
    pub message: Option<String>,
}

/// Contiguous interval of a single status, derived from the event log
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatusSegment {
    pub status: DeviceStatus,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Per-probe resource sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceMetricsSample {
    pub device_id: Uuid,
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub disk_percent: Option<f64>,
    pub ping_rtt_ms: Option<f64>,
    pub uptime_seconds: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

/// Sample of a user-declared Prometheus metric
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusMetricSample {
    pub device_id: Uuid,
    pub metric_id: String,
    pub value: f64,
    pub raw_value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Per-sample bandwidth record for a monitored connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandwidthSample {
    pub connection_id: Uuid,
    pub in_bits_per_sec: f64,
    pub out_bits_per_sec: f64,
    pub utilisation_percent: f64,
    pub timestamp: DateTime<Utc>,
}

/// Webhook delivery method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "POST")]
    Post,
}

/// Configured webhook target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub name: String,
    pub url: String,
    pub method: HttpMethod,
    pub message_template: String,
    pub enabled: bool,
    /// Owner; on-duty routing resolves notifications through this user.
    pub owner_user_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Subscription linking a device to a notification target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceNotification {
    pub device_id: Uuid,
    pub notification_id: Uuid,
}

/// One shift of the on-duty rota
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shift {
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    /// Fixed UTC offset, e.g. `"+02:00"`, `"Z"` or `"UTC"`.
    pub timezone: String,
    #[serde(default)]
    pub user_ids: Vec<Uuid>,
}

/// Day/night on-duty configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnDutyConfig {
    pub day: Shift,
    pub night: Shift,
}

/// Alarm mute window. `user_id = None` silences everything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmMute {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub muted_by: String,
    pub mute_until: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AlarmMute {
    /// A mute with no expiry is active forever (until deleted).
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.mute_until.map_or(true, |until| until > now)
    }
}

/// Outcome of one notification delivery pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationHistory {
    pub id: Uuid,
    pub notification_id: Uuid,
    pub device_id: Uuid,
    pub event_id: Uuid,
    pub message: String,
    pub success: bool,
    pub status_code: Option<u16>,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

/// License tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseTier {
    Free,
    Pro,
    DevicePack,
}

/// Installed license
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct License {
    pub license_key: String,
    pub tier: LicenseTier,
    pub device_limit: u32,
    pub server_fingerprint: String,
    pub purchase_date: Option<NaiveDate>,
    pub updates_valid_until: Option<NaiveDate>,
    pub signature: Option<String>,
}

/// Scanner probe family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanProbeType {
    Mikrotik,
    Snmp,
    Server,
    FindAll,
}

/// Saved scanner parameter set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanProfile {
    pub id: Uuid,
    pub name: String,
    pub ip_range: String,
    #[serde(default)]
    pub credential_profile_ids: Vec<Uuid>,
    #[serde(default)]
    pub probe_types: Vec<ScanProbeType>,
    pub created_at: DateTime<Utc>,
}

/// Log severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// Append-only application log row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub source: String,
    pub level: LogLevel,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(source: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            level,
            message: message.into(),
            metadata: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_speed_bits() {
        assert_eq!(LinkSpeed::OneGig.bits_per_sec(), 1e9);
        assert_eq!(LinkSpeed::HundredGig.bits_per_sec(), 100e9);
    }

    #[test]
    fn test_link_speed_serde() {
        assert_eq!(serde_json::to_string(&LinkSpeed::TenGig).unwrap(), "\"10G\"");
        let speed: LinkSpeed = serde_json::from_str("\"25G\"").unwrap();
        assert_eq!(speed, LinkSpeed::TwentyFiveGig);
    }

    #[test]
    fn test_endpoint_key_is_order_insensitive() {
        let mut a = Connection {
            id: Uuid::new_v4(),
            map_id: Uuid::new_v4(),
            source_device_id: Uuid::new_v4(),
            target_device_id: Uuid::new_v4(),
            source_port: Some("ether1".to_string()),
            target_port: Some("ether2".to_string()),
            link_speed: LinkSpeed::OneGig,
            monitor_interface: None,
            monitor_snmp_index: None,
            link_stats: None,
            counter_state: None,
            is_dynamic: false,
            dynamic_type: None,
            dynamic_metadata: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let key_forward = a.endpoint_key();

        std::mem::swap(&mut a.source_device_id, &mut a.target_device_id);
        std::mem::swap(&mut a.source_port, &mut a.target_port);
        assert_eq!(key_forward, a.endpoint_key());
    }

    #[test]
    fn test_mute_activity() {
        let mut mute = AlarmMute {
            id: Uuid::new_v4(),
            user_id: None,
            muted_by: "admin".to_string(),
            mute_until: None,
            reason: None,
            created_at: Utc::now(),
        };
        let now = Utc::now();
        assert!(mute.is_active(now));

        mute.mute_until = Some(now - chrono::Duration::minutes(1));
        assert!(!mute.is_active(now));

        mute.mute_until = Some(now + chrono::Duration::minutes(1));
        assert!(mute.is_active(now));
    }

    #[test]
    fn test_device_kind_serde() {
        assert_eq!(
            serde_json::to_string(&DeviceKind::MikrotikRouter).unwrap(),
            "\"mikrotik_router\""
        );
        let kind: DeviceKind = serde_json::from_str("\"access_point\"").unwrap();
        assert_eq!(kind, DeviceKind::AccessPoint);
    }
}
