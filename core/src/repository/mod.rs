// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! # Repository layer
//!
//! Typed persistence contract consumed by every monitoring component. The
//! repository is defined by *operations*, not storage: the relational store
//! is an external collaborator, and [`MemoryRepository`] is the bundled
//! implementation used by the default server, tests, and demos.
//!
//! All methods are safe for concurrent use; callers hold an
//! `Arc<dyn Repository>`.
//!
//! ## Cascade semantics
//!
//! - Deleting a device removes its placements, connections touching it,
//!   notification subscriptions, and Proxmox rows scoped to it.
//! - Deleting a map removes its placements and connections.
//! - A device placement is unique per `(device, map)`.
//! - A connection is unique per unordered endpoint pair + ports; creating a
//!   reverse duplicate fails with [`RepositoryError::DuplicateKey`].
//! - Status events for a device form a chain: each event's
//!   `previous_status` equals the prior event's `new_status` and timestamps
//!   never decrease.

pub mod error;
pub mod memory;
pub mod models;

pub use error::{RepositoryError, RepositoryResult};
pub use memory::MemoryRepository;
pub use models::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Counts returned by a retention purge run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub device_metrics: usize,
    pub prometheus_metrics: usize,
    pub bandwidth: usize,
    pub status_events: usize,
}

impl PurgeStats {
    pub fn total(&self) -> usize {
        self.device_metrics + self.prometheus_metrics + self.bandwidth + self.status_events
    }
}

/// Persistence operations consumed by the monitoring engine.
#[async_trait]
pub trait Repository: Send + Sync {
    // --- Devices ---

    async fn list_devices(&self) -> RepositoryResult<Vec<Device>>;
    async fn list_devices_on_map(&self, map_id: Uuid) -> RepositoryResult<Vec<Device>>;
    async fn get_device(&self, id: Uuid) -> RepositoryResult<Device>;
    async fn upsert_device(&self, device: Device) -> RepositoryResult<Device>;
    async fn delete_device(&self, id: Uuid) -> RepositoryResult<()>;
    /// Device count for license enforcement; placeholders excluded.
    async fn count_licensed_devices(&self) -> RepositoryResult<usize>;

    // --- Credential profiles ---

    async fn list_credential_profiles(&self) -> RepositoryResult<Vec<CredentialProfile>>;
    async fn get_credential_profile(&self, id: Uuid) -> RepositoryResult<CredentialProfile>;
    async fn upsert_credential_profile(
        &self,
        profile: CredentialProfile,
    ) -> RepositoryResult<CredentialProfile>;
    async fn delete_credential_profile(&self, id: Uuid) -> RepositoryResult<()>;

    // --- Maps & placements ---

    async fn list_maps(&self) -> RepositoryResult<Vec<MapRecord>>;
    async fn get_map(&self, id: Uuid) -> RepositoryResult<MapRecord>;
    async fn upsert_map(&self, map: MapRecord) -> RepositoryResult<MapRecord>;
    async fn delete_map(&self, id: Uuid) -> RepositoryResult<()>;
    async fn list_placements(&self, map_id: Uuid) -> RepositoryResult<Vec<DevicePlacement>>;
    async fn get_placement(&self, id: Uuid) -> RepositoryResult<DevicePlacement>;
    async fn upsert_placement(&self, placement: DevicePlacement)
        -> RepositoryResult<DevicePlacement>;
    async fn delete_placement(&self, id: Uuid) -> RepositoryResult<()>;

    // --- Connections ---

    async fn list_connections(&self, map_id: Option<Uuid>) -> RepositoryResult<Vec<Connection>>;
    async fn get_connection(&self, id: Uuid) -> RepositoryResult<Connection>;
    async fn create_connection(&self, connection: Connection) -> RepositoryResult<Connection>;
    async fn update_connection(&self, connection: Connection) -> RepositoryResult<Connection>;
    async fn delete_connection(&self, id: Uuid) -> RepositoryResult<()>;
    /// Connections with an active monitor whose counter source is `device_id`.
    async fn list_connections_monitoring(&self, device_id: Uuid)
        -> RepositoryResult<Vec<Connection>>;
    async fn list_dynamic_connections(&self) -> RepositoryResult<Vec<Connection>>;

    // --- Proxmox inventory ---

    async fn upsert_proxmox_node(&self, node: ProxmoxNode) -> RepositoryResult<ProxmoxNode>;
    async fn list_proxmox_nodes(&self) -> RepositoryResult<Vec<ProxmoxNode>>;
    /// Replace the VM set reported by one host probe.
    async fn replace_proxmox_vms(
        &self,
        host_device_id: Uuid,
        vms: Vec<ProxmoxVm>,
    ) -> RepositoryResult<()>;
    async fn list_proxmox_vms(&self, host_device_id: Uuid) -> RepositoryResult<Vec<ProxmoxVm>>;
    async fn list_all_proxmox_vms(&self) -> RepositoryResult<Vec<ProxmoxVm>>;

    // --- Status events ---

    async fn record_status_event(&self, event: DeviceStatusEvent) -> RepositoryResult<()>;
    async fn list_status_events(
        &self,
        device_id: Uuid,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        include_warnings: bool,
    ) -> RepositoryResult<Vec<DeviceStatusEvent>>;
    /// Full event log for a device up to `until`, oldest first.
    async fn list_status_events_until(
        &self,
        device_id: Uuid,
        until: DateTime<Utc>,
    ) -> RepositoryResult<Vec<DeviceStatusEvent>>;

    // --- Metrics history ---

    async fn append_metrics_sample(&self, sample: DeviceMetricsSample) -> RepositoryResult<()>;
    async fn list_metrics_samples(
        &self,
        device_id: Uuid,
        since: DateTime<Utc>,
    ) -> RepositoryResult<Vec<DeviceMetricsSample>>;
    async fn append_prometheus_sample(
        &self,
        sample: PrometheusMetricSample,
    ) -> RepositoryResult<()>;
    async fn list_prometheus_samples(
        &self,
        device_id: Uuid,
        metric_id: &str,
        since: DateTime<Utc>,
    ) -> RepositoryResult<Vec<PrometheusMetricSample>>;
    async fn append_bandwidth_sample(&self, sample: BandwidthSample) -> RepositoryResult<()>;
    async fn list_bandwidth_samples(
        &self,
        connection_id: Uuid,
        since: DateTime<Utc>,
    ) -> RepositoryResult<Vec<BandwidthSample>>;
    /// Drop history rows older than `cutoff` across all history tables.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> RepositoryResult<PurgeStats>;

    // --- Notifications ---

    async fn list_notifications(&self) -> RepositoryResult<Vec<Notification>>;
    async fn get_notification(&self, id: Uuid) -> RepositoryResult<Notification>;
    async fn upsert_notification(&self, notification: Notification)
        -> RepositoryResult<Notification>;
    async fn delete_notification(&self, id: Uuid) -> RepositoryResult<()>;
    async fn subscribe_device(&self, link: DeviceNotification) -> RepositoryResult<()>;
    async fn unsubscribe_device(&self, link: DeviceNotification) -> RepositoryResult<()>;
    async fn list_device_subscriptions(
        &self,
        device_id: Uuid,
    ) -> RepositoryResult<Vec<Notification>>;
    async fn append_notification_history(
        &self,
        history: NotificationHistory,
    ) -> RepositoryResult<()>;
    async fn list_notification_history(
        &self,
        limit: usize,
    ) -> RepositoryResult<Vec<NotificationHistory>>;

    // --- On-duty & mutes ---

    async fn get_on_duty_config(&self) -> RepositoryResult<Option<OnDutyConfig>>;
    async fn set_on_duty_config(&self, config: OnDutyConfig) -> RepositoryResult<()>;
    /// Mutes active at `now`; expired rows are reaped as a side effect.
    async fn list_alarm_mutes(&self, now: DateTime<Utc>) -> RepositoryResult<Vec<AlarmMute>>;
    async fn create_alarm_mute(&self, mute: AlarmMute) -> RepositoryResult<AlarmMute>;
    async fn delete_alarm_mute(&self, id: Uuid) -> RepositoryResult<()>;

    // --- Settings ---

    async fn get_setting(&self, key: &str) -> RepositoryResult<Option<String>>;
    async fn set_setting(&self, key: &str, value: &str) -> RepositoryResult<()>;

    // --- Scan profiles ---

    async fn list_scan_profiles(&self) -> RepositoryResult<Vec<ScanProfile>>;
    async fn upsert_scan_profile(&self, profile: ScanProfile) -> RepositoryResult<ScanProfile>;
    async fn delete_scan_profile(&self, id: Uuid) -> RepositoryResult<()>;

    // --- Logs ---

    async fn append_log(&self, entry: LogEntry) -> RepositoryResult<()>;
    async fn list_logs(&self, limit: usize) -> RepositoryResult<Vec<LogEntry>>;
}
