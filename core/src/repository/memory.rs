// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! In-memory repository implementation.
//!
//! Backs the default server, tests, and demos. All state lives behind a
//! single `RwLock`; no method awaits while holding it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use super::error::{RepositoryError, RepositoryResult};
use super::models::*;
use super::{PurgeStats, Repository};

#[derive(Default)]
struct Inner {
    devices: HashMap<Uuid, Device>,
    credential_profiles: HashMap<Uuid, CredentialProfile>,
    maps: HashMap<Uuid, MapRecord>,
    placements: HashMap<Uuid, DevicePlacement>,
    connections: HashMap<Uuid, Connection>,
    proxmox_nodes: HashMap<(String, String), ProxmoxNode>,
    proxmox_vms: HashMap<Uuid, Vec<ProxmoxVm>>,
    status_events: HashMap<Uuid, Vec<DeviceStatusEvent>>,
    device_metrics: HashMap<Uuid, Vec<DeviceMetricsSample>>,
    prometheus_metrics: HashMap<Uuid, Vec<PrometheusMetricSample>>,
    bandwidth: HashMap<Uuid, Vec<BandwidthSample>>,
    notifications: HashMap<Uuid, Notification>,
    subscriptions: Vec<DeviceNotification>,
    notification_history: Vec<NotificationHistory>,
    on_duty: Option<OnDutyConfig>,
    alarm_mutes: HashMap<Uuid, AlarmMute>,
    settings: HashMap<String, String>,
    scan_profiles: HashMap<Uuid, ScanProfile>,
    logs: Vec<LogEntry>,
}

/// Lock-guarded map store implementing [`Repository`].
#[derive(Default)]
pub struct MemoryRepository {
    inner: RwLock<Inner>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    /// Remove everything referencing the given device.
    fn cascade_device(&mut self, id: Uuid) {
        self.placements.retain(|_, p| p.device_id != id);
        self.connections
            .retain(|_, c| c.source_device_id != id && c.target_device_id != id);
        self.subscriptions.retain(|s| s.device_id != id);
        self.proxmox_nodes.retain(|_, n| n.host_device_id != id);
        self.proxmox_vms.remove(&id);
        self.status_events.remove(&id);
        self.device_metrics.remove(&id);
        self.prometheus_metrics.remove(&id);
    }

    fn cascade_map(&mut self, id: Uuid) {
        self.placements.retain(|_, p| p.map_id != id);
        self.connections.retain(|_, c| c.map_id != id);
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn list_devices(&self) -> RepositoryResult<Vec<Device>> {
        let inner = self.inner.read();
        let mut devices: Vec<_> = inner.devices.values().cloned().collect();
        devices.sort_by_key(|d| d.created_at);
        Ok(devices)
    }

    async fn list_devices_on_map(&self, map_id: Uuid) -> RepositoryResult<Vec<Device>> {
        let inner = self.inner.read();
        let mut devices: Vec<_> = inner
            .placements
            .values()
            .filter(|p| p.map_id == map_id)
            .filter_map(|p| inner.devices.get(&p.device_id).cloned())
            .collect();
        devices.sort_by_key(|d| d.created_at);
        Ok(devices)
    }

    async fn get_device(&self, id: Uuid) -> RepositoryResult<Device> {
        self.inner
            .read()
            .devices
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("device {id}")))
    }

    async fn upsert_device(&self, mut device: Device) -> RepositoryResult<Device> {
        device.updated_at = Utc::now();
        self.inner.write().devices.insert(device.id, device.clone());
        Ok(device)
    }

    async fn delete_device(&self, id: Uuid) -> RepositoryResult<()> {
        let mut inner = self.inner.write();
        if inner.devices.remove(&id).is_none() {
            return Err(RepositoryError::NotFound(format!("device {id}")));
        }
        inner.cascade_device(id);
        Ok(())
    }

    async fn count_licensed_devices(&self) -> RepositoryResult<usize> {
        Ok(self
            .inner
            .read()
            .devices
            .values()
            .filter(|d| !d.kind.is_placeholder())
            .count())
    }

    async fn list_credential_profiles(&self) -> RepositoryResult<Vec<CredentialProfile>> {
        let mut profiles: Vec<_> = self
            .inner
            .read()
            .credential_profiles
            .values()
            .cloned()
            .collect();
        profiles.sort_by_key(|p| p.created_at);
        Ok(profiles)
    }

    async fn get_credential_profile(&self, id: Uuid) -> RepositoryResult<CredentialProfile> {
        self.inner
            .read()
            .credential_profiles
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("credential profile {id}")))
    }

    async fn upsert_credential_profile(
        &self,
        profile: CredentialProfile,
    ) -> RepositoryResult<CredentialProfile> {
        self.inner
            .write()
            .credential_profiles
            .insert(profile.id, profile.clone());
        Ok(profile)
    }

    async fn delete_credential_profile(&self, id: Uuid) -> RepositoryResult<()> {
        let mut inner = self.inner.write();
        if inner.credential_profiles.remove(&id).is_none() {
            return Err(RepositoryError::NotFound(format!("credential profile {id}")));
        }
        for device in inner.devices.values_mut() {
            if device.credential_profile_id == Some(id) {
                device.credential_profile_id = None;
            }
        }
        Ok(())
    }

    async fn list_maps(&self) -> RepositoryResult<Vec<MapRecord>> {
        let mut maps: Vec<_> = self.inner.read().maps.values().cloned().collect();
        maps.sort_by_key(|m| m.created_at);
        Ok(maps)
    }

    async fn get_map(&self, id: Uuid) -> RepositoryResult<MapRecord> {
        self.inner
            .read()
            .maps
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("map {id}")))
    }

    async fn upsert_map(&self, map: MapRecord) -> RepositoryResult<MapRecord> {
        let mut inner = self.inner.write();
        if map.is_default {
            for other in inner.maps.values_mut() {
                other.is_default = false;
            }
        }
        inner.maps.insert(map.id, map.clone());
        Ok(map)
    }

    async fn delete_map(&self, id: Uuid) -> RepositoryResult<()> {
        let mut inner = self.inner.write();
        if inner.maps.remove(&id).is_none() {
            return Err(RepositoryError::NotFound(format!("map {id}")));
        }
        inner.cascade_map(id);
        Ok(())
    }

    async fn list_placements(&self, map_id: Uuid) -> RepositoryResult<Vec<DevicePlacement>> {
        Ok(self
            .inner
            .read()
            .placements
            .values()
            .filter(|p| p.map_id == map_id)
            .cloned()
            .collect())
    }

    async fn get_placement(&self, id: Uuid) -> RepositoryResult<DevicePlacement> {
        self.inner
            .read()
            .placements
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("placement {id}")))
    }

    async fn upsert_placement(
        &self,
        placement: DevicePlacement,
    ) -> RepositoryResult<DevicePlacement> {
        let mut inner = self.inner.write();
        if !inner.devices.contains_key(&placement.device_id) {
            return Err(RepositoryError::ConstraintViolation(format!(
                "device {} does not exist",
                placement.device_id
            )));
        }
        if !inner.maps.contains_key(&placement.map_id) {
            return Err(RepositoryError::ConstraintViolation(format!(
                "map {} does not exist",
                placement.map_id
            )));
        }
        // (device, map) is unique: an existing placement moves instead.
        let existing = inner
            .placements
            .values()
            .find(|p| {
                p.device_id == placement.device_id
                    && p.map_id == placement.map_id
                    && p.id != placement.id
            })
            .map(|p| p.id);
        if let Some(old) = existing {
            inner.placements.remove(&old);
        }
        inner.placements.insert(placement.id, placement.clone());
        Ok(placement)
    }

    async fn delete_placement(&self, id: Uuid) -> RepositoryResult<()> {
        if self.inner.write().placements.remove(&id).is_none() {
            return Err(RepositoryError::NotFound(format!("placement {id}")));
        }
        Ok(())
    }

    async fn list_connections(&self, map_id: Option<Uuid>) -> RepositoryResult<Vec<Connection>> {
        let mut connections: Vec<_> = self
            .inner
            .read()
            .connections
            .values()
            .filter(|c| map_id.map_or(true, |m| c.map_id == m))
            .cloned()
            .collect();
        connections.sort_by_key(|c| c.created_at);
        Ok(connections)
    }

    async fn get_connection(&self, id: Uuid) -> RepositoryResult<Connection> {
        self.inner
            .read()
            .connections
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("connection {id}")))
    }

    async fn create_connection(&self, connection: Connection) -> RepositoryResult<Connection> {
        let mut inner = self.inner.write();
        for endpoint in [connection.source_device_id, connection.target_device_id] {
            if !inner.devices.contains_key(&endpoint) {
                return Err(RepositoryError::ConstraintViolation(format!(
                    "device {endpoint} does not exist"
                )));
            }
        }
        let key = connection.endpoint_key();
        if inner.connections.values().any(|c| c.endpoint_key() == key) {
            return Err(RepositoryError::DuplicateKey(
                "a connection between these endpoints already exists".to_string(),
            ));
        }
        inner.connections.insert(connection.id, connection.clone());
        Ok(connection)
    }

    async fn update_connection(&self, mut connection: Connection) -> RepositoryResult<Connection> {
        let mut inner = self.inner.write();
        if !inner.connections.contains_key(&connection.id) {
            return Err(RepositoryError::NotFound(format!(
                "connection {}",
                connection.id
            )));
        }
        let key = connection.endpoint_key();
        if inner
            .connections
            .values()
            .any(|c| c.id != connection.id && c.endpoint_key() == key)
        {
            return Err(RepositoryError::DuplicateKey(
                "a connection between these endpoints already exists".to_string(),
            ));
        }
        connection.updated_at = Utc::now();
        inner.connections.insert(connection.id, connection.clone());
        Ok(connection)
    }

    async fn delete_connection(&self, id: Uuid) -> RepositoryResult<()> {
        let mut inner = self.inner.write();
        if inner.connections.remove(&id).is_none() {
            return Err(RepositoryError::NotFound(format!("connection {id}")));
        }
        inner.bandwidth.remove(&id);
        Ok(())
    }

    async fn list_connections_monitoring(
        &self,
        device_id: Uuid,
    ) -> RepositoryResult<Vec<Connection>> {
        Ok(self
            .inner
            .read()
            .connections
            .values()
            .filter(|c| match c.monitor_interface {
                Some(MonitoredEnd::Source) => c.source_device_id == device_id,
                Some(MonitoredEnd::Target) => c.target_device_id == device_id,
                None => false,
            })
            .cloned()
            .collect())
    }

    async fn list_dynamic_connections(&self) -> RepositoryResult<Vec<Connection>> {
        Ok(self
            .inner
            .read()
            .connections
            .values()
            .filter(|c| c.is_dynamic)
            .cloned()
            .collect())
    }

    async fn upsert_proxmox_node(&self, node: ProxmoxNode) -> RepositoryResult<ProxmoxNode> {
        self.inner.write().proxmox_nodes.insert(
            (node.cluster_name.clone(), node.node_name.clone()),
            node.clone(),
        );
        Ok(node)
    }

    async fn list_proxmox_nodes(&self) -> RepositoryResult<Vec<ProxmoxNode>> {
        Ok(self.inner.read().proxmox_nodes.values().cloned().collect())
    }

    async fn replace_proxmox_vms(
        &self,
        host_device_id: Uuid,
        vms: Vec<ProxmoxVm>,
    ) -> RepositoryResult<()> {
        self.inner.write().proxmox_vms.insert(host_device_id, vms);
        Ok(())
    }

    async fn list_proxmox_vms(&self, host_device_id: Uuid) -> RepositoryResult<Vec<ProxmoxVm>> {
        Ok(self
            .inner
            .read()
            .proxmox_vms
            .get(&host_device_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_all_proxmox_vms(&self) -> RepositoryResult<Vec<ProxmoxVm>> {
        Ok(self
            .inner
            .read()
            .proxmox_vms
            .values()
            .flatten()
            .cloned()
            .collect())
    }

    async fn record_status_event(&self, event: DeviceStatusEvent) -> RepositoryResult<()> {
        let mut inner = self.inner.write();
        if !inner.devices.contains_key(&event.device_id) {
            return Err(RepositoryError::ConstraintViolation(format!(
                "device {} does not exist",
                event.device_id
            )));
        }
        let events = inner.status_events.entry(event.device_id).or_default();
        if let Some(last) = events.last() {
            if last.new_status != event.previous_status {
                return Err(RepositoryError::InvalidInput(format!(
                    "status chain broken: expected previous {:?}, got {:?}",
                    last.new_status, event.previous_status
                )));
            }
            if last.created_at > event.created_at {
                return Err(RepositoryError::InvalidInput(
                    "status event timestamps must not decrease".to_string(),
                ));
            }
        }
        events.push(event);
        Ok(())
    }

    async fn list_status_events(
        &self,
        device_id: Uuid,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        include_warnings: bool,
    ) -> RepositoryResult<Vec<DeviceStatusEvent>> {
        Ok(self
            .inner
            .read()
            .status_events
            .get(&device_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.created_at >= since && e.created_at <= until)
                    .filter(|e| {
                        include_warnings
                            || (e.new_status != DeviceStatus::Warning
                                && e.previous_status != DeviceStatus::Warning)
                            || e.new_status == DeviceStatus::Offline
                            || e.previous_status == DeviceStatus::Offline
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_status_events_until(
        &self,
        device_id: Uuid,
        until: DateTime<Utc>,
    ) -> RepositoryResult<Vec<DeviceStatusEvent>> {
        Ok(self
            .inner
            .read()
            .status_events
            .get(&device_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.created_at <= until)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn append_metrics_sample(&self, sample: DeviceMetricsSample) -> RepositoryResult<()> {
        self.inner
            .write()
            .device_metrics
            .entry(sample.device_id)
            .or_default()
            .push(sample);
        Ok(())
    }

    async fn list_metrics_samples(
        &self,
        device_id: Uuid,
        since: DateTime<Utc>,
    ) -> RepositoryResult<Vec<DeviceMetricsSample>> {
        Ok(self
            .inner
            .read()
            .device_metrics
            .get(&device_id)
            .map(|samples| {
                samples
                    .iter()
                    .filter(|s| s.timestamp >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn append_prometheus_sample(
        &self,
        sample: PrometheusMetricSample,
    ) -> RepositoryResult<()> {
        self.inner
            .write()
            .prometheus_metrics
            .entry(sample.device_id)
            .or_default()
            .push(sample);
        Ok(())
    }

    async fn list_prometheus_samples(
        &self,
        device_id: Uuid,
        metric_id: &str,
        since: DateTime<Utc>,
    ) -> RepositoryResult<Vec<PrometheusMetricSample>> {
        Ok(self
            .inner
            .read()
            .prometheus_metrics
            .get(&device_id)
            .map(|samples| {
                samples
                    .iter()
                    .filter(|s| s.metric_id == metric_id && s.timestamp >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn append_bandwidth_sample(&self, sample: BandwidthSample) -> RepositoryResult<()> {
        self.inner
            .write()
            .bandwidth
            .entry(sample.connection_id)
            .or_default()
            .push(sample);
        Ok(())
    }

    async fn list_bandwidth_samples(
        &self,
        connection_id: Uuid,
        since: DateTime<Utc>,
    ) -> RepositoryResult<Vec<BandwidthSample>> {
        Ok(self
            .inner
            .read()
            .bandwidth
            .get(&connection_id)
            .map(|samples| {
                samples
                    .iter()
                    .filter(|s| s.timestamp >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> RepositoryResult<PurgeStats> {
        let mut inner = self.inner.write();
        let mut stats = PurgeStats::default();
        for samples in inner.device_metrics.values_mut() {
            let before = samples.len();
            samples.retain(|s| s.timestamp >= cutoff);
            stats.device_metrics += before - samples.len();
        }
        for samples in inner.prometheus_metrics.values_mut() {
            let before = samples.len();
            samples.retain(|s| s.timestamp >= cutoff);
            stats.prometheus_metrics += before - samples.len();
        }
        for samples in inner.bandwidth.values_mut() {
            let before = samples.len();
            samples.retain(|s| s.timestamp >= cutoff);
            stats.bandwidth += before - samples.len();
        }
        // Keep at least the newest event per device so the status chain and
        // segment derivation stay anchored.
        for events in inner.status_events.values_mut() {
            let before = events.len();
            if events.len() > 1 {
                let last = events.last().cloned();
                events.retain(|e| e.created_at >= cutoff);
                if events.is_empty() {
                    if let Some(last) = last {
                        events.push(last);
                    }
                }
            }
            stats.status_events += before - events.len();
        }
        Ok(stats)
    }

    async fn list_notifications(&self) -> RepositoryResult<Vec<Notification>> {
        let mut notifications: Vec<_> =
            self.inner.read().notifications.values().cloned().collect();
        notifications.sort_by_key(|n| n.created_at);
        Ok(notifications)
    }

    async fn get_notification(&self, id: Uuid) -> RepositoryResult<Notification> {
        self.inner
            .read()
            .notifications
            .get(&id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("notification {id}")))
    }

    async fn upsert_notification(
        &self,
        notification: Notification,
    ) -> RepositoryResult<Notification> {
        self.inner
            .write()
            .notifications
            .insert(notification.id, notification.clone());
        Ok(notification)
    }

    async fn delete_notification(&self, id: Uuid) -> RepositoryResult<()> {
        let mut inner = self.inner.write();
        if inner.notifications.remove(&id).is_none() {
            return Err(RepositoryError::NotFound(format!("notification {id}")));
        }
        inner.subscriptions.retain(|s| s.notification_id != id);
        Ok(())
    }

    async fn subscribe_device(&self, link: DeviceNotification) -> RepositoryResult<()> {
        let mut inner = self.inner.write();
        if !inner.devices.contains_key(&link.device_id) {
            return Err(RepositoryError::ConstraintViolation(format!(
                "device {} does not exist",
                link.device_id
            )));
        }
        if !inner.notifications.contains_key(&link.notification_id) {
            return Err(RepositoryError::ConstraintViolation(format!(
                "notification {} does not exist",
                link.notification_id
            )));
        }
        if !inner
            .subscriptions
            .iter()
            .any(|s| s.device_id == link.device_id && s.notification_id == link.notification_id)
        {
            inner.subscriptions.push(link);
        }
        Ok(())
    }

    async fn unsubscribe_device(&self, link: DeviceNotification) -> RepositoryResult<()> {
        self.inner
            .write()
            .subscriptions
            .retain(|s| !(s.device_id == link.device_id && s.notification_id == link.notification_id));
        Ok(())
    }

    async fn list_device_subscriptions(
        &self,
        device_id: Uuid,
    ) -> RepositoryResult<Vec<Notification>> {
        let inner = self.inner.read();
        Ok(inner
            .subscriptions
            .iter()
            .filter(|s| s.device_id == device_id)
            .filter_map(|s| inner.notifications.get(&s.notification_id).cloned())
            .collect())
    }

    async fn append_notification_history(
        &self,
        history: NotificationHistory,
    ) -> RepositoryResult<()> {
        self.inner.write().notification_history.push(history);
        Ok(())
    }

    async fn list_notification_history(
        &self,
        limit: usize,
    ) -> RepositoryResult<Vec<NotificationHistory>> {
        let inner = self.inner.read();
        let mut history: Vec<_> = inner.notification_history.iter().cloned().collect();
        history.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        history.truncate(limit);
        Ok(history)
    }

    async fn get_on_duty_config(&self) -> RepositoryResult<Option<OnDutyConfig>> {
        Ok(self.inner.read().on_duty.clone())
    }

    async fn set_on_duty_config(&self, config: OnDutyConfig) -> RepositoryResult<()> {
        self.inner.write().on_duty = Some(config);
        Ok(())
    }

    async fn list_alarm_mutes(&self, now: DateTime<Utc>) -> RepositoryResult<Vec<AlarmMute>> {
        let mut inner = self.inner.write();
        inner.alarm_mutes.retain(|_, m| m.is_active(now));
        Ok(inner.alarm_mutes.values().cloned().collect())
    }

    async fn create_alarm_mute(&self, mute: AlarmMute) -> RepositoryResult<AlarmMute> {
        self.inner.write().alarm_mutes.insert(mute.id, mute.clone());
        Ok(mute)
    }

    async fn delete_alarm_mute(&self, id: Uuid) -> RepositoryResult<()> {
        if self.inner.write().alarm_mutes.remove(&id).is_none() {
            return Err(RepositoryError::NotFound(format!("alarm mute {id}")));
        }
        Ok(())
    }

    async fn get_setting(&self, key: &str) -> RepositoryResult<Option<String>> {
        Ok(self.inner.read().settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &str) -> RepositoryResult<()> {
        self.inner
            .write()
            .settings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn list_scan_profiles(&self) -> RepositoryResult<Vec<ScanProfile>> {
        let mut profiles: Vec<_> = self.inner.read().scan_profiles.values().cloned().collect();
        profiles.sort_by_key(|p| p.created_at);
        Ok(profiles)
    }

    async fn upsert_scan_profile(&self, profile: ScanProfile) -> RepositoryResult<ScanProfile> {
        self.inner
            .write()
            .scan_profiles
            .insert(profile.id, profile.clone());
        Ok(profile)
    }

    async fn delete_scan_profile(&self, id: Uuid) -> RepositoryResult<()> {
        if self.inner.write().scan_profiles.remove(&id).is_none() {
            return Err(RepositoryError::NotFound(format!("scan profile {id}")));
        }
        Ok(())
    }

    async fn append_log(&self, entry: LogEntry) -> RepositoryResult<()> {
        self.inner.write().logs.push(entry);
        Ok(())
    }

    async fn list_logs(&self, limit: usize) -> RepositoryResult<Vec<LogEntry>> {
        let inner = self.inner.read();
        let mut logs: Vec<_> = inner.logs.iter().cloned().collect();
        logs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        logs.truncate(limit);
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn device(kind: DeviceKind) -> Device {
        Device::new("test-device", kind, Some("10.0.0.1".parse().unwrap()))
    }

    fn connection(map_id: Uuid, source: Uuid, target: Uuid) -> Connection {
        Connection {
            id: Uuid::new_v4(),
            map_id,
            source_device_id: source,
            target_device_id: target,
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
        }
    }

    #[tokio::test]
    async fn test_device_crud_and_license_count() {
        let repo = MemoryRepository::new();
        let d1 = repo.upsert_device(device(DeviceKind::MikrotikRouter)).await.unwrap();
        repo.upsert_device(device(DeviceKind::Placeholder)).await.unwrap();

        assert_eq!(repo.list_devices().await.unwrap().len(), 2);
        assert_eq!(repo.count_licensed_devices().await.unwrap(), 1);

        repo.delete_device(d1.id).await.unwrap();
        assert!(repo.get_device(d1.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_reverse_duplicate_connection_rejected() {
        let repo = MemoryRepository::new();
        let map = repo
            .upsert_map(MapRecord {
                id: Uuid::new_v4(),
                name: "main".to_string(),
                is_default: true,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let a = repo.upsert_device(device(DeviceKind::MikrotikRouter)).await.unwrap();
        let b = repo.upsert_device(device(DeviceKind::GenericSnmp)).await.unwrap();

        repo.create_connection(connection(map.id, a.id, b.id)).await.unwrap();

        let mut reversed = connection(map.id, b.id, a.id);
        reversed.source_port = Some("ether2".to_string());
        reversed.target_port = Some("ether1".to_string());
        let err = repo.create_connection(reversed).await.unwrap_err();
        assert!(err.is_duplicate_key());
    }

    #[tokio::test]
    async fn test_device_delete_cascades() {
        let repo = MemoryRepository::new();
        let map = repo
            .upsert_map(MapRecord {
                id: Uuid::new_v4(),
                name: "main".to_string(),
                is_default: false,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let a = repo.upsert_device(device(DeviceKind::MikrotikRouter)).await.unwrap();
        let b = repo.upsert_device(device(DeviceKind::GenericSnmp)).await.unwrap();
        repo.upsert_placement(DevicePlacement {
            id: Uuid::new_v4(),
            device_id: a.id,
            map_id: map.id,
            x: 10.0,
            y: 20.0,
        })
        .await
        .unwrap();
        repo.create_connection(connection(map.id, a.id, b.id)).await.unwrap();

        repo.delete_device(a.id).await.unwrap();

        assert!(repo.list_placements(map.id).await.unwrap().is_empty());
        assert!(repo.list_connections(Some(map.id)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_event_chain_enforced() {
        let repo = MemoryRepository::new();
        let d = repo.upsert_device(device(DeviceKind::GenericPing)).await.unwrap();
        let now = Utc::now();

        repo.record_status_event(DeviceStatusEvent {
            id: Uuid::new_v4(),
            device_id: d.id,
            previous_status: DeviceStatus::Unknown,
            new_status: DeviceStatus::Online,
            created_at: now,
            message: None,
        })
        .await
        .unwrap();

        // Chain break: previous_status must equal the last new_status.
        let err = repo
            .record_status_event(DeviceStatusEvent {
                id: Uuid::new_v4(),
                device_id: d.id,
                previous_status: DeviceStatus::Offline,
                new_status: DeviceStatus::Online,
                created_at: now + Duration::seconds(30),
                message: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::InvalidInput(_)));

        repo.record_status_event(DeviceStatusEvent {
            id: Uuid::new_v4(),
            device_id: d.id,
            previous_status: DeviceStatus::Online,
            new_status: DeviceStatus::Warning,
            created_at: now + Duration::seconds(30),
            message: None,
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_purge_keeps_latest_status_event() {
        let repo = MemoryRepository::new();
        let d = repo.upsert_device(device(DeviceKind::GenericPing)).await.unwrap();
        let old = Utc::now() - Duration::hours(48);

        for (i, (prev, next)) in [
            (DeviceStatus::Unknown, DeviceStatus::Online),
            (DeviceStatus::Online, DeviceStatus::Warning),
        ]
        .iter()
        .enumerate()
        {
            repo.record_status_event(DeviceStatusEvent {
                id: Uuid::new_v4(),
                device_id: d.id,
                previous_status: *prev,
                new_status: *next,
                created_at: old + Duration::seconds(i as i64),
                message: None,
            })
            .await
            .unwrap();
        }
        repo.append_metrics_sample(DeviceMetricsSample {
            device_id: d.id,
            cpu_percent: Some(10.0),
            memory_percent: None,
            disk_percent: None,
            ping_rtt_ms: None,
            uptime_seconds: None,
            timestamp: old,
        })
        .await
        .unwrap();

        let stats = repo
            .purge_older_than(Utc::now() - Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(stats.device_metrics, 1);
        assert_eq!(stats.status_events, 1);

        let remaining = repo
            .list_status_events_until(d.id, Utc::now())
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].new_status, DeviceStatus::Warning);
    }

    #[tokio::test]
    async fn test_expired_mutes_reaped_on_list() {
        let repo = MemoryRepository::new();
        let now = Utc::now();
        repo.create_alarm_mute(AlarmMute {
            id: Uuid::new_v4(),
            user_id: None,
            muted_by: "admin".to_string(),
            mute_until: Some(now - Duration::minutes(5)),
            reason: None,
            created_at: now - Duration::hours(1),
        })
        .await
        .unwrap();
        repo.create_alarm_mute(AlarmMute {
            id: Uuid::new_v4(),
            user_id: None,
            muted_by: "admin".to_string(),
            mute_until: Some(now + Duration::hours(1)),
            reason: None,
            created_at: now,
        })
        .await
        .unwrap();

        let active = repo.list_alarm_mutes(now).await.unwrap();
        assert_eq!(active.len(), 1);
    }
}
