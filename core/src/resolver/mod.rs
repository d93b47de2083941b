// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Dynamic connection resolver.
//!
//! Proxmox guests migrate between hosts; connections marked dynamic follow
//! them. After every Proxmox probe the resolver re-reads the VM inventory
//! and repoints the host end of each dynamic connection whose VM moved.
//! Resolution is eventually consistent: between a migration and the next
//! probe of the new host the connection may briefly point at the old one.

use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::repository::models::{
    Connection, Device, DynamicType, LogEntry, LogLevel, MonitoredEnd, ProxmoxVm,
};
use crate::repository::{Repository, RepositoryResult};

/// One applied migration
#[derive(Debug, Clone)]
pub struct Migration {
    pub connection_id: Uuid,
    pub vm_device_id: Uuid,
    pub from_host_device_id: Option<Uuid>,
    pub to_host_device_id: Uuid,
}

/// Repoints dynamic VM-to-host connections after migrations.
pub struct ConnectionResolver {
    repo: Arc<dyn Repository>,
}

impl ConnectionResolver {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    /// Re-resolve every dynamic connection against the current VM
    /// inventory. Called after each Proxmox probe.
    pub async fn resolve_all(&self) -> RepositoryResult<Vec<Migration>> {
        let vms = self.repo.list_all_proxmox_vms().await?;
        let dynamic = self.repo.list_dynamic_connections().await?;
        let mut migrations = Vec::new();

        for connection in dynamic {
            if connection.dynamic_type != Some(DynamicType::ProxmoxVmHost) {
                continue;
            }
            let Some(meta) = connection.dynamic_metadata.clone() else { continue };
            let vm_device = match self.repo.get_device(meta.vm_device_id).await {
                Ok(device) => device,
                Err(_) => continue,
            };
            let Some(vm) = locate_vm(&vms, &vm_device) else { continue };

            let current_host = vm.host_device_id;
            if meta.last_resolved_host_device_id == Some(current_host) {
                continue;
            }
            let connection_id = connection.id;
            match self.repoint(connection, current_host).await {
                Ok(()) => {
                    self.log_migration(&vm_device, meta.last_resolved_host_device_id, current_host)
                        .await?;
                    migrations.push(Migration {
                        connection_id,
                        vm_device_id: vm_device.id,
                        from_host_device_id: meta.last_resolved_host_device_id,
                        to_host_device_id: current_host,
                    });
                }
                Err(e) => {
                    warn!(vm = %vm_device.name, error = %e, "failed to repoint dynamic connection");
                }
            }
        }
        Ok(migrations)
    }

    /// Move the non-VM endpoint of `connection` to `new_host`.
    async fn repoint(&self, mut connection: Connection, new_host: Uuid) -> RepositoryResult<()> {
        let meta = connection
            .dynamic_metadata
            .as_mut()
            .expect("caller checked metadata");
        // `monitored_end` pins which endpoint is the VM; the other follows
        // the host.
        match meta.monitored_end {
            MonitoredEnd::Source => connection.target_device_id = new_host,
            MonitoredEnd::Target => connection.source_device_id = new_host,
        }
        meta.last_resolved_host_device_id = Some(new_host);
        self.repo.update_connection(connection).await?;
        Ok(())
    }

    async fn log_migration(
        &self,
        vm_device: &Device,
        from: Option<Uuid>,
        to: Uuid,
    ) -> RepositoryResult<()> {
        let from_name = match from {
            Some(id) => self.node_name(id).await,
            None => "(unresolved)".to_string(),
        };
        let to_name = self.node_name(to).await;
        info!(vm = %vm_device.name, from = %from_name, to = %to_name, "VM migrated");
        self.repo
            .append_log(LogEntry::new(
                "resolver",
                LogLevel::Info,
                format!("VM {} migrated: {} -> {}", vm_device.name, from_name, to_name),
            ))
            .await
    }

    /// Cluster node name for a host device, falling back to its display name.
    async fn node_name(&self, host_device_id: Uuid) -> String {
        if let Ok(nodes) = self.repo.list_proxmox_nodes().await {
            if let Some(node) = nodes.iter().find(|n| n.host_device_id == host_device_id) {
                return node.node_name.clone();
            }
        }
        match self.repo.get_device(host_device_id).await {
            Ok(device) => device.name,
            Err(_) => host_device_id.to_string(),
        }
    }
}

/// Find the inventory VM backing a device: by name first, then by IP.
fn locate_vm<'a>(vms: &'a [ProxmoxVm], vm_device: &Device) -> Option<&'a ProxmoxVm> {
    if let Some(by_name) = vms.iter().find(|vm| vm.name == vm_device.name) {
        return Some(by_name);
    }
    let ip = vm_device.ip?.to_string();
    vms.iter().find(|vm| vm.ip_addresses.iter().any(|a| a == &ip))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::models::*;
    use crate::repository::MemoryRepository;
    use chrono::Utc;

    fn vm_row(host: Uuid, name: &str) -> ProxmoxVm {
        ProxmoxVm {
            id: Uuid::new_v4(),
            host_device_id: host,
            vmid: 100,
            name: name.to_string(),
            vm_type: VmType::Qemu,
            status: VmStatus::Running,
            cpu_percent: None,
            memory_percent: None,
            ip_addresses: vec!["10.0.0.50".to_string()],
            mac_addresses: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_migration_repoints_connection() {
        let repo = Arc::new(MemoryRepository::new());
        let map = repo
            .upsert_map(MapRecord {
                id: Uuid::new_v4(),
                name: "dc".to_string(),
                is_default: true,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let host1 = repo
            .upsert_device(Device::new("pve1", DeviceKind::Proxmox, None))
            .await
            .unwrap();
        let host2 = repo
            .upsert_device(Device::new("pve2", DeviceKind::Proxmox, None))
            .await
            .unwrap();
        let vm_device = repo
            .upsert_device(Device::new("web", DeviceKind::GenericPing, None))
            .await
            .unwrap();

        let connection = repo
            .create_connection(Connection {
                id: Uuid::new_v4(),
                map_id: map.id,
                source_device_id: vm_device.id,
                target_device_id: host1.id,
                source_port: None,
                target_port: None,
                link_speed: LinkSpeed::TenGig,
                monitor_interface: None,
                monitor_snmp_index: None,
                link_stats: None,
                counter_state: None,
                is_dynamic: true,
                dynamic_type: Some(DynamicType::ProxmoxVmHost),
                dynamic_metadata: Some(DynamicMetadata {
                    vm_device_id: vm_device.id,
                    monitored_end: MonitoredEnd::Source,
                    last_resolved_host_device_id: Some(host1.id),
                }),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        // VM now reports on host2; host1 no longer has it.
        repo.replace_proxmox_vms(host1.id, Vec::new()).await.unwrap();
        repo.replace_proxmox_vms(host2.id, vec![vm_row(host2.id, "web")])
            .await
            .unwrap();

        let resolver = ConnectionResolver::new(repo.clone());
        let migrations = resolver.resolve_all().await.unwrap();
        assert_eq!(migrations.len(), 1);
        assert_eq!(migrations[0].to_host_device_id, host2.id);

        let updated = repo.get_connection(connection.id).await.unwrap();
        assert_eq!(updated.target_device_id, host2.id);
        assert_eq!(updated.source_device_id, vm_device.id);
        assert_eq!(
            updated.dynamic_metadata.unwrap().last_resolved_host_device_id,
            Some(host2.id)
        );

        // A migration log row was written.
        let logs = repo.list_logs(10).await.unwrap();
        assert!(logs.iter().any(|l| l.source == "resolver"));

        // Re-resolving is a no-op.
        let migrations = resolver.resolve_all().await.unwrap();
        assert!(migrations.is_empty());
    }

    #[tokio::test]
    async fn test_vm_located_by_ip_when_name_differs() {
        let repo = Arc::new(MemoryRepository::new());
        let host = repo
            .upsert_device(Device::new("pve1", DeviceKind::Proxmox, None))
            .await
            .unwrap();
        repo.replace_proxmox_vms(host.id, vec![vm_row(host.id, "vm-100")])
            .await
            .unwrap();

        let device = Device::new("differently-named", DeviceKind::GenericPing, Some("10.0.0.50".parse().unwrap()));
        let vms = repo.list_all_proxmox_vms().await.unwrap();
        let located = locate_vm(&vms, &device).unwrap();
        assert_eq!(located.vmid, 100);
    }
}
