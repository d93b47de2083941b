// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! REST endpoints.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use super::error::{ApiError, ApiResult};
use super::models::*;
use super::websocket;
use super::AppState;
use crate::license::DeviceAllowance;
use crate::notify::shifts;
use crate::realtime::{ChangeAction, ChangeType, MapChange};
use crate::repository::models::*;
use crate::scan::ScanRequest;
use crate::status;

/// Assemble the full router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        // Devices
        .route("/api/devices", get(list_devices).post(create_device))
        .route("/api/devices/batch", post(batch_create_devices))
        .route(
            "/api/devices/:id",
            get(get_device).patch(update_device).delete(delete_device),
        )
        .route("/api/devices/:id/probe", post(trigger_probe))
        .route(
            "/api/devices/:id/metrics-history/aggregated",
            get(device_metrics_history),
        )
        .route("/api/devices/:id/status-segments", get(device_status_segments))
        .route("/api/devices/:id/status-events", get(device_status_events))
        .route("/api/devices/:id/proxmox-vms", get(device_proxmox_vms))
        .route(
            "/api/devices/:id/notifications",
            get(list_device_notifications),
        )
        .route(
            "/api/devices/:id/notifications/:notification_id",
            post(subscribe_notification).delete(unsubscribe_notification),
        )
        // Connections
        .route("/api/connections", get(list_connections).post(create_connection))
        .route(
            "/api/connections/:id",
            get(get_connection).patch(update_connection).delete(delete_connection),
        )
        .route(
            "/api/connections/:id/bandwidth-history/aggregated",
            get(connection_bandwidth_history),
        )
        // Maps & placements
        .route("/api/maps", get(list_maps).post(create_map))
        .route("/api/maps/:id", delete(delete_map))
        .route("/api/placements", get(list_placements).post(upsert_placement))
        .route("/api/placements/:id", delete(delete_placement))
        // Credential profiles
        .route(
            "/api/credential-profiles",
            get(list_credential_profiles).post(create_credential_profile),
        )
        .route("/api/credential-profiles/:id", delete(delete_credential_profile))
        // Notifications
        .route(
            "/api/notifications",
            get(list_notifications).post(create_notification),
        )
        .route("/api/notifications/:id", delete(delete_notification))
        .route("/api/notification-history", get(notification_history))
        // On-duty & mutes
        .route("/api/duty-on-call", get(duty_on_call))
        .route("/api/duty-schedule", get(get_duty_schedule).put(put_duty_schedule))
        .route("/api/alarm-mutes", get(list_alarm_mutes).post(create_alarm_mute))
        .route("/api/alarm-mutes/:id", delete(delete_alarm_mute))
        // Settings
        .route("/api/settings/:key", get(get_setting).put(put_setting))
        // Scanner
        .route("/api/network-scan", post(network_scan))
        .route("/api/network-scan-stream", get(websocket::network_scan_stream))
        .route("/api/scan-profiles", get(list_scan_profiles).post(create_scan_profile))
        .route("/api/scan-profiles/:id", delete(delete_scan_profile))
        // Logs & license
        .route("/api/logs", get(list_logs))
        .route("/api/license", get(license_summary))
        // Realtime bus
        .route("/ws", get(websocket::ws_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

/// Originating user for map-change attribution (auth is an external
/// collaborator; the UI passes the session user through this header).
fn user_from_headers(headers: &HeaderMap) -> Option<Uuid> {
    headers.get("x-user-id")?.to_str().ok()?.parse().ok()
}

fn publish_change(
    state: &AppState,
    headers: &HeaderMap,
    map_id: Uuid,
    change_type: ChangeType,
    action: ChangeAction,
) {
    state.hub.publish(MapChange {
        map_id,
        change_type,
        action,
        timestamp: Utc::now(),
        user_id: user_from_headers(headers),
    });
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// --- Devices ---

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MapFilter {
    map_id: Option<Uuid>,
}

async fn list_devices(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<MapFilter>,
) -> ApiResult<Json<Vec<Device>>> {
    let devices = match filter.map_id {
        Some(map_id) => state.repo.list_devices_on_map(map_id).await?,
        None => state.repo.list_devices().await?,
    };
    Ok(Json(devices))
}

async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Device>> {
    Ok(Json(state.repo.get_device(id).await?))
}

fn device_from_request(request: CreateDeviceRequest) -> ApiResult<Device> {
    if request.name.trim().is_empty() {
        return Err(ApiError::bad_field("name must not be empty", "name"));
    }
    let mut device = Device::new(request.name, request.kind, request.ip);
    device.credential_profile_id = request.credential_profile_id;
    device.custom_credentials = request.custom_credentials;
    device.use_on_duty = request.use_on_duty;
    Ok(device)
}

/// Gate a create of `delta` licensed devices, leaving a log row on refusal.
async fn gate_capacity(state: &AppState, delta: usize) -> ApiResult<()> {
    let current = state.repo.count_licensed_devices().await?;
    if let Err(e) = state.license.ensure_capacity(current, delta) {
        let _ = state
            .repo
            .append_log(LogEntry::new("license", LogLevel::Warning, e.to_string()))
            .await;
        return Err(e.into());
    }
    Ok(())
}

async fn create_device(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateDeviceRequest>,
) -> ApiResult<Json<Device>> {
    if !request.kind.is_placeholder() {
        gate_capacity(&state, 1).await?;
    }
    let device = device_from_request(request)?;
    Ok(Json(state.repo.upsert_device(device).await?))
}

async fn batch_create_devices(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BatchCreateRequest>,
) -> ApiResult<Json<Vec<Device>>> {
    let licensed = request
        .devices
        .iter()
        .filter(|d| !d.kind.is_placeholder())
        .count();
    if licensed > 0 {
        gate_capacity(&state, licensed).await?;
    }

    let mut created = Vec::with_capacity(request.devices.len());
    for entry in request.devices {
        let device = device_from_request(entry)?;
        created.push(state.repo.upsert_device(device).await?);
    }
    Ok(Json(created))
}

async fn update_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateDeviceRequest>,
) -> ApiResult<Json<Device>> {
    let mut device = state.repo.get_device(id).await?;
    if let Some(name) = request.name {
        if name.trim().is_empty() {
            return Err(ApiError::bad_field("name must not be empty", "name"));
        }
        device.name = name;
    }
    if let Some(kind) = request.kind {
        // Growing the licensed set by converting a placeholder is gated too.
        if device.kind.is_placeholder() && !kind.is_placeholder() {
            gate_capacity(&state, 1).await?;
        }
        device.kind = kind;
    }
    if let Some(ip) = request.ip {
        device.ip = Some(ip);
    }
    if let Some(profile_id) = request.credential_profile_id {
        device.credential_profile_id = Some(profile_id);
    }
    if let Some(custom) = request.custom_credentials {
        device.custom_credentials = Some(custom);
    }
    if let Some(use_on_duty) = request.use_on_duty {
        device.use_on_duty = use_on_duty;
    }
    Ok(Json(state.repo.upsert_device(device).await?))
}

async fn delete_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    state.repo.delete_device(id).await?;
    state.engine.forget(id);
    Ok(Json(json!({ "deleted": id })))
}

async fn trigger_probe(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    state
        .scheduler
        .trigger_once(id)
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(Json(json!({ "probed": id })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetricsHistoryQuery {
    since: Option<chrono::DateTime<Utc>>,
    max_points: Option<usize>,
    #[serde(default)]
    extremes: bool,
}

async fn device_metrics_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<MetricsHistoryQuery>,
) -> ApiResult<Json<Vec<status::AggregatedMetricsPoint>>> {
    state.repo.get_device(id).await?;
    let since = query.since.unwrap_or_else(|| Utc::now() - chrono::Duration::hours(24));
    let samples = state.repo.list_metrics_samples(id, since).await?;
    let points = status::aggregate_metrics(&samples, query.max_points.unwrap_or(300), query.extremes);
    Ok(Json(points))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RangeQuery {
    range: String,
    #[serde(default)]
    include_warnings: bool,
}

async fn device_status_segments(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<RangeQuery>,
) -> ApiResult<Json<StatusSegmentsResponse>> {
    state.repo.get_device(id).await?;
    let until = Utc::now();
    let since = until - parse_range(&query.range)?;
    let events = state.repo.list_status_events_until(id, until).await?;
    let segments = status::derive_segments(&events, since, until);
    let online_ratio = status::online_ratio(&segments);
    Ok(Json(StatusSegmentsResponse {
        segments,
        online_ratio,
    }))
}

async fn device_status_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<RangeQuery>,
) -> ApiResult<Json<Vec<DeviceStatusEvent>>> {
    state.repo.get_device(id).await?;
    let until = Utc::now();
    let since = until - parse_range(&query.range)?;
    let events = state
        .repo
        .list_status_events(id, since, until, query.include_warnings)
        .await?;
    Ok(Json(events))
}

async fn device_proxmox_vms(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<ProxmoxVm>>> {
    state.repo.get_device(id).await?;
    Ok(Json(state.repo.list_proxmox_vms(id).await?))
}

async fn list_device_notifications(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<Notification>>> {
    state.repo.get_device(id).await?;
    Ok(Json(state.repo.list_device_subscriptions(id).await?))
}

async fn subscribe_notification(
    State(state): State<Arc<AppState>>,
    Path((id, notification_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Value>> {
    state
        .repo
        .subscribe_device(DeviceNotification {
            device_id: id,
            notification_id,
        })
        .await?;
    Ok(Json(json!({ "subscribed": true })))
}

async fn unsubscribe_notification(
    State(state): State<Arc<AppState>>,
    Path((id, notification_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Value>> {
    state
        .repo
        .unsubscribe_device(DeviceNotification {
            device_id: id,
            notification_id,
        })
        .await?;
    Ok(Json(json!({ "subscribed": false })))
}

// --- Connections ---

async fn list_connections(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<MapFilter>,
) -> ApiResult<Json<Vec<Connection>>> {
    Ok(Json(state.repo.list_connections(filter.map_id).await?))
}

async fn get_connection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Connection>> {
    Ok(Json(state.repo.get_connection(id).await?))
}

/// A monitored connection needs a counter source: an SNMP index for
/// SNMP-speaking devices, or a scrape target (port name) for Prometheus
/// ones.
async fn validate_monitor(
    state: &AppState,
    monitored_device: Uuid,
    monitor_snmp_index: Option<i32>,
    port: Option<&str>,
) -> ApiResult<()> {
    let device = state.repo.get_device(monitored_device).await?;
    match device.kind {
        DeviceKind::GenericSnmp
        | DeviceKind::MikrotikRouter
        | DeviceKind::MikrotikSwitch
        | DeviceKind::AccessPoint => {
            if monitor_snmp_index.is_none() {
                return Err(ApiError::bad_field(
                    "monitorSnmpIndex is required when monitoring an SNMP device",
                    "monitorSnmpIndex",
                ));
            }
        }
        DeviceKind::GenericPrometheus | DeviceKind::Server => {
            if port.is_none() {
                return Err(ApiError::bad_field(
                    "the monitored end needs a port name to match a scrape interface",
                    "monitorInterface",
                ));
            }
        }
        other => {
            return Err(ApiError::bad_field(
                format!("devices of kind {} expose no link counters", other.as_str()),
                "monitorInterface",
            ));
        }
    }
    Ok(())
}

async fn create_connection(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<CreateConnectionRequest>,
) -> ApiResult<Json<Connection>> {
    if let Some(end) = request.monitor_interface {
        let (monitored, port) = match end {
            MonitoredEnd::Source => (request.source_device_id, request.source_port.as_deref()),
            MonitoredEnd::Target => (request.target_device_id, request.target_port.as_deref()),
        };
        validate_monitor(&state, monitored, request.monitor_snmp_index, port).await?;
    }
    if request.is_dynamic && request.dynamic_metadata.is_none() {
        return Err(ApiError::bad_field(
            "dynamic connections need dynamicMetadata",
            "dynamicMetadata",
        ));
    }

    let now = Utc::now();
    let connection = state
        .repo
        .create_connection(Connection {
            id: Uuid::new_v4(),
            map_id: request.map_id,
            source_device_id: request.source_device_id,
            target_device_id: request.target_device_id,
            source_port: request.source_port,
            target_port: request.target_port,
            link_speed: request.link_speed,
            monitor_interface: request.monitor_interface,
            monitor_snmp_index: request.monitor_snmp_index,
            link_stats: None,
            counter_state: None,
            is_dynamic: request.is_dynamic,
            dynamic_type: request.dynamic_type,
            dynamic_metadata: request.dynamic_metadata,
            created_at: now,
            updated_at: now,
        })
        .await?;
    publish_change(
        &state,
        &headers,
        connection.map_id,
        ChangeType::Connection,
        ChangeAction::Create,
    );
    Ok(Json(connection))
}

async fn update_connection(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateConnectionRequest>,
) -> ApiResult<Json<Connection>> {
    let mut connection = state.repo.get_connection(id).await?;
    if let Some(port) = request.source_port {
        connection.source_port = Some(port);
    }
    if let Some(port) = request.target_port {
        connection.target_port = Some(port);
    }
    if let Some(speed) = request.link_speed {
        connection.link_speed = speed;
    }
    if let Some(end) = request.monitor_interface {
        connection.monitor_interface = Some(end);
    }
    if let Some(index) = request.monitor_snmp_index {
        connection.monitor_snmp_index = Some(index);
    }
    if let Some(end) = connection.monitor_interface {
        let (monitored, port) = match end {
            MonitoredEnd::Source => (connection.source_device_id, connection.source_port.as_deref()),
            MonitoredEnd::Target => (connection.target_device_id, connection.target_port.as_deref()),
        };
        validate_monitor(&state, monitored, connection.monitor_snmp_index, port).await?;
    }

    let connection = state.repo.update_connection(connection).await?;
    publish_change(
        &state,
        &headers,
        connection.map_id,
        ChangeType::Connection,
        ChangeAction::Update,
    );
    Ok(Json(connection))
}

async fn delete_connection(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let connection = state.repo.get_connection(id).await?;
    state.repo.delete_connection(id).await?;
    publish_change(
        &state,
        &headers,
        connection.map_id,
        ChangeType::Connection,
        ChangeAction::Delete,
    );
    Ok(Json(json!({ "deleted": id })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BandwidthHistoryQuery {
    since: Option<chrono::DateTime<Utc>>,
    max_points: Option<usize>,
}

async fn connection_bandwidth_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<BandwidthHistoryQuery>,
) -> ApiResult<Json<Vec<status::AggregatedBandwidthPoint>>> {
    state.repo.get_connection(id).await?;
    let since = query.since.unwrap_or_else(|| Utc::now() - chrono::Duration::hours(24));
    let samples = state.repo.list_bandwidth_samples(id, since).await?;
    Ok(Json(status::aggregate_bandwidth(
        &samples,
        query.max_points.unwrap_or(300),
    )))
}

// --- Maps & placements ---

async fn list_maps(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<MapRecord>>> {
    Ok(Json(state.repo.list_maps().await?))
}

async fn create_map(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateMapRequest>,
) -> ApiResult<Json<MapRecord>> {
    if request.name.trim().is_empty() {
        return Err(ApiError::bad_field("name must not be empty", "name"));
    }
    let map = state
        .repo
        .upsert_map(MapRecord {
            id: Uuid::new_v4(),
            name: request.name,
            is_default: request.is_default,
            created_at: Utc::now(),
        })
        .await?;
    Ok(Json(map))
}

async fn delete_map(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    state.repo.delete_map(id).await?;
    publish_change(&state, &headers, id, ChangeType::Map, ChangeAction::Delete);
    Ok(Json(json!({ "deleted": id })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlacementFilter {
    map_id: Uuid,
}

async fn list_placements(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<PlacementFilter>,
) -> ApiResult<Json<Vec<DevicePlacement>>> {
    Ok(Json(state.repo.list_placements(filter.map_id).await?))
}

async fn upsert_placement(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<PlacementRequest>,
) -> ApiResult<Json<DevicePlacement>> {
    let placement = state
        .repo
        .upsert_placement(DevicePlacement {
            id: Uuid::new_v4(),
            device_id: request.device_id,
            map_id: request.map_id,
            x: request.x,
            y: request.y,
        })
        .await?;
    publish_change(
        &state,
        &headers,
        placement.map_id,
        ChangeType::Placement,
        ChangeAction::Update,
    );
    Ok(Json(placement))
}

async fn delete_placement(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    let placement = state.repo.get_placement(id).await?;
    state.repo.delete_placement(id).await?;
    publish_change(
        &state,
        &headers,
        placement.map_id,
        ChangeType::Placement,
        ChangeAction::Delete,
    );
    Ok(Json(json!({ "deleted": id })))
}

// --- Credential profiles ---

async fn list_credential_profiles(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<CredentialProfile>>> {
    Ok(Json(state.repo.list_credential_profiles().await?))
}

async fn create_credential_profile(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateCredentialProfileRequest>,
) -> ApiResult<Json<CredentialProfile>> {
    if !request.credentials.is_object() {
        return Err(ApiError::bad_field(
            "credentials must be an object",
            "credentials",
        ));
    }
    let profile = state
        .repo
        .upsert_credential_profile(CredentialProfile {
            id: Uuid::new_v4(),
            name: request.name,
            kind: request.kind,
            credentials: request.credentials,
            created_at: Utc::now(),
        })
        .await?;
    Ok(Json(profile))
}

async fn delete_credential_profile(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    state.repo.delete_credential_profile(id).await?;
    Ok(Json(json!({ "deleted": id })))
}

// --- Notifications ---

async fn list_notifications(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<Notification>>> {
    Ok(Json(state.repo.list_notifications().await?))
}

async fn create_notification(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateNotificationRequest>,
) -> ApiResult<Json<Notification>> {
    if !request.url.starts_with("http://") && !request.url.starts_with("https://") {
        return Err(ApiError::bad_field("url must be http(s)", "url"));
    }
    let notification = state
        .repo
        .upsert_notification(Notification {
            id: Uuid::new_v4(),
            name: request.name,
            url: request.url,
            method: request.method,
            message_template: request.message_template,
            enabled: request.enabled,
            owner_user_id: request.owner_user_id,
            created_at: Utc::now(),
        })
        .await?;
    Ok(Json(notification))
}

async fn delete_notification(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    state.repo.delete_notification(id).await?;
    Ok(Json(json!({ "deleted": id })))
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn notification_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<NotificationHistory>>> {
    Ok(Json(
        state
            .repo
            .list_notification_history(query.limit.unwrap_or(100))
            .await?,
    ))
}

// --- On-duty & mutes ---

async fn duty_on_call(State(state): State<Arc<AppState>>) -> ApiResult<Json<DutyOnCallResponse>> {
    let response = match state.repo.get_on_duty_config().await? {
        Some(config) => match shifts::current_shift(&config, Utc::now()) {
            Some((kind, shift)) => DutyOnCallResponse {
                shift: Some(kind.as_str()),
                user_ids: shift.user_ids.clone(),
            },
            None => DutyOnCallResponse {
                shift: None,
                user_ids: Vec::new(),
            },
        },
        None => DutyOnCallResponse {
            shift: None,
            user_ids: Vec::new(),
        },
    };
    Ok(Json(response))
}

async fn get_duty_schedule(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Option<OnDutyConfig>>> {
    Ok(Json(state.repo.get_on_duty_config().await?))
}

async fn put_duty_schedule(
    State(state): State<Arc<AppState>>,
    Json(config): Json<OnDutyConfig>,
) -> ApiResult<Json<Value>> {
    for (name, shift) in [("day", &config.day), ("night", &config.night)] {
        if shifts::parse_offset(&shift.timezone).is_none() {
            return Err(ApiError::bad_field(
                format!("unparseable timezone for the {name} shift"),
                "timezone",
            ));
        }
    }
    state.repo.set_on_duty_config(config).await?;
    Ok(Json(json!({ "updated": true })))
}

async fn list_alarm_mutes(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<AlarmMute>>> {
    Ok(Json(state.repo.list_alarm_mutes(Utc::now()).await?))
}

async fn create_alarm_mute(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateMuteRequest>,
) -> ApiResult<Json<AlarmMute>> {
    if let Some(until) = request.mute_until {
        if until <= Utc::now() {
            return Err(ApiError::bad_field(
                "muteUntil is already in the past",
                "muteUntil",
            ));
        }
    }
    let mute = state
        .repo
        .create_alarm_mute(AlarmMute {
            id: Uuid::new_v4(),
            user_id: request.user_id,
            muted_by: request.muted_by,
            mute_until: request.mute_until,
            reason: request.reason,
            created_at: Utc::now(),
        })
        .await?;
    Ok(Json(mute))
}

async fn delete_alarm_mute(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    state.repo.delete_alarm_mute(id).await?;
    Ok(Json(json!({ "deleted": id })))
}

// --- Settings ---

async fn get_setting(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> ApiResult<Json<Value>> {
    let value = state.repo.get_setting(&key).await?;
    Ok(Json(json!({ "key": key, "value": value })))
}

async fn put_setting(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(body): Json<SettingValue>,
) -> ApiResult<Json<Value>> {
    let value = body.value.trim().to_string();
    match key.as_str() {
        "polling_interval" => {
            let seconds: u64 = value
                .parse()
                .map_err(|_| ApiError::bad_field("not a number", "value"))?;
            if !(crate::config::MIN_POLLING_INTERVAL..=crate::config::MAX_POLLING_INTERVAL)
                .contains(&seconds)
            {
                return Err(ApiError::bad_field(
                    format!(
                        "polling_interval must be {}..={} seconds",
                        crate::config::MIN_POLLING_INTERVAL,
                        crate::config::MAX_POLLING_INTERVAL
                    ),
                    "value",
                ));
            }
            state.scheduler.set_polling_interval(seconds);
        }
        "offline_threshold" => {
            let threshold: u32 = value
                .parse()
                .map_err(|_| ApiError::bad_field("not a number", "value"))?;
            if threshold == 0 {
                return Err(ApiError::bad_field("offline_threshold must be at least 1", "value"));
            }
            state.engine.update_thresholds(|t| t.offline = threshold);
        }
        "metrics_retention_hours" => {
            let hours: u64 = value
                .parse()
                .map_err(|_| ApiError::bad_field("not a number", "value"))?;
            if hours == 0 {
                return Err(ApiError::bad_field(
                    "metrics_retention_hours must be at least 1",
                    "value",
                ));
            }
        }
        "warning_notifications" => {
            if !matches!(value.as_str(), "true" | "false" | "1" | "0") {
                return Err(ApiError::bad_field("expected a boolean", "value"));
            }
        }
        // Unknown keys are stored verbatim for forward compatibility.
        _ => {}
    }
    state.repo.set_setting(&key, &value).await?;
    Ok(Json(json!({ "key": key, "value": value })))
}

// --- Scanner ---

async fn network_scan(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NetworkScanRequest>,
) -> ApiResult<Json<Vec<Value>>> {
    let events = state
        .scanner
        .run_collected(ScanRequest {
            ip_range: request.ip_range,
            credential_profile_ids: request.credential_profile_ids,
            probe_types: request.probe_types,
        })
        .await?;
    Ok(Json(
        events
            .iter()
            .map(|event| json!({ "event": event.name(), "data": event.data() }))
            .collect(),
    ))
}

async fn list_scan_profiles(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<ScanProfile>>> {
    Ok(Json(state.repo.list_scan_profiles().await?))
}

async fn create_scan_profile(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateScanProfileRequest>,
) -> ApiResult<Json<ScanProfile>> {
    // Reject unparseable ranges at save time, not scan time.
    crate::scan::expand_range(&request.ip_range)?;
    let profile = state
        .repo
        .upsert_scan_profile(ScanProfile {
            id: Uuid::new_v4(),
            name: request.name,
            ip_range: request.ip_range,
            credential_profile_ids: request.credential_profile_ids,
            probe_types: request.probe_types,
            created_at: Utc::now(),
        })
        .await?;
    Ok(Json(profile))
}

async fn delete_scan_profile(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    state.repo.delete_scan_profile(id).await?;
    Ok(Json(json!({ "deleted": id })))
}

// --- Logs & license ---

async fn list_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<LogEntry>>> {
    Ok(Json(state.repo.list_logs(query.limit.unwrap_or(100)).await?))
}

async fn license_summary(State(state): State<Arc<AppState>>) -> ApiResult<Json<LicenseSummary>> {
    let device_count = state.repo.count_licensed_devices().await?;
    let device_limit = match state.license.allowance() {
        DeviceAllowance::Unlimited => None,
        DeviceAllowance::Limited(limit) => Some(limit),
    };
    Ok(Json(LicenseSummary {
        fingerprint: state.license.fingerprint().to_string(),
        device_count,
        device_limit,
        licenses: state.license.licenses(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::repository::MemoryRepository;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::util::ServiceExt;

    async fn test_router() -> (Arc<AppState>, Router) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.license.file_path = dir.path().join("license.json");
        // Leak the tempdir so the license path stays valid for the test.
        std::mem::forget(dir);
        let state = AppState::new(config, Arc::new(MemoryRepository::new()))
            .await
            .unwrap();
        (state.clone(), build_router(state))
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_device_crud_roundtrip() {
        let (_state, router) = test_router().await;

        let response = router
            .clone()
            .oneshot(post_json(
                "/api/devices",
                json!({"name": "r1", "kind": "mikrotik_router", "ip": "10.0.0.1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let created = body_json(response).await;
        let id = created["id"].as_str().unwrap().to_string();
        assert_eq!(created["status"], "unknown");

        let response = router
            .clone()
            .oneshot(Request::get("/api/devices").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let listed = body_json(response).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/devices/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_license_limit_maps_to_402() {
        let (_state, router) = test_router().await;

        // The free tier allows 10; the 11th create must fail with 402.
        for index in 0..10 {
            let response = router
                .clone()
                .oneshot(post_json(
                    "/api/devices",
                    json!({"name": format!("d{index}"), "kind": "generic_ping"}),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = router
            .clone()
            .oneshot(post_json(
                "/api/devices",
                json!({"name": "one-too-many", "kind": "generic_ping"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        let body = body_json(response).await;
        assert!(body["reason"].as_str().unwrap().contains("limit"));

        // Placeholders are exempt.
        let response = router
            .clone()
            .oneshot(post_json(
                "/api/devices",
                json!({"name": "note", "kind": "placeholder"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_settings_validation_and_live_apply() {
        let (state, router) = test_router().await;

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/api/settings/polling_interval")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"value": "60"}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            state.scheduler.polling_interval(),
            std::time::Duration::from_secs(60)
        );

        // Out of range rejected with a field reference.
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/api/settings/polling_interval")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"value": "2"}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["field"], "value");
    }

    #[tokio::test]
    async fn test_monitored_connection_requires_snmp_index() {
        let (state, router) = test_router().await;

        let map = state
            .repo
            .upsert_map(MapRecord {
                id: Uuid::new_v4(),
                name: "m".to_string(),
                is_default: true,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let a = state
            .repo
            .upsert_device(Device::new("a", DeviceKind::GenericSnmp, None))
            .await
            .unwrap();
        let b = state
            .repo
            .upsert_device(Device::new("b", DeviceKind::GenericPing, None))
            .await
            .unwrap();

        let request = json!({
            "mapId": map.id,
            "sourceDeviceId": a.id,
            "targetDeviceId": b.id,
            "sourcePort": "eth0",
            "linkSpeed": "10G",
            "monitorInterface": "source",
        });
        let response = router
            .clone()
            .oneshot(post_json("/api/connections", request.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["field"], "monitorSnmpIndex");

        let mut with_index = request;
        with_index["monitorSnmpIndex"] = json!(3);
        let response = router
            .clone()
            .oneshot(post_json("/api/connections", with_index))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_invalid_scan_range_is_structured_400() {
        let (_state, router) = test_router().await;
        let response = router
            .oneshot(post_json(
                "/api/network-scan",
                json!({"ipRange": "not-a-range"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["field"], "ipRange");
    }

    #[tokio::test]
    async fn test_duty_on_call_empty_without_schedule() {
        let (_state, router) = test_router().await;
        let response = router
            .oneshot(
                Request::get("/api/duty-on-call")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["shift"].is_null());
    }
}
