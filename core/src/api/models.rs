// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! API request/response shapes.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use uuid::Uuid;

use super::error::ApiError;
use crate::repository::models::{
    DeviceKind, DynamicMetadata, DynamicType, HttpMethod, LinkSpeed, MonitoredEnd, ScanProbeType,
    StatusSegment,
};

/// Create-device payload
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDeviceRequest {
    pub name: String,
    pub kind: DeviceKind,
    pub ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub credential_profile_id: Option<Uuid>,
    #[serde(default)]
    pub custom_credentials: Option<serde_json::Value>,
    #[serde(default)]
    pub use_on_duty: bool,
}

/// Patch-device payload; absent fields stay unchanged
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDeviceRequest {
    pub name: Option<String>,
    pub kind: Option<DeviceKind>,
    pub ip: Option<Ipv4Addr>,
    pub credential_profile_id: Option<Uuid>,
    pub custom_credentials: Option<serde_json::Value>,
    pub use_on_duty: Option<bool>,
}

/// Bulk create payload
#[derive(Debug, Clone, Deserialize)]
pub struct BatchCreateRequest {
    pub devices: Vec<CreateDeviceRequest>,
}

/// Create/replace connection payload
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConnectionRequest {
    pub map_id: Uuid,
    pub source_device_id: Uuid,
    pub target_device_id: Uuid,
    pub source_port: Option<String>,
    pub target_port: Option<String>,
    pub link_speed: LinkSpeed,
    #[serde(default)]
    pub monitor_interface: Option<MonitoredEnd>,
    #[serde(default)]
    pub monitor_snmp_index: Option<i32>,
    #[serde(default)]
    pub is_dynamic: bool,
    #[serde(default)]
    pub dynamic_type: Option<DynamicType>,
    #[serde(default)]
    pub dynamic_metadata: Option<DynamicMetadata>,
}

/// Patch-connection payload
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateConnectionRequest {
    pub source_port: Option<String>,
    pub target_port: Option<String>,
    pub link_speed: Option<LinkSpeed>,
    pub monitor_interface: Option<MonitoredEnd>,
    pub monitor_snmp_index: Option<i32>,
}

/// Create-map payload
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMapRequest {
    pub name: String,
    #[serde(default)]
    pub is_default: bool,
}

/// Create/move placement payload
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementRequest {
    pub device_id: Uuid,
    pub map_id: Uuid,
    pub x: f64,
    pub y: f64,
}

/// Create credential-profile payload
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCredentialProfileRequest {
    pub name: String,
    pub kind: crate::repository::models::CredentialKind,
    pub credentials: serde_json::Value,
}

/// Create notification payload
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNotificationRequest {
    pub name: String,
    pub url: String,
    pub method: HttpMethod,
    pub message_template: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub owner_user_id: Option<Uuid>,
}

fn default_true() -> bool {
    true
}

/// Create alarm-mute payload
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMuteRequest {
    #[serde(default)]
    pub user_id: Option<Uuid>,
    pub muted_by: String,
    #[serde(default)]
    pub mute_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Create scan-profile payload
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateScanProfileRequest {
    pub name: String,
    pub ip_range: String,
    #[serde(default)]
    pub credential_profile_ids: Vec<Uuid>,
    #[serde(default)]
    pub probe_types: Vec<ScanProbeType>,
}

/// Non-streaming scan payload
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkScanRequest {
    pub ip_range: String,
    #[serde(default)]
    pub credential_profile_ids: Vec<Uuid>,
    #[serde(default)]
    pub probe_types: Vec<ScanProbeType>,
}

/// Streaming scan query parameters (CSV-encoded lists)
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkScanStreamQuery {
    pub ip_range: String,
    #[serde(default)]
    pub credential_profile_ids: Option<String>,
    #[serde(default)]
    pub probe_types: Option<String>,
}

/// Settings value payload
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SettingValue {
    pub value: String,
}

/// Current on-duty answer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DutyOnCallResponse {
    pub shift: Option<&'static str>,
    pub user_ids: Vec<Uuid>,
}

/// Status segments plus the derived online ratio
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSegmentsResponse {
    pub segments: Vec<StatusSegment>,
    pub online_ratio: f64,
}

/// License summary
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseSummary {
    pub fingerprint: String,
    pub device_count: usize,
    pub device_limit: Option<u32>,
    pub licenses: Vec<crate::repository::models::License>,
}

/// History range selector: `24h`, `7d`, `30d`, `90d`
pub fn parse_range(range: &str) -> Result<Duration, ApiError> {
    match range {
        "24h" => Ok(Duration::hours(24)),
        "7d" => Ok(Duration::days(7)),
        "30d" => Ok(Duration::days(30)),
        "90d" => Ok(Duration::days(90)),
        other => Err(ApiError::bad_field(
            format!("unknown range {other:?}; expected 24h, 7d, 30d or 90d"),
            "range",
        )),
    }
}

/// Parse a CSV list of UUIDs from a query string.
pub fn parse_uuid_csv(raw: &Option<String>) -> Result<Vec<Uuid>, ApiError> {
    let Some(raw) = raw else { return Ok(Vec::new()) };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            Uuid::parse_str(s).map_err(|_| {
                ApiError::bad_field(format!("invalid id {s:?}"), "credentialProfileIds")
            })
        })
        .collect()
}

/// Parse a CSV list of scan probe types.
pub fn parse_probe_types(raw: &Option<String>) -> Result<Vec<ScanProbeType>, ApiError> {
    let Some(raw) = raw else { return Ok(Vec::new()) };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| match s {
            "mikrotik" => Ok(ScanProbeType::Mikrotik),
            "snmp" => Ok(ScanProbeType::Snmp),
            "server" => Ok(ScanProbeType::Server),
            "find_all" => Ok(ScanProbeType::FindAll),
            other => Err(ApiError::bad_field(
                format!("unknown probe type {other:?}"),
                "probeTypes",
            )),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("24h").unwrap(), Duration::hours(24));
        assert_eq!(parse_range("90d").unwrap(), Duration::days(90));
        assert!(parse_range("1y").is_err());
    }

    #[test]
    fn test_parse_uuid_csv() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let parsed = parse_uuid_csv(&Some(format!("{a}, {b},"))).unwrap();
        assert_eq!(parsed, vec![a, b]);
        assert!(parse_uuid_csv(&Some("nope".to_string())).is_err());
        assert!(parse_uuid_csv(&None).unwrap().is_empty());
    }

    #[test]
    fn test_parse_probe_types() {
        let parsed = parse_probe_types(&Some("mikrotik,snmp".to_string())).unwrap();
        assert_eq!(parsed, vec![ScanProbeType::Mikrotik, ScanProbeType::Snmp]);
        assert!(parse_probe_types(&Some("alien".to_string())).is_err());
    }

    #[test]
    fn test_create_device_request_shape() {
        let request: CreateDeviceRequest = serde_json::from_str(
            r#"{"name": "r1", "kind": "mikrotik_router", "ip": "10.0.0.1",
                "credentialProfileId": null, "useOnDuty": true}"#,
        )
        .unwrap();
        assert_eq!(request.kind, DeviceKind::MikrotikRouter);
        assert!(request.use_on_duty);
    }
}
