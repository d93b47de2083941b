// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Credential bags and merging.
//!
//! Credentials are stored as opaque key/value bags on profiles and devices.
//! Effective credentials are the profile bag overlaid with the device's
//! inline bag, key by key, inline winning. The typed views below extract
//! the keys each protocol recognizes and apply its defaults.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;

use super::error::ProbeError;

/// Merged, untyped credential bag.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    bag: Map<String, Value>,
}

impl Credentials {
    /// Key-wise merge: `inline` wins over `profile`.
    pub fn merged(profile: Option<&Value>, inline: Option<&Value>) -> Self {
        let mut bag = Map::new();
        for source in [profile, inline].into_iter().flatten() {
            if let Value::Object(entries) = source {
                for (key, value) in entries {
                    bag.insert(key.clone(), value.clone());
                }
            }
        }
        Self { bag }
    }

    pub fn from_value(value: &Value) -> Self {
        Self::merged(Some(value), None)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.bag.get(key).and_then(Value::as_str)
    }

    /// Numeric lookup tolerating both JSON numbers and numeric strings.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.bag.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.bag.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.as_str() {
                "true" | "1" | "yes" => Some(true),
                "false" | "0" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.bag.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.bag.is_empty()
    }
}

/// RouterOS API credentials
#[derive(Debug, Clone)]
pub struct MikrotikCredentials {
    pub username: String,
    pub password: String,
    pub api_port: u16,
    pub use_tls: bool,
}

impl MikrotikCredentials {
    pub fn from_bag(creds: &Credentials) -> Result<Self, ProbeError> {
        let username = creds
            .get_str("username")
            .ok_or_else(|| ProbeError::Credentials("missing username".to_string()))?
            .to_string();
        let password = creds.get_str("password").unwrap_or_default().to_string();
        let use_tls = creds.get_bool("useTLS").unwrap_or(false);
        let api_port = creds
            .get_u64("apiPort")
            .map(|p| p as u16)
            .unwrap_or(if use_tls { 8729 } else { 8728 });
        Ok(Self {
            username,
            password,
            api_port,
            use_tls,
        })
    }
}

/// SNMP protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnmpVersion {
    V1,
    V2c,
    V3,
}

/// SNMPv3 authentication protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnmpAuthProtocol {
    Md5,
    Sha,
}

/// SNMPv3 privacy protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnmpPrivProtocol {
    Des,
    Aes,
}

/// SNMP credentials for v1/v2c (community) and v3 (USM)
#[derive(Debug, Clone)]
pub struct SnmpCredentials {
    pub version: SnmpVersion,
    pub community: String,
    pub username: Option<String>,
    pub auth_protocol: Option<SnmpAuthProtocol>,
    pub auth_key: Option<String>,
    pub priv_protocol: Option<SnmpPrivProtocol>,
    pub priv_key: Option<String>,
    pub timeout: Duration,
    pub retries: u32,
}

impl SnmpCredentials {
    pub fn from_bag(creds: &Credentials) -> Result<Self, ProbeError> {
        let version = match creds.get_str("snmpVersion").unwrap_or("2c") {
            "1" => SnmpVersion::V1,
            "2c" | "2" => SnmpVersion::V2c,
            "3" => SnmpVersion::V3,
            other => {
                return Err(ProbeError::Credentials(format!(
                    "unknown snmpVersion {other}"
                )))
            }
        };
        let auth_protocol = match creds.get_str("snmpAuthProtocol") {
            Some("MD5") => Some(SnmpAuthProtocol::Md5),
            Some("SHA") => Some(SnmpAuthProtocol::Sha),
            Some(other) => {
                return Err(ProbeError::Credentials(format!(
                    "unknown snmpAuthProtocol {other}"
                )))
            }
            None => None,
        };
        let priv_protocol = match creds.get_str("snmpPrivProtocol") {
            Some("DES") => Some(SnmpPrivProtocol::Des),
            Some("AES") => Some(SnmpPrivProtocol::Aes),
            Some(other) => {
                return Err(ProbeError::Credentials(format!(
                    "unknown snmpPrivProtocol {other}"
                )))
            }
            None => None,
        };
        let username = creds.get_str("snmpUsername").map(str::to_string);
        if version == SnmpVersion::V3 && username.is_none() {
            return Err(ProbeError::Credentials(
                "snmpVersion 3 requires snmpUsername".to_string(),
            ));
        }
        Ok(Self {
            version,
            community: creds.get_str("snmpCommunity").unwrap_or("public").to_string(),
            username,
            auth_protocol,
            auth_key: creds.get_str("snmpAuthKey").map(str::to_string),
            priv_protocol,
            priv_key: creds.get_str("snmpPrivKey").map(str::to_string),
            timeout: Duration::from_millis(creds.get_u64("timeoutMs").unwrap_or(2000)),
            retries: creds.get_u64("retries").unwrap_or(1) as u32,
        })
    }
}

/// Declared custom metric scraped from a Prometheus endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct PrometheusMetricConfig {
    pub id: String,
    #[serde(rename = "metricName")]
    pub metric_name: String,
    #[serde(rename = "displayName", default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    /// `"rate"` marks a counter converted to a per-second rate on read.
    #[serde(default)]
    pub transform: Option<String>,
}

impl PrometheusMetricConfig {
    pub fn is_rate(&self) -> bool {
        self.transform.as_deref() == Some("rate")
    }
}

/// Prometheus scrape credentials
#[derive(Debug, Clone)]
pub struct PrometheusCredentials {
    pub port: u16,
    pub scheme: String,
    pub custom_metrics: Vec<PrometheusMetricConfig>,
}

impl PrometheusCredentials {
    pub fn from_bag(creds: &Credentials) -> Result<Self, ProbeError> {
        let scheme = creds.get_str("scheme").unwrap_or("http").to_string();
        if scheme != "http" && scheme != "https" {
            return Err(ProbeError::Credentials(format!("unknown scheme {scheme}")));
        }
        let custom_metrics = match creds.get("customMetrics") {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| ProbeError::Credentials(format!("invalid customMetrics: {e}")))?,
            None => Vec::new(),
        };
        Ok(Self {
            port: creds.get_u64("port").map(|p| p as u16).unwrap_or(9100),
            scheme,
            custom_metrics,
        })
    }
}

/// Proxmox PVE credentials: API token or ticket auth
#[derive(Debug, Clone)]
pub struct ProxmoxCredentials {
    pub port: u16,
    pub api_token_id: Option<String>,
    pub api_token_secret: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub realm: String,
    pub verify_ssl: bool,
    /// Operator escape hatch for NAT setups where IP matching fails.
    pub override_node_name: Option<String>,
}

impl ProxmoxCredentials {
    pub fn from_bag(creds: &Credentials) -> Result<Self, ProbeError> {
        let out = Self {
            port: creds.get_u64("port").map(|p| p as u16).unwrap_or(8006),
            api_token_id: creds.get_str("apiTokenId").map(str::to_string),
            api_token_secret: creds.get_str("apiTokenSecret").map(str::to_string),
            username: creds.get_str("username").map(str::to_string),
            password: creds.get_str("password").map(str::to_string),
            realm: creds.get_str("realm").unwrap_or("pam").to_string(),
            verify_ssl: creds.get_bool("verifySsl").unwrap_or(false),
            override_node_name: creds.get_str("overrideNodeName").map(str::to_string),
        };
        let has_token = out.api_token_id.is_some() && out.api_token_secret.is_some();
        let has_password = out.username.is_some() && out.password.is_some();
        if !has_token && !has_password {
            return Err(ProbeError::Credentials(
                "need apiTokenId/apiTokenSecret or username/password".to_string(),
            ));
        }
        Ok(out)
    }

    pub fn uses_token(&self) -> bool {
        self.api_token_id.is_some() && self.api_token_secret.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_inline_wins_key_by_key() {
        let profile = json!({"username": "admin", "password": "secret", "apiPort": 8728});
        let inline = json!({"password": "override"});

        let merged = Credentials::merged(Some(&profile), Some(&inline));
        assert_eq!(merged.get_str("username"), Some("admin"));
        assert_eq!(merged.get_str("password"), Some("override"));
        assert_eq!(merged.get_u64("apiPort"), Some(8728));
    }

    #[test]
    fn test_mikrotik_defaults() {
        let bag = Credentials::from_value(&json!({"username": "admin"}));
        let creds = MikrotikCredentials::from_bag(&bag).unwrap();
        assert_eq!(creds.api_port, 8728);
        assert!(!creds.use_tls);

        let bag = Credentials::from_value(&json!({"username": "admin", "useTLS": true}));
        let creds = MikrotikCredentials::from_bag(&bag).unwrap();
        assert_eq!(creds.api_port, 8729);
    }

    #[test]
    fn test_snmp_v3_requires_username() {
        let bag = Credentials::from_value(&json!({"snmpVersion": "3"}));
        assert!(SnmpCredentials::from_bag(&bag).is_err());

        let bag = Credentials::from_value(&json!({
            "snmpVersion": "3",
            "snmpUsername": "monitor",
            "snmpAuthProtocol": "SHA",
            "snmpAuthKey": "authpass",
        }));
        let creds = SnmpCredentials::from_bag(&bag).unwrap();
        assert_eq!(creds.auth_protocol, Some(SnmpAuthProtocol::Sha));
        assert_eq!(creds.timeout, Duration::from_millis(2000));
        assert_eq!(creds.retries, 1);
    }

    #[test]
    fn test_prometheus_custom_metrics() {
        let bag = Credentials::from_value(&json!({
            "port": 9200,
            "customMetrics": [
                {"id": "temp", "metricName": "node_hwmon_temp_celsius"},
                {"id": "rx", "metricName": "node_network_receive_bytes_total", "transform": "rate"},
            ]
        }));
        let creds = PrometheusCredentials::from_bag(&bag).unwrap();
        assert_eq!(creds.port, 9200);
        assert_eq!(creds.custom_metrics.len(), 2);
        assert!(!creds.custom_metrics[0].is_rate());
        assert!(creds.custom_metrics[1].is_rate());
    }

    #[test]
    fn test_proxmox_requires_some_auth() {
        let bag = Credentials::from_value(&json!({"port": 8006}));
        assert!(ProxmoxCredentials::from_bag(&bag).is_err());

        let bag = Credentials::from_value(&json!({
            "apiTokenId": "monitor@pve!corebit",
            "apiTokenSecret": "aaaa-bbbb",
        }));
        let creds = ProxmoxCredentials::from_bag(&bag).unwrap();
        assert!(creds.uses_token());
        assert!(!creds.verify_ssl);
        assert_eq!(creds.realm, "pam");
    }
}
