// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Host fingerprinting (scan phase two).
//!
//! For every ping responder, the scanner tries the strongest evidence
//! first: RouterOS API auth, then SNMP `sysDescr`, then the Proxmox
//! `/version` endpoint, then HTTP banners. `find_all` mode widens the
//! signature table to common NAS/hypervisor/firewall/printer vendors.

use regex::RegexBuilder;
use serde_json::{json, Value};
use std::net::Ipv4Addr;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;
use uuid::Uuid;

use super::events::{Confidence, Fingerprint, ScanEvent};
use crate::probers::{Credentials, MikrotikCredentials, ProberFactory};
use crate::repository::models::{CredentialKind, CredentialProfile, DeviceKind, ScanProbeType};

/// Budget for each individual fingerprint check
const CHECK_TIMEOUT: Duration = Duration::from_secs(3);

/// Signature: pattern over sysDescr/banners, vendor label, suggested kind
struct Signature {
    pattern: &'static str,
    label: &'static str,
    kind: DeviceKind,
}

const SIGNATURES: &[Signature] = &[
    Signature { pattern: "routeros|mikrotik", label: "MikroTik RouterOS", kind: DeviceKind::MikrotikRouter },
    Signature { pattern: "proxmox|pve-manager", label: "Proxmox VE", kind: DeviceKind::Proxmox },
    Signature { pattern: "synology|diskstation", label: "Synology", kind: DeviceKind::Server },
    Signature { pattern: "qnap|qts", label: "QNAP", kind: DeviceKind::Server },
    Signature { pattern: "unraid", label: "Unraid", kind: DeviceKind::Server },
    Signature { pattern: "truenas|freenas", label: "TrueNAS", kind: DeviceKind::Server },
    Signature { pattern: "vmware|esxi", label: "VMware ESXi", kind: DeviceKind::Server },
    Signature { pattern: "ubiquiti|unifi|edgeos|airos", label: "Ubiquiti", kind: DeviceKind::AccessPoint },
    Signature { pattern: "cisco ios|cisco systems|catalyst", label: "Cisco", kind: DeviceKind::GenericSnmp },
    Signature { pattern: "procurve|aruba|hewlett[- ]packard|\\bhpe?\\b", label: "HP", kind: DeviceKind::GenericSnmp },
    Signature { pattern: "fortinet|fortigate", label: "Fortinet", kind: DeviceKind::GenericSnmp },
    Signature { pattern: "pfsense", label: "pfSense", kind: DeviceKind::GenericSnmp },
    Signature { pattern: "opnsense", label: "OPNsense", kind: DeviceKind::GenericSnmp },
    Signature { pattern: "jetdirect|laserjet|printer|epson|kyocera|brother\\b", label: "Printer", kind: DeviceKind::GenericSnmp },
    Signature { pattern: "windows", label: "Windows", kind: DeviceKind::Server },
    Signature { pattern: "linux", label: "Linux", kind: DeviceKind::Server },
];

fn signature_regexes() -> &'static Vec<(regex::Regex, &'static Signature)> {
    static COMPILED: OnceLock<Vec<(regex::Regex, &'static Signature)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        SIGNATURES
            .iter()
            .map(|s| {
                let regex = RegexBuilder::new(s.pattern)
                    .case_insensitive(true)
                    .build()
                    .expect("static signature pattern");
                (regex, s)
            })
            .collect()
    })
}

/// Match free text (sysDescr, banner, body) against the signature table.
pub fn classify_text(text: &str) -> Option<(&'static str, DeviceKind)> {
    signature_regexes()
        .iter()
        .find(|(regex, _)| regex.is_match(text))
        .map(|(_, s)| (s.label, s.kind))
}

/// Fingerprint one responder.
pub async fn fingerprint_host(
    ip: Ipv4Addr,
    profiles: &[CredentialProfile],
    probe_types: &[ScanProbeType],
    factory: &ProberFactory,
    http: &reqwest::Client,
) -> ScanEvent {
    let find_all = probe_types.contains(&ScanProbeType::FindAll);
    let wants = |t: ScanProbeType| find_all || probe_types.contains(&t);

    // 1. RouterOS API with each MikroTik profile.
    if wants(ScanProbeType::Mikrotik) {
        for profile in profiles.iter().filter(|p| p.kind == CredentialKind::Mikrotik) {
            let bag = Credentials::from_value(&profile.credentials);
            let Ok(creds) = MikrotikCredentials::from_bag(&bag) else { continue };
            let deadline = Instant::now() + CHECK_TIMEOUT;
            match factory.routeros().check_auth(ip, &creds, deadline).await {
                Ok(identity) => {
                    return ScanEvent::FingerprintResult {
                        ip: ip.to_string(),
                        device_type: DeviceKind::MikrotikRouter.as_str().to_string(),
                        device_data: json!({ "identity": identity }),
                        credential_profile_id: Some(profile.id),
                        fingerprint: Fingerprint {
                            confidence: Confidence::High,
                            detected_via: "routeros_api".to_string(),
                        },
                    };
                }
                Err(e) => trace!(%ip, profile = %profile.name, error = %e, "routeros check failed"),
            }
        }
    }

    // 2. SNMP sysDescr with each SNMP profile, then the public default.
    if wants(ScanProbeType::Snmp) {
        let mut bags: Vec<(Option<Uuid>, Credentials)> = profiles
            .iter()
            .filter(|p| p.kind == CredentialKind::Snmp)
            .map(|p| (Some(p.id), Credentials::from_value(&p.credentials)))
            .collect();
        bags.push((
            None,
            Credentials::from_value(&json!({"snmpVersion": "2c", "snmpCommunity": "public"})),
        ));

        for (profile_id, bag) in bags {
            let deadline = Instant::now() + CHECK_TIMEOUT;
            match factory.snmp().system_description(ip, &bag, deadline).await {
                Ok(descr) => {
                    let (label, kind) = classify_text(&descr)
                        .unwrap_or(("SNMP device", DeviceKind::GenericSnmp));
                    return ScanEvent::FingerprintResult {
                        ip: ip.to_string(),
                        device_type: kind.as_str().to_string(),
                        device_data: json!({ "sysDescr": descr, "vendor": label }),
                        credential_profile_id: profile_id,
                        fingerprint: Fingerprint {
                            confidence: Confidence::Medium,
                            detected_via: "snmp".to_string(),
                        },
                    };
                }
                Err(e) => trace!(%ip, error = %e, "snmp check failed"),
            }
        }
    }

    // 3. Proxmox API presence (the /version endpoint answers 401 without
    // credentials; any HTTP answer on 8006 is a strong signal).
    if wants(ScanProbeType::Server) {
        let url = format!("https://{ip}:8006/api2/json/version");
        if let Ok(response) = http.get(&url).timeout(CHECK_TIMEOUT).send().await {
            let status = response.status();
            if status.is_success() || status == reqwest::StatusCode::UNAUTHORIZED {
                return ScanEvent::FingerprintResult {
                    ip: ip.to_string(),
                    device_type: DeviceKind::Proxmox.as_str().to_string(),
                    device_data: json!({ "vendor": "Proxmox VE" }),
                    credential_profile_id: None,
                    fingerprint: Fingerprint {
                        confidence: Confidence::High,
                        detected_via: "proxmox_api".to_string(),
                    },
                };
            }
        }
    }

    // 4. HTTP banners.
    if find_all || wants(ScanProbeType::Server) {
        for url in [format!("https://{ip}/"), format!("http://{ip}/")] {
            let Ok(response) = http.get(&url).timeout(CHECK_TIMEOUT).send().await else {
                continue;
            };
            let server_header = response
                .headers()
                .get("server")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let body = response.text().await.unwrap_or_default();
            let haystack = format!("{server_header}\n{}", truncated(&body, 4096));
            if let Some((label, kind)) = classify_text(&haystack) {
                return ScanEvent::FingerprintResult {
                    ip: ip.to_string(),
                    device_type: kind.as_str().to_string(),
                    device_data: json!({ "vendor": label, "server": server_header }),
                    credential_profile_id: None,
                    fingerprint: Fingerprint {
                        confidence: Confidence::Low,
                        detected_via: "http_banner".to_string(),
                    },
                };
            }
        }
    }

    // Nothing conclusive: it answers ping, nothing more is known.
    ScanEvent::FingerprintResult {
        ip: ip.to_string(),
        device_type: DeviceKind::GenericPing.as_str().to_string(),
        device_data: Value::Object(Default::default()),
        credential_profile_id: None,
        fingerprint: Fingerprint {
            confidence: Confidence::Low,
            detected_via: "ping_only".to_string(),
        },
    }
}

fn truncated(text: &str, max: usize) -> &str {
    let mut end = text.len().min(max);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_vendors() {
        let cases = [
            ("RouterOS CCR2004-1G-12S+2XS", "MikroTik RouterOS", DeviceKind::MikrotikRouter),
            ("Linux pve1 6.5.11-pve", "Linux", DeviceKind::Server),
            ("Synology DiskStation DS920+", "Synology", DeviceKind::Server),
            ("Cisco IOS Software, C2960", "Cisco", DeviceKind::GenericSnmp),
            ("pfSense fw01.lan", "pfSense", DeviceKind::GenericSnmp),
            ("HP LaserJet 4250", "HP", DeviceKind::GenericSnmp),
            ("UniFi UAP-AC-Pro", "Ubiquiti", DeviceKind::AccessPoint),
            ("TrueNAS-13.0", "TrueNAS", DeviceKind::Server),
        ];
        for (text, label, kind) in cases {
            let (found_label, found_kind) = classify_text(text).unwrap_or_else(|| panic!("{text} unmatched"));
            assert_eq!(found_label, label, "{text}");
            assert_eq!(found_kind, kind, "{text}");
        }
    }

    #[test]
    fn test_unknown_text_unmatched() {
        assert!(classify_text("completely inscrutable banner").is_none());
    }

    #[test]
    fn test_proxmox_beats_generic_linux_ordering() {
        // pve banners contain both "Linux" and "pve"; the table is ordered
        // so the specific signature wins.
        let (label, kind) = classify_text("pve-manager/8.1.4 (Linux)").unwrap();
        assert_eq!(label, "Proxmox VE");
        assert_eq!(kind, DeviceKind::Proxmox);
    }
}
