// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! License gate.
//!
//! Licenses are bound to a host fingerprint and stack: the free tier
//! allows a baseline device count, device packs add to it, and a Pro
//! license lifts the limit entirely. Placeholders never count.
//!
//! `license.json` holds either `{"licenses": [...]}` or, from older
//! installs, a single license object; the loader accepts both.

use chrono::NaiveDate;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::repository::models::{License, LicenseTier};

/// Devices allowed without any license
pub const FREE_DEVICE_LIMIT: u32 = 10;

/// Build stamp used for update entitlement checks.
pub const BUILD_DATE: &str = "2026-07-01";

/// License errors
#[derive(Debug, Error)]
pub enum LicenseError {
    /// Creating devices would exceed the licensed limit; maps to 402.
    #[error("{reason}")]
    LimitExceeded { reason: String },

    /// The license file could not be read or written
    #[error("License file error: {0}")]
    Io(#[from] std::io::Error),

    /// The license file or key is malformed
    #[error("Invalid license: {0}")]
    Invalid(String),
}

/// Effective device allowance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAllowance {
    Unlimited,
    Limited(u32),
}

/// On-disk shapes: modern wrapper or legacy single object.
#[derive(Deserialize)]
#[serde(untagged)]
enum LicenseFile {
    Wrapped { licenses: Vec<License> },
    Legacy(License),
}

#[derive(Serialize)]
struct LicenseFileOut<'a> {
    licenses: &'a [License],
}

/// License gate bound to this host
pub struct LicenseGate {
    path: PathBuf,
    fingerprint: String,
    licenses: RwLock<Vec<License>>,
}

impl LicenseGate {
    /// Load the gate from `path`; a missing file means free tier.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LicenseError> {
        let path = path.as_ref().to_path_buf();
        let fingerprint = server_fingerprint();
        let licenses = match std::fs::read_to_string(&path) {
            Ok(raw) => parse_license_file(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(count = licenses.len(), %fingerprint, "licenses loaded");
        Ok(Self {
            path,
            fingerprint,
            licenses: RwLock::new(licenses),
        })
    }

    /// This host's fingerprint.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// All installed licenses, valid for this host or not.
    pub fn licenses(&self) -> Vec<License> {
        self.licenses.read().clone()
    }

    /// Licenses bound to this host (or unbound development licenses).
    fn applicable(&self) -> Vec<License> {
        self.licenses
            .read()
            .iter()
            .filter(|l| {
                let matches = l.server_fingerprint.is_empty()
                    || l.server_fingerprint == self.fingerprint;
                if !matches {
                    warn!(key = %l.license_key, "license bound to another host, ignoring");
                }
                matches
            })
            .cloned()
            .collect()
    }

    /// Effective allowance: Pro wins; device packs stack on the free tier.
    pub fn allowance(&self) -> DeviceAllowance {
        let applicable = self.applicable();
        if applicable.iter().any(|l| l.tier == LicenseTier::Pro) {
            return DeviceAllowance::Unlimited;
        }
        let packs: u32 = applicable
            .iter()
            .filter(|l| l.tier == LicenseTier::DevicePack)
            .map(|l| l.device_limit)
            .sum();
        DeviceAllowance::Limited(FREE_DEVICE_LIMIT + packs)
    }

    /// Gate a device create: would `current + delta` fit?
    pub fn ensure_capacity(&self, current: usize, delta: usize) -> Result<(), LicenseError> {
        match self.allowance() {
            DeviceAllowance::Unlimited => Ok(()),
            DeviceAllowance::Limited(limit) => {
                let requested = current + delta;
                if requested <= limit as usize {
                    Ok(())
                } else {
                    Err(LicenseError::LimitExceeded {
                        reason: format!(
                            "device limit reached: {current} devices exist, adding {delta} \
                             would exceed the licensed limit of {limit}"
                        ),
                    })
                }
            }
        }
    }

    /// Install a new license and persist the file.
    pub fn add(&self, license: License) -> Result<(), LicenseError> {
        validate_shape(&license)?;
        let mut licenses = self.licenses.write();
        if licenses.iter().any(|l| l.license_key == license.license_key) {
            return Err(LicenseError::Invalid(
                "this license key is already installed".to_string(),
            ));
        }
        licenses.push(license);
        let out = serde_json::to_string_pretty(&LicenseFileOut { licenses: &licenses })
            .map_err(|e| LicenseError::Invalid(e.to_string()))?;
        std::fs::write(&self.path, out)?;
        Ok(())
    }
}

/// Builds dated within the license's update window may run it. Free is
/// never entitled.
pub fn is_update_entitled(license: &License) -> bool {
    if license.tier == LicenseTier::Free {
        return false;
    }
    let Some(valid_until) = license.updates_valid_until else {
        return false;
    };
    let Ok(build) = NaiveDate::parse_from_str(BUILD_DATE, "%Y-%m-%d") else {
        return false;
    };
    build <= valid_until
}

fn parse_license_file(raw: &str) -> Result<Vec<License>, LicenseError> {
    match serde_json::from_str::<LicenseFile>(raw) {
        Ok(LicenseFile::Wrapped { licenses }) => Ok(licenses),
        Ok(LicenseFile::Legacy(license)) => Ok(vec![license]),
        Err(e) => Err(LicenseError::Invalid(format!("unparseable license file: {e}"))),
    }
}

fn validate_shape(license: &License) -> Result<(), LicenseError> {
    if license.license_key.trim().is_empty() {
        return Err(LicenseError::Invalid("empty license key".to_string()));
    }
    if license.tier == LicenseTier::DevicePack && license.device_limit == 0 {
        return Err(LicenseError::Invalid(
            "device pack with zero capacity".to_string(),
        ));
    }
    if let Some(signature) = &license.signature {
        if signature.len() < 32 || !signature.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=') {
            return Err(LicenseError::Invalid("malformed signature".to_string()));
        }
    }
    Ok(())
}

/// Stable host fingerprint:
/// `sha256(hostname ∥ lowest MAC ∥ machine-id)`, first 32 hex characters.
pub fn server_fingerprint() -> String {
    let mut hasher = Sha256::new();
    hasher.update(hostname().as_bytes());
    if let Some(mac) = lowest_mac() {
        hasher.update(mac.as_bytes());
    }
    if let Ok(machine_id) = std::fs::read_to_string("/etc/machine-id") {
        hasher.update(machine_id.trim().as_bytes());
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(32);
    for byte in digest.iter().take(16) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "unknown-host".to_string())
}

/// Lexicographically lowest non-zero MAC across interfaces (loopback
/// excluded); stable across reboots on the same hardware.
fn lowest_mac() -> Option<String> {
    let entries = std::fs::read_dir("/sys/class/net").ok()?;
    let mut lowest: Option<String> = None;
    for entry in entries.flatten() {
        let name = entry.file_name();
        if name == "lo" {
            continue;
        }
        let Ok(mac) = std::fs::read_to_string(entry.path().join("address")) else {
            continue;
        };
        let mac = mac.trim().to_lowercase();
        if mac.is_empty() || mac == "00:00:00:00:00:00" {
            continue;
        }
        if lowest.as_deref().map_or(true, |current| mac.as_str() < current) {
            lowest = Some(mac);
        }
    }
    lowest
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn license(tier: LicenseTier, limit: u32, fingerprint: &str) -> License {
        License {
            license_key: format!("key-{}", uuid::Uuid::new_v4()),
            tier,
            device_limit: limit,
            server_fingerprint: fingerprint.to_string(),
            purchase_date: NaiveDate::from_ymd_opt(2026, 1, 1),
            updates_valid_until: NaiveDate::from_ymd_opt(2027, 1, 1),
            signature: None,
        }
    }

    fn empty_gate() -> (tempfile::TempDir, LicenseGate) {
        let dir = tempfile::tempdir().unwrap();
        let gate = LicenseGate::load(dir.path().join("license.json")).unwrap();
        (dir, gate)
    }

    #[test]
    fn test_missing_file_is_free_tier() {
        let (_dir, gate) = empty_gate();
        assert_eq!(gate.allowance(), DeviceAllowance::Limited(FREE_DEVICE_LIMIT));
        assert!(gate.ensure_capacity(9, 1).is_ok());
        assert!(gate.ensure_capacity(10, 1).is_err());
    }

    #[test]
    fn test_device_packs_stack() {
        let (_dir, gate) = empty_gate();
        gate.add(license(LicenseTier::DevicePack, 25, "")).unwrap();
        gate.add(license(LicenseTier::DevicePack, 25, "")).unwrap();
        assert_eq!(gate.allowance(), DeviceAllowance::Limited(FREE_DEVICE_LIMIT + 50));
    }

    #[test]
    fn test_pro_supersedes_packs() {
        let (_dir, gate) = empty_gate();
        gate.add(license(LicenseTier::DevicePack, 25, "")).unwrap();
        gate.add(license(LicenseTier::Pro, 0, "")).unwrap();
        assert_eq!(gate.allowance(), DeviceAllowance::Unlimited);
        assert!(gate.ensure_capacity(1_000_000, 1000).is_ok());
    }

    #[test]
    fn test_foreign_fingerprint_ignored() {
        let (_dir, gate) = empty_gate();
        gate.add(license(LicenseTier::DevicePack, 25, "feedfeedfeedfeedfeedfeedfeedfeed"))
            .unwrap();
        // Bound to some other host: doesn't stack.
        assert_eq!(gate.allowance(), DeviceAllowance::Limited(FREE_DEVICE_LIMIT));
    }

    #[test]
    fn test_batch_create_gated_atomically() {
        let (_dir, gate) = empty_gate();
        assert!(gate.ensure_capacity(0, 10).is_ok());
        let err = gate.ensure_capacity(0, 11).unwrap_err();
        assert!(matches!(err, LicenseError::LimitExceeded { .. }));
        assert!(err.to_string().contains("11"));
    }

    #[test]
    fn test_loader_accepts_both_shapes() {
        let wrapped = r#"{"licenses": [{"license_key": "k1", "tier": "device_pack",
            "device_limit": 25, "server_fingerprint": "", "purchase_date": null,
            "updates_valid_until": null, "signature": null}]}"#;
        assert_eq!(parse_license_file(wrapped).unwrap().len(), 1);

        let legacy = r#"{"license_key": "k2", "tier": "pro", "device_limit": 0,
            "server_fingerprint": "", "purchase_date": null,
            "updates_valid_until": null, "signature": null}"#;
        let parsed = parse_license_file(legacy).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].tier, LicenseTier::Pro);

        assert!(parse_license_file("not json").is_err());
    }

    #[test]
    fn test_add_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("license.json");
        {
            let gate = LicenseGate::load(&path).unwrap();
            gate.add(license(LicenseTier::DevicePack, 25, "")).unwrap();
        }
        let gate = LicenseGate::load(&path).unwrap();
        assert_eq!(gate.licenses().len(), 1);
        assert_eq!(gate.allowance(), DeviceAllowance::Limited(FREE_DEVICE_LIMIT + 25));
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let (_dir, gate) = empty_gate();
        let l = license(LicenseTier::DevicePack, 25, "");
        gate.add(l.clone()).unwrap();
        assert!(gate.add(l).is_err());
    }

    #[test]
    fn test_update_entitlement() {
        let mut l = license(LicenseTier::Pro, 0, "");
        assert!(is_update_entitled(&l));

        l.updates_valid_until = NaiveDate::from_ymd_opt(2020, 1, 1);
        assert!(!is_update_entitled(&l));

        l.updates_valid_until = None;
        assert!(!is_update_entitled(&l));

        let mut free = license(LicenseTier::Free, 0, "");
        free.updates_valid_until = NaiveDate::from_ymd_opt(2099, 1, 1);
        assert!(!is_update_entitled(&free));
    }

    #[test]
    fn test_fingerprint_is_stable_32_hex() {
        let a = server_fingerprint();
        let b = server_fingerprint();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_signature_shape_validation() {
        let mut l = license(LicenseTier::DevicePack, 5, "");
        l.signature = Some("short".to_string());
        let (_dir, gate) = empty_gate();
        assert!(gate.add(l.clone()).is_err());

        l.signature = Some("A".repeat(64));
        assert!(gate.add(l).is_ok());
    }

    #[test]
    fn test_legacy_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("license.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{"license_key": "legacy", "tier": "device_pack", "device_limit": 5,
                "server_fingerprint": "", "purchase_date": null,
                "updates_valid_until": null, "signature": null}}"#
        )
        .unwrap();

        let gate = LicenseGate::load(&path).unwrap();
        assert_eq!(gate.licenses().len(), 1);
    }
}
