// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Scan event stream types.
//!
//! Each variant maps to one SSE event: the variant name is the SSE event
//! name, the payload its JSON data.

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Confidence of a fingerprint match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// How a device type was detected
#[derive(Debug, Clone, Serialize)]
pub struct Fingerprint {
    pub confidence: Confidence,
    #[serde(rename = "detectedVia")]
    pub detected_via: String,
}

/// One streamed scanner event
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ScanEvent {
    Start {
        #[serde(rename = "totalIPs")]
        total_ips: usize,
    },
    PingFound {
        ip: String,
        /// Milliseconds.
        rtt: f64,
        #[serde(rename = "alreadyExists")]
        already_exists: bool,
    },
    Progress {
        phase: String,
        completed: usize,
        total: usize,
        found: usize,
    },
    PhaseComplete {
        phase: String,
        found: usize,
    },
    FingerprintResult {
        ip: String,
        #[serde(rename = "deviceType")]
        device_type: String,
        #[serde(rename = "deviceData")]
        device_data: Value,
        #[serde(rename = "credentialProfileId")]
        credential_profile_id: Option<Uuid>,
        fingerprint: Fingerprint,
    },
    Complete {
        discovered: usize,
    },
    Error {
        message: String,
    },
}

impl ScanEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::PingFound { .. } => "ping_found",
            Self::Progress { .. } => "progress",
            Self::PhaseComplete { .. } => "phase_complete",
            Self::FingerprintResult { .. } => "fingerprint_result",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }

    /// JSON payload for the SSE `data:` line.
    pub fn data(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_names_and_payloads() {
        let event = ScanEvent::Start { total_ips: 4 };
        assert_eq!(event.name(), "start");
        assert_eq!(event.data(), json!({"totalIPs": 4}));

        let event = ScanEvent::PingFound {
            ip: "10.0.0.2".to_string(),
            rtt: 1.5,
            already_exists: false,
        };
        assert_eq!(event.name(), "ping_found");
        assert_eq!(
            event.data(),
            json!({"ip": "10.0.0.2", "rtt": 1.5, "alreadyExists": false})
        );

        let event = ScanEvent::PhaseComplete {
            phase: "ping_sweep".to_string(),
            found: 1,
        };
        assert_eq!(event.name(), "phase_complete");
        assert_eq!(event.data(), json!({"phase": "ping_sweep", "found": 1}));
    }

    #[test]
    fn test_fingerprint_event_shape() {
        let event = ScanEvent::FingerprintResult {
            ip: "10.0.0.2".to_string(),
            device_type: "mikrotik_router".to_string(),
            device_data: json!({"identity": "core-sw"}),
            credential_profile_id: None,
            fingerprint: Fingerprint {
                confidence: Confidence::High,
                detected_via: "routeros_api".to_string(),
            },
        };
        let data = event.data();
        assert_eq!(data["deviceType"], "mikrotik_router");
        assert_eq!(data["fingerprint"]["confidence"], "high");
        assert_eq!(data["fingerprint"]["detectedVia"], "routeros_api");
    }
}
