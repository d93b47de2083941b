// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Message template rendering.
//!
//! Templates use square-bracket placeholders. Unknown placeholders are
//! left verbatim; known placeholders with no value render as the empty
//! string.

use crate::repository::models::{Device, DeviceStatusEvent};

/// Render a notification template for one status event.
pub fn render(template: &str, device: &Device, event: &DeviceStatusEvent) -> String {
    let identity = device
        .device_data
        .as_ref()
        .and_then(|d| d.model.clone())
        .unwrap_or_default();
    let address = device.ip.map(|ip| ip.to_string()).unwrap_or_default();

    template
        .replace("[Device.Name]", &device.name)
        .replace("[Device.Address]", &address)
        .replace("[Device.Identity]", &identity)
        .replace("[Device.Type]", device.kind.as_str())
        .replace("[Service.Status]", event.new_status.as_str())
        .replace("[Status.Old]", event.previous_status.as_str())
        .replace("[Status.New]", event.new_status.as_str())
}

/// Percent-encode a rendered message for a GET query value.
pub fn url_encode(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for byte in text.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push_str("%20"),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::models::{DeviceKind, DeviceStatus};
    use chrono::Utc;
    use uuid::Uuid;

    fn fixture() -> (Device, DeviceStatusEvent) {
        let mut device = Device::new(
            "core-router",
            DeviceKind::MikrotikRouter,
            Some("10.0.0.1".parse().unwrap()),
        );
        device.device_data = Some(crate::repository::models::DeviceData {
            model: Some("CCR2004".to_string()),
            ..Default::default()
        });
        let event = DeviceStatusEvent {
            id: Uuid::new_v4(),
            device_id: device.id,
            previous_status: DeviceStatus::Warning,
            new_status: DeviceStatus::Offline,
            created_at: Utc::now(),
            message: None,
        };
        (device, event)
    }

    #[test]
    fn test_all_placeholders() {
        let (device, event) = fixture();
        let rendered = render(
            "[Device.Name] ([Device.Address], [Device.Identity], [Device.Type]): [Status.Old] -> [Status.New] now [Service.Status]",
            &device,
            &event,
        );
        assert_eq!(
            rendered,
            "core-router (10.0.0.1, CCR2004, mikrotik_router): warning -> offline now offline"
        );
    }

    #[test]
    fn test_missing_fields_render_empty() {
        let (mut device, event) = fixture();
        device.ip = None;
        device.device_data = None;
        let rendered = render("[Device.Name]/[Device.Address]/[Device.Identity]", &device, &event);
        assert_eq!(rendered, "core-router//");
    }

    #[test]
    fn test_unknown_placeholders_kept() {
        let (device, event) = fixture();
        assert_eq!(render("[Nope]", &device, &event), "[Nope]");
    }

    #[test]
    fn test_url_encode() {
        assert_eq!(url_encode("abc-123_~."), "abc-123_~.");
        assert_eq!(url_encode("a b&c=d"), "a%20b%26c%3Dd");
        assert_eq!(url_encode("héllo"), "h%C3%A9llo");
    }
}
