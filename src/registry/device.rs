// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device records and filters.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Role a device plays in the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    /// Site uplink; at most one per site.
    Gateway,
    /// Routing node.
    Router,
    /// Wireless access point.
    Ap,
    /// Wired switch.
    Switch,
    /// Mesh repeater node.
    Mesh,
    /// End-user client endpoint.
    Client,
    /// Sensor or other constrained device.
    Iot,
}

impl DeviceRole {
    /// Returns the wire form of this role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Gateway => "gateway",
            Self::Router => "router",
            Self::Ap => "ap",
            Self::Switch => "switch",
            Self::Mesh => "mesh",
            Self::Client => "client",
            Self::Iot => "iot",
        }
    }

    /// Parses a wire role string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gateway" => Some(Self::Gateway),
            "router" => Some(Self::Router),
            "ap" => Some(Self::Ap),
            "switch" => Some(Self::Switch),
            "mesh" => Some(Self::Mesh),
            "client" => Some(Self::Client),
            "iot" => Some(Self::Iot),
            _ => None,
        }
    }
}

/// A device known to the registry.
///
/// Created on the first sighting of any topic for its id; destroyed only by
/// explicit admin action. The registry is the sole owner of these records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Canonical device identifier.
    pub device_id: String,
    /// Tenant the device belongs to.
    pub tenant: String,
    /// Site the device belongs to.
    pub site: String,
    /// Device type string as reported (`router`, `sensor`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    /// Primary MAC in canonical colon-free lowercase form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_mac: Option<String>,
    /// Reported hostname.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Reported manufacturer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    /// Reported hardware model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Reported firmware version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
    /// Role in the fabric; unset until a payload reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<DeviceRole>,
    /// Whether the device is currently considered online.
    pub online: bool,
    /// First sighting, unix ms.
    pub first_seen: i64,
    /// Most recent sighting, unix ms (max of observed payload timestamps).
    pub last_seen: i64,
    /// Retained attribute map, replaced wholesale by `attr` payloads.
    #[serde(default)]
    pub attributes: Map<String, Value>,
    /// Last `state` payload body, kept raw.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    /// Reported capability strings.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl Device {
    /// Creates a fresh record for a first sighting.
    #[must_use]
    pub fn new(
        device_id: impl Into<String>,
        tenant: impl Into<String>,
        site: impl Into<String>,
        seen_at: i64,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            tenant: tenant.into(),
            site: site.into(),
            device_type: None,
            primary_mac: None,
            hostname: None,
            manufacturer: None,
            model: None,
            firmware: None,
            role: None,
            online: true,
            first_seen: seen_at,
            last_seen: seen_at,
            attributes: Map::new(),
            state: None,
            capabilities: Vec::new(),
        }
    }

    /// Folds identity fields from a payload body into this record.
    ///
    /// Only fields present in the body are touched.
    pub fn absorb_identity(&mut self, body: &Map<String, Value>) {
        if let Some(v) = body.get("hostname").and_then(Value::as_str) {
            self.hostname = Some(v.to_string());
        }
        if let Some(v) = body.get("manufacturer").and_then(Value::as_str) {
            self.manufacturer = Some(v.to_string());
        }
        if let Some(v) = body.get("model").and_then(Value::as_str) {
            self.model = Some(v.to_string());
        }
        if let Some(v) = body.get("firmware").and_then(Value::as_str) {
            self.firmware = Some(v.to_string());
        }
        if let Some(v) = body.get("type").and_then(Value::as_str) {
            self.device_type = Some(v.to_string());
        }
        if let Some(v) = body.get("role").and_then(Value::as_str)
            && let Some(role) = DeviceRole::parse(v)
        {
            self.role = Some(role);
        }
        if let Some(mac) = body.get("mac").and_then(Value::as_str)
            && let Some(canonical) = crate::topic::canonical_mac(mac)
        {
            self.primary_mac = Some(canonical);
        }
        if let Some(caps) = body.get("capabilities").and_then(Value::as_array) {
            self.capabilities = caps
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
        }
    }
}

/// Filter for [`list`](super::DeviceRegistry::list) queries.
///
/// Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    /// Restrict to one tenant.
    pub tenant: Option<String>,
    /// Restrict to one site.
    pub site: Option<String>,
    /// Restrict to one role.
    pub role: Option<DeviceRole>,
    /// Restrict by online state.
    pub online: Option<bool>,
}

impl DeviceFilter {
    /// Matches a device against this filter.
    #[must_use]
    pub fn matches(&self, device: &Device) -> bool {
        self.tenant.as_ref().is_none_or(|t| *t == device.tenant)
            && self.site.as_ref().is_none_or(|s| *s == device.site)
            && self.role.is_none_or(|r| device.role == Some(r))
            && self.online.is_none_or(|o| o == device.online)
    }

    /// Convenience filter for one site.
    #[must_use]
    pub fn site(tenant: impl Into<String>, site: impl Into<String>) -> Self {
        Self {
            tenant: Some(tenant.into()),
            site: Some(site.into()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn role_roundtrip() {
        for role in [
            DeviceRole::Gateway,
            DeviceRole::Router,
            DeviceRole::Ap,
            DeviceRole::Switch,
            DeviceRole::Mesh,
            DeviceRole::Client,
            DeviceRole::Iot,
        ] {
            assert_eq!(DeviceRole::parse(role.as_str()), Some(role));
        }
        assert_eq!(DeviceRole::parse("blimp"), None);
    }

    #[test]
    fn absorb_identity_updates_present_fields() {
        let mut device = Device::new("dev01", "demo", "home", 1000);
        let body = json!({
            "hostname": "living-room-ap",
            "model": "AX-3000",
            "role": "ap",
            "mac": "AA:BB:CC:DD:EE:FF",
            "capabilities": ["wifi6", "mesh"],
        });
        let Value::Object(body) = body else { panic!() };
        device.absorb_identity(&body);

        assert_eq!(device.hostname.as_deref(), Some("living-room-ap"));
        assert_eq!(device.model.as_deref(), Some("AX-3000"));
        assert_eq!(device.role, Some(DeviceRole::Ap));
        assert_eq!(device.primary_mac.as_deref(), Some("aabbccddeeff"));
        assert_eq!(device.capabilities, vec!["wifi6", "mesh"]);
        // Untouched fields stay None.
        assert!(device.manufacturer.is_none());
    }

    #[test]
    fn absorb_identity_ignores_bad_role() {
        let mut device = Device::new("dev01", "demo", "home", 1000);
        let Value::Object(body) = json!({"role": "spaceship"}) else {
            panic!()
        };
        device.absorb_identity(&body);
        assert_eq!(device.role, None);
    }

    #[test]
    fn filter_matches_by_site_and_role() {
        let mut device = Device::new("ap-01", "demo", "home", 0);
        device.role = Some(DeviceRole::Ap);

        assert!(DeviceFilter::site("demo", "home").matches(&device));
        assert!(!DeviceFilter::site("demo", "office").matches(&device));

        let role_filter = DeviceFilter {
            role: Some(DeviceRole::Gateway),
            ..DeviceFilter::default()
        };
        assert!(!role_filter.matches(&device));
    }

    #[test]
    fn filter_default_matches_everything() {
        let device = Device::new("x", "t", "s", 0);
        assert!(DeviceFilter::default().matches(&device));
    }

    #[test]
    fn device_serde_roundtrip() {
        let mut device = Device::new("dev01", "demo", "home", 42);
        device.role = Some(DeviceRole::Gateway);
        device.attributes.insert("location".to_string(), json!("attic"));
        let bytes = serde_json::to_vec(&device).unwrap();
        let back: Device = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.device_id, "dev01");
        assert_eq!(back.role, Some(DeviceRole::Gateway));
        assert_eq!(back.attributes.get("location"), Some(&json!("attic")));
    }
}
