// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Topology data model and wire payload shapes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::registry::Device;

/// Physical type of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    /// Wired ethernet port.
    Ethernet,
    /// Wireless radio or station.
    Wifi,
}

/// Wifi-specific interface attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WifiInfo {
    /// Served or joined SSID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssid: Option<String>,
    /// BSSID in canonical MAC form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bssid: Option<String>,
    /// Radio band (`2.4GHz`, `5GHz`, `6GHz`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub band: Option<String>,
    /// Channel number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<u32>,
    /// Operating mode (`ap`, `sta`, `mesh`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Received signal strength, dBm.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,
}

/// A network interface; belongs to exactly one device, keyed by
/// `(device_id, name)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    /// Owning device.
    pub device_id: String,
    /// Interface name (`eth0`, `wlan0`, ...).
    pub name: String,
    /// Interface MAC in canonical form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    /// Assigned IP addresses.
    #[serde(default)]
    pub ips: Vec<String>,
    /// Physical type.
    pub kind: InterfaceKind,
    /// Link status (`up`, `down`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Negotiated speed, Mbps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_mbps: Option<u32>,
    /// Duplex mode (`full`, `half`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplex: Option<String>,
    /// Wifi attributes when `kind` is wifi.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wifi: Option<WifiInfo>,
}

/// Link type of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    /// Wired link.
    Ethernet,
    /// AP-to-station link.
    Wireless,
    /// Mesh backhaul link.
    Mesh,
}

/// Per-link quality metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    /// Round-trip latency, ms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    /// Packet loss, percent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_loss_pct: Option<f64>,
    /// Usable bandwidth, Mbps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth_mbps: Option<f64>,
    /// Latency jitter, ms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_ms: Option<f64>,
}

/// Identity of a directed edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionKey {
    /// Source device.
    pub from_device: String,
    /// Source interface name.
    pub from_iface: String,
    /// Destination device.
    pub to_device: String,
    /// Destination interface name.
    pub to_iface: String,
}

/// A directed edge in the site graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    /// Edge identity.
    pub key: ConnectionKey,
    /// Link type.
    pub kind: ConnectionKind,
    /// Latest reported metrics.
    #[serde(default)]
    pub metrics: ConnectionMetrics,
    /// When the edge was first reported, unix ms.
    pub first_seen: i64,
    /// When the edge was last reported, unix ms.
    pub last_seen: i64,
}

/// A wifi client association, produced by folding `telemetry/wifi_clients`.
///
/// Keyed by client MAC: a client has exactly one active wireless parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientAssociation {
    /// Client MAC in canonical form.
    pub client_mac: String,
    /// Serving AP device id.
    pub ap_device: String,
    /// Serving BSSID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bssid: Option<String>,
    /// Joined SSID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssid: Option<String>,
    /// Radio band.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub band: Option<String>,
    /// Channel number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<u32>,
    /// Client signal strength at the AP, dBm.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i32>,
    /// Seconds since association.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_time_s: Option<u64>,
    /// Bytes received from the client.
    #[serde(default)]
    pub bytes_rx: u64,
    /// Bytes sent to the client.
    #[serde(default)]
    pub bytes_tx: u64,
    /// When this association was last reported, unix ms.
    pub last_update: i64,
}

/// The persisted per-site graph: interfaces, edges, associations.
///
/// Device records live in the registry; the graph references them by id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteGraph {
    /// Interfaces keyed implicitly by `(device_id, name)`.
    #[serde(default)]
    pub interfaces: Vec<Interface>,
    /// Directed edges.
    #[serde(default)]
    pub connections: Vec<Connection>,
    /// Active wifi client associations.
    #[serde(default)]
    pub associations: Vec<ClientAssociation>,
}

/// A read snapshot of one site's topology.
#[derive(Debug, Clone, Serialize)]
pub struct TopologySnapshot {
    /// Tenant namespace.
    pub tenant: String,
    /// Site name.
    pub site: String,
    /// Devices known to the registry for this site.
    pub devices: Vec<Device>,
    /// Interfaces in the site graph.
    pub interfaces: Vec<Interface>,
    /// Edges in the site graph.
    pub connections: Vec<Connection>,
    /// Active wifi client associations.
    pub associations: Vec<ClientAssociation>,
    /// Snapshot wall-clock time, unix ms.
    pub generated_at: i64,
}

/// Per-site rollup consumed by diagnostic tools.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SiteSummary {
    /// Devices in the site.
    pub device_count: usize,
    /// Devices currently online.
    pub online_count: usize,
    /// Edges in the graph.
    pub connection_count: usize,
    /// Active wifi client associations.
    pub client_count: usize,
    /// Mean latency over edges that report it, ms.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_latency_ms: Option<f64>,
    /// Mean packet loss over edges that report it, percent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_packet_loss_pct: Option<f64>,
    /// Worst client RSSI over active associations, dBm.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_rssi: Option<i32>,
}

// ── Wire payload shapes ──

/// Body of a `topology/discovery` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryPayload {
    /// Identity fields for the reporting device.
    pub device: Map<String, Value>,
    /// The device's full interface list.
    #[serde(default)]
    pub interfaces: Vec<InterfacePayload>,
}

/// One interface entry in a discovery payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InterfacePayload {
    /// Interface name.
    pub name: String,
    /// Interface MAC.
    #[serde(default)]
    pub mac: Option<String>,
    /// Assigned IP addresses.
    #[serde(default)]
    pub ips: Vec<String>,
    /// `ethernet` or `wifi`.
    #[serde(rename = "type", default = "default_iface_type")]
    pub kind: InterfaceKind,
    /// Link status.
    #[serde(default)]
    pub status: Option<String>,
    /// Negotiated speed, Mbps.
    #[serde(default)]
    pub speed_mbps: Option<u32>,
    /// Duplex mode.
    #[serde(default)]
    pub duplex: Option<String>,
    /// Wifi attributes.
    #[serde(default)]
    pub wifi: Option<WifiInfo>,
}

fn default_iface_type() -> InterfaceKind {
    InterfaceKind::Ethernet
}

/// Body of a `topology/connections` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionsPayload {
    /// Reported edge list.
    #[serde(default)]
    pub connections: Vec<ConnectionPayload>,
}

/// One edge entry in a connections payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionPayload {
    /// Source device id.
    pub from_device: String,
    /// Source interface name.
    pub from_iface: String,
    /// Destination device id.
    pub to_device: String,
    /// Destination interface name.
    pub to_iface: String,
    /// Link type.
    #[serde(rename = "type", default = "default_conn_type")]
    pub kind: ConnectionKind,
    /// Optional link metrics.
    #[serde(default)]
    pub metrics: ConnectionMetrics,
}

fn default_conn_type() -> ConnectionKind {
    ConnectionKind::Ethernet
}

/// Body of a `telemetry/wifi_clients` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct WifiClientsPayload {
    /// BSSID the report covers; defaults to all of the AP's BSSIDs.
    #[serde(default)]
    pub bssid: Option<String>,
    /// SSID served on that BSSID.
    #[serde(default)]
    pub ssid: Option<String>,
    /// Radio band.
    #[serde(default)]
    pub band: Option<String>,
    /// Channel number.
    #[serde(default)]
    pub channel: Option<u32>,
    /// Currently associated clients.
    #[serde(default)]
    pub clients: Vec<WifiClientPayload>,
}

/// One client entry in a wifi-clients payload.
#[derive(Debug, Clone, Deserialize)]
pub struct WifiClientPayload {
    /// Client MAC.
    pub mac: String,
    /// Signal strength, dBm.
    #[serde(default)]
    pub rssi: Option<i32>,
    /// Seconds since association.
    #[serde(default)]
    pub connected_time_s: Option<u64>,
    /// Bytes received from the client.
    #[serde(default)]
    pub bytes_rx: u64,
    /// Bytes sent to the client.
    #[serde(default)]
    pub bytes_tx: u64,
}
