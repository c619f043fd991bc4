// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Topology store.
//!
//! Folds `topology/discovery`, `topology/connections` and
//! `telemetry/wifi_clients` payloads into a per-site graph of interfaces,
//! directed connections, and wifi client associations. Updates derived from
//! one source message are applied atomically under the site lock.
//!
//! Invariants enforced here:
//! - every connection endpoint resolves to a known device and interface;
//!   edges that do not are dropped with a warning event;
//! - a wifi client has exactly one active wireless parent (the association
//!   map is keyed by client MAC);
//! - one gateway per site; a newer claimant demotes the previous one to
//!   `router` and a `topology.gateway_conflict` event fires.

mod model;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::envelope::{Envelope, now_ms};
use crate::error::ProtocolError;
use crate::event::{ControllerEvent, EventBus};
use crate::registry::{DeviceFilter, DeviceRegistry, DeviceRole};
use crate::storage::{Storage, topology_key};
use crate::topic::{TopicAddr, canonical_device_id, canonical_mac};

pub use model::{
    ClientAssociation, Connection, ConnectionKey, ConnectionKind, ConnectionMetrics,
    ConnectionPayload, ConnectionsPayload, DiscoveryPayload, Interface, InterfaceKind,
    InterfacePayload, SiteGraph, SiteSummary, TopologySnapshot, WifiClientPayload,
    WifiClientsPayload, WifiInfo,
};

/// Counters exposed by the topology store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TopologyStats {
    /// Discovery payloads applied.
    pub discoveries: u64,
    /// Connection payloads applied.
    pub connection_reports: u64,
    /// Wifi-client payloads applied.
    pub wifi_reports: u64,
    /// Edges dropped for referencing unknown endpoints.
    pub invalid_edges: u64,
    /// Edges dropped by the staleness sweeper.
    pub swept_edges: u64,
}

/// In-memory state for one `(tenant, site)` pair.
#[derive(Default)]
struct SiteState {
    interfaces: HashMap<(String, String), Interface>,
    connections: HashMap<ConnectionKey, Connection>,
    associations: HashMap<String, ClientAssociation>,
}

impl SiteState {
    fn to_graph(&self) -> SiteGraph {
        let mut graph = SiteGraph {
            interfaces: self.interfaces.values().cloned().collect(),
            connections: self.connections.values().cloned().collect(),
            associations: self.associations.values().cloned().collect(),
        };
        graph
            .interfaces
            .sort_by(|a, b| (&a.device_id, &a.name).cmp(&(&b.device_id, &b.name)));
        graph.connections.sort_by(|a, b| a.key.cmp_key(&b.key));
        graph.associations.sort_by(|a, b| a.client_mac.cmp(&b.client_mac));
        graph
    }

    fn from_graph(graph: SiteGraph) -> Self {
        let mut state = Self::default();
        for iface in graph.interfaces {
            state
                .interfaces
                .insert((iface.device_id.clone(), iface.name.clone()), iface);
        }
        for conn in graph.connections {
            state.connections.insert(conn.key.clone(), conn);
        }
        for assoc in graph.associations {
            state.associations.insert(assoc.client_mac.clone(), assoc);
        }
        state
    }
}

impl ConnectionKey {
    fn cmp_key(&self, other: &Self) -> std::cmp::Ordering {
        (&self.from_device, &self.from_iface, &self.to_device, &self.to_iface).cmp(&(
            &other.from_device,
            &other.from_iface,
            &other.to_device,
            &other.to_iface,
        ))
    }
}

/// The topology store.
pub struct TopologyStore {
    sites: RwLock<HashMap<(String, String), SiteState>>,
    registry: Arc<DeviceRegistry>,
    storage: Arc<dyn Storage>,
    events: EventBus,
    stale_horizon: Duration,
    stats: StatsCells,
}

#[derive(Default)]
struct StatsCells {
    discoveries: AtomicU64,
    connection_reports: AtomicU64,
    wifi_reports: AtomicU64,
    invalid_edges: AtomicU64,
    swept_edges: AtomicU64,
}

impl TopologyStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new(
        registry: Arc<DeviceRegistry>,
        storage: Arc<dyn Storage>,
        events: EventBus,
        stale_horizon: Duration,
    ) -> Self {
        Self {
            sites: RwLock::new(HashMap::new()),
            registry,
            storage,
            events,
            stale_horizon,
            stats: StatsCells::default(),
        }
    }

    /// Restores persisted site graphs from storage.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the scan fails; corrupt graphs are skipped.
    pub async fn restore(&self) -> Result<usize, crate::error::StorageError> {
        let mut graphs = Vec::new();
        self.storage
            .iterate("topology:", &mut |key, value| {
                let Some(rest) = key.strip_prefix("topology:") else {
                    return;
                };
                let Some((tenant, site)) = rest.split_once(':') else {
                    return;
                };
                match serde_json::from_slice::<SiteGraph>(value) {
                    Ok(graph) => graphs.push((tenant.to_string(), site.to_string(), graph)),
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "skipping corrupt topology graph");
                    }
                }
            })
            .await?;

        let count = graphs.len();
        let mut sites = self.sites.write();
        for (tenant, site, graph) in graphs {
            sites.insert((tenant, site), SiteState::from_graph(graph));
        }
        drop(sites);
        if count > 0 {
            tracing::info!(count, "restored site graphs from storage");
        }
        Ok(count)
    }

    /// Applies a `topology/discovery` payload.
    ///
    /// Upserts the reporting device through the registry, replaces its
    /// interface set, and enforces gateway uniqueness for the site.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] when the body does not parse; the caller
    /// counts and drops it.
    pub async fn apply_discovery(
        &self,
        addr: &TopicAddr,
        envelope: &Envelope,
    ) -> Result<(), ProtocolError> {
        let payload: DiscoveryPayload = serde_json::from_value(envelope.body_value())
            .map_err(|e| ProtocolError::InvalidEnvelope(format!("topology.discovery: {e}")))?;
        let device_id = addr.canonical_device_id();

        self.registry.observe(addr, envelope).await;

        let claims_gateway = payload.device.get("role").and_then(serde_json::Value::as_str)
            == Some("gateway");
        if claims_gateway
            && let Some(current) = self.registry.find_gateway(&addr.tenant, &addr.site)
            && current != device_id
        {
            // Most recent claimant wins; the previous gateway is demoted.
            self.registry.set_role(&current, DeviceRole::Router).await;
            tracing::warn!(
                tenant = %addr.tenant,
                site = %addr.site,
                kept = %device_id,
                demoted = %current,
                "gateway conflict resolved"
            );
            self.events.publish(ControllerEvent::GatewayConflict {
                tenant: addr.tenant.clone(),
                site: addr.site.clone(),
                kept: device_id.clone(),
                demoted: current,
            });
        }
        self.registry.update_identity(&device_id, &payload.device).await;

        {
            let mut sites = self.sites.write();
            let state = sites
                .entry((addr.tenant.clone(), addr.site.clone()))
                .or_default();

            let listed: Vec<String> = payload.interfaces.iter().map(|i| i.name.clone()).collect();
            state
                .interfaces
                .retain(|(dev, name), _| *dev != device_id || listed.contains(name));

            for iface in payload.interfaces {
                let mut wifi = iface.wifi;
                if let Some(info) = &mut wifi
                    && let Some(bssid) = info.bssid.take()
                {
                    info.bssid = canonical_mac(&bssid).or(Some(bssid));
                }
                state.interfaces.insert(
                    (device_id.clone(), iface.name.clone()),
                    Interface {
                        device_id: device_id.clone(),
                        name: iface.name,
                        mac: iface.mac.as_deref().and_then(canonical_mac),
                        ips: iface.ips,
                        kind: iface.kind,
                        status: iface.status,
                        speed_mbps: iface.speed_mbps,
                        duplex: iface.duplex,
                        wifi,
                    },
                );
            }
        }

        self.stats.discoveries.fetch_add(1, Ordering::Relaxed);
        self.persist(&addr.tenant, &addr.site).await;
        Ok(())
    }

    /// Applies a `topology/connections` payload.
    ///
    /// New edges are added, existing edges get `last_seen` stamped and
    /// metrics refreshed. Edges referencing unknown endpoints are dropped
    /// with a warning event.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] when the body does not parse.
    pub async fn apply_connections(
        &self,
        addr: &TopicAddr,
        envelope: &Envelope,
    ) -> Result<(), ProtocolError> {
        let payload: ConnectionsPayload = serde_json::from_value(envelope.body_value())
            .map_err(|e| ProtocolError::InvalidEnvelope(format!("topology.connections: {e}")))?;

        self.registry.observe(addr, envelope).await;

        let mut dropped = Vec::new();
        {
            let mut sites = self.sites.write();
            let state = sites
                .entry((addr.tenant.clone(), addr.site.clone()))
                .or_default();

            for edge in payload.connections {
                let from_device = canonical_device_id(&edge.from_device);
                let to_device = canonical_device_id(&edge.to_device);
                let from_known = self.registry.get(&from_device).is_some()
                    && state
                        .interfaces
                        .contains_key(&(from_device.clone(), edge.from_iface.clone()));
                let to_known = self.registry.get(&to_device).is_some()
                    && state
                        .interfaces
                        .contains_key(&(to_device.clone(), edge.to_iface.clone()));
                if !from_known || !to_known {
                    dropped.push(format!(
                        "edge {from_device}/{} -> {to_device}/{} references unknown endpoint",
                        edge.from_iface, edge.to_iface
                    ));
                    continue;
                }

                let key = ConnectionKey {
                    from_device,
                    from_iface: edge.from_iface,
                    to_device,
                    to_iface: edge.to_iface,
                };
                match state.connections.get_mut(&key) {
                    Some(existing) => {
                        existing.last_seen = envelope.ts.max(existing.last_seen);
                        existing.metrics = edge.metrics;
                        existing.kind = edge.kind;
                    }
                    None => {
                        state.connections.insert(
                            key.clone(),
                            Connection {
                                key,
                                kind: edge.kind,
                                metrics: edge.metrics,
                                first_seen: envelope.ts,
                                last_seen: envelope.ts,
                            },
                        );
                    }
                }
            }
        }

        for detail in dropped {
            self.stats.invalid_edges.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(detail = %detail, "dropping invalid topology edge");
            self.events
                .publish(ControllerEvent::InvariantViolation { detail });
        }

        self.stats.connection_reports.fetch_add(1, Ordering::Relaxed);
        self.persist(&addr.tenant, &addr.site).await;
        Ok(())
    }

    /// Applies a `telemetry/wifi_clients` payload.
    ///
    /// Replaces the association set for the reporting AP (and BSSID, when
    /// the payload names one): clients absent from the latest payload are
    /// disconnected, present ones are refreshed, new ones are associated.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] when the body does not parse.
    pub async fn apply_wifi_clients(
        &self,
        addr: &TopicAddr,
        envelope: &Envelope,
    ) -> Result<(), ProtocolError> {
        let payload: WifiClientsPayload = serde_json::from_value(envelope.body_value())
            .map_err(|e| ProtocolError::InvalidEnvelope(format!("telemetry.wifi_clients: {e}")))?;
        let ap_device = addr.canonical_device_id();

        self.registry.observe(addr, envelope).await;

        let bssid = payload.bssid.as_deref().and_then(canonical_mac);
        {
            let mut sites = self.sites.write();
            let state = sites
                .entry((addr.tenant.clone(), addr.site.clone()))
                .or_default();

            // Replace the association set for this AP/BSSID.
            let removed: Vec<String> = state
                .associations
                .values()
                .filter(|a| {
                    a.ap_device == ap_device
                        && (bssid.is_none() || a.bssid == bssid)
                })
                .map(|a| a.client_mac.clone())
                .collect();
            for mac in &removed {
                state.associations.remove(mac);
            }
            state.connections.retain(|key, conn| {
                !(conn.kind == ConnectionKind::Wireless
                    && key.to_device == ap_device
                    && removed.contains(&key.from_device))
            });

            for client in payload.clients {
                let Some(client_mac) = canonical_mac(&client.mac) else {
                    tracing::debug!(mac = %client.mac, "skipping wifi client with unparseable MAC");
                    continue;
                };
                state.associations.insert(
                    client_mac.clone(),
                    ClientAssociation {
                        client_mac: client_mac.clone(),
                        ap_device: ap_device.clone(),
                        bssid: bssid.clone(),
                        ssid: payload.ssid.clone(),
                        band: payload.band.clone(),
                        channel: payload.channel,
                        rssi: client.rssi,
                        connected_time_s: client.connected_time_s,
                        bytes_rx: client.bytes_rx,
                        bytes_tx: client.bytes_tx,
                        last_update: envelope.ts,
                    },
                );

                // Fold known client devices into wireless edges.
                if self.registry.get(&client_mac).is_some() {
                    let ap_iface = state
                        .interfaces
                        .values()
                        .find(|i| {
                            i.device_id == ap_device
                                && i.wifi.as_ref().is_some_and(|w| w.bssid == bssid)
                        })
                        .map_or_else(|| "wlan0".to_string(), |i| i.name.clone());
                    Self::ensure_interface(state, &ap_device, &ap_iface, InterfaceKind::Wifi);
                    Self::ensure_interface(state, &client_mac, "wlan0", InterfaceKind::Wifi);

                    // A station keeps a single wireless uplink.
                    state.connections.retain(|key, conn| {
                        !(conn.kind == ConnectionKind::Wireless
                            && key.from_device == client_mac
                            && key.to_device != ap_device)
                    });
                    let key = ConnectionKey {
                        from_device: client_mac.clone(),
                        from_iface: "wlan0".to_string(),
                        to_device: ap_device.clone(),
                        to_iface: ap_iface,
                    };
                    match state.connections.get_mut(&key) {
                        Some(existing) => existing.last_seen = envelope.ts.max(existing.last_seen),
                        None => {
                            state.connections.insert(
                                key.clone(),
                                Connection {
                                    key,
                                    kind: ConnectionKind::Wireless,
                                    metrics: ConnectionMetrics::default(),
                                    first_seen: envelope.ts,
                                    last_seen: envelope.ts,
                                },
                            );
                        }
                    }
                }
            }
        }

        self.stats.wifi_reports.fetch_add(1, Ordering::Relaxed);
        self.persist(&addr.tenant, &addr.site).await;
        Ok(())
    }

    fn ensure_interface(state: &mut SiteState, device_id: &str, name: &str, kind: InterfaceKind) {
        state
            .interfaces
            .entry((device_id.to_string(), name.to_string()))
            .or_insert_with(|| Interface {
                device_id: device_id.to_string(),
                name: name.to_string(),
                mac: None,
                ips: Vec::new(),
                kind,
                status: None,
                speed_mbps: None,
                duplex: None,
                wifi: (kind == InterfaceKind::Wifi).then(WifiInfo::default),
            });
    }

    /// Returns a read snapshot of one site.
    #[must_use]
    pub fn snapshot(&self, tenant: &str, site: &str) -> TopologySnapshot {
        let devices = self.registry.list(&DeviceFilter::site(tenant, site));
        let sites = self.sites.read();
        let graph = sites
            .get(&(tenant.to_string(), site.to_string()))
            .map(SiteState::to_graph)
            .unwrap_or_default();
        TopologySnapshot {
            tenant: tenant.to_string(),
            site: site.to_string(),
            devices,
            interfaces: graph.interfaces,
            connections: graph.connections,
            associations: graph.associations,
            generated_at: now_ms(),
        }
    }

    /// Returns the ids of devices directly connected to `device_id`,
    /// including wifi clients associated to it.
    #[must_use]
    pub fn neighbors(&self, device_id: &str) -> Vec<String> {
        let id = canonical_device_id(device_id);
        let mut out = Vec::new();
        let sites = self.sites.read();
        for state in sites.values() {
            for key in state.connections.keys() {
                if key.from_device == id && !out.contains(&key.to_device) {
                    out.push(key.to_device.clone());
                }
                if key.to_device == id && !out.contains(&key.from_device) {
                    out.push(key.from_device.clone());
                }
            }
            for assoc in state.associations.values() {
                if assoc.ap_device == id && !out.contains(&assoc.client_mac) {
                    out.push(assoc.client_mac.clone());
                }
                if assoc.client_mac == id && !out.contains(&assoc.ap_device) {
                    out.push(assoc.ap_device.clone());
                }
            }
        }
        out.sort();
        out
    }

    /// Returns per-site counts and metric rollups.
    #[must_use]
    pub fn summary(&self, tenant: &str, site: &str) -> SiteSummary {
        let devices = self.registry.list(&DeviceFilter::site(tenant, site));
        let sites = self.sites.read();
        let Some(state) = sites.get(&(tenant.to_string(), site.to_string())) else {
            return SiteSummary {
                device_count: devices.len(),
                online_count: devices.iter().filter(|d| d.online).count(),
                ..SiteSummary::default()
            };
        };

        let latencies: Vec<f64> = state
            .connections
            .values()
            .filter_map(|c| c.metrics.latency_ms)
            .collect();
        let losses: Vec<f64> = state
            .connections
            .values()
            .filter_map(|c| c.metrics.packet_loss_pct)
            .collect();
        #[allow(clippy::cast_precision_loss)]
        let avg = |xs: &[f64]| {
            if xs.is_empty() {
                None
            } else {
                Some(xs.iter().sum::<f64>() / xs.len() as f64)
            }
        };

        SiteSummary {
            device_count: devices.len(),
            online_count: devices.iter().filter(|d| d.online).count(),
            connection_count: state.connections.len(),
            client_count: state.associations.len(),
            avg_latency_ms: avg(&latencies),
            avg_packet_loss_pct: avg(&losses),
            min_rssi: state.associations.values().filter_map(|a| a.rssi).min(),
        }
    }

    /// Drops edges unreferenced for longer than the stale horizon.
    ///
    /// Returns the number of edges removed.
    pub async fn sweep_stale_edges(&self, now: i64) -> usize {
        #[allow(clippy::cast_possible_wrap)]
        let horizon_ms = self.stale_horizon.as_millis() as i64;
        let mut touched_sites = Vec::new();
        let mut removed = 0;
        {
            let mut sites = self.sites.write();
            for ((tenant, site), state) in sites.iter_mut() {
                let before = state.connections.len();
                state
                    .connections
                    .retain(|_, conn| now - conn.last_seen <= horizon_ms);
                let swept = before - state.connections.len();
                if swept > 0 {
                    removed += swept;
                    touched_sites.push((tenant.clone(), site.clone()));
                }
            }
        }
        if removed > 0 {
            self.stats
                .swept_edges
                .fetch_add(removed as u64, Ordering::Relaxed);
            tracing::info!(removed, "swept stale topology edges");
        }
        for (tenant, site) in touched_sites {
            self.persist(&tenant, &site).await;
        }
        removed
    }

    /// Periodic edge sweep; runs until cancelled.
    pub async fn sweeper_loop(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep_stale_edges(now_ms()).await;
                }
            }
        }
        tracing::debug!("topology sweeper stopped");
    }

    /// Returns a snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> TopologyStats {
        TopologyStats {
            discoveries: self.stats.discoveries.load(Ordering::Relaxed),
            connection_reports: self.stats.connection_reports.load(Ordering::Relaxed),
            wifi_reports: self.stats.wifi_reports.load(Ordering::Relaxed),
            invalid_edges: self.stats.invalid_edges.load(Ordering::Relaxed),
            swept_edges: self.stats.swept_edges.load(Ordering::Relaxed),
        }
    }

    async fn persist(&self, tenant: &str, site: &str) {
        let graph = {
            let sites = self.sites.read();
            sites
                .get(&(tenant.to_string(), site.to_string()))
                .map(SiteState::to_graph)
        };
        let Some(graph) = graph else { return };
        match serde_json::to_vec(&graph) {
            Ok(bytes) => {
                if let Err(e) = self.storage.set(&topology_key(tenant, site), bytes).await {
                    tracing::warn!(tenant, site, error = %e, "failed to persist topology");
                }
            }
            Err(e) => {
                tracing::warn!(tenant, site, error = %e, "failed to serialize topology");
            }
        }
    }
}

impl std::fmt::Debug for TopologyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyStore")
            .field("sites", &self.sites.read().len())
            .finish()
    }
}
