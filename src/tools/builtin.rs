// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Built-in diagnostic tools.
//!
//! The read-side tools consult the registry and topology store; the
//! `device.*` tools and `diagnostics.wan_connectivity` issue commands and
//! wait on their futures. All of them are registered by
//! [`register_builtin_tools`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::command::IssueOptions;
use crate::envelope::now_ms;
use crate::registry::{DeviceFilter, DeviceRole};
use crate::topic::TopicAddr;

use super::{ToolContext, ToolEngine, ToolHandler};

/// Registers the built-in tool catalogue on an engine.
pub fn register_builtin_tools(engine: &ToolEngine) {
    engine.register(Arc::new(TopologyGetFull));
    engine.register(Arc::new(TopologyGetDevice));
    engine.register(Arc::new(TopologyGetNeighbors));
    engine.register(Arc::new(RegistryListDevices));
    engine.register(Arc::new(WifiSignalStrengthMap));
    engine.register(Arc::new(WifiAnalyzeChannels));
    engine.register(Arc::new(WifiInterferenceScan));
    engine.register(Arc::new(NetworkLatencyAnalysis));
    engine.register(Arc::new(NetworkBandwidthReport));
    engine.register(Arc::new(WanConnectivity));
    engine.register(Arc::new(DeviceHealth));
    engine.register(Arc::new(DeviceCommandTool::get_system_info()));
    engine.register(Arc::new(DeviceCommandTool::reboot()));
    engine.register(Arc::new(DeviceCommandTool::run_speed_test()));
}

fn required_str<'a>(params: &'a Map<String, Value>, key: &str) -> Result<&'a str, String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("missing required parameter '{key}'"))
}

struct TopologyGetFull;

#[async_trait]
impl ToolHandler for TopologyGetFull {
    fn name(&self) -> &'static str {
        "topology.get_full"
    }

    fn description(&self) -> &'static str {
        "full topology snapshot for a site"
    }

    async fn invoke(
        &self,
        ctx: &ToolContext,
        params: &Map<String, Value>,
    ) -> Result<Value, String> {
        let snapshot = ctx.topology.snapshot(ctx.tenant(params), ctx.site(params));
        serde_json::to_value(&snapshot).map_err(|e| e.to_string())
    }
}

struct TopologyGetDevice;

#[async_trait]
impl ToolHandler for TopologyGetDevice {
    fn name(&self) -> &'static str {
        "topology.get_device"
    }

    fn description(&self) -> &'static str {
        "one device with its interfaces and neighbors"
    }

    async fn invoke(
        &self,
        ctx: &ToolContext,
        params: &Map<String, Value>,
    ) -> Result<Value, String> {
        let device_id = required_str(params, "device_id")?;
        let device = ctx
            .registry
            .get(device_id)
            .ok_or_else(|| format!("device not found: {device_id}"))?;
        let snapshot = ctx.topology.snapshot(&device.tenant, &device.site);
        let interfaces: Vec<&crate::topology::Interface> = snapshot
            .interfaces
            .iter()
            .filter(|i| i.device_id == device.device_id)
            .collect();
        Ok(json!({
            "device": device,
            "interfaces": interfaces,
            "neighbors": ctx.topology.neighbors(&device.device_id),
        }))
    }
}

struct TopologyGetNeighbors;

#[async_trait]
impl ToolHandler for TopologyGetNeighbors {
    fn name(&self) -> &'static str {
        "topology.get_neighbors"
    }

    fn description(&self) -> &'static str {
        "directly connected devices"
    }

    async fn invoke(
        &self,
        ctx: &ToolContext,
        params: &Map<String, Value>,
    ) -> Result<Value, String> {
        let device_id = required_str(params, "device_id")?;
        Ok(json!({"device_id": device_id, "neighbors": ctx.topology.neighbors(device_id)}))
    }
}

struct RegistryListDevices;

#[async_trait]
impl ToolHandler for RegistryListDevices {
    fn name(&self) -> &'static str {
        "registry.list_devices"
    }

    fn description(&self) -> &'static str {
        "devices matching a filter"
    }

    async fn invoke(
        &self,
        ctx: &ToolContext,
        params: &Map<String, Value>,
    ) -> Result<Value, String> {
        let filter = DeviceFilter {
            tenant: Some(ctx.tenant(params).to_string()),
            site: Some(ctx.site(params).to_string()),
            role: params
                .get("role")
                .and_then(Value::as_str)
                .and_then(DeviceRole::parse),
            online: params.get("online").and_then(Value::as_bool),
        };
        let devices = ctx.registry.list(&filter);
        Ok(json!({"count": devices.len(), "devices": devices}))
    }
}

struct WifiSignalStrengthMap;

#[async_trait]
impl ToolHandler for WifiSignalStrengthMap {
    fn name(&self) -> &'static str {
        "wifi.signal_strength_map"
    }

    fn description(&self) -> &'static str {
        "client RSSI distribution for a site"
    }

    async fn invoke(
        &self,
        ctx: &ToolContext,
        params: &Map<String, Value>,
    ) -> Result<Value, String> {
        let snapshot = ctx.topology.snapshot(ctx.tenant(params), ctx.site(params));
        let samples: Vec<Value> = snapshot
            .associations
            .iter()
            .filter_map(|a| {
                a.rssi.map(|rssi| {
                    json!({
                        "client_mac": a.client_mac,
                        "ap_device": a.ap_device,
                        "band": a.band,
                        "rssi": rssi,
                    })
                })
            })
            .collect();
        let rssis: Vec<i32> = snapshot.associations.iter().filter_map(|a| a.rssi).collect();
        #[allow(clippy::cast_precision_loss)]
        let avg = (!rssis.is_empty())
            .then(|| f64::from(rssis.iter().sum::<i32>()) / rssis.len() as f64);
        Ok(json!({
            "location": params.get("location"),
            "sample_count": samples.len(),
            "clients": samples,
            "min_rssi": rssis.iter().min(),
            "avg_rssi": avg,
        }))
    }
}

struct WifiAnalyzeChannels;

#[async_trait]
impl ToolHandler for WifiAnalyzeChannels {
    fn name(&self) -> &'static str {
        "wifi.analyze_channels"
    }

    fn description(&self) -> &'static str {
        "channel occupancy across the site's radios"
    }

    async fn invoke(
        &self,
        ctx: &ToolContext,
        params: &Map<String, Value>,
    ) -> Result<Value, String> {
        let snapshot = ctx.topology.snapshot(ctx.tenant(params), ctx.site(params));
        let mut channels: std::collections::BTreeMap<(String, u32), Vec<String>> =
            std::collections::BTreeMap::new();
        for iface in &snapshot.interfaces {
            let Some(wifi) = &iface.wifi else { continue };
            let (Some(band), Some(channel)) = (wifi.band.clone(), wifi.channel) else {
                continue;
            };
            if wifi.mode.as_deref() == Some("sta") {
                continue;
            }
            channels
                .entry((band, channel))
                .or_default()
                .push(iface.device_id.clone());
        }

        let report: Vec<Value> = channels
            .iter()
            .map(|((band, channel), devices)| {
                json!({
                    "band": band,
                    "channel": channel,
                    "radio_count": devices.len(),
                    "devices": devices,
                    "congested": devices.len() > 1,
                })
            })
            .collect();
        let congested = channels.values().filter(|d| d.len() > 1).count();
        Ok(json!({"channels": report, "congested_channels": congested}))
    }
}

struct WifiInterferenceScan;

#[async_trait]
impl ToolHandler for WifiInterferenceScan {
    fn name(&self) -> &'static str {
        "wifi.interference_scan"
    }

    fn description(&self) -> &'static str {
        "co-channel AP pairs likely to interfere"
    }

    async fn invoke(
        &self,
        ctx: &ToolContext,
        params: &Map<String, Value>,
    ) -> Result<Value, String> {
        let snapshot = ctx.topology.snapshot(ctx.tenant(params), ctx.site(params));
        let radios: Vec<(&str, &str, u32)> = snapshot
            .interfaces
            .iter()
            .filter_map(|i| {
                let wifi = i.wifi.as_ref()?;
                if wifi.mode.as_deref() == Some("sta") {
                    return None;
                }
                Some((i.device_id.as_str(), wifi.band.as_deref()?, wifi.channel?))
            })
            .collect();

        let mut pairs = Vec::new();
        for (i, (dev_a, band_a, chan_a)) in radios.iter().enumerate() {
            for (dev_b, band_b, chan_b) in radios.iter().skip(i + 1) {
                if dev_a != dev_b && band_a == band_b && chan_a == chan_b {
                    pairs.push(json!({
                        "a": dev_a,
                        "b": dev_b,
                        "band": band_a,
                        "channel": chan_a,
                    }));
                }
            }
        }
        Ok(json!({"interfering_pairs": pairs, "pair_count": pairs.len()}))
    }
}

struct NetworkLatencyAnalysis;

#[async_trait]
impl ToolHandler for NetworkLatencyAnalysis {
    fn name(&self) -> &'static str {
        "network.latency_analysis"
    }

    fn description(&self) -> &'static str {
        "per-link latency rollup for a site"
    }

    async fn invoke(
        &self,
        ctx: &ToolContext,
        params: &Map<String, Value>,
    ) -> Result<Value, String> {
        let snapshot = ctx.topology.snapshot(ctx.tenant(params), ctx.site(params));
        let mut measured: Vec<(&crate::topology::Connection, f64)> = snapshot
            .connections
            .iter()
            .filter_map(|c| c.metrics.latency_ms.map(|l| (c, l)))
            .collect();
        measured.sort_by(|a, b| b.1.total_cmp(&a.1));

        #[allow(clippy::cast_precision_loss)]
        let avg = (!measured.is_empty())
            .then(|| measured.iter().map(|(_, l)| l).sum::<f64>() / measured.len() as f64);
        let worst: Vec<Value> = measured
            .iter()
            .take(3)
            .map(|(c, l)| {
                json!({
                    "from": c.key.from_device,
                    "to": c.key.to_device,
                    "latency_ms": l,
                    "packet_loss_pct": c.metrics.packet_loss_pct,
                })
            })
            .collect();
        Ok(json!({
            "measured_links": measured.len(),
            "avg_latency_ms": avg,
            "max_latency_ms": measured.first().map(|(_, l)| l),
            "worst_links": worst,
        }))
    }
}

struct NetworkBandwidthReport;

#[async_trait]
impl ToolHandler for NetworkBandwidthReport {
    fn name(&self) -> &'static str {
        "network.bandwidth_report"
    }

    fn description(&self) -> &'static str {
        "per-link bandwidth rollup for a site"
    }

    async fn invoke(
        &self,
        ctx: &ToolContext,
        params: &Map<String, Value>,
    ) -> Result<Value, String> {
        let snapshot = ctx.topology.snapshot(ctx.tenant(params), ctx.site(params));
        let mut measured: Vec<(&crate::topology::Connection, f64)> = snapshot
            .connections
            .iter()
            .filter_map(|c| c.metrics.bandwidth_mbps.map(|b| (c, b)))
            .collect();
        measured.sort_by(|a, b| a.1.total_cmp(&b.1));

        let bottlenecks: Vec<Value> = measured
            .iter()
            .take(3)
            .map(|(c, b)| {
                json!({
                    "from": c.key.from_device,
                    "to": c.key.to_device,
                    "bandwidth_mbps": b,
                })
            })
            .collect();
        Ok(json!({
            "measured_links": measured.len(),
            "min_bandwidth_mbps": measured.first().map(|(_, b)| b),
            "bottlenecks": bottlenecks,
        }))
    }
}

struct WanConnectivity;

#[async_trait]
impl ToolHandler for WanConnectivity {
    fn name(&self) -> &'static str {
        "diagnostics.wan_connectivity"
    }

    fn description(&self) -> &'static str {
        "asks the site gateway to check its WAN uplink"
    }

    async fn invoke(
        &self,
        ctx: &ToolContext,
        params: &Map<String, Value>,
    ) -> Result<Value, String> {
        let tenant = ctx.tenant(params).to_string();
        let site = ctx.site(params).to_string();
        let gateway = ctx
            .registry
            .find_gateway(&tenant, &site)
            .ok_or_else(|| format!("no gateway known for {tenant}/{site}"))?;

        let addr = TopicAddr::cmd_req(tenant, site, gateway.clone());
        let future = ctx
            .commands
            .issue(
                &addr,
                "check_wan",
                Map::new(),
                IssueOptions {
                    cancel_token: Some(ctx.cancel.clone()),
                    ..IssueOptions::default()
                },
            )
            .map_err(|e| e.to_string())?;
        let outcome = future.wait().await.map_err(|e| e.to_string())?;

        if let Some(error) = outcome.as_error() {
            return Err(format!("gateway {gateway}: {error}"));
        }
        Ok(json!({
            "gateway": gateway,
            "wan": outcome.result,
        }))
    }
}

struct DeviceHealth;

#[async_trait]
impl ToolHandler for DeviceHealth {
    fn name(&self) -> &'static str {
        "diagnostics.device_health"
    }

    fn description(&self) -> &'static str {
        "liveness and association summary for one device"
    }

    async fn invoke(
        &self,
        ctx: &ToolContext,
        params: &Map<String, Value>,
    ) -> Result<Value, String> {
        let device_id = required_str(params, "device_id")?;
        let device = ctx
            .registry
            .get(device_id)
            .ok_or_else(|| format!("device not found: {device_id}"))?;
        let snapshot = ctx.topology.snapshot(&device.tenant, &device.site);
        let served_clients = snapshot
            .associations
            .iter()
            .filter(|a| a.ap_device == device.device_id)
            .count();
        Ok(json!({
            "device_id": device.device_id,
            "online": device.online,
            "role": device.role,
            "last_seen_age_ms": now_ms() - device.last_seen,
            "served_clients": served_clients,
            "neighbor_count": ctx.topology.neighbors(&device.device_id).len(),
        }))
    }
}

/// Generic command-issuing tool: `device.<op>`.
struct DeviceCommandTool {
    tool_name: &'static str,
    op: &'static str,
    description: &'static str,
    result_timeout: Option<Duration>,
}

impl DeviceCommandTool {
    fn get_system_info() -> Self {
        Self {
            tool_name: "device.get_system_info",
            op: "get_system_info",
            description: "fetches system info from a device",
            result_timeout: None,
        }
    }

    fn reboot() -> Self {
        Self {
            tool_name: "device.reboot",
            op: "reboot",
            description: "reboots a device",
            result_timeout: None,
        }
    }

    fn run_speed_test() -> Self {
        Self {
            tool_name: "device.run_speed_test",
            op: "run_speed_test",
            description: "runs a speed test on a device",
            // Speed tests take a while; give the device more room.
            result_timeout: Some(Duration::from_secs(120)),
        }
    }
}

#[async_trait]
impl ToolHandler for DeviceCommandTool {
    fn name(&self) -> &'static str {
        self.tool_name
    }

    fn description(&self) -> &'static str {
        self.description
    }

    async fn invoke(
        &self,
        ctx: &ToolContext,
        params: &Map<String, Value>,
    ) -> Result<Value, String> {
        let device_id = required_str(params, "device_id")?;
        let device = ctx
            .registry
            .get(device_id)
            .ok_or_else(|| format!("device not found: {device_id}"))?;

        let mut args = params.clone();
        args.remove("device_id");
        args.remove("tenant");
        args.remove("site");

        let addr = TopicAddr::cmd_req(device.tenant, device.site, device.device_id.clone());
        let future = ctx
            .commands
            .issue(
                &addr,
                self.op,
                args,
                IssueOptions {
                    result_timeout: self.result_timeout,
                    cancel_token: Some(ctx.cancel.clone()),
                    ..IssueOptions::default()
                },
            )
            .map_err(|e| e.to_string())?;
        let outcome = future.wait().await.map_err(|e| e.to_string())?;

        if let Some(error) = outcome.as_error() {
            return Err(format!("{}: {error}", device.device_id));
        }
        Ok(json!({
            "device_id": device.device_id,
            "op": self.op,
            "result": outcome.result,
            "retry_count": outcome.retry_count,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, SchemaId};
    use crate::tools::test_support;
    use crate::topic::TopicKind;
    use tokio_util::sync::CancellationToken;

    async fn seed_site(
        registry: &crate::registry::DeviceRegistry,
        topology: &crate::topology::TopologyStore,
    ) {
        let discovery = |device_id: &str, role: &str, ifaces: Value| {
            (
                TopicAddr {
                    tenant: "demo".to_string(),
                    site: "home".to_string(),
                    device_id: device_id.to_string(),
                    kind: TopicKind::Topology,
                    sub: Some("discovery".to_string()),
                },
                Envelope {
                    schema: "topology.discovery/1.0".parse::<SchemaId>().unwrap(),
                    ts: now_ms(),
                    body: {
                        let Value::Object(body) = json!({
                            "device": {"role": role},
                            "interfaces": ifaces,
                        }) else {
                            unreachable!()
                        };
                        body
                    },
                },
            )
        };

        let (a, env) = discovery(
            "gw-1",
            "gateway",
            json!([{"name": "eth0", "type": "ethernet"}]),
        );
        topology.apply_discovery(&a, &env).await.unwrap();
        let (a, env) = discovery(
            "ap-01",
            "ap",
            json!([
                {"name": "eth0", "type": "ethernet"},
                {"name": "wlan0", "type": "wifi", "wifi": {"band": "5GHz", "channel": 36, "mode": "ap"}},
            ]),
        );
        topology.apply_discovery(&a, &env).await.unwrap();
        let (a, env) = discovery(
            "ap-02",
            "ap",
            json!([
                {"name": "wlan0", "type": "wifi", "wifi": {"band": "5GHz", "channel": 36, "mode": "ap"}},
            ]),
        );
        topology.apply_discovery(&a, &env).await.unwrap();

        let wifi_addr = TopicAddr {
            tenant: "demo".to_string(),
            site: "home".to_string(),
            device_id: "ap-01".to_string(),
            kind: TopicKind::Telemetry,
            sub: Some("wifi_clients".to_string()),
        };
        let Value::Object(body) = json!({"clients": [
            {"mac": "AA:00:00:00:00:01", "rssi": -75},
            {"mac": "AA:00:00:00:00:02", "rssi": -55},
        ]}) else {
            unreachable!()
        };
        topology
            .apply_wifi_clients(
                &wifi_addr,
                &Envelope {
                    schema: "telemetry.wifi_clients/1.0".parse::<SchemaId>().unwrap(),
                    ts: now_ms(),
                    body,
                },
            )
            .await
            .unwrap();
        let _ = registry;
    }

    #[tokio::test]
    async fn signal_strength_map_reports_min_rssi() {
        let (engine, registry, topology, _rx, _commands) = test_support::engine();
        seed_site(&registry, &topology).await;

        let result = engine
            .invoke(
                "wifi.signal_strength_map",
                &Map::new(),
                "s-1",
                CancellationToken::new(),
            )
            .await;
        assert!(result.success);
        assert_eq!(result.data["min_rssi"], json!(-75));
        assert_eq!(result.data["sample_count"], json!(2));
    }

    #[tokio::test]
    async fn analyze_channels_flags_congestion() {
        let (engine, registry, topology, _rx, _commands) = test_support::engine();
        seed_site(&registry, &topology).await;

        let result = engine
            .invoke(
                "wifi.analyze_channels",
                &Map::new(),
                "s-1",
                CancellationToken::new(),
            )
            .await;
        assert!(result.success);
        // ap-01 and ap-02 share 5GHz/36.
        assert_eq!(result.data["congested_channels"], json!(1));
    }

    #[tokio::test]
    async fn interference_scan_finds_cochannel_pair() {
        let (engine, registry, topology, _rx, _commands) = test_support::engine();
        seed_site(&registry, &topology).await;

        let result = engine
            .invoke(
                "wifi.interference_scan",
                &Map::new(),
                "s-1",
                CancellationToken::new(),
            )
            .await;
        assert!(result.success);
        assert_eq!(result.data["pair_count"], json!(1));
    }

    #[tokio::test]
    async fn device_health_requires_known_device() {
        let (engine, registry, topology, _rx, _commands) = test_support::engine();
        seed_site(&registry, &topology).await;

        let mut params = Map::new();
        params.insert("device_id".to_string(), json!("ap-01"));
        let result = engine
            .invoke(
                "diagnostics.device_health",
                &params,
                "s-1",
                CancellationToken::new(),
            )
            .await;
        assert!(result.success);
        assert_eq!(result.data["served_clients"], json!(2));

        params.insert("device_id".to_string(), json!("ghost"));
        let result = engine
            .invoke(
                "diagnostics.device_health",
                &params,
                "s-1",
                CancellationToken::new(),
            )
            .await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn wan_connectivity_issues_command_to_gateway() {
        let (engine, registry, topology, mut requests, commands) = test_support::engine();
        seed_site(&registry, &topology).await;

        let invoke = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move {
                engine
                    .invoke(
                        "diagnostics.wan_connectivity",
                        &Map::new(),
                        "s-1",
                        CancellationToken::new(),
                    )
                    .await
            }
        });

        // Answer the gateway command.
        let (addr, payload) = requests.recv().await.unwrap();
        assert_eq!(addr.device_id, "gw-1");
        let envelope = Envelope::decode(&payload).unwrap();
        assert_eq!(envelope.str_field("op"), Some("check_wan"));
        let id = envelope.str_field("id").unwrap().to_string();

        let res = Envelope::decode(
            json!({
                "schema": "cmd.check_wan.result/1.0",
                "ts": now_ms(),
                "id": id,
                "status": "completed",
                "result": {"wan_up": true, "latency_ms": 12},
            })
            .to_string()
            .as_bytes(),
        )
        .unwrap();
        commands.handle_result(&addr, &res).unwrap();

        let result = invoke.await.unwrap();
        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.data["wan"]["wan_up"], json!(true));
    }

    #[tokio::test]
    async fn get_system_info_fails_for_unknown_device() {
        let (engine, _registry, _topology, _rx, _commands) = test_support::engine();
        let mut params = Map::new();
        params.insert("device_id".to_string(), json!("ghost"));
        let result = engine
            .invoke(
                "device.get_system_info",
                &params,
                "s-1",
                CancellationToken::new(),
            )
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("device not found"));
    }
}
