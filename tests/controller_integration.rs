// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end controller tests.
//!
//! These drive the assembled controller through its public surface: frames
//! are injected as if delivered by the broker, outbound command requests are
//! captured through a channel-backed publisher, and workflows run against
//! the real registry/topology/command subsystems.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;

use rtkctl::command::{CommandPublisher, IssueOptions};
use rtkctl::envelope::{Envelope, now_ms};
use rtkctl::error::TransportError;
use rtkctl::{
    CommandState, Controller, ControllerConfig, ControllerEvent, DeviceFilter, MemoryStorage,
    Storage, StubLlmClient, TopicAddr,
};

/// Publisher that hands outbound `cmd/req` frames to the test.
struct CapturePublisher {
    tx: mpsc::UnboundedSender<(TopicAddr, Vec<u8>)>,
}

#[async_trait]
impl CommandPublisher for CapturePublisher {
    async fn publish_request(
        &self,
        addr: &TopicAddr,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        let _ = self.tx.send((addr.clone(), payload));
        Ok(())
    }
}

struct Harness {
    controller: Arc<Controller>,
    requests: mpsc::UnboundedReceiver<(TopicAddr, Vec<u8>)>,
}

fn test_config() -> ControllerConfig {
    let mut config = ControllerConfig::default();
    config.broker.tenant = "demo".to_string();
    config.broker.site = "home".to_string();
    config
}

async fn harness() -> Harness {
    harness_with(test_config(), Arc::new(MemoryStorage::new())).await
}

async fn harness_with(config: ControllerConfig, storage: Arc<MemoryStorage>) -> Harness {
    let (tx, requests) = mpsc::unbounded_channel();
    let controller = Controller::offline(
        config,
        Arc::clone(&storage) as Arc<dyn Storage>,
        Arc::new(StubLlmClient::default()),
        Arc::new(CapturePublisher { tx }),
    )
    .await
    .expect("controller assembles");
    Harness {
        controller,
        requests,
    }
}

fn payload(schema: &str, ts: i64, mut body: Value) -> Vec<u8> {
    body["schema"] = json!(schema);
    body["ts"] = json!(ts);
    body.to_string().into_bytes()
}

/// Waits until the router workers have drained the injected frames.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(80)).await;
}

fn request_id(raw: &[u8]) -> String {
    Envelope::decode(raw)
        .expect("request decodes")
        .str_field("id")
        .expect("request carries id")
        .to_string()
}

// ── Ingestion ──

#[tokio::test]
async fn state_messages_create_online_devices() {
    let h = harness().await;
    let ts = now_ms();
    h.controller
        .inject(
            "rtk/v1/demo/home/dev01/state",
            &payload("device.state/1.0", ts, json!({"hostname": "gw", "uptime_s": 12})),
        )
        .await;
    settle().await;

    let device = h.controller.get_device("dev01").expect("device exists");
    assert!(device.online);
    assert_eq!(device.last_seen, ts);
    assert_eq!(device.hostname.as_deref(), Some("gw"));
}

#[tokio::test]
async fn last_seen_tracks_max_timestamp_across_kinds() {
    let h = harness().await;
    let base = now_ms();
    for (topic, schema, ts) in [
        ("rtk/v1/demo/home/dev01/state", "device.state/1.0", base),
        ("rtk/v1/demo/home/dev01/attr", "device.attr/1.0", base + 500),
        (
            "rtk/v1/demo/home/dev01/telemetry/cpu",
            "telemetry.cpu/1.0",
            base + 200,
        ),
    ] {
        h.controller.inject(topic, &payload(schema, ts, json!({}))).await;
    }
    settle().await;

    let device = h.controller.get_device("dev01").unwrap();
    assert_eq!(device.last_seen, base + 500);
    assert!(device.online);
}

#[tokio::test]
async fn lwt_offline_holds_until_fresh_traffic() {
    let h = harness().await;
    let ts = now_ms();
    h.controller
        .inject(
            "rtk/v1/demo/home/dev01/state",
            &payload("device.state/1.0", ts, json!({})),
        )
        .await;
    h.controller
        .inject(
            "rtk/v1/demo/home/dev01/lwt",
            &payload("device.lwt/1.0", ts + 10, json!({"status": "offline"})),
        )
        .await;
    settle().await;
    assert!(!h.controller.get_device("dev01").unwrap().online);

    h.controller
        .inject(
            "rtk/v1/demo/home/dev01/telemetry/cpu",
            &payload("telemetry.cpu/1.0", ts + 20, json!({"load": 0.5})),
        )
        .await;
    settle().await;
    assert!(h.controller.get_device("dev01").unwrap().online);
}

#[tokio::test]
async fn malformed_frames_are_counted_never_propagated() {
    let h = harness().await;
    h.controller.inject("rtk/v2/demo/home/dev01/state", b"{}").await;
    h.controller
        .inject("rtk/v1/demo/home/dev01/state", b"not json at all")
        .await;
    h.controller
        .inject("rtk/v1/demo/home/dev01/nonsense", b"{}")
        .await;
    settle().await;

    let stats = h.controller.stats();
    assert_eq!(stats.router.malformed_topic, 2);
    assert_eq!(stats.router.invalid_envelope, 1);
    assert_eq!(stats.router.accepted, 0);
    assert!(h.controller.list_devices(&DeviceFilter::default()).is_empty());
}

// ── Scenario 1: command happy path ──

#[tokio::test]
async fn command_happy_path() {
    let mut h = harness().await;
    let addr = TopicAddr::cmd_req("demo", "site", "dev01");
    let future = h
        .controller
        .issue_command(&addr, "get_system_info", Map::new(), IssueOptions::default())
        .unwrap();

    let (req_addr, raw) = h.requests.recv().await.unwrap();
    assert_eq!(req_addr.to_string(), "rtk/v1/demo/site/dev01/cmd/req");
    let id = request_id(&raw);

    let ts = now_ms();
    h.controller
        .inject(
            "rtk/v1/demo/site/dev01/cmd/ack",
            &payload("cmd.ack/1.0", ts, json!({"id": id, "status": "accepted"})),
        )
        .await;
    h.controller
        .inject(
            "rtk/v1/demo/site/dev01/cmd/res",
            &payload(
                "cmd.get_system_info.result/1.0",
                ts + 1,
                json!({"id": id, "status": "completed", "result": {"uptime_s": 3600}}),
            ),
        )
        .await;

    let outcome = future.wait().await.unwrap();
    assert_eq!(outcome.state, CommandState::Completed);
    assert_eq!(outcome.retry_count, 0);
    assert_eq!(outcome.result.unwrap().get("uptime_s"), Some(&json!(3600)));
}

// ── Scenario 2: ack timeout with retry ──

#[tokio::test(start_paused = true)]
async fn command_ack_timeout_retries_with_fresh_id() {
    let mut h = harness().await;
    let addr = TopicAddr::cmd_req("demo", "site", "dev01");
    let future = h
        .controller
        .issue_command(
            &addr,
            "get_system_info",
            Map::new(),
            IssueOptions {
                retries: Some(1),
                ..IssueOptions::default()
            },
        )
        .unwrap();

    // Never answer the first request.
    let (_, first_raw) = h.requests.recv().await.unwrap();
    let first_id = request_id(&first_raw);

    // The ack timer fires and a second request goes out with a fresh id.
    let (_, second_raw) = h.requests.recv().await.unwrap();
    let second_id = request_id(&second_raw);
    assert_ne!(first_id, second_id);

    let ts = now_ms();
    h.controller
        .inject(
            "rtk/v1/demo/site/dev01/cmd/ack",
            &payload("cmd.ack/1.0", ts, json!({"id": second_id, "status": "accepted"})),
        )
        .await;
    h.controller
        .inject(
            "rtk/v1/demo/site/dev01/cmd/res",
            &payload(
                "cmd.get_system_info.result/1.0",
                ts,
                json!({"id": second_id, "status": "completed", "result": {}}),
            ),
        )
        .await;

    let outcome = future.wait().await.unwrap();
    assert_eq!(outcome.state, CommandState::Completed);
    assert_eq!(outcome.retry_count, 1);

    // The superseded id is terminal timeout and stays that way.
    let first = h.controller.get_command(&first_id).await.unwrap();
    assert_eq!(first.state, CommandState::Timeout);
}

// ── Scenario 3: wifi-client fold ──

#[tokio::test]
async fn wifi_clients_fold_disconnects_absent_clients() {
    let h = harness().await;
    let ts = now_ms();

    h.controller
        .inject(
            "rtk/v1/demo/home/ap-01/telemetry/wifi_clients",
            &payload(
                "telemetry.wifi_clients/1.0",
                ts,
                json!({"ssid": "home", "clients": [
                    {"mac": "AA:00:00:00:00:0A", "rssi": -52},
                    {"mac": "AA:00:00:00:00:0B", "rssi": -61},
                ]}),
            ),
        )
        .await;
    settle().await;

    let topo = h.controller.get_topology("demo", "home");
    let macs: Vec<&str> = topo.associations.iter().map(|a| a.client_mac.as_str()).collect();
    assert_eq!(macs, vec!["aa000000000a", "aa000000000b"]);

    h.controller
        .inject(
            "rtk/v1/demo/home/ap-01/telemetry/wifi_clients",
            &payload(
                "telemetry.wifi_clients/1.0",
                ts + 1000,
                json!({"ssid": "home", "clients": [
                    {"mac": "AA:00:00:00:00:0B", "rssi": -59},
                    {"mac": "AA:00:00:00:00:0C", "rssi": -70},
                ]}),
            ),
        )
        .await;
    settle().await;

    let topo = h.controller.get_topology("demo", "home");
    let macs: Vec<&str> = topo.associations.iter().map(|a| a.client_mac.as_str()).collect();
    assert_eq!(macs, vec!["aa000000000b", "aa000000000c"]);
    let b = topo
        .associations
        .iter()
        .find(|a| a.client_mac == "aa000000000b")
        .unwrap();
    assert_eq!(b.rssi, Some(-59));
    assert_eq!(b.last_update, ts + 1000);
}

// ── Scenario 4: gateway uniqueness ──

#[tokio::test]
async fn second_gateway_claim_demotes_the_first() {
    let h = harness().await;
    let mut events = h.controller.events();
    let ts = now_ms();

    for (device, offset) in [("gw-a", 0), ("gw-b", 100)] {
        h.controller
            .inject(
                &format!("rtk/v1/demo/home/{device}/topology/discovery"),
                &payload(
                    "topology.discovery/1.0",
                    ts + offset,
                    json!({"device": {"role": "gateway"}, "interfaces": [{"name": "eth0"}]}),
                ),
            )
            .await;
        settle().await;
    }

    let a = h.controller.get_device("gw-a").unwrap();
    let b = h.controller.get_device("gw-b").unwrap();
    assert_eq!(b.role, Some(rtkctl::DeviceRole::Gateway));
    assert_eq!(a.role, Some(rtkctl::DeviceRole::Router));

    let mut saw_conflict = false;
    while let Ok(event) = events.try_recv() {
        if let ControllerEvent::GatewayConflict { kept, demoted, .. } = event {
            assert_eq!(kept, "gw-b");
            assert_eq!(demoted, "gw-a");
            saw_conflict = true;
        }
    }
    assert!(saw_conflict, "expected topology.gateway_conflict event");
}

// ── Scenario 5: workflow with parallel + condition over real topology ──

#[tokio::test]
async fn weak_signal_workflow_runs_deep_analysis_on_poor_rssi() {
    let h = harness().await;
    let ts = now_ms();

    // An AP with one weak client (-75 dBm) in the real topology.
    h.controller
        .inject(
            "rtk/v1/demo/home/ap-01/topology/discovery",
            &payload(
                "topology.discovery/1.0",
                ts,
                json!({"device": {"role": "ap"}, "interfaces": [
                    {"name": "wlan0", "type": "wifi",
                     "wifi": {"band": "5GHz", "channel": 36, "mode": "ap"}},
                ]}),
            ),
        )
        .await;
    h.controller
        .inject(
            "rtk/v1/demo/home/ap-01/telemetry/wifi_clients",
            &payload(
                "telemetry.wifi_clients/1.0",
                ts + 10,
                json!({"ssid": "home", "clients": [{"mac": "AA:00:00:00:00:01", "rssi": -75}]}),
            ),
        )
        .await;
    settle().await;

    let mut params = Map::new();
    params.insert("location1".to_string(), json!("bedroom"));
    let result = h
        .controller
        .execute_workflow("weak_signal_coverage_diagnosis", params)
        .await
        .unwrap();

    assert!(result.success, "summary: {}", result.summary);
    assert!(result.summary.starts_with("8/8"), "summary: {}", result.summary);
    assert_eq!(result.steps.len(), 4);
    assert_eq!(result.steps[0].sub_steps.len(), 4);
    assert!(!result.steps[1].skipped, "deep analysis must fire at -75 dBm");
    assert_eq!(result.steps[1].sub_steps.len(), 2);
}

// ── Scenario 6: intent fallback ──

#[tokio::test]
async fn vague_input_falls_back_to_general_diagnosis() {
    let h = harness().await;
    let result = h
        .controller
        .process_user_input("everything feels weird", Map::new())
        .await
        .unwrap();

    assert_eq!(result.workflow_id, "general_network_diagnosis");
    assert!(result.success);

    let classification = result
        .metadata
        .get("intent_classification")
        .expect("metadata carries the classification");
    assert!(
        classification["reasoning"].as_str().unwrap().contains("fallback"),
        "reasoning: {}",
        classification["reasoning"]
    );
}

// ── T8: replayed traces are idempotent ──

#[tokio::test]
async fn replaying_a_trace_twice_yields_identical_state() {
    let h = harness().await;
    let ts = now_ms();
    let trace: Vec<(String, Vec<u8>)> = vec![
        (
            "rtk/v1/demo/home/gw-1/topology/discovery".to_string(),
            payload(
                "topology.discovery/1.0",
                ts,
                json!({"device": {"role": "gateway", "hostname": "gw"},
                       "interfaces": [{"name": "eth0"}]}),
            ),
        ),
        (
            "rtk/v1/demo/home/ap-01/topology/discovery".to_string(),
            payload(
                "topology.discovery/1.0",
                ts + 10,
                json!({"device": {"role": "ap"}, "interfaces": [{"name": "eth0"}]}),
            ),
        ),
        (
            "rtk/v1/demo/home/gw-1/topology/connections".to_string(),
            payload(
                "topology.connections/1.0",
                ts + 20,
                json!({"connections": [
                    {"from_device": "ap-01", "from_iface": "eth0",
                     "to_device": "gw-1", "to_iface": "eth0",
                     "metrics": {"latency_ms": 2.0}},
                ]}),
            ),
        ),
        (
            "rtk/v1/demo/home/ap-01/telemetry/wifi_clients".to_string(),
            payload(
                "telemetry.wifi_clients/1.0",
                ts + 30,
                json!({"clients": [{"mac": "AA:00:00:00:00:01", "rssi": -60}]}),
            ),
        ),
        (
            "rtk/v1/demo/home/dev02/state".to_string(),
            payload("device.state/1.0", ts + 40, json!({"hostname": "printer"})),
        ),
    ];

    for (topic, raw) in &trace {
        h.controller.inject(topic, raw).await;
    }
    settle().await;
    let devices_once = serde_json::to_value(h.controller.list_devices(&DeviceFilter::default())).unwrap();
    let topo = h.controller.get_topology("demo", "home");
    let once = serde_json::to_value((&topo.interfaces, &topo.connections, &topo.associations)).unwrap();

    for (topic, raw) in &trace {
        h.controller.inject(topic, raw).await;
    }
    settle().await;
    let devices_twice = serde_json::to_value(h.controller.list_devices(&DeviceFilter::default())).unwrap();
    let topo = h.controller.get_topology("demo", "home");
    let twice = serde_json::to_value((&topo.interfaces, &topo.connections, &topo.associations)).unwrap();

    assert_eq!(devices_once, devices_twice);
    assert_eq!(once, twice);
}

// ── Persistence across restart ──

#[tokio::test]
async fn restart_restores_devices_and_topology_from_storage() {
    let storage = Arc::new(MemoryStorage::new());
    {
        let h = harness_with(test_config(), Arc::clone(&storage)).await;
        h.controller
            .inject(
                "rtk/v1/demo/home/gw-1/topology/discovery",
                &payload(
                    "topology.discovery/1.0",
                    now_ms(),
                    json!({"device": {"role": "gateway", "hostname": "gw"},
                           "interfaces": [{"name": "eth0"}]}),
                ),
            )
            .await;
        settle().await;
        h.controller.shutdown().await;
    }

    let h = harness_with(test_config(), storage).await;
    let device = h.controller.get_device("gw-1").expect("device restored");
    assert_eq!(device.hostname.as_deref(), Some("gw"));
    // Liveness is not assumed across restarts.
    assert!(!device.online);
    let topo = h.controller.get_topology("demo", "home");
    assert_eq!(topo.interfaces.len(), 1);
}

// ── RPC surface ──

#[tokio::test]
async fn workflow_catalogue_is_listable() {
    let h = harness().await;
    let workflows = h.controller.list_workflows();
    assert_eq!(workflows.len(), 5);
    assert!(h.controller.get_workflow("wan_connectivity_diagnosis").is_some());
    assert!(h.controller.get_workflow("missing").is_none());
}

#[tokio::test]
async fn loaded_workflows_are_executable() {
    let h = harness().await;
    let report = h
        .controller
        .load_workflows(
            r"
            workflows:
              - id: quick_look
                intent: {primary: quick, secondary: look}
                steps:
                  - {id: topo, type: tool, tool: topology.get_full}
            ",
        )
        .unwrap();
    assert_eq!(report.installed, vec!["quick_look".to_string()]);

    let result = h.controller.execute_workflow("quick_look", Map::new()).await.unwrap();
    assert!(result.success);
    assert!(result.summary.starts_with("1/1"));
}

#[tokio::test]
async fn cancelled_command_ignores_late_replies() {
    let mut h = harness().await;
    let addr = TopicAddr::cmd_req("demo", "site", "dev01");
    let future = h
        .controller
        .issue_command(&addr, "reboot", Map::new(), IssueOptions::default())
        .unwrap();
    let command_id = future.id.clone();
    let (_, raw) = h.requests.recv().await.unwrap();
    let id = request_id(&raw);

    h.controller.cancel_command(&command_id).unwrap();
    let outcome = future.wait().await.unwrap();
    assert_eq!(outcome.state, CommandState::Cancelled);

    // A result arriving after cancellation must not revive the command.
    h.controller
        .inject(
            "rtk/v1/demo/site/dev01/cmd/res",
            &payload(
                "cmd.reboot.result/1.0",
                now_ms(),
                json!({"id": id, "status": "completed", "result": {}}),
            ),
        )
        .await;
    settle().await;
    let record = h.controller.get_command(&command_id).await.unwrap();
    assert_eq!(record.state, CommandState::Cancelled);
}
