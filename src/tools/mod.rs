// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tool engine.
//!
//! Workflows never touch the registry, topology store or command manager
//! directly; they call named tools through this uniform surface. A tool
//! consumes a parameter map and returns a [`ToolResult`]; handlers either
//! read controller state synchronously or issue device commands and wait on
//! their futures.
//!
//! Invocations carry the calling workflow's session id so logs and metrics
//! line up across subsystems.

mod builtin;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::command::CommandManager;
use crate::registry::DeviceRegistry;
use crate::topology::TopologyStore;

pub use builtin::register_builtin_tools;

/// Result of one tool invocation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolResult {
    /// Whether the tool succeeded.
    pub success: bool,
    /// Tool-specific result data.
    pub data: Value,
    /// Error text when the tool failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock execution time.
    #[serde(rename = "duration_ms", serialize_with = "serialize_duration_ms")]
    pub duration: Duration,
}

fn serialize_duration_ms<S: serde::Serializer>(
    duration: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

impl ToolResult {
    /// Builds a successful result.
    #[must_use]
    pub fn ok(data: Value, duration: Duration) -> Self {
        Self {
            success: true,
            data,
            error: None,
            duration,
        }
    }

    /// Builds a failed result.
    #[must_use]
    pub fn err(error: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(error.into()),
            duration,
        }
    }
}

/// Per-invocation context handed to tool handlers.
#[derive(Clone)]
pub struct ToolContext {
    /// Device registry read access.
    pub registry: Arc<DeviceRegistry>,
    /// Topology read access.
    pub topology: Arc<TopologyStore>,
    /// Command issue surface.
    pub commands: CommandManager,
    /// Tenant to use when parameters do not name one.
    pub default_tenant: String,
    /// Site to use when parameters do not name one.
    pub default_site: String,
    /// Workflow session the invocation belongs to.
    pub session_id: String,
    /// Cancellation scope; propagates to issued commands.
    pub cancel: CancellationToken,
}

impl ToolContext {
    /// Resolves the tenant for this invocation.
    #[must_use]
    pub fn tenant<'a>(&'a self, params: &'a Map<String, Value>) -> &'a str {
        params
            .get("tenant")
            .and_then(Value::as_str)
            .unwrap_or(&self.default_tenant)
    }

    /// Resolves the site for this invocation.
    #[must_use]
    pub fn site<'a>(&'a self, params: &'a Map<String, Value>) -> &'a str {
        params
            .get("site")
            .and_then(Value::as_str)
            .unwrap_or(&self.default_site)
    }
}

/// A named callable registered with the tool engine.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Registry name, e.g. `topology.get_full`.
    fn name(&self) -> &'static str;

    /// One-line description for listings.
    fn description(&self) -> &'static str;

    /// Runs the tool.
    ///
    /// # Errors
    ///
    /// Returns the error text surfaced in the failed [`ToolResult`].
    async fn invoke(&self, ctx: &ToolContext, params: &Map<String, Value>)
    -> Result<Value, String>;
}

/// The tool registry and invocation surface.
pub struct ToolEngine {
    registry: Arc<DeviceRegistry>,
    topology: Arc<TopologyStore>,
    commands: CommandManager,
    default_tenant: String,
    default_site: String,
    tools: RwLock<HashMap<&'static str, Arc<dyn ToolHandler>>>,
}

impl ToolEngine {
    /// Creates an engine with an empty tool registry.
    #[must_use]
    pub fn new(
        registry: Arc<DeviceRegistry>,
        topology: Arc<TopologyStore>,
        commands: CommandManager,
        default_tenant: impl Into<String>,
        default_site: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            topology,
            commands,
            default_tenant: default_tenant.into(),
            default_site: default_site.into(),
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a handler, replacing any previous one with the same name.
    pub fn register(&self, handler: Arc<dyn ToolHandler>) {
        let name = handler.name();
        tracing::debug!(tool = %name, "registering tool");
        self.tools.write().insert(name, handler);
    }

    /// Whether a tool is registered under `name`.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    /// Returns the sorted tool names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .read()
            .keys()
            .map(|k| (*k).to_string())
            .collect();
        names.sort();
        names
    }

    /// Invokes a tool by name.
    ///
    /// Never panics and never returns a transport-level error: every failure
    /// mode is folded into a failed [`ToolResult`].
    pub async fn invoke(
        &self,
        name: &str,
        params: &Map<String, Value>,
        session_id: &str,
        cancel: CancellationToken,
    ) -> ToolResult {
        let started = std::time::Instant::now();
        let Some(handler) = self.tools.read().get(name).cloned() else {
            return ToolResult::err(format!("unknown tool: {name}"), started.elapsed());
        };

        let ctx = ToolContext {
            registry: Arc::clone(&self.registry),
            topology: Arc::clone(&self.topology),
            commands: self.commands.clone(),
            default_tenant: self.default_tenant.clone(),
            default_site: self.default_site.clone(),
            session_id: session_id.to_string(),
            cancel: cancel.clone(),
        };

        tracing::debug!(tool = %name, session = %session_id, "invoking tool");
        let result = tokio::select! {
            () = cancel.cancelled() => Err("cancelled".to_string()),
            result = handler.invoke(&ctx, params) => result,
        };
        let duration = started.elapsed();

        match result {
            Ok(data) => ToolResult::ok(data, duration),
            Err(error) => {
                tracing::warn!(tool = %name, session = %session_id, error = %error, "tool failed");
                ToolResult::err(error, duration)
            }
        }
    }
}

impl std::fmt::Debug for ToolEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolEngine")
            .field("tools", &self.tools.read().len())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl ToolHandler for EchoTool {
        fn name(&self) -> &'static str {
            "test.echo"
        }

        fn description(&self) -> &'static str {
            "echoes its parameters"
        }

        async fn invoke(
            &self,
            _ctx: &ToolContext,
            params: &Map<String, Value>,
        ) -> Result<Value, String> {
            Ok(Value::Object(params.clone()))
        }
    }

    struct FailTool;

    #[async_trait]
    impl ToolHandler for FailTool {
        fn name(&self) -> &'static str {
            "test.fail"
        }

        fn description(&self) -> &'static str {
            "always fails"
        }

        async fn invoke(
            &self,
            _ctx: &ToolContext,
            _params: &Map<String, Value>,
        ) -> Result<Value, String> {
            Err("deliberate failure".to_string())
        }
    }

    #[tokio::test]
    async fn invoke_routes_to_registered_tool() {
        let (engine, ..) = test_support::engine();
        engine.register(Arc::new(EchoTool));

        let mut params = Map::new();
        params.insert("x".to_string(), json!(1));
        let result = engine
            .invoke("test.echo", &params, "s-1", CancellationToken::new())
            .await;
        assert!(result.success);
        assert_eq!(result.data, json!({"x": 1}));
    }

    #[tokio::test]
    async fn unknown_tool_fails_cleanly() {
        let (engine, ..) = test_support::engine();
        let result = engine
            .invoke("no.such.tool", &Map::new(), "s-1", CancellationToken::new())
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("unknown tool"));
    }

    #[tokio::test]
    async fn failing_tool_surfaces_error() {
        let (engine, ..) = test_support::engine();
        engine.register(Arc::new(FailTool));
        let result = engine
            .invoke("test.fail", &Map::new(), "s-1", CancellationToken::new())
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("deliberate failure"));
    }

    #[tokio::test]
    async fn cancelled_invocation_fails() {
        let (engine, ..) = test_support::engine();
        engine.register(Arc::new(EchoTool));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = engine.invoke("test.echo", &Map::new(), "s-1", cancel).await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn builtin_catalogue_is_registered() {
        let (engine, ..) = test_support::engine();
        for name in [
            "topology.get_full",
            "topology.get_device",
            "topology.get_neighbors",
            "registry.list_devices",
            "wifi.signal_strength_map",
            "wifi.analyze_channels",
            "wifi.interference_scan",
            "network.latency_analysis",
            "network.bandwidth_report",
            "diagnostics.wan_connectivity",
            "diagnostics.device_health",
            "device.get_system_info",
            "device.reboot",
            "device.run_speed_test",
        ] {
            assert!(engine.has(name), "missing builtin tool {name}");
        }
    }
}
