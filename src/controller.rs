// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The controller composition root.
//!
//! Wires the subsystems together exactly once, by constructor injection:
//! storage, event bus, schema validator, registry, topology store, command
//! manager, tool engine, workflow engine, router, broker client. No
//! subsystem looks another up at runtime.
//!
//! [`Controller::start`] runs the full broker-connected controller;
//! [`Controller::offline`] builds the same wiring without network I/O, with
//! frames injected through [`Controller::inject`] — the path used by tests
//! and embedded simulators. Both share every subsystem and code path past
//! the transport seam.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::command::{
    CommandFilter, CommandFuture, CommandManager, CommandManagerStats, CommandPublisher,
    CommandRecord, IssueOptions,
};
use crate::config::ControllerConfig;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::event::{ControllerEvent, EventBus};
use crate::llm::{LlmClient, StubLlmClient};
use crate::protocol::{BrokerClient, BrokerStats, FrameHandler, IngressFrame, RouterStats, TopicRouter};
use crate::registry::{Device, DeviceFilter, DeviceRegistry, RegistryStats};
use crate::schema::{SchemaValidator, ValidatorStats};
use crate::storage::{MemoryStorage, Storage};
use crate::tools::{ToolEngine, register_builtin_tools};
use crate::topic::{TopicAddr, TopicKind};
use crate::topology::{TopologySnapshot, TopologyStats, TopologyStore};
use crate::workflow::{
    ClassifyRequest, LoadReport, MetricsSnapshot, WorkflowDefinition, WorkflowEngine,
    WorkflowResult,
};

/// Aggregated counters across all subsystems.
#[derive(Debug, Clone, Default)]
pub struct ControllerStats {
    /// Router counters.
    pub router: RouterStats,
    /// Registry counters.
    pub registry: RegistryStats,
    /// Topology counters.
    pub topology: TopologyStats,
    /// Command manager counters.
    pub commands: CommandManagerStats,
    /// Schema validator counters.
    pub validator: ValidatorStats,
    /// Broker counters; absent in offline mode.
    pub broker: Option<BrokerStats>,
    /// Workflow metrics.
    pub workflows: MetricsSnapshot,
}

/// Routes decoded frames to the owning subsystem.
///
/// Per-device ordering is guaranteed by the router's partitioned workers;
/// this dispatcher only selects the handler.
struct IngestDispatcher {
    registry: Arc<DeviceRegistry>,
    topology: Arc<TopologyStore>,
    commands: CommandManager,
}

#[async_trait]
impl FrameHandler for IngestDispatcher {
    async fn handle(&self, addr: TopicAddr, envelope: Envelope) {
        let outcome = match (addr.kind, addr.sub.as_deref()) {
            (TopicKind::Topology, Some("discovery")) => {
                self.topology.apply_discovery(&addr, &envelope).await
            }
            (TopicKind::Topology, Some("connections")) => {
                self.topology.apply_connections(&addr, &envelope).await
            }
            (TopicKind::Telemetry, Some("wifi_clients")) => {
                self.topology.apply_wifi_clients(&addr, &envelope).await
            }
            (TopicKind::Cmd, Some("ack")) => {
                self.registry.observe(&addr, &envelope).await;
                self.commands.handle_ack(&addr, &envelope)
            }
            (TopicKind::Cmd, Some("res")) => {
                self.registry.observe(&addr, &envelope).await;
                self.commands.handle_result(&addr, &envelope)
            }
            // The controller's own outbound requests echo back via the
            // wildcard subscription; nothing to do.
            (TopicKind::Cmd, Some("req")) => Ok(()),
            // state, attr, lwt, evt/*, remaining telemetry, unknown
            // topology subs: identity/liveness only, payload kept raw.
            _ => {
                self.registry.observe(&addr, &envelope).await;
                Ok(())
            }
        };
        if let Err(e) = outcome {
            tracing::debug!(
                device = %addr.device_id,
                kind = %addr.kind,
                error = %e,
                "handler dropped payload"
            );
        }
    }
}

/// The assembled controller runtime.
pub struct Controller {
    config: ControllerConfig,
    events: EventBus,
    registry: Arc<DeviceRegistry>,
    topology: Arc<TopologyStore>,
    commands: CommandManager,
    tools: Arc<ToolEngine>,
    workflows: Arc<WorkflowEngine>,
    router: Arc<TopicRouter>,
    broker: Option<BrokerClient>,
    validator: Arc<SchemaValidator>,
    cancel: CancellationToken,
}

impl Controller {
    /// Starts a broker-connected controller with default storage and a stub
    /// LLM adapter.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::error::ConfigError`] for invalid configuration or
    /// a storage error when restoring persisted state fails.
    pub async fn start(config: ControllerConfig) -> Result<Arc<Self>> {
        Self::start_with(
            config,
            Arc::new(MemoryStorage::new()),
            Arc::new(StubLlmClient::default()),
        )
        .await
    }

    /// Starts a broker-connected controller over the given storage and LLM
    /// adapter.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::error::ConfigError`] for invalid configuration or
    /// a storage error when restoring persisted state fails.
    pub async fn start_with(
        config: ControllerConfig,
        storage: Arc<dyn Storage>,
        llm: Arc<dyn LlmClient>,
    ) -> Result<Arc<Self>> {
        let events = EventBus::new();
        let (broker, event_loop) =
            BrokerClient::new(config.broker.clone(), config.ingress.clone(), events.clone());
        let controller = Self::assemble(
            config,
            storage,
            llm,
            events,
            Arc::new(broker.clone()),
            Some(broker),
        )
        .await?;

        // Ingress: broker loop -> frame channel -> router workers.
        let (frames_tx, mut frames_rx) =
            mpsc::channel::<IngressFrame>(controller.config.ingress.queue_capacity);
        tokio::spawn(event_loop.run(frames_tx, controller.cancel.clone()));
        tokio::spawn({
            let router = Arc::clone(&controller.router);
            let cancel = controller.cancel.clone();
            async move {
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        frame = frames_rx.recv() => match frame {
                            Some(frame) => router.route(frame).await,
                            None => break,
                        }
                    }
                }
                tracing::debug!("ingress pump stopped");
            }
        });

        Ok(controller)
    }

    /// Builds the full wiring without any broker I/O.
    ///
    /// Frames are fed in through [`inject`](Self::inject); outbound command
    /// requests go to the supplied publisher.
    ///
    /// # Errors
    ///
    /// Returns a [`crate::error::ConfigError`] for invalid configuration or
    /// a storage error when restoring persisted state fails.
    pub async fn offline(
        config: ControllerConfig,
        storage: Arc<dyn Storage>,
        llm: Arc<dyn LlmClient>,
        publisher: Arc<dyn CommandPublisher>,
    ) -> Result<Arc<Self>> {
        let events = EventBus::new();
        Self::assemble(config, storage, llm, events, publisher, None).await
    }

    async fn assemble(
        config: ControllerConfig,
        storage: Arc<dyn Storage>,
        llm: Arc<dyn LlmClient>,
        events: EventBus,
        publisher: Arc<dyn CommandPublisher>,
        broker: Option<BrokerClient>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let validator = Arc::new(SchemaValidator::new(config.schema.strict));
        let registry = Arc::new(DeviceRegistry::new(
            Arc::clone(&storage),
            events.clone(),
            config.registry.clone(),
        ));
        let topology = Arc::new(TopologyStore::new(
            Arc::clone(&registry),
            Arc::clone(&storage),
            events.clone(),
            config.registry.stale_horizon,
        ));
        let commands = CommandManager::new(
            publisher,
            Arc::clone(&storage),
            events.clone(),
            config.command.clone(),
        );
        let tools = Arc::new(ToolEngine::new(
            Arc::clone(&registry),
            Arc::clone(&topology),
            commands.clone(),
            config.broker.tenant.clone(),
            config.broker.site.clone(),
        ));
        register_builtin_tools(&tools);
        let workflows = Arc::new(WorkflowEngine::new(
            Arc::clone(&tools),
            Arc::clone(&storage),
            events.clone(),
            llm,
            config.workflow.clone(),
        ));

        // Last-known state comes back before any live traffic is processed.
        registry.restore().await.map_err(Error::Storage)?;
        topology.restore().await.map_err(Error::Storage)?;

        let dispatcher = Arc::new(IngestDispatcher {
            registry: Arc::clone(&registry),
            topology: Arc::clone(&topology),
            commands: commands.clone(),
        });
        let router = Arc::new(TopicRouter::start(
            dispatcher,
            Arc::clone(&validator),
            config.ingress.effective_workers(),
            config.ingress.queue_capacity,
        ));

        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&registry).sweeper_loop(cancel.clone()));
        tokio::spawn(Arc::clone(&topology).sweeper_loop(
            config.registry.sweep_interval,
            cancel.clone(),
        ));

        tracing::info!(
            tenant = %config.broker.tenant,
            site = %config.broker.site,
            broker = broker.is_some(),
            "controller assembled"
        );
        Ok(Arc::new(Self {
            config,
            events,
            registry,
            topology,
            commands,
            tools,
            workflows,
            router,
            broker,
            validator,
            cancel,
        }))
    }

    // ── Ingress ──

    /// Feeds one raw frame through the router, as if it arrived from the
    /// broker. Retained and live frames are treated identically.
    pub async fn inject(&self, topic: &str, payload: &[u8]) {
        self.router
            .route(IngressFrame {
                topic: topic.to_string(),
                payload: payload.to_vec(),
                retained: false,
            })
            .await;
    }

    // ── RPC surface ──

    /// Classifies a natural-language request and runs the selected workflow.
    ///
    /// # Errors
    ///
    /// See [`WorkflowEngine::process_user_input`].
    pub async fn process_user_input(
        &self,
        input: &str,
        context: Map<String, Value>,
    ) -> Result<WorkflowResult> {
        self.workflows.process_user_input(input, context).await
    }

    /// Classifies a full request (device info, manual override) and runs the
    /// selected workflow.
    ///
    /// # Errors
    ///
    /// See [`WorkflowEngine::process_request`].
    pub async fn process_request(&self, request: ClassifyRequest) -> Result<WorkflowResult> {
        self.workflows.process_request(request).await
    }

    /// Runs a workflow by id.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::WorkflowError::UnknownWorkflow`] for an
    /// unregistered id.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        parameters: Map<String, Value>,
    ) -> Result<WorkflowResult> {
        self.workflows.execute_workflow(workflow_id, parameters).await
    }

    /// Returns the installed workflow definitions.
    #[must_use]
    pub fn list_workflows(&self) -> Vec<Arc<WorkflowDefinition>> {
        self.workflows.list_workflows()
    }

    /// Returns one workflow definition.
    #[must_use]
    pub fn get_workflow(&self, workflow_id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.workflows.get_workflow(workflow_id)
    }

    /// Loads additional workflow definitions from YAML text.
    ///
    /// # Errors
    ///
    /// See [`WorkflowEngine::load_workflows`].
    pub fn load_workflows(&self, source: &str) -> std::result::Result<LoadReport, crate::error::ConfigError> {
        self.workflows.load_workflows(source, &self.tools)
    }

    /// Issues a command to a device.
    ///
    /// # Errors
    ///
    /// See [`CommandManager::issue`].
    pub fn issue_command(
        &self,
        addr: &TopicAddr,
        op: &str,
        args: Map<String, Value>,
        opts: IssueOptions,
    ) -> Result<CommandFuture> {
        self.commands.issue(addr, op, args, opts)
    }

    /// Cancels a command.
    ///
    /// # Errors
    ///
    /// See [`CommandManager::cancel`].
    pub fn cancel_command(&self, command_id: &str) -> Result<()> {
        self.commands.cancel(command_id).map_err(Error::Command)
    }

    /// Returns one command record, falling back to the audit store.
    pub async fn get_command(&self, command_id: &str) -> Option<CommandRecord> {
        self.commands.get(command_id).await
    }

    /// Lists in-memory command records.
    #[must_use]
    pub fn list_commands(&self, filter: &CommandFilter) -> Vec<CommandRecord> {
        self.commands.list(filter)
    }

    /// Returns the topology snapshot for a site.
    #[must_use]
    pub fn get_topology(&self, tenant: &str, site: &str) -> TopologySnapshot {
        self.topology.snapshot(tenant, site)
    }

    /// Lists devices matching the filter.
    #[must_use]
    pub fn list_devices(&self, filter: &DeviceFilter) -> Vec<Device> {
        self.registry.list(filter)
    }

    /// Returns one device.
    #[must_use]
    pub fn get_device(&self, device_id: &str) -> Option<Device> {
        self.registry.get(device_id)
    }

    /// Removes a device; the explicit admin destroy path.
    pub async fn remove_device(&self, device_id: &str) -> bool {
        self.registry.remove(device_id).await
    }

    /// Subscribes to controller events.
    #[must_use]
    pub fn events(&self) -> tokio::sync::broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    /// Reloads the schema validator's rule set.
    pub fn reload_schemas(&self, rules: crate::schema::SchemaSet) {
        self.validator.reload(rules);
    }

    /// Returns aggregated counters across all subsystems.
    #[must_use]
    pub fn stats(&self) -> ControllerStats {
        ControllerStats {
            router: self.router.stats(),
            registry: self.registry.stats(),
            topology: self.topology.stats(),
            commands: self.commands.stats(),
            validator: self.validator.stats(),
            broker: self.broker.as_ref().map(BrokerClient::stats),
            workflows: self.workflows.metrics(),
        }
    }

    // ── Lifecycle ──

    /// Shuts the controller down in reverse construction order.
    ///
    /// Drains in-flight workflows up to the configured grace period, cancels
    /// what remains (their commands move to `cancelled`), stops the ingress
    /// machinery, and closes the broker session after retracting presence.
    pub async fn shutdown(&self) {
        tracing::info!("controller shutting down");
        self.workflows.shutdown(self.config.workflow.drain_grace).await;
        self.commands.cancel_all();
        self.cancel.cancel();

        if let Some(broker) = &self.broker {
            let presence = TopicAddr {
                tenant: self.config.broker.tenant.clone(),
                site: self.config.broker.site.clone(),
                device_id: self.config.broker.controller_id.clone(),
                kind: TopicKind::Lwt,
                sub: None,
            };
            let mut body = Map::new();
            body.insert("status".to_string(), Value::String("offline".to_string()));
            let payload =
                Envelope::new(crate::envelope::SchemaId::new("device.lwt", 1, 0), body).encode();
            if let Err(e) = broker.publish_qos1(&presence.to_string(), payload, true).await {
                tracing::debug!(error = %e, "presence retraction failed during shutdown");
            }
            if let Err(e) = broker.disconnect().await {
                tracing::debug!(error = %e, "broker disconnect failed during shutdown");
            }
        }
        tracing::info!("controller stopped");
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("devices", &self.registry.count())
            .field("broker", &self.broker.is_some())
            .finish()
    }
}
