// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `rtkctl` - Controller runtime for an MQTT device-management fabric.
//!
//! Devices (routers, access points, mesh nodes, sensors, clients) publish
//! state, telemetry, events and topology reports on a versioned topic
//! hierarchy and subscribe for command requests. This crate is the central
//! controller: it ingests those streams, maintains a live model of the fleet
//! (identity, topology, link quality, health), issues commands with
//! ack/result correlation, and orchestrates multi-step diagnostic workflows
//! selected from natural-language intents.
//!
//! # Architecture
//!
//! ```text
//! MQTT frames → BrokerClient → TopicRouter → typed handlers
//!                                      ├→ DeviceRegistry   (identity, liveness)
//!                                      ├→ TopologyStore    (graph, wifi clients)
//!                                      └→ CommandManager   (ack/result futures)
//!
//! RPC → WorkflowEngine → ToolEngine → {Registry | Topology | CommandManager}
//! ```
//!
//! The [`Controller`] is the composition root: it wires the subsystems once
//! at startup and exposes the public surface (`process_user_input`,
//! `execute_workflow`, `issue_command`, `get_topology`, `list_devices`).
//!
//! # Quick Start
//!
//! ```no_run
//! use rtkctl::{Controller, ControllerConfig};
//!
//! #[tokio::main]
//! async fn main() -> rtkctl::Result<()> {
//!     let mut config = ControllerConfig::default();
//!     config.broker.host = "192.168.1.10".to_string();
//!     config.broker.tenant = "demo".to_string();
//!     config.broker.site = "home".to_string();
//!
//!     let controller = Controller::start(config).await?;
//!
//!     // Ask the controller a question in plain language.
//!     let result = controller
//!         .process_user_input("the wifi is weak in the bedroom", serde_json::Map::new())
//!         .await?;
//!     println!("{}", result.summary);
//!
//!     controller.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Replaceable seams
//!
//! Three collaborators plug in from outside the crate:
//!
//! - [`storage::Storage`] — durable K/V with TTL; [`storage::MemoryStorage`]
//!   is the in-process default.
//! - [`llm::LlmClient`] — the intent classifier's completion backend;
//!   [`llm::StubLlmClient`] returns canned JSON and keeps the controller
//!   fully offline-capable.
//! - [`command::CommandPublisher`] — the outbound publish seam, implemented
//!   by the broker client in production and by channel fakes in tests.

pub mod command;
pub mod config;
mod controller;
pub mod envelope;
pub mod error;
pub mod event;
pub mod llm;
pub mod protocol;
pub mod registry;
pub mod schema;
pub mod storage;
pub mod tools;
pub mod topic;
pub mod topology;
pub mod workflow;

pub use command::{
    CommandFilter, CommandFuture, CommandManager, CommandOutcome, CommandPublisher, CommandRecord,
    CommandState, IssueOptions,
};
pub use config::ControllerConfig;
pub use controller::{Controller, ControllerStats};
pub use envelope::{Envelope, SchemaId};
pub use error::{Error, Result};
pub use event::{ControllerEvent, EventBus};
pub use llm::{LlmClient, StubLlmClient};
pub use protocol::{BrokerClient, TopicRouter};
pub use registry::{Device, DeviceFilter, DeviceRegistry, DeviceRole};
pub use schema::SchemaValidator;
pub use storage::{MemoryStorage, Storage};
pub use tools::{ToolEngine, ToolHandler, ToolResult};
pub use topic::{TopicAddr, TopicKind};
pub use topology::{TopologySnapshot, TopologyStore};
pub use workflow::{
    ClassifyRequest, Intent, IntentKey, WorkflowDefinition, WorkflowEngine, WorkflowResult,
};
