// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Controller configuration.
//!
//! Plain data with sensible defaults for every knob the runtime exposes.
//! Loading these from files is a collaborator's job; this crate only defines
//! the shapes and validates the values.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level controller configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Broker connection settings.
    pub broker: BrokerConfig,
    /// Ingress pipeline settings.
    pub ingress: IngressConfig,
    /// Device registry settings.
    pub registry: RegistryConfig,
    /// Command manager settings.
    pub command: CommandConfig,
    /// Workflow engine settings.
    pub workflow: WorkflowConfig,
    /// Schema validation settings.
    pub schema: SchemaConfig,
}

impl ControllerConfig {
    /// Validates cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command.default_retries > 10 {
            return Err(ConfigError::InvalidValue {
                field: "command.default_retries".to_string(),
                detail: "more than 10 retries is not supported".to_string(),
            });
        }
        if self.command.ack_timeout.is_zero() || self.command.result_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "command.timeouts".to_string(),
                detail: "timeouts must be positive".to_string(),
            });
        }
        if self.workflow.max_concurrent == 0 {
            return Err(ConfigError::InvalidValue {
                field: "workflow.max_concurrent".to_string(),
                detail: "must allow at least one workflow".to_string(),
            });
        }
        if self.ingress.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "ingress.queue_capacity".to_string(),
                detail: "ingress queue cannot be zero-sized".to_string(),
            });
        }
        Ok(())
    }
}

/// Broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Optional credentials (username, password).
    pub credentials: Option<(String, String)>,
    /// MQTT keep-alive interval.
    #[serde(with = "duration_secs")]
    pub keep_alive: Duration,
    /// Initial reconnect backoff.
    #[serde(with = "duration_secs")]
    pub reconnect_min: Duration,
    /// Reconnect backoff cap.
    #[serde(with = "duration_secs")]
    pub reconnect_max: Duration,
    /// Client id prefix; a process-unique suffix is appended.
    pub client_id_prefix: String,
    /// Tenant whose presence topic the controller announces itself on.
    pub tenant: String,
    /// Site for the controller's presence topic.
    pub site: String,
    /// Controller instance name used as the presence device id.
    pub controller_id: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            credentials: None,
            keep_alive: Duration::from_secs(30),
            reconnect_min: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(60),
            client_id_prefix: "rtkctl".to_string(),
            tenant: "demo".to_string(),
            site: "site".to_string(),
            controller_id: "controller".to_string(),
        }
    }
}

/// Ingress pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressConfig {
    /// Bounded frame channel capacity between broker client and router.
    pub queue_capacity: usize,
    /// Fill level (0..=queue_capacity) past which `ingress.overload` fires.
    pub high_water_mark: usize,
    /// Router worker count; 0 means `max(4, #cpu)`.
    pub workers: usize,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            high_water_mark: 768,
            workers: 0,
        }
    }
}

impl IngressConfig {
    /// Resolves the effective worker count.
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        let cpus = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        cpus.max(4)
    }
}

/// Device registry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Devices unseen for longer than this are marked offline.
    #[serde(with = "duration_secs")]
    pub stale_horizon: Duration,
    /// How often the staleness sweeper runs.
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stale_horizon: Duration::from_secs(90),
            sweep_interval: Duration::from_secs(15),
        }
    }
}

/// Command manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// How long to wait for a `cmd/ack` before retrying.
    #[serde(with = "duration_secs")]
    pub ack_timeout: Duration,
    /// Default wait for a `cmd/res` after the ack.
    #[serde(with = "duration_secs")]
    pub result_timeout: Duration,
    /// Default retry budget when the caller does not supply one.
    pub default_retries: u32,
    /// How long a terminal command stays readable in memory.
    #[serde(with = "duration_secs")]
    pub eviction_grace: Duration,
    /// Maximum in-flight commands per device; 0 disables the cap.
    pub max_in_flight_per_device: usize,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(5),
            result_timeout: Duration::from_secs(30),
            default_retries: 1,
            eviction_grace: Duration::from_secs(60),
            max_in_flight_per_device: 8,
        }
    }
}

/// Workflow engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// System-wide cap on concurrent top-level executions.
    pub max_concurrent: usize,
    /// Default per-step timeout when the step does not set one.
    #[serde(with = "duration_secs")]
    pub default_step_timeout: Duration,
    /// Overall per-workflow timeout.
    #[serde(with = "duration_secs")]
    pub workflow_timeout: Duration,
    /// Shutdown grace period for draining in-flight executions.
    #[serde(with = "duration_secs")]
    pub drain_grace: Duration,
    /// Intent classifier settings.
    pub intent: IntentConfig,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            default_step_timeout: Duration::from_secs(30),
            workflow_timeout: Duration::from_secs(300),
            drain_grace: Duration::from_secs(30),
            intent: IntentConfig::default(),
        }
    }
}

/// Intent classifier thresholds and fallback selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentConfig {
    /// LLM confidence at or above which the classification is accepted.
    pub high_threshold: f64,
    /// LLM confidence at or above which it is accepted with a warning.
    pub medium_threshold: f64,
    /// Minimum rule-based score to accept a keyword match.
    pub min_confidence: f64,
    /// LLM attempts before falling back to rules.
    pub max_llm_retries: u32,
    /// Workflow executed when nothing else matches.
    pub general_workflow: String,
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            high_threshold: 0.8,
            medium_threshold: 0.6,
            min_confidence: 0.4,
            max_llm_retries: 2,
            general_workflow: "general_network_diagnosis".to_string(),
        }
    }
}

/// Schema validation settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Reject payloads that fail validation instead of logging and accepting.
    pub strict: bool,
}

mod duration_secs {
    //! Serde helpers storing durations as whole seconds.

    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
