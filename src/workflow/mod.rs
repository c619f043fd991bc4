// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Workflow engine.
//!
//! Orchestrates multi-step diagnostic workflows: the registry holds the
//! validated definitions, the intent classifier turns user input into a
//! workflow selection, the executor runs the step DAG against the tool
//! engine, and metrics aggregate over executions.
//!
//! The engine is wired once at startup by the composition root; workflows
//! reach the rest of the controller only through tool invocations.

mod definition;
mod executor;
mod intent;
mod metrics;
mod registry;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use crate::config::WorkflowConfig;
use crate::error::{Error, WorkflowError};
use crate::event::EventBus;
use crate::llm::LlmClient;
use crate::storage::Storage;
use crate::tools::ToolEngine;

pub use definition::{
    Condition, ConditionOp, IntentKey, ParamValue, RetryPolicy, Step, StepType,
    WorkflowDefinition, walk_path,
};
pub use executor::{StepResult, WorkflowExecutor, WorkflowResult};
pub use intent::{ClassifyRequest, Intent, IntentClassifier, IntentRule, extract_parameters};
pub use metrics::{MetricsSnapshot, WorkflowMetrics, WorkflowStat};
pub use registry::{LoadReport, WorkflowRegistry};

/// The workflow engine facade.
pub struct WorkflowEngine {
    registry: Arc<WorkflowRegistry>,
    classifier: IntentClassifier,
    executor: WorkflowExecutor,
    metrics: Arc<WorkflowMetrics>,
    cancel_root: CancellationToken,
    max_concurrent: usize,
}

impl WorkflowEngine {
    /// Creates an engine seeded with the built-in workflow catalogue.
    #[must_use]
    pub fn new(
        tools: Arc<ToolEngine>,
        storage: Arc<dyn Storage>,
        events: EventBus,
        llm: Arc<dyn LlmClient>,
        config: WorkflowConfig,
    ) -> Self {
        let registry = Arc::new(WorkflowRegistry::with_builtins(&tools));
        let classifier = IntentClassifier::new(llm, config.intent.clone());
        let metrics = Arc::new(WorkflowMetrics::new());
        let max_concurrent = config.max_concurrent;
        let executor = WorkflowExecutor::new(
            tools,
            storage,
            events,
            Arc::clone(&metrics),
            config,
        );
        Self {
            registry,
            classifier,
            executor,
            metrics,
            cancel_root: CancellationToken::new(),
            max_concurrent,
        }
    }

    /// Classifies a natural-language request and executes the selected
    /// workflow.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::UnknownWorkflow`] only when classification
    /// selects a workflow that has since been removed.
    pub async fn process_user_input(
        &self,
        user_input: &str,
        context: Map<String, Value>,
    ) -> Result<WorkflowResult, Error> {
        self.process_request(ClassifyRequest {
            user_input: user_input.to_string(),
            context,
            ..ClassifyRequest::default()
        })
        .await
    }

    /// Classifies a full request (context, device info, manual override) and
    /// executes the selected workflow.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::UnknownWorkflow`] only when classification
    /// selects a workflow that has since been removed.
    pub async fn process_request(
        &self,
        request: ClassifyRequest,
    ) -> Result<WorkflowResult, Error> {
        let intent = self.classifier.classify(&request, &self.registry).await;
        tracing::info!(
            workflow = %intent.workflow_id,
            primary = %intent.primary,
            secondary = %intent.secondary,
            confidence = intent.confidence,
            "intent classified"
        );

        let definition = self
            .registry
            .get(&intent.workflow_id)
            .ok_or_else(|| WorkflowError::UnknownWorkflow(intent.workflow_id.clone()))?;

        let mut metadata = Map::new();
        metadata.insert(
            "intent_classification".to_string(),
            json!({
                "primary": intent.primary,
                "secondary": intent.secondary,
                "confidence": intent.confidence,
                "reasoning": intent.reasoning,
            }),
        );

        Ok(self
            .executor
            .execute(
                definition,
                intent.parameters,
                metadata,
                self.cancel_root.child_token(),
            )
            .await)
    }

    /// Executes a workflow by id with explicit parameters.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::UnknownWorkflow`] for an unregistered id.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        parameters: Map<String, Value>,
    ) -> Result<WorkflowResult, Error> {
        let definition = self
            .registry
            .get(workflow_id)
            .ok_or_else(|| WorkflowError::UnknownWorkflow(workflow_id.to_string()))?;
        Ok(self
            .executor
            .execute(
                definition,
                parameters,
                Map::new(),
                self.cancel_root.child_token(),
            )
            .await)
    }

    /// Returns all installed workflow definitions.
    #[must_use]
    pub fn list_workflows(&self) -> Vec<Arc<WorkflowDefinition>> {
        self.registry.list()
    }

    /// Returns one workflow definition.
    #[must_use]
    pub fn get_workflow(&self, workflow_id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.registry.get(workflow_id)
    }

    /// Loads additional workflow definitions from YAML text.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ConfigError::UnparseableSource`] when the
    /// document does not parse; individually invalid workflows are reported
    /// in the [`LoadReport`] without disturbing the installed set.
    pub fn load_workflows(
        &self,
        source: &str,
        tools: &ToolEngine,
    ) -> Result<LoadReport, crate::error::ConfigError> {
        self.registry.load_yaml(source, tools)
    }

    /// Replaces the intent keyword rules.
    pub fn reload_intent_rules(&self, rules: Vec<IntentRule>) {
        self.classifier.reload_rules(rules);
    }

    /// Returns a snapshot of the execution metrics.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Drains in-flight executions up to `grace`, then cancels the rest.
    pub async fn shutdown(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        while self.executor.available_slots() < self.max_concurrent {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!("drain grace elapsed, cancelling in-flight workflows");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.cancel_root.cancel();
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("workflows", &self.registry.len())
            .field("available_slots", &self.executor.available_slots())
            .finish()
    }
}
