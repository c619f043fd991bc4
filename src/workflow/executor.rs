// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Workflow execution.
//!
//! One executor task runs per workflow. Steps execute in definition order;
//! `parallel` blocks fan out into child tasks, `sequential` blocks stop on
//! the first non-optional failure, and `condition` blocks gate a nested
//! sequential run. Every step writes its result into the execution context
//! so later steps can reference it with `${step.field}` parameters.
//!
//! Timeouts are scoped cancellations: the workflow carries a cancellation
//! token, each step runs under its own time budget, and both propagate into
//! tool calls and the commands they issue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, join_all};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::WorkflowConfig;
use crate::envelope::now_ms;
use crate::event::{ControllerEvent, EventBus};
use crate::storage::{Storage, workflow_result_key};
use crate::tools::{ToolEngine, ToolResult};

use super::definition::{Condition, Step, StepType, WorkflowDefinition, walk_path};
use super::metrics::WorkflowMetrics;

/// Result of one executed (or skipped) step.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    /// Step id.
    pub step_id: String,
    /// Step kind.
    pub step_type: StepType,
    /// Tool invoked, for tool steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// Step start, unix ms.
    pub start: i64,
    /// Step end, unix ms.
    pub end: i64,
    /// Step duration, milliseconds.
    pub duration_ms: u64,
    /// Whether the step succeeded.
    pub success: bool,
    /// Whether the step was skipped by a false condition.
    pub skipped: bool,
    /// Retries consumed by this step.
    pub retry_count: u32,
    /// Full tool result, for tool steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResult>,
    /// Nested results, definition order, for container steps.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sub_steps: Vec<StepResult>,
    /// Error text for failed steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    fn skipped(step: &Step, at: i64) -> Self {
        Self {
            step_id: step.id.clone(),
            step_type: step.step_type,
            tool: step.tool.clone(),
            start: at,
            end: at,
            duration_ms: 0,
            success: false,
            skipped: true,
            retry_count: 0,
            tool_result: None,
            sub_steps: Vec::new(),
            error: None,
        }
    }

    /// Whether this result blocks a non-optional continuation.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        !self.success && !self.skipped
    }

    /// Counts `(succeeded, executed)` tool leaves under this result.
    fn leaf_counts(&self) -> (usize, usize) {
        match self.step_type {
            StepType::Tool => {
                if self.skipped {
                    (0, 0)
                } else {
                    (usize::from(self.success), 1)
                }
            }
            StepType::Parallel | StepType::Sequential | StepType::Condition => self
                .sub_steps
                .iter()
                .map(StepResult::leaf_counts)
                .fold((0, 0), |(s, t), (s2, t2)| (s + s2, t + t2)),
        }
    }
}

/// Aggregate result of one workflow execution.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowResult {
    /// Workflow definition id.
    pub workflow_id: String,
    /// Unique execution session id.
    pub session_id: String,
    /// Execution start, unix ms.
    pub start: i64,
    /// Execution end, unix ms.
    pub end: i64,
    /// Execution duration, milliseconds.
    pub duration_ms: u64,
    /// Overall success.
    pub success: bool,
    /// Top-level step results, definition order.
    pub steps: Vec<StepResult>,
    /// Human-readable outcome line.
    pub summary: String,
    /// Caller-supplied metadata (intent classification and the like).
    pub metadata: Map<String, Value>,
    /// Terminal error for failed executions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Shared state of one execution.
struct ExecutionContext {
    workflow_id: String,
    session_id: String,
    parameters: Map<String, Value>,
    results: Mutex<HashMap<String, StepResult>>,
}

impl ExecutionContext {
    /// Resolves a `${path}` reference: `params.*` reads the workflow
    /// parameters, anything else reads a prior step's tool result data.
    ///
    /// A missing workflow parameter resolves to null (callers rarely supply
    /// every optional parameter); a missing step reference does not resolve.
    fn lookup(&self, path: &str) -> Option<Value> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };

        if head == "params" {
            let root = Value::Object(self.parameters.clone());
            return match rest {
                Some(rest) => Some(walk_path(&root, rest).cloned().unwrap_or(Value::Null)),
                None => Some(root),
            };
        }

        let results = self.results.lock();
        let data = results.get(head)?.tool_result.as_ref()?.data.clone();
        drop(results);
        match rest {
            Some(rest) => walk_path(&data, rest).cloned(),
            None => Some(data),
        }
    }

    fn evaluate(&self, condition: &Condition) -> bool {
        let value = self.lookup(&condition.field);
        condition.evaluate(value.as_ref())
    }
}

/// Executes workflow definitions against the tool engine.
pub struct WorkflowExecutor {
    tools: Arc<ToolEngine>,
    storage: Arc<dyn Storage>,
    events: EventBus,
    metrics: Arc<WorkflowMetrics>,
    semaphore: Arc<Semaphore>,
    config: WorkflowConfig,
}

impl WorkflowExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(
        tools: Arc<ToolEngine>,
        storage: Arc<dyn Storage>,
        events: EventBus,
        metrics: Arc<WorkflowMetrics>,
        config: WorkflowConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            tools,
            storage,
            events,
            metrics,
            semaphore,
            config,
        }
    }

    /// Number of executions that could start right now.
    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Executes a workflow to completion.
    ///
    /// Blocks while the engine is at its concurrency cap. The returned
    /// result is also persisted under `workflow_result:<wf>:<session>`.
    pub async fn execute(
        &self,
        definition: Arc<WorkflowDefinition>,
        parameters: Map<String, Value>,
        metadata: Map<String, Value>,
        cancel: CancellationToken,
    ) -> WorkflowResult {
        let session_id = Uuid::new_v4().to_string();
        let start = now_ms();
        let started = std::time::Instant::now();

        let Ok(_permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
            // The semaphore only closes during shutdown.
            return self.finish(
                &definition.id,
                &session_id,
                start,
                started,
                Vec::new(),
                metadata,
                Some("workflow engine is shutting down".to_string()),
            )
            .await;
        };

        tracing::info!(
            workflow = %definition.id,
            session = %session_id,
            "workflow execution started"
        );
        let ctx = Arc::new(ExecutionContext {
            workflow_id: definition.id.clone(),
            session_id: session_id.clone(),
            parameters,
            results: Mutex::new(HashMap::new()),
        });

        let scope = cancel.child_token();
        let run = self.run_top_level(&definition, &ctx, &scope);
        let (steps, error) = match tokio::time::timeout(self.config.workflow_timeout, run).await {
            Ok(outcome) => outcome,
            Err(_) => {
                scope.cancel();
                (Vec::new(), Some(format!(
                    "workflow timed out after {}s",
                    self.config.workflow_timeout.as_secs()
                )))
            }
        };

        self.finish(&definition.id, &session_id, start, started, steps, metadata, error)
            .await
    }

    async fn run_top_level(
        &self,
        definition: &WorkflowDefinition,
        ctx: &Arc<ExecutionContext>,
        cancel: &CancellationToken,
    ) -> (Vec<StepResult>, Option<String>) {
        let mut steps = Vec::with_capacity(definition.steps.len());
        let mut error = None;
        for step in &definition.steps {
            let result = self.run_step(ctx, step, cancel).await;
            let failed = result.is_failure() && !step.optional;
            let step_error = result.error.clone();
            steps.push(result);
            if failed {
                error = Some(step_error.unwrap_or_else(|| format!("step {} failed", step.id)));
                break;
            }
        }
        (steps, error)
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        workflow_id: &str,
        session_id: &str,
        start: i64,
        started: std::time::Instant,
        steps: Vec<StepResult>,
        metadata: Map<String, Value>,
        error: Option<String>,
    ) -> WorkflowResult {
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let success = error.is_none();
        let (succeeded, executed) = steps
            .iter()
            .map(StepResult::leaf_counts)
            .fold((0, 0), |(s, t), (s2, t2)| (s + s2, t + t2));
        let summary = error.clone().map_or_else(
            || {
                format!(
                    "{succeeded}/{executed} steps succeeded in {:.1}s",
                    started.elapsed().as_secs_f64()
                )
            },
            |e| e,
        );

        let result = WorkflowResult {
            workflow_id: workflow_id.to_string(),
            session_id: session_id.to_string(),
            start,
            end: now_ms(),
            duration_ms,
            success,
            steps,
            summary,
            metadata,
            error,
        };

        self.metrics.record(workflow_id, success, duration_ms);
        self.events.publish(ControllerEvent::WorkflowFinished {
            workflow_id: workflow_id.to_string(),
            session_id: session_id.to_string(),
            success,
        });
        tracing::info!(
            workflow = %workflow_id,
            session = %session_id,
            success,
            summary = %result.summary,
            "workflow execution finished"
        );

        match serde_json::to_vec(&result) {
            Ok(bytes) => {
                let key = workflow_result_key(workflow_id, session_id);
                if let Err(e) = self.storage.set(&key, bytes).await {
                    tracing::warn!(session = %session_id, error = %e, "failed to persist workflow result");
                }
            }
            Err(e) => {
                tracing::warn!(session = %session_id, error = %e, "failed to serialize workflow result");
            }
        }
        result
    }

    /// Runs one step, applying condition gating, its time budget, and its
    /// retry policy.
    fn run_step<'a>(
        &'a self,
        ctx: &'a Arc<ExecutionContext>,
        step: &'a Step,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, StepResult> {
        Box::pin(async move {
            let start = now_ms();
            // Gating condition for non-condition steps; condition steps use
            // theirs to guard the nested block instead.
            if step.step_type != StepType::Condition
                && let Some(condition) = &step.condition
                && !ctx.evaluate(condition)
            {
                tracing::debug!(
                    workflow = %ctx.workflow_id,
                    session = %ctx.session_id,
                    step = %step.id,
                    "skipping step, condition is false"
                );
                let result = StepResult::skipped(step, start);
                ctx.results.lock().insert(step.id.clone(), result.clone());
                return result;
            }

            let budget = step
                .timeout_ms
                .map_or(self.config.default_step_timeout, Duration::from_millis);
            let max_attempts = step.retry.as_ref().map_or(1, |r| r.max_attempts.max(1));
            let mut retry_count = 0u32;

            let mut result = loop {
                let attempt_started = std::time::Instant::now();
                let attempt = tokio::time::timeout(
                    budget,
                    self.run_step_once(ctx, step, cancel),
                )
                .await;
                let mut result = attempt.unwrap_or_else(|_| {
                    failed_result(step, start, format!(
                        "step timed out after {}ms",
                        budget.as_millis()
                    ))
                });
                result.retry_count = retry_count;
                result.duration_ms =
                    u64::try_from(attempt_started.elapsed().as_millis()).unwrap_or(u64::MAX);
                result.end = now_ms();

                if !result.is_failure() || cancel.is_cancelled() {
                    break result;
                }
                let Some(retry) = &step.retry else { break result };
                let error = result.error.clone().unwrap_or_default();
                if retry_count + 1 >= max_attempts || !retry.applies_to(&error) {
                    break result;
                }
                retry_count += 1;
                tracing::debug!(
                    workflow = %ctx.workflow_id,
                    step = %step.id,
                    retry = retry_count,
                    error = %error,
                    "retrying step after backoff"
                );
                tokio::time::sleep(Duration::from_millis(retry.backoff_ms)).await;
            };

            result.start = start;
            ctx.results.lock().insert(step.id.clone(), result.clone());
            result
        })
    }

    /// Runs one attempt of a step, dispatching on its type.
    fn run_step_once<'a>(
        &'a self,
        ctx: &'a Arc<ExecutionContext>,
        step: &'a Step,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, StepResult> {
        Box::pin(async move {
            let start = now_ms();
            if cancel.is_cancelled() {
                return failed_result(step, start, "cancelled".to_string());
            }

            match step.step_type {
                StepType::Tool => self.run_tool_step(ctx, step, cancel, start).await,
                StepType::Sequential => {
                    let (sub_steps, error) =
                        self.run_sequence(ctx, &step.sub_steps, cancel).await;
                    container_result(step, start, sub_steps, error)
                }
                StepType::Parallel => {
                    let futures: Vec<_> = step
                        .sub_steps
                        .iter()
                        .map(|sub| self.run_step(ctx, sub, cancel))
                        .collect();
                    // join_all preserves definition order in its output.
                    let sub_steps = join_all(futures).await;
                    let error = sub_steps
                        .iter()
                        .zip(&step.sub_steps)
                        .find(|(result, sub)| result.is_failure() && !sub.optional)
                        .map(|(result, sub)| {
                            result
                                .error
                                .clone()
                                .unwrap_or_else(|| format!("sub-step {} failed", sub.id))
                        });
                    container_result(step, start, sub_steps, error)
                }
                StepType::Condition => {
                    let Some(condition) = step.condition.as_ref() else {
                        return failed_result(step, start, "condition step has no condition".to_string());
                    };
                    if ctx.evaluate(condition) {
                        let (sub_steps, error) =
                            self.run_sequence(ctx, &step.sub_steps, cancel).await;
                        container_result(step, start, sub_steps, error)
                    } else {
                        StepResult::skipped(step, start)
                    }
                }
            }
        })
    }

    async fn run_tool_step(
        &self,
        ctx: &Arc<ExecutionContext>,
        step: &Step,
        cancel: &CancellationToken,
        start: i64,
    ) -> StepResult {
        let Some(tool) = step.tool.as_deref() else {
            return failed_result(step, start, "tool step names no tool".to_string());
        };

        // Resolve `${path}` references against prior results.
        let mut params = Map::new();
        for (key, value) in &step.params {
            match value.resolve(&|path| ctx.lookup(path)) {
                Ok(resolved) => {
                    params.insert(key.clone(), resolved);
                }
                Err(path) => {
                    return failed_result(step, start, format!(
                        "unresolved reference ${{{path}}} in parameter '{key}'"
                    ));
                }
            }
        }

        let tool_result = self
            .tools
            .invoke(tool, &params, &ctx.session_id, cancel.child_token())
            .await;
        StepResult {
            step_id: step.id.clone(),
            step_type: step.step_type,
            tool: Some(tool.to_string()),
            start,
            end: now_ms(),
            duration_ms: 0,
            success: tool_result.success,
            skipped: false,
            retry_count: 0,
            error: tool_result.error.clone(),
            tool_result: Some(tool_result),
            sub_steps: Vec::new(),
        }
    }

    /// Runs steps in order, stopping at the first non-optional failure.
    async fn run_sequence(
        &self,
        ctx: &Arc<ExecutionContext>,
        steps: &[Step],
        cancel: &CancellationToken,
    ) -> (Vec<StepResult>, Option<String>) {
        let mut results = Vec::with_capacity(steps.len());
        for step in steps {
            let result = self.run_step(ctx, step, cancel).await;
            let failed = result.is_failure() && !step.optional;
            let error = result.error.clone();
            results.push(result);
            if failed {
                return (
                    results,
                    Some(error.unwrap_or_else(|| format!("step {} failed", step.id))),
                );
            }
        }
        (results, None)
    }
}

impl std::fmt::Debug for WorkflowExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowExecutor")
            .field("available_slots", &self.available_slots())
            .finish()
    }
}

fn failed_result(step: &Step, start: i64, error: String) -> StepResult {
    StepResult {
        step_id: step.id.clone(),
        step_type: step.step_type,
        tool: step.tool.clone(),
        start,
        end: now_ms(),
        duration_ms: 0,
        success: false,
        skipped: false,
        retry_count: 0,
        tool_result: None,
        sub_steps: Vec::new(),
        error: Some(error),
    }
}

fn container_result(
    step: &Step,
    start: i64,
    sub_steps: Vec<StepResult>,
    error: Option<String>,
) -> StepResult {
    StepResult {
        step_id: step.id.clone(),
        step_type: step.step_type,
        tool: None,
        start,
        end: now_ms(),
        duration_ms: 0,
        success: error.is_none(),
        skipped: false,
        retry_count: 0,
        tool_result: None,
        sub_steps,
        error,
    }
}
