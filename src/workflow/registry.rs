// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Workflow registry.
//!
//! Holds the validated catalogue of workflow definitions. The catalogue is a
//! copy-on-reload snapshot: readers clone an `Arc` and keep executing against
//! it while a reload swaps the pointer. A definition that fails validation is
//! refused without disturbing the installed set.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::ConfigError;
use crate::tools::ToolEngine;

use super::definition::{Step, StepType, WorkflowDefinition};

/// Result of loading a batch of definitions.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Ids installed or replaced.
    pub installed: Vec<String>,
    /// Definitions refused with their validation errors.
    pub rejected: Vec<ConfigError>,
}

/// Source text for the built-in workflow catalogue.
///
/// These cover the diagnostic intents the controller understands out of the
/// box; operators extend or replace them via [`WorkflowRegistry::load_yaml`].
const BUILTIN_WORKFLOWS: &str = r#"
workflows:
  - id: weak_signal_coverage_diagnosis
    description: investigates weak wifi coverage reports
    intent: {primary: wifi, secondary: weak_signal}
    steps:
      - id: coverage_scan
        type: parallel
        sub_steps:
          - id: signal_strength_map
            type: tool
            tool: wifi.signal_strength_map
            params: {location: "${params.location1}"}
          - id: channel_analysis
            type: tool
            tool: wifi.analyze_channels
          - id: interference_scan
            type: tool
            tool: wifi.interference_scan
          - id: client_inventory
            type: tool
            tool: registry.list_devices
      - id: deep_analysis
        type: condition
        condition: {field: signal_strength_map.min_rssi, operator: lt, value: -70}
        sub_steps:
          - id: latency_check
            type: tool
            tool: network.latency_analysis
          - id: topology_review
            type: tool
            tool: topology.get_full
      - id: bandwidth_report
        type: tool
        tool: network.bandwidth_report
      - id: coverage_summary
        type: tool
        tool: wifi.signal_strength_map
        params: {location: "${params.location1}"}

  - id: general_network_diagnosis
    description: broad first-look diagnosis when intent is unclear
    intent: {primary: general, secondary: diagnosis}
    steps:
      - id: topology_overview
        type: tool
        tool: topology.get_full
      - id: device_inventory
        type: tool
        tool: registry.list_devices
      - id: latency_overview
        type: tool
        tool: network.latency_analysis
        optional: true
      - id: signal_overview
        type: tool
        tool: wifi.signal_strength_map
        optional: true

  - id: wan_connectivity_diagnosis
    description: checks the site uplink through the gateway
    intent: {primary: connectivity, secondary: wan}
    steps:
      - id: wan_check
        type: tool
        tool: diagnostics.wan_connectivity
        timeout_ms: 45000
        retry: {max_attempts: 2, backoff_ms: 500, conditions: ["timed out", "timeout"]}
      - id: gateway_health
        type: tool
        tool: diagnostics.device_health
        params: {device_id: "${wan_check.gateway}"}
        optional: true
      - id: latency_survey
        type: tool
        tool: network.latency_analysis

  - id: channel_interference_analysis
    description: finds co-channel radios and congestion
    intent: {primary: wifi, secondary: interference}
    steps:
      - id: spectrum_scan
        type: parallel
        sub_steps:
          - id: channel_map
            type: tool
            tool: wifi.analyze_channels
          - id: interference_pairs
            type: tool
            tool: wifi.interference_scan
      - id: remediation_review
        type: condition
        condition: {field: channel_map.congested_channels, operator: gt, value: 0}
        sub_steps:
          - id: topology_context
            type: tool
            tool: topology.get_full

  - id: device_health_check
    description: liveness and system info for one device
    intent: {primary: device, secondary: health}
    steps:
      - id: health
        type: tool
        tool: diagnostics.device_health
        params: {device_id: "${params.device_id}"}
      - id: system_info
        type: tool
        tool: device.get_system_info
        params: {device_id: "${params.device_id}"}
        timeout_ms: 45000
        optional: true
"#;

#[derive(serde::Deserialize)]
struct WorkflowFile {
    workflows: Vec<WorkflowDefinition>,
}

/// The validated workflow catalogue.
pub struct WorkflowRegistry {
    snapshot: RwLock<Arc<HashMap<String, Arc<WorkflowDefinition>>>>,
}

impl WorkflowRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Creates a registry seeded with the built-in catalogue.
    ///
    /// # Panics
    ///
    /// Panics if the built-in catalogue fails validation; that is a build
    /// defect, not a runtime condition.
    #[must_use]
    pub fn with_builtins(tools: &ToolEngine) -> Self {
        let registry = Self::new();
        let report = registry
            .load_yaml(BUILTIN_WORKFLOWS, tools)
            .expect("built-in workflow catalogue must parse");
        assert!(
            report.rejected.is_empty(),
            "built-in workflow rejected: {:?}",
            report.rejected
        );
        registry
    }

    /// Loads definitions from YAML text.
    ///
    /// Valid definitions are installed (replacing same-id entries); invalid
    /// ones are reported in the [`LoadReport`] and the previous entries stay.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnparseableSource`] when the document itself
    /// does not parse.
    pub fn load_yaml(&self, source: &str, tools: &ToolEngine) -> Result<LoadReport, ConfigError> {
        let file: WorkflowFile = serde_yaml::from_str(source)
            .map_err(|e| ConfigError::UnparseableSource(e.to_string()))?;

        let mut report = LoadReport::default();
        let mut accepted = Vec::new();
        for definition in file.workflows {
            match validate(&definition, tools) {
                Ok(()) => accepted.push(definition),
                Err(e) => {
                    tracing::warn!(workflow = %definition.id, error = %e, "refusing workflow definition");
                    report.rejected.push(e);
                }
            }
        }

        let mut snapshot = self.snapshot.write();
        let mut next: HashMap<String, Arc<WorkflowDefinition>> = (**snapshot).clone();
        for definition in accepted {
            report.installed.push(definition.id.clone());
            next.insert(definition.id.clone(), Arc::new(definition));
        }
        *snapshot = Arc::new(next);
        drop(snapshot);

        tracing::info!(
            installed = report.installed.len(),
            rejected = report.rejected.len(),
            "workflow definitions loaded"
        );
        Ok(report)
    }

    /// Returns a definition by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.snapshot.read().get(id).cloned()
    }

    /// Returns all definitions, sorted by id.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<WorkflowDefinition>> {
        let mut out: Vec<Arc<WorkflowDefinition>> =
            self.snapshot.read().values().cloned().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Finds the workflow serving an intent pair.
    #[must_use]
    pub fn find_by_intent(&self, primary: &str, secondary: &str) -> Option<Arc<WorkflowDefinition>> {
        self.snapshot
            .read()
            .values()
            .find(|d| d.intent.primary == primary && d.intent.secondary == secondary)
            .cloned()
    }

    /// Returns the number of installed definitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot.read().len()
    }

    /// Whether the catalogue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot.read().is_empty()
    }
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflows", &self.len())
            .finish()
    }
}

/// Validates a definition against the structural rules and the tool registry.
fn validate(definition: &WorkflowDefinition, tools: &ToolEngine) -> Result<(), ConfigError> {
    let fail = |detail: String| ConfigError::InvalidWorkflow {
        workflow_id: definition.id.clone(),
        detail,
    };

    if definition.id.is_empty() {
        return Err(fail("empty workflow id".to_string()));
    }
    if definition.steps.is_empty() {
        return Err(fail("workflow has no steps".to_string()));
    }

    let mut seen_ids = HashSet::new();
    for step in &definition.steps {
        validate_step(step, tools, &mut seen_ids).map_err(|detail| fail(detail))?;
    }
    Ok(())
}

fn validate_step(
    step: &Step,
    tools: &ToolEngine,
    seen_ids: &mut HashSet<String>,
) -> Result<(), String> {
    if step.id.is_empty() {
        return Err("empty step id".to_string());
    }
    if !seen_ids.insert(step.id.clone()) {
        return Err(format!("duplicate step id '{}'", step.id));
    }
    if let Some(timeout_ms) = step.timeout_ms
        && timeout_ms == 0
    {
        return Err(format!("step '{}' has a zero timeout", step.id));
    }
    if let Some(retry) = &step.retry {
        if retry.max_attempts < 1 {
            return Err(format!("step '{}' retry needs max_attempts >= 1", step.id));
        }
    }

    match step.step_type {
        StepType::Tool => {
            let Some(tool) = &step.tool else {
                return Err(format!("tool step '{}' names no tool", step.id));
            };
            if !tools.has(tool) {
                return Err(format!("step '{}' references unknown tool '{tool}'", step.id));
            }
            if !step.sub_steps.is_empty() {
                return Err(format!("tool step '{}' cannot have sub_steps", step.id));
            }
        }
        StepType::Parallel | StepType::Sequential => {
            if step.sub_steps.is_empty() {
                return Err(format!(
                    "{:?} step '{}' requires sub_steps",
                    step.step_type, step.id
                ));
            }
        }
        StepType::Condition => {
            if step.condition.is_none() {
                return Err(format!("condition step '{}' has no condition", step.id));
            }
            if step.sub_steps.is_empty() {
                return Err(format!("condition step '{}' requires sub_steps", step.id));
            }
        }
    }

    for sub in &step.sub_steps {
        validate_step(sub, tools, seen_ids)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support;

    #[tokio::test]
    async fn builtins_install_cleanly() {
        let (tools, ..) = test_support::engine();
        let registry = WorkflowRegistry::with_builtins(&tools);
        assert_eq!(registry.len(), 5);
        assert!(registry.get("weak_signal_coverage_diagnosis").is_some());
        assert!(registry.get("general_network_diagnosis").is_some());
        assert!(
            registry
                .find_by_intent("connectivity", "wan")
                .is_some_and(|d| d.id == "wan_connectivity_diagnosis")
        );
    }

    #[tokio::test]
    async fn scenario_shape_of_weak_signal_workflow() {
        let (tools, ..) = test_support::engine();
        let registry = WorkflowRegistry::with_builtins(&tools);
        let workflow = registry.get("weak_signal_coverage_diagnosis").unwrap();
        // 4 parallel + 2 conditional + 2 trailing = 8 leaves.
        let leaves: usize = workflow.steps.iter().map(Step::leaf_count).sum();
        assert_eq!(leaves, 8);
    }

    #[tokio::test]
    async fn duplicate_step_id_is_refused() {
        let (tools, ..) = test_support::engine();
        let registry = WorkflowRegistry::new();
        let report = registry
            .load_yaml(
                r"
                workflows:
                  - id: dupes
                    intent: {primary: a, secondary: b}
                    steps:
                      - {id: s1, type: tool, tool: topology.get_full}
                      - id: block
                        type: sequential
                        sub_steps:
                          - {id: s1, type: tool, tool: topology.get_full}
                ",
                &tools,
            )
            .unwrap();
        assert!(report.installed.is_empty());
        assert_eq!(report.rejected.len(), 1);
        assert!(report.rejected[0].to_string().contains("duplicate step id"));
    }

    #[tokio::test]
    async fn unknown_tool_is_refused_but_valid_sibling_installs() {
        let (tools, ..) = test_support::engine();
        let registry = WorkflowRegistry::new();
        let report = registry
            .load_yaml(
                r"
                workflows:
                  - id: broken
                    intent: {primary: a, secondary: b}
                    steps:
                      - {id: s1, type: tool, tool: no.such.tool}
                  - id: fine
                    intent: {primary: a, secondary: c}
                    steps:
                      - {id: s1, type: tool, tool: topology.get_full}
                ",
                &tools,
            )
            .unwrap();
        assert_eq!(report.installed, vec!["fine".to_string()]);
        assert_eq!(report.rejected.len(), 1);
        assert!(registry.get("broken").is_none());
        assert!(registry.get("fine").is_some());
    }

    #[tokio::test]
    async fn invalid_reload_keeps_previous_snapshot() {
        let (tools, ..) = test_support::engine();
        let registry = WorkflowRegistry::with_builtins(&tools);
        let before = registry.get("general_network_diagnosis").unwrap();

        let report = registry
            .load_yaml(
                r"
                workflows:
                  - id: general_network_diagnosis
                    intent: {primary: general, secondary: diagnosis}
                    steps: []
                ",
                &tools,
            )
            .unwrap();
        assert_eq!(report.rejected.len(), 1);
        // The installed definition is untouched.
        let after = registry.get("general_network_diagnosis").unwrap();
        assert_eq!(before.steps.len(), after.steps.len());
    }

    #[tokio::test]
    async fn in_flight_snapshot_survives_reload() {
        let (tools, ..) = test_support::engine();
        let registry = WorkflowRegistry::with_builtins(&tools);
        let captured = registry.get("device_health_check").unwrap();

        registry
            .load_yaml(
                r"
                workflows:
                  - id: device_health_check
                    intent: {primary: device, secondary: health}
                    steps:
                      - {id: only, type: tool, tool: diagnostics.device_health}
                ",
                &tools,
            )
            .unwrap();

        // The captured Arc still shows the original two-step shape.
        assert_eq!(captured.steps.len(), 2);
        assert_eq!(registry.get("device_health_check").unwrap().steps.len(), 1);
    }

    #[tokio::test]
    async fn malformed_yaml_is_a_structured_error() {
        let (tools, ..) = test_support::engine();
        let registry = WorkflowRegistry::new();
        let err = registry.load_yaml("workflows: [", &tools).unwrap_err();
        assert!(matches!(err, ConfigError::UnparseableSource(_)));
    }

    #[tokio::test]
    async fn parallel_without_sub_steps_is_refused() {
        let (tools, ..) = test_support::engine();
        let registry = WorkflowRegistry::new();
        let report = registry
            .load_yaml(
                r"
                workflows:
                  - id: empty_fan
                    intent: {primary: a, secondary: b}
                    steps:
                      - {id: fan, type: parallel}
                ",
                &tools,
            )
            .unwrap();
        assert_eq!(report.rejected.len(), 1);
        assert!(report.rejected[0].to_string().contains("requires sub_steps"));
    }
}
