// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Workflow definitions.
//!
//! A workflow is a declarative DAG of steps: tool calls, parallel and
//! sequential blocks, and condition-guarded blocks. Step parameters are a
//! small value variant; strings of the form `${path}` are references resolved
//! against prior step results at step start (`${step.field}` reads that
//! step's tool result, `${params.name}` reads the workflow parameters).

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Number, Value};

/// The `(primary, secondary)` intent a workflow serves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntentKey {
    /// Primary intent category.
    pub primary: String,
    /// Secondary intent category.
    pub secondary: String,
}

impl IntentKey {
    /// Builds an intent key.
    #[must_use]
    pub fn new(primary: impl Into<String>, secondary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            secondary: secondary.into(),
        }
    }
}

/// A complete workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Unique workflow id.
    pub id: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Intent this workflow serves.
    pub intent: IntentKey,
    /// Top-level steps, executed in order.
    pub steps: Vec<Step>,
}

/// Step kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    /// Single tool invocation.
    Tool,
    /// Concurrent fan-out over `sub_steps`.
    Parallel,
    /// Ordered execution of `sub_steps`.
    Sequential,
    /// Condition-guarded sequential block.
    Condition,
}

/// One step of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step id, unique across the whole definition including nesting.
    pub id: String,
    /// Step kind.
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// Tool name for `tool` steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// Tool parameters; values may be literals or `${path}` references.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, ParamValue>,
    /// Guard condition; required for `condition` steps, optional gating for
    /// the rest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    /// Nested steps for `parallel`, `sequential` and `condition` steps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_steps: Vec<Step>,
    /// Step time budget in milliseconds; engine default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Retry policy applied when the step fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Whether a failure of this step is tolerated by its parent.
    #[serde(default)]
    pub optional: bool,
}

impl Step {
    /// Counts the tool-step leaves under this step (itself included).
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        match self.step_type {
            StepType::Tool => 1,
            StepType::Parallel | StepType::Sequential | StepType::Condition => {
                self.sub_steps.iter().map(Step::leaf_count).sum()
            }
        }
    }
}

/// Retry policy for a failing step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first; must be at least 1.
    pub max_attempts: u32,
    /// Sleep between attempts, milliseconds.
    #[serde(default)]
    pub backoff_ms: u64,
    /// Substrings the step error must contain for a retry to fire; an empty
    /// list retries on any error.
    #[serde(default)]
    pub conditions: Vec<String>,
}

impl RetryPolicy {
    /// Whether this policy retries the given error text.
    #[must_use]
    pub fn applies_to(&self, error: &str) -> bool {
        self.conditions.is_empty() || self.conditions.iter().any(|c| error.contains(c.as_str()))
    }
}

/// Comparison operator of a [`Condition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Greater than (numeric).
    Gt,
    /// Less than (numeric).
    Lt,
    /// Greater or equal (numeric).
    Gte,
    /// Less or equal (numeric).
    Lte,
    /// The field resolves to a value.
    Exists,
    /// The field does not resolve.
    NotExists,
    /// String or array containment.
    Contains,
}

/// A condition over prior step results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    /// Dotted path into prior results (`step_id.field...`).
    pub field: String,
    /// Comparison operator.
    pub operator: ConditionOp,
    /// Right-hand operand; unused for `exists`/`not_exists`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Condition {
    /// Evaluates the condition against a resolved field value.
    ///
    /// `field_value` is `None` when the path did not resolve.
    #[must_use]
    pub fn evaluate(&self, field_value: Option<&Value>) -> bool {
        match self.operator {
            ConditionOp::Exists => field_value.is_some_and(|v| !v.is_null()),
            ConditionOp::NotExists => !field_value.is_some_and(|v| !v.is_null()),
            ConditionOp::Eq => field_value == self.value.as_ref(),
            ConditionOp::Ne => field_value != self.value.as_ref(),
            ConditionOp::Gt | ConditionOp::Lt | ConditionOp::Gte | ConditionOp::Lte => {
                let (Some(lhs), Some(rhs)) = (
                    field_value.and_then(Value::as_f64),
                    self.value.as_ref().and_then(Value::as_f64),
                ) else {
                    return false;
                };
                match self.operator {
                    ConditionOp::Gt => lhs > rhs,
                    ConditionOp::Lt => lhs < rhs,
                    ConditionOp::Gte => lhs >= rhs,
                    ConditionOp::Lte => lhs <= rhs,
                    _ => unreachable!(),
                }
            }
            ConditionOp::Contains => match (field_value, self.value.as_ref()) {
                (Some(Value::String(haystack)), Some(Value::String(needle))) => {
                    haystack.contains(needle.as_str())
                }
                (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                _ => false,
            },
        }
    }
}

/// A step parameter value.
///
/// `Ref` is the `${path}` substitution form; it is produced automatically
/// when a string literal has that shape.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// String literal.
    String(String),
    /// Numeric literal.
    Number(Number),
    /// Boolean literal.
    Bool(bool),
    /// List of values.
    List(Vec<ParamValue>),
    /// Nested map.
    Map(BTreeMap<String, ParamValue>),
    /// Reference to a prior result, stored without the `${}` wrapper.
    Ref(String),
}

impl From<Value> for ParamValue {
    fn from(value: Value) -> Self {
        match value {
            Value::String(s) => match s.strip_prefix("${").and_then(|r| r.strip_suffix('}')) {
                Some(path) if !path.is_empty() => Self::Ref(path.to_string()),
                _ => Self::String(s),
            },
            Value::Number(n) => Self::Number(n),
            Value::Bool(b) => Self::Bool(b),
            Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => Self::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from(v)))
                    .collect(),
            ),
            Value::Null => Self::String(String::new()),
        }
    }
}

impl ParamValue {
    /// Resolves this value against a lookup for `${path}` references.
    ///
    /// # Errors
    ///
    /// Returns the unresolvable path.
    pub fn resolve(
        &self,
        lookup: &dyn Fn(&str) -> Option<Value>,
    ) -> Result<Value, String> {
        match self {
            Self::String(s) => Ok(Value::String(s.clone())),
            Self::Number(n) => Ok(Value::Number(n.clone())),
            Self::Bool(b) => Ok(Value::Bool(*b)),
            Self::List(items) => items
                .iter()
                .map(|v| v.resolve(lookup))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Self::Map(map) => map
                .iter()
                .map(|(k, v)| v.resolve(lookup).map(|v| (k.clone(), v)))
                .collect::<Result<serde_json::Map<_, _>, _>>()
                .map(Value::Object),
            Self::Ref(path) => lookup(path).ok_or_else(|| path.clone()),
        }
    }
}

impl Serialize for ParamValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::String(s) => serializer.serialize_str(s),
            Self::Number(n) => n.serialize(serializer),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::List(items) => items.serialize(serializer),
            Self::Map(map) => map.serialize(serializer),
            Self::Ref(path) => serializer.serialize_str(&format!("${{{path}}}")),
        }
    }
}

impl<'de> Deserialize<'de> for ParamValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        if value.is_null() {
            return Err(D::Error::custom("parameter values cannot be null"));
        }
        Ok(Self::from(value))
    }
}

/// Walks a dotted path into a JSON value.
#[must_use]
pub fn walk_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn param_value_detects_refs() {
        assert_eq!(
            ParamValue::from(json!("${scan.min_rssi}")),
            ParamValue::Ref("scan.min_rssi".to_string())
        );
        assert_eq!(
            ParamValue::from(json!("plain text")),
            ParamValue::String("plain text".to_string())
        );
        // An empty reference stays a literal.
        assert_eq!(
            ParamValue::from(json!("${}")),
            ParamValue::String("${}".to_string())
        );
    }

    #[test]
    fn param_value_resolves_nested_refs() {
        let value = ParamValue::from(json!({
            "device": "${scan.worst_device}",
            "threshold": -70,
            "tags": ["wifi", "${params.location1}"],
        }));
        let resolved = value
            .resolve(&|path| match path {
                "scan.worst_device" => Some(json!("ap-01")),
                "params.location1" => Some(json!("bedroom")),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            resolved,
            json!({"device": "ap-01", "threshold": -70, "tags": ["wifi", "bedroom"]})
        );
    }

    #[test]
    fn unresolvable_ref_reports_path() {
        let value = ParamValue::from(json!("${missing.path}"));
        let err = value.resolve(&|_| None).unwrap_err();
        assert_eq!(err, "missing.path");
    }

    #[test]
    fn ref_serializes_back_to_wire_form() {
        let value = ParamValue::from(json!("${a.b}"));
        assert_eq!(serde_json::to_value(&value).unwrap(), json!("${a.b}"));
    }

    #[test]
    fn condition_numeric_operators() {
        let cond = Condition {
            field: "scan.min_rssi".to_string(),
            operator: ConditionOp::Lt,
            value: Some(json!(-70)),
        };
        assert!(cond.evaluate(Some(&json!(-75))));
        assert!(!cond.evaluate(Some(&json!(-65))));
        assert!(!cond.evaluate(None));
    }

    #[test]
    fn condition_exists_operators() {
        let exists = Condition {
            field: "x".to_string(),
            operator: ConditionOp::Exists,
            value: None,
        };
        assert!(exists.evaluate(Some(&json!(1))));
        assert!(!exists.evaluate(Some(&json!(null))));
        assert!(!exists.evaluate(None));

        let not_exists = Condition {
            field: "x".to_string(),
            operator: ConditionOp::NotExists,
            value: None,
        };
        assert!(not_exists.evaluate(None));
        assert!(!not_exists.evaluate(Some(&json!(1))));
    }

    #[test]
    fn condition_contains() {
        let cond = Condition {
            field: "f".to_string(),
            operator: ConditionOp::Contains,
            value: Some(json!("slow")),
        };
        assert!(cond.evaluate(Some(&json!("network is slow today"))));
        assert!(cond.evaluate(Some(&json!(["fast", "slow"]))));
        assert!(!cond.evaluate(Some(&json!("all good"))));
    }

    #[test]
    fn walk_path_traverses_objects_and_arrays() {
        let root = json!({"a": {"b": [1, {"c": 42}]}});
        assert_eq!(walk_path(&root, "a.b.1.c"), Some(&json!(42)));
        assert_eq!(walk_path(&root, "a.b.0"), Some(&json!(1)));
        assert_eq!(walk_path(&root, "a.missing"), None);
        assert_eq!(walk_path(&root, "a.b.nope"), None);
    }

    #[test]
    fn leaf_count_ignores_containers() {
        let definition: WorkflowDefinition = serde_yaml::from_str(
            r"
            id: demo
            intent: {primary: a, secondary: b}
            steps:
              - id: fan
                type: parallel
                sub_steps:
                  - {id: t1, type: tool, tool: x}
                  - {id: t2, type: tool, tool: x}
              - id: gate
                type: condition
                condition: {field: t1.v, operator: exists}
                sub_steps:
                  - {id: t3, type: tool, tool: x}
              - {id: t4, type: tool, tool: x}
            ",
        )
        .unwrap();
        let total: usize = definition.steps.iter().map(Step::leaf_count).sum();
        assert_eq!(total, 4);
    }

    #[test]
    fn retry_policy_condition_matching() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_ms: 100,
            conditions: vec!["timeout".to_string()],
        };
        assert!(policy.applies_to("command timed out: timeout"));
        assert!(!policy.applies_to("device not found"));

        let unconditional = RetryPolicy {
            max_attempts: 2,
            backoff_ms: 0,
            conditions: vec![],
        };
        assert!(unconditional.applies_to("anything"));
    }

    #[test]
    fn definition_parses_from_yaml() {
        let definition: WorkflowDefinition = serde_yaml::from_str(
            r#"
            id: wan_check
            description: checks the WAN
            intent: {primary: connectivity, secondary: wan}
            steps:
              - id: wan
                type: tool
                tool: diagnostics.wan_connectivity
                timeout_ms: 15000
                retry: {max_attempts: 2, backoff_ms: 500, conditions: ["timeout"]}
              - id: health
                type: tool
                tool: diagnostics.device_health
                params: {device_id: "${wan.gateway}"}
                optional: true
            "#,
        )
        .unwrap();
        assert_eq!(definition.id, "wan_check");
        assert_eq!(definition.steps.len(), 2);
        assert_eq!(
            definition.steps[1].params.get("device_id"),
            Some(&ParamValue::Ref("wan.gateway".to_string()))
        );
        assert!(definition.steps[1].optional);
    }
}
