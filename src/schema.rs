// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Version-tagged payload validation.
//!
//! Envelopes carry `schema: "<name>/<major.minor>"`; the validator holds a
//! set of rules keyed by that exact string. Unknown schemas are accepted with
//! a warning (forward compatibility). Known schemas that fail validation are
//! rejected in strict mode and logged-and-accepted otherwise.
//!
//! The rule set is process-wide and reloaded by swapping the snapshot; an
//! in-flight validation keeps the snapshot it captured.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde_json::Value;

use crate::envelope::Envelope;
use crate::error::ProtocolError;

/// Expected JSON type of a validated field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// JSON string.
    String,
    /// JSON integer.
    Integer,
    /// Any JSON number.
    Number,
    /// JSON boolean.
    Bool,
    /// JSON object.
    Object,
    /// JSON array.
    Array,
}

impl FieldType {
    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Bool => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Bool => "bool",
            Self::Object => "object",
            Self::Array => "array",
        }
    }
}

/// Validation rule for one schema version.
#[derive(Debug, Clone, Default)]
pub struct SchemaRule {
    required: Vec<(String, FieldType)>,
}

impl SchemaRule {
    /// Creates an empty rule (accepts any body).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a required field with an expected type.
    #[must_use]
    pub fn require(mut self, field: impl Into<String>, ty: FieldType) -> Self {
        self.required.push((field.into(), ty));
        self
    }

    /// Checks an envelope body against this rule.
    fn check(&self, envelope: &Envelope) -> Result<(), String> {
        for (field, ty) in &self.required {
            match envelope.body.get(field) {
                None => return Err(format!("missing required field '{field}'")),
                Some(value) if !ty.matches(value) => {
                    return Err(format!(
                        "field '{field}' has wrong type, expected {}",
                        ty.name()
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// A compiled set of schema rules keyed by `"<name>/<major.minor>"`.
pub type SchemaSet = HashMap<String, SchemaRule>;

/// Returns the rule set for the payloads this controller interprets.
#[must_use]
pub fn builtin_schema_set() -> SchemaSet {
    let mut set = SchemaSet::new();
    set.insert("device.state/1.0".to_string(), SchemaRule::new());
    set.insert("device.attr/1.0".to_string(), SchemaRule::new());
    set.insert(
        "device.lwt/1.0".to_string(),
        SchemaRule::new().require("status", FieldType::String),
    );
    set.insert(
        "topology.discovery/1.0".to_string(),
        SchemaRule::new()
            .require("device", FieldType::Object)
            .require("interfaces", FieldType::Array),
    );
    set.insert(
        "topology.connections/1.0".to_string(),
        SchemaRule::new().require("connections", FieldType::Array),
    );
    set.insert(
        "telemetry.wifi_clients/1.0".to_string(),
        SchemaRule::new().require("clients", FieldType::Array),
    );
    set.insert(
        "cmd.ack/1.0".to_string(),
        SchemaRule::new()
            .require("id", FieldType::String)
            .require("status", FieldType::String),
    );
    set
}

/// Outcome of validating one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// Payload matched its schema rule.
    Valid,
    /// No rule is registered for this schema; accepted with a warning.
    UnknownSchema,
    /// Payload violated its rule; handling depends on strict mode.
    Violation(String),
}

/// Counters exposed by the validator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidatorStats {
    /// Payloads that matched a rule.
    pub valid: u64,
    /// Payloads with no registered rule.
    pub unknown_schema: u64,
    /// Payloads that violated a rule.
    pub violations: u64,
}

/// Process-wide payload validator with an atomically swappable rule set.
pub struct SchemaValidator {
    rules: RwLock<Arc<SchemaSet>>,
    strict: bool,
    valid: AtomicU64,
    unknown: AtomicU64,
    violations: AtomicU64,
}

impl SchemaValidator {
    /// Creates a validator over the built-in rule set.
    #[must_use]
    pub fn new(strict: bool) -> Self {
        Self::with_rules(builtin_schema_set(), strict)
    }

    /// Creates a validator over a custom rule set.
    #[must_use]
    pub fn with_rules(rules: SchemaSet, strict: bool) -> Self {
        Self {
            rules: RwLock::new(Arc::new(rules)),
            strict,
            valid: AtomicU64::new(0),
            unknown: AtomicU64::new(0),
            violations: AtomicU64::new(0),
        }
    }

    /// Whether strict mode is enabled.
    #[must_use]
    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Replaces the rule set; in-flight validations keep the old snapshot.
    pub fn reload(&self, rules: SchemaSet) {
        *self.rules.write() = Arc::new(rules);
        tracing::info!("schema rule set reloaded");
    }

    /// Classifies an envelope against the current rule set.
    #[must_use]
    pub fn validate(&self, envelope: &Envelope) -> ValidationOutcome {
        let rules = Arc::clone(&self.rules.read());
        let key = envelope.schema.to_string();
        match rules.get(&key) {
            None => {
                self.unknown.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(schema = %key, "unknown schema, accepting payload");
                ValidationOutcome::UnknownSchema
            }
            Some(rule) => match rule.check(envelope) {
                Ok(()) => {
                    self.valid.fetch_add(1, Ordering::Relaxed);
                    ValidationOutcome::Valid
                }
                Err(detail) => {
                    self.violations.fetch_add(1, Ordering::Relaxed);
                    ValidationOutcome::Violation(detail)
                }
            },
        }
    }

    /// Validates and applies the strict/lax policy.
    ///
    /// # Errors
    ///
    /// In strict mode, returns [`ProtocolError::SchemaViolation`] for payloads
    /// that fail their rule. In lax mode violations are logged and accepted.
    pub fn check(&self, envelope: &Envelope) -> Result<(), ProtocolError> {
        match self.validate(envelope) {
            ValidationOutcome::Valid | ValidationOutcome::UnknownSchema => Ok(()),
            ValidationOutcome::Violation(detail) => {
                let schema = envelope.schema.to_string();
                if self.strict {
                    Err(ProtocolError::SchemaViolation { schema, detail })
                } else {
                    tracing::warn!(schema = %schema, detail = %detail, "schema violation accepted (lax mode)");
                    Ok(())
                }
            }
        }
    }

    /// Returns a snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> ValidatorStats {
        ValidatorStats {
            valid: self.valid.load(Ordering::Relaxed),
            unknown_schema: self.unknown.load(Ordering::Relaxed),
            violations: self.violations.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for SchemaValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaValidator")
            .field("strict", &self.strict)
            .field("rules", &self.rules.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(schema: &str, body: Value) -> Envelope {
        let mut payload = body;
        payload["schema"] = json!(schema);
        payload["ts"] = json!(1_700_000_000_000_i64);
        Envelope::decode(payload.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn valid_payload_passes() {
        let validator = SchemaValidator::new(true);
        let env = envelope("device.lwt/1.0", json!({"status": "offline"}));
        assert_eq!(validator.validate(&env), ValidationOutcome::Valid);
        assert!(validator.check(&env).is_ok());
    }

    #[test]
    fn unknown_schema_accepted() {
        let validator = SchemaValidator::new(true);
        let env = envelope("vendor.custom/3.1", json!({"anything": 1}));
        assert_eq!(validator.validate(&env), ValidationOutcome::UnknownSchema);
        assert!(validator.check(&env).is_ok());
        assert_eq!(validator.stats().unknown_schema, 1);
    }

    #[test]
    fn violation_rejected_in_strict_mode() {
        let validator = SchemaValidator::new(true);
        let env = envelope("device.lwt/1.0", json!({"status": 42}));
        assert!(matches!(
            validator.validate(&env),
            ValidationOutcome::Violation(_)
        ));
        assert!(matches!(
            validator.check(&env),
            Err(ProtocolError::SchemaViolation { .. })
        ));
    }

    #[test]
    fn violation_accepted_in_lax_mode() {
        let validator = SchemaValidator::new(false);
        let env = envelope("cmd.ack/1.0", json!({"id": "x"}));
        assert!(validator.check(&env).is_ok());
        assert_eq!(validator.stats().violations, 1);
    }

    #[test]
    fn missing_field_detail_names_field() {
        let validator = SchemaValidator::new(true);
        let env = envelope("topology.connections/1.0", json!({}));
        let ValidationOutcome::Violation(detail) = validator.validate(&env) else {
            panic!("expected violation");
        };
        assert!(detail.contains("connections"));
    }

    #[test]
    fn reload_swaps_rules() {
        let validator = SchemaValidator::new(true);
        let env = envelope("vendor.custom/1.0", json!({"x": 1}));
        assert_eq!(validator.validate(&env), ValidationOutcome::UnknownSchema);

        let mut rules = builtin_schema_set();
        rules.insert(
            "vendor.custom/1.0".to_string(),
            SchemaRule::new().require("x", FieldType::Integer),
        );
        validator.reload(rules);
        assert_eq!(validator.validate(&env), ValidationOutcome::Valid);
    }
}
