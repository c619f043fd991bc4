// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Intent classification.
//!
//! Turns a natural-language utterance into a `(primary, secondary)` intent
//! that selects a workflow. Resolution order: manual override, LLM adapter
//! (with bounded retries and enriched context), weighted keyword rules, and
//! finally the designated general workflow with parameters extracted from
//! the input. Classification never fails; the fallback always produces a
//! runnable intent.

use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::config::IntentConfig;
use crate::llm::LlmClient;

use super::definition::IntentKey;
use super::registry::WorkflowRegistry;

/// A classified intent, ready to execute.
#[derive(Debug, Clone)]
pub struct Intent {
    /// Primary intent category.
    pub primary: String,
    /// Secondary intent category.
    pub secondary: String,
    /// Classifier confidence in `[0, 1]`.
    pub confidence: f64,
    /// Parameters for the workflow execution.
    pub parameters: Map<String, Value>,
    /// The selected workflow.
    pub workflow_id: String,
    /// How this classification was reached.
    pub reasoning: String,
}

/// A classification request.
#[derive(Debug, Clone, Default)]
pub struct ClassifyRequest {
    /// The user's utterance.
    pub user_input: String,
    /// Caller-supplied context merged into the workflow parameters.
    pub context: Map<String, Value>,
    /// Optional device the user was looking at.
    pub device_info: Option<Value>,
    /// Explicit intent selection that bypasses classification.
    pub manual_override: Option<IntentKey>,
}

/// A weighted keyword rule for one intent.
#[derive(Debug, Clone)]
pub struct IntentRule {
    /// Intent this rule scores for.
    pub intent: IntentKey,
    /// `(keyword, weight)` pairs; hits are summed.
    pub keywords: Vec<(String, f64)>,
}

impl IntentRule {
    fn score(&self, input: &str) -> f64 {
        self.keywords
            .iter()
            .filter(|(keyword, _)| input.contains(keyword.as_str()))
            .map(|(_, weight)| weight)
            .sum()
    }
}

/// Returns the keyword rules matching the built-in workflow catalogue.
#[must_use]
pub fn builtin_intent_rules() -> Vec<IntentRule> {
    let rule = |primary: &str, secondary: &str, keywords: &[(&str, f64)]| IntentRule {
        intent: IntentKey::new(primary, secondary),
        keywords: keywords
            .iter()
            .map(|(k, w)| ((*k).to_string(), *w))
            .collect(),
    };
    vec![
        rule(
            "wifi",
            "weak_signal",
            &[
                ("signal", 0.4),
                ("weak", 0.3),
                ("coverage", 0.4),
                ("dead zone", 0.5),
                ("bars", 0.3),
                ("wifi", 0.2),
                ("wireless", 0.2),
            ],
        ),
        rule(
            "wifi",
            "interference",
            &[
                ("interference", 0.6),
                ("channel", 0.4),
                ("congest", 0.4),
                ("neighbor", 0.2),
                ("overlap", 0.3),
            ],
        ),
        rule(
            "connectivity",
            "wan",
            &[
                ("internet", 0.5),
                ("wan", 0.6),
                ("outage", 0.4),
                ("isp", 0.4),
                ("uplink", 0.4),
                ("offline", 0.3),
            ],
        ),
        rule(
            "device",
            "health",
            &[
                ("health", 0.4),
                ("reboot", 0.3),
                ("status", 0.3),
                ("uptime", 0.3),
                ("firmware", 0.3),
            ],
        ),
    ]
}

/// Shape the LLM is asked to answer with.
#[derive(Debug, Deserialize)]
struct LlmIntentResponse {
    primary: String,
    secondary: String,
    confidence: f64,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    parameters: Map<String, Value>,
}

/// The intent classifier.
pub struct IntentClassifier {
    llm: Arc<dyn LlmClient>,
    config: IntentConfig,
    rules: RwLock<Arc<Vec<IntentRule>>>,
}

impl IntentClassifier {
    /// Creates a classifier with the built-in keyword rules.
    #[must_use]
    pub fn new(llm: Arc<dyn LlmClient>, config: IntentConfig) -> Self {
        Self {
            llm,
            config,
            rules: RwLock::new(Arc::new(builtin_intent_rules())),
        }
    }

    /// Replaces the keyword rule set; in-flight classifications keep the
    /// snapshot they captured.
    pub fn reload_rules(&self, rules: Vec<IntentRule>) {
        *self.rules.write() = Arc::new(rules);
        tracing::info!("intent rules reloaded");
    }

    /// Classifies an utterance into an executable intent.
    ///
    /// Never fails: when every stage comes up empty the designated general
    /// workflow is selected with parameters extracted from the input.
    pub async fn classify(&self, request: &ClassifyRequest, registry: &WorkflowRegistry) -> Intent {
        let input_lower = request.user_input.to_lowercase();
        let mut parameters = extract_parameters(&request.user_input);
        for (key, value) in &request.context {
            parameters.entry(key.clone()).or_insert_with(|| value.clone());
        }

        // 1. Manual override wins outright.
        if let Some(key) = &request.manual_override {
            if let Some(workflow) = registry.find_by_intent(&key.primary, &key.secondary) {
                return Intent {
                    primary: key.primary.clone(),
                    secondary: key.secondary.clone(),
                    confidence: 1.0,
                    parameters,
                    workflow_id: workflow.id.clone(),
                    reasoning: "manual override".to_string(),
                };
            }
            tracing::warn!(
                primary = %key.primary,
                secondary = %key.secondary,
                "manual override names no workflow, continuing with classification"
            );
        }

        // 2. LLM adapter, with enriched context on each retry.
        let mut best_confidence: f64 = 0.0;
        let mut llm_note = "llm unavailable".to_string();
        let attempts = self.config.max_llm_retries.max(1);
        for attempt in 0..attempts {
            let prompt = self.build_prompt(request, registry, attempt, &llm_note);
            match self.llm.complete(&prompt).await {
                Ok(raw) => match parse_llm_response(&raw) {
                    Ok(response) => {
                        let confidence = response.confidence.clamp(0.0, 1.0);
                        best_confidence = best_confidence.max(confidence);
                        let mapped =
                            registry.find_by_intent(&response.primary, &response.secondary);
                        if let Some(workflow) = mapped {
                            if confidence >= self.config.high_threshold {
                                for (k, v) in response.parameters {
                                    parameters.insert(k, v);
                                }
                                return Intent {
                                    primary: response.primary,
                                    secondary: response.secondary,
                                    confidence,
                                    parameters,
                                    workflow_id: workflow.id.clone(),
                                    reasoning: response.reasoning,
                                };
                            }
                            if confidence >= self.config.medium_threshold {
                                tracing::warn!(
                                    workflow = %workflow.id,
                                    confidence,
                                    "accepting medium-confidence classification"
                                );
                                for (k, v) in response.parameters {
                                    parameters.insert(k, v);
                                }
                                return Intent {
                                    primary: response.primary,
                                    secondary: response.secondary,
                                    confidence,
                                    parameters,
                                    workflow_id: workflow.id.clone(),
                                    reasoning: format!(
                                        "{} (accepted at medium confidence)",
                                        response.reasoning
                                    ),
                                };
                            }
                            llm_note = format!(
                                "confidence {confidence:.2} below threshold for {}/{}",
                                response.primary, response.secondary
                            );
                        } else {
                            llm_note = format!(
                                "no workflow for intent {}/{}",
                                response.primary, response.secondary
                            );
                        }
                    }
                    Err(e) => {
                        llm_note = format!("unparseable llm response: {e}");
                    }
                },
                Err(e) => {
                    llm_note = format!("llm error: {e}");
                }
            }
            tracing::debug!(attempt, note = %llm_note, "llm classification attempt failed");
        }

        // 3. Weighted keyword rules, scaled below LLM certainty.
        let rules = Arc::clone(&self.rules.read());
        let best_rule = rules
            .iter()
            .map(|rule| (rule, rule.score(&input_lower).min(0.95)))
            .max_by(|a, b| a.1.total_cmp(&b.1));
        if let Some((rule, score)) = best_rule
            && score >= self.config.min_confidence
            && let Some(workflow) = registry.find_by_intent(&rule.intent.primary, &rule.intent.secondary)
        {
            return Intent {
                primary: rule.intent.primary.clone(),
                secondary: rule.intent.secondary.clone(),
                confidence: score,
                parameters,
                workflow_id: workflow.id.clone(),
                reasoning: format!("keyword match scored {score:.2} ({llm_note})"),
            };
        }

        // 4. Designated general workflow with extracted parameters.
        let rule_note = best_rule
            .map(|(_, score)| format!("best keyword score {score:.2}"))
            .unwrap_or_else(|| "no keyword rules".to_string());
        parameters.insert(
            "original_input".to_string(),
            Value::String(request.user_input.clone()),
        );
        Intent {
            primary: "general".to_string(),
            secondary: "diagnosis".to_string(),
            confidence: best_confidence.max(0.1),
            parameters,
            workflow_id: self.config.general_workflow.clone(),
            reasoning: format!("fallback to general workflow: {llm_note}; {rule_note}"),
        }
    }

    fn build_prompt(
        &self,
        request: &ClassifyRequest,
        registry: &WorkflowRegistry,
        attempt: u32,
        previous_note: &str,
    ) -> String {
        let intents: Vec<String> = registry
            .list()
            .iter()
            .map(|d| format!("- {}/{}: {}", d.intent.primary, d.intent.secondary, d.description))
            .collect();
        let mut prompt = format!(
            "Classify the user request into one of these intents:\n{}\n\nUser request: {}\n\
             Respond with JSON: {{\"primary\", \"secondary\", \"confidence\", \"reasoning\", \"parameters\"}}",
            intents.join("\n"),
            request.user_input,
        );
        if let Some(device_info) = &request.device_info {
            prompt.push_str(&format!("\nDevice context: {device_info}"));
        }
        if !request.context.is_empty() {
            prompt.push_str(&format!(
                "\nSession context: {}",
                Value::Object(request.context.clone())
            ));
        }
        if attempt > 0 {
            prompt.push_str(&format!(
                "\nThe previous attempt was unusable ({previous_note}); be precise and conservative with confidence."
            ));
        }
        prompt
    }
}

impl std::fmt::Debug for IntentClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntentClassifier")
            .field("llm", &self.llm.name())
            .field("rules", &self.rules.read().len())
            .finish()
    }
}

/// Parses the LLM's JSON answer, tolerating surrounding prose.
fn parse_llm_response(raw: &str) -> Result<LlmIntentResponse, String> {
    let trimmed = raw.trim();
    let json_slice = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => return Err("no JSON object in response".to_string()),
    };
    serde_json::from_str(json_slice).map_err(|e| e.to_string())
}

static LOCATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(bedroom|living ?room|kitchen|office|garage|basement|attic|hallway|upstairs|downstairs|backyard)\b",
    )
    .expect("location regex compiles")
});

static SEVERITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(slow|down|offline|intermittent|broken|flaky|laggy|dropping|unstable)\b")
        .expect("severity regex compiles")
});

static DEVICE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(router|gateway|access point|ap|switch|camera|sensor|mesh|printer|thermostat)\b",
    )
    .expect("device regex compiles")
});

/// Extracts location/severity/device tokens from free text.
#[must_use]
pub fn extract_parameters(input: &str) -> Map<String, Value> {
    let mut parameters = Map::new();

    for (index, capture) in LOCATION_RE.find_iter(input).enumerate() {
        parameters.insert(
            format!("location{}", index + 1),
            json!(capture.as_str().to_lowercase()),
        );
    }
    if let Some(capture) = SEVERITY_RE.find(input) {
        parameters.insert("severity".to_string(), json!(capture.as_str().to_lowercase()));
    }
    if let Some(capture) = DEVICE_RE.find(input) {
        parameters.insert(
            "device_type".to_string(),
            json!(capture.as_str().to_lowercase()),
        );
    }
    parameters
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::StubLlmClient;
    use crate::tools::test_support;

    fn classifier_with(llm: StubLlmClient) -> (IntentClassifier, WorkflowRegistry) {
        let (tools, ..) = test_support::engine();
        let registry = WorkflowRegistry::with_builtins(&tools);
        let classifier = IntentClassifier::new(Arc::new(llm), IntentConfig::default());
        (classifier, registry)
    }

    #[tokio::test]
    async fn manual_override_is_absolute() {
        let (classifier, registry) = classifier_with(StubLlmClient::default());
        let request = ClassifyRequest {
            user_input: "whatever".to_string(),
            manual_override: Some(IntentKey::new("device", "health")),
            ..ClassifyRequest::default()
        };
        let intent = classifier.classify(&request, &registry).await;
        assert_eq!(intent.workflow_id, "device_health_check");
        assert!((intent.confidence - 1.0).abs() < f64::EPSILON);
        assert_eq!(intent.reasoning, "manual override");
    }

    #[tokio::test]
    async fn high_confidence_llm_answer_is_accepted() {
        let llm = StubLlmClient::new(
            r#"{"primary": "wifi", "secondary": "weak_signal", "confidence": 0.92,
                "reasoning": "user reports weak coverage",
                "parameters": {"location1": "bedroom"}}"#,
        );
        let (classifier, registry) = classifier_with(llm);
        let request = ClassifyRequest {
            user_input: "the wifi in the bedroom is bad".to_string(),
            ..ClassifyRequest::default()
        };
        let intent = classifier.classify(&request, &registry).await;
        assert_eq!(intent.workflow_id, "weak_signal_coverage_diagnosis");
        assert!(intent.confidence >= 0.9);
        assert_eq!(intent.parameters.get("location1"), Some(&json!("bedroom")));
    }

    #[tokio::test]
    async fn medium_confidence_is_accepted_with_warning_note() {
        let llm = StubLlmClient::new(
            r#"{"primary": "connectivity", "secondary": "wan", "confidence": 0.65, "reasoning": "probably the uplink"}"#,
        );
        let (classifier, registry) = classifier_with(llm);
        let request = ClassifyRequest {
            user_input: "no internet?".to_string(),
            ..ClassifyRequest::default()
        };
        let intent = classifier.classify(&request, &registry).await;
        assert_eq!(intent.workflow_id, "wan_connectivity_diagnosis");
        assert!(intent.reasoning.contains("medium confidence"));
    }

    #[tokio::test]
    async fn low_llm_confidence_falls_back_to_keywords() {
        // The stub reports 0.3, below the medium threshold; the keyword
        // scorer should pick the interference intent.
        let llm = StubLlmClient::new(
            r#"{"primary": "wifi", "secondary": "interference", "confidence": 0.3, "reasoning": "weak"}"#,
        );
        let (classifier, registry) = classifier_with(llm);
        let request = ClassifyRequest {
            user_input: "there is channel interference and congestion".to_string(),
            ..ClassifyRequest::default()
        };
        let intent = classifier.classify(&request, &registry).await;
        assert_eq!(intent.workflow_id, "channel_interference_analysis");
        assert!(intent.confidence <= 0.95);
        assert!(intent.reasoning.contains("keyword match"));
    }

    #[tokio::test]
    async fn nothing_matches_falls_back_to_general_workflow() {
        let llm = StubLlmClient::new(
            r#"{"primary": "general", "secondary": "diagnosis", "confidence": 0.3, "reasoning": "unclear"}"#,
        );
        let (classifier, registry) = classifier_with(llm);
        let request = ClassifyRequest {
            user_input: "everything feels weird".to_string(),
            ..ClassifyRequest::default()
        };
        let intent = classifier.classify(&request, &registry).await;
        assert_eq!(intent.workflow_id, "general_network_diagnosis");
        assert!(intent.reasoning.contains("fallback"));
        assert_eq!(
            intent.parameters.get("original_input"),
            Some(&json!("everything feels weird"))
        );
    }

    #[tokio::test]
    async fn unparseable_llm_response_is_retried_then_falls_back() {
        let llm = StubLlmClient::new("I am not JSON at all");
        let (classifier, registry) = classifier_with(llm);
        let request = ClassifyRequest {
            user_input: "hm".to_string(),
            ..ClassifyRequest::default()
        };
        let intent = classifier.classify(&request, &registry).await;
        assert_eq!(intent.workflow_id, "general_network_diagnosis");
        assert!(intent.reasoning.contains("unparseable"));
    }

    #[tokio::test]
    async fn llm_response_with_prose_wrapper_parses() {
        let llm = StubLlmClient::new(
            r#"Sure! Here is the classification:
            {"primary": "device", "secondary": "health", "confidence": 0.9, "reasoning": "asks about status"}
            Hope that helps."#,
        );
        let (classifier, registry) = classifier_with(llm);
        let request = ClassifyRequest {
            user_input: "what's the status of my router".to_string(),
            ..ClassifyRequest::default()
        };
        let intent = classifier.classify(&request, &registry).await;
        assert_eq!(intent.workflow_id, "device_health_check");
    }

    #[test]
    fn extract_parameters_finds_tokens() {
        let params = extract_parameters("the wifi is slow in the Bedroom near the access point");
        assert_eq!(params.get("location1"), Some(&json!("bedroom")));
        assert_eq!(params.get("severity"), Some(&json!("slow")));
        assert_eq!(params.get("device_type"), Some(&json!("access point")));
    }

    #[test]
    fn extract_parameters_numbers_multiple_locations() {
        let params = extract_parameters("bad signal in the kitchen and the garage");
        assert_eq!(params.get("location1"), Some(&json!("kitchen")));
        assert_eq!(params.get("location2"), Some(&json!("garage")));
    }

    #[tokio::test]
    async fn context_parameters_flow_through() {
        let (classifier, registry) = classifier_with(StubLlmClient::default());
        let mut context = Map::new();
        context.insert("site".to_string(), json!("home"));
        let request = ClassifyRequest {
            user_input: "hm".to_string(),
            context,
            ..ClassifyRequest::default()
        };
        let intent = classifier.classify(&request, &registry).await;
        assert_eq!(intent.parameters.get("site"), Some(&json!("home")));
    }
}
