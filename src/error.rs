// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the controller runtime.
//!
//! This module provides the error hierarchy used across the crate: transport
//! failures, wire-protocol violations, command lifecycle failures, workflow
//! execution failures, storage failures, and configuration problems.

use thiserror::Error;

/// The main error type for this library.
///
/// This enum encompasses all failures the controller surfaces through its
/// public API. Ingress-side protocol violations (malformed topics, bad JSON)
/// are normally counted and dropped at the router rather than propagated, so
/// they appear here only when a caller parses wire data directly.
#[derive(Debug, Error)]
pub enum Error {
    /// Error in broker transport (connect, publish, subscribe).
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Error decoding wire data (topics, envelopes).
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Error in the command lifecycle.
    #[error("command error: {0}")]
    Command(#[from] CommandError),

    /// Error during workflow classification or execution.
    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    /// Error in the storage adapter.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Invalid configuration detected at startup or reload.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Device is not known to the registry.
    #[error("device not found: {0}")]
    DeviceNotFound(String),
}

/// Errors related to broker transport.
///
/// These are recovered locally via reconnect/backoff where possible and
/// surfaced as events when sustained.
#[derive(Debug, Error)]
pub enum TransportError {
    /// MQTT client call failed.
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    /// Connection to the broker failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not currently connected to the broker.
    #[error("not connected to broker")]
    NotConnected,

    /// Publish was attempted but refused.
    #[error("publish failed on {topic}: {reason}")]
    PublishFailed {
        /// The topic the publish targeted.
        topic: String,
        /// Description of the failure.
        reason: String,
    },

    /// Internal channel was closed.
    #[error("channel closed: {0}")]
    ChannelClosed(String),
}

/// Errors related to parsing wire data.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Topic does not match the `rtk/v1/...` grammar.
    #[error("malformed topic: {0}")]
    MalformedTopic(String),

    /// Topic carries an unsupported version segment.
    #[error("unsupported topic version: {0}")]
    UnsupportedVersion(String),

    /// A topic segment contains characters outside `[A-Za-z0-9_:-]`.
    #[error("invalid topic segment: {0}")]
    InvalidSegment(String),

    /// Payload is not valid JSON or lacks the envelope fields.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// The `schema` discriminant is not `<name>/<major.minor>`.
    #[error("invalid schema id: {0}")]
    InvalidSchemaId(String),

    /// Payload failed validation against a known schema.
    #[error("schema violation for {schema}: {detail}")]
    SchemaViolation {
        /// The schema the payload claimed.
        schema: String,
        /// Description of the mismatch.
        detail: String,
    },
}

/// Errors related to the command lifecycle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The device never acknowledged the request within the retry budget.
    #[error("command timed out waiting for ack after {attempts} attempt(s)")]
    AckTimeout {
        /// Number of publish attempts made.
        attempts: u32,
    },

    /// The device acknowledged but never delivered a result.
    #[error("command timed out waiting for result")]
    ResultTimeout,

    /// The device rejected the request in its ack.
    #[error("command rejected by device: {0}")]
    Rejected(String),

    /// The device reported `status: failed` in its result.
    #[error("command failed on device: {0}")]
    DeviceFailure(String),

    /// The command was cancelled before reaching a terminal state.
    #[error("command cancelled")]
    Cancelled,

    /// No live command matches the given id.
    #[error("unknown command id: {0}")]
    UnknownId(String),

    /// The per-device in-flight limit was reached.
    #[error("device {device_id} has too many in-flight commands (limit {limit})")]
    DeviceBusy {
        /// The device that is saturated.
        device_id: String,
        /// The configured in-flight limit.
        limit: usize,
    },
}

/// Errors related to workflow classification and execution.
#[derive(Debug, Error, Clone)]
pub enum WorkflowError {
    /// No workflow is registered under the given id.
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    /// A step failed and was not optional.
    #[error("step {step_id} failed: {reason}")]
    StepFailed {
        /// The step that failed.
        step_id: String,
        /// The step's error text.
        reason: String,
    },

    /// A step or the whole workflow exceeded its time budget.
    #[error("workflow timed out in step {0}")]
    Timeout(String),

    /// The execution was cancelled.
    #[error("workflow cancelled")]
    Cancelled,

    /// The concurrent-workflow limit was reached and acquisition failed.
    #[error("workflow engine is at capacity")]
    AtCapacity,

    /// A `${path}` reference could not be resolved against prior results.
    #[error("unresolved reference {reference} in step {step_id}")]
    UnresolvedReference {
        /// The `${...}` expression that failed to resolve.
        reference: String,
        /// The step whose parameters contained it.
        step_id: String,
    },

    /// A referenced tool is not registered with the tool engine.
    #[error("unknown tool: {0}")]
    UnknownTool(String),
}

/// Errors related to the storage adapter.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend refused or failed the operation.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// A stored record could not be decoded.
    #[error("corrupt record at {key}: {detail}")]
    Corrupt {
        /// The key whose value failed to decode.
        key: String,
        /// Description of the decode failure.
        detail: String,
    },
}

/// Errors related to configuration and workflow definitions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A workflow definition failed validation.
    #[error("invalid workflow {workflow_id}: {detail}")]
    InvalidWorkflow {
        /// The offending workflow id.
        workflow_id: String,
        /// What the validator objected to.
        detail: String,
    },

    /// Workflow definition text could not be parsed.
    #[error("unparseable workflow source: {0}")]
    UnparseableSource(String),

    /// A configuration value is out of its allowed range.
    #[error("invalid config value for {field}: {detail}")]
    InvalidValue {
        /// The configuration field.
        field: String,
        /// Why the value was rejected.
        detail: String,
    },
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(ProtocolError::InvalidEnvelope(err.to_string()))
    }
}

/// A specialized Result type for this library.
pub type Result<T> = std::result::Result<T, Error>;
