// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Payload envelopes.
//!
//! Every payload on the fabric is a JSON object carrying a `schema`
//! discriminant (`<name>/<major.minor>`), a `ts` wall-clock timestamp in unix
//! milliseconds, and a type-specific body. [`Envelope`] is the decoded form;
//! the body stays a raw JSON map so unknown payload shapes (arbitrary
//! telemetry metrics) pass through untouched.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;

/// Envelopes with `ts` within this window of wall clock are *fresh*.
pub const FRESHNESS_WINDOW_MS: i64 = 5 * 60 * 1000;

/// Maximum length of a command id on the wire.
pub const MAX_COMMAND_ID_LEN: usize = 64;

/// Returns the current wall clock in unix milliseconds.
#[must_use]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// A parsed `<name>/<major.minor>` schema discriminant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchemaId {
    /// Schema name, e.g. `device.state` or `cmd.ack`.
    pub name: String,
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
}

impl SchemaId {
    /// Builds a schema id from parts.
    #[must_use]
    pub fn new(name: impl Into<String>, major: u32, minor: u32) -> Self {
        Self {
            name: name.into(),
            major,
            minor,
        }
    }
}

impl FromStr for SchemaId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, version) = s
            .rsplit_once('/')
            .ok_or_else(|| ProtocolError::InvalidSchemaId(s.to_string()))?;
        let (major, minor) = version
            .split_once('.')
            .ok_or_else(|| ProtocolError::InvalidSchemaId(s.to_string()))?;
        if name.is_empty() {
            return Err(ProtocolError::InvalidSchemaId(s.to_string()));
        }
        let major = major
            .parse()
            .map_err(|_| ProtocolError::InvalidSchemaId(s.to_string()))?;
        let minor = minor
            .parse()
            .map_err(|_| ProtocolError::InvalidSchemaId(s.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            major,
            minor,
        })
    }
}

impl fmt::Display for SchemaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}.{}", self.name, self.major, self.minor)
    }
}

/// A decoded payload envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Parsed schema discriminant.
    pub schema: SchemaId,
    /// Sender timestamp, unix milliseconds.
    pub ts: i64,
    /// Remaining body fields.
    pub body: Map<String, Value>,
}

impl Envelope {
    /// Decodes an envelope from raw payload bytes.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] when the payload is not a JSON object,
    /// lacks `schema` or `ts`, or carries an unparseable schema id.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| ProtocolError::InvalidEnvelope(e.to_string()))?;
        let Value::Object(mut body) = value else {
            return Err(ProtocolError::InvalidEnvelope(
                "payload is not a JSON object".to_string(),
            ));
        };

        let schema = match body.remove("schema") {
            Some(Value::String(s)) => s.parse::<SchemaId>()?,
            _ => {
                return Err(ProtocolError::InvalidEnvelope(
                    "missing 'schema' field".to_string(),
                ));
            }
        };
        let ts = match body.remove("ts") {
            Some(Value::Number(n)) => n.as_i64().ok_or_else(|| {
                ProtocolError::InvalidEnvelope("'ts' is not an integer".to_string())
            })?,
            _ => {
                return Err(ProtocolError::InvalidEnvelope(
                    "missing 'ts' field".to_string(),
                ));
            }
        };

        Ok(Self { schema, ts, body })
    }

    /// Builds an envelope with the current wall clock as `ts`.
    #[must_use]
    pub fn new(schema: SchemaId, body: Map<String, Value>) -> Self {
        Self {
            schema,
            ts: now_ms(),
            body,
        }
    }

    /// Serialises this envelope back into a wire payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Map::with_capacity(self.body.len() + 2);
        out.insert("schema".to_string(), Value::String(self.schema.to_string()));
        out.insert("ts".to_string(), Value::Number(self.ts.into()));
        for (k, v) in &self.body {
            out.insert(k.clone(), v.clone());
        }
        Value::Object(out).to_string().into_bytes()
    }

    /// Whether `ts` is within the ±5 minute freshness window of `now`.
    ///
    /// Stale envelopes are still accepted; callers flag them.
    #[must_use]
    pub fn is_fresh_at(&self, now: i64) -> bool {
        (now - self.ts).abs() <= FRESHNESS_WINDOW_MS
    }

    /// Whether `ts` is fresh against the current wall clock.
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(now_ms())
    }

    /// Returns a body field as a string slice, if present.
    #[must_use]
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    /// Returns the body as a JSON value (cloned).
    #[must_use]
    pub fn body_value(&self) -> Value {
        Value::Object(self.body.clone())
    }
}

/// Ack status reported by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    /// The device accepted the command and will execute it.
    Accepted,
    /// The device refused the command.
    Rejected,
}

/// Result status reported by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    /// The command ran to completion.
    Completed,
    /// The command failed on the device.
    Failed,
}

/// Body of a `cmd/ack` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckBody {
    /// Correlated command id.
    pub id: String,
    /// Whether the device accepted the request.
    pub status: AckStatus,
    /// Device-supplied error text when rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of a `cmd/res` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultBody {
    /// Correlated command id.
    pub id: String,
    /// Terminal outcome of the command on the device.
    pub status: ResultStatus,
    /// Operation-specific result map.
    #[serde(default)]
    pub result: Map<String, Value>,
    /// Device-supplied error text when failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AckBody {
    /// Extracts an ack body from a decoded envelope.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] when `id` or `status` are missing or the
    /// id exceeds the wire limit.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        let body: Self = serde_json::from_value(envelope.body_value())
            .map_err(|e| ProtocolError::InvalidEnvelope(format!("cmd.ack: {e}")))?;
        if body.id.is_empty() || body.id.len() > MAX_COMMAND_ID_LEN {
            return Err(ProtocolError::InvalidEnvelope(
                "cmd.ack: id out of bounds".to_string(),
            ));
        }
        Ok(body)
    }
}

impl ResultBody {
    /// Extracts a result body from a decoded envelope.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] when `id` or `status` are missing or the
    /// id exceeds the wire limit.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        let body: Self = serde_json::from_value(envelope.body_value())
            .map_err(|e| ProtocolError::InvalidEnvelope(format!("cmd.res: {e}")))?;
        if body.id.is_empty() || body.id.len() > MAX_COMMAND_ID_LEN {
            return Err(ProtocolError::InvalidEnvelope(
                "cmd.res: id out of bounds".to_string(),
            ));
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn schema_id_parses() {
        let id: SchemaId = "device.state/1.2".parse().unwrap();
        assert_eq!(id.name, "device.state");
        assert_eq!(id.major, 1);
        assert_eq!(id.minor, 2);
        assert_eq!(id.to_string(), "device.state/1.2");
    }

    #[test]
    fn schema_id_rejects_garbage() {
        assert!("no-version".parse::<SchemaId>().is_err());
        assert!("name/1".parse::<SchemaId>().is_err());
        assert!("name/a.b".parse::<SchemaId>().is_err());
        assert!("/1.0".parse::<SchemaId>().is_err());
    }

    #[test]
    fn decode_valid_envelope() {
        let payload = json!({
            "schema": "device.state/1.0",
            "ts": 1_700_000_000_000_i64,
            "uptime_s": 3600,
        });
        let env = Envelope::decode(payload.to_string().as_bytes()).unwrap();
        assert_eq!(env.schema.name, "device.state");
        assert_eq!(env.ts, 1_700_000_000_000);
        assert_eq!(env.body.get("uptime_s"), Some(&json!(3600)));
    }

    #[test]
    fn decode_rejects_missing_fields() {
        assert!(Envelope::decode(br#"{"ts": 1}"#).is_err());
        assert!(Envelope::decode(br#"{"schema": "a/1.0"}"#).is_err());
        assert!(Envelope::decode(br"[1,2]").is_err());
        assert!(Envelope::decode(b"not json").is_err());
    }

    #[test]
    fn encode_roundtrips() {
        let mut body = Map::new();
        body.insert("op".to_string(), json!("reboot"));
        let env = Envelope::new(SchemaId::new("cmd.reboot", 1, 0), body);
        let decoded = Envelope::decode(&env.encode()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn freshness_window() {
        let env = Envelope {
            schema: SchemaId::new("x", 1, 0),
            ts: 1_000_000,
            body: Map::new(),
        };
        assert!(env.is_fresh_at(1_000_000));
        assert!(env.is_fresh_at(1_000_000 + FRESHNESS_WINDOW_MS));
        assert!(!env.is_fresh_at(1_000_000 + FRESHNESS_WINDOW_MS + 1));
        assert!(!env.is_fresh_at(1_000_000 - FRESHNESS_WINDOW_MS - 1));
    }

    #[test]
    fn ack_body_from_envelope() {
        let payload = json!({
            "schema": "cmd.ack/1.0",
            "ts": 1_700_000_000_000_i64,
            "id": "abc-123",
            "status": "accepted",
        });
        let env = Envelope::decode(payload.to_string().as_bytes()).unwrap();
        let ack = AckBody::from_envelope(&env).unwrap();
        assert_eq!(ack.id, "abc-123");
        assert_eq!(ack.status, AckStatus::Accepted);
        assert!(ack.error.is_none());
    }

    #[test]
    fn ack_body_rejects_oversized_id() {
        let payload = json!({
            "schema": "cmd.ack/1.0",
            "ts": 0,
            "id": "x".repeat(MAX_COMMAND_ID_LEN + 1),
            "status": "accepted",
        });
        let env = Envelope::decode(payload.to_string().as_bytes()).unwrap();
        assert!(AckBody::from_envelope(&env).is_err());
    }

    #[test]
    fn result_body_from_envelope() {
        let payload = json!({
            "schema": "cmd.get_system_info.result/1.0",
            "ts": 1_700_000_000_000_i64,
            "id": "abc-123",
            "status": "completed",
            "result": {"uptime_s": 3600},
        });
        let env = Envelope::decode(payload.to_string().as_bytes()).unwrap();
        let res = ResultBody::from_envelope(&env).unwrap();
        assert_eq!(res.status, ResultStatus::Completed);
        assert_eq!(res.result.get("uptime_s"), Some(&json!(3600)));
    }

    #[test]
    fn result_body_failed_with_error() {
        let payload = json!({
            "schema": "cmd.reboot.result/1.0",
            "ts": 0,
            "id": "abc",
            "status": "failed",
            "error": "device busy",
        });
        let env = Envelope::decode(payload.to_string().as_bytes()).unwrap();
        let res = ResultBody::from_envelope(&env).unwrap();
        assert_eq!(res.status, ResultStatus::Failed);
        assert_eq!(res.error.as_deref(), Some("device busy"));
    }
}
