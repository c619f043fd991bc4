// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Topic addresses for the versioned `rtk/v1` hierarchy.
//!
//! Every message in the fabric travels on a topic of the form
//! `rtk/v1/<tenant>/<site>/<device_id>/<kind>[/<sub>]`. [`TopicAddr`] is the
//! parsed form; parsing and formatting are exact inverses, so any accepted
//! topic round-trips byte-for-byte.
//!
//! Device identity is canonicalised here as well: MAC addresses reported as
//! `AA:BB:CC:DD:EE:FF`, `aa-bb-cc-dd-ee-ff` or `AABBCCDDEEFF` all collapse to
//! the same colon-free lowercase form, so a device that reports both spellings
//! is not duplicated.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// The only topic version this controller speaks.
pub const TOPIC_VERSION: &str = "v1";

/// The fixed topic prefix.
pub const TOPIC_PREFIX: &str = "rtk";

/// The message kind segment of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicKind {
    /// Retained device state snapshot.
    State,
    /// Telemetry stream, qualified by a metric sub-segment.
    Telemetry,
    /// Device event, qualified by an event-type sub-segment.
    Evt,
    /// Retained device attributes.
    Attr,
    /// Last-will-and-testament presence message.
    Lwt,
    /// Command request/ack/result, qualified by `req`, `ack` or `res`.
    Cmd,
    /// Topology report, qualified by `discovery` or `connections`.
    Topology,
}

impl TopicKind {
    /// Returns the wire segment for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::State => "state",
            Self::Telemetry => "telemetry",
            Self::Evt => "evt",
            Self::Attr => "attr",
            Self::Lwt => "lwt",
            Self::Cmd => "cmd",
            Self::Topology => "topology",
        }
    }

    /// Whether this kind requires a sub-segment (7-segment topic).
    #[must_use]
    pub const fn requires_sub(self) -> bool {
        matches!(self, Self::Telemetry | Self::Evt | Self::Cmd | Self::Topology)
    }
}

impl FromStr for TopicKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "state" => Ok(Self::State),
            "telemetry" => Ok(Self::Telemetry),
            "evt" => Ok(Self::Evt),
            "attr" => Ok(Self::Attr),
            "lwt" => Ok(Self::Lwt),
            "cmd" => Ok(Self::Cmd),
            "topology" => Ok(Self::Topology),
            other => Err(ProtocolError::MalformedTopic(format!(
                "unknown kind segment '{other}'"
            ))),
        }
    }
}

impl fmt::Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed topic address.
///
/// Only version `v1` topics are representable; any other version is rejected
/// at parse time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicAddr {
    /// Tenant namespace segment.
    pub tenant: String,
    /// Site segment within the tenant.
    pub site: String,
    /// Canonical device identifier.
    pub device_id: String,
    /// Message kind.
    pub kind: TopicKind,
    /// Sub-segment for kinds that carry one (`telemetry`, `evt`, `cmd`,
    /// `topology`).
    pub sub: Option<String>,
}

impl TopicAddr {
    /// Builds an address for a device-directed command request.
    #[must_use]
    pub fn cmd_req(tenant: impl Into<String>, site: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            site: site.into(),
            device_id: device_id.into(),
            kind: TopicKind::Cmd,
            sub: Some("req".to_string()),
        }
    }

    /// Builds an address with the same device coordinates but a different
    /// kind and sub.
    #[must_use]
    pub fn with_kind(&self, kind: TopicKind, sub: Option<&str>) -> Self {
        Self {
            tenant: self.tenant.clone(),
            site: self.site.clone(),
            device_id: self.device_id.clone(),
            kind,
            sub: sub.map(str::to_string),
        }
    }

    /// Parses a topic string.
    ///
    /// Accepts exactly 6 or 7 `/`-separated segments with prefix `rtk`,
    /// version `v1`, and segments restricted to `[A-Za-z0-9_:-]+`. Kinds that
    /// require a sub-segment must have one; kinds that do not must not.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] describing the first violation found.
    pub fn parse(topic: &str) -> Result<Self, ProtocolError> {
        let segments: Vec<&str> = topic.split('/').collect();
        if !(6..=7).contains(&segments.len()) {
            return Err(ProtocolError::MalformedTopic(format!(
                "expected 6-7 segments, got {}",
                segments.len()
            )));
        }

        if segments[0] != TOPIC_PREFIX {
            return Err(ProtocolError::MalformedTopic(format!(
                "expected prefix '{TOPIC_PREFIX}', got '{}'",
                segments[0]
            )));
        }
        if segments[1] != TOPIC_VERSION {
            return Err(ProtocolError::UnsupportedVersion(segments[1].to_string()));
        }

        for segment in &segments[2..] {
            if !is_valid_segment(segment) {
                return Err(ProtocolError::InvalidSegment((*segment).to_string()));
            }
        }

        let kind: TopicKind = segments[5].parse()?;
        let sub = segments.get(6).map(|s| (*s).to_string());

        if kind.requires_sub() && sub.is_none() {
            return Err(ProtocolError::MalformedTopic(format!(
                "kind '{kind}' requires a sub-segment"
            )));
        }
        if !kind.requires_sub() && sub.is_some() {
            return Err(ProtocolError::MalformedTopic(format!(
                "kind '{kind}' does not take a sub-segment"
            )));
        }
        if kind == TopicKind::Cmd
            && !matches!(sub.as_deref(), Some("req" | "ack" | "res"))
        {
            return Err(ProtocolError::MalformedTopic(format!(
                "cmd sub-segment must be req, ack or res, got '{}'",
                sub.as_deref().unwrap_or("")
            )));
        }

        Ok(Self {
            tenant: segments[2].to_string(),
            site: segments[3].to_string(),
            device_id: segments[4].to_string(),
            kind,
            sub,
        })
    }

    /// Returns the canonical identity form of this address's device id.
    ///
    /// See [`canonical_device_id`].
    #[must_use]
    pub fn canonical_device_id(&self) -> String {
        canonical_device_id(&self.device_id)
    }
}

impl fmt::Display for TopicAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{TOPIC_PREFIX}/{TOPIC_VERSION}/{}/{}/{}/{}",
            self.tenant, self.site, self.device_id, self.kind
        )?;
        if let Some(sub) = &self.sub {
            write!(f, "/{sub}")?;
        }
        Ok(())
    }
}

impl FromStr for TopicAddr {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Checks a topic segment against the allowed charset `[A-Za-z0-9_:-]+`.
fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b':' || b == b'-')
}

/// Canonicalises a device identifier for identity comparison.
///
/// Identifiers that look like MAC addresses (12 hex digits once separators
/// are removed) collapse to colon-free lowercase hex; everything else is
/// lowercased as-is.
#[must_use]
pub fn canonical_device_id(id: &str) -> String {
    let stripped: String = id
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect();
    if stripped.len() == 12 && stripped.chars().all(|c| c.is_ascii_hexdigit()) {
        stripped.to_ascii_lowercase()
    } else {
        id.to_ascii_lowercase()
    }
}

/// Canonicalises a MAC address to colon-free lowercase hex.
///
/// Returns `None` when the input does not contain exactly 12 hex digits.
#[must_use]
pub fn canonical_mac(mac: &str) -> Option<String> {
    let stripped: String = mac
        .chars()
        .filter(|c| *c != ':' && *c != '-' && *c != '.')
        .collect();
    if stripped.len() == 12 && stripped.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(stripped.to_ascii_lowercase())
    } else {
        None
    }
}
