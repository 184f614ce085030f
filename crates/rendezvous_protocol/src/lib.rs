/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Wire types shared by the rendezvous relay and its clients.
//!
//! An [`Envelope`] is the unit relayed between peers of one session. Only a
//! handful of fields are reserved (`session`, `from`, `to`, `type`, `seq`,
//! `ts`, `transient`); everything else is carried through untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Upper bound for session and client identifiers.
pub const MAX_ID_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("missing session")]
    MissingSession,
    #[error("invalid session")]
    InvalidSession,
    #[error("invalid client id")]
    InvalidClient,
}

/// Protocol-level message tag.
///
/// Unknown tags are kept verbatim so newer clients can exchange message
/// types this relay does not know about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    #[default]
    Signal,
    HostClaim,
    HostAck,
    JoinAccept,
    JoinDeny,
    Snapshot,
    Reattach,
    Ping,
    Pong,
    Presence,
    Other(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::Signal => "signal",
            MessageKind::HostClaim => "host-claim",
            MessageKind::HostAck => "host-ack",
            MessageKind::JoinAccept => "join-accept",
            MessageKind::JoinDeny => "join-deny",
            MessageKind::Snapshot => "snapshot",
            MessageKind::Reattach => "reattach",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::Presence => "presence",
            MessageKind::Other(s) => s.as_str(),
        }
    }
}

impl From<String> for MessageKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "signal" => MessageKind::Signal,
            "host-claim" => MessageKind::HostClaim,
            "host-ack" => MessageKind::HostAck,
            "join-accept" => MessageKind::JoinAccept,
            "join-deny" => MessageKind::JoinDeny,
            "snapshot" => MessageKind::Snapshot,
            "reattach" => MessageKind::Reattach,
            "ping" => MessageKind::Ping,
            "pong" => MessageKind::Pong,
            "presence" => MessageKind::Presence,
            _ => MessageKind::Other(s),
        }
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Other(s) => s,
            other => other.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_false(v: &bool) -> bool {
    !*v
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub session: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "is_false")]
    pub transient: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
    /// Type-specific payload, passed through unexamined.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Envelope {
    pub fn new(session: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            session: session.into(),
            from: None,
            to: None,
            kind,
            transient: false,
            seq: None,
            ts: None,
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Parses an inbound frame or request body.
    ///
    /// A client-supplied `seq` is discarded: sequence numbers are only ever
    /// assigned by the session actor.
    pub fn parse(raw: &str) -> Result<Self, EnvelopeError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        let Value::Object(mut obj) = value else {
            return Err(EnvelopeError::Malformed("expected a json object".to_string()));
        };
        obj.remove("seq");
        let session = match obj.get("session") {
            Some(Value::String(s)) => s.trim().to_string(),
            _ => return Err(EnvelopeError::MissingSession),
        };
        if session.is_empty() {
            return Err(EnvelopeError::MissingSession);
        }
        if session.len() > MAX_ID_LEN {
            return Err(EnvelopeError::InvalidSession);
        }
        obj.insert("session".to_string(), Value::String(session));
        serde_json::from_value(Value::Object(obj)).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }

    /// Fills `from` with the connection identity when the sender left it out.
    pub fn default_from(&mut self, client_id: &str) {
        let blank = self.from.as_deref().map(|f| f.trim().is_empty()).unwrap_or(true);
        if blank {
            self.from = Some(client_id.to_string());
        }
    }

    pub fn from_id(&self) -> &str {
        self.from.as_deref().unwrap_or_default()
    }

    /// Unicast envelopes are only visible to their addressee.
    pub fn is_visible_to(&self, client_id: &str) -> bool {
        match self.to.as_deref() {
            Some(to) => to == client_id,
            None => true,
        }
    }

    pub fn is_from(&self, client_id: &str) -> bool {
        self.from.as_deref() == Some(client_id)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(|v| v.as_str())
    }
}

pub fn validate_client_id(raw: &str) -> Result<String, EnvelopeError> {
    let id = raw.trim();
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(EnvelopeError::InvalidClient);
    }
    Ok(id.to_string())
}

pub fn validate_session_id(raw: &str) -> Result<String, EnvelopeError> {
    let id = raw.trim();
    if id.is_empty() {
        return Err(EnvelopeError::MissingSession);
    }
    if id.len() > MAX_ID_LEN {
        return Err(EnvelopeError::InvalidSession);
    }
    Ok(id.to_string())
}

/// Response body of a successful `POST`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostAck {
    pub ok: bool,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub ok: bool,
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: error.into(),
        }
    }
}
