//! Control channel message types
//!
//! Every control frame is a JSON object tagged by its `type` field. Outbound
//! messages are free-form beyond the tag (the `config` message in particular
//! carries arbitrary fields), so [`ClientMessage`] wraps a JSON object rather
//! than a closed enum. Inbound frames are classified by [`ServerMessage::parse`].

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Inbound type announcing the server-side session id
pub const SESSION_READY: &str = "dh_2d_session_ready";

/// Inbound types re-emitted to session subscribers
pub const FORWARDED_TYPES: &[&str] = &[
    "status_change",
    "pong",
    "asr_session",
    "audio_text",
    "message_record",
    "error",
];

/// Avatar status reported by `status_change`
pub mod status {
    pub const SLEEPING: &str = "sleeping";
    pub const LISTENING: &str = "listening";
}

/// Outbound control message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientMessage(Map<String, Value>);

impl ClientMessage {
    /// Message of `kind` with extra `fields`
    ///
    /// A `type` entry in `fields` is overridden by `kind`.
    pub fn new(kind: &str, fields: Map<String, Value>) -> Self {
        let mut body = fields;
        body.insert("type".to_string(), Value::String(kind.to_string()));
        Self(body)
    }

    /// Build from a JSON value; it must be an object with a string `type`
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(body) = value else {
            return Err(Error::Protocol("message must be a JSON object".to_string()));
        };
        match body.get("type") {
            Some(Value::String(_)) => Ok(Self(body)),
            _ => Err(Error::Protocol("message needs a string `type`".to_string())),
        }
    }

    /// Session configuration; replayed after every reconnect
    pub fn config(fields: Map<String, Value>) -> Self {
        Self::new("config", fields)
    }

    /// Wake the avatar, optionally with an opening line
    pub fn wakeup(text: Option<&str>) -> Self {
        let mut fields = Map::new();
        if let Some(text) = text {
            fields.insert("text".to_string(), Value::String(text.to_string()));
        }
        Self::new("wakeup", fields)
    }

    pub fn sleep() -> Self {
        Self::new("sleep", Map::new())
    }

    /// Liveness ping; the server echoes `timestamp` in a `pong`
    pub fn ping(timestamp: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("timestamp".to_string(), Value::String(timestamp.to_string()));
        Self::new("ping", fields)
    }

    /// Received-frame telemetry
    pub fn stats(played_frames: u64) -> Self {
        let mut fields = Map::new();
        fields.insert("played_frames".to_string(), Value::from(played_frames));
        Self::new("dh_2d_stats", fields)
    }

    /// Speech recognition session control (e.g. "start", "stop")
    pub fn asr_session(command: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("command".to_string(), Value::String(command.to_string()));
        Self::new("asr_session", fields)
    }

    pub fn kind(&self) -> &str {
        self.0.get("type").and_then(Value::as_str).unwrap_or_default()
    }

    pub fn is_config(&self) -> bool {
        self.kind() == "config"
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.0)?)
    }
}

/// Whitelisted inbound application message
#[derive(Debug, Clone, PartialEq)]
pub struct AppMessage {
    kind: String,
    body: Map<String, Value>,
}

impl AppMessage {
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.body.get(field)
    }

    /// Full JSON object, `type` included
    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    /// New status carried by a `status_change`
    pub fn status(&self) -> Option<&str> {
        if self.kind != "status_change" {
            return None;
        }
        self.body.get("status").and_then(Value::as_str)
    }

    /// Echoed timestamp carried by a `pong`
    pub fn pong_timestamp(&self) -> Option<&str> {
        if self.kind != "pong" {
            return None;
        }
        self.body.get("timestamp").and_then(Value::as_str)
    }
}

/// Classified inbound text frame
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Server is ready; media negotiation may start for `session_id`
    SessionReady { session_id: String },
    /// Whitelisted message for subscribers
    Application(AppMessage),
    /// Valid JSON of a type nobody consumes
    Ignored(String),
}

impl ServerMessage {
    /// Classify a text frame
    ///
    /// # Errors
    ///
    /// `Error::Protocol` for anything that is not a JSON object with a string
    /// `type`, or a session-ready message without a session id.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::Protocol(format!("invalid JSON: {}", e)))?;
        let Value::Object(body) = value else {
            return Err(Error::Protocol("frame is not a JSON object".to_string()));
        };
        let kind = match body.get("type") {
            Some(Value::String(kind)) => kind.clone(),
            _ => return Err(Error::Protocol("frame has no string `type`".to_string())),
        };

        if kind == SESSION_READY {
            let session_id = body
                .get("session_id")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .ok_or_else(|| Error::Protocol("session ready without session_id".to_string()))?;
            return Ok(ServerMessage::SessionReady {
                session_id: session_id.to_string(),
            });
        }

        if FORWARDED_TYPES.contains(&kind.as_str()) {
            Ok(ServerMessage::Application(AppMessage { kind, body }))
        } else {
            Ok(ServerMessage::Ignored(kind))
        }
    }
}

/// Current time as an RFC 3339 timestamp with millisecond precision
pub fn ping_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
