//! Line-delimited JSON envelopes exchanged with the engine over stdio.

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::error::{SessionError, SessionResult};

/// Reserved method used to negotiate the session banner.
pub const HANDSHAKE_METHOD: &str = "harness.banner";
/// Request id reserved for the banner handshake.
pub const HANDSHAKE_ID: u64 = 0;
/// Protocol tag announced during the handshake.
pub const PROTOCOL_TAG: &str = "json-rpc";

/// Outbound request envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    pub params: Map<String, Value>,
}

impl Request {
    /// Build a request, accepting `null` as an empty parameter object.
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> SessionResult<Self> {
        let params = match params {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            other => return Err(SessionError::InvalidParams(other.to_string())),
        };
        Ok(Self {
            id,
            method: method.into(),
            params,
        })
    }

    /// Compact single-line encoding terminated by `\n`.
    pub fn encode_line(&self) -> SessionResult<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Params sent with the reserved handshake request.
pub fn handshake_params(client: &str, session_id: &str) -> Value {
    json!({
        "client": client,
        "session": session_id,
        "protocol": PROTOCOL_TAG,
    })
}

/// A decoded line from the engine's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Responses and notifications: any JSON object.
    Object(Map<String, Value>),
    /// Any other well-formed JSON value.
    Scalar(Value),
}

impl Inbound {
    pub fn as_object(&self) -> Option<&Map<String, Value>> {
        match self {
            Inbound::Object(map) => Some(map),
            Inbound::Scalar(_) => None,
        }
    }

    /// Numeric `id` field, if present.
    pub fn id(&self) -> Option<u64> {
        self.as_object()?.get("id")?.as_u64()
    }

    pub fn method(&self) -> Option<&str> {
        self.as_object()?.get("method")?.as_str()
    }

    pub fn params(&self) -> Option<&Value> {
        self.as_object()?.get("params")
    }

    pub fn result(&self) -> Option<&Value> {
        self.as_object()?.get("result")
    }

    /// True when this is a response carrying a `result` field.
    pub fn is_response(&self) -> bool {
        self.result().is_some()
    }

    pub fn into_value(self) -> Value {
        match self {
            Inbound::Object(map) => Value::Object(map),
            Inbound::Scalar(value) => value,
        }
    }
}

/// Outcome of decoding one raw stdout line.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Decoded {
    Blank,
    Message(Inbound),
    Malformed(String),
}

pub(crate) fn decode_line(raw: &str) -> Decoded {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Decoded::Blank;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => Decoded::Message(Inbound::Object(map)),
        Ok(value) => Decoded::Message(Inbound::Scalar(value)),
        Err(_) => Decoded::Malformed(trimmed.to_string()),
    }
}

/// Banner payloads are always object-shaped; anything else is wrapped.
pub(crate) fn normalize_banner(result: Option<&Value>) -> Map<String, Value> {
    match result {
        Some(Value::Object(map)) => map.clone(),
        Some(other) => wrap_message(other.clone()),
        None => wrap_message(Value::Null),
    }
}

fn wrap_message(value: Value) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("message".to_string(), value);
    map
}
