//! Wire envelope exchanged with the debugger.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Event name reserved for error replies and error pushes.
pub const ERROR_EVENT: &str = "error";

/// Severity attached to `error` envelopes and `log` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ErrorLevel {
    /// Notice.
    Notice = 1,
    /// Error.
    Error = 2,
    /// Warning.
    Warn = 3,
    /// Informational.
    Info = 4,
    /// Debug output.
    Debug = 5,
    /// Verbose output.
    Verbose = 6,
}

impl TryFrom<u8> for ErrorLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, String> {
        match value {
            1 => Ok(Self::Notice),
            2 => Ok(Self::Error),
            3 => Ok(Self::Warn),
            4 => Ok(Self::Info),
            5 => Ok(Self::Debug),
            6 => Ok(Self::Verbose),
            other => Err(format!("unknown error level: {other}")),
        }
    }
}

impl From<ErrorLevel> for u8 {
    fn from(level: ErrorLevel) -> Self {
        level as u8
    }
}

impl fmt::Display for ErrorLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Notice => "notice",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Verbose => "verbose",
        };
        f.write_str(name)
    }
}

/// One JSON message exchanged over the debugger connection.
///
/// Every envelope names its `event`. Requests that expect a reply, and the
/// replies themselves, also carry a `ticket`. All other keys are event
/// specific and are kept in insertion order in [`Envelope::fields`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name, e.g. `cpu.getReg` or `log`.
    pub event: String,
    /// Correlation ticket, present only on requests expecting a reply and
    /// on the matching replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<String>,
    /// Event-specific fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Envelope {
    /// Create an envelope with no extra fields.
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            ticket: None,
            fields: Map::new(),
        }
    }

    /// Create an envelope from an event name and a JSON object of fields.
    ///
    /// Non-object values are ignored, as are `event` and `ticket` keys.
    pub fn with_fields(event: impl Into<String>, fields: Value) -> Self {
        let mut envelope = Self::new(event);
        if let Value::Object(map) = fields {
            for (key, value) in map {
                envelope.insert(key, value);
            }
        }
        envelope
    }

    /// Synthesize an `error` envelope.
    pub fn error(message: impl Into<String>, level: ErrorLevel) -> Self {
        Self::new(ERROR_EVENT)
            .with("message", message.into())
            .with("level", u8::from(level))
    }

    /// Builder-style field insertion.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert a field. `event` and `ticket` are envelope attributes, not
    /// fields, and are dropped here.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        if key == "event" || key == "ticket" {
            return;
        }
        self.fields.insert(key, value.into());
    }

    /// Look up a field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Look up a string field.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Look up an unsigned integer field.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_u64)
    }

    /// Look up a boolean field.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    /// Whether this is an `error` envelope.
    pub fn is_error(&self) -> bool {
        self.event == ERROR_EVENT
    }

    /// The `message` field, if any.
    pub fn message(&self) -> Option<&str> {
        self.get_str("message")
    }

    /// The `level` field, if present and in range.
    pub fn level(&self) -> Option<ErrorLevel> {
        self.get_u64("level")
            .and_then(|level| u8::try_from(level).ok())
            .and_then(|level| ErrorLevel::try_from(level).ok())
    }

    /// Parse an inbound text frame.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Serialize for the wire.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
