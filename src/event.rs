//! Application events and the decoder that turns record payloads into them

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// An application event as carried on a stream
///
/// Only the envelope fields are typed; everything else the producer put in
/// the event travels in `body`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub event_created_on: i64,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            instance_id: Some(instance_id.into()),
            event_created_on: chrono::Utc::now().timestamp(),
            body: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.body.insert(key.into(), value.into());
        self
    }

    /// Partition key used when publishing; events of one instance stay on one shard
    pub fn partition_key(&self) -> &str {
        self.instance_id.as_deref().unwrap_or(&self.event_type)
    }
}

/// Callback invoked once per decoded event
///
/// Errors and panics are caught per record and never reach the runtime.
pub type EventCallback = Arc<dyn Fn(Event) -> anyhow::Result<()> + Send + Sync>;

/// Wraps a closure as an [`EventCallback`]
pub fn callback<F>(f: F) -> EventCallback
where
    F: Fn(Event) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Turns a raw record payload into an [`Event`]
pub trait EventDecoder: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<Event, DecodeError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeHeader {
    #[serde(default)]
    source_instance_id: Option<String>,
}

/// Decodes JSON events, either bare or wrapped in a `{header, body}` envelope
///
/// An event without a type, with a type outside the registered set, or
/// without an instance id is rejected. An empty type registry accepts any type.
#[derive(Debug, Clone, Default)]
pub struct JsonEventDecoder {
    known_types: HashSet<String>,
}

impl JsonEventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_types<I, T>(types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            known_types: types.into_iter().map(Into::into).collect(),
        }
    }

    pub fn register_type(&mut self, event_type: impl Into<String>) {
        self.known_types.insert(event_type.into());
    }

    fn decode_value(&self, mut value: Value) -> Result<Event, DecodeError> {
        let envelope_instance = match value.as_object_mut() {
            Some(obj) if obj.contains_key("header") && obj.contains_key("body") => {
                let header: EnvelopeHeader =
                    serde_json::from_value(obj.remove("header").unwrap_or(Value::Null))?;
                let body = obj.remove("body").unwrap_or(Value::Null);
                value = body;
                Some(header.source_instance_id)
            }
            _ => None,
        };

        match value.get("type") {
            Some(Value::String(t)) if !t.is_empty() => {
                if !self.known_types.is_empty() && !self.known_types.contains(t) {
                    return Err(DecodeError::UnknownType(t.clone()));
                }
            }
            _ => return Err(DecodeError::MissingType),
        }

        let mut event: Event = serde_json::from_value(value)?;
        if let Some(source_instance_id) = envelope_instance {
            event.instance_id = source_instance_id;
        }

        match event.instance_id.as_deref() {
            Some(id) if !id.is_empty() => Ok(event),
            _ => Err(DecodeError::MissingInstanceId(event.event_type)),
        }
    }
}

impl EventDecoder for JsonEventDecoder {
    fn decode(&self, payload: &[u8]) -> Result<Event, DecodeError> {
        let text = std::str::from_utf8(payload)?;
        let value: Value = serde_json::from_str(text)?;
        self.decode_value(value)
    }
}
