use serde_json::Value as JsonValue;
use tracing::warn;

use super::{Operation, Properties, ProtocolError, HEAD_INITIALIZE, HEAD_REQUEST_COUNTER};

/// A client-originated `notify` operation.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientEvent {
    pub target: String,
    pub event: String,
    pub properties: Properties,
}

impl ClientEvent {
    pub fn new(target: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            event: event.into(),
            properties: Properties::new(),
        }
    }

    pub fn with_property(mut self, name: &str, value: impl Into<JsonValue>) -> Self {
        self.properties.insert(name.to_string(), value.into());
        self
    }

    pub fn property(&self, name: &str) -> Option<&JsonValue> {
        self.properties.get(name)
    }

    /// Reads `name` as a string; numbers and booleans are rendered as text.
    pub fn string(&self, name: &str) -> Result<String, ProtocolError> {
        match self.require(name)? {
            JsonValue::String(value) => Ok(value.clone()),
            JsonValue::Number(value) => Ok(value.to_string()),
            JsonValue::Bool(value) => Ok(value.to_string()),
            _ => Err(self.type_error(name, "string")),
        }
    }

    pub fn int(&self, name: &str) -> Result<i64, ProtocolError> {
        match self.require(name)? {
            JsonValue::Number(value) => value.as_i64().ok_or_else(|| self.type_error(name, "integer")),
            JsonValue::String(value) => value
                .trim()
                .parse()
                .map_err(|_| self.type_error(name, "integer")),
            _ => Err(self.type_error(name, "integer")),
        }
    }

    pub fn bool(&self, name: &str) -> Result<bool, ProtocolError> {
        match self.require(name)? {
            JsonValue::Bool(value) => Ok(*value),
            JsonValue::String(value) if value == "true" => Ok(true),
            JsonValue::String(value) if value == "false" => Ok(false),
            _ => Err(self.type_error(name, "boolean")),
        }
    }

    fn require(&self, name: &str) -> Result<&JsonValue, ProtocolError> {
        self.properties
            .get(name)
            .ok_or_else(|| ProtocolError::MissingProperty {
                event: self.event.clone(),
                property: name.to_string(),
            })
    }

    fn type_error(&self, name: &str, expected: &'static str) -> ProtocolError {
        ProtocolError::PropertyType {
            event: self.event.clone(),
            property: name.to_string(),
            expected,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientOperation {
    Notify(ClientEvent),
    /// Property values the client changed locally (e.g. typed text).
    Set { target: String, properties: Properties },
}

/// Decoded request: head metadata plus the accepted client operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientMessage {
    head: Properties,
    operations: Vec<ClientOperation>,
}

impl ClientMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let value: JsonValue = serde_json::from_slice(bytes)
            .map_err(|err| ProtocolError::MalformedMessage(err.to_string()))?;
        Self::from_json(value)
    }

    /// Only an unreadable envelope fails; bad operations are dropped one by one.
    pub fn from_json(value: JsonValue) -> Result<Self, ProtocolError> {
        let JsonValue::Object(mut envelope) = value else {
            return Err(ProtocolError::MalformedMessage(
                "message is not a JSON object".into(),
            ));
        };

        let head = match envelope.remove("head") {
            None | Some(JsonValue::Null) => Properties::new(),
            Some(JsonValue::Object(head)) => head,
            Some(_) => {
                return Err(ProtocolError::MalformedMessage(
                    "head is not an object".into(),
                ))
            }
        };

        let raw_operations = match envelope.remove("operations") {
            None | Some(JsonValue::Null) => Vec::new(),
            Some(JsonValue::Array(items)) => items,
            Some(_) => {
                return Err(ProtocolError::MalformedMessage(
                    "operations is not an array".into(),
                ))
            }
        };

        let mut operations = Vec::with_capacity(raw_operations.len());
        for (index, raw) in raw_operations.into_iter().enumerate() {
            match decode_operation(index, raw) {
                Ok(operation) => operations.push(operation),
                Err(err) => warn!(error = %err, "dropping client operation"),
            }
        }

        Ok(Self { head, operations })
    }

    pub fn with_head(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        self.head.insert(key.to_string(), value.into());
        self
    }

    pub fn with_event(mut self, event: ClientEvent) -> Self {
        self.operations.push(ClientOperation::Notify(event));
        self
    }

    pub fn with_notify(self, target: &str, event: &str) -> Self {
        self.with_event(ClientEvent::new(target, event))
    }

    pub fn with_set(mut self, target: &str, property: &str, value: impl Into<JsonValue>) -> Self {
        let mut properties = Properties::new();
        properties.insert(property.to_string(), value.into());
        self.operations.push(ClientOperation::Set {
            target: target.to_string(),
            properties,
        });
        self
    }

    pub fn head(&self) -> &Properties {
        &self.head
    }

    pub fn head_value(&self, key: &str) -> Option<&JsonValue> {
        self.head.get(key)
    }

    /// The client marks its very first request with `initialize: true`.
    pub fn is_initialize(&self) -> bool {
        match self.head.get(HEAD_INITIALIZE) {
            Some(JsonValue::Bool(flag)) => *flag,
            Some(JsonValue::String(flag)) => flag == "true",
            _ => false,
        }
    }

    pub fn request_counter(&self) -> Option<u64> {
        match self.head.get(HEAD_REQUEST_COUNTER)? {
            JsonValue::Number(counter) => counter.as_u64(),
            JsonValue::String(counter) => counter.parse().ok(),
            _ => None,
        }
    }

    pub fn operations(&self) -> &[ClientOperation] {
        &self.operations
    }

    pub fn events(&self) -> impl Iterator<Item = &ClientEvent> {
        self.operations.iter().filter_map(|op| match op {
            ClientOperation::Notify(event) => Some(event),
            ClientOperation::Set { .. } => None,
        })
    }

    pub fn find_event(&self, target: &str, event: &str) -> Option<&ClientEvent> {
        self.events()
            .find(|candidate| candidate.target == target && candidate.event == event)
    }

    pub fn was_event_sent(&self, target: &str, event: &str) -> bool {
        self.find_event(target, event).is_some()
    }
}

fn decode_operation(index: usize, raw: JsonValue) -> Result<ClientOperation, ProtocolError> {
    let operation: Operation =
        serde_json::from_value(raw).map_err(|err| ProtocolError::InvalidOperation {
            index,
            reason: err.to_string(),
        })?;
    match operation {
        Operation::Notify {
            target,
            event,
            properties,
        } => Ok(ClientOperation::Notify(ClientEvent {
            target,
            event,
            properties,
        })),
        Operation::Set { target, properties } => Ok(ClientOperation::Set { target, properties }),
        other => Err(ProtocolError::InvalidOperation {
            index,
            reason: format!("{} is a server-only action", other.action()),
        }),
    }
}
