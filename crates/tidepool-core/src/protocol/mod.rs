//! JSON operation envelope shared by both directions of a round.
//!
//! Ordering inside `operations` is significant: a later operation may target
//! an id created by an earlier one in the same message.

mod reader;
mod writer;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub use reader::{ClientEvent, ClientMessage, ClientOperation};
pub use writer::MessageWriter;

pub type Properties = serde_json::Map<String, JsonValue>;

pub const HEAD_INITIALIZE: &str = "initialize";
pub const HEAD_REQUEST_COUNTER: &str = "requestCounter";
pub const HEAD_ERROR: &str = "error";
pub const HEAD_MESSAGE: &str = "message";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("operation {index} dropped: {reason}")]
    InvalidOperation { index: usize, reason: String },
    #[error("unknown target: {0}")]
    UnknownTarget(String),
    #[error("event {event} is missing property {property}")]
    MissingProperty { event: String, property: String },
    #[error("property {property} of event {event} is not a {expected}")]
    PropertyType {
        event: String,
        property: String,
        expected: &'static str,
    },
    #[error("property {0} cannot be set by the client")]
    ReadOnlyProperty(String),
    #[error("property {property} rejected: {reason}")]
    InvalidProperty { property: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Operation {
    Create {
        target: String,
        #[serde(rename = "type")]
        type_tag: String,
        #[serde(default)]
        properties: Properties,
    },
    Set {
        target: String,
        #[serde(default)]
        properties: Properties,
    },
    Listen {
        target: String,
        #[serde(default)]
        properties: Properties,
    },
    Call {
        target: String,
        method: String,
        #[serde(default)]
        properties: Properties,
    },
    Destroy {
        target: String,
    },
    Notify {
        target: String,
        event: String,
        #[serde(default)]
        properties: Properties,
    },
}

impl Operation {
    pub fn target(&self) -> &str {
        match self {
            Operation::Create { target, .. }
            | Operation::Set { target, .. }
            | Operation::Listen { target, .. }
            | Operation::Call { target, .. }
            | Operation::Destroy { target }
            | Operation::Notify { target, .. } => target,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Operation::Create { .. } => "create",
            Operation::Set { .. } => "set",
            Operation::Listen { .. } => "listen",
            Operation::Call { .. } => "call",
            Operation::Destroy { .. } => "destroy",
            Operation::Notify { .. } => "notify",
        }
    }
}

/// Outgoing message: head metadata plus ordered operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    #[serde(default)]
    pub head: Properties,
    #[serde(default)]
    pub operations: Vec<Operation>,
}

impl ProtocolMessage {
    /// Error envelope understood by the client: no operations, reason in the head.
    pub fn error(kind: &str, message: impl Into<String>) -> Self {
        let mut head = Properties::new();
        head.insert(HEAD_ERROR.into(), JsonValue::String(kind.to_string()));
        head.insert(HEAD_MESSAGE.into(), JsonValue::String(message.into()));
        Self {
            head,
            operations: Vec::new(),
        }
    }

    pub fn request_counter(&self) -> Option<u64> {
        self.head.get(HEAD_REQUEST_COUNTER).and_then(JsonValue::as_u64)
    }

    pub fn operations_for<'a>(&'a self, target: &'a str) -> impl Iterator<Item = &'a Operation> {
        self.operations.iter().filter(move |op| op.target() == target)
    }

    pub fn to_json(&self) -> JsonValue {
        // Properties and operations are plain JSON already.
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn operations_serialize_with_action_tag() {
        let op = Operation::Create {
            target: "o1".into(),
            type_tag: "T".into(),
            properties: json!({ "x": 1 }).as_object().cloned().unwrap(),
        };
        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({ "action": "create", "target": "o1", "type": "T", "properties": { "x": 1 } })
        );

        let destroy = Operation::Destroy { target: "o1".into() };
        assert_eq!(
            serde_json::to_value(&destroy).unwrap(),
            json!({ "action": "destroy", "target": "o1" })
        );
    }

    #[test]
    fn error_envelope_has_no_operations() {
        let message = ProtocolMessage::error("invalid request counter", "expected 3");
        assert_eq!(
            message.to_json(),
            json!({
                "head": { "error": "invalid request counter", "message": "expected 3" },
                "operations": []
            })
        );
    }
}
