use serde_json::Value as JsonValue;

use super::{Operation, Properties, ProtocolMessage};

/// Accumulates the operations of one outgoing message in program order.
///
/// Consecutive `set` operations on one target collapse into a single
/// operation, and a `set` directly after the target's `create` lands in the
/// create's initial properties.
#[derive(Debug, Default)]
pub struct MessageWriter {
    head: Properties,
    operations: Vec<Operation>,
}

impl MessageWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_head(&mut self, key: &str, value: impl Into<JsonValue>) {
        self.head.insert(key.to_string(), value.into());
    }

    pub fn append_create(&mut self, target: &str, type_tag: &str) {
        self.operations.push(Operation::Create {
            target: target.to_string(),
            type_tag: type_tag.to_string(),
            properties: Properties::new(),
        });
    }

    pub fn append_set(&mut self, target: &str, property: &str, value: JsonValue) {
        match self.operations.last_mut() {
            Some(Operation::Set {
                target: last,
                properties,
            })
            | Some(Operation::Create {
                target: last,
                properties,
                ..
            }) if last == target => {
                properties.insert(property.to_string(), value);
            }
            _ => {
                let mut properties = Properties::new();
                properties.insert(property.to_string(), value);
                self.operations.push(Operation::Set {
                    target: target.to_string(),
                    properties,
                });
            }
        }
    }

    pub fn append_listen(&mut self, target: &str, event: &str, listen: bool) {
        match self.operations.last_mut() {
            Some(Operation::Listen {
                target: last,
                properties,
            }) if last == target => {
                properties.insert(event.to_string(), JsonValue::Bool(listen));
            }
            _ => {
                let mut properties = Properties::new();
                properties.insert(event.to_string(), JsonValue::Bool(listen));
                self.operations.push(Operation::Listen {
                    target: target.to_string(),
                    properties,
                });
            }
        }
    }

    pub fn append_call(&mut self, target: &str, method: &str, properties: Properties) {
        self.operations.push(Operation::Call {
            target: target.to_string(),
            method: method.to_string(),
            properties,
        });
    }

    pub fn append_destroy(&mut self, target: &str) {
        self.operations.push(Operation::Destroy {
            target: target.to_string(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    pub fn finish(self) -> ProtocolMessage {
        ProtocolMessage {
            head: self.head,
            operations: self.operations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sets_after_create_fold_into_initial_properties() {
        let mut writer = MessageWriter::new();
        writer.append_create("o1", "T");
        writer.append_set("o1", "x", json!(1));
        writer.append_set("o1", "y", json!("a"));

        let message = writer.finish();
        assert_eq!(message.operations.len(), 1);
        assert_eq!(
            serde_json::to_value(&message.operations[0]).unwrap(),
            json!({ "action": "create", "target": "o1", "type": "T", "properties": { "x": 1, "y": "a" } })
        );
    }

    #[test]
    fn sets_on_different_targets_stay_separate() {
        let mut writer = MessageWriter::new();
        writer.append_set("o1", "x", json!(1));
        writer.append_set("o2", "x", json!(2));
        writer.append_set("o1", "y", json!(3));

        let targets: Vec<&str> = writer.operations.iter().map(Operation::target).collect();
        assert_eq!(targets, vec!["o1", "o2", "o1"]);
    }

    #[test]
    fn listen_merges_consecutive_flags() {
        let mut writer = MessageWriter::new();
        writer.append_listen("o1", "Selection", true);
        writer.append_listen("o1", "Help", false);

        let message = writer.finish();
        assert_eq!(message.operations.len(), 1);
        assert_eq!(
            serde_json::to_value(&message.operations[0]).unwrap(),
            json!({ "action": "listen", "target": "o1", "properties": { "Selection": true, "Help": false } })
        );
    }

    #[test]
    fn head_is_written_once() {
        let mut writer = MessageWriter::new();
        writer.append_head("requestCounter", 4);
        writer.append_destroy("o3");

        let message = writer.finish();
        assert_eq!(message.request_counter(), Some(4));
        assert_eq!(message.operations.len(), 1);
    }
}
