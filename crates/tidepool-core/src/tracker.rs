//! Change tracking for remote objects.
//!
//! The preserved state of an object is what the client currently shows: it is
//! recorded by every render and refreshed in READ_DATA for the properties the
//! client echoed back (`acknowledge`). RENDER compares it with the current
//! attributes and emits only what changed. Objects never rendered before get a
//! `create` with their non-default attributes instead.

use std::any::Any;
use std::collections::BTreeSet;

use serde_json::Value as JsonValue;

use crate::protocol::{MessageWriter, Properties, ProtocolError};
use crate::registry::{Entry, ObjectId, RemoteObjectRegistry};
use crate::value::{Attributes, Value};

pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A server object mirrored on the client.
pub trait Renderable: AsAny + Send {
    fn type_tag(&self) -> &str;

    /// Current values of every trackable attribute. A name missing from the
    /// map is treated as unset.
    fn attributes(&self) -> Attributes;

    /// Value the client assumes before any `set`; matching attributes are
    /// left out of `create`.
    fn default_value(&self, _name: &str) -> Value {
        Value::Null
    }

    /// Applies a property the client changed locally and echoed in a `set`.
    fn apply_property(&mut self, name: &str, _value: &JsonValue) -> Result<(), ProtocolError> {
        Err(ProtocolError::ReadOnlyProperty(name.to_string()))
    }

    /// Method calls queued since the last render.
    fn drain_calls(&mut self) -> Vec<PendingCall> {
        Vec::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingCall {
    pub method: String,
    pub properties: Properties,
}

impl PendingCall {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            properties: Properties::new(),
        }
    }

    pub fn with_property(mut self, name: &str, value: impl Into<JsonValue>) -> Self {
        self.properties.insert(name.to_string(), value.into());
        self
    }
}

/// Generic attribute-bag object.
#[derive(Debug, Clone)]
pub struct PropertyBag {
    type_tag: String,
    attributes: Attributes,
    defaults: Attributes,
    client_writable: BTreeSet<String>,
    calls: Vec<PendingCall>,
}

impl PropertyBag {
    pub fn new(type_tag: impl Into<String>) -> Self {
        Self {
            type_tag: type_tag.into(),
            attributes: Attributes::new(),
            defaults: Attributes::new(),
            client_writable: BTreeSet::new(),
            calls: Vec::new(),
        }
    }

    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn with_default(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.defaults.insert(name.to_string(), value.into());
        self
    }

    /// Allows the client to echo `name` back in a `set` operation.
    pub fn client_writable(mut self, name: &str) -> Self {
        self.client_writable.insert(name.to_string());
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.attributes.insert(name.to_string(), value.into());
    }

    pub fn unset(&mut self, name: &str) -> Option<Value> {
        self.attributes.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn call(&mut self, call: PendingCall) {
        self.calls.push(call);
    }
}

impl Renderable for PropertyBag {
    fn type_tag(&self) -> &str {
        &self.type_tag
    }

    fn attributes(&self) -> Attributes {
        self.attributes.clone()
    }

    fn default_value(&self, name: &str) -> Value {
        self.defaults.get(name).cloned().unwrap_or(Value::Null)
    }

    fn apply_property(&mut self, name: &str, value: &JsonValue) -> Result<(), ProtocolError> {
        if !self.client_writable.contains(name) {
            return Err(ProtocolError::ReadOnlyProperty(name.to_string()));
        }
        self.attributes.insert(name.to_string(), Value::from_json(value));
        Ok(())
    }

    fn drain_calls(&mut self) -> Vec<PendingCall> {
        std::mem::take(&mut self.calls)
    }
}

/// Client-visible state captured at the last render.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Preserved {
    attributes: Attributes,
    listening: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderSummary {
    pub created: usize,
    pub updated: usize,
    pub destroyed: usize,
}

/// Attribute changes from `previous` to `current`. An attribute that
/// disappeared is reported as `Null` unless it already was `Null`.
pub fn diff_attributes(previous: &Attributes, current: &Attributes) -> Vec<(String, Value)> {
    let mut changes: Vec<(String, Value)> = current
        .iter()
        .filter(|(name, value)| previous.get(name.as_str()) != Some(*value))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    for (name, old) in previous {
        if !current.contains_key(name) && !old.is_null() {
            changes.push((name.clone(), Value::Null));
        }
    }
    changes
}

fn listening(entry: &Entry) -> BTreeSet<String> {
    entry.listeners.keys().cloned().collect()
}

/// Records that the client already shows the current value of `name`, so the
/// next render does not send it back.
pub(crate) fn acknowledge(entry: &mut Entry, name: &str) {
    if !entry.rendered {
        return;
    }
    let current = entry.object().attributes().remove(name);
    if let Some(preserved) = entry.preserved.as_mut() {
        match current {
            Some(value) => preserved.attributes.insert(name.to_string(), value),
            None => preserved.attributes.remove(name),
        };
    }
}

/// Forgets all client-side state; the next render re-creates every object.
/// Objects pending destruction were never shown to the reloaded client, so
/// they leave without a `destroy`.
pub(crate) fn reset(registry: &mut RemoteObjectRegistry) {
    for entry in registry.all_entries_mut() {
        entry.rendered = false;
        entry.preserved = None;
    }
}

/// Bookkeeping of one render. Nothing in it is applied to the registry until
/// the round as a whole succeeds, so a failed round renders the same changes
/// again.
#[derive(Debug, Default)]
pub(crate) struct RenderCommit {
    purged: Vec<ObjectId>,
    rendered: Vec<(ObjectId, Preserved, usize)>,
}

/// Emits destroys first, then creates and updates in creation order.
pub(crate) fn render(
    registry: &mut RemoteObjectRegistry,
    writer: &mut MessageWriter,
) -> (RenderSummary, RenderCommit) {
    let mut summary = RenderSummary::default();
    let mut commit = RenderCommit::default();

    for entry in registry.disposed_entries() {
        if entry.rendered {
            writer.append_destroy(entry.id.as_str());
            summary.destroyed += 1;
        }
        commit.purged.push(entry.id.clone());
    }

    for entry in registry.entries_mut() {
        let before = writer.operation_count();
        let created = !entry.rendered;
        let (preserved, calls) = render_entry(entry, writer);
        if created {
            summary.created += 1;
        } else if writer.operation_count() != before {
            summary.updated += 1;
        }
        commit.rendered.push((entry.id.clone(), preserved, calls));
    }

    (summary, commit)
}

/// Records what the client now shows: preserved state, sent calls and freed ids.
pub(crate) fn commit(registry: &mut RemoteObjectRegistry, commit: RenderCommit) {
    registry.purge(&commit.purged);
    for (id, preserved, calls) in commit.rendered {
        // Objects unregistered after RENDER still owe the client a destroy.
        let Some(entry) = registry.entry_mut(id.as_str()) else {
            continue;
        };
        entry.rendered = true;
        entry.preserved = Some(preserved);
        entry.outbox.drain(..calls.min(entry.outbox.len()));
    }
}

fn render_entry(entry: &mut Entry, writer: &mut MessageWriter) -> (Preserved, usize) {
    let id = entry.id.as_str().to_string();
    let attributes = entry.object().attributes();
    let listening = listening(entry);

    match entry.preserved.as_ref().filter(|_| entry.rendered) {
        None => {
            writer.append_create(&id, &entry.type_tag);
            for (name, value) in &attributes {
                if *value != entry.object().default_value(name) {
                    writer.append_set(&id, name, value.to_json());
                }
            }
            for event in &listening {
                writer.append_listen(&id, event, true);
            }
        }
        Some(preserved) => {
            for (name, value) in diff_attributes(&preserved.attributes, &attributes) {
                writer.append_set(&id, &name, value.to_json());
            }
            for event in preserved.listening.symmetric_difference(&listening) {
                writer.append_listen(&id, event, listening.contains(event));
            }
        }
    }

    let drained = entry.object_mut().drain_calls();
    entry.outbox.extend(drained);
    for call in &entry.outbox {
        writer.append_call(&id, &call.method, call.properties.clone());
    }

    (
        Preserved {
            attributes,
            listening,
        },
        entry.outbox.len(),
    )
}
