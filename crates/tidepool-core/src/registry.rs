use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::lifecycle::{ListenerError, RoundContext};
use crate::protocol::ClientEvent;
use crate::tracker::{PendingCall, Preserved, Renderable};

/// Client-visible object id. Assigned once, never reused within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    fn from_serial(serial: u64) -> Self {
        Self(format!("o{serial}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ObjectId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ObjectId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Handle returned by [`RemoteObjectRegistry::add_listener`], used to detach it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerKey(u64);

pub type EventHandler =
    dyn Fn(&mut RoundContext<'_>, &ClientEvent) -> Result<(), ListenerError> + Send + Sync;

pub(crate) struct Entry {
    pub(crate) id: ObjectId,
    pub(crate) type_tag: String,
    pub(crate) object: Box<dyn Renderable>,
    pub(crate) listeners: BTreeMap<String, Vec<(HandlerKey, Arc<EventHandler>)>>,
    pub(crate) preserved: Option<Preserved>,
    /// Calls drained from the object but not yet confirmed as sent.
    pub(crate) outbox: Vec<PendingCall>,
    pub(crate) rendered: bool,
    pub(crate) disposed: bool,
}

impl Entry {
    pub(crate) fn object(&self) -> &dyn Renderable {
        self.object.as_ref()
    }

    pub(crate) fn object_mut(&mut self) -> &mut dyn Renderable {
        self.object.as_mut()
    }
}

/// Per-session table of remote objects, kept in creation order.
///
/// Unregistered objects stay in the table, hidden from lookups, until the
/// next render has emitted their `destroy`.
#[derive(Default)]
pub struct RemoteObjectRegistry {
    entries: BTreeMap<u64, Entry>,
    index: HashMap<ObjectId, u64>,
    singletons: HashMap<String, ObjectId>,
    next_serial: u64,
    next_handler: u64,
}

impl RemoteObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Renderable>(&mut self, object: T) -> ObjectId {
        self.register_boxed(Box::new(object))
    }

    pub fn register_boxed(&mut self, object: Box<dyn Renderable>) -> ObjectId {
        self.next_serial += 1;
        let serial = self.next_serial;
        let id = ObjectId::from_serial(serial);
        let type_tag = object.type_tag().to_string();
        self.entries.insert(
            serial,
            Entry {
                id: id.clone(),
                type_tag,
                object,
                listeners: BTreeMap::new(),
                preserved: None,
                outbox: Vec::new(),
                rendered: false,
                disposed: false,
            },
        );
        self.index.insert(id.clone(), serial);
        id
    }

    /// Registers at most one live object per type tag. Returns the existing
    /// id when one is already registered; `object` is dropped in that case.
    pub fn register_singleton<T: Renderable>(&mut self, object: T) -> ObjectId {
        if let Some(id) = self.singletons.get(object.type_tag()) {
            return id.clone();
        }
        let type_tag = object.type_tag().to_string();
        let id = self.register(object);
        self.singletons.insert(type_tag, id.clone());
        id
    }

    pub fn singleton(&self, type_tag: &str) -> Option<&ObjectId> {
        self.singletons.get(type_tag)
    }

    /// Marks the object for destruction. Returns false for unknown or
    /// already unregistered ids.
    pub fn unregister(&mut self, id: &str) -> bool {
        let Some(entry) = self.live_entry_mut(id) else {
            return false;
        };
        entry.disposed = true;
        entry.listeners.clear();
        let type_tag = entry.type_tag.clone();
        if self.singletons.get(&type_tag).map(ObjectId::as_str) == Some(id) {
            self.singletons.remove(&type_tag);
        }
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.live_entry(id).is_some()
    }

    pub fn lookup(&self, id: &str) -> Option<&dyn Renderable> {
        self.live_entry(id).map(Entry::object)
    }

    pub fn lookup_mut(&mut self, id: &str) -> Option<&mut dyn Renderable> {
        self.live_entry_mut(id).map(Entry::object_mut)
    }

    /// Typed access; `None` when the id is unknown or holds another type.
    pub fn get<T: Renderable>(&self, id: &str) -> Option<&T> {
        self.lookup(id)?.as_any().downcast_ref::<T>()
    }

    pub fn get_mut<T: Renderable>(&mut self, id: &str) -> Option<&mut T> {
        self.lookup_mut(id)?.as_any_mut().downcast_mut::<T>()
    }

    /// Runs `f` on the object if it is still live; a stale id is a no-op.
    pub fn with_mut<T: Renderable, R>(&mut self, id: &str, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.get_mut::<T>(id).map(f)
    }

    pub fn type_tag(&self, id: &str) -> Option<&str> {
        self.live_entry(id).map(|entry| entry.type_tag.as_str())
    }

    /// Live ids in creation order.
    pub fn ids(&self) -> Vec<ObjectId> {
        self.entries
            .values()
            .filter(|entry| !entry.disposed)
            .map(|entry| entry.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.values().filter(|entry| !entry.disposed).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add_listener<F>(&mut self, id: &str, event: &str, handler: F) -> Option<HandlerKey>
    where
        F: Fn(&mut RoundContext<'_>, &ClientEvent) -> Result<(), ListenerError>
            + Send
            + Sync
            + 'static,
    {
        self.next_handler += 1;
        let key = HandlerKey(self.next_handler);
        let entry = self.live_entry_mut(id)?;
        entry
            .listeners
            .entry(event.to_string())
            .or_default()
            .push((key, Arc::new(handler)));
        Some(key)
    }

    pub fn remove_listener(&mut self, id: &str, key: HandlerKey) -> bool {
        let Some(entry) = self.live_entry_mut(id) else {
            return false;
        };
        let mut removed = false;
        entry.listeners.retain(|_, handlers| {
            let before = handlers.len();
            handlers.retain(|(candidate, _)| *candidate != key);
            removed |= handlers.len() != before;
            !handlers.is_empty()
        });
        removed
    }

    pub fn has_listener(&self, id: &str, event: &str) -> bool {
        self.live_entry(id)
            .is_some_and(|entry| entry.listeners.contains_key(event))
    }

    /// Handlers for `event` at dispatch time, or `None` for an unknown target.
    pub(crate) fn handlers_for(&self, id: &str, event: &str) -> Option<Vec<Arc<EventHandler>>> {
        let entry = self.live_entry(id)?;
        Some(
            entry
                .listeners
                .get(event)
                .map(|handlers| handlers.iter().map(|(_, handler)| handler.clone()).collect())
                .unwrap_or_default(),
        )
    }

    pub(crate) fn live_entry(&self, id: &str) -> Option<&Entry> {
        let serial = self.index.get(id)?;
        self.entries.get(serial).filter(|entry| !entry.disposed)
    }

    pub(crate) fn live_entry_mut(&mut self, id: &str) -> Option<&mut Entry> {
        let serial = self.index.get(id)?;
        self.entries.get_mut(serial).filter(|entry| !entry.disposed)
    }

    pub(crate) fn entries_mut(&mut self) -> impl Iterator<Item = &mut Entry> {
        self.entries.values_mut().filter(|entry| !entry.disposed)
    }

    /// Disposed entries in creation order.
    pub(crate) fn disposed_entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values().filter(|entry| entry.disposed)
    }

    /// Every entry, disposed ones included.
    pub(crate) fn all_entries_mut(&mut self) -> impl Iterator<Item = &mut Entry> {
        self.entries.values_mut()
    }

    /// Looks up an entry whether or not it is disposed.
    pub(crate) fn entry_mut(&mut self, id: &str) -> Option<&mut Entry> {
        let serial = self.index.get(id)?;
        self.entries.get_mut(serial)
    }

    /// Frees the ids of disposed entries for good.
    pub(crate) fn purge(&mut self, ids: &[ObjectId]) {
        for id in ids {
            let Some(serial) = self.index.get(id.as_str()).copied() else {
                continue;
            };
            if self.entries.get(&serial).is_some_and(|entry| entry.disposed) {
                self.entries.remove(&serial);
                self.index.remove(id);
            }
        }
    }

    /// Serial of the most recently registered object.
    pub(crate) fn serial_mark(&self) -> u64 {
        self.next_serial
    }

    /// Drops every object registered after `mark` without a trace on the
    /// client. Only valid while none of them has been rendered.
    pub(crate) fn discard_since(&mut self, mark: u64) -> usize {
        let discarded = self.entries.split_off(&(mark + 1));
        for entry in discarded.values() {
            self.index.remove(&entry.id);
        }
        self.singletons
            .retain(|_, id| self.index.contains_key(id.as_str()));
        discarded.len()
    }
}

impl fmt::Debug for RemoteObjectRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteObjectRegistry")
            .field("live", &self.len())
            .field("next_serial", &self.next_serial)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::PropertyBag;

    #[test]
    fn ids_are_unique_and_never_reused() {
        let mut registry = RemoteObjectRegistry::new();
        let first = registry.register(PropertyBag::new("T"));
        let second = registry.register(PropertyBag::new("T"));
        assert_ne!(first, second);

        assert!(registry.unregister(first.as_str()));
        registry.purge(&[first.clone()]);
        let third = registry.register(PropertyBag::new("T"));
        assert_ne!(third, first);
        assert_ne!(third, second);
    }

    #[test]
    fn unregistered_objects_are_hidden_from_lookup() {
        let mut registry = RemoteObjectRegistry::new();
        let id = registry.register(PropertyBag::new("T"));
        assert!(registry.contains(id.as_str()));

        assert!(registry.unregister(id.as_str()));
        assert!(!registry.contains(id.as_str()));
        assert!(registry.lookup(id.as_str()).is_none());
        assert!(!registry.unregister(id.as_str()));
        assert!(registry.is_empty());
    }

    #[test]
    fn singleton_registration_is_idempotent() {
        let mut registry = RemoteObjectRegistry::new();
        let first = registry.register_singleton(PropertyBag::new("svc"));
        let again = registry.register_singleton(PropertyBag::new("svc"));
        assert_eq!(first, again);
        assert_eq!(registry.len(), 1);

        registry.unregister(first.as_str());
        let fresh = registry.register_singleton(PropertyBag::new("svc"));
        assert_ne!(fresh, first);
    }

    #[test]
    fn typed_access_checks_the_concrete_type() {
        let mut registry = RemoteObjectRegistry::new();
        let id = registry.register(PropertyBag::new("T").with("text", "a"));
        assert!(registry.get::<PropertyBag>(id.as_str()).is_some());

        registry
            .get_mut::<PropertyBag>(id.as_str())
            .unwrap()
            .set("text", "b");
        let text = registry.get::<PropertyBag>(id.as_str()).unwrap().get("text").cloned();
        assert_eq!(text, Some("b".into()));

        registry.unregister(id.as_str());
        let stale = registry.with_mut(id.as_str(), |bag: &mut PropertyBag| bag.set("text", "c"));
        assert!(stale.is_none());
    }

    #[test]
    fn listeners_attach_and_detach_by_key() {
        let mut registry = RemoteObjectRegistry::new();
        let id = registry.register(PropertyBag::new("T"));
        let key = registry
            .add_listener(id.as_str(), "Selection", |_, _| Ok(()))
            .unwrap();
        assert!(registry.has_listener(id.as_str(), "Selection"));
        assert_eq!(registry.handlers_for(id.as_str(), "Selection").unwrap().len(), 1);

        assert!(registry.remove_listener(id.as_str(), key));
        assert!(!registry.has_listener(id.as_str(), "Selection"));
        assert!(registry.handlers_for("o99", "Selection").is_none());
        assert!(registry.add_listener("o99", "Selection", |_, _| Ok(())).is_none());
    }
}
