//! Browser history client service.
//!
//! Not a registry object: it addresses the client by its type name and hooks
//! the phase bus directly. A `Navigation` event from the startup request is
//! handled right after PREPARE_UI_ROOT so the freshly built UI can react to a
//! deep link; on later rounds it is handled before PROCESS_ACTION.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use tracing::debug;
use uuid::Uuid;

use crate::lifecycle::{ListenerError, ListenerId, PhaseId, PhaseListener, PhaseListenerBus, RoundContext};
use crate::protocol::Properties;
use crate::session::SessionListener;
use crate::value::AttributeError;

pub const TYPE: &str = "tp.client.BrowserNavigation";
pub const EVENT_NAVIGATION: &str = "Navigation";
const PROPERTY_ENTRY_ID: &str = "entryId";
const METHOD_ADD_TO_HISTORY: &str = "addToHistory";
const PROPERTY_ENTRIES: &str = "entries";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationEvent {
    pub entry_id: String,
}

type NavigationHandler =
    dyn Fn(&mut RoundContext<'_>, &NavigationEvent) -> Result<(), ListenerError> + Send + Sync;

#[derive(Default)]
struct NavigationState {
    entries: Vec<(String, String)>,
    handlers: Vec<(u64, Arc<NavigationHandler>)>,
    next_key: u64,
    preserved_listening: bool,
    /// Entries and listen flag written by the current round's render.
    sent: Option<(usize, bool)>,
    bus_id: Option<ListenerId>,
}

/// Handler and history queue positions, taken before the entry point runs.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NavigationMark {
    next_key: u64,
    entries: usize,
}

pub struct BrowserNavigation {
    state: Mutex<NavigationState>,
    bus: Weak<PhaseListenerBus>,
}

impl BrowserNavigation {
    /// Creates the service and subscribes it to `bus` for every phase.
    pub fn install(bus: &Arc<PhaseListenerBus>) -> Arc<Self> {
        let navigation = Arc::new(Self {
            state: Mutex::new(NavigationState::default()),
            bus: Arc::downgrade(bus),
        });
        let bus_id = bus.add_listener(navigation.clone());
        navigation.state.lock().bus_id = Some(bus_id);
        navigation
    }

    /// Queues a history entry for the next render. Duplicate ids are allowed.
    pub fn create_history_entry(&self, id: &str, text: &str) -> Result<(), AttributeError> {
        if id.is_empty() {
            return Err(AttributeError::InvalidArgument(
                "history entry id must not be empty".into(),
            ));
        }
        self.state
            .lock()
            .entries
            .push((id.to_string(), text.to_string()));
        Ok(())
    }

    pub fn add_navigation_listener<F>(&self, handler: F) -> u64
    where
        F: Fn(&mut RoundContext<'_>, &NavigationEvent) -> Result<(), ListenerError>
            + Send
            + Sync
            + 'static,
    {
        let mut state = self.state.lock();
        state.next_key += 1;
        let key = state.next_key;
        state.handlers.push((key, Arc::new(handler)));
        key
    }

    pub fn remove_navigation_listener(&self, key: u64) -> bool {
        let mut state = self.state.lock();
        let before = state.handlers.len();
        state.handlers.retain(|(candidate, _)| *candidate != key);
        state.handlers.len() != before
    }

    pub fn has_navigation_listener(&self) -> bool {
        !self.state.lock().handlers.is_empty()
    }

    pub fn pending_entries(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub(crate) fn mark(&self) -> NavigationMark {
        let state = self.state.lock();
        NavigationMark {
            next_key: state.next_key,
            entries: state.entries.len(),
        }
    }

    /// Forgets the handlers and history entries added since `mark`.
    pub(crate) fn rollback(&self, mark: NavigationMark) {
        let mut state = self.state.lock();
        state.handlers.retain(|(key, _)| *key <= mark.next_key);
        state.entries.truncate(mark.entries);
    }

    /// The round that rendered succeeded: its entries reached the client.
    pub(crate) fn commit_render(&self) {
        let mut state = self.state.lock();
        if let Some((entries, listening)) = state.sent.take() {
            let sent = entries.min(state.entries.len());
            state.entries.drain(..sent);
            state.preserved_listening = listening;
        }
    }

    pub(crate) fn discard_render(&self) {
        self.state.lock().sent = None;
    }

    /// The client lost its state (page reload): the listen flag is sent again.
    pub(crate) fn reset_client_state(&self) {
        self.state.lock().preserved_listening = false;
    }

    /// Unsubscribes from the bus. Further rounds ignore this service.
    pub fn detach(&self) {
        let bus_id = self.state.lock().bus_id.take();
        if let (Some(bus), Some(bus_id)) = (self.bus.upgrade(), bus_id) {
            bus.remove_listener(bus_id);
        }
    }

    fn process_navigation_event(&self, ctx: &mut RoundContext<'_>) -> Result<(), ListenerError> {
        let Some(event) = ctx.take_event(TYPE, EVENT_NAVIGATION) else {
            return Ok(());
        };
        let navigation = NavigationEvent {
            entry_id: event.string(PROPERTY_ENTRY_ID)?,
        };
        let handlers: Vec<Arc<NavigationHandler>> = self
            .state
            .lock()
            .handlers
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        debug!(
            session_id = %ctx.session_id(),
            entry_id = %navigation.entry_id,
            handlers = handlers.len(),
            "dispatching navigation"
        );
        for handler in handlers {
            handler(ctx, &navigation)?;
        }
        Ok(())
    }

    fn preserve(&self, startup: bool) {
        // A startup client has not been told about any listener yet; otherwise
        // the flag recorded by the last render stands.
        if startup {
            self.state.lock().preserved_listening = false;
        }
    }

    fn render(&self, ctx: &mut RoundContext<'_>) {
        let (listening, flipped, entries) = {
            let mut state = self.state.lock();
            let listening = !state.handlers.is_empty();
            let flipped = listening != state.preserved_listening;
            let queued = state.entries.len();
            state.sent = Some((queued, listening));
            (listening, flipped, state.entries.clone())
        };

        let writer = ctx.writer();
        if flipped {
            writer.append_listen(TYPE, EVENT_NAVIGATION, listening);
        }
        if !entries.is_empty() {
            let entries: Vec<JsonValue> = entries
                .iter()
                .map(|(id, text)| json!([id, text]))
                .collect();
            let mut properties = Properties::new();
            properties.insert(PROPERTY_ENTRIES.to_string(), JsonValue::Array(entries));
            writer.append_call(TYPE, METHOD_ADD_TO_HISTORY, properties);
        }
    }
}

impl PhaseListener for BrowserNavigation {
    fn phase_id(&self) -> PhaseId {
        PhaseId::Any
    }

    fn before_phase(&self, phase: PhaseId, ctx: &mut RoundContext<'_>) -> Result<(), ListenerError> {
        if phase == PhaseId::ProcessAction && !ctx.is_startup() {
            self.process_navigation_event(ctx)?;
        }
        Ok(())
    }

    fn after_phase(&self, phase: PhaseId, ctx: &mut RoundContext<'_>) -> Result<(), ListenerError> {
        match phase {
            PhaseId::PrepareUiRoot if ctx.is_startup() => self.process_navigation_event(ctx)?,
            PhaseId::ReadData => self.preserve(ctx.is_startup()),
            PhaseId::Render => self.render(ctx),
            _ => {}
        }
        Ok(())
    }
}

impl SessionListener for BrowserNavigation {
    fn before_destroy(&self, _session_id: Uuid) {
        self.detach();
    }
}

impl fmt::Debug for BrowserNavigation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BrowserNavigation")
            .field("pending_entries", &state.entries.len())
            .field("handlers", &state.handlers.len())
            .finish()
    }
}
