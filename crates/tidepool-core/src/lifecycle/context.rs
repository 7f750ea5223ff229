use std::collections::VecDeque;
use std::sync::Arc;

use uuid::Uuid;

use super::{PhaseId, PhaseListenerBus};
use crate::navigation::BrowserNavigation;
use crate::protocol::{ClientEvent, ClientMessage, MessageWriter, ProtocolMessage};
use crate::registry::RemoteObjectRegistry;
use crate::tracker::{self, RenderCommit};

/// Everything a session keeps between rounds. Guarded by the session lock.
pub struct UiState {
    session_id: Uuid,
    registry: RemoteObjectRegistry,
    bus: Arc<PhaseListenerBus>,
    navigation: Arc<BrowserNavigation>,
    pub(crate) startup: bool,
    pub(crate) request_counter: u64,
    pub(crate) last_response: Option<ProtocolMessage>,
}

impl UiState {
    pub fn new(session_id: Uuid) -> Self {
        let bus = Arc::new(PhaseListenerBus::new());
        let navigation = BrowserNavigation::install(&bus);
        Self {
            session_id,
            registry: RemoteObjectRegistry::new(),
            bus,
            navigation,
            startup: true,
            request_counter: 0,
            last_response: None,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn registry(&self) -> &RemoteObjectRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut RemoteObjectRegistry {
        &mut self.registry
    }

    pub fn listener_bus(&self) -> &Arc<PhaseListenerBus> {
        &self.bus
    }

    pub fn browser_navigation(&self) -> &Arc<BrowserNavigation> {
        &self.navigation
    }

    /// True until the entry point has built the root objects.
    pub fn is_startup(&self) -> bool {
        self.startup
    }

    /// Number of completed rounds.
    pub fn request_counter(&self) -> u64 {
        self.request_counter
    }
}

/// Per-round view handed to phase listeners, event handlers and the entry point.
pub struct RoundContext<'a> {
    state: &'a mut UiState,
    request: &'a ClientMessage,
    writer: MessageWriter,
    phase: PhaseId,
    startup: bool,
    events: VecDeque<ClientEvent>,
    staged: Option<RenderCommit>,
}

impl<'a> RoundContext<'a> {
    pub(crate) fn new(state: &'a mut UiState, request: &'a ClientMessage, startup: bool) -> Self {
        Self {
            state,
            request,
            writer: MessageWriter::new(),
            phase: PhaseId::PrepareUiRoot,
            startup,
            events: request.events().cloned().collect(),
            staged: None,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.state.session_id
    }

    pub fn phase(&self) -> PhaseId {
        self.phase
    }

    pub(crate) fn set_phase(&mut self, phase: PhaseId) {
        self.phase = phase;
    }

    pub fn is_startup(&self) -> bool {
        self.startup
    }

    pub fn request(&self) -> &'a ClientMessage {
        self.request
    }

    pub fn registry(&self) -> &RemoteObjectRegistry {
        &self.state.registry
    }

    pub fn registry_mut(&mut self) -> &mut RemoteObjectRegistry {
        &mut self.state.registry
    }

    pub fn writer(&mut self) -> &mut MessageWriter {
        &mut self.writer
    }

    pub fn listener_bus(&self) -> Arc<PhaseListenerBus> {
        self.state.bus.clone()
    }

    pub fn browser_navigation(&self) -> Arc<BrowserNavigation> {
        self.state.navigation.clone()
    }

    /// Removes the first queued event matching `target` and `event`, so the
    /// built-in dispatch in PROCESS_ACTION no longer sees it.
    pub fn take_event(&mut self, target: &str, event: &str) -> Option<ClientEvent> {
        let position = self
            .events
            .iter()
            .position(|candidate| candidate.target == target && candidate.event == event)?;
        self.events.remove(position)
    }

    pub fn pending_events(&self) -> impl Iterator<Item = &ClientEvent> {
        self.events.iter()
    }

    pub(crate) fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.pop_front()
    }

    pub(crate) fn state(&self) -> &UiState {
        self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut UiState {
        self.state
    }

    pub(crate) fn render_parts(&mut self) -> (&mut RemoteObjectRegistry, &mut MessageWriter) {
        (&mut self.state.registry, &mut self.writer)
    }

    pub(crate) fn stage_render(&mut self, commit: RenderCommit) {
        self.staged = Some(commit);
    }

    /// Applies the render bookkeeping once every phase has succeeded.
    pub(crate) fn finish(self) -> ProtocolMessage {
        if let Some(commit) = self.staged {
            tracker::commit(&mut self.state.registry, commit);
        }
        self.state.navigation.commit_render();
        self.writer.finish()
    }

    /// Drops the output of a failed round; the next render repeats it.
    pub(crate) fn abandon(self) {
        self.state.navigation.discard_render();
    }
}
