//! Phase engine: one request/response round is
//! `PREPARE_UI_ROOT -> READ_DATA -> PROCESS_ACTION -> RENDER`.
//!
//! Each phase runs the snapshot of subscribed phase listeners before and
//! after its built-in work.

mod bus;
mod context;

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::protocol::{ClientMessage, ClientOperation, ProtocolError, ProtocolMessage};
use crate::tracker;

pub use bus::{ListenerId, PhaseListener, PhaseListenerBus};
pub use context::{RoundContext, UiState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseId {
    Any,
    PrepareUiRoot,
    ReadData,
    ProcessAction,
    Render,
}

impl PhaseId {
    pub const ROUND: [PhaseId; 4] = [
        PhaseId::PrepareUiRoot,
        PhaseId::ReadData,
        PhaseId::ProcessAction,
        PhaseId::Render,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseId::Any => "ANY",
            PhaseId::PrepareUiRoot => "PREPARE_UI_ROOT",
            PhaseId::ReadData => "READ_DATA",
            PhaseId::ProcessAction => "PROCESS_ACTION",
            PhaseId::Render => "RENDER",
        }
    }
}

impl fmt::Display for PhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a phase listener or event handler.
///
/// `Protocol` errors (bad event payloads) only fail the one dispatch and are
/// logged; `Failed` aborts the round.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum LifeCycleError {
    #[error("listener failed during {phase}: {source}")]
    ListenerFailure {
        phase: PhaseId,
        #[source]
        source: anyhow::Error,
    },
}

/// Builds the root objects on the startup round.
pub trait EntryPoint: Send + Sync {
    fn create_ui(&self, ctx: &mut RoundContext<'_>) -> anyhow::Result<()>;
}

impl<F> EntryPoint for F
where
    F: Fn(&mut RoundContext<'_>) -> anyhow::Result<()> + Send + Sync,
{
    fn create_ui(&self, ctx: &mut RoundContext<'_>) -> anyhow::Result<()> {
        self(ctx)
    }
}

#[derive(Clone)]
pub struct LifeCycle {
    entry_point: Arc<dyn EntryPoint>,
}

impl LifeCycle {
    pub fn new(entry_point: impl EntryPoint + 'static) -> Self {
        Self {
            entry_point: Arc::new(entry_point),
        }
    }

    /// Runs one round against `state`. On error the partial output is
    /// discarded; state changes made by completed work are kept.
    pub fn execute(
        &self,
        state: &mut UiState,
        request: &ClientMessage,
    ) -> Result<ProtocolMessage, LifeCycleError> {
        let reload = request.is_initialize() && !state.startup;
        if reload {
            debug!(session_id = %state.session_id(), "client re-initialized; re-rendering all objects");
            tracker::reset(state.registry_mut());
            state.browser_navigation().reset_client_state();
        }
        let startup = state.startup || request.is_initialize();

        let mut ctx = RoundContext::new(state, request, startup);
        let outcome = PhaseId::ROUND
            .into_iter()
            .try_for_each(|phase| self.run_phase(phase, &mut ctx));
        match outcome {
            Ok(()) => Ok(ctx.finish()),
            Err(err) => {
                ctx.abandon();
                Err(err)
            }
        }
    }

    fn run_phase(&self, phase: PhaseId, ctx: &mut RoundContext<'_>) -> Result<(), LifeCycleError> {
        ctx.set_phase(phase);
        let listeners = ctx.listener_bus().snapshot(phase);

        for listener in &listeners {
            guard(phase, ctx, |ctx| listener.before_phase(phase, ctx))?;
        }
        match phase {
            PhaseId::PrepareUiRoot => self.prepare_ui_root(ctx)?,
            PhaseId::ReadData => read_data(ctx),
            PhaseId::ProcessAction => process_action(ctx)?,
            PhaseId::Render => render(ctx),
            PhaseId::Any => {}
        }
        for listener in &listeners {
            guard(phase, ctx, |ctx| listener.after_phase(phase, ctx))?;
        }
        Ok(())
    }

    fn prepare_ui_root(&self, ctx: &mut RoundContext<'_>) -> Result<(), LifeCycleError> {
        if !ctx.state().startup {
            return Ok(());
        }
        let registry_mark = ctx.registry().serial_mark();
        let bus_mark = ctx.listener_bus().mark();
        let navigation_mark = ctx.browser_navigation().mark();

        if let Err(source) = self.entry_point.create_ui(ctx) {
            // Startup is retried with the next request; it must find no leftovers.
            let discarded = ctx.registry_mut().discard_since(registry_mark);
            ctx.listener_bus().remove_since(bus_mark);
            ctx.browser_navigation().rollback(navigation_mark);
            warn!(
                session_id = %ctx.session_id(),
                discarded,
                error = %source,
                "entry point failed; discarded the partial UI"
            );
            return Err(LifeCycleError::ListenerFailure {
                phase: PhaseId::PrepareUiRoot,
                source,
            });
        }
        ctx.state_mut().startup = false;
        Ok(())
    }
}

impl fmt::Debug for LifeCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifeCycle").finish_non_exhaustive()
    }
}

fn guard<F>(phase: PhaseId, ctx: &mut RoundContext<'_>, call: F) -> Result<(), LifeCycleError>
where
    F: FnOnce(&mut RoundContext<'_>) -> Result<(), ListenerError>,
{
    match call(ctx) {
        Ok(()) => Ok(()),
        Err(ListenerError::Protocol(err)) => {
            warn!(session_id = %ctx.session_id(), %phase, error = %err, "listener rejected event data");
            Ok(())
        }
        Err(ListenerError::Failed(source)) => {
            warn!(session_id = %ctx.session_id(), %phase, error = %source, "listener failed; aborting round");
            Err(LifeCycleError::ListenerFailure { phase, source })
        }
    }
}

fn read_data(ctx: &mut RoundContext<'_>) {
    let request = ctx.request();
    for operation in request.operations() {
        let ClientOperation::Set { target, properties } = operation else {
            continue;
        };
        let Some(entry) = ctx.registry_mut().live_entry_mut(target) else {
            debug!(target = %target, "dropping property echo for unknown target");
            continue;
        };
        for (name, value) in properties {
            match entry.object_mut().apply_property(name, value) {
                Ok(()) => tracker::acknowledge(entry, name),
                Err(err) => warn!(target = %target, error = %err, "dropping property echo"),
            }
        }
    }
}

fn process_action(ctx: &mut RoundContext<'_>) -> Result<(), LifeCycleError> {
    while let Some(event) = ctx.next_event() {
        let Some(handlers) = ctx.registry().handlers_for(&event.target, &event.event) else {
            debug!(
                session_id = %ctx.session_id(),
                target = %event.target,
                event = %event.event,
                "dropping event for unknown target"
            );
            continue;
        };
        for handler in handlers {
            guard(PhaseId::ProcessAction, ctx, |ctx| handler(ctx, &event))?;
        }
    }
    Ok(())
}

fn render(ctx: &mut RoundContext<'_>) {
    let session_id = ctx.session_id();
    let (registry, writer) = ctx.render_parts();
    let (summary, commit) = tracker::render(registry, writer);
    ctx.stage_render(commit);
    debug!(
        session_id = %session_id,
        created = summary.created,
        updated = summary.updated,
        destroyed = summary.destroyed,
        "rendered round"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ClientEvent, Operation};
    use crate::tracker::PropertyBag;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use uuid::Uuid;

    struct Recorder {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl PhaseListener for Recorder {
        fn phase_id(&self) -> PhaseId {
            PhaseId::Any
        }

        fn before_phase(&self, phase: PhaseId, _ctx: &mut RoundContext<'_>) -> Result<(), ListenerError> {
            self.log.lock().push(format!("before {phase}"));
            Ok(())
        }

        fn after_phase(&self, phase: PhaseId, _ctx: &mut RoundContext<'_>) -> Result<(), ListenerError> {
            self.log.lock().push(format!("after {phase}"));
            Ok(())
        }
    }

    fn noop_lifecycle() -> LifeCycle {
        LifeCycle::new(|_: &mut RoundContext<'_>| -> anyhow::Result<()> { Ok(()) })
    }

    #[test]
    fn phases_run_in_order_around_listeners() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut state = UiState::new(Uuid::new_v4());
        state
            .listener_bus()
            .add_listener(Arc::new(Recorder { log: log.clone() }));

        noop_lifecycle()
            .execute(&mut state, &ClientMessage::new())
            .unwrap();

        let log = log.lock();
        assert_eq!(
            *log,
            vec![
                "before PREPARE_UI_ROOT",
                "after PREPARE_UI_ROOT",
                "before READ_DATA",
                "after READ_DATA",
                "before PROCESS_ACTION",
                "after PROCESS_ACTION",
                "before RENDER",
                "after RENDER",
            ]
        );
    }

    #[test]
    fn entry_point_runs_only_on_startup() {
        let calls = Arc::new(Mutex::new(0));
        let counted = calls.clone();
        let lifecycle = LifeCycle::new(move |ctx: &mut RoundContext<'_>| -> anyhow::Result<()> {
            *counted.lock() += 1;
            ctx.registry_mut().register(PropertyBag::new("T"));
            Ok(())
        });
        let mut state = UiState::new(Uuid::new_v4());

        let first = lifecycle.execute(&mut state, &ClientMessage::new()).unwrap();
        let second = lifecycle.execute(&mut state, &ClientMessage::new()).unwrap();

        assert_eq!(*calls.lock(), 1);
        assert_eq!(first.operations.len(), 1);
        assert!(second.operations.is_empty());
        assert!(!state.is_startup());
    }

    #[test]
    fn handler_failure_aborts_and_protocol_errors_do_not() {
        let lifecycle = noop_lifecycle();
        let mut state = UiState::new(Uuid::new_v4());
        let id = state.registry_mut().register(PropertyBag::new("T"));
        state
            .registry_mut()
            .add_listener(id.as_str(), "Bad", |_, event| {
                event.int("missing")?;
                Ok(())
            });
        state
            .registry_mut()
            .add_listener(id.as_str(), "Boom", |_, _| Err(anyhow::anyhow!("boom").into()));

        let bad = ClientMessage::new().with_event(ClientEvent::new(id.as_str(), "Bad"));
        assert!(lifecycle.execute(&mut state, &bad).is_ok());

        let boom = ClientMessage::new().with_notify(id.as_str(), "Boom");
        let err = lifecycle.execute(&mut state, &boom).unwrap_err();
        assert!(matches!(
            err,
            LifeCycleError::ListenerFailure { phase: PhaseId::ProcessAction, .. }
        ));
    }

    #[test]
    fn property_echoes_update_the_preserved_state() {
        let lifecycle = noop_lifecycle();
        let mut state = UiState::new(Uuid::new_v4());
        let id = state
            .registry_mut()
            .register(PropertyBag::new("T").with("text", "a").client_writable("text"));
        lifecycle.execute(&mut state, &ClientMessage::new()).unwrap();

        let echo = ClientMessage::new()
            .with_set(id.as_str(), "text", "typed")
            .with_set(id.as_str(), "secret", "x");
        let response = lifecycle.execute(&mut state, &echo).unwrap();

        assert!(response.operations.is_empty());
        let bag = state.registry().get::<PropertyBag>(id.as_str()).unwrap();
        assert_eq!(bag.get("text"), Some(&"typed".into()));
        assert_eq!(bag.get("secret"), None);
    }

    #[test]
    fn listeners_added_mid_phase_wait_for_the_next_phase() {
        struct Adder {
            log: Arc<Mutex<Vec<String>>>,
        }

        impl PhaseListener for Adder {
            fn phase_id(&self) -> PhaseId {
                PhaseId::ReadData
            }

            fn before_phase(&self, _: PhaseId, ctx: &mut RoundContext<'_>) -> Result<(), ListenerError> {
                ctx.listener_bus()
                    .add_listener(Arc::new(Recorder { log: self.log.clone() }));
                Ok(())
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut state = UiState::new(Uuid::new_v4());
        state
            .listener_bus()
            .add_listener(Arc::new(Adder { log: log.clone() }));
        noop_lifecycle()
            .execute(&mut state, &ClientMessage::new())
            .unwrap();

        let log = log.lock();
        assert_eq!(log.first().map(String::as_str), Some("before PROCESS_ACTION"));
    }

    struct FailAfterRenderOnce {
        armed: AtomicBool,
    }

    impl PhaseListener for FailAfterRenderOnce {
        fn phase_id(&self) -> PhaseId {
            PhaseId::Render
        }

        fn after_phase(&self, _: PhaseId, _: &mut RoundContext<'_>) -> Result<(), ListenerError> {
            if self.armed.swap(false, Ordering::SeqCst) {
                return Err(anyhow::anyhow!("render hook failed").into());
            }
            Ok(())
        }
    }

    #[test]
    fn failure_after_render_resends_everything_next_round() {
        let lifecycle = noop_lifecycle();
        let mut state = UiState::new(Uuid::new_v4());
        let id = state.registry_mut().register(PropertyBag::new("T").with("x", 1));
        lifecycle.execute(&mut state, &ClientMessage::new()).unwrap();

        state.listener_bus().add_listener(Arc::new(FailAfterRenderOnce {
            armed: AtomicBool::new(true),
        }));
        state
            .registry_mut()
            .get_mut::<PropertyBag>(id.as_str())
            .unwrap()
            .set("x", 2);
        state
            .browser_navigation()
            .create_history_entry("h", "H")
            .unwrap();

        let err = lifecycle.execute(&mut state, &ClientMessage::new()).unwrap_err();
        assert!(matches!(err, LifeCycleError::ListenerFailure { phase: PhaseId::Render, .. }));

        let retry = lifecycle.execute(&mut state, &ClientMessage::new()).unwrap();
        assert_eq!(
            serde_json::to_value(&retry.operations).unwrap(),
            json!([
                { "action": "set", "target": id.as_str(), "properties": { "x": 2 } },
                {
                    "action": "call",
                    "target": crate::navigation::TYPE,
                    "method": "addToHistory",
                    "properties": { "entries": [["h", "H"]] }
                }
            ])
        );
        let quiet = lifecycle.execute(&mut state, &ClientMessage::new()).unwrap();
        assert!(quiet.operations.is_empty());
    }

    #[test]
    fn failed_entry_point_leaves_nothing_behind() {
        let failed_once = Arc::new(AtomicBool::new(false));
        let flag = failed_once.clone();
        let log = Arc::new(Mutex::new(Vec::new()));
        let lifecycle = LifeCycle::new(move |ctx: &mut RoundContext<'_>| -> anyhow::Result<()> {
            ctx.registry_mut().register_singleton(PropertyBag::new("Root"));
            ctx.listener_bus()
                .add_listener(Arc::new(Recorder { log: log.clone() }));
            ctx.browser_navigation().add_navigation_listener(|_, _| Ok(()));
            ctx.browser_navigation().create_history_entry("start", "Start")?;
            if !flag.swap(true, Ordering::SeqCst) {
                anyhow::bail!("backend not ready");
            }
            Ok(())
        });
        let mut state = UiState::new(Uuid::new_v4());

        let err = lifecycle.execute(&mut state, &ClientMessage::new()).unwrap_err();
        assert!(matches!(err, LifeCycleError::ListenerFailure { phase: PhaseId::PrepareUiRoot, .. }));
        assert!(state.registry().is_empty());
        assert!(state.registry().singleton("Root").is_none());
        assert_eq!(state.listener_bus().len(), 1);
        assert!(!state.browser_navigation().has_navigation_listener());
        assert_eq!(state.browser_navigation().pending_entries(), 0);
        assert!(state.is_startup());

        let retry = lifecycle.execute(&mut state, &ClientMessage::new()).unwrap();
        let creates = retry
            .operations
            .iter()
            .filter(|op| matches!(op, Operation::Create { .. }))
            .count();
        assert_eq!(creates, 1);
        assert_eq!(state.registry().len(), 1);
        assert_eq!(state.listener_bus().len(), 2);
        assert!(!state.is_startup());
    }
}
