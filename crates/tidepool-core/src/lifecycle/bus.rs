use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::{ListenerError, PhaseId, RoundContext};

/// Hook into the phases of a round.
pub trait PhaseListener: Send + Sync {
    /// Phase this listener subscribes to; [`PhaseId::Any`] receives all of them.
    fn phase_id(&self) -> PhaseId;

    fn before_phase(&self, _phase: PhaseId, _ctx: &mut RoundContext<'_>) -> Result<(), ListenerError> {
        Ok(())
    }

    fn after_phase(&self, _phase: PhaseId, _ctx: &mut RoundContext<'_>) -> Result<(), ListenerError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Session-scoped, ordered list of phase listeners.
#[derive(Default)]
pub struct PhaseListenerBus {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn PhaseListener>)>>,
    next_id: AtomicU64,
}

impl PhaseListenerBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn PhaseListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(candidate, _)| *candidate != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Id the next added listener will get.
    pub(crate) fn mark(&self) -> ListenerId {
        ListenerId(self.next_id.load(Ordering::Relaxed))
    }

    /// Removes every listener added at or after `mark`.
    pub(crate) fn remove_since(&self, mark: ListenerId) -> usize {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(id, _)| *id < mark);
        before - listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Listeners for `phase` in registration order, copied out so that
    /// listeners may add or remove others while the phase runs.
    pub fn snapshot(&self, phase: PhaseId) -> Vec<Arc<dyn PhaseListener>> {
        self.listeners
            .read()
            .iter()
            .filter(|(_, listener)| {
                let wanted = listener.phase_id();
                wanted == PhaseId::Any || wanted == phase
            })
            .map(|(_, listener)| listener.clone())
            .collect()
    }
}

impl fmt::Debug for PhaseListenerBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseListenerBus")
            .field("listeners", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(PhaseId);

    impl PhaseListener for Fixed {
        fn phase_id(&self) -> PhaseId {
            self.0
        }
    }

    #[test]
    fn snapshot_filters_by_phase_and_keeps_order() {
        let bus = PhaseListenerBus::new();
        bus.add_listener(Arc::new(Fixed(PhaseId::Render)));
        bus.add_listener(Arc::new(Fixed(PhaseId::Any)));
        bus.add_listener(Arc::new(Fixed(PhaseId::ReadData)));

        let render: Vec<PhaseId> = bus
            .snapshot(PhaseId::Render)
            .iter()
            .map(|listener| listener.phase_id())
            .collect();
        assert_eq!(render, vec![PhaseId::Render, PhaseId::Any]);
        assert_eq!(bus.snapshot(PhaseId::ProcessAction).len(), 1);
    }

    #[test]
    fn removal_does_not_affect_a_taken_snapshot() {
        let bus = PhaseListenerBus::new();
        let id = bus.add_listener(Arc::new(Fixed(PhaseId::Any)));
        let snapshot = bus.snapshot(PhaseId::Render);

        assert!(bus.remove_listener(id));
        assert!(!bus.remove_listener(id));
        assert_eq!(snapshot.len(), 1);
        assert!(bus.is_empty());
    }
}
