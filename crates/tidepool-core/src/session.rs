use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use metrics::counter;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::lifecycle::{LifeCycle, LifeCycleError, UiState};
use crate::protocol::{ClientMessage, ProtocolError, ProtocolMessage, HEAD_REQUEST_COUNTER};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyPolicy {
    /// A second request waits for the running round.
    #[default]
    Queue,
    /// A second request fails with [`SessionError::Busy`].
    Reject,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
    pub concurrency: ConcurrencyPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
            reap_interval: Duration::from_secs(60),
            concurrency: ConcurrencyPolicy::Queue,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("unknown session {0}")]
    UnknownSession(Uuid),
    #[error("session {0} is processing another request")]
    Busy(Uuid),
    #[error("invalid request counter: expected {expected}, got {actual}")]
    InvalidRequestCounter { expected: u64, actual: u64 },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    LifeCycle(#[from] LifeCycleError),
    #[error("failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("round worker failed: {0}")]
    Worker(String),
}

impl SessionError {
    /// Value of the `error` head field in the client-facing error envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::UnknownSession(_) => "session timeout",
            SessionError::Busy(_) => "session busy",
            SessionError::InvalidRequestCounter { .. } => "invalid request counter",
            SessionError::Protocol(_) => "protocol violation",
            SessionError::LifeCycle(_) | SessionError::Encode(_) | SessionError::Worker(_) => {
                "server error"
            }
        }
    }

    pub fn to_envelope(&self) -> ProtocolMessage {
        ProtocolMessage::error(self.kind(), self.to_string())
    }
}

/// Notified when a session is invalidated or expires.
pub trait SessionListener: Send + Sync {
    fn before_destroy(&self, session_id: Uuid);
}

pub struct Session {
    id: Uuid,
    created_at: u64,
    last_activity: AtomicU64,
    ui: Arc<Mutex<UiState>>,
    listeners: parking_lot::Mutex<Vec<Arc<dyn SessionListener>>>,
}

impl Session {
    fn new(id: Uuid) -> Self {
        let state = UiState::new(id);
        let navigation: Arc<dyn SessionListener> = state.browser_navigation().clone();
        let now = now_millis();
        Self {
            id,
            created_at: now,
            last_activity: AtomicU64::new(now),
            ui: Arc::new(Mutex::new(state)),
            listeners: parking_lot::Mutex::new(vec![navigation]),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    pub fn add_session_listener(&self, listener: Arc<dyn SessionListener>) {
        self.listeners.lock().push(listener);
    }

    /// Waits for the session lock and runs `f` outside of any round.
    pub async fn with_state<R>(&self, f: impl FnOnce(&mut UiState) -> R) -> R {
        let mut state = self.ui.lock().await;
        f(&mut state)
    }

    fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }

    fn is_idle(&self, now: u64, timeout: Duration) -> bool {
        now.saturating_sub(self.last_activity()) > timeout.as_millis() as u64
    }

    fn destroy(&self) {
        let listeners: Vec<Arc<dyn SessionListener>> = self.listeners.lock().drain(..).collect();
        for listener in listeners {
            listener.before_destroy(self.id);
        }
    }

    async fn run(
        &self,
        lifecycle: Arc<LifeCycle>,
        policy: ConcurrencyPolicy,
        request: ClientMessage,
    ) -> Result<ProtocolMessage, SessionError> {
        let mut guard = match policy {
            ConcurrencyPolicy::Queue => self.ui.clone().lock_owned().await,
            ConcurrencyPolicy::Reject => self
                .ui
                .clone()
                .try_lock_owned()
                .map_err(|_| SessionError::Busy(self.id))?,
        };
        self.touch();

        tokio::task::spawn_blocking(move || run_round(&lifecycle, &mut guard, &request))
            .await
            .map_err(|err| SessionError::Worker(err.to_string()))?
    }
}

fn run_round(
    lifecycle: &LifeCycle,
    state: &mut UiState,
    request: &ClientMessage,
) -> Result<ProtocolMessage, SessionError> {
    if let Some(counter) = request.request_counter() {
        if counter != state.request_counter {
            return match &state.last_response {
                Some(cached) if counter + 1 == state.request_counter => {
                    debug!(session_id = %state.session_id(), counter, "replaying cached response");
                    Ok(cached.clone())
                }
                _ => Err(SessionError::InvalidRequestCounter {
                    expected: state.request_counter,
                    actual: counter,
                }),
            };
        }
    }

    let mut response = lifecycle.execute(state, request)?;
    state.request_counter += 1;
    response
        .head
        .insert(HEAD_REQUEST_COUNTER.to_string(), state.request_counter.into());
    state.last_response = Some(response.clone());
    Ok(response)
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub created_at: u64,
    pub idle_ms: u64,
}

/// Process-wide table of live sessions.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<SessionStoreInner>,
}

struct SessionStoreInner {
    sessions: DashMap<Uuid, Arc<Session>>,
    lifecycle: Arc<LifeCycle>,
    config: SessionConfig,
}

impl SessionStore {
    pub fn new(lifecycle: LifeCycle, config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(SessionStoreInner {
                sessions: DashMap::new(),
                lifecycle: Arc::new(lifecycle),
                config,
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn create(&self) -> Arc<Session> {
        let id = Uuid::new_v4();
        let session = Arc::new(Session::new(id));
        self.inner.sessions.insert(id, Arc::clone(&session));
        counter!("tidepool_sessions_created_total", 1);
        info!(session_id = %id, "session created");
        session
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Session>> {
        self.inner
            .sessions
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    /// Decodes `body`, runs one round and encodes the response.
    pub async fn process(&self, id: Uuid, body: &[u8]) -> Result<Vec<u8>, SessionError> {
        let request = ClientMessage::decode(body)?;
        let response = self.process_message(id, request).await?;
        Ok(response.to_bytes()?)
    }

    pub async fn process_message(
        &self,
        id: Uuid,
        request: ClientMessage,
    ) -> Result<ProtocolMessage, SessionError> {
        let session = self.get(id).ok_or(SessionError::UnknownSession(id))?;
        session
            .run(
                Arc::clone(&self.inner.lifecycle),
                self.inner.config.concurrency,
                request,
            )
            .await
    }

    /// Removes the session and notifies its listeners. A round still running
    /// on it finishes, but its session can no longer be reached.
    pub fn invalidate(&self, id: Uuid) -> bool {
        let Some((_, session)) = self.inner.sessions.remove(&id) else {
            return false;
        };
        session.destroy();
        info!(session_id = %id, "session invalidated");
        true
    }

    pub fn expire_idle(&self, now: u64) -> usize {
        let timeout = self.inner.config.idle_timeout;
        let session_ids: Vec<Uuid> = self
            .inner
            .sessions
            .iter()
            .map(|entry| *entry.key())
            .collect();

        let mut expired = 0usize;
        for session_id in session_ids {
            let Some((_, session)) = self
                .inner
                .sessions
                .remove_if(&session_id, |_, session| session.is_idle(now, timeout))
            else {
                continue;
            };
            session.destroy();
            counter!("tidepool_sessions_expired_total", 1);
            info!(session_id = %session_id, "session expired");
            expired += 1;
        }
        expired
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let now = now_millis();
        self.inner
            .sessions
            .iter()
            .map(|entry| {
                let session = entry.value();
                SessionSnapshot {
                    session_id: session.id(),
                    created_at: session.created_at(),
                    idle_ms: now.saturating_sub(session.last_activity()),
                }
            })
            .collect()
    }

    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let store = self.clone();
        let mut interval = tokio::time::interval(self.inner.config.reap_interval);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                let expired = store.expire_idle(now_millis());
                if expired > 0 {
                    debug!(expired, "reaped idle sessions");
                }
            }
        })
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::RoundContext;
    use crate::tracker::PropertyBag;
    use parking_lot::Mutex as SyncMutex;

    fn store() -> SessionStore {
        let lifecycle = LifeCycle::new(|ctx: &mut RoundContext<'_>| -> anyhow::Result<()> {
            ctx.registry_mut().register(PropertyBag::new("tp.Label").with("text", "hi"));
            Ok(())
        });
        SessionStore::new(lifecycle, SessionConfig::default())
    }

    struct Flag(Arc<SyncMutex<Vec<Uuid>>>);

    impl SessionListener for Flag {
        fn before_destroy(&self, session_id: Uuid) {
            self.0.lock().push(session_id);
        }
    }

    #[tokio::test]
    async fn response_head_carries_the_new_counter() {
        let store = store();
        let session = store.create();

        let first = store
            .process_message(session.id(), ClientMessage::new().with_head("requestCounter", 0))
            .await
            .unwrap();
        assert_eq!(first.request_counter(), Some(1));
        assert_eq!(first.operations.len(), 1);

        let second = store
            .process_message(session.id(), ClientMessage::new())
            .await
            .unwrap();
        assert_eq!(second.request_counter(), Some(2));
    }

    #[tokio::test]
    async fn retransmitted_request_replays_the_cached_response() {
        let store = store();
        let session = store.create();
        let request = ClientMessage::new().with_head("requestCounter", 0);

        let original = store.process_message(session.id(), request.clone()).await.unwrap();
        let replay = store.process_message(session.id(), request).await.unwrap();
        assert_eq!(original, replay);

        let stale = store
            .process_message(session.id(), ClientMessage::new().with_head("requestCounter", 7))
            .await;
        assert!(matches!(
            stale,
            Err(SessionError::InvalidRequestCounter { expected: 1, actual: 7 })
        ));
        session
            .with_state(|state| assert_eq!(state.request_counter(), 1))
            .await;
    }

    #[tokio::test]
    async fn unknown_session_maps_to_timeout_envelope() {
        let store = store();
        let err = store
            .process(Uuid::new_v4(), br#"{"head":{},"operations":[]}"#)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "session timeout");
        assert!(err.to_envelope().operations.is_empty());
    }

    #[tokio::test]
    async fn malformed_body_is_a_protocol_violation() {
        let store = store();
        let session = store.create();
        let err = store.process(session.id(), b"nope").await.unwrap_err();
        assert_eq!(err.kind(), "protocol violation");
    }

    #[tokio::test]
    async fn invalidate_notifies_listeners_once() {
        let store = store();
        let session = store.create();
        let destroyed = Arc::new(SyncMutex::new(Vec::new()));
        session.add_session_listener(Arc::new(Flag(destroyed.clone())));

        assert!(store.invalidate(session.id()));
        assert!(!store.invalidate(session.id()));
        assert_eq!(*destroyed.lock(), vec![session.id()]);
        assert!(store.get(session.id()).is_none());
        session
            .with_state(|state| assert!(state.listener_bus().is_empty()))
            .await;
    }

    #[tokio::test]
    async fn idle_sessions_expire() {
        let store = store();
        let idle = store.create();
        let timeout = store.config().idle_timeout.as_millis() as u64;

        assert_eq!(store.expire_idle(idle.last_activity()), 0);
        assert_eq!(store.expire_idle(idle.last_activity() + timeout + 1), 1);
        assert!(store.is_empty());
    }
}
