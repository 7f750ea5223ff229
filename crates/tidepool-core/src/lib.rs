//! Tidepool core: keeps a server-held tree of UI objects in sync with a remote
//! client across independent request/response rounds.
//!
//! Responsibilities:
//! - assigning stable client-visible ids to server objects (`registry`)
//! - preserving, comparing and rendering attribute changes (`tracker`)
//! - encoding/decoding the JSON operation envelope (`protocol`)
//! - driving the four-phase round and its listener bus (`lifecycle`)
//! - owning per-session state behind a process-wide table (`session`)

pub mod lifecycle;
pub mod navigation;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod template;
pub mod tracker;
pub mod value;

pub use lifecycle::{
    EntryPoint, LifeCycle, LifeCycleError, ListenerError, ListenerId, PhaseId, PhaseListener,
    PhaseListenerBus, RoundContext, UiState,
};
pub use navigation::{BrowserNavigation, NavigationEvent};
pub use protocol::{ClientEvent, ClientMessage, MessageWriter, Operation, ProtocolError, ProtocolMessage};
pub use registry::{HandlerKey, ObjectId, RemoteObjectRegistry};
pub use session::{ConcurrencyPolicy, Session, SessionConfig, SessionError, SessionListener, SessionStore};
pub use template::{Cell, RowTemplate};
pub use tracker::{PendingCall, PropertyBag, Renderable};
pub use value::{AttributeError, Attributes, Color, ColorError, Font, Image, Value};
