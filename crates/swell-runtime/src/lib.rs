//! Server side of the swell live UI protocol.
//!
//! A [`SessionManager`] owns every [`Session`]. Each session holds one mounted
//! component tree, its reactive state and up to one client connection, and
//! keeps all of it alive across reconnects for the configured resume window.

pub mod auth;
pub mod component;
pub mod config;
pub mod error;
pub mod handler;
pub mod handshake;
pub mod history;
pub mod manager;
pub mod prefetch;
pub mod reactive;
pub mod routing;
pub mod session;
pub mod store;
pub mod storm;
pub mod transport;
pub mod tree;

pub use auth::{AuthCheck, AuthError, ExpiryCheck, PresentedPrincipal, Principal, ResumeRehydrator};
pub use component::{Component, RenderCx};
pub use config::{ManagerConfig, SessionConfig};
pub use error::{DispatchError, HandlerError, HandshakeError, ManagerError, ResumeError, SessionError};
pub use handler::{EventKind, Handler, HookEvent, KeyEvent, MouseEvent};
pub use handshake::{perform_handshake, DEFAULT_HANDSHAKE_TIMEOUT};
pub use history::PatchHistory;
pub use manager::{ManagerStats, SessionManager, SessionManagerBuilder, SweepReport};
pub use prefetch::{PrefetchConfig, PrefetchPool};
pub use reactive::{Runtime, Scope, Signal};
pub use routing::{canonical_path, is_internal_path, RouteTable, Router, INTERNAL_PREFIX};
pub use session::{CloseReason, DetachReason, EventCx, ResyncPlan, Session, SessionInfo, SessionState};
pub use store::{MemorySessionStore, SessionSnapshot, SessionStore, StoreError};
pub use storm::{StormBudgetConfig, StormBudgetTracker, StormPolicy};
pub use transport::{memory_pair, Connection, ConnectionError, MemoryConnection, MemoryPeer};
pub use tree::{component, el, text, VNode};
