//! One live UI session: connection state machine, sequence counters, the
//! component engine and the bounded queues feeding its event loop.

mod background;
mod context;
mod engine;
mod flush;
mod loops;
mod resync;
mod work;

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use swell_core::{ControlMessage, EventEnvelope, Patch};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::auth::{AuthCheck, Principal};
use crate::config::SessionConfig;
use crate::error::{DispatchError, SessionError};
use crate::history::PatchHistory;
use crate::prefetch::{PrefetchCache, PrefetchLimiter, PrefetchPool};
use crate::reactive::Runtime;
use crate::routing::Router;
use crate::storm::StormBudgetTracker;
use crate::store::SessionSnapshot;
use crate::transport::Connection;

pub use context::EventCx;
pub use resync::ResyncPlan;

pub(crate) use engine::prerender;
use engine::Engine;
use work::WorkGuard;

/// Callback queued onto the event loop.
pub type DispatchFn = Box<dyn FnOnce(&EventCx) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Detached,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachReason {
    ReadError,
    ReadTimeout,
    WriteError,
    PeerClosed,
}

impl DetachReason {
    pub fn label(self) -> &'static str {
        match self {
            DetachReason::ReadError => "read_error",
            DetachReason::ReadTimeout => "read_timeout",
            DetachReason::WriteError => "write_error",
            DetachReason::PeerClosed => "peer_closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Idle,
    Expired,
    Evicted,
    Shutdown,
    AuthFailed,
    Rejected,
    /// The client sent a close control.
    ClientClosed,
}

impl CloseReason {
    pub fn label(self) -> &'static str {
        match self {
            CloseReason::Idle => "idle",
            CloseReason::Expired => "expired",
            CloseReason::Evicted => "evicted",
            CloseReason::Shutdown => "shutdown",
            CloseReason::AuthFailed => "auth_failed",
            CloseReason::Rejected => "rejected",
            CloseReason::ClientClosed => "client_closed",
        }
    }
}

pub(crate) type DetachHook = Arc<dyn Fn(&Arc<Session>, DetachReason) + Send + Sync>;
pub(crate) type CloseHook = Arc<dyn Fn(&Session, CloseReason) + Send + Sync>;

#[derive(Clone, Default)]
pub(crate) struct SessionHooks {
    pub on_detach: Option<DetachHook>,
    pub on_close: Option<CloseHook>,
}

/// Collaborators a session needs from its manager.
#[derive(Clone)]
pub struct SessionDeps {
    pub config: Arc<SessionConfig>,
    pub router: Arc<dyn Router>,
    pub auth_check: Option<Arc<dyn AuthCheck>>,
    pub prefetch_pool: PrefetchPool,
}

/// Connection slot guarded by the session's write mutex. Sequence numbers
/// are assigned while holding it so history order matches wire order.
pub(crate) struct Stream {
    conn: Option<Arc<dyn Connection>>,
}

struct Queues {
    events: mpsc::Sender<EventEnvelope>,
    dispatch: mpsc::Sender<DispatchFn>,
    wake: mpsc::Sender<()>,
}

pub(crate) struct QueueReceivers {
    events: mpsc::Receiver<EventEnvelope>,
    dispatch: mpsc::Receiver<DispatchFn>,
    wake: mpsc::Receiver<()>,
}

fn queues(config: &SessionConfig) -> (Queues, QueueReceivers) {
    let (events_tx, events_rx) = mpsc::channel(config.event_queue_capacity.max(1));
    let (dispatch_tx, dispatch_rx) = mpsc::channel(config.dispatch_queue_capacity.max(1));
    let (wake_tx, wake_rx) = mpsc::channel(1);
    (
        Queues {
            events: events_tx,
            dispatch: dispatch_tx,
            wake: wake_tx,
        },
        QueueReceivers {
            events: events_rx,
            dispatch: dispatch_rx,
            wake: wake_rx,
        },
    )
}

/// Work produced by handlers that is not a component render.
#[derive(Default)]
struct Outbox {
    navigation: Option<String>,
    patches: Vec<Patch>,
    controls: Vec<ControlMessage>,
}

#[derive(Default)]
struct AuthState {
    principal: Option<Principal>,
    had_auth: bool,
}

#[derive(Default)]
struct SessionCounters {
    events_handled: AtomicU64,
    events_dropped: AtomicU64,
    frames_sent: AtomicU64,
}

/// Point-in-time view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub state: SessionState,
    pub path: String,
    pub send_seq: u64,
    pub recv_seq: u64,
    pub ack_seq: u64,
    pub history_frames: usize,
    pub instances: usize,
    pub handlers: usize,
    pub events_handled: u64,
    pub events_dropped: u64,
    pub frames_sent: u64,
    pub estimated_bytes: usize,
}

pub struct Session {
    id: String,
    weak_self: Weak<Session>,
    created_at: SystemTime,
    deps: SessionDeps,
    hooks: RwLock<SessionHooks>,

    stream: tokio::sync::Mutex<Stream>,
    generation: watch::Sender<u64>,
    send_seq: AtomicU64,
    recv_seq: AtomicU64,
    ack_seq: AtomicU64,
    history: Mutex<PatchHistory>,

    closed: AtomicBool,
    detached: AtomicBool,
    finalized: AtomicBool,
    detached_at: Mutex<Option<Instant>>,
    last_active: Mutex<Instant>,
    in_flight: AtomicUsize,
    done: watch::Sender<bool>,

    queues: Mutex<Queues>,
    receivers: Mutex<Option<QueueReceivers>>,
    read_running: AtomicBool,
    write_running: AtomicBool,
    event_running: AtomicBool,

    engine: Mutex<Engine>,
    outbox: Mutex<Outbox>,
    storm: StormBudgetTracker,
    prefetch_limiter: PrefetchLimiter,
    prefetch_cache: PrefetchCache<Engine>,

    data: RwLock<HashMap<String, serde_json::Value>>,
    data_writes: AtomicU64,
    auth: RwLock<AuthState>,
    counters: SessionCounters,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("send_seq", &self.send_seq())
            .finish()
    }
}

impl Session {
    /// Builds a detached session with nothing mounted. The connection arrives
    /// through the handshake.
    pub fn new(id: impl Into<String>, deps: SessionDeps) -> Arc<Self> {
        let id = id.into();
        let config = Arc::clone(&deps.config);
        let (queue_tx, queue_rx) = queues(&config);
        let now = Instant::now();
        Arc::new_cyclic(|weak: &Weak<Session>| {
            let runtime = Runtime::new();
            runtime.set_waker(waker(weak.clone()));
            Session {
                id,
                weak_self: weak.clone(),
                created_at: SystemTime::now(),
                hooks: RwLock::new(SessionHooks::default()),
                stream: tokio::sync::Mutex::new(Stream { conn: None }),
                generation: watch::channel(0).0,
                send_seq: AtomicU64::new(0),
                recv_seq: AtomicU64::new(0),
                ack_seq: AtomicU64::new(0),
                history: Mutex::new(PatchHistory::new(
                    config.history_capacity,
                    config.history_max_bytes,
                )),
                closed: AtomicBool::new(false),
                detached: AtomicBool::new(true),
                finalized: AtomicBool::new(false),
                detached_at: Mutex::new(Some(now)),
                last_active: Mutex::new(now),
                in_flight: AtomicUsize::new(0),
                done: watch::channel(false).0,
                queues: Mutex::new(queue_tx),
                receivers: Mutex::new(Some(queue_rx)),
                read_running: AtomicBool::new(false),
                write_running: AtomicBool::new(false),
                event_running: AtomicBool::new(false),
                engine: Mutex::new(Engine::new(runtime)),
                outbox: Mutex::new(Outbox::default()),
                storm: StormBudgetTracker::new(config.storm.clone()),
                prefetch_limiter: PrefetchLimiter::new(&config.prefetch, deps.prefetch_pool.clone()),
                prefetch_cache: PrefetchCache::new(
                    config.prefetch.cache_ttl,
                    config.prefetch.cache_capacity,
                ),
                data: RwLock::new(HashMap::new()),
                data_writes: AtomicU64::new(0),
                auth: RwLock::new(AuthState::default()),
                counters: SessionCounters::default(),
                deps,
            }
        })
    }

    pub(crate) fn set_hooks(&self, hooks: SessionHooks) {
        *self.hooks.write() = hooks;
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn config(&self) -> &SessionConfig {
        &self.deps.config
    }

    pub fn state(&self) -> SessionState {
        if self.closed.load(Ordering::SeqCst) {
            SessionState::Closed
        } else if self.detached.load(Ordering::SeqCst) {
            SessionState::Detached
        } else {
            SessionState::Active
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    pub fn send_seq(&self) -> u64 {
        self.send_seq.load(Ordering::SeqCst)
    }

    pub fn recv_seq(&self) -> u64 {
        self.recv_seq.load(Ordering::SeqCst)
    }

    pub fn ack_seq(&self) -> u64 {
        self.ack_seq.load(Ordering::SeqCst)
    }

    pub fn last_active(&self) -> Instant {
        *self.last_active.lock()
    }

    pub fn detached_at(&self) -> Option<Instant> {
        *self.detached_at.lock()
    }

    pub fn path(&self) -> String {
        self.engine.lock().path().to_string()
    }

    pub fn storm(&self) -> &StormBudgetTracker {
        &self.storm
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }

    pub(crate) fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    #[cfg(test)]
    pub(crate) fn set_last_active(&self, at: Instant) {
        *self.last_active.lock() = at;
    }

    #[cfg(test)]
    pub(crate) fn set_detached_at(&self, at: Instant) {
        *self.detached_at.lock() = Some(at);
    }

    pub fn principal(&self) -> Option<Principal> {
        self.auth.read().principal.clone()
    }

    pub fn user_id(&self) -> Option<String> {
        self.auth.read().principal.as_ref().map(|p| p.user_id.clone())
    }

    /// True once any principal has been attached, even after it is dropped.
    pub fn had_auth(&self) -> bool {
        self.auth.read().had_auth
    }

    pub fn set_principal(&self, principal: Option<Principal>) {
        let mut auth = self.auth.write();
        if principal.is_some() {
            auth.had_auth = true;
        }
        auth.principal = principal;
    }

    pub(crate) fn mark_had_auth(&self) {
        self.auth.write().had_auth = true;
    }

    pub fn data<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.data.read().get(key).cloned()?;
        serde_json::from_value(value).ok()
    }

    pub fn set_data<T: Serialize>(&self, key: impl Into<String>, value: T) -> Result<(), SessionError> {
        let value = serde_json::to_value(value)?;
        self.data.write().insert(key.into(), value);
        self.data_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn remove_data(&self, key: &str) -> Option<serde_json::Value> {
        let removed = self.data.write().remove(key);
        if removed.is_some() {
            self.data_writes.fetch_add(1, Ordering::SeqCst);
        }
        removed
    }

    /// Data writes since the last persisted snapshot.
    pub fn unsaved_writes(&self) -> u64 {
        self.data_writes.load(Ordering::SeqCst)
    }

    pub(crate) fn restore(&self, snapshot: &SessionSnapshot) {
        *self.data.write() = snapshot.data.clone();
        self.recv_seq.store(snapshot.recv_seq, Ordering::SeqCst);
        if snapshot.had_auth {
            self.mark_had_auth();
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let detached_at_ms = self
            .detached_at()
            .and_then(|at| SystemTime::now().checked_sub(at.elapsed()))
            .map(unix_millis);
        SessionSnapshot {
            id: self.id.clone(),
            user_id: self.user_id(),
            created_at_ms: unix_millis(self.created_at),
            detached_at_ms,
            had_auth: self.had_auth(),
            path: self.path(),
            recv_seq: self.recv_seq(),
            data: self.data.read().clone(),
        }
    }

    pub(crate) fn mark_saved(&self, writes: u64) {
        let _ = self
            .data_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_sub(writes))
            });
    }

    pub fn render_html(&self) -> String {
        self.engine.lock().render_html()
    }

    pub fn estimated_memory(&self) -> usize {
        const BASE: usize = 4 * 1024;
        let data: usize = self
            .data
            .read()
            .iter()
            .map(|(key, value)| key.len() + value.to_string().len())
            .sum();
        BASE + self.history.lock().total_bytes() + self.engine.lock().estimated_bytes() + data
    }

    pub fn info(&self) -> SessionInfo {
        let (path, instances, handlers) = {
            let engine = self.engine.lock();
            (
                engine.path().to_string(),
                engine.instance_count(),
                engine.handler_count(),
            )
        };
        SessionInfo {
            id: self.id.clone(),
            state: self.state(),
            path,
            send_seq: self.send_seq(),
            recv_seq: self.recv_seq(),
            ack_seq: self.ack_seq(),
            history_frames: self.history_len(),
            instances,
            handlers,
            events_handled: self.counters.events_handled.load(Ordering::Relaxed),
            events_dropped: self.counters.events_dropped.load(Ordering::Relaxed),
            frames_sent: self.counters.frames_sent.load(Ordering::Relaxed),
            estimated_bytes: self.estimated_memory(),
        }
    }

    /// Queues `f` to run on the event loop with full handler privileges.
    pub fn dispatch(&self, f: impl FnOnce(&EventCx) + Send + 'static) -> Result<(), DispatchError> {
        if self.is_closed() {
            return Err(DispatchError::Closed);
        }
        let sender = self.queues.lock().dispatch.clone();
        match sender.try_send(Box::new(f)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                counter!("swell_dispatch_dropped_total", 1);
                Err(DispatchError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DispatchError::Closed),
        }
    }

    /// Hands an inbound event to the event loop without waiting for room.
    pub(crate) fn enqueue_event(&self, event: EventEnvelope) -> Result<(), DispatchError> {
        let sender = self.queues.lock().events.clone();
        match sender.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.events_dropped.fetch_add(1, Ordering::Relaxed);
                counter!("swell_events_dropped_total", 1);
                Err(DispatchError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DispatchError::Closed),
        }
    }

    /// Waker for a runtime whose work should land in this session's flushes.
    pub(crate) fn render_waker(&self) -> impl Fn() + Send + Sync + 'static {
        waker(self.weak_self.clone())
    }

    pub(crate) fn request_render(&self) {
        let sender = self.queues.lock().wake.clone();
        let _ = sender.try_send(());
    }

    /// Asks the next flush to mount the component routed at `path`.
    pub fn navigate(&self, path: impl Into<String>) {
        self.outbox.lock().navigation = Some(path.into());
        self.request_render();
    }

    pub(crate) fn queue_patch(&self, patch: Patch) {
        self.outbox.lock().patches.push(patch);
        self.request_render();
    }

    pub(crate) fn queue_control(&self, message: ControlMessage) {
        self.outbox.lock().controls.push(message);
        self.request_render();
    }

    pub(crate) fn begin_work(&self) -> Option<WorkGuard<'_>> {
        WorkGuard::enter(self)
    }

    /// Spawns the read, write and event loops that are not already running.
    pub fn start(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        if self
            .event_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let receivers = self.receivers.lock().take().unwrap_or_else(|| {
                // A previous event loop consumed the receivers; hand out fresh queues.
                let (queue_tx, queue_rx) = queues(&self.deps.config);
                *self.queues.lock() = queue_tx;
                queue_rx
            });
            tokio::spawn(Arc::clone(self).event_loop(receivers));
        }
        if self
            .read_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tokio::spawn(Arc::clone(self).read_loop());
        }
        if self
            .write_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tokio::spawn(Arc::clone(self).write_loop());
        }
    }

    pub(crate) async fn current_connection(&self) -> Option<(Arc<dyn Connection>, u64)> {
        let stream = self.stream.lock().await;
        let conn = stream.conn.clone()?;
        Some((conn, *self.generation.borrow()))
    }

    /// Writes one frame on the locked stream. A missing connection is not an
    /// error: the frame already lives in history for a later resume.
    pub(crate) async fn write_locked(&self, stream: &Stream, frame: Bytes) -> Result<(), SessionError> {
        let Some(conn) = stream.conn.as_ref() else {
            return Ok(());
        };
        let deadline = self.deps.config.write_deadline;
        match timeout(deadline, conn.send(frame)).await {
            Ok(Ok(())) => {
                self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Ok(Err(err)) => Err(SessionError::Connection(err)),
            Err(_) => Err(SessionError::WriteTimeout(deadline)),
        }
    }

    /// Sends a single control-plane frame outside the patch stream.
    pub(crate) async fn send_frame(&self, frame: Bytes) -> Result<(), SessionError> {
        let (result, generation) = {
            let stream = self.stream.lock().await;
            if stream.conn.is_none() {
                return Err(SessionError::Detached);
            }
            let generation = *self.generation.borrow();
            (self.write_locked(&stream, frame).await, generation)
        };
        if let Err(err) = &result {
            warn!(session_id = %self.id, error = %err, "write failed; detaching");
            self.detach_generation(Some(generation), DetachReason::WriteError)
                .await;
        }
        result
    }

    /// Moves an active session to detached. Idempotent.
    pub async fn detach(&self, reason: DetachReason) -> bool {
        self.detach_generation(None, reason).await
    }

    /// Detaches only if `generation` still names the attached connection, so a
    /// stale reader cannot tear down a connection swapped in by a resume.
    pub(crate) async fn detach_generation(&self, generation: Option<u64>, reason: DetachReason) -> bool {
        if self.is_closed() {
            return false;
        }
        let conn = {
            let mut stream = self.stream.lock().await;
            if let Some(expected) = generation {
                if expected != *self.generation.borrow() {
                    return false;
                }
            }
            if self.detached.swap(true, Ordering::SeqCst) {
                return false;
            }
            *self.detached_at.lock() = Some(Instant::now());
            stream.conn.take()
        };
        if let Some(conn) = conn {
            conn.close().await;
        }
        info!(session_id = %self.id, reason = reason.label(), "session detached");
        counter!("swell_session_detached_total", 1, "reason" => reason.label());
        let hook = self.hooks.read().on_detach.clone();
        if let (Some(hook), Some(session)) = (hook, self.self_arc()) {
            hook(&session, reason);
        }
        true
    }

    /// Begins closing: signals every loop, closes the socket and finalizes
    /// once no work is in flight. Idempotent.
    pub async fn close(&self, reason: CloseReason) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.done.send_replace(true);
        let conn = self.stream.lock().await.conn.take();
        if let Some(conn) = conn {
            let farewell = ControlMessage::Close {
                reason: Some(reason.label().to_string()),
            };
            if let Ok(frame) = farewell.to_frame() {
                let _ = timeout(self.deps.config.write_deadline, conn.send(frame.encode())).await;
            }
            conn.close().await;
        }
        info!(session_id = %self.id, reason = reason.label(), "session closed");
        counter!("swell_session_closed_total", 1, "reason" => reason.label());
        let hook = self.hooks.read().on_close.clone();
        if let Some(hook) = hook {
            hook(self, reason);
        }
        if self.in_flight.load(Ordering::SeqCst) == 0 {
            self.finalize_close();
        }
    }

    /// Tears down reactive state. Runs at most once.
    fn finalize_close(&self) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        self.engine.lock().dispose();
        self.history.lock().clear();
        self.prefetch_cache.clear();
        *self.outbox.lock() = Outbox::default();
        debug!(session_id = %self.id, "session finalized");
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    /// Resolves once the session is closed.
    pub async fn closed(&self) {
        let mut done = self.done.subscribe();
        let _ = done.wait_for(|closed| *closed).await;
    }

    pub(crate) fn self_arc(&self) -> Option<Arc<Session>> {
        self.weak_self.upgrade()
    }
}

fn waker(session: Weak<Session>) -> impl Fn() + Send + Sync + 'static {
    move || {
        if let Some(session) = session.upgrade() {
            session.request_render();
        }
    }
}

/// Human readable panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

pub(crate) fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}
