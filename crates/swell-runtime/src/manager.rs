//! Process-wide session registry: admission, expiry sweeps, LRU eviction,
//! persistence on detach and graceful shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};

use futures_util::future::join_all;
use metrics::{counter, gauge};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{AuthCheck, Principal, ResumeRehydrator};
use crate::config::{ManagerConfig, SessionConfig};
use crate::error::{ManagerError, ResumeError, SessionError};
use crate::prefetch::PrefetchPool;
use crate::routing::Router;
use crate::session::{
    unix_millis, CloseReason, DetachReason, Session, SessionDeps, SessionHooks, SessionState,
};
use crate::store::{SessionSnapshot, SessionStore};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub sessions: usize,
    pub active: usize,
    pub detached: usize,
    pub total_created: u64,
    pub resumed: u64,
    pub evicted: u64,
    pub expired: u64,
    pub estimated_bytes: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub idle_closed: usize,
    pub expired: usize,
    pub evicted: usize,
}

/// A session a resume handshake may attach to.
pub struct Resumable {
    pub session: Arc<Session>,
    /// `false` when the session was rebuilt from a persisted snapshot and the
    /// client must receive the full document.
    pub live: bool,
}

struct ManagerInner {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    config: ManagerConfig,
    deps: SessionDeps,
    store: Option<Arc<dyn SessionStore>>,
    rehydrator: Option<Arc<dyn ResumeRehydrator>>,
    total_created: AtomicU64,
    resumed: AtomicU64,
    evicted: AtomicU64,
    expired: AtomicU64,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

pub struct SessionManagerBuilder {
    router: Arc<dyn Router>,
    config: ManagerConfig,
    session_config: SessionConfig,
    store: Option<Arc<dyn SessionStore>>,
    auth_check: Option<Arc<dyn AuthCheck>>,
    rehydrator: Option<Arc<dyn ResumeRehydrator>>,
    prefetch_pool: PrefetchPool,
}

impl SessionManagerBuilder {
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn auth_check(mut self, check: Arc<dyn AuthCheck>) -> Self {
        self.auth_check = Some(check);
        self
    }

    pub fn rehydrator(mut self, rehydrator: Arc<dyn ResumeRehydrator>) -> Self {
        self.rehydrator = Some(rehydrator);
        self
    }

    pub fn prefetch_pool(mut self, pool: PrefetchPool) -> Self {
        self.prefetch_pool = pool;
        self
    }

    pub fn build(self) -> SessionManager {
        SessionManager {
            inner: Arc::new(ManagerInner {
                sessions: RwLock::new(HashMap::new()),
                config: self.config,
                deps: SessionDeps {
                    config: Arc::new(self.session_config),
                    router: self.router,
                    auth_check: self.auth_check,
                    prefetch_pool: self.prefetch_pool,
                },
                store: self.store,
                rehydrator: self.rehydrator,
                total_created: AtomicU64::new(0),
                resumed: AtomicU64::new(0),
                evicted: AtomicU64::new(0),
                expired: AtomicU64::new(0),
            }),
        }
    }
}

impl SessionManager {
    pub fn builder(router: Arc<dyn Router>) -> SessionManagerBuilder {
        SessionManagerBuilder {
            router,
            config: ManagerConfig::default(),
            session_config: SessionConfig::default(),
            store: None,
            auth_check: None,
            rehydrator: None,
            prefetch_pool: PrefetchPool::default(),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn session_config(&self) -> &SessionConfig {
        &self.inner.deps.config
    }

    pub fn auth_check(&self) -> Option<&Arc<dyn AuthCheck>> {
        self.inner.deps.auth_check.as_ref()
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.sessions.read().get(id).cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner.sessions.read().values().cloned().collect()
    }

    /// Allocates and mounts a session for `path`. Fails fast at the limit.
    pub fn create(&self, path: &str, principal: Option<Principal>) -> Result<Arc<Session>, ManagerError> {
        self.admit()?;
        let session = Session::new(Uuid::new_v4().to_string(), self.inner.deps.clone());
        session.set_principal(principal);
        session.mount(path).map_err(|err| match err {
            SessionError::RouteNotFound(path) => ManagerError::RouteNotFound(path),
            other => ManagerError::Session(other),
        })?;
        self.register(&session)?;
        self.inner.total_created.fetch_add(1, Ordering::Relaxed);
        counter!("swell_sessions_created_total", 1);
        debug!(session_id = %session.id(), path, "session created");
        session.start();
        Ok(session)
    }

    /// Server-side render of `path` for the initial HTTP response. The
    /// session waits detached for the browser's socket to resume it.
    pub fn render_page(&self, path: &str, principal: Option<Principal>) -> Result<(Arc<Session>, String), ManagerError> {
        let session = self.create(path, principal)?;
        let html = session.render_html();
        Ok((session, html))
    }

    fn admit(&self) -> Result<(), ManagerError> {
        let max = self.inner.config.max_sessions;
        if self.len() >= max {
            counter!("swell_sessions_rejected_total", 1, "reason" => "capacity");
            warn!(max, "session limit reached");
            return Err(ManagerError::TooManySessions(max));
        }
        Ok(())
    }

    fn register(&self, session: &Arc<Session>) -> Result<(), ManagerError> {
        session.set_hooks(self.hooks());
        {
            let mut sessions = self.inner.sessions.write();
            if sessions.len() >= self.inner.config.max_sessions {
                drop(sessions);
                counter!("swell_sessions_rejected_total", 1, "reason" => "capacity");
                return Err(ManagerError::TooManySessions(self.inner.config.max_sessions));
            }
            sessions.insert(session.id().to_string(), Arc::clone(session));
        }
        self.update_gauges();
        Ok(())
    }

    fn hooks(&self) -> SessionHooks {
        let on_detach = {
            let manager = Arc::downgrade(&self.inner);
            Arc::new(move |session: &Arc<Session>, reason: DetachReason| {
                if let Some(inner) = manager.upgrade() {
                    SessionManager { inner }.on_detach(session, reason);
                }
            })
        };
        let on_close = {
            let manager: Weak<ManagerInner> = Arc::downgrade(&self.inner);
            Arc::new(move |session: &Session, reason: CloseReason| {
                if let Some(inner) = manager.upgrade() {
                    SessionManager { inner }.on_close(session, reason);
                }
            })
        };
        SessionHooks {
            on_detach: Some(on_detach),
            on_close: Some(on_close),
        }
    }

    fn on_detach(&self, session: &Arc<Session>, reason: DetachReason) {
        self.update_gauges();
        let Some(store) = self.inner.store.clone() else {
            return;
        };
        if session.unsaved_writes() < self.inner.config.persist_threshold {
            return;
        }
        debug!(session_id = %session.id(), reason = reason.label(), "persisting detached session");
        let session = Arc::clone(session);
        tokio::spawn(async move {
            if let Err(err) = persist(store.as_ref(), &session).await {
                warn!(session_id = %session.id(), error = %err, "failed to persist detached session");
            }
        });
    }

    fn on_close(&self, session: &Session, reason: CloseReason) {
        let removed = {
            let mut sessions = self.inner.sessions.write();
            let ours = sessions
                .get(session.id())
                .is_some_and(|existing| std::ptr::eq(Arc::as_ptr(existing), session));
            ours && sessions.remove(session.id()).is_some()
        };
        if removed {
            self.update_gauges();
        }
        let Some(store) = self.inner.store.clone() else {
            return;
        };
        match reason {
            CloseReason::Shutdown => {}
            // An explicit disconnect keeps a snapshot so a later visit can
            // restore session data into a fresh instance.
            CloseReason::ClientClosed => {
                let mut snapshot = session.snapshot();
                snapshot
                    .detached_at_ms
                    .get_or_insert_with(|| unix_millis(SystemTime::now()));
                let id = session.id().to_string();
                tokio::spawn(async move {
                    let saved = match snapshot.to_bytes() {
                        Ok(bytes) => store.save(&id, bytes).await,
                        Err(err) => Err(err),
                    };
                    match saved {
                        Ok(()) => {
                            counter!("swell_sessions_persisted_total", 1);
                        }
                        Err(err) => {
                            warn!(session_id = %id, error = %err, "failed to persist closed session");
                        }
                    }
                });
            }
            _ => {
                let id = session.id().to_string();
                tokio::spawn(async move {
                    if let Err(err) = store.remove(&id).await {
                        debug!(session_id = %id, error = %err, "failed to drop persisted snapshot");
                    }
                });
            }
        }
    }

    fn update_gauges(&self) {
        let (active, detached) = self.count_states();
        gauge!("swell_sessions_active", active as f64);
        gauge!("swell_sessions_detached", detached as f64);
    }

    fn count_states(&self) -> (usize, usize) {
        let sessions = self.inner.sessions.read();
        sessions
            .values()
            .fold((0, 0), |(active, detached), session| match session.state() {
                SessionState::Active => (active + 1, detached),
                SessionState::Detached => (active, detached + 1),
                SessionState::Closed => (active, detached),
            })
    }

    /// Finds a session a client may resume: memory first, then the store.
    /// Sessions that had authenticated must get their principal back from
    /// the rehydrator or they are closed and the attempt fails.
    pub async fn resumable(&self, id: &str, presented: Option<&Principal>) -> Result<Resumable, ResumeError> {
        if let Some(session) = self.get(id) {
            if session.is_closed() {
                return Err(ResumeError::NotFound);
            }
            if let Some(detached_at) = session.detached_at() {
                if detached_at.elapsed() > self.inner.config.resume_window {
                    self.inner.expired.fetch_add(1, Ordering::Relaxed);
                    session.close(CloseReason::Expired).await;
                    return Err(ResumeError::Expired);
                }
            }
            if let Err(err) = self.restore_principal(&session, presented) {
                session.close(CloseReason::AuthFailed).await;
                return Err(err);
            }
            self.inner.resumed.fetch_add(1, Ordering::Relaxed);
            return Ok(Resumable { session, live: true });
        }

        let Some(store) = self.inner.store.clone() else {
            return Err(ResumeError::NotFound);
        };
        let Some(bytes) = store.load(id).await? else {
            return Err(ResumeError::NotFound);
        };
        let snapshot = SessionSnapshot::from_bytes(&bytes)?;
        let now_ms = unix_millis(SystemTime::now());
        let window_ms = self.inner.config.resume_window.as_millis() as u64;
        if snapshot
            .detached_at_ms
            .is_some_and(|at| now_ms.saturating_sub(at) > window_ms)
        {
            store.remove(id).await?;
            self.inner.expired.fetch_add(1, Ordering::Relaxed);
            return Err(ResumeError::Expired);
        }

        self.admit()?;
        let session = Session::new(snapshot.id.clone(), self.inner.deps.clone());
        session.restore(&snapshot);
        self.restore_principal(&session, presented)?;
        session.mount(&snapshot.path).or_else(|err| match err {
            SessionError::RouteNotFound(_) => session.mount("/"),
            other => Err(other),
        })?;
        self.register(&session)?;
        session.start();
        self.inner.resumed.fetch_add(1, Ordering::Relaxed);
        info!(session_id = %session.id(), "session restored from store");
        counter!("swell_sessions_restored_total", 1);
        Ok(Resumable {
            session,
            live: false,
        })
    }

    fn restore_principal(&self, session: &Session, presented: Option<&Principal>) -> Result<(), ResumeError> {
        if !session.had_auth() {
            if let Some(principal) = presented {
                session.set_principal(Some(principal.clone()));
            }
            return Ok(());
        }
        let user_id = session.user_id();
        let principal = self
            .inner
            .rehydrator
            .as_ref()
            .and_then(|rehydrator| rehydrator.rehydrate(user_id.as_deref(), presented));
        let Some(principal) = principal else {
            warn!(session_id = %session.id(), "authenticated session could not be rehydrated");
            counter!("swell_resume_rejected_total", 1, "reason" => "rehydrate_failed");
            return Err(ResumeError::RehydrateFailed);
        };
        if let Some(check) = &self.inner.deps.auth_check {
            match check.check(Some(&principal)) {
                Ok(Some(checked)) => {
                    session.set_principal(Some(checked));
                    return Ok(());
                }
                Ok(None) => return Err(ResumeError::RehydrateFailed),
                Err(err) => {
                    counter!("swell_resume_rejected_total", 1, "reason" => "auth");
                    return Err(ResumeError::Auth(err));
                }
            }
        }
        session.set_principal(Some(principal));
        Ok(())
    }

    /// Closes idle and expired sessions, then enforces the memory budget.
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now()).await
    }

    pub async fn sweep_at(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let resume_window = self.inner.config.resume_window;
        let idle_timeout = self.inner.config.idle_timeout;
        for session in self.sessions() {
            if session.is_closed() {
                continue;
            }
            if let Some(detached_at) = session.detached_at() {
                if now.saturating_duration_since(detached_at) >= resume_window {
                    session.close(CloseReason::Expired).await;
                    report.expired += 1;
                }
                continue;
            }
            if now.saturating_duration_since(session.last_active()) >= idle_timeout {
                session.close(CloseReason::Idle).await;
                report.idle_closed += 1;
            }
        }
        self.inner
            .expired
            .fetch_add(report.expired as u64, Ordering::Relaxed);
        report.evicted = self.enforce_memory_budget().await;
        if report != SweepReport::default() {
            info!(
                idle = report.idle_closed,
                expired = report.expired,
                evicted = report.evicted,
                "session sweep"
            );
        }
        self.update_gauges();
        report
    }

    /// Force-closes the `n` least recently active sessions.
    pub async fn evict_lru(&self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let mut candidates: Vec<Arc<Session>> = self
            .sessions()
            .into_iter()
            .filter(|session| !session.is_closed())
            .collect();
        candidates.sort_by_key(|session| session.last_active());
        let victims: Vec<Arc<Session>> = candidates.into_iter().take(n).collect();
        for session in &victims {
            session.close(CloseReason::Evicted).await;
        }
        let evicted = victims.len();
        self.inner
            .evicted
            .fetch_add(evicted as u64, Ordering::Relaxed);
        counter!("swell_sessions_evicted_total", evicted as u64);
        evicted
    }

    /// Evicts enough sessions to get back under the memory budget, using the
    /// current average session size.
    pub async fn enforce_memory_budget(&self) -> usize {
        let Some(budget) = self.inner.config.memory_budget else {
            return 0;
        };
        let sizes: Vec<usize> = self
            .sessions()
            .iter()
            .filter(|session| !session.is_closed())
            .map(|session| session.estimated_memory())
            .collect();
        let total: usize = sizes.iter().sum();
        if total <= budget || sizes.is_empty() {
            return 0;
        }
        let average = (total / sizes.len()).max(1);
        let excess = total - budget;
        let count = excess.div_ceil(average);
        warn!(total, budget, count, "memory budget exceeded; evicting sessions");
        self.evict_lru(count).await
    }

    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let mut interval = tokio::time::interval(self.inner.config.sweep_interval);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                manager.sweep().await;
            }
        })
    }

    /// Drains the registry, persisting each session when a store is
    /// configured, and waits for every close to finish.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.inner.sessions.write();
            sessions.drain().map(|(_, session)| session).collect()
        };
        info!(sessions = drained.len(), "shutting down sessions");
        if let Some(store) = &self.inner.store {
            let saves = drained.iter().map(|session| persist(store.as_ref(), session));
            for (session, result) in drained.iter().zip(join_all(saves).await) {
                if let Err(err) = result {
                    warn!(session_id = %session.id(), error = %err, "failed to persist on shutdown");
                }
            }
        }
        join_all(
            drained
                .iter()
                .map(|session| session.close(CloseReason::Shutdown)),
        )
        .await;
        self.update_gauges();
    }

    pub fn stats(&self) -> ManagerStats {
        let sessions = self.sessions();
        let mut stats = ManagerStats {
            sessions: sessions.len(),
            total_created: self.inner.total_created.load(Ordering::Relaxed),
            resumed: self.inner.resumed.load(Ordering::Relaxed),
            evicted: self.inner.evicted.load(Ordering::Relaxed),
            expired: self.inner.expired.load(Ordering::Relaxed),
            ..ManagerStats::default()
        };
        for session in sessions {
            match session.state() {
                SessionState::Active => stats.active += 1,
                SessionState::Detached => stats.detached += 1,
                SessionState::Closed => {}
            }
            stats.estimated_bytes += session.estimated_memory();
        }
        stats
    }

    pub fn resume_window(&self) -> Duration {
        self.inner.config.resume_window
    }
}

async fn persist(store: &dyn SessionStore, session: &Session) -> Result<(), crate::store::StoreError> {
    let writes = session.unsaved_writes();
    let bytes = session.snapshot().to_bytes()?;
    store.save(session.id(), bytes).await?;
    session.mark_saved(writes);
    counter!("swell_sessions_persisted_total", 1);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Component, RenderCx};
    use crate::routing::RouteTable;
    use crate::store::MemorySessionStore;
    use crate::transport::memory_pair;
    use crate::tree::{el, text, VNode};

    struct Page;

    impl Component for Page {
        fn render(&self, _cx: &mut RenderCx<'_>) -> VNode {
            el("p").child(text("hello")).into()
        }
    }

    fn manager(config: ManagerConfig) -> SessionManager {
        SessionManager::builder(Arc::new(RouteTable::new().with_route("/", || Page)))
            .config(config)
            .build()
    }

    #[test_timeout::tokio_timeout_test]
    async fn create_enforces_the_session_limit() {
        let manager = manager(ManagerConfig {
            max_sessions: 2,
            ..ManagerConfig::default()
        });
        manager.create("/", None).unwrap();
        manager.create("/", None).unwrap();
        assert!(matches!(
            manager.create("/", None),
            Err(ManagerError::TooManySessions(2))
        ));
        assert_eq!(manager.stats().total_created, 2);
    }

    #[test_timeout::tokio_timeout_test]
    async fn unknown_route_is_rejected() {
        let manager = manager(ManagerConfig::default());
        assert!(matches!(
            manager.create("/missing", None),
            Err(ManagerError::RouteNotFound(path)) if path == "/missing"
        ));
        assert!(manager.is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn sweep_uses_separate_idle_and_detached_clocks() {
        let manager = manager(ManagerConfig {
            idle_timeout: Duration::from_secs(10),
            resume_window: Duration::from_secs(30),
            ..ManagerConfig::default()
        });
        let now = Instant::now();
        let later = now + Duration::from_secs(40);

        let expired = manager.create("/", None).unwrap();
        let recent = manager.create("/", None).unwrap();
        recent.set_detached_at(now + Duration::from_secs(20));
        let idle = manager.create("/", None).unwrap();
        let (conn, _idle_peer) = memory_pair("idle");
        idle.connect(conn, manager.config().reconnect, false).await.unwrap();
        let busy = manager.create("/", None).unwrap();
        let (conn, _busy_peer) = memory_pair("busy");
        busy.connect(conn, manager.config().reconnect, false).await.unwrap();
        busy.set_last_active(later);

        let report = manager.sweep_at(later).await;
        assert_eq!(
            report,
            SweepReport {
                idle_closed: 1,
                expired: 1,
                evicted: 0,
            }
        );
        assert!(expired.is_closed());
        assert!(idle.is_closed());
        assert!(!recent.is_closed(), "detached sessions ignore the idle clock");
        assert!(!busy.is_closed());
        assert_eq!(manager.len(), 2);
    }

    #[test_timeout::tokio_timeout_test]
    async fn evict_lru_closes_oldest_first() {
        let manager = manager(ManagerConfig::default());
        let oldest = manager.create("/", None).unwrap();
        let newest = manager.create("/", None).unwrap();
        let now = Instant::now();
        oldest.set_last_active(now - Duration::from_secs(60));
        newest.set_last_active(now);

        assert_eq!(manager.evict_lru(1).await, 1);
        assert!(oldest.is_closed());
        assert!(!newest.is_closed());
        assert_eq!(manager.stats().evicted, 1);
        assert_eq!(manager.len(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn memory_pressure_evicts_by_average_size() {
        let manager = manager(ManagerConfig {
            memory_budget: Some(1),
            ..ManagerConfig::default()
        });
        for _ in 0..3 {
            manager.create("/", None).unwrap();
        }
        let evicted = manager.enforce_memory_budget().await;
        assert_eq!(evicted, 3);
        assert!(manager.is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn shutdown_persists_and_closes_everything() {
        let store = MemorySessionStore::new();
        let manager = SessionManager::builder(Arc::new(RouteTable::new().with_route("/", || Page)))
            .store(store.clone())
            .build();
        let session = manager.create("/", None).unwrap();
        session.set_data("theme", "dark").unwrap();

        manager.shutdown().await;
        assert!(session.is_closed());
        assert!(manager.is_empty());
        let saved = store.load(session.id()).await.unwrap().unwrap();
        let snapshot = SessionSnapshot::from_bytes(&saved).unwrap();
        assert_eq!(snapshot.data["theme"], serde_json::json!("dark"));
    }
}
