use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use swell_core::{ControlMessage, Patch};
use tracing::warn;

use super::Session;
use crate::auth::Principal;
use crate::error::{DispatchError, SessionError};
use crate::storm::{ResourceKind, StormExceeded};

/// Handle given to event handlers and dispatched jobs. Everything queued
/// through it lands in the flush that follows the current unit of work.
#[derive(Clone)]
pub struct EventCx {
    session: Arc<Session>,
}

impl EventCx {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    /// Mounts the route at `path` on the next flush and pushes the new URL.
    pub fn navigate(&self, path: impl Into<String>) {
        self.session.navigate(path);
    }

    /// Rewrites one query parameter without navigating. `None` removes it.
    pub fn set_query(&self, key: impl Into<String>, value: Option<String>) {
        self.session.queue_patch(Patch::url_replace(key, value));
    }

    /// Fires a DOM custom event on the element `hid` in the browser.
    pub fn emit<T: Serialize>(&self, hid: impl Into<String>, name: impl Into<String>, detail: &T) -> Result<(), SessionError> {
        let detail = serde_json::to_string(detail)?;
        self.session
            .queue_patch(Patch::dispatch_event(hid, name, detail));
        Ok(())
    }

    /// Tells the client hook on `hid` to undo its optimistic update.
    pub fn revert_hook(&self, hid: impl Into<String>) {
        self.session
            .queue_control(ControlMessage::HookRevert { hid: hid.into() });
    }

    pub fn dispatch(&self, f: impl FnOnce(&EventCx) + Send + 'static) -> Result<(), DispatchError> {
        self.session.dispatch(f)
    }

    /// Runs `work` off the event loop and hands its output to `done` back on
    /// it. Counted against the session's action budget.
    pub fn spawn_action<Fut, T, D>(&self, work: Fut, done: D) -> Result<(), StormExceeded>
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
        D: FnOnce(&EventCx, T) + Send + 'static,
    {
        self.spawn_budgeted(ResourceKind::Action, work, done)
    }

    /// Like [`EventCx::spawn_action`] but counted as a data fetch.
    pub fn spawn_resource<Fut, T, D>(&self, work: Fut, done: D) -> Result<(), StormExceeded>
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
        D: FnOnce(&EventCx, T) + Send + 'static,
    {
        self.spawn_budgeted(ResourceKind::Resource, work, done)
    }

    fn spawn_budgeted<Fut, T, D>(&self, kind: ResourceKind, work: Fut, done: D) -> Result<(), StormExceeded>
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
        D: FnOnce(&EventCx, T) + Send + 'static,
    {
        self.session.storm().try_start(kind)?;
        let session = Arc::clone(&self.session);
        tokio::spawn(async move {
            let output = work.await;
            if let Err(err) = session.dispatch(move |cx| done(cx, output)) {
                warn!(session_id = %session.id(), kind = kind.label(), error = %err, "background result dropped");
            }
        });
        Ok(())
    }

    pub fn data<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.session.data(key)
    }

    pub fn set_data<T: Serialize>(&self, key: impl Into<String>, value: T) -> Result<(), SessionError> {
        self.session.set_data(key, value)
    }

    pub fn principal(&self) -> Option<Principal> {
        self.session.principal()
    }

    /// Warms the render of `path` in the background.
    pub fn prefetch(&self, path: &str) {
        self.session.prefetch(path);
    }
}
