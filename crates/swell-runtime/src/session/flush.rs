use std::backtrace::Backtrace;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;

use metrics::{counter, histogram};
use swell_core::{ControlMessage, Patch, PatchFrame};
use tracing::{debug, error, warn};

use super::{panic_message, DetachReason, Session, Stream};
use crate::error::SessionError;
use crate::routing::{canonical_path, is_internal_path};

impl Session {
    /// Mounts the component routed at `path` as the session root. The initial
    /// render reaches the client as full markup, so the flush output is dropped.
    pub fn mount(&self, path: &str) -> Result<(), SessionError> {
        let Some(_work) = self.begin_work() else {
            return Err(SessionError::Closed(self.id.clone()));
        };
        let path = canonical_path(path);
        if is_internal_path(&path) {
            return Err(SessionError::RouteNotFound(path));
        }
        let component = self
            .deps
            .router
            .route(&path)
            .ok_or_else(|| SessionError::RouteNotFound(path.clone()))?;
        self.engine.lock().mount_root(component, &path);
        let _ = self.flush_pending();
        Ok(())
    }

    /// Drains navigation, dirty components and effects until quiescent or the
    /// iteration cap. Callers hold the stream lock.
    pub(crate) fn flush_pending(&self) -> (Vec<Patch>, Vec<ControlMessage>) {
        let max_iterations = self.deps.config.max_flush_iterations.max(1);
        let mut patches = Vec::new();
        let mut quiescent = false;
        let mut engine = self.engine.lock();

        for _ in 0..max_iterations {
            let navigation = self.outbox.lock().navigation.take();
            if let Some(raw) = navigation {
                let path = canonical_path(&raw);
                if is_internal_path(&path) {
                    warn!(session_id = %self.id, path = %path, "ignoring navigation to internal path");
                } else if let Some(prefetched) = self.prefetch_cache.take(&path) {
                    counter!("swell_prefetch_hits_total", 1);
                    prefetched.runtime().set_waker(self.render_waker());
                    engine.adopt(prefetched, &mut patches);
                    patches.push(Patch::url_push(path));
                } else if let Some(component) = self.deps.router.route(&path) {
                    engine.replace_root(component, &path, &mut patches);
                    patches.push(Patch::url_push(path));
                } else {
                    debug!(session_id = %self.id, path = %path, "navigation to unknown route");
                    counter!("swell_navigation_not_found_total", 1);
                }
            }

            engine.render_dirty(&mut patches);
            engine.run_effects(&self.storm);

            let runtime = engine.runtime();
            let effects_settled = !runtime.has_pending_effects() || self.storm.is_tripped();
            if self.outbox.lock().navigation.is_none() && !runtime.has_dirty() && effects_settled {
                quiescent = true;
                break;
            }
        }
        drop(engine);

        if !quiescent {
            warn!(session_id = %self.id, max_iterations, "flush did not settle; remaining work deferred");
            counter!("swell_flush_capped_total", 1);
            self.request_render();
        }

        let mut outbox = self.outbox.lock();
        patches.append(&mut outbox.patches);
        let controls = std::mem::take(&mut outbox.controls);
        (patches, controls)
    }

    /// Numbers, records and writes one patch frame, then any trailing
    /// controls. While detached the frame is only recorded.
    pub(crate) async fn deliver_locked(
        &self,
        stream: &Stream,
        patches: Vec<Patch>,
        controls: Vec<ControlMessage>,
    ) -> Result<(), SessionError> {
        if !patches.is_empty() {
            let seq = self.send_seq.load(Ordering::SeqCst) + 1;
            histogram!("swell_patches_per_frame", patches.len() as f64);
            let bytes = PatchFrame { seq, patches }.to_frame()?.encode();
            if let Err(err) = self.history.lock().push(seq, bytes.clone()) {
                error!(session_id = %self.id, error = %err, "patch history out of order");
            }
            self.send_seq.store(seq, Ordering::SeqCst);
            self.write_locked(stream, bytes).await?;
        }
        for control in controls {
            self.write_locked(stream, control.to_frame()?.encode()).await?;
        }
        Ok(())
    }

    /// One full flush cycle: render under the stream lock, then deliver.
    pub(crate) async fn flush(&self) {
        let Some(_work) = self.begin_work() else {
            return;
        };
        let (result, generation) = {
            let stream = self.stream.lock().await;
            let generation = *self.generation.borrow();
            let flushed = catch_unwind(AssertUnwindSafe(|| self.flush_pending()));
            let (patches, controls) = match flushed {
                Ok(output) => output,
                Err(payload) => {
                    error!(
                        session_id = %self.id,
                        panic = %panic_message(payload.as_ref()),
                        backtrace = %Backtrace::force_capture(),
                        "render panicked"
                    );
                    counter!("swell_panics_total", 1, "site" => "flush");
                    return;
                }
            };
            if patches.is_empty() && controls.is_empty() {
                return;
            }
            (self.deliver_locked(&stream, patches, controls).await, generation)
        };
        if let Err(err) = result {
            warn!(session_id = %self.id, error = %err, "patch delivery failed");
            if matches!(err, SessionError::Connection(_) | SessionError::WriteTimeout(_)) {
                self.detach_generation(Some(generation), DetachReason::WriteError)
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use super::*;
    use crate::component::{Component, RenderCx};
    use crate::config::SessionConfig;
    use crate::prefetch::PrefetchPool;
    use crate::routing::RouteTable;
    use crate::session::SessionDeps;
    use crate::tree::{el, text, VNode};

    /// Writes the signal it reads on every render, so it is never clean.
    struct Restless {
        renders: Arc<AtomicUsize>,
    }

    impl Component for Restless {
        fn render(&self, cx: &mut RenderCx<'_>) -> VNode {
            self.renders.fetch_add(1, Ordering::SeqCst);
            let tick = cx.use_signal(|| 0u64);
            let value = tick.get();
            tick.set(value + 1);
            el("p").child(text(value.to_string())).into()
        }
    }

    fn wake_pending(session: &Session) -> bool {
        session
            .receivers
            .lock()
            .as_mut()
            .is_some_and(|queues| queues.wake.try_recv().is_ok())
    }

    #[test_timeout::tokio_timeout_test]
    async fn flush_stops_at_the_iteration_cap_and_reschedules() {
        let renders = Arc::new(AtomicUsize::new(0));
        let routes = {
            let renders = Arc::clone(&renders);
            RouteTable::new().with_route("/", move || Restless {
                renders: Arc::clone(&renders),
            })
        };
        let session = Session::new(
            "restless",
            SessionDeps {
                config: Arc::new(SessionConfig {
                    max_flush_iterations: 3,
                    ..SessionConfig::default()
                }),
                router: Arc::new(routes),
                auth_check: None,
                prefetch_pool: PrefetchPool::default(),
            },
        );

        session.mount("/").unwrap();
        assert_eq!(renders.load(Ordering::SeqCst), 4);
        assert!(wake_pending(&session));

        let (patches, controls) = session.flush_pending();
        assert_eq!(renders.load(Ordering::SeqCst), 7);
        assert_eq!(patches.len(), 3);
        assert_eq!(patches.last(), Some(&Patch::set_text("h2", "6")));
        assert!(controls.is_empty());
        assert!(session.engine.lock().runtime().has_dirty(), "remaining work is deferred, not dropped");
        assert!(wake_pending(&session));
        assert!(!session.is_closed());
    }
}
