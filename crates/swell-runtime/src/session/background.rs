use std::backtrace::Backtrace;
use std::panic::{catch_unwind, AssertUnwindSafe};

use metrics::counter;
use tokio::time::timeout;
use tracing::{debug, error, trace};

use super::{panic_message, prerender, Session};
use crate::routing::{canonical_path, is_internal_path};

impl Session {
    /// Renders `path` off the event loop and keeps the mounted tree for a
    /// later navigation to adopt. Silently dropped when the limiter says no.
    /// The limiter permits stay with the render itself, so a render that
    /// outlives its timeout still counts against both caps.
    pub fn prefetch(&self, path: &str) {
        let path = canonical_path(path);
        if self.is_closed() || is_internal_path(&path) || self.prefetch_cache.contains_fresh(&path) {
            return;
        }
        let permit = match self.prefetch_limiter.try_acquire() {
            Ok(permit) => permit,
            Err(rejected) => {
                trace!(session_id = %self.id, path = %path, reason = rejected.label(), "prefetch dropped");
                counter!("swell_prefetch_dropped_total", 1, "reason" => rejected.label());
                return;
            }
        };
        let Some(component) = self.deps.router.route(&path) else {
            debug!(session_id = %self.id, path = %path, "prefetch for unknown route");
            return;
        };
        let Some(session) = self.self_arc() else {
            return;
        };
        let render_timeout = self.deps.config.prefetch.render_timeout;
        tokio::spawn(async move {
            let render_path = path.clone();
            let render = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                catch_unwind(AssertUnwindSafe(|| prerender(component, &render_path)))
            });
            match timeout(render_timeout, render).await {
                Ok(Ok(Ok(engine))) => {
                    if !session.is_closed() {
                        session.prefetch_cache.insert(path, engine);
                        counter!("swell_prefetch_rendered_total", 1);
                    }
                }
                Ok(Ok(Err(payload))) => {
                    error!(
                        session_id = %session.id,
                        path = %path,
                        panic = %panic_message(payload.as_ref()),
                        backtrace = %Backtrace::force_capture(),
                        "prefetch render panicked"
                    );
                    counter!("swell_panics_total", 1, "site" => "prefetch");
                }
                Ok(Err(err)) => {
                    error!(session_id = %session.id, path = %path, error = %err, "prefetch task failed");
                }
                Err(_) => {
                    debug!(session_id = %session.id, path = %path, "prefetch render timed out");
                    counter!("swell_prefetch_dropped_total", 1, "reason" => "timeout");
                }
            }
        });
    }

    /// True when a fresh prefetched render of `path` is waiting.
    pub fn is_prefetched(&self, path: &str) -> bool {
        self.prefetch_cache.contains_fresh(&canonical_path(path))
    }
}

