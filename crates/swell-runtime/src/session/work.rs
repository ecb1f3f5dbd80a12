use std::sync::atomic::Ordering;

use super::Session;

/// Marks a unit of session work in flight. Closing waits for the last guard
/// before tearing down reactive state.
pub(crate) struct WorkGuard<'a> {
    session: &'a Session,
}

impl<'a> WorkGuard<'a> {
    pub(crate) fn enter(session: &'a Session) -> Option<Self> {
        session.in_flight.fetch_add(1, Ordering::SeqCst);
        if session.is_closed() {
            // Counted before the check so close() cannot finalize underneath us.
            drop(WorkGuard { session });
            return None;
        }
        Some(WorkGuard { session })
    }
}

impl Drop for WorkGuard<'_> {
    fn drop(&mut self) {
        if self.session.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 && self.session.is_closed() {
            self.session.finalize_close();
        }
    }
}
