use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use metrics::counter;
use swell_core::{ClientHello, ControlMessage, ReconnectPolicy, ServerHello};
use tracing::{debug, info, warn};

use super::{DetachReason, Session, Stream};
use crate::error::SessionError;
use crate::history::PatchHistory;
use crate::transport::Connection;

/// How to bring a client that last applied some frame up to date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResyncPlan {
    UpToDate,
    /// Exact bytes of every missed frame, oldest first.
    Replay(Vec<Bytes>),
    /// History no longer covers the gap; resend the whole document.
    Full,
}

impl ResyncPlan {
    pub fn label(&self) -> &'static str {
        match self {
            ResyncPlan::UpToDate => "up_to_date",
            ResyncPlan::Replay(_) => "replay",
            ResyncPlan::Full => "full",
        }
    }

    pub fn plan(last_seen: u64, send_seq: u64, history: &PatchHistory) -> Self {
        if last_seen == send_seq {
            return ResyncPlan::UpToDate;
        }
        if last_seen > send_seq {
            return ResyncPlan::Full;
        }
        match history.range(last_seen + 1, send_seq) {
            Some(frames) => ResyncPlan::Replay(frames),
            None => ResyncPlan::Full,
        }
    }
}

impl Session {
    /// Answers a client resync request on the live connection.
    pub(crate) async fn resync(&self, last_seen: u64) {
        let Some(_work) = self.begin_work() else {
            return;
        };
        let (result, generation) = {
            let stream = self.stream.lock().await;
            if stream.conn.is_none() {
                return;
            }
            let generation = *self.generation.borrow();
            let plan = self.plan_resync(last_seen);
            (self.send_plan_locked(&stream, plan).await, generation)
        };
        if let Err(err) = result {
            warn!(session_id = %self.id, error = %err, "resync failed");
            self.detach_generation(Some(generation), DetachReason::WriteError)
                .await;
        }
    }

    fn plan_resync(&self, last_seen: u64) -> ResyncPlan {
        let send_seq = self.send_seq();
        let plan = ResyncPlan::plan(last_seen, send_seq, &self.history.lock());
        counter!("swell_resync_total", 1, "plan" => plan.label());
        debug!(session_id = %self.id, last_seen, send_seq, plan = plan.label(), "resync planned");
        plan
    }

    async fn send_plan_locked(&self, stream: &Stream, plan: ResyncPlan) -> Result<(), SessionError> {
        match plan {
            ResyncPlan::UpToDate => Ok(()),
            ResyncPlan::Replay(frames) => {
                for frame in frames {
                    self.write_locked(stream, frame).await?;
                }
                Ok(())
            }
            ResyncPlan::Full => {
                let send_seq = self.send_seq();
                let frame = ControlMessage::ResyncFull {
                    seq: send_seq,
                    html: self.render_html(),
                }
                .to_frame()?
                .encode();
                self.write_locked(stream, frame).await?;
                self.history.lock().gc(send_seq);
                Ok(())
            }
        }
    }

    /// Records the client's highest applied frame and drops history up to it.
    pub(crate) fn handle_ack(&self, seq: u64) {
        let acked = seq.min(self.send_seq());
        let previous = self.ack_seq.fetch_max(acked, Ordering::SeqCst);
        if acked > previous {
            self.history.lock().gc(acked);
        }
    }

    /// Attaches a brand new connection and sends the full document. Used for
    /// fresh sessions and for sessions restored from the store.
    pub async fn connect(
        self: &Arc<Self>,
        conn: Arc<dyn Connection>,
        reconnect: ReconnectPolicy,
        resumed: bool,
    ) -> Result<(), SessionError> {
        let Some(work) = self.begin_work() else {
            return Err(SessionError::Closed(self.id.clone()));
        };
        let result = {
            let mut stream = self.stream.lock().await;
            let full = ControlMessage::ResyncFull {
                seq: 0,
                html: self.render_html(),
            }
            .to_frame()?
            .encode();
            let recv_seq = self.recv_seq();
            let generation = self.swap_connection_locked(&mut stream, conn, recv_seq).await;
            let hello = ServerHello::accepted(self.id.clone(), resumed, reconnect);
            let result = self
                .write_handshake_locked(&stream, &hello, vec![full])
                .await;
            (result, generation)
        };
        drop(work);
        self.finish_attach(result).await
    }

    /// Reattaches a detached (or still attached) session to a new connection,
    /// re-rendering every component and catching the client up on what it
    /// missed.
    pub async fn resume(
        self: &Arc<Self>,
        conn: Arc<dyn Connection>,
        hello: &ClientHello,
        reconnect: ReconnectPolicy,
    ) -> Result<(), SessionError> {
        let Some(work) = self.begin_work() else {
            return Err(SessionError::Closed(self.id.clone()));
        };
        let result = {
            let mut stream = self.stream.lock().await;
            let ids_changed = {
                let mut engine = self.engine.lock();
                let before = engine.root_wire();
                engine.rebuild();
                before != engine.root_wire()
            };
            let catch_up = if ids_changed {
                debug!(session_id = %self.id, "element ids moved during rebuild; sending full document");
                counter!("swell_resync_total", 1, "plan" => "full");
                vec![ControlMessage::ResyncFull {
                    seq: 0,
                    html: self.render_html(),
                }
                .to_frame()?
                .encode()]
            } else {
                match self.plan_resync(hello.last_patch_seq) {
                    ResyncPlan::UpToDate => Vec::new(),
                    ResyncPlan::Replay(frames) => frames,
                    ResyncPlan::Full => vec![ControlMessage::ResyncFull {
                        seq: 0,
                        html: self.render_html(),
                    }
                    .to_frame()?
                    .encode()],
                }
            };
            let generation = self
                .swap_connection_locked(&mut stream, conn, hello.last_event_seq)
                .await;
            let server_hello = ServerHello::accepted(self.id.clone(), true, reconnect);
            let result = self
                .write_handshake_locked(&stream, &server_hello, catch_up)
                .await;
            (result, generation)
        };
        drop(work);
        info!(session_id = %self.id, "session resumed");
        counter!("swell_session_resumed_total", 1);
        self.finish_attach(result).await
    }

    /// Installs `conn`, closing any connection it replaces, and resets the
    /// outbound numbering for the new stream.
    async fn swap_connection_locked(
        &self,
        stream: &mut Stream,
        conn: Arc<dyn Connection>,
        last_event_seq: u64,
    ) -> u64 {
        let previous = stream.conn.replace(conn);
        self.generation.send_modify(|generation| *generation += 1);
        let generation = *self.generation.borrow();
        self.detached.store(false, Ordering::SeqCst);
        *self.detached_at.lock() = None;
        self.send_seq.store(0, Ordering::SeqCst);
        self.ack_seq.store(0, Ordering::SeqCst);
        self.history.lock().clear();
        self.recv_seq.store(last_event_seq, Ordering::SeqCst);
        self.touch();
        if let Some(previous) = previous {
            previous.close().await;
        }
        generation
    }

    async fn write_handshake_locked(
        &self,
        stream: &Stream,
        hello: &ServerHello,
        frames: Vec<Bytes>,
    ) -> Result<(), SessionError> {
        self.write_locked(stream, hello.to_frame()?.encode()).await?;
        for frame in frames {
            self.write_locked(stream, frame).await?;
        }
        Ok(())
    }

    async fn finish_attach(
        self: &Arc<Self>,
        (result, generation): (Result<(), SessionError>, u64),
    ) -> Result<(), SessionError> {
        if let Err(err) = result {
            warn!(session_id = %self.id, error = %err, "handshake write failed");
            self.detach_generation(Some(generation), DetachReason::WriteError)
                .await;
            return Err(err);
        }
        self.start();
        Ok(())
    }
}
