use std::backtrace::Backtrace;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use metrics::counter;
use swell_core::{
    AckPayload, ControlMessage, ErrorCode, ErrorPayload, EventData, EventEnvelope, Frame,
    FrameType,
};
use tokio::sync::watch;
use tokio::time::{interval_at, timeout, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, trace, warn};

use super::{panic_message, unix_millis, CloseReason, DetachReason, DispatchFn, EventCx, QueueReceivers, Session};
use crate::auth::AuthError;
use crate::error::{DispatchError, HandlerError};
use crate::handler::EventKind;
use crate::transport::Connection;

async fn wait_closed(done: &mut watch::Receiver<bool>) {
    let _ = done.wait_for(|closed| *closed).await;
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

enum ReadOutcome {
    Closed,
    Lost(DetachReason),
}

impl Session {
    /// Reads frames from whichever connection is attached. Lives as long as
    /// the session; while detached it parks until a resume bumps the
    /// connection generation.
    pub(crate) async fn read_loop(self: Arc<Self>) {
        let mut generation = self.generation.subscribe();
        let mut done = self.done.subscribe();
        loop {
            if self.is_closed() {
                break;
            }
            generation.borrow_and_update();
            let Some((conn, current)) = self.current_connection().await else {
                tokio::select! {
                    _ = wait_closed(&mut done) => break,
                    changed = generation.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                continue;
            };
            match self.read_connection(conn, &mut done).await {
                ReadOutcome::Closed => break,
                ReadOutcome::Lost(reason) => {
                    self.detach_generation(Some(current), reason).await;
                }
            }
        }
        self.read_running.store(false, Ordering::SeqCst);
        debug!(session_id = %self.id, "read loop exited");
    }

    async fn read_connection(
        &self,
        conn: Arc<dyn Connection>,
        done: &mut watch::Receiver<bool>,
    ) -> ReadOutcome {
        let deadline = self.deps.config.read_deadline;
        loop {
            let read = tokio::select! {
                _ = wait_closed(done) => return ReadOutcome::Closed,
                read = timeout(deadline, conn.recv()) => read,
            };
            match read {
                Ok(Ok(Some(bytes))) => self.handle_inbound(bytes).await,
                Ok(Ok(None)) => return ReadOutcome::Lost(DetachReason::PeerClosed),
                Ok(Err(err)) => {
                    debug!(session_id = %self.id, error = %err, "read failed");
                    return ReadOutcome::Lost(DetachReason::ReadError);
                }
                Err(_) => {
                    warn!(session_id = %self.id, ?deadline, "read deadline elapsed");
                    return ReadOutcome::Lost(DetachReason::ReadTimeout);
                }
            }
        }
    }

    async fn handle_inbound(&self, bytes: Bytes) {
        let frame = match Frame::decode(&bytes) {
            Ok(frame) => frame,
            Err(err) => {
                counter!("swell_invalid_frames_total", 1);
                self.send_error(ErrorPayload::new(ErrorCode::MalformedEvent, err.to_string()))
                    .await;
                return;
            }
        };
        counter!("swell_frames_received_total", 1, "type" => frame.frame_type.label());
        match frame.frame_type {
            FrameType::Event => match frame.parse_json::<EventEnvelope>() {
                Ok(event) => {
                    let seq = event.seq;
                    if let Err(DispatchError::QueueFull) = self.enqueue_event(event) {
                        self.send_error(
                            ErrorPayload::new(ErrorCode::QueueFull, "event queue full").for_event(seq),
                        )
                        .await;
                    }
                }
                Err(err) => {
                    self.send_error(ErrorPayload::new(ErrorCode::MalformedEvent, err.to_string()))
                        .await;
                }
            },
            FrameType::Control => match frame.parse_json::<ControlMessage>() {
                Ok(ControlMessage::Ping { ts_ms }) => {
                    if let Ok(pong) = (ControlMessage::Pong { ts_ms }).to_frame() {
                        let _ = self.send_frame(pong.encode()).await;
                    }
                }
                Ok(ControlMessage::Pong { ts_ms }) => {
                    trace!(session_id = %self.id, ts_ms, "pong");
                }
                Ok(ControlMessage::Resync { last_seq }) => self.resync(last_seq).await,
                Ok(ControlMessage::Close { reason }) => {
                    debug!(session_id = %self.id, ?reason, "client closed session");
                    self.close(CloseReason::ClientClosed).await;
                }
                Ok(ControlMessage::Prefetch { path }) => self.prefetch(&path),
                Ok(other) => {
                    debug!(session_id = %self.id, ?other, "ignoring server-only control");
                }
                Err(err) => {
                    warn!(session_id = %self.id, error = %err, "malformed control frame");
                }
            },
            FrameType::Ack => match frame.parse_json::<AckPayload>() {
                Ok(ack) => self.handle_ack(ack.seq),
                Err(err) => {
                    warn!(session_id = %self.id, error = %err, "malformed ack");
                }
            },
            other => {
                debug!(session_id = %self.id, frame_type = other.label(), "unexpected frame");
            }
        }
    }

    pub(crate) async fn send_error(&self, payload: ErrorPayload) {
        counter!("swell_error_frames_total", 1, "code" => format!("{:?}", payload.code));
        match payload.to_frame() {
            Ok(frame) => {
                let _ = self.send_frame(frame.encode()).await;
            }
            Err(err) => {
                error!(session_id = %self.id, error = %err, "failed to encode error frame");
            }
        }
    }

    /// Heartbeats the attached connection. A failed ping is only logged; the
    /// read deadline decides when a peer is gone.
    pub(crate) async fn write_loop(self: Arc<Self>) {
        let every = self.deps.config.heartbeat_interval;
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut done = self.done.subscribe();
        loop {
            tokio::select! {
                _ = wait_closed(&mut done) => break,
                _ = ticker.tick() => {}
            }
            if self.is_detached() {
                continue;
            }
            let ping = ControlMessage::Ping {
                ts_ms: unix_millis(SystemTime::now()),
            };
            let Ok(frame) = ping.to_frame() else {
                continue;
            };
            let stream = self.stream.lock().await;
            if let Err(err) = self.write_locked(&stream, frame.encode()).await {
                debug!(session_id = %self.id, error = %err, "heartbeat failed");
                counter!("swell_heartbeat_failures_total", 1);
            }
        }
        self.write_running.store(false, Ordering::SeqCst);
        debug!(session_id = %self.id, "write loop exited");
    }

    /// Single consumer of events, dispatched jobs and render wakeups. Keeps
    /// running while detached so background work still lands in history.
    pub(crate) async fn event_loop(self: Arc<Self>, mut queues: QueueReceivers) {
        let mut done = self.done.subscribe();
        let mut reauth = self.deps.config.reauth_interval.map(|every| {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });
        loop {
            tokio::select! {
                biased;
                _ = wait_closed(&mut done) => break,
                Some(event) = queues.events.recv() => {
                    self.storm.begin_tick();
                    let errors = self.handle_event(event);
                    for error in errors {
                        self.send_error(error).await;
                    }
                    self.flush().await;
                }
                Some(job) = queues.dispatch.recv() => {
                    self.storm.begin_tick();
                    if let Some(error) = self.run_dispatch(job) {
                        self.send_error(error).await;
                    }
                    self.flush().await;
                }
                Some(()) = queues.wake.recv() => {
                    self.storm.begin_tick();
                    self.flush().await;
                }
                _ = next_tick(&mut reauth) => self.reauthenticate().await,
            }
        }
        *self.receivers.lock() = Some(queues);
        self.event_running.store(false, Ordering::SeqCst);
        debug!(session_id = %self.id, "event loop exited");
    }

    /// Runs every handler bound to the event's target. Returns error frames
    /// to send back.
    fn handle_event(self: &Arc<Self>, event: EventEnvelope) -> Vec<ErrorPayload> {
        let Some(_work) = self.begin_work() else {
            return Vec::new();
        };
        if event.seq != 0 {
            if event.seq <= self.recv_seq.load(Ordering::SeqCst) {
                counter!("swell_events_duplicate_total", 1);
                trace!(session_id = %self.id, seq = event.seq, "duplicate event dropped");
                return Vec::new();
            }
            self.recv_seq.store(event.seq, Ordering::SeqCst);
        }
        self.touch();

        let kind = EventKind::parse(&event.kind);
        let handlers = self.engine.lock().lookup(&event.hid, &kind);
        let Some(handlers) = handlers else {
            if let (EventKind::Navigate, EventData::Navigate { path }) = (&kind, &event.data) {
                self.navigate(path.clone());
                return Vec::new();
            }
            return vec![ErrorPayload::new(
                ErrorCode::HandlerNotFound,
                format!("no {} handler for {}", kind.as_str(), event.hid),
            )
            .for_event(event.seq)];
        };

        let cx = EventCx::new(Arc::clone(self));
        let mut errors = Vec::new();
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&cx, &event))) {
                Ok(Ok(())) => {}
                Ok(Err(err @ HandlerError::Payload { .. })) => {
                    errors.push(
                        ErrorPayload::new(ErrorCode::MalformedEvent, err.to_string())
                            .for_event(event.seq),
                    );
                }
                Ok(Err(err)) => {
                    debug!(session_id = %self.id, error = %err, "handler rejected event");
                    errors.push(ErrorPayload::new(ErrorCode::Internal, err.to_string()).for_event(event.seq));
                }
                Err(payload) => {
                    error!(
                        session_id = %self.id,
                        hid = %event.hid,
                        kind = kind.as_str(),
                        panic = %panic_message(payload.as_ref()),
                        backtrace = %Backtrace::force_capture(),
                        "event handler panicked"
                    );
                    counter!("swell_panics_total", 1, "site" => "handler");
                    errors.push(
                        ErrorPayload::new(ErrorCode::Internal, "handler failed").for_event(event.seq),
                    );
                }
            }
        }
        self.counters.events_handled.fetch_add(1, Ordering::Relaxed);
        errors
    }

    fn run_dispatch(self: &Arc<Self>, job: DispatchFn) -> Option<ErrorPayload> {
        let _work = self.begin_work()?;
        let cx = EventCx::new(Arc::clone(self));
        match catch_unwind(AssertUnwindSafe(move || job(&cx))) {
            Ok(()) => None,
            Err(payload) => {
                error!(
                    session_id = %self.id,
                    panic = %panic_message(payload.as_ref()),
                    backtrace = %Backtrace::force_capture(),
                    "dispatched job panicked"
                );
                counter!("swell_panics_total", 1, "site" => "dispatch");
                Some(ErrorPayload::new(ErrorCode::Internal, "dispatched work failed"))
            }
        }
    }

    /// Re-validates the principal. A session that once authenticated and now
    /// checks out anonymous is treated as a failure.
    async fn reauthenticate(&self) {
        let Some(check) = self.deps.auth_check.clone() else {
            return;
        };
        let current = self.principal();
        let failure = match check.check(current.as_ref()) {
            Ok(Some(principal)) => {
                self.set_principal(Some(principal));
                return;
            }
            Ok(None) if !self.had_auth() => return,
            Ok(None) => AuthError::Unauthenticated,
            Err(err) => err,
        };
        warn!(session_id = %self.id, error = %failure, "re-authentication failed");
        counter!("swell_reauth_failures_total", 1);
        self.send_error(ErrorPayload::new(ErrorCode::Unauthorized, failure.to_string()))
            .await;
        self.close(CloseReason::AuthFailed).await;
    }
}
