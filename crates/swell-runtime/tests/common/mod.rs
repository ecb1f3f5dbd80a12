#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use swell_core::{
    ClientHello, ControlMessage, EventEnvelope, Frame, FrameType, PatchFrame, ServerHello,
};
use swell_runtime::{
    el, perform_handshake, text, Component, EventKind, Handler, ManagerConfig, MemoryPeer,
    RenderCx, RouteTable, Session, SessionConfig, SessionManager, SessionManagerBuilder, VNode,
};

pub const WAIT: Duration = Duration::from_secs(2);
pub const SHORT: Duration = Duration::from_millis(100);

/// `div(h1) > [button(h2) > "+"(h3), span(h4) > count(h5)]`
pub struct Counter;

impl Component for Counter {
    fn render(&self, cx: &mut RenderCx<'_>) -> VNode {
        let count = cx.use_signal(|| 0u64);
        let value = count.get();
        let bump = count.clone();
        el("div")
            .child(
                el("button")
                    .on(EventKind::Click, Handler::click(move |_| bump.update(|n| *n += 1)))
                    .child(text("+")),
            )
            .child(el("span").child(text(value.to_string())))
            .into()
    }
}

pub struct About;

impl Component for About {
    fn render(&self, _cx: &mut RenderCx<'_>) -> VNode {
        el("article").child(text("about")).into()
    }
}

/// Button `h2` panics, button `h4` bumps the counter rendered at `h7`.
pub struct Fragile;

impl Component for Fragile {
    fn render(&self, cx: &mut RenderCx<'_>) -> VNode {
        let count = cx.use_signal(|| 0u64);
        let value = count.get();
        let bump = count.clone();
        el("div")
            .child(
                el("button")
                    .on(EventKind::Click, Handler::click(|_| panic!("boom")))
                    .child(text("explode")),
            )
            .child(
                el("button")
                    .on(EventKind::Click, Handler::click(move |_| bump.update(|n| *n += 1)))
                    .child(text("ok")),
            )
            .child(el("span").child(text(value.to_string())))
            .into()
    }
}

pub const ACTION_DELAY: Duration = Duration::from_millis(500);

/// Clicking `h2` bumps the count at `h5` once a background action finishes.
pub struct Delayed;

impl Component for Delayed {
    fn render(&self, cx: &mut RenderCx<'_>) -> VNode {
        let count = cx.use_signal(|| 0u64);
        let value = count.get();
        let bump = count.clone();
        el("div")
            .child(
                el("button")
                    .on(
                        EventKind::Click,
                        Handler::click(move |cx| {
                            let bump = bump.clone();
                            cx.spawn_action(tokio::time::sleep(ACTION_DELAY), move |_, ()| {
                                bump.update(|n| *n += 1)
                            })
                            .unwrap();
                        }),
                    )
                    .child(text("later")),
            )
            .child(el("span").child(text(value.to_string())))
            .into()
    }
}

pub fn routes() -> Arc<RouteTable> {
    Arc::new(
        RouteTable::new()
            .with_route("/", || Counter)
            .with_route("/about", || About)
            .with_route("/fragile", || Fragile)
            .with_route("/delayed", || Delayed),
    )
}

pub fn builder() -> SessionManagerBuilder {
    SessionManager::builder(routes())
}

pub fn manager(config: ManagerConfig, session: SessionConfig) -> SessionManager {
    builder().config(config).session_config(session).build()
}

pub fn default_manager() -> SessionManager {
    manager(ManagerConfig::default(), SessionConfig::default())
}

pub struct Client {
    pub session: Arc<Session>,
    pub peer: MemoryPeer,
    pub hello: ServerHello,
}

/// Runs a handshake for `hello` and returns the server's reply without
/// consuming any frame after it.
pub async fn handshake(
    manager: &SessionManager,
    hello: ClientHello,
    principal: Option<swell_runtime::Principal>,
) -> (Result<Arc<Session>, swell_runtime::HandshakeError>, MemoryPeer, ServerHello) {
    let (conn, mut peer) = swell_runtime::memory_pair("test-client");
    peer.send_frame(&hello.to_frame().unwrap()).unwrap();
    let result = perform_handshake(manager, conn, principal, WAIT).await;
    let reply = peer.recv_frame(WAIT).await.unwrap();
    assert_eq!(reply.frame_type, FrameType::ServerHello);
    let server_hello: ServerHello = reply.parse_json().unwrap();
    (result, peer, server_hello)
}

/// Fresh session on `/`, with the initial full document already consumed.
pub async fn connect(manager: &SessionManager, path: &str) -> Client {
    let (result, mut peer, hello) = handshake(manager, ClientHello::new(path), None).await;
    let session = result.unwrap();
    let full = expect_control(&mut peer).await;
    assert!(matches!(full, ControlMessage::ResyncFull { seq: 0, .. }));
    Client {
        session,
        peer,
        hello,
    }
}

pub fn click(seq: u64, hid: &str) -> Frame {
    EventEnvelope::new(seq, hid, "click").to_frame().unwrap()
}

/// Next frame that is not a heartbeat.
pub async fn next_frame(peer: &mut MemoryPeer) -> Frame {
    loop {
        let frame = peer.recv_frame(WAIT).await.unwrap();
        if frame.frame_type == FrameType::Control {
            if let Ok(ControlMessage::Ping { .. }) = frame.parse_json::<ControlMessage>() {
                continue;
            }
        }
        return frame;
    }
}

pub async fn expect_patch(peer: &mut MemoryPeer) -> PatchFrame {
    let frame = next_frame(peer).await;
    assert_eq!(frame.frame_type, FrameType::Patches, "expected a patch frame");
    frame.parse_json().unwrap()
}

pub async fn expect_control(peer: &mut MemoryPeer) -> ControlMessage {
    let frame = next_frame(peer).await;
    assert_eq!(frame.frame_type, FrameType::Control, "expected a control frame");
    frame.parse_json().unwrap()
}

pub async fn expect_error(peer: &mut MemoryPeer) -> swell_core::ErrorPayload {
    let frame = next_frame(peer).await;
    assert_eq!(frame.frame_type, FrameType::Error, "expected an error frame");
    frame.parse_json().unwrap()
}

/// Asserts nothing but heartbeats arrives within `wait`.
pub async fn expect_silence(peer: &mut MemoryPeer, wait: Duration) {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return;
        }
        match peer.recv_frame(remaining).await {
            Ok(frame) if frame.frame_type == FrameType::Control => {
                let control: ControlMessage = frame.parse_json().unwrap();
                assert!(matches!(control, ControlMessage::Ping { .. }), "unexpected {control:?}");
            }
            Ok(frame) => panic!("unexpected {:?} frame", frame.frame_type),
            Err(swell_runtime::transport::PeerError::Timeout) => return,
            Err(err) => panic!("peer failed: {err}"),
        }
    }
}

/// Polls `condition` until it holds or `WAIT` elapses.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition never held");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
