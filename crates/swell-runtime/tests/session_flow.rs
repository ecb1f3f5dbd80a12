mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use common::*;
use swell_core::{
    ControlMessage, ErrorCode, EventData, EventEnvelope, Frame, FrameType, Patch, PatchOp,
};
use swell_runtime::{DispatchError, ManagerConfig, SessionConfig, SessionState};

#[test_timeout::tokio_timeout_test]
async fn each_flush_is_one_frame_with_the_next_sequence() {
    let manager = default_manager();
    let mut client = connect(&manager, "/").await;
    assert!(!client.hello.resumed);
    assert_eq!(client.session.state(), SessionState::Active);

    for n in 1..=3u64 {
        client.peer.send_frame(&click(n, "h2")).unwrap();
        let frame = expect_patch(&mut client.peer).await;
        assert_eq!(frame.seq, n);
        assert_eq!(frame.patches, vec![Patch::set_text("h5", n.to_string())]);
    }
    assert_eq!(client.session.send_seq(), 3);
    assert_eq!(client.session.recv_seq(), 3);
    expect_silence(&mut client.peer, SHORT).await;
}

#[test_timeout::tokio_timeout_test]
async fn replayed_event_sequence_is_ignored() {
    let manager = default_manager();
    let mut client = connect(&manager, "/").await;
    client.peer.send_frame(&click(1, "h2")).unwrap();
    client.peer.send_frame(&click(1, "h2")).unwrap();
    assert_eq!(expect_patch(&mut client.peer).await.seq, 1);
    expect_silence(&mut client.peer, SHORT).await;
    assert!(client.session.render_html().contains("<!--h5-->1"));
}

#[test_timeout::tokio_timeout_test]
async fn unknown_target_reports_handler_not_found() {
    let manager = default_manager();
    let mut client = connect(&manager, "/").await;
    client.peer.send_frame(&click(1, "h404")).unwrap();
    let error = expect_error(&mut client.peer).await;
    assert_eq!(error.code, ErrorCode::HandlerNotFound);
    assert_eq!(error.event_seq, Some(1));
    assert_eq!(client.session.state(), SessionState::Active);
}

#[test_timeout::tokio_timeout_test]
async fn malformed_event_reports_error_and_session_continues() {
    let manager = default_manager();
    let mut client = connect(&manager, "/").await;
    client
        .peer
        .send_frame(&Frame::new(FrameType::Event, Bytes::from_static(b"{not json")))
        .unwrap();
    assert_eq!(expect_error(&mut client.peer).await.code, ErrorCode::MalformedEvent);

    let wrong_payload = EventEnvelope::new(1, "h2", "input").with_data(EventData::None);
    client.peer.send_frame(&wrong_payload.to_frame().unwrap()).unwrap();
    assert_eq!(expect_error(&mut client.peer).await.code, ErrorCode::HandlerNotFound);

    client.peer.send_frame(&click(2, "h2")).unwrap();
    assert_eq!(expect_patch(&mut client.peer).await.seq, 1);
}

#[test_timeout::tokio_timeout_test]
async fn panicking_handler_reports_internal_error_and_session_survives() {
    let manager = default_manager();
    let mut client = connect(&manager, "/fragile").await;

    client.peer.send_frame(&click(1, "h2")).unwrap();
    let error = expect_error(&mut client.peer).await;
    assert_eq!(error.code, ErrorCode::Internal);
    assert_eq!(error.event_seq, Some(1));
    assert!(!error.message.contains("boom"));

    client.peer.send_frame(&click(2, "h4")).unwrap();
    let frame = expect_patch(&mut client.peer).await;
    assert_eq!(frame.patches, vec![Patch::set_text("h7", "1")]);
    assert_eq!(client.session.state(), SessionState::Active);
}

#[test_timeout::tokio_timeout_test]
async fn navigation_swaps_root_and_url_in_one_frame() {
    let manager = default_manager();
    let mut client = connect(&manager, "/").await;
    let navigate = EventEnvelope::new(1, "h1", "navigate").with_data(EventData::Navigate {
        path: "/about/".into(),
    });
    client.peer.send_frame(&navigate.to_frame().unwrap()).unwrap();

    let frame = expect_patch(&mut client.peer).await;
    assert_eq!(frame.seq, 1);
    let ops: Vec<PatchOp> = frame.patches.iter().map(|patch| patch.op).collect();
    assert_eq!(ops, vec![PatchOp::ReplaceNode, PatchOp::UrlPush]);
    assert_eq!(frame.patches[1], Patch::url_push("/about"));
    assert_eq!(client.session.path(), "/about");
}

#[test_timeout::tokio_timeout_test]
async fn internal_paths_are_never_navigated_to() {
    let manager = default_manager();
    let mut client = connect(&manager, "/").await;
    client.session.navigate("/_swell/stats");
    expect_silence(&mut client.peer, SHORT).await;
    assert_eq!(client.session.path(), "/");
}

#[test_timeout::tokio_timeout_test]
async fn dispatched_work_flushes_url_and_hook_updates() {
    let manager = default_manager();
    let mut client = connect(&manager, "/").await;
    client
        .session
        .dispatch(|cx| {
            cx.set_query("tab", Some("settings".into()));
            cx.emit("h1", "saved", &serde_json::json!({"ok": true})).unwrap();
            cx.revert_hook("h2");
        })
        .unwrap();

    let frame = expect_patch(&mut client.peer).await;
    assert_eq!(
        frame.patches,
        vec![
            Patch::url_replace("tab", Some("settings".into())),
            Patch::dispatch_event("h1", "saved", r#"{"ok":true}"#.to_string()),
        ]
    );
    assert_eq!(
        expect_control(&mut client.peer).await,
        ControlMessage::HookRevert { hid: "h2".into() }
    );
}

#[test_timeout::tokio_timeout_test]
async fn ping_is_answered_with_pong() {
    let manager = default_manager();
    let mut client = connect(&manager, "/").await;
    client
        .peer
        .send_frame(&ControlMessage::Ping { ts_ms: 42 }.to_frame().unwrap())
        .unwrap();
    assert_eq!(
        expect_control(&mut client.peer).await,
        ControlMessage::Pong { ts_ms: 42 }
    );
}

#[test_timeout::tokio_timeout_test(10, multi_thread)]
async fn full_queues_reject_work_without_closing() {
    let manager = manager(
        ManagerConfig::default(),
        SessionConfig {
            event_queue_capacity: 1,
            dispatch_queue_capacity: 1,
            ..SessionConfig::default()
        },
    );
    let mut client = connect(&manager, "/").await;
    let started = Arc::new(AtomicBool::new(false));
    let (release, blocked) = std::sync::mpsc::channel::<()>();
    {
        let started = Arc::clone(&started);
        client
            .session
            .dispatch(move |_| {
                started.store(true, Ordering::SeqCst);
                let _ = blocked.recv();
            })
            .unwrap();
    }
    eventually(|| started.load(Ordering::SeqCst)).await;

    client.session.dispatch(|_| {}).unwrap();
    assert_eq!(client.session.dispatch(|_| {}), Err(DispatchError::QueueFull));

    client.peer.send_frame(&click(1, "h2")).unwrap();
    client.peer.send_frame(&click(2, "h2")).unwrap();
    let error = expect_error(&mut client.peer).await;
    assert_eq!(error.code, ErrorCode::QueueFull);
    assert_eq!(error.event_seq, Some(2));

    release.send(()).unwrap();
    let frame = expect_patch(&mut client.peer).await;
    assert_eq!(frame.patches, vec![Patch::set_text("h5", "1")]);
    assert_eq!(client.session.state(), SessionState::Active);
}

#[test_timeout::tokio_timeout_test]
async fn prefetch_warms_cache_for_later_navigation() {
    let manager = default_manager();
    let mut client = connect(&manager, "/").await;
    client
        .peer
        .send_frame(
            &ControlMessage::Prefetch {
                path: "/about".into(),
            }
            .to_frame()
            .unwrap(),
        )
        .unwrap();
    let session = Arc::clone(&client.session);
    eventually(|| session.is_prefetched("/about")).await;

    client.session.navigate("/about");
    let frame = expect_patch(&mut client.peer).await;
    assert_eq!(frame.patches.last(), Some(&Patch::url_push("/about")));
    assert!(!client.session.is_prefetched("/about"));
}

#[test_timeout::tokio_timeout_test]
async fn client_close_ends_the_session() {
    let manager = default_manager();
    let mut client = connect(&manager, "/").await;
    client
        .peer
        .send_frame(&ControlMessage::Close { reason: None }.to_frame().unwrap())
        .unwrap();
    let session = Arc::clone(&client.session);
    eventually(|| session.is_finalized()).await;
    assert_eq!(session.state(), SessionState::Closed);
    assert!(manager.get(session.id()).is_none());
    assert!(client.peer.server_closed());
    assert_eq!(
        expect_control(&mut client.peer).await,
        ControlMessage::Close {
            reason: Some("client_closed".into())
        }
    );
}
