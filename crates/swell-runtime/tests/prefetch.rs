mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use swell_core::{Patch, PatchOp};
use swell_runtime::{
    el, text, Component, EventKind, Handler, PrefetchConfig, PrefetchPool, RenderCx, RouteTable,
    SessionConfig, SessionManager, SessionState, VNode,
};

const SLOW_RENDER: Duration = Duration::from_millis(400);

/// Same shape as `Counter`, counting how often it renders.
struct Tracked {
    renders: Arc<AtomicUsize>,
}

impl Component for Tracked {
    fn render(&self, cx: &mut RenderCx<'_>) -> VNode {
        self.renders.fetch_add(1, Ordering::SeqCst);
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

struct Slow {
    finished: Arc<AtomicBool>,
}

impl Component for Slow {
    fn render(&self, _cx: &mut RenderCx<'_>) -> VNode {
        std::thread::sleep(SLOW_RENDER);
        self.finished.store(true, Ordering::SeqCst);
        el("p").child(text("slow")).into()
    }
}

struct Boom {
    entered: Arc<AtomicBool>,
}

impl Component for Boom {
    fn render(&self, _cx: &mut RenderCx<'_>) -> VNode {
        self.entered.store(true, Ordering::SeqCst);
        panic!("render exploded");
    }
}

#[derive(Default, Clone)]
struct RenderMarks {
    renders: Arc<AtomicUsize>,
    finished: Arc<AtomicBool>,
    entered: Arc<AtomicBool>,
}

fn prefetch_manager(pool: &PrefetchPool, marks: &RenderMarks) -> SessionManager {
    let routes = {
        let (renders, finished, entered) = (
            Arc::clone(&marks.renders),
            Arc::clone(&marks.finished),
            Arc::clone(&marks.entered),
        );
        RouteTable::new()
            .with_route("/", || Counter)
            .with_route("/tracked", move || Tracked {
                renders: Arc::clone(&renders),
            })
            .with_route("/slow", move || Slow {
                finished: Arc::clone(&finished),
            })
            .with_route("/boom", move || Boom {
                entered: Arc::clone(&entered),
            })
    };
    SessionManager::builder(Arc::new(routes))
        .session_config(SessionConfig {
            prefetch: PrefetchConfig {
                render_timeout: Duration::from_millis(50),
                ..PrefetchConfig::default()
            },
            ..SessionConfig::default()
        })
        .prefetch_pool(pool.clone())
        .build()
}

#[test_timeout::tokio_timeout_test]
async fn navigation_adopts_the_prefetched_render() {
    let pool = PrefetchPool::new(4);
    let marks = RenderMarks::default();
    let manager = prefetch_manager(&pool, &marks);
    let mut client = connect(&manager, "/").await;
    let session = Arc::clone(&client.session);

    session.prefetch("/tracked");
    eventually(|| session.is_prefetched("/tracked")).await;
    assert_eq!(marks.renders.load(Ordering::SeqCst), 1);

    session.navigate("/tracked");
    let frame = expect_patch(&mut client.peer).await;
    assert_eq!(frame.seq, 1);
    assert_eq!(frame.patches.len(), 2);
    assert_eq!(frame.patches[0].op, PatchOp::ReplaceNode);
    assert_eq!(frame.patches[0].hid, "h1");
    assert_eq!(frame.patches[1], Patch::url_push("/tracked"));
    assert_eq!(marks.renders.load(Ordering::SeqCst), 1, "navigation must not render again");
    assert!(!session.is_prefetched("/tracked"));
    assert_eq!(session.path(), "/tracked");

    client.peer.send_frame(&click(1, "h2")).unwrap();
    let frame = expect_patch(&mut client.peer).await;
    assert_eq!(frame.seq, 2);
    assert_eq!(frame.patches, vec![Patch::set_text("h5", "1")]);
    assert_eq!(marks.renders.load(Ordering::SeqCst), 2);
}

#[test_timeout::tokio_timeout_test]
async fn timed_out_prefetch_keeps_its_permit_until_the_render_ends() {
    let pool = PrefetchPool::new(1);
    let marks = RenderMarks::default();
    let manager = prefetch_manager(&pool, &marks);
    let client = connect(&manager, "/").await;
    let session = Arc::clone(&client.session);

    session.prefetch("/slow");
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!marks.finished.load(Ordering::SeqCst));
    assert_eq!(pool.available(), 0, "the running render still holds the global permit");
    assert!(!session.is_prefetched("/slow"));

    session.prefetch("/tracked");
    tokio::time::sleep(SHORT).await;
    assert!(!session.is_prefetched("/tracked"));
    assert_eq!(marks.renders.load(Ordering::SeqCst), 0);

    eventually(|| marks.finished.load(Ordering::SeqCst)).await;
    eventually(|| pool.available() == 1).await;
    tokio::time::sleep(SHORT).await;
    assert!(!session.is_prefetched("/slow"), "late results are discarded");
    assert_eq!(session.state(), SessionState::Active);
}

#[test_timeout::tokio_timeout_test]
async fn panicking_prefetch_is_discarded_and_frees_its_permit() {
    let pool = PrefetchPool::new(1);
    let marks = RenderMarks::default();
    let manager = prefetch_manager(&pool, &marks);
    let client = connect(&manager, "/").await;
    let session = Arc::clone(&client.session);

    session.prefetch("/boom");
    eventually(|| marks.entered.load(Ordering::SeqCst)).await;
    eventually(|| pool.available() == 1).await;
    tokio::time::sleep(SHORT).await;
    assert!(!session.is_prefetched("/boom"));
    assert_eq!(session.state(), SessionState::Active);

    session.prefetch("/tracked");
    eventually(|| session.is_prefetched("/tracked")).await;
}
