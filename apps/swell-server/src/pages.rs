//! Demo application mounted by the server: a counter with a step input and an
//! about page reachable through in-session navigation.

use std::sync::Arc;

use swell_runtime::{el, text, Component, EventKind, Handler, RenderCx, RouteTable, VNode};

pub fn routes() -> Arc<RouteTable> {
    Arc::new(
        RouteTable::new()
            .with_route("/", || CounterPage)
            .with_route("/about", || AboutPage),
    )
}

/// Full HTML document around a server-rendered session root.
pub fn document(session_id: &str, body: &str) -> String {
    format!(
        "<!doctype html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n\
         <meta name=\"swell-session\" content=\"{session_id}\">\n\
         <title>swell</title>\n</head>\n<body>\n\
         <div id=\"swell-root\">{body}</div>\n</body>\n</html>\n"
    )
}

struct CounterPage;

impl Component for CounterPage {
    fn render(&self, cx: &mut RenderCx<'_>) -> VNode {
        let count = cx.use_signal(|| 0i64);
        let step = cx.use_signal(|| 1i64);
        let (value, current_step) = (count.get(), step.get());

        let increment = {
            let (count, step) = (count.clone(), step.clone());
            Handler::click(move |_| {
                let by = step.get();
                count.update(|n| *n += by);
            })
        };
        let reset = {
            let count = count.clone();
            Handler::click(move |cx| {
                count.set(0);
                cx.set_query("count", None);
            })
        };
        let set_step = Handler::input(move |_, raw| {
            if let Ok(parsed) = raw.trim().parse::<i64>() {
                step.set(parsed);
            }
        });
        let about = Handler::click(|cx| cx.navigate("/about"));

        el("main")
            .child(el("h1").child(text("Counter")))
            .child(
                el("p")
                    .attr("class", "count")
                    .child(text(value.to_string())),
            )
            .child(
                el("button")
                    .on(EventKind::Click, increment)
                    .child(text(format!("+{current_step}"))),
            )
            .child(el("button").on(EventKind::Click, reset).child(text("reset")))
            .child(
                el("input")
                    .attr("type", "number")
                    .attr("value", current_step.to_string())
                    .on(EventKind::Input, set_step),
            )
            .child(el("a").attr("href", "/about").on(EventKind::Click, about).child(text("about")))
            .into()
    }
}

struct AboutPage;

impl Component for AboutPage {
    fn render(&self, _cx: &mut RenderCx<'_>) -> VNode {
        let home = Handler::click(|cx| cx.navigate("/"));
        el("main")
            .child(el("h1").child(text("About")))
            .child(el("p").child(text("State lives on the server; the browser applies patches.")))
            .child(el("a").attr("href", "/").on(EventKind::Click, home).child(text("back")))
            .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swell_runtime::SessionManager;

    #[test_timeout::tokio_timeout_test]
    async fn counter_page_renders_with_ids() {
        let manager = SessionManager::builder(routes()).build();
        let (session, html) = manager.render_page("/", None).unwrap();
        assert!(html.contains("Counter"));
        assert!(html.contains("data-hid="));
        let page = document(session.id(), &html);
        assert!(page.contains(session.id()));
        assert!(page.starts_with("<!doctype html>"));
        manager.shutdown().await;
    }
}
