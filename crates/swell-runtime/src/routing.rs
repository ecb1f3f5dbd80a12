use std::collections::HashMap;
use std::sync::Arc;

use crate::component::Component;

/// Prefix reserved for the runtime's own endpoints.
pub const INTERNAL_PREFIX: &str = "/_swell/";

/// Maps a canonical path to the root component that renders it.
pub trait Router: Send + Sync {
    fn route(&self, path: &str) -> Option<Box<dyn Component>>;
}

impl<F> Router for F
where
    F: Fn(&str) -> Option<Box<dyn Component>> + Send + Sync,
{
    fn route(&self, path: &str) -> Option<Box<dyn Component>> {
        self(path)
    }
}

type RouteFactory = Arc<dyn Fn() -> Box<dyn Component> + Send + Sync>;

/// Exact-match route table.
#[derive(Default, Clone)]
pub struct RouteTable {
    routes: HashMap<String, RouteFactory>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route<C, F>(mut self, path: &str, factory: F) -> Self
    where
        C: Component,
        F: Fn() -> C + Send + Sync + 'static,
    {
        self.routes.insert(
            canonical_path(path),
            Arc::new(move || Box::new(factory()) as Box<dyn Component>),
        );
        self
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}

impl Router for RouteTable {
    fn route(&self, path: &str) -> Option<Box<dyn Component>> {
        if is_internal_path(path) {
            return None;
        }
        self.routes.get(&canonical_path(path)).map(|factory| factory())
    }
}

pub fn is_internal_path(path: &str) -> bool {
    path.starts_with(INTERNAL_PREFIX) || path == INTERNAL_PREFIX.trim_end_matches('/')
}

/// Normalises a request path: query dropped, duplicate and trailing slashes
/// removed, `.` and `..` segments resolved.
pub fn canonical_path(raw: &str) -> String {
    let path = raw.split(['?', '#']).next().unwrap_or_default();
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return "/".to_string();
    }
    let mut out = String::with_capacity(path.len());
    for segment in segments {
        out.push('/');
        out.push_str(segment);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::RenderCx;
    use crate::tree::{text, VNode};

    struct Page;

    impl Component for Page {
        fn render(&self, _cx: &mut RenderCx<'_>) -> VNode {
            text("page")
        }
    }

    #[test_timeout::timeout]
    fn canonical_paths() {
        assert_eq!(canonical_path(""), "/");
        assert_eq!(canonical_path("/"), "/");
        assert_eq!(canonical_path("/a//b/"), "/a/b");
        assert_eq!(canonical_path("a/./b/../c"), "/a/c");
        assert_eq!(canonical_path("/../.."), "/");
        assert_eq!(canonical_path("/docs/?page=2#top"), "/docs");
    }

    #[test_timeout::timeout]
    fn internal_paths_never_route() {
        let table = RouteTable::new()
            .with_route("/_swell/ws", || Page)
            .with_route("/", || Page);
        assert!(is_internal_path("/_swell/stats"));
        assert!(is_internal_path("/_swell"));
        assert!(!is_internal_path("/_swelling"));
        assert!(table.route("/_swell/ws").is_none());
        assert!(table.route("/").is_some());
        assert!(table.route("//").is_some());
    }
}
