//! Virtual nodes produced by component renders and the helpers that turn them
//! into hydration ids, patches and markup.

pub mod diff;
pub mod hid;
pub mod html;

use std::fmt;
use std::sync::Arc;

use swell_core::WireNode;

use crate::component::Component;
use crate::handler::{EventKind, Handler};
use crate::reactive::ComponentId;

pub use diff::diff;
pub use hid::{assign_hids, clear_hids, copy_hids, HidGenerator};
pub use html::render_html;

/// Tag of the element that stands in for a nested component on the client.
pub const ISLAND_TAG: &str = "swell-island";

pub type ComponentFactory = Arc<dyn Fn() -> Box<dyn Component> + Send + Sync>;

#[derive(Clone, Debug)]
pub enum VNode {
    Element(Element),
    Text(Text),
    Component(ComponentNode),
}

#[derive(Clone)]
pub struct Element {
    pub tag: String,
    pub hid: Option<String>,
    pub attrs: Vec<(String, String)>,
    pub handlers: Vec<(EventKind, Handler)>,
    pub children: Vec<VNode>,
}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Element")
            .field("tag", &self.tag)
            .field("hid", &self.hid)
            .field("attrs", &self.attrs)
            .field("handlers", &self.handlers.len())
            .field("children", &self.children)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Text {
    pub hid: Option<String>,
    pub text: String,
}

/// Placeholder for a child component inside its parent's tree.
#[derive(Clone)]
pub struct ComponentNode {
    pub type_key: &'static str,
    pub key: Option<String>,
    pub hid: Option<String>,
    /// Filled in when the parent reconciles its children.
    pub instance: Option<ComponentId>,
    factory: ComponentFactory,
}

impl fmt::Debug for ComponentNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentNode")
            .field("type_key", &self.type_key)
            .field("key", &self.key)
            .field("hid", &self.hid)
            .field("instance", &self.instance)
            .finish()
    }
}

pub fn el(tag: impl Into<String>) -> Element {
    Element {
        tag: tag.into(),
        hid: None,
        attrs: Vec::new(),
        handlers: Vec::new(),
        children: Vec::new(),
    }
}

pub fn text(value: impl Into<String>) -> VNode {
    VNode::Text(Text {
        hid: None,
        text: value.into(),
    })
}

pub fn component<C, F>(factory: F) -> ComponentNode
where
    C: Component,
    F: Fn() -> C + Send + Sync + 'static,
{
    ComponentNode {
        type_key: std::any::type_name::<C>(),
        key: None,
        hid: None,
        instance: None,
        factory: Arc::new(move || Box::new(factory()) as Box<dyn Component>),
    }
}

impl Element {
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.push((key.into(), value.into()));
        self
    }

    pub fn on(mut self, kind: EventKind, handler: Handler) -> Self {
        self.handlers.push((kind, handler));
        self
    }

    pub fn child(mut self, child: impl Into<VNode>) -> Self {
        self.children.push(child.into());
        self
    }

    pub fn children<I, N>(mut self, children: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<VNode>,
    {
        self.children.extend(children.into_iter().map(Into::into));
        self
    }
}

impl ComponentNode {
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn instantiate(&self) -> Box<dyn Component> {
        (self.factory)()
    }

    pub fn same_component(&self, other: &ComponentNode) -> bool {
        self.type_key == other.type_key && self.key == other.key
    }
}

impl From<Element> for VNode {
    fn from(element: Element) -> Self {
        VNode::Element(element)
    }
}

impl From<ComponentNode> for VNode {
    fn from(node: ComponentNode) -> Self {
        VNode::Component(node)
    }
}

impl From<&str> for VNode {
    fn from(value: &str) -> Self {
        text(value)
    }
}

impl From<String> for VNode {
    fn from(value: String) -> Self {
        text(value)
    }
}

impl VNode {
    pub fn hid(&self) -> Option<&str> {
        match self {
            VNode::Element(element) => element.hid.as_deref(),
            VNode::Text(text) => text.hid.as_deref(),
            VNode::Component(node) => node.hid.as_deref(),
        }
    }

    pub fn set_hid(&mut self, hid: Option<String>) {
        match self {
            VNode::Element(element) => element.hid = hid,
            VNode::Text(text) => text.hid = hid,
            VNode::Component(node) => node.hid = hid,
        }
    }

    /// Component placeholders in pre-order.
    pub fn markers_mut(&mut self) -> Vec<&mut ComponentNode> {
        let mut out = Vec::new();
        collect_markers(self, &mut out);
        out
    }

    /// Every element carrying handlers, paired with its hid, in pre-order.
    pub fn handler_sites(&self) -> Vec<(&str, &[(EventKind, Handler)])> {
        let mut out = Vec::new();
        collect_handlers(self, &mut out);
        out
    }
}

fn collect_markers<'a>(node: &'a mut VNode, out: &mut Vec<&'a mut ComponentNode>) {
    match node {
        VNode::Component(marker) => out.push(marker),
        VNode::Element(element) => {
            for child in element.children.iter_mut() {
                collect_markers(child, out);
            }
        }
        VNode::Text(_) => {}
    }
}

fn collect_handlers<'a>(node: &'a VNode, out: &mut Vec<(&'a str, &'a [(EventKind, Handler)])>) {
    if let VNode::Element(element) = node {
        if let Some(hid) = element.hid.as_deref() {
            if !element.handlers.is_empty() {
                out.push((hid, element.handlers.as_slice()));
            }
        }
        for child in &element.children {
            collect_handlers(child, out);
        }
    }
}

/// Converts a tree to its wire form, splicing in child component trees.
pub fn to_wire(node: &VNode, resolve: &dyn Fn(ComponentId) -> Option<WireNode>) -> WireNode {
    match node {
        VNode::Element(element) => WireNode::Element {
            tag: element.tag.clone(),
            hid: element.hid.clone(),
            attrs: element.attrs.clone(),
            children: element
                .children
                .iter()
                .map(|child| to_wire(child, resolve))
                .collect(),
        },
        VNode::Text(text) => WireNode::Text {
            hid: text.hid.clone(),
            text: text.text.clone(),
        },
        VNode::Component(marker) => WireNode::Element {
            tag: ISLAND_TAG.to_string(),
            hid: marker.hid.clone(),
            attrs: Vec::new(),
            children: marker.instance.and_then(resolve).into_iter().collect(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::RenderCx;

    struct Leaf;

    impl Component for Leaf {
        fn render(&self, _cx: &mut RenderCx<'_>) -> VNode {
            text("leaf")
        }
    }

    #[test_timeout::timeout]
    fn markers_are_found_in_preorder() {
        let mut tree: VNode = el("div")
            .child(component(|| Leaf).key("a"))
            .child(el("span").child(component(|| Leaf).key("b")))
            .child(component(|| Leaf).key("c"))
            .into();
        let keys: Vec<_> = tree
            .markers_mut()
            .into_iter()
            .map(|marker| marker.key.clone().unwrap())
            .collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test_timeout::timeout]
    fn islands_splice_resolved_children() {
        let mut marker = component(|| Leaf);
        marker.hid = Some("h2".into());
        marker.instance = Some(ComponentId(7));
        let tree: VNode = el("main").child(marker).into();
        let wire = to_wire(&tree, &|id| {
            (id == ComponentId(7)).then(|| WireNode::Text {
                hid: Some("h3".into()),
                text: "inner".into(),
            })
        });
        let WireNode::Element { children, .. } = wire else {
            panic!("expected element");
        };
        let WireNode::Element { tag, children, .. } = &children[0] else {
            panic!("expected island");
        };
        assert_eq!(tag, ISLAND_TAG);
        assert_eq!(children.len(), 1);
    }
}
