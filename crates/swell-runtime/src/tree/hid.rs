use super::VNode;

/// Sequential hydration id source. Reset it and re-render in the same order to
/// reproduce the ids a fresh page render produced.
#[derive(Debug, Default, Clone)]
pub struct HidGenerator {
    issued: u64,
}

impl HidGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_hid(&mut self) -> String {
        self.issued += 1;
        format!("h{}", self.issued)
    }

    pub fn issued(&self) -> u64 {
        self.issued
    }

    pub fn reset(&mut self) {
        self.issued = 0;
    }
}

/// Gives every node without an id a fresh one, parents before children.
pub fn assign_hids(node: &mut VNode, generator: &mut HidGenerator) {
    if node.hid().is_none() {
        node.set_hid(Some(generator.next_hid()));
    }
    if let VNode::Element(element) = node {
        for child in element.children.iter_mut() {
            assign_hids(child, generator);
        }
    }
}

pub fn clear_hids(node: &mut VNode) {
    node.set_hid(None);
    if let VNode::Element(element) = node {
        for child in element.children.iter_mut() {
            clear_hids(child);
        }
    }
}

/// Carries ids over from `old` wherever `new` keeps the same shape at the same
/// position, so unchanged nodes stay addressable across renders.
pub fn copy_hids(old: &VNode, new: &mut VNode) {
    match (old, new) {
        (VNode::Element(old), VNode::Element(new)) if old.tag == new.tag => {
            new.hid = old.hid.clone();
            for (old_child, new_child) in old.children.iter().zip(new.children.iter_mut()) {
                copy_hids(old_child, new_child);
            }
        }
        (VNode::Text(old), VNode::Text(new)) => new.hid = old.hid.clone(),
        (VNode::Component(old), VNode::Component(new)) if old.same_component(new) => {
            new.hid = old.hid.clone();
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{el, text};

    fn sample() -> VNode {
        el("ul")
            .child(el("li").child(text("one")))
            .child(el("li").child(text("two")))
            .into()
    }

    fn ids(node: &VNode, out: &mut Vec<String>) {
        out.push(node.hid().unwrap_or("-").to_string());
        if let VNode::Element(element) = node {
            for child in &element.children {
                ids(child, out);
            }
        }
    }

    #[test_timeout::timeout]
    fn assignment_is_preorder_and_reproducible() {
        let mut generator = HidGenerator::new();
        let mut first = sample();
        assign_hids(&mut first, &mut generator);
        let mut seen = Vec::new();
        ids(&first, &mut seen);
        assert_eq!(seen, vec!["h1", "h2", "h3", "h4", "h5"]);

        generator.reset();
        let mut second = sample();
        assign_hids(&mut second, &mut generator);
        let mut again = Vec::new();
        ids(&second, &mut again);
        assert_eq!(seen, again);
    }

    #[test_timeout::timeout]
    fn copy_keeps_matching_positions_only() {
        let mut generator = HidGenerator::new();
        let mut old = sample();
        assign_hids(&mut old, &mut generator);

        let mut new: VNode = el("ul")
            .child(el("li").child(text("uno")))
            .child(el("p"))
            .child(el("li"))
            .into();
        copy_hids(&old, &mut new);
        assign_hids(&mut new, &mut generator);

        let mut seen = Vec::new();
        ids(&new, &mut seen);
        assert_eq!(seen, vec!["h1", "h2", "h3", "h6", "h7"]);
    }

    #[test_timeout::timeout]
    fn clear_removes_every_id() {
        let mut node = sample();
        assign_hids(&mut node, &mut HidGenerator::new());
        clear_hids(&mut node);
        let mut seen = Vec::new();
        ids(&node, &mut seen);
        assert!(seen.iter().all(|id| id == "-"));
    }
}
