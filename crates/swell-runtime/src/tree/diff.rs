use swell_core::{Patch, WireNode};

use super::VNode;

/// Positional diff of two renders of the same component.
///
/// `new` must already carry ids copied from `old` where shapes match. `expand`
/// turns an inserted or replacing subtree into its wire form.
pub fn diff(old: &VNode, new: &VNode, expand: &dyn Fn(&VNode) -> WireNode, out: &mut Vec<Patch>) {
    let Some(old_hid) = old.hid() else {
        return;
    };
    match (old, new) {
        (VNode::Text(before), VNode::Text(after)) if new.hid() == Some(old_hid) => {
            if before.text != after.text {
                out.push(Patch::set_text(old_hid, after.text.clone()));
            }
        }
        (VNode::Element(before), VNode::Element(after))
            if before.tag == after.tag && new.hid() == Some(old_hid) =>
        {
            diff_attrs(old_hid, &before.attrs, &after.attrs, out);
            let shared = before.children.len().min(after.children.len());
            for index in 0..shared {
                diff(&before.children[index], &after.children[index], expand, out);
            }
            for (index, child) in after.children.iter().enumerate().skip(shared) {
                out.push(Patch::insert_child(old_hid, index as u32, expand(child)));
            }
            for child in before.children[shared..].iter().rev() {
                if let Some(hid) = child.hid() {
                    out.push(Patch::remove_child(old_hid, hid));
                }
            }
        }
        (VNode::Component(before), VNode::Component(after))
            if before.same_component(after) && before.instance == after.instance => {}
        _ => out.push(Patch::replace_node(old_hid, expand(new))),
    }
}

fn diff_attrs(hid: &str, old: &[(String, String)], new: &[(String, String)], out: &mut Vec<Patch>) {
    for (key, value) in new {
        let unchanged = old.iter().any(|(k, v)| k == key && v == value);
        if !unchanged {
            out.push(Patch::set_attr(hid, key.clone(), value.clone()));
        }
    }
    for (key, _) in old {
        if !new.iter().any(|(k, _)| k == key) {
            out.push(Patch::remove_attr(hid, key.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{assign_hids, copy_hids, el, text, to_wire, HidGenerator};
    use swell_core::PatchOp;

    fn rerender(old: &VNode, mut new: VNode, generator: &mut HidGenerator) -> (VNode, Vec<Patch>) {
        copy_hids(old, &mut new);
        assign_hids(&mut new, generator);
        let mut out = Vec::new();
        diff(old, &new, &|node| to_wire(node, &|_| None), &mut out);
        (new, out)
    }

    fn counter(value: u32, extra: bool) -> VNode {
        let mut root = el("div")
            .attr("class", "counter")
            .child(el("span").child(text(value.to_string())));
        if extra {
            root = root.child(el("em").child(text("!")));
        }
        root.into()
    }

    #[test_timeout::timeout]
    fn identical_trees_produce_nothing() {
        let mut generator = HidGenerator::new();
        let mut old = counter(1, false);
        assign_hids(&mut old, &mut generator);
        let (_, patches) = rerender(&old, counter(1, false), &mut generator);
        assert!(patches.is_empty());
    }

    #[test_timeout::timeout]
    fn text_change_is_a_single_set_text() {
        let mut generator = HidGenerator::new();
        let mut old = counter(1, false);
        assign_hids(&mut old, &mut generator);
        let (_, patches) = rerender(&old, counter(2, false), &mut generator);
        assert_eq!(patches, vec![Patch::set_text("h3", "2")]);
    }

    #[test_timeout::timeout]
    fn appended_and_removed_children() {
        let mut generator = HidGenerator::new();
        let mut old = counter(1, false);
        assign_hids(&mut old, &mut generator);

        let (grown, patches) = rerender(&old, counter(1, true), &mut generator);
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].op, PatchOp::InsertChild);
        assert_eq!(patches[0].index, Some(1));

        let (_, patches) = rerender(&grown, counter(1, false), &mut generator);
        assert_eq!(patches, vec![Patch::remove_child("h1", "h4")]);
    }

    #[test_timeout::timeout]
    fn attribute_changes() {
        let mut generator = HidGenerator::new();
        let mut old: VNode = el("a").attr("href", "/a").attr("title", "x").into();
        assign_hids(&mut old, &mut generator);
        let new: VNode = el("a").attr("href", "/b").into();
        let (_, patches) = rerender(&old, new, &mut generator);
        assert_eq!(
            patches,
            vec![
                Patch::set_attr("h1", "href", "/b"),
                Patch::remove_attr("h1", "title"),
            ]
        );
    }

    #[test_timeout::timeout]
    fn tag_change_replaces_subtree() {
        let mut generator = HidGenerator::new();
        let mut old: VNode = el("div").child(el("p").child(text("a"))).into();
        assign_hids(&mut old, &mut generator);
        let new: VNode = el("div").child(el("section").child(text("a"))).into();
        let (_, patches) = rerender(&old, new, &mut generator);
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].op, PatchOp::ReplaceNode);
        assert_eq!(patches[0].hid, "h2");
    }
}
