use std::fmt::Write;

use swell_core::WireNode;

/// Attribute carrying an element's hydration id in rendered markup.
pub const HID_ATTR: &str = "data-hid";

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

pub fn render_html(node: &WireNode) -> String {
    let mut out = String::new();
    write_node(node, &mut out);
    out
}

fn write_node(node: &WireNode, out: &mut String) {
    match node {
        WireNode::Text { hid, text } => {
            // Text nodes are addressed through a leading comment marker.
            if let Some(hid) = hid {
                let _ = write!(out, "<!--{hid}-->");
            }
            escape_into(text, false, out);
        }
        WireNode::Element {
            tag,
            hid,
            attrs,
            children,
        } => {
            out.push('<');
            out.push_str(tag);
            if let Some(hid) = hid {
                let _ = write!(out, " {HID_ATTR}=\"{hid}\"");
            }
            for (key, value) in attrs {
                out.push(' ');
                out.push_str(key);
                out.push_str("=\"");
                escape_into(value, true, out);
                out.push('"');
            }
            out.push('>');
            if VOID_ELEMENTS.contains(&tag.as_str()) {
                return;
            }
            for child in children {
                write_node(child, out);
            }
            let _ = write!(out, "</{tag}>");
        }
    }
}

fn escape_into(raw: &str, attribute: bool, out: &mut String) {
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if attribute => out.push_str("&quot;"),
            other => out.push(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn renders_ids_attributes_and_escapes() {
        let node = WireNode::Element {
            tag: "p".into(),
            hid: Some("h1".into()),
            attrs: vec![("title".into(), "a \"quote\"".into())],
            children: vec![
                WireNode::Text {
                    hid: Some("h2".into()),
                    text: "1 < 2 & 3".into(),
                },
                WireNode::Element {
                    tag: "br".into(),
                    hid: Some("h3".into()),
                    attrs: Vec::new(),
                    children: Vec::new(),
                },
            ],
        };
        assert_eq!(
            render_html(&node),
            "<p data-hid=\"h1\" title=\"a &quot;quote&quot;\"><!--h2-->1 &lt; 2 &amp; 3<br data-hid=\"h3\"></p>"
        );
    }
}
