use serde::{Deserialize, Serialize};

/// Serializable view of a rendered node. Handlers never cross the wire, only
/// the hydration ids that let the client route events back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum WireNode {
    Element {
        tag: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hid: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attrs: Vec<(String, String)>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        children: Vec<WireNode>,
    },
    Text {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hid: Option<String>,
        text: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchOp {
    SetText,
    SetAttr,
    RemoveAttr,
    InsertChild,
    RemoveChild,
    ReplaceNode,
    UrlPush,
    UrlReplace,
    DispatchEvent,
}

/// One incremental mutation instruction addressed to a hydration id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub op: PatchOp,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<WireNode>,
}

impl Patch {
    fn bare(op: PatchOp, hid: impl Into<String>) -> Self {
        Self {
            op,
            hid: hid.into(),
            key: None,
            value: None,
            index: None,
            parent: None,
            node: None,
        }
    }

    pub fn set_text(hid: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            value: Some(text.into()),
            ..Self::bare(PatchOp::SetText, hid)
        }
    }

    pub fn set_attr(hid: impl Into<String>, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            value: Some(value.into()),
            ..Self::bare(PatchOp::SetAttr, hid)
        }
    }

    pub fn remove_attr(hid: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::bare(PatchOp::RemoveAttr, hid)
        }
    }

    pub fn insert_child(parent: impl Into<String>, index: u32, node: WireNode) -> Self {
        let parent = parent.into();
        Self {
            index: Some(index),
            parent: Some(parent.clone()),
            node: Some(node),
            ..Self::bare(PatchOp::InsertChild, parent)
        }
    }

    pub fn remove_child(parent: impl Into<String>, hid: impl Into<String>) -> Self {
        Self {
            parent: Some(parent.into()),
            ..Self::bare(PatchOp::RemoveChild, hid)
        }
    }

    pub fn replace_node(hid: impl Into<String>, node: WireNode) -> Self {
        Self {
            node: Some(node),
            ..Self::bare(PatchOp::ReplaceNode, hid)
        }
    }

    pub fn url_push(path: impl Into<String>) -> Self {
        Self {
            value: Some(path.into()),
            ..Self::bare(PatchOp::UrlPush, String::new())
        }
    }

    pub fn url_replace(key: impl Into<String>, value: Option<String>) -> Self {
        Self {
            key: Some(key.into()),
            value,
            ..Self::bare(PatchOp::UrlReplace, String::new())
        }
    }

    pub fn dispatch_event(hid: impl Into<String>, name: impl Into<String>, detail: String) -> Self {
        Self {
            key: Some(name.into()),
            value: Some(detail),
            ..Self::bare(PatchOp::DispatchEvent, hid)
        }
    }

    pub fn is_url_patch(&self) -> bool {
        matches!(self.op, PatchOp::UrlPush | PatchOp::UrlReplace)
    }
}
