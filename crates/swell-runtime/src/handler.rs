use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use swell_core::{EventData, EventEnvelope};

use crate::error::HandlerError;
use crate::reactive::ComponentId;
use crate::session::EventCx;

/// Normalised event name used to key the handler registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Click,
    DoubleClick,
    Input,
    Change,
    Submit,
    KeyDown,
    KeyUp,
    MouseDown,
    MouseUp,
    MouseMove,
    Focus,
    Blur,
    /// Client hook traffic; every hook handler on an element receives it.
    Hook,
    Navigate,
    Custom(String),
}

impl EventKind {
    /// Accepts DOM spellings such as `onClick`, `dblclick` or ` KEYDOWN `.
    pub fn parse(raw: &str) -> Self {
        let lowered = raw.trim().to_ascii_lowercase();
        let name = lowered
            .strip_prefix("on")
            .filter(|rest| !rest.is_empty())
            .unwrap_or(&lowered);
        match name {
            "click" => EventKind::Click,
            "dblclick" | "doubleclick" => EventKind::DoubleClick,
            "input" => EventKind::Input,
            "change" => EventKind::Change,
            "submit" => EventKind::Submit,
            "keydown" => EventKind::KeyDown,
            "keyup" => EventKind::KeyUp,
            "mousedown" => EventKind::MouseDown,
            "mouseup" => EventKind::MouseUp,
            "mousemove" => EventKind::MouseMove,
            "focus" => EventKind::Focus,
            "blur" => EventKind::Blur,
            "hook" => EventKind::Hook,
            "navigate" => EventKind::Navigate,
            other => EventKind::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Click => "click",
            EventKind::DoubleClick => "dblclick",
            EventKind::Input => "input",
            EventKind::Change => "change",
            EventKind::Submit => "submit",
            EventKind::KeyDown => "keydown",
            EventKind::KeyUp => "keyup",
            EventKind::MouseDown => "mousedown",
            EventKind::MouseUp => "mouseup",
            EventKind::MouseMove => "mousemove",
            EventKind::Focus => "focus",
            EventKind::Blur => "blur",
            EventKind::Hook => "hook",
            EventKind::Navigate => "navigate",
            EventKind::Custom(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MouseEvent {
    pub x: f64,
    pub y: f64,
    pub button: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: String,
    pub ctrl: bool,
    pub shift: bool,
    pub alt: bool,
    pub meta: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HookEvent {
    pub name: String,
    pub detail: serde_json::Value,
}

/// Uniform shape every handler variant is adapted to.
pub type EventFn = Arc<dyn Fn(&EventCx, &EventEnvelope) -> Result<(), HandlerError> + Send + Sync>;

/// Handler shapes offered to component authors.
#[derive(Clone)]
pub enum Handler {
    Click(Arc<dyn Fn(&EventCx) + Send + Sync>),
    Input(Arc<dyn Fn(&EventCx, String) + Send + Sync>),
    Mouse(Arc<dyn Fn(&EventCx, MouseEvent) + Send + Sync>),
    Keyboard(Arc<dyn Fn(&EventCx, KeyEvent) + Send + Sync>),
    Form(Arc<dyn Fn(&EventCx, BTreeMap<String, String>) + Send + Sync>),
    Hook(Arc<dyn Fn(&EventCx, HookEvent) + Send + Sync>),
    Navigate(Arc<dyn Fn(&EventCx, String) + Send + Sync>),
    Raw(EventFn),
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Handler::Click(_) => "Handler::Click",
            Handler::Input(_) => "Handler::Input",
            Handler::Mouse(_) => "Handler::Mouse",
            Handler::Keyboard(_) => "Handler::Keyboard",
            Handler::Form(_) => "Handler::Form",
            Handler::Hook(_) => "Handler::Hook",
            Handler::Navigate(_) => "Handler::Navigate",
            Handler::Raw(_) => "Handler::Raw",
        })
    }
}

impl Handler {
    pub fn click(f: impl Fn(&EventCx) + Send + Sync + 'static) -> Self {
        Handler::Click(Arc::new(f))
    }

    pub fn input(f: impl Fn(&EventCx, String) + Send + Sync + 'static) -> Self {
        Handler::Input(Arc::new(f))
    }

    pub fn mouse(f: impl Fn(&EventCx, MouseEvent) + Send + Sync + 'static) -> Self {
        Handler::Mouse(Arc::new(f))
    }

    pub fn keyboard(f: impl Fn(&EventCx, KeyEvent) + Send + Sync + 'static) -> Self {
        Handler::Keyboard(Arc::new(f))
    }

    pub fn form(f: impl Fn(&EventCx, BTreeMap<String, String>) + Send + Sync + 'static) -> Self {
        Handler::Form(Arc::new(f))
    }

    pub fn hook(f: impl Fn(&EventCx, HookEvent) + Send + Sync + 'static) -> Self {
        Handler::Hook(Arc::new(f))
    }

    pub fn navigate(f: impl Fn(&EventCx, String) + Send + Sync + 'static) -> Self {
        Handler::Navigate(Arc::new(f))
    }

    pub fn raw(
        f: impl Fn(&EventCx, &EventEnvelope) -> Result<(), HandlerError> + Send + Sync + 'static,
    ) -> Self {
        Handler::Raw(Arc::new(f))
    }

    /// Wraps the variant so it can be invoked with any incoming envelope.
    pub fn adapt(self) -> EventFn {
        match self {
            Handler::Click(f) => Arc::new(move |cx, _| {
                f(cx);
                Ok(())
            }),
            Handler::Input(f) => Arc::new(move |cx, event| match &event.data {
                EventData::Text { value } => {
                    f(cx, value.clone());
                    Ok(())
                }
                _ => Err(HandlerError::Payload { expected: "text" }),
            }),
            Handler::Mouse(f) => Arc::new(move |cx, event| match &event.data {
                EventData::Mouse { x, y, button } => {
                    f(
                        cx,
                        MouseEvent {
                            x: *x,
                            y: *y,
                            button: *button,
                        },
                    );
                    Ok(())
                }
                _ => Err(HandlerError::Payload { expected: "mouse" }),
            }),
            Handler::Keyboard(f) => Arc::new(move |cx, event| match &event.data {
                EventData::Key {
                    key,
                    ctrl,
                    shift,
                    alt,
                    meta,
                } => {
                    f(
                        cx,
                        KeyEvent {
                            key: key.clone(),
                            ctrl: *ctrl,
                            shift: *shift,
                            alt: *alt,
                            meta: *meta,
                        },
                    );
                    Ok(())
                }
                _ => Err(HandlerError::Payload { expected: "key" }),
            }),
            Handler::Form(f) => Arc::new(move |cx, event| match &event.data {
                EventData::Form { fields } => {
                    f(cx, fields.clone());
                    Ok(())
                }
                _ => Err(HandlerError::Payload { expected: "form" }),
            }),
            Handler::Hook(f) => Arc::new(move |cx, event| match &event.data {
                EventData::Hook { name, detail } => {
                    f(
                        cx,
                        HookEvent {
                            name: name.clone(),
                            detail: detail.clone(),
                        },
                    );
                    Ok(())
                }
                _ => Err(HandlerError::Payload { expected: "hook" }),
            }),
            Handler::Navigate(f) => Arc::new(move |cx, event| match &event.data {
                EventData::Navigate { path } => {
                    f(cx, path.clone());
                    Ok(())
                }
                _ => Err(HandlerError::Payload { expected: "navigate" }),
            }),
            Handler::Raw(f) => f,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct HandlerKey {
    hid: String,
    kind: EventKind,
}

#[derive(Clone)]
struct Registered {
    owner: ComponentId,
    f: EventFn,
}

/// `(hid, kind)` lookup table rebuilt from each render.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: HashMap<HandlerKey, Vec<Registered>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn register(&mut self, owner: ComponentId, hid: &str, kind: EventKind, handler: Handler) {
        let key = HandlerKey {
            hid: hid.to_string(),
            kind,
        };
        let merge = key.kind == EventKind::Hook;
        let slot = self.entries.entry(key).or_default();
        if !merge {
            slot.clear();
        }
        slot.push(Registered {
            owner,
            f: handler.adapt(),
        });
    }

    pub fn remove_owner(&mut self, owner: ComponentId) {
        self.entries.retain(|_, slot| {
            slot.retain(|registered| registered.owner != owner);
            !slot.is_empty()
        });
    }

    pub fn lookup(&self, hid: &str, kind: &EventKind) -> Option<Vec<EventFn>> {
        let key = HandlerKey {
            hid: hid.to_string(),
            kind: kind.clone(),
        };
        self.entries
            .get(&key)
            .map(|slot| slot.iter().map(|registered| Arc::clone(&registered.f)).collect())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
