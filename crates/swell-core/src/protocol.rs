use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::patch::Patch;
use crate::wire::{Frame, FrameType, WireError};

pub const PROTOCOL_VERSION: u16 = 1;

fn default_path() -> String {
    "/".to_string()
}

/// First frame a client sends after opening the socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHello {
    pub protocol_version: u16,
    /// Prior session id when the client wants to resume.
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default = "default_path")]
    pub path: String,
    /// Sequence of the last event frame the client emitted.
    #[serde(default)]
    pub last_event_seq: u64,
    /// Sequence of the last patch frame the client applied.
    #[serde(default)]
    pub last_patch_seq: u64,
}

impl ClientHello {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            session_id: None,
            path: path.into(),
            last_event_seq: 0,
            last_patch_seq: 0,
        }
    }

    pub fn resuming(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_sequences(mut self, last_event_seq: u64, last_patch_seq: u64) -> Self {
        self.last_event_seq = last_event_seq;
        self.last_patch_seq = last_patch_seq;
        self
    }

    pub fn to_frame(&self) -> Result<Frame, WireError> {
        Frame::json(FrameType::Hello, self)
    }
}

/// Handshake outcome. Encoded as its numeric code on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum HandshakeStatus {
    Ok,
    NotAuthorized,
    InvalidFormat,
    ServerBusy,
}

impl From<HandshakeStatus> for u8 {
    fn from(status: HandshakeStatus) -> u8 {
        match status {
            HandshakeStatus::Ok => 0,
            HandshakeStatus::NotAuthorized => 1,
            HandshakeStatus::InvalidFormat => 2,
            HandshakeStatus::ServerBusy => 3,
        }
    }
}

impl TryFrom<u8> for HandshakeStatus {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(HandshakeStatus::Ok),
            1 => Ok(HandshakeStatus::NotAuthorized),
            2 => Ok(HandshakeStatus::InvalidFormat),
            3 => Ok(HandshakeStatus::ServerBusy),
            other => Err(format!("unknown handshake status {other}")),
        }
    }
}

/// Reason attached to a `NotAuthorized` handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum AuthReason {
    Unauthenticated,
    Expired,
    Forbidden,
    /// The session had authenticated before but its principal could not be
    /// rehydrated on resume.
    ResumeRehydrateFailed,
}

impl From<AuthReason> for u8 {
    fn from(reason: AuthReason) -> u8 {
        match reason {
            AuthReason::Unauthenticated => 1,
            AuthReason::Expired => 2,
            AuthReason::Forbidden => 3,
            AuthReason::ResumeRehydrateFailed => 4,
        }
    }
}

impl TryFrom<u8> for AuthReason {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(AuthReason::Unauthenticated),
            2 => Ok(AuthReason::Expired),
            3 => Ok(AuthReason::Forbidden),
            4 => Ok(AuthReason::ResumeRehydrateFailed),
            other => Err(format!("unknown auth reason {other}")),
        }
    }
}

/// Client reconnect behaviour advertised on a successful handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    pub resume_window_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHello {
    pub status: HandshakeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<AuthReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub resumed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<ReconnectPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ServerHello {
    pub fn accepted(session_id: impl Into<String>, resumed: bool, reconnect: ReconnectPolicy) -> Self {
        Self {
            status: HandshakeStatus::Ok,
            reason: None,
            session_id: Some(session_id.into()),
            resumed,
            reconnect: Some(reconnect),
            message: None,
        }
    }

    pub fn rejected(status: HandshakeStatus, reason: Option<AuthReason>, message: impl Into<String>) -> Self {
        Self {
            status,
            reason,
            session_id: None,
            resumed: false,
            reconnect: None,
            message: Some(message.into()),
        }
    }

    pub fn to_frame(&self) -> Result<Frame, WireError> {
        Frame::json(FrameType::ServerHello, self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlMessage {
    Ping { ts_ms: u64 },
    Pong { ts_ms: u64 },
    /// Client asks for every frame after `last_seq`.
    Resync { last_seq: u64 },
    Close {
        #[serde(default)]
        reason: Option<String>,
    },
    /// Server tells a client hook to roll back an optimistic change.
    HookRevert { hid: String },
    /// Complete server-rendered markup; the client rebuilds its DOM wholesale.
    ResyncFull { seq: u64, html: String },
    Prefetch { path: String },
}

impl ControlMessage {
    pub fn to_frame(&self) -> Result<Frame, WireError> {
        Frame::json(FrameType::Control, self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    pub seq: u64,
}

impl AckPayload {
    pub fn to_frame(&self) -> Result<Frame, WireError> {
        Frame::json(FrameType::Ack, self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    HandlerNotFound,
    MalformedEvent,
    QueueFull,
    Internal,
    Unauthorized,
    SessionClosed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_seq: Option<u64>,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            event_seq: None,
        }
    }

    pub fn for_event(mut self, seq: u64) -> Self {
        self.event_seq = Some(seq);
        self
    }

    pub fn to_frame(&self) -> Result<Frame, WireError> {
        Frame::json(FrameType::Error, self)
    }
}

/// Structured payload carried by an event frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventData {
    #[default]
    None,
    Text {
        value: String,
    },
    Mouse {
        x: f64,
        y: f64,
        #[serde(default)]
        button: u8,
    },
    Key {
        key: String,
        #[serde(default)]
        ctrl: bool,
        #[serde(default)]
        shift: bool,
        #[serde(default)]
        alt: bool,
        #[serde(default)]
        meta: bool,
    },
    Form {
        fields: BTreeMap<String, String>,
    },
    Hook {
        name: String,
        #[serde(default)]
        detail: serde_json::Value,
    },
    Navigate {
        path: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub seq: u64,
    pub hid: String,
    pub kind: String,
    #[serde(default)]
    pub data: EventData,
}

impl EventEnvelope {
    pub fn new(seq: u64, hid: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            seq,
            hid: hid.into(),
            kind: kind.into(),
            data: EventData::None,
        }
    }

    pub fn with_data(mut self, data: EventData) -> Self {
        self.data = data;
        self
    }

    pub fn to_frame(&self) -> Result<Frame, WireError> {
        Frame::json(FrameType::Event, self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchFrame {
    pub seq: u64,
    pub patches: Vec<Patch>,
}

impl PatchFrame {
    pub fn to_frame(&self) -> Result<Frame, WireError> {
        Frame::json(FrameType::Patches, self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn handshake_status_is_numeric_on_the_wire() {
        let hello = ServerHello::rejected(
            HandshakeStatus::NotAuthorized,
            Some(AuthReason::ResumeRehydrateFailed),
            "resume rejected",
        );
        let json = serde_json::to_value(&hello).unwrap();
        assert_eq!(json["status"], 1);
        assert_eq!(json["reason"], 4);
        let back: ServerHello = serde_json::from_value(json).unwrap();
        assert_eq!(back, hello);
    }

    #[test_timeout::timeout]
    fn unknown_status_code_fails_to_parse() {
        let err = serde_json::from_str::<ServerHello>(r#"{"status":9}"#).unwrap_err();
        assert!(err.to_string().contains("unknown handshake status"));
    }

    #[test_timeout::timeout]
    fn client_hello_defaults_missing_fields() {
        let hello: ClientHello = serde_json::from_str(r#"{"protocol_version":1}"#).unwrap();
        assert_eq!(hello.path, "/");
        assert_eq!(hello.session_id, None);
        assert_eq!(hello.last_patch_seq, 0);
    }

    #[test_timeout::timeout]
    fn control_messages_are_tagged_by_op() {
        let frame = ControlMessage::Resync { last_seq: 7 }.to_frame().unwrap();
        assert_eq!(frame.frame_type, FrameType::Control);
        assert_eq!(frame.payload.as_ref(), br#"{"op":"resync","last_seq":7}"#);
    }
}
