//! Wire-level primitives for the swell live UI protocol.
//!
//! The server runtime and any client implementation share these shapes so the
//! handshake, frame envelope and patch vocabulary never drift between crates.

pub mod patch;
pub mod protocol;
pub mod wire;

pub use patch::{Patch, PatchOp, WireNode};
pub use protocol::{
    AckPayload, AuthReason, ClientHello, ControlMessage, ErrorCode, ErrorPayload, EventData,
    EventEnvelope, HandshakeStatus, PatchFrame, ReconnectPolicy, ServerHello, PROTOCOL_VERSION,
};
pub use wire::{Frame, FrameType, WireError};
