use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

const WIRE_VERSION: u8 = 1;
const VERSION_BITS: u8 = 3;
const VERSION_MASK: u8 = 0b1110_0000;
const TYPE_MASK: u8 = 0b0001_1111;

/// Upper bound for a single frame payload. Anything larger is treated as a
/// malformed frame rather than allocated.
pub const MAX_PAYLOAD_BYTES: usize = 4 * 1024 * 1024;

const KIND_HELLO: u8 = 0;
const KIND_SERVER_HELLO: u8 = 1;
const KIND_EVENT: u8 = 2;
const KIND_CONTROL: u8 = 3;
const KIND_PATCHES: u8 = 4;
const KIND_ACK: u8 = 5;
const KIND_ERROR: u8 = 6;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("invalid wire version: {0}")]
    InvalidVersion(u8),
    #[error("unknown frame type: {0}")]
    UnknownFrameType(u8),
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("varint overflow")]
    VarIntOverflow,
    #[error("payload too large: {0}")]
    PayloadTooLarge(u64),
    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Hello,
    ServerHello,
    Event,
    Control,
    Patches,
    Ack,
    Error,
}

impl FrameType {
    pub fn as_u8(self) -> u8 {
        match self {
            FrameType::Hello => KIND_HELLO,
            FrameType::ServerHello => KIND_SERVER_HELLO,
            FrameType::Event => KIND_EVENT,
            FrameType::Control => KIND_CONTROL,
            FrameType::Patches => KIND_PATCHES,
            FrameType::Ack => KIND_ACK,
            FrameType::Error => KIND_ERROR,
        }
    }

    pub fn from_u8(kind: u8) -> Result<Self, WireError> {
        match kind {
            KIND_HELLO => Ok(FrameType::Hello),
            KIND_SERVER_HELLO => Ok(FrameType::ServerHello),
            KIND_EVENT => Ok(FrameType::Event),
            KIND_CONTROL => Ok(FrameType::Control),
            KIND_PATCHES => Ok(FrameType::Patches),
            KIND_ACK => Ok(FrameType::Ack),
            KIND_ERROR => Ok(FrameType::Error),
            other => Err(WireError::UnknownFrameType(other)),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FrameType::Hello => "hello",
            FrameType::ServerHello => "server_hello",
            FrameType::Event => "event",
            FrameType::Control => "control",
            FrameType::Patches => "patches",
            FrameType::Ack => "ack",
            FrameType::Error => "error",
        }
    }
}

/// A single protocol frame: a one byte header (3 bit version, 5 bit type), a
/// varint payload length and the payload itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type,
            payload: payload.into(),
        }
    }

    /// Builds a frame whose payload is the JSON encoding of `value`.
    pub fn json<T: Serialize>(frame_type: FrameType, value: &T) -> Result<Self, WireError> {
        let payload =
            serde_json::to_vec(value).map_err(|err| WireError::InvalidPayload(err.to_string()))?;
        Ok(Self::new(frame_type, payload))
    }

    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, WireError> {
        serde_json::from_slice(&self.payload).map_err(|err| WireError::InvalidPayload(err.to_string()))
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::with_capacity(self.payload.len() + 6);
        write_header(&mut buf, self.frame_type.as_u8());
        write_var_u64(&mut buf, self.payload.len() as u64);
        buf.extend_from_slice(&self.payload);
        Bytes::from(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut cursor = Cursor::new(bytes);
        let kind = read_header(&mut cursor)?;
        let frame_type = FrameType::from_u8(kind)?;
        let len = cursor.read_var_u64()?;
        if len > MAX_PAYLOAD_BYTES as u64 {
            return Err(WireError::PayloadTooLarge(len));
        }
        let payload = cursor.read_slice(len as usize)?;
        let trailing = cursor.remaining();
        if trailing != 0 {
            return Err(WireError::TrailingBytes(trailing));
        }
        Ok(Self {
            frame_type,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

fn write_header(buf: &mut Vec<u8>, kind: u8) {
    let version = WIRE_VERSION & ((1 << VERSION_BITS) - 1);
    buf.push((version << 5) | (kind & TYPE_MASK));
}

fn read_header(cursor: &mut Cursor<'_>) -> Result<u8, WireError> {
    let byte = cursor.read_u8()?;
    let version = (byte & VERSION_MASK) >> 5;
    if version != (WIRE_VERSION & ((1 << VERSION_BITS) - 1)) {
        return Err(WireError::InvalidVersion(version));
    }
    Ok(byte & TYPE_MASK)
}

fn write_var_u64(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, WireError> {
        let value = *self.bytes.get(self.pos).ok_or(WireError::UnexpectedEof)?;
        self.pos += 1;
        Ok(value)
    }

    fn read_var_u64(&mut self) -> Result<u64, WireError> {
        let mut result: u64 = 0;
        let mut shift = 0;
        while shift < 64 {
            let byte = self.read_u8()?;
            result |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(WireError::VarIntOverflow)
    }

    fn read_slice(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos.checked_add(len).ok_or(WireError::UnexpectedEof)?;
        let slice = self.bytes.get(self.pos..end).ok_or(WireError::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }
}
