use std::time::Duration;

use swell_core::WireError;
use thiserror::Error;

use crate::auth::AuthError;
use crate::store::StoreError;
use crate::transport::ConnectionError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} is closed")]
    Closed(String),
    #[error("session has no live connection")]
    Detached,
    #[error("no route for path {0}")]
    RouteNotFound(String),
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("session data is not serializable: {0}")]
    Data(#[from] serde_json::Error),
}

/// Failure raised by an adapted handler when the payload does not fit.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("expected {expected} payload")]
    Payload { expected: &'static str },
    #[error("{0}")]
    Rejected(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatch queue is full")]
    QueueFull,
    #[error("session is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("session limit of {0} reached")]
    TooManySessions(usize),
    #[error("no route for path {0}")]
    RouteNotFound(String),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Why a resume attempt could not reattach to the prior session.
#[derive(Debug, Error)]
pub enum ResumeError {
    #[error("session not found")]
    NotFound,
    #[error("resume window elapsed")]
    Expired,
    #[error("principal could not be rehydrated")]
    RehydrateFailed,
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("timed out waiting for client hello")]
    TimedOut,
    #[error("socket closed before hello")]
    SocketClosed,
    #[error("invalid hello frame: {0}")]
    InvalidFrame(String),
    #[error("handshake rejected with {0:?}")]
    Rejected(swell_core::HandshakeStatus),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl HandshakeError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            HandshakeError::TimedOut => "timeout",
            HandshakeError::SocketClosed => "socket_closed",
            HandshakeError::InvalidFrame(_) => "invalid_frame",
            HandshakeError::Rejected(swell_core::HandshakeStatus::NotAuthorized) => "not_authorized",
            HandshakeError::Rejected(swell_core::HandshakeStatus::ServerBusy) => "server_busy",
            HandshakeError::Rejected(_) => "rejected",
            HandshakeError::Connection(_) => "connection",
            HandshakeError::Session(_) => "session",
        }
    }
}
