//! Message-oriented connection abstraction the session reads from and writes
//! to, plus an in-process pair used by tests and embedded clients.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use swell_core::{Frame, WireError};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
}

/// One live client socket. Each message is one encoded frame.
#[async_trait]
pub trait Connection: Send + Sync {
    /// `Ok(None)` means the peer closed the stream cleanly.
    async fn recv(&self) -> Result<Option<Bytes>, ConnectionError>;

    async fn send(&self, frame: Bytes) -> Result<(), ConnectionError>;

    /// Best effort; never fails.
    async fn close(&self);

    fn peer(&self) -> String {
        "unknown".to_string()
    }
}

/// Server half of an in-process connection.
pub struct MemoryConnection {
    inbound: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    outbound: mpsc::UnboundedSender<Bytes>,
    closed: watch::Sender<bool>,
    label: String,
}

/// Client half of an in-process connection.
pub struct MemoryPeer {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    rx: mpsc::UnboundedReceiver<Bytes>,
    closed: watch::Receiver<bool>,
}

pub fn memory_pair(label: impl Into<String>) -> (Arc<MemoryConnection>, MemoryPeer) {
    let (client_tx, server_rx) = mpsc::unbounded_channel();
    let (server_tx, client_rx) = mpsc::unbounded_channel();
    let (closed_tx, closed_rx) = watch::channel(false);
    let connection = Arc::new(MemoryConnection {
        inbound: Mutex::new(server_rx),
        outbound: server_tx,
        closed: closed_tx,
        label: label.into(),
    });
    let peer = MemoryPeer {
        tx: Some(client_tx),
        rx: client_rx,
        closed: closed_rx,
    };
    (connection, peer)
}

impl MemoryConnection {
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn recv(&self) -> Result<Option<Bytes>, ConnectionError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(ConnectionError::Closed);
        }
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = closed.changed() => Err(ConnectionError::Closed),
            message = inbound.recv() => Ok(message),
        }
    }

    async fn send(&self, frame: Bytes) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        self.outbound
            .send(frame)
            .map_err(|_| ConnectionError::Closed)
    }

    async fn close(&self) {
        self.closed.send_replace(true);
    }

    fn peer(&self) -> String {
        self.label.clone()
    }
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("timed out waiting for a frame")]
    Timeout,
    #[error("server side closed the connection")]
    Closed,
    #[error(transparent)]
    Wire(#[from] WireError),
}

impl MemoryPeer {
    pub fn send_bytes(&self, bytes: Bytes) -> Result<(), PeerError> {
        self.tx
            .as_ref()
            .ok_or(PeerError::Closed)?
            .send(bytes)
            .map_err(|_| PeerError::Closed)
    }

    pub fn send_frame(&self, frame: &Frame) -> Result<(), PeerError> {
        self.send_bytes(frame.encode())
    }

    pub async fn recv_bytes(&mut self, wait: Duration) -> Result<Bytes, PeerError> {
        match tokio::time::timeout(wait, self.rx.recv()).await {
            Ok(Some(bytes)) => Ok(bytes),
            Ok(None) => Err(PeerError::Closed),
            Err(_) => Err(PeerError::Timeout),
        }
    }

    pub async fn recv_frame(&mut self, wait: Duration) -> Result<Frame, PeerError> {
        let bytes = self.recv_bytes(wait).await?;
        Ok(Frame::decode(&bytes)?)
    }

    /// Frames already delivered, without waiting.
    pub fn drain(&mut self) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Ok(bytes) = self.rx.try_recv() {
            out.push(bytes);
        }
        out
    }

    /// Ends the client's send side; the server observes a clean close.
    pub fn hang_up(&mut self) {
        self.tx.take();
    }

    pub fn server_closed(&self) -> bool {
        *self.closed.borrow()
    }
}
