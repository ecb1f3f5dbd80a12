//! `Connection` over an axum websocket. Each binary message carries one
//! encoded frame; text messages are accepted as UTF-8 bytes of a frame.

use std::net::SocketAddr;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use swell_runtime::{Connection, ConnectionError};
use tokio::sync::{watch, Mutex};
use tracing::trace;

pub struct WsConnection {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    stream: Mutex<SplitStream<WebSocket>>,
    closed: watch::Sender<bool>,
    peer: SocketAddr,
}

impl WsConnection {
    pub fn new(socket: WebSocket, peer: SocketAddr) -> Self {
        let (sink, stream) = socket.split();
        let (closed, _) = watch::channel(false);
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            closed,
            peer,
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn recv(&self) -> Result<Option<Bytes>, ConnectionError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(ConnectionError::Closed);
        }
        let mut stream = self.stream.lock().await;
        loop {
            let message = tokio::select! {
                _ = closed.changed() => return Err(ConnectionError::Closed),
                message = stream.next() => message,
            };
            match message {
                None => return Ok(None),
                Some(Err(err)) => return Err(ConnectionError::Transport(err.to_string())),
                Some(Ok(Message::Binary(bytes))) => return Ok(Some(Bytes::from(bytes))),
                Some(Ok(Message::Text(text))) => return Ok(Some(Bytes::from(text.into_bytes()))),
                Some(Ok(Message::Close(frame))) => {
                    trace!(peer = %self.peer, reason = ?frame.map(|f| f.reason.to_string()), "peer sent close");
                    return Ok(None);
                }
                // axum answers pings itself
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            }
        }
    }

    async fn send(&self, frame: Bytes) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        self.sink
            .lock()
            .await
            .send(Message::Binary(frame.to_vec()))
            .await
            .map_err(|err| ConnectionError::Transport(err.to_string()))
    }

    async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }
}
