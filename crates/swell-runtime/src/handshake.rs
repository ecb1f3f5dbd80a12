//! First exchange on a new socket: read the client hello, authorize, then
//! resume the named session or start a fresh one.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use swell_core::{
    AuthReason, ClientHello, Frame, FrameType, HandshakeStatus, ServerHello, PROTOCOL_VERSION,
};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::auth::Principal;
use crate::error::{HandshakeError, ManagerError, ResumeError};
use crate::manager::{Resumable, SessionManager};
use crate::session::Session;
use crate::transport::Connection;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs the handshake on `conn`. On success the session owns the connection
/// and its loops are running; on failure the connection has been answered
/// (when possible) and closed.
pub async fn perform_handshake(
    manager: &SessionManager,
    conn: Arc<dyn Connection>,
    principal: Option<Principal>,
    wait: Duration,
) -> Result<Arc<Session>, HandshakeError> {
    let result = handshake(manager, Arc::clone(&conn), principal, wait).await;
    match &result {
        Ok(session) => {
            counter!("swell_handshakes_total", 1, "outcome" => "ok");
            debug!(session_id = %session.id(), peer = %conn.peer(), "handshake complete");
        }
        Err(err) => {
            counter!("swell_handshakes_total", 1, "outcome" => err.metric_label());
            warn!(peer = %conn.peer(), error = %err, "handshake failed");
            conn.close().await;
        }
    }
    result
}

async fn handshake(
    manager: &SessionManager,
    conn: Arc<dyn Connection>,
    principal: Option<Principal>,
    wait: Duration,
) -> Result<Arc<Session>, HandshakeError> {
    let bytes = match timeout(wait, conn.recv()).await {
        Err(_) => return Err(HandshakeError::TimedOut),
        Ok(Ok(None)) => return Err(HandshakeError::SocketClosed),
        Ok(Err(err)) => return Err(err.into()),
        Ok(Ok(Some(bytes))) => bytes,
    };
    let hello = match parse_hello(&bytes) {
        Ok(hello) => hello,
        Err(message) => {
            reject(conn.as_ref(), HandshakeStatus::InvalidFormat, None, &message).await;
            return Err(HandshakeError::InvalidFrame(message));
        }
    };

    let principal = match manager.auth_check() {
        Some(check) => match check.check(principal.as_ref()) {
            Ok(principal) => principal,
            Err(err) => {
                reject(
                    conn.as_ref(),
                    HandshakeStatus::NotAuthorized,
                    Some(err.reason()),
                    &err.to_string(),
                )
                .await;
                return Err(HandshakeError::Rejected(HandshakeStatus::NotAuthorized));
            }
        },
        None => principal,
    };

    let reconnect = manager.config().reconnect;
    if let Some(id) = hello.session_id.as_deref() {
        match manager.resumable(id, principal.as_ref()).await {
            Ok(Resumable { session, live: true }) => {
                session.resume(conn, &hello, reconnect).await?;
                return Ok(session);
            }
            Ok(Resumable { session, live: false }) => {
                session.connect(conn, reconnect, true).await?;
                return Ok(session);
            }
            Err(ResumeError::RehydrateFailed) => {
                reject(
                    conn.as_ref(),
                    HandshakeStatus::NotAuthorized,
                    Some(AuthReason::ResumeRehydrateFailed),
                    "session could not be re-authenticated",
                )
                .await;
                return Err(HandshakeError::Rejected(HandshakeStatus::NotAuthorized));
            }
            Err(ResumeError::Auth(err)) => {
                reject(
                    conn.as_ref(),
                    HandshakeStatus::NotAuthorized,
                    Some(err.reason()),
                    &err.to_string(),
                )
                .await;
                return Err(HandshakeError::Rejected(HandshakeStatus::NotAuthorized));
            }
            Err(ResumeError::Manager(ManagerError::TooManySessions(_))) => {
                reject(conn.as_ref(), HandshakeStatus::ServerBusy, None, "server busy").await;
                return Err(HandshakeError::Rejected(HandshakeStatus::ServerBusy));
            }
            Err(ResumeError::NotFound) | Err(ResumeError::Expired) => {
                info!(session_id = %id, "resume target gone; starting fresh session");
            }
            Err(err) => {
                warn!(session_id = %id, error = %err, "resume failed; starting fresh session");
            }
        }
    }

    let session = match manager.create(&hello.path, principal) {
        Ok(session) => session,
        Err(ManagerError::TooManySessions(_)) => {
            reject(conn.as_ref(), HandshakeStatus::ServerBusy, None, "server busy").await;
            return Err(HandshakeError::Rejected(HandshakeStatus::ServerBusy));
        }
        Err(ManagerError::RouteNotFound(path)) => {
            let message = format!("no route for {path}");
            reject(conn.as_ref(), HandshakeStatus::InvalidFormat, None, &message).await;
            return Err(HandshakeError::InvalidFrame(message));
        }
        Err(ManagerError::Session(err)) => return Err(err.into()),
    };
    session.connect(conn, reconnect, false).await?;
    Ok(session)
}

fn parse_hello(bytes: &[u8]) -> Result<ClientHello, String> {
    let frame = Frame::decode(bytes).map_err(|err| err.to_string())?;
    if frame.frame_type != FrameType::Hello {
        return Err(format!("expected hello, got {}", frame.frame_type.label()));
    }
    let hello: ClientHello = frame.parse_json().map_err(|err| err.to_string())?;
    if hello.protocol_version != PROTOCOL_VERSION {
        return Err(format!(
            "unsupported protocol version {}",
            hello.protocol_version
        ));
    }
    Ok(hello)
}

async fn reject(conn: &dyn Connection, status: HandshakeStatus, reason: Option<AuthReason>, message: &str) {
    let hello = ServerHello::rejected(status, reason, message);
    match hello.to_frame() {
        Ok(frame) => {
            if let Err(err) = conn.send(frame.encode()).await {
                debug!(error = %err, "could not deliver handshake rejection");
            }
        }
        Err(err) => warn!(error = %err, "failed to encode handshake rejection"),
    }
}
