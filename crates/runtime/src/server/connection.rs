//! One TCP connection: read frames, authenticate, dispatch, reply.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::protocol::{DecodeError, Envelope, ErrorCode, PROTOCOL_VERSION, Request, Response};
use crate::wire::{self, WireError};

use super::{Librarian, router};

struct Handled {
    response: Response,
    kind: String,
    shutdown: bool,
}

impl Handled {
    fn rejected(kind: &str, response: Response) -> Self {
        Self {
            response,
            kind: kind.to_string(),
            shutdown: false,
        }
    }

    /// Nothing from a disallowed peer is decoded, so there is no id to echo.
    fn foreign_host() -> Self {
        Self::rejected(
            "foreign_host",
            Response::error(None, ErrorCode::UnauthorizedHost, "host not allowed"),
        )
    }
}

pub(super) async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    librarian: Arc<Librarian>,
    shutdown_tx: watch::Sender<bool>,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut shutdown_rx = shutdown_tx.subscribe();
    let limits = librarian.frame_limits();
    let write_timeout = librarian.config.server.write_timeout();
    let host_allowed = librarian.host_allowed(peer.ip());
    debug!(%peer, host_allowed, "connection opened");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        let frame = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
            frame = wire::read_frame(&mut reader, &limits) => frame,
        };

        let started = Instant::now();
        let (handled, bytes_in) = match frame {
            Ok(None) => break,
            Ok(Some(body)) if !host_allowed => (Handled::foreign_host(), body.len()),
            Err(WireError::PayloadTooLarge { declared, .. }) if !host_allowed => {
                (Handled::foreign_host(), declared)
            }
            Ok(Some(body)) => (handle_frame(&librarian, &body).await, body.len()),
            Err(WireError::PayloadTooLarge { declared, max }) => (
                Handled::rejected(
                    "oversized",
                    Response::error(
                        None,
                        ErrorCode::PayloadTooLarge,
                        format!("frame of {declared} bytes exceeds the {max} byte limit"),
                    ),
                ),
                declared,
            ),
            Err(WireError::Timeout(after)) => {
                debug!(%peer, ?after, "connection timed out");
                break;
            }
            Err(err) => return Err(err.into()),
        };

        let bytes_out = timeout(write_timeout, wire::write_message(&mut writer, &handled.response))
            .await
            .map_err(|_| WireError::Timeout(write_timeout))??;
        librarian.record_request(Utc::now()).await;

        info!(
            kind = %handled.kind,
            request_id = handled.response.request_id.as_deref().unwrap_or("-"),
            duration_ms = started.elapsed().as_millis() as u64,
            bytes_in,
            bytes_out,
            outcome = handled.response.outcome(),
            "request handled"
        );

        if handled.shutdown {
            info!(%peer, "shutdown requested");
            let _ = shutdown_tx.send(true);
            break;
        }
    }

    debug!(%peer, "connection closed");
    Ok(())
}

/// Decode order: JSON, token, protocol version, type, payload.  The host
/// allowlist is settled per connection before any of this runs.
async fn handle_frame(librarian: &Arc<Librarian>, body: &[u8]) -> Handled {
    let envelope: Envelope = match wire::decode_body(body) {
        Ok(envelope) => envelope,
        Err(err) => {
            return Handled::rejected(
                "undecodable",
                Response::error(None, ErrorCode::InvalidPayload, err.to_string()),
            );
        }
    };
    let kind = envelope.kind.as_str();
    let request_id = envelope.request_id.clone();

    if !librarian.token_matches(envelope.auth_token.as_deref()) {
        return Handled::rejected(
            kind,
            Response::error(request_id, ErrorCode::Unauthorized, "Unauthorized"),
        );
    }
    if envelope.protocol_version != Some(PROTOCOL_VERSION) {
        return Handled::rejected(
            kind,
            Response::error(
                request_id,
                ErrorCode::ProtocolMismatch,
                format!(
                    "expected protocol_version {PROTOCOL_VERSION}, got {}",
                    envelope
                        .protocol_version
                        .map_or_else(|| "none".to_string(), |v| v.to_string())
                ),
            ),
        );
    }
    let Some(id) = request_id.clone().filter(|id| !id.is_empty()) else {
        return Handled::rejected(
            kind,
            Response::error(None, ErrorCode::InvalidPayload, "request_id is required"),
        );
    };

    let request = match envelope.decode() {
        Ok(request) => request,
        Err(DecodeError::UnknownType(other)) => {
            return Handled::rejected(
                kind,
                Response::error(
                    request_id,
                    ErrorCode::UnknownMessage,
                    format!("unknown message type {other:?}"),
                ),
            );
        }
        Err(DecodeError::InvalidFields(err)) => {
            return Handled::rejected(
                kind,
                Response::error(request_id, ErrorCode::InvalidPayload, err.to_string()),
            );
        }
    };

    let is_shutdown = matches!(request, Request::Shutdown);
    let response = router::dispatch(librarian, request, &id).await;
    Handled {
        shutdown: is_shutdown && response.is_success(),
        kind: kind.to_string(),
        response,
    }
}
