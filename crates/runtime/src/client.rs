//! Foreground side of the protocol: a request client that reuses one
//! connection, and a listener for pushed notifications.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use librarian_config::LibrarianConfig;

use crate::protocol::{Envelope, IngestChunk, Notification, PROTOCOL_VERSION, Request, Response};
use crate::wire::{self, FrameLimits, WireError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("could not connect to {address} after {attempts} attempt(s): {source}")]
    Connect {
        address: String,
        attempts: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out after {0:?} waiting for the librarian")]
    Timeout(Duration),
    #[error("connection closed before a response arrived")]
    Closed,
    #[error(transparent)]
    Wire(WireError),
    #[error("response id {got:?} does not match request id {expected}")]
    Correlation {
        expected: String,
        got: Option<String>,
    },
    #[error("response protocol_version {got} does not match {expected}")]
    VersionMismatch { expected: u32, got: u32 },
    #[error("payload needs {needed} chunks but at most {max} are allowed")]
    TooManyChunks { needed: usize, max: usize },
    #[error("a chunk envelope needs {overhead} bytes before any text; the frame cap is {max}")]
    ChunkOverhead { overhead: usize, max: usize },
}

impl From<WireError> for ClientError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Timeout(after) => ClientError::Timeout(after),
            other => ClientError::Wire(other),
        }
    }
}

impl ClientError {
    /// Transport trouble, as opposed to a well-delivered but wrong reply.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            ClientError::Connect { .. }
                | ClientError::Timeout(_)
                | ClientError::Closed
                | ClientError::Wire(WireError::Io(_) | WireError::Truncated)
        )
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub address: String,
    pub auth_token: Option<String>,
    pub max_message_bytes: usize,
    pub chunk_bytes: usize,
    pub max_chunks: usize,
    pub connect_attempts: usize,
    pub retry_delay: Duration,
    /// How long to wait for a reply; covers the server's outbound call.
    pub response_timeout: Duration,
}

impl ClientOptions {
    pub fn from_config(config: &LibrarianConfig) -> Self {
        let token = config.auth.token.trim();
        Self {
            address: config.server.address(),
            auth_token: (!token.is_empty()).then(|| token.to_string()),
            max_message_bytes: config.limits.max_message_bytes,
            chunk_bytes: config.limits.chunk_bytes,
            max_chunks: config.limits.max_chunks,
            connect_attempts: 3,
            retry_delay: Duration::from_millis(250),
            response_timeout: config.server.read_timeout()
                + Duration::from_secs(config.llm.request_timeout_secs)
                + Duration::from_secs(5),
        }
    }
}

/// Bytes `c` occupies inside a JSON string as serde_json writes it.
fn escaped_len(c: char) -> usize {
    match c {
        '"' | '\\' | '\u{8}' | '\u{c}' | '\n' | '\r' | '\t' => 2,
        c if c < ' ' => 6,
        c => c.len_utf8(),
    }
}

/// Split on char boundaries into pieces of at most `chunk_bytes` raw bytes
/// whose JSON-escaped form is at most `escaped_budget` bytes.  A single
/// character wider than either limit gets a piece of its own.
pub fn split_chunks(text: &str, chunk_bytes: usize, escaped_budget: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let (mut start, mut raw, mut escaped) = (0, 0, 0);
    for (at, c) in text.char_indices() {
        let (width, cost) = (c.len_utf8(), escaped_len(c));
        if raw > 0 && (raw + width > chunk_bytes || escaped + cost > escaped_budget) {
            pieces.push(&text[start..at]);
            (start, raw, escaped) = (at, 0, 0);
        }
        raw += width;
        escaped += cost;
    }
    if raw > 0 {
        pieces.push(&text[start..]);
    }
    pieces
}

/// One outstanding request at a time over a reused connection.
#[derive(Debug)]
pub struct LibrarianClient {
    options: ClientOptions,
    stream: Option<TcpStream>,
    last_request_id: Option<String>,
}

impl LibrarianClient {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            stream: None,
            last_request_id: None,
        }
    }

    pub fn last_request_id(&self) -> Option<&str> {
        self.last_request_id.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Connect, retrying a bounded number of times with a fixed delay.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        let attempts = self.options.connect_attempts.max(1);
        for attempt in 1..=attempts {
            match TcpStream::connect(&self.options.address).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(err) if attempt == attempts => {
                    return Err(ClientError::Connect {
                        address: self.options.address.clone(),
                        attempts,
                        source: err,
                    });
                }
                Err(err) => {
                    debug!(attempt, ?err, "librarian connect failed; retrying");
                    tokio::time::sleep(self.options.retry_delay).await;
                }
            }
        }
        Err(ClientError::Closed)
    }

    pub fn close(&mut self) {
        self.stream = None;
    }

    /// Send one request with a fresh correlation id.
    pub async fn request(&mut self, request: Request) -> Result<Response, ClientError> {
        let id = Uuid::new_v4().to_string();
        self.exchange(&request, &id).await
    }

    async fn exchange(&mut self, request: &Request, id: &str) -> Result<Response, ClientError> {
        if self.stream.is_none() {
            self.connect().await?;
        }
        self.last_request_id = Some(id.to_string());
        let envelope = Envelope::new(request, id, self.options.auth_token.clone());

        let response = match self.round_trip(&envelope).await {
            Ok(response) => response,
            Err(err) => {
                // The stream may hold half a frame; never reuse it.
                self.stream = None;
                return Err(err);
            }
        };

        // Pre-dispatch rejections (oversize, undecodable) cannot echo an id;
        // hand them back as the error they are.
        let uncorrelated_error = response.request_id.is_none() && !response.is_success();
        if !uncorrelated_error && response.request_id.as_deref() != Some(id) {
            self.stream = None;
            return Err(ClientError::Correlation {
                expected: id.to_string(),
                got: response.request_id,
            });
        }
        if response.protocol_version != PROTOCOL_VERSION {
            return Err(ClientError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: response.protocol_version,
            });
        }
        Ok(response)
    }

    async fn round_trip(&mut self, envelope: &Envelope) -> Result<Response, ClientError> {
        let stream = self.stream.as_mut().ok_or(ClientError::Closed)?;
        let limits = FrameLimits {
            max_bytes: u32::MAX as usize,
            idle_timeout: self.options.response_timeout,
            read_timeout: self.options.response_timeout,
        };
        timeout(self.options.response_timeout, wire::write_message(stream, envelope))
            .await
            .map_err(|_| ClientError::Timeout(self.options.response_timeout))??;
        let body = wire::read_frame(stream, &limits)
            .await?
            .ok_or(ClientError::Closed)?;
        Ok(wire::decode_body(&body)?)
    }

    pub async fn status(&mut self) -> Result<Response, ClientError> {
        self.request(Request::StatusRequest).await
    }

    pub async fn cloud_query(&mut self, prompt: &str, sanitized: bool) -> Result<Response, ClientError> {
        self.request(Request::CloudQuery {
            prompt: prompt.to_string(),
            sanitized,
        })
        .await
    }

    pub async fn research(&mut self, topic: &str) -> Result<Response, ClientError> {
        self.request(Request::ResearchRequest {
            topic: topic.to_string(),
        })
        .await
    }

    pub async fn sources(&mut self, topic: &str) -> Result<Response, ClientError> {
        self.request(Request::SourcesRequest {
            topic: topic.to_string(),
        })
        .await
    }

    pub async fn ingest_paths(&mut self, paths: Vec<String>) -> Result<Response, ClientError> {
        self.request(Request::IngestRequest { paths }).await
    }

    pub async fn cancel(&mut self, target_request_id: &str) -> Result<Response, ClientError> {
        self.request(Request::CancelRequest {
            target_request_id: target_request_id.to_string(),
        })
        .await
    }

    pub async fn card_catalog(&mut self) -> Result<Response, ClientError> {
        self.request(Request::CardCatalogRequest).await
    }

    pub async fn shutdown(&mut self) -> Result<Response, ClientError> {
        self.request(Request::Shutdown).await
    }

    /// Send text for ingestion, splitting it into `ingest_text_chunk`
    /// messages when the whole request would exceed the frame cap.  Every
    /// chunk frame is sized by its encoded length, so escaping never pushes
    /// it over the cap.  Stops at the first chunk the server does not accept
    /// and returns that reply.
    pub async fn ingest_text(
        &mut self,
        text: &str,
        topic: &str,
        source: &str,
    ) -> Result<Response, ClientError> {
        let id = Uuid::new_v4().to_string();
        let whole = Request::IngestText {
            text: text.to_string(),
            topic: topic.to_string(),
            source: source.to_string(),
        };
        let encoded = serde_json::to_vec(&Envelope::new(
            &whole,
            &id,
            self.options.auth_token.clone(),
        ))
        .map_err(WireError::from)?;
        if encoded.len() <= self.options.max_message_bytes {
            return self.exchange(&whole, &id).await;
        }

        let budget = self.chunk_text_budget(topic, source, &id)?;
        let pieces = split_chunks(text, self.options.chunk_bytes, budget);
        if pieces.len() > self.options.max_chunks {
            return Err(ClientError::TooManyChunks {
                needed: pieces.len(),
                max: self.options.max_chunks,
            });
        }

        let total = pieces.len();
        let mut last = None;
        for (index, piece) in pieces.into_iter().enumerate() {
            let chunk = Request::IngestTextChunk(IngestChunk {
                chunk: piece.to_string(),
                chunk_index: index,
                total_chunks: total,
                topic: topic.to_string(),
                source: source.to_string(),
            });
            let response = self.exchange(&chunk, &id).await?;
            if !response.is_success() {
                return Ok(response);
            }
            last = Some(response);
        }
        match last {
            Some(response) => Ok(response),
            None => self.exchange(&whole, &id).await,
        }
    }

    /// Bytes left for escaped chunk text once the rest of a chunk envelope
    /// is encoded.  Index and total are measured at `max_chunks`, the widest
    /// either can be.
    fn chunk_text_budget(&self, topic: &str, source: &str, id: &str) -> Result<usize, ClientError> {
        let widest = Request::IngestTextChunk(IngestChunk {
            chunk: String::new(),
            chunk_index: self.options.max_chunks,
            total_chunks: self.options.max_chunks,
            topic: topic.to_string(),
            source: source.to_string(),
        });
        let overhead = serde_json::to_vec(&Envelope::new(
            &widest,
            id,
            self.options.auth_token.clone(),
        ))
        .map_err(WireError::from)?
        .len();
        match self.options.max_message_bytes.checked_sub(overhead) {
            Some(budget) if budget > 0 => Ok(budget),
            _ => Err(ClientError::ChunkOverhead {
                overhead,
                max: self.options.max_message_bytes,
            }),
        }
    }
}

// ── Notification listener ────────────────────────────────────────────────────

/// Accepts the Librarian's push connections and forwards each decoded
/// notification on a channel.
pub struct NotificationListener {
    listener: TcpListener,
    limits: FrameLimits,
}

impl NotificationListener {
    pub async fn bind(address: &str, max_bytes: usize) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("bind notification listener on {address}"))?;
        Ok(Self {
            listener,
            limits: FrameLimits {
                max_bytes,
                idle_timeout: Duration::from_secs(30),
                read_timeout: Duration::from_secs(5),
            },
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Runs until the receiving side of `tx` is dropped.
    pub async fn run(self, tx: mpsc::UnboundedSender<Notification>) -> Result<()> {
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!(?err, "notification accept failed");
                            continue;
                        }
                    };
                    tokio::spawn(forward_notifications(stream, peer, tx.clone(), self.limits));
                }
            }
        }
        Ok(())
    }
}

async fn forward_notifications(
    mut stream: TcpStream,
    peer: SocketAddr,
    tx: mpsc::UnboundedSender<Notification>,
    limits: FrameLimits,
) {
    loop {
        let body = match wire::read_frame(&mut stream, &limits).await {
            Ok(Some(body)) => body,
            Ok(None) => return,
            Err(WireError::PayloadTooLarge { declared, .. }) => {
                warn!(%peer, declared, "oversized notification skipped");
                continue;
            }
            Err(err) => {
                debug!(%peer, ?err, "notification connection ended");
                return;
            }
        };
        match wire::decode_body::<Notification>(&body) {
            Ok(notification) => {
                if tx.send(notification).is_err() {
                    return;
                }
            }
            Err(err) => warn!(%peer, %err, "malformed notification skipped"),
        }
    }
}
