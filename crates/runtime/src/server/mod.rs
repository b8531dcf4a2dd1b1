//! The Librarian service: TCP accept loop, shared state, and the periodic
//! upkeep task.

mod chunks;
mod connection;
mod notify;
mod research;
mod resilience;
mod router;
mod upkeep;


use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, watch};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use librarian_config::LibrarianConfig;
use librarian_llm::{Generation, HttpGenerator, SharedGenerator};
use librarian_store::{
    ActivityLedger, JsonlIngestor, RegexSanitizer, SharedIngestor, SharedSanitizer, state_file,
};

use crate::protocol::Notification;
use crate::wire::FrameLimits;

pub use chunks::{AssembledText, ChunkError, ChunkProgress, ChunkTable};
pub use notify::{CallbackSink, DisabledSink, NotificationSink, SharedSink, sink_for};
#[cfg(any(test, feature = "test-util"))]
pub use notify::RecordingSink;
pub use research::{parse_sources, trust_score};
pub use resilience::{PolicySnapshot, Rejection, ResiliencePolicy};
pub use upkeep::{GapHistory, SourcesRecord, UpkeepReport, UpkeepState};

/// The external services the Librarian drives but does not implement.
#[derive(Clone)]
pub struct Collaborators {
    pub generator: SharedGenerator,
    pub ingestor: SharedIngestor,
    pub sanitizer: SharedSanitizer,
    pub sink: SharedSink,
}

impl Collaborators {
    pub fn from_config(config: &LibrarianConfig) -> Result<Self> {
        Ok(Self {
            generator: Arc::new(HttpGenerator::from_config(&config.llm)?),
            ingestor: Arc::new(JsonlIngestor::new(&config.policy.corpus_path)),
            sanitizer: Arc::new(RegexSanitizer::new()?),
            sink: sink_for(&config.callback, config.server.write_timeout()),
        })
    }
}

#[derive(Debug, Default)]
struct Activity {
    last_request_at: Option<DateTime<Utc>>,
    requests_handled: u64,
    last_upkeep_at: Option<DateTime<Utc>>,
}

/// Shared service state.  Each concern has its own lock; none is held across
/// an outbound call or socket I/O.
pub struct Librarian {
    config: LibrarianConfig,
    collaborators: Collaborators,
    ledger: ActivityLedger,
    allowed_hosts: Vec<IpAddr>,
    chunks: Mutex<ChunkTable>,
    resilience: Mutex<ResiliencePolicy>,
    upkeep: Mutex<UpkeepState>,
    activity: Mutex<Activity>,
    started_at: DateTime<Utc>,
}

impl Librarian {
    pub fn new(config: LibrarianConfig, collaborators: Collaborators) -> Result<Self> {
        let state_path = Path::new(&config.upkeep.state_path);
        let upkeep: UpkeepState = state_file::load_or_default(state_path)
            .with_context(|| format!("load upkeep state from {}", state_path.display()))?;
        let allowed_hosts = parse_allowlist(&config.auth.allowlist);

        Ok(Self {
            ledger: ActivityLedger::new(&config.upkeep.ledger_path),
            chunks: Mutex::new(ChunkTable::new(
                config.limits.max_chunks,
                config.limits.chunk_ttl_secs,
            )),
            resilience: Mutex::new(ResiliencePolicy::new(config.resilience.clone())),
            upkeep: Mutex::new(upkeep),
            activity: Mutex::new(Activity::default()),
            started_at: Utc::now(),
            allowed_hosts,
            collaborators,
            config,
        })
    }

    pub fn config(&self) -> &LibrarianConfig {
        &self.config
    }

    fn frame_limits(&self) -> FrameLimits {
        FrameLimits {
            max_bytes: self.config.limits.max_message_bytes,
            idle_timeout: self.config.server.idle_timeout(),
            read_timeout: self.config.server.read_timeout(),
        }
    }

    fn host_allowed(&self, peer: IpAddr) -> bool {
        if self.config.auth.allowlist.is_empty() {
            return true;
        }
        let peer = peer.to_canonical();
        self.allowed_hosts.iter().any(|allowed| *allowed == peer)
    }

    fn token_matches(&self, presented: Option<&str>) -> bool {
        let expected = self.config.auth.token.as_bytes();
        if expected.is_empty() {
            return true;
        }
        let Some(presented) = presented.map(str::as_bytes) else {
            return false;
        };
        presented.len() == expected.len()
            && presented
                .iter()
                .zip(expected)
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }

    /// Run one generation through the gates and record its outcome.
    async fn call_outbound(&self, prompt: &str) -> Result<Generation, Rejection> {
        self.resilience
            .lock()
            .await
            .check(&self.config.policy, Utc::now())?;

        let generation = self.collaborators.generator.generate(prompt).await;

        let mut policy = self.resilience.lock().await;
        if generation.ok {
            policy.record_success(Utc::now());
        } else {
            policy.record_failure(Utc::now());
            warn!(
                failures = policy.snapshot().failure_count,
                "outbound generation failed"
            );
        }
        Ok(generation)
    }

    async fn push(&self, notification: Notification) {
        if let Err(err) = self.collaborators.sink.deliver(&notification).await {
            warn!(
                event = notification.event.as_str(),
                ?err,
                "notification dropped"
            );
        }
    }

    /// Deliver in the background so the caller's response is not delayed.
    fn push_later(self: &Arc<Self>, notification: Notification) {
        let librarian = Arc::clone(self);
        tokio::spawn(async move { librarian.push(notification).await });
    }

    async fn record_request(&self, now: DateTime<Utc>) {
        let mut activity = self.activity.lock().await;
        activity.last_request_at = Some(now);
        activity.requests_handled += 1;
    }

    pub async fn policy_snapshot(&self) -> PolicySnapshot {
        self.resilience.lock().await.snapshot()
    }

    pub async fn pending_uploads(&self) -> usize {
        self.chunks.lock().await.len()
    }

    /// Write the upkeep state to disk.
    pub async fn persist_state(&self) -> Result<()> {
        let snapshot = self.upkeep.lock().await.clone();
        state_file::save_atomic(Path::new(&self.config.upkeep.state_path), &snapshot).await
    }
}

fn parse_allowlist(entries: &[String]) -> Vec<IpAddr> {
    let mut hosts = Vec::new();
    for entry in entries {
        let entry = entry.trim();
        if entry.eq_ignore_ascii_case("localhost") {
            hosts.push(IpAddr::V4(Ipv4Addr::LOCALHOST));
            hosts.push(IpAddr::V6(Ipv6Addr::LOCALHOST));
            continue;
        }
        match entry.parse::<IpAddr>() {
            Ok(ip) => hosts.push(ip.to_canonical()),
            Err(_) => warn!(entry, "allowlist entry is not an IP address; ignored"),
        }
    }
    hosts
}

// ── Server ───────────────────────────────────────────────────────────────────

pub struct LibrarianServer {
    listener: TcpListener,
    librarian: Arc<Librarian>,
    shutdown_tx: watch::Sender<bool>,
}

impl LibrarianServer {
    pub async fn bind(librarian: Arc<Librarian>) -> Result<Self> {
        let address = librarian.config.server.address();
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("bind {address}"))?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            listener,
            librarian,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Sending `true` stops the accept loop, open connections and upkeep.
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    pub fn librarian(&self) -> Arc<Librarian> {
        Arc::clone(&self.librarian)
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            listener,
            librarian,
            shutdown_tx,
        } = self;
        let mut shutdown_rx = shutdown_tx.subscribe();
        info!(address = %listener.local_addr()?, "librarian listening");

        let upkeep = spawn_upkeep_task(Arc::clone(&librarian), &shutdown_tx);

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                accept = listener.accept() => {
                    let (stream, peer) = match accept {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!(?err, "accept failed");
                            continue;
                        }
                    };
                    let librarian = Arc::clone(&librarian);
                    let shutdown_tx = shutdown_tx.clone();
                    tokio::spawn(async move {
                        if let Err(err) =
                            connection::handle_connection(stream, peer, librarian, shutdown_tx).await
                        {
                            warn!(%peer, ?err, "connection closed with error");
                        }
                    });
                }
            }
        }

        info!("librarian shutting down");
        if let Err(err) = upkeep.await {
            error!(?err, "upkeep task panicked");
        }
        if let Err(err) = librarian.persist_state().await {
            warn!(?err, "failed to persist upkeep state on shutdown");
        }
        Ok(())
    }
}

fn spawn_upkeep_task(
    librarian: Arc<Librarian>,
    shutdown_tx: &watch::Sender<bool>,
) -> tokio::task::JoinHandle<()> {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let period = Duration::from_secs(librarian.config.upkeep.interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match librarian.run_upkeep(Utc::now()).await {
                        Ok(report) if report.is_quiet() => {}
                        Ok(report) => info!(?report, "upkeep pass"),
                        Err(err) => warn!(?err, "upkeep pass failed"),
                    }
                }
            }
        }
    })
}

/// Build the production collaborators, serve until interrupted or asked to
/// shut down, then persist state.
pub async fn run_librarian(config: LibrarianConfig) -> Result<()> {
    let collaborators = Collaborators::from_config(&config)?;
    let librarian = Arc::new(Librarian::new(config, collaborators)?);
    let server = LibrarianServer::bind(librarian).await?;

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        match terminate_signal().await {
            Ok(()) => {
                info!("termination signal received");
                let _ = shutdown.send(true);
            }
            Err(err) => warn!(?err, "signal handler unavailable"),
        }
    });

    server.run().await
}

#[cfg(unix)]
async fn terminate_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => {},
        _ = sigint.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn terminate_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
