use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

// ── Scan mode ────────────────────────────────────────────────────────────────

/// What to do when text headed for ingestion contains sensitive content.
///
/// | Mode    | Behaviour                                                    |
/// |---------|--------------------------------------------------------------|
/// | `off`   | Text is ingested as-is, no scan.                             |
/// | `warn`  | The redacted text is ingested and the response is flagged.   |
/// | `block` | The request fails with `scan_blocked`; nothing is ingested.  |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    Off,
    #[default]
    Warn,
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound for reading one frame body once its length has arrived.
    pub read_timeout_ms: u64,
    /// How long a connection may sit idle between frames before it is closed.
    pub idle_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6000,
            read_timeout_ms: 5_000,
            idle_timeout_ms: 60_000,
            write_timeout_ms: 5_000,
        }
    }
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Where pushed notifications go.  Port `0` disables push delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            connect_timeout_ms: 2_000,
        }
    }
}

impl CallbackConfig {
    pub fn enabled(&self) -> bool {
        self.port != 0
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared secret every request must carry.  Empty disables the check.
    pub token: String,
    /// Peer IPs allowed to talk to the Librarian.  Empty allows any peer.
    pub allowlist: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Hard cap on one frame body, in bytes.
    pub max_message_bytes: usize,
    /// Size of each text fragment the client sends for oversized payloads.
    pub chunk_bytes: usize,
    pub max_chunks: usize,
    /// Incomplete uploads untouched for this long are purged.
    pub chunk_ttl_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: 1024 * 1024,
            chunk_bytes: 256 * 1024,
            max_chunks: 64,
            chunk_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    /// Consecutive failures that open the breaker.
    pub breaker_threshold: u32,
    pub breaker_cooldown_secs: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            backoff_base_secs: 2,
            backoff_max_secs: 300,
            breaker_threshold: 3,
            breaker_cooldown_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpkeepConfig {
    pub interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// A second gap for the same topic inside this window is suppressed.
    pub gap_dedupe_secs: u64,
    /// Rolling window for the per-topic notification cap.
    pub gap_rate_window_secs: u64,
    pub gap_max_per_window: usize,
    /// Cached sources older than this are reported as stale.
    pub sources_stale_after_secs: u64,
    /// Refresh at most one stale topic per upkeep pass.
    pub auto_refresh_sources: bool,
    /// Append-only activity ledger written by the foreground.
    pub ledger_path: String,
    /// Scan cursor, gap history and sources cache.
    pub state_path: String,
}

impl Default for UpkeepConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            heartbeat_interval_secs: 60,
            gap_dedupe_secs: 300,
            gap_rate_window_secs: 3_600,
            gap_max_per_window: 3,
            sources_stale_after_secs: 7 * 24 * 60 * 60,
            auto_refresh_sources: true,
            ledger_path: "logs/researcher_ledger.ndjson".to_string(),
            state_path: ".librarian/upkeep_state.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Refuse every outbound call (`local_only`).
    pub local_only: bool,
    /// Trust policy: `false` refuses every outbound call (`trust_policy_block`).
    pub allow_outbound: bool,
    /// Research topics containing any of these terms (case-insensitive) are refused.
    pub topic_blocklist: Vec<String>,
    pub scan_mode: ScanMode,
    /// `ingest_request` paths must resolve under one of these directories.
    pub allowed_roots: Vec<String>,
    /// Cap on the research text carried in a pushed note.
    pub research_max_chars: usize,
    /// Where `JsonlIngestor` appends ingested documents.
    pub corpus_path: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            local_only: false,
            allow_outbound: true,
            topic_blocklist: vec![],
            scan_mode: ScanMode::Warn,
            allowed_roots: vec![".".to_string()],
            research_max_chars: 4_000,
            corpus_path: ".librarian/corpus.jsonl".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub ollama_model: String,
    pub openrouter_model: String,
    /// Base URL for the Ollama API.  Overridden at runtime by the
    /// `OLLAMA_BASE_URL` environment variable when set.
    pub ollama_base_url: String,
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            ollama_model: "llama3.1:8b".to_string(),
            openrouter_model: "openai/gpt-4o-mini".to_string(),
            ollama_base_url: "http://localhost:11434".to_string(),
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
    /// Directory for the daily-rolling service log.  Empty logs to stderr only.
    pub log_dir: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LibrarianConfig {
    pub server: ServerConfig,
    pub callback: CallbackConfig,
    pub auth: AuthConfig,
    pub limits: LimitsConfig,
    pub resilience: ResilienceConfig,
    pub upkeep: UpkeepConfig,
    pub policy: PolicyConfig,
    pub llm: LlmConfig,
    pub telemetry: TelemetryConfig,
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn env_flag(raw: &str) -> bool {
    matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes")
}

impl LibrarianConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject limits the wire cannot honour.
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        if limits.chunk_bytes == 0 || limits.chunk_bytes >= limits.max_message_bytes {
            bail!(
                "limits.chunk_bytes ({}) must be above zero and below limits.max_message_bytes ({})",
                limits.chunk_bytes,
                limits.max_message_bytes
            );
        }
        if limits.max_chunks == 0 {
            bail!("limits.max_chunks must be at least 1");
        }
        Ok(())
    }

    /// Environment overrides, applied on top of whatever the file said.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(host) = env::var("LIBRARIAN_HOST") {
            if !host.is_empty() {
                self.server.host = host;
            }
        }
        if let Ok(port) = env::var("LIBRARIAN_PORT") {
            self.server.port = port.trim().parse().context("LIBRARIAN_PORT")?;
        }
        if let Ok(token) = env::var("LIBRARIAN_IPC_TOKEN") {
            self.auth.token = token;
        }
        if let Ok(raw) = env::var("LIBRARIAN_IPC_ALLOWLIST") {
            self.auth.allowlist = parse_list(&raw);
        }
        if let Ok(raw) = env::var("LIBRARIAN_IPC_MAX_BYTES") {
            self.limits.max_message_bytes =
                raw.trim().parse().context("LIBRARIAN_IPC_MAX_BYTES")?;
        }
        if let Ok(raw) = env::var("LIBRARIAN_IPC_CHUNK_BYTES") {
            self.limits.chunk_bytes = raw.trim().parse().context("LIBRARIAN_IPC_CHUNK_BYTES")?;
        }
        if let Ok(host) = env::var("LIBRARIAN_CALLBACK_HOST") {
            if !host.is_empty() {
                self.callback.host = host;
            }
        }
        if let Ok(port) = env::var("LIBRARIAN_CALLBACK_PORT") {
            self.callback.port = port.trim().parse().context("LIBRARIAN_CALLBACK_PORT")?;
        }
        if let Ok(raw) = env::var("LIBRARIAN_TOPIC_BLOCKLIST") {
            self.policy.topic_blocklist = parse_list(&raw);
        }
        if let Ok(raw) = env::var("LIBRARIAN_LOCAL_ONLY") {
            self.policy.local_only = env_flag(&raw);
        }
        Ok(())
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
