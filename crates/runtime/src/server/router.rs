//! Request handlers.  Every outcome, including a panic inside a handler, is
//! turned into exactly one [`Response`].

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::{Value, json};
use tracing::error;

use librarian_config::ScanMode;
use librarian_store::IngestReport;

use super::Librarian;
use super::chunks::{ChunkError, ChunkProgress};
use super::research::{
    is_blocked_topic, note_details, parse_sources, research_prompt, sources_details,
    sources_prompt,
};
use super::resilience::Rejection;
use crate::protocol::{
    ErrorCode, IngestChunk, Notification, NotificationEvent, PROTOCOL_VERSION, Request, Response,
};

#[derive(Debug)]
pub(super) struct Failure {
    code: ErrorCode,
    message: String,
}

impl Failure {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<Rejection> for Failure {
    fn from(rejection: Rejection) -> Self {
        Failure::new(rejection.code(), rejection.to_string())
    }
}

impl From<ChunkError> for Failure {
    fn from(err: ChunkError) -> Self {
        Failure::new(ErrorCode::InvalidPayload, err.to_string())
    }
}

type Handled = Result<(String, Value), Failure>;

pub(super) async fn dispatch(librarian: &Arc<Librarian>, request: Request, request_id: &str) -> Response {
    let id = Some(request_id.to_string());
    match AssertUnwindSafe(route(librarian, request, request_id))
        .catch_unwind()
        .await
    {
        Ok(Ok((message, result))) => Response::success(id, message, result),
        Ok(Err(failure)) => Response::error(id, failure.code, failure.message),
        Err(_) => {
            error!(request_id, "request handler panicked");
            Response::error(id, ErrorCode::InternalError, "internal error while handling request")
        }
    }
}

async fn route(librarian: &Arc<Librarian>, request: Request, request_id: &str) -> Handled {
    match request {
        Request::Shutdown => Ok(("Librarian shutting down".to_string(), Value::Null)),
        Request::StatusRequest => Ok(status(librarian).await),
        Request::CloudQuery { prompt, sanitized } => cloud_query(librarian, &prompt, sanitized).await,
        Request::ResearchRequest { topic } => research(librarian, &topic).await,
        Request::SourcesRequest { topic } => sources(librarian, &topic).await,
        Request::IngestText {
            text,
            topic,
            source,
        } => ingest_text(librarian, &text, &topic, &source).await,
        Request::IngestTextChunk(chunk) => ingest_chunk(librarian, request_id, chunk).await,
        Request::IngestRequest { paths } => ingest_paths(librarian, &paths).await,
        Request::CancelRequest { target_request_id } => cancel(librarian, &target_request_id).await,
        Request::CardCatalogRequest => card_catalog(librarian).await,
    }
}

// ── Status ───────────────────────────────────────────────────────────────────

fn age_secs(now: DateTime<Utc>, at: Option<DateTime<Utc>>) -> Option<f64> {
    at.map(|at| (now - at).num_milliseconds().max(0) as f64 / 1000.0)
}

async fn status(librarian: &Librarian) -> (String, Value) {
    let now = Utc::now();
    let policy = librarian.policy_snapshot().await;
    let pending_uploads = librarian.pending_uploads().await;
    let (last_request_at, requests_handled, last_upkeep_at) = {
        let activity = librarian.activity.lock().await;
        (
            activity.last_request_at,
            activity.requests_handled,
            activity.last_upkeep_at,
        )
    };
    let last_heartbeat_at = librarian.upkeep.lock().await.last_heartbeat_at;

    let result = json!({
        "running": true,
        "protocol_version": PROTOCOL_VERSION,
        "started_at": librarian.started_at,
        "uptime_secs": (now - librarian.started_at).num_seconds().max(0),
        "requests_handled": requests_handled,
        "last_request_at": last_request_at,
        "seconds_since_last_request": age_secs(now, last_request_at),
        "last_heartbeat_at": last_heartbeat_at,
        "heartbeat_age_s": age_secs(now, last_heartbeat_at),
        "last_upkeep_at": last_upkeep_at,
        "pending_uploads": pending_uploads,
        "local_only": librarian.config.policy.local_only,
        "allow_outbound": librarian.config.policy.allow_outbound,
        "policy": policy,
    });
    ("Librarian is running".to_string(), result)
}

// ── Outbound ─────────────────────────────────────────────────────────────────

async fn cloud_query(librarian: &Librarian, prompt: &str, sanitized: bool) -> Handled {
    if !sanitized {
        return Err(Failure::new(
            ErrorCode::SanitizeRequired,
            "cloud_query requires the caller to assert sanitized: true",
        ));
    }
    if prompt.trim().is_empty() {
        return Err(Failure::new(ErrorCode::InvalidPayload, "prompt is empty"));
    }

    let generation = librarian.call_outbound(prompt).await?;
    let message = if generation.ok {
        "cloud query complete"
    } else {
        "cloud query failed"
    };
    Ok((
        message.to_string(),
        json!({
            "ok": generation.ok,
            "output": generation.output,
            "error": generation.error,
        }),
    ))
}

fn checked_topic<'a>(librarian: &Librarian, topic: &'a str) -> Result<&'a str, Failure> {
    let topic = topic.trim();
    if topic.is_empty() {
        return Err(Failure::new(ErrorCode::InvalidPayload, "topic is empty"));
    }
    if is_blocked_topic(topic, &librarian.config.policy.topic_blocklist) {
        return Err(Failure::new(ErrorCode::BlockedTopic, "topic is blocked by policy"));
    }
    Ok(topic)
}

/// The synchronous reply only says whether generation worked; the note is
/// pushed afterwards.
async fn research(librarian: &Arc<Librarian>, topic: &str) -> Handled {
    let topic = checked_topic(librarian, topic)?;
    let sanitizer = &librarian.collaborators.sanitizer;
    let (clean_topic, _) = sanitizer.sanitize(topic);

    let generation = librarian.call_outbound(&research_prompt(&clean_topic)).await?;
    if !generation.ok {
        return Ok((
            "research failed".to_string(),
            json!({"ok": false, "error": generation.error}),
        ));
    }

    let (text, redacted) = sanitizer.sanitize(&generation.output);
    let details = note_details(
        &clean_topic,
        &text,
        redacted,
        librarian.config.policy.research_max_chars,
    );
    librarian.push_later(Notification::new(NotificationEvent::Note, details));
    Ok((
        "research complete; note will be pushed".to_string(),
        json!({"ok": true, "topic": clean_topic}),
    ))
}

async fn sources(librarian: &Arc<Librarian>, topic: &str) -> Handled {
    let topic = checked_topic(librarian, topic)?;
    let sanitizer = &librarian.collaborators.sanitizer;
    let (clean_topic, _) = sanitizer.sanitize(topic);

    let generation = librarian.call_outbound(&sources_prompt(&clean_topic)).await?;
    if !generation.ok {
        return Ok((
            "sources lookup failed".to_string(),
            json!({"ok": false, "error": generation.error}),
        ));
    }

    let (text, redacted) = sanitizer.sanitize(&generation.output);
    let list = parse_sources(&text);
    librarian.cache_sources(topic, &text, &list, Utc::now()).await;
    librarian.push_later(Notification::new(
        NotificationEvent::Sources,
        sources_details(&clean_topic, &text, &list, redacted),
    ));
    Ok((
        "sources found; list will be pushed".to_string(),
        json!({"ok": true, "topic": clean_topic, "count": list.len()}),
    ))
}

// ── Ingestion ────────────────────────────────────────────────────────────────

fn merge(report: &mut IngestReport, outcome: anyhow::Result<IngestReport>) {
    match outcome {
        Ok(part) => {
            report.ingested += part.ingested;
            report.errors.extend(part.errors);
        }
        Err(err) => report.errors.push(format!("{err:#}")),
    }
}

fn blocked(librarian: &Arc<Librarian>, details: Value, message: &str) -> Failure {
    librarian.push_later(Notification::new(NotificationEvent::IngestionBlocked, details));
    Failure::new(ErrorCode::ScanBlocked, message)
}

fn finish_ingest(
    librarian: &Arc<Librarian>,
    report: IngestReport,
    mut details: Value,
    scan_warning: bool,
) -> Handled {
    details["ingested"] = json!(report.ingested);
    details["errors"] = json!(report.errors);
    details["scan_warning"] = json!(scan_warning);
    librarian.push_later(Notification::new(
        NotificationEvent::IngestionComplete,
        details.clone(),
    ));
    Ok((format!("ingested {} document(s)", report.ingested), details))
}

async fn ingest_text(librarian: &Arc<Librarian>, text: &str, topic: &str, source: &str) -> Handled {
    if text.is_empty() {
        return Err(Failure::new(ErrorCode::InvalidPayload, "text is empty"));
    }

    let mode = librarian.config.policy.scan_mode;
    let (body, flagged) = if mode == ScanMode::Off {
        (text.to_string(), false)
    } else {
        librarian.collaborators.sanitizer.sanitize(text)
    };
    if flagged && mode == ScanMode::Block {
        return Err(blocked(
            librarian,
            json!({"topic": topic, "source": source, "reason": "sensitive content detected"}),
            "sensitive content detected; nothing ingested",
        ));
    }

    let mut report = IngestReport::default();
    merge(
        &mut report,
        librarian
            .collaborators
            .ingestor
            .ingest_text(&body, topic, source)
            .await,
    );
    finish_ingest(
        librarian,
        report,
        json!({"topic": topic, "source": source}),
        flagged,
    )
}

async fn ingest_chunk(librarian: &Arc<Librarian>, request_id: &str, chunk: IngestChunk) -> Handled {
    let progress = librarian
        .chunks
        .lock()
        .await
        .accept(request_id, chunk, Utc::now())?;
    match progress {
        ChunkProgress::Pending { received, total } => Ok((
            format!("chunk {received}/{total} received"),
            json!({"complete": false, "received": received, "total_chunks": total}),
        )),
        ChunkProgress::Complete(assembled) => {
            let (message, mut result) = ingest_text(
                librarian,
                &assembled.text,
                &assembled.topic,
                &assembled.source,
            )
            .await?;
            result["complete"] = json!(true);
            Ok((message, result))
        }
    }
}

async fn canonical_roots(roots: &[String]) -> Vec<PathBuf> {
    let mut resolved = Vec::with_capacity(roots.len());
    for root in roots {
        if let Ok(path) = tokio::fs::canonicalize(root).await {
            resolved.push(path);
        }
    }
    resolved
}

async fn resolve_allowed(raw: &str, roots: &[PathBuf]) -> Result<PathBuf, &'static str> {
    let path = tokio::fs::canonicalize(Path::new(raw))
        .await
        .map_err(|_| "does not exist")?;
    if !roots.iter().any(|root| path.starts_with(root)) {
        return Err("is outside the allowed roots");
    }
    let is_file = tokio::fs::metadata(&path)
        .await
        .is_ok_and(|meta| meta.is_file());
    if !is_file {
        return Err("is not a regular file");
    }
    Ok(path)
}

/// Every path must resolve to a file under an allowed root before anything
/// is ingested.
async fn ingest_paths(librarian: &Arc<Librarian>, paths: &[String]) -> Handled {
    if paths.is_empty() {
        return Err(Failure::new(ErrorCode::InvalidPayload, "paths is empty"));
    }
    let roots = canonical_roots(&librarian.config.policy.allowed_roots).await;
    let mut resolved = Vec::with_capacity(paths.len());
    for raw in paths {
        let path = resolve_allowed(raw, &roots)
            .await
            .map_err(|reason| Failure::new(ErrorCode::PathBlocked, format!("{raw} {reason}")))?;
        resolved.push(path);
    }

    let mode = librarian.config.policy.scan_mode;
    let sanitizer = &librarian.collaborators.sanitizer;
    let mut plain = Vec::new();
    let mut redacted = Vec::new();
    for path in resolved {
        if mode == ScanMode::Off {
            plain.push(path);
            continue;
        }
        // Unreadable files are left for the ingestor to report.
        let Ok(bytes) = tokio::fs::read(&path).await else {
            plain.push(path);
            continue;
        };
        let (clean, changed) = sanitizer.sanitize(&String::from_utf8_lossy(&bytes));
        if !changed {
            plain.push(path);
            continue;
        }
        if mode == ScanMode::Block {
            let shown = path.display().to_string();
            return Err(blocked(
                librarian,
                json!({"paths": [shown], "reason": "sensitive content detected"}),
                &format!("{shown}: sensitive content detected; nothing ingested"),
            ));
        }
        redacted.push((path, clean));
    }

    let ingestor = &librarian.collaborators.ingestor;
    let mut report = IngestReport::default();
    if !plain.is_empty() {
        merge(&mut report, ingestor.ingest_paths(&plain).await);
    }
    let warned: Vec<String> = redacted
        .iter()
        .map(|(path, _)| path.display().to_string())
        .collect();
    for ((_, clean), source) in redacted.iter().zip(&warned) {
        merge(&mut report, ingestor.ingest_text(clean, "", source).await);
    }

    let flagged = !warned.is_empty();
    finish_ingest(
        librarian,
        report,
        json!({"paths": paths.len(), "scan_warnings": warned}),
        flagged,
    )
}

async fn card_catalog(librarian: &Librarian) -> Handled {
    let catalog = librarian
        .collaborators
        .ingestor
        .card_catalog()
        .await
        .map_err(|err| {
            Failure::new(
                ErrorCode::InternalError,
                format!("card catalog unavailable: {err}"),
            )
        })?;
    let result = serde_json::to_value(&catalog)
        .map_err(|err| Failure::new(ErrorCode::InternalError, err.to_string()))?;
    Ok(("Card catalog generated".to_string(), result))
}

async fn cancel(librarian: &Librarian, target: &str) -> Handled {
    if librarian.chunks.lock().await.cancel(target) {
        Ok((
            "upload cancelled".to_string(),
            json!({"target_request_id": target}),
        ))
    } else {
        Err(Failure::new(
            ErrorCode::NotFound,
            format!("no pending upload with id {target}"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn resolve_allowed_enforces_roots_and_files() {
        let root = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let inside = root.path().join("doc.txt");
        std::fs::write(&inside, "x").unwrap();
        let stray = outside.path().join("doc.txt");
        std::fs::write(&stray, "x").unwrap();

        let roots = canonical_roots(&[root.path().display().to_string()]).await;
        assert!(resolve_allowed(&inside.display().to_string(), &roots).await.is_ok());
        assert_eq!(
            resolve_allowed(&stray.display().to_string(), &roots).await,
            Err("is outside the allowed roots")
        );
        assert_eq!(
            resolve_allowed(&root.path().display().to_string(), &roots).await,
            Err("is not a regular file")
        );
        assert_eq!(
            resolve_allowed(&root.path().join("nope").display().to_string(), &roots).await,
            Err("does not exist")
        );
    }

    #[tokio::test]
    async fn dot_dot_cannot_escape_a_root() {
        let parent = TempDir::new().unwrap();
        let root = parent.path().join("root");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(parent.path().join("secret.txt"), "x").unwrap();
        let roots = canonical_roots(&[root.display().to_string()]).await;
        let sneaky = root.join("..").join("secret.txt");
        assert_eq!(
            resolve_allowed(&sneaky.display().to_string(), &roots).await,
            Err("is outside the allowed roots")
        );
    }

    #[tokio::test]
    async fn missing_roots_are_dropped() {
        let root = TempDir::new().unwrap();
        let gone = root.path().join("gone").display().to_string();
        let roots = canonical_roots(&[gone, root.path().display().to_string()]).await;
        assert_eq!(roots.len(), 1);
        assert!(roots[0].ends_with(root.path().file_name().unwrap()));
    }

    #[test]
    fn merge_keeps_counts_and_errors() {
        let mut report = IngestReport::default();
        merge(
            &mut report,
            Ok(IngestReport {
                ingested: 2,
                errors: vec!["a".into()],
            }),
        );
        merge(&mut report, Err(anyhow::anyhow!("disk full")));
        assert_eq!(report.ingested, 2);
        assert_eq!(report.errors, vec!["a".to_string(), "disk full".to_string()]);
    }

    #[test]
    fn rejections_keep_their_codes() {
        let failure: Failure = Rejection::LocalOnly.into();
        assert_eq!(failure.code, ErrorCode::LocalOnly);
        let failure: Failure = ChunkError::InvalidTotal { total: 0, max: 1 }.into();
        assert_eq!(failure.code, ErrorCode::InvalidPayload);
    }
}
