//! Periodic upkeep: purge stale uploads, turn new `rag_gap` ledger entries
//! into rate-limited `gap` notifications, refresh stale source lists, and
//! send a heartbeat when nothing else was said.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use librarian_store::{LedgerEntry, ScanCursor, content_hash};

use super::Librarian;
use super::research::{is_blocked_topic, parse_sources, sources_details, sources_prompt};
use crate::protocol::{Notification, NotificationEvent};

const GAP_EVENT: &str = "rag_gap";

/// Emission times per topic, pruned to the rate window on every check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GapHistory {
    topics: HashMap<String, Vec<DateTime<Utc>>>,
}

impl GapHistory {
    /// Record an emission for `topic` unless it falls inside the dedupe
    /// window or the topic already used its quota for the rate window.
    pub fn admit(
        &mut self,
        topic: &str,
        now: DateTime<Utc>,
        dedupe: Duration,
        window: Duration,
        max_per_window: usize,
    ) -> bool {
        let times = self.topics.entry(topic.to_string()).or_default();
        times.retain(|at| now - *at < window);

        if times.last().is_some_and(|last| now - *last < dedupe) {
            return false;
        }
        if times.len() >= max_per_window {
            return false;
        }
        times.push(now);
        true
    }

    pub fn emitted(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, Vec::len)
    }

    /// Forget topics with no emission inside the window.
    pub fn prune(&mut self, now: DateTime<Utc>, window: Duration) {
        self.topics.retain(|_, times| {
            times.retain(|at| now - *at < window);
            !times.is_empty()
        });
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcesRecord {
    pub fetched_at: DateTime<Utc>,
    pub content_hash: String,
    pub sources: Vec<String>,
}

/// Everything upkeep needs to resume after a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpkeepState {
    pub cursor: ScanCursor,
    pub gap_history: GapHistory,
    pub sources_cache: HashMap<String, SourcesRecord>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpkeepReport {
    pub uploads_purged: usize,
    pub gaps_seen: usize,
    pub gaps_notified: usize,
    pub gaps_suppressed: usize,
    pub sources_refreshed: Vec<String>,
    pub heartbeat_sent: bool,
    pub ledger_rotated: bool,
}

impl UpkeepReport {
    pub fn is_quiet(&self) -> bool {
        self.uploads_purged == 0
            && self.gaps_seen == 0
            && self.sources_refreshed.is_empty()
            && !self.heartbeat_sent
            && !self.ledger_rotated
    }
}

fn secs(value: u64) -> Duration {
    Duration::seconds(value.min(i32::MAX as u64) as i64)
}

fn gap_topic(entry: &LedgerEntry) -> Option<String> {
    ["topic", "prompt"]
        .iter()
        .filter_map(|key| entry.data.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|topic| !topic.is_empty())
        .map(str::to_string)
}

impl Librarian {
    /// One upkeep pass.  Locks are taken per step and released before any
    /// outbound call or delivery.
    pub async fn run_upkeep(&self, now: DateTime<Utc>) -> Result<UpkeepReport> {
        let mut report = UpkeepReport {
            uploads_purged: self.chunks.lock().await.sweep(now),
            ..UpkeepReport::default()
        };
        if report.uploads_purged > 0 {
            info!(purged = report.uploads_purged, "stale chunk uploads purged");
        }

        let cursor = self.upkeep.lock().await.cursor.clone();
        let scan = self.ledger.scan(&cursor)?;
        report.ledger_rotated = scan.rotated;

        let upkeep_cfg = &self.config.upkeep;
        let dedupe = secs(upkeep_cfg.gap_dedupe_secs);
        let window = secs(upkeep_cfg.gap_rate_window_secs);
        let stale_after = secs(upkeep_cfg.sources_stale_after_secs);

        let mut gaps = Vec::new();
        let mut stale_topics = Vec::new();
        {
            let mut state = self.upkeep.lock().await;
            state.cursor = scan.cursor;
            for entry in scan.entries.iter().filter(|e| e.event == GAP_EVENT) {
                let Some(topic) = gap_topic(entry) else {
                    continue;
                };
                report.gaps_seen += 1;
                if !state.gap_history.admit(
                    &topic,
                    now,
                    dedupe,
                    window,
                    upkeep_cfg.gap_max_per_window,
                ) {
                    report.gaps_suppressed += 1;
                    continue;
                }

                // Staleness only exists for topics with cached sources; null otherwise.
                let cached = state.sources_cache.get(&topic);
                let age_secs = cached.map(|record| (now - record.fetched_at).num_seconds());
                let stale = cached.map(|record| now - record.fetched_at > stale_after);
                if stale == Some(true) && !stale_topics.contains(&topic) {
                    stale_topics.push(topic.clone());
                }
                gaps.push(json!({
                    "topic": topic,
                    "top_score": entry.data.get("top_score").cloned().unwrap_or(Value::Null),
                    "observed_at": entry.ts,
                    "suggestion": format!("request research on \"{topic}\""),
                    "sources_age_secs": age_secs,
                    "sources_stale": stale,
                    "stale": stale,
                }));
            }
            state.gap_history.prune(now, window);
        }

        report.gaps_notified = gaps.len();
        for details in gaps {
            self.push(Notification::new(NotificationEvent::Gap, details)).await;
        }

        if upkeep_cfg.auto_refresh_sources {
            if let Some(topic) = stale_topics.into_iter().next() {
                if self.refresh_sources(&topic, now).await {
                    report.sources_refreshed.push(topic);
                }
            }
        }

        let heartbeat_due = {
            let state = self.upkeep.lock().await;
            state.last_heartbeat_at.is_none_or(|last| {
                now - last >= secs(upkeep_cfg.heartbeat_interval_secs)
            })
        };
        if report.gaps_notified == 0 && heartbeat_due {
            self.push(Notification::new(
                NotificationEvent::Heartbeat,
                self.heartbeat_details(now).await,
            ))
            .await;
            self.upkeep.lock().await.last_heartbeat_at = Some(now);
            report.heartbeat_sent = true;
        }

        self.activity.lock().await.last_upkeep_at = Some(now);
        if let Err(err) = self.persist_state().await {
            warn!(?err, "failed to persist upkeep state");
        }
        Ok(report)
    }

    /// Fetch a fresh source list for `topic`, cache it and push it.  Refusals
    /// and failures are logged; the caller only learns whether it worked.
    async fn refresh_sources(&self, topic: &str, now: DateTime<Utc>) -> bool {
        if is_blocked_topic(topic, &self.config.policy.topic_blocklist) {
            debug!("stale sources refresh skipped for blocked topic");
            return false;
        }
        let sanitizer = &self.collaborators.sanitizer;
        let (clean_topic, _) = sanitizer.sanitize(topic);
        let generation = match self.call_outbound(&sources_prompt(&clean_topic)).await {
            Ok(generation) if generation.ok => generation,
            Ok(_) => return false,
            Err(rejection) => {
                debug!(code = %rejection.code(), "stale sources refresh refused");
                return false;
            }
        };

        let (text, redacted) = sanitizer.sanitize(&generation.output);
        let sources = parse_sources(&text);
        self.cache_sources(topic, &text, &sources, now).await;
        self.push(Notification::new(
            NotificationEvent::Sources,
            sources_details(&clean_topic, &text, &sources, redacted),
        ))
        .await;
        true
    }

    pub(super) async fn cache_sources(
        &self,
        topic: &str,
        text: &str,
        sources: &[String],
        now: DateTime<Utc>,
    ) {
        self.upkeep.lock().await.sources_cache.insert(
            topic.to_string(),
            SourcesRecord {
                fetched_at: now,
                content_hash: content_hash(text),
                sources: sources.to_vec(),
            },
        );
    }

    async fn heartbeat_details(&self, now: DateTime<Utc>) -> Value {
        let policy = self.policy_snapshot().await;
        let pending_uploads = self.pending_uploads().await;
        json!({
            "uptime_secs": (now - self.started_at).num_seconds().max(0),
            "pending_uploads": pending_uploads,
            "failure_count": policy.failure_count,
            "backoff_until": policy.backoff_until,
            "breaker_until": policy.breaker_until,
            "local_only": self.config.policy.local_only,
        })
    }
}
