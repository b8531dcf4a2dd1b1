//! Prompt wording and result shaping for research and sources requests.

use serde_json::{Value, json};
use uuid::Uuid;

use librarian_store::content_hash;

pub fn research_prompt(topic: &str) -> String {
    format!(
        "You are a research librarian. Write a concise, factual summary of the topic below \
         for a software developer. Prefer primary documentation and cite URLs inline where \
         you can.\n\nTopic: {topic}"
    )
}

pub fn sources_prompt(topic: &str) -> String {
    format!(
        "List reputable sources (official documentation, specifications, well-known \
         references) for the topic below. One source per line as a bulleted list, each with \
         a short name followed by its URL.\n\nTopic: {topic}"
    )
}

/// One source per non-empty line with bullets and ordinal markers removed.
pub fn parse_sources(text: &str) -> Vec<String> {
    text.lines()
        .map(strip_marker)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn strip_marker(line: &str) -> &str {
    let line = line.trim();
    if let Some(rest) = line
        .strip_prefix('-')
        .or_else(|| line.strip_prefix('*'))
        .or_else(|| line.strip_prefix('•'))
    {
        return rest.trim_start();
    }
    let digits = line.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(after) = rest.strip_prefix('.').or_else(|| rest.strip_prefix(')')) {
            return after.trim_start();
        }
    }
    line
}

/// Heuristic confidence in a generated result, in `[0, 1]`.
pub fn trust_score(ok: bool, text: &str, redacted: bool) -> f64 {
    if !ok {
        return 0.0;
    }
    let linked = text.lines().filter(|line| line.contains("http")).count();
    let mut score = 0.5 + (linked.min(3) as f64) * 0.1;
    if redacted {
        score -= 0.2;
    }
    score.clamp(0.0, 1.0)
}

/// Truncate to at most `max_chars` characters.
pub fn cap_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte, _)) => &text[..byte],
        None => text,
    }
}

pub fn is_blocked_topic(topic: &str, blocklist: &[String]) -> bool {
    let lowered = topic.to_lowercase();
    blocklist
        .iter()
        .map(|term| term.trim().to_lowercase())
        .any(|term| !term.is_empty() && lowered.contains(&term))
}

/// Details for a `note` push.  `text` must already be redacted.
pub fn note_details(topic: &str, text: &str, redacted: bool, max_chars: usize) -> Value {
    json!({
        "topic": topic,
        "note_id": Uuid::new_v4().to_string(),
        "trust_score": trust_score(true, text, redacted),
        "content_hash": content_hash(text),
        "summary": cap_chars(text, max_chars),
        "redacted": redacted,
    })
}

/// Details for a `sources` push.  `text` must already be redacted.
pub fn sources_details(topic: &str, text: &str, sources: &[String], redacted: bool) -> Value {
    json!({
        "topic": topic,
        "note_id": Uuid::new_v4().to_string(),
        "trust_score": trust_score(true, text, redacted),
        "content_hash": content_hash(text),
        "sources": sources,
        "redacted": redacted,
    })
}
