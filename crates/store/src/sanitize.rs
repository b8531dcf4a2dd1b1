//! Redaction of obvious secrets and identifiers.

use std::sync::Arc;

use anyhow::Result;
use regex::Regex;

/// Redacts sensitive content.  Returns the cleaned text and whether anything
/// was replaced.
pub trait Sanitizer: Send + Sync {
    fn sanitize(&self, text: &str) -> (String, bool);
}

pub type SharedSanitizer = Arc<dyn Sanitizer>;

#[derive(Debug, Clone)]
pub struct RegexSanitizer {
    rules: Vec<(Regex, &'static str)>,
}

impl RegexSanitizer {
    pub fn new() -> Result<Self> {
        let rules = vec![
            (
                Regex::new(
                    r"-----BEGIN [A-Z ]*PRIVATE KEY-----[\s\S]*?-----END [A-Z ]*PRIVATE KEY-----",
                )?,
                "[REDACTED_PRIVATE_KEY]",
            ),
            (Regex::new(r"sk-[A-Za-z0-9_\-]{10,}")?, "[REDACTED_KEY]"),
            (
                Regex::new(r"(?i)bearer\s+[A-Za-z0-9._\-]{16,}")?,
                "Bearer [REDACTED_TOKEN]",
            ),
            (
                Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}")?,
                "[REDACTED_EMAIL]",
            ),
            (Regex::new(r"[A-Za-z]:\\[^\s]{3,}")?, "[REDACTED_PATH]"),
            (Regex::new(r"/(?:home|Users)/[^/\s]+")?, "[REDACTED_PATH]"),
        ];
        Ok(Self { rules })
    }
}

impl Sanitizer for RegexSanitizer {
    fn sanitize(&self, text: &str) -> (String, bool) {
        let mut clean = text.to_string();
        let mut changed = false;
        for (pattern, replacement) in &self.rules {
            if pattern.is_match(&clean) {
                changed = true;
                clean = pattern.replace_all(&clean, *replacement).into_owned();
            }
        }
        (clean, changed)
    }
}
