//! Append-only activity ledger shared with the foreground process.
//!
//! One JSON object per line: `{"entry": {"ts", "event", "data"}, "prev_hash",
//! "hash"}` where `hash = sha256(prev_hash || compact(entry))`.  The Librarian
//! reads it forward from a persisted [`ScanCursor`].

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::content_hash;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub ts: DateTime<Utc>,
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChainedRecord {
    entry: LedgerEntry,
    #[serde(default)]
    prev_hash: Option<String>,
    #[serde(default)]
    hash: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LedgerLine {
    Chained(ChainedRecord),
    Flat(LedgerEntry),
}

impl LedgerLine {
    fn into_entry(self) -> LedgerEntry {
        match self {
            LedgerLine::Chained(record) => record.entry,
            LedgerLine::Flat(entry) => entry,
        }
    }
}

/// Resumable scan position: byte offset of the next unread line plus the
/// newest timestamp already emitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCursor {
    pub offset: u64,
    pub last_ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct LedgerScan {
    pub entries: Vec<LedgerEntry>,
    pub cursor: ScanCursor,
    /// The file was shorter than the stored offset and the cursor was reset
    /// to its end.
    pub rotated: bool,
}

#[derive(Debug, Clone)]
pub struct ActivityLedger {
    path: PathBuf,
}

impl ActivityLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every complete line after `cursor`.
    ///
    /// Entries at or before `cursor.last_ts` are skipped.  A trailing line
    /// without a newline is left for the next scan.
    pub fn scan(&self, cursor: &ScanCursor) -> Result<LedgerScan> {
        let mut next = cursor.clone();
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LedgerScan {
                    entries: Vec::new(),
                    cursor: next,
                    rotated: false,
                });
            }
            Err(err) => return Err(err.into()),
        };

        let len = file.metadata()?.len();
        if len < cursor.offset {
            warn!(
                path = %self.path.display(),
                stored = cursor.offset,
                len,
                "ledger shrank below cursor; resetting to end of file"
            );
            next.offset = len;
            return Ok(LedgerScan {
                entries: Vec::new(),
                cursor: next,
                rotated: true,
            });
        }

        file.seek(SeekFrom::Start(cursor.offset))?;
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = reader.read_until(b'\n', &mut line)?;
            if read == 0 || line.last() != Some(&b'\n') {
                break;
            }
            next.offset += read as u64;

            let text = String::from_utf8_lossy(&line);
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }
            let entry = match serde_json::from_str::<LedgerLine>(trimmed) {
                Ok(parsed) => parsed.into_entry(),
                Err(err) => {
                    warn!(
                        path = %self.path.display(),
                        offset = next.offset,
                        error = %err,
                        "unparseable ledger line skipped"
                    );
                    continue;
                }
            };
            // Compared against the resume point, so lines sharing a timestamp
            // within one pass all survive.
            if cursor.last_ts.is_some_and(|last| entry.ts <= last) {
                continue;
            }
            next.last_ts = next.last_ts.max(Some(entry.ts));
            entries.push(entry);
        }

        Ok(LedgerScan {
            entries,
            cursor: next,
            rotated: false,
        })
    }

    /// Append a hash-chained entry.
    pub fn append(&self, event: &str, data: serde_json::Value) -> Result<LedgerEntry> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let prev_hash = self.last_hash()?;
        let entry = LedgerEntry {
            ts: Utc::now(),
            event: event.to_string(),
            data,
        };
        let payload = serde_json::to_string(&entry)?;
        let hash = content_hash(&format!("{}{payload}", prev_hash.as_deref().unwrap_or("")));
        let record = ChainedRecord {
            entry: entry.clone(),
            prev_hash,
            hash: Some(hash),
        };

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(&record)?)?;
        file.sync_all()?;
        Ok(entry)
    }

    fn last_hash(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let last = raw
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .and_then(|line| serde_json::from_str::<ChainedRecord>(line).ok());
        Ok(last.and_then(|record| record.hash))
    }
}
