//! Reassembly of text uploads split across `ingest_text_chunk` messages.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::protocol::IngestChunk;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("total_chunks must be between 1 and {max}, got {total}")]
    InvalidTotal { total: usize, max: usize },
    #[error("chunk_index {index} is out of range for {total} chunks")]
    IndexOutOfRange { index: usize, total: usize },
    #[error("total_chunks {declared} does not match the {expected} already recorded for this upload")]
    TotalMismatch { declared: usize, expected: usize },
}

#[derive(Debug, Clone)]
struct ChunkBuffer {
    slots: Vec<Option<String>>,
    topic: String,
    source: String,
    touched_at: DateTime<Utc>,
}

impl ChunkBuffer {
    fn received(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledText {
    pub text: String,
    pub topic: String,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkProgress {
    Pending { received: usize, total: usize },
    Complete(AssembledText),
}

/// In-progress uploads keyed by the request id every chunk shares.
#[derive(Debug)]
pub struct ChunkTable {
    buffers: HashMap<String, ChunkBuffer>,
    max_chunks: usize,
    ttl: Duration,
}

impl ChunkTable {
    pub fn new(max_chunks: usize, ttl_secs: u64) -> Self {
        Self {
            buffers: HashMap::new(),
            max_chunks,
            ttl: Duration::seconds(ttl_secs.min(i32::MAX as u64) as i64),
        }
    }

    /// Store one fragment.  A rejected fragment leaves any existing buffer
    /// untouched.  The final fragment removes the buffer and returns the
    /// joined text.
    pub fn accept(
        &mut self,
        request_id: &str,
        chunk: IngestChunk,
        now: DateTime<Utc>,
    ) -> Result<ChunkProgress, ChunkError> {
        let total = chunk.total_chunks;
        if total == 0 || total > self.max_chunks {
            return Err(ChunkError::InvalidTotal {
                total,
                max: self.max_chunks,
            });
        }
        if chunk.chunk_index >= total {
            return Err(ChunkError::IndexOutOfRange {
                index: chunk.chunk_index,
                total,
            });
        }
        if let Some(existing) = self.buffers.get(request_id) {
            if existing.slots.len() != total {
                return Err(ChunkError::TotalMismatch {
                    declared: total,
                    expected: existing.slots.len(),
                });
            }
        }

        let buffer = self
            .buffers
            .entry(request_id.to_string())
            .or_insert_with(|| ChunkBuffer {
                slots: vec![None; total],
                topic: chunk.topic.clone(),
                source: chunk.source.clone(),
                touched_at: now,
            });
        buffer.slots[chunk.chunk_index] = Some(chunk.chunk);
        buffer.touched_at = now;

        let received = buffer.received();
        if received < total {
            return Ok(ChunkProgress::Pending { received, total });
        }

        match self.buffers.remove(request_id) {
            Some(done) => Ok(ChunkProgress::Complete(AssembledText {
                text: done.slots.into_iter().flatten().collect(),
                topic: done.topic,
                source: done.source,
            })),
            None => Ok(ChunkProgress::Pending { received, total }),
        }
    }

    pub fn cancel(&mut self, request_id: &str) -> bool {
        self.buffers.remove(request_id).is_some()
    }

    /// Drop buffers untouched for longer than the TTL.  Returns how many.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.buffers.len();
        let ttl = self.ttl;
        self.buffers.retain(|_, buffer| now - buffer.touched_at <= ttl);
        before - self.buffers.len()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.buffers.contains_key(request_id)
    }
}
