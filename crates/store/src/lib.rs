pub mod ingest;
pub mod ledger;
pub mod sanitize;
pub mod state_file;

pub use ingest::{
    CardCatalog, CatalogShelf, IngestReport, Ingestor, JsonlIngestor, SharedIngestor, shelf_for,
};
pub use ledger::{ActivityLedger, LedgerEntry, LedgerScan, ScanCursor};
pub use sanitize::{RegexSanitizer, Sanitizer, SharedSanitizer};

use sha2::{Digest, Sha256};

/// SHA-256 hex digest of `text`.
pub fn content_hash(text: &str) -> String {
    let mut h = Sha256::new();
    h.update(text.as_bytes());
    format!("{:x}", h.finalize())
}
