//! Ingestion collaborator: hands documents to the retrieval store.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub ingested: usize,
    pub errors: Vec<String>,
}

/// Documents on one shelf of the card catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogShelf {
    pub count: usize,
    pub files: Vec<String>,
}

/// Distinct ingested sources grouped by file type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardCatalog {
    pub total_docs: usize,
    pub card_catalog: BTreeMap<String, CatalogShelf>,
}

impl CardCatalog {
    /// Empty sources are skipped; duplicates are counted once.  Files on each
    /// shelf are sorted.
    pub fn from_sources<'a>(sources: impl IntoIterator<Item = &'a str>) -> Self {
        let distinct: BTreeSet<&str> = sources.into_iter().filter(|s| !s.is_empty()).collect();
        let mut card_catalog: BTreeMap<String, CatalogShelf> = BTreeMap::new();
        for source in &distinct {
            let shelf = card_catalog.entry(shelf_for(source).to_string()).or_default();
            shelf.files.push(source.to_string());
            shelf.count += 1;
        }
        Self {
            total_docs: distinct.len(),
            card_catalog,
        }
    }
}

/// Shelf name for a source path, by extension.
pub fn shelf_for(source: &str) -> &'static str {
    let extension = Path::new(source)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("rs") => "RUST_SRC",
        Some("py") => "PYTHON_SRC",
        Some("md") => "MARKDOWN_DOCS",
        Some("txt") => "TEXT_FILES",
        Some("json" | "jsonl") => "JSON_DATA",
        Some("yaml" | "yml" | "toml") => "CONFIG_FILES",
        _ => "MISC",
    }
}

#[async_trait]
pub trait Ingestor: Send + Sync {
    async fn ingest_text(&self, text: &str, topic: &str, source: &str) -> Result<IngestReport>;
    async fn ingest_paths(&self, paths: &[PathBuf]) -> Result<IngestReport>;
    /// What the store currently holds, grouped for browsing.
    async fn card_catalog(&self) -> Result<CardCatalog>;
}

pub type SharedIngestor = Arc<dyn Ingestor>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusRecord {
    pub id: Uuid,
    pub ingested_at: DateTime<Utc>,
    pub topic: String,
    pub source: String,
    pub text: String,
}

/// Appends every ingested document to a JSONL corpus file.
#[derive(Debug, Clone)]
pub struct JsonlIngestor {
    path: PathBuf,
}

impl JsonlIngestor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, record: &CorpusRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        // One write per record keeps concurrent appends line-atomic.
        file.write_all(&line).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    pub fn load(&self) -> Result<Vec<CorpusRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        parse_records(&std::fs::read_to_string(&self.path)?)
    }
}

fn parse_records(raw: &str) -> Result<Vec<CorpusRecord>> {
    let mut records = Vec::new();
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        records.push(serde_json::from_str(line)?);
    }
    Ok(records)
}

#[async_trait]
impl Ingestor for JsonlIngestor {
    async fn ingest_text(&self, text: &str, topic: &str, source: &str) -> Result<IngestReport> {
        self.append(&CorpusRecord {
            id: Uuid::new_v4(),
            ingested_at: Utc::now(),
            topic: topic.to_string(),
            source: source.to_string(),
            text: text.to_string(),
        })
        .await?;
        Ok(IngestReport {
            ingested: 1,
            errors: Vec::new(),
        })
    }

    async fn ingest_paths(&self, paths: &[PathBuf]) -> Result<IngestReport> {
        let mut report = IngestReport::default();
        for path in paths {
            let bytes = match tokio::fs::read(path).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    report.errors.push(format!("{}: {err}", path.display()));
                    continue;
                }
            };
            let text = String::from_utf8_lossy(&bytes);
            self.append(&CorpusRecord {
                id: Uuid::new_v4(),
                ingested_at: Utc::now(),
                topic: String::new(),
                source: path.display().to_string(),
                text: text.into_owned(),
            })
            .await?;
            report.ingested += 1;
        }
        Ok(report)
    }

    async fn card_catalog(&self) -> Result<CardCatalog> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err.into()),
        };
        let records = parse_records(&raw)?;
        Ok(CardCatalog::from_sources(
            records.iter().map(|record| record.source.as_str()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn ingest_text_appends_record() {
        let dir = TempDir::new().unwrap();
        let ingestor = JsonlIngestor::new(dir.path().join("corpus/corpus.jsonl"));
        let report = ingestor.ingest_text("hello", "greeting", "unit").await.unwrap();
        assert_eq!(report.ingested, 1);
        let records = ingestor.load().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].topic, "greeting");
        assert_eq!(records[0].text, "hello");
    }

    #[tokio::test]
    async fn card_catalog_groups_distinct_sources_by_type() {
        let dir = TempDir::new().unwrap();
        let ingestor = JsonlIngestor::new(dir.path().join("corpus.jsonl"));
        assert_eq!(ingestor.card_catalog().await.unwrap(), CardCatalog::default());

        let notes = dir.path().join("notes.MD");
        let lib = dir.path().join("lib.rs");
        std::fs::write(&notes, "# notes").unwrap();
        std::fs::write(&lib, "fn main() {}").unwrap();
        ingestor.ingest_paths(&[notes.clone(), lib.clone()]).await.unwrap();
        ingestor.ingest_paths(&[notes.clone()]).await.unwrap();
        ingestor.ingest_text("pasted", "", "").await.unwrap();
        ingestor.ingest_text("blob", "", "dump.bin").await.unwrap();

        let catalog = ingestor.card_catalog().await.unwrap();
        assert_eq!(catalog.total_docs, 3);
        assert_eq!(
            catalog.card_catalog["MARKDOWN_DOCS"].files,
            vec![notes.display().to_string()]
        );
        assert_eq!(catalog.card_catalog["RUST_SRC"].count, 1);
        assert_eq!(catalog.card_catalog["MISC"].files, vec!["dump.bin".to_string()]);
        assert_eq!(catalog.card_catalog.len(), 3);
    }

    #[test]
    fn shelves_follow_the_extension() {
        assert_eq!(shelf_for("a/b/config.YML"), "CONFIG_FILES");
        assert_eq!(shelf_for("script.py"), "PYTHON_SRC");
        assert_eq!(shelf_for("data.json"), "JSON_DATA");
        assert_eq!(shelf_for("README"), "MISC");
    }

    #[tokio::test]
    async fn ingest_paths_reports_unreadable_files() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("a.txt");
        std::fs::write(&good, "alpha").unwrap();
        let missing = dir.path().join("missing.txt");

        let ingestor = JsonlIngestor::new(dir.path().join("corpus.jsonl"));
        let report = ingestor.ingest_paths(&[good, missing]).await.unwrap();
        assert_eq!(report.ingested, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("missing.txt"));
    }
}
