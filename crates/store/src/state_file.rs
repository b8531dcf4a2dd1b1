//! Small JSON state files written atomically (temp file + rename).

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;

fn tmp_sibling(path: &Path) -> PathBuf {
    let filename = path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| "state.json".to_string());
    path.with_file_name(format!("{filename}.tmp"))
}

/// Load `path`, falling back to `T::default()` when it does not exist.
pub fn load_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let raw = std::fs::read_to_string(path)?;
    if raw.trim().is_empty() {
        return Ok(T::default());
    }
    Ok(serde_json::from_str(&raw)?)
}

/// Replace `path` with the pretty-printed JSON of `value`.
///
/// A crash before the rename leaves the previous file untouched.
pub async fn save_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = tmp_sibling(path);
    let rendered = serde_json::to_vec_pretty(value)?;

    let write_result: Result<()> = async {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .await?;
        file.write_all(&rendered).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
    .await;

    if let Err(err) = write_result {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err);
    }
    if let Err(err) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Sample {
        count: u32,
        name: String,
    }

    #[test]
    fn missing_file_yields_default() {
        let dir = TempDir::new().unwrap();
        let loaded: Sample = load_or_default(&dir.path().join("nope.json")).unwrap();
        assert_eq!(loaded, Sample::default());
    }

    #[tokio::test]
    async fn save_then_load_roundtrip_leaves_no_tmp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/state.json");
        let value = Sample {
            count: 3,
            name: "x".to_string(),
        };
        save_atomic(&path, &value).await.unwrap();
        let loaded: Sample = load_or_default(&path).unwrap();
        assert_eq!(loaded, value);
        assert!(!tmp_sibling(&path).exists());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{oops").unwrap();
        assert!(load_or_default::<Sample>(&path).is_err());
    }
}
