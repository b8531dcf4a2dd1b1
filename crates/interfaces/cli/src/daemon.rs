use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use fs2::FileExt;
use tracing::info;

use librarian_config::LibrarianConfig;
use librarian_runtime::run_librarian;

pub(crate) const RUNTIME_DIR: &str = ".librarian";

#[derive(Debug, Clone)]
pub(crate) struct RuntimePaths {
    runtime_dir: PathBuf,
    pub(crate) pid_file: PathBuf,
    pub(crate) lock_file: PathBuf,
}

impl RuntimePaths {
    pub(crate) fn under(runtime_dir: impl Into<PathBuf>) -> Self {
        let runtime_dir = runtime_dir.into();
        Self {
            pid_file: runtime_dir.join("librarian.pid"),
            lock_file: runtime_dir.join("librarian.lock"),
            runtime_dir,
        }
    }
}

/// Take the single-instance lock.  The lock lasts as long as the returned
/// file handle.
pub(crate) fn acquire_lock(paths: &RuntimePaths) -> Result<File> {
    fs::create_dir_all(&paths.runtime_dir)?;
    let lock_file = File::create(&paths.lock_file)?;
    lock_file.try_lock_exclusive().map_err(|_| {
        anyhow!(
            "another librarian instance already holds the lock at {}",
            paths.lock_file.display()
        )
    })?;
    Ok(lock_file)
}

pub(crate) fn read_pid(path: &Path) -> Result<Option<u32>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)?;
    Ok(raw.trim().parse::<u32>().ok())
}

/// `librarian serve`: lock, log, run until a signal or a `shutdown` request.
pub(crate) async fn run_serve(config: LibrarianConfig, runtime_dir: &Path) -> Result<()> {
    let log_dir = config.telemetry.log_dir.trim();
    let log_dir = (!log_dir.is_empty()).then(|| PathBuf::from(log_dir));
    // Dropping the guard flushes the file writer, so it lives until return.
    let _log_guard = crate::init_tracing(&config, log_dir.as_deref())?;

    let paths = RuntimePaths::under(runtime_dir);
    let _lock = acquire_lock(&paths)?;
    fs::write(&paths.pid_file, std::process::id().to_string())?;
    info!(
        pid = std::process::id(),
        address = %config.server.address(),
        push = config.callback.enabled(),
        "starting librarian"
    );

    let result = run_librarian(config).await;

    let _ = fs::remove_file(&paths.pid_file);
    let _ = fs::remove_file(&paths.lock_file);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_instance_cannot_take_the_lock() {
        let dir = TempDir::new().unwrap();
        let paths = RuntimePaths::under(dir.path().join("run"));
        let held = acquire_lock(&paths).unwrap();
        let err = acquire_lock(&paths).unwrap_err();
        assert!(err.to_string().contains("already holds the lock"));

        drop(held);
        assert!(acquire_lock(&paths).is_ok());
    }

    #[test]
    fn read_pid_tolerates_missing_and_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("librarian.pid");
        assert_eq!(read_pid(&path).unwrap(), None);
        fs::write(&path, "not a pid").unwrap();
        assert_eq!(read_pid(&path).unwrap(), None);
        fs::write(&path, "4242\n").unwrap();
        assert_eq!(read_pid(&path).unwrap(), Some(4242));
    }
}
