use std::path::{Path, PathBuf};

use tokio::fs;

/// Fixed subfolder under the OS temp directory that every temp file lives under.
const SCRATCH_SUBDIR: &str = "cap-media-server";

pub fn scratch_dir() -> PathBuf {
    std::env::temp_dir().join(SCRATCH_SUBDIR)
}

pub async fn ensure_scratch_dir() -> std::io::Result<PathBuf> {
    let dir = scratch_dir();
    fs::create_dir_all(&dir).await?;
    Ok(dir)
}

/// A uniquely-named scratch file owned by whoever created it. `cleanup` unlinks the
/// path and tolerates it already being gone — callers may race a subprocess crash,
/// a job cancellation, and a manual cleanup call against the same handle.
#[derive(Debug, Clone)]
pub struct TempFileHandle {
    path: PathBuf,
}

impl TempFileHandle {
    /// Allocates a new path under the scratch directory; does not create the file.
    pub fn new(extension: &str) -> Self {
        let name = uuid::Uuid::new_v4().to_string();
        let file_name = if extension.is_empty() {
            name
        } else {
            format!("{name}.{extension}")
        };
        Self {
            path: scratch_dir().join(file_name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Idempotent: a second call, or a call after the subprocess already unlinked
    /// the file, is a no-op rather than an error.
    pub async fn cleanup(&self) {
        match fs::remove_file(&self.path).await {
            Ok(()) => tracing::trace!(path = %self.path.display(), "removed temp file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %self.path.display(), "failed to remove temp file: {e}"),
        }
    }
}

/// Removes scratch files whose modification time is older than `max_age`. Used by
/// both the periodic job-registry sweep and the `/video/cleanup` endpoint.
pub async fn purge_stale(max_age: std::time::Duration) -> std::io::Result<usize> {
    let dir = ensure_scratch_dir().await?;
    let mut removed = 0;
    let mut entries = fs::read_dir(&dir).await?;
    let now = std::time::SystemTime::now();
    while let Some(entry) = entries.next_entry().await? {
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        let Ok(age) = now.duration_since(modified) else {
            continue;
        };
        if age > max_age {
            if fs::remove_file(entry.path()).await.is_ok() {
                removed += 1;
            } else {
                tracing::warn!(path = ?entry.path(), "failed to purge stale temp file");
            }
        }
    }
    Ok(removed)
}
