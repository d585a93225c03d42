//! Per-call ownership of temporary files.
//!
//! Every `generate` call creates one `ResourceScope` and threads it through
//! the pipeline. Files registered here are removed when the scope is
//! cleaned up or dropped, so one call never touches another call's files.
//! Directories the scope had to create are removed afterwards when empty.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tempfile::TempPath;

use crate::types::Result;

/// Temporary files owned by a single pipeline run.
#[derive(Default)]
pub struct ResourceScope {
    files: Mutex<Vec<TempPath>>,
    /// Created directories, deepest first.
    dirs: Mutex<Vec<PathBuf>>,
}

impl ResourceScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `contents` to a fresh temp file and register it with the scope.
    pub async fn write_temp(&self, suffix: &str, contents: &[u8]) -> Result<PathBuf> {
        self.write_temp_in(&std::env::temp_dir(), suffix, contents)
            .await
    }

    /// Like [`write_temp`](Self::write_temp) but inside `dir`.
    pub async fn write_temp_in(&self, dir: &Path, suffix: &str, contents: &[u8]) -> Result<PathBuf> {
        let temp = tempfile::Builder::new()
            .prefix("abovefold-")
            .suffix(suffix)
            .tempfile_in(dir)?
            .into_temp_path();
        let path = temp.to_path_buf();
        self.register(temp);
        tokio::fs::write(&path, contents).await?;
        tracing::debug!("wrote temp file {}", path.display());
        Ok(path)
    }

    /// Make sure `dir` exists, remembering every directory created on the
    /// way so cleanup can remove it again.
    pub async fn ensure_dir(&self, dir: &Path) -> Result<()> {
        let missing: Vec<PathBuf> = dir
            .ancestors()
            .take_while(|ancestor| !ancestor.as_os_str().is_empty() && !ancestor.exists())
            .map(Path::to_path_buf)
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        tokio::fs::create_dir_all(dir).await?;
        tracing::debug!("created directory {}", dir.display());
        self.dirs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(missing);
        Ok(())
    }

    fn register(&self, temp: TempPath) {
        self.files
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(temp);
    }

    pub fn len(&self) -> usize {
        self.files
            .lock()
            .map(|files| files.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every registered file. Failures are logged, not raised.
    pub fn cleanup(&self) {
        let files: Vec<TempPath> = self
            .files
            .lock()
            .map(|mut files| files.drain(..).collect())
            .unwrap_or_default();
        for file in files {
            let shown = file.display().to_string();
            if let Err(e) = file.close() {
                tracing::warn!("failed to remove temp file {shown}: {e}");
            }
        }
        let dirs: Vec<PathBuf> = self
            .dirs
            .lock()
            .map(|mut dirs| dirs.drain(..).collect())
            .unwrap_or_default();
        for dir in dirs {
            // Only empty directories go; anything else was written by someone else.
            if let Err(e) = std::fs::remove_dir(&dir) {
                tracing::debug!("left directory {} in place: {e}", dir.display());
            }
        }
    }
}

impl Drop for ResourceScope {
    fn drop(&mut self) {
        self.cleanup();
    }
}
