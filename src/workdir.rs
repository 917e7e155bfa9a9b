//! The per-attempt scratch directory.

use crate::error::WorkerError;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A directory owned by the worker and wiped before every attempt, so no
/// attempt ever sees another's files.
#[derive(Debug, Clone)]
pub struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Remove the directory and everything in it, then recreate it empty.
    pub async fn prepare(&self) -> Result<(), WorkerError> {
        let failed = |source| WorkerError::WorkDirFailed {
            path: self.path.clone(),
            source,
        };
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(failed(e)),
        }
        tokio::fs::create_dir_all(&self.path).await.map_err(failed)?;
        debug!(path = %self.path.display(), "Working directory ready");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prepare_creates_missing_dir() {
        let root = tempfile::tempdir().unwrap();
        let wd = WorkDir::new(root.path().join("a/b"));
        wd.prepare().await.unwrap();
        assert!(wd.path().is_dir());
    }

    #[tokio::test]
    async fn prepare_wipes_previous_attempt() {
        let root = tempfile::tempdir().unwrap();
        let wd = WorkDir::new(root.path().join("w"));
        wd.prepare().await.unwrap();
        std::fs::write(wd.join("0.json"), "{}").unwrap();
        std::fs::create_dir(wd.join("nested")).unwrap();

        wd.prepare().await.unwrap();
        assert_eq!(std::fs::read_dir(wd.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn file_in_the_way_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let blocker = root.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let err = WorkDir::new(blocker.join("sub")).prepare().await.unwrap_err();
        assert!(matches!(err, WorkerError::WorkDirFailed { .. }));
    }
}
