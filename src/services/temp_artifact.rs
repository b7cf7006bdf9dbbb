//! src/services/temp_artifact.rs
//!
//! Scoped lifecycle for the local files that stage a dump between the dump
//! engine and the object store. Every artifact is removed exactly once, on
//! success, on error and when the owning future is dropped mid-flight.

use std::{
    future::Future,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

/// Hands out unique artifact paths beneath a staging directory.
#[derive(Clone, Debug)]
pub struct TempArtifacts {
    dir: PathBuf,
    prefix: String,
}

impl TempArtifacts {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            prefix: "cold-archive".into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reserve a fresh, non-colliding path. Nothing is created on disk;
    /// the staging directory itself is created if missing.
    pub async fn acquire(&self) -> io::Result<TempArtifact> {
        fs::create_dir_all(&self.dir).await?;
        let path = self
            .dir
            .join(format!("{}-{}.dump", self.prefix, Uuid::new_v4()));
        debug!("acquired temp artifact {}", path.display());
        Ok(TempArtifact {
            path,
            released: false,
        })
    }

    /// Run `op` with a fresh artifact path and remove the path afterwards,
    /// whatever the outcome. Cleanup failures are logged, never returned, so
    /// they cannot mask the operation's own error.
    pub async fn with_temp_artifact<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<io::Error>,
    {
        let artifact = self.acquire().await?;
        let result = op(artifact.path().to_path_buf()).await;
        artifact.release().await;
        result
    }
}

/// A reserved artifact path. Removed on [`release`](Self::release) or, as a
/// fallback, synchronously on drop.
#[derive(Debug)]
pub struct TempArtifact {
    path: PathBuf,
    released: bool,
}

impl TempArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn release(mut self) {
        self.released = true;
        match fs::remove_file(&self.path).await {
            Ok(()) => debug!("removed temp artifact {}", self.path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("temp artifact {} already gone", self.path.display());
            }
            Err(err) => warn!(
                "failed to remove temp artifact {}: {}",
                self.path.display(),
                err
            ),
        }
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("removed abandoned temp artifact {}", self.path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(
                "failed to remove abandoned temp artifact {}: {}",
                self.path.display(),
                err
            ),
        }
    }
}
