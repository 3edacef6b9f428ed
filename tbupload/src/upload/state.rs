use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::AsyncWriteExt;

use super::paths::partial_path;
use super::planner::HashManifest;
use super::session::{PartialSession, SessionDefaults, UploadSession};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode session: {0}")]
    Encode(#[from] serde_yaml::Error),
}

/// Reads and writes the sidecar document of a single upload.
#[derive(Debug, Clone)]
pub struct ResumeStateStore {
    path: PathBuf,
}

impl ResumeStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Never fails: unreadable or malformed sidecars yield a fresh session.
    pub async fn load(&self, defaults: &SessionDefaults) -> UploadSession {
        let partial = match read_partial(&self.path).await {
            Some(partial) => partial,
            None => {
                tracing::debug!(path = %self.path.display(), "no usable sidecar, starting fresh");
                PartialSession::default()
            }
        };
        UploadSession::from_partial(partial, defaults)
    }

    /// Replaces the sidecar through a temporary sibling so a crash never
    /// leaves a truncated document behind.
    pub async fn save(&self, session: &UploadSession) -> Result<(), StateError> {
        let encoded = serde_yaml::to_string(session)?;
        let partial = partial_path(&self.path);
        let mut file = tokio::fs::File::create(&partial).await?;
        file.write_all(encoded.as_bytes()).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&partial, &self.path).await?;
        Ok(())
    }

    pub async fn delete(&self) {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %self.path.display(), "failed to remove sidecar: {err}");
            }
        }
    }
}

/// Reads the `hash` section of a `.tbhash` companion document.
pub async fn load_companion_manifest(path: &Path) -> Option<HashManifest> {
    read_partial(path).await?.hash
}

async fn read_partial(path: &Path) -> Option<PartialSession> {
    let text = tokio::fs::read_to_string(path).await.ok()?;
    PartialSession::from_yaml(&text)
}
