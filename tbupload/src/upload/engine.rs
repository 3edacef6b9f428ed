use std::io;
use std::path::Path;

use thiserror::Error;

use super::coordinator::{CoordinatorError, UploadCoordinator, pool_size_for};
use super::finalize::{FinalizeError, FinalizeVerifier};
use super::negotiate::{NegotiateError, negotiate};
use super::paths::{
    PathError, hash_companion_path, is_hash_only, normalize_remote_dir, remote_target_path,
    sidecar_path_for, target_file_name,
};
use super::planner::{PlanError, chunk_count, hash_file, plan_chunk_size};
use super::retry::{RetryPolicy, retry_transient};
use super::session::{SessionDefaults, UploadSession};
use super::skip::already_uploaded;
use super::state::{ResumeStateStore, StateError, load_companion_manifest};
use crate::remote::{AuthorizedRemote, RemoteError};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("file size {size} is outside the supported range 1..={max}")]
    SizeUnsupported { size: u64, max: u64 },
    #[error("remote rejected the upload: {0}")]
    RemoteRejected(String),
    #[error("remote kept failing: {0}")]
    Transient(String),
    #[error("chunk {index} failed after {attempts} attempts: {last_error}")]
    ChunkUploadFailed {
        index: usize,
        attempts: u32,
        last_error: String,
    },
    #[error(
        "integrity mismatch for {remote_path}: expected {expected_id} ({expected_size} bytes), \
         remote reported {actual_id} ({actual_size} bytes)"
    )]
    IntegrityMismatch {
        remote_path: String,
        expected_id: String,
        actual_id: String,
        expected_size: u64,
        actual_size: u64,
    },
    #[error("local filesystem error: {0}")]
    LocalFs(#[from] io::Error),
    #[error("remote login is not valid: {0}")]
    Auth(String),
    #[error("internal upload error: {0}")]
    Internal(String),
}

impl From<RemoteError> for UploadError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Rejected(message) => UploadError::RemoteRejected(message),
            RemoteError::Transient(message) => UploadError::Transient(message),
            RemoteError::Auth(message) => UploadError::Auth(message),
        }
    }
}

impl From<PathError> for UploadError {
    fn from(err: PathError) -> Self {
        UploadError::LocalFs(io::Error::new(io::ErrorKind::InvalidInput, err))
    }
}

impl From<PlanError> for UploadError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::SizeUnsupported { size, max } => UploadError::SizeUnsupported { size, max },
            PlanError::Io(err) => UploadError::LocalFs(err),
            other @ PlanError::SizeChanged { .. } => UploadError::LocalFs(io::Error::other(other)),
        }
    }
}

impl From<StateError> for UploadError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::Io(err) => UploadError::LocalFs(err),
            other @ StateError::Encode(_) => UploadError::LocalFs(io::Error::other(other)),
        }
    }
}

impl From<NegotiateError> for UploadError {
    fn from(err: NegotiateError) -> Self {
        match err {
            NegotiateError::Remote(err) => err.into(),
            other @ NegotiateError::ChunkOutOfRange { .. } => {
                UploadError::RemoteRejected(other.to_string())
            }
            other @ NegotiateError::MissingManifest => UploadError::Internal(other.to_string()),
        }
    }
}

impl From<CoordinatorError> for UploadError {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::ChunkUploadFailed {
                index,
                attempts,
                last_error,
            } => UploadError::ChunkUploadFailed {
                index,
                attempts,
                last_error,
            },
            CoordinatorError::Remote { index, source } => match source {
                RemoteError::Rejected(message) => {
                    UploadError::RemoteRejected(format!("chunk {index}: {message}"))
                }
                other => other.into(),
            },
            CoordinatorError::Read { source, .. } => UploadError::LocalFs(source),
            other @ CoordinatorError::SourceChanged { .. } => {
                UploadError::LocalFs(io::Error::other(other))
            }
            CoordinatorError::State(err) => err.into(),
            other => UploadError::Internal(other.to_string()),
        }
    }
}

impl From<FinalizeError> for UploadError {
    fn from(err: FinalizeError) -> Self {
        match err {
            FinalizeError::Remote(err) => err.into(),
            FinalizeError::IntegrityMismatch {
                remote_path,
                expected_id,
                actual_id,
                expected_size,
                actual_size,
            } => UploadError::IntegrityMismatch {
                remote_path,
                expected_id,
                actual_id,
                expected_size,
                actual_size,
            },
            other @ FinalizeError::NotReady(_) => UploadError::Internal(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The target name already existed remotely; nothing was sent.
    Skipped { remote_path: String },
    Uploaded {
        remote_path: String,
        sent_chunks: usize,
    },
}

impl UploadOutcome {
    pub fn remote_path(&self) -> &str {
        match self {
            UploadOutcome::Skipped { remote_path } => remote_path,
            UploadOutcome::Uploaded { remote_path, .. } => remote_path,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    New,
    Hashed,
    Negotiated,
    Uploading,
    Finalizing,
    Verified,
    Mismatch,
    Failed,
}

impl UploadPhase {
    /// Where a loaded session picks up: cached manifests skip hashing.
    pub fn resume_point(session: &UploadSession) -> Self {
        match (&session.hash, session.upload_id.is_empty()) {
            (None, _) => UploadPhase::New,
            (Some(_), true) => UploadPhase::Hashed,
            (Some(_), false) => UploadPhase::Negotiated,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UploadOptions {
    pub retry: RetryPolicy,
    /// Overrides the size-based worker pool policy.
    pub concurrency: Option<usize>,
}

struct PhaseTracker<'a> {
    file: &'a str,
    phase: UploadPhase,
}

impl PhaseTracker<'_> {
    fn enter(&mut self, next: UploadPhase) {
        if self.phase != next {
            tracing::debug!(file = self.file, from = ?self.phase, to = ?next, "upload phase");
            self.phase = next;
        }
    }
}

pub struct UploadEngine {
    remote: AuthorizedRemote,
    options: UploadOptions,
}

impl UploadEngine {
    pub fn new(remote: AuthorizedRemote, options: UploadOptions) -> Self {
        Self { remote, options }
    }

    /// Uploads `local` into `remote_dir`, resuming from its sidecar when one
    /// exists.
    ///
    /// A path ending in `.tbhash` uploads from the stored manifest alone and
    /// only succeeds if the remote already holds every chunk.
    pub async fn upload(
        &self,
        local: &Path,
        remote_dir: &str,
    ) -> Result<UploadOutcome, UploadError> {
        let shown = local.display().to_string();
        let mut tracker = PhaseTracker {
            file: &shown,
            phase: UploadPhase::New,
        };
        let result = self.run(local, remote_dir, &mut tracker).await;
        match &result {
            Ok(outcome) => {
                tracker.enter(UploadPhase::Verified);
                tracing::info!(
                    file = %shown,
                    remote_path = outcome.remote_path(),
                    "upload finished"
                );
            }
            Err(err) => {
                let failed_at = tracker.phase;
                tracker.enter(match err {
                    UploadError::IntegrityMismatch { .. } => UploadPhase::Mismatch,
                    _ => UploadPhase::Failed,
                });
                tracing::error!(file = %shown, phase = ?failed_at, "upload failed: {err}");
            }
        }
        result
    }

    async fn run(
        &self,
        local: &Path,
        remote_dir: &str,
        tracker: &mut PhaseTracker<'_>,
    ) -> Result<UploadOutcome, UploadError> {
        let retry = &self.options.retry;
        let hash_only = is_hash_only(local);
        let file_name = target_file_name(local)?;
        let remote_dir = normalize_remote_dir(remote_dir)?;
        let store = ResumeStateStore::new(sidecar_path_for(local)?);
        let local_size = if hash_only {
            None
        } else {
            Some(tokio::fs::metadata(local).await?.len())
        };
        let defaults = SessionDefaults {
            remote_dir: remote_dir.clone(),
            file_name: file_name.clone(),
            local_size,
        };

        let size = match local_size {
            Some(size) => size,
            None => store.load(&defaults).await.size,
        };
        let chunk_size = plan_chunk_size(size, self.remote.tier())?;

        let skip = retry_transient(retry, "list remote directory", || {
            already_uploaded(&self.remote, &remote_dir, &file_name)
        })
        .await?;
        if skip {
            return Ok(UploadOutcome::Skipped {
                remote_path: remote_target_path(&remote_dir, &file_name),
            });
        }

        let mut session = store.load(&defaults).await;
        session.error = None;
        if session.remote_dir != remote_dir || session.file != file_name {
            tracing::info!(
                previous = %session.target_path(),
                "sidecar was recorded for another target, starting a new remote session"
            );
            session.remote_dir = remote_dir.clone();
            session.file = file_name.clone();
            session.upload_id.clear();
            session.uploaded = None;
        }
        let expected_chunks = chunk_count(session.size, chunk_size);
        if session
            .hash
            .as_ref()
            .is_some_and(|manifest| manifest.chunk_count() != expected_chunks)
        {
            tracing::info!(expected_chunks, "cached manifest uses other chunk boundaries");
            session.invalidate_manifest();
        }
        tracker.enter(UploadPhase::resume_point(&session));

        if session.hash.is_none() {
            if hash_only {
                return Err(UploadError::LocalFs(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{} has no usable hash manifest", local.display()),
                )));
            }
            let companion = load_companion_manifest(&hash_companion_path(local))
                .await
                .filter(|manifest| manifest.chunk_count() == expected_chunks);
            let manifest = match companion {
                Some(manifest) => {
                    tracing::info!(file = tracker.file, "reusing manifest from hash companion");
                    manifest
                }
                None => hash_file(local, chunk_size, session.size).await?,
            };
            session.set_manifest(manifest);
            tracker.enter(UploadPhase::Hashed);
        }
        store.save(&session).await?;

        self.negotiate_with_retry(&mut session, &store, hash_only).await?;
        store.save(&session).await?;
        tracker.enter(UploadPhase::Negotiated);

        if hash_only && !session.is_fully_received() {
            let missing = session.pending_chunks().len();
            return Err(UploadError::LocalFs(io::Error::new(
                io::ErrorKind::NotFound,
                format!("source bytes are unavailable and the remote lacks {missing} chunks"),
            )));
        }

        tracker.enter(UploadPhase::Uploading);
        if !session.pending_chunks().is_empty() {
            retry_transient(retry, "locate upload host", || self.remote.prepare_upload()).await?;
        }
        let workers = self.options.concurrency.unwrap_or_else(|| pool_size_for(session.size));
        let coordinator = UploadCoordinator::new(self.remote.clone(), *retry, workers);
        let stats = match coordinator
            .transmit(local, chunk_size, &mut session, &store)
            .await
        {
            Ok(stats) => stats,
            Err(err) => {
                let err = UploadError::from(err);
                if matches!(err, UploadError::ChunkUploadFailed { .. }) {
                    annotate(&mut session, &store, &err).await;
                }
                return Err(err);
            }
        };

        tracker.enter(UploadPhase::Finalizing);
        let verifier = FinalizeVerifier::new(self.remote.clone(), *retry);
        match verifier.finalize(&session, &store).await {
            Ok(verified) => Ok(UploadOutcome::Uploaded {
                remote_path: verified.remote_path,
                sent_chunks: stats.sent,
            }),
            Err(err) => {
                let err = UploadError::from(err);
                if matches!(err, UploadError::IntegrityMismatch { .. }) {
                    annotate(&mut session, &store, &err).await;
                }
                Err(err)
            }
        }
    }

    async fn negotiate_with_retry(
        &self,
        session: &mut UploadSession,
        store: &ResumeStateStore,
        hash_only: bool,
    ) -> Result<(), UploadError> {
        let negotiated = retry_transient(&self.options.retry, "negotiate upload session", || {
            negotiate(&self.remote, &*session)
        })
        .await;
        match negotiated {
            Ok(negotiated) => {
                negotiated.apply(session);
                Ok(())
            }
            Err(err) => {
                let err = UploadError::from(err);
                // Nothing on the remote depends on a sidecar without progress.
                if matches!(err, UploadError::RemoteRejected(_))
                    && !session.has_progress()
                    && !hash_only
                {
                    store.delete().await;
                }
                Err(err)
            }
        }
    }
}

/// Records `err` in the sidecar; the next attempt clears it.
async fn annotate(session: &mut UploadSession, store: &ResumeStateStore, err: &UploadError) {
    session.error = Some(err.to_string());
    if let Err(save_err) = store.save(session).await {
        tracing::warn!(path = %store.path().display(), "failed to record upload error: {save_err}");
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
