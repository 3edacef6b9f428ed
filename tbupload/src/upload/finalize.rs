use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use super::planner::{HashManifest, md5_hex};
use super::retry::{RetryPolicy, retry_transient};
use super::session::UploadSession;
use super::state::ResumeStateStore;
use crate::remote::{AuthorizedRemote, FinalizeRequest, RemoteError, StoredFile};

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("session is not ready to finalize: {0}")]
    NotReady(&'static str),
    #[error(transparent)]
    Remote(#[from] RemoteError),
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
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verified {
    pub remote_path: String,
}

/// Identifier the remote is expected to report for a committed file.
///
/// Multi-chunk files are identified by the MD5 of the JSON encoded chunk
/// list rather than by a hash of the reassembled bytes.
pub fn expected_content_id(manifest: &HashManifest) -> String {
    if manifest.chunks.len() == 1 {
        return manifest.file.clone();
    }
    // serde_json writes `["a","b"]` with no whitespace, matching the remote.
    let encoded = serde_json::to_string(&manifest.chunks).unwrap_or_default();
    md5_hex(encoded.as_bytes())
}

pub struct FinalizeVerifier {
    remote: AuthorizedRemote,
    retry: RetryPolicy,
}

impl FinalizeVerifier {
    pub fn new(remote: AuthorizedRemote, retry: RetryPolicy) -> Self {
        Self { remote, retry }
    }

    /// Commits the session and checks what the remote assembled.
    ///
    /// The commit is never repeated once the remote may have applied it: a
    /// retry first looks the target up and reuses it if it exists. The
    /// sidecar is deleted only on a full match; on mismatch it is left
    /// untouched so a later run can retry the commit without resending chunks.
    pub async fn finalize(
        &self,
        session: &UploadSession,
        store: &ResumeStateStore,
    ) -> Result<Verified, FinalizeError> {
        let manifest = session
            .hash
            .as_ref()
            .ok_or(FinalizeError::NotReady("missing manifest"))?;
        if session.upload_id.is_empty() {
            return Err(FinalizeError::NotReady("session was never negotiated"));
        }
        if !session.is_fully_received() {
            return Err(FinalizeError::NotReady("chunks are still pending"));
        }

        let request = FinalizeRequest {
            session_id: &session.upload_id,
            target_dir: &session.remote_dir,
            target_name: &session.file,
            size: session.size,
            manifest,
        };
        let committed = self.commit(&request, &session.target_path()).await?;
        let finalized = self.read_back(&committed).await?;

        let expected_id = expected_content_id(manifest);
        let actual_id = finalized.content_id.unwrap_or_default();
        let id_matches = actual_id.eq_ignore_ascii_case(&expected_id);
        let size_matches = finalized.size == session.size;
        if !id_matches || !size_matches {
            tracing::error!(
                remote_path = %finalized.remote_path,
                id_matches,
                size_matches,
                "remote file does not match the local manifest"
            );
            return Err(FinalizeError::IntegrityMismatch {
                remote_path: finalized.remote_path,
                expected_id,
                actual_id,
                expected_size: session.size,
                actual_size: finalized.size,
            });
        }

        store.delete().await;
        tracing::info!(remote_path = %finalized.remote_path, "upload verified");
        Ok(Verified {
            remote_path: finalized.remote_path,
        })
    }

    async fn commit(
        &self,
        request: &FinalizeRequest<'_>,
        target: &str,
    ) -> Result<StoredFile, RemoteError> {
        let attempted = AtomicBool::new(false);
        retry_transient(&self.retry, "commit upload", || async {
            if attempted.swap(true, Ordering::SeqCst) {
                // A commit whose reply was lost may still have created the file.
                if let Some(stored) = self.remote.stat_file(target).await? {
                    tracing::info!(remote_path = %stored.remote_path, "commit already applied");
                    return Ok(stored);
                }
            }
            self.remote.commit(request).await
        })
        .await
    }

    /// Metadata of the committed file; `create` does not always report the
    /// content hash.
    async fn read_back(&self, committed: &StoredFile) -> Result<StoredFile, RemoteError> {
        let path = committed.remote_path.as_str();
        let stored = retry_transient(&self.retry, "read committed file", || {
            self.remote.stat_file(path)
        })
        .await?
        .ok_or_else(|| RemoteError::Rejected(format!("{path} is missing after commit")))?;
        let content_id = stored.content_id.or_else(|| committed.content_id.clone());
        if content_id.is_none() {
            return Err(RemoteError::Rejected(format!(
                "remote reported no content hash for {path}"
            )));
        }
        Ok(StoredFile {
            content_id,
            ..stored
        })
    }
}
