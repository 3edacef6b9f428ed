use thiserror::Error;

use super::retry::Retryable;
use super::session::{CompletionBitmap, UploadSession};
use crate::remote::{AuthorizedRemote, RemoteError, SessionRequest};

#[derive(Debug, Error)]
pub enum NegotiateError {
    #[error("session has no hash manifest")]
    MissingManifest,
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("remote asked for chunk {index} but the manifest has {count} chunks")]
    ChunkOutOfRange { index: usize, count: usize },
}

impl Retryable for NegotiateError {
    fn is_transient(&self) -> bool {
        matches!(self, NegotiateError::Remote(err) if err.is_transient())
    }
}

/// Remote session state reported by a successful negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub session_id: String,
    pub bitmap: CompletionBitmap,
    pub resumed: bool,
}

impl Negotiated {
    pub fn apply(self, session: &mut UploadSession) {
        session.upload_id = self.session_id;
        session.uploaded = Some(self.bitmap);
    }
}

/// Opens or resumes the remote upload session and derives the bitmap from
/// what the remote reports as missing.
///
/// Safe to repeat: the bitmap is derived from remote state every time, so a
/// crash between negotiation and the first chunk simply negotiates again.
pub async fn negotiate(
    remote: &AuthorizedRemote,
    session: &UploadSession,
) -> Result<Negotiated, NegotiateError> {
    let manifest = session
        .hash
        .as_ref()
        .ok_or(NegotiateError::MissingManifest)?;
    let count = manifest.chunk_count();
    let previous = (!session.upload_id.is_empty()).then_some(session.upload_id.as_str());

    let opened = remote
        .open_or_resume_session(&SessionRequest {
            target_dir: &session.remote_dir,
            target_name: &session.file,
            size: session.size,
            manifest,
            session_id: previous,
        })
        .await?;

    let bitmap = CompletionBitmap::from_missing(count, &opened.missing_chunks)
        .map_err(|index| NegotiateError::ChunkOutOfRange { index, count })?;
    if opened.session_id.is_empty() {
        return Err(RemoteError::Rejected("remote returned an empty session id".into()).into());
    }

    let resumed = previous == Some(opened.session_id.as_str());
    tracing::info!(
        file = %session.file,
        chunks = count,
        missing = opened.missing_chunks.len(),
        resumed,
        "upload session negotiated"
    );
    Ok(Negotiated {
        session_id: opened.session_id,
        bitmap,
        resumed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::test_support::{FakeRemote, manifest_for, session_for};

    #[tokio::test]
    async fn missing_chunks_become_false_bits() {
        let fake = FakeRemote::new();
        fake.set_missing(vec![0, 2]);
        let remote = fake.login().await;
        let mut session = session_for(manifest_for(&[b"a", b"b", b"c"]));

        negotiate(&remote, &session).await.unwrap().apply(&mut session);

        assert_eq!(session.upload_id, "session-1");
        assert_eq!(
            session.uploaded.as_ref().unwrap().bits(),
            &[false, true, false]
        );
    }

    #[tokio::test]
    async fn renegotiation_reflects_current_remote_state() {
        let fake = FakeRemote::new();
        fake.set_missing(vec![1]);
        let remote = fake.login().await;
        let mut session = session_for(manifest_for(&[b"a", b"b", b"c"]));

        negotiate(&remote, &session).await.unwrap().apply(&mut session);
        // Locally assumed progress that the remote never confirmed.
        session.mark_received(1);
        negotiate(&remote, &session).await.unwrap().apply(&mut session);

        assert_eq!(session.pending_chunks(), vec![1]);
        assert_eq!(fake.last_resumed_id().as_deref(), Some("session-1"));
    }

    #[tokio::test]
    async fn rejects_out_of_range_indices() {
        let fake = FakeRemote::new();
        fake.set_missing(vec![5]);
        let remote = fake.login().await;
        let session = session_for(manifest_for(&[b"a"]));

        let err = negotiate(&remote, &session).await.unwrap_err();

        assert!(matches!(
            err,
            NegotiateError::ChunkOutOfRange { index: 5, count: 1 }
        ));
        assert!(session.uploaded.is_none());
    }

    #[tokio::test]
    async fn surfaces_remote_rejection() {
        let fake = FakeRemote::new();
        fake.reject_sessions();
        let remote = fake.login().await;
        let session = session_for(manifest_for(&[b"a"]));

        let err = negotiate(&remote, &session).await.unwrap_err();

        assert!(matches!(err, NegotiateError::Remote(RemoteError::Rejected(_))));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn only_remote_timeouts_are_retryable() {
        let fake = FakeRemote::new();
        fake.fail_sessions(1);
        let remote = fake.login().await;
        let session = session_for(manifest_for(&[b"a"]));

        let err = negotiate(&remote, &session).await.unwrap_err();

        assert!(err.is_transient());
        assert!(!NegotiateError::ChunkOutOfRange { index: 3, count: 1 }.is_transient());
    }

    #[tokio::test]
    async fn reports_whether_the_previous_session_was_kept() {
        let fake = FakeRemote::new();
        let remote = fake.login().await;
        let mut session = session_for(manifest_for(&[b"a"]));

        let first = negotiate(&remote, &session).await.unwrap();
        assert!(!first.resumed);
        first.apply(&mut session);
        assert!(negotiate(&remote, &session).await.unwrap().resumed);
    }

    #[tokio::test]
    async fn requires_manifest() {
        let fake = FakeRemote::new();
        let remote = fake.login().await;
        let mut session = session_for(manifest_for(&[b"a"]));
        session.hash = None;

        assert!(matches!(
            negotiate(&remote, &session).await,
            Err(NegotiateError::MissingManifest)
        ));
        assert_eq!(fake.calls().open, 0);
    }
}
