use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::upload::planner::HashManifest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountTier {
    Standard,
    Premium,
}

#[derive(Debug, Clone)]
pub struct AccountInfo {
    pub name: Option<String>,
    pub tier: AccountTier,
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote rejected request: {0}")]
    Rejected(String),
    #[error("transient remote failure: {0}")]
    Transient(String),
    #[error("remote login is not valid: {0}")]
    Auth(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub content_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RemoteListing {
    pub exists: bool,
    pub entries: Vec<RemoteEntry>,
}

impl RemoteListing {
    pub fn missing() -> Self {
        Self::default()
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.entries.iter().any(|entry| entry.name == name)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionRequest<'a> {
    pub target_dir: &'a str,
    pub target_name: &'a str,
    pub size: u64,
    pub manifest: &'a HashManifest,
    /// Previously negotiated id, if any. Providers may ignore it.
    pub session_id: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct OpenedSession {
    pub session_id: String,
    pub missing_chunks: Vec<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct ChunkAck {
    pub md5: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct FinalizeRequest<'a> {
    pub session_id: &'a str,
    pub target_dir: &'a str,
    pub target_name: &'a str,
    pub size: u64,
    pub manifest: &'a HashManifest,
}

/// A file as stored on the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub remote_path: String,
    pub size: u64,
    /// Absent when the provider does not report it for this call.
    pub content_id: Option<String>,
}

/// Upload contract of a cloud storage provider.
///
/// Transport, request signing and credentials stay inside implementations.
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    async fn check_login(&self) -> Result<AccountInfo, RemoteError>;

    async fn list_directory(&self, path: &str) -> Result<RemoteListing, RemoteError>;

    async fn open_or_resume_session(
        &self,
        request: &SessionRequest<'_>,
    ) -> Result<OpenedSession, RemoteError>;

    async fn send_chunk(
        &self,
        session_id: &str,
        target_path: &str,
        index: usize,
        bytes: Vec<u8>,
    ) -> Result<ChunkAck, RemoteError>;

    /// Resolves per-upload transport details before chunks are sent.
    async fn prepare_upload(&self) -> Result<(), RemoteError> {
        Ok(())
    }

    /// Assembles the sent chunks into the target file. Not idempotent: a
    /// repeated commit may create a second copy.
    async fn commit(&self, request: &FinalizeRequest<'_>) -> Result<StoredFile, RemoteError>;

    async fn stat_file(&self, path: &str) -> Result<Option<StoredFile>, RemoteError>;
}

/// A storage handle whose login has been checked.
///
/// `login` is the only constructor, so every upload step that takes an
/// `AuthorizedRemote` runs after a successful login check.
#[derive(Clone)]
pub struct AuthorizedRemote {
    storage: Arc<dyn RemoteStorage>,
    account: AccountInfo,
}

impl AuthorizedRemote {
    pub async fn login(storage: Arc<dyn RemoteStorage>) -> Result<Self, RemoteError> {
        let account = storage.check_login().await?;
        tracing::info!(
            account = account.name.as_deref().unwrap_or("<unknown>"),
            tier = ?account.tier,
            "remote login verified"
        );
        Ok(Self { storage, account })
    }

    pub fn account(&self) -> &AccountInfo {
        &self.account
    }

    pub fn tier(&self) -> AccountTier {
        self.account.tier
    }

    pub async fn list_directory(&self, path: &str) -> Result<RemoteListing, RemoteError> {
        self.storage.list_directory(path).await
    }

    pub async fn open_or_resume_session(
        &self,
        request: &SessionRequest<'_>,
    ) -> Result<OpenedSession, RemoteError> {
        self.storage.open_or_resume_session(request).await
    }

    pub async fn send_chunk(
        &self,
        session_id: &str,
        target_path: &str,
        index: usize,
        bytes: Vec<u8>,
    ) -> Result<ChunkAck, RemoteError> {
        self.storage
            .send_chunk(session_id, target_path, index, bytes)
            .await
    }

    pub async fn prepare_upload(&self) -> Result<(), RemoteError> {
        self.storage.prepare_upload().await
    }

    pub async fn commit(&self, request: &FinalizeRequest<'_>) -> Result<StoredFile, RemoteError> {
        self.storage.commit(request).await
    }

    pub async fn stat_file(&self, path: &str) -> Result<Option<StoredFile>, RemoteError> {
        self.storage.stat_file(path).await
    }
}
