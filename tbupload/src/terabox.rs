use async_trait::async_trait;
use terabox_core::{ApiErrorClass, CreateRequest, PrecreateRequest, TeraboxClient, TeraboxError};
use tokio::sync::RwLock;
use url::Url;

use crate::remote::{
    AccountInfo, AccountTier, ChunkAck, FinalizeRequest, OpenedSession, RemoteEntry, RemoteError,
    RemoteListing, RemoteStorage, SessionRequest, StoredFile,
};
use crate::upload::paths::remote_target_path;

/// Precreate reports this when the remote already holds the whole file.
const RETURN_TYPE_RAPID: u8 = 2;

/// [`RemoteStorage`] backed by the TeraBox web API.
pub struct TeraboxStorage {
    client: TeraboxClient,
    upload_host: RwLock<Option<Url>>,
}

impl TeraboxStorage {
    pub fn new(client: TeraboxClient) -> Self {
        Self {
            client,
            upload_host: RwLock::new(None),
        }
    }

    async fn refresh_upload_host(&self) -> Result<Url, RemoteError> {
        let host = self.client.locate_upload_host().await.map_err(map_error)?;
        tracing::debug!(host = %host, "upload host located");
        *self.upload_host.write().await = Some(host.clone());
        Ok(host)
    }

    async fn upload_host(&self) -> Result<Url, RemoteError> {
        let cached = self.upload_host.read().await.clone();
        match cached {
            Some(host) => Ok(host),
            None => self.refresh_upload_host().await,
        }
    }
}

fn map_error(err: TeraboxError) -> RemoteError {
    let message = err.to_string();
    match err.classification() {
        ApiErrorClass::Auth => RemoteError::Auth(message),
        ApiErrorClass::RateLimit | ApiErrorClass::Transient => RemoteError::Transient(message),
        ApiErrorClass::Permanent => RemoteError::Rejected(message),
    }
}

#[async_trait]
impl RemoteStorage for TeraboxStorage {
    async fn check_login(&self) -> Result<AccountInfo, RemoteError> {
        let status = self.client.check_login().await.map_err(map_error)?;
        let tier = if status.is_vip() {
            AccountTier::Premium
        } else {
            AccountTier::Standard
        };
        Ok(AccountInfo {
            name: status.username,
            tier,
        })
    }

    async fn list_directory(&self, path: &str) -> Result<RemoteListing, RemoteError> {
        let Some(files) = self
            .client
            .list_directory_all(path)
            .await
            .map_err(map_error)?
        else {
            return Ok(RemoteListing::missing());
        };
        Ok(RemoteListing {
            exists: true,
            entries: files
                .into_iter()
                .map(|file| RemoteEntry {
                    is_dir: file.is_dir(),
                    name: file.server_filename,
                    size: file.size,
                    content_id: file.md5,
                })
                .collect(),
        })
    }

    async fn open_or_resume_session(
        &self,
        request: &SessionRequest<'_>,
    ) -> Result<OpenedSession, RemoteError> {
        let path = remote_target_path(request.target_dir, request.target_name);
        let manifest = request.manifest;
        let result = self
            .client
            .precreate(&PrecreateRequest {
                path: &path,
                target_dir: request.target_dir,
                size: request.size,
                block_list: &manifest.chunks,
                content_md5: &manifest.file,
                slice_md5: &manifest.slice,
                content_crc32: manifest.crc32,
                upload_id: request.session_id,
            })
            .await
            .map_err(map_error)?;

        let missing_chunks = if result.return_type == RETURN_TYPE_RAPID {
            Vec::new()
        } else {
            result.block_list
        };
        Ok(OpenedSession {
            session_id: result.uploadid,
            missing_chunks,
        })
    }

    async fn send_chunk(
        &self,
        session_id: &str,
        target_path: &str,
        index: usize,
        bytes: Vec<u8>,
    ) -> Result<ChunkAck, RemoteError> {
        let host = self.upload_host().await?;
        let receipt = self
            .client
            .upload_chunk(&host, target_path, session_id, index, bytes)
            .await
            .map_err(map_error)?;
        Ok(ChunkAck { md5: receipt.md5 })
    }

    async fn prepare_upload(&self) -> Result<(), RemoteError> {
        self.refresh_upload_host().await.map(|_| ())
    }

    async fn commit(&self, request: &FinalizeRequest<'_>) -> Result<StoredFile, RemoteError> {
        let path = remote_target_path(request.target_dir, request.target_name);
        let created = self
            .client
            .create_file(&CreateRequest {
                path: &path,
                size: request.size,
                upload_id: request.session_id,
                block_list: &request.manifest.chunks,
            })
            .await
            .map_err(map_error)?;
        Ok(StoredFile {
            remote_path: if created.path.is_empty() {
                path
            } else {
                created.path
            },
            size: created.size,
            content_id: created.md5,
        })
    }

    async fn stat_file(&self, path: &str) -> Result<Option<StoredFile>, RemoteError> {
        let meta = self
            .client
            .get_file_meta(&[path])
            .await
            .map_err(map_error)?
            .into_iter()
            .next();
        Ok(meta.map(|meta| StoredFile {
            remote_path: meta.path,
            size: meta.size,
            content_id: meta.md5,
        }))
    }
}
