use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://www.terabox.com";
const LIST_PAGE_SIZE: u32 = 1000;

const ERRNO_NOT_LOGGED_IN: i64 = -6;
const ERRNO_DIR_NOT_FOUND: i64 = -9;
const ERRNO_FREQUENCY_LIMIT: i64 = 31034;
const ERRNO_TOKEN_INVALID: i64 = 31045;
const ERRNO_SERVER_BUSY: i64 = 31299;

#[derive(Debug, Error)]
pub enum TeraboxError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("{endpoint} returned errno {errno}")]
    Errno { endpoint: &'static str, errno: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Clone)]
pub struct TeraboxClient {
    http: Client,
    base_url: Url,
    ndus: String,
}

impl TeraboxClient {
    pub fn new(ndus: impl Into<String>) -> Result<Self, TeraboxError> {
        Self::with_base_url(DEFAULT_BASE_URL, ndus)
    }

    pub fn with_base_url(base_url: &str, ndus: impl Into<String>) -> Result<Self, TeraboxError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            ndus: ndus.into(),
        })
    }

    pub async fn check_login(&self) -> Result<LoginStatus, TeraboxError> {
        let url = self.endpoint("/api/check/login")?;
        let response = self
            .http
            .get(url)
            .header("Cookie", self.cookie_header_value())
            .send()
            .await?;
        Self::handle_envelope("check/login", response).await
    }

    /// Returns `None` when the directory does not exist yet.
    pub async fn list_directory(
        &self,
        dir: &str,
        page: u32,
    ) -> Result<Option<Vec<RemoteFile>>, TeraboxError> {
        let mut url = self.endpoint("/api/list")?;
        url.query_pairs_mut()
            .append_pair("dir", dir)
            .append_pair("page", &page.max(1).to_string())
            .append_pair("num", &LIST_PAGE_SIZE.to_string())
            .append_pair("order", "name");
        let response = self
            .http
            .get(url)
            .header("Cookie", self.cookie_header_value())
            .send()
            .await?;
        match Self::handle_envelope::<DirectoryPage>("list", response).await {
            Ok(page) => Ok(Some(page.list)),
            Err(TeraboxError::Errno { errno, .. }) if errno == ERRNO_DIR_NOT_FOUND => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn list_directory_all(
        &self,
        dir: &str,
    ) -> Result<Option<Vec<RemoteFile>>, TeraboxError> {
        let mut items = Vec::new();
        let mut page = 1u32;
        loop {
            let Some(batch) = self.list_directory(dir, page).await? else {
                return Ok(None);
            };
            let done = batch.len() < LIST_PAGE_SIZE as usize;
            items.extend(batch);
            if done {
                break;
            }
            page = page.saturating_add(1);
        }
        Ok(Some(items))
    }

    pub async fn precreate(
        &self,
        request: &PrecreateRequest<'_>,
    ) -> Result<PrecreateResult, TeraboxError> {
        let url = self.endpoint("/api/precreate")?;
        let block_list = serde_json::to_string(request.block_list)?;
        let size = request.size.to_string();
        let crc32 = request.content_crc32.to_string();
        let mut form = vec![
            ("path", request.path),
            ("size", size.as_str()),
            ("autoinit", "1"),
            ("target_path", request.target_dir),
            ("block_list", block_list.as_str()),
            ("content-md5", request.content_md5),
            ("slice-md5", request.slice_md5),
            ("content-crc32", crc32.as_str()),
        ];
        if let Some(upload_id) = request.upload_id.filter(|id| !id.is_empty()) {
            form.push(("uploadid", upload_id));
        }
        let response = self
            .http
            .post(url)
            .header("Cookie", self.cookie_header_value())
            .form(&form)
            .send()
            .await?;
        Self::handle_envelope("precreate", response).await
    }

    /// Asks which host accepts chunk data for this account.
    pub async fn locate_upload_host(&self) -> Result<Url, TeraboxError> {
        let mut url = self.endpoint("/rest/2.0/pcs/file")?;
        url.query_pairs_mut().append_pair("method", "locateupload");
        let response = self
            .http
            .get(url)
            .header("Cookie", self.cookie_header_value())
            .send()
            .await?;
        let located: UploadHost = Self::handle_envelope("locateupload", response).await?;
        let host = located.host.trim();
        if host.contains("://") {
            Ok(Url::parse(host)?)
        } else {
            Ok(Url::parse(&format!("https://{host}"))?)
        }
    }

    /// Sends one chunk to `host`, as returned by [`Self::locate_upload_host`].
    pub async fn upload_chunk(
        &self,
        host: &Url,
        path: &str,
        upload_id: &str,
        partseq: usize,
        bytes: Vec<u8>,
    ) -> Result<ChunkReceipt, TeraboxError> {
        let mut url = host.join("/rest/2.0/pcs/superfile2")?;
        url.query_pairs_mut()
            .append_pair("method", "upload")
            .append_pair("type", "tmpfile")
            .append_pair("path", path)
            .append_pair("uploadid", upload_id)
            .append_pair("partseq", &partseq.to_string());
        let response = self
            .http
            .post(url)
            .header("Cookie", self.cookie_header_value())
            .header("Content-Type", "application/octet-stream")
            .body(bytes)
            .send()
            .await?;
        Self::handle_envelope("superfile2", response).await
    }

    pub async fn create_file(
        &self,
        request: &CreateRequest<'_>,
    ) -> Result<CreatedFile, TeraboxError> {
        let url = self.endpoint("/api/create")?;
        let block_list = serde_json::to_string(request.block_list)?;
        let size = request.size.to_string();
        let form = [
            ("path", request.path),
            ("size", size.as_str()),
            ("uploadid", request.upload_id),
            ("block_list", block_list.as_str()),
            ("rtype", "1"),
        ];
        let response = self
            .http
            .post(url)
            .header("Cookie", self.cookie_header_value())
            .form(&form)
            .send()
            .await?;
        Self::handle_envelope("create", response).await
    }

    pub async fn get_file_meta(&self, paths: &[&str]) -> Result<Vec<FileMeta>, TeraboxError> {
        let mut url = self.endpoint("/api/filemetas")?;
        url.query_pairs_mut()
            .append_pair("target", &serde_json::to_string(paths)?)
            .append_pair("dlink", "0");
        let response = self
            .http
            .get(url)
            .header("Cookie", self.cookie_header_value())
            .send()
            .await?;
        let metas: FileMetaList = Self::handle_envelope("filemetas", response).await?;
        Ok(metas.info)
    }

    fn cookie_header_value(&self) -> String {
        format!("ndus={}", self.ndus)
    }

    fn endpoint(&self, path: &str) -> Result<Url, TeraboxError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_envelope<T: serde::de::DeserializeOwned>(
        endpoint: &'static str,
        response: reqwest::Response,
    ) -> Result<T, TeraboxError> {
        if response.status().is_success() {
            let envelope = response.json::<Envelope<T>>().await?;
            if envelope.errno != 0 {
                return Err(TeraboxError::Errno {
                    endpoint,
                    errno: envelope.errno,
                });
            }
            Ok(envelope.data)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(TeraboxError::Api { status, body })
        }
    }
}

impl TeraboxError {
    pub fn classification(&self) -> ApiErrorClass {
        match self {
            TeraboxError::Api { status, .. } => classify_api_status(*status),
            TeraboxError::Errno { errno, .. } => classify_errno(*errno),
            // Connection resets and timeouts never reached the API.
            TeraboxError::Request(err) if err.is_decode() => ApiErrorClass::Permanent,
            TeraboxError::Request(_) => ApiErrorClass::Transient,
            TeraboxError::Url(_) | TeraboxError::Encode(_) => ApiErrorClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            ApiErrorClass::RateLimit | ApiErrorClass::Transient
        )
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn classify_errno(errno: i64) -> ApiErrorClass {
    match errno {
        ERRNO_NOT_LOGGED_IN | ERRNO_TOKEN_INVALID => ApiErrorClass::Auth,
        ERRNO_FREQUENCY_LIMIT => ApiErrorClass::RateLimit,
        ERRNO_SERVER_BUSY => ApiErrorClass::Transient,
        _ => ApiErrorClass::Permanent,
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    errno: i64,
    #[serde(flatten)]
    data: T,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct LoginStatus {
    #[serde(default)]
    pub uk: Option<u64>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub vip_type: u32,
}

impl LoginStatus {
    pub fn is_vip(&self) -> bool {
        self.vip_type > 0
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RemoteFile {
    pub server_filename: String,
    pub path: String,
    #[serde(default)]
    pub isdir: u8,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub md5: Option<String>,
}

impl RemoteFile {
    pub fn is_dir(&self) -> bool {
        self.isdir == 1
    }
}

#[derive(Debug, Deserialize)]
struct DirectoryPage {
    #[serde(default)]
    list: Vec<RemoteFile>,
}

#[derive(Debug, Clone, Copy)]
pub struct PrecreateRequest<'a> {
    pub path: &'a str,
    pub target_dir: &'a str,
    pub size: u64,
    pub block_list: &'a [String],
    pub content_md5: &'a str,
    pub slice_md5: &'a str,
    pub content_crc32: u32,
    pub upload_id: Option<&'a str>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PrecreateResult {
    #[serde(default)]
    pub uploadid: String,
    #[serde(default)]
    pub block_list: Vec<usize>,
    #[serde(default)]
    pub return_type: u8,
}

#[derive(Debug, Deserialize)]
struct UploadHost {
    host: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ChunkReceipt {
    #[serde(default)]
    pub md5: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct CreateRequest<'a> {
    pub path: &'a str,
    pub size: u64,
    pub upload_id: &'a str,
    pub block_list: &'a [String],
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CreatedFile {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default)]
    pub fs_id: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct FileMeta {
    pub path: String,
    #[serde(default)]
    pub server_filename: Option<String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub md5: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileMetaList {
    #[serde(default)]
    info: Vec<FileMeta>,
}
