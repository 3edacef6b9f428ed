use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinError, JoinSet};

use super::planner::{GIB, chunk_range, md5_hex};
use super::retry::RetryPolicy;
use super::session::UploadSession;
use super::state::{ResumeStateStore, StateError};
use crate::remote::{AuthorizedRemote, RemoteError};

pub const LARGE_FILE_THRESHOLD: u64 = 4 * GIB;
const SMALL_FILE_WORKERS: usize = 10;
const LARGE_FILE_WORKERS: usize = 5;

/// Fewer workers for very large files keeps buffered chunk memory bounded.
pub fn pool_size_for(size: u64) -> usize {
    if size <= LARGE_FILE_THRESHOLD {
        SMALL_FILE_WORKERS
    } else {
        LARGE_FILE_WORKERS
    }
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("session has not been negotiated")]
    NotNegotiated,
    #[error("chunk {index} failed after {attempts} attempts: {last_error}")]
    ChunkUploadFailed {
        index: usize,
        attempts: u32,
        last_error: String,
    },
    #[error("remote refused chunk {index}: {source}")]
    Remote {
        index: usize,
        #[source]
        source: RemoteError,
    },
    #[error("failed to read chunk {index}: {source}")]
    Read {
        index: usize,
        #[source]
        source: io::Error,
    },
    #[error("chunk {index} no longer matches the manifest; the local file changed")]
    SourceChanged { index: usize },
    #[error("failed to persist progress: {0}")]
    State(#[from] StateError),
    #[error("upload worker failed: {0}")]
    Join(#[from] JoinError),
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub sent: usize,
    pub already_received: usize,
}

/// Session state shared by workers; whoever holds the lock is the only
/// sidecar writer.
struct Progress {
    session: UploadSession,
    store: ResumeStateStore,
    total: usize,
}

struct ChunkJob {
    remote: AuthorizedRemote,
    retry: RetryPolicy,
    source: PathBuf,
    session_id: Arc<str>,
    target_path: Arc<str>,
    index: usize,
    offset: u64,
    len: u64,
    expected_md5: String,
}

pub struct UploadCoordinator {
    remote: AuthorizedRemote,
    retry: RetryPolicy,
    concurrency: usize,
}

impl UploadCoordinator {
    pub fn new(remote: AuthorizedRemote, retry: RetryPolicy, concurrency: usize) -> Self {
        Self {
            remote,
            retry,
            concurrency: concurrency.max(1),
        }
    }

    /// Sends every chunk whose bit is still `false`.
    ///
    /// Returns only after all started workers have finished, so the caller
    /// may finalize as soon as this succeeds. On failure no further chunks
    /// are started and `session` keeps whatever progress was confirmed.
    pub async fn transmit(
        &self,
        source: &Path,
        chunk_size: u64,
        session: &mut UploadSession,
        store: &ResumeStateStore,
    ) -> Result<TransferStats, CoordinatorError> {
        let Some(manifest) = session.hash.clone() else {
            return Err(CoordinatorError::NotNegotiated);
        };
        if session.upload_id.is_empty() || session.uploaded.is_none() {
            return Err(CoordinatorError::NotNegotiated);
        }

        let pending = session.pending_chunks();
        let mut stats = TransferStats {
            sent: 0,
            already_received: manifest.chunk_count() - pending.len(),
        };
        if pending.is_empty() {
            return Ok(stats);
        }
        tracing::info!(
            file = %session.file,
            pending = pending.len(),
            workers = self.concurrency,
            "uploading chunks"
        );

        let session_id: Arc<str> = Arc::from(session.upload_id.as_str());
        let target_path: Arc<str> = Arc::from(session.target_path());
        let progress = Arc::new(Mutex::new(Progress {
            session: session.clone(),
            store: store.clone(),
            total: manifest.chunk_count(),
        }));
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let halted = Arc::new(AtomicBool::new(false));
        let mut tasks = JoinSet::new();
        let mut failure: Option<CoordinatorError> = None;

        for index in pending {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| CoordinatorError::ConcurrencyClosed)?;
            while let Some(joined) = tasks.try_join_next() {
                absorb(joined, &mut stats, &mut failure);
            }
            // A failed worker releases its permit before its result is joinable.
            if failure.is_some() || halted.load(Ordering::SeqCst) {
                break;
            }

            let (offset, len) = chunk_range(session.size, chunk_size, index);
            let job = ChunkJob {
                remote: self.remote.clone(),
                retry: self.retry,
                source: source.to_path_buf(),
                session_id: Arc::clone(&session_id),
                target_path: Arc::clone(&target_path),
                index,
                offset,
                len,
                expected_md5: manifest.chunks[index].clone(),
            };
            let progress = Arc::clone(&progress);
            let halted = Arc::clone(&halted);
            tasks.spawn(async move {
                let result = job.run(progress).await;
                if result.is_err() {
                    halted.store(true, Ordering::SeqCst);
                }
                drop(permit);
                result
            });
        }

        while let Some(joined) = tasks.join_next().await {
            absorb(joined, &mut stats, &mut failure);
        }

        *session = progress.lock().await.session.clone();
        match failure {
            Some(err) => Err(err),
            None => Ok(stats),
        }
    }
}

fn absorb(
    joined: Result<Result<(), CoordinatorError>, JoinError>,
    stats: &mut TransferStats,
    failure: &mut Option<CoordinatorError>,
) {
    let err = match joined {
        Ok(Ok(())) => {
            stats.sent += 1;
            return;
        }
        Ok(Err(err)) => err,
        Err(err) => err.into(),
    };
    if failure.is_none() {
        tracing::error!("chunk transfer aborted: {err}");
        *failure = Some(err);
    }
}

impl ChunkJob {
    async fn run(self, progress: Arc<Mutex<Progress>>) -> Result<(), CoordinatorError> {
        let bytes = read_chunk(&self.source, self.offset, self.len)
            .await
            .map_err(|source| CoordinatorError::Read {
                index: self.index,
                source,
            })?;
        if md5_hex(&bytes) != self.expected_md5 {
            return Err(CoordinatorError::SourceChanged { index: self.index });
        }

        let mut last_error = String::new();
        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.retry.delay_before_retry(attempt - 1)).await;
            }
            match self
                .remote
                .send_chunk(&self.session_id, &self.target_path, self.index, bytes.clone())
                .await
            {
                Ok(ack) => {
                    if let Some(md5) = ack.md5.as_deref()
                        && !md5.eq_ignore_ascii_case(&self.expected_md5)
                    {
                        last_error = format!(
                            "remote received md5 {md5}, expected {}",
                            self.expected_md5
                        );
                        tracing::warn!(index = self.index, attempt = attempt + 1, "{last_error}");
                        continue;
                    }
                    record_success(&progress, self.index).await?;
                    return Ok(());
                }
                Err(err) if err.is_transient() => {
                    tracing::warn!(
                        index = self.index,
                        attempt = attempt + 1,
                        "chunk upload failed: {err}"
                    );
                    last_error = err.to_string();
                }
                Err(source) => {
                    return Err(CoordinatorError::Remote {
                        index: self.index,
                        source,
                    });
                }
            }
        }

        Err(CoordinatorError::ChunkUploadFailed {
            index: self.index,
            attempts: self.retry.max_attempts,
            last_error,
        })
    }
}

/// Flips the chunk's bit and checkpoints the sidecar.
async fn record_success(progress: &Mutex<Progress>, index: usize) -> Result<(), StateError> {
    let mut progress = progress.lock().await;
    progress.session.mark_received(index);
    progress.store.save(&progress.session).await?;
    let received = progress
        .session
        .uploaded
        .as_ref()
        .map(|bitmap| bitmap.received_count())
        .unwrap_or(0);
    tracing::info!(index, received, total = progress.total, "chunk uploaded");
    Ok(())
}

async fn read_chunk(source: &Path, offset: u64, len: u64) -> io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(source).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buffer = vec![0u8; len as usize];
    file.read_exact(&mut buffer).await?;
    Ok(buffer)
}
