use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::finalize::expected_content_id;
use super::paths::remote_target_path;
use super::planner::{HashManifest, md5_hex};
use super::session::UploadSession;
use crate::remote::{
    AccountInfo, AccountTier, AuthorizedRemote, ChunkAck, FinalizeRequest, OpenedSession,
    RemoteEntry, RemoteError, RemoteListing, RemoteStorage, SessionRequest, StoredFile,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub login: usize,
    pub list: usize,
    pub open: usize,
    pub send: usize,
    pub prepare: usize,
    pub commit: usize,
    pub stat: usize,
}

impl CallCounts {
    /// Calls made after login.
    pub fn upload_calls(&self) -> usize {
        self.list + self.open + self.send + self.prepare + self.commit + self.stat
    }
}

#[derive(Default)]
struct FakeState {
    tier: Option<AccountTier>,
    listing: Option<Vec<RemoteEntry>>,
    missing: Option<Vec<usize>>,
    reject_sessions: bool,
    session_failures: u32,
    chunk_failures: HashMap<usize, u32>,
    rejected_chunks: HashSet<usize>,
    bad_ack_once: HashSet<usize>,
    finalize_report: Option<(u64, String)>,
    lost_commit_replies: u32,
    stat_failures: u32,
    committed: Vec<StoredFile>,
    send_delay: Duration,
    sent: Vec<usize>,
    received: BTreeMap<usize, Vec<u8>>,
    last_resumed: Option<String>,
    last_manifest: Option<HashManifest>,
    sessions: usize,
    calls: CallCounts,
}

/// Scriptable in-memory remote that records every call.
#[derive(Clone, Default)]
pub struct FakeRemote {
    state: Arc<Mutex<FakeState>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn login(&self) -> AuthorizedRemote {
        AuthorizedRemote::login(Arc::new(self.clone()))
            .await
            .expect("fake login")
    }

    pub fn set_tier(&self, tier: AccountTier) {
        self.state.lock().unwrap().tier = Some(tier);
    }

    pub fn set_listing(&self, names: &[&str]) {
        self.state.lock().unwrap().listing = Some(
            names
                .iter()
                .map(|name| RemoteEntry {
                    name: name.to_string(),
                    is_dir: false,
                    size: 1,
                    content_id: None,
                })
                .collect(),
        );
    }

    pub fn set_missing(&self, missing: Vec<usize>) {
        self.state.lock().unwrap().missing = Some(missing);
    }

    pub fn reject_sessions(&self) {
        self.state.lock().unwrap().reject_sessions = true;
    }

    pub fn fail_sessions(&self, times: u32) {
        self.state.lock().unwrap().session_failures = times;
    }

    /// Chunk `index` fails transiently `times` times before succeeding.
    pub fn fail_chunk(&self, index: usize, times: u32) {
        self.state
            .lock()
            .unwrap()
            .chunk_failures
            .insert(index, times);
    }

    pub fn reject_chunk(&self, index: usize) {
        self.state.lock().unwrap().rejected_chunks.insert(index);
    }

    pub fn corrupt_ack_once(&self, index: usize) {
        self.state.lock().unwrap().bad_ack_once.insert(index);
    }

    /// Size and content id the remote reports for the committed file.
    pub fn report_on_finalize(&self, size: u64, content_id: &str) {
        self.state.lock().unwrap().finalize_report = Some((size, content_id.to_string()));
    }

    /// The next `times` commits take effect but their replies time out.
    pub fn lose_commit_replies(&self, times: u32) {
        self.state.lock().unwrap().lost_commit_replies = times;
    }

    pub fn fail_stats(&self, times: u32) {
        self.state.lock().unwrap().stat_failures = times;
    }

    /// Files created by commits, duplicates included.
    pub fn committed(&self) -> Vec<StoredFile> {
        self.state.lock().unwrap().committed.clone()
    }

    pub fn set_send_delay(&self, delay: Duration) {
        self.state.lock().unwrap().send_delay = delay;
    }

    pub fn calls(&self) -> CallCounts {
        self.state.lock().unwrap().calls
    }

    pub fn sent(&self) -> Vec<usize> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn received(&self) -> BTreeMap<usize, Vec<u8>> {
        self.state.lock().unwrap().received.clone()
    }

    pub fn last_resumed_id(&self) -> Option<String> {
        self.state.lock().unwrap().last_resumed.clone()
    }

    /// Manifest sent with the most recent successful negotiation.
    pub fn last_manifest(&self) -> Option<HashManifest> {
        self.state.lock().unwrap().last_manifest.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteStorage for FakeRemote {
    async fn check_login(&self) -> Result<AccountInfo, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.login += 1;
        Ok(AccountInfo {
            name: Some("tester".into()),
            tier: state.tier.unwrap_or(AccountTier::Standard),
        })
    }

    async fn list_directory(&self, _path: &str) -> Result<RemoteListing, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.list += 1;
        Ok(match &state.listing {
            Some(entries) => RemoteListing {
                exists: true,
                entries: entries.clone(),
            },
            None => RemoteListing::missing(),
        })
    }

    async fn open_or_resume_session(
        &self,
        request: &SessionRequest<'_>,
    ) -> Result<OpenedSession, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.open += 1;
        if state.reject_sessions {
            return Err(RemoteError::Rejected("invalid block list".into()));
        }
        if state.session_failures > 0 {
            state.session_failures -= 1;
            return Err(RemoteError::Transient("precreate timed out".into()));
        }
        state.last_resumed = request.session_id.map(str::to_string);
        state.last_manifest = Some(request.manifest.clone());
        let session_id = match request.session_id {
            Some(id) => id.to_string(),
            None => {
                state.sessions += 1;
                format!("session-{}", state.sessions)
            }
        };
        let missing = state
            .missing
            .clone()
            .unwrap_or_else(|| (0..request.manifest.chunk_count()).collect());
        Ok(OpenedSession {
            session_id,
            missing_chunks: missing,
        })
    }

    async fn send_chunk(
        &self,
        _session_id: &str,
        _target_path: &str,
        index: usize,
        bytes: Vec<u8>,
    ) -> Result<ChunkAck, RemoteError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = self.state.lock().unwrap().send_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let result = {
            let mut state = self.state.lock().unwrap();
            state.calls.send += 1;
            state.sent.push(index);
            if state.rejected_chunks.contains(&index) {
                Err(RemoteError::Rejected(format!("chunk {index} refused")))
            } else if let Some(left) = state.chunk_failures.get_mut(&index).filter(|n| **n > 0) {
                *left -= 1;
                Err(RemoteError::Transient(format!("chunk {index} timed out")))
            } else if state.bad_ack_once.remove(&index) {
                Ok(ChunkAck {
                    md5: Some("00000000000000000000000000000000".into()),
                })
            } else {
                let md5 = md5_hex(&bytes);
                state.received.insert(index, bytes);
                Ok(ChunkAck { md5: Some(md5) })
            }
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn prepare_upload(&self) -> Result<(), RemoteError> {
        self.state.lock().unwrap().calls.prepare += 1;
        Ok(())
    }

    async fn commit(&self, request: &FinalizeRequest<'_>) -> Result<StoredFile, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.commit += 1;
        let (size, content_id) = state
            .finalize_report
            .clone()
            .unwrap_or_else(|| (request.size, expected_content_id(request.manifest)));
        let stored = StoredFile {
            remote_path: remote_target_path(request.target_dir, request.target_name),
            size,
            content_id: Some(content_id),
        };
        state.committed.push(stored.clone());
        if state.lost_commit_replies > 0 {
            state.lost_commit_replies -= 1;
            return Err(RemoteError::Transient("create timed out".into()));
        }
        // `create` does not echo the content hash.
        Ok(StoredFile {
            content_id: None,
            ..stored
        })
    }

    async fn stat_file(&self, path: &str) -> Result<Option<StoredFile>, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.stat += 1;
        if state.stat_failures > 0 {
            state.stat_failures -= 1;
            return Err(RemoteError::Transient("filemetas timed out".into()));
        }
        Ok(state
            .committed
            .iter()
            .rev()
            .find(|file| file.remote_path == path)
            .cloned())
    }
}

pub fn manifest_for(chunks: &[&[u8]]) -> HashManifest {
    let whole: Vec<u8> = chunks.concat();
    HashManifest {
        file: md5_hex(&whole),
        slice: md5_hex(&whole[..whole.len().min(256 * 1024)]),
        crc32: crc32fast::hash(&whole),
        chunks: chunks.iter().map(|chunk| md5_hex(chunk)).collect(),
    }
}

pub fn session_for(manifest: HashManifest) -> UploadSession {
    UploadSession {
        upload_id: String::new(),
        remote_dir: "/Docs".into(),
        file: "a.bin".into(),
        size: manifest.chunk_count() as u64,
        hash: Some(manifest),
        uploaded: None,
        error: None,
    }
}
