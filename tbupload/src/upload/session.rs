use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use super::paths::remote_target_path;
use super::planner::HashManifest;

/// Per-chunk flags; `true` means the remote already holds the chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompletionBitmap(Vec<bool>);

impl CompletionBitmap {
    /// Marks every chunk received except those listed as missing.
    ///
    /// Returns the first out-of-range index as an error.
    pub fn from_missing(count: usize, missing: &[usize]) -> Result<Self, usize> {
        let mut bits = vec![true; count];
        for &index in missing {
            let slot = bits.get_mut(index).ok_or(index)?;
            *slot = false;
        }
        Ok(Self(bits))
    }

    pub fn from_bits(bits: Vec<bool>) -> Self {
        Self(bits)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_received(&self, index: usize) -> bool {
        self.0.get(index).copied().unwrap_or(false)
    }

    pub fn mark_received(&mut self, index: usize) {
        if let Some(slot) = self.0.get_mut(index) {
            *slot = true;
        }
    }

    pub fn pending(&self) -> Vec<usize> {
        self.0
            .iter()
            .enumerate()
            .filter(|(_, received)| !**received)
            .map(|(index, _)| index)
            .collect()
    }

    pub fn received_count(&self) -> usize {
        self.0.iter().filter(|received| **received).count()
    }

    pub fn is_complete(&self) -> bool {
        self.0.iter().all(|received| *received)
    }

    pub fn bits(&self) -> &[bool] {
        &self.0
    }
}

/// Values used for fields a sidecar does not provide.
#[derive(Debug, Clone)]
pub struct SessionDefaults {
    pub remote_dir: String,
    pub file_name: String,
    /// Size of the local file; `None` when only a hash document is present.
    pub local_size: Option<u64>,
}

/// Sidecar fields that survived type validation.
#[derive(Debug, Default, Clone)]
pub struct PartialSession {
    pub upload_id: Option<String>,
    pub remote_dir: Option<String>,
    pub file: Option<String>,
    pub size: Option<u64>,
    pub hash: Option<HashManifest>,
    pub uploaded: Option<Vec<bool>>,
    pub error: Option<String>,
}

impl PartialSession {
    /// Returns `None` unless `text` is a YAML mapping.
    pub fn from_yaml(text: &str) -> Option<Self> {
        match serde_yaml::from_str::<Value>(text).ok()? {
            Value::Mapping(map) => Some(Self::from_mapping(&map)),
            _ => None,
        }
    }

    pub fn from_mapping(map: &Mapping) -> Self {
        Self {
            upload_id: string_field(map, "upload_id"),
            remote_dir: string_field(map, "remote_dir").filter(|v| !v.is_empty()),
            file: string_field(map, "file").filter(|v| !v.is_empty()),
            size: map.get("size").and_then(Value::as_u64),
            hash: map
                .get("hash")
                .and_then(|value| serde_yaml::from_value::<HashManifest>(value.clone()).ok())
                .filter(|manifest| !manifest.chunks.is_empty() && !manifest.file.is_empty()),
            uploaded: map.get("uploaded").and_then(bool_list),
            error: string_field(map, "error"),
        }
    }
}

fn string_field(map: &Mapping, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}

fn bool_list(value: &Value) -> Option<Vec<bool>> {
    value
        .as_sequence()?
        .iter()
        .map(Value::as_bool)
        .collect::<Option<Vec<bool>>>()
}

/// Resume state for one local file, persisted as the sidecar document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    pub upload_id: String,
    pub remote_dir: String,
    pub file: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<HashManifest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded: Option<CompletionBitmap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UploadSession {
    pub fn empty(defaults: &SessionDefaults) -> Self {
        Self::from_partial(PartialSession::default(), defaults)
    }

    pub fn from_partial(partial: PartialSession, defaults: &SessionDefaults) -> Self {
        let mut session = Self {
            upload_id: partial.upload_id.unwrap_or_default(),
            remote_dir: partial
                .remote_dir
                .unwrap_or_else(|| defaults.remote_dir.clone()),
            file: partial.file.unwrap_or_else(|| defaults.file_name.clone()),
            size: partial.size.or(defaults.local_size).unwrap_or(0),
            hash: partial.hash,
            uploaded: None,
            error: partial.error,
        };

        if let Some(actual) = defaults.local_size
            && actual != session.size
        {
            tracing::info!(
                recorded = session.size,
                actual,
                "local file size changed, discarding cached manifest"
            );
            session.size = actual;
            session.invalidate_manifest();
        }

        let chunk_count = session.hash.as_ref().map(HashManifest::chunk_count);
        session.uploaded = match (partial.uploaded, chunk_count) {
            (Some(bits), Some(count)) if bits.len() == count => {
                Some(CompletionBitmap::from_bits(bits))
            }
            _ => None,
        };
        session
    }

    pub fn chunk_count(&self) -> usize {
        self.hash.as_ref().map(HashManifest::chunk_count).unwrap_or(0)
    }

    pub fn target_path(&self) -> String {
        remote_target_path(&self.remote_dir, &self.file)
    }

    /// Stores a freshly computed manifest; any remote session belonged to the
    /// previous one.
    pub fn set_manifest(&mut self, manifest: HashManifest) {
        self.hash = Some(manifest);
        self.uploaded = None;
        self.upload_id.clear();
    }

    pub fn invalidate_manifest(&mut self) {
        self.hash = None;
        self.uploaded = None;
        self.upload_id.clear();
    }

    pub fn pending_chunks(&self) -> Vec<usize> {
        match &self.uploaded {
            Some(bitmap) => bitmap.pending(),
            None => (0..self.chunk_count()).collect(),
        }
    }

    pub fn mark_received(&mut self, index: usize) {
        if let Some(bitmap) = self.uploaded.as_mut() {
            bitmap.mark_received(index);
        }
    }

    pub fn is_fully_received(&self) -> bool {
        self.hash.is_some()
            && self
                .uploaded
                .as_ref()
                .is_some_and(|bitmap| bitmap.len() == self.chunk_count() && bitmap.is_complete())
    }

    /// True when the remote is known to hold part of this upload.
    pub fn has_progress(&self) -> bool {
        self.uploaded
            .as_ref()
            .is_some_and(|bitmap| bitmap.received_count() > 0)
    }
}
