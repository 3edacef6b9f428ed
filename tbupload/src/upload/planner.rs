use std::io;
use std::path::Path;

use md5::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncReadExt;

use crate::remote::AccountTier;

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

/// Chunk sizes in MiB. A premium file of up to N GiB uses N MiB chunks.
const CHUNK_STEPS_MIB: [u64; 6] = [4, 8, 16, 32, 64, 128];
pub const MAX_CHUNK_COUNT: u64 = 1024;
const SLICE_LEN: u64 = 256 * 1024;
const READ_BUFFER_LEN: usize = MIB as usize;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("file size {size} is outside the supported range 1..={max}")]
    SizeUnsupported { size: u64, max: u64 },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("file changed while hashing: expected {expected} bytes, read {actual}")]
    SizeChanged { expected: u64, actual: u64 },
}

/// Content identifiers for a file split at fixed chunk boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashManifest {
    /// MD5 of the whole file.
    pub file: String,
    /// MD5 of the first 256 KiB.
    pub slice: String,
    pub crc32: u32,
    /// MD5 of every chunk, in order.
    pub chunks: Vec<String>,
}

impl HashManifest {
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

pub fn max_file_size(tier: AccountTier) -> u64 {
    let largest = match tier {
        AccountTier::Standard => CHUNK_STEPS_MIB[0],
        AccountTier::Premium => CHUNK_STEPS_MIB[CHUNK_STEPS_MIB.len() - 1],
    };
    largest * MIB * MAX_CHUNK_COUNT
}

pub fn plan_chunk_size(size: u64, tier: AccountTier) -> Result<u64, PlanError> {
    let chunk_size = policy_chunk_size(size, tier);
    if size < 1 || size > chunk_size * MAX_CHUNK_COUNT {
        return Err(PlanError::SizeUnsupported {
            size,
            max: max_file_size(tier),
        });
    }
    Ok(chunk_size)
}

fn policy_chunk_size(size: u64, tier: AccountTier) -> u64 {
    if tier == AccountTier::Standard {
        return CHUNK_STEPS_MIB[0] * MIB;
    }
    CHUNK_STEPS_MIB
        .iter()
        .find(|step| size <= *step * GIB)
        .copied()
        .unwrap_or(CHUNK_STEPS_MIB[CHUNK_STEPS_MIB.len() - 1])
        * MIB
}

pub fn chunk_count(size: u64, chunk_size: u64) -> usize {
    size.div_ceil(chunk_size.max(1)) as usize
}

/// Byte offset and length of chunk `index`; the last chunk may be short.
pub fn chunk_range(size: u64, chunk_size: u64, index: usize) -> (u64, u64) {
    let offset = index as u64 * chunk_size;
    let len = chunk_size.min(size.saturating_sub(offset));
    (offset, len)
}

/// Streams `path` once and builds its manifest for `chunk_size` boundaries.
pub async fn hash_file(
    path: &Path,
    chunk_size: u64,
    expected_size: u64,
) -> Result<HashManifest, PlanError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buffer = vec![0u8; READ_BUFFER_LEN];
    let mut whole = Context::new();
    let mut slice = Context::new();
    let mut chunk = Context::new();
    let mut crc = crc32fast::Hasher::new();
    let mut chunks = Vec::new();
    let mut in_chunk = 0u64;
    let mut total = 0u64;

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        let mut data = &buffer[..read];
        whole.consume(data);
        crc.update(data);
        if total < SLICE_LEN {
            let take = (SLICE_LEN - total).min(read as u64) as usize;
            slice.consume(&data[..take]);
        }
        total += read as u64;

        while !data.is_empty() {
            let take = ((chunk_size - in_chunk) as usize).min(data.len());
            chunk.consume(&data[..take]);
            in_chunk += take as u64;
            data = &data[take..];
            if in_chunk == chunk_size {
                chunks.push(hex_digest(std::mem::replace(&mut chunk, Context::new())));
                in_chunk = 0;
            }
        }
    }
    if in_chunk > 0 {
        chunks.push(hex_digest(chunk));
    }
    if total != expected_size {
        return Err(PlanError::SizeChanged {
            expected: expected_size,
            actual: total,
        });
    }

    tracing::debug!(path = %path.display(), chunks = chunks.len(), "hashed local file");
    Ok(HashManifest {
        file: hex_digest(whole),
        slice: hex_digest(slice),
        crc32: crc.finalize(),
        chunks,
    })
}

pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

fn hex_digest(context: Context) -> String {
    format!("{:x}", context.compute())
}
