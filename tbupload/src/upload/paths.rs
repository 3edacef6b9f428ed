use std::path::{Path, PathBuf};

use thiserror::Error;

pub const HASH_FILE_SUFFIX: &str = ".tbhash";
const SIDECAR_SUFFIX: &str = ".tmpstate";

#[derive(Debug, Error)]
pub enum PathError {
    #[error("remote path is empty")]
    Empty,
    #[error("local path has no file name: {0}")]
    NoFileName(PathBuf),
}

/// Uploads from a `.tbhash` document reuse a previously computed manifest
/// without the source bytes being present.
pub fn is_hash_only(local: &Path) -> bool {
    local
        .file_name()
        .map(|name| name.to_string_lossy().ends_with(HASH_FILE_SUFFIX))
        .unwrap_or(false)
}

pub fn sidecar_path_for(local: &Path) -> Result<PathBuf, PathError> {
    if is_hash_only(local) {
        return Ok(local.to_path_buf());
    }
    let name = local
        .file_name()
        .ok_or_else(|| PathError::NoFileName(local.to_path_buf()))?;
    Ok(local.with_file_name(format!(".{}{SIDECAR_SUFFIX}", name.to_string_lossy())))
}

pub fn hash_companion_path(local: &Path) -> PathBuf {
    let mut raw = local.as_os_str().to_os_string();
    raw.push(HASH_FILE_SUFFIX);
    PathBuf::from(raw)
}

/// Name the file will get on the remote, with the `.tbhash` suffix stripped.
pub fn target_file_name(local: &Path) -> Result<String, PathError> {
    let name = local
        .file_name()
        .ok_or_else(|| PathError::NoFileName(local.to_path_buf()))?
        .to_string_lossy()
        .into_owned();
    if let Some(stripped) = name.strip_suffix(HASH_FILE_SUFFIX) {
        return Ok(stripped.to_string());
    }
    Ok(name)
}

pub fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}

/// Normalizes a user supplied remote directory to `/a/b` form.
pub fn normalize_remote_dir(raw: &str) -> Result<String, PathError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(PathError::Empty);
    }
    let trimmed = trimmed.strip_prefix("root").unwrap_or(trimmed);
    let parts: Vec<String> = trimmed
        .split('/')
        .map(clean_component)
        .filter(|part| !part.is_empty())
        .collect();
    Ok(format!("/{}", parts.join("/")))
}

pub fn remote_target_path(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}

fn clean_component(part: &str) -> String {
    let mut cleaned: String = part
        .chars()
        .filter(|c| !matches!(c, '/' | '?' | '<' | '>' | '\\' | ':' | '*' | '|' | '"'))
        .filter(|c| !matches!(*c as u32, 0x00..=0x1f | 0x80..=0x9f))
        .collect();
    if cleaned.chars().all(|c| c == '.') || is_windows_reserved(&cleaned) {
        return String::new();
    }
    while cleaned.ends_with('.') || cleaned.ends_with(' ') {
        cleaned.pop();
    }
    cleaned
}

fn is_windows_reserved(name: &str) -> bool {
    let stem = name.split('.').next().unwrap_or_default().to_ascii_lowercase();
    match stem.as_str() {
        "con" | "prn" | "aux" | "nul" => true,
        _ => {
            let bytes = stem.as_bytes();
            bytes.len() == 4
                && (stem.starts_with("com") || stem.starts_with("lpt"))
                && bytes[3].is_ascii_digit()
        }
    }
}
