//! Key validation and path derivation.

use std::path::{Path, PathBuf};

use crate::error::{CacheError, CacheResult};

pub(crate) const ENTRY_EXTENSION: &str = "entry";
pub(crate) const TEMP_EXTENSION: &str = "tmp";

const MAX_KEY_LEN: usize = 128;

/// What a file inside a shard directory is.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FileKind {
    Entry(String),
    Temp,
    Other,
}

pub(crate) fn validate_key_impl(key: &str) -> CacheResult<()> {
    let reason = if key.is_empty() {
        "key is empty"
    } else if key.len() > MAX_KEY_LEN {
        "key is longer than 128 characters"
    } else if !key
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        "key may only contain ASCII letters, digits, '-' and '_'"
    } else {
        return Ok(());
    };

    Err(CacheError::InvalidKey {
        key: key.to_string(),
        reason: reason.to_string(),
    })
}

/// Keys are ASCII after validation, so byte slicing is safe.
pub(crate) fn shard_dir_impl(entries_dir: &Path, key: &str) -> PathBuf {
    let shard = key.get(..2).unwrap_or(key);
    entries_dir.join(shard)
}

pub(crate) fn entry_path_impl(entries_dir: &Path, key: &str) -> PathBuf {
    shard_dir_impl(entries_dir, key).join(format!("{}.{}", key, ENTRY_EXTENSION))
}

pub(crate) fn temp_path_impl(shard_dir: &Path, key: &str) -> PathBuf {
    shard_dir.join(format!(
        "{}.{}.{}",
        key,
        uuid::Uuid::new_v4().simple(),
        TEMP_EXTENSION
    ))
}

pub(crate) fn classify_impl(path: &Path) -> FileKind {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return FileKind::Other;
    };

    if name.ends_with(&format!(".{}", TEMP_EXTENSION)) {
        return FileKind::Temp;
    }

    match name.strip_suffix(&format!(".{}", ENTRY_EXTENSION)) {
        Some(stem) if validate_key_impl(stem).is_ok() => FileKind::Entry(stem.to_string()),
        _ => FileKind::Other,
    }
}
