//! Filesystem boundary: root preparation, atomic writes, header reads.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::error::{CacheError, CacheResult};

use super::CacheMeta;
use super::keys;

/// Upper bound on the header line of an entry.
const MAX_HEADER_BYTES: u64 = 64 * 1024;

pub(crate) fn default_cache_dir_impl() -> CacheResult<PathBuf> {
    let base = dirs::home_dir().ok_or_else(|| CacheError::Config {
        path: PathBuf::from("~/.bse_mcp_cache"),
        message: "could not determine home directory".to_string(),
    })?;

    Ok(base.join(".bse_mcp_cache"))
}

/// Create the root and prove it is writable. Runs once at startup.
pub(crate) fn prepare_root_impl(root: &Path, entries_dir: &Path) -> CacheResult<()> {
    let config_err = |message: String| CacheError::Config {
        path: root.to_path_buf(),
        message,
    };

    std::fs::create_dir_all(entries_dir)
        .map_err(|e| config_err(format!("failed to create cache directory: {}", e)))?;

    let marker = root.join(format!(".write-check-{}", uuid::Uuid::new_v4().simple()));
    std::fs::write(&marker, b"check")
        .map_err(|e| config_err(format!("cache directory is not writable: {}", e)))?;
    std::fs::remove_file(&marker)
        .map_err(|e| config_err(format!("failed to remove write check file: {}", e)))?;

    Ok(())
}

/// A temp file that is removed on drop unless committed.
///
/// Dropping covers both error returns and cancellation of the writing future.
#[derive(Debug)]
pub(crate) struct TempFile {
    path: PathBuf,
    armed: bool,
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

pub(crate) async fn write_temp_impl(
    shard_dir: &Path,
    key: &str,
    bytes: &[u8],
) -> CacheResult<TempFile> {
    let temp = TempFile {
        path: keys::temp_path_impl(shard_dir, key),
        armed: true,
    };

    let mut file = fs::File::create(&temp.path)
        .await
        .map_err(|e| CacheError::io("failed to create temp file", e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| CacheError::io("failed to write temp file", e))?;
    file.flush()
        .await
        .map_err(|e| CacheError::io("failed to flush temp file", e))?;
    file.sync_all()
        .await
        .map_err(|e| CacheError::io("failed to sync temp file", e))?;

    Ok(temp)
}

pub(crate) async fn commit_impl(mut temp: TempFile, target: &Path) -> CacheResult<()> {
    fs::rename(&temp.path, target)
        .await
        .map_err(|e| CacheError::io("failed to rename temp file", e))?;
    temp.armed = false;
    Ok(())
}

/// Persist the rename itself. Best effort: not every platform can open directories.
pub(crate) async fn sync_dir_impl(dir: &Path) {
    #[cfg(unix)]
    {
        let synced = match fs::File::open(dir).await {
            Ok(handle) => handle.sync_all().await,
            Err(e) => Err(e),
        };
        if let Err(e) = synced {
            debug!(dir = %dir.display(), error = %e, "directory fsync failed");
        }
    }
    #[cfg(not(unix))]
    let _ = dir;
}

/// Read the header line of an entry without loading the payload.
///
/// Returns `Ok(None)` if the file does not exist.
pub(crate) async fn read_header_impl(path: &Path) -> CacheResult<Option<CacheMeta>> {
    let file = match fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(CacheError::io("failed to open cache entry", e)),
    };

    let mut line = Vec::new();
    BufReader::new(file)
        .take(MAX_HEADER_BYTES)
        .read_until(b'\n', &mut line)
        .await
        .map_err(|e| CacheError::io("failed to read cache entry header", e))?;

    let fingerprint = match keys::classify_impl(path) {
        keys::FileKind::Entry(key) => key,
        _ => path.display().to_string(),
    };

    if line.pop() != Some(b'\n') {
        return Err(CacheError::Corrupt {
            fingerprint,
            reason: "missing header terminator".to_string(),
        });
    }

    serde_json::from_slice(&line)
        .map(Some)
        .map_err(|e| CacheError::Corrupt {
            fingerprint,
            reason: format!("unparsable header: {}", e),
        })
}
