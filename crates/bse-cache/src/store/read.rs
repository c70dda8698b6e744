//! Read path: lookups, header reads and directory scans.

use std::path::PathBuf;
use std::time::SystemTime;

use chrono::Utc;
use tokio::fs;
use tracing::{debug, warn};

use crate::error::{CacheError, CacheResult};

use super::keys::{self, FileKind};
use super::{integrity, io, CacheEntry, CacheMeta, DiskCache};

pub(crate) async fn get_impl(
    cache: &DiskCache,
    fingerprint: &str,
) -> CacheResult<Option<CacheEntry>> {
    keys::validate_key_impl(fingerprint)?;
    let path = keys::entry_path_impl(cache.entries_dir(), fingerprint);

    let record = match fs::read(&path).await {
        Ok(record) => record,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(fingerprint, "entry not in cache");
            return Ok(None);
        }
        Err(e) => return Err(CacheError::io("failed to read cache entry", e)),
    };

    let (metadata, payload) = integrity::decode_record_impl(fingerprint, record)?;

    if metadata.is_expired_at(Utc::now()) {
        debug!(
            fingerprint,
            expires_at = ?metadata.expires_at,
            "cache entry expired"
        );
        return Ok(None);
    }

    debug!(fingerprint, size_bytes = metadata.size_bytes, "cache hit");
    Ok(Some(CacheEntry { payload, metadata }))
}

pub(crate) async fn get_meta_impl(cache: &DiskCache, fingerprint: &str) -> Option<CacheMeta> {
    keys::validate_key_impl(fingerprint).ok()?;
    let path = keys::entry_path_impl(cache.entries_dir(), fingerprint);
    io::read_header_impl(&path).await.ok().flatten()
}

/// Everything found under the entries directory.
#[derive(Debug, Default)]
pub(crate) struct Scan {
    pub entries: Vec<(PathBuf, CacheMeta)>,
    pub corrupt: Vec<PathBuf>,
    pub temps: Vec<(PathBuf, SystemTime)>,
}

pub(crate) async fn scan_impl(cache: &DiskCache) -> CacheResult<Scan> {
    let mut scan = Scan::default();

    let mut shards = match fs::read_dir(cache.entries_dir()).await {
        Ok(shards) => shards,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(scan),
        Err(e) => return Err(CacheError::io("failed to read cache directory", e)),
    };

    while let Some(shard) = shards
        .next_entry()
        .await
        .map_err(|e| CacheError::io("failed to read directory entry", e))?
    {
        let is_dir = shard
            .file_type()
            .await
            .map_err(|e| CacheError::io("failed to read directory entry", e))?
            .is_dir();
        if !is_dir {
            continue;
        }
        let shard_path = shard.path();

        let mut files = match fs::read_dir(&shard_path).await {
            Ok(files) => files,
            // Shard vanished between listing and reading.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(CacheError::io("failed to read shard directory", e)),
        };

        while let Some(file) = files
            .next_entry()
            .await
            .map_err(|e| CacheError::io("failed to read directory entry", e))?
        {
            let path = file.path();
            match keys::classify_impl(&path) {
                FileKind::Entry(_) => match io::read_header_impl(&path).await {
                    Ok(Some(meta)) => scan.entries.push((path, meta)),
                    Ok(None) => {}
                    Err(CacheError::Corrupt { .. }) => scan.corrupt.push(path),
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable entry"),
                },
                FileKind::Temp => {
                    let modified = file
                        .metadata()
                        .await
                        .and_then(|m| m.modified())
                        .unwrap_or_else(|_| SystemTime::now());
                    scan.temps.push((path, modified));
                }
                FileKind::Other => {}
            }
        }
    }

    Ok(scan)
}

pub(crate) async fn list_impl(cache: &DiskCache) -> CacheResult<Vec<CacheMeta>> {
    let scan = scan_impl(cache).await?;
    Ok(scan.entries.into_iter().map(|(_, meta)| meta).collect())
}
