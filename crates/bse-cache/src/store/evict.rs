//! Eviction: single removals, clear, and policy sweeps.
//!
//! The directory write lock is held for one removal at a time, never for a
//! whole sweep.

use std::path::Path;

use chrono::Utc;
use tokio::fs;
use tracing::{debug, warn};

use crate::error::{CacheError, CacheResult};

use super::policy::{self, EvictReason, EvictionPolicy};
use super::{integrity, io, keys, read, CacheMeta, DiskCache, SweepReport};

pub(crate) async fn evict_impl(cache: &DiskCache, fingerprint: &str) -> CacheResult<bool> {
    keys::validate_key_impl(fingerprint)?;
    let path = keys::entry_path_impl(cache.entries_dir(), fingerprint);

    let removed = remove_entry_file(cache, &path).await?;
    if removed {
        debug!(fingerprint, "evicted from cache");
    }
    Ok(removed)
}

/// Evict an entry a reader found corrupt, unless a writer has replaced it
/// with a valid record since.
pub(crate) async fn evict_corrupt_impl(cache: &DiskCache, fingerprint: &str) -> CacheResult<bool> {
    keys::validate_key_impl(fingerprint)?;
    let path = keys::entry_path_impl(cache.entries_dir(), fingerprint);
    let _dir_guard = cache.inner.dir_lock.write().await;

    let record = match fs::read(&path).await {
        Ok(record) => record,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(CacheError::io("failed to read cache entry", e)),
    };
    match integrity::decode_record_impl(fingerprint, record) {
        Err(CacheError::Corrupt { .. }) => {}
        Ok(_) => {
            debug!(fingerprint, "corrupt entry was replaced, keeping it");
            return Ok(false);
        }
        Err(e) => return Err(e),
    }

    let removed = remove_locked(cache, &path).await?;
    if removed {
        debug!(fingerprint, "evicted corrupt entry");
    }
    Ok(removed)
}

pub(crate) async fn clear_impl(cache: &DiskCache) -> CacheResult<usize> {
    let scan = read::scan_impl(cache).await?;
    let mut removed = 0;

    for path in scan
        .entries
        .iter()
        .map(|(path, _)| path)
        .chain(scan.corrupt.iter())
    {
        if remove_entry_file(cache, path).await? {
            removed += 1;
        }
    }

    debug!(removed, "cleared disk cache");
    Ok(removed)
}

pub(crate) async fn sweep_impl(
    cache: &DiskCache,
    eviction: &EvictionPolicy,
) -> CacheResult<SweepReport> {
    let now = Utc::now();
    let scan = read::scan_impl(cache).await?;
    let mut report = SweepReport {
        scanned: scan.entries.len() + scan.corrupt.len(),
        ..SweepReport::default()
    };

    for path in &scan.corrupt {
        match remove_if_corrupt(cache, path).await {
            Ok(true) => report.removed_corrupt += 1,
            Ok(false) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove corrupt entry"),
        }
    }

    for (path, modified) in &scan.temps {
        let age = modified.elapsed().unwrap_or_default();
        if age < eviction.tmp_grace {
            continue;
        }
        match fs::remove_file(path).await {
            Ok(()) => report.temp_files_removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove temp file"),
        }
    }

    let plan = policy::plan_eviction_impl(scan.entries, eviction, now);
    report.remaining_entries = plan.remaining_entries;
    report.remaining_bytes = plan.remaining_bytes;

    for victim in plan.victims {
        match remove_if_unchanged(cache, &victim.path, &victim.meta).await {
            Ok(true) => {
                report.bytes_freed += victim.meta.size_bytes;
                match victim.reason {
                    EvictReason::Expired => report.removed_expired += 1,
                    EvictReason::MaxAge => report.removed_aged += 1,
                    EvictReason::Size => report.removed_for_size += 1,
                }
            }
            Ok(false) => {
                // Rewritten since the scan; the fresh entry stays.
                report.remaining_entries += 1;
                report.remaining_bytes += victim.meta.size_bytes;
            }
            Err(e) => {
                warn!(
                    fingerprint = %victim.meta.fingerprint,
                    error = %e,
                    "failed to evict cache entry"
                );
            }
        }
    }

    debug!(
        scanned = report.scanned,
        removed = report.removed(),
        bytes_freed = report.bytes_freed,
        "cache sweep finished"
    );
    Ok(report)
}

async fn remove_entry_file(cache: &DiskCache, path: &Path) -> CacheResult<bool> {
    let _dir_guard = cache.inner.dir_lock.write().await;
    remove_locked(cache, path).await
}

/// Remove `path` only if it still holds the record the sweep planned on.
async fn remove_if_unchanged(
    cache: &DiskCache,
    path: &Path,
    expected: &CacheMeta,
) -> CacheResult<bool> {
    let _dir_guard = cache.inner.dir_lock.write().await;

    match io::read_header_impl(path).await {
        Ok(Some(current))
            if current.created_at == expected.created_at && current.digest == expected.digest => {}
        Ok(_) => return Ok(false),
        Err(CacheError::Corrupt { .. }) => {}
        Err(e) => return Err(e),
    }

    remove_locked(cache, path).await
}

/// Remove `path` only if its header still fails to parse.
async fn remove_if_corrupt(cache: &DiskCache, path: &Path) -> CacheResult<bool> {
    let _dir_guard = cache.inner.dir_lock.write().await;

    match io::read_header_impl(path).await {
        Err(CacheError::Corrupt { .. }) => remove_locked(cache, path).await,
        Ok(_) => Ok(false),
        Err(e) => Err(e),
    }
}

async fn remove_locked(cache: &DiskCache, path: &Path) -> CacheResult<bool> {
    match fs::remove_file(path).await {
        Ok(()) => {
            cache.record_eviction();
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(CacheError::io("failed to evict cache entry", e)),
    }
}
