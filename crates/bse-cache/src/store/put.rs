//! Write path: temp file, fsync, atomic rename.

use chrono::Utc;
use tokio::fs;
use tracing::debug;

use crate::error::{CacheError, CacheResult};

use super::{integrity, io, keys, policy, CacheMeta, DiskCache, EntryAttrs};

pub(crate) async fn put_impl(
    cache: &DiskCache,
    fingerprint: &str,
    payload: &[u8],
    attrs: &EntryAttrs,
) -> CacheResult<CacheMeta> {
    keys::validate_key_impl(fingerprint)?;

    let created_at = Utc::now();
    let meta = CacheMeta {
        fingerprint: fingerprint.to_string(),
        created_at,
        expires_at: policy::expires_at_impl(created_at, attrs.ttl),
        size_bytes: payload.len() as u64,
        digest: integrity::compute_digest(payload),
        content_type: attrs.content_type.clone(),
        source: attrs.source.clone(),
    };
    let record = integrity::encode_record_impl(&meta, payload)?;

    let shard_dir = keys::shard_dir_impl(cache.entries_dir(), fingerprint);
    let target = keys::entry_path_impl(cache.entries_dir(), fingerprint);

    // One writer per key; the last rename wins.
    let _key_guard = cache.inner.key_locks.lock_for(fingerprint).lock().await;

    fs::create_dir_all(&shard_dir)
        .await
        .map_err(|e| CacheError::io("failed to create shard directory", e))?;

    let temp = io::write_temp_impl(&shard_dir, fingerprint, &record).await?;
    {
        let _dir_guard = cache.inner.dir_lock.read().await;
        io::commit_impl(temp, &target).await?;
    }
    io::sync_dir_impl(&shard_dir).await;

    debug!(fingerprint, size_bytes = meta.size_bytes, "cached entry");
    Ok(meta)
}
