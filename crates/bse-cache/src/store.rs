//! Disk-backed response store.
//!
//! Every entry is a single file, written to a temp path and atomically renamed
//! into place, so readers observe either the previous record or the new one.
//!
//! # Layout
//!
//! ```text
//! {root}/v1/{fp[0..2]}/
//!   {fp}.entry           # JSON header line + raw payload
//!   {fp}.{uuid}.tmp      # in-flight write (removed on failure)
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::{CacheError, CacheResult};

mod evict;
mod integrity;
mod io;
mod keys;
mod locks;
pub(crate) mod policy;
mod put;
mod read;

pub use integrity::compute_digest;

/// Default cache root: `~/.bse_mcp_cache`.
pub fn default_cache_dir() -> CacheResult<PathBuf> {
    io::default_cache_dir_impl()
}

/// Subdirectory holding entries of the current record format.
const FORMAT_DIR: &str = "v1";

/// Metadata stored in the header line of every entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMeta {
    /// Request fingerprint the entry is stored under.
    pub fingerprint: String,

    /// When the entry was written.
    pub created_at: DateTime<Utc>,

    /// When the entry stops being served. `None` never expires.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    /// Payload length in bytes.
    pub size_bytes: u64,

    /// Payload digest (sha256:...).
    pub digest: String,

    /// Content type reported by the origin.
    #[serde(default)]
    pub content_type: Option<String>,

    /// Where the payload was fetched from.
    #[serde(default)]
    pub source: Option<String>,
}

impl CacheMeta {
    /// Whether the entry has expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }
}

/// A cached payload together with its metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Stored bytes.
    pub payload: Vec<u8>,

    /// Entry metadata.
    pub metadata: CacheMeta,
}

/// Optional attributes recorded with a `put`.
#[derive(Debug, Clone, Default)]
pub struct EntryAttrs {
    pub content_type: Option<String>,
    pub source: Option<String>,
    /// Time to live. `None` keeps the entry until evicted.
    pub ttl: Option<Duration>,
}

impl EntryAttrs {
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Point-in-time view of the store.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub cache_dir: PathBuf,
    pub entries: usize,
    pub total_bytes: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub write_failures: u64,
    pub evictions: u64,
}

/// Outcome of one eviction sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub removed_expired: usize,
    pub removed_aged: usize,
    pub removed_for_size: usize,
    pub removed_corrupt: usize,
    pub temp_files_removed: usize,
    pub bytes_freed: u64,
    pub remaining_entries: usize,
    pub remaining_bytes: u64,
}

impl SweepReport {
    /// Number of entries removed by this sweep.
    pub fn removed(&self) -> usize {
        self.removed_expired + self.removed_aged + self.removed_for_size + self.removed_corrupt
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    write_failures: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug)]
struct Inner {
    root: PathBuf,
    entries_dir: PathBuf,
    key_locks: locks::KeyLocks,
    /// Held shared around renames, exclusively around single-entry removals.
    dir_lock: RwLock<()>,
    counters: Counters,
}

/// Disk cache store. Cheap to clone; clones share locks and counters.
#[derive(Debug, Clone)]
pub struct DiskCache {
    inner: Arc<Inner>,
}

impl DiskCache {
    /// Open (and create if needed) a cache rooted at `dir`.
    ///
    /// Fails with [`CacheError::Config`] when the directory cannot be created
    /// or written to.
    pub fn open(dir: impl Into<PathBuf>) -> CacheResult<Self> {
        let root = dir.into();
        let entries_dir = root.join(FORMAT_DIR);
        io::prepare_root_impl(&root, &entries_dir)?;

        Ok(Self {
            inner: Arc::new(Inner {
                root,
                entries_dir,
                key_locks: locks::KeyLocks::new(),
                dir_lock: RwLock::new(()),
                counters: Counters::default(),
            }),
        })
    }

    /// Open the cache in the default location (`~/.bse_mcp_cache`).
    pub fn open_default() -> CacheResult<Self> {
        Self::open(default_cache_dir()?)
    }

    /// Get the cache root directory.
    pub fn cache_dir(&self) -> &Path {
        &self.inner.root
    }

    fn entries_dir(&self) -> &Path {
        &self.inner.entries_dir
    }

    /// Look up an entry, degrading every failure to a miss.
    ///
    /// Corrupt entries are evicted so the next request can repopulate them.
    pub async fn get(&self, fingerprint: &str) -> Option<CacheEntry> {
        let counters = &self.inner.counters;
        match self.try_get(fingerprint).await {
            Ok(Some(entry)) => {
                counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            Ok(None) => {
                counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(err @ CacheError::Corrupt { .. }) => {
                warn!(fingerprint, error = %err, "evicting corrupt cache entry");
                if let Err(e) = evict::evict_corrupt_impl(self, fingerprint).await {
                    warn!(fingerprint, error = %e, "failed to evict corrupt cache entry");
                }
                counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(err) => {
                warn!(fingerprint, error = %err, "cache read failed, treating as miss");
                counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Look up an entry, surfacing read and integrity errors.
    ///
    /// Returns `Ok(None)` if not cached or expired.
    pub async fn try_get(&self, fingerprint: &str) -> CacheResult<Option<CacheEntry>> {
        read::get_impl(self, fingerprint).await
    }

    /// Read only the header of an entry.
    pub async fn get_meta(&self, fingerprint: &str) -> Option<CacheMeta> {
        read::get_meta_impl(self, fingerprint).await
    }

    /// Store a payload with no extra attributes and no expiry.
    pub async fn put(&self, fingerprint: &str, payload: &[u8]) -> CacheResult<CacheMeta> {
        self.put_with(fingerprint, payload, &EntryAttrs::default())
            .await
    }

    /// Store a payload durably. On success the entry survives a restart.
    pub async fn put_with(
        &self,
        fingerprint: &str,
        payload: &[u8],
        attrs: &EntryAttrs,
    ) -> CacheResult<CacheMeta> {
        let result = put::put_impl(self, fingerprint, payload, attrs).await;
        let counter = match result {
            Ok(_) => &self.inner.counters.writes,
            Err(_) => &self.inner.counters.write_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        result
    }

    /// Remove a single entry. Returns whether anything was removed.
    pub async fn evict(&self, fingerprint: &str) -> CacheResult<bool> {
        evict::evict_impl(self, fingerprint).await
    }

    /// Remove every entry. Returns the number removed.
    pub async fn clear(&self) -> CacheResult<usize> {
        evict::clear_impl(self).await
    }

    /// Apply an eviction policy once.
    pub async fn sweep(&self, policy: &policy::EvictionPolicy) -> CacheResult<SweepReport> {
        evict::sweep_impl(self, policy).await
    }

    /// List metadata of all readable entries.
    pub async fn list(&self) -> CacheResult<Vec<CacheMeta>> {
        read::list_impl(self).await
    }

    /// Aggregate on-disk totals with in-process counters.
    pub async fn stats(&self) -> CacheResult<CacheStats> {
        let entries = self.list().await?;
        let counters = &self.inner.counters;

        Ok(CacheStats {
            cache_dir: self.inner.root.clone(),
            entries: entries.len(),
            total_bytes: entries.iter().map(|m| m.size_bytes).sum(),
            oldest: entries.iter().map(|m| m.created_at).min(),
            newest: entries.iter().map(|m| m.created_at).max(),
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            writes: counters.writes.load(Ordering::Relaxed),
            write_failures: counters.write_failures.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
        })
    }

    fn record_eviction(&self) {
        self.inner.counters.evictions.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::policy::EvictionPolicy;
    use super::*;
    use tempfile::TempDir;
    use tokio::fs;

    const FP: &str = "0a1b2c3d4e5f";

    fn create_test_cache() -> (DiskCache, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let cache = DiskCache::open(temp_dir.path().join("cache")).unwrap();
        (cache, temp_dir)
    }

    #[tokio::test]
    async fn test_cache_roundtrip() {
        let (cache, _temp_dir) = create_test_cache();
        let payload = br#"{"scrip_code":"500325"}"#;

        let meta = cache.put(FP, payload).await.unwrap();
        assert_eq!(meta.size_bytes, payload.len() as u64);

        let entry = cache.get(FP).await.unwrap();
        assert_eq!(entry.payload, payload);
        assert_eq!(entry.metadata.digest, compute_digest(payload));
        assert_eq!(entry.metadata.fingerprint, FP);
    }

    #[tokio::test]
    async fn test_cache_miss() {
        let (cache, _temp_dir) = create_test_cache();

        assert!(cache.get("deadbeef").await.is_none());
        assert!(cache.try_get("deadbeef").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_binary_payload_with_newlines() {
        let (cache, _temp_dir) = create_test_cache();
        let payload = b"\n\x00line one\nline two\n\xff";

        cache.put(FP, payload).await.unwrap();
        let entry = cache.get(FP).await.unwrap();
        assert_eq!(entry.payload, payload);
    }

    #[tokio::test]
    async fn test_put_replaces_previous_entry() {
        let (cache, _temp_dir) = create_test_cache();

        cache.put(FP, b"first").await.unwrap();
        cache.put(FP, b"second").await.unwrap();

        let entry = cache.get(FP).await.unwrap();
        assert_eq!(entry.payload, b"second");
        assert_eq!(cache.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_put_with_attrs() {
        let (cache, _temp_dir) = create_test_cache();
        let attrs = EntryAttrs::default()
            .with_content_type("application/json")
            .with_source("https://api.bseindia.com/BseIndiaAPI/api/x");

        cache.put_with(FP, b"{}", &attrs).await.unwrap();

        let meta = cache.get_meta(FP).await.unwrap();
        assert_eq!(meta.content_type.as_deref(), Some("application/json"));
        assert_eq!(
            meta.source.as_deref(),
            Some("https://api.bseindia.com/BseIndiaAPI/api/x")
        );
        assert!(meta.expires_at.is_none());
    }

    #[tokio::test]
    async fn test_cache_expiry() {
        let (cache, _temp_dir) = create_test_cache();
        let attrs = EntryAttrs::default().with_ttl(Some(Duration::ZERO));

        cache.put_with(FP, b"stale", &attrs).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(cache.get(FP).await.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_payload_is_evicted() {
        let (cache, _temp_dir) = create_test_cache();
        cache.put(FP, b"payload").await.unwrap();

        // Same length, different bytes.
        let path = keys::entry_path_impl(cache.entries_dir(), FP);
        let mut raw = fs::read(&path).await.unwrap();
        let last = raw.len() - 1;
        raw[last] = b'X';
        fs::write(&path, raw).await.unwrap();

        let err = cache.try_get(FP).await.unwrap_err();
        assert!(
            matches!(err, CacheError::Corrupt { .. }),
            "Should detect corruption: {:?}",
            err
        );

        assert!(cache.get(FP).await.is_none());
        assert!(!path.exists(), "corrupt entry should be evicted on read");
    }

    #[tokio::test]
    async fn test_corrupt_eviction_keeps_rewritten_entry() {
        let (cache, _temp_dir) = create_test_cache();
        cache.put(FP, b"payload").await.unwrap();

        let path = keys::entry_path_impl(cache.entries_dir(), FP);
        fs::write(&path, "not json\npayload").await.unwrap();
        assert!(cache.try_get(FP).await.is_err());

        // A writer lands a good record before the reader gets to evict.
        cache.put(FP, b"repaired").await.unwrap();
        assert!(!evict::evict_corrupt_impl(&cache, FP).await.unwrap());
        assert_eq!(cache.get(FP).await.unwrap().payload, b"repaired");

        fs::write(&path, "not json\npayload").await.unwrap();
        assert!(evict::evict_corrupt_impl(&cache, FP).await.unwrap());
        assert!(!path.exists());
        assert!(!evict::evict_corrupt_impl(&cache, FP).await.unwrap());
    }

    #[tokio::test]
    async fn test_truncated_entry_is_corrupt() {
        let (cache, _temp_dir) = create_test_cache();
        cache.put(FP, b"a longer payload").await.unwrap();

        let path = keys::entry_path_impl(cache.entries_dir(), FP);
        let raw = fs::read(&path).await.unwrap();
        fs::write(&path, &raw[..raw.len() - 4]).await.unwrap();

        let result = cache.try_get(FP).await;
        assert!(matches!(result, Err(CacheError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn test_header_garbage_is_corrupt() {
        let (cache, _temp_dir) = create_test_cache();
        cache.put(FP, b"payload").await.unwrap();

        let path = keys::entry_path_impl(cache.entries_dir(), FP);
        fs::write(&path, "not json\npayload").await.unwrap();

        assert!(matches!(
            cache.try_get(FP).await,
            Err(CacheError::Corrupt { .. })
        ));
        assert!(cache.get_meta(FP).await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_keys_rejected() {
        let (cache, _temp_dir) = create_test_cache();

        let long = "f".repeat(129);
        for key in ["", "../escape", "a/b", "with.dot", long.as_str()] {
            let err = cache.put(key, b"x").await.unwrap_err();
            assert!(matches!(err, CacheError::InvalidKey { .. }), "{key:?}");
        }
        assert!(cache.get("../escape").await.is_none());
    }

    #[tokio::test]
    async fn test_cache_evict() {
        let (cache, _temp_dir) = create_test_cache();
        cache.put(FP, b"payload").await.unwrap();

        assert!(cache.evict(FP).await.unwrap());
        assert!(cache.get(FP).await.is_none());
        assert!(!cache.evict(FP).await.unwrap());
    }

    #[tokio::test]
    async fn test_cache_clear() {
        let (cache, _temp_dir) = create_test_cache();
        cache.put("aa01", b"one").await.unwrap();
        cache.put("bb02", b"two").await.unwrap();
        cache.put("bb03", b"three").await.unwrap();

        assert_eq!(cache.clear().await.unwrap(), 3);
        assert!(cache.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_atomic_write_leaves_no_temp_files() {
        let (cache, _temp_dir) = create_test_cache();
        cache.put(FP, b"payload").await.unwrap();

        let shard = keys::shard_dir_impl(cache.entries_dir(), FP);
        let mut entries = fs::read_dir(&shard).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            let name = entry.file_name();
            let name_str = name.to_string_lossy();
            assert!(
                !name_str.ends_with(".tmp"),
                "Temp file should not remain: {}",
                name_str
            );
        }
    }

    #[tokio::test]
    async fn test_sweep_by_age() {
        let (cache, _temp_dir) = create_test_cache();
        cache.put("aa01", b"old").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let policy = EvictionPolicy::default().with_max_age(Some(Duration::from_millis(5)));
        let report = cache.sweep(&policy).await.unwrap();

        assert_eq!(report.removed_aged, 1);
        assert_eq!(report.remaining_entries, 0);
        assert!(cache.get("aa01").await.is_none());
    }

    #[tokio::test]
    async fn test_sweep_trims_oldest_first() {
        let (cache, _temp_dir) = create_test_cache();
        for key in ["aa01", "aa02", "aa03"] {
            cache.put(key, &[0_u8; 10]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let policy = EvictionPolicy::default().with_max_total_bytes(Some(20));
        let report = cache.sweep(&policy).await.unwrap();

        assert_eq!(report.removed_for_size, 1);
        assert_eq!(report.bytes_freed, 10);
        assert_eq!(report.remaining_bytes, 20);
        assert!(cache.get("aa01").await.is_none());
        assert!(cache.get("aa02").await.is_some());
        assert!(cache.get("aa03").await.is_some());
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_and_stale_temp_files() {
        let (cache, _temp_dir) = create_test_cache();
        let attrs = EntryAttrs::default().with_ttl(Some(Duration::ZERO));
        cache.put_with("aa01", b"expired", &attrs).await.unwrap();
        cache.put("aa02", b"fresh").await.unwrap();

        let shard = keys::shard_dir_impl(cache.entries_dir(), "aa01");
        let orphan = shard.join("aa01.0000.tmp");
        fs::write(&orphan, b"half written").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let policy = EvictionPolicy::default().with_tmp_grace(Duration::ZERO);
        let report = cache.sweep(&policy).await.unwrap();

        assert_eq!(report.removed_expired, 1);
        assert_eq!(report.temp_files_removed, 1);
        assert_eq!(report.remaining_entries, 1);
        assert!(!orphan.exists());
    }

    #[tokio::test]
    async fn test_sweep_without_thresholds_keeps_everything() {
        let (cache, _temp_dir) = create_test_cache();
        cache.put("aa01", b"one").await.unwrap();

        let report = cache.sweep(&EvictionPolicy::default()).await.unwrap();
        assert_eq!(report.removed(), 0);
        assert_eq!(report.remaining_entries, 1);
    }

    #[tokio::test]
    async fn test_scan_skips_files_beside_shards() {
        let (cache, _temp_dir) = create_test_cache();
        cache.put("aa01", b"one").await.unwrap();
        fs::write(cache.entries_dir().join("README"), b"not a shard")
            .await
            .unwrap();

        assert_eq!(cache.list().await.unwrap().len(), 1);
        let report = cache.sweep(&EvictionPolicy::default()).await.unwrap();
        assert_eq!(report.scanned, 1);
        assert!(cache.entries_dir().join("README").exists());
    }

    #[tokio::test]
    async fn test_stats_counters() {
        let (cache, _temp_dir) = create_test_cache();
        cache.put("aa01", b"12345").await.unwrap();
        cache.put("bb01", b"678").await.unwrap();
        assert!(cache.get("aa01").await.is_some());
        assert!(cache.get("cc01").await.is_none());
        cache.evict("bb01").await.unwrap();

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.total_bytes, 5);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.writes, 2);
        assert_eq!(stats.evictions, 1);
        assert!(stats.oldest.is_some());
    }
}
