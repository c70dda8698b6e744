//! Crash-tolerant disk cache for connector responses.
//!
//! This crate provides:
//!
//! - One file per fingerprint with atomic replace (temp + fsync + rename)
//! - Integrity verification on read (size and sha256 digest)
//! - Per-key write serialization; lock-free reads
//! - Age/size eviction sweeps, optionally on a background task
//!
//! # Quick Start
//!
//! ```no_run
//! use bse_cache::{DiskCache, EntryAttrs};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let cache = DiskCache::open("/var/cache/bse")?;
//!
//! let attrs = EntryAttrs::default().with_content_type("application/json");
//! cache.put_with("5f2a9c", br#"{"ok":true}"#, &attrs).await?;
//!
//! if let Some(entry) = cache.get("5f2a9c").await {
//!     println!("{} bytes", entry.metadata.size_bytes);
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
mod store;
mod sweeper;

pub use error::{CacheError, CacheResult};
pub use store::policy::{cacheability, Cacheability, EvictionPolicy};
pub use store::{
    compute_digest, default_cache_dir, CacheEntry, CacheMeta, CacheStats, DiskCache, EntryAttrs, SweepReport,
};
pub use sweeper::spawn_sweeper;
