//! Expiry and eviction policy. No filesystem access.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::CacheMeta;

/// Thresholds applied by [`DiskCache::sweep`](super::DiskCache::sweep).
///
/// With no thresholds set, a sweep only removes expired entries, corrupt
/// entries and orphaned temp files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionPolicy {
    /// Remove entries older than this.
    pub max_age: Option<Duration>,

    /// Trim oldest entries until the total payload size fits.
    pub max_total_bytes: Option<u64>,

    /// Temp files older than this are leftovers from interrupted writes.
    pub tmp_grace: Duration,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            max_age: None,
            max_total_bytes: None,
            tmp_grace: Duration::from_secs(60 * 60),
        }
    }
}

impl EvictionPolicy {
    pub fn with_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_max_total_bytes(mut self, max_total_bytes: Option<u64>) -> Self {
        self.max_total_bytes = max_total_bytes;
        self
    }

    pub fn with_tmp_grace(mut self, tmp_grace: Duration) -> Self {
        self.tmp_grace = tmp_grace;
        self
    }
}

/// Whether and for how long an origin response may be stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cacheability {
    /// Origin asked not to store the response.
    NoStore,
    /// Store with this TTL (`None` = until evicted).
    Store(Option<Duration>),
}

/// Derive cacheability from a `Cache-Control` header value.
///
/// `no-store` wins; `max-age=N` sets the TTL; anything else falls back to
/// `default_ttl`.
pub fn cacheability(cache_control: Option<&str>, default_ttl: Option<Duration>) -> Cacheability {
    let Some(cc) = cache_control else {
        return Cacheability::Store(default_ttl);
    };

    let directives: Vec<&str> = cc.split(',').map(str::trim).collect();
    if directives
        .iter()
        .any(|d| d.eq_ignore_ascii_case("no-store"))
    {
        return Cacheability::NoStore;
    }

    let max_age = directives
        .iter()
        .filter_map(|d| d.split_once('='))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("max-age"))
        .and_then(|(_, v)| v.trim().trim_matches('"').parse::<u64>().ok())
        .map(Duration::from_secs);

    Cacheability::Store(max_age.or(default_ttl))
}

pub(crate) fn expires_at_impl(
    created_at: DateTime<Utc>,
    ttl: Option<Duration>,
) -> Option<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl?).ok()?;
    created_at.checked_add_signed(ttl)
}

fn age_at(meta: &CacheMeta, now: DateTime<Utc>) -> Duration {
    (now - meta.created_at).to_std().unwrap_or(Duration::ZERO)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EvictReason {
    Expired,
    MaxAge,
    Size,
}

#[derive(Debug)]
pub(crate) struct Victim {
    pub path: PathBuf,
    pub meta: CacheMeta,
    pub reason: EvictReason,
}

#[derive(Debug, Default)]
pub(crate) struct EvictionPlan {
    pub victims: Vec<Victim>,
    pub remaining_entries: usize,
    pub remaining_bytes: u64,
}

/// Pick the entries a sweep should remove.
///
/// Expired and over-age entries go first; then, if the remainder still
/// exceeds `max_total_bytes`, the oldest entries are removed until it fits.
pub(crate) fn plan_eviction_impl(
    entries: Vec<(PathBuf, CacheMeta)>,
    policy: &EvictionPolicy,
    now: DateTime<Utc>,
) -> EvictionPlan {
    let mut plan = EvictionPlan::default();
    let mut keep = Vec::with_capacity(entries.len());

    for (path, meta) in entries {
        let reason = if meta.is_expired_at(now) {
            Some(EvictReason::Expired)
        } else if policy.max_age.is_some_and(|max| age_at(&meta, now) > max) {
            Some(EvictReason::MaxAge)
        } else {
            None
        };

        match reason {
            Some(reason) => plan.victims.push(Victim { path, meta, reason }),
            None => keep.push((path, meta)),
        }
    }

    keep.sort_by(|a, b| a.1.created_at.cmp(&b.1.created_at));
    let mut total: u64 = keep.iter().map(|(_, m)| m.size_bytes).sum();
    let mut keep = keep.into_iter();

    if let Some(max) = policy.max_total_bytes {
        while total > max {
            let Some((path, meta)) = keep.next() else {
                break;
            };
            total -= meta.size_bytes;
            plan.victims.push(Victim {
                path,
                meta,
                reason: EvictReason::Size,
            });
        }
    }

    plan.remaining_entries = keep.count();
    plan.remaining_bytes = total;
    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(key: &str, size: u64, age_secs: i64, now: DateTime<Utc>) -> (PathBuf, CacheMeta) {
        (
            PathBuf::from(format!("{key}.entry")),
            CacheMeta {
                fingerprint: key.to_string(),
                created_at: now - chrono::Duration::seconds(age_secs),
                expires_at: None,
                size_bytes: size,
                digest: String::new(),
                content_type: None,
                source: None,
            },
        )
    }

    #[test]
    fn test_parse_max_age() {
        assert_eq!(
            cacheability(Some("max-age=7200, public"), None),
            Cacheability::Store(Some(Duration::from_secs(7200)))
        );

        let default = Some(Duration::from_secs(86_400));
        for header in ["Max-Age=60", "public, MAX-AGE=60", "max-age = 60", "max-age=\"60\""] {
            assert_eq!(
                cacheability(Some(header), default),
                Cacheability::Store(Some(Duration::from_secs(60))),
                "{header}"
            );
        }
        assert_eq!(
            cacheability(Some("s-maxage=60"), default),
            Cacheability::Store(default)
        );
    }

    #[test]
    fn test_default_ttl() {
        let default = Some(Duration::from_secs(86_400));
        assert_eq!(cacheability(None, default), Cacheability::Store(default));
        assert_eq!(
            cacheability(Some("public"), default),
            Cacheability::Store(default)
        );
    }

    #[test]
    fn test_no_store_wins() {
        assert_eq!(
            cacheability(Some("max-age=60, No-Store"), None),
            Cacheability::NoStore
        );
    }

    #[test]
    fn test_expiry_saturates() {
        let now = Utc::now();
        assert_eq!(expires_at_impl(now, None), None);
        assert_eq!(expires_at_impl(now, Some(Duration::MAX)), None);
        assert_eq!(
            expires_at_impl(now, Some(Duration::from_secs(60))),
            Some(now + chrono::Duration::seconds(60))
        );
    }

    #[test]
    fn test_plan_age_then_size() {
        let now = Utc::now();
        let entries = vec![
            meta("old", 5, 500, now),
            meta("b", 10, 30, now),
            meta("c", 10, 20, now),
            meta("d", 10, 10, now),
        ];
        let policy = EvictionPolicy::default()
            .with_max_age(Some(Duration::from_secs(100)))
            .with_max_total_bytes(Some(15));

        let plan = plan_eviction_impl(entries, &policy, now);
        let removed: Vec<_> = plan
            .victims
            .iter()
            .map(|v| (v.meta.fingerprint.as_str(), v.reason))
            .collect();

        assert_eq!(
            removed,
            vec![
                ("old", EvictReason::MaxAge),
                ("b", EvictReason::Size),
                ("c", EvictReason::Size),
            ]
        );
        assert_eq!(plan.remaining_entries, 1);
        assert_eq!(plan.remaining_bytes, 10);
    }
}
