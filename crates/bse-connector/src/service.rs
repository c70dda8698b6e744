//! Cached passthrough.
//!
//! A request moves through
//! `fingerprint -> cache lookup -> (hit | fetch -> store) -> respond`.
//! Upstream fetches are bounded by a semaphore; storage failures never fail
//! the request.

use std::sync::Arc;

use axum::body::Bytes;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bse_cache::{cacheability, Cacheability, CacheStats, DiskCache, EntryAttrs};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{DisconnectPolicy, ServiceConfig};
use crate::error::{ConnectorError, ConnectorResult};
use crate::fingerprint::{Fingerprint, NormalizedRequest};
use crate::upstream::{Upstream, UpstreamRequest, UpstreamResponse};

/// Response header reporting the cache outcome.
pub const X_CACHE: &str = "x-cache";

/// Response header carrying the request fingerprint.
pub const X_CACHE_KEY: &str = "x-cache-key";

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
        }
    }
}

/// A payload ready to go back to the client.
#[derive(Debug, Clone)]
pub struct Served {
    pub body: Bytes,
    pub content_type: Option<String>,
    pub fingerprint: Fingerprint,
    pub cache_status: CacheStatus,
}

impl IntoResponse for Served {
    fn into_response(self) -> Response {
        let content_type = self
            .content_type
            .as_deref()
            .and_then(|ct| HeaderValue::from_str(ct).ok())
            .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));

        let mut response = (StatusCode::OK, self.body).into_response();
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, content_type);
        headers.insert(X_CACHE, HeaderValue::from_static(self.cache_status.as_str()));
        if let Ok(key) = HeaderValue::from_str(self.fingerprint.as_str()) {
            headers.insert(X_CACHE_KEY, key);
        }
        response
    }
}

struct Inner {
    config: ServiceConfig,
    cache: DiskCache,
    upstream: Arc<dyn Upstream>,
    fetch_slots: Semaphore,
    abort: CancellationToken,
}

/// Cache-backed connector to the upstream. Cheap to clone.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<Inner>,
}

impl Connector {
    /// `abort` ends every in-flight request with
    /// [`ConnectorError::ShutdownTimeout`] once cancelled.
    pub fn new(
        config: ServiceConfig,
        cache: DiskCache,
        upstream: Arc<dyn Upstream>,
        abort: CancellationToken,
    ) -> Self {
        let fetch_slots = Semaphore::new(config.max_concurrent_fetches.max(1));
        Self {
            inner: Arc::new(Inner {
                config,
                cache,
                upstream,
                fetch_slots,
                abort,
            }),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &DiskCache {
        &self.inner.cache
    }

    /// Upstream fetch slots currently free.
    pub fn available_fetch_slots(&self) -> usize {
        self.inner.fetch_slots.available_permits()
    }

    /// Normalize a raw request with the configured ignored parameters.
    pub fn normalize(&self, method: &str, path: &str, query: Option<&str>) -> NormalizedRequest {
        NormalizedRequest::new(method, path, query, self.inner.config.ignored_query_params.as_slice())
    }

    /// Serve `request` from cache or upstream.
    pub async fn handle(&self, request: NormalizedRequest) -> ConnectorResult<Served> {
        tokio::select! {
            biased;
            _ = self.inner.abort.cancelled() => {
                warn!(path = %request.path(), "request aborted by shutdown");
                Err(ConnectorError::ShutdownTimeout)
            }
            result = self.process(request.clone()) => result,
        }
    }

    async fn process(&self, request: NormalizedRequest) -> ConnectorResult<Served> {
        let fingerprint = request.fingerprint();
        debug!(
            fingerprint = %fingerprint,
            method = %request.method(),
            path = %request.path(),
            "fingerprint computed"
        );

        if let Some(entry) = self.inner.cache.get(fingerprint.as_str()).await {
            debug!(fingerprint = %fingerprint, size = entry.metadata.size_bytes, "cache hit");
            return Ok(Served {
                body: Bytes::from(entry.payload),
                content_type: entry.metadata.content_type,
                fingerprint,
                cache_status: CacheStatus::Hit,
            });
        }
        debug!(fingerprint = %fingerprint, "cache miss");

        let response = match self.inner.config.on_disconnect {
            DisconnectPolicy::Cancel => self.fetch_and_store(&request, &fingerprint).await?,
            DisconnectPolicy::Complete => {
                let this = self.clone();
                let key = fingerprint.clone();
                tokio::spawn(async move { this.fetch_and_store(&request, &key).await })
                    .await
                    .map_err(|e| ConnectorError::Internal {
                        message: format!("fetch task failed: {}", e),
                    })??
            }
        };

        debug!(fingerprint = %fingerprint, size = response.body.len(), "responding with fetched payload");
        Ok(Served {
            body: response.body,
            content_type: response.content_type,
            fingerprint,
            cache_status: CacheStatus::Miss,
        })
    }

    async fn fetch_and_store(
        &self,
        request: &NormalizedRequest,
        fingerprint: &Fingerprint,
    ) -> ConnectorResult<UpstreamResponse> {
        let waited = self.inner.config.fetch_queue_timeout;
        let permit = match tokio::time::timeout(waited, self.inner.fetch_slots.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(ConnectorError::Internal {
                    message: "upstream fetch slots closed".to_string(),
                })
            }
            Err(_) => {
                warn!(fingerprint = %fingerprint, waited_ms = waited.as_millis() as u64, "no upstream fetch slot available");
                return Err(ConnectorError::Overloaded { waited });
            }
        };

        let upstream_request = UpstreamRequest {
            path_and_query: request.path_and_query(),
        };
        let result = self.inner.upstream.fetch(&upstream_request).await;
        drop(permit);

        let response = result.map_err(|e| {
            warn!(
                fingerprint = %fingerprint,
                path = %upstream_request.path_and_query,
                error = %e,
                "upstream fetch failed"
            );
            ConnectorError::from(e)
        })?;
        debug!(fingerprint = %fingerprint, size = response.body.len(), "upstream fetch complete");

        self.store(fingerprint, &response).await;
        Ok(response)
    }

    async fn store(&self, fingerprint: &Fingerprint, response: &UpstreamResponse) {
        let ttl = match cacheability(response.cache_control.as_deref(), self.inner.config.default_ttl) {
            Cacheability::NoStore => {
                debug!(fingerprint = %fingerprint, "upstream response marked no-store");
                return;
            }
            Cacheability::Store(ttl) => ttl,
        };

        let mut attrs = EntryAttrs::default()
            .with_source(response.source.as_str())
            .with_ttl(ttl);
        if let Some(content_type) = &response.content_type {
            attrs = attrs.with_content_type(content_type.as_str());
        }

        match self
            .inner
            .cache
            .put_with(fingerprint.as_str(), &response.body, &attrs)
            .await
        {
            Ok(meta) => debug!(
                fingerprint = %fingerprint,
                size = meta.size_bytes,
                expires_at = ?meta.expires_at,
                "cache store complete"
            ),
            Err(e) => warn!(
                fingerprint = %fingerprint,
                error = %e,
                "cache store failed, serving uncached response"
            ),
        }
    }

    /// Drop the cached entry for `request`. Returns whether one existed.
    pub async fn invalidate(&self, request: &NormalizedRequest) -> ConnectorResult<bool> {
        let fingerprint = request.fingerprint();
        let removed = self.inner.cache.evict(fingerprint.as_str()).await?;
        info!(fingerprint = %fingerprint, path = %request.path(), removed, "cache entry invalidated");
        Ok(removed)
    }

    /// Drop every cached entry. Returns how many were removed.
    pub async fn clear(&self) -> ConnectorResult<usize> {
        let removed = self.inner.cache.clear().await?;
        info!(removed, "cache cleared");
        Ok(removed)
    }

    pub async fn stats(&self) -> ConnectorResult<CacheStats> {
        Ok(self.inner.cache.stats().await?)
    }

    /// Fetch each `path?query` through the normal request path.
    ///
    /// Failures are logged and skipped. Returns how many succeeded.
    pub async fn prewarm(&self, paths: &[String]) -> usize {
        let mut warmed = 0;
        for raw in paths {
            let (path, query) = match raw.split_once('?') {
                Some((path, query)) => (path, Some(query)),
                None => (raw.as_str(), None),
            };
            let request = self.normalize("GET", path, query);

            match self.handle(request).await {
                Ok(served) => {
                    warmed += 1;
                    debug!(path = %raw, cache = served.cache_status.as_str(), "prewarmed");
                }
                Err(e) => warn!(path = %raw, error = %e, "prewarm failed"),
            }
        }
        info!(warmed, total = paths.len(), "cache prewarm finished");
        warmed
    }
}
