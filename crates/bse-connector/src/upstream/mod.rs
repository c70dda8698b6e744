//! Upstream data source.

mod http;

pub use http::HttpUpstream;

use async_trait::async_trait;
use axum::body::Bytes;

use crate::error::UpstreamError;

/// A request forwarded upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamRequest {
    /// Canonical `path?query`, appended to the upstream base URL.
    pub path_and_query: String,
}

/// A successful upstream answer.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub body: Bytes,
    pub content_type: Option<String>,
    /// Raw `Cache-Control` header, if any.
    pub cache_control: Option<String>,
    /// Full URL the body came from.
    pub source: String,
}

/// Anything that can answer a passthrough request.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn fetch(&self, request: &UpstreamRequest) -> Result<UpstreamResponse, UpstreamError>;
}
