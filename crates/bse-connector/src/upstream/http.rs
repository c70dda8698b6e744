//! HTTP upstream: status mapping and retry.
//!
//! This is the only place that interprets upstream status codes.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{
    HeaderName, ACCEPT, AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE, RETRY_AFTER, USER_AGENT,
};
use tracing::{debug, warn};

use super::{Upstream, UpstreamRequest, UpstreamResponse};
use crate::config::UpstreamConfig;
use crate::error::{ConnectorError, ConnectorResult, UpstreamError};

/// User agent sent upstream.
const CONNECTOR_USER_AGENT: &str = concat!("bse-connector/", env!("CARGO_PKG_VERSION"));

/// Upper bound on a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Upstream reached over HTTP with `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    base_url: String,
    config: UpstreamConfig,
}

impl HttpUpstream {
    /// Build a client for `config`.
    pub fn new(config: UpstreamConfig) -> ConnectorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(CONNECTOR_USER_AGENT)
            .build()
            .map_err(|e| ConnectorError::Config {
                message: format!("failed to build upstream client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            config,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, request: &UpstreamRequest) -> String {
        format!("{}{}", self.base_url, request.path_and_query)
    }

    async fn fetch_once(&self, url: &str) -> Result<UpstreamResponse, UpstreamError> {
        let mut request = self
            .client
            .get(url)
            .header(USER_AGENT, CONNECTOR_USER_AGENT)
            .header(ACCEPT, "application/json, */*;q=0.8");

        if let Some(token) = &self.config.token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = request.send().await.map_err(|e| self.map_send_error(e))?;
        let status = response.status();

        // Entries are replayed as 200, so other 2xx codes are not success.
        match status.as_u16() {
            200 => {}
            404 => {
                return Err(UpstreamError::NotFound {
                    path: response.url().path().to_string(),
                })
            }
            429 => {
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                return Err(UpstreamError::RateLimited { retry_after });
            }
            other => return Err(UpstreamError::Status { status: other }),
        }

        let header = |name: HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        };
        let content_type = header(CONTENT_TYPE);
        let cache_control = header(CACHE_CONTROL);

        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                UpstreamError::Timeout {
                    timeout: self.config.timeout,
                }
            } else {
                UpstreamError::InvalidResponse {
                    message: format!("failed to read response body: {}", e),
                }
            }
        })?;

        Ok(UpstreamResponse {
            body,
            content_type,
            cache_control,
            source: url.to_string(),
        })
    }

    fn map_send_error(&self, err: reqwest::Error) -> UpstreamError {
        if err.is_timeout() {
            UpstreamError::Timeout {
                timeout: self.config.timeout,
            }
        } else if err.is_connect() || err.is_request() {
            UpstreamError::Unreachable {
                message: err.to_string(),
            }
        } else {
            UpstreamError::InvalidResponse {
                message: err.to_string(),
            }
        }
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn fetch(&self, request: &UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        use rand::Rng;

        let url = self.url_for(request);
        let max_retries = self.config.max_retries;
        let mut retries = 0;

        loop {
            debug!(url = %url, attempt = retries + 1, "fetching upstream");

            match self.fetch_once(&url).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && retries < max_retries => {
                    retries += 1;

                    let backoff = match &e {
                        UpstreamError::RateLimited {
                            retry_after: Some(retry_after),
                        } => {
                            let base_ms = (*retry_after).min(MAX_BACKOFF).as_millis() as u64;
                            let jitter: f64 = rand::thread_rng().gen_range(0.9_f64..=1.1_f64);
                            Duration::from_millis(((base_ms as f64) * jitter).round() as u64)
                                .max(Duration::from_millis(100))
                        }
                        _ => {
                            let base = Duration::from_secs(1 << retries.min(5)).min(MAX_BACKOFF);
                            let jittered_ms =
                                rand::thread_rng().gen_range(0..=base.as_millis() as u64);
                            Duration::from_millis(jittered_ms.max(10))
                        }
                    };

                    warn!(
                        error = %e,
                        retry = retries,
                        max_retries = max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "retrying upstream request"
                    );

                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn upstream_for(server: &MockServer, max_retries: u32) -> HttpUpstream {
        HttpUpstream::new(UpstreamConfig {
            base_url: format!("{}/api/", server.uri()),
            timeout: Duration::from_millis(500),
            max_retries,
            token: Some("secret".to_string()),
        })
        .unwrap()
    }

    fn request(path_and_query: &str) -> UpstreamRequest {
        UpstreamRequest {
            path_and_query: path_and_query.to_string(),
        }
    }

    #[tokio::test]
    async fn test_fetch_success_carries_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/getquote"))
            .and(query_param("scripcode", "500325"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("cache-control", "max-age=60")
                    .set_body_raw(r#"{"ltp":2901.5}"#, "application/json"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let upstream = upstream_for(&server, 0);
        let response = upstream
            .fetch(&request("/getquote?scripcode=500325"))
            .await
            .unwrap();

        assert_eq!(&response.body[..], br#"{"ltp":2901.5}"#);
        assert_eq!(response.content_type.as_deref(), Some("application/json"));
        assert_eq!(response.cache_control.as_deref(), Some("max-age=60"));
        assert!(response.source.ends_with("/api/getquote?scripcode=500325"));
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let server = MockServer::start().await;
        for (route, status) in [("/api/missing", 404), ("/api/broken", 500), ("/api/denied", 403)] {
            Mock::given(path(route))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;
        }
        Mock::given(path("/api/slowdown"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
            .mount(&server)
            .await;

        let upstream = upstream_for(&server, 0);

        assert!(matches!(
            upstream.fetch(&request("/missing")).await,
            Err(UpstreamError::NotFound { .. })
        ));
        assert!(matches!(
            upstream.fetch(&request("/broken")).await,
            Err(UpstreamError::Status { status: 500 })
        ));
        assert!(matches!(
            upstream.fetch(&request("/denied")).await,
            Err(UpstreamError::Status { status: 403 })
        ));
        match upstream.fetch(&request("/slowdown")).await {
            Err(UpstreamError::RateLimited { retry_after }) => {
                assert_eq!(retry_after, Some(Duration::from_secs(3)))
            }
            other => panic!("expected rate limit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_partial_and_empty_success_are_rejected() {
        let server = MockServer::start().await;
        Mock::given(path("/api/empty"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(path("/api/partial"))
            .respond_with(ResponseTemplate::new(206).set_body_string("par"))
            .mount(&server)
            .await;

        let upstream = upstream_for(&server, 2);
        assert!(matches!(
            upstream.fetch(&request("/empty")).await,
            Err(UpstreamError::Status { status: 204 })
        ));
        assert!(matches!(
            upstream.fetch(&request("/partial")).await,
            Err(UpstreamError::Status { status: 206 })
        ));
    }

    #[tokio::test]
    async fn test_timeout_maps_to_timeout() {
        let server = MockServer::start().await;
        Mock::given(path("/api/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let upstream = upstream_for(&server, 0);
        let err = upstream.fetch(&request("/slow")).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Timeout { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn test_unreachable() {
        let upstream = HttpUpstream::new(UpstreamConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            timeout: Duration::from_secs(2),
            max_retries: 0,
            token: None,
        })
        .unwrap();

        let err = upstream.fetch(&request("/x")).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Unreachable { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn test_no_retry_by_default() {
        let server = MockServer::start().await;
        Mock::given(path("/api/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let upstream = upstream_for(&server, 0);
        assert!(upstream.fetch(&request("/flaky")).await.is_err());
    }

    #[tokio::test]
    async fn test_retry_recovers_after_server_error() {
        let server = MockServer::start().await;
        Mock::given(path("/api/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(path("/api/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let upstream = upstream_for(&server, 1);
        let response = upstream.fetch(&request("/flaky")).await.unwrap();
        assert_eq!(&response.body[..], b"ok");
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(path("/api/bad"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let upstream = upstream_for(&server, 3);
        assert!(matches!(
            upstream.fetch(&request("/bad")).await,
            Err(UpstreamError::Status { status: 400 })
        ));
    }
}
