//! HTTP surface: routes, middleware and the serve loop.

use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{delete, get};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::error::{ConnectorError, ConnectorResult};
use crate::fingerprint::has_parent_segment;
use crate::service::{Connector, Served};
use crate::shutdown::{shutdown_guard_middleware, ShutdownCoordinator, HEALTH_PATH};

/// Server name reported by `/health`.
pub const SERVER_NAME: &str = "bse-connector";

/// Prefix stripped from passthrough paths before forwarding.
const DATA_PREFIX: &str = "/data";

/// Time given to handlers to answer after the abort token fires.
const ABORT_FLUSH: Duration = Duration::from_secs(1);

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub connector: Connector,
    pub coordinator: ShutdownCoordinator,
}

/// How the server stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every in-flight request finished within the grace period.
    Drained { elapsed: Duration },
    /// The grace period expired with requests still running.
    Aborted { in_flight: usize },
}

/// Build the router.
pub fn create_app(state: AppState) -> Router {
    let allow_invalidation = state.connector.config().allow_invalidation;

    let mut data = get(passthrough);
    if allow_invalidation {
        data = data.delete(invalidate);
    }

    let mut router = Router::new()
        .route(HEALTH_PATH, get(health))
        .route("/data/{*path}", data)
        .route("/cache/stats", get(stats));
    if allow_invalidation {
        router = router.route("/cache", delete(clear));
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    router
        .layer(middleware::from_fn_with_state(
            state.coordinator.clone(),
            shutdown_guard_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    if state.coordinator.is_draining() {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "draining",
                "server": SERVER_NAME,
                "in_flight": state.coordinator.in_flight(),
            })),
        )
    } else {
        (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ok", "server": SERVER_NAME })),
        )
    }
}

/// Path forwarded upstream. `..` segments would climb out of the upstream
/// base path once the URL is resolved, so they are refused.
fn upstream_path(uri: &Uri) -> ConnectorResult<&str> {
    let path = uri.path().strip_prefix(DATA_PREFIX).unwrap_or(uri.path());
    if has_parent_segment(path) {
        return Err(ConnectorError::InvalidRequest {
            message: format!("parent path segments are not allowed: {}", uri.path()),
        });
    }
    Ok(path)
}

async fn passthrough(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
) -> Result<Served, ConnectorError> {
    let request = state
        .connector
        .normalize(method.as_str(), upstream_path(&uri)?, uri.query());
    state.connector.handle(request).await
}

async fn invalidate(
    State(state): State<AppState>,
    uri: Uri,
) -> ConnectorResult<Json<serde_json::Value>> {
    let request = state
        .connector
        .normalize("GET", upstream_path(&uri)?, uri.query());
    let removed = state.connector.invalidate(&request).await?;
    Ok(Json(serde_json::json!({
        "fingerprint": request.fingerprint().to_string(),
        "removed": removed,
    })))
}

async fn clear(State(state): State<AppState>) -> ConnectorResult<Json<serde_json::Value>> {
    let removed = state.connector.clear().await?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}

async fn stats(State(state): State<AppState>) -> ConnectorResult<Json<serde_json::Value>> {
    let stats = state.connector.stats().await?;
    let mut body = serde_json::to_value(stats).map_err(|e| ConnectorError::Internal {
        message: e.to_string(),
    })?;
    if let Some(object) = body.as_object_mut() {
        object.insert(
            "available_fetch_slots".to_string(),
            state.connector.available_fetch_slots().into(),
        );
        object.insert("in_flight".to_string(), state.coordinator.in_flight().into());
    }
    Ok(Json(body))
}

/// Serve `app` on `listener` until the coordinator drains, then wait up to
/// `grace` for in-flight requests before aborting them.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    coordinator: ShutdownCoordinator,
    grace: Duration,
) -> ConnectorResult<ShutdownOutcome> {
    let drain = coordinator.drain_token();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { drain.cancelled().await })
            .await
    });

    let drain = coordinator.drain_token();
    tokio::select! {
        result = &mut server => {
            flatten(result)?;
            return Err(ConnectorError::Internal {
                message: "server stopped before shutdown was requested".to_string(),
            });
        }
        _ = drain.cancelled() => {}
    }

    let started = Instant::now();
    info!(
        in_flight = coordinator.in_flight(),
        grace_ms = grace.as_millis() as u64,
        "waiting for in-flight requests"
    );

    match tokio::time::timeout(grace, &mut server).await {
        Ok(result) => {
            flatten(result)?;
            let elapsed = started.elapsed();
            info!(elapsed_ms = elapsed.as_millis() as u64, "server drained");
            Ok(ShutdownOutcome::Drained { elapsed })
        }
        Err(_) => {
            let in_flight = coordinator.in_flight();
            coordinator.abort();

            if tokio::time::timeout(ABORT_FLUSH, &mut server).await.is_err() {
                warn!("server did not stop after abort, cancelling task");
                server.abort();
            }
            Ok(ShutdownOutcome::Aborted { in_flight })
        }
    }
}

fn flatten(
    result: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> ConnectorResult<()> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(error = %e, "server error");
            Err(e.into())
        }
        Err(e) => Err(ConnectorError::Internal {
            message: format!("server task failed: {}", e),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_path_strips_prefix() {
        let uri: Uri = "/data/api/getquote?x=1".parse().unwrap();
        assert_eq!(upstream_path(&uri).unwrap(), "/api/getquote");
    }

    #[test]
    fn test_upstream_path_rejects_parent_segments() {
        for raw in ["/data/../../secret", "/data/quote/%2e%2e/x", "/data/.."] {
            let uri: Uri = raw.parse().unwrap();
            let err = upstream_path(&uri).unwrap_err();
            assert!(matches!(err, ConnectorError::InvalidRequest { .. }), "{raw}: {err:?}");
        }
        let uri: Uri = "/data/./quote".parse().unwrap();
        assert_eq!(upstream_path(&uri).unwrap(), "/./quote");
    }
}
