//! Graceful shutdown.
//!
//! Two phases, each driven by a [`CancellationToken`]:
//!
//! 1. **drain**: stop accepting connections and reject new requests with 503;
//!    requests already running continue.
//! 2. **abort**: the grace period has expired; running requests end with
//!    `503 shutdown timeout`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Path answered even while draining.
pub const HEALTH_PATH: &str = "/health";

/// Shutdown coordinator shared by the server, the middleware and the handlers.
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    drain: CancellationToken,
    abort: CancellationToken,
    in_flight: Arc<AtomicUsize>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled when draining starts.
    pub fn drain_token(&self) -> CancellationToken {
        self.drain.clone()
    }

    /// Token cancelled when the grace period runs out.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    pub fn is_draining(&self) -> bool {
        self.drain.is_cancelled()
    }

    /// Stop admitting new requests.
    pub fn begin_drain(&self) {
        if !self.drain.is_cancelled() {
            info!(in_flight = self.in_flight(), "draining - new requests will be rejected");
        }
        self.drain.cancel();
    }

    /// End every running request.
    pub fn abort(&self) {
        if !self.abort.is_cancelled() {
            warn!(in_flight = self.in_flight(), "shutdown grace period expired - aborting requests");
        }
        self.drain.cancel();
        self.abort.cancel();
    }

    /// Requests currently inside the router.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn track(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            counter: Arc::clone(&self.in_flight),
        }
    }
}

/// Decrements the in-flight count on drop, including when the request
/// future is cancelled.
struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Reject new requests while draining; count the ones admitted.
pub async fn shutdown_guard_middleware(
    State(coordinator): State<ShutdownCoordinator>,
    request: Request,
    next: Next,
) -> Response {
    if coordinator.is_draining() && request.uri().path() != HEALTH_PATH {
        warn!(
            path = %request.uri().path(),
            "request rejected - server is shutting down"
        );
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "server is shutting down" })),
        )
            .into_response();
    }

    let _guard = coordinator.track();
    next.run(request).await
}

/// Resolve on SIGINT or SIGTERM.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phases() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.is_draining());

        coordinator.begin_drain();
        assert!(coordinator.is_draining());
        assert!(!coordinator.abort_token().is_cancelled());

        coordinator.abort();
        assert!(coordinator.abort_token().is_cancelled());
    }

    #[test]
    fn test_abort_implies_drain() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.abort();
        assert!(coordinator.is_draining());
    }

    #[test]
    fn test_guard_tracks_in_flight() {
        let coordinator = ShutdownCoordinator::new();
        let a = coordinator.track();
        let b = coordinator.track();
        assert_eq!(coordinator.in_flight(), 2);
        drop(a);
        assert_eq!(coordinator.in_flight(), 1);
        drop(b);
        assert_eq!(coordinator.in_flight(), 0);
    }
}
