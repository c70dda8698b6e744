//! Startup and shutdown sequencing.
//!
//! Everything that can fail because of configuration happens in [`prepare`],
//! before a port is bound.

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use bse_cache::{spawn_sweeper, DiskCache};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ServiceConfig;
use crate::error::{ConnectorError, ConnectorResult};
use crate::server::{self, AppState, ShutdownOutcome};
use crate::service::Connector;
use crate::shutdown::ShutdownCoordinator;
use crate::upstream::{HttpUpstream, Upstream};

/// A validated service ready to be bound.
pub struct Prepared {
    pub config: ServiceConfig,
    pub cache: DiskCache,
    pub connector: Connector,
    pub coordinator: ShutdownCoordinator,
}

/// Validate `config`, open the cache and build the HTTP upstream.
pub fn prepare(config: ServiceConfig) -> ConnectorResult<Prepared> {
    let upstream = HttpUpstream::new(config.upstream.clone())?;
    prepare_with_upstream(config, Arc::new(upstream))
}

/// [`prepare`] with a caller-supplied upstream.
pub fn prepare_with_upstream(
    config: ServiceConfig,
    upstream: Arc<dyn Upstream>,
) -> ConnectorResult<Prepared> {
    config.validate()?;

    let cache = DiskCache::open(&config.cache_dir).map_err(|e| ConnectorError::Config {
        message: format!("cache directory {} is unusable: {}", config.cache_dir.display(), e),
    })?;

    let coordinator = ShutdownCoordinator::new();
    let connector = Connector::new(
        config.clone(),
        cache.clone(),
        upstream,
        coordinator.abort_token(),
    );

    Ok(Prepared {
        config,
        cache,
        connector,
        coordinator,
    })
}

impl Prepared {
    pub fn app(&self) -> Router {
        server::create_app(AppState {
            connector: self.connector.clone(),
            coordinator: self.coordinator.clone(),
        })
    }

    /// Serve on `listener` until `signal` resolves, then shut down gracefully.
    pub async fn serve<F>(self, listener: TcpListener, signal: F) -> ConnectorResult<ShutdownOutcome>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.app();

        let sweeper_cancel = CancellationToken::new();
        let sweeper = spawn_sweeper(
            self.cache.clone(),
            self.config.eviction.clone(),
            self.config.sweep_interval,
            sweeper_cancel.clone(),
        );

        if !self.config.prewarm_paths.is_empty() {
            let connector = self.connector.clone();
            let paths = self.config.prewarm_paths.clone();
            tokio::spawn(async move {
                connector.prewarm(&paths).await;
            });
        }

        let watcher = {
            let coordinator = self.coordinator.clone();
            tokio::spawn(async move {
                signal.await;
                coordinator.begin_drain();
            })
        };

        let outcome = server::serve(
            listener,
            app,
            self.coordinator.clone(),
            self.config.shutdown_grace_period,
        )
        .await;

        watcher.abort();
        sweeper_cancel.cancel();
        let _ = sweeper.await;
        debug!("background tasks stopped");

        match &outcome {
            Ok(ShutdownOutcome::Drained { elapsed }) => {
                info!(elapsed_ms = elapsed.as_millis() as u64, "shutdown complete")
            }
            Ok(ShutdownOutcome::Aborted { in_flight }) => {
                info!(aborted = in_flight, "shutdown complete after grace period")
            }
            Err(_) => {}
        }
        outcome
    }
}

/// Prepare, bind and serve until `signal` resolves.
pub async fn run<F>(config: ServiceConfig, signal: F) -> ConnectorResult<ShutdownOutcome>
where
    F: Future<Output = ()> + Send + 'static,
{
    let prepared = prepare(config)?;

    let addr = format!("{}:{}", prepared.config.host, prepared.config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| ConnectorError::Config {
            message: format!("failed to bind {}: {}", addr, e),
        })?;

    info!(
        addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or(addr),
        cache_dir = %prepared.config.cache_dir.display(),
        upstream = %prepared.config.upstream.base_url,
        max_concurrent_fetches = prepared.config.max_concurrent_fetches,
        on_disconnect = ?prepared.config.on_disconnect,
        "bse-connector listening"
    );

    prepared.serve(listener, signal).await
}
