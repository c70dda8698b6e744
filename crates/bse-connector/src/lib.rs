//! HTTP connector for BSE India market data.
//!
//! Every `GET /data/{path}` is answered from a persistent disk cache when
//! possible and fetched from the upstream API otherwise. Upstream fetches are
//! bounded, storage failures never fail a request, and shutdown drains
//! in-flight requests within a grace period.
//!
//! # Example
//!
//! ```no_run
//! use bse_connector::{lifecycle, shutdown, ServiceConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ServiceConfig::from_env()?;
//! lifecycle::run(config, shutdown::wait_for_signal()).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod exit_codes;
pub mod fingerprint;
pub mod lifecycle;
pub mod server;
pub mod service;
pub mod shutdown;
pub mod telemetry;
pub mod upstream;

pub use config::{DisconnectPolicy, ServiceConfig, UpstreamConfig};
pub use error::{ConnectorError, ConnectorResult, UpstreamError};
pub use fingerprint::{Fingerprint, NormalizedRequest};
pub use server::{create_app, AppState, ShutdownOutcome};
pub use service::{CacheStatus, Connector, Served};
pub use shutdown::ShutdownCoordinator;
pub use upstream::{HttpUpstream, Upstream, UpstreamRequest, UpstreamResponse};
