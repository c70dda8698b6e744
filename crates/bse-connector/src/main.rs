use anyhow::Result;
use bse_connector::telemetry::{self, LogFormat};
use bse_connector::{exit_codes, lifecycle, shutdown, ConnectorError, ServiceConfig};
use clap::Parser;

#[derive(Parser)]
#[command(name = "bse-connector-http")]
#[command(about = "Caching HTTP connector for BSE India data", version)]
struct Args {
    /// Bind address (overrides HOST)
    #[arg(long)]
    host: Option<String>,

    /// Listen port (overrides PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Log format
    #[arg(long, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let args = Args::parse();

    if let Err(e) = telemetry::init_tracing(args.log_level.as_deref(), args.log_format) {
        eprintln!("warning: failed to initialize logging: {e}");
    }

    let code = match run(args).await {
        Ok(()) => exit_codes::SUCCESS,
        Err(e) => {
            let code = e
                .downcast_ref::<ConnectorError>()
                .map(ConnectorError::exit_code)
                .unwrap_or(exit_codes::FATAL);
            tracing::error!(error = %e, exit_code = code, "bse-connector stopped");
            eprintln!("fatal: {e:#}");
            code
        }
    };
    std::process::exit(code);
}

async fn run(args: Args) -> Result<()> {
    let mut config = ServiceConfig::from_env()?;
    if let Some(host) = args.host {
        config = config.with_host(host);
    }
    if let Some(port) = args.port {
        config = config.with_port(port);
    }

    lifecycle::run(config, shutdown::wait_for_signal()).await?;
    Ok(())
}
