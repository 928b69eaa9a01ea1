//! Ops-Guard server binary
//!
//! Loads configuration, installs tracing and (optionally) the Prometheus
//! metrics exporter, and serves the guarded admin API.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use ops_guard::{
    cli::{Cli, Command},
    config::Config,
    server::Server,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::ShowConfig) => match serde_json::to_string_pretty(&config) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Failed to serialize configuration: {e}");
                ExitCode::FAILURE
            }
        },
        Some(Command::Serve) | None => run_server(config).await,
    }
}

fn load_config(cli: &Cli) -> ops_guard::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host.clone_from(host);
    }
    Ok(config)
}

async fn run_server(config: Config) -> ExitCode {
    #[cfg(feature = "metrics")]
    if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new().install() {
        error!("Failed to install Prometheus exporter: {e}");
        return ExitCode::FAILURE;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.server.host,
        port = config.server.port,
        "Starting ops-guard"
    );

    let server = Server::new(config);
    if let Err(e) = server.run().await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Ops-guard shutdown complete");
    ExitCode::SUCCESS
}
