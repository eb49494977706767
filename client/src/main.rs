mod cli;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "fleet=info,fleet_orchestrator=info,fleet_common=info";

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // RUST_LOG pisa el filtro por defecto
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let all_ok = cli::run_cli(cli::Cli::parse()).await?;
    Ok(if all_ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
