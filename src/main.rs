use anyhow::Result;
use clap::Parser;
use tracing::level_filters::LevelFilter;

use ensemble_cli::cli::Cli;
use ensemble_cli::error::{categorize_error, format_cli_error};
use ensemble_cli::runner::run_cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Err(err) = init_tracing(&cli.log_filter) {
        eprintln!("{}", format_cli_error(&err));
        std::process::exit(1);
    }

    if let Err(err) = run_cli(cli).await {
        eprintln!("{}", format_cli_error(&err));
        tracing::error!(category = %categorize_error(&err).code(), error = %err, "command failed");
        std::process::exit(1);
    }

    Ok(())
}

fn init_tracing(log_filter: &str) -> Result<()> {
    let level = log_filter.parse::<LevelFilter>().unwrap_or(LevelFilter::WARN);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_env_filter(log_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
}
