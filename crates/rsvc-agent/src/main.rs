//! rsvc agent CLI entry point

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rsvc_agent::{Cli, ExitCode, OutputFormatter};
use rsvc_core::config::AuthConfig;

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    let formatter = OutputFormatter::new(cli.output, cli.verbose);
    let command = cli.command_name();

    let config = match AuthConfig::load_or_default(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "{}",
                formatter.format_error(&anyhow::Error::from(e), ExitCode::InvalidInput, command)
            );
            return ExitCode::InvalidInput.to_exit_code();
        }
    };

    let level = cli.log_level.clone().unwrap_or_else(|| config.logging.level.clone());
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.execute_with_config(config).await {
        Ok(code) => code.to_exit_code(),
        Err(e) => {
            eprintln!("{}", formatter.format_error(&e, ExitCode::GeneralError, command));
            ExitCode::GeneralError.to_exit_code()
        }
    }
}
