use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use babycare_predict::cli::{self, Cli, Command};
use babycare_predict::config;
use babycare_predict::logging::{self, LoggingConfig};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logging settings come from the config file; a broken file is reported
    // by the command itself, so fall back to defaults here.
    let logging_config = if matches!(cli.command, Command::Config(_)) {
        None
    } else {
        let path = config::resolve_config_path(cli.config.as_deref());
        Some(
            config::load_config_unvalidated(&path, |var| std::env::var(var).ok())
                .map(|cfg| cfg.logging)
                .unwrap_or_else(|_| LoggingConfig::default()),
        )
    };
    if let Some(logging_config) = logging_config {
        if let Err(e) = logging::init_logging(&logging_config) {
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    }

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling in-flight work");
            signal_token.cancel();
        }
    });

    if let Err(e) = cli::run(cli, cancel).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
