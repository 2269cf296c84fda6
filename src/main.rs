use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use gitmirror::{perform_sync, CancellationToken, Config, EnvInputs, SyncError};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable names the CLI binds to the core's abstract
/// environment collaborator contract (spec.md §6).
const TOKEN_ENV: &str = "GITMIRROR_TOKEN";
const TOKEN_FILE_ENV: &str = "GITMIRROR_TOKEN_FILE";
const TIMEOUT_ENV: &str = "GITMIRROR_GIT_TIMEOUT_SECS";

#[derive(Parser)]
#[command(name = "gitmirror")]
#[command(about = "Unattended backup agent that mirrors Git repositories as bare clones")]
#[command(version)]
struct Cli {
    /// Configuration file path (defaults to the XDG config location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory under which mirrors are created
    #[arg(short, long)]
    destination: PathBuf,

    /// Log what would be done without running any git or network I/O
    #[arg(long)]
    dry_run: bool,

    /// Override the configured worker count
    #[arg(short, long)]
    workers: Option<usize>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    info!("gitmirror v{} starting", env!("CARGO_PKG_VERSION"));

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    let env = EnvInputs {
        forge_token_file: std::env::var_os(TOKEN_FILE_ENV).map(PathBuf::from),
        forge_token_env: std::env::var(TOKEN_ENV).ok(),
        git_operation_timeout: std::env::var(TIMEOUT_ENV)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs),
        worker_count: cli.workers,
    };

    let cancellation = CancellationToken::new();
    let ctrl_c_token = cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("received interrupt, cancelling in-flight tasks");
            ctrl_c_token.cancel();
        }
    });

    match perform_sync(&config, &cli.destination, cli.dry_run, &env, &cancellation).await {
        Ok(report) => {
            info!(
                "synchronization complete: {} succeeded, {} failed",
                report.succeeded, report.failed
            );
            ExitCode::SUCCESS
        }
        Err(SyncError::PartialFailure(report)) => {
            warn!(
                "synchronization complete: {} succeeded, {} failed",
                report.succeeded, report.failed
            );
            for failure in &report.failures {
                warn!(
                    repo = %failure.name,
                    remote = %failure.remote_url,
                    category = ?failure.final_error_category,
                    attempts = failure.attempts,
                    message = failure.final_error_message.as_deref().unwrap_or(""),
                    "task failed"
                );
            }
            ExitCode::from(2)
        }
        Err(SyncError::Cancelled) => {
            warn!("synchronization cancelled");
            ExitCode::from(130)
        }
        Err(e) => {
            error!("{e}");
            ExitCode::from(1)
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<Config> {
    let resolved = match path {
        Some(path) => path.to_path_buf(),
        None => Config::default_config_path()?,
    };
    let mut config = Config::load(&resolved)?;
    config.expand_paths()?;
    Ok(config)
}
