use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::BufReader;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bulwark::config::{BulwarkConfig, LogFormat, LoggingConfig};
use bulwark::ratelimit::{RateLimiter, Snapshot, Sweeper};
use bulwark::service::Console;

/// Abuse-protection rate limiter with a JSON-lines admin console on stdin/stdout.
#[derive(Parser, Debug)]
#[command(name = "bulwark", version)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// YAML policy table, overriding the configured one
    #[arg(long)]
    policies: Option<String>,

    /// Snapshot file restored at startup and written at shutdown
    #[arg(long)]
    snapshot: Option<String>,

    /// Log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = BulwarkConfig::load(cli.config.as_deref())?;
    if cli.policies.is_some() {
        config.rate_limiting.policies_path = cli.policies;
    }
    if cli.snapshot.is_some() {
        config.rate_limiting.snapshot_path = cli.snapshot;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    init_tracing(&config.logging);

    // Stdin is read on a blocking thread; don't wait on it at exit.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(run(config));
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run(config: BulwarkConfig) -> anyhow::Result<()> {
    info!("Starting Bulwark");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let policies = config.load_policies()?;
    info!(policies = policies.len(), "Policies loaded");

    let rate_limiter = Arc::new(RateLimiter::new(policies));

    let snapshot_path = config.rate_limiting.snapshot_path.clone();
    if let Some(path) = snapshot_path.as_deref().filter(|p| Path::new(p).exists()) {
        let snapshot = Snapshot::read_from_file(path)?;
        let imported = rate_limiter.import_records(snapshot)?;
        info!(path = %path, records = imported, "Restored rate limit state");
    }

    let sweeper = Sweeper::start(rate_limiter.clone(), config.sweep_interval());
    let reloader = spawn_policy_reload(
        rate_limiter.clone(),
        config.rate_limiting.policies_path.clone(),
    );

    let console = Console::new(rate_limiter.clone());
    let served = console
        .serve_with_shutdown(
            BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
            shutdown_signal(),
        )
        .await;
    if let Err(e) = &served {
        error!(error = %e, "Console stopped with an error");
    }

    // State is saved even when the console failed.
    sweeper.shutdown().await;
    if let Some(reloader) = reloader {
        reloader.abort();
    }

    if let Some(path) = snapshot_path {
        rate_limiter.export_records().write_to_file(&path)?;
        info!(path = %path, "Saved rate limit state");
    }

    info!("Bulwark stopped");
    served.map_err(Into::into)
}

/// Logs go to stderr; stdout carries console replies.
fn init_tracing(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init(),
    }
}

/// Re-read the policy file whenever SIGHUP arrives.
#[cfg(unix)]
fn spawn_policy_reload(
    rate_limiter: Arc<RateLimiter>,
    policies_path: Option<String>,
) -> Option<JoinHandle<()>> {
    use bulwark::ratelimit::PolicyRegistry;
    use tracing::warn;

    let path = policies_path?;
    let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGHUP handler, policy reload disabled");
            return None;
        }
    };

    Some(tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            match PolicyRegistry::from_file(&path) {
                Ok(policies) => rate_limiter.set_policies(policies),
                Err(e) => error!(error = %e, path = %path, "Policy reload failed, keeping current table"),
            }
        }
    }))
}

#[cfg(not(unix))]
fn spawn_policy_reload(
    _rate_limiter: Arc<RateLimiter>,
    _policies_path: Option<String>,
) -> Option<JoinHandle<()>> {
    None
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
