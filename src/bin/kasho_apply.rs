//! kasho-apply — replica-side service.
//!
//! Loads the transform config, subscribes to the change stream from the
//! replica's own recorded position, and applies transformed changes.
//! Exits non-zero on fatal errors (including schema-mismatch apply
//! failures that need an operator).

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use kasho::apply::ApplyLoop;
use kasho::buffer::redis::RedisBuffer;
use kasho::config::{Settings, TransformConfig};
use kasho::error::KashoError;
use kasho::license;
use kasho::transform::TransformEngine;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "kasho-apply", about = "kasho replica apply service")]
struct Args {
    /// Log at DEBUG instead of INFO.
    #[arg(short, long, env = "KASHO_VERBOSE")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "kasho-apply terminated");
            ExitCode::FAILURE
        }
    }
}

async fn run(_args: Args) -> Result<(), KashoError> {
    let settings = Settings::from_env()?;

    if let Some(addr) = settings.licensing_addr.clone() {
        license::validate(&addr, "kasho-apply").await?;
    }

    let config = TransformConfig::load(&settings.transforms_path)?;
    for (table, columns) in &config.tables {
        for (column, transform) in columns {
            info!(
                table = %table,
                column = %column,
                generator = transform.kind.name(),
                deterministic = transform.deterministic,
                "transform configured"
            );
        }
    }

    let buffer = Arc::new(
        RedisBuffer::connect(
            &settings.redis_url,
            &settings.stream_id,
            settings.buffer_max_changes,
            Duration::from_millis(settings.poll_interval_ms),
        )
        .await?,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let apply = ApplyLoop::new(settings, TransformEngine::new(config), buffer)?;
    let mut apply_task = tokio::spawn(async move { apply.run(shutdown_rx).await });

    let outcome: Result<(), KashoError> = tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received, draining");
            Ok(())
        }
        result = &mut apply_task => flatten(result),
    };

    shutdown_tx.send(true).ok();
    if tokio::time::timeout(SHUTDOWN_GRACE, async { apply_task.await.ok() })
        .await
        .is_err()
    {
        error!("drain exceeded grace period, terminating");
    }
    outcome
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

fn flatten(result: Result<Result<(), KashoError>, tokio::task::JoinError>) -> Result<(), KashoError> {
    match result {
        Ok(inner) => inner,
        Err(join) => Err(KashoError::Internal(format!("task panicked: {join}"))),
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
