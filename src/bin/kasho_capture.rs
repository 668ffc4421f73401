//! kasho-capture — source-side service.
//!
//! Runs the capture client for the configured source, the change stream
//! listener for downstream subscribers, and the buffer retention
//! trimmer. Exits non-zero on fatal errors so a supervisor restarts it.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use kasho::buffer::redis::RedisBuffer;
use kasho::buffer::server::ChangeStreamServer;
use kasho::buffer::ChangeStore;
use kasho::config::Settings;
use kasho::error::KashoError;
use kasho::{capture, license};

/// Grace period between the shutdown signal and forced termination.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "kasho-capture", about = "kasho change capture service")]
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
            error!(error = %err, "kasho-capture terminated");
            ExitCode::FAILURE
        }
    }
}

async fn run(_args: Args) -> Result<(), KashoError> {
    let settings = Settings::from_env()?;

    if let Some(addr) = settings.licensing_addr.clone() {
        license::validate(&addr, "kasho-capture").await?;
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

    let mut capture_task = tokio::spawn(capture::run(
        settings.clone(),
        Arc::clone(&buffer),
        shutdown_rx.clone(),
    ));

    let mut server_task = {
        let buffer = Arc::clone(&buffer);
        let addr = settings.change_stream_addr.clone();
        let poll = Duration::from_millis(settings.poll_interval_ms);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            ChangeStreamServer::new(buffer, poll).serve(&addr, shutdown).await
        })
    };

    let mut trim_task = {
        let buffer = Arc::clone(&buffer);
        let retain_max = settings.buffer_retain_max;
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { retention_loop(buffer, retain_max, shutdown).await })
    };

    let outcome: Result<(), KashoError> = tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received, draining");
            Ok(())
        }
        result = &mut capture_task => flatten(result),
        result = &mut server_task => flatten(result),
        result = &mut trim_task => flatten(result),
    };

    shutdown_tx.send(true).ok();
    let drain = async {
        capture_task.await.ok();
        server_task.await.ok();
        trim_task.await.ok();
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        error!("drain exceeded grace period, terminating");
    }
    outcome
}

/// Periodically trim the buffer down to the retention window. Trimming
/// is clamped to the minimum consumer-acked position by the store.
async fn retention_loop(
    buffer: Arc<RedisBuffer>,
    retain_max: u64,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), KashoError> {
    if retain_max == 0 {
        // Unlimited retention; nothing to do but wait for shutdown.
        loop {
            shutdown.changed().await.ok();
            if *shutdown.borrow() {
                return Ok(());
            }
        }
    }

    let mut ticker = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            _ = ticker.tick() => {
                let retained = buffer.retained().await?;
                if retained <= retain_max {
                    continue;
                }
                if let Some(acked) = buffer.min_acked().await? {
                    let removed = buffer.trim_before(&acked).await?;
                    if removed > 0 {
                        info!(removed, retained, "trimmed buffer to retention window");
                    }
                }
            }
        }
    }
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
