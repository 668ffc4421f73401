//! kasho-bootstrap — one-shot SQL dump ingester.
//!
//! Parses a plain-SQL dump and seeds the change buffer with synthetic
//! DDL and per-row insert changes positioned before any live change.
//! Exit code 0 on success, 1 on any error (invalid arguments, parse
//! failure, storage failure, partial storage).

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use kasho::buffer::redis::RedisBuffer;
use kasho::error::KashoError;
use kasho_bootstrap::{ingest, parser};

#[derive(Debug, Parser)]
#[command(name = "kasho-bootstrap", about = "Seed the kasho change buffer from a SQL dump")]
struct Args {
    /// Path to the plain-SQL dump file.
    #[arg(long)]
    dump_file: String,

    /// Buffer backing store URL (redis). Required unless --dry-run.
    #[arg(long, required_unless_present = "dry_run")]
    kv_url: Option<String>,

    /// Changes appended per storage batch.
    #[arg(long, default_value_t = 1000)]
    batch_size: usize,

    /// Keep only the first N rows of each table; 0 keeps everything.
    #[arg(long, default_value_t = 0)]
    max_rows_per_table: u64,

    /// Log progress every N stored changes; 0 disables.
    #[arg(long, default_value_t = 1000)]
    progress_interval: u64,

    /// Print the changes as JSON lines instead of storing them.
    #[arg(long)]
    dry_run: bool,

    /// Log at DEBUG instead of INFO.
    #[arg(short, long)]
    verbose: bool,

    /// Logical stream the changes belong to.
    #[arg(long, env = "KASHO_STREAM_ID", default_value = "primary")]
    stream_id: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "bootstrap failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), KashoError> {
    let text = std::fs::read_to_string(&args.dump_file)
        .map_err(|e| KashoError::Config(format!("cannot read {}: {e}", args.dump_file)))?;

    let statements = parser::parse_dump(&text)?;
    let (changes, stats) = ingest::dump_to_changes(statements, args.max_rows_per_table)?;
    info!(
        ddl = stats.ddl_statements,
        rows = stats.rows,
        truncated = stats.truncated_rows,
        changes = changes.len(),
        "dump parsed"
    );

    if args.dry_run {
        return ingest::print_changes(&changes);
    }

    let kv_url = args
        .kv_url
        .as_deref()
        .ok_or_else(|| KashoError::Config("--kv-url is required without --dry-run".into()))?;
    let buffer = Arc::new(
        RedisBuffer::connect(
            kv_url,
            &args.stream_id,
            // Capacity must cover the whole bootstrap range; nothing
            // acks while a bootstrap run is in flight.
            (changes.len() as u64).max(1),
            Duration::from_millis(200),
        )
        .await?,
    );

    ingest::store_changes(&buffer, &changes, args.batch_size, args.progress_interval).await?;
    info!(stored = changes.len(), "bootstrap complete");
    Ok(())
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
