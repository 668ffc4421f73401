//! Change capture from the source database.
//!
//! One capture task per source. The task consumes the source's native
//! CDC stream (logical decoding for PostgreSQL, the binlog for MySQL),
//! normalizes events into [`Change`](crate::change::Change) records and
//! appends them to the buffer. The source is acknowledged only after the
//! buffer append returns, so a crash between the two replays rather than
//! loses changes.
//!
//! Connection drops retry with exponential backoff capped at 30 s.
//! Source-side errors classified as fatal (authentication, incompatible
//! server configuration) terminate the service.

pub mod mysql;
pub mod postgres;

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::buffer::redis::RedisBuffer;
use crate::config::Settings;
use crate::dialect::Dialect;
use crate::error::{KashoError, RetryPolicy, RetryState};

/// Run capture until shutdown. Retryable failures reconnect forever;
/// fatal failures propagate so the service exits non-zero.
pub async fn run(
    settings: Settings,
    buffer: Arc<RedisBuffer>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), KashoError> {
    let dialect = Dialect::from_url(&settings.primary_database_url)?;
    info!(source = dialect.name(), driver = dialect.driver_name(), "starting capture");

    let policy = RetryPolicy::default();
    let mut retry = RetryState::new();

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        let started = std::time::Instant::now();
        let attempt = match dialect {
            Dialect::Postgres => {
                postgres::PostgresCapture::run(&settings, &buffer, shutdown.clone()).await
            }
            Dialect::MySql => mysql::MySqlCapture::run(&settings, &buffer, shutdown.clone()).await,
        };

        // A connection that survived for a while was healthy; start the
        // next backoff ladder from the bottom.
        if started.elapsed().as_secs() >= 60 {
            retry.reset();
        }

        match attempt {
            Ok(()) => return Ok(()),
            Err(err) if err.is_fatal() => {
                error!(error = %err, "fatal capture error");
                return Err(err);
            }
            Err(err) => {
                let delay = retry.record_failure(&policy);
                warn!(
                    error = %err,
                    attempt = retry.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "capture interrupted, reconnecting"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}
