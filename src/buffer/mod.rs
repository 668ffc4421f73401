//! The durable change buffer.
//!
//! An ordered, position-keyed store decoupling capture from apply. The
//! capture client appends; any number of consumers subscribe from a
//! position of their choosing and tail independently — fan-out is each
//! subscriber owning its own cursor, not a shared queue.
//!
//! Two stores implement the [`ChangeStore`] contract:
//! - [`log::ChangeLog`] — in-process append-only log with a sort-key
//!   index. Reference semantics; used by tests and as the tail cache.
//! - [`redis::RedisBuffer`] — the durable store behind `REDIS_URL`.
//!
//! [`server::ChangeStreamServer`] exposes `subscribe` over the network
//! for the apply side; see that module for the framing.

pub mod log;
pub mod redis;
pub mod server;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::change::{Change, Position};
use crate::error::KashoError;

/// Where a subscription begins.
///
/// The wire encoding is the `last_position` string of a stream request:
/// empty means oldest retained, `"bootstrap"` means the start of the
/// synthetic bootstrap range, anything else resumes strictly after that
/// position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartFrom {
    Oldest,
    Bootstrap,
    After(Position),
}

impl StartFrom {
    pub fn from_request(last_position: &str) -> Self {
        match last_position {
            "" => StartFrom::Oldest,
            "bootstrap" => StartFrom::Bootstrap,
            other => StartFrom::After(Position::new(other)),
        }
    }

    /// Initial cursor (exclusive sort key) for this start.
    ///
    /// Bootstrap positions sort before any live position, so both
    /// `Oldest` and `Bootstrap` begin at the front of the retained
    /// window.
    fn initial_cursor(&self) -> Option<String> {
        match self {
            StartFrom::Oldest | StartFrom::Bootstrap => None,
            StartFrom::After(pos) => Some(pos.sort_key()),
        }
    }
}

/// Storage contract shared by the in-memory log and the redis store.
#[async_trait]
pub trait ChangeStore: Send + Sync + 'static {
    /// Write a change under its position. Idempotent for identical
    /// payloads; a differing payload at an existing position is a fatal
    /// [`KashoError::Conflict`]. Blocks while the buffer is at capacity.
    async fn append(&self, change: &Change) -> Result<(), KashoError>;

    /// Changes strictly after the `after` sort key (or from the oldest
    /// retained when `None`), ascending, at most `limit`.
    async fn read_after(&self, after: Option<&str>, limit: usize)
    -> Result<Vec<Change>, KashoError>;

    /// Record that `consumer` has applied everything up to `position`.
    async fn ack(&self, consumer: &str, position: &Position) -> Result<(), KashoError>;

    /// The lowest acked position across consumers, if any consumer has
    /// registered. Retention never trims past this.
    async fn min_acked(&self) -> Result<Option<Position>, KashoError>;

    /// Drop changes strictly below `position`, clamped to [`Self::min_acked`].
    /// Returns the number of changes removed.
    async fn trim_before(&self, position: &Position) -> Result<u64, KashoError>;

    /// Number of retained changes.
    async fn retained(&self) -> Result<u64, KashoError>;
}

/// A pull-based cursor over a store.
///
/// Restartable: dropping the subscription loses nothing, a new one with
/// the same [`StartFrom`] re-reads the retained window. `next_batch`
/// verifies ascending order and surfaces regressions as protocol errors.
pub struct Subscription<S: ChangeStore + ?Sized> {
    store: Arc<S>,
    cursor: Option<String>,
    poll_interval: Duration,
}

impl<S: ChangeStore + ?Sized> Subscription<S> {
    pub fn new(store: Arc<S>, start: StartFrom, poll_interval: Duration) -> Self {
        Subscription {
            cursor: start.initial_cursor(),
            store,
            poll_interval,
        }
    }

    /// Non-blocking read of the next batch; empty when caught up.
    pub async fn poll_batch(&mut self, max: usize) -> Result<Vec<Change>, KashoError> {
        let batch = self.store.read_after(self.cursor.as_deref(), max).await?;
        if let Some(last) = batch.last() {
            let mut prev = self.cursor.clone();
            for change in &batch {
                let key = change.position.sort_key();
                if prev.as_deref().is_some_and(|p| p >= key.as_str()) {
                    return Err(KashoError::Protocol(format!(
                        "buffer yielded non-ascending position {}",
                        change.position
                    )));
                }
                prev = Some(key);
            }
            self.cursor = Some(last.position.sort_key());
        }
        Ok(batch)
    }

    /// Read the next batch, waiting (tail read) until at least one
    /// change is available.
    pub async fn next_batch(&mut self, max: usize) -> Result<Vec<Change>, KashoError> {
        loop {
            let batch = self.poll_batch(max).await?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
