//! Redis-backed durable change store.
//!
//! Layout, all keys namespaced by stream id:
//! - `kasho:{stream}:payloads` — hash, position sort key → JSON change
//! - `kasho:{stream}:index`    — zset at score 0, ordered by the sort
//!   key's bytes, read with `ZRANGEBYLEX`
//! - `kasho:{stream}:acks`     — hash, consumer name → acked position
//!
//! The sort key (rank-prefixed position, see
//! [`crate::change::Position::sort_key`]) makes the zset's lexicographic
//! order equal the stream order, bootstrap range first.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;

use super::ChangeStore;
use crate::change::{Change, Position};
use crate::error::KashoError;

pub struct RedisBuffer {
    conn: MultiplexedConnection,
    payloads_key: String,
    index_key: String,
    acks_key: String,
    /// Maximum retained changes before `append` blocks.
    capacity: u64,
    /// Pause between capacity re-checks while an append is blocked.
    poll_interval: Duration,
}

impl RedisBuffer {
    pub async fn connect(
        url: &str,
        stream_id: &str,
        capacity: u64,
        poll_interval: Duration,
    ) -> Result<Self, KashoError> {
        let client = redis::Client::open(url)
            .map_err(|e| KashoError::Config(format!("invalid redis url: {e}")))?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(RedisBuffer {
            conn,
            payloads_key: format!("kasho:{stream_id}:payloads"),
            index_key: format!("kasho:{stream_id}:index"),
            acks_key: format!("kasho:{stream_id}:acks"),
            capacity: capacity.max(1),
            poll_interval,
        })
    }

    /// Last position durably recorded for the capture side itself, used
    /// to resume the source stream after a restart.
    pub async fn capture_position(&self, stream_id: &str) -> Result<Option<Position>, KashoError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(format!("kasho:{stream_id}:capture_pos")).await?;
        Ok(raw.map(Position::new))
    }

    /// Record the capture-side safe position. Heartbeats advance this
    /// without any change being appended.
    pub async fn record_capture_position(
        &self,
        stream_id: &str,
        position: &Position,
    ) -> Result<(), KashoError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(format!("kasho:{stream_id}:capture_pos"), position.as_str())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ChangeStore for RedisBuffer {
    async fn append(&self, change: &Change) -> Result<(), KashoError> {
        let mut conn = self.conn.clone();
        let key = change.position.sort_key();
        let payload = serde_json::to_string(change)
            .map_err(|e| KashoError::Internal(format!("encode change: {e}")))?;

        let existing: Option<String> = conn.hget(&self.payloads_key, &key).await?;
        match existing {
            Some(current) if current == payload => return Ok(()),
            Some(_) => return Err(KashoError::Conflict(change.position.clone())),
            None => {}
        }

        // Backpressure: hold the append until retention frees space.
        loop {
            let retained: u64 = conn.zcard(&self.index_key).await?;
            if retained < self.capacity {
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset(&self.payloads_key, &key, &payload)
            .ignore()
            .zadd(&self.index_key, &key, 0)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn read_after(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Change>, KashoError> {
        let mut conn = self.conn.clone();
        let min = match after {
            None => "-".to_string(),
            Some(key) => format!("({key}"),
        };
        let keys: Vec<String> = redis::cmd("ZRANGEBYLEX")
            .arg(&self.index_key)
            .arg(min)
            .arg("+")
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let payloads: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(&self.payloads_key)
            .arg(&keys)
            .query_async(&mut conn)
            .await?;
        let mut batch = Vec::with_capacity(keys.len());
        for (key, payload) in keys.iter().zip(payloads) {
            let Some(payload) = payload else {
                // Index entry without a payload: a half-applied trim.
                // Skip; the next trim pass removes the index entry.
                continue;
            };
            let change: Change = serde_json::from_str(&payload)
                .map_err(|e| KashoError::Protocol(format!("decode change at {key}: {e}")))?;
            batch.push(change);
        }
        Ok(batch)
    }

    async fn ack(&self, consumer: &str, position: &Position) -> Result<(), KashoError> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(&self.acks_key, consumer, position.as_str()).await?;
        Ok(())
    }

    async fn min_acked(&self) -> Result<Option<Position>, KashoError> {
        let mut conn = self.conn.clone();
        let acks: std::collections::HashMap<String, String> =
            conn.hgetall(&self.acks_key).await?;
        Ok(acks.into_values().map(Position::new).min())
    }

    async fn trim_before(&self, position: &Position) -> Result<u64, KashoError> {
        let floor = match self.min_acked().await? {
            Some(acked) if acked < *position => acked,
            _ => position.clone(),
        };

        let mut conn = self.conn.clone();
        let doomed: Vec<String> = redis::cmd("ZRANGEBYLEX")
            .arg(&self.index_key)
            .arg("-")
            .arg(format!("({}", floor.sort_key()))
            .query_async(&mut conn)
            .await?;
        if doomed.is_empty() {
            return Ok(0);
        }

        let mut pipe = redis::pipe();
        pipe.atomic()
            .zrem(&self.index_key, &doomed)
            .ignore()
            .hdel(&self.payloads_key, &doomed)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(doomed.len() as u64)
    }

    async fn retained(&self) -> Result<u64, KashoError> {
        let mut conn = self.conn.clone();
        Ok(conn.zcard(&self.index_key).await?)
    }
}
