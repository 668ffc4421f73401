//! In-memory append-only change log.
//!
//! The reference implementation of the buffer contract: an append-only
//! arena of changes plus a `BTreeMap` from position sort key to arena
//! offset. Trimming blanks arena slots without shifting offsets, so
//! cursors held by live subscribers stay valid. A `Notify` wakes
//! appenders blocked on capacity.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::ChangeStore;
use crate::change::{Change, Position};
use crate::error::KashoError;

pub struct ChangeLog {
    inner: Mutex<LogInner>,
    /// Signalled on trim so appenders waiting for capacity re-check.
    trimmed: Notify,
    capacity: usize,
}

struct LogInner {
    arena: Vec<Option<Change>>,
    index: BTreeMap<String, usize>,
    acks: HashMap<String, Position>,
}

impl ChangeLog {
    pub fn new(capacity: usize) -> Self {
        ChangeLog {
            inner: Mutex::new(LogInner {
                arena: Vec::new(),
                index: BTreeMap::new(),
                acks: HashMap::new(),
            }),
            trimmed: Notify::new(),
            capacity,
        }
    }

    /// Unbounded log, for tests and short-lived tooling.
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    fn try_append(&self, change: &Change) -> Result<AppendOutcome, KashoError> {
        let mut inner = self.inner.lock().expect("change log poisoned");
        let key = change.position.sort_key();

        if let Some(&offset) = inner.index.get(&key) {
            return match &inner.arena[offset] {
                Some(existing) if existing == change => Ok(AppendOutcome::Duplicate),
                // A trimmed slot at the same position means a re-append
                // after retention; treat as conflict, the history is gone.
                _ => Err(KashoError::Conflict(change.position.clone())),
            };
        }

        if inner.index.len() >= self.capacity {
            return Ok(AppendOutcome::AtCapacity);
        }

        let offset = inner.arena.len();
        inner.arena.push(Some(change.clone()));
        inner.index.insert(key, offset);
        Ok(AppendOutcome::Written)
    }
}

enum AppendOutcome {
    Written,
    Duplicate,
    AtCapacity,
}

#[async_trait]
impl ChangeStore for ChangeLog {
    async fn append(&self, change: &Change) -> Result<(), KashoError> {
        loop {
            match self.try_append(change)? {
                AppendOutcome::Written | AppendOutcome::Duplicate => return Ok(()),
                // Capacity reached: block until retention frees space.
                // Capture stalls rather than dropping changes.
                AppendOutcome::AtCapacity => self.trimmed.notified().await,
            }
        }
    }

    async fn read_after(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Change>, KashoError> {
        let inner = self.inner.lock().expect("change log poisoned");
        let lower = match after {
            None => Bound::Unbounded,
            Some(key) => Bound::Excluded(key.to_string()),
        };
        let batch = inner
            .index
            .range((lower, Bound::Unbounded))
            .filter_map(|(_, &offset)| inner.arena[offset].clone())
            .take(limit)
            .collect();
        Ok(batch)
    }

    async fn ack(&self, consumer: &str, position: &Position) -> Result<(), KashoError> {
        let mut inner = self.inner.lock().expect("change log poisoned");
        inner.acks.insert(consumer.to_string(), position.clone());
        Ok(())
    }

    async fn min_acked(&self) -> Result<Option<Position>, KashoError> {
        let inner = self.inner.lock().expect("change log poisoned");
        Ok(inner.acks.values().min().cloned())
    }

    async fn trim_before(&self, position: &Position) -> Result<u64, KashoError> {
        let floor = match self.min_acked().await? {
            Some(acked) if acked < *position => acked,
            _ => position.clone(),
        };

        let mut inner = self.inner.lock().expect("change log poisoned");
        let upper = floor.sort_key();
        let doomed: Vec<String> = inner
            .index
            .range::<String, _>((Bound::Unbounded, Bound::Excluded(&upper)))
            .map(|(key, _)| key.clone())
            .collect();
        let mut removed = 0;
        for key in doomed {
            if let Some(offset) = inner.index.remove(&key) {
                inner.arena[offset] = None;
                removed += 1;
            }
        }
        drop(inner);

        if removed > 0 {
            self.trimmed.notify_waiters();
        }
        Ok(removed)
    }

    async fn retained(&self) -> Result<u64, KashoError> {
        let inner = self.inner.lock().expect("change log poisoned");
        Ok(inner.index.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{StartFrom, Subscription};
    use crate::change::{Column, DdlChange, DmlChange, Operation, SqlValue};
    use std::sync::Arc;
    use std::time::Duration;

    fn insert_at(pos: Position, id: i64) -> Change {
        Change::dml(
            pos,
            DmlChange {
                table: "users".into(),
                op: Operation::Insert,
                columns: vec![Column::new("id", SqlValue::Int(id))],
                old_keys: vec![],
            },
        )
    }

    #[tokio::test]
    async fn test_append_and_read_in_order() {
        let log = ChangeLog::unbounded();
        // Appended out of arena order; the index orders reads.
        log.append(&insert_at(Position::from_lsn(20), 2)).await.unwrap();
        log.append(&insert_at(Position::from_lsn(10), 1)).await.unwrap();
        log.append(&insert_at(Position::bootstrap(1), 0)).await.unwrap();

        let batch = log.read_after(None, 10).await.unwrap();
        let positions: Vec<String> =
            batch.iter().map(|c| c.position.as_str().to_string()).collect();
        assert_eq!(
            positions,
            vec![
                "bootstrap-0000000001".to_string(),
                Position::from_lsn(10).to_string(),
                Position::from_lsn(20).to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_idempotent_append() {
        let log = ChangeLog::unbounded();
        let change = insert_at(Position::from_lsn(1), 1);
        log.append(&change).await.unwrap();
        log.append(&change).await.unwrap();
        assert_eq!(log.retained().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_conflicting_append_fails() {
        let log = ChangeLog::unbounded();
        log.append(&insert_at(Position::from_lsn(1), 1)).await.unwrap();
        let err = log.append(&insert_at(Position::from_lsn(1), 2)).await.unwrap_err();
        assert!(matches!(err, KashoError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_read_after_cursor() {
        let log = ChangeLog::unbounded();
        for i in 1..=5 {
            log.append(&insert_at(Position::from_lsn(i), i as i64)).await.unwrap();
        }
        let after = Position::from_lsn(3).sort_key();
        let batch = log.read_after(Some(&after), 10).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].position, Position::from_lsn(4));
    }

    #[tokio::test]
    async fn test_trim_respects_min_ack() {
        let log = ChangeLog::unbounded();
        for i in 1..=5 {
            log.append(&insert_at(Position::from_lsn(i), i as i64)).await.unwrap();
        }
        log.ack("replica-a", &Position::from_lsn(2)).await.unwrap();
        log.ack("replica-b", &Position::from_lsn(4)).await.unwrap();

        // Requested trim below 5, but replica-a is only at 2.
        let removed = log.trim_before(&Position::from_lsn(5)).await.unwrap();
        assert_eq!(removed, 1);
        let batch = log.read_after(None, 10).await.unwrap();
        assert_eq!(batch[0].position, Position::from_lsn(2));
    }

    #[tokio::test]
    async fn test_capacity_blocks_until_trim() {
        let log = Arc::new(ChangeLog::new(2));
        log.append(&insert_at(Position::from_lsn(1), 1)).await.unwrap();
        log.append(&insert_at(Position::from_lsn(2), 2)).await.unwrap();
        log.ack("replica", &Position::from_lsn(2)).await.unwrap();

        let writer = {
            let log = Arc::clone(&log);
            tokio::spawn(async move { log.append(&insert_at(Position::from_lsn(3), 3)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished(), "append should block at capacity");

        log.trim_before(&Position::from_lsn(2)).await.unwrap();
        writer.await.unwrap().unwrap();
        assert_eq!(log.retained().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_subscription_tail_read() {
        let log = Arc::new(ChangeLog::unbounded());
        log.append(&insert_at(Position::from_lsn(1), 1)).await.unwrap();

        let mut sub = Subscription::new(
            Arc::clone(&log),
            StartFrom::Oldest,
            Duration::from_millis(10),
        );
        assert_eq!(sub.next_batch(10).await.unwrap().len(), 1);

        let writer = {
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                log.append(&insert_at(Position::from_lsn(2), 2)).await
            })
        };

        // Blocks until the writer lands the next change.
        let batch = sub.next_batch(10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].position, Position::from_lsn(2));
        writer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_fan_out_subscribers_are_independent() {
        let log = Arc::new(ChangeLog::unbounded());
        for i in 1..=3 {
            log.append(&insert_at(Position::from_lsn(i), i as i64)).await.unwrap();
        }

        let mut a = Subscription::new(Arc::clone(&log), StartFrom::Oldest, Duration::from_millis(5));
        let mut b = Subscription::new(
            Arc::clone(&log),
            StartFrom::After(Position::from_lsn(2)),
            Duration::from_millis(5),
        );

        assert_eq!(a.poll_batch(10).await.unwrap().len(), 3);
        let b_batch = b.poll_batch(10).await.unwrap();
        assert_eq!(b_batch.len(), 1);
        assert_eq!(b_batch[0].position, Position::from_lsn(3));
    }

    #[tokio::test]
    async fn test_ddl_and_dml_share_ordering() {
        let log = ChangeLog::unbounded();
        log.append(&Change::ddl(
            Position::bootstrap(1),
            DdlChange {
                statement: "CREATE TABLE t (id int)".into(),
                username: "app".into(),
                database: "app".into(),
            },
        ))
        .await
        .unwrap();
        log.append(&insert_at(Position::bootstrap(2), 1)).await.unwrap();

        let batch = log.read_after(None, 10).await.unwrap();
        assert!(matches!(batch[0].payload, crate::change::ChangePayload::Ddl(_)));
        assert!(matches!(batch[1].payload, crate::change::ChangePayload::Dml(_)));
    }
}
