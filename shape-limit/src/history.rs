use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::ShapeError;
use crate::store::Command;
use crate::store::CoordinationStore;
use crate::store::Reply;
use crate::store::StoreError;

/// One recorded call on a shaping key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub request_id: String,
    pub timestamp_micros: i64,
}

/// A fresh, unique identifier for a call made at `timestamp_micros`.
pub fn request_id(timestamp_micros: i64) -> String {
    format!("{:032x}-{timestamp_micros}", rand::random::<u128>())
}

/// Timestamped call history per shaping key, kept in the coordination store.
///
/// Each key is an ordered set scored by timestamp. Entries older than the
/// retention window are pruned on every write, and the key expires on its own
/// once nobody writes to it any more.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    store: Arc<dyn CoordinationStore>,
}

impl HistoryStore {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// Prune, read, append and refresh the expiry of `key` in one atomic batch.
    ///
    /// Returns the entries that were live *before* the new one was inserted,
    /// oldest first.
    pub async fn record(
        &self,
        key: &str,
        request_id: &str,
        timestamp_micros: i64,
        retention: Duration,
    ) -> Result<Vec<HistoryEntry>, ShapeError> {
        let batch = vec![
            Command::RemoveBelow {
                key: key.to_string(),
                below: timestamp_micros - retention.as_micros() as i64,
            },
            Command::Range {
                key: key.to_string(),
            },
            Command::Add {
                key: key.to_string(),
                member: request_id.to_string(),
                score: timestamp_micros,
            },
            Command::Expire {
                key: key.to_string(),
                ttl: expiry(retention),
            },
        ];

        let mut replies = self.exec(key, batch).await?.into_iter();
        let members = replies
            .nth(1)
            .ok_or_else(|| StoreError::UnexpectedReply("missing range reply".into()))
            .and_then(Reply::into_members)?;

        Ok(members
            .into_iter()
            .map(|(request_id, timestamp_micros)| HistoryEntry {
                request_id,
                timestamp_micros,
            })
            .collect())
    }

    /// Delete the entry for `request_id`, returning how many entries went away.
    ///
    /// Removing an entry that is already gone is not an error; the second of
    /// two calls simply reports 0.
    pub async fn remove(&self, key: &str, request_id: &str) -> Result<u64, ShapeError> {
        let batch = vec![Command::Remove {
            key: key.to_string(),
            member: request_id.to_string(),
        }];

        let reply = self.exec(key, batch).await?.into_iter().next();
        Ok(reply
            .ok_or_else(|| StoreError::UnexpectedReply("missing remove reply".into()))
            .and_then(Reply::into_count)?)
    }

    /// Every entry currently held for `key`, without pruning.
    pub async fn entries(&self, key: &str) -> Result<Vec<HistoryEntry>, ShapeError> {
        let batch = vec![Command::Range {
            key: key.to_string(),
        }];
        let reply = self.exec(key, batch).await?.into_iter().next();
        let members = reply
            .ok_or_else(|| StoreError::UnexpectedReply("missing range reply".into()))
            .and_then(Reply::into_members)?;
        Ok(members
            .into_iter()
            .map(|(request_id, timestamp_micros)| HistoryEntry {
                request_id,
                timestamp_micros,
            })
            .collect())
    }

    /// Run a batch and reject it as a whole if any sub-command failed.
    async fn exec(&self, key: &str, batch: Vec<Command>) -> Result<Vec<Reply>, ShapeError> {
        let expected = batch.len();
        let results = self.store.multi(batch).await?;

        let mut replies = Vec::with_capacity(results.len());
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(reply) => replies.push(reply),
                Err(err) => errors.push(err.to_string()),
            }
        }

        if !errors.is_empty() {
            warn!(key, failed = errors.len(), "errors while traffic shaping");
            return Err(ShapeError::StoreUnavailable(errors.join("; ")));
        }
        if replies.len() != expected {
            return Err(ShapeError::StoreUnavailable(format!(
                "expected {expected} replies, got {}",
                replies.len()
            )));
        }
        Ok(replies)
    }
}

/// Key expiry in whole seconds, never shorter than the retention window.
fn expiry(retention: Duration) -> Duration {
    Duration::from_secs(retention.as_millis().div_ceil(1000).max(1) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::Clock;
    use crate::store::MemoryStore;

    const SECOND: i64 = 1_000_000;

    fn history() -> (HistoryStore, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (HistoryStore::new(store.clone()), store)
    }

    fn timestamps(entries: &[HistoryEntry]) -> Vec<i64> {
        entries.iter().map(|entry| entry.timestamp_micros).collect()
    }

    #[tokio::test]
    async fn test_record_returns_entries_before_insertion() {
        let (history, _) = history();
        let window = Duration::from_secs(10);

        assert!(history.record("k", "a", SECOND, window).await.unwrap().is_empty());
        let seen = history.record("k", "b", 2 * SECOND, window).await.unwrap();
        assert_eq!(
            seen,
            vec![HistoryEntry {
                request_id: "a".into(),
                timestamp_micros: SECOND
            }]
        );

        let seen = history.record("k", "c", 3 * SECOND, window).await.unwrap();
        assert_eq!(timestamps(&seen), vec![SECOND, 2 * SECOND]);
    }

    #[tokio::test]
    async fn test_record_prunes_outside_the_retention_window() {
        let (history, _) = history();
        let window = Duration::from_secs(10);

        for (id, at) in [("t0", 1), ("t1", 5), ("t2", 12), ("t3", 14)] {
            history.record("k", id, at * SECOND, window).await.unwrap();
        }

        // At t=20 anything before t=10 is gone before the read happens
        let seen = history.record("k", "t4", 20 * SECOND, window).await.unwrap();
        assert_eq!(timestamps(&seen), vec![12 * SECOND, 14 * SECOND]);

        // An entry exactly on the boundary survives
        let seen = history.record("k", "t5", 22 * SECOND, window).await.unwrap();
        assert_eq!(timestamps(&seen), vec![12 * SECOND, 14 * SECOND, 20 * SECOND]);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (history, _) = history();
        let window = Duration::from_secs(10);

        history.record("a", "1", SECOND, window).await.unwrap();
        let seen = history.record("b", "2", SECOND, window).await.unwrap();
        assert!(seen.is_empty());
    }

    #[tokio::test]
    async fn test_record_then_remove_restores_the_set() {
        let (history, _) = history();
        let window = Duration::from_secs(10);
        history.record("k", "a", SECOND, window).await.unwrap();
        history.record("k", "b", 2 * SECOND, window).await.unwrap();
        let before = history.entries("k").await.unwrap();

        history.record("k", "c", 3 * SECOND, window).await.unwrap();
        assert_eq!(history.remove("k", "c").await.unwrap(), 1);

        assert_eq!(history.entries("k").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (history, _) = history();
        history
            .record("k", "a", SECOND, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(history.remove("k", "a").await.unwrap(), 1);
        assert_eq!(history.remove("k", "a").await.unwrap(), 0);
        assert_eq!(history.remove("missing", "a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_idle_keys_expire() {
        let (clock, mock) = quanta::Clock::mock();
        let store = Arc::new(MemoryStore::with_clock(Clock::with_clock(clock, 0)));
        let history = HistoryStore::new(store.clone());

        history
            .record("k", "a", 0, Duration::from_millis(1_500))
            .await
            .unwrap();

        // Expiry is rounded up to whole seconds
        mock.increment(Duration::from_millis(1_999));
        assert!(store.contains("k"));
        mock.increment(Duration::from_millis(1));
        assert!(!store.contains("k"));
    }

    #[tokio::test]
    async fn test_failed_sub_command_fails_the_batch() {
        let (history, store) = history();
        store.set("k", "not a sorted set");

        let err = history
            .record("k", "a", SECOND, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ShapeError::StoreUnavailable(msg) if msg.contains("WRONGTYPE")));
    }

    #[tokio::test]
    async fn test_outage_is_reported() {
        let (history, store) = history();
        store.set_unavailable(true);

        assert!(matches!(
            history.remove("k", "a").await,
            Err(ShapeError::StoreUnavailable(_))
        ));
    }

    #[test]
    fn test_request_ids_are_unique() {
        let first = request_id(42);
        let second = request_id(42);
        assert_ne!(first, second);
        assert!(first.ends_with("-42"));
    }
}
