//! In-memory store: the reference implementation and primary test fixture.
//!
//! One log per run; seq assigned on append under a single write lock, which
//! gives per-run linearizability for free.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::engine::error::EngineError;
use crate::engine::identity::{RunId, Seq};
use crate::engine::store::{EventRecord, SnapshotRecord, Store};

#[derive(Default)]
struct Inner {
    /// run_id -> ordered events (seq 1, 2, 3, ...)
    logs: HashMap<RunId, Vec<EventRecord>>,
    /// event_id -> (run_id, index into the run's log)
    by_id: HashMap<String, (RunId, usize)>,
    snapshots: HashMap<RunId, Vec<SnapshotRecord>>,
}

/// In-process store backed by `RwLock`-guarded maps.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_err() -> EngineError {
    EngineError::system("store_error", "memory store lock poisoned")
}

#[async_trait]
impl Store for MemoryStore {
    async fn append_event(&self, mut record: EventRecord) -> Result<EventRecord, EngineError> {
        let mut inner = self.inner.write().map_err(|_| lock_err())?;
        if let Some((run_id, idx)) = inner.by_id.get(&record.event_id) {
            let existing = &inner.logs[run_id][*idx];
            return Ok(existing.clone());
        }
        let log = inner.logs.entry(record.run_id.clone()).or_default();
        record.seq = log.last().map(|e| e.seq + 1).unwrap_or(1);
        log.push(record.clone());
        let idx = log.len() - 1;
        inner
            .by_id
            .insert(record.event_id.clone(), (record.run_id.clone(), idx));
        Ok(record)
    }

    async fn list_events(
        &self,
        run_id: &str,
        after_seq: Seq,
        limit: usize,
    ) -> Result<Vec<EventRecord>, EngineError> {
        let inner = self.inner.read().map_err(|_| lock_err())?;
        let log = match inner.logs.get(run_id) {
            Some(l) => l,
            None => return Ok(Vec::new()),
        };
        let iter = log.iter().filter(|e| e.seq > after_seq).cloned();
        Ok(if limit > 0 {
            iter.take(limit).collect()
        } else {
            iter.collect()
        })
    }

    async fn last_seq(&self, run_id: &str) -> Result<Seq, EngineError> {
        let inner = self.inner.read().map_err(|_| lock_err())?;
        Ok(inner
            .logs
            .get(run_id)
            .and_then(|l| l.last())
            .map(|e| e.seq)
            .unwrap_or(0))
    }

    async fn get_event_by_id(&self, event_id: &str) -> Result<Option<EventRecord>, EngineError> {
        let inner = self.inner.read().map_err(|_| lock_err())?;
        Ok(inner
            .by_id
            .get(event_id)
            .map(|(run_id, idx)| inner.logs[run_id][*idx].clone()))
    }

    async fn save_snapshot(&self, record: SnapshotRecord) -> Result<SnapshotRecord, EngineError> {
        let mut inner = self.inner.write().map_err(|_| lock_err())?;
        let snaps = inner.snapshots.entry(record.run_id.clone()).or_default();
        if snaps.iter().any(|s| s.upto_seq == record.upto_seq) {
            return Err(EngineError::validation(
                "conflict",
                "snapshot already exists for this sequence",
            )
            .with_context("run_id", record.run_id.as_str())
            .with_context("upto_seq", record.upto_seq));
        }
        snaps.push(record.clone());
        Ok(record)
    }

    async fn load_latest_snapshot(
        &self,
        run_id: &str,
    ) -> Result<Option<SnapshotRecord>, EngineError> {
        let inner = self.inner.read().map_err(|_| lock_err())?;
        Ok(inner
            .snapshots
            .get(run_id)
            .and_then(|snaps| snaps.iter().max_by_key(|s| s.upto_seq))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn record(event_id: &str, run_id: &str, kind: &str) -> EventRecord {
        EventRecord {
            event_id: event_id.to_string(),
            run_id: run_id.to_string(),
            seq: 0,
            kind: kind.to_string(),
            payload: Some(json!({"k": "v"})),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn seq_is_monotonic_per_run_without_gaps() {
        let store = MemoryStore::new();
        for i in 1..=5 {
            let rec = store
                .append_event(record(&format!("e{i}"), "run-a", "tick"))
                .await
                .unwrap();
            assert_eq!(rec.seq, i);
        }
        let other = store
            .append_event(record("x1", "run-b", "tick"))
            .await
            .unwrap();
        assert_eq!(other.seq, 1, "seq is per-run");
    }

    #[tokio::test]
    async fn duplicate_event_id_returns_existing_record() {
        let store = MemoryStore::new();
        let first = store
            .append_event(record("e0", "run-a", "inc"))
            .await
            .unwrap();
        let second = store
            .append_event(record("e0", "run-a", "inc"))
            .await
            .unwrap();
        assert_eq!(second.seq, first.seq);
        assert_eq!(store.last_seq("run-a").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn list_events_honors_after_seq_and_limit() {
        let store = MemoryStore::new();
        for i in 1..=4 {
            store
                .append_event(record(&format!("e{i}"), "run-a", "tick"))
                .await
                .unwrap();
        }
        let tail = store.list_events("run-a", 2, 0).await.unwrap();
        assert_eq!(tail.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![3, 4]);
        let capped = store.list_events("run-a", 0, 2).await.unwrap();
        assert_eq!(capped.len(), 2);
        assert!(store.list_events("run-none", 0, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_event_by_id_distinguishes_not_found() {
        let store = MemoryStore::new();
        store
            .append_event(record("e0", "run-a", "inc"))
            .await
            .unwrap();
        assert!(store.get_event_by_id("e0").await.unwrap().is_some());
        assert!(store.get_event_by_id("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn snapshot_conflict_on_same_upto_seq() {
        let store = MemoryStore::new();
        let snap = SnapshotRecord {
            snapshot_id: "snap-run-a-2".to_string(),
            run_id: "run-a".to_string(),
            upto_seq: 2,
            state: b"{}".to_vec(),
            created_at: Utc::now(),
        };
        store.save_snapshot(snap.clone()).await.unwrap();
        let err = store.save_snapshot(snap).await.unwrap_err();
        assert_eq!(err.code, "conflict");
        assert_eq!(err.http_status(), 409);
    }

    #[tokio::test]
    async fn latest_snapshot_has_largest_upto_seq() {
        let store = MemoryStore::new();
        for upto in [2, 6, 4] {
            store
                .save_snapshot(SnapshotRecord {
                    snapshot_id: format!("snap-run-a-{upto}"),
                    run_id: "run-a".to_string(),
                    upto_seq: upto,
                    state: b"{}".to_vec(),
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let latest = store.load_latest_snapshot("run-a").await.unwrap().unwrap();
        assert_eq!(latest.upto_seq, 6);
        assert!(store.load_latest_snapshot("run-b").await.unwrap().is_none());
    }
}
