//! SQLite-backed store for the event log and snapshots.
//!
//! Feature-gated behind `sqlite-store`. A per-store mutex serializes writes;
//! seq assignment happens inside a transaction that reads `MAX(seq)` for the
//! run, so the per-run monotonic invariant holds even across processes
//! sharing the file (SQLite serializes writers itself).

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::engine::error::EngineError;
use crate::engine::identity::Seq;
use crate::engine::store::{EventRecord, SnapshotRecord, Store};

fn store_err(prefix: &str, err: impl std::fmt::Display) -> EngineError {
    EngineError::system("store_error", format!("{prefix}: {err}"))
}

/// Embedded file store.
pub struct SqliteStore {
    db_path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn open_connection(path: &Path) -> Result<Connection, EngineError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| store_err("create parent dir", e))?;
            }
        }
        let conn = Connection::open(path).map_err(|e| store_err("open sqlite db", e))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| store_err("set journal_mode", e))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| store_err("set synchronous", e))?;
        Self::ensure_schema(&conn)?;
        Ok(conn)
    }

    fn ensure_schema(conn: &Connection) -> Result<(), EngineError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS engine_events (
                event_id TEXT NOT NULL UNIQUE,
                run_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT,
                created_at TEXT NOT NULL,
                PRIMARY KEY (run_id, seq)
            );
            CREATE INDEX IF NOT EXISTS idx_engine_events_event_id
            ON engine_events (event_id);
            CREATE TABLE IF NOT EXISTS engine_snapshots (
                snapshot_id TEXT NOT NULL UNIQUE,
                run_id TEXT NOT NULL,
                upto_seq INTEGER NOT NULL,
                state BLOB NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (run_id, upto_seq)
            );
            ",
        )
        .map_err(|e| store_err("ensure schema", e))
    }

    /// Runs a blocking closure against a fresh connection on the blocking
    /// pool, holding the store's write lock for the duration.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, EngineError> + Send + 'static,
    {
        let path = self.db_path.clone();
        let lock = Arc::clone(&self.lock);
        tokio::task::spawn_blocking(move || {
            let _guard = lock
                .lock()
                .map_err(|_| store_err("lock poisoned", "mutex poisoned"))?;
            let mut conn = Self::open_connection(&path)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| store_err("blocking task", e))?
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRecord> {
    let payload: Option<String> = row.get(4)?;
    let created_at: String = row.get(5)?;
    Ok(EventRecord {
        event_id: row.get(0)?,
        run_id: row.get(1)?,
        seq: row.get(2)?,
        kind: row.get(3)?,
        payload: payload.and_then(|p| serde_json::from_str(&p).ok()),
        created_at: parse_timestamp(&created_at),
    })
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

const SELECT_EVENT: &str =
    "SELECT event_id, run_id, seq, kind, payload, created_at FROM engine_events";

#[async_trait]
impl Store for SqliteStore {
    async fn append_event(&self, record: EventRecord) -> Result<EventRecord, EngineError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(|e| store_err("begin tx", e))?;

            // Idempotent append: a duplicate event_id returns the existing
            // record and never allocates a seq.
            let existing = tx
                .query_row(
                    &format!("{SELECT_EVENT} WHERE event_id = ?1"),
                    params![record.event_id],
                    row_to_event,
                )
                .optional()
                .map_err(|e| store_err("lookup event_id", e))?;
            if let Some(found) = existing {
                return Ok(found);
            }

            let next_seq: Seq = tx
                .query_row(
                    "SELECT COALESCE(MAX(seq), 0) + 1 FROM engine_events WHERE run_id = ?1",
                    params![record.run_id],
                    |row| row.get(0),
                )
                .map_err(|e| store_err("read head", e))?;

            let payload = record
                .payload
                .as_ref()
                .map(|p| serde_json::to_string(p).map_err(|e| store_err("serialize payload", e)))
                .transpose()?;
            tx.execute(
                "INSERT INTO engine_events (event_id, run_id, seq, kind, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.event_id,
                    record.run_id,
                    next_seq,
                    record.kind,
                    payload,
                    record.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| store_err("insert event", e))?;
            tx.commit().map_err(|e| store_err("commit tx", e))?;

            Ok(EventRecord {
                seq: next_seq,
                ..record
            })
        })
        .await
    }

    async fn list_events(
        &self,
        run_id: &str,
        after_seq: Seq,
        limit: usize,
    ) -> Result<Vec<EventRecord>, EngineError> {
        let run_id = run_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "{SELECT_EVENT} WHERE run_id = ?1 AND seq > ?2 ORDER BY seq ASC LIMIT ?3"
                ))
                .map_err(|e| store_err("prepare list", e))?;
            let cap: i64 = if limit == 0 { -1 } else { limit as i64 };
            let rows = stmt
                .query_map(params![run_id, after_seq, cap], row_to_event)
                .map_err(|e| store_err("query list", e))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(|e| store_err("row decode", e))?);
            }
            Ok(out)
        })
        .await
    }

    async fn last_seq(&self, run_id: &str) -> Result<Seq, EngineError> {
        let run_id = run_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM engine_events WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .map_err(|e| store_err("read head", e))
        })
        .await
    }

    async fn get_event_by_id(&self, event_id: &str) -> Result<Option<EventRecord>, EngineError> {
        let event_id = event_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("{SELECT_EVENT} WHERE event_id = ?1"),
                params![event_id],
                row_to_event,
            )
            .optional()
            .map_err(|e| store_err("lookup event_id", e))
        })
        .await
    }

    async fn save_snapshot(&self, record: SnapshotRecord) -> Result<SnapshotRecord, EngineError> {
        self.with_conn(move |conn| {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM engine_snapshots WHERE run_id = ?1 AND upto_seq = ?2",
                    params![record.run_id, record.upto_seq],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| store_err("lookup snapshot", e))?;
            if exists.is_some() {
                return Err(EngineError::validation(
                    "conflict",
                    "snapshot already exists for this sequence",
                )
                .with_context("run_id", record.run_id.as_str())
                .with_context("upto_seq", record.upto_seq));
            }
            conn.execute(
                "INSERT INTO engine_snapshots (snapshot_id, run_id, upto_seq, state, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.snapshot_id,
                    record.run_id,
                    record.upto_seq,
                    record.state,
                    record.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| store_err("insert snapshot", e))?;
            Ok(record)
        })
        .await
    }

    async fn load_latest_snapshot(
        &self,
        run_id: &str,
    ) -> Result<Option<SnapshotRecord>, EngineError> {
        let run_id = run_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT snapshot_id, run_id, upto_seq, state, created_at
                 FROM engine_snapshots
                 WHERE run_id = ?1
                 ORDER BY upto_seq DESC
                 LIMIT 1",
                params![run_id],
                |row| {
                    let created_at: String = row.get(4)?;
                    Ok(SnapshotRecord {
                        snapshot_id: row.get(0)?,
                        run_id: row.get(1)?,
                        upto_seq: row.get(2)?,
                        state: row.get(3)?,
                        created_at: parse_timestamp(&created_at),
                    })
                },
            )
            .optional()
            .map_err(|e| store_err("load latest snapshot", e))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn test_db_path(name: &str) -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        std::env::temp_dir().join(format!("weft-kernel-{name}-{ts}.sqlite"))
    }

    fn record(event_id: &str, run_id: &str, kind: &str) -> EventRecord {
        EventRecord {
            event_id: event_id.to_string(),
            run_id: run_id.to_string(),
            seq: 0,
            kind: kind.to_string(),
            payload: Some(json!({"n": 1})),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn event_roundtrip_with_monotonic_seq() {
        let store = SqliteStore::new(test_db_path("events"));
        assert_eq!(store.last_seq("run-1").await.unwrap(), 0);

        let first = store.append_event(record("e1", "run-1", "inc")).await.unwrap();
        assert_eq!(first.seq, 1);
        let second = store.append_event(record("e2", "run-1", "inc")).await.unwrap();
        assert_eq!(second.seq, 2);

        let events = store.list_events("run-1", 1, 0).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_id, "e2");
        assert_eq!(events[0].payload.as_ref().unwrap()["n"], 1);
        assert_eq!(store.last_seq("run-1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn duplicate_event_id_is_idempotent() {
        let store = SqliteStore::new(test_db_path("dup"));
        let first = store.append_event(record("e1", "run-1", "inc")).await.unwrap();
        let again = store.append_event(record("e1", "run-1", "inc")).await.unwrap();
        assert_eq!(again.seq, first.seq);
        assert_eq!(store.last_seq("run-1").await.unwrap(), 1);
        assert!(store.get_event_by_id("e1").await.unwrap().is_some());
        assert!(store.get_event_by_id("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn snapshot_roundtrip_and_conflict() {
        let store = SqliteStore::new(test_db_path("snaps"));
        let snap = SnapshotRecord {
            snapshot_id: "snap-run-1-4".to_string(),
            run_id: "run-1".to_string(),
            upto_seq: 4,
            state: br#"{"run":"run-1","count":6}"#.to_vec(),
            created_at: Utc::now(),
        };
        store.save_snapshot(snap.clone()).await.unwrap();

        let latest = store.load_latest_snapshot("run-1").await.unwrap().unwrap();
        assert_eq!(latest.upto_seq, 4);
        assert_eq!(latest.state, snap.state);

        let err = store.save_snapshot(snap).await.unwrap_err();
        assert_eq!(err.code, "conflict");
    }
}
