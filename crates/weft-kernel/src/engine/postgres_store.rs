//! Postgres-backed store for the event log and snapshots.
//!
//! Feature-gated behind `postgres-store`. Payloads live in JSONB. A
//! `pg_advisory_xact_lock` keyed on the run id serializes seq assignment per
//! run while leaving different runs fully concurrent, which is exactly the
//! linearizability contract the runner relies on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use tokio::sync::OnceCell;

use crate::engine::error::EngineError;
use crate::engine::identity::Seq;
use crate::engine::store::{EventRecord, SnapshotRecord, Store};

fn store_err(prefix: &str, err: impl std::fmt::Display) -> EngineError {
    EngineError::system("store_error", format!("{prefix}: {err}"))
}

/// Server store over a sqlx connection pool.
pub struct PostgresStore {
    pool: PgPool,
    schema_ready: OnceCell<()>,
}

impl PostgresStore {
    /// Connects with a small pool; the pool is the store's concurrency policy.
    pub async fn connect(database_url: &str) -> Result<Self, EngineError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| store_err("connect postgres", e))?;
        Ok(Self::with_pool(pool))
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: OnceCell::new(),
        }
    }

    async fn ensure_schema(&self) -> Result<(), EngineError> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    "CREATE TABLE IF NOT EXISTS engine_events (
                        event_id TEXT NOT NULL UNIQUE,
                        run_id TEXT NOT NULL,
                        seq BIGINT NOT NULL,
                        kind TEXT NOT NULL,
                        payload JSONB,
                        created_at TIMESTAMPTZ NOT NULL,
                        PRIMARY KEY (run_id, seq)
                    )",
                )
                .execute(&self.pool)
                .await
                .map_err(|e| store_err("create events table", e))?;
                sqlx::query(
                    "CREATE TABLE IF NOT EXISTS engine_snapshots (
                        snapshot_id TEXT NOT NULL UNIQUE,
                        run_id TEXT NOT NULL,
                        upto_seq BIGINT NOT NULL,
                        state BYTEA NOT NULL,
                        created_at TIMESTAMPTZ NOT NULL,
                        PRIMARY KEY (run_id, upto_seq)
                    )",
                )
                .execute(&self.pool)
                .await
                .map_err(|e| store_err("create snapshots table", e))?;
                Ok::<(), EngineError>(())
            })
            .await
            .map(|_| ())
    }
}

type EventRow = (String, String, i64, String, Option<Json<Value>>, DateTime<Utc>);

fn row_to_event(row: EventRow) -> EventRecord {
    EventRecord {
        event_id: row.0,
        run_id: row.1,
        seq: row.2,
        kind: row.3,
        payload: row.4.map(|j| j.0),
        created_at: row.5,
    }
}

const SELECT_EVENT: &str =
    "SELECT event_id, run_id, seq, kind, payload, created_at FROM engine_events";

#[async_trait]
impl Store for PostgresStore {
    async fn append_event(&self, record: EventRecord) -> Result<EventRecord, EngineError> {
        self.ensure_schema().await?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| store_err("begin tx", e))?;

        // Serialize appends per run to keep seq assignment contiguous.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&record.run_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| store_err("advisory lock", e))?;

        let existing: Option<EventRow> =
            sqlx::query_as(&format!("{SELECT_EVENT} WHERE event_id = $1"))
                .bind(&record.event_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| store_err("lookup event_id", e))?;
        if let Some(row) = existing {
            tx.commit().await.map_err(|e| store_err("commit tx", e))?;
            return Ok(row_to_event(row));
        }

        let next_seq: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM engine_events WHERE run_id = $1",
        )
        .bind(&record.run_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| store_err("read head", e))?;

        sqlx::query(
            "INSERT INTO engine_events (event_id, run_id, seq, kind, payload, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&record.event_id)
        .bind(&record.run_id)
        .bind(next_seq)
        .bind(&record.kind)
        .bind(record.payload.clone().map(Json))
        .bind(record.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| store_err("insert event", e))?;
        tx.commit().await.map_err(|e| store_err("commit tx", e))?;

        Ok(EventRecord {
            seq: next_seq,
            ..record
        })
    }

    async fn list_events(
        &self,
        run_id: &str,
        after_seq: Seq,
        limit: usize,
    ) -> Result<Vec<EventRecord>, EngineError> {
        self.ensure_schema().await?;
        let cap: i64 = if limit == 0 { i64::MAX } else { limit as i64 };
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "{SELECT_EVENT} WHERE run_id = $1 AND seq > $2 ORDER BY seq ASC LIMIT $3"
        ))
        .bind(run_id)
        .bind(after_seq)
        .bind(cap)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| store_err("list events", e))?;
        Ok(rows.into_iter().map(row_to_event).collect())
    }

    async fn last_seq(&self, run_id: &str) -> Result<Seq, EngineError> {
        self.ensure_schema().await?;
        sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) FROM engine_events WHERE run_id = $1")
            .bind(run_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| store_err("read head", e))
    }

    async fn get_event_by_id(&self, event_id: &str) -> Result<Option<EventRecord>, EngineError> {
        self.ensure_schema().await?;
        let row: Option<EventRow> = sqlx::query_as(&format!("{SELECT_EVENT} WHERE event_id = $1"))
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| store_err("lookup event_id", e))?;
        Ok(row.map(row_to_event))
    }

    async fn save_snapshot(&self, record: SnapshotRecord) -> Result<SnapshotRecord, EngineError> {
        self.ensure_schema().await?;
        let inserted = sqlx::query(
            "INSERT INTO engine_snapshots (snapshot_id, run_id, upto_seq, state, created_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (run_id, upto_seq) DO NOTHING",
        )
        .bind(&record.snapshot_id)
        .bind(&record.run_id)
        .bind(record.upto_seq)
        .bind(&record.state)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| store_err("insert snapshot", e))?;
        if inserted.rows_affected() == 0 {
            return Err(EngineError::validation(
                "conflict",
                "snapshot already exists for this sequence",
            )
            .with_context("run_id", record.run_id.as_str())
            .with_context("upto_seq", record.upto_seq));
        }
        Ok(record)
    }

    async fn load_latest_snapshot(
        &self,
        run_id: &str,
    ) -> Result<Option<SnapshotRecord>, EngineError> {
        self.ensure_schema().await?;
        let row: Option<(String, String, i64, Vec<u8>, DateTime<Utc>)> = sqlx::query_as(
            "SELECT snapshot_id, run_id, upto_seq, state, created_at
             FROM engine_snapshots
             WHERE run_id = $1
             ORDER BY upto_seq DESC
             LIMIT 1",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| store_err("load latest snapshot", e))?;
        Ok(row.map(|(snapshot_id, run_id, upto_seq, state, created_at)| SnapshotRecord {
            snapshot_id,
            run_id,
            upto_seq,
            state,
            created_at,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn test_db_url() -> Option<String> {
        std::env::var("WEFT_TEST_POSTGRES_URL").ok()
    }

    fn unique_run(name: &str) -> String {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        format!("run-{name}-{ts}")
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
    async fn event_roundtrip_when_env_is_set() {
        let Some(url) = test_db_url() else {
            return;
        };
        let store = PostgresStore::connect(&url).await.unwrap();
        let run = unique_run("events");

        let first = store
            .append_event(record(&format!("{run}-e1"), &run, "inc"))
            .await
            .unwrap();
        assert_eq!(first.seq, 1);
        let again = store
            .append_event(record(&format!("{run}-e1"), &run, "inc"))
            .await
            .unwrap();
        assert_eq!(again.seq, 1, "duplicate id must not allocate a seq");

        let second = store
            .append_event(record(&format!("{run}-e2"), &run, "added"))
            .await
            .unwrap();
        assert_eq!(second.seq, 2);
        let tail = store.list_events(&run, 1, 0).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].kind, "added");
    }

    #[tokio::test]
    async fn snapshot_conflict_when_env_is_set() {
        let Some(url) = test_db_url() else {
            return;
        };
        let store = PostgresStore::connect(&url).await.unwrap();
        let run = unique_run("snaps");
        let snap = SnapshotRecord {
            snapshot_id: format!("snap-{run}-2"),
            run_id: run.clone(),
            upto_seq: 2,
            state: b"{}".to_vec(),
            created_at: Utc::now(),
        };
        store.save_snapshot(snap.clone()).await.unwrap();
        let err = store
            .save_snapshot(SnapshotRecord {
                snapshot_id: format!("snap-{run}-2-dup"),
                ..snap
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, "conflict");
    }
}
