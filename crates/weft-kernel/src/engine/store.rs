//! Durable store contract: append-only event log plus snapshots.
//!
//! Constraints every implementation must hold:
//! - seq assignment is atomic with append: per run, seqs are 1, 2, 3, ... with
//!   no holes and no duplicates;
//! - `event_id` is unique across the store, and appending a duplicate id is a
//!   no-op that returns the pre-existing record without allocating a seq;
//! - `(run_id, upto_seq)` is unique for snapshots;
//! - append is linearizable per run; different runs may append concurrently.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::contracts::Event;
use crate::engine::error::EngineError;
use crate::engine::identity::{RunId, Seq};

/// Persisted representation of an event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: String,
    pub run_id: RunId,
    /// Assigned by the store at append time; ignored on input.
    pub seq: Seq,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl EventRecord {
    /// Builds the record to append for an engine-level event.
    pub fn from_event(run_id: &str, event: &Event) -> Self {
        Self {
            event_id: event.id.clone(),
            run_id: run_id.to_string(),
            seq: 0,
            kind: event.kind.clone(),
            payload: event.payload.clone(),
            created_at: event.timestamp,
        }
    }

    /// Recovers the engine-level event from a stored record.
    pub fn to_event(&self) -> Event {
        Event {
            id: self.event_id.clone(),
            kind: self.kind.clone(),
            timestamp: self.created_at,
            payload: self.payload.clone(),
        }
    }
}

/// Materialized state of a run as of `upto_seq`. A replay optimization, never
/// authoritative above the event log.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub snapshot_id: String,
    pub run_id: RunId,
    pub upto_seq: Seq,
    /// Codec-encoded state (JSON UTF-8 for the default codec).
    pub state: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Event log and snapshot operations, implemented by storage collaborators.
#[async_trait]
pub trait Store: Send + Sync {
    /// Appends an event, assigning the next per-run seq. On duplicate
    /// `event_id` the existing record is returned unchanged.
    async fn append_event(&self, record: EventRecord) -> Result<EventRecord, EngineError>;

    /// Lists events with `seq > after_seq`, ascending by seq. `limit == 0`
    /// means unbounded.
    async fn list_events(
        &self,
        run_id: &str,
        after_seq: Seq,
        limit: usize,
    ) -> Result<Vec<EventRecord>, EngineError>;

    /// Largest seq for the run, or 0 when the run has no events.
    async fn last_seq(&self, run_id: &str) -> Result<Seq, EngineError>;

    /// Looks up an event by its stable id anywhere in the store.
    async fn get_event_by_id(&self, event_id: &str) -> Result<Option<EventRecord>, EngineError>;

    /// Persists a snapshot. Fails with `validation/conflict` when
    /// `(run_id, upto_seq)` already exists.
    async fn save_snapshot(&self, record: SnapshotRecord) -> Result<SnapshotRecord, EngineError>;

    /// Snapshot with the largest `upto_seq` for the run, if any.
    async fn load_latest_snapshot(
        &self,
        run_id: &str,
    ) -> Result<Option<SnapshotRecord>, EngineError>;
}

/// Opens a store from a scheme-prefixed database URL:
/// `memory:` for the in-process store, `sqlite:<path>` for the embedded file
/// store, `postgres://...` for the server store. Backends are feature-gated;
/// selecting a disabled one is a validation error.
pub async fn open_store(database_url: &str) -> Result<std::sync::Arc<dyn Store>, EngineError> {
    use crate::engine::config::StoreBackend;

    match StoreBackend::parse(database_url)? {
        StoreBackend::Memory => Ok(std::sync::Arc::new(
            crate::engine::memory_store::MemoryStore::new(),
        )),
        #[cfg(feature = "sqlite-store")]
        StoreBackend::Sqlite(path) => Ok(std::sync::Arc::new(
            crate::engine::sqlite_store::SqliteStore::new(path),
        )),
        #[cfg(not(feature = "sqlite-store"))]
        StoreBackend::Sqlite(_) => Err(EngineError::validation(
            "unsupported_backend",
            "sqlite store not enabled in this build",
        )),
        #[cfg(feature = "postgres-store")]
        StoreBackend::Postgres(url) => Ok(std::sync::Arc::new(
            crate::engine::postgres_store::PostgresStore::connect(&url).await?,
        )),
        #[cfg(not(feature = "postgres-store"))]
        StoreBackend::Postgres(_) => Err(EngineError::validation(
            "unsupported_backend",
            "postgres store not enabled in this build",
        )),
    }
}
