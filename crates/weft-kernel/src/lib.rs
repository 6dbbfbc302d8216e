//! Weft kernel: event-sourced execution engine for long-running agent runs.
//!
//! The event log is the source of truth. State is derived by folding events
//! through a pure reducer; side effects are declared as intents and executed
//! by effect handlers inside a cycle, never during replay.

pub mod engine;

pub use engine::config::{EngineConfig, StoreBackend};
pub use engine::contracts::{
    EffectHandler, Event, Intent, JsonMap, Reducer, RunState, StateFactory, Transition,
};
pub use engine::error::{EngineError, ErrorCategory};
pub use engine::identity::{
    claim_event_id, marker_event_id, snapshot_id, synthesized_event_id, RunId, Seq,
    INTENT_CLAIMED, INTENT_PROCESSED, RUN_CREATED, RUN_PAUSED, RUN_RESUMED,
};
pub use engine::memory_store::MemoryStore;
pub use engine::replay::{event_stream_hash, replay_capture, verify_replay, Capture, ReplayReport};
pub use engine::runner::Runner;
pub use engine::snapshot::{JsonSnapshotCodec, SnapshotCodec};
pub use engine::store::{open_store, EventRecord, SnapshotRecord, Store};

#[cfg(feature = "postgres-store")]
pub use engine::postgres_store::PostgresStore;
#[cfg(feature = "sqlite-store")]
pub use engine::sqlite_store::SqliteStore;
