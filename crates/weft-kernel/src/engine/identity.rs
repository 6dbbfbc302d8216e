//! Run identity and deterministic id derivation.
//!
//! RunId identifies a long-running run; Seq is the per-run monotonically
//! increasing event sequence number assigned at append time. The id derivation
//! rules here are part of the engine contract: claim and completion marker ids
//! must be reproducible from `(run_id, idempotency_key)` alone so that
//! re-delivery collides with the original append instead of duplicating work.

use chrono::{DateTime, Utc};

/// Identifies a long-running run.
pub type RunId = String;

/// Monotonically increasing event sequence number per run, starting at 1.
pub type Seq = i64;

/// Event kind written when a keyed intent is claimed for execution.
pub const INTENT_CLAIMED: &str = "intent_claimed";

/// Event kind written after a keyed intent's handler returned.
pub const INTENT_PROCESSED: &str = "intent_processed";

/// Control-plane event kinds. Reducers treat these as no-ops.
pub const RUN_CREATED: &str = "run_created";
pub const RUN_PAUSED: &str = "run_paused";
pub const RUN_RESUMED: &str = "run_resumed";

/// Id synthesized for incoming events that arrive without one. Only trusted
/// in-process callers rely on this; external transports supply their own ids.
pub fn synthesized_event_id(run_id: &str, now: DateTime<Utc>) -> String {
    format!("e-{run_id}-{}", now.timestamp_nanos_opt().unwrap_or_default())
}

/// Claim event id for a keyed intent. Unique-id insertion of this event is the
/// single atomic gate for running the handler.
pub fn claim_event_id(run_id: &str, key: &str) -> String {
    format!("intent-claim-{run_id}-{key}")
}

/// Completion marker id recording that a keyed intent's handler returned.
pub fn marker_event_id(run_id: &str, key: &str) -> String {
    format!("intent-{run_id}-{key}")
}

/// Snapshot id for a run at a projection point.
pub fn snapshot_id(run_id: &str, upto_seq: Seq) -> String {
    format!("snap-{run_id}-{upto_seq}")
}
