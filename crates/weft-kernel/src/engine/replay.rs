//! Offline replay: drive a captured event sequence through a fresh runner,
//! and compare event streams across stores.
//!
//! A run's final state is a deterministic function of its event sequence, so
//! two stores that received the same deliveries must agree on both the stream
//! digest and the reconstructed state.

use sha2::{Digest, Sha256};
use serde::{Deserialize, Serialize};

use crate::engine::contracts::{Event, RunState};
use crate::engine::error::EngineError;
use crate::engine::identity::Seq;
use crate::engine::runner::Runner;
use crate::engine::store::{EventRecord, Store};

/// A captured run: the run id and the ordered incoming events.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Capture {
    pub run_id: String,
    pub events: Vec<Event>,
}

/// Replays a capture through the runner and returns the final state.
pub async fn replay_capture<S: RunState>(
    runner: &Runner<S>,
    capture: &Capture,
) -> Result<S, EngineError> {
    let mut final_state = None;
    for event in &capture.events {
        final_state = Some(runner.handle_event(&capture.run_id, event.clone()).await?);
    }
    match final_state {
        Some(state) => Ok(state),
        None => Ok(runner.replay_state(&capture.run_id).await?.0),
    }
}

/// SHA-256 digest over the ordered `seq:event_id:kind` lines of a stream.
/// Payload bytes are excluded so storage-tier JSON normalization (key order,
/// number formatting) cannot produce false divergence.
pub fn event_stream_hash(records: &[EventRecord]) -> String {
    let mut hasher = Sha256::new();
    for record in records {
        hasher.update(record.seq.to_string().as_bytes());
        hasher.update(b":");
        hasher.update(record.event_id.as_bytes());
        hasher.update(b":");
        hasher.update(record.kind.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Outcome of comparing a run's event stream across two stores.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplayReport {
    pub matches: bool,
    pub live_hash: String,
    pub replay_hash: String,
    /// First seq at which the streams differ, when they do.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub divergence_seq: Option<Seq>,
}

/// Compares the event streams two stores hold for the same run.
pub async fn verify_replay(
    live: &dyn Store,
    replayed: &dyn Store,
    run_id: &str,
) -> Result<ReplayReport, EngineError> {
    let live_events = live.list_events(run_id, 0, 0).await?;
    let replay_events = replayed.list_events(run_id, 0, 0).await?;

    let live_hash = event_stream_hash(&live_events);
    let replay_hash = event_stream_hash(&replay_events);
    let matches = live_hash == replay_hash;

    let divergence_seq = if matches {
        None
    } else {
        let mut seq = None;
        for (a, b) in live_events.iter().zip(replay_events.iter()) {
            if a.event_id != b.event_id || a.kind != b.kind {
                seq = Some(a.seq);
                break;
            }
        }
        seq.or_else(|| {
            // One stream is a strict prefix of the other.
            let shorter = live_events.len().min(replay_events.len());
            live_events
                .get(shorter)
                .or_else(|| replay_events.get(shorter))
                .map(|r| r.seq)
        })
    };

    Ok(ReplayReport {
        matches,
        live_hash,
        replay_hash,
        divergence_seq,
    })
}
