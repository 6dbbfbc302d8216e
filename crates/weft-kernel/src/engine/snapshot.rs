//! Snapshot encoding.
//!
//! Snapshots are strictly an optimization layer: they provide initial state at
//! a given seq so replay can skip the prefix, and they never replace the log.
//! The engine treats state as opaque; the caller supplies the codec.

use std::marker::PhantomData;

use serde::{de::DeserializeOwned, Serialize};

use crate::engine::contracts::RunState;
use crate::engine::error::EngineError;

/// Encodes and decodes run state for durable snapshots.
pub trait SnapshotCodec<S>: Send + Sync {
    fn encode(&self, state: &S) -> Result<Vec<u8>, EngineError>;
    fn decode(&self, run_id: &str, data: &[u8]) -> Result<S, EngineError>;
}

/// Serde JSON codec for states that derive Serialize/Deserialize.
pub struct JsonSnapshotCodec<S>(PhantomData<S>);

impl<S> JsonSnapshotCodec<S> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<S> Default for JsonSnapshotCodec<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> SnapshotCodec<S> for JsonSnapshotCodec<S>
where
    S: RunState + Serialize + DeserializeOwned,
{
    fn encode(&self, state: &S) -> Result<Vec<u8>, EngineError> {
        serde_json::to_vec(state).map_err(|e| {
            EngineError::system("snapshot_encode", "failed to encode snapshot state")
                .with_cause(EngineError::wrap(e))
        })
    }

    fn decode(&self, run_id: &str, data: &[u8]) -> Result<S, EngineError> {
        serde_json::from_slice(data).map_err(|e| {
            EngineError::system("snapshot_decode", "failed to decode snapshot state")
                .with_context("run_id", run_id)
                .with_cause(EngineError::wrap(e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct CounterState {
        run: String,
        count: i64,
    }

    impl RunState for CounterState {
        fn run_id(&self) -> &str {
            &self.run
        }
    }

    #[test]
    fn json_codec_round_trips() {
        let codec = JsonSnapshotCodec::new();
        let state = CounterState {
            run: "run-1".to_string(),
            count: 3,
        };
        let bytes = codec.encode(&state).unwrap();
        let back: CounterState = codec.decode("run-1", &bytes).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn decode_failure_is_system_error_with_run_context() {
        let codec: JsonSnapshotCodec<CounterState> = JsonSnapshotCodec::new();
        let err = codec.decode("run-1", b"not json").unwrap_err();
        assert_eq!(err.code, "snapshot_decode");
        assert_eq!(err.context["run_id"], "run-1");
    }
}
