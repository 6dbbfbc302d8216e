//! Runner: the reducer/effect cycle over a durable store.
//!
//! One call to [`Runner::handle_event`] is one cycle: replay state from the
//! latest snapshot plus subsequent events, apply the incoming event through
//! the pure reducer, persist it, dispatch each emitted intent to the first
//! matching handler behind the claim protocol, fold handler events back
//! through the reducer, and periodically snapshot.
//!
//! Cycles are not reentrant per run: callers must serialize deliveries for
//! the same run id. Across runs, cycles execute concurrently without
//! coordination; correctness under duplicate delivery comes from the store's
//! linearizable append and unique-id enforcement, not in-memory locks.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use crate::engine::contracts::{EffectHandler, Event, Intent, Reducer, RunState, StateFactory};
use crate::engine::error::EngineError;
use crate::engine::identity::{
    claim_event_id, marker_event_id, snapshot_id, synthesized_event_id, Seq, INTENT_CLAIMED,
    INTENT_PROCESSED,
};
use crate::engine::snapshot::SnapshotCodec;
use crate::engine::store::{EventRecord, SnapshotRecord, Store};

/// Coordinates reducer execution and effect handling backed by a durable
/// store. Holds no mutable state of its own: multiple runners over the same
/// store are valid as long as per-run cycles stay serialized.
pub struct Runner<S: RunState> {
    store: Arc<dyn Store>,
    reducer: Arc<dyn Reducer<S>>,
    handlers: Vec<Arc<dyn EffectHandler<S>>>,
    new_state: StateFactory<S>,
    snapshot_codec: Option<Arc<dyn SnapshotCodec<S>>>,
    snapshot_interval: Seq,
}

impl<S: RunState> Runner<S> {
    pub fn new(
        store: Arc<dyn Store>,
        reducer: Arc<dyn Reducer<S>>,
        handlers: Vec<Arc<dyn EffectHandler<S>>>,
        new_state: StateFactory<S>,
    ) -> Self {
        Self {
            store,
            reducer,
            handlers,
            new_state,
            snapshot_codec: None,
            snapshot_interval: 0,
        }
    }

    /// Enables snapshotting with the given codec every `interval` events.
    /// Disabled when `interval <= 0`.
    pub fn with_snapshot(mut self, codec: Arc<dyn SnapshotCodec<S>>, interval: Seq) -> Self {
        if interval > 0 {
            self.snapshot_codec = Some(codec);
            self.snapshot_interval = interval;
        }
        self
    }

    /// Runs one cycle for `run_id` and returns the resulting state.
    ///
    /// The append of the incoming event is the commit point: after it, the
    /// event is part of the run whether or not its intents succeed. Handler
    /// events arriving without an id get a synthesized one, the same way
    /// incoming events do. Claim and completion marker events are appended
    /// but not folded live; they pass through the reducer only during replay,
    /// where reducers treat unknown kinds as no-ops.
    #[tracing::instrument(
        level = "info",
        skip(self, incoming),
        fields(event_id = %incoming.id, kind = %incoming.kind)
    )]
    pub async fn handle_event(&self, run_id: &str, incoming: Event) -> Result<S, EngineError> {
        if run_id.is_empty() {
            return Err(EngineError::validation("missing_run", "run id is empty"));
        }
        let mut incoming = incoming;
        if incoming.id.is_empty() {
            incoming.id = synthesized_event_id(run_id, Utc::now());
        }

        // Rebuild state by replaying from the latest snapshot + subsequent events.
        let (mut current, _upto) = self.replay_state(run_id).await?;

        // Duplicate delivery: the event has already been applied and all its
        // effects have already been processed.
        if self.store.get_event_by_id(&incoming.id).await?.is_some() {
            tracing::debug!(event_id = %incoming.id, "duplicate delivery, skipping");
            return Ok(current);
        }

        // A reducer error surfaces directly, before any store mutation.
        let transition = self.reducer.reduce(&current, &incoming)?;
        current = transition.state;
        let intents = transition.intents;

        // Commit point.
        self.store
            .append_event(EventRecord::from_event(run_id, &incoming))
            .await?;

        for intent in &intents {
            let Some(handler) = self.handlers.iter().find(|h| h.can_handle(intent)) else {
                tracing::debug!(intent = %intent.name, "no handler for intent, dropping");
                continue;
            };

            // Claim protocol: for keyed intents, unique-id insertion of the
            // claim event gates the handler. If the claim already exists,
            // another cycle has handled (or crashed while handling) this key;
            // re-execution would break at-most-once.
            if let Some(key) = &intent.idempotency_key {
                let claim_id = claim_event_id(run_id, key);
                if self.store.get_event_by_id(&claim_id).await?.is_some() {
                    tracing::debug!(intent = %intent.name, key, "intent already claimed, skipping");
                    continue;
                }
                let claim = Event::new(INTENT_CLAIMED)
                    .with_id(claim_id)
                    .with_payload(json!({"key": key, "name": intent.name}));
                self.store
                    .append_event(EventRecord::from_event(run_id, &claim))
                    .await?;
            }

            let events = handler.handle(&current, intent).await.map_err(|e| {
                EngineError::system("effect_error", "effect handler failed")
                    .with_context("intent", intent.name.as_str())
                    .with_cause(e)
            })?;

            for ev in events {
                let mut ev = ev;
                if ev.id.is_empty() {
                    ev.id = synthesized_event_id(run_id, Utc::now());
                }
                self.store
                    .append_event(EventRecord::from_event(run_id, &ev))
                    .await?;
                // Fold the effect event; intents emitted here are discarded.
                // Handlers chain effects through their returned events.
                current = self.reducer.reduce(&current, &ev)?.state;
            }

            if let Some(key) = &intent.idempotency_key {
                let marker = Event::new(INTENT_PROCESSED)
                    .with_id(marker_event_id(run_id, key))
                    .with_payload(json!({"key": key, "name": intent.name}));
                self.store
                    .append_event(EventRecord::from_event(run_id, &marker))
                    .await?;
            }
        }

        // Snapshot every N events when enabled. Save failures surface: an
        // undiscovered snapshot write failure defeats recovery guarantees.
        if let Some(codec) = &self.snapshot_codec {
            let seq = self.store.last_seq(run_id).await?;
            if seq > 0 && seq % self.snapshot_interval == 0 {
                let state = codec.encode(&current)?;
                self.store
                    .save_snapshot(SnapshotRecord {
                        snapshot_id: snapshot_id(run_id, seq),
                        run_id: run_id.to_string(),
                        upto_seq: seq,
                        state,
                        created_at: Utc::now(),
                    })
                    .await?;
            }
        }

        Ok(current)
    }

    /// Reconstructs state without appending anything: latest snapshot (when a
    /// codec is configured; otherwise only its `upto_seq` is honored), then
    /// events with `seq > upto` folded in ascending order. Intents produced
    /// during replay are discarded; prior cycles already honored them.
    pub async fn replay_state(&self, run_id: &str) -> Result<(S, Seq), EngineError> {
        let mut current = (self.new_state)(run_id);
        let mut upto: Seq = 0;
        if let Some(snap) = self.store.load_latest_snapshot(run_id).await? {
            if !snap.state.is_empty() {
                if let Some(codec) = &self.snapshot_codec {
                    current = codec.decode(run_id, &snap.state)?;
                }
                upto = snap.upto_seq;
            }
        }

        let events = self.store.list_events(run_id, upto, 0).await?;
        for record in events {
            let event = record.to_event();
            current = self.reducer.reduce(&current, &event)?.state;
            upto = record.seq;
        }
        Ok((current, upto))
    }

    /// Whether any configured handler routes this intent. Intents with no
    /// matching handler are dropped silently during a cycle.
    pub fn dispatchable(&self, intent: &Intent) -> bool {
        self.handlers.iter().any(|h| h.can_handle(intent))
    }
}

impl<S: RunState> std::fmt::Debug for Runner<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("handlers", &self.handlers.len())
            .field("snapshot_interval", &self.snapshot_interval)
            .finish()
    }
}
