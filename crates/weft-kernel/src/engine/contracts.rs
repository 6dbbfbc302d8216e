//! Core contracts for event-sourced agent execution.
//!
//! Events are the source of truth; all state is derived by reducing events.
//! Reducers are pure: no I/O, no clock, no randomness, no dependence on map
//! iteration order. Side effects are declared as intents and executed by
//! effect handlers, whose follow-up events land back in the log.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::error::EngineError;

/// JSON object shape used for intent args and tool inputs/outputs.
pub type JsonMap = serde_json::Map<String, Value>;

/// A single event in a run's append-only log.
///
/// Events are immutable once created, serializable to JSON, and unique by id
/// across the entire store. The payload structure depends on the kind.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    /// Stable external id, unique across the store. May be left empty by
    /// trusted in-process callers; the runner synthesizes one on delivery.
    pub id: String,
    /// Lowercase kind tag used for routing, e.g. `inc`, `tool_result`.
    #[serde(rename = "type")]
    pub kind: String,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// Event-specific data as a JSON value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Event {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            kind: kind.into(),
            timestamp: Utc::now(),
            payload: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// A declared side effect, emitted by a reducer and executed by a handler.
///
/// Intents are ephemeral: they are never persisted as rows and only manifest
/// in the log through their claim and completion marker events. Identity for
/// idempotency purposes lives entirely in `idempotency_key`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Intent {
    /// Routing key matched by [`EffectHandler::can_handle`].
    pub name: String,
    /// Parameters for executing this intent.
    #[serde(default)]
    pub args: JsonMap,
    /// When present, the engine executes the intent at most once per key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl Intent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: JsonMap::new(),
            idempotency_key: None,
        }
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

/// State owned by a run for the duration of a cycle.
///
/// The engine treats the concrete shape as opaque; it only needs the run id
/// and cheap cloning. Durability goes through a [`crate::engine::snapshot::SnapshotCodec`].
pub trait RunState: Clone + Send + Sync + 'static {
    fn run_id(&self) -> &str;
}

/// Result of one reduction: the next state plus the side effects it demands.
#[derive(Clone, Debug)]
pub struct Transition<S> {
    pub state: S,
    pub intents: Vec<Intent>,
}

impl<S> Transition<S> {
    /// A transition with no side effects.
    pub fn next(state: S) -> Self {
        Self {
            state,
            intents: Vec::new(),
        }
    }

    pub fn with_intents(state: S, intents: Vec<Intent>) -> Self {
        Self { state, intents }
    }
}

/// Pure state-transition function.
///
/// Given equal `(state, event)` it must return equal transitions. Unknown
/// event kinds (including the engine's claim and completion markers, which
/// flow through here during replay) must be treated as no-ops.
pub trait Reducer<S>: Send + Sync {
    fn reduce(&self, current: &S, event: &Event) -> Result<Transition<S>, EngineError>;
}

/// Executes one kind of side effect and reports the outcome as events.
///
/// Handlers run only inside a live cycle, never during replay: their returned
/// events are already in the log, so folding those is sufficient to
/// reconstruct their outcome. A handler that needs to chain further effects
/// must do so through its returned events, not by relying on intents the
/// reducer emits while folding handler output.
#[async_trait]
pub trait EffectHandler<S>: Send + Sync {
    /// Routing: whether this handler executes the given intent.
    fn can_handle(&self, intent: &Intent) -> bool;

    /// Executes the side effect and returns follow-up events.
    async fn handle(&self, state: &S, intent: &Intent) -> Result<Vec<Event>, EngineError>;
}

/// Creates the empty state for a run that has no snapshot and no events yet.
pub type StateFactory<S> = Box<dyn Fn(&str) -> S + Send + Sync>;
