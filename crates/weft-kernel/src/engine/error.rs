//! Compact error model shared by every engine component.
//!
//! Errors form a closed taxonomy; sizes are bounded (message 512 chars,
//! context values 256 chars, single-level causes in practice) so they are
//! always safe to log and to ship in API envelopes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

const MAX_MESSAGE_LEN: usize = 512;
const MAX_CONTEXT_LEN: usize = 256;

/// Closed category set for compact errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Validation,
    Tool,
    Network,
    Model,
    Policy,
    System,
}

/// Compact error: category, short stable code, bounded message, small context,
/// shallow causes. The only sanctioned failure shape the engine produces.
#[derive(Clone, Debug, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct EngineError {
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<EngineError>,
}

impl EngineError {
    pub fn new(
        category: ErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: truncate(&message.into(), MAX_MESSAGE_LEN),
            context: BTreeMap::new(),
            causes: Vec::new(),
        }
    }

    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, code, message)
    }

    pub fn tool(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Tool, code, message)
    }

    pub fn network(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Network, code, message)
    }

    pub fn model(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Model, code, message)
    }

    pub fn policy(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Policy, code, message)
    }

    pub fn system(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::System, code, message)
    }

    /// Wraps a foreign error into `system/internal` at the nearest boundary.
    pub fn wrap(err: impl std::fmt::Display) -> Self {
        Self::system("internal", err.to_string())
    }

    /// Attaches a context entry. String values are trimmed to 256 chars;
    /// anything else is serialized to JSON and the result trimmed.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let rendered = match value.into() {
            Value::String(s) => s,
            other => serde_json::to_string(&other).unwrap_or_default(),
        };
        self.context
            .insert(key.into(), truncate(&rendered, MAX_CONTEXT_LEN));
        self
    }

    /// Attaches a nested cause. Causes keep their own category/code and their
    /// own truncation; chains stay shallow by convention.
    pub fn with_cause(mut self, cause: EngineError) -> Self {
        self.causes.push(cause);
        self
    }

    /// Maps category (and a few special codes) to an HTTP status.
    pub fn http_status(&self) -> u16 {
        match self.category {
            ErrorCategory::Validation => match self.code.as_str() {
                "not_found" => 404,
                "conflict" => 409,
                _ => 400,
            },
            ErrorCategory::Policy => match self.code.as_str() {
                "unauthorized" => 401,
                "method_not_allowed" => 405,
                _ => 403,
            },
            ErrorCategory::Network | ErrorCategory::Tool | ErrorCategory::Model => 502,
            ErrorCategory::System => 500,
        }
    }

    /// Renders the HTTP envelope `{ error: <compact>, trace_id? }`.
    pub fn envelope(&self, trace_id: Option<&str>) -> Value {
        let mut out = serde_json::Map::new();
        out.insert(
            "error".to_string(),
            serde_json::to_value(self).unwrap_or(Value::Null),
        );
        if let Some(id) = trace_id {
            out.insert("trace_id".to_string(), Value::String(id.to_string()));
        }
        Value::Object(out)
    }
}

/// Trims a string to `max` characters, ellipsized, respecting char boundaries.
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    if max <= 3 {
        return s.chars().take(max).collect();
    }
    let mut out: String = s.chars().take(max - 3).collect();
    out.push_str("...");
    out
}
