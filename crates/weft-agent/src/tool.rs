//! Tool contracts: static descriptors with schema-validated inputs/outputs
//! and a declared permission model.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use weft_kernel::{EngineError, JsonMap};

/// A capability a tool requires, e.g. `network:outbound`, `fs:read`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPermission {
    /// Stable lower_snake identifier of the permission.
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl ToolPermission {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Side-effect categories a tool may declare. A tool that declares one must
/// honor it semantically; a caller that does not grant the matching
/// permission is refused before the effect can occur.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SideEffect {
    Network,
    Filesystem,
    Process,
    Model,
    Database,
    Cache,
    Secret,
}

/// Static interface of a tool. Schemas are JSON-Schema draft 2020-12 bytes;
/// an empty schema validates anything.
#[derive(Clone, Debug, Default)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Vec<u8>,
    pub output_schema: Vec<u8>,
    pub permissions: Vec<ToolPermission>,
    pub side_effects: Vec<SideEffect>,
}

/// A callable unit with schema-validated inputs and outputs.
///
/// Callers never invoke a tool directly; they go through
/// [`crate::registry::safe_invoke`], which enforces permissions and schemas
/// around [`Tool::invoke`].
#[async_trait]
pub trait Tool: Send + Sync {
    /// The public descriptor (schemas, permissions, side effects).
    fn describe(&self) -> ToolDescriptor;

    /// Executes the tool. Args have already been validated against the input
    /// schema; the returned map must conform to the output schema.
    async fn invoke(&self, args: &JsonMap) -> Result<JsonMap, EngineError>;
}
