//! Weft agent surface: schema-validated tools behind a uniform safety path.
//!
//! Every tool call, local or remote, flows through [`safe_invoke`]:
//! permission check, input validation, invocation, output validation, in that
//! order, short-circuiting on the first failure.

pub mod registry;
pub mod schema;
pub mod tool;
pub mod tool_effect;
pub mod tools;

pub use registry::{global, safe_invoke, ToolRegistry};
pub use schema::{compile_schema, validate_schema, ValidateFn};
pub use tool::{SideEffect, Tool, ToolDescriptor, ToolPermission};
pub use tool_effect::ToolEffectHandler;
pub use tools::{FileReadTool, HttpGetTool};
