//! Sandboxed file-read tool.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;

use weft_kernel::{EngineError, JsonMap};

use crate::tool::{SideEffect, Tool, ToolDescriptor, ToolPermission};

const DEFAULT_MAX_BYTES: usize = 262_144;

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct FileReadArgs {
    /// Path relative to the sandbox root.
    path: String,
}

/// Reads a text file from a sandbox root. Requires `fs:read`.
///
/// At most the configured byte cap is read; longer files come back cut at
/// the cap with `truncated: true`.
pub struct FileReadTool {
    root: PathBuf,
    max_bytes: usize,
}

impl FileReadTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }
}

/// Relative, normalized, no parent traversal.
fn is_sandboxed(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path.is_relative()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

#[async_trait]
impl Tool for FileReadTool {
    fn describe(&self) -> ToolDescriptor {
        let input = schemars::schema_for!(FileReadArgs);
        ToolDescriptor {
            name: "fs.read".to_string(),
            description: "Reads a text file from the sandbox root".to_string(),
            input_schema: serde_json::to_vec(&input).unwrap_or_default(),
            output_schema: br#"{
                "type": "object",
                "properties": {
                    "content": {"type": "string"},
                    "truncated": {"type": "boolean"}
                },
                "required": ["content", "truncated"],
                "additionalProperties": false
            }"#
            .to_vec(),
            permissions: vec![ToolPermission::new("fs:read")],
            side_effects: vec![SideEffect::Filesystem],
        }
    }

    async fn invoke(&self, args: &JsonMap) -> Result<JsonMap, EngineError> {
        let args: FileReadArgs = serde_json::from_value(Value::Object(args.clone()))
            .map_err(|e| EngineError::validation("invalid_input", e.to_string()))?;
        let relative = Path::new(&args.path);
        if !is_sandboxed(relative) {
            return Err(
                EngineError::validation("invalid_input", "path escapes the sandbox")
                    .with_context("path", args.path.as_str()),
            );
        }

        let file = tokio::fs::File::open(self.root.join(relative))
            .await
            .map_err(|e| {
                EngineError::tool("read_failed", e.to_string())
                    .with_context("path", args.path.as_str())
            })?;
        // Read one byte past the cap so truncation is detectable without
        // buffering the rest of the file.
        let mut buf = Vec::new();
        file.take(self.max_bytes as u64 + 1)
            .read_to_end(&mut buf)
            .await
            .map_err(|e| {
                EngineError::tool("read_failed", e.to_string())
                    .with_context("path", args.path.as_str())
            })?;
        let truncated = buf.len() > self.max_bytes;
        if truncated {
            buf.truncate(self.max_bytes);
        }

        let mut out = JsonMap::new();
        out.insert(
            "content".to_string(),
            json!(String::from_utf8_lossy(&buf).into_owned()),
        );
        out.insert("truncated".to_string(), json!(truncated));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{compile_schema, validate_schema};

    fn sandbox() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "weft-agent-fsread-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("note.txt"), "hello from the sandbox").unwrap();
        dir
    }

    #[test]
    fn descriptor_schemas_compile() {
        let d = FileReadTool::new("/tmp").describe();
        assert_eq!(d.name, "fs.read");
        compile_schema(&d.input_schema).unwrap();
        compile_schema(&d.output_schema).unwrap();
        assert_eq!(d.permissions[0].name, "fs:read");
    }

    #[tokio::test]
    async fn reads_file_inside_sandbox() {
        let tool = FileReadTool::new(sandbox());
        let mut args = JsonMap::new();
        args.insert("path".to_string(), json!("note.txt"));
        let out = tool.invoke(&args).await.unwrap();
        assert_eq!(out["content"], "hello from the sandbox");
        assert_eq!(out["truncated"], false);
        let d = tool.describe();
        validate_schema(&d.output_schema, &Value::Object(out)).unwrap();
    }

    #[tokio::test]
    async fn long_files_are_cut_at_the_cap_and_flagged() {
        let dir = sandbox();
        std::fs::write(dir.join("big.txt"), "a".repeat(100)).unwrap();
        let tool = FileReadTool::new(dir).with_max_bytes(16);
        let mut args = JsonMap::new();
        args.insert("path".to_string(), json!("big.txt"));
        let out = tool.invoke(&args).await.unwrap();
        assert_eq!(out["content"], "a".repeat(16));
        assert_eq!(out["truncated"], true);
    }

    #[tokio::test]
    async fn rejects_traversal_and_absolute_paths() {
        let tool = FileReadTool::new(sandbox());
        for bad in ["../etc/passwd", "/etc/passwd", "a/../../b", ""] {
            let mut args = JsonMap::new();
            args.insert("path".to_string(), json!(bad));
            let err = tool.invoke(&args).await.unwrap_err();
            assert_eq!(err.code, "invalid_input", "path {bad:?} must be rejected");
        }
    }

    #[tokio::test]
    async fn missing_file_is_a_tool_error() {
        let tool = FileReadTool::new(sandbox());
        let mut args = JsonMap::new();
        args.insert("path".to_string(), json!("absent.txt"));
        let err = tool.invoke(&args).await.unwrap_err();
        assert_eq!(err.code, "read_failed");
        assert_eq!(err.category, weft_kernel::ErrorCategory::Tool);
    }
}
