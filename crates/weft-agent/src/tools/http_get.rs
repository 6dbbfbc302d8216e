//! HTTP GET tool.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use weft_kernel::{EngineError, JsonMap};

use crate::tool::{SideEffect, Tool, ToolDescriptor, ToolPermission};

const DEFAULT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MAX_BYTES: u64 = 262_144;

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct HttpGetArgs {
    url: String,
    /// Request timeout in milliseconds.
    #[serde(default)]
    timeout_ms: Option<u64>,
    /// Maximum response body size in bytes; larger responses are refused.
    #[serde(default)]
    max_bytes: Option<u64>,
}

/// Performs an HTTP GET request. Requires `network:outbound`.
///
/// The body is streamed and the request is aborted once it exceeds the byte
/// cap, so a hostile or misconfigured endpoint cannot balloon memory.
pub struct HttpGetTool {
    client: reqwest::Client,
}

impl HttpGetTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpGetTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for HttpGetTool {
    fn describe(&self) -> ToolDescriptor {
        let input = schemars::schema_for!(HttpGetArgs);
        ToolDescriptor {
            name: "http.get".to_string(),
            description: "Performs an HTTP GET request".to_string(),
            input_schema: serde_json::to_vec(&input).unwrap_or_default(),
            output_schema: br#"{
                "type": "object",
                "properties": {"status": {"type": "integer"}, "body": {"type": "string"}},
                "required": ["status", "body"],
                "additionalProperties": false
            }"#
            .to_vec(),
            permissions: vec![ToolPermission::new("network:outbound")],
            side_effects: vec![SideEffect::Network],
        }
    }

    async fn invoke(&self, args: &JsonMap) -> Result<JsonMap, EngineError> {
        let args: HttpGetArgs = serde_json::from_value(Value::Object(args.clone()))
            .map_err(|e| EngineError::validation("invalid_input", e.to_string()))?;
        let timeout =
            std::time::Duration::from_millis(args.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS));
        let max_bytes = args.max_bytes.unwrap_or(DEFAULT_MAX_BYTES) as usize;

        let mut response = self
            .client
            .get(&args.url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                EngineError::network("request_failed", e.to_string())
                    .with_context("url", args.url.as_str())
            })?;
        let status = response.status().as_u16();

        let mut body = Vec::new();
        loop {
            let chunk = response.chunk().await.map_err(|e| {
                EngineError::network("read_failed", e.to_string())
                    .with_context("url", args.url.as_str())
            })?;
            let Some(chunk) = chunk else { break };
            if body.len() + chunk.len() > max_bytes {
                return Err(EngineError::tool(
                    "payload_too_large",
                    "response body exceeds the byte cap",
                )
                .with_context("url", args.url.as_str())
                .with_context("max_bytes", max_bytes as i64));
            }
            body.extend_from_slice(&chunk);
        }

        let mut out = JsonMap::new();
        out.insert("status".to_string(), json!(status));
        out.insert(
            "body".to_string(),
            json!(String::from_utf8_lossy(&body).into_owned()),
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{compile_schema, validate_schema};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// One-shot HTTP peer serving `body_len` bytes of `x`.
    async fn serve_body(body_len: usize) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut request = [0u8; 1024];
                let _ = socket.read(&mut request).await;
                let head = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {body_len}\r\nconnection: close\r\n\r\n"
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(&vec![b'x'; body_len]).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}/")
    }

    #[test]
    fn descriptor_schemas_compile() {
        let d = HttpGetTool::new().describe();
        assert_eq!(d.name, "http.get");
        compile_schema(&d.input_schema).unwrap();
        compile_schema(&d.output_schema).unwrap();
        assert_eq!(d.permissions[0].name, "network:outbound");
        assert_eq!(d.side_effects, vec![SideEffect::Network]);
    }

    #[test]
    fn input_schema_requires_url_and_rejects_extras() {
        let d = HttpGetTool::new().describe();
        validate_schema(&d.input_schema, &json!({"url": "https://example.com"})).unwrap();
        validate_schema(
            &d.input_schema,
            &json!({"url": "https://example.com", "max_bytes": 1024}),
        )
        .unwrap();
        assert!(validate_schema(&d.input_schema, &json!({})).is_err());
        assert!(
            validate_schema(&d.input_schema, &json!({"url": "x", "verb": "POST"})).is_err()
        );
    }

    #[tokio::test]
    async fn reads_body_and_reports_status() {
        let url = serve_body(64).await;
        let tool = HttpGetTool::new();
        let mut args = JsonMap::new();
        args.insert("url".to_string(), json!(url));
        let out = tool.invoke(&args).await.unwrap();
        assert_eq!(out["status"], 200);
        assert_eq!(out["body"].as_str().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn oversized_body_is_refused() {
        let url = serve_body(4096).await;
        let tool = HttpGetTool::new();
        let mut args = JsonMap::new();
        args.insert("url".to_string(), json!(url));
        args.insert("max_bytes".to_string(), json!(1024));
        let err = tool.invoke(&args).await.unwrap_err();
        assert_eq!(err.code, "payload_too_large");
        assert_eq!(err.category, weft_kernel::ErrorCategory::Tool);
        assert_eq!(err.context["max_bytes"], "1024");
    }

    #[tokio::test]
    async fn unreachable_url_maps_to_network_error() {
        let tool = HttpGetTool::new();
        let mut args = JsonMap::new();
        args.insert("url".to_string(), json!("http://127.0.0.1:1/nothing"));
        args.insert("timeout_ms".to_string(), json!(200));
        let err = tool.invoke(&args).await.unwrap_err();
        assert_eq!(err.code, "request_failed");
        assert_eq!(err.http_status(), 502);
    }
}
