//! Server mode: publish registered tools over a JSON-RPC session.
//!
//! `tools/call` is implemented by funneling through the safe-invoke path with
//! the server's configured permission allow-set — a remote caller cannot
//! bypass a single step of the local safety path. Compact errors from that
//! path come back as tool results with `isError: true`; only transport and
//! protocol problems use the JSON-RPC `error` member.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use weft_agent::{safe_invoke, ToolRegistry, ValidateFn};
use weft_kernel::{EngineError, JsonMap};

use crate::protocol::{
    methods, CallToolParams, CallToolResult, ContentBlock, Implementation, InitializeResult,
    JsonRpcError, JsonRpcMessage, JsonRpcResponse, ListResourcesResult, ListToolsResult,
    ReadResourceParams, ReadResourceResult, ResourceContents, ResourceInfo, ToolInfo,
    PROTOCOL_VERSION,
};

struct ServedResource {
    info: ResourceInfo,
    text: String,
}

/// Publishes every tool of a registry as MCP methods over a connection.
pub struct McpServer {
    registry: Arc<ToolRegistry>,
    allowed: HashSet<String>,
    validate: ValidateFn,
    info: Implementation,
    resources: Vec<ServedResource>,
}

impl McpServer {
    pub fn new(registry: Arc<ToolRegistry>, allowed: HashSet<String>) -> Self {
        Self {
            registry,
            allowed,
            validate: weft_agent::validate_schema,
            info: Implementation {
                name: "weft".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            resources: Vec::new(),
        }
    }

    pub fn with_validator(mut self, validate: ValidateFn) -> Self {
        self.validate = validate;
        self
    }

    /// Adds a static text resource served via `resources/list` / `resources/read`.
    pub fn with_resource(
        mut self,
        uri: impl Into<String>,
        description: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let uri = uri.into();
        self.resources.push(ServedResource {
            info: ResourceInfo {
                uri: uri.clone(),
                name: uri,
                description: description.into(),
            },
            text: text.into(),
        });
        self
    }

    /// Serves one session over a bidirectional stream until EOF.
    pub async fn serve_connection<S>(&self, stream: S) -> Result<(), EngineError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        loop {
            line.clear();
            let read = reader
                .read_line(&mut line)
                .await
                .map_err(|e| EngineError::network("transport_error", e.to_string()))?;
            if read == 0 {
                return Ok(());
            }
            if line.trim().is_empty() {
                continue;
            }
            let message = match serde_json::from_str::<JsonRpcMessage>(&line) {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!(error = %e, raw = %line.trim(), "unparseable frame");
                    continue;
                }
            };
            let request = match message {
                JsonRpcMessage::Request(request) => request,
                // Notifications (e.g. notifications/initialized) need no reply.
                JsonRpcMessage::Notification(_) | JsonRpcMessage::Response(_) => continue,
            };

            let response = match self.dispatch(&request.method, request.params).await {
                Ok(result) => JsonRpcResponse::success(request.id, result),
                Err(error) => JsonRpcResponse::error(request.id, error),
            };
            let out = format!(
                "{}\n",
                serde_json::to_string(&response).map_err(EngineError::wrap)?
            );
            write_half
                .write_all(out.as_bytes())
                .await
                .map_err(|e| EngineError::network("transport_error", e.to_string()))?;
            write_half
                .flush()
                .await
                .map_err(|e| EngineError::network("transport_error", e.to_string()))?;
        }
    }

    async fn dispatch(&self, method: &str, params: Option<Value>) -> Result<Value, JsonRpcError> {
        match method {
            methods::INITIALIZE => to_result(&InitializeResult {
                protocol_version: PROTOCOL_VERSION.to_string(),
                server_info: self.info.clone(),
                capabilities: json!({"tools": {}, "resources": {}}),
            }),
            methods::TOOLS_LIST => {
                let mut tools = Vec::new();
                self.registry.for_each(|_, tool| {
                    let descriptor = tool.describe();
                    tools.push(ToolInfo {
                        name: descriptor.name,
                        description: descriptor.description,
                        input_schema: parse_schema(&descriptor.input_schema),
                        output_schema: if descriptor.output_schema.is_empty() {
                            None
                        } else {
                            Some(parse_schema(&descriptor.output_schema))
                        },
                    });
                });
                tools.sort_by(|a, b| a.name.cmp(&b.name));
                to_result(&ListToolsResult { tools })
            }
            methods::TOOLS_CALL => {
                let params: CallToolParams = parse_params(params)?;
                let args: JsonMap = match params.arguments {
                    Some(Value::Object(map)) => map,
                    Some(_) => {
                        return Err(JsonRpcError::invalid_params("arguments must be an object"))
                    }
                    None => JsonMap::new(),
                };
                let tool = self.registry.resolve(&params.name);
                let outcome =
                    safe_invoke(tool.as_deref(), &args, &self.allowed, self.validate).await;
                to_result(&match outcome {
                    Ok(output) => CallToolResult {
                        structured_content: Some(Value::Object(output)),
                        ..CallToolResult::default()
                    },
                    // Safety-path refusals are tool-level results, never
                    // JSON-RPC errors: the caller must be able to tell them
                    // apart from transport failures.
                    Err(err) => CallToolResult {
                        content: vec![ContentBlock::text(
                            serde_json::to_string(&err).unwrap_or_else(|_| err.to_string()),
                        )],
                        is_error: Some(true),
                        ..CallToolResult::default()
                    },
                })
            }
            methods::RESOURCES_LIST => to_result(&ListResourcesResult {
                resources: self.resources.iter().map(|r| r.info.clone()).collect(),
            }),
            methods::RESOURCES_READ => {
                let params: ReadResourceParams = parse_params(params)?;
                let resource = self
                    .resources
                    .iter()
                    .find(|r| r.info.uri == params.uri)
                    .ok_or_else(|| {
                        JsonRpcError::invalid_params(format!("unknown resource: {}", params.uri))
                    })?;
                to_result(&ReadResourceResult {
                    contents: vec![ResourceContents {
                        uri: resource.info.uri.clone(),
                        mime_type: Some("text/plain".to_string()),
                        text: Some(resource.text.clone()),
                    }],
                })
            }
            other => Err(JsonRpcError::method_not_found(other)),
        }
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, JsonRpcError> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| JsonRpcError::invalid_params(e.to_string()))
}

fn parse_schema(schema: &[u8]) -> Value {
    if schema.is_empty() {
        return json!({});
    }
    serde_json::from_slice(schema).unwrap_or_else(|_| json!({}))
}

fn to_result(value: &impl serde::Serialize) -> Result<Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|e| JsonRpcError::internal(e.to_string()))
}
