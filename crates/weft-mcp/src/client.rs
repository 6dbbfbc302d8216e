//! Client mode: consume a peer's tools through the local tool contracts.
//!
//! Every response is mapped back into the `(map, error)` shape local tools
//! return. Tool-reported failures (`isError: true`) become compact errors of
//! category `tool` with code `remote_error`; transport failures stay
//! `network`. [`RemoteTool`] adapts a listed remote tool to the local `Tool`
//! trait so callers funnel it through the same safe-invoke path.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use weft_agent::{SideEffect, Tool, ToolDescriptor};
use weft_kernel::{EngineError, JsonMap};

use crate::protocol::{
    methods, CallToolParams, CallToolResult, Implementation, InitializeParams, InitializeResult,
    ListResourcesResult, ListToolsResult, ReadResourceParams, ReadResourceResult, ResourceInfo,
    PROTOCOL_VERSION,
};
use crate::transport::Transport;

pub struct McpClient {
    transport: Arc<dyn Transport>,
    server_info: Implementation,
}

impl McpClient {
    /// Performs the initialize handshake and announces readiness.
    pub async fn connect(transport: Arc<dyn Transport>) -> Result<Self, EngineError> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            client_info: Implementation {
                name: "weft-mcp-client".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            capabilities: json!({}),
        };
        let result = transport
            .request(
                methods::INITIALIZE,
                Some(serde_json::to_value(&params).map_err(EngineError::wrap)?),
            )
            .await?;
        let init: InitializeResult = decode(result)?;
        transport
            .notify(methods::INITIALIZED, Some(json!({})))
            .await?;
        Ok(Self {
            transport,
            server_info: init.server_info,
        })
    }

    pub fn server_info(&self) -> &Implementation {
        &self.server_info
    }

    /// Lists the peer's tools as local descriptors. Remote descriptors carry
    /// no permission claims; the peer enforces its own allow-set.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, EngineError> {
        let result = self.transport.request(methods::TOOLS_LIST, None).await?;
        let listing: ListToolsResult = decode(result)?;
        Ok(listing
            .tools
            .into_iter()
            .map(|info| ToolDescriptor {
                name: info.name,
                description: info.description,
                input_schema: serde_json::to_vec(&info.input_schema).unwrap_or_default(),
                output_schema: info
                    .output_schema
                    .map(|s| serde_json::to_vec(&s).unwrap_or_default())
                    .unwrap_or_default(),
                permissions: Vec::new(),
                side_effects: vec![SideEffect::Network],
            })
            .collect())
    }

    /// Calls a remote tool, mapping the far-side response into the local
    /// `(map, error)` shape.
    pub async fn call_tool(&self, name: &str, args: &JsonMap) -> Result<JsonMap, EngineError> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments: Some(Value::Object(args.clone())),
        };
        let result = self
            .transport
            .request(
                methods::TOOLS_CALL,
                Some(serde_json::to_value(&params).map_err(EngineError::wrap)?),
            )
            .await?;
        let call: CallToolResult = decode(result)?;

        if call.is_error == Some(true) {
            let remote_message = call
                .content
                .iter()
                .filter_map(|c| c.as_text())
                .collect::<Vec<_>>()
                .join("\n");
            return Err(
                EngineError::tool("remote_error", "remote tool reported an error")
                    .with_context("tool", name)
                    .with_context(
                        "remote_message",
                        if remote_message.is_empty() {
                            "unknown error".to_string()
                        } else {
                            remote_message
                        },
                    ),
            );
        }

        match call.structured_content {
            Some(Value::Object(map)) => Ok(map),
            _ => Ok(JsonMap::new()),
        }
    }

    pub async fn list_resources(&self) -> Result<Vec<ResourceInfo>, EngineError> {
        let result = self
            .transport
            .request(methods::RESOURCES_LIST, None)
            .await?;
        let listing: ListResourcesResult = decode(result)?;
        Ok(listing.resources)
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, EngineError> {
        let params = ReadResourceParams {
            uri: uri.to_string(),
        };
        let result = self
            .transport
            .request(
                methods::RESOURCES_READ,
                Some(serde_json::to_value(&params).map_err(EngineError::wrap)?),
            )
            .await?;
        decode(result)
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, EngineError> {
    serde_json::from_value(value)
        .map_err(|e| EngineError::network("protocol_error", e.to_string()))
}

/// A remote tool adapted to the local [`Tool`] trait, so consumers run it
/// through the same safe-invoke path as in-process tools.
pub struct RemoteTool {
    client: Arc<McpClient>,
    descriptor: ToolDescriptor,
}

impl RemoteTool {
    pub fn new(client: Arc<McpClient>, descriptor: ToolDescriptor) -> Self {
        Self { client, descriptor }
    }
}

#[async_trait]
impl Tool for RemoteTool {
    fn describe(&self) -> ToolDescriptor {
        self.descriptor.clone()
    }

    async fn invoke(&self, args: &JsonMap) -> Result<JsonMap, EngineError> {
        self.client.call_tool(&self.descriptor.name, args).await
    }
}
