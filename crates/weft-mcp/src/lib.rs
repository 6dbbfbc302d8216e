//! Weft remote tool bridge.
//!
//! Speaks JSON-RPC 2.0 with Model Context Protocol framing over a
//! bidirectional transport. Server mode publishes registered tools and
//! funnels every `tools/call` through the same safe-invoke path local tools
//! use; client mode consumes a peer's tools and maps them back into the local
//! `(map, error)` shape. The bridge is thin by design: no parallel validation
//! path exists on either side.

pub mod client;
pub mod protocol;
pub mod server;
pub mod transport;

pub use client::{McpClient, RemoteTool};
pub use protocol::{
    CallToolParams, CallToolResult, ContentBlock, Implementation, InitializeParams,
    InitializeResult, JsonRpcError, JsonRpcId, JsonRpcMessage, JsonRpcNotification,
    JsonRpcPayload, JsonRpcRequest, JsonRpcResponse, ListResourcesResult, ListToolsResult,
    ReadResourceParams, ReadResourceResult, ResourceContents, ResourceInfo, ToolInfo,
    PROTOCOL_VERSION,
};
pub use server::McpServer;
pub use transport::{connect, in_memory_pair, HttpTransport, StdioTransport, StreamTransport, Transport};
