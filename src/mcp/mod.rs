//! MCP (Model Context Protocol) wire layer.
//!
//! JSON-RPC framing types plus the conversion of tool outcomes into MCP
//! content blocks. Session logic lives in [`crate::session`].

pub mod content;
pub mod protocol;

pub use content::{tool_result, CallToolResult, ToolContent};
pub use protocol::{
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ServerInfo, DEFAULT_PROTOCOL_VERSION,
};
