//! Model Context Protocol (MCP) client.
//!
//! Connects to an MCP server, negotiates a session, and lists and invokes
//! the tools it exposes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌───────────────┐     ┌─────────────┐     ┌────────────┐
//! │  McpClient  │────▶│ JsonRpcClient │────▶│  Transport  │────▶│ MCP server │
//! │  (session)  │◀────│ (ids/pending) │◀────│ stdio|http  │◀────│  (tools)   │
//! └─────────────┘     └───────────────┘     └─────────────┘     └────────────┘
//! ```
//!
//! # Supported Transports
//!
//! - **stdio**: local servers as child processes, newline-delimited JSON
//! - **streamable HTTP**: remote servers via POST with JSON or SSE responses
//!
//! # Example
//!
//! ```no_run
//! use tether_mcp::{ClientOptions, McpClient, ServerConfig};
//!
//! # async fn example() -> tether_mcp::McpResult<()> {
//! let config = ServerConfig::stdio(
//!     "npx",
//!     ["-y", "@modelcontextprotocol/server-filesystem", "."],
//! );
//! let client = McpClient::connect(&config, ClientOptions::default()).await?;
//!
//! let page = client.list_tools(None).await?;
//! for tool in &page.tools {
//!     println!("{}", tool.name);
//! }
//!
//! let result = client
//!     .call_tool("read_file", serde_json::json!({"path": "README.md"}), None)
//!     .await?;
//! println!("{}", result.text());
//!
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

mod client;
pub mod config;
mod error;
pub mod jsonrpc;
pub mod protocol;
pub mod sse;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use client::{ClientOptions, McpClient};
pub use config::{HttpConfig, ServerConfig, ServersFile, StdioConfig};
pub use error::{codes, McpError, McpResult};
pub use jsonrpc::{JsonRpcClient, Lifecycle, NotificationHandler};
pub use protocol::{
    Implementation, InitializeResult, ListToolsResult, McpTool, ServerCapabilities,
    ToolCallResult, ToolContent,
};
pub use sse::{SseEvent, SseParser};
pub use transport::{StdioTransport, StreamableHttpTransport, Transport};
