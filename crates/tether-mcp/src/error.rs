//! MCP error types.

use crate::protocol::ErrorCode;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type for MCP operations.
pub type McpResult<T> = Result<T, McpError>;

/// Well-known JSON-RPC error codes.
///
/// The negative `-320xx` range is reserved by JSON-RPC for implementation
/// defined server errors. The HTTP transport synthesizes error responses with
/// these codes so that failures of a single POST reach the waiting request
/// through the normal response path.
pub mod codes {
    /// Standard JSON-RPC "method not found".
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Connection failure, unexpected HTTP status, or a response stream that
    /// ended before answering the request.
    pub const HTTP_TRANSPORT_ERROR: i64 = -32000;
    /// The server no longer knows the session id the client presented.
    pub const SESSION_NOT_FOUND: i64 = -32001;
    /// A JSON response body exceeded the configured size limit.
    pub const HTTP_BODY_TOO_LARGE: i64 = -32002;
    /// A single SSE event carried more data than the configured size limit.
    pub const SSE_EVENT_DATA_TOO_LARGE: i64 = -32003;
    /// An SSE event carried a `data` payload that is not valid JSON.
    pub const INVALID_SSE_DATA: i64 = -32004;
}

/// Errors that can occur during MCP operations.
///
/// Cloneable so that the outcome of a shared operation (for example a
/// `start()` that several tasks wait on) can be handed to every waiter.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    /// No response arrived before the deadline.
    #[error("Request '{method}' timed out after {}ms", timeout.as_millis())]
    Timeout { method: String, timeout: Duration },

    /// The client was closed before or during the operation.
    #[error("Client closed")]
    Closed,

    /// The transport failed: process exited, connection dropped, not started.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The server negotiated a protocol version we do not speak.
    #[error("Unsupported protocol version: {version} (supported: {})", supported.join(", "))]
    ProtocolVersionNotSupported {
        version: String,
        supported: Vec<String>,
    },

    /// The peer answered with a JSON-RPC error object.
    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc {
        code: ErrorCode,
        message: String,
        data: Option<Value>,
    },

    /// An SSE event exceeded the configured data limit.
    #[error("SSE event data exceeds {limit} bytes")]
    EventDataTooLarge { limit: usize },

    /// Too many bytes were buffered without a line terminator.
    #[error("SSE buffer exceeds {limit} bytes without a line break")]
    BufferTooLarge { limit: usize },

    /// Server configuration is invalid.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Protocol error (malformed or unexpected payload).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    /// HTTP error.
    #[error("HTTP error: {0}")]
    Http(Arc<reqwest::Error>),
}

impl McpError {
    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create a JSON-RPC error with a numeric code.
    pub fn json_rpc(code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self::JsonRpc {
            code: ErrorCode::Number(code),
            message: message.into(),
            data,
        }
    }

    /// The JSON-RPC error code, if this is a JSON-RPC error.
    pub fn code(&self) -> Option<&ErrorCode> {
        match self {
            Self::JsonRpc { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Whether the server reported that our session no longer exists.
    pub fn is_session_not_found(&self) -> bool {
        self.code()
            .is_some_and(|code| *code == ErrorCode::Number(codes::SESSION_NOT_FOUND))
    }

    /// Whether this error is a request timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<std::io::Error> for McpError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for McpError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(Arc::new(err))
    }
}

impl From<reqwest::Error> for McpError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(Arc::new(err))
    }
}
