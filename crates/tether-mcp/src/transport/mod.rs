//! MCP transport implementations.
//!
//! A transport moves raw JSON-RPC messages between the client and one server.
//! It knows nothing about ids or pending requests: inbound messages are handed
//! to the message handler as they arrive, and an unexpected end of the
//! connection is reported once through the close handler.

mod http;
mod stdio;

pub use http::{SleepFn, StreamableHttpTransport};
pub use stdio::{StderrSink, StdioTransport};

use crate::config::ServerConfig;
use crate::error::McpResult;
use crate::protocol::{methods, CancelledParams, JsonRpcNotification, RequestId};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Callback invoked once per inbound JSON-RPC message.
pub type MessageHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Callback invoked when the transport terminates without `close()`.
pub type CloseHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Transport trait for MCP communication.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Register the handler for inbound messages. Set before `start()`.
    fn set_message_handler(&self, handler: MessageHandler);

    /// Register the handler for unexpected termination.
    fn set_close_handler(&self, _handler: CloseHandler) {}

    /// Connect or spawn.
    async fn start(&self) -> McpResult<()>;

    /// Send one JSON-RPC message.
    async fn send_message(&self, message: &Value) -> McpResult<()>;

    /// The caller stopped waiting for `id`: drop any local work still in
    /// flight for it. Called for every abandoned request, `initialize` included.
    fn abandon_request(&self, _id: &RequestId) {}

    /// Tell the server to stop working on a request. Best effort.
    async fn cancel_request(&self, id: &RequestId, reason: &str) -> McpResult<()> {
        let params = CancelledParams {
            request_id: id.clone(),
            reason: Some(reason.to_string()),
        };
        let notification =
            JsonRpcNotification::new(methods::CANCELLED, Some(serde_json::to_value(params)?));
        self.send_message(&serde_json::to_value(notification)?).await
    }

    /// Called by the session layer after a successful handshake.
    async fn session_established(&self, _protocol_version: &str) -> McpResult<()> {
        Ok(())
    }

    /// Close the transport and release its resources. Idempotent.
    async fn close(&self) -> McpResult<()>;

    /// Check if the transport is connected.
    fn is_connected(&self) -> bool;
}

/// Build the transport for a server configuration.
pub fn from_config(config: &ServerConfig) -> McpResult<Arc<dyn Transport>> {
    match config {
        ServerConfig::Stdio(stdio) => Ok(Arc::new(StdioTransport::new(stdio.clone()))),
        ServerConfig::Http(http) => Ok(Arc::new(StreamableHttpTransport::new(http.clone())?)),
    }
}

/// Handler storage shared by the transports and their background tasks.
#[derive(Default)]
pub(crate) struct Handlers {
    message: Mutex<Option<MessageHandler>>,
    close: Mutex<Option<CloseHandler>>,
    close_fired: AtomicBool,
}

impl Handlers {
    pub(crate) fn set_message(&self, handler: MessageHandler) {
        if let Ok(mut slot) = self.message.lock() {
            *slot = Some(handler);
        }
    }

    pub(crate) fn set_close(&self, handler: CloseHandler) {
        if let Ok(mut slot) = self.close.lock() {
            *slot = Some(handler);
        }
    }

    /// Deliver one inbound message. The lock is released before the call.
    pub(crate) fn dispatch(&self, message: Value) {
        let handler = self.message.lock().ok().and_then(|slot| slot.clone());
        match handler {
            Some(handler) => handler(message),
            None => tracing::debug!("Dropping inbound message: no handler registered"),
        }
    }

    /// Report unexpected termination. Fires at most once.
    pub(crate) fn closed(&self, reason: String) {
        if self.close_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let handler = self.close.lock().ok().and_then(|slot| slot.clone());
        if let Some(handler) = handler {
            handler(reason);
        }
    }

    /// Suppress the close handler; used when `close()` was requested.
    pub(crate) fn suppress_close(&self) {
        self.close_fired.store(true, Ordering::SeqCst);
    }
}
