//! In-memory transport for engine and session tests.

use crate::error::{McpError, McpResult};
use crate::protocol::{RequestId, LATEST_PROTOCOL_VERSION};
use crate::transport::{CloseHandler, MessageHandler, Transport};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Responder = Box<dyn FnMut(&Value) -> Vec<Value> + Send>;

/// Transport whose server side is a closure from sent message to replies.
pub(crate) struct ScriptedTransport {
    handler: Mutex<Option<MessageHandler>>,
    close_handler: Mutex<Option<CloseHandler>>,
    responder: Mutex<Responder>,
    sent: Mutex<Vec<Value>>,
    sessions: Mutex<Vec<String>>,
    /// Messages already sent at each `session_established`.
    sent_at_session: Mutex<Vec<usize>>,
    abandoned: Mutex<Vec<RequestId>>,
    start_calls: AtomicUsize,
    start_delay: Duration,
    start_error: Option<McpError>,
    closed: AtomicBool,
}

impl ScriptedTransport {
    pub(crate) fn new(responder: impl FnMut(&Value) -> Vec<Value> + Send + 'static) -> Self {
        Self {
            handler: Mutex::new(None),
            close_handler: Mutex::new(None),
            responder: Mutex::new(Box::new(responder)),
            sent: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
            sent_at_session: Mutex::new(Vec::new()),
            abandoned: Mutex::new(Vec::new()),
            start_calls: AtomicUsize::new(0),
            start_delay: Duration::ZERO,
            start_error: None,
            closed: AtomicBool::new(false),
        }
    }

    /// A server that never answers.
    pub(crate) fn silent() -> Self {
        Self::new(|_| Vec::new())
    }

    pub(crate) fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub(crate) fn with_start_error(mut self, error: McpError) -> Self {
        self.start_error = Some(error);
        self
    }

    /// Deliver a message as if the server sent it.
    pub(crate) fn inject(&self, message: Value) {
        let handler = self.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(message);
        }
    }

    /// Simulate the server going away.
    pub(crate) fn terminate(&self, reason: &str) {
        let handler = self.close_handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(reason.to_string());
        }
    }

    pub(crate) fn sent(&self) -> Vec<Value> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn sent_methods(&self) -> Vec<String> {
        self.sent()
            .iter()
            .filter_map(|m| m.get("method").and_then(Value::as_str).map(String::from))
            .collect()
    }

    pub(crate) fn sessions(&self) -> Vec<String> {
        self.sessions.lock().unwrap().clone()
    }

    pub(crate) fn sent_at_session(&self) -> Vec<usize> {
        self.sent_at_session.lock().unwrap().clone()
    }

    pub(crate) fn abandoned(&self) -> Vec<RequestId> {
        self.abandoned.lock().unwrap().clone()
    }

    pub(crate) fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn set_message_handler(&self, handler: MessageHandler) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    fn set_close_handler(&self, handler: CloseHandler) {
        *self.close_handler.lock().unwrap() = Some(handler);
    }

    async fn start(&self) -> McpResult<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        match &self.start_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn send_message(&self, message: &Value) -> McpResult<()> {
        if self.is_closed() {
            return Err(McpError::Closed);
        }
        self.sent.lock().unwrap().push(message.clone());
        let replies = (self.responder.lock().unwrap())(message);
        for reply in replies {
            self.inject(reply);
        }
        Ok(())
    }

    fn abandon_request(&self, id: &RequestId) {
        self.abandoned.lock().unwrap().push(id.clone());
    }

    async fn session_established(&self, protocol_version: &str) -> McpResult<()> {
        let sent = self.sent.lock().unwrap().len();
        self.sent_at_session.lock().unwrap().push(sent);
        self.sessions
            .lock()
            .unwrap()
            .push(protocol_version.to_string());
        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.is_closed()
    }
}

pub(crate) fn method(message: &Value) -> &str {
    message.get("method").and_then(Value::as_str).unwrap_or("")
}

/// A success response to `request`.
pub(crate) fn reply(request: &Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": request["id"], "result": result})
}

/// An error response to `request`.
pub(crate) fn reply_error(request: &Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": request["id"], "error": {"code": code, "message": message}})
}

/// The `initialize` result of a well-behaved server.
pub(crate) fn initialize_result(version: &str) -> Value {
    json!({
        "protocolVersion": version,
        "capabilities": {"tools": {"listChanged": true}},
        "serverInfo": {"name": "scripted", "version": "1.0.0"},
        "instructions": "Use the tools."
    })
}

/// Replies for a server that speaks the latest version and answers
/// `tools/list`, `tools/call` and `ping`.
pub(crate) fn basic_server(message: &Value) -> Vec<Value> {
    if message.get("id").is_none() {
        return Vec::new();
    }
    let result = match method(message) {
        "initialize" => initialize_result(LATEST_PROTOCOL_VERSION),
        "tools/list" => json!({"tools": [{"name": "echo", "inputSchema": {"type": "object"}}]}),
        "tools/call" => json!({
            "content": [{"type": "text", "text": message["params"]["arguments"]["text"]}],
            "isError": false
        }),
        _ => json!({}),
    };
    vec![reply(message, result)]
}
