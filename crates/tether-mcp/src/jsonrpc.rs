//! Transport-agnostic JSON-RPC 2.0 client.
//!
//! Assigns request ids, keeps a table of in-flight requests, and completes
//! each one exactly once: from a matching response, a timeout, a dropped
//! caller, or shutdown. All shared state sits behind one `std::sync::Mutex`
//! that is never held across an `.await`.

use crate::config::DEFAULT_REQUEST_TIMEOUT;
use crate::error::{codes, McpError, McpResult};
use crate::protocol::{
    classify, methods, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, MessageKind,
    RequestId, NOTIFICATION_PREFIX,
};
use crate::transport::Transport;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Callback for server notifications under `notifications/`.
pub type NotificationHandler = Arc<dyn Fn(JsonRpcNotification) + Send + Sync>;

/// Lifecycle of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    NotStarted,
    Starting,
    Started,
    Closed,
}

struct PendingRequest {
    method: String,
    tx: oneshot::Sender<McpResult<Value>>,
}

struct State {
    lifecycle: Lifecycle,
    next_id: u64,
    pending: HashMap<RequestId, PendingRequest>,
    /// Outcome of a failed `start()`, handed to every later caller.
    start_failure: Option<McpError>,
    /// Error for operations after shutdown.
    closed_with: Option<McpError>,
}

impl State {
    fn closed_error(&self) -> McpError {
        self.closed_with.clone().unwrap_or(McpError::Closed)
    }

    fn take_pending(&mut self, id: &RequestId) -> Option<PendingRequest> {
        if let Some(entry) = self.pending.remove(id) {
            return Some(entry);
        }
        let alternate = id.coerced()?;
        self.pending.remove(&alternate)
    }
}

struct Shared {
    state: Mutex<State>,
    transport: Arc<dyn Transport>,
    notification_handler: Mutex<Option<NotificationHandler>>,
    closed: CancellationToken,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark closed and fail every pending request. Returns false if already closed.
    fn shutdown(&self, reason: McpError) -> bool {
        let drained = {
            let mut state = self.lock();
            if state.lifecycle == Lifecycle::Closed && state.closed_with.is_some() {
                return false;
            }
            state.lifecycle = Lifecycle::Closed;
            state.closed_with = Some(reason.clone());
            std::mem::take(&mut state.pending)
        };
        self.closed.cancel();

        if !drained.is_empty() {
            debug!(count = drained.len(), reason = %reason, "Failing pending requests");
        }
        for (_, entry) in drained {
            let _ = entry.tx.send(Err(reason.clone()));
        }
        true
    }

    fn handle_message(self: &Arc<Self>, message: Value) {
        trace!(message = %message, "Inbound JSON-RPC message");
        match classify(&message) {
            MessageKind::Response => self.complete(message),
            MessageKind::Notification => self.dispatch_notification(message),
            MessageKind::Request => self.answer_request(message),
            MessageKind::Invalid => warn!("Dropping invalid JSON-RPC message"),
        }
    }

    fn complete(&self, message: Value) {
        let response: JsonRpcResponse = match serde_json::from_value(message) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Dropping malformed response");
                return;
            }
        };
        let Some(id) = RequestId::from_value(&response.id) else {
            debug!(id = %response.id, "Dropping response with unusable id");
            return;
        };

        let Some(entry) = self.lock().take_pending(&id) else {
            debug!(id = %id, "Dropping response for unknown request");
            return;
        };

        let outcome = match response.error {
            Some(error) => Err(McpError::JsonRpc {
                code: error.code,
                message: error.message,
                data: error.data,
            }),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        trace!(id = %id, method = %entry.method, ok = outcome.is_ok(), "Completing request");
        let _ = entry.tx.send(outcome);
    }

    fn dispatch_notification(&self, message: Value) {
        let notification: JsonRpcNotification = match serde_json::from_value(message) {
            Ok(notification) => notification,
            Err(e) => {
                warn!(error = %e, "Dropping malformed notification");
                return;
            }
        };
        if !notification.method.starts_with(NOTIFICATION_PREFIX) {
            debug!(method = %notification.method, "Ignoring non-MCP notification");
            return;
        }

        let handler = self
            .notification_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(handler) = handler else {
            return;
        };
        let method = notification.method.clone();
        if catch_unwind(AssertUnwindSafe(|| handler(notification))).is_err() {
            warn!(method = %method, "Notification handler panicked");
        }
    }

    /// Answer a server-initiated request: `ping` succeeds, anything else is unknown.
    fn answer_request(self: &Arc<Self>, message: Value) {
        let id = message.get("id").cloned().unwrap_or(Value::Null);
        let method = message
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let response = if method == methods::PING {
            JsonRpcResponse::success(id, json!({}))
        } else {
            debug!(method = %method, "Rejecting server request");
            JsonRpcResponse::failure(
                id,
                codes::METHOD_NOT_FOUND,
                format!("Method not found: {method}"),
            )
        };
        let reply = match serde_json::to_value(response) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "Failed to encode reply");
                return;
            }
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to send reply on");
            return;
        };
        let shared = self.clone();
        runtime.spawn(async move {
            if let Err(e) = shared.transport.send_message(&reply).await {
                warn!(error = %e, "Failed to answer server request");
            }
        });
    }
}

/// Removes a pending entry when the caller's future is dropped.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: RequestId,
    armed: bool,
}

impl<'a> PendingGuard<'a> {
    fn new(shared: &'a Shared, id: RequestId) -> Self {
        Self {
            shared,
            id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.shared.lock().pending.remove(&self.id).is_some() {
            self.shared.transport.abandon_request(&self.id);
        }
    }
}

/// JSON-RPC client over any [`Transport`].
pub struct JsonRpcClient {
    shared: Arc<Shared>,
    start_gate: tokio::sync::Mutex<()>,
    default_timeout: Duration,
}

impl JsonRpcClient {
    /// Create a client. Call [`start`](Self::start) before sending.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    lifecycle: Lifecycle::NotStarted,
                    next_id: 1,
                    pending: HashMap::new(),
                    start_failure: None,
                    closed_with: None,
                }),
                transport,
                notification_handler: Mutex::new(None),
                closed: CancellationToken::new(),
            }),
            start_gate: tokio::sync::Mutex::new(()),
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Timeout for requests that do not pass their own.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.shared.transport
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.lock().lifecycle
    }

    /// Number of requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Register the handler for `notifications/*` messages from the server.
    pub fn set_notification_handler(&self, handler: NotificationHandler) {
        *self
            .shared
            .notification_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Wire the transport to this client and start it.
    ///
    /// Concurrent callers wait for the first one and see the same outcome.
    /// A failed start is remembered.
    pub async fn start(&self) -> McpResult<()> {
        let _gate = self.start_gate.lock().await;
        {
            let mut state = self.shared.lock();
            match state.lifecycle {
                Lifecycle::Started => return Ok(()),
                Lifecycle::Closed => {
                    return Err(state
                        .start_failure
                        .clone()
                        .unwrap_or_else(|| state.closed_error()))
                }
                Lifecycle::NotStarted | Lifecycle::Starting => {
                    state.lifecycle = Lifecycle::Starting;
                }
            }
        }

        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        self.shared.transport.set_message_handler(Arc::new(move |message| {
            if let Some(shared) = weak.upgrade() {
                shared.handle_message(message);
            }
        }));
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        self.shared.transport.set_close_handler(Arc::new(move |reason| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            warn!(reason = %reason, "Transport closed unexpectedly");
            if shared.shutdown(McpError::Transport(reason)) {
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    runtime.spawn(async move {
                        let _ = shared.transport.close().await;
                    });
                }
            }
        }));

        let outcome = tokio::select! {
            _ = self.shared.closed.cancelled() => Err(McpError::Closed),
            result = self.shared.transport.start() => result,
        };

        let failure = {
            let mut state = self.shared.lock();
            match outcome {
                Ok(()) if state.lifecycle == Lifecycle::Starting => {
                    state.lifecycle = Lifecycle::Started;
                    return Ok(());
                }
                Ok(()) => state.closed_error(),
                Err(e) => e,
            }
        };

        debug!(error = %failure, "Start failed");
        self.shared.lock().start_failure = Some(failure.clone());
        self.shared.shutdown(failure.clone());
        let _ = self.shared.transport.close().await;
        Err(failure)
    }

    /// Send a request and wait for its result.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> McpResult<Value> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let deadline = Instant::now() + timeout;

        let (id, mut rx) = {
            let mut state = self.shared.lock();
            match state.lifecycle {
                Lifecycle::Started => {}
                Lifecycle::Closed => return Err(state.closed_error()),
                Lifecycle::NotStarted | Lifecycle::Starting => {
                    return Err(McpError::transport("Client not started"))
                }
            }
            let id = RequestId::Number(state.next_id);
            state.next_id += 1;
            let (tx, rx) = oneshot::channel();
            state.pending.insert(
                id.clone(),
                PendingRequest {
                    method: method.to_string(),
                    tx,
                },
            );
            (id, rx)
        };
        let mut guard = PendingGuard::new(&self.shared, id.clone());

        debug!(id = %id, method = %method, "Sending request");
        let message = serde_json::to_value(JsonRpcRequest::new(id.clone(), method, params))?;
        self.shared.transport.send_message(&message).await?;

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(outcome)) => {
                guard.disarm();
                outcome
            }
            Ok(Err(_)) => {
                guard.disarm();
                Err(self.shared.lock().closed_error())
            }
            Err(_) => {
                guard.disarm();
                let removed = self.shared.lock().pending.remove(&id).is_some();
                if !removed {
                    // Completed between the deadline and the removal.
                    if let Ok(outcome) = rx.try_recv() {
                        return outcome;
                    }
                }

                warn!(id = %id, method = %method, timeout_ms = timeout.as_millis() as u64, "Request timed out");
                self.shared.transport.abandon_request(&id);
                if method != methods::INITIALIZE {
                    self.cancel(id);
                }
                Err(McpError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    fn cancel(&self, id: RequestId) {
        let transport = self.shared.transport.clone();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        runtime.spawn(async move {
            if let Err(e) = transport.cancel_request(&id, "timeout").await {
                debug!(id = %id, error = %e, "Failed to cancel request");
            }
        });
    }

    /// Send a notification. No response is expected.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        {
            let state = self.shared.lock();
            match state.lifecycle {
                Lifecycle::Started => {}
                Lifecycle::Closed => return Err(state.closed_error()),
                Lifecycle::NotStarted | Lifecycle::Starting => {
                    return Err(McpError::transport("Client not started"))
                }
            }
        }
        debug!(method = %method, "Sending notification");
        let message = serde_json::to_value(JsonRpcNotification::new(method, params))?;
        self.shared.transport.send_message(&message).await
    }

    /// Close the client: fail pending requests, stop any `start()` in
    /// progress, and close the transport. Idempotent.
    pub async fn close(&self) -> McpResult<()> {
        if self.shared.shutdown(McpError::Closed) {
            info!("Closing JSON-RPC client");
        }
        self.shared.transport.close().await
    }
}

impl Drop for JsonRpcClient {
    fn drop(&mut self) {
        self.shared.shutdown(McpError::Closed);
    }
}
