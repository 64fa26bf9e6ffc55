//! Streamable HTTP transport for remote MCP servers.
//!
//! Every client message is an HTTP POST. The server answers a request either
//! with a JSON body or with an SSE stream that carries the response (and any
//! messages it wants to send first). Notifications and responses expect
//! `202 Accepted`. After the handshake an optional GET stream carries
//! server-initiated messages and is resumed with `Last-Event-ID`.
//!
//! Failures of a single POST are reported as synthesized JSON-RPC error
//! responses for the request id, so the waiting caller fails fast with a
//! code from [`crate::error::codes`].

use super::{Handlers, MessageHandler, Transport};
use crate::config::HttpConfig;
use crate::error::{codes, McpError, McpResult};
use crate::protocol::{classify, MessageKind, RequestId};
use crate::sse::{SseError, SseEvent, SseParser};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const HEADER_SESSION_ID: &str = "mcp-session-id";
const HEADER_PROTOCOL_VERSION: &str = "mcp-protocol-version";
const HEADER_LAST_EVENT_ID: &str = "last-event-id";

const ACCEPT_POST: &str = "application/json, text/event-stream";
const EVENT_STREAM: &str = "text/event-stream";

/// Upper bound on the best-effort DELETE sent by `close()`.
const DELETE_TIMEOUT: Duration = Duration::from_secs(2);

/// Async sleep used between event stream reconnects. Swappable in tests.
pub type SleepFn = Arc<dyn Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync>;

fn default_sleep() -> SleepFn {
    Arc::new(|delay| tokio::time::sleep(delay).boxed())
}

/// Session state negotiated with the server.
#[derive(Debug, Default)]
struct Session {
    id: Option<String>,
    protocol_version: Option<String>,
}

/// Why a POST failed, as a JSON-RPC error code and message.
#[derive(Debug)]
struct PostFailure {
    code: i64,
    message: String,
}

impl PostFailure {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn transport(message: impl Into<String>) -> Self {
        Self::new(codes::HTTP_TRANSPORT_ERROR, message)
    }

    fn into_error(self) -> McpError {
        McpError::json_rpc(self.code, self.message, None)
    }
}

impl From<SseError> for PostFailure {
    fn from(err: SseError) -> Self {
        match err {
            SseError::EventDataTooLarge { .. } => {
                Self::new(codes::SSE_EVENT_DATA_TOO_LARGE, err.to_string())
            }
            SseError::BufferTooLarge { .. } => Self::new(codes::HTTP_BODY_TOO_LARGE, err.to_string()),
        }
    }
}

/// How a GET event stream ended.
#[derive(Debug)]
enum StreamEnd {
    /// The server does not offer a GET stream.
    Unsupported,
    /// The stream cannot be resumed.
    Fatal(String),
    /// The stream dropped and may be resumed.
    Interrupted { received: bool },
}

/// Streamable HTTP transport.
pub struct StreamableHttpTransport {
    inner: Arc<Inner>,
}

struct Inner {
    config: HttpConfig,
    client: Client,
    handlers: Handlers,
    session: Mutex<Session>,
    /// One token per request whose POST is still running.
    in_flight: Mutex<HashMap<RequestId, CancellationToken>>,
    started: AtomicBool,
    event_stream_open: AtomicBool,
    shutdown: CancellationToken,
    sleep: SleepFn,
}

impl StreamableHttpTransport {
    /// Create a new transport. No request is made until the first message.
    pub fn new(config: HttpConfig) -> McpResult<Self> {
        Self::with_sleep(config, default_sleep())
    }

    /// Create a transport with a custom reconnect sleep.
    pub fn with_sleep(config: HttpConfig, sleep: SleepFn) -> McpResult<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| McpError::invalid_config(format!("Invalid header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| McpError::invalid_config(format!("Invalid value for header '{name}': {e}")))?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| McpError::transport(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                client,
                handlers: Handlers::default(),
                session: Mutex::new(Session::default()),
                in_flight: Mutex::new(HashMap::new()),
                started: AtomicBool::new(false),
                event_stream_open: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                sleep,
            }),
        })
    }

    /// Session id assigned by the server, if any.
    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id()
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    fn set_message_handler(&self, handler: MessageHandler) {
        self.inner.handlers.set_message(handler);
    }

    async fn start(&self) -> McpResult<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(McpError::Closed);
        }
        if !self.inner.started.swap(true, Ordering::SeqCst) {
            info!(url = %self.inner.config.url, "Using streamable HTTP MCP server");
        }
        Ok(())
    }

    async fn send_message(&self, message: &Value) -> McpResult<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(McpError::Closed);
        }
        if !self.inner.started.load(Ordering::SeqCst) {
            return Err(McpError::transport("Transport not started"));
        }

        if classify(message) == MessageKind::Request {
            let id = message.get("id").cloned().unwrap_or(Value::Null);
            let request_id = RequestId::from_value(&id);
            let token = self.inner.track(request_id.as_ref());
            let inner = self.inner.clone();
            let body = message.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => trace!(id = %id, "MCP request abandoned"),
                    _ = inner.post_request(id.clone(), body) => {}
                }
                if let Some(request_id) = request_id {
                    inner.untrack(&request_id);
                }
            });
            Ok(())
        } else {
            self.inner.post_inline(message).await
        }
    }

    fn abandon_request(&self, id: &RequestId) {
        let in_flight = self.inner.lock_in_flight();
        let token = in_flight
            .get(id)
            .or_else(|| id.coerced().and_then(|alt| in_flight.get(&alt)));
        if let Some(token) = token {
            debug!(id = %id, "Dropping abandoned MCP request");
            token.cancel();
        }
    }

    async fn session_established(&self, protocol_version: &str) -> McpResult<()> {
        self.inner.set_protocol_version(protocol_version);

        if self.inner.config.event_stream
            && !self.inner.event_stream_open.swap(true, Ordering::SeqCst)
        {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                inner.run_event_stream().await;
                inner.event_stream_open.store(false, Ordering::SeqCst);
            });
        }
        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        if self.inner.shutdown.is_cancelled() {
            return Ok(());
        }
        self.inner.handlers.suppress_close();
        self.inner.shutdown.cancel();

        let session = std::mem::take(&mut *self.inner.lock_session());
        if let Some(session_id) = session.id {
            let mut request = self
                .inner
                .client
                .delete(self.inner.config.url.clone())
                .header(HEADER_SESSION_ID, session_id);
            if let Some(version) = session.protocol_version {
                request = request.header(HEADER_PROTOCOL_VERSION, version);
            }
            match tokio::time::timeout(DELETE_TIMEOUT, request.send()).await {
                Ok(Ok(response)) => debug!(status = %response.status(), "Terminated MCP session"),
                Ok(Err(e)) => debug!(error = %e, "Failed to terminate MCP session"),
                Err(_) => debug!("Timed out terminating MCP session"),
            }
        }

        info!(url = %self.inner.config.url, "Closed streamable HTTP transport");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst) && !self.inner.shutdown.is_cancelled()
    }
}

impl Drop for StreamableHttpTransport {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    fn lock_session(&self) -> std::sync::MutexGuard<'_, Session> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, CancellationToken>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Token that stops the POST for `id`. Cancelled on shutdown too.
    fn track(&self, id: Option<&RequestId>) -> CancellationToken {
        let token = self.shutdown.child_token();
        if let Some(id) = id {
            self.lock_in_flight().insert(id.clone(), token.clone());
        }
        token
    }

    fn untrack(&self, id: &RequestId) {
        self.lock_in_flight().remove(id);
    }

    fn session_id(&self) -> Option<String> {
        self.lock_session().id.clone()
    }

    fn set_protocol_version(&self, version: &str) {
        self.lock_session().protocol_version = Some(version.to_string());
    }

    fn clear_session(&self) {
        *self.lock_session() = Session::default();
    }

    /// Remember the session id the server assigned, before any body is read.
    fn capture_session(&self, response: &Response) {
        let Some(session_id) = response
            .headers()
            .get(HEADER_SESSION_ID)
            .and_then(|v| v.to_str().ok())
        else {
            return;
        };
        let mut session = self.lock_session();
        if session.id.as_deref() != Some(session_id) {
            debug!(session_id = %session_id, "MCP session assigned");
            session.id = Some(session_id.to_string());
        }
    }

    fn with_session_headers(&self, mut request: RequestBuilder) -> RequestBuilder {
        let session = self.lock_session();
        if let Some(id) = &session.id {
            request = request.header(HEADER_SESSION_ID, id.as_str());
        }
        if let Some(version) = &session.protocol_version {
            request = request.header(HEADER_PROTOCOL_VERSION, version.as_str());
        }
        request
    }

    fn post(&self, body: &Value) -> RequestBuilder {
        let request = self
            .client
            .post(self.config.url.clone())
            .header(ACCEPT, ACCEPT_POST)
            .header(CONTENT_TYPE, "application/json")
            .json(body);
        self.with_session_headers(request)
    }

    /// Post a notification or response and expect `202 Accepted`.
    async fn post_inline(&self, message: &Value) -> McpResult<()> {
        let had_session = self.session_id().is_some();
        trace!(message = %message, "POST to MCP server");

        let response = self.post(message).send().await.map_err(|e| {
            PostFailure::transport(format!("POST failed: {e}")).into_error()
        })?;
        self.capture_session(&response);

        let status = response.status();
        if status == StatusCode::NOT_FOUND && had_session {
            self.clear_session();
            return Err(PostFailure::new(codes::SESSION_NOT_FOUND, "Session not found").into_error());
        }
        if !status.is_success() {
            return Err(PostFailure::transport(format!("Server returned {status}")).into_error());
        }
        if status != StatusCode::ACCEPTED {
            debug!(%status, "Expected 202 Accepted");
        }
        Ok(())
    }

    /// Post a request and dispatch whatever the server answers with.
    async fn post_request(&self, id: Value, body: Value) {
        if let Err(failure) = self.exchange(&id, &body).await {
            debug!(id = %id, code = failure.code, message = %failure.message, "MCP request failed");
            self.handlers.dispatch(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": failure.code, "message": failure.message},
            }));
        }
    }

    async fn exchange(&self, id: &Value, body: &Value) -> Result<(), PostFailure> {
        let had_session = self.session_id().is_some();
        trace!(message = %body, "POST to MCP server");

        let response = self
            .post(body)
            .send()
            .await
            .map_err(|e| PostFailure::transport(format!("POST failed: {e}")))?;
        self.capture_session(&response);

        let status = response.status();
        if status == StatusCode::NOT_FOUND && had_session {
            self.clear_session();
            return Err(PostFailure::new(codes::SESSION_NOT_FOUND, "Session not found"));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(PostFailure::transport(format!(
                "Server returned {status}: {}",
                text.trim()
            )));
        }
        if status == StatusCode::ACCEPTED {
            return Err(PostFailure::transport(
                "Server accepted the request without a response",
            ));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        if content_type.contains(EVENT_STREAM) {
            self.read_response_stream(response, id).await
        } else {
            let bytes = read_body(response, self.config.max_body_bytes).await?;
            let payload: Value = serde_json::from_slice(&bytes)
                .map_err(|e| PostFailure::transport(format!("Invalid JSON response: {e}")))?;
            if self.dispatch_payload(payload, Some(id)) {
                Ok(())
            } else {
                Err(PostFailure::transport("Response body did not answer the request"))
            }
        }
    }

    /// Read an SSE response body until it answers `id`.
    async fn read_response_stream(&self, response: Response, id: &Value) -> Result<(), PostFailure> {
        let mut parser = SseParser::new().with_max_event_data(self.config.max_body_bytes);
        let mut stream = response.bytes_stream();
        let mut events = Vec::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| PostFailure::transport(format!("Stream error: {e}")))?;
            parser.feed(&chunk, |event| events.push(event))?;
            let mut answered = false;
            for event in events.drain(..) {
                answered |= self.handle_event(event, Some(id))?;
            }
            if answered {
                return Ok(());
            }
        }

        parser.finish(|event| events.push(event))?;
        let mut answered = false;
        for event in events.drain(..) {
            answered |= self.handle_event(event, Some(id))?;
        }
        if answered {
            Ok(())
        } else {
            Err(PostFailure::transport("Event stream ended without a response"))
        }
    }

    /// Dispatch one SSE event. Returns whether it answered `request_id`.
    fn handle_event(&self, event: SseEvent, request_id: Option<&Value>) -> Result<bool, PostFailure> {
        if event.data.trim().is_empty() {
            return Ok(false);
        }
        if let Some(kind) = event.event.as_deref() {
            if kind != "message" {
                debug!(event = %kind, "Ignoring SSE event");
                return Ok(false);
            }
        }
        let payload: Value = serde_json::from_str(&event.data).map_err(|e| {
            PostFailure::new(codes::INVALID_SSE_DATA, format!("Invalid SSE data: {e}"))
        })?;
        Ok(self.dispatch_payload(payload, request_id))
    }

    /// Hand a message or batch to the handler.
    fn dispatch_payload(&self, payload: Value, request_id: Option<&Value>) -> bool {
        let messages = match payload {
            Value::Array(items) => items,
            other => vec![other],
        };
        let mut answered = false;
        for message in messages {
            if let Some(id) = request_id {
                answered |= answers(&message, id);
            }
            self.handlers.dispatch(message);
        }
        answered
    }

    /// Keep the GET stream open, resuming after interruptions.
    async fn run_event_stream(&self) {
        let mut last_event_id = None;
        let mut delay = self.config.reconnect_delay;
        let mut attempts = 0u32;

        loop {
            let end = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                end = self.read_server_stream(&mut last_event_id, &mut delay) => end,
            };

            match end {
                StreamEnd::Unsupported => {
                    debug!("MCP server offers no event stream");
                    return;
                }
                StreamEnd::Fatal(reason) => {
                    warn!(reason = %reason, "MCP event stream stopped");
                    return;
                }
                StreamEnd::Interrupted { received } => {
                    if received {
                        attempts = 0;
                    }
                    if attempts >= self.config.max_reconnect_attempts {
                        warn!(attempts, "Giving up on MCP event stream");
                        return;
                    }
                    attempts += 1;
                    warn!(attempt = attempts, delay_ms = delay.as_millis() as u64, "Reconnecting MCP event stream");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = (self.sleep)(delay) => {}
                    }
                }
            }
        }
    }

    async fn read_server_stream(
        &self,
        last_event_id: &mut Option<String>,
        delay: &mut Duration,
    ) -> StreamEnd {
        let mut request = self
            .client
            .get(self.config.url.clone())
            .header(ACCEPT, EVENT_STREAM);
        request = self.with_session_headers(request);
        if let Some(id) = last_event_id.as_deref() {
            request = request.header(HEADER_LAST_EVENT_ID, id);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, "MCP event stream request failed");
                return StreamEnd::Interrupted { received: false };
            }
        };

        let status = response.status();
        if status == StatusCode::METHOD_NOT_ALLOWED {
            return StreamEnd::Unsupported;
        }
        if status == StatusCode::NOT_FOUND {
            return StreamEnd::Fatal("session not found".to_string());
        }
        if status.is_server_error() {
            return StreamEnd::Interrupted { received: false };
        }
        if !status.is_success() {
            return StreamEnd::Fatal(format!("server returned {status}"));
        }
        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_lowercase().contains(EVENT_STREAM));
        if !is_stream {
            return StreamEnd::Unsupported;
        }

        debug!("MCP event stream open");
        let mut parser = SseParser::new().with_max_event_data(self.config.max_body_bytes);
        let mut stream = response.bytes_stream();
        let mut events = Vec::new();
        let mut received = false;

        while let Some(chunk) = stream.next().await {
            let Ok(chunk) = chunk else {
                return StreamEnd::Interrupted { received };
            };
            if let Err(e) = parser.feed(&chunk, |event| events.push(event)) {
                warn!(error = %e, "Dropping MCP event stream");
                return StreamEnd::Interrupted { received };
            }
            for event in events.drain(..) {
                received = true;
                if let Some(id) = &event.id {
                    *last_event_id = (!id.is_empty()).then(|| id.clone());
                }
                if let Some(ms) = event.retry_ms {
                    *delay = Duration::from_millis(ms);
                }
                if let Err(failure) = self.handle_event(event, None) {
                    warn!(error = %failure.message, "Dropping MCP event");
                }
            }
        }

        StreamEnd::Interrupted { received }
    }
}

/// Whether `message` is the response to `request_id`.
fn answers(message: &Value, request_id: &Value) -> bool {
    if classify(message) != MessageKind::Response {
        return false;
    }
    let (Some(got), Some(want)) = (
        message.get("id").and_then(RequestId::from_value),
        RequestId::from_value(request_id),
    ) else {
        return false;
    };
    got == want || got.coerced().as_ref() == Some(&want)
}

/// Read a response body, failing once it exceeds `limit` bytes.
async fn read_body(response: Response, limit: usize) -> Result<Vec<u8>, PostFailure> {
    let too_large = || {
        PostFailure::new(
            codes::HTTP_BODY_TOO_LARGE,
            format!("Response body exceeds {limit} bytes"),
        )
    };
    if response.content_length().is_some_and(|len| len > limit as u64) {
        return Err(too_large());
    }

    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| PostFailure::transport(format!("Stream error: {e}")))?;
        if body.len() + chunk.len() > limit {
            return Err(too_large());
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}
