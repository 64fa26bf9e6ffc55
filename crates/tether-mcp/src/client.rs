//! MCP session client.

use crate::config::{ServerConfig, DEFAULT_REQUEST_TIMEOUT};
use crate::error::{McpError, McpResult};
use crate::jsonrpc::{JsonRpcClient, Lifecycle, NotificationHandler};
use crate::protocol::{
    methods, CallToolParams, Implementation, InitializeParams, InitializeResult,
    ListToolsParams, ListToolsResult, ServerCapabilities, ToolCallResult,
    LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
use crate::transport::{self, Transport};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Options for the MCP handshake and requests.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Identity sent as `clientInfo`.
    pub client_info: Implementation,
    /// Capabilities sent in `initialize`.
    pub capabilities: Value,
    /// Version requested in `initialize`.
    pub protocol_version: String,
    /// Versions accepted back from the server.
    pub supported_versions: Vec<String>,
    /// Timeout for requests without their own.
    pub request_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_info: Implementation::default(),
            capabilities: json!({}),
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            supported_versions: SUPPORTED_PROTOCOL_VERSIONS
                .iter()
                .map(|v| v.to_string())
                .collect(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl ClientOptions {
    pub fn with_client_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.client_info = Implementation {
            name: name.into(),
            version: version.into(),
        };
        self
    }

    pub fn with_capabilities(mut self, capabilities: Value) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }

    pub fn with_supported_versions<I, S>(mut self, versions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supported_versions = versions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[derive(Debug)]
struct Session {
    lifecycle: Lifecycle,
    initialized: Option<InitializeResult>,
    /// Bumped on every successful handshake.
    generation: u64,
    start_failure: Option<McpError>,
}

/// A client session with one MCP server.
///
/// ```text
/// McpClient ── initialize / tools/* ──▶ JsonRpcClient ──▶ Transport ──▶ server
/// ```
pub struct McpClient {
    rpc: JsonRpcClient,
    options: ClientOptions,
    gate: tokio::sync::Mutex<()>,
    session: Mutex<Session>,
}

impl McpClient {
    /// Create a session over `transport`. Call [`start`](Self::start) to handshake.
    pub fn new(transport: Arc<dyn Transport>, options: ClientOptions) -> Self {
        Self {
            rpc: JsonRpcClient::new(transport).with_default_timeout(options.request_timeout),
            options,
            gate: tokio::sync::Mutex::new(()),
            session: Mutex::new(Session {
                lifecycle: Lifecycle::NotStarted,
                initialized: None,
                generation: 0,
                start_failure: None,
            }),
        }
    }

    /// Build the transport for `config` and start the session.
    ///
    /// The request timeout of `config` replaces the one in `options`.
    pub async fn connect(config: &ServerConfig, options: ClientOptions) -> McpResult<Self> {
        info!(transport = config.transport_name(), "Connecting to MCP server");
        let transport = transport::from_config(config)?;
        let client = Self::new(
            transport,
            options.with_request_timeout(config.request_timeout()),
        );
        client.start().await?;
        Ok(client)
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the transport and run the `initialize` handshake. Idempotent.
    pub async fn start(&self) -> McpResult<()> {
        let _gate = self.gate.lock().await;
        {
            let mut session = self.lock();
            match session.lifecycle {
                Lifecycle::Started => return Ok(()),
                Lifecycle::Closed => {
                    return Err(session.start_failure.clone().unwrap_or(McpError::Closed))
                }
                Lifecycle::NotStarted | Lifecycle::Starting => {
                    session.lifecycle = Lifecycle::Starting;
                }
            }
        }

        let outcome = match self.rpc.start().await {
            Ok(()) => self.handshake().await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                self.lock().lifecycle = Lifecycle::Started;
                Ok(())
            }
            Err(e) => {
                {
                    let mut session = self.lock();
                    session.lifecycle = Lifecycle::Closed;
                    session.start_failure = Some(e.clone());
                }
                let _ = self.rpc.close().await;
                Err(e)
            }
        }
    }

    /// `initialize`, version check, `notifications/initialized`.
    /// Callers hold the gate.
    async fn handshake(&self) -> McpResult<()> {
        let params = InitializeParams {
            protocol_version: self.options.protocol_version.clone(),
            capabilities: self.options.capabilities.clone(),
            client_info: self.options.client_info.clone(),
        };
        debug!(protocol_version = %params.protocol_version, "Sending initialize");
        let value = self
            .rpc
            .request(methods::INITIALIZE, Some(serde_json::to_value(params)?), None)
            .await?;
        let result: InitializeResult = serde_json::from_value(value)
            .map_err(|e| McpError::protocol(format!("Invalid initialize result: {e}")))?;

        if !self
            .options
            .supported_versions
            .iter()
            .any(|v| *v == result.protocol_version)
        {
            warn!(version = %result.protocol_version, "Server negotiated an unsupported protocol version");
            let _ = self.rpc.close().await;
            return Err(McpError::ProtocolVersionNotSupported {
                version: result.protocol_version,
                supported: self.options.supported_versions.clone(),
            });
        }

        self.rpc.notify(methods::INITIALIZED, None).await?;
        self.rpc
            .transport()
            .session_established(&result.protocol_version)
            .await?;

        info!(
            server = %result.server_info.as_ref().map(|s| s.name.as_str()).unwrap_or("unknown"),
            protocol_version = %result.protocol_version,
            "MCP session initialized"
        );

        let mut session = self.lock();
        session.initialized = Some(result);
        session.generation += 1;
        Ok(())
    }

    /// Generation of the live session, or why there is none.
    fn current_generation(&self) -> McpResult<u64> {
        let session = self.lock();
        match session.lifecycle {
            Lifecycle::Started => Ok(session.generation),
            Lifecycle::Closed => Err(session.start_failure.clone().unwrap_or(McpError::Closed)),
            Lifecycle::NotStarted | Lifecycle::Starting => {
                Err(McpError::transport("MCP session not started"))
            }
        }
    }

    /// Re-run the handshake unless another caller already did.
    async fn reinitialize(&self, seen_generation: u64) -> McpResult<()> {
        let _gate = self.gate.lock().await;
        if self.current_generation()? != seen_generation {
            return Ok(());
        }
        warn!("MCP session expired, re-initializing");
        self.handshake().await
    }

    /// Send a request, re-handshaking once if the server lost our session.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> McpResult<T> {
        let generation = self.current_generation()?;
        let value = match self.rpc.request(method, params.clone(), timeout).await {
            Err(e) if e.is_session_not_found() => {
                self.reinitialize(generation).await?;
                self.rpc.request(method, params, timeout).await?
            }
            other => other?,
        };
        serde_json::from_value(value)
            .map_err(|e| McpError::protocol(format!("Invalid {method} result: {e}")))
    }

    /// One page of `tools/list`.
    pub async fn list_tools(&self, cursor: Option<&str>) -> McpResult<ListToolsResult> {
        let params = ListToolsParams {
            cursor: cursor.map(String::from),
        };
        self.call(methods::TOOLS_LIST, Some(serde_json::to_value(params)?), None)
            .await
    }

    /// Invoke a tool.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> McpResult<ToolCallResult> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        debug!(tool = %name, "Calling MCP tool");
        self.call(methods::TOOLS_CALL, Some(serde_json::to_value(params)?), timeout)
            .await
    }

    /// Round-trip a `ping`.
    pub async fn ping(&self) -> McpResult<()> {
        let _: Value = self.call(methods::PING, None, None).await?;
        Ok(())
    }

    /// Register the handler for server notifications.
    pub fn set_notification_handler(&self, handler: NotificationHandler) {
        self.rpc.set_notification_handler(handler);
    }

    pub fn lifecycle(&self) -> Lifecycle {
        match self.rpc.lifecycle() {
            Lifecycle::Closed => Lifecycle::Closed,
            _ => self.lock().lifecycle,
        }
    }

    /// The full `initialize` result of the live session.
    pub fn initialize_result(&self) -> Option<InitializeResult> {
        self.lock().initialized.clone()
    }

    /// Negotiated protocol version.
    pub fn protocol_version(&self) -> Option<String> {
        self.lock()
            .initialized
            .as_ref()
            .map(|r| r.protocol_version.clone())
    }

    pub fn server_info(&self) -> Option<Implementation> {
        self.lock()
            .initialized
            .as_ref()
            .and_then(|r| r.server_info.clone())
    }

    pub fn capabilities(&self) -> Option<ServerCapabilities> {
        self.lock()
            .initialized
            .as_ref()
            .map(|r| r.capabilities.clone())
    }

    pub fn instructions(&self) -> Option<String> {
        self.lock()
            .initialized
            .as_ref()
            .and_then(|r| r.instructions.clone())
    }

    /// Close the session and its transport. Idempotent.
    pub async fn close(&self) -> McpResult<()> {
        self.lock().lifecycle = Lifecycle::Closed;
        self.rpc.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;
    use crate::protocol::ToolContent;
    use crate::test_support::{
        basic_server, initialize_result, method, reply, reply_error, ScriptedTransport,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn client(transport: ScriptedTransport) -> (Arc<ScriptedTransport>, McpClient) {
        let transport = Arc::new(transport);
        let client = McpClient::new(transport.clone(), ClientOptions::default());
        (transport, client)
    }

    #[tokio::test]
    async fn test_handshake() {
        let (transport, client) = client(ScriptedTransport::new(basic_server));
        client.start().await.unwrap();

        assert_eq!(
            transport.sent_methods(),
            vec!["initialize", "notifications/initialized"]
        );
        let init = &transport.sent()[0];
        assert_eq!(init["params"]["protocolVersion"], LATEST_PROTOCOL_VERSION);
        assert_eq!(init["params"]["clientInfo"]["name"], "tether");
        assert_eq!(init["params"]["capabilities"], json!({}));

        assert_eq!(transport.sessions(), vec![LATEST_PROTOCOL_VERSION]);
        // The transport hears about the session only after `initialized` went out.
        assert_eq!(transport.sent_at_session(), vec![2]);
        assert_eq!(client.lifecycle(), Lifecycle::Started);
        assert_eq!(client.protocol_version().as_deref(), Some(LATEST_PROTOCOL_VERSION));
        assert_eq!(client.server_info().unwrap().name, "scripted");
        assert!(client.capabilities().unwrap().tools.unwrap().list_changed);
        assert_eq!(client.instructions().as_deref(), Some("Use the tools."));

        // Idempotent.
        client.start().await.unwrap();
        assert_eq!(transport.sent_methods().len(), 2);
    }

    #[tokio::test]
    async fn test_older_supported_version_accepted() {
        let (_, client) = client(ScriptedTransport::new(|m| match method(m) {
            "initialize" => vec![reply(m, initialize_result("2024-11-05"))],
            _ => Vec::new(),
        }));
        client.start().await.unwrap();
        assert_eq!(client.protocol_version().as_deref(), Some("2024-11-05"));
    }

    #[tokio::test]
    async fn test_unsupported_version_closes() {
        let (transport, client) = client(ScriptedTransport::new(|m| match method(m) {
            "initialize" => vec![reply(m, initialize_result("1999-01-01"))],
            _ => Vec::new(),
        }));

        let err = client.start().await.unwrap_err();
        assert!(matches!(
            err,
            McpError::ProtocolVersionNotSupported { ref version, .. } if version == "1999-01-01"
        ));
        assert!(transport.is_closed());
        assert_eq!(transport.sent_methods(), vec!["initialize"]);
        assert!(transport.sessions().is_empty());
        assert_eq!(client.lifecycle(), Lifecycle::Closed);

        assert!(matches!(
            client.start().await,
            Err(McpError::ProtocolVersionNotSupported { .. })
        ));
        assert!(matches!(
            client.list_tools(None).await,
            Err(McpError::ProtocolVersionNotSupported { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_start_single_handshake() {
        let (transport, client) = client(
            ScriptedTransport::new(basic_server).with_start_delay(Duration::from_millis(20)),
        );
        let (a, b) = tokio::join!(client.start(), client.start());
        a.unwrap();
        b.unwrap();
        let initializes = transport
            .sent_methods()
            .iter()
            .filter(|m| *m == "initialize")
            .count();
        assert_eq!(initializes, 1);
    }

    #[tokio::test]
    async fn test_list_tools_cursor() {
        let (transport, client) = client(ScriptedTransport::new(|m| match method(m) {
            "initialize" => vec![reply(m, initialize_result(LATEST_PROTOCOL_VERSION))],
            "tools/list" if m["params"]["cursor"].is_null() => vec![reply(
                m,
                json!({"tools": [{"name": "a"}], "nextCursor": "page-2"}),
            )],
            "tools/list" => vec![reply(m, json!({"tools": [{"name": "b"}]}))],
            _ => Vec::new(),
        }));
        client.start().await.unwrap();

        let first = client.list_tools(None).await.unwrap();
        assert_eq!(first.tools[0].name, "a");
        assert_eq!(first.next_cursor.as_deref(), Some("page-2"));

        let second = client.list_tools(Some("page-2")).await.unwrap();
        assert_eq!(second.tools[0].name, "b");
        assert!(second.next_cursor.is_none());

        let last = transport.sent().pop().unwrap();
        assert_eq!(last["params"], json!({"cursor": "page-2"}));
    }

    #[tokio::test]
    async fn test_session_not_found_rehandshake() {
        let lists = Arc::new(AtomicUsize::new(0));
        let counter = lists.clone();
        let (transport, client) = client(ScriptedTransport::new(move |m| match method(m) {
            "tools/list" if counter.fetch_add(1, Ordering::SeqCst) == 0 => {
                vec![reply_error(m, codes::SESSION_NOT_FOUND, "Session not found")]
            }
            _ => basic_server(m),
        }));
        client.start().await.unwrap();

        let page = client.list_tools(None).await.unwrap();
        assert_eq!(page.tools[0].name, "echo");
        assert_eq!(
            transport.sent_methods(),
            vec![
                "initialize",
                "notifications/initialized",
                "tools/list",
                "initialize",
                "notifications/initialized",
                "tools/list",
            ]
        );
        assert_eq!(transport.sessions().len(), 2);
    }

    #[tokio::test]
    async fn test_second_session_not_found_propagates() {
        let (transport, client) = client(ScriptedTransport::new(|m| match method(m) {
            "tools/call" => vec![reply_error(m, codes::SESSION_NOT_FOUND, "Session not found")],
            _ => basic_server(m),
        }));
        client.start().await.unwrap();

        let err = client
            .call_tool("echo", json!({"text": "hi"}), None)
            .await
            .unwrap_err();
        assert!(err.is_session_not_found());
        let initializes = transport
            .sent_methods()
            .iter()
            .filter(|m| *m == "initialize")
            .count();
        assert_eq!(initializes, 2);
    }

    #[tokio::test]
    async fn test_call_tool() {
        let (transport, client) = client(ScriptedTransport::new(basic_server));
        client.start().await.unwrap();

        let result = client
            .call_tool("echo", json!({"text": "hello"}), None)
            .await
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.text(), "hello");

        let call = transport.sent().pop().unwrap();
        assert_eq!(
            call["params"],
            json!({"name": "echo", "arguments": {"text": "hello"}})
        );
    }

    #[tokio::test]
    async fn test_tool_payloads_pass_through_unknown_members() {
        let (_, client) = client(ScriptedTransport::new(|m| match method(m) {
            "tools/list" => vec![reply(
                m,
                json!({"tools": [{
                    "name": "a",
                    "title": "A",
                    "inputSchema": {"type": "object"},
                    "outputSchema": {"type": "object"},
                    "annotations": {"destructiveHint": false}
                }]}),
            )],
            "tools/call" => vec![reply(
                m,
                json!({"content": [{"type": "x-custom", "value": 1}], "isError": false}),
            )],
            _ => basic_server(m),
        }));
        client.start().await.unwrap();

        let page = client.list_tools(None).await.unwrap();
        let tool = &page.tools[0];
        assert_eq!(tool.title.as_deref(), Some("A"));
        assert_eq!(tool.output_schema, Some(json!({"type": "object"})));
        assert_eq!(tool.annotations, Some(json!({"destructiveHint": false})));

        let result = client.call_tool("a", json!({}), None).await.unwrap();
        assert!(matches!(
            &result.content[0],
            ToolContent::Unknown(block) if block["value"] == 1
        ));
    }

    #[tokio::test]
    async fn test_call_tool_timeout_override() {
        let (_, client) = client(ScriptedTransport::new(|m| match method(m) {
            "tools/call" => Vec::new(),
            _ => basic_server(m),
        }));
        client.start().await.unwrap();

        let err = client
            .call_tool("slow", json!({}), Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_ping() {
        let (transport, client) = client(ScriptedTransport::new(basic_server));
        client.start().await.unwrap();
        client.ping().await.unwrap();
        let ping = transport.sent().pop().unwrap();
        assert_eq!(method(&ping), "ping");
        assert!(ping.get("params").is_none());
    }

    #[tokio::test]
    async fn test_requests_require_start() {
        let (_, client) = client(ScriptedTransport::new(basic_server));
        assert!(matches!(
            client.list_tools(None).await,
            Err(McpError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_close() {
        let (transport, client) = client(ScriptedTransport::new(basic_server));
        client.start().await.unwrap();
        client.close().await.unwrap();

        assert!(transport.is_closed());
        assert_eq!(client.lifecycle(), Lifecycle::Closed);
        assert!(matches!(client.list_tools(None).await, Err(McpError::Closed)));
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_notification_handler() {
        let (transport, client) = client(ScriptedTransport::new(basic_server));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        client.set_notification_handler(Arc::new(move |n| {
            sink.lock().unwrap().push(n.method);
        }));
        client.start().await.unwrap();

        transport.inject(json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"}));
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["notifications/tools/list_changed"]
        );
    }
}
