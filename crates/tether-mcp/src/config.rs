//! MCP server configuration.
//!
//! A server is reached either by spawning a local process (stdio) or over
//! streamable HTTP. The two shapes share almost nothing, so a field that only
//! makes sense for one transport is rejected when it shows up on the other.
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "files": { "command": "npx", "args": ["-y", "@modelcontextprotocol/server-filesystem", "."] },
//!     "search": { "type": "http", "url": "https://mcp.example.com/mcp", "headers": { "Authorization": "Bearer abc" } }
//!   }
//! }
//! ```

use crate::error::{McpError, McpResult};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Default time to wait for a response to a single request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Default TCP connect timeout for HTTP servers.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default cap on an HTTP response body or a single SSE event.
pub const DEFAULT_MAX_BODY_BYTES: usize = 8 * 1024 * 1024;
/// Default cap on a single line of stdio server output.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 8 * 1024 * 1024;
/// Default number of consecutive reconnects of the server event stream.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;
/// Delay before reconnecting when the server sent no `retry:` hint.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Configuration for an MCP server, tagged by transport.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawServerConfig")]
pub enum ServerConfig {
    /// Local server spawned as a child process.
    Stdio(StdioConfig),
    /// Remote server over streamable HTTP.
    Http(HttpConfig),
}

impl ServerConfig {
    /// Create a stdio server configuration.
    pub fn stdio<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Stdio(StdioConfig::new(command).with_args(args))
    }

    /// Create an HTTP server configuration.
    pub fn http(url: &str) -> McpResult<Self> {
        Ok(Self::Http(HttpConfig::new(url)?))
    }

    /// Parse a single server entry.
    pub fn from_value(value: serde_json::Value) -> McpResult<Self> {
        serde_json::from_value(value).map_err(|e| McpError::invalid_config(e.to_string()))
    }

    /// Request timeout configured for this server.
    pub fn request_timeout(&self) -> Duration {
        match self {
            Self::Stdio(config) => config.timeout,
            Self::Http(config) => config.timeout,
        }
    }

    /// Short transport name for logs.
    pub fn transport_name(&self) -> &'static str {
        match self {
            Self::Stdio(_) => "stdio",
            Self::Http(_) => "http",
        }
    }
}

impl From<StdioConfig> for ServerConfig {
    fn from(config: StdioConfig) -> Self {
        Self::Stdio(config)
    }
}

impl From<HttpConfig> for ServerConfig {
    fn from(config: HttpConfig) -> Self {
        Self::Http(config)
    }
}

/// Local server spawned as a child process.
#[derive(Debug, Clone, PartialEq)]
pub struct StdioConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Extra environment variables for the child.
    pub env: HashMap<String, String>,
    /// Working directory for the child.
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
    /// Longest stdout line accepted before the transport gives up.
    pub max_message_bytes: usize,
}

impl StdioConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_message_bytes(mut self, limit: usize) -> Self {
        self.max_message_bytes = limit;
        self
    }
}

/// Remote server over streamable HTTP.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpConfig {
    pub url: Url,
    /// Extra headers sent with every request (e.g. `Authorization`).
    pub headers: HashMap<String, String>,
    /// Per-request response timeout.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Cap on a JSON response body and on the data of a single SSE event.
    pub max_body_bytes: usize,
    /// Consecutive reconnects of the server event stream before giving up.
    pub max_reconnect_attempts: u32,
    /// Reconnect delay used when the server did not send `retry:`.
    pub reconnect_delay: Duration,
    /// Open the GET event stream for server-initiated messages after the handshake.
    pub event_stream: bool,
}

impl HttpConfig {
    pub fn new(url: &str) -> McpResult<Self> {
        let url = Url::parse(url).map_err(|e| McpError::invalid_config(format!("Invalid URL '{url}': {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(McpError::invalid_config(format!(
                "Unsupported URL scheme '{}'",
                url.scheme()
            )));
        }
        Ok(Self {
            url,
            headers: HashMap::new(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            event_stream: true,
        })
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_event_stream(mut self, enabled: bool) -> Self {
        self.event_stream = enabled;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum TransportKind {
    Stdio,
    #[serde(alias = "streamable-http", alias = "streamableHttp")]
    Http,
}

/// On-disk shape of a server entry, validated into [`ServerConfig`].
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServerConfig {
    #[serde(rename = "type")]
    transport: Option<TransportKind>,
    command: Option<String>,
    args: Option<Vec<String>>,
    env: Option<HashMap<String, String>>,
    cwd: Option<PathBuf>,
    max_message_bytes: Option<usize>,
    url: Option<String>,
    headers: Option<HashMap<String, String>>,
    timeout_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    max_body_bytes: Option<usize>,
    max_reconnect_attempts: Option<u32>,
    reconnect_delay_ms: Option<u64>,
    event_stream: Option<bool>,
}

impl RawServerConfig {
    fn stdio_only_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.command.is_some() {
            fields.push("command");
        }
        if self.args.is_some() {
            fields.push("args");
        }
        if self.env.is_some() {
            fields.push("env");
        }
        if self.cwd.is_some() {
            fields.push("cwd");
        }
        if self.max_message_bytes.is_some() {
            fields.push("maxMessageBytes");
        }
        fields
    }

    fn http_only_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.url.is_some() {
            fields.push("url");
        }
        if self.headers.is_some() {
            fields.push("headers");
        }
        if self.connect_timeout_ms.is_some() {
            fields.push("connectTimeoutMs");
        }
        if self.max_body_bytes.is_some() {
            fields.push("maxBodyBytes");
        }
        if self.max_reconnect_attempts.is_some() {
            fields.push("maxReconnectAttempts");
        }
        if self.reconnect_delay_ms.is_some() {
            fields.push("reconnectDelayMs");
        }
        if self.event_stream.is_some() {
            fields.push("eventStream");
        }
        fields
    }
}

fn reject_fields(fields: &[&str], transport: &str) -> McpResult<()> {
    if fields.is_empty() {
        return Ok(());
    }
    Err(McpError::invalid_config(format!(
        "{} not valid for {transport} transport",
        fields.join(", ")
    )))
}

impl TryFrom<RawServerConfig> for ServerConfig {
    type Error = McpError;

    fn try_from(raw: RawServerConfig) -> McpResult<Self> {
        let kind = match (raw.transport, raw.command.is_some(), raw.url.is_some()) {
            (Some(kind), _, _) => kind,
            (None, true, false) => TransportKind::Stdio,
            (None, false, true) => TransportKind::Http,
            (None, true, true) => {
                return Err(McpError::invalid_config(
                    "both command and url given; pick one transport",
                ))
            }
            (None, false, false) => {
                return Err(McpError::invalid_config("either command or url is required"))
            }
        };

        match kind {
            TransportKind::Stdio => {
                reject_fields(&raw.http_only_fields(), "stdio")?;
                let command = raw
                    .command
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| McpError::invalid_config("stdio transport requires a command"))?;
                let mut config = StdioConfig::new(command).with_args(raw.args.unwrap_or_default());
                config.env = raw.env.unwrap_or_default();
                config.cwd = raw.cwd;
                if let Some(ms) = raw.timeout_ms {
                    config.timeout = Duration::from_millis(ms);
                }
                if let Some(limit) = raw.max_message_bytes {
                    config.max_message_bytes = limit;
                }
                Ok(Self::Stdio(config))
            }
            TransportKind::Http => {
                reject_fields(&raw.stdio_only_fields(), "http")?;
                let url = raw
                    .url
                    .ok_or_else(|| McpError::invalid_config("http transport requires a url"))?;
                let mut config = HttpConfig::new(&url)?;
                config.headers = raw.headers.unwrap_or_default();
                if let Some(ms) = raw.timeout_ms {
                    config.timeout = Duration::from_millis(ms);
                }
                if let Some(ms) = raw.connect_timeout_ms {
                    config.connect_timeout = Duration::from_millis(ms);
                }
                if let Some(limit) = raw.max_body_bytes {
                    config.max_body_bytes = limit;
                }
                if let Some(attempts) = raw.max_reconnect_attempts {
                    config.max_reconnect_attempts = attempts;
                }
                if let Some(ms) = raw.reconnect_delay_ms {
                    config.reconnect_delay = Duration::from_millis(ms);
                }
                if let Some(enabled) = raw.event_stream {
                    config.event_stream = enabled;
                }
                Ok(Self::Http(config))
            }
        }
    }
}

/// A file listing named servers under `mcpServers`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServersFile {
    #[serde(rename = "mcpServers", default)]
    pub servers: BTreeMap<String, ServerConfig>,
}

impl ServersFile {
    /// Parse a servers file from JSON text.
    pub fn parse(text: &str) -> McpResult<Self> {
        serde_json::from_str(text).map_err(|e| McpError::invalid_config(e.to_string()))
    }

    /// Load a servers file from disk.
    pub async fn load(path: &Path) -> McpResult<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::parse(&text)
    }

    /// Look up a server by name.
    pub fn get(&self, name: &str) -> McpResult<&ServerConfig> {
        self.servers
            .get(name)
            .ok_or_else(|| McpError::invalid_config(format!("Unknown server: {name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stdio_config() {
        let config = ServerConfig::from_value(json!({
            "command": "npx",
            "args": ["-y", "server"],
            "env": {"TOKEN": "x"},
            "cwd": "/tmp",
            "timeoutMs": 5000,
            "maxMessageBytes": 4096
        }))
        .unwrap();
        let ServerConfig::Stdio(stdio) = config else {
            panic!("Expected stdio config");
        };
        assert_eq!(stdio.command, "npx");
        assert_eq!(stdio.args, vec!["-y", "server"]);
        assert_eq!(stdio.env.get("TOKEN"), Some(&"x".to_string()));
        assert_eq!(stdio.cwd, Some(PathBuf::from("/tmp")));
        assert_eq!(stdio.timeout, Duration::from_secs(5));
        assert_eq!(stdio.max_message_bytes, 4096);
    }

    #[test]
    fn test_http_config() {
        let config = ServerConfig::from_value(json!({
            "type": "http",
            "url": "https://example.com/mcp",
            "headers": {"Authorization": "Bearer token"},
            "maxBodyBytes": 1024,
            "maxReconnectAttempts": 7,
            "eventStream": false
        }))
        .unwrap();
        let ServerConfig::Http(http) = config else {
            panic!("Expected http config");
        };
        assert_eq!(http.url.as_str(), "https://example.com/mcp");
        assert_eq!(
            http.headers.get("Authorization"),
            Some(&"Bearer token".to_string())
        );
        assert_eq!(http.max_body_bytes, 1024);
        assert_eq!(http.max_reconnect_attempts, 7);
        assert!(!http.event_stream);
        assert_eq!(http.timeout, DEFAULT_REQUEST_TIMEOUT);
    }

    #[test]
    fn test_url_with_command_rejected() {
        let err = ServerConfig::from_value(json!({
            "command": "server",
            "url": "https://example.com/mcp"
        }))
        .unwrap_err();
        assert!(err.to_string().contains("both command and url"));
    }

    #[test]
    fn test_foreign_fields_rejected() {
        let err = ServerConfig::from_value(json!({
            "type": "stdio",
            "command": "server",
            "headers": {"X": "y"}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("headers not valid for stdio transport"));

        let err = ServerConfig::from_value(json!({
            "url": "https://example.com/mcp",
            "env": {"A": "b"},
            "cwd": "/"
        }))
        .unwrap_err();
        assert!(err.to_string().contains("env, cwd not valid for http transport"));
    }

    #[test]
    fn test_missing_target_rejected() {
        let err = ServerConfig::from_value(json!({"args": ["x"]})).unwrap_err();
        assert!(err.to_string().contains("either command or url is required"));

        let err = ServerConfig::from_value(json!({"type": "http"})).unwrap_err();
        assert!(err.to_string().contains("requires a url"));

        let err = ServerConfig::from_value(json!({"command": "  "})).unwrap_err();
        assert!(err.to_string().contains("requires a command"));
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(ServerConfig::http("not a url").is_err());
        assert!(ServerConfig::http("ftp://example.com").is_err());
        assert!(ServerConfig::http("http://localhost:8080/mcp").is_ok());
    }

    #[test]
    fn test_builders() {
        let config: ServerConfig = StdioConfig::new("server")
            .with_args(["--flag"])
            .with_env("KEY", "value")
            .with_cwd("/srv")
            .with_timeout(Duration::from_secs(2))
            .into();
        assert_eq!(config.transport_name(), "stdio");
        assert_eq!(config.request_timeout(), Duration::from_secs(2));

        let config: ServerConfig = HttpConfig::new("https://example.com/mcp")
            .unwrap()
            .with_header("Authorization", "Bearer token")
            .with_max_body_bytes(10)
            .into();
        assert_eq!(config.transport_name(), "http");
    }

    #[test]
    fn test_servers_file() {
        let file = ServersFile::parse(
            r#"{
                "mcpServers": {
                    "files": {"command": "files-server"},
                    "remote": {"url": "http://localhost:9000/mcp"}
                }
            }"#,
        )
        .unwrap();
        assert_eq!(file.servers.len(), 2);
        assert_eq!(file.get("files").unwrap().transport_name(), "stdio");
        assert_eq!(file.get("remote").unwrap().transport_name(), "http");
        assert!(file.get("missing").is_err());
    }

    #[test]
    fn test_servers_file_invalid_entry() {
        let err = ServersFile::parse(r#"{"mcpServers": {"bad": {"command": "x", "url": "http://a"}}}"#)
            .unwrap_err();
        assert!(matches!(err, McpError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_servers_file_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");
        std::fs::write(
            &path,
            r#"{"mcpServers": {"echo": {"command": "echo-server", "args": ["--stdio"]}}}"#,
        )
        .unwrap();

        let file = ServersFile::load(&path).await.unwrap();
        assert_eq!(
            file.get("echo").unwrap(),
            &ServerConfig::stdio("echo-server", ["--stdio"])
        );
    }
}
