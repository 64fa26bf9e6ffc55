//! Command handlers.

mod logging;

pub use logging::init_logging;

use anyhow::{bail, Context};
use clap::Args;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tether_mcp::{ClientOptions, HttpConfig, McpClient, McpTool, ServerConfig, ServersFile};
use tracing::debug;

/// Which server to talk to.
#[derive(Args, Debug, Clone)]
pub struct Target {
    /// Servers file with an `mcpServers` map
    #[arg(long, requires = "server")]
    pub config: Option<PathBuf>,

    /// Server name in the servers file
    #[arg(long, requires = "config")]
    pub server: Option<String>,

    /// URL of a streamable HTTP server
    #[arg(long, conflicts_with_all = ["config", "server"])]
    pub url: Option<String>,

    /// Extra HTTP header for --url, as NAME=VALUE (repeatable)
    #[arg(long = "header", value_name = "NAME=VALUE", requires = "url")]
    pub headers: Vec<String>,

    /// Request timeout in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Command and arguments of a stdio server
    #[arg(last = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

impl Target {
    /// Resolve the target into a server configuration.
    pub async fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let mut config = match (&self.config, &self.url, self.command.split_first()) {
            (Some(path), None, None) => {
                let file = ServersFile::load(path)
                    .await
                    .with_context(|| format!("Failed to load servers file {}", path.display()))?;
                let name = self
                    .server
                    .as_deref()
                    .context("--server is required with --config")?;
                file.get(name)?.clone()
            }
            (None, Some(url), None) => {
                let mut http = HttpConfig::new(url)?;
                for header in &self.headers {
                    let (name, value) = header
                        .split_once('=')
                        .with_context(|| format!("Invalid header '{header}', expected NAME=VALUE"))?;
                    http = http.with_header(name.trim(), value.trim());
                }
                ServerConfig::Http(http)
            }
            (None, None, Some((command, args))) => ServerConfig::stdio(command.as_str(), args),
            _ => bail!("Specify exactly one of --config/--server, --url, or -- COMMAND [ARGS...]"),
        };

        if let Some(ms) = self.timeout_ms {
            let timeout = Duration::from_millis(ms);
            match &mut config {
                ServerConfig::Stdio(stdio) => stdio.timeout = timeout,
                ServerConfig::Http(http) => http.timeout = timeout,
            }
        }
        Ok(config)
    }

    async fn connect(&self) -> anyhow::Result<McpClient> {
        let config = self.server_config().await?;
        debug!(transport = config.transport_name(), "Connecting");
        McpClient::connect(&config, ClientOptions::default())
            .await
            .context("Failed to connect to MCP server")
    }
}

/// List every tool, following `nextCursor`.
pub async fn list_tools(target: &Target, json: bool) -> anyhow::Result<()> {
    let client = target.connect().await?;
    let mut tools: Vec<McpTool> = Vec::new();
    let mut cursor: Option<String> = None;
    let outcome = async {
        loop {
            let page = client.list_tools(cursor.as_deref()).await?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if Some(&next) != cursor.as_ref() => cursor = Some(next),
                _ => break,
            }
        }
        anyhow::Ok(())
    }
    .await;
    client.close().await?;
    outcome.context("Failed to list tools")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tools)?);
        return Ok(());
    }
    if tools.is_empty() {
        println!("No tools.");
        return Ok(());
    }
    let width = tools.iter().map(|t| t.name.len()).max().unwrap_or(0).max(4);
    println!("{:<width$}  {}", "NAME", "DESCRIPTION");
    for tool in &tools {
        let description = tool
            .description
            .as_deref()
            .and_then(|d| d.lines().next())
            .unwrap_or("");
        println!("{:<width$}  {}", tool.name, description);
    }
    Ok(())
}

/// Call one tool and print its result.
pub async fn call_tool(target: &Target, name: &str, args: &str, json: bool) -> anyhow::Result<()> {
    let arguments: Value =
        serde_json::from_str(args).with_context(|| format!("Invalid --args JSON: {args}"))?;
    if !arguments.is_object() {
        bail!("--args must be a JSON object");
    }

    let client = target.connect().await?;
    let outcome = client.call_tool(name, arguments, None).await;
    client.close().await?;
    let result = outcome.with_context(|| format!("Failed to call tool '{name}'"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        let text = result.text();
        if !text.is_empty() {
            println!("{text}");
        }
        if let Some(structured) = &result.structured_content {
            println!("{}", serde_json::to_string_pretty(structured)?);
        }
    }
    if result.is_error {
        bail!("Tool '{name}' reported an error");
    }
    Ok(())
}

/// Ping the server and report the round trip.
pub async fn ping(target: &Target) -> anyhow::Result<()> {
    let client = target.connect().await?;
    let started = Instant::now();
    let outcome = client.ping().await;
    let elapsed = started.elapsed();
    client.close().await?;
    outcome.context("Ping failed")?;

    let server = client
        .server_info()
        .map(|info| format!("{} {}", info.name, info.version))
        .unwrap_or_else(|| "server".to_string());
    println!("{server}: pong in {}ms", elapsed.as_millis());
    Ok(())
}

/// List the servers in a servers file.
pub async fn list_servers(path: &Path) -> anyhow::Result<()> {
    let file = ServersFile::load(path)
        .await
        .with_context(|| format!("Failed to load servers file {}", path.display()))?;

    if file.servers.is_empty() {
        println!("No MCP servers configured.");
        return Ok(());
    }

    println!("{:<20} {:<8} {}", "NAME", "TYPE", "ENDPOINT");
    println!("{}", "-".repeat(60));
    for (name, config) in &file.servers {
        let endpoint = match config {
            ServerConfig::Stdio(stdio) => {
                let mut parts = vec![stdio.command.clone()];
                parts.extend(stdio.args.iter().cloned());
                parts.join(" ")
            }
            ServerConfig::Http(http) => http.url.to_string(),
        };
        println!("{:<20} {:<8} {}", name, config.transport_name(), endpoint);
    }
    Ok(())
}
