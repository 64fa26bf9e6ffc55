//! Stdio transport against shell-script MCP servers.
#![cfg(unix)]

use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tether_mcp::{ClientOptions, McpClient, McpError, ServerConfig, StdioConfig, StdioTransport};

/// A line-oriented server that answers `initialize`, plus `cases` for
/// everything else. Each case sees `$line` and the request `$id`.
fn server_script(cases: &str) -> String {
    let mut script = String::from(
        r#"while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2025-06-18","capabilities":{"tools":{}},"serverInfo":{"name":"%s","version":"1.0"},"instructions":"%s"}}\n' "$id" "${SERVER_NAME:-sh-server}" "$(pwd)" ;;
"#,
    );
    script.push_str(cases);
    script.push_str("\n  esac\ndone\n");
    script
}

fn sh_server(script: String) -> StdioConfig {
    StdioConfig::new("sh").with_args(["-c".to_string(), script])
}

#[tokio::test]
async fn test_paginated_tools_list() {
    let config = sh_server(server_script(
        r#"    *'"method":"tools/list"'*'"cursor":"page-2"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"gamma","inputSchema":{"type":"object"}}]}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"alpha"},{"name":"beta"}],"nextCursor":"page-2"}}\n' "$id" ;;"#,
    ));
    let client = McpClient::connect(&ServerConfig::from(config), ClientOptions::default())
        .await
        .unwrap();
    assert_eq!(client.server_info().unwrap().name, "sh-server");

    let mut names = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = client.list_tools(cursor.as_deref()).await.unwrap();
        for tool in page.tools {
            if !names.contains(&tool.name) {
                names.push(tool.name);
            }
        }
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    assert_eq!(names, vec!["alpha", "beta", "gamma"]);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_process_exit_fails_pending_request() {
    let config = sh_server(server_script(
        r#"    *'"method":"tools/call"'*)
      exit 3 ;;"#,
    ));
    let client = McpClient::connect(&ServerConfig::from(config), ClientOptions::default())
        .await
        .unwrap();

    let started = Instant::now();
    let err = client
        .call_tool("crash", json!({}), None)
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));
    match &err {
        McpError::Transport(reason) => assert!(reason.contains("MCP server"), "{reason}"),
        other => panic!("Expected transport error, got {other:?}"),
    }

    assert!(matches!(
        client.list_tools(None).await,
        Err(McpError::Transport(_))
    ));
}

#[tokio::test]
async fn test_malformed_lines_dropped() {
    let config = sh_server(server_script(
        r#"    *'"method":"tools/list"'*)
      echo 'not json'
      printf '\377\376\n'
      echo '{"broken":'
      printf '{"jsonrpc":"2.0","id":999,"result":{}}\n'
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"survivor"}]}}\n' "$id" ;;"#,
    ));
    let client = McpClient::connect(&ServerConfig::from(config), ClientOptions::default())
        .await
        .unwrap();

    let page = client.list_tools(None).await.unwrap();
    assert_eq!(page.tools.len(), 1);
    assert_eq!(page.tools[0].name, "survivor");
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_oversized_line_ends_transport() {
    let config = sh_server(server_script(
        r#"    *'"method":"tools/list"'*)
      head -c 5000 /dev/zero | tr '\0' 'x'
      sleep 30 ;;"#,
    ))
    .with_max_message_bytes(1024);
    let client = McpClient::connect(&ServerConfig::from(config), ClientOptions::default())
        .await
        .unwrap();

    let started = Instant::now();
    let err = client.list_tools(None).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));
    match &err {
        McpError::Transport(reason) => assert!(reason.contains("exceeds 1024 bytes"), "{reason}"),
        other => panic!("Expected transport error, got {other:?}"),
    }
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_oversized_stderr_line_skipped() {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    let script = format!(
        "head -c 5000 /dev/zero | tr '\\0' 'x' >&2\necho >&2\necho 'after' >&2\n{}",
        server_script("")
    );
    let transport = StdioTransport::new(sh_server(script).with_max_message_bytes(1024))
        .with_stderr_sink(Arc::new(move |line| sink.lock().unwrap().push(line)));
    let client = McpClient::new(Arc::new(transport), ClientOptions::default());
    client.start().await.unwrap();

    for _ in 0..100 {
        if lines.lock().unwrap().iter().any(|l| l == "after") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let seen = lines.lock().unwrap().clone();
    assert!(seen.iter().all(|l| l.len() <= 1024), "{seen:?}");
    assert_eq!(seen.last().map(String::as_str), Some("after"));
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_env_and_cwd() {
    let dir = tempfile::tempdir().unwrap();
    let config = sh_server(server_script(""))
        .with_env("SERVER_NAME", "from-env")
        .with_cwd(dir.path());
    let client = McpClient::connect(&ServerConfig::from(config), ClientOptions::default())
        .await
        .unwrap();

    assert_eq!(client.server_info().unwrap().name, "from-env");
    let instructions = client.instructions().unwrap();
    let dir_name = dir.path().file_name().unwrap().to_str().unwrap();
    assert!(instructions.ends_with(dir_name), "{instructions}");
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_stderr_forwarded_to_sink() {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    let script = format!("echo 'booting' >&2\n{}", server_script(""));
    let transport = StdioTransport::new(sh_server(script)).with_stderr_sink(Arc::new(
        move |line| sink.lock().unwrap().push(line),
    ));
    let client = McpClient::new(Arc::new(transport), ClientOptions::default());
    client.start().await.unwrap();

    for _ in 0..100 {
        if !lines.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(*lines.lock().unwrap(), vec!["booting"]);
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_close_kills_lingering_server() {
    let script = format!("{}sleep 30\n", server_script(""));
    let client = McpClient::connect(&ServerConfig::from(sh_server(script)), ClientOptions::default())
        .await
        .unwrap();

    let started = Instant::now();
    client.close().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(client.list_tools(None).await, Err(McpError::Closed)));
}

#[tokio::test]
async fn test_spawn_failure() {
    let config = ServerConfig::stdio("definitely-not-an-mcp-server-12345", Vec::<String>::new());
    let err = McpClient::connect(&config, ClientOptions::default())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, McpError::Transport(_)));
}
