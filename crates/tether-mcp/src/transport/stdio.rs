//! Stdio transport: newline-delimited JSON over a child process's pipes.

use super::{CloseHandler, Handlers, MessageHandler, Transport};
use crate::config::StdioConfig;
use crate::error::{McpError, McpResult};
use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Receives each line the server writes to stderr.
pub type StderrSink = Arc<dyn Fn(String) + Send + Sync>;

/// How long `close()` waits for the child to exit after stdin is closed.
const CLOSE_GRACE: Duration = Duration::from_millis(100);

/// How long the reader waits for an exit status after stdout hits EOF.
const EXIT_STATUS_WAIT: Duration = Duration::from_millis(100);

/// Transport that drives an MCP server child process.
pub struct StdioTransport {
    config: StdioConfig,
    handlers: Arc<Handlers>,
    stderr_sink: Option<StderrSink>,
    child: Arc<Mutex<Option<Child>>>,
    stdin: Mutex<Option<ChildStdin>>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl StdioTransport {
    /// Create a transport for the given command. Nothing is spawned until `start()`.
    pub fn new(config: StdioConfig) -> Self {
        Self {
            config,
            handlers: Arc::new(Handlers::default()),
            stderr_sink: None,
            child: Arc::new(Mutex::new(None)),
            stdin: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Forward server stderr lines to `sink` instead of the debug log.
    pub fn with_stderr_sink(mut self, sink: StderrSink) -> Self {
        self.stderr_sink = Some(sink);
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn set_message_handler(&self, handler: MessageHandler) {
        self.handlers.set_message(handler);
    }

    fn set_close_handler(&self, handler: CloseHandler) {
        self.handlers.set_close(handler);
    }

    async fn start(&self) -> McpResult<()> {
        let mut child_guard = self.child.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(McpError::Closed);
        }
        if child_guard.is_some() {
            return Ok(());
        }

        debug!(command = %self.config.command, args = ?self.config.args, "Starting MCP server");

        let mut child = self.command().spawn().map_err(|e| {
            McpError::transport(format!(
                "Failed to start '{}': {e}",
                self.config.command
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::transport("Failed to get stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::transport("Failed to get stdout"))?;
        let stderr = child.stderr.take();

        info!(command = %self.config.command, pid = ?child.id(), "MCP server started");

        *self.stdin.lock().await = Some(stdin);
        *child_guard = Some(child);
        self.connected.store(true, Ordering::SeqCst);

        let max_line = self.config.max_message_bytes;
        tokio::spawn(read_stdout(
            FramedRead::new(stdout, line_codec(max_line)),
            self.handlers.clone(),
            self.child.clone(),
            self.connected.clone(),
            self.shutdown.clone(),
        ));
        if let Some(stderr) = stderr {
            tokio::spawn(read_stderr(
                FramedRead::new(stderr, line_codec(max_line)),
                self.stderr_sink.clone(),
                self.shutdown.clone(),
            ));
        }

        Ok(())
    }

    async fn send_message(&self, message: &Value) -> McpResult<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let mut stdin_guard = self.stdin.lock().await;
        let stdin = stdin_guard.as_mut().ok_or_else(|| {
            if self.shutdown.is_cancelled() {
                McpError::Closed
            } else {
                McpError::transport("Transport not started")
            }
        })?;

        trace!(message = %message, "Sending to MCP server");
        stdin
            .write_all(&line)
            .await
            .map_err(|e| McpError::transport(format!("Failed to write to server stdin: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| McpError::transport(format!("Failed to flush server stdin: {e}")))?;
        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        self.handlers.suppress_close();
        self.shutdown.cancel();
        self.connected.store(false, Ordering::SeqCst);

        // Same lock order as start(): child, then stdin.
        let child = {
            let mut child_guard = self.child.lock().await;
            // Dropping stdin gives the server EOF, which is its cue to exit.
            self.stdin.lock().await.take();
            child_guard.take()
        };
        if let Some(mut child) = child {
            match tokio::time::timeout(CLOSE_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!(%status, "MCP server exited"),
                _ => {
                    debug!("MCP server did not exit in time, killing");
                    let _ = child.kill().await;
                }
            }
            info!(command = %self.config.command, "Closed MCP server transport");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Ok(mut guard) = self.child.try_lock() {
            if let Some(ref mut child) = *guard {
                let _ = child.start_kill();
            }
        }
    }
}

/// Newline-framed chunks of at most `max` bytes. Bytes, not `str`, so one
/// invalid UTF-8 line does not end the stream.
fn line_codec(max: usize) -> AnyDelimiterCodec {
    AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), b"\n".to_vec(), max)
}

fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

async fn read_stdout<R: AsyncRead + Unpin>(
    mut lines: FramedRead<R, AnyDelimiterCodec>,
    handlers: Arc<Handlers>,
    child: Arc<Mutex<Option<Child>>>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    let max_line = lines.decoder().max_length();
    let cause = loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return,
            next = lines.next() => next,
        };
        match next {
            None => break "stdout closed".to_string(),
            Some(Ok(line)) => {
                let bytes = trim_line(&line);
                if bytes.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                match serde_json::from_slice::<Value>(bytes) {
                    Ok(message) => {
                        trace!(message = %message, "Received from MCP server");
                        handlers.dispatch(message);
                    }
                    Err(e) => warn!(error = %e, "Dropping malformed line from MCP server"),
                }
            }
            Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => {
                break format!("stdout line exceeds {max_line} bytes");
            }
            Some(Err(e)) => break format!("stdout read failed: {e}"),
        }
    };

    connected.store(false, Ordering::SeqCst);
    if shutdown.is_cancelled() {
        return;
    }

    let status = {
        let mut guard = child.lock().await;
        match guard.as_mut() {
            Some(child) => tokio::time::timeout(EXIT_STATUS_WAIT, child.wait())
                .await
                .ok()
                .and_then(Result::ok),
            None => None,
        }
    };
    let reason = match status {
        Some(status) => format!("MCP server process exited ({status})"),
        None => format!("MCP server connection lost ({cause})"),
    };
    warn!(reason = %reason, "MCP server transport terminated");
    handlers.closed(reason);
}

async fn read_stderr<R: AsyncRead + Unpin>(
    mut lines: FramedRead<R, AnyDelimiterCodec>,
    sink: Option<StderrSink>,
    shutdown: CancellationToken,
) {
    // Set after an oversized line; the stream yields one `None` and then
    // resumes, so that `None` is not EOF.
    let mut skipping = false;
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return,
            next = lines.next() => next,
        };
        match next {
            None if skipping => skipping = false,
            None | Some(Err(AnyDelimiterCodecError::Io(_))) => return,
            Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => {
                debug!("Dropping oversized MCP server stderr line");
                skipping = true;
            }
            Some(Ok(line)) => {
                let text = String::from_utf8_lossy(trim_line(&line)).into_owned();
                match &sink {
                    Some(sink) => sink(text),
                    None => debug!(line = %text, "MCP server stderr"),
                }
            }
        }
    }
}
