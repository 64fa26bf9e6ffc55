//! Incremental Server-Sent Events parser.
//!
//! Turns an arbitrarily chunked byte stream into discrete events. The parser
//! knows nothing about JSON-RPC; the HTTP transport decides what an event's
//! `data` means.
//!
//! ```text
//! : comment            (ignored)
//! id: 42
//! event: message
//! data: {"jsonrpc":
//! data:  "2.0"}        (joined with '\n')
//! retry: 3000
//!                      (blank line dispatches the event)
//! ```

use crate::error::McpError;
use thiserror::Error;

/// Default bound on bytes buffered without seeing a line terminator.
pub const DEFAULT_MAX_BUFFERED_BYTES: usize = 8 * 1024 * 1024;

/// One decoded event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
    pub retry_ms: Option<u64>,
}

/// Parser failures. Both are fatal for the stream being parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SseError {
    #[error("event data exceeds {limit} bytes")]
    EventDataTooLarge { limit: usize },

    #[error("more than {limit} bytes buffered without a line break")]
    BufferTooLarge { limit: usize },
}

impl From<SseError> for McpError {
    fn from(err: SseError) -> Self {
        match err {
            SseError::EventDataTooLarge { limit } => McpError::EventDataTooLarge { limit },
            SseError::BufferTooLarge { limit } => McpError::BufferTooLarge { limit },
        }
    }
}

/// Incremental SSE parser. Drive it from one task at a time.
#[derive(Debug)]
pub struct SseParser {
    buffer: Vec<u8>,
    max_buffered: usize,
    max_event_data: Option<usize>,
    pending: PendingEvent,
}

/// Fields accumulated since the last dispatched event.
#[derive(Debug, Default)]
struct PendingEvent {
    id: Option<String>,
    event: Option<String>,
    /// Every `data` line followed by `\n`; the final newline is stripped on dispatch.
    data: String,
    has_data: bool,
    retry_ms: Option<u64>,
}

impl PendingEvent {
    fn is_empty(&self) -> bool {
        !self.has_data && self.id.is_none() && self.event.is_none() && self.retry_ms.is_none()
    }

    fn take(&mut self) -> SseEvent {
        let mut pending = std::mem::take(self);
        if pending.data.ends_with('\n') {
            pending.data.pop();
        }
        SseEvent {
            id: pending.id,
            event: pending.event,
            data: pending.data,
            retry_ms: pending.retry_ms,
        }
    }
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl SseParser {
    /// Create a parser without an event-data limit.
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            max_buffered: DEFAULT_MAX_BUFFERED_BYTES,
            max_event_data: None,
            pending: PendingEvent::default(),
        }
    }

    /// Limit the data size of a single event. Each `data` line counts its
    /// terminating newline.
    pub fn with_max_event_data(mut self, limit: usize) -> Self {
        self.max_event_data = Some(limit);
        self
    }

    /// Limit the bytes held while waiting for a line terminator.
    pub fn with_max_buffered(mut self, limit: usize) -> Self {
        self.max_buffered = limit;
        self
    }

    /// Feed a chunk of bytes, invoking `on_event` for every completed event.
    pub fn feed<F>(&mut self, chunk: &[u8], mut on_event: F) -> Result<(), SseError>
    where
        F: FnMut(SseEvent),
    {
        self.buffer.extend_from_slice(chunk);

        let mut consumed = 0;
        while let Some(offset) = self.buffer[consumed..].iter().position(|b| *b == b'\n') {
            let end = consumed + offset;
            let mut line = &self.buffer[consumed..end];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            let line = String::from_utf8_lossy(line).into_owned();
            consumed = end + 1;

            if let Err(err) = self.process_line(&line, &mut on_event) {
                self.buffer.drain(..consumed);
                return Err(err);
            }
        }
        self.buffer.drain(..consumed);

        if self.buffer.len() > self.max_buffered {
            return Err(SseError::BufferTooLarge {
                limit: self.max_buffered,
            });
        }
        Ok(())
    }

    /// Flush whatever was captured since the last blank line.
    pub fn finish<F>(&mut self, mut on_event: F) -> Result<(), SseError>
    where
        F: FnMut(SseEvent),
    {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let rest = rest.strip_suffix(b"\r").unwrap_or(&rest[..]);
            let line = String::from_utf8_lossy(rest).into_owned();
            self.process_line(&line, &mut on_event)?;
        }
        if !self.pending.is_empty() {
            on_event(self.pending.take());
        }
        Ok(())
    }

    fn process_line<F>(&mut self, line: &str, on_event: &mut F) -> Result<(), SseError>
    where
        F: FnMut(SseEvent),
    {
        if line.is_empty() {
            if !self.pending.is_empty() {
                on_event(self.pending.take());
            }
            return Ok(());
        }

        if line.starts_with(':') {
            return Ok(());
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => {
                self.pending.data.push_str(value);
                self.pending.data.push('\n');
                self.pending.has_data = true;
                if let Some(limit) = self.max_event_data {
                    if self.pending.data.len() > limit {
                        self.pending = PendingEvent::default();
                        return Err(SseError::EventDataTooLarge { limit });
                    }
                }
            }
            "id" => {
                // A NUL in the id is not allowed by the format.
                if !value.contains('\0') {
                    self.pending.id = Some(value.to_string());
                }
            }
            "event" => self.pending.event = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.trim().parse::<u64>() {
                    self.pending.retry_ms = Some(ms);
                }
            }
            _ => {}
        }
        Ok(())
    }
}
