//! Server-Sent Events framing.

use crate::core::error::AppError;
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};

/// One parsed SSE event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: Option<String>,
    pub id: Option<String>,
}

/// Incremental SSE parser.
///
/// Bytes are buffered until a blank line closes the event, so a multi-byte
/// character split across network chunks is decoded intact.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every event it completes.
    pub fn parse(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some((end, sep_len)) = find_boundary(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..end + sep_len).take(end).collect();
            if let Some(event) = parse_block(&String::from_utf8_lossy(&block)) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing event that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if self.buffer.is_empty() {
            return None;
        }
        let block = std::mem::take(&mut self.buffer);
        parse_block(&String::from_utf8_lossy(&block))
    }
}

fn find_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buf
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = SseEvent::default();
    let mut seen = false;

    for line in block.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => {
                event.event = Some(value.to_string());
                seen = true;
            }
            "data" => {
                match event.data.as_mut() {
                    Some(data) => {
                        data.push('\n');
                        data.push_str(value);
                    }
                    None => event.data = Some(value.to_string()),
                }
                seen = true;
            }
            "id" => {
                event.id = Some(value.to_string());
                seen = true;
            }
            _ => {}
        }
    }

    seen.then_some(event)
}

/// Frame an upstream byte stream into SSE events.
pub fn sse_events<S, E>(body: S) -> impl Stream<Item = Result<SseEvent, AppError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    async_stream::try_stream! {
        let mut parser = SseParser::new();
        let mut body = Box::pin(body);
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| {
                AppError::UpstreamUnavailable(format!("Upstream stream error: {}", e))
            })?;
            for event in parser.parse(&chunk) {
                yield event;
            }
        }
        if let Some(event) = parser.finish() {
            yield event;
        }
    }
}

// ============================================================================
// SSE Serializer
// ============================================================================

/// Format a named SSE event.
pub fn format_sse_event(event: &str, data: &str) -> String {
    format!("event: {}\ndata: {}\n\n", event, data)
}

/// Format a data-only SSE event.
pub fn format_sse_data(data: &str) -> String {
    format!("data: {}\n\n", data)
}

/// Format the Protocol-A end-of-stream marker.
pub fn format_sse_done() -> String {
    "data: [DONE]\n\n".to_string()
}
