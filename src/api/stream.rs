use crate::types::{ErrorFrame, StreamChunk, StreamEvent};
use serde_json::Value;

const DONE_SENTINEL: &str = "[DONE]";
const UNKNOWN_PROVIDER_ERROR: &str = "The assistant provider reported an unknown error.";

/// Incremental decoder for the completion endpoint's line-framed event stream.
///
/// Bytes are buffered until a `\n` arrives; only then is the line decoded as
/// UTF-8 and interpreted. A multi-byte character split across two network
/// chunks is therefore reassembled before decoding.
#[derive(Default)]
pub struct StreamParser {
    buffer: Vec<u8>,
    pending_event: Option<String>,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        let mut start = 0;

        while let Some(offset) = self.buffer[start..].iter().position(|byte| *byte == b'\n') {
            let end = start + offset;
            let line = String::from_utf8_lossy(&self.buffer[start..end]).into_owned();
            start = end + 1;
            self.process_line(&line, &mut events);
        }

        if start > 0 {
            self.buffer.drain(..start);
        }

        events
    }

    /// Transport EOF terminates whatever line is still buffered.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let remaining = std::mem::take(&mut self.buffer);
        let mut events = Vec::new();
        if !remaining.is_empty() {
            let line = String::from_utf8_lossy(&remaining).into_owned();
            self.process_line(&line, &mut events);
        }
        self.pending_event = None;
        events
    }

    pub fn has_partial_line(&self) -> bool {
        !self.buffer.is_empty()
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<StreamEvent>) {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.trim().is_empty() {
            // A blank line closes the current SSE event.
            self.pending_event = None;
            return;
        }
        if line.starts_with(':') {
            return;
        }

        if let Some(name) = field_value(line, "event") {
            self.pending_event = Some(name.trim().to_string());
        } else if let Some(payload) = field_value(line, "error") {
            events.push(parse_error_frame(payload));
        } else if let Some(payload) = field_value(line, "data") {
            if self.pending_event.as_deref() == Some("error") {
                events.push(parse_error_frame(payload));
            } else {
                parse_data_payload(payload, events);
            }
        } else {
            tracing::debug!(line, "ignoring unrecognized stream line");
        }
    }
}

fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(field)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

fn parse_data_payload(payload: &str, events: &mut Vec<StreamEvent>) {
    let payload = payload.trim();
    if payload == DONE_SENTINEL {
        events.push(StreamEvent::Done);
        return;
    }

    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(%error, data = payload, "skipping malformed stream frame");
            return;
        }
    };

    // Some providers report failures in-band on a data line.
    if let Some(message) = value.get("error").and_then(error_message) {
        events.push(StreamEvent::Error(message));
        return;
    }

    match serde_json::from_value::<StreamChunk>(value) {
        Ok(chunk) => {
            for choice in chunk.choices {
                if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                    events.push(StreamEvent::Delta(content));
                }
                match choice.finish_reason.as_deref() {
                    Some("length") => tracing::warn!("reply truncated at the provider's token limit"),
                    Some(reason) => tracing::debug!(reason, "provider finished reply"),
                    None => {}
                }
            }
        }
        Err(error) => {
            tracing::warn!(%error, data = payload, "skipping stream frame with unexpected shape");
        }
    }
}

fn parse_error_frame(payload: &str) -> StreamEvent {
    let payload = payload.trim();
    if let Ok(frame) = serde_json::from_str::<ErrorFrame>(payload) {
        return StreamEvent::Error(frame.message);
    }

    let message = match serde_json::from_str::<Value>(payload) {
        Ok(value) => value
            .get("error")
            .and_then(error_message)
            .or_else(|| error_message(&value)),
        Err(_) => Some(payload.to_string()),
    };

    StreamEvent::Error(
        message
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_PROVIDER_ERROR.to_string()),
    )
}

fn error_message(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Object(_) => value
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}
