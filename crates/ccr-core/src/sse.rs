//! SSE frame parsing (§4.5). Turns a raw byte stream into tagged
//! `SseEvent`s, accumulating partial-JSON `input_json_delta` fragments the
//! way `goose-server`'s `reply()` handler accumulates streamed text before
//! forwarding a parsed `Message`, except here accumulation is keyed by
//! content-block index since multiple tool-use blocks can stream
//! concurrently within one turn.

use std::collections::HashMap;

use serde_json::Value;

/// One parsed SSE frame, tagged by Anthropic's `event:` name (or `Unknown`
/// for anything the parser doesn't special-case — §4.5 "unknown event types
/// are surfaced as Unknown... and do not stop parsing").
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    MessageStart(Value),
    ContentBlockStart { index: usize, value: Value },
    ContentBlockDelta { index: usize, value: Value },
    ContentBlockStop { index: usize, value: Value },
    MessageDelta(Value),
    MessageStop(Value),
    Ping,
    Unknown { event_type: String, value: Value },
}

impl SseEvent {
    pub fn wire_type(&self) -> &str {
        match self {
            SseEvent::MessageStart(_) => "message_start",
            SseEvent::ContentBlockStart { .. } => "content_block_start",
            SseEvent::ContentBlockDelta { .. } => "content_block_delta",
            SseEvent::ContentBlockStop { .. } => "content_block_stop",
            SseEvent::MessageDelta(_) => "message_delta",
            SseEvent::MessageStop(_) => "message_stop",
            SseEvent::Ping => "ping",
            SseEvent::Unknown { event_type, .. } => event_type,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            SseEvent::MessageStart(v)
            | SseEvent::ContentBlockStart { value: v, .. }
            | SseEvent::ContentBlockDelta { value: v, .. }
            | SseEvent::ContentBlockStop { value: v, .. }
            | SseEvent::MessageDelta(v)
            | SseEvent::MessageStop(v)
            | SseEvent::Unknown { value: v, .. } => Some(v),
            SseEvent::Ping => None,
        }
    }

    /// Re-serialize as an `event: ...\ndata: ...\n\n` frame, the inverse of
    /// parsing (§8 "SSE parse then serialize reproduces the original byte
    /// stream up to whitespace normalization and ping frames").
    pub fn to_frame(&self) -> String {
        if matches!(self, SseEvent::Ping) {
            return "event: ping\ndata: {}\n\n".to_string();
        }
        let data = self
            .value()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "{}".to_string());
        format!("event: {}\ndata: {}\n\n", self.wire_type(), data)
    }
}

fn index_of(value: &Value) -> Option<usize> {
    value.get("index").and_then(|v| v.as_u64()).map(|v| v as usize)
}

/// A small, explicit allow-list of known upstream truncation bugs, applied
/// before JSON parsing (§4.5 "apply a small, explicit allow-list of repairs
/// and no others"). Each entry is a literal substring fix, never a generic
/// heuristic.
fn repair_known_truncations(raw: &str) -> String {
    raw.replace(r#""output_to":"#, r#""output_tokens":"#)
}

/// Parses one SSE byte stream, accumulating tool-use `input_json_delta`
/// fragments per content-block index. One instance is owned per request;
/// it is not `Send`-shared across requests.
#[derive(Debug, Default)]
pub struct SseParser {
    buffers: HashMap<usize, String>,
    /// Diagnostics attached when a `content_block_stop` couldn't parse its
    /// accumulated buffer; kept for observability, never fatal.
    pub diagnostics: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one `\n\n`-delimited frame's raw text (without the trailing
    /// delimiter) into zero or one events. Returns `None` for a blank frame.
    pub fn parse_frame(&mut self, frame: &str) -> Option<SseEvent> {
        let mut event_name: Option<&str> = None;
        let mut data_lines: Vec<&str> = Vec::new();

        for line in frame.lines() {
            if let Some(rest) = line.strip_prefix("event:") {
                event_name = Some(rest.trim());
            } else if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.trim_start());
            }
        }

        if event_name == Some("ping") {
            return Some(SseEvent::Ping);
        }

        if data_lines.is_empty() {
            return None;
        }

        let raw_data = data_lines.join("\n");
        let repaired = repair_known_truncations(&raw_data);
        let value: Value = match serde_json::from_str(&repaired) {
            Ok(v) => v,
            Err(err) => {
                self.diagnostics
                    .push(format!("failed to parse SSE data payload: {err}"));
                return None;
            }
        };

        let event_type = event_name
            .map(|s| s.to_string())
            .or_else(|| value.get("type").and_then(|v| v.as_str()).map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());

        self.build_event(&event_type, value)
    }

    fn build_event(&mut self, event_type: &str, value: Value) -> Option<SseEvent> {
        match event_type {
            "message_start" => Some(SseEvent::MessageStart(value)),
            "content_block_start" => {
                let index = index_of(&value)?;
                self.buffers.remove(&index);
                Some(SseEvent::ContentBlockStart { index, value })
            }
            "content_block_delta" => {
                let index = index_of(&value)?;
                if value
                    .get("delta")
                    .and_then(|d| d.get("type"))
                    .and_then(|t| t.as_str())
                    == Some("input_json_delta")
                {
                    if let Some(partial) = value
                        .get("delta")
                        .and_then(|d| d.get("partial_json"))
                        .and_then(|p| p.as_str())
                    {
                        self.buffers.entry(index).or_default().push_str(partial);
                    }
                }
                Some(SseEvent::ContentBlockDelta { index, value })
            }
            "content_block_stop" => {
                let index = index_of(&value)?;
                Some(SseEvent::ContentBlockStop { index, value })
            }
            "message_delta" => Some(SseEvent::MessageDelta(value)),
            "message_stop" => Some(SseEvent::MessageStop(value)),
            "ping" => Some(SseEvent::Ping),
            other => Some(SseEvent::Unknown {
                event_type: other.to_string(),
                value,
            }),
        }
    }

    /// The accumulated partial-JSON buffer for a content-block index,
    /// parsed. Called at `content_block_stop`; on parse failure the raw
    /// string is retained (§4.5 "retain the raw string and attach a
    /// diagnostic but do not abort the stream").
    pub fn finalize_tool_input(&mut self, index: usize) -> Result<Value, String> {
        let raw = self.buffers.remove(&index).unwrap_or_default();
        match serde_json::from_str::<Value>(&raw) {
            Ok(value) => Ok(value),
            Err(err) => {
                self.diagnostics.push(format!(
                    "content_block_stop index {index}: partial-JSON parse failed: {err}"
                ));
                Err(raw)
            }
        }
    }

    pub fn buffered_input(&self, index: usize) -> Option<&str> {
        self.buffers.get(&index).map(String::as_str)
    }
}

/// Split a raw byte/text stream into `\n\n`-delimited frames. Exposed
/// separately from `SseParser` so callers (the upstream byte-stream reader)
/// can feed arbitrarily-chunked network reads without re-buffering logic
/// duplicated at each call site.
#[derive(Debug, Default)]
pub struct FrameSplitter {
    pending: String,
}

impl FrameSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of text, returning any complete frames it completed.
    /// Incomplete trailing data is retained for the next call.
    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.pending.find("\n\n") {
            let frame = self.pending[..pos].to_string();
            self.pending.drain(..pos + 2);
            if !frame.trim().is_empty() {
                frames.push(frame);
            }
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_message_start() {
        let mut parser = SseParser::new();
        let frame = "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{}}";
        let event = parser.parse_frame(frame).unwrap();
        assert_eq!(event.wire_type(), "message_start");
    }

    #[test]
    fn drops_ping_events() {
        let mut parser = SseParser::new();
        let event = parser.parse_frame("event: ping\ndata: {}").unwrap();
        assert!(matches!(event, SseEvent::Ping));
    }

    #[test]
    fn accumulates_input_json_delta_across_frames() {
        let mut parser = SseParser::new();
        let deltas = [r#"{"c"#, r#"ity":"L"#, r#"A"}"#];
        for (i, chunk) in deltas.iter().enumerate() {
            let frame = format!(
                "event: content_block_delta\ndata: {}",
                json!({
                    "type": "content_block_delta",
                    "index": 0,
                    "delta": {"type": "input_json_delta", "partial_json": chunk}
                })
            );
            let event = parser.parse_frame(&frame).unwrap();
            assert!(matches!(event, SseEvent::ContentBlockDelta { index: 0, .. }));
            let _ = i;
        }
        let parsed = parser.finalize_tool_input(0).unwrap();
        assert_eq!(parsed, json!({"city": "LA"}));
    }

    #[test]
    fn retains_raw_text_on_unparseable_finalize() {
        let mut parser = SseParser::new();
        let frame = format!(
            "event: content_block_delta\ndata: {}",
            json!({
                "type": "content_block_delta",
                "index": 2,
                "delta": {"type": "input_json_delta", "partial_json": "{not valid"}
            })
        );
        parser.parse_frame(&frame).unwrap();
        let err = parser.finalize_tool_input(2).unwrap_err();
        assert_eq!(err, "{not valid");
        assert_eq!(parser.diagnostics.len(), 1);
    }

    #[test]
    fn repairs_known_output_to_truncation() {
        let mut parser = SseParser::new();
        let frame = r#"event: message_delta
data: {"type":"message_delta","usage":{"output_to":42}}"#;
        let event = parser.parse_frame(frame).unwrap();
        let value = event.value().unwrap();
        assert_eq!(value["usage"]["output_tokens"], 42);
    }

    #[test]
    fn unknown_event_type_does_not_abort() {
        let mut parser = SseParser::new();
        let event = parser
            .parse_frame("event: citations_delta\ndata: {\"foo\":1}")
            .unwrap();
        match event {
            SseEvent::Unknown { event_type, .. } => assert_eq!(event_type, "citations_delta"),
            _ => panic!("expected Unknown variant"),
        }
    }

    #[test]
    fn frame_splitter_buffers_partial_chunks() {
        let mut splitter = FrameSplitter::new();
        let mut frames = splitter.feed("event: ping\ndata: {}\n\nevent: mess");
        assert_eq!(frames.len(), 1);
        frames = splitter.feed("age_stop\ndata: {}\n\n");
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains("message_stop"));
    }

    #[test]
    fn round_trip_preserves_event_shape() {
        let mut parser = SseParser::new();
        let original = json!({"type": "message_delta", "usage": {"output_tokens": 10}});
        let frame = format!("event: message_delta\ndata: {}", original);
        let event = parser.parse_frame(&frame).unwrap();
        let re_emitted = event.to_frame();
        let mut parser2 = SseParser::new();
        let reparsed = parser2
            .parse_frame(re_emitted.trim_end_matches("\n\n"))
            .unwrap();
        assert_eq!(reparsed.value(), event.value());
    }
}
