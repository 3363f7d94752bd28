//! Stream Interceptor + Agent Loop (§4.6): watches every parsed SSE event
//! for a `tool_use` content block owned by an active agent, captures and
//! executes it locally, and accumulates the synthetic assistant/tool
//! messages a continuation request splices back into the outer stream.
//!
//! The state machine in §4.6's table is split across two calls so the
//! caller can interleave awaiting tool execution with forwarding events,
//! the same way `goose-server`'s `routes/reply.rs` keeps its `mpsc`-fed
//! event loop itself synchronous and only awaits provider/tool work out of
//! line: `intercept` is a synchronous decision (forward, suppress, or
//! "finalize this capture"), `finish_capture` records the outcome of an
//! async tool execution the caller drives separately.

use serde_json::Value;

use crate::message::{ContentBlock, Message, ToolResultContent};
use crate::sse::SseEvent;
use crate::tools::{Agent, AgentRegistry, ToolContext};

#[derive(Debug, Clone)]
struct CapturingTool {
    index: usize,
    id: String,
    name: String,
}

/// One in-flight request's agent-loop scratch state (§3 "Agent Processing
/// State"). Created once per request that has at least one active agent,
/// reset to idle after each tool call finishes.
#[derive(Debug, Default)]
pub struct AgentLoopState {
    capturing: Option<CapturingTool>,
    partial_json: String,
    assistant_blocks: Vec<ContentBlock>,
    tool_blocks: Vec<ContentBlock>,
}

/// What the caller should do with one parsed SSE event after interception.
#[derive(Debug)]
pub enum Intercept {
    /// Forward this event to the client unchanged.
    Forward(SseEvent),
    /// The event was consumed by an in-progress capture; nothing reaches
    /// the client for it.
    Suppressed,
    /// The captured tool call's input just finished arriving
    /// (`content_block_stop`). The caller must execute `name` with `args`
    /// (or treat `args` as already-failed raw text) and call
    /// [`AgentLoopState::finish_capture`] with the outcome before feeding
    /// any further events.
    ToolCallReady {
        name: String,
        id: String,
        args: Result<Value, String>,
    },
}

impl AgentLoopState {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once at least one tool result has been accumulated this turn —
    /// the signal (§4.6 table, "Idle (after ≥1 tool-result)") that a
    /// trailing `message_delta` should trigger a continuation instead of
    /// being forwarded as-is.
    pub fn has_pending_results(&self) -> bool {
        !self.tool_blocks.is_empty()
    }

    pub fn is_idle(&self) -> bool {
        self.capturing.is_none()
    }

    /// Feed one parsed SSE event through the §4.6 state machine. `owned`
    /// decides whether a `tool_use` block's name belongs to some active
    /// agent; only such blocks are ever captured.
    pub fn intercept(&mut self, event: SseEvent, owned: impl Fn(&str) -> bool) -> Intercept {
        if let Some(cap) = self.capturing.clone() {
            match &event {
                SseEvent::ContentBlockDelta { index, value } if *index == cap.index => {
                    if let Some(partial) = value
                        .get("delta")
                        .and_then(|d| d.get("partial_json"))
                        .and_then(|p| p.as_str())
                    {
                        self.partial_json.push_str(partial);
                    }
                    return Intercept::Suppressed;
                }
                SseEvent::ContentBlockStop { index, .. } if *index == cap.index => {
                    let args = serde_json::from_str::<Value>(&self.partial_json)
                        .map_err(|_| self.partial_json.clone());
                    return Intercept::ToolCallReady {
                        name: cap.name,
                        id: cap.id,
                        args,
                    };
                }
                // Any other event while capturing (e.g. a delta/stop for a
                // different index interleaved on the wire) forwards
                // through untouched; the capture itself stays open.
                _ => return Intercept::Forward(event),
            }
        }

        if let SseEvent::ContentBlockStart { index, value } = &event {
            let block = value.get("content_block");
            let block_type = block.and_then(|b| b.get("type")).and_then(|t| t.as_str());
            if block_type == Some("tool_use") {
                if let Some(name) = block.and_then(|b| b.get("name")).and_then(|n| n.as_str()) {
                    if owned(name) {
                        let id = block
                            .and_then(|b| b.get("id"))
                            .and_then(|i| i.as_str())
                            .unwrap_or_default()
                            .to_string();
                        self.capturing = Some(CapturingTool {
                            index: *index,
                            id,
                            name: name.to_string(),
                        });
                        self.partial_json.clear();
                        return Intercept::Suppressed;
                    }
                }
            }
        }

        Intercept::Forward(event)
    }

    /// Record the outcome of executing a captured tool call: append an
    /// assistant `tool_use` block and a `tool_result` block to the
    /// continuation lists, then return to idle (§3 "Reset to the idle
    /// state once a tool call is fully processed"). A tool error (§4.6 "a
    /// tool that throws produces a synthetic tool_result whose content is
    /// the error message") is recorded the same way, just with
    /// `is_error: true`.
    pub fn finish_capture(
        &mut self,
        name: String,
        id: String,
        args: Value,
        result: Result<String, String>,
    ) {
        self.assistant_blocks.push(ContentBlock::ToolUse {
            id: id.clone(),
            name,
            input: args,
        });
        let (content, is_error) = match result {
            Ok(text) => (text, false),
            Err(text) => (text, true),
        };
        self.tool_blocks.push(ContentBlock::ToolResult {
            tool_use_id: id,
            content: ToolResultContent::Text(content),
            is_error,
        });
        self.capturing = None;
        self.partial_json.clear();
    }

    /// Build the continuation request body (§4.6.1): the original request
    /// with two synthetic messages appended — the assistant's accumulated
    /// `tool_use` blocks, then a user message carrying the `tool_result`
    /// blocks. Dispatched by the caller back through `/v1/messages` on the
    /// same host/port so it re-enters routing and transformation.
    pub fn build_continuation(&self, original_body: &Value) -> Value {
        let mut body = original_body.clone();
        if let Value::Object(map) = &mut body {
            let mut messages = map
                .get("messages")
                .and_then(|m| m.as_array())
                .cloned()
                .unwrap_or_default();
            messages.push(
                serde_json::to_value(Message::assistant(self.assistant_blocks.clone()))
                    .expect("Message serializes"),
            );
            messages.push(
                serde_json::to_value(Message::user(self.tool_blocks.clone()))
                    .expect("Message serializes"),
            );
            map.insert("messages".to_string(), Value::Array(messages));
            map.remove("stream");
            map.insert("stream".to_string(), Value::Bool(true));
        }
        body
    }

    /// Reset all continuation scratch after splicing one continuation's
    /// events into the outer stream, in case the spliced continuation
    /// itself triggers further tool calls.
    pub fn reset_after_continuation(&mut self) {
        *self = Self::default();
    }
}

/// Execute a captured tool call by name, searching only the agents active
/// for this request (§4.6: interception only ever applies to tools "owned
/// by some active agent"). Returns `Err` with the failure text rather than
/// propagating — callers fold this straight into [`AgentLoopState::finish_capture`]
/// as the synthetic `tool_result` content (§4.6, §7).
pub async fn execute_captured_tool(
    registry: &AgentRegistry,
    active: &[&Agent],
    name: &str,
    args: &Value,
    ctx: &ToolContext<'_>,
) -> Result<String, String> {
    match registry.find_tool(active, name) {
        Some(tool) => tool.execute(args, ctx).await,
        None => Err(format!("no active agent owns tool '{name}'")),
    }
}

/// Whether any event in `events_so_far` has already reached the client,
/// used by the HTTP handler to decide between a unary error body and a
/// silently-closed connection on mid-stream failure (§7 "if the failure
/// occurs before the first event was forwarded, emit a unary error;
/// otherwise terminate the stream").
pub fn any_forwarded(forwarded_count: usize) -> bool {
    forwarded_count > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{AgentRegistry, ToolContext};
    use serde_json::json;

    fn start_tool_use(index: usize, id: &str, name: &str) -> SseEvent {
        SseEvent::ContentBlockStart {
            index,
            value: json!({
                "type": "content_block_start",
                "index": index,
                "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}}
            }),
        }
    }

    fn delta(index: usize, partial: &str) -> SseEvent {
        SseEvent::ContentBlockDelta {
            index,
            value: json!({
                "type": "content_block_delta",
                "index": index,
                "delta": {"type": "input_json_delta", "partial_json": partial}
            }),
        }
    }

    fn stop(index: usize) -> SseEvent {
        SseEvent::ContentBlockStop {
            index,
            value: json!({"type": "content_block_stop", "index": index}),
        }
    }

    #[test]
    fn non_owned_tool_use_forwards_untouched() {
        let mut state = AgentLoopState::new();
        let event = start_tool_use(0, "t1", "weather");
        let out = state.intercept(event, |_| false);
        assert!(matches!(out, Intercept::Forward(SseEvent::ContentBlockStart { .. })));
    }

    #[test]
    fn owned_tool_use_is_captured_end_to_end() {
        let mut state = AgentLoopState::new();

        let out = state.intercept(start_tool_use(0, "t1", "weather"), |n| n == "weather");
        assert!(matches!(out, Intercept::Suppressed));

        for chunk in ["{\"c", "ity\":\"L", "A\"}"] {
            let out = state.intercept(delta(0, chunk), |n| n == "weather");
            assert!(matches!(out, Intercept::Suppressed));
        }

        let out = state.intercept(stop(0), |n| n == "weather");
        match out {
            Intercept::ToolCallReady { name, id, args } => {
                assert_eq!(name, "weather");
                assert_eq!(id, "t1");
                assert_eq!(args.unwrap(), json!({"city": "LA"}));
            }
            _ => panic!("expected ToolCallReady"),
        }
        assert!(state.is_idle());
    }

    #[test]
    fn finish_capture_appends_assistant_and_tool_blocks_in_order() {
        let mut state = AgentLoopState::new();
        state.finish_capture(
            "weather".to_string(),
            "t1".to_string(),
            json!({"city": "LA"}),
            Ok("72F".to_string()),
        );
        assert!(state.has_pending_results());
        assert_eq!(state.assistant_blocks.len(), 1);
        assert_eq!(state.tool_blocks.len(), 1);
        match &state.tool_blocks[0] {
            ContentBlock::ToolResult { tool_use_id, content, is_error } => {
                assert_eq!(tool_use_id, "t1");
                assert_eq!(content.as_text(), "72F");
                assert!(!is_error);
            }
            _ => panic!("expected ToolResult"),
        }
    }

    #[test]
    fn tool_error_is_recorded_as_error_result_not_propagated() {
        let mut state = AgentLoopState::new();
        state.finish_capture(
            "weather".to_string(),
            "t1".to_string(),
            json!({}),
            Err("weather service unavailable".to_string()),
        );
        match &state.tool_blocks[0] {
            ContentBlock::ToolResult { is_error, content, .. } => {
                assert!(*is_error);
                assert_eq!(content.as_text(), "weather service unavailable");
            }
            _ => panic!("expected ToolResult"),
        }
    }

    #[test]
    fn continuation_request_appends_assistant_then_user_message() {
        let mut state = AgentLoopState::new();
        state.finish_capture(
            "weather".to_string(),
            "t1".to_string(),
            json!({"city": "LA"}),
            Ok("72F".to_string()),
        );

        let original = json!({
            "model": "p,m",
            "max_tokens": 100,
            "messages": [{"role": "user", "content": "what's the weather?"}]
        });
        let continuation = state.build_continuation(&original);
        let messages = continuation["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[1]["content"][0]["type"], "tool_use");
        assert_eq!(messages[1]["content"][0]["id"], "t1");
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(messages[2]["content"][0]["type"], "tool_result");
        assert_eq!(messages[2]["content"][0]["tool_use_id"], "t1");
        assert_eq!(messages[2]["content"][0]["content"], "72F");
    }

    #[tokio::test]
    async fn execute_captured_tool_runs_owning_agents_tool() {
        let registry = AgentRegistry::builtin_fixtures();
        let req: crate::message::MessagesRequest = serde_json::from_value(json!({
            "model": "m", "max_tokens": 10, "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();
        let active = registry.active_agents(&req);
        let ctx = ToolContext { request: &req, session_id: "s1" };
        let result = execute_captured_tool(&registry, &active, "echo", &json!({"text": "hi"}), &ctx)
            .await
            .unwrap();
        assert_eq!(result, "hi");
    }

    #[tokio::test]
    async fn execute_captured_tool_errors_for_unowned_name() {
        let registry = AgentRegistry::builtin_fixtures();
        let req: crate::message::MessagesRequest = serde_json::from_value(json!({
            "model": "m", "max_tokens": 10, "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();
        let active = registry.active_agents(&req);
        let ctx = ToolContext { request: &req, session_id: "s1" };
        let err = execute_captured_tool(&registry, &active, "ghost", &json!({}), &ctx)
            .await
            .unwrap_err();
        assert!(err.contains("ghost"));
    }

    #[test]
    fn full_scenario_matches_spec_concrete_example_4() {
        // §8 scenario 4: message_start, content_block_start(tool_use),
        // three input_json_delta chunks, content_block_stop, message_delta.
        let mut state = AgentLoopState::new();
        let owned = |n: &str| n == "weather";

        let mut forwarded = Vec::new();
        let events = vec![
            SseEvent::MessageStart(json!({"type": "message_start"})),
            start_tool_use(0, "t1", "weather"),
            delta(0, "{\"city\":\"L"),
            delta(0, "A\"}"),
        ];
        for event in events {
            match state.intercept(event, owned) {
                Intercept::Forward(e) => forwarded.push(e),
                Intercept::Suppressed => {}
                Intercept::ToolCallReady { .. } => panic!("unexpected"),
            }
        }
        match state.intercept(stop(0), owned) {
            Intercept::ToolCallReady { name, id, args } => {
                state.finish_capture(name, id, args.unwrap(), Ok("72F".to_string()));
            }
            _ => panic!("expected ToolCallReady"),
        }

        // No tool_use content_block_start ever reached the client.
        assert!(forwarded
            .iter()
            .all(|e| !matches!(e, SseEvent::ContentBlockStart { value, .. }
                if value.get("content_block").and_then(|b| b.get("type")).and_then(|t| t.as_str()) == Some("tool_use"))));
        assert!(state.has_pending_results());

        let continuation = state.build_continuation(&json!({"messages": []}));
        let tool_result = &continuation["messages"][1]["content"][0];
        assert_eq!(tool_result["content"], "72F");
        assert_eq!(tool_result["tool_use_id"], "t1");
    }
}
