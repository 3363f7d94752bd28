//! Built-in transformers (§4.3, SPEC_FULL "Supplemented Features").
//! `anthropic` and `openai` are wire-format adapters; `maxtoken`, `tooluse`,
//! and `reasoning` are request-shaping middlewares applied alongside one of
//! them. Auth header construction follows `goose`'s
//! `provider_common::HeaderBuilder`/`AuthType` pattern: one small builder,
//! one `AUTHORIZATION`-or-named-header branch, no per-provider special
//! casing beyond that.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{json, Map, Value};

use crate::errors::ProxyError;
use crate::sse::SseEvent;

use super::{Transformer, TransformContext, TransformedRequest, TransformerStreamState};

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        headers.insert(name, value);
    }
}

pub struct AnthropicTransformer;

impl Transformer for AnthropicTransformer {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn endpoint(&self) -> Option<&'static str> {
        Some("/v1/messages")
    }

    fn request_in(
        &self,
        mut request: TransformedRequest,
        ctx: &TransformContext,
    ) -> Result<TransformedRequest, ProxyError> {
        if let Value::Object(map) = &mut request.body {
            map.insert("model".to_string(), Value::String(ctx.model.clone()));
        }
        request.url = ctx.provider.api_base_url.clone();
        insert_header(&mut request.headers, "x-api-key", &ctx.provider.api_key);
        insert_header(&mut request.headers, "anthropic-version", "2023-06-01");
        insert_header(&mut request.headers, "content-type", "application/json");
        Ok(request)
    }
}

pub struct OpenAiTransformer;

fn anthropic_messages_to_openai(body: &Value) -> Vec<Value> {
    let mut out = Vec::new();
    if let Some(system) = body.get("system") {
        let text = match system {
            Value::String(s) => s.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        };
        if !text.is_empty() {
            out.push(json!({"role": "system", "content": text}));
        }
    }

    for message in body.get("messages").and_then(|m| m.as_array()).into_iter().flatten() {
        let role = message.get("role").and_then(|r| r.as_str()).unwrap_or("user");
        let content = message.get("content").cloned().unwrap_or(Value::Null);
        match content {
            Value::String(text) => {
                out.push(json!({"role": role, "content": text}));
            }
            Value::Array(blocks) => {
                let mut text_parts = Vec::new();
                let mut tool_calls = Vec::new();
                for block in &blocks {
                    match block.get("type").and_then(|t| t.as_str()) {
                        Some("text") => {
                            if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                                text_parts.push(t.to_string());
                            }
                        }
                        Some("tool_use") => {
                            tool_calls.push(json!({
                                "id": block.get("id").cloned().unwrap_or(Value::Null),
                                "type": "function",
                                "function": {
                                    "name": block.get("name").cloned().unwrap_or(Value::Null),
                                    "arguments": block.get("input")
                                        .map(|v| v.to_string())
                                        .unwrap_or_else(|| "{}".to_string()),
                                }
                            }));
                        }
                        Some("tool_result") => {
                            let tool_call_id = block
                                .get("tool_use_id")
                                .and_then(|v| v.as_str())
                                .unwrap_or_default();
                            let content_text = match block.get("content") {
                                Some(Value::String(s)) => s.clone(),
                                Some(Value::Array(parts)) => parts
                                    .iter()
                                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                                    .collect::<Vec<_>>()
                                    .join(""),
                                _ => String::new(),
                            };
                            out.push(json!({
                                "role": "tool",
                                "tool_call_id": tool_call_id,
                                "content": content_text,
                            }));
                        }
                        _ => {}
                    }
                }
                if !tool_calls.is_empty() {
                    out.push(json!({
                        "role": "assistant",
                        "content": if text_parts.is_empty() { Value::Null } else { Value::String(text_parts.join("")) },
                        "tool_calls": tool_calls,
                    }));
                } else if !text_parts.is_empty() {
                    out.push(json!({"role": role, "content": text_parts.join("")}));
                }
            }
            _ => {}
        }
    }
    out
}

fn anthropic_tools_to_openai(body: &Value) -> Option<Value> {
    let tools = body.get("tools")?.as_array()?;
    if tools.is_empty() {
        return None;
    }
    let converted: Vec<Value> = tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.get("name").cloned().unwrap_or(Value::Null),
                    "description": t.get("description").cloned().unwrap_or(Value::String(String::new())),
                    "parameters": t.get("input_schema").cloned().unwrap_or(json!({"type": "object"})),
                }
            })
        })
        .collect();
    Some(Value::Array(converted))
}

impl Transformer for OpenAiTransformer {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn request_in(
        &self,
        mut request: TransformedRequest,
        ctx: &TransformContext,
    ) -> Result<TransformedRequest, ProxyError> {
        let messages = anthropic_messages_to_openai(&request.body);
        let tools = anthropic_tools_to_openai(&request.body);
        let stream = request
            .body
            .get("stream")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let max_tokens = request
            .body
            .get("max_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(4096);

        let mut openai_body = Map::new();
        openai_body.insert("model".to_string(), Value::String(ctx.model.clone()));
        openai_body.insert("messages".to_string(), Value::Array(messages));
        openai_body.insert("max_tokens".to_string(), Value::from(max_tokens));
        openai_body.insert("stream".to_string(), Value::Bool(stream));
        if let Some(tools) = tools {
            openai_body.insert("tools".to_string(), tools);
        }

        request.body = Value::Object(openai_body);
        request.url = ctx.provider.api_base_url.clone();
        insert_header(
            &mut request.headers,
            "authorization",
            &format!("Bearer {}", ctx.provider.api_key),
        );
        insert_header(&mut request.headers, "content-type", "application/json");
        Ok(request)
    }

    fn response_out_unary(&self, body: Value, _ctx: &TransformContext) -> Result<Value, ProxyError> {
        let choice = body.get("choices").and_then(|c| c.get(0));
        let message = choice.and_then(|c| c.get("message"));
        let mut content = Vec::new();

        if let Some(text) = message.and_then(|m| m.get("content")).and_then(|c| c.as_str()) {
            if !text.is_empty() {
                content.push(json!({"type": "text", "text": text}));
            }
        }
        for call in message
            .and_then(|m| m.get("tool_calls"))
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
        {
            let input = call
                .get("function")
                .and_then(|f| f.get("arguments"))
                .and_then(|a| a.as_str())
                .and_then(|s| serde_json::from_str::<Value>(s).ok())
                .unwrap_or(json!({}));
            content.push(json!({
                "type": "tool_use",
                "id": call.get("id").cloned().unwrap_or(Value::Null),
                "name": call.get("function").and_then(|f| f.get("name")).cloned().unwrap_or(Value::Null),
                "input": input,
            }));
        }

        let finish_reason = choice.and_then(|c| c.get("finish_reason")).and_then(|f| f.as_str());
        let stop_reason = match finish_reason {
            Some("stop") => "end_turn",
            Some("length") => "max_tokens",
            Some("tool_calls") => "tool_use",
            _ => "end_turn",
        };

        let usage = body.get("usage").cloned().unwrap_or(json!({}));
        Ok(json!({
            "id": body.get("id").cloned().unwrap_or(Value::Null),
            "type": "message",
            "role": "assistant",
            "content": content,
            "stop_reason": stop_reason,
            "usage": {
                "input_tokens": usage.get("prompt_tokens").cloned().unwrap_or(Value::from(0)),
                "output_tokens": usage.get("completion_tokens").cloned().unwrap_or(Value::from(0)),
            }
        }))
    }

    fn new_stream_state(&self) -> Box<dyn TransformerStreamState> {
        Box::new(OpenAiStreamState::default())
    }
}

#[derive(Default)]
struct OpenAiStreamState {
    started: bool,
    text_block_open: bool,
    tool_block_open: Option<usize>,
    next_index: usize,
}

impl TransformerStreamState for OpenAiStreamState {
    fn transform_event(
        &mut self,
        event: SseEvent,
        _ctx: &TransformContext,
    ) -> Result<Vec<SseEvent>, ProxyError> {
        // Only Unknown events originate from an OpenAI-native chunk; the
        // SSE parser cannot tag them with an Anthropic event name since
        // OpenAI chunks carry no `event:` line and a different `object`
        // discriminator.
        let Some(value) = (match &event {
            SseEvent::Unknown { value, .. } => Some(value.clone()),
            _ => None,
        }) else {
            return Ok(vec![event]);
        };

        let mut out = Vec::new();
        if !self.started {
            self.started = true;
            out.push(SseEvent::MessageStart(json!({
                "type": "message_start",
                "message": {"id": value.get("id").cloned().unwrap_or(Value::Null), "role": "assistant", "content": []}
            })));
        }

        let delta = value
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("delta"))
            .cloned()
            .unwrap_or(Value::Null);
        let finish_reason = value
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("finish_reason"))
            .and_then(|f| f.as_str());

        if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
            if !self.text_block_open {
                self.text_block_open = true;
                let index = self.next_index;
                self.next_index += 1;
                out.push(SseEvent::ContentBlockStart {
                    index,
                    value: json!({
                        "type": "content_block_start", "index": index,
                        "content_block": {"type": "text", "text": ""}
                    }),
                });
            }
            let index = self.next_index - 1;
            out.push(SseEvent::ContentBlockDelta {
                index,
                value: json!({
                    "type": "content_block_delta", "index": index,
                    "delta": {"type": "text_delta", "text": text}
                }),
            });
        }

        if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
            for call in tool_calls {
                let index = self.tool_block_open.unwrap_or_else(|| {
                    let idx = self.next_index;
                    self.next_index += 1;
                    self.tool_block_open = Some(idx);
                    idx
                });
                if let Some(function) = call.get("function") {
                    if let Some(name) = function.get("name").and_then(|n| n.as_str()) {
                        out.push(SseEvent::ContentBlockStart {
                            index,
                            value: json!({
                                "type": "content_block_start", "index": index,
                                "content_block": {
                                    "type": "tool_use",
                                    "id": call.get("id").cloned().unwrap_or(Value::Null),
                                    "name": name,
                                    "input": {}
                                }
                            }),
                        });
                    }
                    if let Some(args) = function.get("arguments").and_then(|a| a.as_str()) {
                        out.push(SseEvent::ContentBlockDelta {
                            index,
                            value: json!({
                                "type": "content_block_delta", "index": index,
                                "delta": {"type": "input_json_delta", "partial_json": args}
                            }),
                        });
                    }
                }
            }
        }

        if let Some(reason) = finish_reason {
            if self.text_block_open || self.tool_block_open.is_some() {
                let index = self.next_index - 1;
                out.push(SseEvent::ContentBlockStop {
                    index,
                    value: json!({"type": "content_block_stop", "index": index}),
                });
            }
            let stop_reason = match reason {
                "stop" => "end_turn",
                "length" => "max_tokens",
                "tool_calls" => "tool_use",
                other => other,
            };
            out.push(SseEvent::MessageDelta(json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason},
                "usage": value.get("usage").cloned().unwrap_or(json!({}))
            })));
            out.push(SseEvent::MessageStop(json!({"type": "message_stop"})));
        }

        Ok(out)
    }
}

/// Clamps `max_tokens` to the configured ceiling, leaving it untouched when
/// the request already asks for less (the supplemented `maxtoken` option
/// from SPEC_FULL, mirroring the `["maxtoken", {"max_tokens": N}]` entries
/// used against chat-completions providers with smaller context windows).
pub struct MaxTokenTransformer;

impl Transformer for MaxTokenTransformer {
    fn name(&self) -> &'static str {
        "maxtoken"
    }

    fn request_in(
        &self,
        mut request: TransformedRequest,
        ctx: &TransformContext,
    ) -> Result<TransformedRequest, ProxyError> {
        let Some(ceiling) = ctx.options.get("max_tokens").and_then(|v| v.as_u64()) else {
            return Ok(request);
        };
        if let Value::Object(map) = &mut request.body {
            let current = map.get("max_tokens").and_then(|v| v.as_u64());
            let clamped = current.map(|c| c.min(ceiling)).unwrap_or(ceiling);
            map.insert("max_tokens".to_string(), Value::from(clamped));
        }
        Ok(request)
    }
}

/// Rewrites declared tools into a system-prompt text block instead of the
/// provider's native tool-calling field, for upstreams whose tool-calling
/// support is unreliable (the `tooluse` transformer named in SPEC_FULL's
/// supplemented features).
pub struct ToolUseTransformer;

fn render_tools_as_text(tools: &[Value]) -> String {
    let mut out = String::from(
        "You have access to the following tools. To use a tool, respond with a JSON object of the form \
         {\"tool\": \"<name>\", \"input\": { ... }} and nothing else.\n\n",
    );
    for tool in tools {
        let name = tool.get("name").and_then(|n| n.as_str()).unwrap_or("unknown");
        let description = tool.get("description").and_then(|d| d.as_str()).unwrap_or("");
        let schema = tool
            .get("input_schema")
            .map(|s| s.to_string())
            .unwrap_or_else(|| "{}".to_string());
        out.push_str(&format!("- {name}: {description}\n  schema: {schema}\n"));
    }
    out
}

impl Transformer for ToolUseTransformer {
    fn name(&self) -> &'static str {
        "tooluse"
    }

    fn request_in(
        &self,
        mut request: TransformedRequest,
        _ctx: &TransformContext,
    ) -> Result<TransformedRequest, ProxyError> {
        let Value::Object(map) = &mut request.body else {
            return Ok(request);
        };
        let tools = map
            .get("tools")
            .and_then(|t| t.as_array())
            .cloned()
            .unwrap_or_default();
        if tools.is_empty() {
            return Ok(request);
        }

        let tool_text = render_tools_as_text(&tools);
        let existing_system = map.get("system").cloned();
        let merged = match existing_system {
            Some(Value::String(s)) => format!("{s}\n\n{tool_text}"),
            Some(Value::Array(parts)) => {
                let joined = parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n");
                format!("{joined}\n\n{tool_text}")
            }
            _ => tool_text,
        };
        map.insert("system".to_string(), Value::String(merged));
        map.remove("tools");
        Ok(request)
    }
}

/// Reshapes `thinking`/reasoning content between Anthropic's `thinking`
/// content-block shape and a provider's own `reasoning`/`reasoning_content`
/// field (SPEC_FULL supplemented feature). Request-side, translates the
/// Anthropic `thinking` request flag into the option-configured provider
/// field name; response-side, renames the provider's reasoning field back
/// into an Anthropic `thinking` content block.
pub struct ReasoningTransformer;

impl Transformer for ReasoningTransformer {
    fn name(&self) -> &'static str {
        "reasoning"
    }

    fn request_in(
        &self,
        mut request: TransformedRequest,
        ctx: &TransformContext,
    ) -> Result<TransformedRequest, ProxyError> {
        let Value::Object(map) = &mut request.body else {
            return Ok(request);
        };
        let Some(thinking) = map.remove("thinking") else {
            return Ok(request);
        };
        let enabled = match &thinking {
            Value::Bool(b) => *b,
            Value::Object(o) => o.get("type").and_then(|t| t.as_str()) != Some("disabled"),
            _ => false,
        };
        if !enabled {
            return Ok(request);
        }
        let field_name = ctx
            .options
            .get("field")
            .and_then(|v| v.as_str())
            .unwrap_or("reasoning");
        map.insert(field_name.to_string(), Value::Bool(true));
        Ok(request)
    }

    fn response_out_unary(&self, mut body: Value, ctx: &TransformContext) -> Result<Value, ProxyError> {
        let field_name = ctx
            .options
            .get("field")
            .and_then(|v| v.as_str())
            .unwrap_or("reasoning")
            .to_string();
        if let Some(content) = body.get_mut("content").and_then(|c| c.as_array_mut()) {
            for block in content.iter_mut() {
                if block.get("type").and_then(|t| t.as_str()) == Some(field_name.as_str()) {
                    if let Some(obj) = block.as_object_mut() {
                        let text = obj
                            .remove(&field_name)
                            .or_else(|| obj.remove("text"))
                            .unwrap_or(Value::String(String::new()));
                        obj.clear();
                        obj.insert("type".to_string(), Value::String("thinking".to_string()));
                        obj.insert("thinking".to_string(), text);
                    }
                }
            }
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Provider;
    use std::time::Duration;

    fn provider() -> Provider {
        serde_json::from_value(json!({
            "name": "p1",
            "api_base_url": "https://p1.example.com/v1/chat/completions",
            "api_key": "sk-test",
            "models": ["m1"],
        }))
        .unwrap()
    }

    fn blank_request(body: Value) -> TransformedRequest {
        TransformedRequest {
            body,
            url: String::new(),
            headers: HeaderMap::new(),
            timeout: Duration::from_secs(60),
        }
    }

    #[test]
    fn anthropic_sets_model_and_auth_header() {
        let transformer = AnthropicTransformer;
        let ctx = TransformContext {
            provider: provider(),
            model: "claude-3-5-sonnet".to_string(),
            options: json!({}),
        };
        let out = transformer
            .request_in(blank_request(json!({"model": "p1,claude-3-5-sonnet"})), &ctx)
            .unwrap();
        assert_eq!(out.body["model"], "claude-3-5-sonnet");
        assert_eq!(out.headers.get("x-api-key").unwrap(), "sk-test");
    }

    #[test]
    fn maxtoken_clamps_down_not_up() {
        let transformer = MaxTokenTransformer;
        let ctx = TransformContext {
            provider: provider(),
            model: "m1".to_string(),
            options: json!({"max_tokens": 1000}),
        };
        let out = transformer
            .request_in(blank_request(json!({"max_tokens": 5000})), &ctx)
            .unwrap();
        assert_eq!(out.body["max_tokens"], 1000);

        let out2 = transformer
            .request_in(blank_request(json!({"max_tokens": 200})), &ctx)
            .unwrap();
        assert_eq!(out2.body["max_tokens"], 200);
    }

    #[test]
    fn tooluse_moves_tools_into_system_text() {
        let transformer = ToolUseTransformer;
        let ctx = TransformContext {
            provider: provider(),
            model: "m1".to_string(),
            options: json!({}),
        };
        let out = transformer
            .request_in(
                blank_request(json!({
                    "system": "be terse",
                    "tools": [{"name": "weather", "description": "get weather", "input_schema": {"type": "object"}}]
                })),
                &ctx,
            )
            .unwrap();
        assert!(out.body.get("tools").is_none());
        let system = out.body["system"].as_str().unwrap();
        assert!(system.contains("be terse"));
        assert!(system.contains("weather"));
    }

    #[test]
    fn reasoning_sets_provider_field_when_thinking_enabled() {
        let transformer = ReasoningTransformer;
        let ctx = TransformContext {
            provider: provider(),
            model: "m1".to_string(),
            options: json!({"field": "reasoning"}),
        };
        let out = transformer
            .request_in(blank_request(json!({"thinking": true})), &ctx)
            .unwrap();
        assert_eq!(out.body["reasoning"], true);
        assert!(out.body.get("thinking").is_none());
    }

    #[test]
    fn reasoning_response_renames_block_to_thinking() {
        let transformer = ReasoningTransformer;
        let ctx = TransformContext {
            provider: provider(),
            model: "m1".to_string(),
            options: json!({"field": "reasoning"}),
        };
        let body = json!({"content": [{"type": "reasoning", "reasoning": "because..."}]});
        let out = transformer.response_out_unary(body, &ctx).unwrap();
        assert_eq!(out["content"][0]["type"], "thinking");
        assert_eq!(out["content"][0]["thinking"], "because...");
    }

    #[test]
    fn openai_unary_response_converts_tool_call_to_tool_use_block() {
        let transformer = OpenAiTransformer;
        let ctx = TransformContext {
            provider: provider(),
            model: "m1".to_string(),
            options: json!({}),
        };
        let body = json!({
            "id": "chatcmpl-1",
            "choices": [{
                "finish_reason": "tool_calls",
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{"id": "call_1", "function": {"name": "weather", "arguments": "{\"city\":\"LA\"}"}}]
                }
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5}
        });
        let out = transformer.response_out_unary(body, &ctx).unwrap();
        assert_eq!(out["stop_reason"], "tool_use");
        assert_eq!(out["content"][0]["type"], "tool_use");
        assert_eq!(out["content"][0]["input"]["city"], "LA");
        assert_eq!(out["usage"]["input_tokens"], 10);
    }

    #[test]
    fn openai_stream_state_converts_text_delta_chunks() {
        let transformer = OpenAiTransformer;
        let mut state = transformer.new_stream_state();
        let ctx = TransformContext {
            provider: provider(),
            model: "m1".to_string(),
            options: json!({}),
        };
        let chunk = SseEvent::Unknown {
            event_type: "unknown".to_string(),
            value: json!({
                "id": "chatcmpl-1",
                "choices": [{"delta": {"content": "hi"}, "finish_reason": Value::Null}]
            }),
        };
        let events = state.transform_event(chunk, &ctx).unwrap();
        assert!(events.iter().any(|e| matches!(e, SseEvent::MessageStart(_))));
        assert!(events
            .iter()
            .any(|e| matches!(e, SseEvent::ContentBlockStart { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, SseEvent::ContentBlockDelta { .. })));

        let final_chunk = SseEvent::Unknown {
            event_type: "unknown".to_string(),
            value: json!({"choices": [{"delta": {}, "finish_reason": "stop"}]}),
        };
        let final_events = state.transform_event(final_chunk, &ctx).unwrap();
        assert!(final_events
            .iter()
            .any(|e| matches!(e, SseEvent::ContentBlockStop { .. })));
        assert!(final_events
            .iter()
            .any(|e| matches!(e, SseEvent::MessageStop(_))));
    }
}
