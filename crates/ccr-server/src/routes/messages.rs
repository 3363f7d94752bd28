//! `/v1/messages` and `/v1/messages/count_tokens` (§6). The streaming path
//! is grounded directly on `goose-server`'s `routes/reply.rs`: an
//! `SseResponse` wrapping a `ReceiverStream<String>`, fed by a spawned task
//! that owns a `CancellationToken` and tears down as soon as the client
//! hangs up. Where `reply()` drives `goose`'s own agent loop, this handler
//! drives the Routing Decider, the transformer pipeline, and the Stream
//! Interceptor / Agent Loop (§4.1, §4.3, §4.6) instead.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::HeaderMap as UpstreamHeaderMap;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use ccr_core::agent_loop::{execute_captured_tool, AgentLoopState, Intercept};
use ccr_core::config::Config;
use ccr_core::errors::{ErrorKind, ProxyError};
use ccr_core::message::MessagesRequest;
use ccr_core::router;
use ccr_core::sse::{FrameSplitter, SseEvent, SseParser};
use ccr_core::tokenizer::TokenCounter;
use ccr_core::tools::ToolContext;
use ccr_core::transformer::{Pipeline, TransformedRequest};
use ccr_core::upstream::{dispatch_stream, dispatch_unary, RetryPolicy};
use ccr_core::usage_cache::UsageSnapshot;

use crate::api_error::ApiError;
use crate::app_state::AppState;

const SESSION_HEADER: &str = "x-session-id";

fn session_id_from(headers: &HeaderMap) -> String {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn parse_request(body: Value) -> Result<MessagesRequest, ApiError> {
    serde_json::from_value(body).map_err(|err| {
        ApiError(
            ProxyError::new(ErrorKind::Unknown, format!("invalid request body: {err}"))
                .with_status(400),
        )
    })
}

pub struct SseResponse {
    rx: ReceiverStream<String>,
}

impl Stream for SseResponse {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx)
            .poll_next(cx)
            .map(|opt| opt.map(|s| Ok(Bytes::from(s))))
    }
}

impl IntoResponse for SseResponse {
    fn into_response(self) -> Response {
        let body = axum::body::Body::from_stream(self);
        axum::http::Response::builder()
            .header("Content-Type", "text/event-stream")
            .header("Cache-Control", "no-cache")
            .header("Connection", "keep-alive")
            .body(body)
            .expect("static SSE response headers are always valid")
    }
}

async fn send_event(tx: &mpsc::Sender<String>, cancel: &CancellationToken, event: &SseEvent) {
    if tx.send(event.to_frame()).await.is_err() {
        tracing::info!("client hung up mid-stream");
        cancel.cancel();
    }
}

async fn send_unary_error(tx: &mpsc::Sender<String>, cancel: &CancellationToken, err: &ProxyError) {
    let body = json!({
        "type": "error",
        "error": {"type": err.wire_type(), "message": err.to_string()},
    });
    let frame = format!("event: error\ndata: {body}\n\n");
    if tx.send(frame).await.is_err() {
        cancel.cancel();
    }
}

/// Route, transform, dispatch and intercept one request, splicing in any
/// tool-call continuations (§4.6.1) before the stream is considered
/// finished. Continuations re-enter routing and transformation exactly
/// like a fresh request, so this drains a work queue rather than
/// recursing: each continuation is pushed back onto `queue` instead of
/// being dispatched via a fresh self-HTTP call, which has the same
/// observable effect without the re-entrancy and auth-header bookkeeping a
/// literal loopback call would need.
///
/// Each queue entry carries whether it is a continuation (§4.6 Splicing:
/// "suppress the continuation's own message_start and message_stop") — only
/// the original request's `message_start`/`message_stop` are ever client
/// schema-visible as such. Since a continuation that itself triggers
/// another continuation never reaches its own `message_stop` (the outer
/// loop below breaks out of frame processing the moment it sees the
/// triggering `message_delta`), the only case where a continuation's
/// `message_stop` is actually suppressed is the terminal one — so once any
/// continuation has run, this function synthesizes a single closing
/// `message_stop` after the queue drains, keeping the client-visible
/// stream to exactly one `message_start`/`message_stop` pair.
async fn run_agent_stream(
    state: Arc<AppState>,
    config: Config,
    session_id: String,
    initial_request: MessagesRequest,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
    forwarded_count: &mut usize,
) -> Result<(), ProxyError> {
    let mut queue: VecDeque<(MessagesRequest, bool)> = VecDeque::new();
    queue.push_back((initial_request, false));
    let mut any_continuation = false;

    while let Some((mut req, is_continuation)) = queue.pop_front() {
        if cancel.is_cancelled() {
            break;
        }

        let token_counter = TokenCounter::for_model(&req.model);
        let decision = router::decide(&mut req, &config, &token_counter, &state.breaker, None)?;
        let provider = config
            .find_provider(&decision.provider)
            .cloned()
            .ok_or_else(|| {
                ProxyError::config(format!("routed provider '{}' not found", decision.provider))
            })?;

        let active_agents = state.agents.active_agents(&req);
        for definition in state.agents.tool_definitions(&active_agents) {
            if let Ok(tool_def) = serde_json::from_value(definition) {
                req.tools.push(tool_def);
            }
        }

        let pipeline = Pipeline::resolve(&state.registry, &provider, &decision.model)?;
        let body_value = serde_json::to_value(&req)
            .map_err(|err| ProxyError::new(ErrorKind::Unknown, err.to_string()))?;
        let original_body = body_value.clone();
        let initial = TransformedRequest {
            body: body_value,
            url: String::new(),
            headers: UpstreamHeaderMap::new(),
            timeout: Duration::from_millis(config.api_timeout_ms()),
        };
        let transformed = pipeline.apply_request(initial, &provider, &decision.model)?;

        let policy = RetryPolicy::default();
        let byte_stream = dispatch_stream(
            config.http_client(),
            &transformed,
            &policy,
            &state.breaker,
            &provider.name,
        )
        .await?;
        tokio::pin!(byte_stream);

        let mut splitter = FrameSplitter::new();
        let mut parser = SseParser::new();
        let mut stream_states = pipeline.new_stream_states();
        let mut agent_state = AgentLoopState::new();
        let mut continuation: Option<Value> = None;

        'frames: while let Some(chunk) = byte_stream.next().await {
            if cancel.is_cancelled() {
                break;
            }
            let chunk = chunk?;
            let text = String::from_utf8_lossy(&chunk).into_owned();
            for frame in splitter.feed(&text) {
                let Some(event) = parser.parse_frame(&frame) else {
                    continue;
                };
                let out_events =
                    pipeline.apply_response_events(event, &mut stream_states, &provider, &decision.model)?;
                for out_event in out_events {
                    if let SseEvent::MessageDelta(value) = &out_event {
                        if let Some(usage) = value.get("usage") {
                            state
                                .usage_cache
                                .record(&session_id, UsageSnapshot::from_usage_value(usage));
                        }
                    }

                    // A continuation's own `message_start`/`message_stop` never
                    // reach the client (§4.6 Splicing): the original request's
                    // pair is the only one the client-visible stream carries.
                    if is_continuation
                        && matches!(out_event, SseEvent::MessageStart(_) | SseEvent::MessageStop(_))
                    {
                        continue;
                    }

                    let active = &active_agents;
                    let owned = |name: &str| active.iter().any(|agent| agent.shares_name(name));
                    match agent_state.intercept(out_event, owned) {
                        Intercept::Forward(event) => {
                            let is_message_delta = matches!(event, SseEvent::MessageDelta(_));
                            if is_message_delta && agent_state.has_pending_results() {
                                // §4.6: this message_delta is the Splicing
                                // trigger itself — pause the outer stream here
                                // rather than forwarding it, and splice the
                                // continuation's events in its place.
                                continuation = Some(agent_state.build_continuation(&original_body));
                                agent_state.reset_after_continuation();
                                break 'frames;
                            }
                            send_event(&tx, &cancel, &event).await;
                            *forwarded_count += 1;
                        }
                        Intercept::Suppressed => {}
                        Intercept::ToolCallReady { name, id, args } => {
                            let ctx = ToolContext {
                                request: &req,
                                session_id: &session_id,
                            };
                            let (args_value, outcome) = match args {
                                Ok(value) => {
                                    let outcome = execute_captured_tool(
                                        &state.agents,
                                        &active_agents,
                                        &name,
                                        &value,
                                        &ctx,
                                    )
                                    .await;
                                    (value, outcome)
                                }
                                Err(raw) => {
                                    let message = format!("failed to parse tool input: {raw}");
                                    (Value::String(raw), Err(message))
                                }
                            };
                            agent_state.finish_capture(name, id, args_value, outcome);
                        }
                    }
                }
            }
        }

        if let Some(continuation_body) = continuation {
            let continuation_req: MessagesRequest = serde_json::from_value(continuation_body)
                .map_err(|err| ProxyError::new(ErrorKind::Unknown, err.to_string()))?;
            queue.push_back((continuation_req, true));
            any_continuation = true;
        }
    }

    if any_continuation && !cancel.is_cancelled() {
        let closing_stop = SseEvent::MessageStop(json!({"type": "message_stop"}));
        send_event(&tx, &cancel, &closing_stop).await;
        *forwarded_count += 1;
    }

    Ok(())
}

async fn messages_stream(
    state: Arc<AppState>,
    config: Config,
    session_id: String,
    req: MessagesRequest,
) -> SseResponse {
    let (tx, rx) = mpsc::channel(128);
    let cancel = CancellationToken::new();

    let task_tx = tx.clone();
    let task_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut forwarded_count = 0usize;
        let result = run_agent_stream(
            state,
            config,
            session_id,
            req,
            task_tx.clone(),
            task_cancel.clone(),
            &mut forwarded_count,
        )
        .await;

        if let Err(err) = result {
            tracing::warn!(error = %err, forwarded_count, "stream terminated with error");
            // §7: a unary error only makes sense if nothing reached the
            // client yet; once events were forwarded the connection is
            // simply allowed to end, since the client already received a
            // partial, valid SSE response.
            if forwarded_count == 0 {
                send_unary_error(&task_tx, &task_cancel, &err).await;
            }
        }
    });

    SseResponse {
        rx: ReceiverStream::new(rx),
    }
}

pub async fn create_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let mut req = parse_request(body)?;
    let config = state.config();
    let session_id = session_id_from(&headers);

    if req.stream {
        return Ok(messages_stream(state, config, session_id, req).await.into_response());
    }

    let token_counter = TokenCounter::for_model(&req.model);
    let decision = router::decide(&mut req, &config, &token_counter, &state.breaker, None)?;
    let provider = config
        .find_provider(&decision.provider)
        .cloned()
        .ok_or_else(|| ProxyError::config(format!("routed provider '{}' not found", decision.provider)))?;

    let active_agents = state.agents.active_agents(&req);
    for definition in state.agents.tool_definitions(&active_agents) {
        if let Ok(tool_def) = serde_json::from_value(definition) {
            req.tools.push(tool_def);
        }
    }

    let pipeline = Pipeline::resolve(&state.registry, &provider, &decision.model)?;
    let body_value =
        serde_json::to_value(&req).map_err(|err| ProxyError::new(ErrorKind::Unknown, err.to_string()))?;
    let initial = TransformedRequest {
        body: body_value,
        url: String::new(),
        headers: UpstreamHeaderMap::new(),
        timeout: Duration::from_millis(config.api_timeout_ms()),
    };
    let transformed = pipeline.apply_request(initial, &provider, &decision.model)?;

    let policy = RetryPolicy::default();
    let response_body = dispatch_unary(
        config.http_client(),
        &transformed,
        &policy,
        &state.breaker,
        &provider.name,
    )
    .await?;
    let out = pipeline.apply_response_unary(response_body, &provider, &decision.model)?;

    if let Some(usage) = out.get("usage") {
        state
            .usage_cache
            .record(&session_id, UsageSnapshot::from_usage_value(usage));
    }

    Ok((StatusCode::OK, Json(out)).into_response())
}

pub async fn count_tokens(Json(body): Json<Value>) -> Result<Json<Value>, ApiError> {
    let req = parse_request(body)?;
    let counter = TokenCounter::for_model(&req.model);
    let input_tokens = counter.count_request(&req);
    Ok(Json(json!({ "input_tokens": input_tokens })))
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/messages", post(create_message))
        .route("/v1/messages/count_tokens", post(count_tokens))
}
