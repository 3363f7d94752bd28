//! Local tools and the agents that own them (§3 "Agent", §4.6 "Tools are
//! functions `(args, {req, config}) → result-string`"). Deliberately plain
//! async functions behind a small trait rather than MCP calls: this proxy's
//! tool execution is local to the request handler, not a call to an
//! external MCP server the way `goose`'s `mcp-client`/`mcp-core` crates
//! model it. `EchoTool`/`ClockTool` are fixtures exercising the agent loop
//! end-to-end; real deployments register their own `Tool` impls the same
//! way.

use async_trait::async_trait;
use serde_json::Value;

use crate::message::MessagesRequest;

/// Context handed to a tool alongside its parsed arguments: the in-flight
/// request (read-only) and anything else a real tool might need from
/// config. Kept intentionally thin; tools that need upstream credentials
/// or HTTP access take their own dependencies at construction time instead
/// of reaching through this context.
pub struct ToolContext<'a> {
    pub request: &'a MessagesRequest,
    pub session_id: &'a str,
}

/// A locally-executed tool. `execute` never returns `Err` for tool-logic
/// failures (§4.6 "a tool that throws produces a synthetic tool_result
/// whose content is the error message") — callers convert a `Result::Err`
/// the same way, but a tool is free to just put the failure text in its
/// `Ok` string instead.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> Value;

    async fn execute(&self, args: &Value, ctx: &ToolContext<'_>) -> Result<String, String>;
}

pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echoes back the provided text argument, unchanged."
    }

    fn input_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        })
    }

    async fn execute(&self, args: &Value, _ctx: &ToolContext<'_>) -> Result<String, String> {
        match args.get("text").and_then(|v| v.as_str()) {
            Some(text) => Ok(text.to_string()),
            None => Err("echo requires a \"text\" string argument".to_string()),
        }
    }
}

pub struct ClockTool;

#[async_trait]
impl Tool for ClockTool {
    fn name(&self) -> &str {
        "clock"
    }

    fn description(&self) -> &str {
        "Returns the current UTC time in RFC 3339 format."
    }

    fn input_schema(&self) -> Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _args: &Value, _ctx: &ToolContext<'_>) -> Result<String, String> {
        Ok(chrono::Utc::now().to_rfc3339())
    }
}

/// A registered bundle of tools plus the predicate deciding, per request,
/// whether this bundle's tools are active (§3 "Agent"). Agents are
/// evaluated once per request at the top of the agent loop; their union of
/// owned tool names is what the Stream Interceptor (§4.6) watches for.
pub struct Agent {
    pub name: String,
    pub tools: Vec<Box<dyn Tool>>,
    should_handle: Box<dyn Fn(&MessagesRequest) -> bool + Send + Sync>,
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        tools: Vec<Box<dyn Tool>>,
        should_handle: impl Fn(&MessagesRequest) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            tools,
            should_handle: Box::new(should_handle),
        }
    }

    /// An agent always active, regardless of request shape; used for the
    /// built-in fixture agent and any deployment wanting its tools present
    /// on every turn.
    pub fn always(name: impl Into<String>, tools: Vec<Box<dyn Tool>>) -> Self {
        Self::new(name, tools, |_| true)
    }

    pub fn shares_name(&self, other: &str) -> bool {
        self.tools.iter().any(|t| t.name() == other)
    }
}

/// Process-owned, read-mostly collection of configured agents (mirrors the
/// Transformer Registry's lifecycle per §5: built at startup, swapped whole
/// on reload, read concurrently by every in-flight request).
#[derive(Default)]
pub struct AgentRegistry {
    agents: Vec<Agent>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: Agent) {
        self.agents.push(agent);
    }

    /// Agents whose `shouldHandle` predicate is true for this request.
    pub fn active_agents(&self, request: &MessagesRequest) -> Vec<&Agent> {
        self.agents.iter().filter(|a| (a.should_handle)(request)).collect()
    }

    /// Look up the tool implementation owning `tool_name`, searching only
    /// among the agents active for this request (§4.6: the interceptor
    /// only captures tool calls "owned by some active agent").
    pub fn find_tool<'a>(
        &'a self,
        active: &[&'a Agent],
        tool_name: &str,
    ) -> Option<&'a dyn Tool> {
        active
            .iter()
            .flat_map(|a| a.tools.iter())
            .find(|t| t.name() == tool_name)
            .map(|t| t.as_ref())
    }

    /// All tool definitions across active agents, for injection into the
    /// outgoing request's `tools` array.
    pub fn tool_definitions(&self, active: &[&Agent]) -> Vec<Value> {
        active
            .iter()
            .flat_map(|a| a.tools.iter())
            .map(|t| {
                serde_json::json!({
                    "name": t.name(),
                    "description": t.description(),
                    "input_schema": t.input_schema(),
                })
            })
            .collect()
    }

    pub fn builtin_fixtures() -> Self {
        let mut registry = Self::new();
        registry.register(Agent::always(
            "fixtures",
            vec![Box::new(EchoTool), Box::new(ClockTool)],
        ));
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_request() -> MessagesRequest {
        serde_json::from_value(json!({
            "model": "m",
            "max_tokens": 10,
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn echo_tool_returns_input_text() {
        let tool = EchoTool;
        let req = sample_request();
        let ctx = ToolContext {
            request: &req,
            session_id: "s1",
        };
        let out = tool.execute(&json!({"text": "hello"}), &ctx).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn echo_tool_errors_without_text_argument() {
        let tool = EchoTool;
        let req = sample_request();
        let ctx = ToolContext {
            request: &req,
            session_id: "s1",
        };
        assert!(tool.execute(&json!({}), &ctx).await.is_err());
    }

    #[tokio::test]
    async fn clock_tool_returns_rfc3339_timestamp() {
        let tool = ClockTool;
        let req = sample_request();
        let ctx = ToolContext {
            request: &req,
            session_id: "s1",
        };
        let out = tool.execute(&json!({}), &ctx).await.unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(&out).is_ok());
    }

    #[test]
    fn registry_finds_tool_only_among_active_agents() {
        let registry = AgentRegistry::builtin_fixtures();
        let req = sample_request();
        let active = registry.active_agents(&req);
        assert!(registry.find_tool(&active, "echo").is_some());
        assert!(registry.find_tool(&active, "nonexistent").is_none());
    }
}
