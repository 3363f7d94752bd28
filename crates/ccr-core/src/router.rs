//! The Routing Decider (§4.1): a fixed-order, deterministic set of rules
//! choosing `(provider, model)` for a request. Structured as a sequence of
//! early-return checks the way `goose::providers::factory::create` dispatches
//! on a provider name through a fixed match, except each rule here inspects
//! the request instead of a config key.

use once_cell_like::OnceRegex;
use serde_json::Value;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::{Config, Route};
use crate::errors::ProxyError;
use crate::message::MessagesRequest;
use crate::tokenizer::TokenCounter;

/// Why a route was chosen, attached to the terminal request log per §7
/// ("terminal event logs... route decision").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteReason {
    ExplicitModel,
    CustomRouter,
    LongContext,
    SubagentDirective,
    ToolUseRouterDirective,
    Background,
    Think,
    WebSearch,
    ToolUse,
    Default,
    CircuitBreakerFallback,
}

impl RouteReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RouteReason::ExplicitModel => "explicit_model",
            RouteReason::CustomRouter => "custom_router",
            RouteReason::LongContext => "long_context",
            RouteReason::SubagentDirective => "subagent_directive",
            RouteReason::ToolUseRouterDirective => "tooluse_router_directive",
            RouteReason::Background => "background",
            RouteReason::Think => "think",
            RouteReason::WebSearch => "web_search",
            RouteReason::ToolUse => "tool_use",
            RouteReason::Default => "default",
            RouteReason::CircuitBreakerFallback => "circuit_breaker_fallback",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub provider: String,
    pub model: String,
    pub reason: RouteReason,
}

impl RouteDecision {
    pub fn as_model_string(&self) -> String {
        format!("{},{}", self.provider, self.model)
    }
}

/// Signature an external custom router (loaded from `CUSTOM_ROUTER_PATH`)
/// would satisfy. SPEC_FULL scopes dynamic filesystem loading of custom
/// routers out (§9 "separate the transformer contract from the loading
/// mechanism... custom loading is optional"); this trait is the seam a
/// future loader would populate. Tests exercise it with a closure.
pub trait CustomRouter: Send + Sync {
    fn route(&self, req: &MessagesRequest) -> Option<String>;
}

mod once_cell_like {
    //! Lazily-built `Regex`s without committing the whole crate to
    //! `once_cell`/`lazy_static` for two patterns; `goose` and the rest of
    //! the pack reach for `lazy_static` for registries, not ad hoc regexes,
    //! so this stays local and minimal.
    use regex::Regex;
    use std::sync::OnceLock;

    pub struct OnceRegex(OnceLock<Regex>, &'static str);

    impl OnceRegex {
        pub const fn new(pattern: &'static str) -> Self {
            Self(OnceLock::new(), pattern)
        }

        pub fn get(&self) -> &Regex {
            self.0
                .get_or_init(|| Regex::new(self.1).expect("static directive regex must compile"))
        }
    }
}

static SUBAGENT_DIRECTIVE: OnceRegex =
    OnceRegex::new(r"(?s)<CCR-SUBAGENT-MODEL>(.*?)</CCR-SUBAGENT-MODEL>");
static TOOLUSE_ROUTER_DIRECTIVE: OnceRegex =
    OnceRegex::new(r"(?s)<CCR-TOOLUSE-ROUTER>(.*?)</CCR-TOOLUSE-ROUTER>");

/// Run the §4.1 algorithm to completion, mutating `req.model` and, when a
/// directive was present, the matching system block's text. Routing
/// failures are non-fatal (§4.1 "on any exception the decider assigns
/// default and logs"); this function itself cannot fail except when even
/// `default` does not resolve, which is a `ConfigError`.
pub fn decide(
    req: &mut MessagesRequest,
    config: &Config,
    token_counter: &TokenCounter,
    breaker: &CircuitBreakerRegistry,
    custom_router: Option<&dyn CustomRouter>,
) -> Result<RouteDecision, ProxyError> {
    let raw = decide_inner(req, config, token_counter, custom_router).unwrap_or_else(|| {
        tracing::warn!("routing decision fell through to default unexpectedly");
        resolve_or_none(config, &config.router().default, RouteReason::Default)
            .expect("default route must resolve; validated at config load")
    });

    let finalized = apply_circuit_breaker(raw, config, breaker)?;
    req.model = finalized.as_model_string();
    Ok(finalized)
}

fn resolve_or_none(config: &Config, value: &str, reason: RouteReason) -> Option<RouteDecision> {
    config.resolve_route(value).map(|Route { provider, model }| RouteDecision {
        provider,
        model,
        reason,
    })
}

fn decide_inner(
    req: &mut MessagesRequest,
    config: &Config,
    token_counter: &TokenCounter,
    custom_router: Option<&dyn CustomRouter>,
) -> Option<RouteDecision> {
    // 1. explicit "<provider>,<model>" already on the wire.
    if let Some(decision) = resolve_or_none(config, &req.model, RouteReason::ExplicitModel) {
        return Some(decision);
    }

    // 2. external custom router, best-effort.
    if let Some(router) = custom_router {
        if let Some(value) = router.route(req) {
            if let Some(decision) = resolve_or_none(config, &value, RouteReason::CustomRouter) {
                return Some(decision);
            }
            tracing::warn!(value = %value, "custom router returned an unresolvable provider,model pair; falling through");
        }
    }

    // 3. long context.
    let router_cfg = config.router();
    if let Some(long_context) = &router_cfg.long_context {
        let token_count = token_counter.count_request(req);
        if token_count as u64 > router_cfg.long_context_threshold {
            if let Some(decision) = resolve_or_none(config, long_context, RouteReason::LongContext) {
                return Some(decision);
            }
        }
    }

    // 4. inline directives, scanned and stripped regardless of outcome.
    if let Some(system) = req.system.as_mut() {
        let text = system.joined_text();
        if let Some(caps) = SUBAGENT_DIRECTIVE.get().captures(&text) {
            let full_match = caps.get(0).unwrap().as_str().to_string();
            let value = caps.get(1).unwrap().as_str().trim().to_string();
            system.replace_text(&full_match, "");
            if let Some(decision) = resolve_or_none(config, &value, RouteReason::SubagentDirective) {
                return Some(decision);
            }
        } else if let Some(caps) = TOOLUSE_ROUTER_DIRECTIVE.get().captures(&text) {
            let full_match = caps.get(0).unwrap().as_str().to_string();
            let value = caps.get(1).unwrap().as_str().trim().to_string();
            system.replace_text(&full_match, "");
            if let Some(decision) =
                resolve_or_none(config, &value, RouteReason::ToolUseRouterDirective)
            {
                return Some(decision);
            }
        }
    }

    // 5. background (haiku fast path).
    if req.model.starts_with("claude-3-5-haiku") {
        if let Some(background) = &router_cfg.background {
            if let Some(decision) = resolve_or_none(config, background, RouteReason::Background) {
                return Some(decision);
            }
        }
    }

    // 6. thinking.
    if req.thinking_enabled() {
        if let Some(think) = &router_cfg.think {
            if let Some(decision) = resolve_or_none(config, think, RouteReason::Think) {
                return Some(decision);
            }
        }
    }

    // 7. web search tool present.
    if req.has_web_search_tool() {
        if let Some(web_search) = &router_cfg.web_search {
            if let Some(decision) = resolve_or_none(config, web_search, RouteReason::WebSearch) {
                return Some(decision);
            }
        }
    }

    // 8. tool use: explicit non-web-search tools, or in-flight tool blocks.
    let has_non_search_tools = !req.tools.is_empty() && !req.has_web_search_tool();
    if has_non_search_tools || req.has_in_flight_tool_blocks() {
        if let Some(tool_use) = &router_cfg.tool_use {
            if let Some(decision) = resolve_or_none(config, tool_use, RouteReason::ToolUse) {
                return Some(decision);
            }
        }
    }

    // 9. default.
    resolve_or_none(config, &router_cfg.default, RouteReason::Default)
}

fn apply_circuit_breaker(
    decision: RouteDecision,
    config: &Config,
    breaker: &CircuitBreakerRegistry,
) -> Result<RouteDecision, ProxyError> {
    if breaker.allow_request(&decision.provider) {
        return Ok(decision);
    }

    let router = config.router();
    if let Some(fallback) = &router.fallback {
        if let Some(fallback_decision) =
            resolve_or_none(config, fallback, RouteReason::CircuitBreakerFallback)
        {
            if fallback_decision.provider != decision.provider {
                tracing::warn!(
                    provider = %decision.provider,
                    fallback = %fallback_decision.provider,
                    "circuit breaker open, rerouting to fallback"
                );
                return Ok(fallback_decision);
            }
        }
    }

    Err(ProxyError::circuit_breaker(decision.provider))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config_with(router_json: Value) -> Config {
        let providers = json!([
            {"name": "p1", "api_base_url": "https://p1/v1", "api_key": "k1", "models": ["m1", "haiku"]},
            {"name": "p2", "api_base_url": "https://p2/v1", "api_key": "k2", "models": ["haiku", "big", "r1", "m"]},
        ]);
        let file = json!({"Providers": providers, "Router": router_json});
        Config::from_str(&file.to_string()).unwrap()
    }

    fn req_from(value: Value) -> MessagesRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn scenario_background_routing() {
        let config = config_with(json!({"default": "p1,m1", "background": "p2,haiku"}));
        let counter = TokenCounter::for_model("claude-3-5-sonnet-latest");
        let breaker = CircuitBreakerRegistry::new();
        let mut req = req_from(json!({
            "model": "claude-3-5-haiku-20241022",
            "max_tokens": 10,
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let decision = decide(&mut req, &config, &counter, &breaker, None).unwrap();
        assert_eq!(decision.as_model_string(), "p2,haiku");
        assert_eq!(req.model, "p2,haiku");
    }

    #[test]
    fn scenario_long_context_routing() {
        let config = config_with(json!({
            "default": "p1,m1",
            "longContext": "p2,big",
            "longContextThreshold": 1000
        }));
        let counter = TokenCounter::for_model("claude-3-5-sonnet-latest");
        let breaker = CircuitBreakerRegistry::new();
        let big_text = "token ".repeat(5000 / 6 + 1);
        let mut req = req_from(json!({
            "model": "some-model",
            "max_tokens": 10,
            "messages": [{"role": "user", "content": big_text}]
        }));
        let decision = decide(&mut req, &config, &counter, &breaker, None).unwrap();
        assert_eq!(decision.as_model_string(), "p2,big");
    }

    #[test]
    fn scenario_think_routing_and_directive_strip() {
        let config = config_with(json!({"default": "p1,m1", "think": "p1,m1"}));
        let counter = TokenCounter::for_model("claude-3-5-sonnet-latest");
        let breaker = CircuitBreakerRegistry::new();
        let mut req = req_from(json!({
            "model": "some-model",
            "max_tokens": 10,
            "thinking": true,
            "system": [{"type": "text", "text": "base <CCR-SUBAGENT-MODEL>p2,r1</CCR-SUBAGENT-MODEL>"}],
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let decision = decide(&mut req, &config, &counter, &breaker, None).unwrap();
        assert_eq!(decision.as_model_string(), "p2,r1");
        assert_eq!(req.model, "p2,r1");
        assert_eq!(req.system.unwrap().joined_text(), "base ");
    }

    #[test]
    fn disabled_thinking_block_does_not_route_to_think() {
        let config = config_with(json!({"default": "p1,m1", "think": "p2,r1"}));
        let counter = TokenCounter::for_model("claude-3-5-sonnet-latest");
        let breaker = CircuitBreakerRegistry::new();
        let mut req = req_from(json!({
            "model": "some-model",
            "max_tokens": 10,
            "thinking": {"type": "disabled"},
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let decision = decide(&mut req, &config, &counter, &breaker, None).unwrap();
        assert_eq!(decision.as_model_string(), "p1,m1");
    }

    #[test]
    fn scenario_circuit_breaker_fallback() {
        let config = config_with(json!({"default": "p1,m1", "fallback": "p2,m"}));
        let counter = TokenCounter::for_model("claude-3-5-sonnet-latest");
        let breaker = CircuitBreakerRegistry::new();
        for _ in 0..5 {
            breaker.record_failure("p1");
        }
        let mut req = req_from(json!({
            "model": "some-model",
            "max_tokens": 10,
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let decision = decide(&mut req, &config, &counter, &breaker, None).unwrap();
        assert_eq!(decision.as_model_string(), "p2,m");
    }

    #[test]
    fn circuit_breaker_open_with_no_fallback_errors() {
        let config = config_with(json!({"default": "p1,m1"}));
        let counter = TokenCounter::for_model("claude-3-5-sonnet-latest");
        let breaker = CircuitBreakerRegistry::new();
        for _ in 0..5 {
            breaker.record_failure("p1");
        }
        let mut req = req_from(json!({
            "model": "some-model",
            "max_tokens": 10,
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let err = decide(&mut req, &config, &counter, &breaker, None).unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::CircuitBreakerError);
    }

    #[test]
    fn explicit_model_pair_takes_priority() {
        let config = config_with(json!({"default": "p1,m1", "think": "p1,m1"}));
        let counter = TokenCounter::for_model("claude-3-5-sonnet-latest");
        let breaker = CircuitBreakerRegistry::new();
        let mut req = req_from(json!({
            "model": "p2,haiku",
            "max_tokens": 10,
            "thinking": true,
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let decision = decide(&mut req, &config, &counter, &breaker, None).unwrap();
        assert_eq!(decision.as_model_string(), "p2,haiku");
    }

    #[test]
    fn tool_use_routes_when_tools_present() {
        let config = config_with(json!({"default": "p1,m1", "toolUse": "p2,m"}));
        let counter = TokenCounter::for_model("claude-3-5-sonnet-latest");
        let breaker = CircuitBreakerRegistry::new();
        let mut req = req_from(json!({
            "model": "some-model",
            "max_tokens": 10,
            "tools": [{"name": "weather", "description": "", "input_schema": {}}],
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let decision = decide(&mut req, &config, &counter, &breaker, None).unwrap();
        assert_eq!(decision.as_model_string(), "p2,m");
    }
}
