//! Transformer Pipeline (§4.3): bidirectional adapters between the
//! Anthropic-shaped request/response at the proxy edge and a provider's
//! native wire format. Modeled as a small trait plus an eagerly-populated
//! registry, the way `goose::providers::factory` keeps a fixed set of
//! provider constructors behind a name lookup (§9 "built-in transformers
//! must be available without dynamic loading").

pub mod builtin;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::config::{Provider, TransformerEntry};
use crate::errors::ProxyError;
use crate::sse::SseEvent;

/// Everything a transformer needs beyond the request body: which provider
/// and model were selected, and this invocation's options (the second
/// element of a `[name, options]` config entry, or an empty object for a
/// bare name).
#[derive(Debug, Clone)]
pub struct TransformContext {
    pub provider: Provider,
    pub model: String,
    pub options: Value,
}

/// The `{ body, config }` pair a transformer's `request-in` step produces
/// (§4.3). `config` here is flattened into URL/headers/timeout since that's
/// everything the upstream dispatcher (§4.4) needs to issue the call.
#[derive(Debug, Clone)]
pub struct TransformedRequest {
    pub body: Value,
    pub url: String,
    pub headers: HeaderMap,
    pub timeout: Duration,
}

/// A bidirectional adapter. Built-ins implement this directly; the
/// filesystem-loaded custom-transformer path SPEC_FULL leaves as future
/// work (§9) would implement the same trait from a dynamically loaded
/// artifact.
pub trait Transformer: Send + Sync {
    fn name(&self) -> &'static str;

    /// URL suffix this transformer claims ownership of (§4.3 "a transformer
    /// may declare an endpoint suffix"). `None` for transformers that only
    /// ever run as part of an explicit `use` list.
    fn endpoint(&self) -> Option<&'static str> {
        None
    }

    fn request_in(
        &self,
        request: TransformedRequest,
        ctx: &TransformContext,
    ) -> Result<TransformedRequest, ProxyError>;

    /// Rewrite a buffered, non-streaming response body in place.
    fn response_out_unary(
        &self,
        body: Value,
        ctx: &TransformContext,
    ) -> Result<Value, ProxyError> {
        let _ = ctx;
        Ok(body)
    }

    /// Build fresh per-request state for streaming `response-out`. Most
    /// transformers are stateless event-for-event rewrites and can ignore
    /// this; `openai` needs it to accumulate a provider-native chunk into
    /// zero or more Anthropic-shaped events (a single OpenAI delta can open
    /// a content block, continue it, or close it).
    fn new_stream_state(&self) -> Box<dyn TransformerStreamState> {
        Box::new(IdentityStreamState)
    }
}

/// Per-request, per-pipeline-stage scratch space for streaming
/// `response-out`. One instance is created per transformer per request by
/// `Pipeline::new_stream_states` and never shared across requests, unlike
/// the `Transformer` impls themselves which are long-lived and shared via
/// the registry.
pub trait TransformerStreamState: Send {
    fn transform_event(
        &mut self,
        event: SseEvent,
        ctx: &TransformContext,
    ) -> Result<Vec<SseEvent>, ProxyError>;
}

struct IdentityStreamState;

impl TransformerStreamState for IdentityStreamState {
    fn transform_event(
        &mut self,
        event: SseEvent,
        _ctx: &TransformContext,
    ) -> Result<Vec<SseEvent>, ProxyError> {
        Ok(vec![event])
    }
}

/// Eagerly-populated, read-mostly lookup from transformer name to
/// implementation (§5 "Transformer Registry is read-mostly; mutated only
/// during startup and config reload").
pub struct TransformerRegistry {
    transformers: HashMap<&'static str, Arc<dyn Transformer>>,
}

impl TransformerRegistry {
    pub fn with_builtins() -> Self {
        let mut transformers: HashMap<&'static str, Arc<dyn Transformer>> = HashMap::new();
        let builtins: Vec<Arc<dyn Transformer>> = vec![
            Arc::new(builtin::AnthropicTransformer),
            Arc::new(builtin::OpenAiTransformer),
            Arc::new(builtin::MaxTokenTransformer),
            Arc::new(builtin::ToolUseTransformer),
            Arc::new(builtin::ReasoningTransformer),
        ];
        for t in builtins {
            transformers.insert(t.name(), t);
        }
        Self { transformers }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Transformer>> {
        self.transformers.get(name).cloned()
    }

    pub fn endpoint_transformer(&self, path: &str) -> Option<Arc<dyn Transformer>> {
        self.transformers
            .values()
            .find(|t| t.endpoint() == Some(path))
            .cloned()
    }
}

impl Default for TransformerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// The resolved, ordered pipeline for one provider+model pair: each
/// transformer paired with the options it was configured with (§4.3
/// "Resolution").
pub struct Pipeline {
    steps: Vec<(Arc<dyn Transformer>, Value)>,
}

impl Pipeline {
    pub fn resolve(
        registry: &TransformerRegistry,
        provider: &Provider,
        model: &str,
    ) -> Result<Self, ProxyError> {
        // §4.3 Resolution: the pipeline is the provider-level default list
        // *plus* the model-specific override list, provider-level first —
        // not a replacement. A model override adds to the chain (e.g. a
        // `maxtoken` middleware) without dropping the provider's own
        // auth/body transformer.
        let entries: Vec<&TransformerEntry> = provider
            .provider_transformers()
            .iter()
            .chain(provider.model_transformers(model).unwrap_or(&[]).iter())
            .collect();

        // An empty pipeline is recovered locally as identity (§7).
        let mut steps = Vec::with_capacity(entries.len().max(1));
        if entries.is_empty() {
            if let Some(t) = registry.get("anthropic") {
                steps.push((t, Value::Object(Default::default())));
            }
            return Ok(Self { steps });
        }

        for entry in entries {
            let transformer = registry.get(entry.name()).ok_or_else(|| {
                ProxyError::transform(entry.name(), "resolve", &provider.name)
            })?;
            let options = entry
                .options()
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default()));
            steps.push((transformer, options));
        }
        Ok(Self { steps })
    }

    /// Apply `request-in` in list order (§4.3).
    pub fn apply_request(
        &self,
        initial: TransformedRequest,
        provider: &Provider,
        model: &str,
    ) -> Result<TransformedRequest, ProxyError> {
        let mut body = initial;
        for (transformer, options) in &self.steps {
            let ctx = TransformContext {
                provider: provider.clone(),
                model: model.to_string(),
                options: options.clone(),
            };
            body = transformer
                .request_in(body, &ctx)
                .map_err(|_| ProxyError::transform(transformer.name(), "in", &provider.name))?;
        }
        Ok(body)
    }

    /// Apply `response-out` in reverse list order (§4.3) to a buffered body.
    pub fn apply_response_unary(
        &self,
        initial: Value,
        provider: &Provider,
        model: &str,
    ) -> Result<Value, ProxyError> {
        let mut body = initial;
        for (transformer, options) in self.steps.iter().rev() {
            let ctx = TransformContext {
                provider: provider.clone(),
                model: model.to_string(),
                options: options.clone(),
            };
            body = transformer
                .response_out_unary(body, &ctx)
                .map_err(|_| ProxyError::transform(transformer.name(), "out", &provider.name))?;
        }
        Ok(body)
    }

    /// Fresh per-request scratch space for every stage, in pipeline order.
    /// Callers keep this alongside the `Pipeline` for the lifetime of one
    /// streaming request and pass it to every `apply_response_events` call
    /// for that request.
    pub fn new_stream_states(&self) -> Vec<Box<dyn TransformerStreamState>> {
        self.steps.iter().map(|(t, _)| t.new_stream_state()).collect()
    }

    /// Apply `response-out` in reverse list order to one upstream-parsed
    /// event, threading the (possibly expanded) event list through each
    /// stage. A stage may turn one event into several (e.g. the `openai`
    /// adapter opening and filling a content block from one provider-native
    /// chunk) or into none (suppressing it).
    pub fn apply_response_events(
        &self,
        initial: SseEvent,
        states: &mut [Box<dyn TransformerStreamState>],
        provider: &Provider,
        model: &str,
    ) -> Result<Vec<SseEvent>, ProxyError> {
        let mut events = vec![initial];
        for (idx, (transformer, options)) in self.steps.iter().enumerate().rev() {
            let ctx = TransformContext {
                provider: provider.clone(),
                model: model.to_string(),
                options: options.clone(),
            };
            let mut next = Vec::with_capacity(events.len());
            for event in events {
                let produced = states[idx].transform_event(event, &ctx).map_err(|_| {
                    ProxyError::transform(transformer.name(), "out", &provider.name)
                })?;
                next.extend(produced);
            }
            events = next;
        }
        Ok(events)
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|(t, _)| t.name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn provider(transformer_json: Option<Value>) -> Provider {
        let value = json!({
            "name": "p1",
            "api_base_url": "https://p1/v1",
            "api_key": "k",
            "models": ["m1"],
            "transformer": transformer_json,
        });
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn empty_pipeline_resolves_to_anthropic_identity() {
        let registry = TransformerRegistry::with_builtins();
        let provider = provider(None);
        let pipeline = Pipeline::resolve(&registry, &provider, "m1").unwrap();
        assert_eq!(pipeline.step_names(), vec!["anthropic"]);
    }

    #[test]
    fn unknown_transformer_name_is_transform_error() {
        let registry = TransformerRegistry::with_builtins();
        let provider = provider(Some(json!({"use": ["totally-unknown"]})));
        let err = Pipeline::resolve(&registry, &provider, "m1").unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::TransformError);
    }

    #[test]
    fn model_override_is_appended_to_provider_default() {
        let registry = TransformerRegistry::with_builtins();
        let provider = provider(Some(json!({
            "use": ["anthropic"],
            "m1": {"use": ["maxtoken"]}
        })));
        let pipeline = Pipeline::resolve(&registry, &provider, "m1").unwrap();
        assert_eq!(pipeline.step_names(), vec!["anthropic", "maxtoken"]);
    }

    #[test]
    fn model_without_override_uses_only_provider_default() {
        let registry = TransformerRegistry::with_builtins();
        let provider = provider(Some(json!({
            "use": ["anthropic"],
            "m1": {"use": ["maxtoken"]}
        })));
        let pipeline = Pipeline::resolve(&registry, &provider, "other-model").unwrap();
        assert_eq!(pipeline.step_names(), vec!["anthropic"]);
    }
}
