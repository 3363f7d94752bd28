//! Configuration model and loader.
//!
//! The `Provider`/`RouterConfig`/transformer-`use`-list shapes are grounded
//! on the JSON encoding documented and tested in the `RESMP-DEV/ccr-rust`
//! `src/config.rs` reference (a prior Rust port of the same Node.js tool
//! this proxy's wire format derives from). The `Config` wrapper — an
//! `Arc`-wrapped immutable snapshot holding a shared `reqwest::Client` next
//! to the parsed file — follows `goose-server`'s `AppState`/`goose`'s
//! provider-construction convention of handing out cheap `Clone`s of a
//! single `Arc` rather than re-parsing or re-pooling per request.

use anyhow::{Context, Result};
use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::errors::ProxyError;

fn default_port() -> u16 {
    3456
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_api_timeout_ms() -> u64 {
    600_000
}

fn default_long_context_threshold() -> u64 {
    60_000
}

/// A single entry in a transformer `use` array: either a bare name
/// (`"deepseek"`) or a `[name, options]` tuple
/// (`["maxtoken", {"max_tokens": 65536}]`).
#[derive(Debug, Clone, Serialize)]
pub enum TransformerEntry {
    Name(String),
    WithOptions {
        name: String,
        options: serde_json::Value,
    },
}

impl TransformerEntry {
    pub fn name(&self) -> &str {
        match self {
            Self::Name(n) => n,
            Self::WithOptions { name, .. } => name,
        }
    }

    pub fn options(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Name(_) => None,
            Self::WithOptions { options, .. } => Some(options),
        }
    }
}

impl<'de> Deserialize<'de> for TransformerEntry {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct EntryVisitor;

        impl<'de> Visitor<'de> for EntryVisitor {
            type Value = TransformerEntry;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(r#"a transformer name string or ["name", {options}] tuple"#)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(TransformerEntry::Name(v.to_owned()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
                Ok(TransformerEntry::Name(v))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let name: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &"a [name, options] tuple"))?;
                let options: serde_json::Value = seq
                    .next_element()?
                    .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));
                Ok(TransformerEntry::WithOptions { name, options })
            }
        }

        deserializer.deserialize_any(EntryVisitor)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelTransformerConfig {
    #[serde(rename = "use", default)]
    pub use_list: Vec<TransformerEntry>,
}

/// Full nested transformer configuration for a provider: a default `use`
/// chain plus per-model overrides keyed by model name (any object key other
/// than `"use"`).
#[derive(Debug, Clone, Serialize, Default)]
pub struct ProviderTransformer {
    pub use_list: Vec<TransformerEntry>,
    pub model_overrides: HashMap<String, ModelTransformerConfig>,
}

impl ProviderTransformer {
    pub fn default_transformers(&self) -> &[TransformerEntry] {
        &self.use_list
    }

    pub fn model_transformers(&self, model: &str) -> Option<&[TransformerEntry]> {
        self.model_overrides
            .get(model)
            .map(|m| m.use_list.as_slice())
    }
}

impl<'de> Deserialize<'de> for ProviderTransformer {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let map: serde_json::Map<String, serde_json::Value> =
            serde_json::Map::deserialize(deserializer)?;

        let mut use_list = Vec::new();
        let mut model_overrides = HashMap::new();

        for (key, value) in map {
            if key == "use" {
                use_list = serde_json::from_value(value).map_err(de::Error::custom)?;
            } else {
                let model_config: ModelTransformerConfig =
                    serde_json::from_value(value).map_err(de::Error::custom)?;
                model_overrides.insert(key, model_config);
            }
        }

        Ok(ProviderTransformer {
            use_list,
            model_overrides,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub name: String,
    pub api_base_url: String,
    pub api_key: String,
    pub models: Vec<String>,

    #[serde(default)]
    pub transformer: Option<ProviderTransformer>,

    #[serde(default)]
    pub disabled: bool,

    #[serde(default)]
    #[serde(rename = "autoApprove")]
    pub auto_approve: HashSet<String>,
}

impl Provider {
    pub const OAUTH_MANAGED: &'static str = "oauth-managed";

    pub fn is_oauth_managed(&self) -> bool {
        self.api_key == Self::OAUTH_MANAGED
    }

    pub fn provider_transformers(&self) -> &[TransformerEntry] {
        self.transformer
            .as_ref()
            .map(|t| t.use_list.as_slice())
            .unwrap_or(&[])
    }

    pub fn model_transformers(&self, model: &str) -> Option<&[TransformerEntry]> {
        self.transformer
            .as_ref()
            .and_then(|t| t.model_transformers(model))
    }

    pub fn has_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub default: String,

    #[serde(default)]
    pub background: Option<String>,

    #[serde(default)]
    pub think: Option<String>,

    #[serde(default)]
    #[serde(rename = "longContext")]
    pub long_context: Option<String>,

    #[serde(default = "default_long_context_threshold")]
    #[serde(rename = "longContextThreshold")]
    pub long_context_threshold: u64,

    #[serde(default)]
    #[serde(rename = "webSearch")]
    pub web_search: Option<String>,

    #[serde(default)]
    #[serde(rename = "toolUse")]
    pub tool_use: Option<String>,

    #[serde(default)]
    pub fallback: Option<String>,
}

/// A `"<provider>,<model>"` route slot value, parsed once and reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub provider: String,
    pub model: String,
}

impl Route {
    pub fn parse(value: &str) -> Option<Self> {
        let (provider, model) = value.split_once(',')?;
        let provider = provider.trim();
        let model = model.trim();
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        Some(Self {
            provider: provider.to_string(),
            model: model.to_string(),
        })
    }

    pub fn as_model_string(&self) -> String {
        format!("{},{}", self.provider, self.model)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConfigFile {
    #[serde(rename = "Providers")]
    pub providers: Vec<Provider>,

    #[serde(rename = "Router")]
    pub router: RouterConfig,

    #[serde(default = "default_port")]
    #[serde(rename = "PORT")]
    pub port: u16,

    #[serde(default = "default_host")]
    #[serde(rename = "HOST")]
    pub host: String,

    #[serde(default = "default_api_timeout_ms")]
    #[serde(rename = "API_TIMEOUT_MS")]
    pub api_timeout_ms: u64,

    #[serde(default)]
    #[serde(rename = "ALLOWED_ORIGINS")]
    pub allowed_origins: Vec<String>,

    #[serde(default)]
    #[serde(rename = "CUSTOM_ROUTER_PATH")]
    pub custom_router_path: Option<String>,

    #[serde(default)]
    #[serde(rename = "APIKEY")]
    pub api_key: Option<String>,
}

struct ConfigInner {
    file: ConfigFile,
    http_client: reqwest::Client,
}

/// Immutable, cheaply-cloneable configuration snapshot. A reload produces a
/// brand new `Config` and the holder (`AppState`) swaps its `Arc` atomically
/// (SPEC_FULL "Configuration": "Reload swaps a new immutable copy
/// atomically"); nothing here is ever mutated in place.
#[derive(Clone)]
pub struct Config {
    inner: Arc<ConfigInner>,
}

impl Config {
    pub fn from_str(content: &str) -> Result<Self> {
        let mut file: ConfigFile =
            serde_json::from_str(content).context("failed to parse config JSON")?;
        apply_env_overrides(&mut file);

        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(file.api_timeout_ms))
            .pool_max_idle_per_host(64)
            .tcp_keepalive(std::time::Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .context("failed to build shared HTTP client")?;

        Ok(Config {
            inner: Arc::new(ConfigInner { file, http_client }),
        })
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path))?;
        Self::from_str(&content)
    }

    pub fn providers(&self) -> &[Provider] {
        &self.inner.file.providers
    }

    pub fn router(&self) -> &RouterConfig {
        &self.inner.file.router
    }

    pub fn port(&self) -> u16 {
        self.inner.file.port
    }

    pub fn host(&self) -> &str {
        &self.inner.file.host
    }

    pub fn api_timeout_ms(&self) -> u64 {
        self.inner.file.api_timeout_ms
    }

    pub fn allowed_origins(&self) -> &[String] {
        &self.inner.file.allowed_origins
    }

    pub fn custom_router_path(&self) -> Option<&str> {
        self.inner.file.custom_router_path.as_deref()
    }

    pub fn api_key(&self) -> Option<&str> {
        self.inner.file.api_key.as_deref()
    }

    pub fn http_client(&self) -> &reqwest::Client {
        &self.inner.http_client
    }

    pub fn find_provider(&self, name: &str) -> Option<&Provider> {
        self.providers()
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn resolve_route(&self, value: &str) -> Option<Route> {
        let route = Route::parse(value)?;
        let provider = self.find_provider(&route.provider)?;
        if provider.disabled || !provider.has_model(&route.model) {
            return None;
        }
        Some(Route {
            provider: provider.name.clone(),
            model: route.model,
        })
    }

    /// Validate the invariant from SPEC_FULL §3: every router slot must name
    /// an enabled provider and a model that provider lists.
    pub fn validate(&self) -> Result<(), ProxyError> {
        let router = self.router();
        let slots: Vec<(&str, &Option<String>)> = vec![
            ("default", &Some(router.default.clone())),
            ("background", &router.background),
            ("think", &router.think),
            ("longContext", &router.long_context),
            ("webSearch", &router.web_search),
            ("toolUse", &router.tool_use),
            ("fallback", &router.fallback),
        ];
        for (slot, value) in slots {
            if let Some(value) = value {
                if self.resolve_route(value).is_none() {
                    return Err(ProxyError::config(format!(
                        "router slot '{}' references an unknown or disabled provider/model: '{}'",
                        slot, value
                    )));
                }
            }
        }
        Ok(())
    }
}

fn apply_env_overrides(file: &mut ConfigFile) {
    if let Ok(port) = std::env::var("SERVICE_PORT") {
        if let Ok(port) = port.parse::<u16>() {
            file.port = port;
        } else {
            tracing::warn!(value = %port, "SERVICE_PORT is not a valid port number, falling back to configured value");
        }
    }
    if let Ok(key) = std::env::var("APIKEY") {
        file.api_key = Some(key);
    }
    if file.api_key.is_none() {
        // §6: host is forced to loopback when no API key gates the proxy.
        file.host = "127.0.0.1".to_string();
    }
    if let Ok(origins) = std::env::var("ALLOWED_ORIGINS") {
        file.allowed_origins = origins
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Ok(path) = std::env::var("CUSTOM_ROUTER_PATH") {
        file.custom_router_path = Some(path);
    }
    if let Ok(timeout) = std::env::var("API_TIMEOUT_MS") {
        if let Ok(timeout) = timeout.parse::<u64>() {
            file.api_timeout_ms = timeout;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> &'static str {
        r#"{
            "Providers": [
                {
                    "name": "p1",
                    "api_base_url": "https://p1.example.com/v1/chat/completions",
                    "api_key": "sk-1",
                    "models": ["m1", "haiku"]
                },
                {
                    "name": "p2",
                    "api_base_url": "https://p2.example.com/v1/chat/completions",
                    "api_key": "sk-2",
                    "models": ["big", "small"]
                }
            ],
            "Router": {
                "default": "p1,m1",
                "background": "p1,haiku",
                "longContext": "p2,big",
                "longContextThreshold": 1000
            }
        }"#
    }

    #[test]
    fn parses_minimal_config() {
        let cfg = Config::from_str(sample_config()).unwrap();
        assert_eq!(cfg.router().default, "p1,m1");
        assert_eq!(cfg.router().long_context_threshold, 1000);
        assert!(cfg.find_provider("p1").is_some());
    }

    #[test]
    fn resolve_route_rejects_unknown_model() {
        let cfg = Config::from_str(sample_config()).unwrap();
        assert!(cfg.resolve_route("p1,nonexistent").is_none());
        assert!(cfg.resolve_route("p1,m1").is_some());
    }

    #[test]
    fn resolve_route_is_case_insensitive_on_provider() {
        let cfg = Config::from_str(sample_config()).unwrap();
        let route = cfg.resolve_route("P1,m1").unwrap();
        assert_eq!(route.provider, "p1");
    }

    #[test]
    fn validate_passes_for_consistent_router() {
        let cfg = Config::from_str(sample_config()).unwrap();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_fails_for_dangling_fallback() {
        let mut file: ConfigFile = serde_json::from_str(sample_config()).unwrap();
        file.router.fallback = Some("ghost,model".to_string());
        let json = serde_json::to_string(&file).unwrap();
        let cfg = Config::from_str(&json).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn transformer_use_list_parses_bare_and_tuple() {
        let json = r#"{"use": ["deepseek", ["maxtoken", {"max_tokens": 65536}]]}"#;
        let t: ProviderTransformer = serde_json::from_str(json).unwrap();
        assert_eq!(t.use_list.len(), 2);
        assert_eq!(t.use_list[0].name(), "deepseek");
        assert_eq!(t.use_list[1].name(), "maxtoken");
        assert_eq!(t.use_list[1].options().unwrap()["max_tokens"], 65536);
    }

    #[test]
    fn transformer_model_override_parses() {
        let json = r#"{"use": ["deepseek"], "deepseek-chat": {"use": ["tooluse"]}}"#;
        let t: ProviderTransformer = serde_json::from_str(json).unwrap();
        let over = t.model_transformers("deepseek-chat").unwrap();
        assert_eq!(over[0].name(), "tooluse");
        assert!(t.model_transformers("other-model").is_none());
    }
}
