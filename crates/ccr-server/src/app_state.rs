//! Process-wide shared state (§5, SPEC_FULL "Reload entrypoint"), following
//! `goose-server/src/state.rs`'s `AppState`: one `Arc`-wrapped struct handed
//! to every route via `axum::State`, with the hot-reloadable piece (`Config`)
//! behind its own lock and the read-mostly registries built once at startup
//! and never swapped.

use std::sync::{Arc, RwLock};

use ccr_core::circuit_breaker::CircuitBreakerRegistry;
use ccr_core::config::Config;
use ccr_core::errors::ProxyError;
use ccr_core::tools::AgentRegistry;
use ccr_core::transformer::TransformerRegistry;
use ccr_core::usage_cache::UsageCache;

pub struct AppState {
    config: RwLock<Config>,
    pub registry: Arc<TransformerRegistry>,
    pub breaker: Arc<CircuitBreakerRegistry>,
    pub usage_cache: Arc<UsageCache>,
    pub agents: Arc<AgentRegistry>,
}

impl AppState {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config: RwLock::new(config),
            registry: Arc::new(TransformerRegistry::with_builtins()),
            breaker: Arc::new(CircuitBreakerRegistry::new()),
            usage_cache: Arc::new(UsageCache::new()),
            agents: Arc::new(AgentRegistry::builtin_fixtures()),
        })
    }

    /// Cheap clone of the current configuration snapshot (`Config` is itself
    /// `Arc`-backed internally, so this is a pointer bump plus a refcount).
    pub fn config(&self) -> Config {
        self.config
            .read()
            .expect("config rwlock poisoned")
            .clone()
    }

    /// Atomically swap in a freshly loaded, validated configuration (§5
    /// "Reload swaps a new immutable copy atomically"). The caller — an
    /// external file watcher, out of scope for this core — decides when to
    /// call this; the core only exposes the swap point.
    pub fn reload_config(&self, new_config: Config) -> Result<(), ProxyError> {
        new_config.validate()?;
        *self.config.write().expect("config rwlock poisoned") = new_config;
        Ok(())
    }
}
