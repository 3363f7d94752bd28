//! Core request-lifecycle library for the CCR proxy: routing, transformer
//! pipeline, SSE interception, agent loop, and the shared config/error/usage
//! types they're all built on. The HTTP surface (axum routes, auth, CORS,
//! process entrypoint) lives in the `ccr-server` binary crate; this crate
//! has no knowledge of HTTP framing beyond the `reqwest` calls it makes to
//! upstream providers.

pub mod agent_loop;
pub mod circuit_breaker;
pub mod config;
pub mod errors;
pub mod message;
pub mod router;
pub mod sse;
pub mod tokenizer;
pub mod tools;
pub mod transformer;
pub mod upstream;
pub mod usage_cache;
