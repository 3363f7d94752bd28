//! The error taxonomy from SPEC_FULL §4.7, implemented with `thiserror` the
//! way `goose::providers::errors::ProviderError` enumerates provider
//! failures: one variant per taxonomy kind, each carrying enough context to
//! reconstruct the client-visible error body (§7) without re-deriving it at
//! every call site.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthError,
    NotFound,
    RateLimited,
    UpstreamServer,
    UpstreamTimeout,
    Network,
    TransformError,
    CircuitBreakerError,
    ConfigError,
    Unknown,
}

impl ErrorKind {
    /// HTTP status this kind maps to when no explicit upstream status was
    /// captured (§7 "status matching the kind").
    pub fn default_status(self) -> u16 {
        match self {
            ErrorKind::AuthError => 401,
            ErrorKind::NotFound => 404,
            ErrorKind::RateLimited => 429,
            ErrorKind::UpstreamServer => 502,
            ErrorKind::UpstreamTimeout => 504,
            ErrorKind::Network => 502,
            ErrorKind::TransformError => 500,
            ErrorKind::CircuitBreakerError => 503,
            ErrorKind::ConfigError => 500,
            ErrorKind::Unknown => 500,
        }
    }

    /// Whether a request that failed with this kind is eligible for the
    /// retry-with-backoff policy in §4.4 (network/5xx/429, not other 4xx).
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::UpstreamServer | ErrorKind::RateLimited
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub struct ProxyError {
    pub kind: ErrorKind,
    pub status: Option<u16>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub message: String,
    #[source]
    pub cause: Option<anyhow::Error>,
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl ProxyError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            provider: None,
            model: None,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_cause(mut self, cause: impl Into<anyhow::Error>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthError, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn upstream_server(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamServer, message)
    }

    pub fn upstream_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamTimeout, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn transform(transformer: &str, direction: &str, provider: &str) -> Self {
        Self::new(
            ErrorKind::TransformError,
            format!(
                "transformer '{}' failed during {} for provider '{}'",
                transformer, direction, provider
            ),
        )
        .with_provider(provider)
    }

    pub fn circuit_breaker(provider: impl Into<String>) -> Self {
        let provider = provider.into();
        Self::new(
            ErrorKind::CircuitBreakerError,
            format!("circuit breaker open for provider '{}'", provider),
        )
        .with_provider(provider)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigError, message)
    }

    /// HTTP status to report to the client: the explicit upstream status if
    /// one was captured, otherwise the kind's default.
    pub fn http_status(&self) -> u16 {
        self.status.unwrap_or(self.kind.default_status())
    }

    /// The `error.type` string used by the unary error body (§7). Chosen to
    /// match the family of names Anthropic's own API uses where the kind has
    /// a clear analogue, and the taxonomy's own name otherwise.
    pub fn wire_type(&self) -> &'static str {
        match self.kind {
            ErrorKind::AuthError => "authentication_error",
            ErrorKind::NotFound => "not_found_error",
            ErrorKind::RateLimited => "rate_limit_error",
            ErrorKind::UpstreamServer => "api_error",
            ErrorKind::UpstreamTimeout => "timeout_error",
            ErrorKind::Network => "api_error",
            ErrorKind::TransformError => "api_error",
            ErrorKind::CircuitBreakerError => "overloaded_error",
            ErrorKind::ConfigError => "api_error",
            ErrorKind::Unknown => "api_error",
        }
    }
}

/// Classify a raw `reqwest::Error` the way
/// `provider_common::handle_provider_response` classifies by status code,
/// but for the connect/timeout/DNS cases a `StatusCode` never arrives for.
impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProxyError::upstream_timeout(err.to_string()).with_cause(err)
        } else if err.is_connect() {
            ProxyError::network(err.to_string()).with_cause(err)
        } else if let Some(status) = err.status() {
            let kind = match status.as_u16() {
                401 | 403 => ErrorKind::AuthError,
                404 => ErrorKind::NotFound,
                429 => ErrorKind::RateLimited,
                s if (500..600).contains(&s) => ErrorKind::UpstreamServer,
                _ => ErrorKind::Unknown,
            };
            ProxyError::new(kind, err.to_string())
                .with_status(status.as_u16())
                .with_cause(err)
        } else {
            ProxyError::network(err.to_string()).with_cause(err)
        }
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds_match_spec() {
        assert!(ErrorKind::Network.is_retryable());
        assert!(ErrorKind::UpstreamServer.is_retryable());
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(!ErrorKind::AuthError.is_retryable());
        assert!(!ErrorKind::TransformError.is_retryable());
    }

    #[test]
    fn default_status_matches_kind() {
        assert_eq!(ErrorKind::AuthError.default_status(), 401);
        assert_eq!(ErrorKind::UpstreamTimeout.default_status(), 504);
    }

    #[test]
    fn http_status_prefers_explicit_status() {
        let err = ProxyError::new(ErrorKind::Unknown, "bad request").with_status(400);
        assert_eq!(err.http_status(), 400);
    }
}
