//! Upstream Dispatch (§4.4): issues the provider call described by a
//! transformed `{ body, url, headers, timeout }`, applying the retry and
//! circuit-breaker policy before handing back either a buffered JSON value
//! or a raw byte stream. The retry loop is a direct generalization of
//! `goose::providers::provider_common::retry_with_backoff`, widened with
//! jitter (`rand`, already a `goose` workspace dependency) since SPEC_FULL
//! calls for "exponential backoff with jitter" rather than `goose`'s
//! plain exponential curve.

use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt as _};
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde_json::Value;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::errors::{ErrorKind, ProxyError};
use crate::transformer::TransformedRequest;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub factor: f64,
    pub min_timeout_ms: u64,
    pub max_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            factor: 2.0,
            min_timeout_ms: 1_000,
            max_timeout_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.min_timeout_ms as f64 * self.factor.powi(attempt as i32);
        let capped = base.min(self.max_timeout_ms as f64);
        let jitter_fraction: f64 = rand::thread_rng().gen_range(0.5..1.0);
        Duration::from_millis((capped * jitter_fraction) as u64)
    }
}

fn classify_status(status: StatusCode, body: &str, provider: &str) -> ProxyError {
    let message = format!("{} responded {}: {}", provider, status, body);
    let kind = match status.as_u16() {
        401 | 403 => ErrorKind::AuthError,
        404 => ErrorKind::NotFound,
        429 => ErrorKind::RateLimited,
        s if (500..600).contains(&s) => ErrorKind::UpstreamServer,
        _ => ErrorKind::Unknown,
    };
    ProxyError::new(kind, message)
        .with_status(status.as_u16())
        .with_provider(provider)
}

/// Buffered (non-streaming) dispatch with retry-with-backoff-and-jitter
/// (§4.4) limited to network errors, 5xx, and 429; other 4xx is terminal.
pub async fn dispatch_unary(
    client: &Client,
    request: &TransformedRequest,
    policy: &RetryPolicy,
    breaker: &CircuitBreakerRegistry,
    provider: &str,
) -> Result<Value, ProxyError> {
    let mut attempt = 0u32;
    loop {
        let result = send_once(client, request, provider).await;
        match result {
            Ok(value) => {
                breaker.record_success(provider);
                return Ok(value);
            }
            Err(err) => {
                let retryable = err.kind.is_retryable();
                if retryable {
                    breaker.record_failure(provider);
                }
                if !retryable || attempt + 1 >= policy.max_attempts {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    provider,
                    attempt,
                    ?delay,
                    error = %err,
                    "retrying upstream request after transient failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

async fn send_once(
    client: &Client,
    request: &TransformedRequest,
    provider: &str,
) -> Result<Value, ProxyError> {
    let response = client
        .post(&request.url)
        .headers(request.headers.clone())
        .timeout(request.timeout)
        .json(&request.body)
        .send()
        .await
        .map_err(ProxyError::from)?;

    let status = response.status();
    let text = response.text().await.map_err(ProxyError::from)?;
    if status.is_success() {
        serde_json::from_str(&text).map_err(|err| {
            ProxyError::new(
                ErrorKind::Unknown,
                format!("invalid JSON from {}: {}", provider, err),
            )
            .with_provider(provider)
        })
    } else {
        Err(classify_status(status, &text, provider))
    }
}

/// Streaming dispatch: establishes the connection (subject to the same
/// retry policy for the initial handshake only — §4.4 does not describe
/// mid-stream retries since bytes may already have been forwarded) and
/// returns the raw byte stream for the SSE parser to consume.
pub async fn dispatch_stream(
    client: &Client,
    request: &TransformedRequest,
    policy: &RetryPolicy,
    breaker: &CircuitBreakerRegistry,
    provider: &str,
) -> Result<impl Stream<Item = Result<Bytes, ProxyError>>, ProxyError> {
    let mut attempt = 0u32;
    loop {
        let response = client
            .post(&request.url)
            .headers(request.headers.clone())
            .timeout(request.timeout)
            .json(&request.body)
            .send()
            .await
            .map_err(ProxyError::from);

        match response {
            Ok(response) if response.status().is_success() => {
                breaker.record_success(provider);
                let stream = response
                    .bytes_stream()
                    .map(|chunk| chunk.map_err(ProxyError::from));
                return Ok(stream);
            }
            Ok(response) => {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                let err = classify_status(status, &text, provider);
                let retryable = err.kind.is_retryable();
                if retryable {
                    breaker.record_failure(provider);
                }
                if !retryable || attempt + 1 >= policy.max_attempts {
                    return Err(err);
                }
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
            Err(err) => {
                let retryable = err.kind.is_retryable();
                if retryable {
                    breaker.record_failure(provider);
                }
                if !retryable || attempt + 1 >= policy.max_attempts {
                    return Err(err);
                }
                tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderMap;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request_to(url: String, body: Value) -> TransformedRequest {
        TransformedRequest {
            body,
            url,
            headers: HeaderMap::new(),
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn dispatch_unary_succeeds_on_200() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let client = Client::new();
        let breaker = CircuitBreakerRegistry::new();
        let request = request_to(format!("{}/v1/messages", server.uri()), json!({}));
        let result = dispatch_unary(&client, &request, &RetryPolicy::default(), &breaker, "p1")
            .await
            .unwrap();
        assert_eq!(result["ok"], true);
    }

    #[tokio::test]
    async fn dispatch_unary_does_not_retry_on_400() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": {"message": "bad"}})))
            .mount(&server)
            .await;

        let client = Client::new();
        let breaker = CircuitBreakerRegistry::new();
        let request = request_to(format!("{}/v1/messages", server.uri()), json!({}));
        let err = dispatch_unary(&client, &request, &RetryPolicy::default(), &breaker, "p1")
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 400);
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dispatch_unary_retries_on_429_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let client = Client::new();
        let breaker = CircuitBreakerRegistry::new();
        let fast_policy = RetryPolicy {
            max_attempts: 3,
            factor: 2.0,
            min_timeout_ms: 1,
            max_timeout_ms: 5,
        };
        let request = request_to(format!("{}/v1/messages", server.uri()), json!({}));
        let result = dispatch_unary(&client, &request, &fast_policy, &breaker, "p1")
            .await
            .unwrap();
        assert_eq!(result["ok"], true);
    }

    #[test]
    fn retry_delay_never_exceeds_max_timeout() {
        let policy = RetryPolicy::default();
        for attempt in 0..10 {
            let delay = policy.delay_for_attempt(attempt);
            assert!(delay.as_millis() as u64 <= policy.max_timeout_ms);
        }
    }
}
