//! Request execution with retries.
//!
//! Every outbound call goes through [`RequestExecutor::execute`]. One call
//! moves through these states:
//!
//! ```text
//! ATTEMPTING ──ok──▶ SUCCESS
//!     │
//!     └─err─▶ retryable, attempts and budget left?
//!                 ├─yes─▶ RETRY_SCHEDULED ─sleep─▶ ATTEMPTING
//!                 └─no──▶ FAILED
//! ```
//!
//! A failure is surfaced as [`ClientError::Api`] carrying the last classified
//! [`ErrorKind`] and an [`ErrorContext`].

use crate::classify::{classify_response, classify_transport};
use crate::config::ClientConfig;
use crate::error::{ClientError, ErrorContext, ErrorKind, Result};
use crate::retry::RetryPolicy;
use crate::session::{SessionRegistry, DEFAULT_SESSION};
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// One HTTP operation, described independently of how it is retried.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    endpoint: String,
    session_key: String,
    body: Option<Value>,
    query: Vec<(String, String)>,
    timeout: Option<Duration>,
    retry_policy: Option<RetryPolicy>,
}

impl ApiRequest {
    /// Request `endpoint` (relative to the API root) with `method`.
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            session_key: DEFAULT_SESSION.to_string(),
            body: None,
            query: Vec::new(),
            timeout: None,
            retry_policy: None,
        }
    }

    /// GET request.
    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(Method::GET, endpoint)
    }

    /// POST request.
    pub fn post(endpoint: impl Into<String>) -> Self {
        Self::new(Method::POST, endpoint)
    }

    /// PATCH request.
    pub fn patch(endpoint: impl Into<String>) -> Self {
        Self::new(Method::PATCH, endpoint)
    }

    /// DELETE request.
    pub fn delete(endpoint: impl Into<String>) -> Self {
        Self::new(Method::DELETE, endpoint)
    }

    /// Send through the session registered under `key`.
    pub fn session(mut self, key: impl Into<String>) -> Self {
        self.session_key = key.into();
        self
    }

    /// Attach a JSON body.
    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Attach any serializable value as the JSON body.
    pub fn json_body<B: Serialize>(self, body: &B) -> Result<Self> {
        let value = serde_json::to_value(body)?;
        Ok(self.json(value))
    }

    /// Append a query parameter.
    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    /// Bound a single attempt (defaults to the client timeout).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the client's retry policy for this request.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Endpoint path.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Session key the request is sent through.
    pub fn session_key(&self) -> &str {
        &self.session_key
    }
}

/// Status and headers of the most recent response, kept for diagnostics.
#[derive(Default)]
struct LastResponse {
    status: Option<u16>,
    headers: BTreeMap<String, String>,
}

impl LastResponse {
    fn record(&mut self, status: u16, headers: &HeaderMap) {
        self.status = Some(status);
        self.headers = headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
    }
}

/// Issues requests through the session registry, classifying and retrying
/// failures according to a [`RetryPolicy`].
pub struct RequestExecutor {
    sessions: SessionRegistry,
}

impl RequestExecutor {
    /// Create an executor with an empty session registry.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            sessions: SessionRegistry::new(config),
        }
    }

    /// The session registry.
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    fn config(&self) -> &ClientConfig {
        self.sessions.config()
    }

    /// Execute `request` and deserialize the JSON body into `T`.
    pub async fn execute_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        let value = self.execute(request).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Execute `request`, retrying transient failures.
    ///
    /// Returns the parsed JSON body of the first successful attempt, or the
    /// last classified failure with its [`ErrorContext`].
    pub async fn execute(&self, request: ApiRequest) -> Result<Value> {
        let http = self.sessions.get_or_create(&request.session_key)?;
        let policy = request
            .retry_policy
            .as_ref()
            .unwrap_or(&self.config().retry);
        let timeout = request.timeout.unwrap_or(self.config().timeout);
        let url = self.config().url_for(&request.endpoint);

        let start = Instant::now();
        let mut last = LastResponse::default();
        let mut attempts = 0u32;

        let final_kind = loop {
            let attempt = attempts;
            attempts += 1;

            tracing::debug!(
                method = %request.method,
                endpoint = %request.endpoint,
                session = %request.session_key,
                attempt = attempts,
                max_attempts = policy.max_retries,
                "Sending request"
            );

            let attempt_start = Instant::now();
            let kind = match self
                .attempt(&http, &request, &url, timeout, &mut last)
                .await
            {
                Ok(body) => {
                    tracing::debug!(
                        method = %request.method,
                        endpoint = %request.endpoint,
                        status = ?last.status,
                        attempt = attempts,
                        duration_ms = %attempt_start.elapsed().as_millis(),
                        "Request succeeded"
                    );
                    return Ok(body);
                }
                Err(kind) => kind,
            };

            match next_delay(&kind, policy, attempt, start.elapsed()) {
                Some(delay) => {
                    tracing::warn!(
                        method = %request.method,
                        endpoint = %request.endpoint,
                        attempt = attempts,
                        max_attempts = policy.max_retries,
                        kind = kind.label(),
                        error = %kind,
                        delay_ms = %delay.as_millis(),
                        "Request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => break kind,
            }
        };

        let context = ErrorContext {
            method: request.method.to_string(),
            endpoint: request.endpoint.clone(),
            attempts,
            elapsed: start.elapsed(),
            last_status: last.status,
            headers: last.headers,
        };

        if final_kind.is_retryable(policy) {
            tracing::error!(
                method = %context.method,
                endpoint = %context.endpoint,
                attempts = context.attempts,
                elapsed_ms = %context.elapsed.as_millis(),
                last_status = ?context.last_status,
                error = %final_kind,
                "Request ultimately failed after retries"
            );
        } else {
            tracing::warn!(
                method = %context.method,
                endpoint = %context.endpoint,
                status = ?context.last_status,
                kind = final_kind.label(),
                error = %final_kind,
                "Request failed"
            );
        }

        Err(ClientError::Api {
            kind: final_kind,
            context: Some(Box::new(context)),
        })
    }

    /// One attempt: send, read the body, classify.
    async fn attempt(
        &self,
        http: &reqwest::Client,
        request: &ApiRequest,
        url: &str,
        timeout: Duration,
        last: &mut LastResponse,
    ) -> std::result::Result<Value, ErrorKind> {
        let mut builder = http.request(request.method.clone(), url).timeout(timeout);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| classify_transport(&e))?;
        let status = response.status();
        let headers = response.headers().clone();
        last.record(status.as_u16(), &headers);

        let body = response.bytes().await.map_err(|e| classify_transport(&e))?;
        classify_response(status, &headers, &body)
    }
}

/// Delay before retrying after the zero-based `attempt` failed with `kind`,
/// or `None` when the call must stop.
///
/// Rate limits wait for the server's `retry_after` (capped at `max_delay`)
/// instead of the exponential backoff; a zero `retry_after` uses the backoff.
/// No retry is scheduled if the sleep would overrun `max_total_delay`.
pub(crate) fn next_delay(
    kind: &ErrorKind,
    policy: &RetryPolicy,
    attempt: u32,
    elapsed: Duration,
) -> Option<Duration> {
    if !kind.is_retryable(policy) || attempt.saturating_add(1) >= policy.max_retries {
        return None;
    }

    let delay = match kind {
        ErrorKind::RateLimit { retry_after, .. } if !retry_after.is_zero() => {
            (*retry_after).min(policy.max_delay)
        }
        _ => policy.backoff_delay(attempt),
    };

    if elapsed.saturating_add(delay) > policy.max_total_delay {
        tracing::debug!(
            elapsed_ms = %elapsed.as_millis(),
            delay_ms = %delay.as_millis(),
            budget_ms = %policy.max_total_delay.as_millis(),
            "Retry budget exhausted"
        );
        return None;
    }

    Some(delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_error() -> ErrorKind {
        ErrorKind::Server {
            status: 503,
            message: "unavailable".to_string(),
            details: None,
        }
    }

    fn rate_limited(secs: u64) -> ErrorKind {
        ErrorKind::RateLimit {
            retry_after: Duration::from_secs(secs),
            message: "slow down".to_string(),
            details: None,
        }
    }

    #[test]
    fn test_next_delay_uses_backoff() {
        let policy = RetryPolicy::default();
        let delay = next_delay(&server_error(), &policy, 1, Duration::ZERO).unwrap();
        assert!(delay >= Duration::from_millis(180) && delay <= Duration::from_millis(220));
    }

    #[test]
    fn test_next_delay_stops_on_last_attempt() {
        let policy = RetryPolicy::default().with_max_retries(3);
        assert!(next_delay(&server_error(), &policy, 1, Duration::ZERO).is_some());
        assert!(next_delay(&server_error(), &policy, 2, Duration::ZERO).is_none());
    }

    #[test]
    fn test_next_delay_stops_on_permanent_error() {
        let not_found = ErrorKind::NotFound {
            message: "gone".to_string(),
            details: None,
        };
        assert!(next_delay(&not_found, &RetryPolicy::default(), 0, Duration::ZERO).is_none());
    }

    #[test]
    fn test_next_delay_respects_total_budget() {
        let policy = RetryPolicy::default().with_max_total_delay(Duration::from_millis(500));
        assert!(next_delay(&server_error(), &policy, 0, Duration::from_millis(450)).is_none());
        assert!(next_delay(&server_error(), &policy, 0, Duration::from_millis(100)).is_some());
    }

    #[test]
    fn test_next_delay_huge_delays_do_not_overflow() {
        let policy = RetryPolicy::default()
            .with_base_delay(Duration::MAX)
            .with_max_delay(Duration::MAX);
        let elapsed = Duration::from_secs(3600);

        assert_eq!(next_delay(&server_error(), &policy, 0, elapsed), None);
        assert_eq!(next_delay(&rate_limited(u64::MAX), &policy, 0, elapsed), None);
    }

    #[test]
    fn test_next_delay_rate_limit_uses_retry_after() {
        let policy = RetryPolicy::default();
        assert_eq!(
            next_delay(&rate_limited(2), &policy, 0, Duration::ZERO),
            Some(Duration::from_secs(2))
        );
    }

    #[test]
    fn test_next_delay_rate_limit_capped_by_max_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(
            next_delay(&rate_limited(60), &policy, 0, Duration::ZERO),
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn test_next_delay_rate_limit_over_budget() {
        let policy = RetryPolicy::default()
            .with_max_delay(Duration::from_secs(60))
            .with_max_total_delay(Duration::from_secs(30));
        assert_eq!(next_delay(&rate_limited(45), &policy, 0, Duration::ZERO), None);
    }

    #[test]
    fn test_next_delay_zero_retry_after_falls_back_to_backoff() {
        let policy = RetryPolicy::default();
        let delay = next_delay(&rate_limited(0), &policy, 0, Duration::ZERO).unwrap();
        assert!(delay >= Duration::from_millis(90) && delay <= Duration::from_millis(110));
    }

    #[test]
    fn test_request_builder() {
        let request = ApiRequest::get("/tables/t1/records")
            .session("reporting")
            .query("limit", 25)
            .query("where", "(Status,eq,Open)")
            .timeout(Duration::from_secs(5))
            .retry_policy(RetryPolicy::no_retry());

        assert_eq!(request.method(), &Method::GET);
        assert_eq!(request.endpoint(), "/tables/t1/records");
        assert_eq!(request.session_key(), "reporting");
        assert_eq!(request.query.len(), 2);
        assert_eq!(request.query[0], ("limit".to_string(), "25".to_string()));
        assert_eq!(request.timeout, Some(Duration::from_secs(5)));
        assert_eq!(request.retry_policy.map(|p| p.max_retries), Some(1));
    }

    #[test]
    fn test_request_defaults_to_default_session() {
        let request = ApiRequest::post("/meta/bases").json(serde_json::json!({"title": "Demo"}));
        assert_eq!(request.session_key(), DEFAULT_SESSION);
        assert_eq!(request.body.unwrap()["title"], "Demo");
    }
}
