//! Client configuration: defaults, environment overrides and a validating
//! builder.

use crate::error::{ClientError, Result};
use crate::retry::RetryPolicy;
use std::fmt;
use std::time::Duration;

/// Default API root of a local NocoDB instance.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080/api/v2";

/// Configuration for the NocoDB client.
///
/// # Security
///
/// The `Debug` implementation masks the API token to prevent accidental
/// exposure in logs. The token is shown as `"***REDACTED***"` in debug output.
#[derive(Clone)]
pub struct ClientConfig {
    /// API root, including the version prefix (e.g., "http://localhost:8080/api/v2")
    pub base_url: String,
    /// Optional API token, sent as the `xc-token` header
    pub api_token: Option<String>,
    /// Per-attempt request timeout (default: 30 seconds)
    pub timeout: Duration,
    /// Retry policy used unless a request overrides it
    pub retry: RetryPolicy,
    /// Capacity of each resolver's fallback cache (default: 100)
    pub cache_capacity: usize,
    /// Verify TLS certificates (default: true; disable only for self-signed dev servers)
    pub tls_verify: bool,
    /// User-Agent sent on every request
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_token: None,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            cache_capacity: 100,
            tls_verify: true,
            user_agent: format!("nocodb-client/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "***REDACTED***"))
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("cache_capacity", &self.cache_capacity)
            .field("tls_verify", &self.tls_verify)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

impl ClientConfig {
    /// Start a builder for the API root at `base_url`.
    pub fn builder(base_url: impl Into<String>) -> ClientConfigBuilder {
        ClientConfigBuilder::new(base_url)
    }

    /// Shortest accepted per-attempt timeout.
    pub const MIN_TIMEOUT: Duration = Duration::from_millis(100);

    /// Build a configuration from the environment.
    ///
    /// # Environment Variables
    /// - `NOCODB_BASE_URL`: API root (default: `http://localhost:8080/api/v2`)
    /// - `NOCODB_API_KEY`: API token (optional)
    /// - `NOCODB_TIMEOUT_SECS`: per-attempt timeout (default: 30)
    /// - `NOCODB_MAX_RETRIES`: attempts per request (default: 3)
    pub fn from_env() -> Result<Self> {
        let base_url =
            std::env::var("NOCODB_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());

        let mut builder = ClientConfigBuilder::new(base_url);

        if let Ok(token) = std::env::var("NOCODB_API_KEY") {
            if !token.is_empty() {
                builder = builder.api_token(token);
            }
        }

        if let Some(secs) = std::env::var("NOCODB_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            builder = builder.timeout(Duration::from_secs(secs));
        }

        if let Some(retries) = std::env::var("NOCODB_MAX_RETRIES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
        {
            builder = builder.max_retries(retries);
        }

        builder.build()
    }

    /// Check the settings a client cannot work without.
    pub fn validate(&self) -> Result<()> {
        // Validate base URL
        if self.base_url.is_empty() {
            return Err(ClientError::Config("base_url cannot be empty".to_string()));
        }

        // Parse and validate URL
        url::Url::parse(&self.base_url)
            .map_err(|e| ClientError::Config(format!("Invalid base_url: {}", e)))?;

        if self.cache_capacity == 0 {
            return Err(ClientError::Config(
                "cache_capacity must be > 0".to_string(),
            ));
        }

        self.retry.validate()?;

        if self.timeout < Self::MIN_TIMEOUT {
            return Err(ClientError::Config(format!(
                "timeout ({:?}) must be >= {:?}",
                self.timeout,
                Self::MIN_TIMEOUT
            )));
        }

        Ok(())
    }

    /// Full URL for an endpoint path relative to the API root.
    pub(crate) fn url_for(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return endpoint.to_string();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Builder starting from the defaults with `base_url` as API root.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            config: ClientConfig {
                base_url: base_url.into(),
                ..Default::default()
            },
        }
    }

    /// Set the API token for authentication.
    pub fn api_token(mut self, token: impl Into<String>) -> Self {
        self.config.api_token = Some(token.into());
        self
    }

    /// Set the per-attempt request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Replace the whole retry policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    /// Set the maximum number of attempts per request.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.retry.max_retries = max_retries;
        self
    }

    /// Set the delay before the first retry (doubled on each further retry).
    pub fn retry_base_delay(mut self, delay: Duration) -> Self {
        self.config.retry.base_delay = delay;
        self
    }

    /// Cap a single retry delay.
    pub fn retry_max_delay(mut self, delay: Duration) -> Self {
        self.config.retry.max_delay = delay;
        self
    }

    /// Set the wall-clock budget for a whole retry sequence.
    pub fn retry_max_total_delay(mut self, delay: Duration) -> Self {
        self.config.retry.max_total_delay = delay;
        self
    }

    /// Set the capacity of each resolver's fallback cache.
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.config.cache_capacity = capacity;
        self
    }

    /// Enable or disable TLS certificate verification.
    pub fn tls_verify(mut self, verify: bool) -> Self {
        self.config.tls_verify = verify;
        self
    }

    /// Override the User-Agent header.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<ClientConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.base_url, "http://localhost:8080/api/v2");
        assert!(config.api_token.is_none());
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.cache_capacity, 100);
    }

    #[test]
    fn test_builder() {
        let config = ClientConfig::builder("https://noco.example.com/api/v2")
            .api_token("nc_test_token")
            .timeout(Duration::from_secs(60))
            .max_retries(5)
            .retry_base_delay(Duration::from_millis(50))
            .retry_max_total_delay(Duration::from_secs(5))
            .cache_capacity(500)
            .build()
            .unwrap();

        assert_eq!(config.base_url, "https://noco.example.com/api/v2");
        assert_eq!(config.api_token, Some("nc_test_token".to_string()));
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(50));
        assert_eq!(config.retry.max_total_delay, Duration::from_secs(5));
        assert_eq!(config.cache_capacity, 500);
    }

    #[test]
    fn test_unparseable_base_url_rejected() {
        let err = ClientConfig::builder("not a valid url").build().unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn test_empty_base_url_rejected() {
        assert!(ClientConfig::builder("").build().is_err());
    }

    #[test]
    fn test_zero_cache_capacity_rejected() {
        let result = ClientConfig::builder(DEFAULT_BASE_URL)
            .cache_capacity(0)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_retries_rejected() {
        let err = ClientConfig::builder(DEFAULT_BASE_URL)
            .max_retries(0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("max_retries"));
    }

    #[test]
    fn test_api_token_masked_in_debug() {
        let config = ClientConfig::builder(DEFAULT_BASE_URL)
            .api_token("nc_super_secret_token_12345")
            .build()
            .unwrap();

        let debug_output = format!("{:?}", config);

        assert!(
            !debug_output.contains("super_secret"),
            "API token fragments should not appear in debug output"
        );
        assert!(
            debug_output.contains("REDACTED"),
            "Debug output should show REDACTED marker"
        );
    }

    #[test]
    fn test_base_delay_above_max_delay_rejected() {
        let result = ClientConfig::builder(DEFAULT_BASE_URL)
            .retry_base_delay(Duration::from_secs(10))
            .retry_max_delay(Duration::from_secs(1))
            .build();

        let err = result.unwrap_err();
        assert!(
            err.to_string().contains("base_delay"),
            "Error should mention base_delay"
        );
    }

    #[test]
    fn test_timeout_below_minimum_rejected() {
        let result = ClientConfig::builder(DEFAULT_BASE_URL)
            .timeout(Duration::from_millis(50))
            .build();

        let err = result.unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_url_for_joins_paths() {
        let config = ClientConfig::builder("http://localhost:8080/api/v2/")
            .build()
            .unwrap();

        assert_eq!(
            config.url_for("/meta/bases"),
            "http://localhost:8080/api/v2/meta/bases"
        );
        assert_eq!(
            config.url_for("meta/bases"),
            "http://localhost:8080/api/v2/meta/bases"
        );
        assert_eq!(
            config.url_for("https://other.example.com/x"),
            "https://other.example.com/x"
        );
    }
}
