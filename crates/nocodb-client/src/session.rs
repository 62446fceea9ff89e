//! Session registry.
//!
//! A session is an independently configured HTTP transport (connection pool,
//! default headers, credentials) identified by a caller-chosen key. Sessions
//! are created lazily on first use and live until [`SessionRegistry::close`].

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use std::collections::HashMap;

/// Session key used when the caller does not pick one.
pub const DEFAULT_SESSION: &str = "default";

/// Header NocoDB reads the API token from.
pub const TOKEN_HEADER: &str = "xc-token";

/// Maps session keys to transport handles.
///
/// Lookups and creations are serialized by one mutex, so concurrent first use
/// of a key builds exactly one handle.
pub struct SessionRegistry {
    config: ClientConfig,
    sessions: Mutex<HashMap<String, reqwest::Client>>,
}

impl SessionRegistry {
    /// Create an empty registry. Handles inherit `config`'s token, timeout,
    /// TLS and User-Agent settings.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Get the handle for `key`, creating it with the default credentials on
    /// first use.
    pub fn get_or_create(&self, key: &str) -> Result<reqwest::Client> {
        let mut sessions = self.sessions.lock();
        if let Some(client) = sessions.get(key) {
            return Ok(client.clone());
        }

        let client = build_http_client(&self.config, self.config.api_token.as_deref())?;
        sessions.insert(key.to_string(), client.clone());
        tracing::debug!(session = %key, "Created session");
        Ok(client)
    }

    /// Register `key` with its own API token, replacing any existing handle.
    pub fn open(&self, key: &str, api_token: Option<&str>) -> Result<()> {
        let client = build_http_client(&self.config, api_token)?;
        let replaced = self.sessions.lock().insert(key.to_string(), client);
        tracing::debug!(
            session = %key,
            replaced = replaced.is_some(),
            "Opened session"
        );
        Ok(())
    }

    /// Tear down one session, or all of them when `key` is `None`.
    ///
    /// Returns the number of handles dropped. Pooled connections close once
    /// in-flight requests holding a clone of the handle finish.
    pub fn close(&self, key: Option<&str>) -> usize {
        let mut sessions = self.sessions.lock();
        let closed = match key {
            Some(key) => usize::from(sessions.remove(key).is_some()),
            None => {
                let count = sessions.len();
                sessions.clear();
                count
            }
        };
        tracing::debug!(session = ?key, closed, "Closed sessions");
        closed
    }

    /// Returns true if a handle exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.sessions.lock().contains_key(key)
    }

    /// Number of open sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Returns true if no session is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The configuration new handles are built from.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

fn build_http_client(config: &ClientConfig, api_token: Option<&str>) -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&config.user_agent)
            .unwrap_or_else(|_| HeaderValue::from_static("nocodb-client")),
    );

    if let Some(token) = api_token {
        let mut value = HeaderValue::from_str(token)
            .map_err(|_| ClientError::Config("Invalid API token format".to_string()))?;
        value.set_sensitive(true);
        headers.insert(TOKEN_HEADER, value);
    }

    reqwest::Client::builder()
        .default_headers(headers)
        .timeout(config.timeout)
        .danger_accept_invalid_certs(!config.tls_verify)
        .build()
        .map_err(|e| ClientError::Config(format!("Failed to build HTTP client: {}", e)))
}
