//! NocoDB Client SDK
//!
//! A resilient Rust client for the NocoDB v2 REST API: every request goes
//! through one retrying executor, failures are classified into a single
//! error taxonomy, and base/table/column names resolve to ids through a
//! two-tier cache.
//!
//! # Features
//!
//! - **Automatic Retries**: Exponential backoff with ±10% jitter, a
//!   wall-clock budget per call, and `Retry-After` handling for 429s
//! - **Error Classification**: `Auth`, `NotFound`, `RateLimit`, `Server`,
//!   `ResponseParse`, ... with request diagnostics attached
//! - **Sessions**: Independent transports (and API tokens) per session key
//! - **Name Resolution**: Session cache plus bounded LRU fallback, with a
//!   policy for duplicate names
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use nocodb_client::{ClientConfig, CreateBaseOptions, Disambiguation, NocoClient};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = NocoClient::new(
//!         ClientConfig::builder("http://localhost:8080/api/v2")
//!             .api_token("nc_your_api_token")
//!             .timeout(Duration::from_secs(30))
//!             .max_retries(5)
//!             .build()?,
//!     )?;
//!
//!     if !client.validate_connection("default").await {
//!         return Err("NocoDB is not reachable".into());
//!     }
//!
//!     let base = client
//!         .create_base("Demo", &CreateBaseOptions::default().prevent_duplicates(true), "default")
//!         .await?;
//!
//!     let base_id = client
//!         .base_id("Demo", "default", Disambiguation::Newest)
//!         .await?
//!         .unwrap_or(base.id);
//!
//!     for table in client.fetch_schema(&base_id, "default").await? {
//!         println!("{}: {} columns", table.title, table.columns.len());
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Error Handling
//!
//! All operations return `Result<T, ClientError>`. Remote failures arrive as
//! `ClientError::Api { kind, context }`:
//!
//! - `Auth` / `Permission` / `NotFound` / `Validation`: returned after one attempt
//! - `Timeout` / `Connection` / `Server` (408, 429, 500, 502, 503, 504): retried
//! - `RateLimit`: retried after the server's `Retry-After`, capped at `max_delay`
//! - `ResponseParse`: a 2xx whose body is not JSON, with a bounded preview
//!
//! A name that does not exist resolves to `Ok(None)`, never to an error.

pub mod cache;
pub mod classify;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod resolver;
pub mod retry;
pub mod retry_after;
pub mod session;
pub mod types;

// Re-exports for convenience
pub use cache::{CacheGeneration, CacheStats, CacheTier, HybridCache};
pub use client::{NocoClient, WORKSPACE_SCOPE};
pub use config::{ClientConfig, ClientConfigBuilder};
pub use error::{ClientError, ErrorContext, ErrorKind, Result};
pub use executor::{ApiRequest, RequestExecutor};
pub use resolver::{Disambiguation, EntityKind, NameResolver};
pub use retry::RetryPolicy;
pub use retry_after::parse_retry_after;
pub use session::{SessionRegistry, DEFAULT_SESSION};
pub use types::{
    unique_title, Base, Column, CreateBaseOptions, ListRecordsQuery, ListResponse, NamedEntity,
    PageInfo, Table,
};
