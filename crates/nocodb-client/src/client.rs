//! NocoDB client: sessions, resolvers and the metadata/record operations
//! built on top of them.

use crate::cache::CacheStats;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::executor::{ApiRequest, RequestExecutor};
use crate::resolver::{Disambiguation, EntityKind, NameResolver};
use crate::retry::RetryPolicy;
use crate::types::{
    unique_title, Base, Column, CreateBaseOptions, ListRecordsQuery, ListResponse, NamedEntity,
    Table,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Scope under which base names are unique.
pub const WORKSPACE_SCOPE: &str = "workspace";

/// Per-attempt timeout of the connection check.
const VALIDATE_TIMEOUT: Duration = Duration::from_secs(5);

/// NocoDB client with retries, per-session transports and cached name
/// resolution.
///
/// All methods take `&self`; share one client behind an `Arc`.
pub struct NocoClient {
    executor: RequestExecutor,
    bases: NameResolver,
    tables: NameResolver,
    columns: NameResolver,
}

impl NocoClient {
    /// Create a new client builder with the given API root.
    pub fn builder(base_url: impl Into<String>) -> crate::config::ClientConfigBuilder {
        crate::config::ClientConfigBuilder::new(base_url)
    }

    /// Create a new client with the given configuration.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let capacity = config.cache_capacity;
        tracing::info!(
            base_url = %config.base_url,
            max_retries = config.retry.max_retries,
            timeout_ms = %config.timeout.as_millis(),
            "NocoDB client initialized"
        );

        Ok(Self {
            executor: RequestExecutor::new(config),
            bases: NameResolver::new(EntityKind::Base, capacity),
            tables: NameResolver::new(EntityKind::Table, capacity),
            columns: NameResolver::new(EntityKind::Column, capacity),
        })
    }

    /// Create a client configured from `NOCODB_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(ClientConfig::from_env()?)
    }

    /// Get the API root.
    pub fn base_url(&self) -> &str {
        &self.config().base_url
    }

    pub fn config(&self) -> &ClientConfig {
        self.executor.sessions().config()
    }

    /// Send a request through the retrying executor.
    pub async fn execute(&self, request: ApiRequest) -> Result<Value> {
        self.executor.execute(request).await
    }

    // =========================================================================
    // Sessions & Cache
    // =========================================================================

    /// Register `key` with its own API token, replacing any existing
    /// transport for that key. Names cached for `key` are dropped.
    pub async fn open_session(&self, key: &str, api_token: Option<&str>) -> Result<()> {
        self.executor.sessions().open(key, api_token)?;
        self.clear_cache(Some(key)).await;
        Ok(())
    }

    /// Tear down the transport of one session, or of all sessions.
    ///
    /// Cached names are kept; see [`clear_cache`](Self::clear_cache).
    pub fn close(&self, session: Option<&str>) -> usize {
        self.executor.sessions().close(session)
    }

    /// Clear cached names of every resolver for one session, or all
    /// sessions.
    pub async fn clear_cache(&self, session: Option<&str>) {
        for resolver in self.resolvers() {
            resolver.clear(session).await;
        }
        tracing::debug!(session = ?session, "Cleared name caches");
    }

    /// Cache statistics of one resolver.
    pub async fn cache_stats(&self, kind: EntityKind) -> CacheStats {
        self.resolver(kind).stats().await
    }

    fn resolvers(&self) -> [&NameResolver; 3] {
        [&self.bases, &self.tables, &self.columns]
    }

    fn resolver(&self, kind: EntityKind) -> &NameResolver {
        match kind {
            EntityKind::Base => &self.bases,
            EntityKind::Table => &self.tables,
            EntityKind::Column => &self.columns,
        }
    }

    /// Check that the server is reachable with the session's credentials.
    ///
    /// Makes at most two short attempts and never returns an error. Only
    /// connection failures and timeouts get the second attempt; any HTTP
    /// error status fails the check at once.
    pub async fn validate_connection(&self, session: &str) -> bool {
        let policy = RetryPolicy::default()
            .with_max_retries(2)
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(1))
            .with_retryable_status_codes([]);
        let request = ApiRequest::get("/meta/bases")
            .session(session)
            .timeout(VALIDATE_TIMEOUT)
            .retry_policy(policy);

        match self.executor.execute_json::<ListResponse<Value>>(request).await {
            Ok(response) => {
                tracing::info!(
                    session = %session,
                    bases = response.list.len(),
                    "Connected to NocoDB"
                );
                true
            }
            Err(e) => {
                tracing::error!(
                    session = %session,
                    base_url = %self.base_url(),
                    error = %e,
                    "NocoDB connection check failed"
                );
                false
            }
        }
    }

    // =========================================================================
    // Bases
    // =========================================================================

    /// List all bases in the workspace, warning about duplicate titles.
    pub async fn list_bases(&self, session: &str) -> Result<Vec<Base>> {
        let response: ListResponse<Base> = self
            .executor
            .execute_json(ApiRequest::get("/meta/bases").session(session))
            .await?;

        if response.list.is_empty() {
            tracing::warn!(session = %session, "No bases found in workspace");
        }
        warn_duplicate_titles(&response.list);
        Ok(response.list)
    }

    /// Resolve a base title to its id.
    pub async fn base_id(
        &self,
        name: &str,
        session: &str,
        policy: Disambiguation,
    ) -> Result<Option<String>> {
        self.bases
            .resolve(
                WORKSPACE_SCOPE,
                name,
                session,
                move || async move {
                    let bases = self.list_bases(session).await?;
                    Ok::<_, ClientError>(named(&bases))
                },
                policy,
            )
            .await
    }

    /// Create a base.
    ///
    /// An existing base with the same title is logged as a duplicate, or,
    /// with `prevent_duplicates`, the title gets the next free `_N` suffix.
    pub async fn create_base(
        &self,
        title: &str,
        options: &CreateBaseOptions,
        session: &str,
    ) -> Result<Base> {
        let title = non_empty(title, "base title")?;

        let bases = self.list_bases(session).await?;
        let existing: Vec<&str> = bases
            .iter()
            .filter(|b| b.title == title)
            .map(|b| b.id.as_str())
            .collect();

        let title = if existing.is_empty() {
            title.to_string()
        } else if options.prevent_duplicates {
            let unique = unique_title(title, bases.iter().map(|b| b.title.as_str()));
            tracing::info!(requested = %title, title = %unique, "Generated unique base title");
            unique
        } else {
            tracing::warn!(
                title = %title,
                existing = ?existing,
                "Creating a base with a duplicate title"
            );
            title.to_string()
        };

        let request = ApiRequest::post("/meta/bases")
            .session(session)
            .json(options.payload(&title));
        let base: Base = self.executor.execute_json(request).await?;

        self.bases.invalidate_scope(WORKSPACE_SCOPE).await;
        tracing::info!(id = %base.id, title = %base.title, "Created base");
        Ok(base)
    }

    // =========================================================================
    // Tables
    // =========================================================================

    /// List the tables of a base.
    pub async fn list_tables(&self, base_id: &str, session: &str) -> Result<Vec<Table>> {
        let base_id = non_empty(base_id, "base_id")?;
        let endpoint = format!("/meta/bases/{}/tables", urlencoding::encode(base_id));
        let response: ListResponse<Table> = self
            .executor
            .execute_json(ApiRequest::get(endpoint).session(session))
            .await?;

        if response.list.is_empty() {
            tracing::warn!(base_id = %base_id, "No tables found in base");
        }
        Ok(response.list)
    }

    /// Resolve a table title within a base to its id.
    pub async fn table_id(
        &self,
        base_id: &str,
        name: &str,
        session: &str,
        policy: Disambiguation,
    ) -> Result<Option<String>> {
        self.tables
            .resolve(
                base_id,
                name,
                session,
                move || async move {
                    let tables = self.list_tables(base_id, session).await?;
                    Ok::<_, ClientError>(named(&tables))
                },
                policy,
            )
            .await
    }

    /// Table metadata, including its columns.
    pub async fn get_table_meta(&self, table_id: &str, session: &str) -> Result<Table> {
        let table_id = non_empty(table_id, "table_id")?;
        let endpoint = format!("/meta/tables/{}", urlencoding::encode(table_id));
        self.executor
            .execute_json(ApiRequest::get(endpoint).session(session))
            .await
    }

    /// Create a table from a NocoDB table definition (must carry a `title`).
    ///
    /// If the base already has a table with that title, it is returned
    /// instead.
    pub async fn create_table(
        &self,
        base_id: &str,
        payload: Value,
        session: &str,
    ) -> Result<Table> {
        let base_id = non_empty(base_id, "base_id")?;
        let title = payload_title(&payload, "table")?;

        let tables = self.list_tables(base_id, session).await?;
        if let Some(table) = tables.into_iter().find(|t| t.title == title) {
            tracing::info!(
                base_id = %base_id,
                title = %title,
                id = %table.id,
                "Table already exists"
            );
            return Ok(table);
        }

        let endpoint = format!("/meta/bases/{}/tables", urlencoding::encode(base_id));
        let request = ApiRequest::post(endpoint).session(session).json(payload);
        let table: Table = self.executor.execute_json(request).await?;

        self.tables.invalidate_scope(base_id).await;
        tracing::info!(base_id = %base_id, id = %table.id, title = %table.title, "Created table");
        Ok(table)
    }

    /// Delete a table.
    pub async fn delete_table(&self, table_id: &str, session: &str) -> Result<Value> {
        let table_id = non_empty(table_id, "table_id")?;
        let endpoint = format!("/meta/tables/{}", urlencoding::encode(table_id));
        let response = self
            .executor
            .execute(ApiRequest::delete(endpoint).session(session))
            .await?;

        self.tables.invalidate_id(table_id).await;
        self.columns.invalidate_scope(table_id).await;
        tracing::info!(id = %table_id, "Deleted table");
        Ok(response)
    }

    // =========================================================================
    // Columns
    // =========================================================================

    /// List the columns of a table.
    pub async fn list_columns(&self, table_id: &str, session: &str) -> Result<Vec<Column>> {
        let columns = self.get_table_meta(table_id, session).await?.columns;
        if columns.is_empty() {
            tracing::warn!(table_id = %table_id, "No columns found in table");
        }
        Ok(columns)
    }

    /// Resolve a column title within a table to its id.
    pub async fn column_id(
        &self,
        table_id: &str,
        name: &str,
        session: &str,
        policy: Disambiguation,
    ) -> Result<Option<String>> {
        self.columns
            .resolve(
                table_id,
                name,
                session,
                move || async move {
                    let columns = self.list_columns(table_id, session).await?;
                    Ok::<_, ClientError>(named(&columns))
                },
                policy,
            )
            .await
    }

    /// Column metadata.
    pub async fn get_column_meta(&self, column_id: &str, session: &str) -> Result<Column> {
        let column_id = non_empty(column_id, "column_id")?;
        let endpoint = format!("/meta/columns/{}", urlencoding::encode(column_id));
        self.executor
            .execute_json(ApiRequest::get(endpoint).session(session))
            .await
    }

    /// Add a column from a NocoDB column definition (must carry a `title`).
    ///
    /// If the table already has a column with that title, its metadata is
    /// returned instead. Otherwise the server's response is returned as is.
    pub async fn create_column(
        &self,
        table_id: &str,
        payload: Value,
        session: &str,
    ) -> Result<Value> {
        let table_id = non_empty(table_id, "table_id")?;
        let title = payload_title(&payload, "column")?;

        let existing = self
            .column_id(table_id, &title, session, Disambiguation::First)
            .await?;
        if let Some(existing_id) = existing {
            let columns = self.list_columns(table_id, session).await?;
            tracing::info!(
                table_id = %table_id,
                title = %title,
                id = %existing_id,
                "Column already exists"
            );
            return match columns.into_iter().find(|c| c.id == existing_id) {
                Some(column) => Ok(serde_json::to_value(column)?),
                None => Ok(serde_json::json!({ "id": existing_id, "title": title })),
            };
        }

        let endpoint = format!("/meta/tables/{}/columns", urlencoding::encode(table_id));
        let response = self
            .executor
            .execute(ApiRequest::post(endpoint).session(session).json(payload))
            .await?;

        self.columns.invalidate_scope(table_id).await;
        tracing::info!(table_id = %table_id, title = %title, "Created column");
        Ok(response)
    }

    /// Update a column definition.
    ///
    /// A rename can shadow another cached title, so the whole column scope
    /// of the owning table is dropped when the response names it.
    pub async fn update_column(
        &self,
        column_id: &str,
        definition: Value,
        session: &str,
    ) -> Result<Value> {
        let column_id = non_empty(column_id, "column_id")?;
        if is_empty_payload(&definition) {
            return Err(ClientError::InvalidArgument(
                "column definition cannot be empty".to_string(),
            ));
        }

        let endpoint = format!("/meta/columns/{}", urlencoding::encode(column_id));
        let response = self
            .executor
            .execute(ApiRequest::patch(endpoint).session(session).json(definition))
            .await?;

        self.columns.invalidate_id(column_id).await;
        if let Some(table_id) = owning_table_id(&response) {
            self.columns.invalidate_scope(table_id).await;
        }
        tracing::info!(id = %column_id, "Updated column");
        Ok(response)
    }

    /// Delete a column.
    pub async fn delete_column(&self, column_id: &str, session: &str) -> Result<Value> {
        let column_id = non_empty(column_id, "column_id")?;
        let endpoint = format!("/meta/columns/{}", urlencoding::encode(column_id));
        let response = self
            .executor
            .execute(ApiRequest::delete(endpoint).session(session))
            .await?;

        self.columns.invalidate_id(column_id).await;
        tracing::info!(id = %column_id, "Deleted column");
        Ok(response)
    }

    // =========================================================================
    // Records
    // =========================================================================

    /// Insert records into a table.
    pub async fn create_records(
        &self,
        table_id: &str,
        records: &[Value],
        session: &str,
    ) -> Result<Value> {
        let table_id = non_empty(table_id, "table_id")?;
        if records.is_empty() {
            return Err(ClientError::InvalidArgument(
                "records cannot be empty".to_string(),
            ));
        }

        let endpoint = format!("/tables/{}/records", urlencoding::encode(table_id));
        let request = ApiRequest::post(endpoint).session(session).json_body(&records)?;
        self.executor.execute(request).await
    }

    /// Update records. `payload` is one record object or an array of them,
    /// each carrying its primary key.
    pub async fn update_records(
        &self,
        table_id: &str,
        payload: Value,
        session: &str,
    ) -> Result<Value> {
        let table_id = non_empty(table_id, "table_id")?;
        if is_empty_payload(&payload) {
            return Err(ClientError::InvalidArgument(
                "payload cannot be empty".to_string(),
            ));
        }

        let endpoint = format!("/tables/{}/records", urlencoding::encode(table_id));
        self.executor
            .execute(ApiRequest::patch(endpoint).session(session).json(payload))
            .await
    }

    /// List records with optional filtering, sorting and paging.
    pub async fn list_records(
        &self,
        table_id: &str,
        query: &ListRecordsQuery,
        session: &str,
    ) -> Result<ListResponse<Value>> {
        let table_id = non_empty(table_id, "table_id")?;
        let endpoint = format!("/tables/{}/records", urlencoding::encode(table_id));

        let mut request = ApiRequest::get(endpoint).session(session);
        for (key, value) in query.params() {
            request = request.query(key, value);
        }
        self.executor.execute_json(request).await
    }

    /// Link `record_id` to the records in `links` (objects with an `Id`)
    /// through a link field.
    pub async fn link_records(
        &self,
        table_id: &str,
        link_field_id: &str,
        record_id: &str,
        links: &[Value],
        session: &str,
    ) -> Result<Value> {
        let table_id = non_empty(table_id, "table_id")?;
        let link_field_id = non_empty(link_field_id, "link_field_id")?;
        let record_id = non_empty(record_id, "record_id")?;
        if links.is_empty() {
            return Err(ClientError::InvalidArgument(
                "links cannot be empty".to_string(),
            ));
        }

        let endpoint = format!(
            "/tables/{}/links/{}/records/{}",
            urlencoding::encode(table_id),
            urlencoding::encode(link_field_id),
            urlencoding::encode(record_id)
        );
        let request = ApiRequest::post(endpoint).session(session).json_body(&links)?;
        self.executor.execute(request).await
    }

    // =========================================================================
    // Schema
    // =========================================================================

    /// Every table of a base with its full column metadata.
    pub async fn fetch_schema(&self, base_id: &str, session: &str) -> Result<Vec<Table>> {
        let mut tables = self.list_tables(base_id, session).await?;
        for table in &mut tables {
            tracing::debug!(table = %table.title, "Fetching table metadata");
            table.columns = self.get_table_meta(&table.id, session).await?.columns;
        }
        Ok(tables)
    }

    /// Create every table in `tables` (NocoDB table definitions, each with a
    /// `title`) through [`create_table`](Self::create_table).
    ///
    /// Tables that already exist are returned as they are. The result maps
    /// each requested title to its table. Definitions are validated before
    /// anything is sent, and the first failed creation aborts the rest.
    pub async fn create_schema(
        &self,
        base_id: &str,
        tables: Vec<Value>,
        session: &str,
    ) -> Result<BTreeMap<String, Table>> {
        let base_id = non_empty(base_id, "base_id")?;
        let titles = tables
            .iter()
            .map(|payload| payload_title(payload, "table"))
            .collect::<Result<Vec<_>>>()?;

        let mut created = BTreeMap::new();
        for (title, payload) in titles.into_iter().zip(tables) {
            let table = self.create_table(base_id, payload, session).await?;
            created.insert(title, table);
        }

        tracing::info!(base_id = %base_id, tables = created.len(), "Schema created");
        Ok(created)
    }
}

fn named<'a, T>(entities: &'a [T]) -> Vec<NamedEntity>
where
    NamedEntity: From<&'a T>,
{
    entities.iter().map(NamedEntity::from).collect()
}

fn warn_duplicate_titles(entities: &[Base]) {
    let mut by_title: BTreeMap<&str, Vec<&Base>> = BTreeMap::new();
    for entity in entities.iter().filter(|e| !e.title.is_empty()) {
        by_title.entry(entity.title.as_str()).or_default().push(entity);
    }

    for (title, group) in by_title.into_iter().filter(|(_, g)| g.len() > 1) {
        let ids: Vec<&str> = group.iter().map(|e| e.id.as_str()).collect();
        let created: Vec<String> = group
            .iter()
            .map(|e| {
                e.created_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "unknown".to_string())
            })
            .collect();
        tracing::warn!(
            title = %title,
            ids = ?ids,
            created_at = ?created,
            "Duplicate base title detected"
        );
    }
}

fn non_empty<'a>(value: &'a str, what: &str) -> Result<&'a str> {
    if value.trim().is_empty() {
        return Err(ClientError::InvalidArgument(format!(
            "{} cannot be empty",
            what
        )));
    }
    Ok(value)
}

fn payload_title(payload: &Value, what: &str) -> Result<String> {
    payload
        .get("title")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
        .ok_or_else(|| {
            ClientError::InvalidArgument(format!("{} payload must include a 'title'", what))
        })
}

/// Table id carried by a column update response: either the table metadata
/// NocoDB returns (`id` next to `columns`) or a column's `fk_model_id`.
fn owning_table_id(response: &Value) -> Option<&str> {
    let table_id = if response.get("columns").is_some_and(Value::is_array) {
        response.get("id")
    } else {
        response.get("fk_model_id")
    };
    table_id.and_then(Value::as_str).filter(|id| !id.is_empty())
}

fn is_empty_payload(payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_creation() {
        let client = NocoClient::new(ClientConfig::default());
        assert!(client.is_ok());
        assert_eq!(client.unwrap().base_url(), "http://localhost:8080/api/v2");
    }

    #[test]
    fn test_client_rejects_invalid_config() {
        let config = ClientConfig {
            cache_capacity: 0,
            ..ClientConfig::default()
        };
        assert!(matches!(NocoClient::new(config), Err(ClientError::Config(_))));
    }

    #[test]
    fn test_non_empty() {
        assert_eq!(non_empty("m1", "table_id").unwrap(), "m1");
        let err = non_empty("   ", "table_id").unwrap_err();
        assert!(err.to_string().contains("table_id cannot be empty"));
    }

    #[test]
    fn test_payload_title() {
        assert_eq!(payload_title(&json!({"title": "Orders"}), "table").unwrap(), "Orders");
        assert!(payload_title(&json!({"title": ""}), "table").is_err());
        assert!(payload_title(&json!({"table_name": "orders"}), "table").is_err());
    }

    #[test]
    fn test_owning_table_id() {
        let table_meta = json!({"id": "m1", "title": "Orders", "columns": [{"id": "c1"}]});
        assert_eq!(owning_table_id(&table_meta), Some("m1"));

        let column = json!({"id": "c1", "title": "Status", "fk_model_id": "m1"});
        assert_eq!(owning_table_id(&column), Some("m1"));

        assert_eq!(owning_table_id(&json!({"id": "c1", "title": "Status"})), None);
        assert_eq!(owning_table_id(&Value::Null), None);
    }

    #[tokio::test]
    async fn test_create_schema_validates_before_sending() {
        let client = NocoClient::new(ClientConfig::default()).unwrap();
        let tables = vec![json!({"title": "Orders"}), json!({"table_name": "customers"})];

        let err = client.create_schema("p1", tables, "default").await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));
    }

    #[test]
    fn test_is_empty_payload() {
        assert!(is_empty_payload(&Value::Null));
        assert!(is_empty_payload(&json!({})));
        assert!(is_empty_payload(&json!([])));
        assert!(!is_empty_payload(&json!({"Id": 1, "Status": "Done"})));
        assert!(!is_empty_payload(&json!([{"Id": 1}])));
    }

    #[tokio::test]
    async fn test_record_operations_validate_input() {
        let client = NocoClient::new(ClientConfig::default()).unwrap();

        let err = client.create_records("m1", &[], "default").await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));

        let err = client
            .update_records("", json!({"Id": 1}), "default")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));

        let err = client
            .link_records("m1", "c1", "", &[json!({"Id": 2})], "default")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));

        let err = client
            .create_base(" ", &CreateBaseOptions::default(), "default")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_close_and_clear_are_independent() {
        let client = NocoClient::new(ClientConfig::default()).unwrap();
        client.open_session("tenant", Some("nc_tenant_token")).await.unwrap();
        assert_eq!(client.close(Some("tenant")), 1);
        assert_eq!(client.close(None), 0);

        client.clear_cache(None).await;
        assert_eq!(client.cache_stats(EntityKind::Table).await.session_entries, 0);
    }
}
