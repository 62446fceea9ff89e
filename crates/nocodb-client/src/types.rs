//! Request and response types for the NocoDB v2 API.
//!
//! Metadata types keep the fields the client reads and carry everything else
//! the server returns in `extra`, so nothing is lost when a value is passed
//! back to the API.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Envelope of every NocoDB list endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    pub list: Vec<T>,
    #[serde(default, rename = "pageInfo", skip_serializing_if = "Option::is_none")]
    pub page_info: Option<PageInfo>,
}

/// Pagination details of a list response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    #[serde(default)]
    pub total_rows: Option<u64>,
    #[serde(default)]
    pub page: Option<u64>,
    #[serde(default)]
    pub page_size: Option<u64>,
    #[serde(default)]
    pub is_first_page: Option<bool>,
    #[serde(default)]
    pub is_last_page: Option<bool>,
}

/// The identity of anything that can be looked up by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedEntity {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
}

impl NamedEntity {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            created_at: None,
        }
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

/// A base (NocoDB project).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Base {
    /// Base id (e.g., "p_xxxxxxxx")
    pub id: String,
    /// Display name
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Creation time, when the server reports one
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    /// All other fields returned by the server
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A table, optionally with its column metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    /// Table id (e.g., "m_xxxxxxxx")
    pub id: String,
    /// Display name
    #[serde(default)]
    pub title: String,
    /// Physical table name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    /// Present on table metadata responses and in fetched schemas
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<Column>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A column (field) of a table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    /// Column id (e.g., "c_xxxxxxxx")
    pub id: String,
    /// Display name
    #[serde(default)]
    pub title: String,
    /// Physical column name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_name: Option<String>,
    /// UI data type (SingleLineText, Number, LinkToAnotherRecord, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uidt: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

macro_rules! impl_named {
    ($($ty:ty),*) => {
        $(
            impl From<&$ty> for NamedEntity {
                fn from(entity: &$ty) -> Self {
                    NamedEntity {
                        id: entity.id.clone(),
                        title: entity.title.clone(),
                        created_at: entity.created_at,
                    }
                }
            }
        )*
    };
}

impl_named!(Base, Table, Column);

/// Options for creating a base.
#[derive(Debug, Clone, Default)]
pub struct CreateBaseOptions {
    pub description: Option<String>,
    /// Icon color, e.g. "#FF0000" (sent as `meta.iconColor`)
    pub icon_color: Option<String>,
    /// Pick a free `<title>_N` name instead of creating a duplicate
    pub prevent_duplicates: bool,
}

impl CreateBaseOptions {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn icon_color(mut self, color: impl Into<String>) -> Self {
        self.icon_color = Some(color.into());
        self
    }

    pub fn prevent_duplicates(mut self, prevent: bool) -> Self {
        self.prevent_duplicates = prevent;
        self
    }

    /// Request body for `POST /meta/bases`.
    pub(crate) fn payload(&self, title: &str) -> Value {
        let mut body = Map::new();
        body.insert("title".to_string(), Value::String(title.to_string()));
        if let Some(description) = self.description.as_deref().filter(|d| !d.is_empty()) {
            body.insert(
                "description".to_string(),
                Value::String(description.to_string()),
            );
        }
        if let Some(color) = self.icon_color.as_deref().filter(|c| !c.is_empty()) {
            body.insert("meta".to_string(), serde_json::json!({ "iconColor": color }));
        }
        Value::Object(body)
    }
}

/// Filtering, sorting and paging for [`list_records`].
///
/// [`list_records`]: crate::NocoClient::list_records
#[derive(Debug, Clone, Default)]
pub struct ListRecordsQuery {
    /// Fields to return (all when empty)
    pub fields: Vec<String>,
    /// Sort fields, prefix with '-' for descending
    pub sort: Vec<String>,
    /// NocoDB where expression, e.g. "(Status,eq,Open)"
    pub where_clause: Option<String>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub view_id: Option<String>,
}

impl ListRecordsQuery {
    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn sort<I, S>(mut self, sort: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sort = sort.into_iter().map(Into::into).collect();
        self
    }

    pub fn filter(mut self, where_clause: impl Into<String>) -> Self {
        self.where_clause = Some(where_clause.into());
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn view(mut self, view_id: impl Into<String>) -> Self {
        self.view_id = Some(view_id.into());
        self
    }

    /// Query parameters, omitting unset options.
    pub(crate) fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if !self.fields.is_empty() {
            params.push(("fields", self.fields.join(",")));
        }
        if !self.sort.is_empty() {
            params.push(("sort", self.sort.join(",")));
        }
        if let Some(where_clause) = &self.where_clause {
            params.push(("where", where_clause.clone()));
        }
        if let Some(offset) = self.offset {
            params.push(("offset", offset.to_string()));
        }
        if let Some(limit) = self.limit {
            params.push(("limit", limit.to_string()));
        }
        if let Some(view_id) = &self.view_id {
            params.push(("viewId", view_id.clone()));
        }
        params
    }
}

/// First free title for `name` among `existing`.
///
/// Returns `name` unchanged when it is unused; otherwise `name_N` where N is
/// one above the highest numeric suffix already taken (at least 2).
pub fn unique_title<'a, I>(name: &str, existing: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let prefix = format!("{}_", name);
    let mut taken = false;
    let mut highest = 1u64;

    for title in existing {
        if title == name {
            taken = true;
        } else if let Some(suffix) = title.strip_prefix(&prefix) {
            if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(n) = suffix.parse::<u64>() {
                    highest = highest.max(n);
                }
            }
        }
    }

    if taken {
        format!("{}_{}", name, highest.saturating_add(1))
    } else {
        name.to_string()
    }
}

/// Timestamp formats NocoDB emits, tried in order after RFC 3339.
const OFFSET_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%:z", "%Y-%m-%d %H:%M:%S%.f%:z"];
const NAIVE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"];

/// Parse a server timestamp; a value without an offset is taken as UTC.
pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(date) = DateTime::parse_from_rfc3339(raw) {
        return Some(date.with_timezone(&Utc));
    }
    for format in OFFSET_FORMATS {
        if let Ok(date) = DateTime::parse_from_str(raw, format) {
            return Some(date.with_timezone(&Utc));
        }
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

/// Unparseable or non-string timestamps become `None` instead of failing
/// the whole response.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(Value::as_str).and_then(parse_timestamp))
}
