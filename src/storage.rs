use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};

use crate::error::{DispatchError, Result};

pub const PIPELINES_TABLE: &str = "control_pipelines";
pub const FILTERS_TABLE: &str = "control_filters";
pub const SOURCES_TABLE: &str = "control_source";
pub const DESTINATIONS_TABLE: &str = "control_destination";
pub const SCRIPT_TABLE: &str = "control_script";
pub const ACL_TABLE: &str = "control_acl";

/// One row of the `control_pipelines` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRow {
    pub cpid: i64,
    pub name: String,
    pub stype: i64,
    #[serde(default)]
    pub sname: String,
    pub dtype: i64,
    #[serde(default)]
    pub dname: String,
    #[serde(deserialize_with = "flag_from_any")]
    pub enabled: bool,
    pub execution: String,
}

impl PipelineRow {
    pub fn is_exclusive(&self) -> bool {
        self.execution.eq_ignore_ascii_case("exclusive")
    }
}

/// One row of the `control_filters` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRow {
    pub cpid: i64,
    pub fname: String,
    pub forder: i64,
}

/// One row of the endpoint-type lookup tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceTypeRow {
    pub cpsid: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestTypeRow {
    pub cpdid: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// One row of the `control_script` table. `steps` may hold the parsed
/// array, a string containing the array, or an object wrapping it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptRow {
    pub name: String,
    pub steps: Value,
    #[serde(default)]
    pub acl: Option<String>,
}

/// One row of the `control_acl` table. The two columns are JSON arrays,
/// possibly stored as strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclRow {
    pub name: String,
    #[serde(default)]
    pub service: Value,
    #[serde(default)]
    pub url: Value,
}

/// Booleans come out of the tables as real booleans, as `t`/`f`
/// characters or as the words `true`/`false`.
pub fn parse_flag(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        Value::String(s) => matches!(s.as_str(), "t" | "T" | "true" | "True" | "1"),
        _ => false,
    }
}

fn flag_from_any<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(parse_flag(&value))
}

/// The where-clause envelope carried by table update and delete
/// notifications: `{column, condition, value, and?}`.
#[derive(Debug, Clone, Deserialize)]
pub struct WhereClause {
    pub column: String,
    #[serde(default)]
    pub condition: String,
    pub value: Value,
    #[serde(default)]
    pub and: Option<Box<WhereClause>>,
}

impl WhereClause {
    /// Walk the and-chain looking for an equality constraint on `column`.
    pub fn constraint(&self, column: &str) -> Option<&Value> {
        let mut clause = Some(self);
        while let Some(current) = clause {
            if current.column == column {
                return Some(&current.value);
            }
            clause = current.and.as_deref();
        }
        None
    }

    pub fn constraint_i64(&self, column: &str) -> Option<i64> {
        match self.constraint(column)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn constraint_str(&self, column: &str) -> Option<String> {
        match self.constraint(column)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// An update or delete notification: the changed values plus the where
/// clause identifying the affected rows.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeEnvelope {
    #[serde(default)]
    pub values: serde_json::Map<String, Value>,
    #[serde(rename = "where")]
    pub where_clause: WhereClause,
}

impl ChangeEnvelope {
    pub fn parse(body: &Value) -> Result<Self> {
        serde_json::from_value(body.clone())
            .map_err(|err| DispatchError::BadRequest(format!("bad change envelope: {}", err)))
    }
}

/// Read-only view over the control tables held by the external storage
/// service.
pub trait StorageTables: Send + Sync {
    fn pipelines(&self) -> Result<Vec<PipelineRow>>;
    fn pipeline_by_name(&self, name: &str) -> Result<Option<PipelineRow>>;
    /// Filters assigned to a pipeline, ordered by `forder` ascending.
    fn filters_for(&self, cpid: i64) -> Result<Vec<FilterRow>>;
    fn source_types(&self) -> Result<Vec<SourceTypeRow>>;
    fn destination_types(&self) -> Result<Vec<DestTypeRow>>;
    fn script(&self, name: &str) -> Result<Option<ScriptRow>>;
    fn acl(&self, name: &str) -> Result<Option<AclRow>>;
}

/// In-memory storage twin used by the tests and by embedders that feed
/// the dispatcher from somewhere other than the storage service.
#[derive(Default)]
pub struct MemoryStorage {
    inner: RwLock<MemoryTables>,
}

#[derive(Default)]
struct MemoryTables {
    pipelines: Vec<PipelineRow>,
    filters: Vec<FilterRow>,
    sources: Vec<SourceTypeRow>,
    destinations: Vec<DestTypeRow>,
    scripts: Vec<ScriptRow>,
    acls: Vec<AclRow>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// A storage twin pre-seeded with the standard endpoint-type rows.
    pub fn with_default_types() -> Self {
        let storage = Self::new();
        {
            let mut inner = storage.inner.write();
            for (id, name) in [
                (1, "Any"),
                (2, "Service"),
                (3, "API"),
                (4, "Notification"),
                (5, "Schedule"),
                (6, "Script"),
            ] {
                inner.sources.push(SourceTypeRow {
                    cpsid: id,
                    name: name.to_string(),
                    description: String::new(),
                });
            }
            for (id, name) in [
                (1, "Any"),
                (2, "Service"),
                (3, "Asset"),
                (4, "Script"),
                (5, "Broadcast"),
            ] {
                inner.destinations.push(DestTypeRow {
                    cpdid: id,
                    name: name.to_string(),
                    description: String::new(),
                });
            }
        }
        storage
    }

    pub fn insert_pipeline(&self, row: PipelineRow) {
        self.inner.write().pipelines.push(row);
    }

    pub fn remove_pipeline(&self, cpid: i64) {
        self.inner.write().pipelines.retain(|row| row.cpid != cpid);
    }

    pub fn insert_filter(&self, row: FilterRow) {
        self.inner.write().filters.push(row);
    }

    pub fn insert_script(&self, row: ScriptRow) {
        self.inner.write().scripts.push(row);
    }

    pub fn insert_acl(&self, row: AclRow) {
        self.inner.write().acls.push(row);
    }
}

impl StorageTables for MemoryStorage {
    fn pipelines(&self) -> Result<Vec<PipelineRow>> {
        Ok(self.inner.read().pipelines.clone())
    }

    fn pipeline_by_name(&self, name: &str) -> Result<Option<PipelineRow>> {
        Ok(self
            .inner
            .read()
            .pipelines
            .iter()
            .find(|row| row.name == name)
            .cloned())
    }

    fn filters_for(&self, cpid: i64) -> Result<Vec<FilterRow>> {
        let mut rows: Vec<FilterRow> = self
            .inner
            .read()
            .filters
            .iter()
            .filter(|row| row.cpid == cpid)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.forder);
        Ok(rows)
    }

    fn source_types(&self) -> Result<Vec<SourceTypeRow>> {
        Ok(self.inner.read().sources.clone())
    }

    fn destination_types(&self) -> Result<Vec<DestTypeRow>> {
        Ok(self.inner.read().destinations.clone())
    }

    fn script(&self, name: &str) -> Result<Option<ScriptRow>> {
        Ok(self
            .inner
            .read()
            .scripts
            .iter()
            .find(|row| row.name == name)
            .cloned())
    }

    fn acl(&self, name: &str) -> Result<Option<AclRow>> {
        Ok(self
            .inner
            .read()
            .acls
            .iter()
            .find(|row| row.name == name)
            .cloned())
    }
}

/// Storage-service client speaking the table query API over HTTP.
pub struct HttpStorageTables {
    client: reqwest::blocking::Client,
    base: String,
}

impl HttpStorageTables {
    pub fn new(base: impl Into<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|err| DispatchError::Storage(err.to_string()))?;
        Ok(Self {
            client,
            base: base.into(),
        })
    }

    fn query<T: serde::de::DeserializeOwned>(&self, table: &str, payload: Value) -> Result<Vec<T>> {
        let url = format!("{}/storage/table/{}/query", self.base, table);
        let response = self
            .client
            .put(&url)
            .json(&payload)
            .send()
            .map_err(|err| DispatchError::Storage(format!("query on {}: {}", table, err)))?;
        if !response.status().is_success() {
            return Err(DispatchError::Storage(format!(
                "query on {} returned {}",
                table,
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .map_err(|err| DispatchError::Storage(err.to_string()))?;
        let rows = body
            .get("rows")
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));
        serde_json::from_value(rows).map_err(|err| {
            DispatchError::Storage(format!("bad row shape from {}: {}", table, err))
        })
    }

    fn query_one<T: serde::de::DeserializeOwned>(
        &self,
        table: &str,
        column: &str,
        value: &str,
    ) -> Result<Option<T>> {
        let payload = json!({"where": {"column": column, "condition": "=", "value": value}});
        let mut rows = self.query::<T>(table, payload)?;
        if rows.is_empty() {
            Ok(None)
        } else {
            Ok(Some(rows.remove(0)))
        }
    }
}

impl StorageTables for HttpStorageTables {
    fn pipelines(&self) -> Result<Vec<PipelineRow>> {
        self.query(PIPELINES_TABLE, json!({}))
    }

    fn pipeline_by_name(&self, name: &str) -> Result<Option<PipelineRow>> {
        self.query_one(PIPELINES_TABLE, "name", name)
    }

    fn filters_for(&self, cpid: i64) -> Result<Vec<FilterRow>> {
        let payload = json!({
            "where": {"column": "cpid", "condition": "=", "value": cpid},
            "sort": {"column": "forder", "direction": "asc"},
        });
        self.query(FILTERS_TABLE, payload)
    }

    fn source_types(&self) -> Result<Vec<SourceTypeRow>> {
        self.query(SOURCES_TABLE, json!({}))
    }

    fn destination_types(&self) -> Result<Vec<DestTypeRow>> {
        self.query(DESTINATIONS_TABLE, json!({}))
    }

    fn script(&self, name: &str) -> Result<Option<ScriptRow>> {
        self.query_one(SCRIPT_TABLE, "name", name)
    }

    fn acl(&self, name: &str) -> Result<Option<AclRow>> {
        self.query_one(ACL_TABLE, "name", name)
    }
}
