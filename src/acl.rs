use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::{
    error::{DispatchError, Result},
    storage::AclRow,
};

/// The caller identity a control request carries: the authenticated
/// service name and type (empty when authentication is disabled), the
/// ingress path the request arrived on, and the optional advisory
/// identity from the payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerContext {
    pub source_name: String,
    pub source_type: String,
    pub request_url: String,
    pub advisory: Option<Advisory>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advisory {
    pub caller_type: String,
    pub caller_name: String,
}

impl CallerContext {
    pub fn anonymous(request_url: impl Into<String>) -> Self {
        Self {
            request_url: request_url.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ServiceEntry {
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "type")]
    service_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct UrlEntry {
    url: String,
    #[serde(default)]
    acl: Vec<TypeEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct TypeEntry {
    #[serde(rename = "type")]
    service_type: String,
}

/// An access control list attached to an automation script. Admission
/// requires both the service list and the URL list to pass; an empty list
/// passes everything.
#[derive(Debug, Clone)]
pub struct AccessControl {
    name: String,
    services: Vec<ServiceEntry>,
    urls: Vec<UrlEntry>,
}

impl AccessControl {
    pub fn from_row(row: &AclRow) -> Result<Self> {
        Ok(Self {
            name: row.name.clone(),
            services: parse_column(&row.service, "service")?,
            urls: parse_column(&row.url, "url")?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn authorize(&self, caller: &CallerContext) -> bool {
        self.service_allowed(caller) && self.url_allowed(caller)
    }

    fn service_allowed(&self, caller: &CallerContext) -> bool {
        if self.services.is_empty() {
            return true;
        }
        self.services.iter().any(|entry| {
            entry
                .name
                .as_deref()
                .map(|name| name == caller.source_name)
                .unwrap_or(false)
                || entry
                    .service_type
                    .as_deref()
                    .map(|st| st == caller.source_type)
                    .unwrap_or(false)
        })
    }

    fn url_allowed(&self, caller: &CallerContext) -> bool {
        if self.urls.is_empty() {
            return true;
        }
        self.urls.iter().any(|entry| {
            if entry.url == caller.request_url {
                return true;
            }
            if entry.acl.is_empty() {
                // A URL entry with no type restriction admits any type
                // only for its own URL, which did not match.
                return false;
            }
            entry
                .acl
                .iter()
                .any(|t| t.service_type == caller.source_type)
        })
    }
}

/// The ACL columns are JSON arrays, sometimes stored as strings holding a
/// JSON array. A null or empty column means unrestricted.
fn parse_column<T: serde::de::DeserializeOwned>(value: &Value, column: &str) -> Result<Vec<T>> {
    let parsed = match value {
        Value::Null => return Ok(Vec::new()),
        Value::String(raw) if raw.trim().is_empty() => return Ok(Vec::new()),
        Value::String(raw) => serde_json::from_str::<Value>(raw)
            .map_err(|err| DispatchError::Storage(format!("bad acl {} column: {}", column, err)))?,
        other => other.clone(),
    };
    match parsed {
        Value::Array(_) => serde_json::from_value(parsed)
            .map_err(|err| DispatchError::Storage(format!("bad acl {} entry: {}", column, err))),
        other => {
            warn!("acl {} column is not an array: {}", column, other);
            Ok(Vec::new())
        }
    }
}
