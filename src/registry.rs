use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use crate::error::{DispatchError, Result};

pub const SOUTHBOUND_TYPE: &str = "Southbound";
pub const STORAGE_TYPE: &str = "Storage";

/// Registration record for a service known to the core registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub token: Option<String>,
}

fn default_protocol() -> String {
    "http".to_string()
}

impl ServiceRecord {
    pub fn new(
        name: impl Into<String>,
        service_type: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            service_type: service_type.into(),
            protocol: default_protocol(),
            address: address.into(),
            port,
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.address, self.port)
    }
}

/// The service registry contract consumed from the core.
pub trait ServiceRegistry: Send + Sync {
    fn register(&self, record: &ServiceRecord) -> Result<()>;
    fn unregister(&self, name: &str) -> Result<()>;
    fn get_service(&self, name: &str) -> Result<ServiceRecord>;
    fn services_by_type(&self, service_type: &str) -> Result<Vec<ServiceRecord>>;

    /// Record an audit event with the core. Best effort.
    fn audit(&self, code: &str, payload: &Value) {
        info!(target: "dispatchx.audit", code, payload = %payload, "audit event");
    }
}

/// The configuration/category store contract consumed from the core.
pub trait ConfigStore: Send + Sync {
    /// The merged configuration of a category (defaults overlaid with any
    /// stored values).
    fn get_category(&self, name: &str) -> Result<Value>;

    /// Create the category or merge new default items into it, keeping
    /// values already stored. Idempotent.
    fn create_category(&self, name: &str, defaults: &Value, description: &str) -> Result<()>;

    fn set_category_item(&self, category: &str, item: &str, value: &str) -> Result<()>;
}

/// The asset tracker contract: which service ingests a given asset.
pub trait AssetResolver: Send + Sync {
    fn ingest_service(&self, asset: &str) -> Result<Option<String>>;
}

/// HTTP client for the core service, covering registration, configuration
/// categories and asset tracking.
pub struct CoreClient {
    client: reqwest::blocking::Client,
    base: String,
    token: Option<String>,
}

impl CoreClient {
    pub fn new(address: &str, port: u16, token: Option<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|err| DispatchError::Config(err.to_string()))?;
        Ok(Self {
            client,
            base: format!("http://{}:{}", address, port),
            token,
        })
    }

    fn request(&self, builder: reqwest::blocking::RequestBuilder) -> Result<Value> {
        let builder = match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        };
        let response = builder
            .send()
            .map_err(|err| DispatchError::Config(format!("core request failed: {}", err)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Config(format!("core returned {}", status)));
        }
        let text = response
            .text()
            .map_err(|err| DispatchError::Config(format!("bad core response: {}", err)))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|err| DispatchError::Config(format!("bad core response: {}", err)))
    }
}

impl ServiceRegistry for CoreClient {
    fn register(&self, record: &ServiceRecord) -> Result<()> {
        let url = format!("{}/core/service", self.base);
        self.request(self.client.post(&url).json(record))?;
        Ok(())
    }

    fn unregister(&self, name: &str) -> Result<()> {
        let url = format!("{}/core/service/{}", self.base, name);
        self.request(self.client.delete(&url))?;
        Ok(())
    }

    fn get_service(&self, name: &str) -> Result<ServiceRecord> {
        let url = format!("{}/core/service?name={}", self.base, name);
        let body = self.request(self.client.get(&url))?;
        let mut services: Vec<ServiceRecord> = parse_services(body)?;
        if services.is_empty() {
            return Err(DispatchError::NotFound("service", name.to_string()));
        }
        Ok(services.remove(0))
    }

    fn services_by_type(&self, service_type: &str) -> Result<Vec<ServiceRecord>> {
        let url = format!("{}/core/service?type={}", self.base, service_type);
        let body = self.request(self.client.get(&url))?;
        parse_services(body)
    }

    fn audit(&self, code: &str, payload: &Value) {
        let url = format!("{}/core/audit", self.base);
        let body = json!({"source": code, "severity": "INFORMATION", "details": payload});
        if let Err(err) = self.request(self.client.post(&url).json(&body)) {
            info!("audit event {} not recorded: {}", code, err);
        }
    }
}

fn parse_services(body: Value) -> Result<Vec<ServiceRecord>> {
    let rows = body
        .get("services")
        .cloned()
        .unwrap_or(Value::Array(Vec::new()));
    serde_json::from_value(rows)
        .map_err(|err| DispatchError::Config(format!("bad service record: {}", err)))
}

impl ConfigStore for CoreClient {
    fn get_category(&self, name: &str) -> Result<Value> {
        let url = format!("{}/core/category/{}", self.base, name);
        self.request(self.client.get(&url))
    }

    fn create_category(&self, name: &str, defaults: &Value, description: &str) -> Result<()> {
        let url = format!("{}/core/category", self.base);
        let body = json!({
            "key": name,
            "description": description,
            "value": defaults,
            "keep_original_items": true,
        });
        self.request(self.client.post(&url).json(&body))?;
        Ok(())
    }

    fn set_category_item(&self, category: &str, item: &str, value: &str) -> Result<()> {
        let url = format!("{}/core/category/{}/{}", self.base, category, item);
        self.request(self.client.put(&url).json(&json!({"value": value})))?;
        Ok(())
    }
}

impl AssetResolver for CoreClient {
    fn ingest_service(&self, asset: &str) -> Result<Option<String>> {
        let url = format!("{}/core/track?asset={}&event=Ingest", self.base, asset);
        let body = self.request(self.client.get(&url))?;
        let service = body
            .get("track")
            .and_then(|t| t.as_array())
            .and_then(|rows| rows.first())
            .and_then(|row| row.get("service"))
            .and_then(|s| s.as_str())
            .map(|s| s.to_string());
        Ok(service)
    }
}

/// Fixed-table registry used by the tests.
#[derive(Default)]
pub struct StaticRegistry {
    services: RwLock<Vec<ServiceRecord>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, record: ServiceRecord) {
        self.services.write().push(record);
    }
}

impl ServiceRegistry for StaticRegistry {
    fn register(&self, record: &ServiceRecord) -> Result<()> {
        info!("registered service '{}'", record.name);
        Ok(())
    }

    fn unregister(&self, name: &str) -> Result<()> {
        info!("unregistered service '{}'", name);
        Ok(())
    }

    fn get_service(&self, name: &str) -> Result<ServiceRecord> {
        self.services
            .read()
            .iter()
            .find(|record| record.name == name)
            .cloned()
            .ok_or_else(|| DispatchError::NotFound("service", name.to_string()))
    }

    fn services_by_type(&self, service_type: &str) -> Result<Vec<ServiceRecord>> {
        Ok(self
            .services
            .read()
            .iter()
            .filter(|record| record.service_type == service_type)
            .cloned()
            .collect())
    }
}

/// In-memory category store. `create_category` merges defaults under
/// existing values, matching the core's keep-original-items behaviour.
#[derive(Default)]
pub struct MemoryConfigStore {
    categories: RwLock<serde_json::Map<String, Value>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, name: &str, value: Value) {
        self.categories.write().insert(name.to_string(), value);
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get_category(&self, name: &str) -> Result<Value> {
        Ok(self
            .categories
            .read()
            .get(name)
            .cloned()
            .unwrap_or_else(|| json!({})))
    }

    fn create_category(&self, name: &str, defaults: &Value, _description: &str) -> Result<()> {
        let mut categories = self.categories.write();
        let entry = categories
            .entry(name.to_string())
            .or_insert_with(|| json!({}));
        if let (Value::Object(existing), Value::Object(incoming)) = (entry, defaults) {
            for (key, value) in incoming {
                existing.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        Ok(())
    }

    fn set_category_item(&self, category: &str, item: &str, value: &str) -> Result<()> {
        let mut categories = self.categories.write();
        let entry = categories
            .entry(category.to_string())
            .or_insert_with(|| json!({}));
        if let Value::Object(items) = entry {
            match items.get_mut(item) {
                Some(Value::Object(existing)) => {
                    existing.insert("value".to_string(), json!(value));
                }
                _ => {
                    items.insert(item.to_string(), json!({"value": value}));
                }
            }
        }
        Ok(())
    }
}

/// Fixed asset-to-service map.
#[derive(Default)]
pub struct StaticAssets {
    map: RwLock<Vec<(String, String)>>,
}

impl StaticAssets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, asset: &str, service: &str) {
        self.map
            .write()
            .push((asset.to_string(), service.to_string()));
    }
}

impl AssetResolver for StaticAssets {
    fn ingest_service(&self, asset: &str) -> Result<Option<String>> {
        Ok(self
            .map
            .read()
            .iter()
            .find(|(a, _)| a == asset)
            .map(|(_, s)| s.clone()))
    }
}
