use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde_json::{Value, json};

use crate::{
    error::{DispatchError, Result},
    reading::Reading,
};

mod exclude;
mod log;
mod rename;

pub use exclude::ExcludePlugin;
pub use log::LogPlugin;
pub use rename::RenamePlugin;

/// A filter plugin transforms the set of readings flowing through a
/// pipeline. Plugins are discovered by name via a `PluginLoader` and live
/// inside a pipeline execution context, which chains them in order.
///
/// `init` must be called before the first `ingest`; calling it again
/// requires an intervening `shutdown`.
pub trait FilterPlugin: Send {
    fn name(&self) -> &'static str;

    /// The plugin's default configuration, upserted into the filter's
    /// configuration category when the pipeline loads.
    fn default_config(&self) -> Value {
        json!({})
    }

    fn init(&mut self, config: &Value) -> Result<()>;

    /// Transform a reading set. Returning an empty set drops the control
    /// request.
    fn ingest(&mut self, readings: Vec<Reading>) -> Vec<Reading>;

    fn reconfigure(&mut self, config: &Value);

    fn shutdown(&mut self);
}

pub type PluginFactory = fn() -> Box<dyn FilterPlugin>;

/// Name-keyed registry of filter-plugin factories. The builtin plugins
/// are always present; embedders register additional factories before the
/// service starts.
pub struct PluginLoader {
    factories: RwLock<BTreeMap<String, PluginFactory>>,
}

impl PluginLoader {
    pub fn new() -> Self {
        let loader = Self {
            factories: RwLock::new(BTreeMap::new()),
        };
        loader.register("log", || Box::new(LogPlugin::new()));
        loader.register("rename", || Box::new(RenamePlugin::new()));
        loader.register("exclude", || Box::new(ExcludePlugin::new()));
        loader
    }

    pub fn register(&self, name: &str, factory: PluginFactory) {
        self.factories.write().insert(name.to_string(), factory);
    }

    pub fn load(&self, name: &str) -> Result<Box<dyn FilterPlugin>> {
        let factories = self.factories.read();
        let factory = factories
            .get(name)
            .ok_or_else(|| DispatchError::Plugin(format!("unknown filter plugin '{}'", name)))?;
        Ok(factory())
    }
}

impl Default for PluginLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Read the value of one item from a merged configuration category.
/// Items are stored either as `{"item": {"value": ...}}` or as a bare
/// scalar.
pub fn category_item(category: &Value, item: &str) -> Option<String> {
    let entry = category.get(item)?;
    let value = entry.get("value").unwrap_or(entry);
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
