use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    error::Result,
    plugin::{FilterPlugin, PluginLoader, category_item},
    reading::Reading,
    registry::ConfigStore,
};

use super::manager::CategoryRegistrations;

/// The live, wired-up chain of filter plugins for one pipeline. The
/// plugin at position `i` feeds the plugin at `i + 1`; the output of the
/// last plugin is the result of the pipeline.
///
/// A context executes one filter call at a time. Shared pipelines hand
/// every caller the same context, serialising them; exclusive pipelines
/// hold one context per (source, destination) pair.
pub struct PipelineExecutionContext {
    name: String,
    config: Arc<dyn ConfigStore>,
    loader: Arc<PluginLoader>,
    categories: Arc<CategoryRegistrations>,
    self_ref: Weak<PipelineExecutionContext>,
    inner: Mutex<ContextInner>,
}

struct ContextInner {
    filters: Vec<String>,
    plugins: Vec<Box<dyn FilterPlugin>>,
    attempted: bool,
    failed: bool,
}

impl PipelineExecutionContext {
    pub fn new(
        name: impl Into<String>,
        filters: Vec<String>,
        config: Arc<dyn ConfigStore>,
        loader: Arc<PluginLoader>,
        categories: Arc<CategoryRegistrations>,
    ) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|self_ref| Self {
            name,
            config,
            loader,
            categories,
            self_ref: self_ref.clone(),
            inner: Mutex::new(ContextInner {
                filters,
                plugins: Vec::new(),
                attempted: false,
                failed: false,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run one reading through the pipeline. `None` means the pipeline
    /// suppressed the control request.
    pub fn filter(&self, reading: Reading) -> Option<Reading> {
        let mut inner = self.inner.lock();

        if !inner.attempted {
            if let Err(err) = self.load_locked(&mut inner) {
                error!("failed to load pipeline '{}': {}", self.name, err);
            }
        }
        if inner.failed {
            warn!(
                "pipeline '{}' is not executable, control request dropped",
                self.name
            );
            return None;
        }
        if inner.plugins.is_empty() {
            warn!(
                "no filter is configured for pipeline '{}', control request dropped",
                self.name
            );
            return None;
        }

        debug!("filtering control request through pipeline '{}'", self.name);
        let mut readings = vec![reading];
        for plugin in inner.plugins.iter_mut() {
            readings = plugin.ingest(readings);
            if readings.is_empty() {
                break;
            }
        }

        match readings.into_iter().next() {
            Some(result) => Some(result),
            None => {
                info!("control pipeline '{}' removed control request", self.name);
                None
            }
        }
    }

    /// Insert a filter at one-based `order` and splice its plugin into
    /// the chain. Before the first load only the filter list is touched;
    /// the lazy load picks the new entry up.
    pub fn add_filter(&self, filter: &str, order: usize) {
        let mut inner = self.inner.lock();
        let index = order.saturating_sub(1).min(inner.filters.len());

        if !inner.attempted {
            inner.filters.insert(index, filter.to_string());
            return;
        }

        match self.load_one(filter) {
            Ok(Some(plugin)) => {
                inner.filters.insert(index, filter.to_string());
                inner.plugins.insert(index, plugin);
                self.categories.register(filter, self.self_ref.clone());
            }
            Ok(None) => {
                warn!(
                    "filter category '{}' has no plugin configured, not added to pipeline '{}'",
                    filter, self.name
                );
            }
            Err(err) => {
                error!(
                    "cannot add filter '{}' to pipeline '{}': {}",
                    filter, self.name, err
                );
            }
        }
    }

    /// Remove a filter, shutting its plugin down and closing the gap in
    /// the chain.
    pub fn remove_filter(&self, filter: &str) {
        let mut inner = self.inner.lock();
        let Some(index) = inner.filters.iter().position(|f| f == filter) else {
            return;
        };
        inner.filters.remove(index);
        if index < inner.plugins.len() {
            let mut plugin = inner.plugins.remove(index);
            plugin.shutdown();
        }
        self.categories.unregister(filter, &self.self_ref);
    }

    /// Move a filter to one-based `order` by swapping it with whatever
    /// occupies that slot. Already in place is a no-op.
    pub fn reorder(&self, filter: &str, order: usize) {
        let mut inner = self.inner.lock();
        let target = order.saturating_sub(1);
        let Some(index) = inner.filters.iter().position(|f| f == filter) else {
            return;
        };
        if index == target || target >= inner.filters.len() {
            return;
        }
        inner.filters.swap(index, target);
        if index < inner.plugins.len() && target < inner.plugins.len() {
            inner.plugins.swap(index, target);
        }
    }

    /// Push new configuration into every plugin loaded for the category.
    pub fn reconfigure(&self, category: &str, config: &serde_json::Value) {
        let mut inner = self.inner.lock();
        let indexes: Vec<usize> = inner
            .filters
            .iter()
            .enumerate()
            .filter(|(_, f)| f.as_str() == category)
            .map(|(i, _)| i)
            .collect();
        for index in indexes {
            if let Some(plugin) = inner.plugins.get_mut(index) {
                plugin.reconfigure(config);
            }
        }
    }

    pub fn filters(&self) -> Vec<String> {
        self.inner.lock().filters.clone()
    }

    pub fn plugin_count(&self) -> usize {
        self.inner.lock().plugins.len()
    }

    pub fn is_loaded(&self) -> bool {
        let inner = self.inner.lock();
        inner.attempted && !inner.failed
    }

    fn load_locked(&self, inner: &mut ContextInner) -> Result<()> {
        inner.attempted = true;
        debug!("loading pipeline '{}'", self.name);

        let wanted = inner.filters.clone();
        let mut filters = Vec::with_capacity(wanted.len());
        let mut plugins: Vec<Box<dyn FilterPlugin>> = Vec::with_capacity(wanted.len());

        for category in &wanted {
            match self.load_one(category) {
                Ok(Some(plugin)) => {
                    self.categories.register(category, self.self_ref.clone());
                    filters.push(category.clone());
                    plugins.push(plugin);
                }
                Ok(None) => {
                    warn!(
                        "filter category '{}' has no plugin configured, skipping",
                        category
                    );
                }
                Err(err) => {
                    inner.failed = true;
                    inner.filters = filters;
                    inner.plugins = plugins;
                    return Err(err);
                }
            }
        }

        inner.filters = filters;
        inner.plugins = plugins;
        Ok(())
    }

    /// Load the plugin a filter category names. `None` means the
    /// category has no `plugin` item and the entry should be skipped.
    fn load_one(&self, category: &str) -> Result<Option<Box<dyn FilterPlugin>>> {
        let config = self.config.get_category(category)?;
        let Some(plugin_name) = category_item(&config, "plugin") else {
            return Ok(None);
        };

        debug!(
            "loading plugin '{}' for filter '{}' of pipeline '{}'",
            plugin_name, category, self.name
        );
        let mut plugin = self.loader.load(&plugin_name)?;

        let description = format!(
            "Configuration of '{}' filter for plugin '{}'",
            plugin_name, category
        );
        self.config
            .create_category(category, &plugin.default_config(), &description)?;

        let merged = self.config.get_category(category)?;
        plugin.init(&merged)?;
        Ok(Some(plugin))
    }
}

impl Drop for PipelineExecutionContext {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        for plugin in inner.plugins.iter_mut() {
            plugin.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvlist::KVList;
    use crate::registry::MemoryConfigStore;
    use serde_json::json;

    fn rename_category(find: &str, replace: &str) -> serde_json::Value {
        json!({
            "plugin": {"value": "rename"},
            "find": {"value": find},
            "replace": {"value": replace},
        })
    }

    fn context_with(
        config: Arc<MemoryConfigStore>,
        filters: Vec<String>,
    ) -> Arc<PipelineExecutionContext> {
        PipelineExecutionContext::new(
            "test-pipeline",
            filters,
            config,
            Arc::new(PluginLoader::new()),
            Arc::new(CategoryRegistrations::new()),
        )
    }

    fn reading(pairs: &[(&str, &str)]) -> Reading {
        let mut values = KVList::new();
        for (k, v) in pairs {
            values.add(*k, *v);
        }
        values.to_reading("reading")
    }

    #[test]
    fn loads_and_filters_in_order() {
        let config = Arc::new(MemoryConfigStore::new());
        config.seed("step1", rename_category("rpm", "speed"));
        config.seed("step2", rename_category("speed", "velocity"));

        let ctx = context_with(config, vec!["step1".into(), "step2".into()]);
        let result = ctx.filter(reading(&[("rpm", "1500")])).unwrap();
        let values = KVList::from_reading(&result);
        assert_eq!(values.get("velocity"), Some("1500"));
        assert_eq!(ctx.plugin_count(), 2);
        assert_eq!(ctx.filters().len(), 2);
    }

    #[test]
    fn empty_pipeline_suppresses_the_request() {
        let config = Arc::new(MemoryConfigStore::new());
        let ctx = context_with(config, Vec::new());
        assert!(ctx.filter(reading(&[("rpm", "1500")])).is_none());
    }

    #[test]
    fn dropped_reading_suppresses_the_request() {
        let config = Arc::new(MemoryConfigStore::new());
        config.seed(
            "killer",
            json!({"plugin": {"value": "exclude"}, "datapoints": {"value": "rpm"}}),
        );
        let ctx = context_with(config, vec!["killer".into()]);
        assert!(ctx.filter(reading(&[("rpm", "1500")])).is_none());
    }

    #[test]
    fn unknown_plugin_marks_the_context_non_executable() {
        let config = Arc::new(MemoryConfigStore::new());
        config.seed("broken", json!({"plugin": {"value": "no-such-plugin"}}));
        let ctx = context_with(config, vec!["broken".into()]);
        assert!(ctx.filter(reading(&[("rpm", "1500")])).is_none());
        assert!(!ctx.is_loaded());
    }

    #[test]
    fn category_without_plugin_item_is_skipped() {
        let config = Arc::new(MemoryConfigStore::new());
        config.seed("step1", rename_category("rpm", "speed"));
        config.seed("no-plugin", json!({"other": {"value": "x"}}));

        let ctx = context_with(config, vec!["no-plugin".into(), "step1".into()]);
        let result = ctx.filter(reading(&[("rpm", "1500")])).unwrap();
        assert_eq!(KVList::from_reading(&result).get("speed"), Some("1500"));
        assert_eq!(ctx.plugin_count(), 1);
        assert_eq!(ctx.filters(), vec!["step1".to_string()]);
    }

    #[test]
    fn add_remove_and_reorder_keep_lists_aligned() {
        let config = Arc::new(MemoryConfigStore::new());
        config.seed("a", rename_category("x", "y"));
        config.seed("b", rename_category("y", "z"));
        config.seed("c", rename_category("z", "w"));

        let ctx = context_with(config, vec!["a".into(), "c".into()]);
        ctx.filter(reading(&[("x", "1")]));
        assert_eq!(ctx.filters(), vec!["a".to_string(), "c".to_string()]);

        ctx.add_filter("b", 2);
        assert_eq!(
            ctx.filters(),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert_eq!(ctx.plugin_count(), 3);

        let result = ctx.filter(reading(&[("x", "1")])).unwrap();
        assert_eq!(KVList::from_reading(&result).get("w"), Some("1"));

        ctx.reorder("c", 3);
        assert_eq!(
            ctx.filters(),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );

        ctx.remove_filter("b");
        assert_eq!(ctx.filters(), vec!["a".to_string(), "c".to_string()]);
        assert_eq!(ctx.plugin_count(), 2);
    }
}
