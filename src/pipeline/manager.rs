use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Weak},
};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::{
    endpoint::{Endpoint, EndpointKind},
    error::{DispatchError, Result},
    plugin::PluginLoader,
    registry::ConfigStore,
    storage::{ChangeEnvelope, PipelineRow, StorageTables, parse_flag},
};

use super::{ContextDeps, ControlPipeline, PipelineExecutionContext};

/// Table-change operations pushed by the storage notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableOp {
    Insert,
    Update,
    Delete,
}

impl TableOp {
    pub fn parse(op: &str) -> Option<TableOp> {
        match op {
            "insert" => Some(TableOp::Insert),
            "update" => Some(TableOp::Update),
            "delete" => Some(TableOp::Delete),
            _ => None,
        }
    }
}

/// Multi-map from filter-category name to the execution contexts holding
/// a plugin loaded for it. Configuration changes for a category fan out
/// to every registered context.
pub struct CategoryRegistrations {
    inner: Mutex<BTreeMap<String, Vec<Weak<PipelineExecutionContext>>>>,
}

impl CategoryRegistrations {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn register(&self, category: &str, context: Weak<PipelineExecutionContext>) {
        let mut inner = self.inner.lock();
        let entries = inner.entry(category.to_string()).or_default();
        if !entries.iter().any(|existing| existing.ptr_eq(&context)) {
            entries.push(context);
        }
    }

    pub fn unregister(&self, category: &str, context: &Weak<PipelineExecutionContext>) {
        let mut inner = self.inner.lock();
        if let Some(entries) = inner.get_mut(category) {
            entries.retain(|existing| !existing.ptr_eq(context));
            if entries.is_empty() {
                inner.remove(category);
            }
        }
    }

    pub fn contains(&self, category: &str) -> bool {
        self.inner.lock().contains_key(category)
    }

    /// Deliver new category content to every registered context. The
    /// targets are collected first so no context is called with the map
    /// lock held.
    pub fn notify(&self, category: &str, config: &Value) {
        let targets: Vec<Arc<PipelineExecutionContext>> = {
            let mut inner = self.inner.lock();
            match inner.get_mut(category) {
                Some(entries) => {
                    entries.retain(|weak| weak.strong_count() > 0);
                    entries.iter().filter_map(Weak::upgrade).collect()
                }
                None => return,
            }
        };
        for context in targets {
            context.reconfigure(category, config);
        }
    }
}

impl Default for CategoryRegistrations {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
struct EndpointLookup {
    name: String,
    kind: EndpointKind,
}

#[derive(Default)]
struct Lookups {
    sources: HashMap<i64, EndpointLookup>,
    destinations: HashMap<i64, EndpointLookup>,
}

struct RegistryState {
    pipelines: BTreeMap<String, Arc<ControlPipeline>>,
    id_to_name: HashMap<i64, String>,
}

/// The registry of control pipelines. Loads from the storage tables at
/// startup, serves best-match lookups, and keeps itself current from the
/// table-change notifications.
pub struct ControlPipelineManager {
    storage: Arc<dyn StorageTables>,
    config: Arc<dyn ConfigStore>,
    loader: Arc<PluginLoader>,
    categories: Arc<CategoryRegistrations>,
    registry: Mutex<RegistryState>,
    lookups: RwLock<Lookups>,
}

impl ControlPipelineManager {
    pub fn new(
        storage: Arc<dyn StorageTables>,
        config: Arc<dyn ConfigStore>,
        loader: Arc<PluginLoader>,
    ) -> Self {
        Self {
            storage,
            config,
            loader,
            categories: Arc::new(CategoryRegistrations::new()),
            registry: Mutex::new(RegistryState {
                pipelines: BTreeMap::new(),
                id_to_name: HashMap::new(),
            }),
            lookups: RwLock::new(Lookups::default()),
        }
    }

    /// Initial load of the endpoint-type lookup tables and every pipeline
    /// row. Runs before the first worker starts; subsequent changes
    /// arrive as table notifications.
    pub fn load_pipelines(&self) -> Result<()> {
        self.load_lookup_tables()?;

        let rows = self.storage.pipelines()?;
        let mut registry = self.registry.lock();
        for row in rows {
            match self.build_pipeline(&row) {
                Some(pipeline) => {
                    registry.id_to_name.insert(row.cpid, row.name.clone());
                    registry.pipelines.insert(row.name.clone(), pipeline);
                }
                None => {
                    error!("failed to build the '{}' control pipeline", row.name);
                }
            }
        }
        info!("loaded {} control pipelines", registry.pipelines.len());
        Ok(())
    }

    /// Find the best pipeline for a request flowing between the two
    /// endpoints. Exact matches beat wildcard-source matches beat
    /// wildcard-destination matches beat catch-alls; inside a tier the
    /// lexicographically-first pipeline name wins.
    pub fn find_pipeline(
        &self,
        source: &Endpoint,
        dest: &Endpoint,
    ) -> Option<Arc<ControlPipeline>> {
        let registry = self.registry.lock();

        for tier in 0..4 {
            for pipeline in registry.pipelines.values() {
                let (psource, pdest) = pipeline.endpoints();
                let in_tier = match tier {
                    0 => !psource.is_any() && !pdest.is_any(),
                    1 => psource.is_any() && !pdest.is_any(),
                    2 => !psource.is_any() && pdest.is_any(),
                    _ => psource.is_any() && pdest.is_any(),
                };
                if in_tier && pipeline.matches(source, dest) {
                    return Some(pipeline.clone());
                }
            }
        }
        None
    }

    pub fn pipeline(&self, name: &str) -> Option<Arc<ControlPipeline>> {
        self.registry.lock().pipelines.get(name).cloned()
    }

    pub fn pipeline_names(&self) -> Vec<String> {
        self.registry.lock().pipelines.keys().cloned().collect()
    }

    /// Route a table-change notification for the pipeline tables.
    pub fn handle_change(&self, table: &str, op: TableOp, body: &Value) -> Result<()> {
        match (table, op) {
            (crate::storage::PIPELINES_TABLE, TableOp::Insert) => self.pipeline_inserted(body),
            (crate::storage::PIPELINES_TABLE, TableOp::Update) => {
                self.pipeline_updated(&ChangeEnvelope::parse(body)?)
            }
            (crate::storage::PIPELINES_TABLE, TableOp::Delete) => {
                self.pipeline_deleted(&ChangeEnvelope::parse(body)?)
            }
            (crate::storage::FILTERS_TABLE, TableOp::Insert) => self.filter_inserted(body),
            (crate::storage::FILTERS_TABLE, TableOp::Update) => {
                self.filter_updated(&ChangeEnvelope::parse(body)?)
            }
            (crate::storage::FILTERS_TABLE, TableOp::Delete) => {
                self.filter_deleted(&ChangeEnvelope::parse(body)?)
            }
            _ => {
                debug!("ignoring change on table '{}'", table);
                Ok(())
            }
        }
    }

    /// Fan new category content out to the plugins registered under it.
    pub fn category_changed(&self, category: &str, config: &Value) {
        self.categories.notify(category, config);
    }

    pub fn is_registered_category(&self, category: &str) -> bool {
        self.categories.contains(category)
    }

    pub fn registrations(&self) -> Arc<CategoryRegistrations> {
        self.categories.clone()
    }

    fn pipeline_inserted(&self, body: &Value) -> Result<()> {
        let name = body
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| DispatchError::BadRequest("pipeline insert without a name".into()))?;
        for field in ["stype", "dtype", "enabled", "execution"] {
            if body.get(field).is_none() {
                return Err(DispatchError::BadRequest(format!(
                    "pipeline insert for '{}' is missing '{}'",
                    name, field
                )));
            }
        }

        // Re-query storage so we see the cpid the row was assigned.
        let row = self
            .storage
            .pipeline_by_name(name)?
            .ok_or_else(|| DispatchError::NotFound("pipeline", name.to_string()))?;
        let pipeline = self
            .build_pipeline(&row)
            .ok_or_else(|| DispatchError::Storage(format!("bad pipeline row '{}'", name)))?;

        let mut registry = self.registry.lock();
        registry.id_to_name.insert(row.cpid, row.name.clone());
        registry.pipelines.insert(row.name.clone(), pipeline);
        info!("added control pipeline '{}'", row.name);
        Ok(())
    }

    fn pipeline_updated(&self, envelope: &ChangeEnvelope) -> Result<()> {
        let pipeline = self.resolve_pipeline(envelope)?;

        if let Some(enabled) = envelope.values.get("enabled") {
            pipeline.set_enabled(parse_flag(enabled));
        }
        if let Some(execution) = envelope.values.get("execution").and_then(Value::as_str) {
            pipeline.set_exclusive(execution.eq_ignore_ascii_case("exclusive"));
        }

        let endpoint_change = ["stype", "sname", "dtype", "dname"]
            .iter()
            .any(|field| envelope.values.contains_key(*field));
        if endpoint_change {
            let (mut source, mut dest) = pipeline.endpoints();
            if let Some(kind) = self.updated_kind(&envelope.values, "stype", true) {
                source = Endpoint::new(kind, source.name());
            }
            if let Some(sname) = envelope.values.get("sname").and_then(Value::as_str) {
                source = Endpoint::new(source.kind(), sname);
            }
            if let Some(kind) = self.updated_kind(&envelope.values, "dtype", false) {
                dest = Endpoint::new(kind, dest.name());
            }
            if let Some(dname) = envelope.values.get("dname").and_then(Value::as_str) {
                dest = Endpoint::new(dest.kind(), dname);
            }
            pipeline.set_endpoints(source, dest);
        }
        Ok(())
    }

    fn pipeline_deleted(&self, envelope: &ChangeEnvelope) -> Result<()> {
        let mut registry = self.registry.lock();
        let name = match envelope.where_clause.constraint_i64("cpid") {
            Some(cpid) => registry.id_to_name.remove(&cpid),
            None => envelope.where_clause.constraint_str("name").map(|name| {
                registry.id_to_name.retain(|_, n| n != &name);
                name
            }),
        };
        let Some(name) = name else {
            return Err(DispatchError::BadRequest(
                "pipeline delete without cpid or name".into(),
            ));
        };
        if registry.pipelines.remove(&name).is_some() {
            info!("removed control pipeline '{}'", name);
        } else {
            warn!("delete for unknown control pipeline '{}'", name);
        }
        Ok(())
    }

    fn filter_inserted(&self, body: &Value) -> Result<()> {
        let row: crate::storage::FilterRow = serde_json::from_value(body.clone())
            .map_err(|err| DispatchError::BadRequest(format!("bad filter insert: {}", err)))?;
        let pipeline = self.pipeline_by_id(row.cpid)?;
        pipeline.add_filter(&row.fname, row.forder.max(1) as usize);
        info!(
            "added filter '{}' to control pipeline '{}' at position {}",
            row.fname,
            pipeline.name(),
            row.forder
        );
        Ok(())
    }

    fn filter_updated(&self, envelope: &ChangeEnvelope) -> Result<()> {
        let Some(forder) = envelope.values.get("forder").and_then(Value::as_i64) else {
            // Only ordering changes matter here; content changes arrive
            // as category updates.
            return Ok(());
        };
        let pipeline = self.resolve_pipeline(envelope)?;
        let Some(fname) = envelope.where_clause.constraint_str("fname") else {
            return Err(DispatchError::BadRequest(
                "filter update without fname".into(),
            ));
        };
        pipeline.reorder(&fname, forder.max(1) as usize);
        Ok(())
    }

    fn filter_deleted(&self, envelope: &ChangeEnvelope) -> Result<()> {
        let pipeline = self.resolve_pipeline(envelope)?;
        let Some(fname) = envelope.where_clause.constraint_str("fname") else {
            return Err(DispatchError::BadRequest(
                "filter delete without fname".into(),
            ));
        };
        pipeline.remove_filter(&fname);
        info!(
            "removed filter '{}' from control pipeline '{}'",
            fname,
            pipeline.name()
        );
        Ok(())
    }

    fn resolve_pipeline(&self, envelope: &ChangeEnvelope) -> Result<Arc<ControlPipeline>> {
        if let Some(cpid) = envelope.where_clause.constraint_i64("cpid") {
            return self.pipeline_by_id(cpid);
        }
        if let Some(name) = envelope.where_clause.constraint_str("name") {
            return self
                .pipeline(&name)
                .ok_or(DispatchError::NotFound("pipeline", name));
        }
        Err(DispatchError::BadRequest(
            "change envelope does not identify a pipeline".into(),
        ))
    }

    fn pipeline_by_id(&self, cpid: i64) -> Result<Arc<ControlPipeline>> {
        let registry = self.registry.lock();
        registry
            .id_to_name
            .get(&cpid)
            .and_then(|name| registry.pipelines.get(name))
            .cloned()
            .ok_or_else(|| DispatchError::NotFound("pipeline", cpid.to_string()))
    }

    fn build_pipeline(&self, row: &PipelineRow) -> Option<Arc<ControlPipeline>> {
        let lookups = self.lookups.read();
        let Some(source_kind) = lookups.sources.get(&row.stype) else {
            error!(
                "pipeline '{}' references unknown source type {}",
                row.name, row.stype
            );
            return None;
        };
        let Some(dest_kind) = lookups.destinations.get(&row.dtype) else {
            error!(
                "pipeline '{}' references unknown destination type {}",
                row.name, row.dtype
            );
            return None;
        };
        let source = Endpoint::new(source_kind.kind, row.sname.clone());
        let dest = Endpoint::new(dest_kind.kind, row.dname.clone());

        let filters = match self.storage.filters_for(row.cpid) {
            Ok(rows) => rows.into_iter().map(|f| f.fname).collect(),
            Err(err) => {
                error!(
                    "cannot load filters for control pipeline '{}': {}",
                    row.name, err
                );
                Vec::new()
            }
        };

        Some(Arc::new(ControlPipeline::new(
            row.name.clone(),
            source,
            dest,
            row.enabled,
            row.is_exclusive(),
            filters,
            ContextDeps {
                config: self.config.clone(),
                loader: self.loader.clone(),
                categories: self.categories.clone(),
            },
        )))
    }

    fn load_lookup_tables(&self) -> Result<()> {
        let mut lookups = self.lookups.write();
        for row in self.storage.source_types()? {
            lookups.sources.insert(
                row.cpsid,
                EndpointLookup {
                    name: row.name.clone(),
                    kind: EndpointKind::parse(&row.name),
                },
            );
        }
        for row in self.storage.destination_types()? {
            lookups.destinations.insert(
                row.cpdid,
                EndpointLookup {
                    name: row.name.clone(),
                    kind: EndpointKind::parse(&row.name),
                },
            );
        }
        Ok(())
    }

    /// The endpoint kind a named source or destination type maps to.
    pub fn find_type(&self, type_name: &str, source: bool) -> EndpointKind {
        let lookups = self.lookups.read();
        let table = if source {
            &lookups.sources
        } else {
            &lookups.destinations
        };
        table
            .values()
            .find(|lookup| lookup.name == type_name)
            .map(|lookup| lookup.kind)
            .unwrap_or(EndpointKind::Undefined)
    }

    fn updated_kind(
        &self,
        values: &serde_json::Map<String, Value>,
        field: &str,
        source: bool,
    ) -> Option<EndpointKind> {
        let value = values.get(field)?;
        let lookups = self.lookups.read();
        let table = if source {
            &lookups.sources
        } else {
            &lookups.destinations
        };
        match value {
            Value::Number(n) => n.as_i64().and_then(|id| table.get(&id)).map(|l| l.kind),
            Value::String(s) => match s.parse::<i64>() {
                Ok(id) => table.get(&id).map(|l| l.kind),
                Err(_) => Some(EndpointKind::parse(s)),
            },
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryConfigStore;
    use crate::storage::{FilterRow, MemoryStorage};
    use serde_json::json;

    fn pipeline_row(cpid: i64, name: &str, stype: i64, sname: &str, dtype: i64, dname: &str) -> PipelineRow {
        PipelineRow {
            cpid,
            name: name.into(),
            stype,
            sname: sname.into(),
            dtype,
            dname: dname.into(),
            enabled: true,
            execution: "Shared".into(),
        }
    }

    fn manager_with(storage: Arc<MemoryStorage>) -> ControlPipelineManager {
        let manager = ControlPipelineManager::new(
            storage,
            Arc::new(MemoryConfigStore::new()),
            Arc::new(PluginLoader::new()),
        );
        manager.load_pipelines().unwrap();
        manager
    }

    #[test]
    fn best_match_precedence() {
        let storage = Arc::new(MemoryStorage::with_default_types());
        // P1: Any -> Service:s, P2: Service:s -> Any, P3: Service:s -> Service:s
        storage.insert_pipeline(pipeline_row(1, "P1", 1, "", 2, "s"));
        storage.insert_pipeline(pipeline_row(2, "P2", 2, "s", 1, ""));
        storage.insert_pipeline(pipeline_row(3, "P3", 2, "s", 2, "s"));
        let manager = manager_with(storage);

        let s = Endpoint::service("s");
        let t = Endpoint::service("t");

        assert_eq!(manager.find_pipeline(&s, &s).unwrap().name(), "P3");
        assert_eq!(manager.find_pipeline(&t, &s).unwrap().name(), "P1");
        assert_eq!(manager.find_pipeline(&s, &t).unwrap().name(), "P2");
        assert!(manager.find_pipeline(&t, &t).is_none());
    }

    #[test]
    fn lookup_is_stable_for_equal_inputs() {
        let storage = Arc::new(MemoryStorage::with_default_types());
        storage.insert_pipeline(pipeline_row(1, "A", 1, "", 2, "s"));
        storage.insert_pipeline(pipeline_row(2, "B", 1, "", 2, "s"));
        let manager = manager_with(storage);

        let source = Endpoint::service("x");
        let dest = Endpoint::service("s");
        for _ in 0..8 {
            assert_eq!(manager.find_pipeline(&source, &dest).unwrap().name(), "A");
        }
    }

    #[test]
    fn load_populates_filters_in_order() {
        let storage = Arc::new(MemoryStorage::with_default_types());
        storage.insert_pipeline(pipeline_row(5, "P", 1, "", 2, "pumpA"));
        storage.insert_filter(FilterRow {
            cpid: 5,
            fname: "second".into(),
            forder: 2,
        });
        storage.insert_filter(FilterRow {
            cpid: 5,
            fname: "first".into(),
            forder: 1,
        });
        let manager = manager_with(storage);

        let pipeline = manager.pipeline("P").unwrap();
        assert_eq!(
            pipeline.filters(),
            vec!["first".to_string(), "second".to_string()]
        );
    }

    #[test]
    fn insert_update_delete_events_maintain_the_registry() {
        let storage = Arc::new(MemoryStorage::with_default_types());
        let manager = manager_with(storage.clone());
        assert!(manager.pipeline_names().is_empty());

        // Insert arrives after the row is in storage; the handler
        // re-queries to resolve the assigned cpid.
        storage.insert_pipeline(pipeline_row(9, "P", 1, "", 2, "pumpA"));
        manager
            .handle_change(
                crate::storage::PIPELINES_TABLE,
                TableOp::Insert,
                &json!({"name": "P", "stype": 1, "sname": "", "dtype": 2,
                        "dname": "pumpA", "enabled": "t", "execution": "Shared"}),
            )
            .unwrap();
        let pipeline = manager.pipeline("P").unwrap();
        assert!(pipeline.is_enabled());

        manager
            .handle_change(
                crate::storage::PIPELINES_TABLE,
                TableOp::Update,
                &json!({"values": {"enabled": "f", "execution": "Exclusive", "dname": "pumpB"},
                        "where": {"column": "cpid", "condition": "=", "value": 9}}),
            )
            .unwrap();
        assert!(!pipeline.is_enabled());
        assert!(pipeline.is_exclusive());
        let (_, dest) = pipeline.endpoints();
        assert_eq!(dest, Endpoint::service("pumpB"));

        manager
            .handle_change(
                crate::storage::PIPELINES_TABLE,
                TableOp::Delete,
                &json!({"values": {},
                        "where": {"column": "cpid", "condition": "=", "value": 9}}),
            )
            .unwrap();
        assert!(manager.pipeline("P").is_none());
    }

    #[test]
    fn filter_events_reach_the_pipeline() {
        let storage = Arc::new(MemoryStorage::with_default_types());
        storage.insert_pipeline(pipeline_row(3, "P", 1, "", 2, "pumpA"));
        storage.insert_filter(FilterRow {
            cpid: 3,
            fname: "f1".into(),
            forder: 1,
        });
        let manager = manager_with(storage);
        let pipeline = manager.pipeline("P").unwrap();

        manager
            .handle_change(
                crate::storage::FILTERS_TABLE,
                TableOp::Insert,
                &json!({"cpid": 3, "fname": "f2", "forder": 2}),
            )
            .unwrap();
        assert_eq!(pipeline.filters(), vec!["f1".to_string(), "f2".to_string()]);

        manager
            .handle_change(
                crate::storage::FILTERS_TABLE,
                TableOp::Update,
                &json!({"values": {"forder": 1},
                        "where": {"column": "cpid", "condition": "=", "value": 3,
                                  "and": {"column": "fname", "condition": "=", "value": "f2"}}}),
            )
            .unwrap();
        assert_eq!(pipeline.filters(), vec!["f2".to_string(), "f1".to_string()]);

        manager
            .handle_change(
                crate::storage::FILTERS_TABLE,
                TableOp::Delete,
                &json!({"values": {},
                        "where": {"column": "cpid", "condition": "=", "value": 3,
                                  "and": {"column": "fname", "condition": "=", "value": "f1"}}}),
            )
            .unwrap();
        assert_eq!(pipeline.filters(), vec!["f2".to_string()]);
    }

    #[test]
    fn unknown_pipeline_events_are_errors_not_panics() {
        let storage = Arc::new(MemoryStorage::with_default_types());
        let manager = manager_with(storage);
        let result = manager.handle_change(
            crate::storage::FILTERS_TABLE,
            TableOp::Insert,
            &json!({"cpid": 404, "fname": "f", "forder": 1}),
        );
        assert!(matches!(result, Err(DispatchError::NotFound(_, _))));
    }
}
