use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
};

use parking_lot::{Condvar, Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::{
    acl::{AccessControl, CallerContext},
    delivery::{Origin, SouthDelivery},
    error::{DispatchError, Result},
    kvlist::KVList,
    logging::LogHandle,
    pipeline::{ControlPipelineManager, manager::TableOp},
    plugin::{PluginLoader, category_item},
    registry::{
        AssetResolver, ConfigStore, SOUTHBOUND_TYPE, ServiceRecord, ServiceRegistry,
    },
    request::ControlRequest,
    script::{MAX_SCRIPT_DEPTH, Script},
    storage::{
        ChangeEnvelope, FILTERS_TABLE, PIPELINES_TABLE, SCRIPT_TABLE, StorageTables, parse_flag,
    },
};

pub const SERVICE_TYPE: &str = "Dispatcher";
pub const DEFAULT_WORKER_THREADS: usize = 2;

/// The FIFO of pending control requests: the sole synchronisation point
/// between the ingress layer and the worker pool. Producers never block
/// on consumers.
pub struct RequestQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

struct QueueState {
    items: VecDeque<ControlRequest>,
    active: usize,
    stopping: bool,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                active: 0,
                stopping: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Append a request and wake one worker. Never blocks, never drops.
    pub fn push(&self, request: ControlRequest) -> bool {
        let mut state = self.state.lock();
        state.items.push_back(request);
        self.available.notify_one();
        true
    }

    /// Block until a request is available or the queue is stopping.
    /// Remaining requests are still handed out while stopping; `None`
    /// means the queue is stopped and drained. A popped request counts as
    /// active until `task_done` is called for it.
    pub fn pop(&self) -> Option<ControlRequest> {
        let mut state = self.state.lock();
        loop {
            if let Some(request) = state.items.pop_front() {
                state.active += 1;
                return Some(request);
            }
            if state.stopping {
                return None;
            }
            self.available.wait(&mut state);
        }
    }

    pub fn task_done(&self) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
    }

    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.stopping = true;
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Nothing queued and nothing executing.
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.items.is_empty() && state.active == 0
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// The external collaborators a dispatcher instance works against.
pub struct DispatcherDeps {
    pub registry: Arc<dyn ServiceRegistry>,
    pub config_store: Arc<dyn ConfigStore>,
    pub assets: Arc<dyn AssetResolver>,
    pub storage: Arc<dyn StorageTables>,
    pub delivery: Arc<dyn SouthDelivery>,
}

/// The dispatcher service: owns the request queue and the worker pool,
/// routes configuration and table changes, and provides the outbound
/// send used by requests and script steps.
pub struct DispatcherService {
    name: String,
    deps: DispatcherDeps,
    pipelines: ControlPipelineManager,
    queue: RequestQueue,
    enabled: AtomicBool,
    worker_threads: AtomicUsize,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    scripts: RwLock<BTreeMap<String, Arc<Script>>>,
    registered_categories: Mutex<HashSet<String>>,
    log_handle: Mutex<Option<LogHandle>>,
}

impl DispatcherService {
    pub fn new(name: impl Into<String>, deps: DispatcherDeps, loader: Arc<PluginLoader>) -> Arc<Self> {
        let name = name.into();
        let pipelines =
            ControlPipelineManager::new(deps.storage.clone(), deps.config_store.clone(), loader);
        Arc::new(Self {
            name,
            deps,
            pipelines,
            queue: RequestQueue::new(),
            enabled: AtomicBool::new(true),
            worker_threads: AtomicUsize::new(DEFAULT_WORKER_THREADS),
            workers: Mutex::new(Vec::new()),
            scripts: RwLock::new(BTreeMap::new()),
            registered_categories: Mutex::new(HashSet::new()),
            log_handle: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pipelines(&self) -> &ControlPipelineManager {
        &self.pipelines
    }

    pub fn config_store(&self) -> &dyn ConfigStore {
        self.deps.config_store.as_ref()
    }

    pub fn set_log_handle(&self, handle: LogHandle) {
        *self.log_handle.lock() = Some(handle);
    }

    /// Register with the core, bootstrap the configuration categories,
    /// load the pipelines and spawn the worker pool. Pipelines are loaded
    /// before the first worker starts.
    pub fn start(self: &Arc<Self>, advertise: ServiceRecord) -> Result<()> {
        info!("starting dispatcher service '{}'", self.name);

        self.deps.registry.register(&advertise).map_err(|err| {
            error!("unable to register service '{}': {}", self.name, err);
            err
        })?;

        self.bootstrap_categories()?;
        self.register_category(&self.name);
        self.register_category(&format!("{}Advanced", self.name));
        self.register_category(&format!("{}Security", self.name));
        self.apply_startup_config();

        self.pipelines.load_pipelines().map_err(|err| {
            error!("unable to load control pipelines: {}", err);
            err
        })?;

        self.deps
            .registry
            .audit("DSPST", &serde_json::json!({"name": self.name}));

        let threads = self.worker_threads.load(Ordering::Relaxed);
        let mut workers = self.workers.lock();
        for index in 0..threads {
            let service = Arc::clone(self);
            let handle = thread::Builder::new()
                .name(format!("dispatch-worker-{}", index))
                .spawn(move || service.worker())
                .map_err(DispatchError::Io)?;
            workers.push(handle);
        }
        info!(
            "dispatcher service '{}' running with {} worker threads",
            self.name, threads
        );
        Ok(())
    }

    /// Validate the startup path without spawning workers: used by
    /// `--dryrun`.
    pub fn dry_run(&self) -> Result<()> {
        self.bootstrap_categories()?;
        self.apply_startup_config();
        self.pipelines.load_pipelines()
    }

    /// Stop the queue, let the workers finish their current request and
    /// join them. `remove_from_core` distinguishes a full shutdown from a
    /// restart-in-place, where the registration is left for the respawned
    /// process to take over.
    pub fn shutdown(&self, remove_from_core: bool) {
        info!("dispatcher service '{}' shutdown in progress", self.name);
        self.queue.stop();

        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                error!("a dispatcher worker panicked during shutdown");
            }
        }

        if remove_from_core {
            if let Err(err) = self.deps.registry.unregister(&self.name) {
                warn!("unable to unregister service '{}': {}", self.name, err);
            }
        }
        self.deps
            .registry
            .audit("DSPSD", &serde_json::json!({"name": self.name}));
        info!("dispatcher service '{}' shutdown completed", self.name);
    }

    /// Append a request to the queue. The request is executed exactly
    /// once by some worker, or dropped at shutdown if no worker remains.
    pub fn queue_request(&self, request: ControlRequest) -> bool {
        self.queue.push(request)
    }

    fn worker(self: Arc<Self>) {
        while let Some(request) = self.queue.pop() {
            request.execute(&self);
            self.queue.task_done();
        }
        debug!("dispatcher worker exiting");
    }

    /// True when no request is queued or executing. The tests use this to
    /// wait for the pool to drain.
    pub fn is_idle(&self) -> bool {
        self.queue.is_idle()
    }

    pub fn queued_requests(&self) -> usize {
        self.queue.len()
    }

    /// Deliver one payload to one named service. Fails fast when the
    /// service-level enable flag is off.
    pub fn send_to_service(
        &self,
        service_name: &str,
        path: &str,
        payload: &Value,
        origin: &Origin,
    ) -> Result<()> {
        if !self.enabled.load(Ordering::SeqCst) {
            warn!(
                "dispatcher service is disabled, not sending to '{}'",
                service_name
            );
            return Err(DispatchError::Dispatch(
                service_name.to_string(),
                "dispatcher service is disabled".into(),
            ));
        }

        let record = self.deps.registry.get_service(service_name).map_err(|err| {
            error!("unable to find service '{}'", service_name);
            err
        })?;
        self.deps
            .delivery
            .put(&record, path, payload, origin)
            .map_err(|err| {
                error!("failed to send to service '{}': {}", service_name, err);
                err
            })
    }

    /// Deliver to the service that ingests an asset. Resolution failures
    /// are logged; the request is abandoned.
    pub fn send_to_asset(&self, asset: &str, path: &str, payload: &Value, origin: &Origin) {
        match self.deps.assets.ingest_service(asset) {
            Ok(Some(service_name)) => {
                if let Err(err) = self.send_to_service(&service_name, path, payload, origin) {
                    error!("write to asset '{}' failed: {}", asset, err);
                }
            }
            Ok(None) => {
                error!("no service is ingesting asset '{}'", asset);
            }
            Err(err) => {
                error!("unable to resolve asset '{}': {}", asset, err);
            }
        }
    }

    /// Best-effort delivery to every southbound service. A failing
    /// recipient never aborts the broadcast.
    pub fn broadcast(&self, path: &str, payload: &Value, origin: &Origin) {
        if !self.enabled.load(Ordering::SeqCst) {
            warn!("dispatcher service is disabled, not broadcasting");
            return;
        }
        let services = match self.deps.registry.services_by_type(SOUTHBOUND_TYPE) {
            Ok(services) => services,
            Err(err) => {
                error!("unable to list southbound services: {}", err);
                return;
            }
        };
        for record in services {
            if let Err(err) = self.deps.delivery.put(&record, path, payload, origin) {
                info!("broadcast to '{}' failed: {}", record.name, err);
            }
        }
    }

    /// Load a script (cached after the first load), enforce its ACL for
    /// this caller and run its steps.
    pub fn run_script(
        &self,
        name: &str,
        params: &KVList,
        caller: &CallerContext,
        depth: usize,
    ) -> Result<()> {
        if depth > MAX_SCRIPT_DEPTH {
            return Err(DispatchError::Script(format!(
                "script '{}' exceeds the recursion limit of {}",
                name, MAX_SCRIPT_DEPTH
            )));
        }

        let script = self.load_script(name)?;

        if let Some(acl_name) = script.acl_name() {
            let row = self
                .deps
                .storage
                .acl(acl_name)?
                .ok_or_else(|| DispatchError::NotFound("acl", acl_name.to_string()))?;
            let acl = AccessControl::from_row(&row)?;
            if !acl.authorize(caller) {
                warn!(
                    "caller '{}' ({}) denied by acl '{}' for script '{}'",
                    caller.source_name, caller.source_type, acl_name, name
                );
                return Err(DispatchError::AclDenied(caller.source_name.clone()));
            }
        }

        script.execute(self, caller, params, depth)
    }

    fn load_script(&self, name: &str) -> Result<Arc<Script>> {
        if let Some(script) = self.scripts.read().get(name) {
            return Ok(script.clone());
        }
        let script = Arc::new(Script::load(name, self.deps.storage.as_ref())?);
        self.scripts
            .write()
            .insert(name.to_string(), script.clone());
        Ok(script)
    }

    /// Route a configuration-category change to the enable flag, the
    /// advanced options, the security handler or a registered filter
    /// category.
    pub fn config_change(&self, category: &str, content: &Value) {
        if category == self.name {
            if let Some(enable) = category_item(content, "enable") {
                let enabled = parse_flag(&Value::String(enable));
                self.enabled.store(enabled, Ordering::SeqCst);
                info!(
                    "dispatcher service '{}' is now {}",
                    self.name,
                    if enabled { "enabled" } else { "disabled" }
                );
            }
            return;
        }

        if category == format!("{}Advanced", self.name) {
            if let Some(level) = category_item(content, "logLevel") {
                if let Some(handle) = self.log_handle.lock().as_ref() {
                    handle.set_level(&level);
                }
                info!("setting log level to {}", level);
            }
            if category_item(content, "dispatcherThreads").is_some() {
                info!("worker thread count change applies at the next restart");
            }
            return;
        }

        if category == format!("{}Security", self.name) {
            debug!("security category updated, handled by the auth middleware");
            return;
        }

        if self.pipelines.is_registered_category(category) {
            self.pipelines.category_changed(category, content);
        } else {
            debug!("ignoring configuration change for category '{}'", category);
        }
    }

    /// Route a table-change notification. Pipeline and filter tables go
    /// to the pipeline manager; script-table changes invalidate the
    /// script cache. Errors are logged, never surfaced to the notifier.
    pub fn table_change(&self, op: TableOp, table: &str, body: &Value) {
        match table {
            PIPELINES_TABLE | FILTERS_TABLE => {
                if let Err(err) = self.pipelines.handle_change(table, op, body) {
                    error!("change on table '{}' not applied: {}", table, err);
                }
            }
            SCRIPT_TABLE => {
                if matches!(op, TableOp::Update | TableOp::Delete) {
                    self.invalidate_scripts(body);
                }
            }
            _ => {
                debug!("ignoring change on table '{}'", table);
            }
        }
    }

    fn invalidate_scripts(&self, body: &Value) {
        let name = ChangeEnvelope::parse(body)
            .ok()
            .and_then(|envelope| envelope.where_clause.constraint_str("name"));
        let mut scripts = self.scripts.write();
        match name {
            Some(name) => {
                scripts.remove(&name);
                debug!("invalidated cached script '{}'", name);
            }
            None => {
                scripts.clear();
                debug!("invalidated all cached scripts");
            }
        }
    }

    fn bootstrap_categories(&self) -> Result<()> {
        let store = self.deps.config_store.as_ref();
        store.create_category(
            &self.name,
            &serde_json::json!({
                "enable": {"value": "true", "default": "true",
                           "description": "Enable or disable the dispatcher service"},
            }),
            &format!("Dispatcher server {}", self.name),
        )?;
        store.create_category(
            &format!("{}Advanced", self.name),
            &serde_json::json!({
                "logLevel": {"value": "warning", "default": "warning",
                             "description": "Minimum logging level reported"},
                "dispatcherThreads": {"value": DEFAULT_WORKER_THREADS.to_string(),
                                      "default": DEFAULT_WORKER_THREADS.to_string(),
                                      "description": "Maximum number of dispatcher threads"},
            }),
            &format!("{} advanced config params", self.name),
        )?;
        store.create_category(
            &format!("{}Security", self.name),
            &serde_json::json!({}),
            &format!("{} security", self.name),
        )?;
        Ok(())
    }

    fn apply_startup_config(&self) {
        if let Ok(category) = self.deps.config_store.get_category(&self.name) {
            if let Some(enable) = category_item(&category, "enable") {
                self.enabled
                    .store(parse_flag(&Value::String(enable)), Ordering::SeqCst);
            }
        }
        match self
            .deps
            .config_store
            .get_category(&format!("{}Advanced", self.name))
        {
            Ok(category) => {
                if let Some(level) = category_item(&category, "logLevel") {
                    if let Some(handle) = self.log_handle.lock().as_ref() {
                        handle.set_level(&level);
                    }
                }
                let threads = category_item(&category, "dispatcherThreads")
                    .and_then(|raw| raw.parse::<usize>().ok())
                    .filter(|threads| *threads >= 1)
                    .unwrap_or(DEFAULT_WORKER_THREADS);
                self.worker_threads.store(threads, Ordering::Relaxed);
            }
            Err(err) => {
                warn!("unable to read advanced configuration: {}", err);
            }
        }
    }

    /// Register interest in a configuration category exactly once.
    pub fn register_category(&self, category: &str) {
        let mut registered = self.registered_categories.lock();
        if registered.insert(category.to_string()) {
            debug!("registered configuration category '{}'", category);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestKind;

    fn request(n: u32) -> ControlRequest {
        let mut values = KVList::new();
        values.add("seq", n.to_string());
        ControlRequest::new(
            RequestKind::WriteService {
                service: "s".into(),
                values,
            },
            CallerContext::default(),
        )
    }

    #[test]
    fn queue_is_fifo() {
        let queue = RequestQueue::new();
        for n in 0..5 {
            assert!(queue.push(request(n)));
        }
        for n in 0..5 {
            let popped = queue.pop().unwrap();
            match popped.kind {
                RequestKind::WriteService { values, .. } => {
                    assert_eq!(values.get("seq"), Some(n.to_string().as_str()));
                }
                _ => unreachable!(),
            }
        }
    }

    #[test]
    fn stopped_queue_drains_then_returns_none() {
        let queue = RequestQueue::new();
        queue.push(request(1));
        queue.stop();
        assert!(queue.pop().is_some());
        assert!(queue.pop().is_none());
        // Pushing after stop still succeeds; a running worker drains it.
        assert!(queue.push(request(2)));
        assert!(queue.pop().is_some());
    }

    #[test]
    fn stop_wakes_blocked_workers() {
        let queue = Arc::new(RequestQueue::new());
        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop())
        };
        thread::sleep(std::time::Duration::from_millis(50));
        queue.stop();
        assert!(waiter.join().unwrap().is_none());
    }
}
