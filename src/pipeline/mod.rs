use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::{endpoint::Endpoint, plugin::PluginLoader, registry::ConfigStore};

pub mod context;
pub mod manager;

pub use context::PipelineExecutionContext;
pub use manager::{CategoryRegistrations, ControlPipelineManager};

/// Everything an execution context needs to load its plugins.
#[derive(Clone)]
pub struct ContextDeps {
    pub config: Arc<dyn ConfigStore>,
    pub loader: Arc<PluginLoader>,
    pub categories: Arc<CategoryRegistrations>,
}

struct ContextEndpoints {
    source: Endpoint,
    dest: Endpoint,
    context: Arc<PipelineExecutionContext>,
}

/// One logical control pipeline: a named, ordered list of filter
/// categories bound to a (source, destination) match pattern. The
/// pipeline owns its execution contexts; a shared pipeline has at most
/// one, an exclusive pipeline grows one per distinct endpoint pair it is
/// asked about.
pub struct ControlPipeline {
    name: String,
    deps: ContextDeps,
    state: Mutex<PipelineState>,
}

struct PipelineState {
    enabled: bool,
    exclusive: bool,
    source: Endpoint,
    dest: Endpoint,
    filters: Vec<String>,
    shared: Option<Arc<PipelineExecutionContext>>,
    contexts: Vec<ContextEndpoints>,
}

impl ControlPipeline {
    pub fn new(
        name: impl Into<String>,
        source: Endpoint,
        dest: Endpoint,
        enabled: bool,
        exclusive: bool,
        filters: Vec<String>,
        deps: ContextDeps,
    ) -> Self {
        Self {
            name: name.into(),
            deps,
            state: Mutex::new(PipelineState {
                enabled,
                exclusive,
                source,
                dest,
                filters,
                shared: None,
                contexts: Vec::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.lock().enabled = enabled;
    }

    pub fn is_exclusive(&self) -> bool {
        self.state.lock().exclusive
    }

    /// Switch between shared and exclusive execution. Existing contexts
    /// are dropped so the next request rebuilds under the new mode.
    pub fn set_exclusive(&self, exclusive: bool) {
        let mut state = self.state.lock();
        if state.exclusive == exclusive {
            return;
        }
        state.exclusive = exclusive;
        state.shared = None;
        state.contexts.clear();
    }

    pub fn endpoints(&self) -> (Endpoint, Endpoint) {
        let state = self.state.lock();
        (state.source.clone(), state.dest.clone())
    }

    pub fn set_endpoints(&self, source: Endpoint, dest: Endpoint) {
        let mut state = self.state.lock();
        state.source = source;
        state.dest = dest;
    }

    pub fn filters(&self) -> Vec<String> {
        self.state.lock().filters.clone()
    }

    /// Does this pipeline's pattern admit a request flowing from `source`
    /// to `dest`?
    pub fn matches(&self, source: &Endpoint, dest: &Endpoint) -> bool {
        let state = self.state.lock();
        state.source.matches(source) && state.dest.matches(dest)
    }

    /// The context a request between these endpoints should execute in.
    pub fn execution_context(
        &self,
        source: &Endpoint,
        dest: &Endpoint,
    ) -> Arc<PipelineExecutionContext> {
        let mut state = self.state.lock();

        if !state.exclusive {
            if state.shared.is_none() {
                let context = self.new_context(&state.filters);
                state.shared = Some(context);
            }
            info!(
                "using shared context for control pipeline '{}' from '{}' to '{}'",
                self.name, source, dest
            );
            return state.shared.as_ref().unwrap().clone();
        }

        if let Some(entry) = state
            .contexts
            .iter()
            .find(|entry| entry.source.matches(source) && entry.dest.matches(dest))
        {
            return entry.context.clone();
        }

        info!(
            "create new context to run pipeline '{}' between '{}' and '{}'",
            self.name, source, dest
        );
        let context = self.new_context(&state.filters);
        state.contexts.push(ContextEndpoints {
            source: source.clone(),
            dest: dest.clone(),
            context: context.clone(),
        });
        context
    }

    /// Insert a filter at one-based `order` and propagate the insert into
    /// every live context.
    pub fn add_filter(&self, filter: &str, order: usize) {
        let mut state = self.state.lock();
        let index = order.saturating_sub(1).min(state.filters.len());
        state.filters.insert(index, filter.to_string());

        if let Some(shared) = &state.shared {
            shared.add_filter(filter, order);
        }
        for entry in &state.contexts {
            entry.context.add_filter(filter, order);
        }
    }

    pub fn remove_filter(&self, filter: &str) {
        let mut state = self.state.lock();
        if let Some(index) = state.filters.iter().position(|f| f == filter) {
            state.filters.remove(index);
        }
        if let Some(shared) = &state.shared {
            shared.remove_filter(filter);
        }
        for entry in &state.contexts {
            entry.context.remove_filter(filter);
        }
    }

    /// Move a filter to one-based `order`. A filter already in place is
    /// left alone, which debounces the storms of redundant update events
    /// the notifier emits while rows are being renumbered.
    pub fn reorder(&self, filter: &str, order: usize) {
        let mut state = self.state.lock();
        let target = order.saturating_sub(1);
        if state.filters.get(target).map(String::as_str) == Some(filter) {
            return;
        }
        let Some(index) = state.filters.iter().position(|f| f == filter) else {
            return;
        };
        if target >= state.filters.len() {
            return;
        }
        state.filters.swap(index, target);

        if let Some(shared) = &state.shared {
            shared.reorder(filter, order);
        }
        for entry in &state.contexts {
            entry.context.reorder(filter, order);
        }
    }

    /// Drop every context; the next request rebuilds from the current
    /// filter list.
    pub fn remove_all_contexts(&self) {
        let mut state = self.state.lock();
        state.shared = None;
        state.contexts.clear();
    }

    pub fn context_count(&self) -> usize {
        let state = self.state.lock();
        state.contexts.len() + usize::from(state.shared.is_some())
    }

    fn new_context(&self, filters: &[String]) -> Arc<PipelineExecutionContext> {
        PipelineExecutionContext::new(
            self.name.clone(),
            filters.to_vec(),
            self.deps.config.clone(),
            self.deps.loader.clone(),
            self.deps.categories.clone(),
        )
    }
}
