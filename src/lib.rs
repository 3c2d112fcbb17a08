pub mod acl;
pub mod config;
pub mod delivery;
pub mod endpoint;
pub mod error;
pub mod kvlist;
pub mod logging;
pub mod pipeline;
pub mod plugin;
pub mod reading;
pub mod registry;
pub mod request;
pub mod script;
pub mod server;
pub mod service;
pub mod storage;

pub use crate::{
    acl::{AccessControl, Advisory, CallerContext},
    delivery::{HttpSouthDelivery, Origin, RecordingDelivery, SouthDelivery},
    endpoint::{Endpoint, EndpointKind},
    error::{DispatchError, Result},
    kvlist::KVList,
    pipeline::{ControlPipeline, ControlPipelineManager, PipelineExecutionContext},
    plugin::{FilterPlugin, PluginLoader},
    reading::{Datapoint, DatapointValue, Reading},
    registry::{
        AssetResolver, ConfigStore, CoreClient, MemoryConfigStore, ServiceRecord,
        ServiceRegistry, StaticAssets, StaticRegistry,
    },
    request::{ControlRequest, RequestKind},
    script::Script,
    service::{DispatcherDeps, DispatcherService, RequestQueue},
    storage::{HttpStorageTables, MemoryStorage, StorageTables},
};
