use serde_json::json;
use tracing::{debug, error, info};

use crate::{
    acl::CallerContext,
    delivery::{OPERATION_PATH, Origin, SETPOINT_PATH},
    endpoint::Endpoint,
    kvlist::KVList,
    pipeline::ControlPipelineManager,
    service::DispatcherService,
};

/// The asset name control requests travel under while inside a filter
/// pipeline.
pub const PIPELINE_ASSET: &str = "reading";

/// One control request queued for execution: either a parameter write or
/// a named operation, addressed to a service, an asset's ingest service,
/// a script or every southbound service.
#[derive(Debug, Clone)]
pub enum RequestKind {
    WriteService { service: String, values: KVList },
    WriteAsset { asset: String, values: KVList },
    WriteBroadcast { values: KVList },
    WriteScript { script: String, values: KVList },
    OpService {
        operation: String,
        service: String,
        parameters: KVList,
    },
    OpAsset {
        operation: String,
        asset: String,
        parameters: KVList,
    },
    OpBroadcast {
        operation: String,
        parameters: KVList,
    },
}

#[derive(Debug, Clone)]
pub struct ControlRequest {
    pub caller: CallerContext,
    pub kind: RequestKind,
}

impl ControlRequest {
    pub fn new(kind: RequestKind, caller: CallerContext) -> Self {
        Self { caller, kind }
    }

    /// The destination endpoint is derived from the addressing mode of
    /// the variant.
    pub fn destination_endpoint(&self) -> Endpoint {
        match &self.kind {
            RequestKind::WriteService { service, .. }
            | RequestKind::OpService { service, .. } => Endpoint::service(service),
            RequestKind::WriteAsset { asset, .. } | RequestKind::OpAsset { asset, .. } => {
                Endpoint::asset(asset)
            }
            RequestKind::WriteBroadcast { .. } | RequestKind::OpBroadcast { .. } => {
                Endpoint::broadcast()
            }
            RequestKind::WriteScript { script, .. } => Endpoint::script(script),
        }
    }

    /// The source endpoint comes from the payload's caller advisory when
    /// present, else from the authenticated identity. An anonymous caller
    /// matches as `Any`.
    pub fn source_endpoint(&self, pipelines: &ControlPipelineManager) -> Endpoint {
        if let Some(advisory) = &self.caller.advisory {
            let kind = pipelines.find_type(&advisory.caller_type, true);
            return Endpoint::new(kind, advisory.caller_name.clone());
        }
        if !self.caller.source_type.is_empty() {
            let kind = pipelines.find_type(&self.caller.source_type, true);
            return Endpoint::new(kind, self.caller.source_name.clone());
        }
        Endpoint::any()
    }

    fn values_mut(&mut self) -> &mut KVList {
        match &mut self.kind {
            RequestKind::WriteService { values, .. }
            | RequestKind::WriteAsset { values, .. }
            | RequestKind::WriteBroadcast { values }
            | RequestKind::WriteScript { values, .. } => values,
            RequestKind::OpService { parameters, .. }
            | RequestKind::OpAsset { parameters, .. }
            | RequestKind::OpBroadcast { parameters, .. } => parameters,
        }
    }

    /// Execute the request: run it through a matching filter pipeline if
    /// one exists, then dispatch to the recipients of the variant.
    pub fn execute(mut self, service: &DispatcherService) {
        let dest = self.destination_endpoint();
        let source = self.source_endpoint(service.pipelines());

        if let Some(pipeline) = service.pipelines().find_pipeline(&source, &dest) {
            if pipeline.is_enabled() {
                debug!(
                    "control pipeline '{}' matches request from '{}' to '{}'",
                    pipeline.name(),
                    source,
                    dest
                );
                let context = pipeline.execution_context(&source, &dest);
                let reading = self.values_mut().to_reading(PIPELINE_ASSET);
                match context.filter(reading) {
                    Some(filtered) => {
                        *self.values_mut() = KVList::from_reading(&filtered);
                    }
                    None => {
                        info!(
                            "control pipeline '{}' suppressed the request to '{}'",
                            pipeline.name(),
                            dest
                        );
                        return;
                    }
                }
            }
        }

        let origin = Origin::new(&self.caller.source_name, &self.caller.source_type);
        match self.kind {
            RequestKind::WriteService { service: target, values } => {
                let payload = json!({"values": values});
                if let Err(err) =
                    service.send_to_service(&target, SETPOINT_PATH, &payload, &origin)
                {
                    error!("write to service '{}' failed: {}", target, err);
                }
            }
            RequestKind::WriteAsset { asset, values } => {
                let payload = json!({"values": values});
                service.send_to_asset(&asset, SETPOINT_PATH, &payload, &origin);
            }
            RequestKind::WriteBroadcast { values } => {
                let payload = json!({"values": values});
                service.broadcast(SETPOINT_PATH, &payload, &origin);
            }
            RequestKind::WriteScript { script, values } => {
                if let Err(err) = service.run_script(&script, &values, &self.caller, 0) {
                    error!("control script '{}' failed: {}", script, err);
                }
            }
            RequestKind::OpService {
                operation,
                service: target,
                parameters,
            } => {
                let payload = operation_payload(&operation, &parameters);
                if let Err(err) =
                    service.send_to_service(&target, OPERATION_PATH, &payload, &origin)
                {
                    error!(
                        "operation '{}' on service '{}' failed: {}",
                        operation, target, err
                    );
                }
            }
            RequestKind::OpAsset {
                operation,
                asset,
                parameters,
            } => {
                let payload = operation_payload(&operation, &parameters);
                service.send_to_asset(&asset, OPERATION_PATH, &payload, &origin);
            }
            RequestKind::OpBroadcast {
                operation,
                parameters,
            } => {
                let payload = operation_payload(&operation, &parameters);
                service.broadcast(OPERATION_PATH, &payload, &origin);
            }
        }
    }
}

fn operation_payload(operation: &str, parameters: &KVList) -> serde_json::Value {
    let mut payload = json!({"operation": operation});
    if !parameters.is_empty() {
        payload["parameters"] = serde_json::to_value(parameters).unwrap_or_default();
    }
    payload
}
