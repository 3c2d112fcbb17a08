use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::{
    acl::{Advisory, CallerContext},
    delivery::{ORIGIN_NAME_HEADER, ORIGIN_TYPE_HEADER},
    error::{DispatchError, Result},
    kvlist::KVList,
    pipeline::manager::TableOp,
    request::{ControlRequest, RequestKind},
    service::DispatcherService,
};

pub const DISPATCH_WRITE: &str = "/dispatch/write";
pub const DISPATCH_OPERATION: &str = "/dispatch/operation";

#[derive(Clone)]
struct AppState {
    service: Arc<DispatcherService>,
    auth_enabled: bool,
}

/// Serve the dispatcher ingress until a termination signal arrives.
/// Returns `true` when the signal asked for a full shutdown (the service
/// should unregister) and `false` for a restart in place.
pub async fn run(
    service: Arc<DispatcherService>,
    listener: TcpListener,
    auth_enabled: bool,
) -> Result<bool> {
    let state = AppState {
        service,
        auth_enabled,
    };

    let app = Router::new()
        .route(DISPATCH_WRITE, post(write))
        .route(DISPATCH_OPERATION, post(operation))
        .route("/dispatch/table/{op}/{table}", post(table_change))
        .route("/dispatch/category/{name}", post(category_change))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let remove_from_core = Arc::new(AtomicBool::new(true));
    let shutdown = {
        let remove_from_core = remove_from_core.clone();
        async move {
            remove_from_core.store(shutdown_signal().await, Ordering::SeqCst);
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|err| DispatchError::Config(format!("ingress server failed: {}", err)))?;

    Ok(remove_from_core.load(Ordering::SeqCst))
}

#[derive(Serialize)]
struct MessageBody {
    message: &'static str,
}

fn queued() -> impl IntoResponse {
    (
        StatusCode::ACCEPTED,
        Json(MessageBody {
            message: "Request queued",
        }),
    )
}

#[derive(Deserialize)]
struct WritePayload {
    destination: String,
    #[serde(default)]
    name: Option<String>,
    write: Value,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    source_name: Option<String>,
}

async fn write(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse> {
    let payload: WritePayload = parse_payload(&body)?;
    let caller = caller_context(
        &headers,
        state.auth_enabled,
        DISPATCH_WRITE,
        payload.source.as_deref(),
        payload.source_name.as_deref(),
    )?;
    let values = KVList::from_json(&payload.write)?;

    let kind = match payload.destination.as_str() {
        "service" => RequestKind::WriteService {
            service: required_name(&payload.name, "service")?,
            values,
        },
        "asset" => RequestKind::WriteAsset {
            asset: required_name(&payload.name, "asset")?,
            values,
        },
        "script" => RequestKind::WriteScript {
            script: required_name(&payload.name, "script")?,
            values,
        },
        "broadcast" => RequestKind::WriteBroadcast { values },
        other => {
            return Err(DispatchError::BadRequest(format!(
                "unsupported write destination '{}'",
                other
            )));
        }
    };

    state
        .service
        .queue_request(ControlRequest::new(kind, caller));
    Ok(queued())
}

#[derive(Deserialize)]
struct OperationPayload {
    destination: String,
    #[serde(default)]
    name: Option<String>,
    operation: serde_json::Map<String, Value>,
}

async fn operation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse> {
    let payload: OperationPayload = parse_payload(&body)?;
    let caller = caller_context(&headers, state.auth_enabled, DISPATCH_OPERATION, None, None)?;

    // Each key of the operation object queues one request.
    let mut requests = Vec::with_capacity(payload.operation.len());
    for (operation, parameters) in &payload.operation {
        let parameters = match parameters {
            Value::Null => KVList::new(),
            other => KVList::from_json(other)?,
        };
        let kind = match payload.destination.as_str() {
            "service" => RequestKind::OpService {
                operation: operation.clone(),
                service: required_name(&payload.name, "service")?,
                parameters,
            },
            "asset" => RequestKind::OpAsset {
                operation: operation.clone(),
                asset: required_name(&payload.name, "asset")?,
                parameters,
            },
            "broadcast" => RequestKind::OpBroadcast {
                operation: operation.clone(),
                parameters,
            },
            other => {
                return Err(DispatchError::BadRequest(format!(
                    "unsupported operation destination '{}'",
                    other
                )));
            }
        };
        requests.push(ControlRequest::new(kind, caller.clone()));
    }

    for request in requests {
        state.service.queue_request(request);
    }
    Ok(queued())
}

async fn table_change(
    State(state): State<AppState>,
    Path((op, table)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse> {
    let op = TableOp::parse(&op)
        .ok_or_else(|| DispatchError::BadRequest(format!("unknown table operation '{}'", op)))?;
    debug!("table change {:?} on '{}'", op, table);
    state.service.table_change(op, &table, &body);
    Ok(Json(MessageBody { message: "ok" }))
}

async fn category_change(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse> {
    info!("configuration change for category '{}'", name);
    state.service.config_change(&name, &body);
    Ok(Json(MessageBody { message: "ok" }))
}

/// Deserialize an ingress payload, reporting shape problems as a 400
/// rather than the extractor's default.
fn parse_payload<T: serde::de::DeserializeOwned>(body: &Value) -> Result<T> {
    serde_json::from_value(body.clone())
        .map_err(|err| DispatchError::BadRequest(format!("bad request payload: {}", err)))
}

fn required_name(name: &Option<String>, destination: &str) -> Result<String> {
    name.clone().filter(|name| !name.is_empty()).ok_or_else(|| {
        DispatchError::BadRequest(format!("missing {} name in payload", destination))
    })
}

/// Assemble the caller identity for a request. The authenticated name and
/// type come from the advisory headers the auth middleware sets; when
/// authentication is enabled a bearer token must be present.
fn caller_context(
    headers: &HeaderMap,
    auth_enabled: bool,
    request_url: &str,
    source: Option<&str>,
    source_name: Option<&str>,
) -> Result<CallerContext> {
    if auth_enabled && extract_bearer_token(headers).is_none() {
        return Err(DispatchError::Unauthorized);
    }

    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };

    let advisory = match (source, source_name) {
        (Some(caller_type), Some(caller_name)) => Some(Advisory {
            caller_type: caller_type.to_string(),
            caller_name: caller_name.to_string(),
        }),
        _ => None,
    };

    Ok(CallerContext {
        source_name: header(ORIGIN_NAME_HEADER),
        source_type: header(ORIGIN_TYPE_HEADER),
        request_url: request_url.to_string(),
        advisory,
    })
}

pub(crate) fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("authorization")?;
    let value = value.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
}

async fn shutdown_signal() -> bool {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => true,
        // SIGTERM asks for a restart in place: exit cleanly, keep the
        // registration, and let the supervisor respawn the process.
        _ = terminate => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert!(extract_bearer_token(&headers).is_none());

        headers.insert("authorization", HeaderValue::from_static("Bearer abc123 "));
        assert_eq!(extract_bearer_token(&headers).as_deref(), Some("abc123"));

        headers.insert("authorization", HeaderValue::from_static("Basic abc123"));
        assert!(extract_bearer_token(&headers).is_none());
    }

    #[test]
    fn caller_context_reads_origin_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(ORIGIN_NAME_HEADER, HeaderValue::from_static("sched1"));
        headers.insert(ORIGIN_TYPE_HEADER, HeaderValue::from_static("Schedule"));

        let caller = caller_context(&headers, false, DISPATCH_WRITE, None, None).unwrap();
        assert_eq!(caller.source_name, "sched1");
        assert_eq!(caller.source_type, "Schedule");
        assert_eq!(caller.request_url, DISPATCH_WRITE);
        assert!(caller.advisory.is_none());
    }

    #[test]
    fn auth_enabled_requires_a_token() {
        let headers = HeaderMap::new();
        let denied = caller_context(&headers, true, DISPATCH_WRITE, None, None);
        assert!(matches!(denied, Err(DispatchError::Unauthorized)));

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer tok"));
        assert!(caller_context(&headers, true, DISPATCH_WRITE, None, None).is_ok());
    }

    #[test]
    fn advisory_requires_both_fields() {
        let headers = HeaderMap::new();
        let caller =
            caller_context(&headers, false, DISPATCH_WRITE, Some("Schedule"), None).unwrap();
        assert!(caller.advisory.is_none());

        let caller = caller_context(
            &headers,
            false,
            DISPATCH_WRITE,
            Some("Schedule"),
            Some("sched1"),
        )
        .unwrap();
        let advisory = caller.advisory.unwrap();
        assert_eq!(advisory.caller_type, "Schedule");
        assert_eq!(advisory.caller_name, "sched1");
    }
}
