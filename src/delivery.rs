use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use crate::{
    error::{DispatchError, Result},
    registry::ServiceRecord,
};

pub const SETPOINT_PATH: &str = "/south/setpoint";
pub const OPERATION_PATH: &str = "/south/operation";

pub const ORIGIN_NAME_HEADER: &str = "Service-Orig-From";
pub const ORIGIN_TYPE_HEADER: &str = "Service-Orig-Type";

/// Advisory identity of the caller a control request originated from,
/// forwarded on every outbound call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Origin {
    pub name: String,
    pub source_type: String,
}

impl Origin {
    pub fn new(name: impl Into<String>, source_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_type: source_type.into(),
        }
    }
}

/// The outbound call contract: deliver one JSON payload to one downstream
/// service. Implementations must bound how long a call can take.
pub trait SouthDelivery: Send + Sync {
    fn put(&self, service: &ServiceRecord, path: &str, payload: &Value, origin: &Origin)
    -> Result<()>;
}

/// Delivery over HTTP. Every call is a `PUT` with a JSON body, the
/// service's registration token as a bearer credential and the origin
/// advisory headers. Calls time out so shutdown is never held hostage by
/// a dead recipient.
pub struct HttpSouthDelivery {
    client: reqwest::blocking::Client,
}

impl HttpSouthDelivery {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| DispatchError::Config(err.to_string()))?;
        Ok(Self { client })
    }
}

impl SouthDelivery for HttpSouthDelivery {
    fn put(
        &self,
        service: &ServiceRecord,
        path: &str,
        payload: &Value,
        origin: &Origin,
    ) -> Result<()> {
        let url = format!("{}{}", service.base_url(), path);
        let mut request = self
            .client
            .put(&url)
            .header(ORIGIN_NAME_HEADER, &origin.name)
            .header(ORIGIN_TYPE_HEADER, &origin.source_type)
            .json(payload);
        if let Some(token) = &service.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .map_err(|err| DispatchError::Dispatch(service.name.clone(), err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Dispatch(
                service.name.clone(),
                format!("{} returned {}", url, status),
            ));
        }
        Ok(())
    }
}

/// One outbound call captured by `RecordingDelivery`.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub service: String,
    pub path: String,
    pub payload: Value,
    pub origin: Origin,
}

/// Delivery double that records calls instead of sending them. Services
/// listed as failing reject every call, which is how the tests exercise
/// per-recipient error isolation.
#[derive(Default)]
pub struct RecordingDelivery {
    calls: Mutex<Vec<RecordedCall>>,
    failing: Mutex<Vec<String>>,
}

impl RecordingDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_service(&self, name: &str) {
        self.failing.lock().push(name.to_string());
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

impl SouthDelivery for RecordingDelivery {
    fn put(
        &self,
        service: &ServiceRecord,
        path: &str,
        payload: &Value,
        origin: &Origin,
    ) -> Result<()> {
        if self.failing.lock().iter().any(|name| name == &service.name) {
            return Err(DispatchError::Dispatch(
                service.name.clone(),
                "connection refused".into(),
            ));
        }
        self.calls.lock().push(RecordedCall {
            service: service.name.clone(),
            path: path.to_string(),
            payload: payload.clone(),
            origin: origin.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn recording_delivery_captures_calls_and_failures() {
        let delivery = RecordingDelivery::new();
        delivery.fail_service("down");

        let ok = ServiceRecord::new("up", "Southbound", "localhost", 9001);
        let bad = ServiceRecord::new("down", "Southbound", "localhost", 9002);
        let origin = Origin::new("caller", "API");

        delivery
            .put(&ok, SETPOINT_PATH, &json!({"values": {"rpm": "1"}}), &origin)
            .unwrap();
        assert!(
            delivery
                .put(&bad, SETPOINT_PATH, &json!({}), &origin)
                .is_err()
        );

        let calls = delivery.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].service, "up");
        assert_eq!(calls[0].path, SETPOINT_PATH);
        assert_eq!(calls[0].origin, origin);
    }
}
