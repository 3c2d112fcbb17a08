use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use serde_json::json;

use dispatchx::{
    CallerContext, ControlRequest, DispatcherDeps, DispatcherService, KVList, MemoryConfigStore,
    MemoryStorage, PluginLoader, RecordingDelivery, RequestKind, ServiceRecord, StaticAssets,
    StaticRegistry,
    delivery::{OPERATION_PATH, SETPOINT_PATH},
    registry::SOUTHBOUND_TYPE,
    service::SERVICE_TYPE,
};

struct Harness {
    service: Arc<DispatcherService>,
    registry: Arc<StaticRegistry>,
    assets: Arc<StaticAssets>,
    delivery: Arc<RecordingDelivery>,
}

fn harness() -> Harness {
    let registry = Arc::new(StaticRegistry::new());
    let assets = Arc::new(StaticAssets::new());
    let delivery = Arc::new(RecordingDelivery::new());
    let deps = DispatcherDeps {
        registry: registry.clone(),
        config_store: Arc::new(MemoryConfigStore::new()),
        assets: assets.clone(),
        storage: Arc::new(MemoryStorage::with_default_types()),
        delivery: delivery.clone(),
    };
    let service = DispatcherService::new("dispatchx", deps, Arc::new(PluginLoader::new()));
    Harness {
        service,
        registry,
        assets,
        delivery,
    }
}

fn start(harness: &Harness) {
    harness
        .service
        .start(ServiceRecord::new("dispatchx", SERVICE_TYPE, "localhost", 0))
        .expect("dispatcher should start");
}

fn wait_idle(service: &DispatcherService) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !service.is_idle() {
        assert!(
            Instant::now() < deadline,
            "dispatcher did not drain its queue in time"
        );
        thread::sleep(Duration::from_millis(5));
    }
}

fn write_request(service: &str, pairs: &[(&str, &str)]) -> ControlRequest {
    let mut values = KVList::new();
    for (key, value) in pairs {
        values.add(*key, *value);
    }
    ControlRequest::new(
        RequestKind::WriteService {
            service: service.to_string(),
            values,
        },
        CallerContext::anonymous("/dispatch/write"),
    )
}

#[test]
fn single_write_reaches_the_target_service() {
    let harness = harness();
    harness
        .registry
        .add(ServiceRecord::new("pumpA", SOUTHBOUND_TYPE, "localhost", 9001));
    start(&harness);

    harness
        .service
        .queue_request(write_request("pumpA", &[("rpm", "1500")]));
    wait_idle(&harness.service);

    let calls = harness.delivery.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].service, "pumpA");
    assert_eq!(calls[0].path, SETPOINT_PATH);
    assert_eq!(calls[0].payload, json!({"values": {"rpm": "1500"}}));

    harness.service.shutdown(true);
}

#[test]
fn broadcast_survives_a_failing_recipient() {
    let harness = harness();
    harness
        .registry
        .add(ServiceRecord::new("s1", SOUTHBOUND_TYPE, "localhost", 9001));
    harness
        .registry
        .add(ServiceRecord::new("s2", SOUTHBOUND_TYPE, "localhost", 9002));
    // s1 is contacted first and refuses the connection; s2 must still be
    // attempted.
    harness.delivery.fail_service("s1");
    start(&harness);

    harness.service.queue_request(ControlRequest::new(
        RequestKind::OpBroadcast {
            operation: "reset".into(),
            parameters: KVList::new(),
        },
        CallerContext::anonymous("/dispatch/operation"),
    ));
    wait_idle(&harness.service);

    let calls = harness.delivery.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].service, "s2");
    assert_eq!(calls[0].path, OPERATION_PATH);
    assert_eq!(calls[0].payload, json!({"operation": "reset"}));

    harness.service.shutdown(true);
}

#[test]
fn write_broadcast_reaches_every_southbound_service() {
    let harness = harness();
    for (name, port) in [("s1", 9001), ("s2", 9002), ("north", 9100)] {
        let service_type = if name == "north" {
            "Northbound"
        } else {
            SOUTHBOUND_TYPE
        };
        harness
            .registry
            .add(ServiceRecord::new(name, service_type, "localhost", port));
    }
    start(&harness);

    harness.service.queue_request(ControlRequest::new(
        RequestKind::WriteBroadcast {
            values: {
                let mut values = KVList::new();
                values.add("mode", "safe");
                values
            },
        },
        CallerContext::anonymous("/dispatch/write"),
    ));
    wait_idle(&harness.service);

    let calls = harness.delivery.calls();
    let mut recipients: Vec<&str> = calls.iter().map(|call| call.service.as_str()).collect();
    recipients.sort();
    assert_eq!(recipients, vec!["s1", "s2"]);

    harness.service.shutdown(true);
}

#[test]
fn asset_writes_resolve_to_the_ingest_service() {
    let harness = harness();
    harness
        .registry
        .add(ServiceRecord::new("south1", SOUTHBOUND_TYPE, "localhost", 9001));
    harness.assets.track("tank-level", "south1");
    start(&harness);

    harness.service.queue_request(ControlRequest::new(
        RequestKind::WriteAsset {
            asset: "tank-level".into(),
            values: {
                let mut values = KVList::new();
                values.add("setpoint", "75");
                values
            },
        },
        CallerContext::anonymous("/dispatch/write"),
    ));
    wait_idle(&harness.service);

    let calls = harness.delivery.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].service, "south1");
    assert_eq!(calls[0].payload, json!({"values": {"setpoint": "75"}}));

    harness.service.shutdown(true);
}

#[test]
fn unknown_asset_is_dropped_without_dispatch() {
    let harness = harness();
    start(&harness);

    harness.service.queue_request(ControlRequest::new(
        RequestKind::OpAsset {
            operation: "reset".into(),
            asset: "ghost".into(),
            parameters: KVList::new(),
        },
        CallerContext::anonymous("/dispatch/operation"),
    ));
    wait_idle(&harness.service);

    assert_eq!(harness.delivery.call_count(), 0);
    harness.service.shutdown(true);
}

#[test]
fn disabling_the_service_fails_requests_fast() {
    let harness = harness();
    harness
        .registry
        .add(ServiceRecord::new("pumpA", SOUTHBOUND_TYPE, "localhost", 9001));
    start(&harness);

    harness
        .service
        .config_change("dispatchx", &json!({"enable": {"value": "false"}}));
    harness
        .service
        .queue_request(write_request("pumpA", &[("rpm", "100")]));
    wait_idle(&harness.service);
    assert_eq!(harness.delivery.call_count(), 0);

    harness
        .service
        .config_change("dispatchx", &json!({"enable": {"value": "true"}}));
    harness
        .service
        .queue_request(write_request("pumpA", &[("rpm", "200")]));
    wait_idle(&harness.service);
    assert_eq!(harness.delivery.call_count(), 1);

    harness.service.shutdown(true);
}

#[test]
fn every_queued_request_is_executed_exactly_once() {
    let harness = harness();
    harness
        .registry
        .add(ServiceRecord::new("pumpA", SOUTHBOUND_TYPE, "localhost", 9001));
    start(&harness);

    for n in 0..64 {
        harness
            .service
            .queue_request(write_request("pumpA", &[("seq", &n.to_string())]));
    }
    wait_idle(&harness.service);

    let calls = harness.delivery.calls();
    assert_eq!(calls.len(), 64);
    let mut seen: Vec<i64> = calls
        .iter()
        .map(|call| call.payload["values"]["seq"].as_str().unwrap().parse().unwrap())
        .collect();
    seen.sort();
    let expected: Vec<i64> = (0..64).collect();
    assert_eq!(seen, expected);

    harness.service.shutdown(true);
}

#[test]
fn origin_headers_carry_the_caller_identity() {
    let harness = harness();
    harness
        .registry
        .add(ServiceRecord::new("pumpA", SOUTHBOUND_TYPE, "localhost", 9001));
    start(&harness);

    let caller = CallerContext {
        source_name: "sched1".into(),
        source_type: "Schedule".into(),
        request_url: "/dispatch/write".into(),
        advisory: None,
    };
    let mut values = KVList::new();
    values.add("rpm", "900");
    harness.service.queue_request(ControlRequest::new(
        RequestKind::WriteService {
            service: "pumpA".into(),
            values,
        },
        caller,
    ));
    wait_idle(&harness.service);

    let calls = harness.delivery.calls();
    assert_eq!(calls[0].origin.name, "sched1");
    assert_eq!(calls[0].origin.source_type, "Schedule");

    harness.service.shutdown(true);
}
