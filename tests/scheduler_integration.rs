//! Black-box integration test: a real `Scheduler` driven against an
//! in-process mock Shelly device server, asserting end-to-end metric
//! values for the Pro4PM happy path and the auth-failure backoff scenario.
//!
//! Same shape as the corpus's `crates/neomind-devices/tests/*` black-box
//! tests: spin up a local `axum` server, drive the real subsystem under
//! test against it, assert on observable state rather than internals.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use shelly_exporter::client::DeviceClient;
use shelly_exporter::driver::DriverRegistry;
use shelly_exporter::metrics::MetricRegistry;
use shelly_exporter::model::{ChannelKind, ChannelSpec, Credentials, LiveTargetRegistry, Target};
use shelly_exporter::scheduler::Scheduler;

async fn spawn(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn pro4pm_target(name: &str, host: &str) -> Target {
    Target {
        name: name.to_string(),
        host: host.to_string(),
        poll_interval: Duration::from_millis(50),
        credentials: Credentials::default(),
        channels: (0..4)
            .map(|i| ChannelSpec {
                kind: ChannelKind::Switch,
                index: i,
                ignore: Default::default(),
            })
            .collect(),
    }
}

fn pro4pm_status_body() -> Value {
    let mut status = serde_json::Map::new();
    for i in 0..4 {
        status.insert(
            format!("switch:{i}"),
            json!({
                "output": true,
                "apower": 12.3,
                "voltage": 230.1,
                "freq": 50.0,
                "current": 0.054,
                "pf": 0.98,
                "temperature": {"tC": 42.1},
                "aenergy": {"total": 1234.5},
                "ret_aenergy": {"total": 0.0},
            }),
        );
    }
    Value::Object(status)
}

async fn rpc_handler(Json(body): Json<Value>) -> Json<Value> {
    match body.get("method").and_then(Value::as_str) {
        Some("Shelly.GetDeviceInfo") => Json(json!({
            "result": {"model": "SPSW-104PE16EU", "gen": 2, "app": "Pro4PM", "mac": "AA:BB:CC:DD:EE:FF"}
        })),
        Some("Shelly.GetStatus") => Json(json!({ "result": pro4pm_status_body() })),
        _ => Json(json!({ "error": {"code": -1, "message": "unknown method"} })),
    }
}

fn test_scheduler(
    registry: Arc<LiveTargetRegistry>,
    metrics: Arc<MetricRegistry>,
) -> Arc<Scheduler> {
    Arc::new(Scheduler::new(
        registry,
        DeviceClient::new(),
        Arc::new(DriverRegistry::with_builtin_drivers()),
        metrics,
        50,
        Duration::from_secs(21600),
        Duration::from_secs(3),
        Duration::from_millis(10),
        Duration::from_millis(100),
    ))
}

#[tokio::test]
async fn pro4pm_happy_path_publishes_all_four_meters() {
    let app = Router::new().route("/rpc", post(rpc_handler));
    let addr = spawn(app).await;

    let registry = Arc::new(LiveTargetRegistry::new());
    let metrics = Arc::new(MetricRegistry::new());
    let scheduler = test_scheduler(Arc::clone(&registry), Arc::clone(&metrics));

    registry.insert_new(pro4pm_target("prox", &addr.to_string()), std::time::Instant::now());

    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let scheduler_task = tokio::spawn(Arc::clone(&scheduler).run(shutdown_rx));

    // Allow at least one poll to complete.
    tokio::time::sleep(Duration::from_millis(200)).await;
    scheduler_task.abort();

    let families = metrics.registry().gather();
    let up = families.iter().find(|f| f.get_name() == "shelly_up").unwrap();
    assert_eq!(up.get_metric()[0].get_gauge().get_value(), 1.0);

    let apower = families.iter().find(|f| f.get_name() == "shelly_switch_apower_watts").unwrap();
    assert_eq!(apower.get_metric().len(), 4);
    for metric in apower.get_metric() {
        assert_eq!(metric.get_gauge().get_value(), 12.3);
    }
}

#[tokio::test]
async fn auth_failure_marks_device_down_and_increments_errors() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_for_handler = Arc::clone(&attempts);
    let app = Router::new().route(
        "/rpc",
        post(move |_body: Json<Value>| {
            let attempts = Arc::clone(&attempts_for_handler);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                axum::http::StatusCode::UNAUTHORIZED
            }
        }),
    );
    let addr = spawn(app).await;

    let registry = Arc::new(LiveTargetRegistry::new());
    let metrics = Arc::new(MetricRegistry::new());
    let scheduler = test_scheduler(Arc::clone(&registry), Arc::clone(&metrics));

    registry.insert_new(pro4pm_target("locked", &addr.to_string()), std::time::Instant::now());

    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let scheduler_task = tokio::spawn(Arc::clone(&scheduler).run(shutdown_rx));

    tokio::time::sleep(Duration::from_millis(150)).await;
    scheduler_task.abort();

    let families = metrics.registry().gather();
    let up = families.iter().find(|f| f.get_name() == "shelly_up").unwrap();
    assert_eq!(up.get_metric()[0].get_gauge().get_value(), 0.0);

    let errors = families.iter().find(|f| f.get_name() == "shelly_poll_errors_total").unwrap();
    assert!(errors.get_metric()[0].get_counter().get_value() >= 1.0);
    assert!(attempts.load(Ordering::SeqCst) >= 1);
}
