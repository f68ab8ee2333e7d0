//! System controller poller and command proxy against an in-process fake
//! controller served by axum on an ephemeral port.

use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use ndefender_aggregator::config::SystemControllerConfig;
use ndefender_aggregator::ingest::{SystemControllerClient, SystemControllerIngestor};
use ndefender_aggregator::{
    Clock, CommandRequest, CommandRouter, EventBus, HealthStatus, Ingestor, JsonMap, ManualClock, Section,
    StateStore, SystemCommandHandler,
};
use serde_json::{json, Value};

#[derive(Clone, Default)]
struct Fake {
    /// (path, body, api key) per POST
    posts: Arc<Mutex<Vec<(String, Value, Option<String>)>>>,
    fail_status: Arc<Mutex<bool>>,
}

fn api_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn status(State(fake): State<Fake>) -> Result<Json<Value>, StatusCode> {
    if *fake.fail_status.lock().unwrap() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(json!({
        "timestamp_ms": 4242,
        "system": {"cpu_percent": 12.5},
        "ups": {"battery_percent": 87},
        "services": [{"name": "remoteid", "active": true}],
        "network": {"ip": "10.0.0.2"}
    })))
}

async fn power(
    State(fake): State<Fake>,
    Path(action): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    fake.posts
        .lock()
        .unwrap()
        .push((format!("system/{action}"), body, api_key(&headers)));
    StatusCode::OK
}

async fn restart(
    State(fake): State<Fake>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    if name == "missing" {
        return StatusCode::NOT_FOUND;
    }
    fake.posts
        .lock()
        .unwrap()
        .push((format!("services/{name}/restart"), body, api_key(&headers)));
    StatusCode::ACCEPTED
}

async fn serve(fake: Fake) -> String {
    let app = Router::new()
        .route("/api/v1/status", get(status))
        .route("/api/v1/system/:action", post(power))
        .route("/api/v1/services/:name/restart", post(restart))
        .with_state(fake);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/api/v1")
}

fn client(base_url: String) -> SystemControllerClient {
    SystemControllerClient::new(&SystemControllerConfig {
        base_url,
        timeout_secs: 2,
        api_key: Some("s3cret".into()),
    })
    .unwrap()
}

#[tokio::test]
async fn poll_fans_status_into_sections() {
    let fake = Fake::default();
    let base_url = serve(fake.clone()).await;

    let manual = Arc::new(ManualClock::new(1));
    let clock: Arc<dyn Clock> = manual.clone();
    let state = Arc::new(StateStore::new(Arc::clone(&clock)));
    let bus = Arc::new(EventBus::new(8).unwrap());
    let sub = bus.subscribe();
    let poller = SystemControllerIngestor::new(client(base_url), 1_000, Arc::clone(&state), bus, clock);

    poller.poll_once().await.unwrap();

    let snapshot = state.snapshot().await;
    assert_eq!(snapshot.system["cpu_percent"], 12.5);
    assert_eq!(snapshot.power["battery_percent"], 87);
    assert_eq!(snapshot.services[0]["name"], "remoteid");
    assert_eq!(snapshot.network["ip"], "10.0.0.2");
    // Absent from the document: untouched.
    assert_eq!(snapshot.audio, json!({}));

    let event = sub.try_recv().unwrap();
    assert_eq!(event.event_type, "SYSTEM_UPDATE");
    assert_eq!(event.timestamp_ms, 4242);
    assert_eq!(event.source, "system_controller");

    manual.advance(10);
    *fake.fail_status.lock().unwrap() = true;
    assert!(poller.poll_once().await.is_err());
    poller.start().await.unwrap();
    let health = poller.health().await;
    assert_eq!(health.status, HealthStatus::Degraded);
    assert!(health.last_error.unwrap().contains("503"));
    // Last good values survive the failure.
    assert_eq!(state.section(Section::Network).await["ip"], "10.0.0.2");
    poller.stop().await.unwrap();
}

#[tokio::test]
async fn system_commands_are_gated_then_proxied() {
    let fake = Fake::default();
    let base_url = serve(fake.clone()).await;
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(10));

    let mut router = CommandRouter::new(Arc::clone(&clock));
    router.register(Arc::new(SystemCommandHandler::new(client(base_url.clone()), false, Arc::clone(&clock))));

    let gated = router
        .dispatch(CommandRequest::new("system/reboot").with_confirm(true))
        .await;
    assert!(!gated.accepted);
    assert_eq!(gated.detail.as_deref(), Some("unsafe operations disabled"));
    assert!(fake.posts.lock().unwrap().is_empty());

    let mut router = CommandRouter::new(Arc::clone(&clock));
    router.register(Arc::new(SystemCommandHandler::new(client(base_url), true, Arc::clone(&clock))));

    let unconfirmed = router.dispatch(CommandRequest::new("system/shutdown")).await;
    assert_eq!(unconfirmed.detail.as_deref(), Some("confirm required"));

    let reboot = router
        .dispatch(
            CommandRequest::new("system/reboot")
                .with_confirm(true)
                .issued_by("admin"),
        )
        .await;
    assert!(reboot.accepted, "{reboot:?}");
    assert_eq!(reboot.detail, None);

    let mut payload = JsonMap::new();
    payload.insert("service".into(), json!("remoteid"));
    let restart = router
        .dispatch(CommandRequest::new("services/restart").with_payload(payload))
        .await;
    assert!(restart.accepted);

    let mut payload = JsonMap::new();
    payload.insert("service".into(), json!("missing"));
    let failed = router
        .dispatch(CommandRequest::new("services/restart").with_payload(payload))
        .await;
    assert!(!failed.accepted);
    assert!(failed.detail.unwrap().contains("404"));

    let posts = fake.posts.lock().unwrap().clone();
    assert_eq!(
        posts,
        vec![
            ("system/reboot".to_string(), json!({"confirm": true}), Some("s3cret".to_string())),
            ("services/remoteid/restart".to_string(), json!({}), Some("s3cret".to_string())),
        ]
    );
}
