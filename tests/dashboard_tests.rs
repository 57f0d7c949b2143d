//! HTTP surface tests over a loopback listener

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::{Harness, MemoryBackend, Reply, ScriptedModel};
use vmpilot::agent::SessionRegistry;
use vmpilot::dashboard::{create_router, DashboardState};
use vmpilot::vm::{VmRecord, VmStatus};

async fn spawn_dashboard(h: Harness) -> SocketAddr {
    let state = DashboardState {
        registry: Arc::new(SessionRegistry::new(h.orchestrator)),
    };
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, create_router(state)).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn test_turn_streams_sse_events() {
    let h = Harness::new(
        ScriptedModel::new(vec![Reply::say(r#"{"operation": "list_vms"}"#)]),
        MemoryBackend::new().with_vm(VmRecord::new("web", VmStatus::Running)),
    );
    let addr = spawn_dashboard(h).await;
    let client = reqwest::Client::new();

    let body = client
        .post(format!("http://{}/api/sessions/web-ui/turns", addr))
        .json(&serde_json::json!({ "message": "list my vms" }))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert!(body.contains("event: text_chunk"));
    assert!(body.contains("event: operation_result"));
    assert!(body.contains("\"name\":\"web\""));
    let done = body.find("event: done").expect("done event");
    assert!(body[done..].contains("completed"));

    // The cached inventory now reflects the listing
    let vms: Vec<VmRecord> = client
        .get(format!("http://{}/api/vms", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(vms.len(), 1);

    let session: serde_json::Value = client
        .get(format!("http://{}/api/sessions/web-ui", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(session["history"].as_array().unwrap().len(), 2);
    assert_eq!(session["turn_state"], "completed");
}

#[tokio::test]
async fn test_rejected_and_unknown_requests() {
    let addr = spawn_dashboard(Harness::new(ScriptedModel::default(), MemoryBackend::new())).await;
    let client = reqwest::Client::new();

    let empty = client
        .post(format!("http://{}/api/sessions/s/turns", addr))
        .json(&serde_json::json!({ "message": "  " }))
        .send()
        .await
        .unwrap();
    assert_eq!(empty.status(), reqwest::StatusCode::BAD_REQUEST);

    let missing = client
        .get(format!("http://{}/api/sessions/nobody", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

    let cancel: serde_json::Value = client
        .post(format!("http://{}/api/sessions/nobody/cancel", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(cancel["cancelled"], false);
}

#[tokio::test]
async fn test_health_reports_backend_outage() {
    let h = Harness::new(ScriptedModel::default(), MemoryBackend::new());
    h.backend.set_unreachable(true);
    let addr = spawn_dashboard(h).await;

    let response = reqwest::get(format!("http://{}/health", addr)).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["backend"]["ok"], false);
    assert_eq!(body["model"]["ok"], true);
}

#[tokio::test]
async fn test_health_gives_up_on_silent_model() {
    let model = ScriptedModel::default();
    model.hang_health();
    let h = Harness::with_timeouts(
        model,
        MemoryBackend::new(),
        Duration::from_millis(100),
        Duration::from_secs(5),
    );
    let addr = spawn_dashboard(h).await;

    let response = tokio::time::timeout(
        Duration::from_secs(5),
        reqwest::get(format!("http://{}/health", addr)),
    )
    .await
    .expect("health did not answer")
    .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["backend"]["ok"], true);
    assert_eq!(body["model"]["ok"], false);
}

#[tokio::test]
async fn test_panel_renders_rows_as_text() {
    let h = Harness::new(ScriptedModel::default(), MemoryBackend::new());
    let addr = spawn_dashboard(h).await;

    let page = reqwest::get(format!("http://{}/", addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(page.contains("textContent"));
    assert!(!page.contains("innerHTML"));
}
