//! HTTP surface: status panel, chat turns over SSE, health and metrics
//!
//! Routes:
//! - `GET  /`                          - status panel page
//! - `GET  /health`                    - backend and model probes
//! - `GET  /metrics`                   - Prometheus text format
//! - `GET  /api/vms`                   - cached inventory (never calls the backend)
//! - `POST /api/vms/refresh`           - re-list the backend
//! - `POST /api/sessions/{id}/turns`   - start a turn; SSE stream of events
//! - `POST /api/sessions/{id}/cancel`  - cancel the in-flight turn
//! - `GET  /api/sessions/{id}`         - conversation history

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use async_stream::stream;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        Html, IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use tracing::{info, warn};

use crate::agent::{ConversationTurn, SessionRegistry, TurnError, TurnState};
use crate::metrics;
use crate::vm::VmRecord;

/// Dashboard application state
#[derive(Clone)]
pub struct DashboardState {
    pub registry: Arc<SessionRegistry>,
}

#[derive(Debug, Deserialize)]
pub struct TurnRequest {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub backend: ProbeResult,
    pub model: ProbeResult,
}

#[derive(Debug, Serialize)]
pub struct ProbeResult {
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub struct SessionView {
    pub id: String,
    pub turn_state: Option<TurnState>,
    pub history: Vec<ConversationTurn>,
}

/// Create the dashboard router
pub fn create_router(state: DashboardState) -> Router {
    Router::new()
        .route("/", get(dashboard_page))
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .route("/api/vms", get(list_vms))
        .route("/api/vms/refresh", post(refresh_vms))
        .route("/api/sessions/{id}", get(session_view))
        .route("/api/sessions/{id}/turns", post(submit_turn))
        .route("/api/sessions/{id}/cancel", post(cancel_turn))
        .with_state(state)
}

/// Bind `listen` and serve until the server fails
pub async fn serve(state: DashboardState, listen: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(addr = %listen, "dashboard listening");
    axum::serve(listener, create_router(state)).await
}

async fn dashboard_page() -> Html<&'static str> {
    Html(DASHBOARD_HTML)
}

async fn health(State(state): State<DashboardState>) -> impl IntoResponse {
    let orchestrator = state.registry.orchestrator();
    let resolver = orchestrator.resolver();
    let (backend, model) = tokio::join!(
        tokio::time::timeout(
            orchestrator.executor().exec_timeout(),
            orchestrator.executor().backend().version()
        ),
        tokio::time::timeout(resolver.timeout(), resolver.model().health())
    );
    let backend = match backend {
        Ok(Ok(version)) => ProbeResult { ok: true, detail: version },
        Ok(Err(e)) => ProbeResult { ok: false, detail: e.to_string() },
        Err(_) => timed_out(orchestrator.executor().exec_timeout()),
    };
    let model = match model {
        Ok(Ok(())) => ProbeResult {
            ok: true,
            detail: resolver.model().model().to_string(),
        },
        Ok(Err(e)) => ProbeResult { ok: false, detail: e.to_string() },
        Err(_) => timed_out(resolver.timeout()),
    };
    let healthy = backend.ok && model.ok;
    let code = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        code,
        Json(HealthStatus {
            status: if healthy { "ok" } else { "degraded" },
            backend,
            model,
        }),
    )
}

fn timed_out(deadline: Duration) -> ProbeResult {
    ProbeResult {
        ok: false,
        detail: format!("no answer within {:?}", deadline),
    }
}

async fn prometheus_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_text(),
    )
}

async fn list_vms(State(state): State<DashboardState>) -> Json<Vec<VmRecord>> {
    Json(state.registry.orchestrator().list_vms())
}

async fn refresh_vms(
    State(state): State<DashboardState>,
) -> Result<Json<Vec<VmRecord>>, (StatusCode, Json<ErrorBody>)> {
    state
        .registry
        .orchestrator()
        .refresh_inventory()
        .await
        .map(Json)
        .map_err(|e| error_body(StatusCode::BAD_GATEWAY, "refresh_failed", e.to_string()))
}

async fn session_view(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, (StatusCode, Json<ErrorBody>)> {
    let session = state
        .registry
        .get(&id)
        .ok_or_else(|| error_body(StatusCode::NOT_FOUND, "not_found", format!("no session '{}'", id)))?;
    Ok(Json(SessionView {
        id,
        turn_state: session.turn_state(),
        history: session.history(),
    }))
}

async fn submit_turn(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
    Json(request): Json<TurnRequest>,
) -> Result<
    Sse<impl Stream<Item = Result<SseEvent, Infallible>>>,
    (StatusCode, Json<ErrorBody>),
> {
    let session = state.registry.get_or_create(&id);
    let mut events = session.send_user_turn(&request.message).map_err(map_turn_error)?;

    let event_stream = stream! {
        while let Some(event) = events.next().await {
            let payload = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
            yield Ok(SseEvent::default().event(event.kind()).data(payload));
        }
    };

    Ok(Sse::new(event_stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(10))
            .text("keepalive"),
    ))
}

async fn cancel_turn(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> Json<serde_json::Value> {
    let cancelled = state
        .registry
        .get(&id)
        .map(|session| session.cancel())
        .unwrap_or(false);
    Json(serde_json::json!({ "cancelled": cancelled }))
}

fn map_turn_error(err: TurnError) -> (StatusCode, Json<ErrorBody>) {
    let failure = err.failure();
    let status = match err {
        TurnError::TurnInProgress => StatusCode::CONFLICT,
        TurnError::EmptyInput => StatusCode::BAD_REQUEST,
    };
    warn!(error = %err, "turn rejected");
    error_body(status, failure.kind.as_str(), failure.message)
}

fn error_body(status: StatusCode, code: &str, message: String) -> (StatusCode, Json<ErrorBody>) {
    (
        status,
        Json(ErrorBody {
            code: code.to_string(),
            message,
        }),
    )
}

/// HTML status panel
const DASHBOARD_HTML: &str = r#"
<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>vmpilot</title>
    <style>
        * { margin: 0; padding: 0; box-sizing: border-box; }
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            background: #0a0a0a;
            color: #e0e0e0;
            min-height: 100vh;
            padding: 2rem;
        }
        .header { text-align: center; margin-bottom: 2rem; border-bottom: 1px solid #333; padding-bottom: 1rem; }
        .header h1 { color: #00ff88; font-size: 2rem; margin-bottom: 0.5rem; }
        .header p { color: #888; }
        .card { background: #1a1a1a; border-radius: 12px; padding: 1.5rem; border: 1px solid #333; max-width: 1000px; margin: 0 auto; }
        table { width: 100%; border-collapse: collapse; }
        th { color: #00ff88; text-align: left; font-size: 0.8rem; text-transform: uppercase; letter-spacing: 1px; padding: 0.5rem; }
        td { padding: 0.5rem; border-top: 1px solid #222; }
        .running { color: #00ff88; }
        .stopped { color: #888; }
        .provisioning, .deleting { color: #ffaa00; }
        .unknown { color: #ff4444; }
        .refresh-note { text-align: center; color: #666; margin-top: 2rem; font-size: 0.875rem; }
    </style>
</head>
<body>
    <div class="header">
        <h1>vmpilot</h1>
        <p>Multipass VMs</p>
    </div>

    <div class="card">
        <table>
            <thead><tr><th>Name</th><th>Status</th><th>IP</th><th>CPUs</th><th>Memory</th><th>Disk</th></tr></thead>
            <tbody id="vms"><tr><td colspan="6">Loading...</td></tr></tbody>
        </table>
    </div>

    <p class="refresh-note">Auto-refreshes every 2 seconds</p>

    <script>
        async function fetchVms() {
            try {
                const res = await fetch('/api/vms');
                const vms = await res.json();
                const cell = (text, cls) => {
                    const td = document.createElement('td');
                    td.textContent = text;
                    if (cls) td.className = cls;
                    return td;
                };
                const rows = vms.map(vm => {
                    const tr = document.createElement('tr');
                    tr.append(
                        cell(vm.name),
                        cell(vm.status, String(vm.status)),
                        cell(vm.ip_address || '-'),
                        cell(vm.cpus || '-'),
                        cell(vm.memory_mb ? vm.memory_mb + ' MB' : '-'),
                        cell(vm.disk_gb ? vm.disk_gb + ' GB' : '-'),
                    );
                    return tr;
                });
                if (rows.length === 0) {
                    const tr = document.createElement('tr');
                    const td = cell('No VMs');
                    td.colSpan = 6;
                    tr.append(td);
                    rows.push(tr);
                }
                document.getElementById('vms').replaceChildren(...rows);
            } catch (err) {
                console.error('Error fetching VMs:', err);
            }
        }

        fetchVms();
        setInterval(fetchVms, 2000);
    </script>
</body>
</html>
"#;
