//! WebSocket observer stream + REST control surface + inbox webhook.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capabilities::types::SearchFilters;
use crate::error::{DiscoveryError, PipelineError, RouterError};
use crate::events::bus::{EventBus, Subscription};
use crate::events::model::{ClientMessage, Delivery, WsMessage};
use crate::inbound::InboundRouter;
use crate::leads::discovery::DiscoveryService;
use crate::leads::model::LeadFilter;
use crate::leads::registry::LeadRegistry;
use crate::meetings::MeetingBook;
use crate::pipeline::RunManager;
use crate::pipeline::types::RunOptions;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<LeadRegistry>,
    pub bus: EventBus,
    pub runs: Arc<RunManager>,
    pub discovery: Arc<DiscoveryService>,
    pub inbound: Arc<InboundRouter>,
    pub meetings: Arc<MeetingBook>,
}

/// Build the Axum router with the observer WebSocket and REST routes.
pub fn dashboard_routes(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/api/leads", get(list_leads))
        .route("/api/leads/{id}", get(get_lead))
        .route("/api/runs", get(list_runs).post(start_run))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/api/meetings", get(list_meetings))
        .route("/api/events", get(recent_events))
        .route("/api/discovery", post(start_discovery))
        .route("/api/inbox/process", post(process_inbox))
        .route("/webhooks/inbox", post(inbox_webhook))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error(status: StatusCode, code: &str, message: impl ToString) -> Response {
    (
        status,
        Json(json!({"error": code, "message": message.to_string()})),
    )
        .into_response()
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "rapidreach",
        "leads": state.registry.len().await,
        "last_seq": state.bus.last_seq(),
        "observers": state.bus.subscriber_count(),
    }))
}

// ── WebSocket ───────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct WsParams {
    /// Resume after this event sequence number instead of taking a snapshot.
    after: Option<u64>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    info!(after = ?params.after, "Observer connecting");
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.after))
}

async fn send(socket: &mut WebSocket, msg: &WsMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to encode WS message");
            true
        }
    }
}

/// Send a registry snapshot and return the subscription that continues it.
async fn snapshot(socket: &mut WebSocket, registry: &LeadRegistry) -> Option<Subscription> {
    let (seq, leads, subscription) = registry.subscribe_with_snapshot().await;
    debug!(seq, leads = leads.len(), "Sending snapshot");
    send(socket, &WsMessage::Snapshot { seq, leads })
        .await
        .then_some(subscription)
}

async fn handle_socket(mut socket: WebSocket, state: AppState, after: Option<u64>) {
    let mut subscription = match after {
        Some(after) => state.bus.subscribe_from(Some(after)),
        None => match snapshot(&mut socket, &state.registry).await {
            Some(subscription) => subscription,
            None => {
                warn!("Failed to send initial snapshot, client disconnected");
                return;
            }
        },
    };
    info!("Observer connected");

    loop {
        tokio::select! {
            delivery = subscription.recv() => {
                let msg = match delivery {
                    Some(Delivery::Event(event)) => WsMessage::Event { event },
                    Some(Delivery::Resync { missed }) => {
                        warn!(missed, "Observer fell behind, asking it to resync");
                        WsMessage::Resync { missed }
                    }
                    None => {
                        debug!("Event bus closed");
                        break;
                    }
                };
                if !send(&mut socket, &msg).await {
                    debug!("Client disconnected during send");
                    break;
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(ClientMessage::Ping) => {
                                if !send(&mut socket, &WsMessage::Pong).await {
                                    break;
                                }
                            }
                            Ok(ClientMessage::Sync) => {
                                // The fresh snapshot supersedes everything still queued.
                                match snapshot(&mut socket, &state.registry).await {
                                    Some(fresh) => subscription = fresh,
                                    None => break,
                                }
                            }
                            Err(e) => debug!(error = %e, text = %text.as_str(), "Unrecognized WS message from client"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Observer disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    state.bus.unsubscribe(subscription);
    info!("Observer connection closed");
}

// ── Leads ───────────────────────────────────────────────────────────────

async fn list_leads(
    State(state): State<AppState>,
    Query(filter): Query<LeadFilter>,
) -> impl IntoResponse {
    let leads: Vec<_> = state.registry.list(&filter).await.collect();
    Json(leads)
}

async fn get_lead(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.registry.get(&id).await {
        Some(lead) => Json(lead).into_response(),
        None => error(StatusCode::NOT_FOUND, "lead_not_found", format!("Lead {id} not found")),
    }
}

// ── Runs ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RunQuery {
    lead_id: Option<String>,
}

async fn list_runs(State(state): State<AppState>, Query(query): Query<RunQuery>) -> impl IntoResponse {
    Json(state.runs.list(query.lead_id.as_deref()).await)
}

async fn get_run(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Ok(run_id) = Uuid::parse_str(&id) else {
        return error(StatusCode::BAD_REQUEST, "invalid_run_id", "Invalid run ID");
    };
    match state.runs.get(run_id).await {
        Ok(run) => Json(run).into_response(),
        Err(e) => pipeline_error(e),
    }
}

#[derive(Deserialize)]
struct StartRunRequest {
    lead_id: String,
    #[serde(default)]
    skip_call: bool,
}

fn pipeline_error(e: PipelineError) -> Response {
    match &e {
        PipelineError::AlreadyRunning { run_id, .. } => (
            StatusCode::CONFLICT,
            Json(json!({"error": "already_running", "run_id": run_id, "message": e.to_string()})),
        )
            .into_response(),
        PipelineError::LeadNotFound(_) => error(StatusCode::NOT_FOUND, "lead_not_found", &e),
        PipelineError::RunNotFound(_) => error(StatusCode::NOT_FOUND, "run_not_found", &e),
        PipelineError::NoActiveRun(_) | PipelineError::NotAwaitingReply(_) => {
            error(StatusCode::NOT_FOUND, "no_active_run", &e)
        }
    }
}

async fn start_run(State(state): State<AppState>, Json(body): Json<StartRunRequest>) -> Response {
    let options = RunOptions {
        skip_call: body.skip_call,
    };
    match state.runs.start(&body.lead_id, options).await {
        Ok(started) => {
            info!(lead_id = %body.lead_id, run_id = %started.run_id, "Run started via API");
            (
                StatusCode::ACCEPTED,
                Json(json!({"run_id": started.run_id, "status": "started"})),
            )
                .into_response()
        }
        Err(e) => {
            warn!(lead_id = %body.lead_id, error = %e, "Run start rejected");
            pipeline_error(e)
        }
    }
}

async fn cancel_run(State(state): State<AppState>, Path(lead_id): Path<String>) -> Response {
    match state.runs.cancel(&lead_id).await {
        Ok(run) => (StatusCode::OK, Json(json!(run))).into_response(),
        Err(e) => pipeline_error(e),
    }
}

// ── Meetings / events ───────────────────────────────────────────────────

async fn list_meetings(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.meetings.list().await)
}

#[derive(Deserialize)]
struct EventsQuery {
    #[serde(default = "default_event_limit")]
    limit: usize,
}

fn default_event_limit() -> usize {
    100
}

async fn recent_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    Json(state.bus.recent(query.limit))
}

// ── Triggers ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct DiscoveryRequest {
    area: String,
    #[serde(default)]
    filters: SearchFilters,
}

async fn start_discovery(
    State(state): State<AppState>,
    Json(body): Json<DiscoveryRequest>,
) -> Response {
    if body.area.trim().is_empty() {
        return error(StatusCode::BAD_REQUEST, "invalid_area", "Area must not be empty");
    }
    match state.discovery.discover(&body.area, &body.filters).await {
        Ok(report) => (StatusCode::OK, Json(json!(report))).into_response(),
        Err(e @ DiscoveryError::AlreadyRunning { .. }) => {
            error(StatusCode::CONFLICT, "already_running", e)
        }
        Err(e @ DiscoveryError::Search(_)) => error(StatusCode::BAD_GATEWAY, "search_failed", e),
    }
}

async fn process_inbox(State(state): State<AppState>) -> Response {
    match state.inbound.scan().await {
        Ok(report) => (StatusCode::OK, Json(json!(report))).into_response(),
        Err(e @ RouterError::ScanInProgress) => error(StatusCode::CONFLICT, "scan_in_progress", e),
        Err(e) => error(StatusCode::BAD_GATEWAY, e.error_class(), e),
    }
}

#[derive(Debug, Default, Deserialize)]
struct InboxNotification {
    #[serde(default)]
    message_id: Option<String>,
}

/// Push channel. A notification without a message id triggers a scan.
async fn inbox_webhook(State(state): State<AppState>, body: Bytes) -> Response {
    let notification = if body.is_empty() {
        InboxNotification::default()
    } else {
        match serde_json::from_slice::<InboxNotification>(&body) {
            Ok(n) => n,
            Err(e) => return error(StatusCode::BAD_REQUEST, "invalid_notification", e),
        }
    };
    match notification.message_id.filter(|id| !id.trim().is_empty()) {
        Some(message_id) => match state.inbound.notify(&message_id).await {
            Ok(outcome) => (
                StatusCode::OK,
                Json(json!({"status": outcome.label(), "message_id": message_id})),
            )
                .into_response(),
            Err(e) => {
                warn!(message_id = %message_id, error = %e, "Pushed message deferred to next poll");
                (
                    StatusCode::ACCEPTED,
                    Json(json!({"status": "deferred", "message_id": message_id, "error": e.to_string()})),
                )
                    .into_response()
            }
        },
        None => match state.inbound.scan().await {
            Ok(report) => (StatusCode::OK, Json(json!(report))).into_response(),
            Err(RouterError::ScanInProgress) => {
                (StatusCode::OK, Json(json!({"status": "scan_in_progress"}))).into_response()
            }
            Err(e) => error(StatusCode::BAD_GATEWAY, e.error_class(), e),
        },
    }
}
