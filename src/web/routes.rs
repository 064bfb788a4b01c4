use crate::approval::{ApprovalActor, ApprovalOutcome};
use crate::error::{BrokerError, BrokerResult};
use crate::session::{SessionStatus, SharedSessionStore, UpstreamConfig};
use axum::{
    extract::{Path, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Application state for web handlers
#[derive(Clone)]
pub struct WebState {
    pub store: SharedSessionStore,
    pub actor: ApprovalActor,
    pub base_url: String,
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Session info response
#[derive(Debug, Serialize)]
pub struct SessionInfo {
    pub session: String,
    pub status: Option<SessionStatus>,
    pub approve_url: String,
}

/// Landing endpoint the user is sent to from the connection prompt
pub async fn get_session_info(
    Path(session): Path<String>,
    State(state): State<WebState>,
) -> Json<SessionInfo> {
    Json(SessionInfo {
        status: state.store.get_status(&session),
        approve_url: format!("{}/approve/{}", state.base_url.trim_end_matches('/'), session),
        session,
    })
}

/// Messages shown to the approving user
#[derive(Debug, Default, Serialize)]
pub struct ApproveResponse {
    pub infos: Vec<String>,
    pub errors: Vec<String>,
}

/// Deposit an upstream for a waiting session and report how it went
pub async fn approve(
    Path(session): Path<String>,
    State(state): State<WebState>,
    Json(upstream): Json<UpstreamConfig>,
) -> BrokerResult<Json<ApproveResponse>> {
    if upstream.host.trim().is_empty() {
        return Err(BrokerError::invalid_upstream("host is required"));
    }

    let mut response = ApproveResponse::default();
    match state.store.get_status(&session) {
        None => {
            response.errors.push("session expired".to_string());
            return Ok(Json(response));
        }
        // a resolved session keeps the target it already picked up
        Some(status) if status.is_terminal() => {
            debug!(session = %session, status = %status, "Approval for resolved session ignored");
            response
                .errors
                .push(format!("session already resolved: {}", status));
            return Ok(Json(response));
        }
        Some(_) => {}
    }

    info!(session = %session, host = %upstream.host, "Approval received");
    state.actor.approve(&session, upstream)?;

    match state.actor.await_outcome(&session).await {
        ApprovalOutcome::Approved => response.infos.push("ssh pipe approved".to_string()),
        ApprovalOutcome::Rejected(msg) => response.errors.push(msg),
        ApprovalOutcome::Expired => response.errors.push("session expired".to_string()),
    }

    Ok(Json(response))
}

/// Create the web router
pub fn create_router(state: WebState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/pipe/{session}", get(get_session_info))
        .route("/approve/{session}", post(approve))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
