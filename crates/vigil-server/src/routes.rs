//! HTTP Surface
//!
//! Router assembly for the signaling, stream management, alert channel and
//! observability endpoints. CORS is permissive in development and restricted
//! to the configured origin list in production.

use std::sync::Arc;

use ab_glyph::FontArc;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::json;
use sqlx::SqlitePool;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;
use vigil_core::processor::EvidenceRecorder;
use vigil_core::Inference;

use crate::auth;
use crate::config::{Environment, ServerConfig};
use crate::error::ServiceError;
use crate::hub::{AlertHub, ChannelStats};
use crate::metrics;
use crate::registry::{StreamRegistry, StreamSummary};
use crate::signaling;
use crate::ws;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub pool: SqlitePool,
    pub hub: Arc<AlertHub>,
    pub registry: Arc<StreamRegistry>,
    pub inference: Arc<dyn Inference>,
    pub recorder: Arc<dyn EvidenceRecorder>,
    pub font: Option<FontArc>,
}

pub fn router(state: AppState) -> Router {
    let cors = match state.config.environment {
        Environment::Development => CorsLayer::permissive(),
        Environment::Production => {
            let origins: Vec<HeaderValue> = state
                .config
                .allowed_origins
                .iter()
                .filter_map(|origin| origin.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    };

    Router::new()
        .route("/offer", post(signaling::handle_offer))
        .route("/users/{user_id}/streams", get(list_streams))
        .route(
            "/users/{user_id}/streams/{stream_id}",
            delete(delete_stream),
        )
        .route("/users/{user_id}", delete(delete_user_streams))
        .route("/ws/alerts/{user_id}", get(ws::alerts_ws))
        .route("/ws/connections", get(ws_connections))
        .route("/ws/connections/{user_id}", get(ws_connections_user))
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// The path user must be the caller for every stream management endpoint
fn require_self(
    state: &AppState,
    headers: &HeaderMap,
    user_id: Uuid,
) -> Result<(), ServiceError> {
    let auth = auth::authenticate(&state.config.jwt_secret, headers)?;
    if auth.user_id != user_id {
        return Err(ServiceError::Forbidden);
    }
    Ok(())
}

async fn list_streams(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<Vec<StreamSummary>>, ServiceError> {
    require_self(&state, &headers, user_id)?;
    Ok(Json(state.registry.list(user_id)))
}

async fn delete_stream(
    State(state): State<AppState>,
    Path((user_id, stream_id)): Path<(Uuid, Uuid)>,
    headers: HeaderMap,
) -> Result<StatusCode, ServiceError> {
    require_self(&state, &headers, user_id)?;

    let owned = state
        .registry
        .get(stream_id)
        .is_some_and(|handle| handle.user_id == user_id);
    if !owned {
        return Err(ServiceError::NotFound("stream"));
    }
    if let Some(handle) = state.registry.remove(stream_id) {
        handle.teardown().await;
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_user_streams(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<StatusCode, ServiceError> {
    require_self(&state, &headers, user_id)?;
    for handle in state.registry.remove_all(user_id) {
        handle.teardown().await;
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn ws_connections(State(state): State<AppState>) -> Json<Vec<ChannelStats>> {
    Json(state.hub.stats_all())
}

async fn ws_connections_user(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<ChannelStats>, ServiceError> {
    state
        .hub
        .stats(user_id)
        .map(Json)
        .ok_or(ServiceError::NotFound("connection"))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "vigil",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn metrics_text() -> String {
    metrics::render()
}
