//! JSON query API over the collector, plus registry admin routes and the event feed.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::collections::HashMap;
use tracing::warn;

use crate::state::AppState;
use crate::store::StoreError;
use crate::types::NodeId;
use crate::ws::ws_handler;

/// Persisted rows returned by `/stored`.
pub const STORED_ROWS_LIMIT: usize = 100;

#[derive(Debug, Serialize)]
pub struct NodeScore {
    pub node_id: NodeId,
    pub score: f64,
}

#[derive(Debug, Serialize)]
pub struct AdminResult {
    pub node_id: NodeId,
    pub changed: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/nodes", get(list_nodes))
        .route("/api/nodes/:id/latest", get(latest))
        .route("/api/nodes/:id/aggregate", get(aggregate))
        .route("/api/nodes/:id/score", get(score))
        .route("/api/nodes/:id/history", get(history))
        .route("/api/nodes/:id/stored", get(stored))
        .route("/api/nodes/:id/approve", post(approve))
        .route("/api/nodes/:id/deactivate", post(deactivate))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn list_nodes(State(state): State<AppState>) -> Json<Vec<NodeScore>> {
    let ranked = state
        .collector
        .rankings()
        .into_iter()
        .map(|(node_id, score)| NodeScore { node_id, score })
        .collect();
    Json(ranked)
}

async fn latest(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.collector.latest_sample(&NodeId::from(id)) {
        Some(s) => Json(s).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn aggregate(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.collector.aggregate(&NodeId::from(id)) {
        Some(a) => Json(a).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn score(State(state): State<AppState>, Path(id): Path<String>) -> Json<NodeScore> {
    let node_id = NodeId::from(id);
    let score = state.collector.composite_score(&node_id);
    Json(NodeScore { node_id, score })
}

async fn history(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.collector.samples(&NodeId::from(id)) {
        Some(v) => Json(v).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn stored(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let node = NodeId::from(id);
    match state.store.recent_samples(&node, STORED_ROWS_LIMIT).await {
        Ok(rows) => Json(rows).into_response(),
        Err(StoreError::UnknownNode(_)) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!(%node, "failed to read stored metrics: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn approve(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    if !state.authorized(q.get("token").map(String::as_str)) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let node_id = NodeId::from(id);
    let changed = state.registry.approve(node_id.clone());
    Json(AdminResult { node_id, changed }).into_response()
}

async fn deactivate(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    if !state.authorized(q.get("token").map(String::as_str)) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let node_id = NodeId::from(id);
    let changed = state.registry.deactivate(&node_id);
    Json(AdminResult { node_id, changed }).into_response()
}
