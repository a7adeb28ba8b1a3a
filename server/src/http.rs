//! Read-only HTTP surface for health checks and stats
//!
//! Handlers never touch the game loop: the loop periodically publishes an
//! [`ApiSnapshot`] read-model and every request is answered from that. A
//! slow or hostile HTTP client therefore cannot delay a tick.

use crate::session::LeaderboardEntry;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use log::info;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Per-player stats row for `/api/player/:id`.
#[derive(Debug, Clone, Serialize)]
pub struct PlayerStats {
    pub id: u32,
    pub username: String,
    pub score: u32,
    pub rating: i32,
    pub tier: String,
    pub latency: u64,
    pub matches: u32,
    pub wins: u32,
    pub losses: u32,
}

/// Snapshot of server state published by the game loop once a second.
#[derive(Debug, Default)]
pub struct ApiSnapshot {
    pub players: usize,
    pub rooms: usize,
    pub queued: usize,
    pub timestamp: u64,
    pub leaderboard: Vec<LeaderboardEntry>,
    pub player_stats: HashMap<u32, PlayerStats>,
}

pub type ApiState = Arc<RwLock<ApiSnapshot>>;

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/leaderboard", get(leaderboard))
        .route("/api/player/:id", get(player))
        .with_state(state)
}

/// Binds and serves until the process exits.
pub async fn serve(addr: SocketAddr, state: ApiState) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP surface listening on {}", addr);
    axum::serve(listener, router(state)).await
}

async fn health(State(state): State<ApiState>) -> Json<Value> {
    let snapshot = state.read().await;
    Json(json!({
        "status": "ok",
        "players": snapshot.players,
        "rooms": snapshot.rooms,
        "queued": snapshot.queued,
        "timestamp": snapshot.timestamp,
    }))
}

async fn leaderboard(State(state): State<ApiState>) -> Json<Vec<LeaderboardEntry>> {
    Json(state.read().await.leaderboard.clone())
}

async fn player(
    Path(id): Path<u32>,
    State(state): State<ApiState>,
) -> Result<Json<PlayerStats>, StatusCode> {
    state
        .read()
        .await
        .player_stats
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}
