//! Cache RPC surface.
//!
//! One compatibility-bearing operation, `UpdateCache`, plus eviction and a
//! health probe. Handlers are thin: input validation, upload assembly, and
//! the registry swap all live in `rollout_cache_core`; tree construction is
//! CPU-bound and runs on the blocking pool so concurrent uploads do not
//! stall the async executor.

pub mod error;
pub mod types;

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use rollout_cache_core::RolloutStore;

use error::ApiError;
use types::{
    EvictCacheRequest, EvictCacheResponse, HealthResponse, UpdateCacheRequest,
    UpdateCacheResponse,
};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<RolloutStore>,
}

impl AppState {
    pub fn new(store: Arc<RolloutStore>) -> Self {
        Self { store }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/cache/update", post(update_cache))
        .route("/v1/cache/evict", post(evict_cache))
        .route("/health", get(health))
        .with_state(state)
}

/// Build a tree from the uploaded rollout and swap it into the registry.
async fn update_cache(
    State(state): State<AppState>,
    Json(request): Json<UpdateCacheRequest>,
) -> Result<Json<UpdateCacheResponse>, ApiError> {
    let store = state.store.clone();
    let result = tokio::task::spawn_blocking(move || {
        let responses: Vec<Vec<i32>> = request
            .responses
            .into_iter()
            .map(|list| list.tokens)
            .collect();
        store.upload(request.prompt_hash, &request.prompt.tokens, &responses)
    })
    .await
    .map_err(|e| ApiError::Internal(format!("upload task failed: {e}")))?;

    result?;
    Ok(Json(UpdateCacheResponse { success: true }))
}

/// Drop the tree registered for a fingerprint.
async fn evict_cache(
    State(state): State<AppState>,
    Json(request): Json<EvictCacheRequest>,
) -> Result<Json<EvictCacheResponse>, ApiError> {
    let store = state.store.clone();
    let removed = tokio::task::spawn_blocking(move || store.evict(request.prompt_hash))
        .await
        .map_err(|e| ApiError::Internal(format!("evict task failed: {e}")))?;
    Ok(Json(EvictCacheResponse { success: removed }))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.store.stats();
    Json(HealthResponse {
        status: "ok".to_string(),
        trees: stats.trees,
        arena_used_bytes: stats.arena_used_bytes,
        arena_capacity_bytes: stats.arena_capacity_bytes,
    })
}
