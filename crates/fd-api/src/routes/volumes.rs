use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{delete, get, post},
};
use fd_protocol::{TaskDefinition, VolumeCreated, VolumeListResponse, VolumeSpec, VolumesPruned};
use fd_registry::NodeId;
use serde::Deserialize;
use serde_json::Value;

use crate::error::ApiError;
use crate::state::ApiState;
use super::{known_node, run_unit};

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/{id}/volumes", get(list_volumes).post(create_volume))
        .route("/{id}/volumes/prune", post(prune_volumes))
        .route("/{id}/volumes/{name}", delete(remove_volume))
}

async fn list_volumes(
    State(state): State<ApiState>,
    Path(id): Path<NodeId>,
) -> Result<Json<VolumeListResponse>, ApiError> {
    let node = known_node(&state, id).await?;
    let reply = state.dispatcher.call(node, TaskDefinition::VolumeList).await?;
    Ok(Json(reply))
}

async fn create_volume(
    State(state): State<ApiState>,
    Path(id): Path<NodeId>,
    Json(spec): Json<VolumeSpec>,
) -> Result<Json<VolumeCreated>, ApiError> {
    spec.validate().map_err(ApiError::BadRequest)?;
    let node = known_node(&state, id).await?;
    let reply = state
        .dispatcher
        .call(node, TaskDefinition::VolumeCreate(spec))
        .await?;
    Ok(Json(reply))
}

async fn remove_volume(
    State(state): State<ApiState>,
    Path((id, name)): Path<(NodeId, String)>,
) -> Result<Json<Value>, ApiError> {
    let node = known_node(&state, id).await?;
    run_unit(&state, node, TaskDefinition::VolumeRemove { name }).await
}

#[derive(Deserialize)]
struct PruneRequest {
    #[serde(default)]
    all: bool,
}

async fn prune_volumes(
    State(state): State<ApiState>,
    Path(id): Path<NodeId>,
    body: Option<Json<PruneRequest>>,
) -> Result<Json<VolumesPruned>, ApiError> {
    let node = known_node(&state, id).await?;
    let all = body.is_some_and(|Json(b)| b.all);
    let reply = state
        .dispatcher
        .call(node, TaskDefinition::VolumesPrune { all })
        .await?;
    Ok(Json(reply))
}
