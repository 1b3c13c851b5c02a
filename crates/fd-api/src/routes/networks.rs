use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{delete, get, post},
};
use fd_protocol::{NetworkCreated, NetworkListResponse, NetworkSpec, NetworksPruned, TaskDefinition};
use fd_registry::NodeId;
use serde_json::Value;

use crate::error::ApiError;
use crate::state::ApiState;
use super::{known_node, run_unit};

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/{id}/networks", get(list_networks).post(create_network))
        .route("/{id}/networks/prune", post(prune_networks))
        .route("/{id}/networks/{network_id}", delete(remove_network))
}

async fn list_networks(
    State(state): State<ApiState>,
    Path(id): Path<NodeId>,
) -> Result<Json<NetworkListResponse>, ApiError> {
    let node = known_node(&state, id).await?;
    let reply = state.dispatcher.call(node, TaskDefinition::NetworkList).await?;
    Ok(Json(reply))
}

async fn create_network(
    State(state): State<ApiState>,
    Path(id): Path<NodeId>,
    Json(spec): Json<NetworkSpec>,
) -> Result<Json<NetworkCreated>, ApiError> {
    spec.validate().map_err(ApiError::BadRequest)?;
    let node = known_node(&state, id).await?;
    let reply = state
        .dispatcher
        .call(node, TaskDefinition::NetworkCreate(spec))
        .await?;
    Ok(Json(reply))
}

async fn remove_network(
    State(state): State<ApiState>,
    Path((id, network_id)): Path<(NodeId, String)>,
) -> Result<Json<Value>, ApiError> {
    let node = known_node(&state, id).await?;
    run_unit(&state, node, TaskDefinition::NetworkRemove { network_id }).await
}

async fn prune_networks(
    State(state): State<ApiState>,
    Path(id): Path<NodeId>,
) -> Result<Json<NetworksPruned>, ApiError> {
    let node = known_node(&state, id).await?;
    let reply = state.dispatcher.call(node, TaskDefinition::NetworksPrune).await?;
    Ok(Json(reply))
}
