use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::get,
};
use fd_protocol::{
    NodeFilters, SwarmClusterInfo, SwarmNodeInfo, SwarmNodeListResponse, TaskDefinition,
};
use fd_registry::NodeId;
use serde::Deserialize;
use serde_json::Value;

use crate::error::ApiError;
use crate::state::ApiState;
use super::{known_node, run_unit};

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/{id}/swarm/cluster", get(cluster_info))
        .route("/{id}/swarm/nodes", get(list_swarm_nodes))
        .route(
            "/{id}/swarm/nodes/{swarm_node_id}",
            get(inspect_swarm_node)
                .delete(remove_swarm_node)
                .patch(update_swarm_node),
        )
}

async fn cluster_info(
    State(state): State<ApiState>,
    Path(id): Path<NodeId>,
) -> Result<Json<SwarmClusterInfo>, ApiError> {
    let node = known_node(&state, id).await?;
    let reply = state
        .dispatcher
        .call(node, TaskDefinition::SwarmClusterInfo)
        .await?;
    Ok(Json(reply))
}

#[derive(Deserialize)]
struct FilterQuery {
    role: Option<String>,
    status: Option<String>,
    availability: Option<String>,
}

async fn list_swarm_nodes(
    State(state): State<ApiState>,
    Path(id): Path<NodeId>,
    Query(query): Query<FilterQuery>,
) -> Result<Json<SwarmNodeListResponse>, ApiError> {
    let node = known_node(&state, id).await?;
    let filters = NodeFilters::new(query.role, query.status, query.availability);
    let reply = state
        .dispatcher
        .call(node, TaskDefinition::SwarmNodeList { filters })
        .await?;
    Ok(Json(reply))
}

async fn inspect_swarm_node(
    State(state): State<ApiState>,
    Path((id, swarm_node_id)): Path<(NodeId, String)>,
) -> Result<Json<SwarmNodeInfo>, ApiError> {
    let node = known_node(&state, id).await?;
    let reply = state
        .dispatcher
        .call(node, TaskDefinition::SwarmNodeInspect { node_id: swarm_node_id })
        .await?;
    Ok(Json(reply))
}

#[derive(Deserialize)]
struct RemoveQuery {
    #[serde(default)]
    force: bool,
}

async fn remove_swarm_node(
    State(state): State<ApiState>,
    Path((id, swarm_node_id)): Path<(NodeId, String)>,
    Query(query): Query<RemoveQuery>,
) -> Result<Json<Value>, ApiError> {
    let node = known_node(&state, id).await?;
    let task = TaskDefinition::SwarmNodeRemove {
        node_id: swarm_node_id,
        force: query.force,
    };
    run_unit(&state, node, task).await
}

#[derive(Deserialize)]
struct UpdateRequest {
    availability: Option<String>,
    role: Option<String>,
}

async fn update_swarm_node(
    State(state): State<ApiState>,
    Path((id, swarm_node_id)): Path<(NodeId, String)>,
    Json(body): Json<UpdateRequest>,
) -> Result<Json<Value>, ApiError> {
    let node = known_node(&state, id).await?;
    let task = TaskDefinition::SwarmNodeUpdate {
        node_id: swarm_node_id,
        availability: body.availability,
        role: body.role,
    };
    run_unit(&state, node, task).await
}
