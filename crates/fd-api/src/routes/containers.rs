use axum::{
    Json, Router,
    extract::{Path, Query, State},
    response::sse::{KeepAliveStream, Sse},
    routing::get,
};
use fd_protocol::{ContainerListResponse, TaskDefinition};
use fd_registry::NodeId;
use serde::Deserialize;

use crate::error::ApiError;
use crate::state::ApiState;
use super::{EventStream, known_node, task_events};

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/{id}/containers", get(list_containers))
        .route("/{id}/containers/{container_id}/logs", get(container_logs))
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default)]
    all: bool,
}

async fn list_containers(
    State(state): State<ApiState>,
    Path(id): Path<NodeId>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ContainerListResponse>, ApiError> {
    let node = known_node(&state, id).await?;
    let reply = state
        .dispatcher
        .call(node, TaskDefinition::ContainerList { all: query.all })
        .await?;
    Ok(Json(reply))
}

async fn container_logs(
    State(state): State<ApiState>,
    Path((id, container_id)): Path<(NodeId, String)>,
) -> Result<Sse<KeepAliveStream<EventStream>>, ApiError> {
    let node = known_node(&state, id).await?;
    let stream = state
        .dispatcher
        .call_streaming(node, TaskDefinition::ContainerLogs { container_id })
        .await?;
    Ok(task_events(stream))
}
