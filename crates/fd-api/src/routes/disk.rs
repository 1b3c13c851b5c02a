use axum::{
    Json, Router,
    extract::{Path, State},
    routing::get,
};
use fd_protocol::{DiskUsageSummary, TaskDefinition};
use fd_registry::NodeId;

use crate::error::ApiError;
use crate::state::ApiState;
use super::known_node;

pub fn router() -> Router<ApiState> {
    Router::new().route("/{id}/disk", get(disk_usage))
}

async fn disk_usage(
    State(state): State<ApiState>,
    Path(id): Path<NodeId>,
) -> Result<Json<DiskUsageSummary>, ApiError> {
    let node = known_node(&state, id).await?;
    let reply = state.dispatcher.call(node, TaskDefinition::DiskUsage).await?;
    Ok(Json(reply))
}
