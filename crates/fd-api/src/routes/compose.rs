use std::collections::BTreeMap;

use axum::{
    Json, Router,
    extract::{Path, State},
    response::sse::{KeepAliveStream, Sse},
    routing::post,
};
use fd_protocol::{ComposeProject, TaskDefinition, VariableValue};
use fd_registry::NodeId;
use serde::Deserialize;

use crate::error::ApiError;
use crate::state::ApiState;
use super::{EventStream, known_node, task_events};

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/{id}/compose/{project}/deploy", post(deploy))
        .route("/{id}/compose/{project}/pull", post(pull))
        .route("/{id}/compose/{project}/up", post(up))
        .route("/{id}/compose/{project}/down", post(down))
}

#[derive(Deserialize)]
struct ComposeRequest {
    definition: String,
    #[serde(default)]
    variables: BTreeMap<String, VariableValue>,
}

impl ComposeRequest {
    fn into_project(self, project_name: String) -> Result<ComposeProject, ApiError> {
        if self.definition.trim().is_empty() {
            return Err(ApiError::BadRequest("Compose definition is required".to_string()));
        }
        Ok(ComposeProject {
            project_name,
            definition: self.definition,
            variables: self.variables,
        })
    }
}

type TaskEvents = Sse<KeepAliveStream<EventStream>>;

async fn deploy(
    State(state): State<ApiState>,
    Path((id, project)): Path<(NodeId, String)>,
    Json(body): Json<ComposeRequest>,
) -> Result<TaskEvents, ApiError> {
    let task = TaskDefinition::ComposeDeploy(body.into_project(project)?);
    run(&state, id, task).await
}

async fn pull(
    State(state): State<ApiState>,
    Path((id, project)): Path<(NodeId, String)>,
    Json(body): Json<ComposeRequest>,
) -> Result<TaskEvents, ApiError> {
    let task = TaskDefinition::ComposePull(body.into_project(project)?);
    run(&state, id, task).await
}

async fn up(
    State(state): State<ApiState>,
    Path((id, project)): Path<(NodeId, String)>,
    Json(body): Json<ComposeRequest>,
) -> Result<TaskEvents, ApiError> {
    let task = TaskDefinition::ComposeUp(body.into_project(project)?);
    run(&state, id, task).await
}

async fn down(
    State(state): State<ApiState>,
    Path((id, project)): Path<(NodeId, String)>,
) -> Result<TaskEvents, ApiError> {
    run(&state, id, TaskDefinition::ComposeDown { project_name: project }).await
}

async fn run(state: &ApiState, id: NodeId, task: TaskDefinition) -> Result<TaskEvents, ApiError> {
    let node = known_node(state, id).await?;
    let stream = state.dispatcher.call_streaming(node, task).await?;
    Ok(task_events(stream))
}
