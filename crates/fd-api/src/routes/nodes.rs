use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use fd_registry::{NodeConnectionInfo, NodeId, NodeRecord};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use crate::error::ApiError;
use crate::state::ApiState;
use super::known_node;

pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/", get(list_nodes).post(create_node))
        .route("/{id}", get(get_node).delete(delete_node))
        .route("/{id}/token", post(regenerate_token))
}

/// A node as the admin API shows it. The token hash never leaves the store.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NodeView {
    id: NodeId,
    name: String,
    agent_version: Option<String>,
    last_handshake: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    online: bool,
    connection: Option<NodeConnectionInfo>,
}

async fn view(state: &ApiState, record: NodeRecord) -> NodeView {
    let connection = state.registry().connection_info(record.id).await;
    NodeView {
        online: state.dispatcher.is_online(record.id).await,
        id: record.id,
        name: record.name,
        agent_version: record.agent_version,
        last_handshake: record.last_handshake,
        created_at: record.created_at,
        connection,
    }
}

async fn list_nodes(State(state): State<ApiState>) -> Json<Value> {
    let mut nodes = Vec::new();
    for record in state.store.list().await {
        nodes.push(view(&state, record).await);
    }
    Json(json!({ "success": true, "nodes": nodes }))
}

async fn get_node(
    State(state): State<ApiState>,
    Path(id): Path<NodeId>,
) -> Result<Json<Value>, ApiError> {
    let record = state.store.get(id).await.ok_or(ApiError::NodeNotFound(id))?;
    Ok(Json(json!({ "success": true, "node": view(&state, record).await })))
}

#[derive(Deserialize)]
struct CreateNodeRequest {
    name: String,
}

async fn create_node(
    State(state): State<ApiState>,
    Json(body): Json<CreateNodeRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let name = body.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("Node name is required".to_string()));
    }
    let (record, token) = state.store.create(name).await?;
    let node = view(&state, record).await;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "node": node, "token": token })),
    ))
}

async fn delete_node(
    State(state): State<ApiState>,
    Path(id): Path<NodeId>,
) -> Result<Json<Value>, ApiError> {
    if id.is_server_self() {
        return Err(ApiError::BadRequest("The server node cannot be removed".to_string()));
    }
    if !state.store.remove(id).await? {
        return Err(ApiError::NodeNotFound(id));
    }
    if let Some(session) = state.registry().lookup(id).await {
        info!(node = %id, "Closing connection of removed node");
        let _ = session.gate().close().await;
    }
    Ok(Json(json!({ "success": true })))
}

async fn regenerate_token(
    State(state): State<ApiState>,
    Path(id): Path<NodeId>,
) -> Result<Json<Value>, ApiError> {
    let id = known_node(&state, id).await?;
    if id.is_server_self() {
        return Err(ApiError::BadRequest("The server node has no token".to_string()));
    }
    let token = state
        .store
        .regenerate_token(id)
        .await?
        .ok_or(ApiError::NodeNotFound(id))?;
    Ok(Json(json!({ "success": true, "token": token })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fd_common::config::EnvConfig;
    use fd_protocol::{ProgressSink, TaskDefinition, TaskHandler, TaskOutcome};
    use fd_registry::{DispatchTimeouts, Dispatcher, NodeRegistry, NodeStore, TaskTable};
    use futures_util::future::BoxFuture;
    use std::sync::Arc;

    struct NoopHandler;

    impl TaskHandler for NoopHandler {
        fn execute(&self, _: TaskDefinition, _: ProgressSink) -> BoxFuture<'_, TaskOutcome> {
            Box::pin(async { TaskOutcome::success(None) })
        }
    }

    fn state(dir: &tempfile::TempDir) -> ApiState {
        let store = Arc::new(NodeStore::new(dir.path().join("nodes.json")));
        let tasks = TaskTable::new(Arc::new(NodeRegistry::new()));
        let dispatcher = Dispatcher::new(tasks, Arc::new(NoopHandler), DispatchTimeouts::default());
        let auth = fd_auth::AuthService::new(dir.path()).unwrap();
        ApiState::new(Arc::new(EnvConfig::default()), store, dispatcher, auth)
    }

    #[tokio::test]
    async fn test_create_returns_token_but_never_hash() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let (status, Json(body)) = create_node(
            State(state.clone()),
            Json(CreateNodeRequest {
                name: "edge-1".into(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["token"].as_str().unwrap().len(), 64);
        assert_eq!(body["node"]["online"], false);
        assert!(body["node"].get("tokenHash").is_none());

        let Json(list) = list_nodes(State(state)).await;
        let nodes = list["nodes"].as_array().unwrap();
        assert_eq!(nodes.len(), 2);
        // The server node is always reachable.
        assert_eq!(nodes[0]["id"], 1);
        assert_eq!(nodes[0]["online"], true);
    }

    #[tokio::test]
    async fn test_server_node_is_protected() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let err = delete_node(State(state.clone()), Path(NodeId::SERVER)).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        let err = regenerate_token(State(state), Path(NodeId::SERVER)).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_node() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let err = get_node(State(state.clone()), Path(NodeId(42))).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        let err = delete_node(State(state), Path(NodeId(42))).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_blank_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = create_node(
            State(state(&dir)),
            Json(CreateNodeRequest { name: "  ".into() }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
}
