use axum::{Json, Router, extract::State, routing::get};
use serde_json::{Value, json};

use crate::state::ApiState;

pub fn router() -> Router<ApiState> {
    Router::new().route("/health", get(health))
}

async fn health(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "connectedNodes": state.registry().list().await.len(),
        "inFlightTasks": state.tasks().in_flight(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}
