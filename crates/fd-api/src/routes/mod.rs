pub mod agent_ws;
pub mod compose;
pub mod containers;
pub mod disk;
pub mod health;
pub mod networks;
pub mod nodes;
pub mod swarm;
pub mod users;
pub mod volumes;

use std::convert::Infallible;
use std::pin::Pin;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use axum::Json;
use fd_protocol::TaskDefinition;
use fd_registry::{NodeId, StreamEvent, TaskStream, dispatch::parse_outcome};
use serde_json::{Value, json};
use tokio_stream::{Stream, StreamExt};

use crate::error::ApiError;
use crate::state::ApiState;

/// Fail with 404 unless `node` is a known node.
async fn known_node(state: &ApiState, node: NodeId) -> Result<NodeId, ApiError> {
    match state.store.get(node).await {
        Some(_) => Ok(node),
        None => Err(ApiError::NodeNotFound(node)),
    }
}

/// Run a task whose success carries no body.
async fn run_unit(
    state: &ApiState,
    node: NodeId,
    task: TaskDefinition,
) -> Result<Json<Value>, ApiError> {
    let outcome = state.dispatcher.call_once(node, task).await?;
    parse_outcome::<Value>(outcome)?;
    Ok(Json(json!({ "success": true })))
}

type EventStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

/// Relay a streaming task as server-sent events: `log` per progress line,
/// then one `status` or `error` event.
fn task_events(stream: TaskStream) -> Sse<KeepAliveStream<EventStream>> {
    let events: EventStream = Box::pin(stream.into_stream().map(|event| Ok(to_event(event))));
    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}

fn to_event(event: StreamEvent) -> Event {
    match event {
        StreamEvent::Progress(p) => Event::default()
            .event("log")
            .id(p.offset.to_string())
            .data(json!({ "level": p.level, "text": p.text, "offset": p.offset }).to_string()),
        StreamEvent::Finished(outcome) => Event::default().event("status").data(
            json!({
                "success": outcome.is_success(),
                "status": outcome.status,
                "result": outcome.result,
            })
            .to_string(),
        ),
        StreamEvent::Failed(e) => Event::default()
            .event("error")
            .data(json!({ "success": false, "error": e.to_string() }).to_string()),
    }
}
