use std::time::Duration;

use fd_protocol::TransportError;
use thiserror::Error;

use crate::types::NodeId;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Node {0} is offline")]
    HostOffline(NodeId),

    #[error("Task {task_id} timed out after {after:?}")]
    TaskTimeout { task_id: String, after: Duration },

    #[error("Connection to node {0} lost")]
    ConnectionLost(NodeId),

    #[error("Task {0} is already in flight")]
    DuplicateTask(String),

    #[error("Failed to send task to node {node}: {source}")]
    Transport {
        node: NodeId,
        #[source]
        source: TransportError,
    },

    #[error("Task {0} ended without a terminal status")]
    StreamIncomplete(String),

    /// The task ran and reported failure.
    #[error("{0}")]
    TaskFailed(String),

    #[error("Invalid task reply: {0}")]
    InvalidReply(String),

    #[error("Failed to encode task: {0}")]
    Encode(String),
}
