use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fd_protocol::{Handshake, Message, TransportError, WriteGate};
use tokio::time::Instant;

use crate::types::NodeId;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// A live, authenticated agent connection.
///
/// Each session gets a process-unique id so that a connection being torn down
/// can tell whether the registry still points at it or at its replacement.
pub struct NodeSession {
    id: u64,
    node_id: NodeId,
    agent_version: String,
    agent_arch: String,
    connected_at: DateTime<Utc>,
    gate: WriteGate,
    last_seen: Mutex<Instant>,
}

impl std::fmt::Debug for NodeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSession")
            .field("id", &self.id)
            .field("node_id", &self.node_id)
            .field("agent_version", &self.agent_version)
            .field("agent_arch", &self.agent_arch)
            .field("connected_at", &self.connected_at)
            .finish_non_exhaustive()
    }
}

impl NodeSession {
    pub fn new(node_id: NodeId, handshake: &Handshake, gate: WriteGate) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            node_id,
            agent_version: handshake.agent_version.clone(),
            agent_arch: handshake.agent_arch.clone(),
            connected_at: Utc::now(),
            gate,
            last_seen: Mutex::new(Instant::now()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn agent_version(&self) -> &str {
        &self.agent_version
    }

    pub fn agent_arch(&self) -> &str {
        &self.agent_arch
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn gate(&self) -> &WriteGate {
        &self.gate
    }

    pub async fn send(&self, msg: &Message) -> Result<(), TransportError> {
        self.gate.send(msg).await
    }

    /// Record inbound traffic (any frame counts, pings included).
    pub fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    pub fn is_live(&self, window: Duration) -> bool {
        self.idle_for() <= window
    }
}
