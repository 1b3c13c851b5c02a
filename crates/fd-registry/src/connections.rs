//! Node connection registry: at most one live session per node.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fd_protocol::Message;
use fd_protocol::keepalive::DEFAULT_LIVENESS_WINDOW;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::DispatchError;
use crate::session::NodeSession;
use crate::types::NodeId;

/// Connection details exposed to the admin API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConnectionInfo {
    pub node_id: NodeId,
    pub agent_version: String,
    pub agent_arch: String,
    pub connected_at: DateTime<Utc>,
    pub idle_secs: u64,
}

pub struct NodeRegistry {
    sessions: RwLock<HashMap<NodeId, Arc<NodeSession>>>,
    /// Silence after which a registered session no longer counts as online.
    liveness_window: Duration,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::with_liveness_window(DEFAULT_LIVENESS_WINDOW)
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_liveness_window(liveness_window: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            liveness_window,
        }
    }

    pub fn liveness_window(&self) -> Duration {
        self.liveness_window
    }

    /// Make `session` the current session for its node. Returns the session it
    /// displaced, if any. The displaced connection is left open; its own read
    /// loop tears it down.
    pub async fn register(&self, session: Arc<NodeSession>) -> Option<Arc<NodeSession>> {
        let node = session.node_id();
        let session_id = session.id();
        let previous = self.sessions.write().await.insert(node, session);
        match &previous {
            Some(old) => info!(
                node = %node,
                session = session_id,
                replaced = old.id(),
                "Node reconnected, replacing previous session"
            ),
            None => info!(node = %node, session = session_id, "Node connected"),
        }
        previous
    }

    pub async fn lookup(&self, node: NodeId) -> Option<Arc<NodeSession>> {
        self.sessions.read().await.get(&node).cloned()
    }

    /// Remove `session` only if it is still the node's current session.
    /// A stale connection shutting down must not evict its replacement.
    pub async fn deregister(&self, session: &NodeSession) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(&session.node_id()) {
            Some(current) if current.id() == session.id() => {
                sessions.remove(&session.node_id());
                info!(node = %session.node_id(), session = session.id(), "Node disconnected");
                true
            }
            _ => {
                debug!(
                    node = %session.node_id(),
                    session = session.id(),
                    "Session already replaced, leaving registry untouched"
                );
                false
            }
        }
    }

    /// Send `msg` over the node's current session and return the session used.
    pub async fn route(
        &self,
        node: NodeId,
        msg: &Message,
    ) -> Result<Arc<NodeSession>, DispatchError> {
        // Lock is released before the write.
        let session = self
            .lookup(node)
            .await
            .ok_or(DispatchError::HostOffline(node))?;
        session
            .send(msg)
            .await
            .map_err(|source| DispatchError::Transport { node, source })?;
        Ok(session)
    }

    /// A node is online while it has a session that heard from its agent
    /// within the liveness window.
    pub async fn is_online(&self, node: NodeId) -> bool {
        self.sessions
            .read()
            .await
            .get(&node)
            .is_some_and(|s| s.is_live(self.liveness_window))
    }

    pub async fn connection_info(&self, node: NodeId) -> Option<NodeConnectionInfo> {
        self.lookup(node).await.as_ref().map(info_of)
    }

    pub async fn list(&self) -> Vec<NodeConnectionInfo> {
        let mut infos: Vec<_> = self.sessions.read().await.values().map(info_of).collect();
        infos.sort_by_key(|i| i.node_id);
        infos
    }
}

fn info_of(session: &Arc<NodeSession>) -> NodeConnectionInfo {
    NodeConnectionInfo {
        node_id: session.node_id(),
        agent_version: session.agent_version().to_string(),
        agent_arch: session.agent_arch().to_string(),
        connected_at: session.connected_at(),
        idle_secs: session.idle_for().as_secs(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::session;
    use fd_protocol::Frame;

    #[tokio::test]
    async fn test_register_replaces_previous() {
        let registry = NodeRegistry::new();
        let (first, _rx1) = session(NodeId(2));
        let (second, _rx2) = session(NodeId(2));

        assert!(registry.register(first.clone()).await.is_none());
        let displaced = registry.register(second.clone()).await.unwrap();
        assert_eq!(displaced.id(), first.id());
        assert_eq!(registry.lookup(NodeId(2)).await.unwrap().id(), second.id());
    }

    #[tokio::test]
    async fn test_stale_deregister_keeps_replacement() {
        let registry = NodeRegistry::new();
        let (first, _rx1) = session(NodeId(2));
        let (second, _rx2) = session(NodeId(2));
        registry.register(first.clone()).await;
        registry.register(second.clone()).await;

        assert!(!registry.deregister(&first).await);
        assert!(registry.is_online(NodeId(2)).await);

        assert!(registry.deregister(&second).await);
        assert!(!registry.is_online(NodeId(2)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_session_reports_offline() {
        let registry = NodeRegistry::with_liveness_window(Duration::from_secs(10));
        let (s, _rx) = session(NodeId(6));
        registry.register(s.clone()).await;
        assert!(registry.is_online(NodeId(6)).await);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(registry.lookup(NodeId(6)).await.is_some());
        assert!(!registry.is_online(NodeId(6)).await);

        s.touch();
        assert!(registry.is_online(NodeId(6)).await);
    }

    #[tokio::test]
    async fn test_route_to_offline_node() {
        let registry = NodeRegistry::new();
        let err = registry.route(NodeId(5), &Message::Ping).await.unwrap_err();
        assert!(matches!(err, DispatchError::HostOffline(NodeId(5))));
    }

    #[tokio::test]
    async fn test_route_writes_through_current_session() {
        let registry = NodeRegistry::new();
        let (s, mut rx) = session(NodeId(3));
        registry.register(s).await;

        registry.route(NodeId(3), &Message::Ping).await.unwrap();
        assert_eq!(rx.recv().await, Some(Frame::Text(r#"{"type":"ping"}"#.into())));

        let listed = registry.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].agent_version, "0.1.0-amd64");
    }

    #[tokio::test]
    async fn test_route_reports_dead_transport() {
        let registry = NodeRegistry::new();
        let (s, rx) = session(NodeId(4));
        drop(rx);
        registry.register(s).await;

        let err = registry.route(NodeId(4), &Message::Ping).await.unwrap_err();
        assert!(matches!(err, DispatchError::Transport { node: NodeId(4), .. }));
    }
}
