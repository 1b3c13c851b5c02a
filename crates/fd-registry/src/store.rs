//! Persisted node records and agent token authentication.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::types::NodeId;

const SERVER_NODE_NAME: &str = "[Fleetdock Server]";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub id: NodeId,
    pub name: String,
    /// Argon2 hash of the agent token. The server node has none.
    #[serde(default)]
    pub token_hash: Option<String>,
    #[serde(default)]
    pub agent_version: Option<String>,
    #[serde(default)]
    pub last_handshake: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    nodes: Vec<NodeRecord>,
}

/// On-disk record of the nodes the server manages.
pub struct NodeStore {
    state: RwLock<StoreState>,
    path: PathBuf,
}

impl NodeStore {
    /// Load the store from `path`, starting fresh if it is missing or unreadable.
    /// The server's own node is always present.
    pub fn new(path: PathBuf) -> Self {
        let mut state = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("Failed to parse node store, starting fresh: {e}");
                StoreState::default()
            }),
            Err(_) => StoreState::default(),
        };

        if !state.nodes.iter().any(|n| n.id.is_server_self()) {
            state.nodes.insert(
                0,
                NodeRecord {
                    id: NodeId::SERVER,
                    name: SERVER_NODE_NAME.to_string(),
                    token_hash: None,
                    agent_version: None,
                    last_handshake: None,
                    created_at: Utc::now(),
                },
            );
        }

        info!(nodes = state.nodes.len(), "Loaded node store");

        Self {
            state: RwLock::new(state),
            path,
        }
    }

    pub async fn list(&self) -> Vec<NodeRecord> {
        self.state.read().await.nodes.clone()
    }

    pub async fn get(&self, id: NodeId) -> Option<NodeRecord> {
        self.state.read().await.nodes.iter().find(|n| n.id == id).cloned()
    }

    /// Create a node and return it with its plaintext token. The token is
    /// shown once; only its hash is kept.
    pub async fn create(&self, name: &str) -> Result<(NodeRecord, String)> {
        let token = generate_token();
        let token_hash = hash_token_blocking(token.clone()).await?;

        let mut state = self.state.write().await;
        let next_id = state.nodes.iter().map(|n| n.id.0).max().unwrap_or(1) + 1;
        let record = NodeRecord {
            id: NodeId(next_id),
            name: name.to_string(),
            token_hash: Some(token_hash),
            agent_version: None,
            last_handshake: None,
            created_at: Utc::now(),
        };
        state.nodes.push(record.clone());
        self.persist_inner(&state).await?;

        info!(node = %record.id, name, "Node created");
        Ok((record, token))
    }

    pub async fn remove(&self, id: NodeId) -> Result<bool> {
        if id.is_server_self() {
            anyhow::bail!("The server node cannot be removed");
        }
        let mut state = self.state.write().await;
        let before = state.nodes.len();
        state.nodes.retain(|n| n.id != id);
        if state.nodes.len() == before {
            return Ok(false);
        }
        self.persist_inner(&state).await?;
        info!(node = %id, "Node removed");
        Ok(true)
    }

    /// Replace a node's token, invalidating the old one.
    pub async fn regenerate_token(&self, id: NodeId) -> Result<Option<String>> {
        if id.is_server_self() {
            return Ok(None);
        }
        let token = generate_token();
        let token_hash = hash_token_blocking(token.clone()).await?;

        let mut state = self.state.write().await;
        let Some(node) = state.nodes.iter_mut().find(|n| n.id == id) else {
            return Ok(None);
        };
        node.token_hash = Some(token_hash);
        self.persist_inner(&state).await?;
        info!(node = %id, "Token regenerated");
        Ok(Some(token))
    }

    /// Resolve a connection token to the node it belongs to. Hash checks run
    /// on the blocking pool.
    pub async fn authenticate(&self, token: &str) -> Option<NodeId> {
        let hashes: Vec<(NodeId, String)> = {
            let state = self.state.read().await;
            state
                .nodes
                .iter()
                .filter_map(|n| n.token_hash.clone().map(|h| (n.id, h)))
                .collect()
        };
        if hashes.is_empty() {
            return None;
        }
        let token = token.to_string();
        let verified = tokio::task::spawn_blocking(move || {
            hashes
                .into_iter()
                .find(|(_, hash)| verify_token(&token, hash))
                .map(|(id, _)| id)
        })
        .await;
        match verified {
            Ok(node) => node,
            Err(e) => {
                warn!("Token verification task failed: {e}");
                None
            }
        }
    }

    /// Remember the version an agent reported at handshake.
    pub async fn record_handshake(&self, id: NodeId, agent_version: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let Some(node) = state.nodes.iter_mut().find(|n| n.id == id) else {
            return Ok(());
        };
        node.agent_version = Some(agent_version.to_string());
        node.last_handshake = Some(Utc::now());
        self.persist_inner(&state).await
    }

    async fn persist_inner(&self, state: &StoreState) -> Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

// ── Token helpers ───────────────────────────────────────────────

fn generate_token() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

fn hash_token(token: &str) -> Result<String> {
    use argon2::password_hash::SaltString;
    use argon2::{Argon2, PasswordHasher};
    use rand_core::OsRng;

    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(token.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("hash failed: {e}"))?;
    Ok(hash.to_string())
}

async fn hash_token_blocking(token: String) -> Result<String> {
    tokio::task::spawn_blocking(move || hash_token(&token))
        .await
        .context("Token hashing task failed")?
}

fn verify_token(token: &str, hash: &str) -> bool {
    use argon2::password_hash::PasswordHash;
    use argon2::{Argon2, PasswordVerifier};

    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(token.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_roundtrip() {
        let token = generate_token();
        assert_eq!(token.len(), 64);
        let hash = hash_token(&token).unwrap();
        assert!(verify_token(&token, &hash));
        assert!(!verify_token("wrong", &hash));
    }

    #[tokio::test]
    async fn test_server_node_seeded() {
        let dir = tempfile::tempdir().unwrap();
        let store = NodeStore::new(dir.path().join("nodes.json"));
        let nodes = store.list().await;
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].id.is_server_self());
        assert!(store.remove(NodeId::SERVER).await.is_err());
    }

    #[tokio::test]
    async fn test_create_authenticate_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");

        let store = NodeStore::new(path.clone());
        let (record, token) = store.create("edge-1").await.unwrap();
        assert_eq!(record.id, NodeId(2));
        assert_eq!(store.authenticate(&token).await, Some(NodeId(2)));
        assert_eq!(store.authenticate("bogus").await, None);

        store.record_handshake(NodeId(2), "0.1.0-arm64").await.unwrap();

        let reloaded = NodeStore::new(path);
        let node = reloaded.get(NodeId(2)).await.unwrap();
        assert_eq!(node.agent_version.as_deref(), Some("0.1.0-arm64"));
        assert!(node.last_handshake.is_some());
        assert_eq!(reloaded.authenticate(&token).await, Some(NodeId(2)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_authenticate_leaves_executor_free() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let dir = tempfile::tempdir().unwrap();
        let store = NodeStore::new(dir.path().join("nodes.json"));
        for name in ["edge-1", "edge-2", "edge-3"] {
            store.create(name).await.unwrap();
        }

        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let ticks = ticks.clone();
            tokio::spawn(async move {
                loop {
                    ticks.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                }
            })
        };

        assert_eq!(store.authenticate("not-a-token").await, None);
        assert!(ticks.load(Ordering::SeqCst) > 0, "executor was blocked during verification");
        ticker.abort();
    }

    #[tokio::test]
    async fn test_regenerated_token_replaces_old() {
        let dir = tempfile::tempdir().unwrap();
        let store = NodeStore::new(dir.path().join("nodes.json"));
        let (_, old) = store.create("edge-1").await.unwrap();
        let new = store.regenerate_token(NodeId(2)).await.unwrap().unwrap();

        assert_eq!(store.authenticate(&new).await, Some(NodeId(2)));
        assert_eq!(store.authenticate(&old).await, None);
        assert!(store.remove(NodeId(2)).await.unwrap());
        assert!(!store.remove(NodeId(2)).await.unwrap());
    }
}
