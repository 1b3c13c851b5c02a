//! Task payloads carried inside [`crate::TaskQueued`] and the replies they produce.
//!
//! The transport never looks inside these; only the task handler on the
//! executing side and the API layer on the calling side do.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::resource::{NetworkSpec, VolumeSpec};

// ── Requests ────────────────────────────────────────────────────

/// What a task asks the executing host to do. The `kind` tag is decided once
/// here; the body is parsed only as the shape that tag implies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "kind",
    content = "body",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum TaskDefinition {
    SwarmNodeList {
        #[serde(default)]
        filters: NodeFilters,
    },
    SwarmNodeInspect {
        node_id: String,
    },
    SwarmNodeRemove {
        node_id: String,
        #[serde(default)]
        force: bool,
    },
    SwarmNodeUpdate {
        node_id: String,
        #[serde(default)]
        availability: Option<String>,
        #[serde(default)]
        role: Option<String>,
    },
    ContainerList {
        #[serde(default)]
        all: bool,
    },
    ContainerLogs {
        container_id: String,
    },
    ComposeDeploy(ComposeProject),
    ComposePull(ComposeProject),
    ComposeUp(ComposeProject),
    ComposeDown {
        project_name: String,
    },
    NetworkCreate(NetworkSpec),
    NetworkList,
    NetworkRemove {
        network_id: String,
    },
    NetworksPrune,
    VolumeCreate(VolumeSpec),
    VolumeList,
    VolumeRemove {
        name: String,
    },
    VolumesPrune {
        /// Also remove named volumes, not just anonymous ones.
        #[serde(default)]
        all: bool,
    },
    DiskUsage,
    SwarmClusterInfo,
}

impl TaskDefinition {
    /// Streaming tasks emit progress lines before their terminal status.
    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            Self::ContainerLogs { .. }
                | Self::ComposeDeploy(_)
                | Self::ComposePull(_)
                | Self::ComposeUp(_)
                | Self::ComposeDown { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SwarmNodeList { .. } => "swarm_node_list",
            Self::SwarmNodeInspect { .. } => "swarm_node_inspect",
            Self::SwarmNodeRemove { .. } => "swarm_node_remove",
            Self::SwarmNodeUpdate { .. } => "swarm_node_update",
            Self::ContainerList { .. } => "container_list",
            Self::ContainerLogs { .. } => "container_logs",
            Self::ComposeDeploy(_) => "compose_deploy",
            Self::ComposePull(_) => "compose_pull",
            Self::ComposeUp(_) => "compose_up",
            Self::ComposeDown { .. } => "compose_down",
            Self::NetworkCreate(_) => "network_create",
            Self::NetworkList => "network_list",
            Self::NetworkRemove { .. } => "network_remove",
            Self::NetworksPrune => "networks_prune",
            Self::VolumeCreate(_) => "volume_create",
            Self::VolumeList => "volume_list",
            Self::VolumeRemove { .. } => "volume_remove",
            Self::VolumesPrune { .. } => "volumes_prune",
            Self::DiskUsage => "disk_usage",
            Self::SwarmClusterInfo => "swarm_cluster_info",
        }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Swarm node list filters. Empty fields are not applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability: Option<String>,
}

impl NodeFilters {
    /// Build filters from optional query values, treating empty strings as unset.
    pub fn new(role: Option<String>, status: Option<String>, availability: Option<String>) -> Self {
        let keep = |v: Option<String>| v.filter(|s| !s.is_empty());
        Self {
            role: keep(role),
            status: keep(status),
            availability: keep(availability),
        }
    }

    /// `(key, value)` pairs for the filters that are set.
    pub fn pairs(&self) -> Vec<(&'static str, &str)> {
        let mut pairs = Vec::new();
        if let Some(ref v) = self.role {
            pairs.push(("role", v.as_str()));
        }
        if let Some(ref v) = self.status {
            pairs.push(("status", v.as_str()));
        }
        if let Some(ref v) = self.availability {
            pairs.push(("availability", v.as_str()));
        }
        pairs
    }
}

/// A compose project to deploy, pull or bring up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComposeProject {
    pub project_name: String,
    /// The compose file contents.
    pub definition: String,
    #[serde(default)]
    pub variables: BTreeMap<String, VariableValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableValue {
    pub value: String,
    #[serde(default)]
    pub is_secret: bool,
}

// ── Replies ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmNodeInfo {
    pub id: String,
    pub name: String,
    pub role: String,
    pub engine: String,
    pub ip_address: String,
    pub status: String,
    pub availability: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwarmNodeListResponse {
    pub nodes: Vec<SwarmNodeInfo>,
    pub count: usize,
}

/// Whether a workload's running image differs from the newest one in its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleStatus {
    Processing,
    Stale,
    Fresh,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub state: String,
    /// `None` when the staleness refresher has not seen this container yet.
    #[serde(default)]
    pub stale: Option<StaleStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerListResponse {
    pub items: Vec<ContainerSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_definition_tagged_by_kind() {
        let task = TaskDefinition::SwarmNodeInspect {
            node_id: "n1".into(),
        };
        let json = task.encode().unwrap();
        assert_eq!(json, r#"{"kind":"swarmNodeInspect","body":{"nodeId":"n1"}}"#);
    }

    #[test]
    fn test_compose_definition_decode() {
        let json = r#"{"kind":"composeDeploy","body":{"projectName":"web","definition":"services: {}","variables":{"PORT":{"value":"80"}}}}"#;
        match TaskDefinition::decode(json).unwrap() {
            TaskDefinition::ComposeDeploy(project) => {
                assert_eq!(project.project_name, "web");
                assert_eq!(project.variables["PORT"].value, "80");
                assert!(!project.variables["PORT"].is_secret);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_unit_task_has_no_body() {
        let json = TaskDefinition::DiskUsage.encode().unwrap();
        assert_eq!(json, r#"{"kind":"diskUsage"}"#);
        assert_eq!(TaskDefinition::decode(&json).unwrap(), TaskDefinition::DiskUsage);
    }

    #[test]
    fn test_network_create_decode() {
        let json = r#"{"kind":"networkCreate","body":{"name":"backend","enableIpv6":true}}"#;
        match TaskDefinition::decode(json).unwrap() {
            TaskDefinition::NetworkCreate(spec) => {
                assert_eq!(spec.name, "backend");
                assert!(spec.enable_ipv6);
                assert_eq!(spec.driver, None);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let json = r#"{"kind":"formatDisk","body":{}}"#;
        assert!(TaskDefinition::decode(json).is_err());
    }

    #[test]
    fn test_streaming_classification() {
        assert!(!TaskDefinition::ContainerList { all: true }.is_streaming());
        assert!(!TaskDefinition::VolumesPrune { all: false }.is_streaming());
        assert!(!TaskDefinition::SwarmNodeList {
            filters: NodeFilters::default()
        }
        .is_streaming());
        assert!(TaskDefinition::ContainerLogs {
            container_id: "c".into()
        }
        .is_streaming());
        assert!(TaskDefinition::ComposeDown {
            project_name: "p".into()
        }
        .is_streaming());
    }

    #[test]
    fn test_node_filters_skip_empty() {
        let filters = NodeFilters::new(Some("manager".into()), Some(String::new()), None);
        assert_eq!(filters.pairs(), vec![("role", "manager")]);
    }
}
