//! Local Docker engine access over its HTTP API.

use std::collections::HashMap;

use bollard::Docker;
use bollard::container::{InspectContainerOptions, ListContainersOptions, LogOutput, LogsOptions};
use bollard::models::{Node, NodeSpecAvailabilityEnum, NodeSpecRoleEnum, Swarm};
use bollard::node::{DeleteNodeOptions, ListNodesOptions, UpdateNodeOptions};
use fd_protocol::{ContainerSummary, NodeFilters, ProgressSink, SwarmClusterInfo, SwarmNodeInfo};
use futures_util::StreamExt;
use tracing::debug;

use crate::error::DockerError;

const LOG_TAIL_LINES: &str = "1000";
const TRUST_ROOT_PREVIEW: usize = 50;

/// Client for the Docker engine this process runs next to.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect to the engine named by `DOCKER_HOST`, or the default local socket.
    ///
    /// No request is made until the first call.
    pub fn connect_local() -> Result<Self, DockerError> {
        Ok(Self::from_client(Docker::connect_with_local_defaults()?))
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }

    pub(crate) fn client(&self) -> &Docker {
        &self.docker
    }

    pub(crate) async fn raw_containers(
        &self,
        all: bool,
    ) -> Result<Vec<bollard::models::ContainerSummary>, DockerError> {
        let options = ListContainersOptions::<String> {
            all,
            ..Default::default()
        };
        Ok(self.docker.list_containers(Some(options)).await?)
    }

    /// Containers without staleness; the caller fills that in.
    pub async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, DockerError> {
        let containers = self.raw_containers(all).await?;
        Ok(containers.into_iter().map(container_summary).collect())
    }

    /// Image id (`sha256:...`) a container was created from.
    pub async fn container_image_id(&self, container_id: &str) -> Result<String, DockerError> {
        let inspect = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await?;
        inspect
            .image
            .ok_or_else(|| DockerError::Invalid(format!("container {container_id} has no image")))
    }

    pub async fn image_repo_digests(&self, image_id: &str) -> Result<Vec<String>, DockerError> {
        let image = self.docker.inspect_image(image_id).await?;
        Ok(image.repo_digests.unwrap_or_default())
    }

    /// Forward the last lines of a container's output, with timestamps, to `progress`.
    pub async fn stream_logs(
        &self,
        container_id: &str,
        progress: &mut ProgressSink,
    ) -> Result<(), DockerError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            timestamps: true,
            tail: LOG_TAIL_LINES.to_string(),
            ..Default::default()
        };
        debug!(container = container_id, "Streaming container logs");
        let mut logs = self.docker.logs(container_id, Some(options));
        while let Some(chunk) = logs.next().await {
            for line in log_lines(chunk?) {
                progress.info(line);
            }
        }
        Ok(())
    }

    pub async fn swarm_nodes(
        &self,
        filters: &NodeFilters,
    ) -> Result<Vec<SwarmNodeInfo>, DockerError> {
        let filters: HashMap<String, Vec<String>> = filters
            .pairs()
            .into_iter()
            .map(|(key, value)| (key.to_string(), vec![value.to_string()]))
            .collect();
        let nodes = self.docker.list_nodes(Some(ListNodesOptions { filters })).await?;
        Ok(nodes.into_iter().map(node_info).collect())
    }

    pub async fn swarm_node(&self, node_id: &str) -> Result<SwarmNodeInfo, DockerError> {
        Ok(node_info(self.docker.inspect_node(node_id).await?))
    }

    pub async fn remove_node(&self, node_id: &str, force: bool) -> Result<(), DockerError> {
        self.docker
            .delete_node(node_id, Some(DeleteNodeOptions { force }))
            .await?;
        Ok(())
    }

    /// Change a node's availability and/or role, keeping the rest of its spec.
    pub async fn update_node(
        &self,
        node_id: &str,
        availability: Option<&str>,
        role: Option<&str>,
    ) -> Result<(), DockerError> {
        let availability = availability.map(parse_availability).transpose()?;
        let role = role.map(parse_role).transpose()?;

        let node = self.docker.inspect_node(node_id).await?;
        let version = node
            .version
            .and_then(|v| v.index)
            .ok_or_else(|| DockerError::Invalid(format!("node {node_id} has no version")))?;
        let mut spec = node.spec.unwrap_or_default();
        if availability.is_some() {
            spec.availability = availability;
        }
        if role.is_some() {
            spec.role = role;
        }
        self.docker
            .update_node(node_id, spec, UpdateNodeOptions { version })
            .await?;
        Ok(())
    }

    pub async fn cluster_info(&self) -> Result<SwarmClusterInfo, DockerError> {
        let swarm = self.docker.inspect_swarm().await?;
        let nodes = self
            .docker
            .list_nodes(None::<ListNodesOptions<String>>)
            .await?;
        Ok(cluster_info(swarm, &nodes))
    }
}

/// Render an engine enum or string field, empty when absent.
pub(crate) fn display<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn container_summary(c: bollard::models::ContainerSummary) -> ContainerSummary {
    let name = c
        .names
        .unwrap_or_default()
        .iter()
        .map(|n| n.trim_start_matches('/'))
        .collect::<Vec<_>>()
        .join(",");
    ContainerSummary {
        id: c.id.unwrap_or_default(),
        name,
        image: c.image.unwrap_or_default(),
        status: c.status.unwrap_or_default(),
        state: display(c.state),
        stale: None,
    }
}

fn log_lines(chunk: LogOutput) -> Vec<String> {
    let message = match chunk {
        LogOutput::StdOut { message }
        | LogOutput::StdErr { message }
        | LogOutput::StdIn { message }
        | LogOutput::Console { message } => message,
    };
    String::from_utf8_lossy(&message)
        .lines()
        .map(str::to_string)
        .collect()
}

fn parse_availability(value: &str) -> Result<NodeSpecAvailabilityEnum, DockerError> {
    match value {
        "active" => Ok(NodeSpecAvailabilityEnum::ACTIVE),
        "pause" => Ok(NodeSpecAvailabilityEnum::PAUSE),
        "drain" => Ok(NodeSpecAvailabilityEnum::DRAIN),
        other => Err(DockerError::Invalid(format!(
            "invalid availability: {other}. Valid options are: active, pause, drain"
        ))),
    }
}

fn parse_role(value: &str) -> Result<NodeSpecRoleEnum, DockerError> {
    match value {
        "worker" => Ok(NodeSpecRoleEnum::WORKER),
        "manager" => Ok(NodeSpecRoleEnum::MANAGER),
        other => Err(DockerError::Invalid(format!(
            "invalid role: {other}. Valid options are: worker, manager"
        ))),
    }
}

fn node_info(node: Node) -> SwarmNodeInfo {
    let spec = node.spec.unwrap_or_default();
    let description = node.description.unwrap_or_default();
    let status = node.status.unwrap_or_default();

    let ip_address = status
        .addr
        .filter(|a| !a.is_empty())
        .or_else(|| node.manager_status.and_then(|m| m.addr).filter(|a| !a.is_empty()))
        .unwrap_or_else(|| "Unknown".to_string());

    let resources = description.resources.unwrap_or_default();
    let nano_cpus = resources.nano_cpus.unwrap_or(0);
    let memory_bytes = resources.memory_bytes.unwrap_or(0);
    let (cpu, memory) = if nano_cpus != 0 || memory_bytes != 0 {
        (Some(nano_cpus), Some(memory_bytes))
    } else {
        (None, None)
    };

    SwarmNodeInfo {
        id: node.id.unwrap_or_default(),
        name: description.hostname.unwrap_or_default(),
        role: display(spec.role),
        engine: description
            .engine
            .and_then(|e| e.engine_version)
            .unwrap_or_default(),
        ip_address,
        status: display(status.state),
        availability: display(spec.availability),
        cpu,
        memory,
    }
}

fn cluster_info(swarm: Swarm, nodes: &[Node]) -> SwarmClusterInfo {
    let role_count = |wanted: NodeSpecRoleEnum| {
        nodes
            .iter()
            .filter(|n| n.spec.as_ref().and_then(|s| s.role.as_ref()) == Some(&wanted))
            .count()
    };

    let tls_info = match swarm.tls_info.and_then(|t| t.trust_root) {
        Some(root) if !root.is_empty() => {
            format!("TrustRoot: {}", shorten(&root, TRUST_ROOT_PREVIEW))
        }
        _ => "Disabled".to_string(),
    };
    let name = swarm.spec.and_then(|s| s.name).unwrap_or_default();
    let spec = if name.is_empty() {
        String::new()
    } else {
        format!("Name: {name}")
    };

    SwarmClusterInfo {
        id: swarm.id.unwrap_or_default(),
        name,
        created_at: display(swarm.created_at),
        updated_at: display(swarm.updated_at),
        version: format!("Index: {}", swarm.version.and_then(|v| v.index).unwrap_or(0)),
        tls_info,
        root_rotation_in_progress: swarm.root_rotation_in_progress.unwrap_or(false),
        default_addr_pool: swarm.default_addr_pool.unwrap_or_default(),
        subnet_size: swarm.subnet_size.unwrap_or(0),
        data_path_port: swarm.data_path_port.unwrap_or(0),
        spec,
        node_count: nodes.len(),
        manager_count: role_count(NodeSpecRoleEnum::MANAGER),
        worker_count: role_count(NodeSpecRoleEnum::WORKER),
    }
}

fn shorten(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((end, _)) => format!("{}...", &s[..end]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{
        EngineDescription, ManagerStatus, NodeDescription, NodeSpec, NodeState, NodeStatus,
        ObjectVersion, ResourceObject, SwarmSpec, TlsInfo,
    };

    fn node(role: NodeSpecRoleEnum) -> Node {
        Node {
            spec: Some(NodeSpec {
                role: Some(role),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_node_info_prefers_status_address() {
        let node = Node {
            id: Some("n1".into()),
            spec: Some(NodeSpec {
                role: Some(NodeSpecRoleEnum::MANAGER),
                availability: Some(NodeSpecAvailabilityEnum::ACTIVE),
                ..Default::default()
            }),
            description: Some(NodeDescription {
                hostname: Some("alpha".into()),
                engine: Some(EngineDescription {
                    engine_version: Some("26.1.0".into()),
                    ..Default::default()
                }),
                resources: Some(ResourceObject {
                    nano_cpus: Some(4_000_000_000),
                    memory_bytes: Some(8_589_934_592),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: Some(NodeStatus {
                state: Some(NodeState::READY),
                addr: Some(String::new()),
                ..Default::default()
            }),
            manager_status: Some(ManagerStatus {
                addr: Some("10.0.0.1:2377".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let info = node_info(node);
        assert_eq!(info.ip_address, "10.0.0.1:2377");
        assert_eq!(info.name, "alpha");
        assert_eq!(info.role, "manager");
        assert_eq!(info.status, "ready");
        assert_eq!(info.availability, "active");
        assert_eq!(info.engine, "26.1.0");
        assert_eq!(info.cpu, Some(4_000_000_000));
    }

    #[test]
    fn test_node_info_without_address_or_resources() {
        let info = node_info(node(NodeSpecRoleEnum::WORKER));
        assert_eq!(info.ip_address, "Unknown");
        assert_eq!(info.cpu, None);
        assert_eq!(info.memory, None);
    }

    #[test]
    fn test_update_values_are_checked() {
        assert!(matches!(parse_availability("drain"), Ok(NodeSpecAvailabilityEnum::DRAIN)));
        assert!(matches!(parse_role("manager"), Ok(NodeSpecRoleEnum::MANAGER)));
        assert!(matches!(parse_availability("sleep"), Err(DockerError::Invalid(_))));
        assert!(matches!(parse_role("leader"), Err(DockerError::Invalid(_))));
    }

    #[test]
    fn test_container_names_lose_leading_slash() {
        let summary = container_summary(bollard::models::ContainerSummary {
            id: Some("4f66ad9a0b2e".into()),
            names: Some(vec!["/web".into(), "/web-alias".into()]),
            image: Some("nginx:1.25".into()),
            status: Some("Up 2 hours".into()),
            state: Some(bollard::models::ContainerSummaryStateEnum::RUNNING),
            ..Default::default()
        });
        assert_eq!(summary.name, "web,web-alias");
        assert_eq!(summary.state, "running");
        assert_eq!(summary.stale, None);
    }

    #[test]
    fn test_cluster_info_counts_roles() {
        let swarm = Swarm {
            id: Some("swarm1".into()),
            version: Some(ObjectVersion { index: Some(42) }),
            spec: Some(SwarmSpec {
                name: Some("default".into()),
                ..Default::default()
            }),
            tls_info: Some(TlsInfo {
                trust_root: Some("-".repeat(80)),
                ..Default::default()
            }),
            subnet_size: Some(24),
            ..Default::default()
        };
        let nodes = vec![
            node(NodeSpecRoleEnum::MANAGER),
            node(NodeSpecRoleEnum::WORKER),
            node(NodeSpecRoleEnum::WORKER),
        ];
        let info = cluster_info(swarm, &nodes);
        assert_eq!(info.version, "Index: 42");
        assert_eq!(info.spec, "Name: default");
        assert_eq!(info.tls_info, format!("TrustRoot: {}...", "-".repeat(50)));
        assert_eq!((info.node_count, info.manager_count, info.worker_count), (3, 1, 2));
        assert_eq!(info.subnet_size, 24);
    }

    #[test]
    fn test_cluster_without_tls_is_disabled() {
        let info = cluster_info(Swarm::default(), &[]);
        assert_eq!(info.tls_info, "Disabled");
        assert_eq!(info.spec, "");
        assert_eq!(info.version, "Index: 0");
    }

    #[test]
    fn test_log_chunk_split_into_lines() {
        let chunk = LogOutput::StdErr {
            message: "2024-05-01T10:00:00Z one\n2024-05-01T10:00:01Z two\n".into(),
        };
        assert_eq!(
            log_lines(chunk),
            vec!["2024-05-01T10:00:00Z one", "2024-05-01T10:00:01Z two"]
        );
    }
}
