use fd_protocol::{
    ContainerListResponse, NetworkListResponse, ProgressSink, SwarmNodeListResponse,
    TaskDefinition, TaskHandler, TaskOutcome, VolumeListResponse,
};
use futures_util::future::BoxFuture;
use tracing::{debug, warn};

use crate::compose::ComposeRunner;
use crate::engine::DockerEngine;
use crate::error::DockerError;
use crate::staleness::StalenessCache;

/// Executes task definitions against the local Docker engine.
#[derive(Clone)]
pub struct DockerTaskHandler {
    engine: DockerEngine,
    compose: ComposeRunner,
    stale: StalenessCache,
}

impl DockerTaskHandler {
    pub fn new(engine: DockerEngine, compose: ComposeRunner, stale: StalenessCache) -> Self {
        Self {
            engine,
            compose,
            stale,
        }
    }

    async fn run(
        &self,
        task: TaskDefinition,
        progress: &mut ProgressSink,
    ) -> Result<TaskOutcome, DockerError> {
        let engine = &self.engine;
        match task {
            TaskDefinition::SwarmNodeList { filters } => {
                let nodes = engine.swarm_nodes(&filters).await?;
                let count = nodes.len();
                Ok(TaskOutcome::success_json(&SwarmNodeListResponse { nodes, count }))
            }
            TaskDefinition::SwarmNodeInspect { node_id } => {
                Ok(TaskOutcome::success_json(&engine.swarm_node(&node_id).await?))
            }
            TaskDefinition::SwarmNodeRemove { node_id, force } => {
                engine.remove_node(&node_id, force).await?;
                Ok(TaskOutcome::success(None))
            }
            TaskDefinition::SwarmNodeUpdate {
                node_id,
                availability,
                role,
            } => {
                if availability.is_none() && role.is_none() {
                    return Ok(TaskOutcome::failure("Nothing to update"));
                }
                engine
                    .update_node(&node_id, availability.as_deref(), role.as_deref())
                    .await?;
                Ok(TaskOutcome::success(None))
            }
            TaskDefinition::SwarmClusterInfo => {
                Ok(TaskOutcome::success_json(&engine.cluster_info().await?))
            }
            TaskDefinition::ContainerList { all } => {
                let mut items = engine.list_containers(all).await?;
                for item in &mut items {
                    item.stale = self.stale.get(&item.id).await;
                }
                Ok(TaskOutcome::success_json(&ContainerListResponse { items }))
            }
            TaskDefinition::ContainerLogs { container_id } => {
                engine.stream_logs(&container_id, progress).await?;
                Ok(TaskOutcome::success(None))
            }
            TaskDefinition::ComposeDeploy(project) => {
                self.compose.run(&project, &["pull"], progress).await?;
                self.compose
                    .run(&project, &["up", "--detach", "--remove-orphans"], progress)
                    .await?;
                Ok(TaskOutcome::success(None))
            }
            TaskDefinition::ComposePull(project) => {
                self.compose.run(&project, &["pull"], progress).await?;
                Ok(TaskOutcome::success(None))
            }
            TaskDefinition::ComposeUp(project) => {
                self.compose.run(&project, &["up", "--detach"], progress).await?;
                Ok(TaskOutcome::success(None))
            }
            TaskDefinition::ComposeDown { project_name } => {
                self.compose.down(&project_name, progress).await?;
                Ok(TaskOutcome::success(None))
            }
            TaskDefinition::NetworkCreate(spec) => {
                Ok(TaskOutcome::success_json(&engine.create_network(&spec).await?))
            }
            TaskDefinition::NetworkList => {
                let items = engine.list_networks().await?;
                Ok(TaskOutcome::success_json(&NetworkListResponse { items }))
            }
            TaskDefinition::NetworkRemove { network_id } => {
                engine.remove_network(&network_id).await?;
                Ok(TaskOutcome::success(None))
            }
            TaskDefinition::NetworksPrune => {
                Ok(TaskOutcome::success_json(&engine.prune_networks().await?))
            }
            TaskDefinition::VolumeCreate(spec) => {
                Ok(TaskOutcome::success_json(&engine.create_volume(&spec).await?))
            }
            TaskDefinition::VolumeList => {
                let items = engine.list_volumes().await?;
                Ok(TaskOutcome::success_json(&VolumeListResponse { items }))
            }
            TaskDefinition::VolumeRemove { name } => {
                engine.remove_volume(&name).await?;
                Ok(TaskOutcome::success(None))
            }
            TaskDefinition::VolumesPrune { all } => {
                Ok(TaskOutcome::success_json(&engine.prune_volumes(all).await?))
            }
            TaskDefinition::DiskUsage => Ok(TaskOutcome::success_json(&engine.disk_usage().await?)),
        }
    }
}

impl TaskHandler for DockerTaskHandler {
    fn execute(
        &self,
        task: TaskDefinition,
        mut progress: ProgressSink,
    ) -> BoxFuture<'_, TaskOutcome> {
        Box::pin(async move {
            let name = task.name();
            debug!(task = name, "Executing task");
            match self.run(task, &mut progress).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(task = name, "Task failed: {e}");
                    progress.error(e.to_string());
                    TaskOutcome::failure(e.to_string())
                }
            }
        })
    }
}
