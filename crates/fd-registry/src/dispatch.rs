//! Caller-facing task dispatch.
//!
//! Tasks addressed to [`NodeId::SERVER`] never touch the network: they run
//! through the in-process handler with the same result shapes a remote node
//! would produce. Everything else is correlated through the [`TaskTable`].

use std::sync::Arc;
use std::time::Duration;

use fd_protocol::{Message, ProgressSink, TaskDefinition, TaskHandler, TaskOutcome, TaskQueued};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::debug;

use crate::connections::NodeRegistry;
use crate::error::DispatchError;
use crate::tasks::{StreamEvent, TaskStream, TaskTable};
use crate::types::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchTimeouts {
    /// Single-reply tasks.
    pub reply: Duration,
    /// Whole duration of a streaming task.
    pub stream: Duration,
}

impl Default for DispatchTimeouts {
    fn default() -> Self {
        Self {
            reply: Duration::from_secs(30),
            stream: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    tasks: Arc<TaskTable>,
    local: Arc<dyn TaskHandler>,
    timeouts: DispatchTimeouts,
}

impl Dispatcher {
    pub fn new(
        tasks: Arc<TaskTable>,
        local: Arc<dyn TaskHandler>,
        timeouts: DispatchTimeouts,
    ) -> Self {
        Self {
            tasks,
            local,
            timeouts,
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        self.tasks.registry()
    }

    pub fn tasks(&self) -> &Arc<TaskTable> {
        &self.tasks
    }

    pub fn timeouts(&self) -> DispatchTimeouts {
        self.timeouts
    }

    /// The server's own node is always reachable.
    pub async fn is_online(&self, node: NodeId) -> bool {
        node.is_server_self() || self.registry().is_online(node).await
    }

    /// Run a single-reply task on `node` and return its terminal outcome.
    /// A `Failure` outcome is returned as-is, not as an error.
    pub async fn call_once(
        &self,
        node: NodeId,
        task: TaskDefinition,
    ) -> Result<TaskOutcome, DispatchError> {
        self.call_once_within(node, task, self.timeouts.reply).await
    }

    pub async fn call_once_within(
        &self,
        node: NodeId,
        task: TaskDefinition,
        timeout: Duration,
    ) -> Result<TaskOutcome, DispatchError> {
        if node.is_server_self() {
            debug!(task = task.name(), "Running task locally");
            let (progress, _) = ProgressSink::channel();
            return Ok(self.local.execute(task, progress).await);
        }
        let (task_id, payload) = enqueue(&task)?;
        debug!(task = task.name(), task_id = %task_id, node = %node, "Dispatching task");
        self.tasks.await_one(task_id, node, payload, timeout).await
    }

    /// Run a single-reply task and decode its JSON result into `R`.
    /// A `Failure` outcome becomes [`DispatchError::TaskFailed`].
    pub async fn call<R: DeserializeOwned>(
        &self,
        node: NodeId,
        task: TaskDefinition,
    ) -> Result<R, DispatchError> {
        let outcome = self.call_once(node, task).await?;
        parse_outcome(outcome)
    }

    /// Start a streaming task on `node`.
    pub async fn call_streaming(
        &self,
        node: NodeId,
        task: TaskDefinition,
    ) -> Result<TaskStream, DispatchError> {
        if node.is_server_self() {
            return Ok(self.run_local_stream(task));
        }
        let (task_id, payload) = enqueue(&task)?;
        debug!(task = task.name(), task_id = %task_id, node = %node, "Dispatching streaming task");
        self.tasks
            .await_stream(task_id, node, payload, self.timeouts.stream)
            .await
    }

    fn run_local_stream(&self, task: TaskDefinition) -> TaskStream {
        let task_id = new_task_id();
        debug!(task = task.name(), task_id = %task_id, "Running streaming task locally");
        let (tx, rx) = mpsc::unbounded_channel();
        let local = Arc::clone(&self.local);
        tokio::spawn(async move {
            let (sink, mut progress) = ProgressSink::channel();
            let forward = async {
                while let Some(p) = progress.recv().await {
                    let _ = tx.send(StreamEvent::Progress(p));
                }
            };
            let (outcome, ()) = tokio::join!(local.execute(task, sink), forward);
            let _ = tx.send(StreamEvent::Finished(outcome));
        });
        TaskStream::local(task_id, rx)
    }
}

fn new_task_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn enqueue(task: &TaskDefinition) -> Result<(String, Message), DispatchError> {
    let task_definition = task
        .encode()
        .map_err(|e| DispatchError::Encode(e.to_string()))?;
    let task_id = new_task_id();
    let msg = TaskQueued {
        task_id: task_id.clone(),
        task_definition,
    };
    Ok((task_id, msg.into()))
}

/// Map a terminal outcome onto a typed reply.
pub fn parse_outcome<R: DeserializeOwned>(outcome: TaskOutcome) -> Result<R, DispatchError> {
    if !outcome.is_success() {
        return Err(DispatchError::TaskFailed(
            outcome.result.unwrap_or_else(|| "Task failed".to_string()),
        ));
    }
    let body = outcome.result.as_deref().unwrap_or("null");
    serde_json::from_str(body).map_err(|e| DispatchError::InvalidReply(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::session;
    use fd_protocol::{
        ContainerListResponse, Frame, LogLevel, TaskState, TaskStatus, decode_as,
    };
    use futures_util::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts its calls; streams two lines for streaming tasks.
    #[derive(Default)]
    struct EchoHandler {
        calls: AtomicUsize,
    }

    impl TaskHandler for EchoHandler {
        fn execute(
            &self,
            task: TaskDefinition,
            mut progress: ProgressSink,
        ) -> BoxFuture<'_, TaskOutcome> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if task.is_streaming() {
                    progress.info("step one");
                    progress.emit(LogLevel::Warn, "step two");
                    return TaskOutcome::success(None);
                }
                TaskOutcome::success_json(&ContainerListResponse { items: Vec::new() })
            })
        }
    }

    fn dispatcher() -> (Dispatcher, Arc<EchoHandler>, Arc<NodeRegistry>) {
        let registry = Arc::new(NodeRegistry::new());
        let handler = Arc::new(EchoHandler::default());
        let tasks = TaskTable::new(registry.clone());
        let d = Dispatcher::new(tasks, handler.clone(), DispatchTimeouts::default());
        (d, handler, registry)
    }

    #[tokio::test]
    async fn test_server_node_runs_locally() {
        let (d, handler, _) = dispatcher();
        let reply: ContainerListResponse = d
            .call(NodeId::SERVER, TaskDefinition::ContainerList { all: true })
            .await
            .unwrap();
        assert!(reply.items.is_empty());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(d.is_online(NodeId::SERVER).await);
        assert_eq!(d.tasks().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_local_stream_forwards_progress() {
        let (d, _, _) = dispatcher();
        let stream = d
            .call_streaming(
                NodeId::SERVER,
                TaskDefinition::ContainerLogs {
                    container_id: "abc".into(),
                },
            )
            .await
            .unwrap();
        let (progress, result) = stream.collect().await;
        assert_eq!(progress.len(), 2);
        assert_eq!(progress[0].offset, 0);
        assert_eq!(progress[1].level, LogLevel::Warn);
        assert!(result.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_remote_node_offline() {
        let (d, handler, _) = dispatcher();
        let err = d
            .call_once(NodeId(2), TaskDefinition::ContainerList { all: false })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::HostOffline(NodeId(2))));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert!(!d.is_online(NodeId(2)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registered_but_silent_node_is_offline() {
        let (d, _, registry) = dispatcher();
        let (s, _rx) = session(NodeId(2));
        registry.register(s).await;
        assert!(d.is_online(NodeId(2)).await);

        tokio::time::advance(registry.liveness_window() + Duration::from_secs(1)).await;
        assert!(!d.is_online(NodeId(2)).await);
        assert!(d.is_online(NodeId::SERVER).await);
    }

    #[tokio::test]
    async fn test_remote_call_round_trip() {
        let (d, handler, registry) = dispatcher();
        let (s, mut rx) = session(NodeId(2));
        registry.register(s).await;

        let call = {
            let d = d.clone();
            tokio::spawn(async move {
                d.call::<ContainerListResponse>(
                    NodeId(2),
                    TaskDefinition::ContainerList { all: true },
                )
                .await
            })
        };

        let queued: TaskQueued = match rx.recv().await {
            Some(Frame::Text(text)) => decode_as(&text).unwrap(),
            other => panic!("expected task frame, got {other:?}"),
        };
        assert_eq!(
            TaskDefinition::decode(&queued.task_definition).unwrap(),
            TaskDefinition::ContainerList { all: true }
        );

        d.tasks().resolve(
            NodeId(2),
            TaskStatus {
                task_id: queued.task_id,
                status: TaskState::Success,
                result: Some(r#"{"items":[]}"#.into()),
            }
            .into(),
        );
        assert!(call.await.unwrap().unwrap().items.is_empty());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_parse_outcome_failure() {
        let err =
            parse_outcome::<serde_json::Value>(TaskOutcome::failure("no such node")).unwrap_err();
        assert_eq!(err.to_string(), "no such node");

        let err = parse_outcome::<Vec<String>>(TaskOutcome::success(Some("{".into()))).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidReply(_)));
    }
}
