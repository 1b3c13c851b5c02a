//! Bounded task queue and the workers that drain it.

use std::sync::Arc;

use fd_protocol::{
    ProgressSink, TaskDefinition, TaskHandler, TaskLog, TaskQueued, TaskSession, TaskState,
    TaskStatus, TransportError, WriteGate,
};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

const PARSE_ERROR: &str = "Error parsing request message";

/// Producer side of the work queue. `push` waits while the queue is full.
#[derive(Clone)]
pub struct WorkQueue {
    tx: mpsc::Sender<TaskQueued>,
}

impl WorkQueue {
    /// Returns `false` once every worker is gone.
    pub async fn push(&self, task: TaskQueued) -> bool {
        self.tx.send(task).await.is_ok()
    }
}

/// Executes queued tasks and reports back through the connection's gate.
#[derive(Clone)]
pub struct Worker {
    gate: WriteGate,
    handler: Arc<dyn TaskHandler>,
    token: String,
}

impl Worker {
    pub fn new(gate: WriteGate, handler: Arc<dyn TaskHandler>, token: String) -> Self {
        Self {
            gate,
            handler,
            token,
        }
    }

    /// Run one task to completion. Write failures end it early: the
    /// connection is gone and the server will time the task out.
    pub async fn run(&self, queued: TaskQueued) {
        let task_id = queued.task_id;
        if let Err(e) = self.execute(&task_id, &queued.task_definition).await {
            debug!(task_id = %task_id, "Abandoning task: {e}");
        }
    }

    async fn execute(&self, task_id: &str, definition: &str) -> Result<(), TransportError> {
        let task = match TaskDefinition::decode(definition) {
            Ok(task) => task,
            Err(e) => {
                warn!(task_id = %task_id, "Failed to parse task definition: {e}");
                return self
                    .send_status(task_id, TaskState::Failure, Some(PARSE_ERROR.to_string()))
                    .await;
            }
        };

        let stream = task.is_streaming();
        let name = task.name();
        info!(task_id = %task_id, task = name, stream, "Task started");
        self.gate
            .send(
                &TaskSession {
                    connection_token: self.token.clone(),
                    task_id: task_id.to_string(),
                    stream,
                }
                .into(),
            )
            .await?;

        let (sink, mut progress) = ProgressSink::channel();
        let forward = async {
            while let Some(p) = progress.recv().await {
                if !stream {
                    continue;
                }
                let log = TaskLog {
                    task_id: task_id.to_string(),
                    level: p.level,
                    text: p.text,
                    offset: p.offset,
                };
                self.gate.send(&log.into()).await?;
            }
            Ok::<_, TransportError>(())
        };
        let (outcome, forwarded) = tokio::join!(self.handler.execute(task, sink), forward);
        forwarded?;

        info!(task_id = %task_id, task = name, success = outcome.is_success(), "Task finished");
        self.send_status(task_id, outcome.status, outcome.result).await
    }

    async fn send_status(
        &self,
        task_id: &str,
        status: TaskState,
        result: Option<String>,
    ) -> Result<(), TransportError> {
        let status = TaskStatus {
            task_id: task_id.to_string(),
            status,
            result,
        };
        self.gate.send(&status.into()).await
    }
}

/// Start `count` workers sharing one queue of `capacity` slots.
pub fn spawn_pool(count: usize, capacity: usize, worker: Worker) -> (WorkQueue, JoinSet<()>) {
    let (tx, rx) = mpsc::channel(capacity);
    let rx = Arc::new(Mutex::new(rx));
    let mut workers = JoinSet::new();
    for n in 0..count {
        let rx = Arc::clone(&rx);
        let worker = worker.clone();
        workers.spawn(async move {
            loop {
                let next = rx.lock().await.recv().await;
                let Some(task) = next else {
                    debug!(worker = n, "Work queue closed");
                    return;
                };
                worker.run(task).await;
            }
        });
    }
    (WorkQueue { tx }, workers)
}
