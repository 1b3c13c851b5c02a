//! Task correlation table.
//!
//! Every task dispatched to a remote node gets one record here, keyed by its
//! task id, until a terminal reply, a timeout, or the loss of the session it
//! was sent on removes it. Removal happens under the table lock, so exactly one
//! of those outcomes wins and the waiter is completed once.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use fd_protocol::{
    Message, Progress, TaskLog, TaskOutcome, TaskSession, TaskSessionReply, TaskStatus,
};
use futures_util::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Sleep};
use tracing::{debug, info, trace, warn};

use crate::connections::NodeRegistry;
use crate::error::DispatchError;
use crate::types::NodeId;

/// What a streaming caller observes, in order: zero or more `Progress`
/// events, then exactly one `Finished` or `Failed`.
#[derive(Debug)]
pub enum StreamEvent {
    Progress(Progress),
    Finished(TaskOutcome),
    Failed(DispatchError),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress(_))
    }
}

enum Waiter {
    Once(oneshot::Sender<Result<TaskOutcome, DispatchError>>),
    Stream(mpsc::UnboundedSender<StreamEvent>),
}

impl Waiter {
    fn is_closed(&self) -> bool {
        match self {
            Self::Once(tx) => tx.is_closed(),
            Self::Stream(tx) => tx.is_closed(),
        }
    }

    fn complete(self, result: Result<TaskOutcome, DispatchError>) {
        match self {
            Self::Once(tx) => {
                let _ = tx.send(result);
            }
            Self::Stream(tx) => {
                let event = match result {
                    Ok(outcome) => StreamEvent::Finished(outcome),
                    Err(e) => StreamEvent::Failed(e),
                };
                let _ = tx.send(event);
            }
        }
    }
}

struct InFlightTask {
    node: NodeId,
    session_id: u64,
    waiter: Waiter,
    accepted: bool,
    last_offset: Option<u64>,
}

pub struct TaskTable {
    registry: Arc<NodeRegistry>,
    tasks: Mutex<HashMap<String, InFlightTask>>,
}

impl TaskTable {
    pub fn new(registry: Arc<NodeRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, InFlightTask>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of tasks currently awaiting a terminal reply.
    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    fn insert(
        &self,
        task_id: &str,
        node: NodeId,
        session_id: u64,
        waiter: Waiter,
    ) -> Result<(), DispatchError> {
        let mut tasks = self.lock();
        if tasks.contains_key(task_id) {
            return Err(DispatchError::DuplicateTask(task_id.to_string()));
        }
        tasks.insert(
            task_id.to_string(),
            InFlightTask {
                node,
                session_id,
                waiter,
                accepted: false,
                last_offset: None,
            },
        );
        Ok(())
    }

    fn take(&self, task_id: &str) -> Option<InFlightTask> {
        self.lock().remove(task_id)
    }

    /// Send `payload` to `node` and wait up to `timeout` for its terminal reply.
    pub async fn await_one(
        self: &Arc<Self>,
        task_id: String,
        node: NodeId,
        payload: Message,
        timeout: Duration,
    ) -> Result<TaskOutcome, DispatchError> {
        // Checked before anything is written, so an offline node fails fast.
        let session = self
            .registry
            .lookup(node)
            .await
            .ok_or(DispatchError::HostOffline(node))?;

        let (tx, mut rx) = oneshot::channel();
        self.insert(&task_id, node, session.id(), Waiter::Once(tx))?;
        let _guard = PendingGuard {
            table: self,
            task_id: task_id.clone(),
        };

        if let Err(source) = session.send(&payload).await {
            return Err(DispatchError::Transport { node, source });
        }
        trace!(task_id = %task_id, node = %node, "Task sent, awaiting reply");

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DispatchError::ConnectionLost(node)),
            Err(_) => {
                if self.take(&task_id).is_some() {
                    warn!(task_id = %task_id, node = %node, "Task timed out after {timeout:?}");
                    return Err(DispatchError::TaskTimeout {
                        task_id,
                        after: timeout,
                    });
                }
                // The reply won the race against the timer.
                match rx.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(DispatchError::TaskTimeout {
                        task_id,
                        after: timeout,
                    }),
                }
            }
        }
    }

    /// Send `payload` to `node` and return a stream of its progress and terminal
    /// result. `timeout` bounds the whole stream, not each progress gap.
    pub async fn await_stream(
        self: &Arc<Self>,
        task_id: String,
        node: NodeId,
        payload: Message,
        timeout: Duration,
    ) -> Result<TaskStream, DispatchError> {
        let session = self
            .registry
            .lookup(node)
            .await
            .ok_or(DispatchError::HostOffline(node))?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.insert(&task_id, node, session.id(), Waiter::Stream(tx))?;

        if let Err(source) = session.send(&payload).await {
            self.take(&task_id);
            return Err(DispatchError::Transport { node, source });
        }
        trace!(task_id = %task_id, node = %node, "Streaming task sent");

        Ok(TaskStream {
            task_id,
            rx,
            deadline: Some((Box::pin(tokio::time::sleep(timeout)), timeout)),
            table: Some(Arc::clone(self)),
            done: false,
        })
    }

    /// Feed one inbound task message from `node` into the table. Returns the
    /// message to send back, if the inbound one calls for a reply.
    pub fn resolve(&self, node: NodeId, msg: Message) -> Option<Message> {
        match msg {
            Message::TaskSession(request) => Some(self.accept_session(node, &request).into()),
            Message::TaskLog(log) => {
                self.record_progress(node, log);
                None
            }
            Message::TaskStatus(status) => {
                self.complete(node, status);
                None
            }
            other => {
                debug!(node = %node, kind = %other.kind(), "Not a task message, ignoring");
                None
            }
        }
    }

    /// Answer an agent announcing that it started executing a task.
    pub fn accept_session(&self, node: NodeId, request: &TaskSession) -> TaskSessionReply {
        let mut tasks = self.lock();
        let reply = |success: bool, message: &str| TaskSessionReply {
            task_id: request.task_id.clone(),
            success,
            message: message.to_string(),
        };
        let Some(task) = tasks.get_mut(&request.task_id) else {
            debug!(task_id = %request.task_id, node = %node, "Session requested for unknown task");
            return reply(false, "Unknown task");
        };
        if task.node != node {
            warn!(
                task_id = %request.task_id,
                node = %node,
                owner = %task.node,
                "Session requested by a node that does not own the task"
            );
            return reply(false, "Task belongs to another node");
        }
        let streaming = matches!(task.waiter, Waiter::Stream(_));
        if streaming != request.stream {
            debug!(
                task_id = %request.task_id,
                "Session stream flag does not match how the task was dispatched"
            );
        }
        task.accepted = true;
        reply(true, "")
    }

    fn record_progress(&self, node: NodeId, log: TaskLog) {
        let mut tasks = self.lock();
        let Some(task) = tasks.get_mut(&log.task_id) else {
            trace!(task_id = %log.task_id, "Progress for unknown task discarded");
            return;
        };
        if task.node != node {
            warn!(task_id = %log.task_id, node = %node, "Progress from non-owning node discarded");
            return;
        }
        let Waiter::Stream(tx) = &task.waiter else {
            debug!(task_id = %log.task_id, "Progress for single-reply task discarded");
            return;
        };
        if let Some(last) = task.last_offset {
            if log.offset <= last {
                warn!(
                    task_id = %log.task_id,
                    offset = log.offset,
                    last,
                    "Out-of-order progress dropped"
                );
                return;
            }
            if log.offset != last + 1 {
                debug!(
                    task_id = %log.task_id,
                    offset = log.offset,
                    last,
                    "Gap in progress offsets"
                );
            }
        }
        if !task.accepted {
            trace!(task_id = %log.task_id, "Progress before session acceptance");
        }
        task.last_offset = Some(log.offset);
        let _ = tx.send(StreamEvent::Progress(Progress {
            level: log.level,
            text: log.text,
            offset: log.offset,
        }));
    }

    fn complete(&self, node: NodeId, status: TaskStatus) {
        let mut tasks = self.lock();
        match tasks.get(&status.task_id) {
            None => {
                debug!(task_id = %status.task_id, "Reply for unknown task discarded");
                return;
            }
            Some(task) if task.node != node => {
                warn!(
                    task_id = %status.task_id,
                    node = %node,
                    "Reply from non-owning node discarded"
                );
                return;
            }
            Some(_) => {}
        }
        if let Some(task) = tasks.remove(&status.task_id) {
            task.waiter.complete(Ok(TaskOutcome {
                status: status.status,
                result: status.result,
            }));
        }
    }

    /// Fail every task that was sent over session `session_id`. Called when
    /// that session is torn down, so callers don't wait out their timeouts.
    pub fn fail_session(&self, node: NodeId, session_id: u64) -> usize {
        let mut tasks = self.lock();
        let lost: Vec<String> = tasks
            .iter()
            .filter(|(_, t)| t.session_id == session_id)
            .map(|(id, _)| id.clone())
            .collect();
        for task_id in &lost {
            if let Some(task) = tasks.remove(task_id) {
                task.waiter.complete(Err(DispatchError::ConnectionLost(node)));
            }
        }
        if !lost.is_empty() {
            info!(
                node = %node,
                session = session_id,
                count = lost.len(),
                "Failed tasks of lost session"
            );
        }
        lost.len()
    }

    /// Drop records whose caller has gone away.
    pub fn sweep_closed(&self) -> usize {
        let mut tasks = self.lock();
        let before = tasks.len();
        tasks.retain(|_, t| !t.waiter.is_closed());
        let removed = before - tasks.len();
        if removed > 0 {
            info!("Cleaned up {} abandoned task records", removed);
        }
        removed
    }
}

/// Removes a single-reply record when its caller stops waiting, whatever the reason.
struct PendingGuard<'a> {
    table: &'a TaskTable,
    task_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.take(&self.task_id);
    }
}

/// Progress and terminal result of a streaming task.
///
/// Finite: after the terminal event, [`TaskStream::next`] returns `None`.
/// Dropping the stream early removes the task's record.
pub struct TaskStream {
    task_id: String,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    deadline: Option<(Pin<Box<Sleep>>, Duration)>,
    table: Option<Arc<TaskTable>>,
    done: bool,
}

impl TaskStream {
    /// A stream fed by an in-process source, with no deadline and no table record.
    pub fn local(task_id: String, rx: mpsc::UnboundedReceiver<StreamEvent>) -> Self {
        Self {
            task_id,
            rx,
            deadline: None,
            table: None,
            done: false,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Remaining time before the stream times out, for remote streams.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .as_ref()
            .map(|(sleep, _)| sleep.deadline().saturating_duration_since(Instant::now()))
    }

    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.done {
            return None;
        }

        let received = match self.deadline.as_mut() {
            Some((sleep, _)) => tokio::select! {
                biased;
                event = self.rx.recv() => Some(event),
                _ = sleep.as_mut() => None,
            },
            None => Some(self.rx.recv().await),
        };
        let event = match received {
            Some(event) => event,
            None => match self.expire() {
                Some(failed) => Some(failed),
                // Terminal reply raced the deadline and is already queued.
                None => self.rx.recv().await,
            },
        };

        match event {
            Some(StreamEvent::Progress(p)) => Some(StreamEvent::Progress(p)),
            Some(terminal) => {
                self.done = true;
                Some(terminal)
            }
            None => {
                self.done = true;
                Some(StreamEvent::Failed(DispatchError::StreamIncomplete(
                    self.task_id.clone(),
                )))
            }
        }
    }

    fn expire(&mut self) -> Option<StreamEvent> {
        let (_, after) = self.deadline.take()?;
        let table = self.table.as_ref()?;
        table.take(&self.task_id)?;
        warn!(task_id = %self.task_id, "Streaming task timed out after {after:?}");
        Some(StreamEvent::Failed(DispatchError::TaskTimeout {
            task_id: self.task_id.clone(),
            after,
        }))
    }

    /// Drain the stream, returning the progress seen and the terminal result.
    pub async fn collect(mut self) -> (Vec<Progress>, Result<TaskOutcome, DispatchError>) {
        let mut progress = Vec::new();
        while let Some(event) = self.next().await {
            match event {
                StreamEvent::Progress(p) => progress.push(p),
                StreamEvent::Finished(outcome) => return (progress, Ok(outcome)),
                StreamEvent::Failed(e) => return (progress, Err(e)),
            }
        }
        (
            progress,
            Err(DispatchError::StreamIncomplete(self.task_id.clone())),
        )
    }

    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> + Send {
        futures_util::stream::unfold(self, |mut stream| async move {
            stream.next().await.map(|event| (event, stream))
        })
    }
}

impl Drop for TaskStream {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Some(table) = &self.table {
            if table.take(&self.task_id).is_some() {
                debug!(task_id = %self.task_id, "Streaming caller went away, record removed");
            }
        }
    }
}
