//! Boundary between the task transport and whatever actually executes a task.

use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::codec::{LogLevel, TaskState};
use crate::task::TaskDefinition;

/// Terminal result of a task, before it is tied to a task id on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub status: TaskState,
    pub result: Option<String>,
}

impl TaskOutcome {
    pub fn success(result: Option<String>) -> Self {
        Self {
            status: TaskState::Success,
            result,
        }
    }

    /// Success carrying a JSON-encoded reply body.
    pub fn success_json<T: Serialize>(body: &T) -> Self {
        match serde_json::to_string(body) {
            Ok(json) => Self::success(Some(json)),
            Err(e) => Self::failure(format!("Failed to encode reply: {e}")),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: TaskState::Failure,
            result: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskState::Success
    }
}

/// A progress line before it is tied to a task id on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub level: LogLevel,
    pub text: String,
    pub offset: u64,
}

/// Where a streaming handler writes its progress. Assigns strictly increasing
/// offsets starting at 0.
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<Progress>,
    next_offset: u64,
}

impl ProgressSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Progress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, next_offset: 0 }, rx)
    }

    /// Emit one line. Lines emitted after the reader went away are dropped.
    pub fn emit(&mut self, level: LogLevel, text: impl Into<String>) {
        let progress = Progress {
            level,
            text: text.into(),
            offset: self.next_offset,
        };
        self.next_offset += 1;
        let _ = self.tx.send(progress);
    }

    pub fn info(&mut self, text: impl Into<String>) {
        self.emit(LogLevel::Info, text);
    }

    pub fn error(&mut self, text: impl Into<String>) {
        self.emit(LogLevel::Error, text);
    }

    /// Number of lines emitted so far.
    pub fn emitted(&self) -> u64 {
        self.next_offset
    }
}

/// Executes task payloads. Single-reply tasks ignore `progress`.
pub trait TaskHandler: Send + Sync {
    fn execute(&self, task: TaskDefinition, progress: ProgressSink) -> BoxFuture<'_, TaskOutcome>;
}
