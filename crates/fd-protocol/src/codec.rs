use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

// ── Message kinds ───────────────────────────────────────────────

/// The closed set of messages exchanged between the server and its agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Ping,
    Handshake,
    HandshakeReply,
    TaskQueued,
    TaskSession,
    TaskSessionReply,
    TaskLog,
    TaskStatus,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Handshake => "handshake",
            Self::HandshakeReply => "handshakeReply",
            Self::TaskQueued => "taskQueued",
            Self::TaskSession => "taskSession",
            Self::TaskSessionReply => "taskSessionReply",
            Self::TaskLog => "taskLog",
            Self::TaskStatus => "taskStatus",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Message bodies ──────────────────────────────────────────────

/// First message on every connection, agent → server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub connection_token: String,
    pub agent_version: String,
    pub agent_arch: String,
}

/// Server's answer to a [`Handshake`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeReply {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

impl HandshakeReply {
    pub fn accepted() -> Self {
        Self {
            success: true,
            message: String::new(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// A task request, server → agent. `task_definition` is an encoded
/// [`crate::TaskDefinition`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskQueued {
    pub task_id: String,
    pub task_definition: String,
}

/// Sent by the agent when it starts executing a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSession {
    pub connection_token: String,
    pub task_id: String,
    pub stream: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSessionReply {
    pub task_id: String,
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One progress line of a streaming task. Offsets are strictly increasing per task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLog {
    pub task_id: String,
    pub level: LogLevel,
    pub text: String,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Success,
    Failure,
}

/// Terminal reply for a task. Exactly one per task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub task_id: String,
    pub status: TaskState,
    #[serde(default)]
    pub result: Option<String>,
}

// ── Envelope ────────────────────────────────────────────────────

/// Wire envelope: `{"type": "<kind>", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum Message {
    /// Application-level liveness ping, no body.
    Ping,
    Handshake(Handshake),
    HandshakeReply(HandshakeReply),
    TaskQueued(TaskQueued),
    TaskSession(TaskSession),
    TaskSessionReply(TaskSessionReply),
    TaskLog(TaskLog),
    TaskStatus(TaskStatus),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Ping => MessageKind::Ping,
            Self::Handshake(_) => MessageKind::Handshake,
            Self::HandshakeReply(_) => MessageKind::HandshakeReply,
            Self::TaskQueued(_) => MessageKind::TaskQueued,
            Self::TaskSession(_) => MessageKind::TaskSession,
            Self::TaskSessionReply(_) => MessageKind::TaskSessionReply,
            Self::TaskLog(_) => MessageKind::TaskLog,
            Self::TaskStatus(_) => MessageKind::TaskStatus,
        }
    }

    /// Task identifier carried by task-related messages.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskQueued(m) => Some(&m.task_id),
            Self::TaskSession(m) => Some(&m.task_id),
            Self::TaskSessionReply(m) => Some(&m.task_id),
            Self::TaskLog(m) => Some(&m.task_id),
            Self::TaskStatus(m) => Some(&m.task_id),
            Self::Ping | Self::Handshake(_) | Self::HandshakeReply(_) => None,
        }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Parse an envelope of any kind.
pub fn decode(text: &str) -> Result<Message, DecodeError> {
    Ok(serde_json::from_str(text)?)
}

/// Parse an envelope that must be of kind `T::KIND`.
pub fn decode_as<T: WireMessage>(text: &str) -> Result<T, DecodeError> {
    let msg = decode(text)?;
    T::from_message(msg).map_err(|other| DecodeError::UnexpectedKind {
        expected: T::KIND,
        found: other.kind(),
    })
}

/// A message body with a fixed kind in the envelope.
pub trait WireMessage: Sized {
    const KIND: MessageKind;

    fn into_message(self) -> Message;

    /// Unwrap the body, handing the message back if it is of another kind.
    fn from_message(msg: Message) -> Result<Self, Message>;
}

macro_rules! wire_message {
    ($($body:ident),* $(,)?) => {
        $(
            impl WireMessage for $body {
                const KIND: MessageKind = MessageKind::$body;

                fn into_message(self) -> Message {
                    Message::$body(self)
                }

                fn from_message(msg: Message) -> Result<Self, Message> {
                    match msg {
                        Message::$body(body) => Ok(body),
                        other => Err(other),
                    }
                }
            }

            impl From<$body> for Message {
                fn from(body: $body) -> Self {
                    Message::$body(body)
                }
            }
        )*
    };
}

wire_message!(
    Handshake,
    HandshakeReply,
    TaskQueued,
    TaskSession,
    TaskSessionReply,
    TaskLog,
    TaskStatus,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_wire_format() {
        let msg = Message::from(Handshake {
            connection_token: "abc".into(),
            agent_version: "0.1.0-amd64".into(),
            agent_arch: "amd64".into(),
        });
        let json = msg.encode().unwrap();
        assert!(json.contains(r#""type":"handshake""#));
        assert!(json.contains(r#""connectionToken":"abc""#));
        assert!(json.contains(r#""agentArch":"amd64""#));
    }

    #[test]
    fn test_ping_has_no_body() {
        let json = Message::Ping.encode().unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);
        assert_eq!(decode(&json).unwrap(), Message::Ping);
    }

    #[test]
    fn test_decode_as_expected_kind() {
        let json = r#"{"type":"handshakeReply","data":{"success":false,"message":"Invalid token"}}"#;
        let reply: HandshakeReply = decode_as(json).unwrap();
        assert!(!reply.success);
        assert_eq!(reply.message, "Invalid token");
    }

    #[test]
    fn test_decode_as_wrong_kind() {
        let json = Message::Ping.encode().unwrap();
        match decode_as::<HandshakeReply>(&json) {
            Err(DecodeError::UnexpectedKind { expected, found }) => {
                assert_eq!(expected, MessageKind::HandshakeReply);
                assert_eq!(found, MessageKind::Ping);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(decode("not json"), Err(DecodeError::Malformed(_))));
        // Right tag, wrong shape
        let json = r#"{"type":"taskLog","data":{"taskId":"t1"}}"#;
        assert!(matches!(decode(json), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_task_status_result_optional() {
        let json = r#"{"type":"taskStatus","data":{"taskId":"t1","status":"failure"}}"#;
        let status: TaskStatus = decode_as(json).unwrap();
        assert_eq!(status.status, TaskState::Failure);
        assert_eq!(status.result, None);
    }

    #[test]
    fn test_task_id_accessor() {
        let msg = Message::from(TaskLog {
            task_id: "t9".into(),
            level: LogLevel::Info,
            text: "pulling".into(),
            offset: 3,
        });
        assert_eq!(msg.task_id(), Some("t9"));
        assert_eq!(msg.kind(), MessageKind::TaskLog);
        assert_eq!(Message::Ping.task_id(), None);
    }
}
