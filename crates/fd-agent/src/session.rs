//! The agent's side of the connection, as an explicit state machine:
//! `Connecting → Handshaking → Active → Closed`.
//!
//! There is no reconnect loop. A session that fails its handshake or loses
//! its connection ends, and the process exits so a supervisor can restart it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use fd_protocol::{
    Frame, FrameSink, FrameStream, Handshake, HandshakeReply, Keepalive, Message, TaskHandler,
    TransportError, WriteGate, decode, decode_as,
};
use futures_util::future::{self, BoxFuture};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, trace, warn};

use crate::error::SessionError;
use crate::worker::{Worker, WorkQueue, spawn_pool};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Active,
    Closed(CloseReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The server closed the connection or the stream ended.
    PeerClosed,
    ReadError(String),
    /// Nothing arrived within the keepalive window.
    LivenessTimeout,
    /// Local shutdown; a close frame was sent.
    Shutdown,
}

/// Opens the transport to the server.
pub trait Connector: Send + Sync {
    fn connect<'a>(
        &'a self,
        url: &'a str,
    ) -> BoxFuture<'a, Result<(FrameSink, FrameStream), SessionError>>;
}

/// [`Connector`] over a real WebSocket.
pub struct WsConnector;

impl Connector for WsConnector {
    fn connect<'a>(
        &'a self,
        url: &'a str,
    ) -> BoxFuture<'a, Result<(FrameSink, FrameStream), SessionError>> {
        Box::pin(async move {
            let (socket, _response) =
                tokio_tungstenite::connect_async(url)
                    .await
                    .map_err(|e| SessionError::Connect {
                        url: url.to_string(),
                        message: e.to_string(),
                    })?;
            let (sink, stream) = socket.split();
            let sink = sink
                .sink_map_err(|e| TransportError::Io(e.to_string()))
                .with(|frame: Frame| future::ready(Ok::<_, TransportError>(to_ws(frame))));
            let stream = stream.filter_map(|msg| {
                future::ready(match msg {
                    Ok(msg) => from_ws(msg).map(Ok),
                    Err(e) => Some(Err(TransportError::Io(e.to_string()))),
                })
            });
            let sink: FrameSink = Box::pin(sink);
            let stream: FrameStream = Box::pin(stream);
            Ok((sink, stream))
        })
    }
}

fn to_ws(frame: Frame) -> WsMessage {
    match frame {
        Frame::Text(text) => WsMessage::Text(text.into()),
        Frame::Ping(data) => WsMessage::Ping(data.into()),
        Frame::Pong(data) => WsMessage::Pong(data.into()),
        Frame::Close => WsMessage::Close(None),
    }
}

fn from_ws(msg: WsMessage) -> Option<Frame> {
    match msg {
        WsMessage::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
        WsMessage::Ping(data) => Some(Frame::Ping(data.to_vec())),
        WsMessage::Pong(data) => Some(Frame::Pong(data.to_vec())),
        WsMessage::Close(_) => Some(Frame::Close),
        WsMessage::Binary(_) | WsMessage::Frame(_) => None,
    }
}

/// What a session needs to know about itself.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub url: String,
    pub token: String,
    pub agent_version: String,
    pub agent_arch: String,
    pub keepalive: Keepalive,
    pub workers: usize,
    pub queue_capacity: usize,
}

pub struct AgentSession<C> {
    settings: SessionSettings,
    connector: C,
    handler: Arc<dyn TaskHandler>,
    state: SessionState,
}

impl<C: Connector> AgentSession<C> {
    pub fn new(settings: SessionSettings, connector: C, handler: Arc<dyn TaskHandler>) -> Self {
        Self {
            settings,
            connector,
            handler,
            state: SessionState::Connecting,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    fn transition(&mut self, next: SessionState) {
        debug!("Session state: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Drive the session until it closes. Errors are the fatal pre-active
    /// failures; once active, the session always ends with a [`CloseReason`].
    pub async fn run(
        &mut self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<CloseReason, SessionError> {
        let (gate, mut stream) = match self.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                self.transition(SessionState::Closed(CloseReason::ReadError(e.to_string())));
                return Err(e);
            }
        };

        if let Err(e) = self.handshake(&gate, &mut stream).await {
            let _ = gate.close().await;
            self.transition(SessionState::Closed(CloseReason::ReadError(e.to_string())));
            return Err(e);
        }

        let reason = self.serve(gate, stream, shutdown).await;
        self.transition(SessionState::Closed(reason.clone()));
        Ok(reason)
    }

    async fn connect(&mut self) -> Result<(WriteGate, FrameStream), SessionError> {
        self.transition(SessionState::Connecting);
        info!(url = %self.settings.url, "Connecting to server");
        let (sink, stream) = self.connector.connect(&self.settings.url).await?;
        Ok((WriteGate::new(sink), stream))
    }

    async fn handshake(
        &mut self,
        gate: &WriteGate,
        stream: &mut FrameStream,
    ) -> Result<(), SessionError> {
        self.transition(SessionState::Handshaking);
        let hello = Handshake {
            connection_token: self.settings.token.clone(),
            agent_version: self.settings.agent_version.clone(),
            agent_arch: self.settings.agent_arch.clone(),
        };
        gate.send(&hello.into()).await?;
        debug!("Handshake sent, waiting for reply");

        let text = tokio::time::timeout(HANDSHAKE_TIMEOUT, next_text(stream))
            .await
            .map_err(|_| SessionError::HandshakeTimeout(HANDSHAKE_TIMEOUT))??;
        let reply: HandshakeReply = decode_as(&text)?;
        if !reply.success {
            return Err(SessionError::HandshakeRejected(reply.message));
        }
        info!(version = %self.settings.agent_version, "Handshake accepted");
        Ok(())
    }

    async fn serve(
        &mut self,
        gate: WriteGate,
        mut stream: FrameStream,
        shutdown: impl Future<Output = ()>,
    ) -> CloseReason {
        self.transition(SessionState::Active);

        let keepalive = self.settings.keepalive.spawn(gate.clone());
        let worker = Worker::new(
            gate.clone(),
            Arc::clone(&self.handler),
            self.settings.token.clone(),
        );
        let (queue, mut workers) =
            spawn_pool(self.settings.workers, self.settings.queue_capacity, worker);

        let window = self.settings.keepalive.window();
        let reason = read_loop(&gate, &mut stream, &queue, window, shutdown).await;

        keepalive.abort();
        // Queued and running tasks are abandoned; the server times them out.
        workers.abort_all();
        reason
    }
}

/// First text frame, skipping control frames.
async fn next_text(stream: &mut FrameStream) -> Result<String, SessionError> {
    loop {
        match stream.next().await {
            Some(Ok(Frame::Text(text))) => return Ok(text),
            Some(Ok(Frame::Close)) | None => return Err(SessionError::HandshakeClosed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

async fn read_loop(
    gate: &WriteGate,
    stream: &mut FrameStream,
    queue: &WorkQueue,
    window: Duration,
    shutdown: impl Future<Output = ()>,
) -> CloseReason {
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutting down, closing connection");
                if let Err(e) = gate.close().await {
                    debug!("Close frame not delivered: {e}");
                }
                return CloseReason::Shutdown;
            }
            _ = &mut deadline => {
                warn!("No frame from server within {}s", window.as_secs());
                return CloseReason::LivenessTimeout;
            }
            frame = stream.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        warn!("Read error: {e}");
                        return CloseReason::ReadError(e.to_string());
                    }
                    None => return CloseReason::PeerClosed,
                };
                deadline.as_mut().reset(tokio::time::Instant::now() + window);

                match frame {
                    Frame::Text(text) => {
                        if !dispatch(&text, queue).await {
                            return CloseReason::ReadError("work queue closed".to_string());
                        }
                    }
                    Frame::Ping(_) | Frame::Pong(_) => trace!("Liveness frame"),
                    Frame::Close => {
                        info!("Server closed connection");
                        return CloseReason::PeerClosed;
                    }
                }
            }
        }
    }
}

/// Handle one inbound message. Returns `false` if the work queue is gone.
async fn dispatch(text: &str, queue: &WorkQueue) -> bool {
    let msg = match decode(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("Dropping undecodable message: {e}");
            return true;
        }
    };
    match msg {
        Message::TaskQueued(task) => {
            debug!(task_id = %task.task_id, "Task queued");
            queue.push(task).await
        }
        Message::TaskSessionReply(reply) if !reply.success => {
            warn!(task_id = %reply.task_id, "Server rejected task session: {}", reply.message);
            true
        }
        Message::TaskSessionReply(_) | Message::Ping => true,
        other => {
            warn!(kind = %other.kind(), "Unexpected message from server");
            true
        }
    }
}
