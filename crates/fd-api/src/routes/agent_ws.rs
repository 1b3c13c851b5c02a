//! Server end of the agent connection.
//!
//! The axum socket is adapted onto [`Frame`] and handed to [`serve_agent`],
//! which owns the whole connection: handshake, registration, keepalive and
//! the read loop that feeds replies into the task table.

use std::time::Duration;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use fd_protocol::{
    Frame, FrameSink, FrameStream, Handshake, HandshakeReply, Message, TransportError, WriteGate,
    decode, decode_as,
};
use fd_registry::{NodeId, NodeSession};
use futures_util::{SinkExt, StreamExt, future};
use tracing::{debug, info, trace, warn};

use crate::state::ApiState;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub fn router() -> Router<ApiState> {
    Router::new().route("/ws", get(agent_ws))
}

async fn agent_ws(ws: WebSocketUpgrade, State(state): State<ApiState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        let (sink, stream) = split_socket(socket);
        serve_agent(state, sink, stream)
    })
}

fn split_socket(socket: WebSocket) -> (FrameSink, FrameStream) {
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
    (Box::pin(sink), Box::pin(stream))
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
        // Agents never send binary frames
        WsMessage::Binary(_) => None,
    }
}

/// Run one agent connection to completion.
pub async fn serve_agent(state: ApiState, sink: FrameSink, mut stream: FrameStream) {
    let gate = WriteGate::new(sink);

    let Some((node, handshake)) = accept_handshake(&state, &gate, &mut stream).await else {
        let _ = gate.close().await;
        return;
    };

    if let Err(e) = state.store.record_handshake(node, &handshake.agent_version).await {
        warn!(node = %node, "Failed to record handshake: {e:#}");
    }
    // The reply must precede any task request on this connection.
    if let Err(e) = gate.send(&HandshakeReply::accepted().into()).await {
        warn!(node = %node, "Failed to send handshake reply: {e}");
        return;
    }

    let session = NodeSession::new(node, &handshake, gate.clone());
    info!(
        node = %node,
        session = session.id(),
        version = %handshake.agent_version,
        arch = %handshake.agent_arch,
        "Agent authenticated"
    );
    state.registry().register(session.clone()).await;
    let keepalive = state.keepalive.spawn(gate);

    read_loop(&state, &session, &mut stream).await;

    keepalive.abort();
    state.registry().deregister(&session).await;
    let failed = state.tasks().fail_session(node, session.id());
    if failed > 0 {
        info!(
            node = %node,
            session = session.id(),
            "Failed {failed} in-flight task(s) on disconnect"
        );
    }
}

/// Wait for the handshake and authenticate it. Rejections are answered before
/// returning `None`.
async fn accept_handshake(
    state: &ApiState,
    gate: &WriteGate,
    stream: &mut FrameStream,
) -> Option<(NodeId, Handshake)> {
    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, next_text(stream)).await;
    let text = match first {
        Ok(Some(text)) => text,
        Ok(None) => {
            debug!("Agent disconnected before handshake");
            return None;
        }
        Err(_) => {
            warn!("Agent handshake timeout");
            reject(gate, "Handshake timeout").await;
            return None;
        }
    };

    let handshake = match decode_as::<Handshake>(&text) {
        Ok(handshake) => handshake,
        Err(e) => {
            warn!("Agent: expected handshake: {e}");
            reject(gate, "Expected handshake").await;
            return None;
        }
    };

    match state.store.authenticate(&handshake.connection_token).await {
        Some(node) => Some((node, handshake)),
        None => {
            warn!(version = %handshake.agent_version, "Agent handshake rejected: invalid token");
            reject(gate, "Invalid token").await;
            None
        }
    }
}

async fn reject(gate: &WriteGate, message: &str) {
    let _ = gate.send(&HandshakeReply::rejected(message).into()).await;
}

/// First text frame, skipping control frames. `None` if the stream ends first.
async fn next_text(stream: &mut FrameStream) -> Option<String> {
    loop {
        match stream.next().await? {
            Ok(Frame::Text(text)) => return Some(text),
            Ok(Frame::Close) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

async fn read_loop(state: &ApiState, session: &NodeSession, stream: &mut FrameStream) {
    let node = session.node_id();
    let window = state.keepalive.window();
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => {
                warn!(
                    node = %node,
                    session = session.id(),
                    "No frame within {}s, dropping connection",
                    window.as_secs()
                );
                return;
            }
            frame = stream.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        debug!(node = %node, "Read error: {e}");
                        return;
                    }
                    None => {
                        debug!(node = %node, "Connection closed");
                        return;
                    }
                };

                session.touch();
                deadline.as_mut().reset(tokio::time::Instant::now() + window);

                match frame {
                    Frame::Text(text) => {
                        if !handle_text(state, session, &text).await {
                            return;
                        }
                    }
                    Frame::Ping(_) | Frame::Pong(_) => trace!(node = %node, "Liveness frame"),
                    Frame::Close => {
                        info!(node = %node, session = session.id(), "Agent closed connection");
                        return;
                    }
                }
            }
        }
    }
}

/// Returns `false` when the connection can no longer be written to.
async fn handle_text(state: &ApiState, session: &NodeSession, text: &str) -> bool {
    let node = session.node_id();
    let msg = match decode(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(node = %node, "Dropping undecodable message: {e}");
            return true;
        }
    };

    match msg {
        Message::Ping => true,
        Message::TaskSession(_) | Message::TaskLog(_) | Message::TaskStatus(_) => {
            let Some(reply) = state.tasks().resolve(node, msg) else {
                return true;
            };
            match session.send(&reply).await {
                Ok(()) => true,
                Err(e) => {
                    debug!(node = %node, "Failed to send reply: {e}");
                    false
                }
            }
        }
        other => {
            warn!(node = %node, kind = %other.kind(), "Unexpected message from agent");
            true
        }
    }
}
