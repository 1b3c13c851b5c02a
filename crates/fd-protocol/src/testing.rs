//! In-memory connection pairs for driving sessions without sockets.

use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::keepalive::{Frame, FrameSink, FrameStream};

/// One side of an in-memory connection.
pub struct Endpoint {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Frames written to one endpoint's sink come out of the other's stream.
/// Dropping a sink ends the peer's stream, like a closed socket.
pub fn pair() -> (Endpoint, Endpoint) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        Endpoint {
            sink: channel_sink(a_tx),
            stream: channel_stream(b_rx),
        },
        Endpoint {
            sink: channel_sink(b_tx),
            stream: channel_stream(a_rx),
        },
    )
}

pub fn channel_sink(tx: mpsc::UnboundedSender<Frame>) -> FrameSink {
    Box::pin(futures_util::sink::unfold(tx, |tx, frame: Frame| async move {
        tx.send(frame).map_err(|_| TransportError::Closed)?;
        Ok::<_, TransportError>(tx)
    }))
}

pub fn channel_stream(rx: mpsc::UnboundedReceiver<Frame>) -> FrameStream {
    Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|frame| (Ok(frame), rx))
    }))
}
