//! Write serialization and liveness pings for one connection.
//!
//! Both ends adapt their WebSocket library onto [`Frame`] so the same gate and
//! ping loop run on the agent (tungstenite) and the server (axum).

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::codec::Message;
use crate::error::TransportError;

/// Liveness window used when none is configured. Pings go out at 90% of it.
pub const DEFAULT_LIVENESS_WINDOW: Duration = Duration::from_secs(10);

/// Shortest window a connection will run with.
pub const MIN_LIVENESS_WINDOW: Duration = Duration::from_secs(1);

/// Transport-neutral WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

/// The single write path of a connection. Every writer (pings, replies,
/// task requests) goes through the same lock, so frames never interleave.
#[derive(Clone)]
pub struct WriteGate {
    sink: Arc<Mutex<FrameSink>>,
}

impl WriteGate {
    pub fn new<S>(sink: S) -> Self
    where
        S: Sink<Frame, Error = TransportError> + Send + 'static,
    {
        Self {
            sink: Arc::new(Mutex::new(Box::pin(sink))),
        }
    }

    pub async fn send_frame(&self, frame: Frame) -> Result<(), TransportError> {
        let mut sink = self.sink.lock().await;
        sink.send(frame).await
    }

    pub async fn send(&self, msg: &Message) -> Result<(), TransportError> {
        let text = msg
            .encode()
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        self.send_frame(Frame::Text(text)).await
    }

    /// Send a close frame and flush. Errors are expected if the peer is already gone.
    pub async fn close(&self) -> Result<(), TransportError> {
        let mut sink = self.sink.lock().await;
        sink.send(Frame::Close).await?;
        sink.close().await
    }
}

/// Keepalive timing for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    window: Duration,
}

impl Default for Keepalive {
    fn default() -> Self {
        Self::new(DEFAULT_LIVENESS_WINDOW)
    }
}

impl Keepalive {
    /// Windows shorter than [`MIN_LIVENESS_WINDOW`] are raised to it, so the
    /// ping period is never zero.
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.max(MIN_LIVENESS_WINDOW),
        }
    }

    /// How long a connection may stay silent before it is considered dead.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Interval between outgoing pings.
    pub fn period(&self) -> Duration {
        self.window * 9 / 10
    }

    /// Start pinging the peer through `gate`: a transport ping frame followed by
    /// an application [`Message::Ping`], once per period. The loop ends quietly on
    /// the first write failure; the read loop is the one that reports the dead
    /// connection.
    pub fn spawn(&self, gate: WriteGate) -> JoinHandle<()> {
        let period = self.period();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // First tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                trace!("Ping sent");
                if let Err(e) = gate.send_frame(Frame::Ping(Vec::new())).await {
                    debug!("Error when sending ping frame: {e}");
                    return;
                }
                if let Err(e) = gate.send(&Message::Ping).await {
                    debug!("Error when sending ping message: {e}");
                    return;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{LogLevel, TaskLog, decode};
    use tokio::sync::mpsc;

    fn channel_gate() -> (WriteGate, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = futures_util::sink::unfold(tx, |tx, frame: Frame| async move {
            tx.send(frame).map_err(|_| TransportError::Closed)?;
            Ok::<_, TransportError>(tx)
        });
        (WriteGate::new(sink), rx)
    }

    #[test]
    fn test_period_is_ninety_percent() {
        let keepalive = Keepalive::default();
        assert_eq!(keepalive.window(), Duration::from_secs(10));
        assert_eq!(keepalive.period(), Duration::from_secs(9));
    }

    #[tokio::test]
    async fn test_gate_encodes_messages() {
        let (gate, mut rx) = channel_gate();
        gate.send(&Message::Ping).await.unwrap();
        assert_eq!(rx.recv().await, Some(Frame::Text(r#"{"type":"ping"}"#.into())));
    }

    #[tokio::test]
    async fn test_concurrent_writers_do_not_interleave() {
        let (gate, mut rx) = channel_gate();
        let mut handles = Vec::new();
        for i in 0..16u64 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                let log = TaskLog {
                    task_id: format!("task-{i}"),
                    level: LogLevel::Info,
                    text: format!("line {i} ").repeat(512),
                    offset: i,
                };
                gate.send(&log.into()).await.unwrap();
                gate.send(&Message::Ping).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        drop(gate);

        let mut logs = Vec::new();
        let mut pings = 0;
        while let Some(frame) = rx.recv().await {
            let Frame::Text(text) = frame else {
                panic!("unexpected frame {frame:?}");
            };
            match decode(&text).unwrap() {
                Message::TaskLog(log) => logs.push(log),
                Message::Ping => pings += 1,
                other => panic!("unexpected message {other:?}"),
            }
        }
        assert_eq!(pings, 16);
        assert_eq!(logs.len(), 16);
        for log in &logs {
            assert_eq!(log.task_id, format!("task-{}", log.offset));
            assert_eq!(log.text, format!("line {} ", log.offset).repeat(512));
        }
    }

    #[test]
    fn test_zero_window_is_raised_to_minimum() {
        let keepalive = Keepalive::new(Duration::ZERO);
        assert_eq!(keepalive.window(), MIN_LIVENESS_WINDOW);
        assert!(keepalive.period() > Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_window_still_pings() {
        let (gate, mut rx) = channel_gate();
        let handle = Keepalive::new(Duration::ZERO).spawn(gate);

        tokio::time::sleep(Duration::from_millis(950)).await;
        assert_eq!(rx.recv().await, Some(Frame::Ping(Vec::new())));
        assert!(!handle.is_finished());
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_loop_sends_both_pings() {
        let (gate, mut rx) = channel_gate();
        let handle = Keepalive::default().spawn(gate);

        tokio::time::sleep(Duration::from_millis(9_100)).await;
        assert_eq!(rx.recv().await, Some(Frame::Ping(Vec::new())));
        assert_eq!(rx.recv().await, Some(Frame::Text(r#"{"type":"ping"}"#.into())));
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_loop_stops_on_write_failure() {
        let (gate, rx) = channel_gate();
        drop(rx);
        let handle = Keepalive::default().spawn(gate);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(handle.await.is_ok());
    }
}
