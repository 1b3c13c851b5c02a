pub mod codec;
pub mod error;
pub mod handler;
pub mod keepalive;
pub mod resource;
pub mod task;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use codec::*;
pub use error::{DecodeError, TransportError};
pub use handler::{Progress, ProgressSink, TaskHandler, TaskOutcome};
pub use keepalive::{Frame, FrameSink, FrameStream, Keepalive, WriteGate};
pub use resource::*;
pub use task::*;
