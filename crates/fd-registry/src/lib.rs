pub mod connections;
pub mod dispatch;
pub mod error;
pub mod session;
pub mod store;
pub mod tasks;
pub mod types;

pub use connections::{NodeConnectionInfo, NodeRegistry};
pub use dispatch::{DispatchTimeouts, Dispatcher};
pub use error::DispatchError;
pub use session::NodeSession;
pub use store::{NodeRecord, NodeStore};
pub use tasks::{StreamEvent, TaskStream, TaskTable};
pub use types::NodeId;
