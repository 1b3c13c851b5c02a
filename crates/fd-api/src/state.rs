use std::sync::Arc;

use fd_auth::AuthService;
use fd_common::config::EnvConfig;
use fd_protocol::Keepalive;
use fd_registry::{Dispatcher, NodeRegistry, NodeStore, TaskTable};

/// Shared application state for all routes.
#[derive(Clone)]
pub struct ApiState {
    pub env: Arc<EnvConfig>,
    pub store: Arc<NodeStore>,
    pub dispatcher: Dispatcher,
    pub auth: Arc<AuthService>,
    /// Timing applied to every agent connection.
    pub keepalive: Keepalive,
}

impl ApiState {
    pub fn new(
        env: Arc<EnvConfig>,
        store: Arc<NodeStore>,
        dispatcher: Dispatcher,
        auth: Arc<AuthService>,
    ) -> Self {
        let keepalive = Keepalive::new(env.keepalive_window);
        Self {
            env,
            store,
            dispatcher,
            auth,
            keepalive,
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        self.dispatcher.registry()
    }

    pub fn tasks(&self) -> &Arc<TaskTable> {
        self.dispatcher.tasks()
    }
}
