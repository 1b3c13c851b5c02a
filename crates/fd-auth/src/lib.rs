//! Administrator accounts and cookie sessions guarding the `/api/v1` surface.

pub mod middleware;
pub mod sessions;
pub mod users;

pub use middleware::{AuthUser, SESSION_COOKIE, clear_cookie, require_auth, session_cookie};
pub use sessions::SessionStore;
pub use users::{UserError, UserInfo, UserStore};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Session store (SQLite) and user store (YAML) behind one handle.
pub struct AuthService {
    pub sessions: SessionStore,
    pub users: UserStore,
}

impl AuthService {
    pub fn new(data_dir: &Path) -> anyhow::Result<Arc<Self>> {
        let sessions = SessionStore::new(data_dir)?;
        let users = UserStore::new(data_dir);

        Ok(Arc::new(Self { sessions, users }))
    }

    /// Periodically drop expired sessions.
    pub fn start_cleanup_task(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                if let Err(e) = this.sessions.cleanup_expired() {
                    tracing::warn!("Session cleanup error: {}", e);
                }
            }
        });
    }
}
