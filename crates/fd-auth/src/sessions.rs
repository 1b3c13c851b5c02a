use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};

const SESSION_DURATION_MS: i64 = 60 * 60 * 1000;
const REMEMBER_ME_DURATION_MS: i64 = 30 * 24 * 60 * 60 * 1000;
const INACTIVITY_TIMEOUT_MS: i64 = 30 * 60 * 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub username: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub user_agent: Option<String>,
    pub last_activity: i64,
    pub remember_me: bool,
}

/// SQLite-backed login sessions.
pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    pub fn new(data_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let conn = Connection::open(data_dir.join("auth.db"))?;

        conn.pragma_update(None, "journal_mode", "WAL")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                user_agent TEXT,
                last_activity INTEGER NOT NULL,
                remember_me INTEGER DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_username ON sessions(username);
            CREATE INDEX IF NOT EXISTS idx_sessions_expires_at ON sessions(expires_at);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a session; returns its id and expiry (ms since epoch).
    pub fn create(
        &self,
        username: &str,
        user_agent: Option<&str>,
        remember_me: bool,
    ) -> anyhow::Result<(String, i64)> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let now = now_ms();
        let duration = if remember_me {
            REMEMBER_ME_DURATION_MS
        } else {
            SESSION_DURATION_MS
        };
        let expires_at = now + duration;

        self.conn().execute(
            "INSERT INTO sessions
                (id, username, created_at, expires_at, user_agent, last_activity, remember_me)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session_id,
                username,
                now,
                expires_at,
                user_agent,
                now,
                remember_me as i32,
            ],
        )?;

        Ok((session_id, expires_at))
    }

    /// Look a session up, deleting it if it has expired or gone idle.
    pub fn get(&self, session_id: &str) -> anyhow::Result<Option<Session>> {
        self.get_at(session_id, now_ms())
    }

    fn get_at(&self, session_id: &str, now: i64) -> anyhow::Result<Option<Session>> {
        let conn = self.conn();
        let session = conn
            .query_row(
                "SELECT id, username, created_at, expires_at, user_agent, last_activity, remember_me
                 FROM sessions WHERE id = ?1",
                params![session_id],
                |row| {
                    Ok(Session {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        created_at: row.get(2)?,
                        expires_at: row.get(3)?,
                        user_agent: row.get(4)?,
                        last_activity: row.get(5)?,
                        remember_me: row.get::<_, i32>(6)? == 1,
                    })
                },
            )
            .optional()?;

        let Some(session) = session else {
            return Ok(None);
        };

        let idle = !session.remember_me && now - session.last_activity > INACTIVITY_TIMEOUT_MS;
        if session.expires_at < now || idle {
            conn.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
            return Ok(None);
        }

        Ok(Some(session))
    }

    /// Like [`get`](Self::get), but also records activity on the session.
    pub fn validate(&self, session_id: &str) -> anyhow::Result<Option<Session>> {
        let Some(session) = self.get(session_id)? else {
            return Ok(None);
        };
        self.update_activity(session_id)?;
        Ok(Some(session))
    }

    pub fn update_activity(&self, session_id: &str) -> anyhow::Result<()> {
        self.conn().execute(
            "UPDATE sessions SET last_activity = ?1 WHERE id = ?2",
            params![now_ms(), session_id],
        )?;
        Ok(())
    }

    pub fn delete(&self, session_id: &str) -> anyhow::Result<()> {
        self.conn()
            .execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
        Ok(())
    }

    /// Drop every session of `username` except `keep`.
    pub fn delete_others(&self, username: &str, keep: &str) -> anyhow::Result<()> {
        self.conn().execute(
            "DELETE FROM sessions WHERE username = ?1 AND id != ?2",
            params![username, keep],
        )?;
        Ok(())
    }

    pub fn cleanup_expired(&self) -> anyhow::Result<()> {
        self.conn()
            .execute("DELETE FROM sessions WHERE expires_at < ?1", params![now_ms()])?;
        Ok(())
    }
}

trait OptionalExt<T> {
    fn optional(self) -> rusqlite::Result<Option<T>>;
}

impl<T> OptionalExt<T> for rusqlite::Result<T> {
    fn optional(self) -> rusqlite::Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_create_then_validate() {
        let (_dir, store) = store();
        let (id, expires_at) = store.create("admin", Some("curl/8"), false).unwrap();
        let session = store.validate(&id).unwrap().unwrap();
        assert_eq!(session.username, "admin");
        assert_eq!(session.user_agent.as_deref(), Some("curl/8"));
        assert_eq!(session.expires_at, expires_at);
        assert!(expires_at - session.created_at == SESSION_DURATION_MS);
    }

    #[test]
    fn test_unknown_session_is_none() {
        let (_dir, store) = store();
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_idle_session_is_deleted() {
        let (_dir, store) = store();
        let (id, _) = store.create("admin", None, false).unwrap();
        let later = now_ms() + INACTIVITY_TIMEOUT_MS + 1000;
        assert!(store.get_at(&id, later).unwrap().is_none());
        // Gone for good, not only hidden.
        assert!(store.get(&id).unwrap().is_none());
    }

    #[test]
    fn test_remember_me_survives_inactivity() {
        let (_dir, store) = store();
        let (id, _) = store.create("admin", None, true).unwrap();
        let later = now_ms() + INACTIVITY_TIMEOUT_MS + 1000;
        assert!(store.get_at(&id, later).unwrap().is_some());
        let past_expiry = now_ms() + REMEMBER_ME_DURATION_MS + 1000;
        assert!(store.get_at(&id, past_expiry).unwrap().is_none());
    }

    #[test]
    fn test_delete_others_keeps_current() {
        let (_dir, store) = store();
        let (current, _) = store.create("admin", None, false).unwrap();
        let (other, _) = store.create("admin", None, false).unwrap();
        let (foreign, _) = store.create("ops", None, false).unwrap();
        store.delete_others("admin", &current).unwrap();
        assert!(store.get(&current).unwrap().is_some());
        assert!(store.get(&other).unwrap().is_none());
        assert!(store.get(&foreign).unwrap().is_some());
    }

    #[test]
    fn test_logout_deletes_session() {
        let (_dir, store) = store();
        let (id, _) = store.create("admin", None, false).unwrap();
        store.delete(&id).unwrap();
        assert!(store.validate(&id).unwrap().is_none());
    }
}
