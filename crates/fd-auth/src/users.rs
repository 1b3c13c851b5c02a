use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Default, Serialize, Deserialize)]
struct UsersFile {
    #[serde(default)]
    users: HashMap<String, UserData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserData {
    password: String,
    #[serde(default)]
    created: Option<String>,
    #[serde(default)]
    last_login: Option<String>,
}

/// A user without its password hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub username: String,
    pub created: Option<String>,
    pub last_login: Option<String>,
}

#[derive(Error, Debug)]
pub enum UserError {
    #[error("Signup is closed: an administrator account already exists")]
    SignupClosed,

    #[error("Invalid username (3-32 characters: letters, digits, _ or -)")]
    InvalidName,

    #[error("Password must be at least {MIN_PASSWORD_LEN} characters")]
    WeakPassword,

    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("User not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Users persisted in `users.yml`.
pub struct UserStore {
    users_path: PathBuf,
    write: Mutex<()>,
}

impl UserStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            users_path: data_dir.join("users.yml"),
            write: Mutex::new(()),
        }
    }

    fn load(&self) -> UsersFile {
        match std::fs::read_to_string(&self.users_path) {
            Ok(content) => serde_yaml::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!(path = %self.users_path.display(), "Unreadable users file: {e}");
                UsersFile::default()
            }),
            Err(_) => UsersFile::default(),
        }
    }

    fn save(&self, data: &UsersFile) -> anyhow::Result<()> {
        if let Some(parent) = self.users_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.users_path, serde_yaml::to_string(data)?)?;
        Ok(())
    }

    /// Apply `change` to the file under the write lock.
    fn modify<T>(
        &self,
        change: impl FnOnce(&mut UsersFile) -> Result<T, UserError>,
    ) -> Result<T, UserError> {
        let _guard = self.write.lock().unwrap_or_else(PoisonError::into_inner);
        let mut data = self.load();
        let out = change(&mut data)?;
        self.save(&data)?;
        Ok(out)
    }

    pub fn count(&self) -> usize {
        self.load().users.len()
    }

    pub fn get(&self, username: &str) -> Option<UserInfo> {
        self.load()
            .users
            .get(username)
            .map(|ud| info(username, ud))
    }

    /// Create the first account. Once any account exists, signup is closed.
    pub async fn signup(&self, username: &str, password: &str) -> Result<UserInfo, UserError> {
        if self.count() > 0 {
            return Err(UserError::SignupClosed);
        }
        if !valid_username(username) {
            return Err(UserError::InvalidName);
        }
        if password.len() < MIN_PASSWORD_LEN {
            return Err(UserError::WeakPassword);
        }
        let hash = hash_password_blocking(password.to_string()).await?;

        self.modify(|data| {
            // Another signup may have won the race while hashing.
            if !data.users.is_empty() {
                return Err(UserError::SignupClosed);
            }
            let ud = UserData {
                password: hash,
                created: Some(chrono::Utc::now().to_rfc3339()),
                last_login: None,
            };
            let user = info(username, &ud);
            data.users.insert(username.to_string(), ud);
            Ok(user)
        })
    }

    /// Check credentials and record the login time.
    pub async fn verify(&self, username: &str, password: &str) -> Result<UserInfo, UserError> {
        let Some(ud) = self.load().users.remove(username) else {
            return Err(UserError::InvalidCredentials);
        };
        if !verify_password_blocking(password.to_string(), ud.password).await {
            return Err(UserError::InvalidCredentials);
        }

        self.modify(|data| {
            let ud = data
                .users
                .get_mut(username)
                .ok_or_else(|| UserError::NotFound(username.to_string()))?;
            ud.last_login = Some(chrono::Utc::now().to_rfc3339());
            Ok(info(username, ud))
        })
    }

    pub async fn change_password(
        &self,
        username: &str,
        current: &str,
        new_password: &str,
    ) -> Result<(), UserError> {
        self.verify(username, current).await?;
        if new_password.len() < MIN_PASSWORD_LEN {
            return Err(UserError::WeakPassword);
        }
        let hash = hash_password_blocking(new_password.to_string()).await?;

        self.modify(|data| {
            let ud = data
                .users
                .get_mut(username)
                .ok_or_else(|| UserError::NotFound(username.to_string()))?;
            ud.password = hash;
            Ok(())
        })
    }
}

fn info(username: &str, ud: &UserData) -> UserInfo {
    UserInfo {
        username: username.to_string(),
        created: ud.created.clone(),
        last_login: ud.last_login.clone(),
    }
}

fn valid_username(username: &str) -> bool {
    (3..=32).contains(&username.len())
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Hash a password with Argon2id.
pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut rand_core::OsRng);
    let params = Params::new(65536, 3, 4, None)
        .map_err(|e| anyhow::anyhow!("Argon2 params error: {e}"))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Argon2 hash error: {e}"))?
        .to_string();
    Ok(hash)
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed_hash) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}

async fn hash_password_blocking(password: String) -> anyhow::Result<String> {
    tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| anyhow::anyhow!("hashing task failed: {e}"))?
}

async fn verify_password_blocking(password: String, hash: String) -> bool {
    tokio::task::spawn_blocking(move || verify_password(&password, &hash))
        .await
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, UserStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = UserStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_password("correct horse").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("wrong horse", &hash));
        assert!(!verify_password("correct horse", "not-a-hash"));
    }

    #[test]
    fn test_username_rules() {
        assert!(valid_username("admin"));
        assert!(valid_username("ops_team-1"));
        assert!(!valid_username("ab"));
        assert!(!valid_username("has space"));
        assert!(!valid_username(&"x".repeat(33)));
    }

    #[tokio::test]
    async fn test_signup_only_while_empty() {
        let (_dir, store) = store();
        assert_eq!(store.count(), 0);
        let user = store.signup("admin", "s3cretpass").await.unwrap();
        assert_eq!(user.username, "admin");
        assert!(user.created.is_some());
        assert_eq!(store.count(), 1);

        let err = store.signup("second", "s3cretpass").await.unwrap_err();
        assert!(matches!(err, UserError::SignupClosed));
    }

    #[tokio::test]
    async fn test_signup_rejects_short_password() {
        let (_dir, store) = store();
        let err = store.signup("admin", "short").await.unwrap_err();
        assert!(matches!(err, UserError::WeakPassword));
        assert_eq!(store.count(), 0);
    }

    #[tokio::test]
    async fn test_verify_records_login() {
        let (_dir, store) = store();
        store.signup("admin", "s3cretpass").await.unwrap();
        let user = store.verify("admin", "s3cretpass").await.unwrap();
        assert!(user.last_login.is_some());
        assert_eq!(store.get("admin").unwrap().last_login, user.last_login);

        let err = store.verify("admin", "wrongpass").await.unwrap_err();
        assert!(matches!(err, UserError::InvalidCredentials));
        let err = store.verify("nobody", "s3cretpass").await.unwrap_err();
        assert!(matches!(err, UserError::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_change_password() {
        let (_dir, store) = store();
        store.signup("admin", "s3cretpass").await.unwrap();
        let err = store
            .change_password("admin", "wrongpass", "newpassword")
            .await
            .unwrap_err();
        assert!(matches!(err, UserError::InvalidCredentials));

        store
            .change_password("admin", "s3cretpass", "newpassword")
            .await
            .unwrap();
        assert!(store.verify("admin", "newpassword").await.is_ok());
        assert!(store.verify("admin", "s3cretpass").await.is_err());
    }

    #[tokio::test]
    async fn test_users_persist_in_yaml() {
        let (dir, store) = store();
        store.signup("admin", "s3cretpass").await.unwrap();
        let yaml = std::fs::read_to_string(dir.path().join("users.yml")).unwrap();
        assert!(yaml.contains("admin:"));
        assert!(!yaml.contains("s3cretpass"));
        assert_eq!(UserStore::new(dir.path()).count(), 1);
    }
}
