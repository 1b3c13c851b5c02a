use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use fd_common::config::{secs, switch_on};
use serde::Deserialize;

use crate::error::SessionError;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/fd-agent.toml";

/// Agent configuration: an optional TOML file, overridden by the environment.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Server base URL, e.g. `http://fleet.lan:9090`.
    #[serde(default)]
    pub server_url: String,
    /// Connection token issued when the node was created (64-char hex).
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_true")]
    pub staleness_check: bool,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_keepalive_window_secs")]
    pub keepalive_window_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    100
}

fn default_keepalive_window_secs() -> u64 {
    10
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            token: String::new(),
            staleness_check: true,
            log_level: None,
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            keepalive_window_secs: default_keepalive_window_secs(),
        }
    }
}

impl AgentConfig {
    /// Load `path` if it exists (a missing default file is not an error),
    /// then apply environment overrides and validate.
    pub fn load(path: &str, explicit: bool) -> Result<Self> {
        let mut config = if explicit || Path::new(path).exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {path}"))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML config from {path}"))?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get("SERVER_URL") {
            self.server_url = v;
        }
        if let Some(v) = get("TOKEN") {
            self.token = v;
        }
        if let Some(v) = get("STALENESS_CHECK") {
            self.staleness_check = switch_on(&v);
        }
        if let Some(v) = get("LOG_LEVEL").filter(|v| !v.is_empty()) {
            self.log_level = Some(v);
        }
        if let Some(n) = get("WORKERS").and_then(|v| v.trim().parse().ok()) {
            self.workers = n;
        }
        if let Some(n) = get("QUEUE_CAPACITY").and_then(|v| v.trim().parse().ok()) {
            self.queue_capacity = n;
        }
        if let Some(d) = get("KEEPALIVE_WINDOW_SECS").and_then(|v| secs(&v)) {
            self.keepalive_window_secs = d.as_secs();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_url.trim().is_empty() {
            anyhow::bail!("SERVER_URL is required");
        }
        if self.token.trim().is_empty() {
            anyhow::bail!("TOKEN is required");
        }
        if self.workers == 0 || self.queue_capacity == 0 {
            anyhow::bail!("WORKERS and QUEUE_CAPACITY must be at least 1");
        }
        if self.keepalive_window_secs == 0 {
            anyhow::bail!("KEEPALIVE_WINDOW_SECS must be at least 1");
        }
        Ok(())
    }

    pub fn keepalive_window(&self) -> Duration {
        Duration::from_secs(self.keepalive_window_secs)
    }

    /// The server's agent endpoint derived from `server_url`.
    pub fn ws_url(&self) -> Result<String, SessionError> {
        ws_url(&self.server_url)
    }
}

fn ws_url(server_url: &str) -> Result<String, SessionError> {
    let invalid = || SessionError::InvalidServerUrl(server_url.to_string());
    let (scheme, rest) = server_url.trim().split_once("://").ok_or_else(invalid)?;
    let scheme = match scheme.to_ascii_lowercase().as_str() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        _ => return Err(invalid()),
    };
    let (host, path) = match rest.split_once('/') {
        Some((host, path)) => (host, path.trim_end_matches('/')),
        None => (rest, ""),
    };
    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(invalid());
    }
    if path.is_empty() {
        Ok(format!("{scheme}://{host}/ws"))
    } else if path == "ws" || path.ends_with("/ws") {
        Ok(format!("{scheme}://{host}/{path}"))
    } else {
        Ok(format!("{scheme}://{host}/{path}/ws"))
    }
}

/// CPU architecture as reported to the server.
pub fn agent_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "armv7",
        other => other,
    }
}

/// `"<version>-<arch>"`, the version string sent at handshake.
pub fn agent_version() -> String {
    format!("{}-{}", env!("CARGO_PKG_VERSION"), agent_arch())
}
