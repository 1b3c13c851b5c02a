use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

/// Server configuration, read from the environment.
#[derive(Debug, Clone, Serialize)]
pub struct EnvConfig {
    /// HTTP and agent WebSocket port.
    pub port: u16,
    pub data_path: PathBuf,
    /// Node records; defaults to `<data_path>/nodes.json`.
    pub nodes_file: PathBuf,
    /// Run the staleness refresher for the server's own containers.
    pub staleness_check: bool,
    /// Silence after which an agent connection is considered dead.
    pub keepalive_window: Duration,
    /// Deadline for single-reply tasks.
    pub task_timeout: Duration,
    /// Deadline for a whole streaming task.
    pub stream_timeout: Duration,
    /// Interval of the abandoned-task sweep.
    pub sweep_interval: Duration,
    pub log_level: Option<String>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        let data_path = PathBuf::from("/data");
        Self {
            port: 9090,
            nodes_file: data_path.join("nodes.json"),
            data_path,
            staleness_check: true,
            keepalive_window: Duration::from_secs(10),
            task_timeout: Duration::from_secs(30),
            stream_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
            log_level: None,
        }
    }
}

impl EnvConfig {
    /// Read `.env` (if given, or `./.env` when present), then the environment.
    /// Real environment variables win over file entries.
    pub fn load(env_file: Option<&Path>) -> Self {
        let path = env_file.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(".env"));
        let file = read_dotenv(&path);
        Self::from_lookup(|key| std::env::var(key).ok().or_else(|| file.get(key).cloned()))
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(port) = get("FLEETDOCK_PORT").and_then(|v| v.parse().ok()) {
            config.port = port;
        }
        if let Some(v) = get("DATA_PATH") {
            config.data_path = PathBuf::from(v);
            config.nodes_file = config.data_path.join("nodes.json");
        }
        if let Some(v) = get("NODES_FILE") {
            config.nodes_file = PathBuf::from(v);
        }
        if let Some(v) = get("STALENESS_CHECK") {
            config.staleness_check = switch_on(&v);
        }
        if let Some(d) = get("KEEPALIVE_WINDOW_SECS").and_then(|v| secs(&v)) {
            config.keepalive_window = d;
        }
        if let Some(d) = get("TASK_TIMEOUT_SECS").and_then(|v| secs(&v)) {
            config.task_timeout = d;
        }
        if let Some(d) = get("STREAM_TIMEOUT_SECS").and_then(|v| secs(&v)) {
            config.stream_timeout = d;
        }
        if let Some(d) = get("SWEEP_INTERVAL_SECS").and_then(|v| secs(&v)) {
            config.sweep_interval = d;
        }
        config.log_level = get("LOG_LEVEL").filter(|v| !v.is_empty());

        config
    }
}

/// `OFF`, `false` and `0` disable a switch; anything else enables it.
pub fn switch_on(value: &str) -> bool {
    !matches!(value.trim().to_ascii_lowercase().as_str(), "off" | "false" | "0")
}

/// Whole seconds, rejecting zero.
pub fn secs(value: &str) -> Option<Duration> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|s| *s > 0)
        .map(Duration::from_secs)
}

/// Parse a basic `.env` file (`KEY=VALUE` per line).
fn read_dotenv(path: &Path) -> HashMap<String, String> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return HashMap::new();
    };
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| {
            let v = v.trim().trim_matches('"').trim_matches('\'');
            (k.trim().to_string(), v.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(vars: &[(&str, &str)]) -> EnvConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvConfig::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let c = config(&[]);
        assert_eq!(c.port, 9090);
        assert_eq!(c.nodes_file, PathBuf::from("/data/nodes.json"));
        assert!(c.staleness_check);
        assert_eq!(c.keepalive_window, Duration::from_secs(10));
        assert_eq!(c.task_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_overrides() {
        let c = config(&[
            ("FLEETDOCK_PORT", "8080"),
            ("DATA_PATH", "/srv/fd"),
            ("STALENESS_CHECK", "OFF"),
            ("TASK_TIMEOUT_SECS", "5"),
            ("STREAM_TIMEOUT_SECS", "0"),
            ("LOG_LEVEL", "debug"),
        ]);
        assert_eq!(c.port, 8080);
        assert_eq!(c.nodes_file, PathBuf::from("/srv/fd/nodes.json"));
        assert!(!c.staleness_check);
        assert_eq!(c.task_timeout, Duration::from_secs(5));
        // Zero is rejected, default kept.
        assert_eq!(c.stream_timeout, Duration::from_secs(1800));
        assert_eq!(c.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_switch_values() {
        assert!(switch_on("ON"));
        assert!(switch_on("yes"));
        assert!(!switch_on("off"));
        assert!(!switch_on("0"));
    }
}
