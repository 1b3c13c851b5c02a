use tracing_subscriber::EnvFilter;

/// Pick the log filter: `RUST_LOG` first, then a plain `LOG_LEVEL`, then `default`.
pub fn env_filter(log_level: Option<&str>, default: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    log_level
        .and_then(|level| EnvFilter::try_new(level).ok())
        .unwrap_or_else(|| EnvFilter::new(default))
}

pub fn init(log_level: Option<&str>, default: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(log_level, default))
        .init();
}
