use thiserror::Error;

#[derive(Error, Debug)]
pub enum DockerError {
    #[error("Docker engine error: {0}")]
    Engine(#[from] bollard::errors::Error),

    #[error("{0}")]
    Invalid(String),

    #[error("Failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed: {message}")]
    Failed { command: String, message: String },
}
