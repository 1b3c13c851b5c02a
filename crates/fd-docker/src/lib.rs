pub mod compose;
pub mod engine;
pub mod error;
pub mod handler;
pub mod registry;
pub mod resources;
pub mod staleness;

pub use compose::ComposeRunner;
pub use engine::DockerEngine;
pub use error::DockerError;
pub use handler::DockerTaskHandler;
pub use registry::{ImageReference, RegistryClient, RegistryError};
pub use resources::format_bytes;
pub use staleness::{
    DockerImageSource, ImageSource, RefreshSummary, StalenessCache, Workload, refresh_once,
    run_refresher,
};
