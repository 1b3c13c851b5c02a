//! Background refresh of per-container image staleness.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use fd_protocol::StaleStatus;
use futures_util::future::BoxFuture;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::engine::DockerEngine;
use crate::registry::{RegistryClient, repo_digest};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const SHORT_ID_LEN: usize = 12;

/// Staleness by container id. Entries are reachable by the full id and by
/// its 12-character short form.
#[derive(Clone, Default)]
pub struct StalenessCache {
    entries: Arc<RwLock<HashMap<String, StaleStatus>>>,
}

impl StalenessCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, container_id: &str) -> Option<StaleStatus> {
        self.entries.read().await.get(container_id).copied()
    }

    /// Write `status` under both id forms in one critical section.
    pub async fn set(&self, container_id: &str, status: StaleStatus) {
        let mut entries = self.entries.write().await;
        entries.insert(container_id.to_string(), status);
        if let Some(short) = short_id(container_id) {
            entries.insert(short.to_string(), status);
        }
    }

    /// Mark containers not seen before as `Processing`.
    async fn seed<'a>(&self, ids: impl Iterator<Item = &'a str>) {
        let mut entries = self.entries.write().await;
        for id in ids {
            entries
                .entry(id.to_string())
                .or_insert(StaleStatus::Processing);
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

fn short_id(id: &str) -> Option<&str> {
    (id.len() > SHORT_ID_LEN).then(|| id.get(..SHORT_ID_LEN)).flatten()
}

/// A container as seen by the refresher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    pub id: String,
    /// Image reference the container was started from; may be empty.
    pub image: String,
}

/// Where the refresher learns about containers and digests.
pub trait ImageSource: Send + Sync {
    fn workloads(&self) -> BoxFuture<'_, Result<Vec<Workload>>>;

    /// Digest of the image the workload is running.
    fn current_digest<'a>(&'a self, workload: &'a Workload) -> BoxFuture<'a, Result<String>>;

    /// Digest the image's registry serves today.
    fn latest_digest<'a>(&'a self, image: &'a str) -> BoxFuture<'a, Result<String>>;
}

/// [`ImageSource`] backed by the local Docker engine and remote registries.
#[derive(Clone)]
pub struct DockerImageSource {
    engine: DockerEngine,
    registry: RegistryClient,
}

impl DockerImageSource {
    pub fn new(engine: DockerEngine, registry: RegistryClient) -> Self {
        Self { engine, registry }
    }
}

impl ImageSource for DockerImageSource {
    fn workloads(&self) -> BoxFuture<'_, Result<Vec<Workload>>> {
        Box::pin(async move {
            let containers = self.engine.list_containers(true).await?;
            Ok(containers
                .into_iter()
                .map(|c| Workload {
                    id: c.id,
                    image: c.image,
                })
                .collect())
        })
    }

    fn current_digest<'a>(&'a self, workload: &'a Workload) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let image_id = self.engine.container_image_id(&workload.id).await?;
            let digests = self.engine.image_repo_digests(&image_id).await?;
            let first = digests.first().ok_or_else(|| {
                anyhow!(
                    "no RepoDigests found for image ID {image_id} (image: {})",
                    workload.image
                )
            })?;
            repo_digest(first)
                .map(String::from)
                .ok_or_else(|| anyhow!("invalid RepoDigest format: {first}"))
        })
    }

    fn latest_digest<'a>(&'a self, image: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            self.registry
                .latest_digest(image)
                .await
                .with_context(|| format!("registry lookup for {image}"))
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSummary {
    pub stale: usize,
    pub fresh: usize,
    pub errors: usize,
    pub skipped: usize,
}

/// One refresh pass. A failure on one workload marks only that workload as
/// `Error`; the pass only fails if the workloads cannot be listed at all.
pub async fn refresh_once(
    source: &dyn ImageSource,
    cache: &StalenessCache,
) -> Result<RefreshSummary> {
    let workloads = source.workloads().await.context("listing containers")?;
    cache.seed(workloads.iter().map(|w| w.id.as_str())).await;

    let mut summary = RefreshSummary::default();
    for workload in &workloads {
        if workload.image.is_empty() {
            warn!(container_id = %workload.id, "Skipping container with empty image name");
            summary.skipped += 1;
            continue;
        }

        let status = match is_stale(source, workload).await {
            Ok(true) => {
                summary.stale += 1;
                StaleStatus::Stale
            }
            Ok(false) => {
                summary.fresh += 1;
                StaleStatus::Fresh
            }
            Err(e) => {
                error!(
                    container_id = %workload.id,
                    image = %workload.image,
                    "Error while checking if container is stale: {e:#}"
                );
                summary.errors += 1;
                StaleStatus::Error
            }
        };
        cache.set(&workload.id, status).await;
    }
    Ok(summary)
}

async fn is_stale(source: &dyn ImageSource, workload: &Workload) -> Result<bool> {
    let latest = source.latest_digest(&workload.image).await?;
    let current = source.current_digest(workload).await?;
    Ok(current != latest)
}

/// Refresh forever, once per `interval`.
pub async fn run_refresher(
    source: Arc<dyn ImageSource>,
    cache: StalenessCache,
    interval: Duration,
) {
    info!("Staleness refresher started (interval: {}s)", interval.as_secs());
    loop {
        info!("Refreshing container stale status");
        match refresh_once(source.as_ref(), &cache).await {
            Ok(summary) => info!(
                stale = summary.stale,
                fresh = summary.fresh,
                errors = summary.errors,
                skipped = summary.skipped,
                "Staleness refresh complete"
            ),
            Err(e) => error!("Staleness refresh failed: {e:#}"),
        }
        tokio::time::sleep(interval).await;
    }
}
