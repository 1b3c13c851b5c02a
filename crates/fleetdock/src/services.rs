//! Background loops of the server: the abandoned-task sweeper and the image
//! staleness refresher. Each runs under a [`RestartPolicy`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use fd_docker::{ImageSource, StalenessCache};
use fd_registry::TaskTable;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// How a background loop is brought back after it returns an error or panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Delay before the first restart; doubles on each consecutive failure.
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` restarts forever.
    pub max_restarts: Option<u32>,
    /// A run lasting at least this long resets the delay and the restart count.
    pub stable_after: Duration,
}

impl RestartPolicy {
    /// The task sweeper keeps the correlation table bounded and must always run.
    pub const SWEEPER: Self = Self {
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(30),
        max_restarts: None,
        stable_after: Duration::from_secs(300),
    };

    /// The refresher talks to remote registries; give up after a few tries so a
    /// broken registry setup does not spin forever.
    pub const REFRESHER: Self = Self {
        initial_delay: Duration::from_secs(30),
        max_delay: Duration::from_secs(600),
        max_restarts: Some(5),
        stable_after: Duration::from_secs(3600),
    };

    fn delay(&self, consecutive: u32) -> Duration {
        let factor = 1u32.checked_shl(consecutive.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn exhausted(&self, consecutive: u32) -> bool {
        self.max_restarts.is_some_and(|max| consecutive > max)
    }
}

/// Spawn `run` as a named background loop. A clean return ends the loop.
pub fn spawn_service<F, Fut>(
    name: &'static str,
    policy: RestartPolicy,
    run: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let run = Arc::new(run);
    tokio::spawn(async move {
        let mut consecutive: u32 = 0;
        loop {
            let started = Instant::now();
            let attempt = Arc::clone(&run);
            let result = tokio::spawn(async move { attempt().await }).await;
            match result {
                Ok(Ok(())) => {
                    info!(service = name, "Background service finished");
                    return;
                }
                Ok(Err(e)) => error!(service = name, "Background service failed: {e:#}"),
                Err(e) => error!(service = name, "Background service panicked: {e}"),
            }

            if started.elapsed() >= policy.stable_after {
                consecutive = 0;
            }
            consecutive = consecutive.saturating_add(1);
            if policy.exhausted(consecutive) {
                error!(
                    service = name,
                    restarts = consecutive - 1,
                    "Giving up on background service"
                );
                return;
            }

            let delay = policy.delay(consecutive);
            warn!(
                service = name,
                attempt = consecutive,
                "Restarting in {}s",
                delay.as_secs_f32()
            );
            tokio::time::sleep(delay).await;
        }
    })
}

/// Drop task records whose callers went away without cleaning up.
pub fn spawn_task_sweeper(tasks: Arc<TaskTable>, interval: Duration) -> JoinHandle<()> {
    spawn_service("task-sweeper", RestartPolicy::SWEEPER, move || {
        sweep_loop(Arc::clone(&tasks), interval)
    })
}

async fn sweep_loop(tasks: Arc<TaskTable>, interval: Duration) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        tasks.sweep_closed();
    }
}

/// Keep the staleness cache fresh for the local node's workloads.
pub fn spawn_staleness_refresher(
    source: Arc<dyn ImageSource>,
    cache: StalenessCache,
    interval: Duration,
) -> JoinHandle<()> {
    spawn_service("staleness-refresher", RestartPolicy::REFRESHER, move || {
        let source = Arc::clone(&source);
        let cache = cache.clone();
        async move {
            fd_docker::run_refresher(source, cache, interval).await;
            Ok(())
        }
    })
}
