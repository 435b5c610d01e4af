//! Restart a subtree whenever its health predicate fails.
//!
//! The watchdog owns a factory that builds a fresh generation of the
//! subtree (new queues, new counters) together with its health predicate.
//! On every tick it asks the predicate; a failing predicate, or a subtree
//! that terminated on its own, gets the subtree stopped and rebuilt.
//! Whatever the subtree persisted externally survives the rebuild.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::context::TaskContext;
use crate::error::TaskError;
use crate::task::{Task, TaskConfig, TaskSpec, background};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchdogConfig {
    /// How often the health predicate is evaluated.
    pub check_interval: Duration,
    /// Wait before retrying a factory that failed to build or start.
    pub rebuild_delay: Duration,
    pub task: TaskConfig,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            rebuild_delay: Duration::from_secs(5),
            task: TaskConfig::default(),
        }
    }
}

/// One build of the supervised subtree.
pub struct Generation {
    pub task: Task,
    /// Health predicate. Called once per check, never concurrently.
    pub is_ok: Box<dyn FnMut() -> bool + Send>,
}

/// Handle to a running watchdog.
#[derive(Clone, Debug)]
pub struct Watchdog {
    task: Task,
    restarts: Arc<AtomicU64>,
}

impl Watchdog {
    /// `factory` receives the generation number, starting at zero.
    pub fn new<F>(name: &str, config: WatchdogConfig, factory: F) -> Self
    where
        F: FnMut(u64) -> Result<Generation, TaskError> + Send + 'static,
    {
        let restarts = Arc::new(AtomicU64::new(0));
        let counter = restarts.clone();
        let task_config = config.task.clone();

        let task = Task::new(TaskSpec {
            config: task_config,
            background: vec![background(move |ctx| supervise(ctx, config, factory, counter))],
            ..TaskSpec::new(name)
        });

        Self { task, restarts }
    }

    /// The watchdog's own node, to start, stop or nest under a parent.
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// How many times the subtree has been rebuilt.
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::SeqCst)
    }
}

/// Build and start the next generation, retrying until it comes up.
async fn launch<F>(ctx: &TaskContext, config: &WatchdogConfig, factory: &mut F, number: u64) -> Result<Generation, TaskError>
where
    F: FnMut(u64) -> Result<Generation, TaskError>,
{
    loop {
        let attempt = factory(number).and_then(|generation| {
            generation.task.reparent(ctx.token());
            generation.task.start().map(|()| generation)
        });
        match attempt {
            Ok(generation) => {
                info!(generation = number, "watchdog: subtree started");
                return Ok(generation);
            }
            Err(e) => {
                error!(generation = number, error = %e, "watchdog: failed to start subtree");
                ctx.sleep(config.rebuild_delay).await?;
            }
        }
    }
}

async fn supervise<F>(
    ctx: TaskContext,
    config: WatchdogConfig,
    mut factory: F,
    restarts: Arc<AtomicU64>,
) -> Result<(), TaskError>
where
    F: FnMut(u64) -> Result<Generation, TaskError> + Send + 'static,
{
    let mut number = 0;
    let mut current = launch(&ctx, &config, &mut factory, number).await?;

    let mut ticker = tokio::time::interval(config.check_interval.max(Duration::from_millis(1)));
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let healthy = if current.task.is_finished() {
            warn!(generation = number, failure = ?current.task.failure(), "watchdog: subtree terminated");
            false
        } else {
            (current.is_ok)()
        };
        if healthy {
            continue;
        }

        warn!(generation = number, "watchdog: subtree unhealthy, restarting");
        if let Err(e) = current.task.stop_wait().await {
            error!(generation = number, error = %e, "watchdog: subtree did not stop cleanly");
        }
        restarts.fetch_add(1, Ordering::SeqCst);
        number += 1;
        current = launch(&ctx, &config, &mut factory, number).await?;
    }

    current.task.stop_wait().await
}
