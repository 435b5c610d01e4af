//! Supervised task tree.
//!
//! A [`Task`] is described up front by a [`TaskSpec`]: its children, its
//! background and periodic functions, an optional worker pool and its
//! lifecycle hooks. Nothing can be added after construction.
//!
//! Every behaviour runs as its own tokio task inside the task's span. A
//! per-task supervisor joins them together with the children; the first
//! fault or panic is recorded, logged and cancels the whole scope, and the
//! parent's supervisor then observes the child as failed.

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use crate::context::{TaskContext, Work};
use crate::error::TaskError;

type BehaviourResult = Result<(), TaskError>;
type BehaviourFn = Box<dyn FnOnce(TaskContext) -> BoxFuture<'static, BehaviourResult> + Send>;
type PeriodicFn = Box<dyn FnMut(TaskContext) -> BoxFuture<'static, BehaviourResult> + Send>;

/// Timing knobs shared by every task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskConfig {
    /// How long [`Task::stop_wait`] waits before reporting a timeout.
    pub stop_timeout: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(10),
        }
    }
}

/// Fixed-size worker pool fed by a bounded queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

/// A function run once when the task starts.
pub struct Background(BehaviourFn);

/// A function run on a fixed interval until cancellation, first run immediately.
pub struct Periodic {
    interval: Duration,
    f: PeriodicFn,
}

/// A synchronous lifecycle hook.
pub struct Hook(Box<dyn FnOnce() -> Result<(), TaskError> + Send>);

pub fn background<F, Fut>(f: F) -> Background
where
    F: FnOnce(TaskContext) -> Fut + Send + 'static,
    Fut: Future<Output = BehaviourResult> + Send + 'static,
{
    Background(Box::new(move |ctx| f(ctx).boxed()))
}

pub fn periodic<F, Fut>(interval: Duration, mut f: F) -> Periodic
where
    F: FnMut(TaskContext) -> Fut + Send + 'static,
    Fut: Future<Output = BehaviourResult> + Send + 'static,
{
    Periodic {
        interval,
        f: Box::new(move |ctx| f(ctx).boxed()),
    }
}

pub fn hook<F>(f: F) -> Hook
where
    F: FnOnce() -> Result<(), TaskError> + Send + 'static,
{
    Hook(Box::new(f))
}

/// Everything a task will do, fixed at construction.
pub struct TaskSpec {
    pub name: String,
    pub config: TaskConfig,
    pub children: Vec<Task>,
    pub background: Vec<Background>,
    pub periodic: Vec<Periodic>,
    pub pool: Option<PoolConfig>,
    /// Runs synchronously inside [`Task::start`] before any behaviour.
    pub before_start: Option<Hook>,
    /// Runs once when shutdown begins, before the scope is cancelled.
    pub before_stop: Option<Hook>,
    /// Runs once after every behaviour and child has terminated.
    pub after_stop: Option<Hook>,
}

impl TaskSpec {
    /// A task with no behaviours and the default config.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: TaskConfig::default(),
            children: Vec::new(),
            background: Vec::new(),
            periodic: Vec::new(),
            pool: None,
            before_start: None,
            before_stop: None,
            after_stop: None,
        }
    }
}

/// Behaviours consumed by `start`.
struct Pending {
    background: Vec<Background>,
    periodic: Vec<Periodic>,
    pool: Option<PoolConfig>,
    before_start: Option<Hook>,
}

struct Inner {
    name: Arc<str>,
    config: TaskConfig,
    token: Mutex<CancellationToken>,
    children: Vec<Task>,
    pending: Mutex<Option<Pending>>,
    before_stop: Mutex<Option<Hook>>,
    after_stop: Mutex<Option<Hook>>,
    started: AtomicBool,
    shutdown_begun: AtomicBool,
    failure: Mutex<Option<TaskError>>,
    finished: CancellationToken,
}

/// Handle to a node of the task tree. Clones share the same node.
#[derive(Clone)]
pub struct Task {
    inner: Arc<Inner>,
}

impl Task {
    /// Build a task. Children are re-scoped under the new task's token.
    pub fn new(spec: TaskSpec) -> Self {
        let token = CancellationToken::new();
        for child in &spec.children {
            child.reparent(&token);
        }

        Self {
            inner: Arc::new(Inner {
                name: Arc::from(spec.name),
                config: spec.config,
                token: Mutex::new(token),
                children: spec.children,
                pending: Mutex::new(Some(Pending {
                    background: spec.background,
                    periodic: spec.periodic,
                    pool: spec.pool,
                    before_start: spec.before_start,
                })),
                before_stop: Mutex::new(spec.before_stop),
                after_stop: Mutex::new(spec.after_stop),
                started: AtomicBool::new(false),
                shutdown_begun: AtomicBool::new(false),
                failure: Mutex::new(None),
                finished: CancellationToken::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The task's cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.inner.token.lock().clone()
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// `true` once every behaviour and child has terminated.
    pub fn is_finished(&self) -> bool {
        self.inner.finished.is_cancelled()
    }

    /// The first fault recorded in this subtree, if any.
    pub fn failure(&self) -> Option<TaskError> {
        self.inner.failure.lock().clone()
    }

    /// Put this subtree under `parent` so cancelling `parent` cancels it.
    ///
    /// Only meaningful before `start`.
    pub(crate) fn reparent(&self, parent: &CancellationToken) {
        let token = parent.child_token();
        for child in &self.inner.children {
            child.reparent(&token);
        }
        *self.inner.token.lock() = token;
    }

    /// Start children and behaviours without blocking.
    pub fn start(&self) -> Result<(), TaskError> {
        self.start_in(&tracing::Span::current())
    }

    fn start_in(&self, parent_span: &tracing::Span) -> Result<(), TaskError> {
        let inner = &self.inner;
        let token = self.token();

        if inner.started.swap(true, Ordering::SeqCst) {
            return Err(if token.is_cancelled() {
                TaskError::StoppedBeforeStart(inner.name.to_string())
            } else {
                TaskError::AlreadyStarted(inner.name.to_string())
            });
        }
        let Some(pending) = inner.pending.lock().take() else {
            return Err(TaskError::AlreadyStarted(inner.name.to_string()));
        };

        let span = tracing::info_span!(parent: parent_span, "task", name = %inner.name);

        if let Some(Hook(f)) = pending.before_start {
            if let Err(e) = span.in_scope(f) {
                let err = TaskError::Hook {
                    task: inner.name.to_string(),
                    hook: "before_start",
                    reason: e.to_string(),
                };
                error!(parent: &span, error = %err, "task: before_start failed");
                self.record_failure(err.clone());
                self.finish_without_running();
                return Err(err);
            }
        }

        for child in &inner.children {
            if let Err(e) = child.start_in(&span) {
                error!(parent: &span, child = %child.name(), error = %e, "task: child failed to start");
                self.fail(e.clone());
                tokio::spawn(supervise(self.clone(), FuturesUnordered::new()).instrument(span.clone()));
                return Err(e);
            }
        }

        let handles = FuturesUnordered::new();
        let pool = pending.pool.map(|cfg| {
            let (tx, rx) = mpsc::channel::<Work>(cfg.queue_capacity.max(1));
            let queue = Arc::new(tokio::sync::Mutex::new(rx));
            for i in 0..cfg.workers.max(1) {
                handles.push(spawn_behaviour(
                    format!("worker-{i}"),
                    worker_loop(queue.clone(), token.clone()),
                    &span,
                ));
            }
            tx
        });

        let ctx = TaskContext::new(inner.name.clone(), token.clone(), span.clone(), pool);
        for (i, Background(f)) in pending.background.into_iter().enumerate() {
            handles.push(spawn_behaviour(format!("background-{i}"), f(ctx.clone()), &span));
        }
        for (i, Periodic { interval, f }) in pending.periodic.into_iter().enumerate() {
            handles.push(spawn_behaviour(
                format!("periodic-{i}"),
                periodic_loop(ctx.clone(), interval, f),
                &span,
            ));
        }

        debug!(parent: &span, behaviours = handles.len(), children = inner.children.len(), "task: started");
        tokio::spawn(supervise(self.clone(), handles).instrument(span));
        Ok(())
    }

    /// Request cancellation. Idempotent and safe to call concurrently.
    pub fn stop(&self) {
        self.begin_shutdown();
        self.token().cancel();

        if !self.inner.started.swap(true, Ordering::SeqCst) {
            self.inner.pending.lock().take();
            self.finish_without_running();
        }
    }

    /// Request cancellation and wait for the whole subtree to terminate.
    ///
    /// Gives up after the configured stop timeout and reports it rather
    /// than hanging.
    pub async fn stop_wait(&self) -> Result<(), TaskError> {
        self.stop();
        let timeout = self.inner.config.stop_timeout;
        match tokio::time::timeout(timeout, self.inner.finished.cancelled()).await {
            Ok(()) => {
                debug!(task = %self.inner.name, "task: stopped");
                Ok(())
            }
            Err(_) => {
                error!(task = %self.inner.name, ?timeout, "task: stop timed out");
                Err(TaskError::StopTimeout {
                    name: self.inner.name.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Wait until the subtree terminates on its own or is stopped.
    ///
    /// Returns the recorded failure, if any.
    pub async fn wait(&self) -> Result<(), TaskError> {
        self.inner.finished.cancelled().await;
        match self.failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn record_failure(&self, err: TaskError) {
        let mut failure = self.inner.failure.lock();
        if failure.is_none() {
            *failure = Some(err);
        }
    }

    /// Record a fault and cancel the scope.
    fn fail(&self, err: TaskError) {
        self.record_failure(err);
        self.begin_shutdown();
        self.token().cancel();
    }

    fn begin_shutdown(&self) {
        if self.inner.shutdown_begun.swap(true, Ordering::SeqCst) {
            return;
        }
        let hook = self.inner.before_stop.lock().take();
        if let Some(Hook(f)) = hook {
            if let Err(e) = f() {
                warn!(task = %self.inner.name, error = %e, "task: before_stop failed");
            }
        }
    }

    fn run_after_stop(&self) {
        let hook = self.inner.after_stop.lock().take();
        if let Some(Hook(f)) = hook {
            if let Err(e) = f() {
                warn!(task = %self.inner.name, error = %e, "task: after_stop failed");
            }
        }
    }

    /// Terminal path for a task whose behaviours never ran.
    fn finish_without_running(&self) {
        for child in &self.inner.children {
            child.stop();
        }
        self.begin_shutdown();
        self.run_after_stop();
        self.inner.finished.cancel();
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.inner.name)
            .field("started", &self.is_started())
            .field("finished", &self.is_finished())
            .field("children", &self.inner.children)
            .finish()
    }
}

/// Resolves when a spawned behaviour does.
struct BehaviourHandle {
    handle: JoinHandle<BehaviourResult>,
    name: String,
}

impl Future for BehaviourHandle {
    type Output = (String, Result<BehaviourResult, JoinError>);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.handle.poll_unpin(cx) {
            Poll::Ready(res) => Poll::Ready((this.name.clone(), res)),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn spawn_behaviour<F>(name: String, fut: F, span: &tracing::Span) -> BehaviourHandle
where
    F: Future<Output = BehaviourResult> + Send + 'static,
{
    BehaviourHandle {
        handle: tokio::spawn(fut.instrument(span.clone())),
        name,
    }
}

async fn worker_loop(
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<Work>>>,
    token: CancellationToken,
) -> BehaviourResult {
    loop {
        let work = tokio::select! {
            _ = token.cancelled() => None,
            work = async { queue.lock().await.recv().await } => work,
        };
        match work {
            Some(work) => work.await,
            None => return Ok(()),
        }
    }
}

async fn periodic_loop(ctx: TaskContext, interval: Duration, mut f: PeriodicFn) -> BehaviourResult {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ctx.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }

        let run = f(ctx.clone());
        tokio::select! {
            _ = ctx.cancelled() => return Ok(()),
            res = run => match res {
                Err(e) if !e.is_cancelled() => return Err(e),
                Err(_) => return Ok(()),
                Ok(()) => {}
            },
        }
    }
}

/// Join behaviours and started children, escalating the first fault.
async fn supervise(task: Task, mut behaviours: FuturesUnordered<BehaviourHandle>) {
    let name = task.inner.name.clone();
    let token = task.token();

    let mut children: FuturesUnordered<_> = task
        .inner
        .children
        .iter()
        .filter(|child| child.is_started())
        .map(|child| {
            let child = child.clone();
            async move {
                let res = child.wait().await;
                (child.name().to_string(), res)
            }
            .boxed()
        })
        .collect();

    let mut shutdown_seen = false;
    while !(behaviours.is_empty() && children.is_empty()) {
        tokio::select! {
            _ = token.cancelled(), if !shutdown_seen => {
                shutdown_seen = true;
                task.begin_shutdown();
            }
            Some((behaviour, res)) = behaviours.next() => match res {
                Ok(Ok(())) => debug!(%behaviour, "task: behaviour finished"),
                Ok(Err(e)) if e.is_cancelled() => debug!(%behaviour, "task: behaviour cancelled"),
                Ok(Err(e)) => {
                    error!(%behaviour, error = %e, "task: behaviour failed");
                    task.fail(TaskError::Fault {
                        task: name.to_string(),
                        behaviour,
                        reason: e.to_string(),
                    });
                }
                Err(join_err) => {
                    error!(%behaviour, error = %join_err, "task: behaviour panicked");
                    task.fail(TaskError::Panicked {
                        task: name.to_string(),
                        behaviour,
                        reason: join_err.to_string(),
                    });
                }
            },
            Some((child, res)) = children.next() => {
                if let Err(e) = res {
                    warn!(%child, error = %e, "task: child failed");
                    task.fail(TaskError::ChildFailed {
                        task: name.to_string(),
                        child,
                        source: Box::new(e),
                    });
                }
            }
            else => break,
        }
    }

    task.begin_shutdown();
    task.run_after_stop();
    task.inner.finished.cancel();
    match task.failure() {
        Some(err) => info!(error = %err, "task: terminated with failure"),
        None => debug!("task: terminated"),
    }
}
