//! Execution scope handed to every behaviour of a task.

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;

/// A unit of work queued on a task's worker pool.
pub(crate) type Work = BoxFuture<'static, ()>;

/// Cancellation scope, log span and worker-pool handle of one task.
///
/// Cheap to clone. Every blocking wait offered here returns
/// [`TaskError::Cancelled`] promptly once the scope is cancelled.
#[derive(Clone)]
pub struct TaskContext {
    name: Arc<str>,
    token: CancellationToken,
    span: tracing::Span,
    pool: Option<mpsc::Sender<Work>>,
}

impl TaskContext {
    pub(crate) fn new(
        name: Arc<str>,
        token: CancellationToken,
        span: tracing::Span,
        pool: Option<mpsc::Sender<Work>>,
    ) -> Self {
        Self { name, token, span, pool }
    }

    /// Standalone scope without a pool, for driving stage logic directly.
    pub fn detached(name: &str, token: CancellationToken) -> Self {
        let span = tracing::info_span!("task", name = %name);
        Self::new(Arc::from(name), token, span, None)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Span every behaviour of this task runs in.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the scope is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Sleep for `duration` unless cancelled first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), TaskError> {
        tokio::select! {
            _ = self.token.cancelled() => Err(TaskError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Send on a bounded queue, waiting for capacity unless cancelled.
    ///
    /// A closed receiver is reported as cancellation: the consumer only goes
    /// away when the pipeline is shutting down.
    pub async fn send<T: Send>(&self, tx: &mpsc::Sender<T>, value: T) -> Result<(), TaskError> {
        tokio::select! {
            _ = self.token.cancelled() => Err(TaskError::Cancelled),
            res = tx.send(value) => res.map_err(|_| TaskError::Cancelled),
        }
    }

    /// Receive from a queue unless cancelled. `None` means closed or cancelled.
    pub async fn recv<T: Send>(&self, rx: &mut mpsc::Receiver<T>) -> Option<T> {
        tokio::select! {
            _ = self.token.cancelled() => None,
            value = rx.recv() => value,
        }
    }

    /// Queue `work` on this task's worker pool.
    ///
    /// Blocks while the pool queue is full, which is how backpressure
    /// reaches whoever is submitting.
    pub async fn submit<F>(&self, work: F) -> Result<(), TaskError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| TaskError::NoPool(self.name.to_string()))?;
        self.send(pool, Box::pin(work)).await
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("name", &self.name)
            .field("cancelled", &self.token.is_cancelled())
            .field("pool", &self.pool.is_some())
            .finish()
    }
}
