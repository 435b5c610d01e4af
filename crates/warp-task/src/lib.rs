//! # warp-task
//! Supervised task tree used by every pipeline stage.
//!
//! A [`Task`] owns a cancellable scope descending from its parent's, runs
//! any mix of background functions, periodic functions and a bounded worker
//! pool, and waits for its children on stop. [`Watchdog`] rebuilds a subtree
//! when its health predicate fails. [`Backoff`] is the retry policy stages
//! wrap around fallible network work.

pub mod context;
pub mod error;
pub mod retry;
pub mod task;
pub mod watchdog;

pub use context::TaskContext;
pub use error::TaskError;
pub use retry::{Backoff, BackoffConfig, RetryDecision, RetryError};
pub use task::{Background, Hook, Periodic, PoolConfig, Task, TaskConfig, TaskSpec, background, hook, periodic};
pub use watchdog::{Generation, Watchdog, WatchdogConfig};
