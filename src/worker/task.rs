// ABOUTME: Defines the Task trait - the callable a worker runs for each call -
// ABOUTME: and the TaskLoader trait that resolves a task from a worker path.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::CallContext;
use crate::error::WorkerError;

/// A unit of work a worker can run.
///
/// The task receives the positional arguments of the call and a context. It
/// may stream any number of `send`s and must finish the call with exactly one
/// of `complete`, `error`, or `exit`.
#[async_trait]
pub trait Task: Send + Sync {
    async fn run(&self, args: Vec<Value>, ctx: CallContext);
}

/// Resolves the task named by a handshake.
#[async_trait]
pub trait TaskLoader: Send + Sync {
    /// Load the module at `worker_path`, returning its default task or the
    /// named export when `exported_method` is set.
    async fn load(
        &self,
        worker_path: &str,
        exported_method: Option<&str>,
    ) -> Result<Arc<dyn Task>, WorkerError>;
}

/// A [`Task`] backed by an async closure.
pub struct TaskFn<F>(F);

/// Wrap an async closure as a [`Task`].
pub fn task_fn<F, Fut>(f: F) -> TaskFn<F>
where
    F: Fn(Vec<Value>, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    TaskFn(f)
}

#[async_trait]
impl<F, Fut> Task for TaskFn<F>
where
    F: Fn(Vec<Value>, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn run(&self, args: Vec<Value>, ctx: CallContext) {
        (self.0)(args, ctx).await
    }
}
