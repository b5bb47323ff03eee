// ABOUTME: In-memory spawner - runs the worker runtime on Tokio tasks over
// ABOUTME: channels, with the same protocol and exit semantics as a process.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::{SpawnedWorker, Spawner, WorkerLink};
use crate::error::FarmError;
use crate::protocol::WorkerId;
use crate::worker::{self, TaskLoader};

/// Spawns "workers" as Tokio tasks inside the current process.
///
/// There is no memory isolation: a task that blocks the thread or aborts the
/// process takes the farm with it. A task panic ends only that worker, with
/// exit code 101, just like a worker process would.
#[derive(Clone)]
pub struct InMemorySpawner {
    loader: Arc<dyn TaskLoader>,
}

impl InMemorySpawner {
    pub fn new<L: TaskLoader + 'static>(loader: L) -> Self {
        Self {
            loader: Arc::new(loader),
        }
    }
}

impl Spawner for InMemorySpawner {
    fn spawn(&self, worker_id: WorkerId) -> Result<SpawnedWorker, FarmError> {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = oneshot::channel();
        let loader = Arc::clone(&self.loader);

        tokio::spawn(async move {
            let code = tokio::select! {
                result = worker::serve(request_rx, message_tx, loader.as_ref()) => {
                    Some(worker::exit_code(&result))
                }
                Ok(()) = &mut kill_rx => {
                    debug!(worker_id, "in-memory worker killed");
                    None
                }
            };
            let _ = exit_tx.send(code);
        });

        Ok(SpawnedWorker {
            link: WorkerLink::new(request_tx, kill_tx),
            messages: message_rx,
            exited: exit_rx,
        })
    }
}
