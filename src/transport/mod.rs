// ABOUTME: Transport abstraction for reaching worker processes.
// ABOUTME: Re-exports the child-process and in-memory spawner implementations.

mod memory;
mod process;

pub use memory::InMemorySpawner;
pub use process::{ProcessSpawner, WORKER_ENV};

use tokio::sync::{mpsc, oneshot};

use crate::error::FarmError;
use crate::protocol::{WorkerId, WorkerMessage, WorkerRequest};

/// A freshly spawned worker: its request link, inbound messages, and exit signal.
///
/// `messages` closes once the worker can no longer send anything; `exited`
/// resolves with the exit code (`None` if killed by a signal) after that.
pub struct SpawnedWorker {
    pub link: WorkerLink,
    pub messages: mpsc::UnboundedReceiver<WorkerMessage>,
    pub exited: oneshot::Receiver<Option<i32>>,
}

/// Farm-side end of a worker's request channel plus its kill switch.
pub struct WorkerLink {
    requests: mpsc::UnboundedSender<WorkerRequest>,
    kill: Option<oneshot::Sender<()>>,
}

impl WorkerLink {
    pub fn new(requests: mpsc::UnboundedSender<WorkerRequest>, kill: oneshot::Sender<()>) -> Self {
        Self {
            requests,
            kill: Some(kill),
        }
    }

    /// Queue a request for the worker. Returns false if the channel is closed.
    pub fn send(&self, request: WorkerRequest) -> bool {
        self.requests.send(request).is_ok()
    }

    /// Whether the worker end of the channel has gone away.
    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }

    /// Take the kill switch. Firing it force-terminates the worker.
    pub fn take_kill(&mut self) -> Option<oneshot::Sender<()>> {
        self.kill.take()
    }
}

/// Capability to start worker processes.
///
/// Called with the farm's state lock held, so implementations must not block;
/// any I/O belongs on spawned tasks.
pub trait Spawner: Send + Sync {
    fn spawn(&self, worker_id: WorkerId) -> Result<SpawnedWorker, FarmError>;
}
