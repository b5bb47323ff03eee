// ABOUTME: CallContext - the handle a task uses to stream data and finish its
// ABOUTME: call; terminal operations consume the context so they run once.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::WorkerError;
use crate::protocol::{Slot, WorkerId, WorkerMessage};

/// Per-call context handed to a [`Task`](super::Task).
///
/// `complete`, `error`, and `exit` take `self`, so a call can be finished at
/// most once. Dropping the context without finishing leaves the call open on
/// the farm side until it times out or the worker goes away.
pub struct CallContext {
    slot: Slot,
    worker_id: WorkerId,
    tx: mpsc::UnboundedSender<WorkerMessage>,
    finished: bool,
}

impl CallContext {
    pub(crate) fn new(slot: Slot, worker_id: WorkerId, tx: mpsc::UnboundedSender<WorkerMessage>) -> Self {
        Self {
            slot,
            worker_id,
            tx,
            finished: false,
        }
    }

    /// Slot of this call on its worker.
    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// Id of the worker running this call.
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Stream intermediate data to the caller.
    pub fn send<T: Serialize>(&self, data: T) -> Result<(), WorkerError> {
        let data = serde_json::to_value(data)?;
        self.emit(WorkerMessage::Data {
            slot: self.slot,
            worker_id: self.worker_id,
            data,
        })
    }

    /// Finish the call with `output`.
    pub fn complete<T: Serialize>(mut self, output: T) -> Result<(), WorkerError> {
        self.finished = true;
        match serde_json::to_value(output) {
            Ok(data) => self.emit(WorkerMessage::Complete {
                slot: self.slot,
                worker_id: self.worker_id,
                data,
            }),
            Err(e) => self.fail_unserializable(e),
        }
    }

    /// Finish the call with an error payload, delivered to the caller verbatim.
    pub fn error<T: Serialize>(mut self, err: T) -> Result<(), WorkerError> {
        self.finished = true;
        match serde_json::to_value(err) {
            Ok(data) => self.emit(WorkerMessage::Error {
                slot: self.slot,
                worker_id: self.worker_id,
                data,
            }),
            Err(e) => self.fail_unserializable(e),
        }
    }

    /// Finish the call without output.
    pub fn exit(mut self) -> Result<(), WorkerError> {
        self.finished = true;
        self.emit(WorkerMessage::Exit {
            slot: self.slot,
            worker_id: self.worker_id,
        })
    }

    // Still terminate the call so the caller is not left waiting.
    fn fail_unserializable(&self, e: serde_json::Error) -> Result<(), WorkerError> {
        self.emit(WorkerMessage::Error {
            slot: self.slot,
            worker_id: self.worker_id,
            data: Value::String(format!("unserializable task output: {}", e)),
        })?;
        Err(e.into())
    }

    fn emit(&self, message: WorkerMessage) -> Result<(), WorkerError> {
        self.tx.send(message).map_err(|_| WorkerError::Disconnected)
    }
}

impl Drop for CallContext {
    fn drop(&mut self) {
        if !self.finished {
            debug!(
                slot = self.slot,
                worker_id = self.worker_id,
                "call context dropped without a terminal message"
            );
        }
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("slot", &self.slot)
            .field("worker_id", &self.worker_id)
            .field("finished", &self.finished)
            .finish()
    }
}
