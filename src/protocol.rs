// ABOUTME: Worker bootstrap protocol - messages exchanged between the farm
// ABOUTME: and its worker processes, serialized as newline-delimited JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier assigned to each worker by the farm, never reused.
pub type WorkerId = u64;

/// Per-worker index correlating messages with an in-flight call.
pub type Slot = usize;

/// Request from the farm to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// One-time handshake naming the task to load.
    Init {
        worker_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exported_method: Option<String>,
    },

    /// Run the loaded task with `args`.
    Call {
        slot: Slot,
        worker_id: WorkerId,
        args: Vec<Value>,
    },

    /// Exit the worker process immediately.
    Die,
}

/// Message from a worker back to the farm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Intermediate data streamed by the task.
    Data {
        slot: Slot,
        worker_id: WorkerId,
        #[serde(default)]
        data: Value,
    },

    /// The task finished with an output.
    Complete {
        slot: Slot,
        worker_id: WorkerId,
        #[serde(default)]
        data: Value,
    },

    /// The task reported an error.
    Error {
        slot: Slot,
        worker_id: WorkerId,
        #[serde(default)]
        data: Value,
    },

    /// The task ended without output.
    Exit { slot: Slot, worker_id: WorkerId },
}

impl WorkerRequest {
    /// Create the handshake request.
    pub fn init(worker_path: impl Into<String>, exported_method: Option<String>) -> Self {
        Self::Init {
            worker_path: worker_path.into(),
            exported_method,
        }
    }

    /// Serialize to a JSON line (with newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from a JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl WorkerMessage {
    pub fn slot(&self) -> Slot {
        match self {
            Self::Data { slot, .. }
            | Self::Complete { slot, .. }
            | Self::Error { slot, .. }
            | Self::Exit { slot, .. } => *slot,
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        match self {
            Self::Data { worker_id, .. }
            | Self::Complete { worker_id, .. }
            | Self::Error { worker_id, .. }
            | Self::Exit { worker_id, .. } => *worker_id,
        }
    }

    /// Serialize to a JSON line (with newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from a JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}
