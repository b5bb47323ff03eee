// ABOUTME: Defines all error types for the procfarm library using thiserror.
// ABOUTME: Caller-facing farm errors, per-call errors, and worker-side errors.

use serde_json::Value;

/// Errors returned synchronously by the farm API.
#[derive(Debug, thiserror::Error)]
pub enum FarmError {
    #[error("Too many concurrent calls ({active})")]
    CapacityExceeded { active: usize },

    #[error("Farm is ending and no longer accepts calls")]
    Ending,

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Errors delivered to a single call through its handle.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    /// The call exceeded `max_call_time`, or shared a worker with one that did.
    #[error("worker call timed out")]
    Timeout,

    /// The worker crashed and the call has no retries left.
    #[error("cancel after {retries} retries")]
    ProcessTerminated { retries: u32 },

    /// The task reported an error; the payload is passed through verbatim.
    #[error("task error: {0}")]
    Task(Value),

    /// No worker was alive to run the call and none could be started.
    #[error("no worker available: {0}")]
    SpawnFailed(String),

    /// The farm was dropped before the call reached a terminal event.
    #[error("farm dropped before the call finished")]
    Abandoned,
}

/// Errors raised inside a worker process.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Failed to load task '{path}': {message}")]
    Load { path: String, message: String },

    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    #[error("Coordinator channel closed")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
