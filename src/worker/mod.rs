// ABOUTME: Worker side of the farm - task contract, loader registry, and the
// ABOUTME: runtime loop that serves the bootstrap protocol inside a worker.

mod context;
mod registry;
mod runtime;
mod task;

pub use context::CallContext;
pub use registry::{TaskModule, TaskRegistry};
pub use runtime::{exit_code, is_worker_process, run, serve};
pub use task::{Task, TaskFn, TaskLoader, task_fn};
