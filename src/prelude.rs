// ABOUTME: Prelude module - convenient imports for common use cases.
// ABOUTME: Use `use procfarm::prelude::*;` to get started quickly.

pub use crate::config::{FarmOptions, UNBOUNDED};
pub use crate::error::{CallError, FarmError, WorkerError};
pub use crate::farm::{CallEvent, CallHandle, Canceller, Farm, FarmStats};
pub use crate::transport::{InMemorySpawner, ProcessSpawner, Spawner};
pub use crate::worker::{
    CallContext, Task, TaskLoader, TaskModule, TaskRegistry, is_worker_process, task_fn,
};
