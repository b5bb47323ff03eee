// ABOUTME: Root module for procfarm - a crash-resilient worker process pool.
// ABOUTME: Re-exports the farm, its configuration, and the worker-side API.

pub mod config;
pub mod error;
pub mod farm;
pub mod logging;
pub mod prelude;
pub mod protocol;
pub mod transport;
pub mod worker;

pub use config::FarmOptions;
pub use error::{CallError, FarmError, WorkerError};
pub use farm::{CallEvent, CallHandle, Canceller, Farm, FarmStats};
