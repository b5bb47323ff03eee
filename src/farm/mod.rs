// ABOUTME: Farm module - the coordinator, its per-worker handles, and the
// ABOUTME: call records and handles exchanged with callers.

mod call;
#[allow(clippy::module_inception)]
mod farm;
mod handle;

pub use call::{CallEvent, CallHandle};
pub use farm::{Canceller, Farm, FarmStats};

#[cfg(test)]
mod farm_test;
