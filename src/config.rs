// ABOUTME: Farm configuration - concurrency limits, retry budget, timeouts.
// ABOUTME: Loadable from serde sources or PROCFARM_* environment variables.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FarmError;

/// Sentinel for limits that are not enforced.
pub const UNBOUNDED: usize = usize::MAX;

/// Options controlling a [`Farm`](crate::Farm).
///
/// All limits are hard limits. Unset limits default to unbounded, except
/// `max_concurrent_workers` (host CPU count) and
/// `max_concurrent_calls_per_worker` (10).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FarmOptions {
    /// Spawn `max_concurrent_workers` workers when the farm is created.
    pub auto_start: bool,

    /// Named export to run instead of the task module's default export.
    pub exported_method: Option<String>,

    /// Lifetime calls a worker serves before it is retired.
    pub max_calls_per_worker: usize,

    /// Wall-clock limit for a single call.
    #[serde(rename = "max_call_time_ms", with = "duration_ms")]
    pub max_call_time: Option<Duration>,

    /// Pool size ceiling.
    pub max_concurrent_workers: usize,

    /// Calls a single worker runs at the same time.
    pub max_concurrent_calls_per_worker: usize,

    /// In-flight calls across the whole farm before submissions are rejected.
    pub max_concurrent_calls: usize,

    /// Times a call is retried after its worker crashes.
    pub max_retries: u32,
}

impl Default for FarmOptions {
    fn default() -> Self {
        Self {
            auto_start: false,
            exported_method: None,
            max_calls_per_worker: UNBOUNDED,
            max_call_time: None,
            max_concurrent_workers: default_worker_count(),
            max_concurrent_calls_per_worker: 10,
            max_concurrent_calls: UNBOUNDED,
            max_retries: u32::MAX,
        }
    }
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl FarmOptions {
    /// Create options with the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load options from `PROCFARM_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self, FarmError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, FarmError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut options = Self::default();

        if let Some(v) = parse_var(&lookup, "PROCFARM_AUTO_START")? {
            options.auto_start = v;
        }
        if let Some(v) = lookup("PROCFARM_EXPORTED_METHOD") {
            options.exported_method = Some(v);
        }
        if let Some(v) = parse_var(&lookup, "PROCFARM_MAX_CALLS_PER_WORKER")? {
            options.max_calls_per_worker = v;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "PROCFARM_MAX_CALL_TIME_MS")? {
            options.max_call_time = Some(Duration::from_millis(ms));
        }
        if let Some(v) = parse_var(&lookup, "PROCFARM_MAX_CONCURRENT_WORKERS")? {
            options.max_concurrent_workers = v;
        }
        if let Some(v) = parse_var(&lookup, "PROCFARM_MAX_CONCURRENT_CALLS_PER_WORKER")? {
            options.max_concurrent_calls_per_worker = v;
        }
        if let Some(v) = parse_var(&lookup, "PROCFARM_MAX_CONCURRENT_CALLS")? {
            options.max_concurrent_calls = v;
        }
        if let Some(v) = parse_var(&lookup, "PROCFARM_MAX_RETRIES")? {
            options.max_retries = v;
        }

        Ok(options)
    }

    /// Reject option combinations a farm cannot run with.
    pub fn validate(&self) -> Result<(), FarmError> {
        if self.max_concurrent_workers == 0 {
            return Err(FarmError::Config(
                "max_concurrent_workers must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_calls_per_worker == 0 {
            return Err(FarmError::Config(
                "max_concurrent_calls_per_worker must be at least 1".to_string(),
            ));
        }
        if self.auto_start && self.max_concurrent_workers == UNBOUNDED {
            return Err(FarmError::Config(
                "auto_start requires a bounded max_concurrent_workers".to_string(),
            ));
        }
        Ok(())
    }

    /// Eagerly spawn the full pool on construction.
    pub fn auto_start(mut self, enabled: bool) -> Self {
        self.auto_start = enabled;
        self
    }

    /// Run a named export instead of the default one.
    pub fn exported_method(mut self, name: impl Into<String>) -> Self {
        self.exported_method = Some(name.into());
        self
    }

    /// Retire workers after this many calls.
    pub fn max_calls_per_worker(mut self, max: usize) -> Self {
        self.max_calls_per_worker = max;
        self
    }

    /// Time out calls that run longer than `limit`.
    pub fn max_call_time(mut self, limit: Duration) -> Self {
        self.max_call_time = Some(limit);
        self
    }

    /// Set the pool size ceiling.
    pub fn max_concurrent_workers(mut self, max: usize) -> Self {
        self.max_concurrent_workers = max;
        self
    }

    /// Set how many calls one worker runs at once.
    pub fn max_concurrent_calls_per_worker(mut self, max: usize) -> Self {
        self.max_concurrent_calls_per_worker = max;
        self
    }

    /// Set the global in-flight call ceiling.
    pub fn max_concurrent_calls(mut self, max: usize) -> Self {
        self.max_concurrent_calls = max;
        self
    }

    /// Set the per-call retry budget.
    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, FarmError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| FarmError::Config(format!("{}={:?}: {}", key, raw, e))),
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
