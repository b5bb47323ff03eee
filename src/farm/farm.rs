// ABOUTME: The Farm coordinator - queues calls, dispatches them round-robin to
// ABOUTME: workers, and handles timeouts, crashes, retirement, and draining.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use super::call::{CallEvent, CallHandle, CallRecord};
use super::handle::WorkerProcess;
use crate::config::FarmOptions;
use crate::error::{CallError, FarmError};
use crate::protocol::{Slot, WorkerId, WorkerMessage, WorkerRequest};
use crate::transport::{ProcessSpawner, SpawnedWorker, Spawner};

/// How long a stopped worker gets to exit before it is killed.
const KILL_GRACE: Duration = Duration::from_millis(100);

/// Delay between a worker's exit and crash handling.
const EXIT_DEBOUNCE: Duration = Duration::from_millis(10);

/// A pool of worker processes running one task.
///
/// Calls are queued FIFO and dispatched round-robin to workers with spare
/// capacity. Calls lost to a worker crash are retried at the front of the
/// queue up to `max_retries` times.
///
/// Every method must be called from within a Tokio runtime. Dropping the
/// farm stops all workers; calls that have not finished resolve to
/// [`CallError::Abandoned`].
///
/// # Example
///
/// ```ignore
/// let farm = Farm::new("tasks/resize", FarmOptions::new().max_concurrent_workers(4))?;
/// let output = farm.submit(vec![json!("photo.jpg")])?.result().await?;
/// farm.end();
/// farm.drained().await;
/// ```
pub struct Farm {
    pub(crate) shared: Arc<Shared>,
}

/// Point-in-time counters for a farm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FarmStats {
    /// Workers that accept calls.
    pub live_workers: usize,
    /// Workers told to die that still hold calls.
    pub stopping_workers: usize,
    /// Calls dispatched to a worker and not yet finished.
    pub active_calls: usize,
    /// Calls waiting for a worker.
    pub queued_calls: usize,
    /// Workers spawned over the farm's lifetime.
    pub spawned_workers: u64,
    /// Whether `end()` has been called.
    pub ending: bool,
}

impl Farm {
    /// Create a farm whose workers re-execute the current binary.
    ///
    /// The binary must check [`is_worker_process`](crate::worker::is_worker_process)
    /// at startup and serve `worker_path` through [`worker::run`](crate::worker::run).
    pub fn new(worker_path: impl Into<String>, options: FarmOptions) -> Result<Self, FarmError> {
        Self::with_spawner(worker_path, options, ProcessSpawner::current_exe()?)
    }

    /// Create a farm that starts workers through `spawner`.
    pub fn with_spawner<S: Spawner + 'static>(
        worker_path: impl Into<String>,
        options: FarmOptions,
        spawner: S,
    ) -> Result<Self, FarmError> {
        options.validate()?;

        let drained = Arc::new(Notify::new());
        let worker_path = worker_path.into();
        let shared = Arc::new_cyclic(|me| Shared {
            state: Mutex::new(FarmState {
                me: me.clone(),
                worker_path,
                options,
                spawner: Arc::new(spawner),
                next_worker_id: 0,
                workers: BTreeMap::new(),
                stopping: HashMap::new(),
                queue: VecDeque::new(),
                ending: false,
                search_start: None,
                next_timer_token: 0,
                drained: Arc::clone(&drained),
            }),
            drained,
        });
        let farm = Self { shared };

        {
            let mut state = farm.shared.lock();
            if state.options.auto_start {
                while state.workers.len() < state.options.max_concurrent_workers {
                    state.start_worker()?;
                }
            }
        }

        Ok(farm)
    }

    /// Queue a call and return its handle.
    ///
    /// Fails with [`FarmError::CapacityExceeded`] when `max_concurrent_calls`
    /// calls are already running, with [`FarmError::Ending`] after
    /// [`end`](Self::end), and with [`FarmError::Spawn`] when no worker is
    /// alive and none can be started.
    pub fn submit(&self, args: Vec<Value>) -> Result<CallHandle, FarmError> {
        let mut state = self.shared.lock();
        if state.ending {
            return Err(FarmError::Ending);
        }

        let active = state.active_calls();
        if active >= state.options.max_concurrent_calls {
            warn!(active, "rejecting call: too many concurrent calls");
            return Err(FarmError::CapacityExceeded { active });
        }

        let (record, handle) = CallRecord::new(args);
        state.queue.push_back(record);

        if let Err(e) = state.process_queue() {
            if state.workers.is_empty() {
                state.queue.pop_back();
                state.fail_queue(&e);
                return Err(e);
            }
            warn!(error = %e, "failed to grow worker pool");
        }

        Ok(handle)
    }

    /// Stop accepting calls and let the pool drain.
    ///
    /// Idle workers stop at once; busy workers stop when their last call
    /// finishes and the queue is empty. Calling `end` again has no effect.
    pub fn end(&self) {
        let mut state = self.shared.lock();
        if state.ending {
            return;
        }
        info!(
            live = state.workers.len(),
            queued = state.queue.len(),
            "farm ending"
        );
        state.ending = true;
        state.stop_idle_workers();
    }

    /// Wait until [`end`](Self::end) has been called and no worker remains.
    pub async fn drained(&self) {
        loop {
            let notified = self.shared.drained.notified();
            if self.shared.lock().is_drained() {
                return;
            }
            notified.await;
        }
    }

    pub fn stats(&self) -> FarmStats {
        let state = self.shared.lock();
        FarmStats {
            live_workers: state.workers.len(),
            stopping_workers: state.stopping.len(),
            active_calls: state.active_calls(),
            queued_calls: state.queue.len(),
            spawned_workers: state.next_worker_id,
            ending: state.ending,
        }
    }
}

impl Drop for Farm {
    fn drop(&mut self) {
        self.shared.lock().shutdown();
    }
}

/// Stops the worker a call was dispatched to.
///
/// Other calls on that worker go through crash handling: they are retried
/// while their retry budget lasts.
#[derive(Debug, Clone)]
pub struct Canceller {
    shared: Weak<Shared>,
    worker_id: WorkerId,
}

impl Canceller {
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Stop the worker. Has no effect once it is already stopping or gone.
    pub fn cancel(&self) {
        if let Some(shared) = self.shared.upgrade() {
            let mut state = shared.lock();
            debug!(worker_id = self.worker_id, "cancelling worker");
            state.stop_worker(self.worker_id);
            state.dispatch();
        }
    }
}

pub(crate) struct Shared {
    state: Mutex<FarmState>,
    drained: Arc<Notify>,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, FarmState> {
        self.state.lock()
    }
}

/// Everything the coordinator knows. Each event is handled in one critical
/// section of the surrounding mutex.
pub(crate) struct FarmState {
    me: Weak<Shared>,
    worker_path: String,
    pub(crate) options: FarmOptions,
    spawner: Arc<dyn Spawner>,
    next_worker_id: WorkerId,
    pub(crate) workers: BTreeMap<WorkerId, WorkerProcess>,
    pub(crate) stopping: HashMap<WorkerId, WorkerProcess>,
    pub(crate) queue: VecDeque<CallRecord>,
    ending: bool,
    search_start: Option<usize>,
    next_timer_token: u64,
    drained: Arc<Notify>,
}

impl FarmState {
    pub(crate) fn active_calls(&self) -> usize {
        self.workers
            .values()
            .chain(self.stopping.values())
            .map(WorkerProcess::active_calls)
            .sum()
    }

    fn is_drained(&self) -> bool {
        self.ending && self.workers.is_empty() && self.stopping.is_empty() && self.queue.is_empty()
    }

    fn check_drained(&self) {
        if self.is_drained() {
            debug!("farm drained");
            self.drained.notify_waiters();
        }
    }

    /// Run `process_queue`, logging a spawn failure. With no live worker left
    /// the queue can never drain, so its calls fail instead.
    fn dispatch(&mut self) {
        if let Err(e) = self.process_queue() {
            if self.workers.is_empty() {
                self.fail_queue(&e);
            } else {
                warn!(error = %e, "failed to grow worker pool");
            }
        }
    }

    fn fail_queue(&mut self, cause: &FarmError) {
        if self.queue.is_empty() {
            return;
        }
        error!(error = %cause, queued = self.queue.len(), "no worker available; failing queued calls");
        for call in self.queue.drain(..) {
            call.emit(CallEvent::Error(CallError::SpawnFailed(cause.to_string())));
        }
        self.check_drained();
    }

    /// Hand queued calls to workers with spare capacity.
    ///
    /// Grows the pool by one worker per invocation while below the ceiling.
    /// Dispatch still runs when growing fails; the error is returned after.
    pub(crate) fn process_queue(&mut self) -> Result<(), FarmError> {
        if self.queue.is_empty() {
            if self.ending {
                self.stop_idle_workers();
            }
            return Ok(());
        }

        let grown = if self.workers.len() < self.options.max_concurrent_workers {
            self.start_worker().map(|_| ())
        } else {
            Ok(())
        };

        let per_worker = self.options.max_concurrent_calls_per_worker;
        let lifetime = self.options.max_calls_per_worker;

        loop {
            let mut dispatched = false;
            for worker_id in self.rotated_worker_ids() {
                if self.queue.is_empty() {
                    break;
                }
                let eligible = self
                    .workers
                    .get(&worker_id)
                    .is_some_and(|w| w.has_capacity(per_worker, lifetime));
                if !eligible {
                    continue;
                }
                if let Some(call) = self.queue.pop_front() {
                    self.send(worker_id, call);
                    dispatched = true;
                }
            }

            if !dispatched || self.queue.is_empty() {
                break;
            }
        }

        if self.ending {
            self.stop_idle_workers();
        }

        grown
    }

    /// Live worker ids, starting one past the previous round's start.
    fn rotated_worker_ids(&mut self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self.workers.keys().copied().collect();
        if ids.is_empty() {
            return ids;
        }

        let start = match self.search_start {
            Some(previous) if previous + 1 < ids.len() => previous + 1,
            _ => 0,
        };
        self.search_start = Some(start);
        ids.rotate_left(start);
        ids
    }

    fn send(&mut self, worker_id: WorkerId, mut call: CallRecord) {
        if !self.workers.contains_key(&worker_id) {
            warn!(worker_id, "dispatch to missing worker; requeueing call");
            self.queue.push_front(call);
            return;
        }

        call.emit(CallEvent::Started(Canceller {
            shared: self.me.clone(),
            worker_id,
        }));

        if let Some(limit) = self.options.max_call_time {
            self.next_timer_token += 1;
            let token = self.next_timer_token;
            let abort = spawn_call_timer(self.me.clone(), worker_id, token, limit);
            call.arm_timer(token, abort);
        }

        let Some(worker) = self.workers.get_mut(&worker_id) else {
            return;
        };

        let args = call.args.clone();
        let slot = worker.assign(call);
        debug!(worker_id, slot, active = worker.active_calls(), "call dispatched");

        if !worker.link().send(WorkerRequest::Call {
            slot,
            worker_id,
            args,
        }) {
            warn!(worker_id, slot, "worker channel closed; call awaits crash handling");
        }
    }

    /// Route a message from a worker to its call and re-run dispatch.
    pub(crate) fn receive(&mut self, message: WorkerMessage) {
        let worker_id = message.worker_id();
        let slot = message.slot();
        let event = match message {
            WorkerMessage::Data { data, .. } => CallEvent::Data(data),
            WorkerMessage::Complete { data, .. } => CallEvent::Complete(data),
            WorkerMessage::Error { data, .. } => CallEvent::Error(CallError::Task(data)),
            WorkerMessage::Exit { .. } => CallEvent::Exit,
        };

        self.deliver(worker_id, slot, event);
        self.dispatch();
    }

    fn deliver(&mut self, worker_id: WorkerId, slot: Slot, event: CallEvent) {
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            warn!(worker_id, slot, "dropping message from unknown worker");
            return;
        };
        let Some(call) = worker.call_mut(slot) else {
            warn!(worker_id, slot, "dropping message for unknown call");
            return;
        };

        let terminal = event.is_terminal();
        call.clear_timer();
        call.emit(event);
        if !terminal {
            return;
        }

        worker.take(slot);
        let retire =
            worker.is_idle() && worker.total_calls() >= self.options.max_calls_per_worker;
        if retire {
            info!(worker_id, calls = worker.total_calls(), "retiring worker");
            self.stop_worker(worker_id);
        }
    }

    fn on_call_timeout(&mut self, worker_id: WorkerId, token: u64) {
        let Some(worker) = self.workers.get(&worker_id) else {
            return;
        };
        if !worker.has_timer(token) {
            return;
        }

        let slots = worker.occupied_slots();
        warn!(worker_id, calls = slots.len(), "call timed out; stopping worker");
        for slot in slots {
            self.deliver(worker_id, slot, CallEvent::Error(CallError::Timeout));
        }
        self.stop_worker(worker_id);
        self.dispatch();
    }

    /// Tell a worker to die and take it out of rotation.
    ///
    /// A worker still holding calls is parked until it exits so those calls
    /// go through crash handling.
    pub(crate) fn stop_worker(&mut self, worker_id: WorkerId) {
        let closed = match self.workers.get(&worker_id) {
            Some(worker) => worker.link().is_closed(),
            None => return,
        };
        if closed {
            return;
        }
        let Some(mut worker) = self.workers.remove(&worker_id) else {
            return;
        };

        worker.link().send(WorkerRequest::Die);
        if let Some(kill) = worker.link_mut().take_kill() {
            arm_kill_timer(worker_id, kill);
        }

        if worker.is_idle() {
            debug!(worker_id, "worker stopped");
        } else {
            debug!(worker_id, calls = worker.active_calls(), "worker stopping with calls in flight");
            self.stopping.insert(worker_id, worker);
        }
        self.check_drained();
    }

    fn stop_idle_workers(&mut self) {
        let idle: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, w)| w.is_idle())
            .map(|(id, _)| *id)
            .collect();
        for worker_id in idle {
            self.stop_worker(worker_id);
        }
        self.check_drained();
    }

    fn start_worker(&mut self) -> Result<WorkerId, FarmError> {
        self.next_worker_id += 1;
        let worker_id = self.next_worker_id;

        let SpawnedWorker {
            link,
            messages,
            exited,
        } = self.spawner.spawn(worker_id)?;

        if !link.send(WorkerRequest::init(
            self.worker_path.clone(),
            self.options.exported_method.clone(),
        )) {
            warn!(worker_id, "worker channel closed before handshake");
        }
        self.workers.insert(worker_id, WorkerProcess::new(link));
        tokio::spawn(pump(self.me.clone(), worker_id, messages, exited));

        info!(worker_id, live = self.workers.len(), "worker started");
        Ok(worker_id)
    }

    /// Requeue or fail the calls of a worker that has exited.
    fn on_exit(&mut self, worker_id: WorkerId, code: Option<i32>) {
        let worker = self
            .workers
            .remove(&worker_id)
            .or_else(|| self.stopping.remove(&worker_id));
        let Some(mut worker) = worker else {
            debug!(worker_id, exit_code = ?code, "stopped worker exited");
            return;
        };
        worker.set_exit_code(code);

        let calls = worker.drain_calls();
        if calls.is_empty() {
            info!(worker_id, exit_code = ?worker.exit_code(), "worker exited");
        } else {
            warn!(
                worker_id,
                exit_code = ?worker.exit_code(),
                calls = calls.len(),
                "worker exited with calls in flight"
            );
        }

        for mut call in calls.into_iter().rev() {
            call.clear_timer();
            if call.retries >= self.options.max_retries {
                call.emit(CallEvent::Error(CallError::ProcessTerminated {
                    retries: call.retries,
                }));
            } else {
                call.retries += 1;
                self.queue.push_front(call);
            }
        }

        self.check_drained();
        self.dispatch();
    }

    /// Tear down everything. Pending calls are dropped, so their handles
    /// resolve as abandoned.
    fn shutdown(&mut self) {
        self.ending = true;
        let ids: Vec<WorkerId> = self.workers.keys().copied().collect();
        for worker_id in ids {
            self.stop_worker(worker_id);
        }
        self.workers.clear();
        self.stopping.clear();
        self.queue.clear();
        self.drained.notify_waiters();
    }
}

/// Forward a worker's messages into the farm, then report its exit.
async fn pump(
    shared: Weak<Shared>,
    worker_id: WorkerId,
    mut messages: mpsc::UnboundedReceiver<WorkerMessage>,
    exited: oneshot::Receiver<Option<i32>>,
) {
    while let Some(message) = messages.recv().await {
        let Some(farm) = shared.upgrade() else {
            return;
        };
        farm.lock().receive(message);
    }

    let code = exited.await.unwrap_or(None);
    tokio::time::sleep(EXIT_DEBOUNCE).await;

    if let Some(farm) = shared.upgrade() {
        farm.lock().on_exit(worker_id, code);
    }
}

fn spawn_call_timer(
    shared: Weak<Shared>,
    worker_id: WorkerId,
    token: u64,
    limit: Duration,
) -> AbortHandle {
    tokio::spawn(async move {
        tokio::time::sleep(limit).await;
        if let Some(farm) = shared.upgrade() {
            farm.lock().on_call_timeout(worker_id, token);
        }
    })
    .abort_handle()
}

fn arm_kill_timer(worker_id: WorkerId, kill: oneshot::Sender<()>) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                tokio::time::sleep(KILL_GRACE).await;
                if kill.send(()).is_ok() {
                    debug!(worker_id, "kill grace elapsed");
                }
            });
        }
        Err(_) => {
            let _ = kill.send(());
        }
    }
}
