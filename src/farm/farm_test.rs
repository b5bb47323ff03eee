// ABOUTME: Tests for the Farm coordinator over in-memory workers - dispatch,
// ABOUTME: backpressure, timeouts, crash retries, retirement, and draining.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};

use super::{CallEvent, CallHandle, Farm};
use crate::config::{FarmOptions, UNBOUNDED};
use crate::error::{CallError, FarmError};
use crate::protocol::{WorkerId, WorkerMessage};
use crate::transport::{InMemorySpawner, SpawnedWorker, Spawner};
use crate::worker::{TaskModule, TaskRegistry, task_fn};

const PATH: &str = "tasks/farm";

async fn registry(attempts: Arc<AtomicUsize>) -> TaskRegistry {
    let crash_attempts = Arc::clone(&attempts);
    let flaky_attempts = attempts;

    let registry = TaskRegistry::new();
    registry
        .register(
            PATH,
            TaskModule::new()
                .with_default(task_fn(|args, ctx| async move {
                    let _ = ctx.complete(args.into_iter().next().unwrap_or(Value::Null));
                }))
                .export(
                    "stream",
                    task_fn(|_args, ctx| async move {
                        let _ = ctx.send("a");
                        let _ = ctx.send("b");
                        let _ = ctx.complete("done");
                    }),
                )
                .export(
                    "slow",
                    task_fn(|args, ctx| async move {
                        let ms = args[0].as_u64().unwrap_or(0);
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        let _ = ctx.complete(ms);
                    }),
                )
                .export(
                    "hang",
                    task_fn(|_args, _ctx| async move {
                        std::future::pending::<()>().await;
                    }),
                )
                .export(
                    "fail",
                    task_fn(|_args, ctx| async move {
                        let _ = ctx.error(json!({"code": 42}));
                    }),
                )
                .export(
                    "exit",
                    task_fn(|_args, ctx| async move {
                        let _ = ctx.exit();
                    }),
                )
                .export(
                    "worker_id",
                    task_fn(|_args, ctx| async move {
                        let id = ctx.worker_id();
                        let _ = ctx.complete(id);
                    }),
                )
                .export(
                    "crash",
                    task_fn(move |_args, _ctx| {
                        let attempts = Arc::clone(&crash_attempts);
                        async move {
                            attempts.fetch_add(1, Ordering::SeqCst);
                            panic!("worker crashed");
                        }
                    }),
                )
                .export(
                    "flaky",
                    task_fn(move |_args, ctx| {
                        let attempts = Arc::clone(&flaky_attempts);
                        async move {
                            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                                panic!("flaky worker crashed");
                            }
                            let _ = ctx.complete("recovered");
                        }
                    }),
                ),
        )
        .await;
    registry
}

async fn farm_with_attempts(options: FarmOptions) -> (Farm, Arc<AtomicUsize>) {
    let attempts = Arc::new(AtomicUsize::new(0));
    let spawner = InMemorySpawner::new(registry(Arc::clone(&attempts)).await);
    let farm = Farm::with_spawner(PATH, options, spawner).unwrap();
    (farm, attempts)
}

async fn farm(options: FarmOptions) -> Farm {
    farm_with_attempts(options).await.0
}

async fn within<F: Future>(f: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), f)
        .await
        .expect("farm operation timed out")
}

struct FailingSpawner;

impl Spawner for FailingSpawner {
    fn spawn(&self, _worker_id: WorkerId) -> Result<SpawnedWorker, FarmError> {
        Err(FarmError::Spawn("no workers today".into()))
    }
}

/// Delegates to an in-memory spawner until its spawn budget runs out.
struct LimitedSpawner {
    inner: InMemorySpawner,
    remaining: AtomicUsize,
}

impl Spawner for LimitedSpawner {
    fn spawn(&self, worker_id: WorkerId) -> Result<SpawnedWorker, FarmError> {
        if self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err()
        {
            return Err(FarmError::Spawn("spawn budget spent".into()));
        }
        self.inner.spawn(worker_id)
    }
}

async fn started_on(handle: &mut CallHandle) -> WorkerId {
    match within(handle.recv()).await {
        Some(CallEvent::Started(canceller)) => canceller.worker_id(),
        other => panic!("Expected Started, got {:?}", other),
    }
}

fn complete(farm: &Farm, worker_id: WorkerId, slot: usize, data: Value) {
    farm.shared.lock().receive(WorkerMessage::Complete {
        slot,
        worker_id,
        data,
    });
}

#[tokio::test]
async fn test_complete_payload_matches_index() {
    let farm = farm(FarmOptions::new().max_concurrent_workers(2)).await;

    let handles: Vec<_> = (0..10)
        .map(|i| farm.submit(vec![json!(i)]).unwrap())
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(within(handle.result()).await, Ok(json!(i)));
    }

    farm.end();
    within(farm.drained()).await;
}

#[tokio::test]
async fn test_capacity_exceeded() {
    let farm = farm(
        FarmOptions::new()
            .max_concurrent_workers(1)
            .max_concurrent_calls(2)
            .exported_method("hang"),
    )
    .await;

    let _first = farm.submit(vec![]).unwrap();
    let _second = farm.submit(vec![]).unwrap();

    match farm.submit(vec![]) {
        Err(FarmError::CapacityExceeded { active }) => assert_eq!(active, 2),
        Err(other) => panic!("Expected CapacityExceeded, got {:?}", other),
        Ok(_) => panic!("Expected the third call to be rejected"),
    }
}

#[tokio::test]
async fn test_events_arrive_in_order() {
    let farm = farm(
        FarmOptions::new()
            .max_concurrent_workers(1)
            .exported_method("stream"),
    )
    .await;

    let mut handle = farm.submit(vec![]).unwrap();

    assert!(matches!(within(handle.recv()).await, Some(CallEvent::Started(_))));
    assert!(matches!(within(handle.recv()).await, Some(CallEvent::Data(d)) if d == json!("a")));
    assert!(matches!(within(handle.recv()).await, Some(CallEvent::Data(d)) if d == json!("b")));
    assert!(
        matches!(within(handle.recv()).await, Some(CallEvent::Complete(d)) if d == json!("done"))
    );
    assert!(handle.recv().await.is_none());
}

#[tokio::test]
async fn test_task_error_passes_through() {
    let farm = farm(FarmOptions::new().exported_method("fail")).await;

    let result = within(farm.submit(vec![]).unwrap().result()).await;
    assert_eq!(result, Err(CallError::Task(json!({"code": 42}))));
}

#[tokio::test]
async fn test_exit_event() {
    let farm = farm(FarmOptions::new().exported_method("exit")).await;

    let mut handle = farm.submit(vec![]).unwrap();
    assert!(matches!(within(handle.recv()).await, Some(CallEvent::Started(_))));
    assert!(matches!(within(handle.recv()).await, Some(CallEvent::Exit)));

    let result = within(farm.submit(vec![]).unwrap().result()).await;
    assert_eq!(result, Ok(Value::Null));
}

#[tokio::test]
async fn test_timeout_fails_siblings_and_stops_worker() {
    let farm = farm(
        FarmOptions::new()
            .max_concurrent_workers(1)
            .max_call_time(Duration::from_millis(50))
            .exported_method("hang"),
    )
    .await;

    let handles: Vec<_> = (0..3).map(|_| farm.submit(vec![]).unwrap()).collect();

    for handle in handles {
        assert_eq!(within(handle.result()).await, Err(CallError::Timeout));
    }

    let stats = farm.stats();
    assert_eq!(stats.live_workers, 0);
    assert_eq!(stats.stopping_workers, 0);
    assert_eq!(stats.active_calls, 0);
    assert_eq!(stats.spawned_workers, 1);
}

#[tokio::test]
async fn test_retries_exhausted() {
    let (farm, attempts) = farm_with_attempts(
        FarmOptions::new()
            .max_concurrent_workers(1)
            .max_retries(2)
            .exported_method("crash"),
    )
    .await;

    let result = within(farm.submit(vec![]).unwrap().result()).await;

    assert_eq!(result, Err(CallError::ProcessTerminated { retries: 2 }));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(farm.stats().spawned_workers, 3);
}

#[tokio::test]
async fn test_crash_then_success() {
    let (farm, attempts) = farm_with_attempts(
        FarmOptions::new()
            .max_concurrent_workers(1)
            .exported_method("flaky"),
    )
    .await;

    let result = within(farm.submit(vec![]).unwrap().result()).await;

    assert_eq!(result, Ok(json!("recovered")));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_worker_retired_after_max_calls() {
    let farm = farm(
        FarmOptions::new()
            .max_concurrent_workers(1)
            .max_concurrent_calls_per_worker(1)
            .max_calls_per_worker(2)
            .exported_method("worker_id"),
    )
    .await;

    let handles: Vec<_> = (0..3).map(|_| farm.submit(vec![]).unwrap()).collect();
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(within(handle.result()).await.unwrap());
    }

    assert_eq!(ids[0], ids[1]);
    assert_ne!(ids[1], ids[2]);
    assert_eq!(farm.stats().spawned_workers, 2);
}

#[tokio::test]
async fn test_round_robin_spreads_calls() {
    let farm = farm(
        FarmOptions::new()
            .max_concurrent_workers(3)
            .exported_method("worker_id"),
    )
    .await;

    let handles: Vec<_> = (0..3).map(|_| farm.submit(vec![]).unwrap()).collect();
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(within(handle.result()).await.unwrap());
    }
    ids.sort_by_key(|id| id.as_u64());

    assert_eq!(ids, vec![json!(1), json!(2), json!(3)]);
}

#[tokio::test]
async fn test_round_robin_cycles_through_started_pool() {
    let farm = farm(
        FarmOptions::new()
            .max_concurrent_workers(3)
            .max_concurrent_calls_per_worker(1)
            .auto_start(true)
            .exported_method("hang"),
    )
    .await;

    let mut handles: Vec<_> = (0..6).map(|_| farm.submit(vec![]).unwrap()).collect();

    let stats = farm.stats();
    assert_eq!(stats.active_calls, 3);
    assert_eq!(stats.queued_calls, 3);

    let mut ids = Vec::new();
    for handle in handles.iter_mut().take(3) {
        ids.push(started_on(handle).await);
    }
    assert_eq!(ids, vec![1, 2, 3]);

    // Freeing each worker in turn hands it the next queued call.
    for worker_id in 1..=3 {
        complete(&farm, worker_id, 0, json!("freed"));
    }
    for handle in handles.iter_mut().take(3) {
        assert!(matches!(within(handle.recv()).await, Some(CallEvent::Complete(_))));
    }
    for handle in handles.iter_mut().skip(3) {
        ids.push(started_on(handle).await);
    }

    assert_eq!(ids, vec![1, 2, 3, 1, 2, 3]);
    assert_eq!(farm.stats().spawned_workers, 3);
}

#[tokio::test]
async fn test_round_robin_rotates_per_call() {
    let farm = farm(
        FarmOptions::new()
            .max_concurrent_workers(3)
            .max_concurrent_calls_per_worker(2)
            .auto_start(true)
            .exported_method("hang"),
    )
    .await;

    let mut handles: Vec<_> = (0..7).map(|_| farm.submit(vec![]).unwrap()).collect();

    let mut ids = Vec::new();
    for handle in handles.iter_mut().take(6) {
        ids.push(started_on(handle).await);
    }
    assert_eq!(ids, vec![1, 2, 3, 1, 2, 3]);

    let stats = farm.stats();
    assert_eq!(stats.active_calls, 6);
    assert_eq!(stats.queued_calls, 1);
}

#[tokio::test]
async fn test_retirement_waits_for_last_call() {
    let farm = farm(
        FarmOptions::new()
            .max_concurrent_workers(1)
            .max_concurrent_calls_per_worker(2)
            .max_calls_per_worker(2)
            .exported_method("hang"),
    )
    .await;

    let first = farm.submit(vec![]).unwrap();
    let second = farm.submit(vec![]).unwrap();
    assert_eq!(farm.stats().active_calls, 2);

    // The budget is spent, but a call is still in flight.
    complete(&farm, 1, 0, json!("first"));
    assert_eq!(within(first.result()).await, Ok(json!("first")));
    let stats = farm.stats();
    assert_eq!(stats.live_workers, 1);
    assert_eq!(stats.active_calls, 1);

    complete(&farm, 1, 1, json!("second"));
    assert_eq!(within(second.result()).await, Ok(json!("second")));
    let stats = farm.stats();
    assert_eq!(stats.live_workers, 0);
    assert_eq!(stats.stopping_workers, 0);
    assert_eq!(stats.spawned_workers, 1);
}

#[tokio::test]
async fn test_requeued_call_fails_when_no_worker_can_spawn() {
    let registry = registry(Arc::new(AtomicUsize::new(0))).await;
    let spawner = LimitedSpawner {
        inner: InMemorySpawner::new(registry),
        remaining: AtomicUsize::new(1),
    };
    let farm = Farm::with_spawner(
        PATH,
        FarmOptions::new()
            .max_concurrent_workers(1)
            .exported_method("crash"),
        spawner,
    )
    .unwrap();

    let result = within(farm.submit(vec![]).unwrap().result()).await;
    match result {
        Err(CallError::SpawnFailed(msg)) => assert!(msg.contains("spawn budget spent")),
        other => panic!("Expected SpawnFailed, got {:?}", other),
    }

    let stats = farm.stats();
    assert_eq!(stats.queued_calls, 0);
    assert_eq!(stats.live_workers, 0);

    farm.end();
    within(farm.drained()).await;
}

#[tokio::test]
async fn test_end_drains_and_rejects_new_calls() {
    let farm = farm(
        FarmOptions::new()
            .max_concurrent_workers(2)
            .exported_method("slow"),
    )
    .await;

    let first = farm.submit(vec![json!(50)]).unwrap();
    let second = farm.submit(vec![json!(50)]).unwrap();
    farm.end();

    assert!(farm.stats().ending);
    assert!(matches!(farm.submit(vec![json!(1)]), Err(FarmError::Ending)));

    assert_eq!(within(first.result()).await, Ok(json!(50)));
    assert_eq!(within(second.result()).await, Ok(json!(50)));
    within(farm.drained()).await;

    let stats = farm.stats();
    assert_eq!(stats.live_workers, 0);
    assert_eq!(stats.stopping_workers, 0);
    assert_eq!(stats.spawned_workers, 2);
}

#[tokio::test]
async fn test_end_is_idempotent() {
    let farm = farm(
        FarmOptions::new()
            .max_concurrent_workers(3)
            .auto_start(true),
    )
    .await;

    assert_eq!(farm.stats().live_workers, 3);

    farm.end();
    farm.end();
    within(farm.drained()).await;

    let stats = farm.stats();
    assert_eq!(stats.live_workers, 0);
    assert_eq!(stats.spawned_workers, 3);
}

#[tokio::test]
async fn test_auto_start_requires_bounded_pool() {
    let spawner = InMemorySpawner::new(TaskRegistry::new());
    let result = Farm::with_spawner(
        PATH,
        FarmOptions::new()
            .auto_start(true)
            .max_concurrent_workers(UNBOUNDED),
        spawner,
    );

    assert!(matches!(result, Err(FarmError::Config(_))));
}

#[tokio::test]
async fn test_submit_fails_when_no_worker_can_spawn() {
    let farm = Farm::with_spawner(PATH, FarmOptions::new(), FailingSpawner).unwrap();

    match farm.submit(vec![]) {
        Err(FarmError::Spawn(msg)) => assert!(msg.contains("no workers today")),
        Err(other) => panic!("Expected Spawn error, got {:?}", other),
        Ok(_) => panic!("Expected submit to fail"),
    }
    assert_eq!(farm.stats().queued_calls, 0);
}

#[tokio::test]
async fn test_calls_queue_behind_busy_worker() {
    let farm = farm(
        FarmOptions::new()
            .max_concurrent_workers(1)
            .max_concurrent_calls_per_worker(1)
            .exported_method("hang"),
    )
    .await;

    let _handles: Vec<_> = (0..3).map(|_| farm.submit(vec![]).unwrap()).collect();

    let stats = farm.stats();
    assert_eq!(stats.live_workers, 1);
    assert_eq!(stats.active_calls, 1);
    assert_eq!(stats.queued_calls, 2);
}

#[tokio::test]
async fn test_cancel_terminates_worker_calls() {
    let farm = farm(
        FarmOptions::new()
            .max_concurrent_workers(1)
            .max_retries(0)
            .exported_method("hang"),
    )
    .await;

    let mut first = farm.submit(vec![]).unwrap();
    let sibling = farm.submit(vec![]).unwrap();

    let canceller = match within(first.recv()).await {
        Some(CallEvent::Started(canceller)) => canceller,
        other => panic!("Expected Started, got {:?}", other),
    };
    assert_eq!(canceller.worker_id(), 1);
    canceller.cancel();

    let terminated = Err(CallError::ProcessTerminated { retries: 0 });
    assert_eq!(within(first.result()).await, terminated);
    assert_eq!(within(sibling.result()).await, terminated);
    assert_eq!(farm.stats().stopping_workers, 0);
}

#[tokio::test]
async fn test_drop_abandons_calls() {
    let farm = farm(FarmOptions::new().exported_method("hang")).await;

    let handle = farm.submit(vec![]).unwrap();
    drop(farm);

    assert_eq!(within(handle.result()).await, Err(CallError::Abandoned));
}

#[tokio::test]
async fn test_unmatched_messages_dropped() {
    let farm = farm(
        FarmOptions::new()
            .max_concurrent_workers(1)
            .exported_method("hang"),
    )
    .await;

    let mut handle = farm.submit(vec![]).unwrap();
    let worker_id = match within(handle.recv()).await {
        Some(CallEvent::Started(canceller)) => canceller.worker_id(),
        other => panic!("Expected Started, got {:?}", other),
    };

    {
        let mut state = farm.shared.lock();
        state.receive(WorkerMessage::Complete {
            slot: 0,
            worker_id: 99,
            data: json!("unknown worker"),
        });
        state.receive(WorkerMessage::Complete {
            slot: 5,
            worker_id,
            data: json!("unknown slot"),
        });
    }
    assert_eq!(farm.stats().active_calls, 1);

    farm.shared.lock().receive(WorkerMessage::Complete {
        slot: 0,
        worker_id,
        data: json!("routed"),
    });
    assert_eq!(within(handle.result()).await, Ok(json!("routed")));
}
