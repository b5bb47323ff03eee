// ABOUTME: Worker executable used by the integration tests. Serves the
// ABOUTME: "fixtures" task module over stdin/stdout when started by a farm.

use std::time::Duration;

use procfarm::logging;
use procfarm::worker::{self, TaskModule, TaskRegistry, task_fn};
use serde_json::{Value, json};

/// Exit code for deliberate crashes.
const CRASH_EXIT: i32 = 3;

async fn fixtures() -> TaskRegistry {
    let registry = TaskRegistry::new();
    registry
        .register(
            "fixtures",
            TaskModule::new()
                .with_default(task_fn(|args, ctx| async move {
                    let _ = ctx.send("data");
                    let _ = ctx.complete(args.into_iter().next().unwrap_or(Value::Null));
                }))
                .export(
                    "shout",
                    task_fn(|args, ctx| async move {
                        let text = args.first().and_then(Value::as_str).unwrap_or_default();
                        let _ = ctx.complete(text.to_uppercase());
                    }),
                )
                .export(
                    "sleep",
                    task_fn(|args, ctx| async move {
                        let ms = args.first().and_then(Value::as_u64).unwrap_or(0);
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
                    "crash",
                    task_fn(|_args, _ctx| async move {
                        std::process::exit(CRASH_EXIT);
                    }),
                )
                // Crashes until the counter file at args[0] reaches args[1].
                .export(
                    "flaky",
                    task_fn(|args, ctx| async move {
                        let path = args.first().and_then(Value::as_str).unwrap_or_default();
                        let crashes = args.get(1).and_then(Value::as_u64).unwrap_or(0);

                        let seen: u64 = tokio::fs::read_to_string(path)
                            .await
                            .ok()
                            .and_then(|s| s.trim().parse().ok())
                            .unwrap_or(0);
                        if tokio::fs::write(path, (seen + 1).to_string()).await.is_err() {
                            let _ = ctx.error(format!("cannot write counter file {}", path));
                            return;
                        }

                        if seen < crashes {
                            std::process::exit(CRASH_EXIT);
                        }
                        let _ = ctx.complete(json!({ "attempts": seen + 1 }));
                    }),
                )
                .export(
                    "pid",
                    task_fn(|_args, ctx| async move {
                        let _ = ctx.complete(std::process::id());
                    }),
                )
                .export(
                    "fail",
                    task_fn(|args, ctx| async move {
                        let _ = ctx.error(json!({ "message": "fixture failure", "args": args }));
                    }),
                ),
        )
        .await;
    registry
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    if !worker::is_worker_process() {
        anyhow::bail!("procfarm-fixture-worker must be started by a farm");
    }

    let result = worker::run(fixtures().await).await;
    if let Err(e) = &result {
        tracing::error!(error = %e, "worker failed");
    }
    std::process::exit(worker::exit_code(&result));
}
