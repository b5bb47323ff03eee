// ABOUTME: Demo farm that runs ten calls on workers re-executed from this
// ABOUTME: binary. Each worker streams "data" and then echoes its index.

use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use serde_json::{Value, json};

use procfarm::prelude::*;
use procfarm::{logging, worker};

const WORKER_PATH: &str = "demo/index";

/// Task module served by worker processes. The default export and the
/// `worker` export behave the same; pass `worker` as the first argument to
/// run the named one.
async fn tasks() -> TaskRegistry {
    let echo_index = || {
        task_fn(|args, ctx| async move {
            let _ = ctx.send("data");
            tokio::time::sleep(Duration::from_secs(1)).await;
            let _ = ctx.complete(args.into_iter().next().unwrap_or(Value::Null));
        })
    };

    let registry = TaskRegistry::new();
    registry
        .register(
            WORKER_PATH,
            TaskModule::new()
                .with_default(echo_index())
                .export("worker", echo_index()),
        )
        .await;
    registry
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_with_default("procfarm=info,procfarm_demo=info");

    if is_worker_process() {
        let result = worker::run(tasks().await).await;
        std::process::exit(worker::exit_code(&result));
    }

    let mut options = FarmOptions::from_env()?;
    if let Some(export) = std::env::args().nth(1) {
        options = options.exported_method(export);
    }

    let farm = Farm::new(WORKER_PATH, options)?;

    let calls = (0..10)
        .map(|i| -> Result<_, FarmError> {
            let mut handle = farm.submit(vec![json!(i)])?;
            Ok(async move {
                while let Some(event) = handle.next().await {
                    match event {
                        CallEvent::Data(data) => println!("received {}", data),
                        CallEvent::Complete(result) => println!("{} {}", i, result),
                        CallEvent::Error(e) => eprintln!("{} failed: {}", i, e),
                        CallEvent::Started(_) | CallEvent::Exit => {}
                    }
                }
            })
        })
        .collect::<Result<Vec<_>, FarmError>>()?;

    futures::future::join_all(calls).await;

    farm.end();
    farm.drained().await;
    tracing::info!(stats = ?farm.stats(), "farm drained");
    Ok(())
}
