// ABOUTME: Worker runtime loop - performs the handshake, runs calls as
// ABOUTME: concurrent tasks, and exits on `die`, EOF, or a task panic.

use std::any::Any;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use super::{CallContext, Task, TaskLoader};
use crate::error::WorkerError;
use crate::protocol::{WorkerMessage, WorkerRequest};
use crate::transport::WORKER_ENV;

/// Whether this process was started by a farm as a worker.
pub fn is_worker_process() -> bool {
    std::env::var_os(WORKER_ENV).is_some()
}

/// Process exit code for the outcome of [`serve`] or [`run`].
///
/// A panicking task maps to 101, the code Rust uses for a panicked main.
pub fn exit_code(result: &Result<(), WorkerError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(WorkerError::TaskPanicked(_)) => 101,
        Err(_) => 1,
    }
}

/// Serve the bootstrap protocol over this process's stdin and stdout.
///
/// Returns when the farm sends `die` or closes stdin. Callers should exit the
/// process with [`exit_code`] right after; in-flight calls are abandoned.
/// Stdout is the protocol channel, so tasks must log to stderr.
pub async fn run<L: TaskLoader>(loader: L) -> Result<(), WorkerError> {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (message_tx, mut message_rx) = mpsc::unbounded_channel::<WorkerMessage>();

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match WorkerRequest::from_line(&line) {
                        Ok(request) => {
                            if request_tx.send(request).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "ignoring malformed request"),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "failed to read from farm");
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = message_rx.recv().await {
            let written = async {
                let line = message.to_line()?;
                stdout.write_all(line.as_bytes()).await?;
                stdout.flush().await?;
                Ok::<_, WorkerError>(())
            }
            .await;

            if let Err(e) = written {
                error!(error = %e, "failed to write to farm");
                break;
            }
        }
    });

    serve(request_rx, message_tx, &loader).await
}

/// Serve the bootstrap protocol over channels.
///
/// The first `init` loads the task; later ones are ignored. Each `call` runs
/// on its own Tokio task so a worker handles calls concurrently. Returns
/// `Ok` on `die` or when `requests` closes, and an error if loading fails or
/// a task panics. Dropping the returned future aborts every running call.
pub async fn serve<L: TaskLoader + ?Sized>(
    mut requests: mpsc::UnboundedReceiver<WorkerRequest>,
    responses: mpsc::UnboundedSender<WorkerMessage>,
    loader: &L,
) -> Result<(), WorkerError> {
    let mut task: Option<Arc<dyn Task>> = None;
    let mut calls = JoinSet::new();

    loop {
        tokio::select! {
            request = requests.recv() => {
                let Some(request) = request else {
                    debug!("request channel closed");
                    return Ok(());
                };

                match request {
                    WorkerRequest::Init { worker_path, exported_method } => {
                        if task.is_some() {
                            warn!(worker_path = %worker_path, "ignoring repeated handshake");
                            continue;
                        }
                        debug!(worker_path = %worker_path, ?exported_method, "loading task");
                        task = Some(loader.load(&worker_path, exported_method.as_deref()).await?);
                    }

                    WorkerRequest::Call { slot, worker_id, args } => {
                        let Some(task) = task.clone() else {
                            error!(slot, "no task loaded; dropping call");
                            continue;
                        };
                        let ctx = CallContext::new(slot, worker_id, responses.clone());
                        calls.spawn(async move { task.run(args, ctx).await });
                    }

                    WorkerRequest::Die => {
                        debug!(running = calls.len(), "received die");
                        return Ok(());
                    }
                }
            }

            Some(joined) = calls.join_next(), if !calls.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        let message = panic_message(e.into_panic());
                        error!(panic = %message, "task panicked; exiting worker");
                        return Err(WorkerError::TaskPanicked(message));
                    }
                }
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
