// ABOUTME: Child-process spawner - starts worker executables and talks to them
// ABOUTME: over newline-delimited JSON on stdin/stdout.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::{SpawnedWorker, Spawner, WorkerLink};
use crate::error::FarmError;
use crate::protocol::{WorkerId, WorkerMessage, WorkerRequest};

/// Environment variable set on every spawned worker, holding its worker id.
pub const WORKER_ENV: &str = "PROCFARM_WORKER";

/// Spawns workers as child processes of a configured executable.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    current_dir: Option<PathBuf>,
}

impl ProcessSpawner {
    /// Spawn workers from `program` with no extra arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
        }
    }

    /// Re-execute the current binary with the same arguments.
    ///
    /// The binary is expected to check [`is_worker_process`](crate::worker::is_worker_process)
    /// early in `main` and hand control to [`worker::run`](crate::worker::run).
    pub fn current_exe() -> Result<Self, FarmError> {
        let program = std::env::current_exe()
            .map_err(|e| FarmError::Spawn(format!("Failed to get current executable: {}", e)))?;
        Ok(Self::new(program).args(std::env::args_os().skip(1)))
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for workers.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Run workers from `dir`.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }
}

impl Spawner for ProcessSpawner {
    fn spawn(&self, worker_id: WorkerId) -> Result<SpawnedWorker, FarmError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .env(WORKER_ENV, worker_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            FarmError::Spawn(format!("{}: {}", self.program.display(), e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| FarmError::Spawn("Failed to open worker stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FarmError::Spawn("Failed to open worker stdout".into()))?;

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = oneshot::channel();

        tokio::spawn(write_requests(worker_id, stdin, request_rx));
        tokio::spawn(read_messages(worker_id, stdout, message_tx));

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                Ok(()) = &mut kill_rx => {
                    debug!(worker_id, "force-killing worker");
                    if let Err(e) = child.start_kill() {
                        warn!(worker_id, error = %e, "failed to kill worker");
                    }
                    child.wait().await
                }
            };

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(worker_id, error = %e, "failed to wait for worker");
                    None
                }
            };
            let _ = exit_tx.send(code);
        });

        Ok(SpawnedWorker {
            link: WorkerLink::new(request_tx, kill_tx),
            messages: message_rx,
            exited: exit_rx,
        })
    }
}

async fn write_requests(
    worker_id: WorkerId,
    mut stdin: ChildStdin,
    mut requests: mpsc::UnboundedReceiver<WorkerRequest>,
) {
    while let Some(request) = requests.recv().await {
        let line = match request.to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!(worker_id, error = %e, "dropping unserializable request");
                continue;
            }
        };

        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;

        if let Err(e) = written {
            debug!(worker_id, error = %e, "worker stdin closed");
            break;
        }
    }
}

async fn read_messages(
    worker_id: WorkerId,
    stdout: ChildStdout,
    messages: mpsc::UnboundedSender<WorkerMessage>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match WorkerMessage::from_line(&line) {
                    Ok(message) => {
                        if messages.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(worker_id, error = %e, line = %line, "malformed message from worker"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(worker_id, error = %e, "failed to read from worker");
                break;
            }
        }
    }
}
