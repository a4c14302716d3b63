//! Supervisor of one task-executor child process.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::watch;
use uuid::Uuid;

use spider_core::envelope::{ExecutorRequest, ExecutorResponse};
use spider_core::error::FunctionInvokeError;

use crate::error::WorkerError;
use crate::pipe;

/// Everything needed to launch one task instance.
#[derive(Debug, Clone)]
pub struct ExecutorSpec {
    pub executable: PathBuf,
    pub function_name: String,
    pub task_id: Uuid,
    pub storage_url: String,
    pub libs: Vec<String>,
    /// One encoded fragment per argument position.
    pub args: Vec<Vec<u8>>,
}

/// Terminal state of a supervised task instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorOutcome {
    /// One encoded fragment per output position.
    Succeed(Vec<Vec<u8>>),
    Error(FunctionInvokeError, String),
    Cancelled(String),
}

/// Requests cancellation of a running executor.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
    pid: Option<u32>,
}

impl CancelHandle {
    /// Delivers SIGTERM for cooperative handlers and flags the supervisor,
    /// which forces termination and reports `Cancelled`.
    pub fn cancel(&self) {
        if let Some(pid) = self.pid {
            // The child ignores SIGTERM by design; the supervisor's kill in
            // `wait` is the authoritative cancel path.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        let _ = self.tx.send(true);
    }
}

/// One child `spider_task_executor` process with its argument pipe already
/// written.
pub struct TaskExecutor {
    task_id: Uuid,
    child: Child,
    stdout: ChildStdout,
    cancel_rx: watch::Receiver<bool>,
}

impl TaskExecutor {
    /// Spawns the child, streams the arguments envelope to its stdin, and
    /// returns the supervisor plus a cancel handle.
    pub async fn spawn(spec: ExecutorSpec) -> Result<(Self, CancelHandle), WorkerError> {
        let mut command = Command::new(&spec.executable);
        command
            .arg("--func")
            .arg(&spec.function_name)
            .arg("--task-id")
            .arg(spec.task_id.to_string())
            .arg("--storage-url")
            .arg(&spec.storage_url);
        for lib in &spec.libs {
            command.arg("--libs").arg(lib);
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|err| WorkerError::Spawn(err.to_string()))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::Spawn("child stdin is not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Spawn("child stdout is not piped".to_string()))?;

        let request = ExecutorRequest::Arguments(spec.args).encode();
        pipe::send_message(&mut stdin, &request).await?;
        drop(stdin);

        let (tx, cancel_rx) = watch::channel(false);
        let pid = child.id();
        Ok((
            Self {
                task_id: spec.task_id,
                child,
                stdout,
                cancel_rx,
            },
            CancelHandle { tx, pid },
        ))
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// Reads envelopes until a terminal one arrives, then reconciles with
    /// the child's exit status.
    pub async fn wait(mut self) -> ExecutorOutcome {
        let mut terminal: Option<ExecutorResponse> = None;
        loop {
            tokio::select! {
                _ = self.cancel_rx.changed() => {
                    let _ = self.child.start_kill();
                    let _ = self.child.wait().await;
                    return ExecutorOutcome::Cancelled("Task cancelled".to_string());
                }
                message = pipe::receive_message(&mut self.stdout) => {
                    match message {
                        Ok(Some(payload)) => match ExecutorResponse::decode(&payload) {
                            Ok(response) if response.is_terminal() => {
                                terminal = Some(response);
                                break;
                            }
                            Ok(_) => {
                                // Block/Ready are reserved; keep reading.
                            }
                            Err(err) => {
                                terminal = Some(ExecutorResponse::Error(
                                    FunctionInvokeError::ResultParsingError,
                                    format!("cannot parse executor response: {err}"),
                                ));
                                break;
                            }
                        },
                        Ok(None) => break,
                        Err(err) => {
                            tracing::error!(%err, task_id = %self.task_id, "executor pipe read failed");
                            terminal = Some(ExecutorResponse::Error(
                                FunctionInvokeError::FunctionExecutionError,
                                "Pipe read fails".to_string(),
                            ));
                            break;
                        }
                    }
                }
            }
        }

        let status = match self.child.wait().await {
            Ok(status) => status,
            Err(err) => {
                return ExecutorOutcome::Error(
                    FunctionInvokeError::FunctionExecutionError,
                    format!("cannot wait for subprocess: {err}"),
                );
            }
        };

        match terminal {
            Some(ExecutorResponse::Result(outputs)) if status.success() => {
                ExecutorOutcome::Succeed(outputs)
            }
            Some(ExecutorResponse::Error(code, message)) => ExecutorOutcome::Error(code, message),
            Some(ExecutorResponse::Cancel(message)) => ExecutorOutcome::Cancelled(message),
            _ => {
                let code = status.code().unwrap_or(-1);
                ExecutorOutcome::Error(
                    FunctionInvokeError::FunctionExecutionError,
                    if status.success() {
                        "Pipe read fails".to_string()
                    } else {
                        format!("Subprocess exit with {code}")
                    },
                )
            }
        }
    }
}
