//! Invoker backed by local child processes

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::runtime::invoker::{CheckCommand, CheckOutput, Handle, Invoker, InvokerError, StopSignal};
use crate::runtime::node::LaunchSpec;

/// Spawns each launch spec as a child process and forwards its output to the log
#[derive(Default)]
pub struct ProcessInvoker {
    next_id: AtomicU64,
    children: Mutex<HashMap<u64, Child>>,
    /// Exit codes of reaped children
    exited: Mutex<HashMap<u64, i32>>,
}

impl ProcessInvoker {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Exit code, or 128 + signal number for signalled processes
fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Forward lines of a child stream to the log
fn forward_output<R>(name: String, stream: R, is_stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if is_stderr {
                log::warn!("[{}] {}", name, line);
            } else {
                log::info!("[{}] {}", name, line);
            }
        }
    });
}

#[async_trait]
impl Invoker for ProcessInvoker {
    async fn launch(&self, node: &str, spec: &LaunchSpec) -> Result<Handle, InvokerError> {
        log::info!("[{}] Starting: {}", node, spec.command_line());

        let mut cmd = Command::new(&spec.executable);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            log::error!("[{}] Failed to spawn process: {}", node, e);
            InvokerError::SpawnFailed {
                program: spec.executable.clone(),
                source: e,
            }
        })?;

        let pid = child.id();
        if let Some(stdout) = child.stdout.take() {
            forward_output(node.to_string(), stdout, false);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(node.to_string(), stderr, true);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.children.lock().await.insert(id, child);
        log::info!("[{}] Process started with PID: {:?}", node, pid);

        Ok(Handle {
            id,
            node: node.to_string(),
            pid,
        })
    }

    async fn signal(&self, handle: &Handle, signal: StopSignal) -> Result<(), InvokerError> {
        let mut children = self.children.lock().await;
        let Some(child) = children.get_mut(&handle.id) else {
            // Already reaped
            return Ok(());
        };

        match signal {
            StopSignal::Stop => {
                #[cfg(unix)]
                {
                    use nix::sys::signal::{kill, Signal};
                    use nix::unistd::Pid;

                    if let Some(pid) = child.id() {
                        kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(|e| {
                            InvokerError::SignalFailed {
                                node: handle.node.clone(),
                                message: e.to_string(),
                            }
                        })?;
                    }
                }

                #[cfg(not(unix))]
                {
                    child.start_kill().map_err(|e| InvokerError::SignalFailed {
                        node: handle.node.clone(),
                        message: e.to_string(),
                    })?;
                }
            }
            StopSignal::Kill => {
                child.start_kill().map_err(|e| InvokerError::SignalFailed {
                    node: handle.node.clone(),
                    message: e.to_string(),
                })?;
            }
        }
        Ok(())
    }

    async fn exit_code(&self, handle: &Handle) -> Option<i32> {
        if let Some(code) = self.exited.lock().await.get(&handle.id) {
            return Some(*code);
        }

        let mut children = self.children.lock().await;
        let child = children.get_mut(&handle.id)?;
        match child.try_wait() {
            Ok(Some(status)) => {
                let code = exit_code_of(status);
                children.remove(&handle.id);
                self.exited.lock().await.insert(handle.id, code);
                log::info!("[{}] Process exited with code: {}", handle.node, code);
                Some(code)
            }
            Ok(None) => None,
            Err(e) => {
                log::error!("[{}] Error checking process status: {}", handle.node, e);
                None
            }
        }
    }

    async fn exec(&self, check: &CheckCommand) -> Result<CheckOutput, InvokerError> {
        log::trace!("Running check: {}", check.command_line());

        let output = Command::new(&check.program)
            .args(&check.args)
            .envs(&check.env)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| InvokerError::SpawnFailed {
                program: check.program.clone(),
                source: e,
            })?;

        Ok(CheckOutput {
            code: Some(exit_code_of(output.status)),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
