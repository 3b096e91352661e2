//! Child-process stdio transport.
//!
//! Spawns the agent binary in server mode with:
//! - `kill_on_drop(true)` so an abandoned transport never leaks a process.
//! - stdin/stdout carrying `Content-Length` framed JSON-RPC.
//! - stderr drained line by line into `tracing` at `DEBUG`
//!   (target `agent_link::agent_stderr`).
//! - an optional `env_clear()` + allowlist when the caller opts out of
//!   inheriting the parent environment.
//!
//! Closing sends `SIGTERM` on Unix, waits up to [`GRACEFUL_EXIT`] for the
//! process to exit, then kills it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::rpc::message::Message;
use crate::transport::{BoxFuture, StreamTransport, Transport};
use crate::{AppError, Result};

/// Arguments appended after the configured CLI arguments to select server
/// mode. `--log-level <level>` is inserted between the two.
const SERVER_MODE_ARG: &str = "--server";
const STDIO_ARG: &str = "--stdio";

/// How long [`ProcessTransport::close`] waits for a voluntary exit.
pub const GRACEFUL_EXIT: Duration = Duration::from_secs(2);

/// Environment variables passed through when `inherit_env` is `false`.
///
/// Every other variable from the parent environment is stripped via
/// `env_clear()`; the configured `env` map is applied on top.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "RUST_LOG",
    "LANG",
    "TERM",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

// ── Configuration ─────────────────────────────────────────────────────────────

/// Everything needed to launch the agent binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnConfig {
    /// Agent executable.
    pub cli_path: String,
    /// Extra arguments placed before the server-mode arguments.
    pub cli_args: Vec<String>,
    /// Working directory; inherits the parent's when `None`.
    pub cwd: Option<PathBuf>,
    /// Value passed to `--log-level`.
    pub log_level: String,
    /// Environment overrides applied last.
    pub env: HashMap<String, String>,
    /// Inherit the parent environment instead of the allowlist.
    pub inherit_env: bool,
}

impl SpawnConfig {
    /// Derive the spawn parameters from a client configuration.
    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            cli_path: config.cli_path.clone(),
            cli_args: config.cli_args.clone(),
            cwd: config.cwd.clone(),
            log_level: config.log_level.clone(),
            env: config.env.clone(),
            inherit_env: config.inherit_env,
        }
    }

    /// Full argument vector passed to the executable.
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        let mut args = self.cli_args.clone();
        args.push(SERVER_MODE_ARG.to_owned());
        args.push("--log-level".to_owned());
        args.push(self.log_level.clone());
        args.push(STDIO_ARG.to_owned());
        args
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.cli_path);
        cmd.args(self.args());

        if !self.inherit_env {
            cmd.env_clear();
            for &key in ALLOWED_ENV_VARS {
                if let Ok(val) = std::env::var(key) {
                    cmd.env(key, val);
                }
            }
        }
        cmd.envs(&self.env);

        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

// ── Transport ─────────────────────────────────────────────────────────────────

/// Transport over a spawned agent's stdin/stdout.
#[derive(Debug)]
pub struct ProcessTransport {
    stream: StreamTransport,
    child: Mutex<Option<Child>>,
    exit_status: Mutex<Option<ExitStatus>>,
    pid: Option<u32>,
    stderr_task: Option<JoinHandle<()>>,
}

impl ProcessTransport {
    /// Spawn the agent and wire up its pipes. Must run inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`AppError::ConnectionFailed`]`("failed to spawn agent: …")` on an OS
    ///   spawn failure (missing binary, bad working directory).
    /// - [`AppError::ConnectionFailed`] if a stdio pipe cannot be captured.
    pub fn spawn(config: &SpawnConfig) -> Result<Self> {
        let mut child = config.command().spawn().map_err(|e| {
            AppError::ConnectionFailed(format!("failed to spawn agent '{}': {e}", config.cli_path))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::ConnectionFailed("failed to capture agent stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::ConnectionFailed("failed to capture agent stdout".into()))?;
        let stderr_task = child.stderr.take().map(forward_stderr);

        let pid = child.id();
        info!(pid, cli_path = %config.cli_path, "transport: agent process spawned");

        Ok(Self {
            stream: StreamTransport::from_io("process", stdout, stdin),
            child: Mutex::new(Some(child)),
            exit_status: Mutex::new(None),
            pid,
            stderr_task,
        })
    }

    /// OS process id, if the process was still running when spawned.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status of the agent, if it has exited.
    pub async fn exit_status(&self) -> Option<ExitStatus> {
        if let Some(status) = *self.exit_status.lock().await {
            return Some(status);
        }

        let mut child = self.child.lock().await;
        let status = child.as_mut().and_then(|c| c.try_wait().ok().flatten());
        if status.is_some() {
            *self.exit_status.lock().await = status;
        }
        status
    }

    async fn terminate(&self) -> Result<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        request_exit(&child);

        let status = match tokio::time::timeout(GRACEFUL_EXIT, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(AppError::Io(format!("failed waiting for agent exit: {e}")));
            }
            Err(_elapsed) => {
                debug!(pid = self.pid, "transport: agent ignored termination, killing");
                child
                    .kill()
                    .await
                    .map_err(|e| AppError::Io(format!("failed to kill agent: {e}")))?;
                child
                    .wait()
                    .await
                    .map_err(|e| AppError::Io(format!("failed waiting for agent exit: {e}")))?
            }
        };

        info!(pid = self.pid, %status, "transport: agent process exited");
        *self.exit_status.lock().await = Some(status);
        Ok(())
    }
}

impl Transport for ProcessTransport {
    fn send(&self, frame: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.stream.send_frame(&frame).await })
    }

    fn receive_next(&self) -> BoxFuture<'_, Result<Message>> {
        Box::pin(self.stream.next_message())
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.stream.shutdown().await;
            self.terminate().await
        })
    }

    fn is_closed(&self) -> bool {
        self.stream.is_shut_down()
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

// ── Private helpers ───────────────────────────────────────────────────────────

/// Log every stderr line of the agent until the pipe closes.
fn forward_stderr(stderr: ChildStderr) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => debug!(target: "agent_link::agent_stderr", "{line}"),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "transport: agent stderr read failed");
                    break;
                }
            }
        }
    })
}

/// Ask the child to exit on its own.
#[cfg(unix)]
fn request_exit(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        debug!(pid, error = %e, "transport: SIGTERM delivery failed");
    }
}

#[cfg(not(unix))]
fn request_exit(_child: &Child) {}
