//! Provider process executor
//!
//! Runs a provider binary with one verb, feeds it the configuration on
//! standard input, and turns its standard output and standard error into an
//! [`ExecutionResult`].
//!
//! # Failure semantics
//!
//! - A non-zero exit or `"status": "failed"` is data, not an error.
//! - Spawn failures, timeouts and unparseable standard output are errors.
//!   Timeouts and malformed output carry the log lines captured so far.
//!
//! # Process lifetime
//!
//! Each provider runs in its own process group. On timeout, or when the
//! `execute` future is dropped, the whole group is killed with `SIGKILL` so
//! nothing the provider forked outlives the call.

use crate::sandbox::{create_sandbox, Sandbox, SandboxConfig, SandboxReport};
use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::protocol::{
    parse_log_lines, DesiredConfig, LogEntry, LogLevel, ProviderOutput, ProviderStatus, Verb,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::task::JoinHandle;

/// Default wall-clock limit for one provider invocation
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// How long to wait for pipes to drain after killing a timed-out provider
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Serialize a `Duration` as whole milliseconds
pub mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}

/// Outcome of one provider invocation
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub status: ProviderStatus,
    pub data: Map<String, Value>,
    pub logs: Vec<LogEntry>,
    pub exit_code: i32,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxReport>,
}

impl ExecutionResult {
    /// The provider reported success and exited cleanly
    pub fn is_success(&self) -> bool {
        self.status.is_success() && self.exit_code == 0
    }

    /// Log lines at `ERROR` level
    pub fn error_logs(&self) -> Vec<&LogEntry> {
        self.logs
            .iter()
            .filter(|entry| entry.level == LogLevel::Error)
            .collect()
    }

    /// Short description of why the run did not succeed
    pub fn failure_reason(&self) -> String {
        if let Some(Value::String(msg)) = self.data.get("error") {
            return msg.clone();
        }
        if let Some(last) = self.error_logs().last() {
            return last.msg.clone();
        }
        match &self.status {
            ProviderStatus::Success => format!("provider exited with code {}", self.exit_code),
            ProviderStatus::Missing => "provider produced no output".to_string(),
            ProviderStatus::Failed => "provider reported failure".to_string(),
            ProviderStatus::Other(s) => format!("provider reported status '{}'", s),
        }
    }
}

/// Something that can run provider verbs
///
/// The orchestrator depends on this rather than on [`Executor`] directly.
#[async_trait]
pub trait ProviderRunner: Send + Sync {
    async fn execute(
        &self,
        verb: Verb,
        config: Option<&DesiredConfig>,
    ) -> Result<ExecutionResult, EngineError>;
}

/// Runs one provider binary
#[derive(Debug, Clone)]
pub struct Executor {
    binary_path: PathBuf,
    timeout: Duration,
    sandbox: Option<SandboxConfig>,
    env: Vec<(String, String)>,
}

impl Executor {
    /// Executor without sandboxing and with the default timeout
    pub fn new(binary_path: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: binary_path.into(),
            timeout: DEFAULT_TIMEOUT,
            sandbox: None,
            env: Vec::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run every invocation inside a fresh sandbox built from `config`
    pub fn with_sandbox(mut self, config: SandboxConfig) -> Self {
        self.sandbox = Some(config);
        self
    }

    /// Add an environment variable, applied after the sandbox shaped the environment
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn sandbox_config(&self) -> Option<&SandboxConfig> {
        self.sandbox.as_ref()
    }

    /// Run the provider with `verb`
    ///
    /// `config`, when present, is written to standard input as one JSON
    /// object and the pipe is closed.
    ///
    /// # Errors
    ///
    /// - `EngineError::Sandbox` if isolation could not be established
    /// - `EngineError::ProviderSpawn` if the process could not be started
    /// - `EngineError::ProviderTimeout` if it ran past the timeout
    /// - `EngineError::MalformedOutput` if standard output is not a result object
    pub async fn execute(
        &self,
        verb: Verb,
        config: Option<&DesiredConfig>,
    ) -> Result<ExecutionResult, EngineError> {
        let started = Instant::now();

        let input = match config {
            Some(config) => Some(
                serde_json::to_vec(config)
                    .map_err(|e| EngineError::InvalidConfig(e.to_string()))?,
            ),
            None => None,
        };

        let mut sandbox = match &self.sandbox {
            Some(sandbox_config) => Some(SandboxGuard::new(create_sandbox(sandbox_config.backend)?)),
            None => None,
        };

        let program = match (&mut sandbox, &self.sandbox) {
            (Some(guard), Some(sandbox_config)) => guard
                .inner
                .stage_program(&self.binary_path, sandbox_config)?,
            _ => self.binary_path.clone(),
        };

        let mut cmd = std::process::Command::new(&program);
        cmd.arg(verb.as_str());

        let report = match (&mut sandbox, &self.sandbox) {
            (Some(guard), Some(sandbox_config)) => {
                Some(guard.inner.apply(&mut cmd, sandbox_config)?)
            }
            _ => None,
        };

        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        cmd.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut cmd = tokio::process::Command::from(cmd);
        cmd.kill_on_drop(true);

        tracing::debug!(
            "Executing provider {} {}",
            self.binary_path.display(),
            verb
        );

        let mut child = cmd.spawn().map_err(|e| EngineError::ProviderSpawn {
            verb: verb.to_string(),
            reason: e.to_string(),
        })?;
        let mut group = ProcessGroup::new(child.id());

        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let stdout_task = child
            .stdout
            .take()
            .map(|pipe| spawn_reader(pipe, Arc::clone(&stdout_buf)));
        let stderr_task = child
            .stderr
            .take()
            .map(|pipe| spawn_reader(pipe, Arc::clone(&stderr_buf)));
        let stdin = child.stdin.take();

        let outcome =
            tokio::time::timeout(self.timeout, feed_and_wait(&mut child, stdin, input)).await;

        let status = match outcome {
            Ok(Ok(status)) => {
                group.disarm();
                status
            }
            Ok(Err(e)) => {
                group.kill();
                return Err(EngineError::Io(e));
            }
            Err(_) => {
                group.kill();
                let _ = child.start_kill();
                let _ = tokio::time::timeout(DRAIN_GRACE, child.wait()).await;
                drain(stdout_task).await;
                drain(stderr_task).await;

                let logs = parse_log_lines(&snapshot(&stderr_buf));
                tracing::warn!(
                    "Provider {} timed out after {:?} with {} log lines",
                    verb,
                    self.timeout,
                    logs.len()
                );
                return Err(EngineError::ProviderTimeout {
                    verb: verb.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                    logs,
                });
            }
        };

        drain(stdout_task).await;
        drain(stderr_task).await;

        let logs = parse_log_lines(&snapshot(&stderr_buf));
        let stdout = snapshot(&stdout_buf);
        let exit_code = exit_code(&status);
        let duration = started.elapsed();

        let output = if stdout.trim().is_empty() {
            ProviderOutput::default()
        } else {
            serde_json::from_str::<ProviderOutput>(stdout.trim()).map_err(|e| {
                EngineError::MalformedOutput {
                    verb: verb.to_string(),
                    reason: e.to_string(),
                    logs: logs.clone(),
                }
            })?
        };

        tracing::debug!(
            "Provider {} finished: status={:?} exit={} in {:?}",
            verb,
            output.status,
            exit_code,
            duration
        );

        Ok(ExecutionResult {
            status: output.status,
            data: output.data,
            logs,
            exit_code,
            duration,
            sandbox: report,
        })
    }
}

#[async_trait]
impl ProviderRunner for Executor {
    async fn execute(
        &self,
        verb: Verb,
        config: Option<&DesiredConfig>,
    ) -> Result<ExecutionResult, EngineError> {
        Executor::execute(self, verb, config).await
    }
}

/// Write the input, close standard input, and wait for exit
async fn feed_and_wait(
    child: &mut Child,
    stdin: Option<ChildStdin>,
    input: Option<Vec<u8>>,
) -> std::io::Result<ExitStatus> {
    if let (Some(mut pipe), Some(bytes)) = (stdin, input) {
        // A provider may exit without reading its input
        match pipe.write_all(&bytes).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            Err(e) => return Err(e),
        }
        drop(pipe);
    }
    child.wait().await
}

fn spawn_reader<R>(mut pipe: R, buf: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut guard) = buf.lock() {
                        guard.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
    })
}

/// Wait briefly for a reader to hit end of file
async fn drain(task: Option<JoinHandle<()>>) {
    if let Some(mut task) = task {
        if tokio::time::timeout(DRAIN_GRACE, &mut task).await.is_err() {
            task.abort();
        }
    }
}

fn snapshot(buf: &Mutex<Vec<u8>>) -> String {
    buf.lock()
        .map(|guard| String::from_utf8_lossy(&guard).into_owned())
        .unwrap_or_default()
}

fn exit_code(status: &ExitStatus) -> i32 {
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

/// Releases the sandbox when the invocation ends, on every path
struct SandboxGuard {
    inner: Box<dyn Sandbox>,
}

impl SandboxGuard {
    fn new(inner: Box<dyn Sandbox>) -> Self {
        Self { inner }
    }
}

impl Drop for SandboxGuard {
    fn drop(&mut self) {
        if let Err(e) = self.inner.cleanup() {
            tracing::warn!("Sandbox cleanup failed: {}", e);
        }
    }
}

/// Kills the provider's process group unless disarmed
struct ProcessGroup {
    #[cfg_attr(not(unix), allow(dead_code))]
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn new(pid: Option<u32>) -> Self {
        Self { pgid: pid }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }

    fn kill(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid.take() {
            use nix::errno::Errno;
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            match killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => tracing::warn!("Failed to kill provider process group {}: {}", pgid, e),
            }
        }

        #[cfg(not(unix))]
        {
            self.pgid = None;
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}
