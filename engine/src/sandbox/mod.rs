//! Process sandboxing for provider binaries
//!
//! A provider is an untrusted executable. Before it starts, the executor
//! hands its `std::process::Command` to a [`Sandbox`], which shapes the child
//! (filesystem root, privileges, resource ceilings, environment) before exec.
//!
//! Three backends exist, selected by [`create_sandbox`]:
//!
//! - **Strict** (Linux): new mount/PID/UTS/IPC namespaces (plus network when
//!   requested), bind-mounted read-only system paths, chroot into the working
//!   directory, rlimits, and a drop to an unprivileged uid/gid. Requires root.
//!   Any failure is fatal.
//! - **Relaxed** (macOS, any Unix on request): rlimits, working directory,
//!   process group, scrubbed environment. Process and network isolation are
//!   reported as unsupported.
//! - **Basic** (anything else): working directory and scrubbed environment
//!   only, with a warning.
//!
//! # Syscall filtering
//!
//! No backend installs a syscall allow-list. Every [`SandboxReport`] lists
//! [`LimitKind::SyscallFilter`] as [`LimitOutcome::Unsupported`] so the gap
//! is visible to callers and in the logs.

pub mod basic;
#[cfg(unix)]
pub mod relaxed;
#[cfg(target_os = "linux")]
pub mod strict;

#[cfg(unix)]
mod rlimit;

use crate::platform::Platform;
use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;
use thiserror::Error;

/// Open file ceiling applied by backends that support rlimits
pub const MAX_OPEN_FILES: u64 = 256;

/// CPU-time ceiling in seconds applied by the relaxed backend
pub const CPU_TIME_LIMIT_SECS: u64 = 300;

/// `PATH` given to sandboxed providers
pub const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Backend preference as written in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackend {
    /// Pick the strongest backend for this platform
    #[default]
    Auto,
    Strict,
    Relaxed,
    Basic,
}

impl FromStr for SandboxBackend {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(SandboxBackend::Auto),
            "strict" => Ok(SandboxBackend::Strict),
            "relaxed" => Ok(SandboxBackend::Relaxed),
            "basic" => Ok(SandboxBackend::Basic),
            other => Err(SandboxError::Unavailable(format!(
                "unknown sandbox backend '{}'",
                other
            ))),
        }
    }
}

/// Concrete sandbox implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    Strict,
    Relaxed,
    Basic,
}

impl SandboxKind {
    /// Strongest backend available on a platform
    pub fn default_for(platform: Platform) -> Self {
        match platform {
            Platform::Linux => SandboxKind::Strict,
            Platform::MacOs => SandboxKind::Relaxed,
            Platform::Other => SandboxKind::Basic,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxKind::Strict => "strict",
            SandboxKind::Relaxed => "relaxed",
            SandboxKind::Basic => "basic",
        }
    }
}

impl fmt::Display for SandboxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/opt/provisio/runtime")
}

fn default_read_only_paths() -> Vec<PathBuf> {
    ["/usr", "/lib", "/lib64", "/bin", "/sbin", "/etc/ld.so.cache"]
        .iter()
        .map(PathBuf::from)
        .collect()
}

fn default_max_memory_mb() -> u64 {
    512
}

fn default_max_cpu_percent() -> u32 {
    50
}

fn default_max_processes() -> u64 {
    10
}

fn default_network_isolation() -> bool {
    true
}

fn default_unprivileged_id() -> u32 {
    65534
}

/// Isolation settings for one provider invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default)]
    pub backend: SandboxBackend,

    /// Root of the provider's view of the filesystem
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Host paths made writable inside the sandbox
    #[serde(default)]
    pub allowed_paths: Vec<PathBuf>,

    /// Host paths made readable inside the sandbox
    #[serde(default = "default_read_only_paths")]
    pub read_only_paths: Vec<PathBuf>,

    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,

    #[serde(default = "default_max_cpu_percent")]
    pub max_cpu_percent: u32,

    #[serde(default = "default_max_processes")]
    pub max_processes: u64,

    #[serde(default = "default_network_isolation")]
    pub network_isolation: bool,

    #[serde(default = "default_unprivileged_id")]
    pub run_as_uid: u32,

    #[serde(default = "default_unprivileged_id")]
    pub run_as_gid: u32,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::Auto,
            work_dir: default_work_dir(),
            allowed_paths: Vec::new(),
            read_only_paths: default_read_only_paths(),
            max_memory_mb: default_max_memory_mb(),
            max_cpu_percent: default_max_cpu_percent(),
            max_processes: default_max_processes(),
            network_isolation: default_network_isolation(),
            run_as_uid: default_unprivileged_id(),
            run_as_gid: default_unprivileged_id(),
        }
    }
}

impl SandboxConfig {
    /// Memory ceiling in bytes
    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_mb.saturating_mul(1024 * 1024)
    }
}

/// Sandbox errors
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox backend unavailable: {0}")]
    Unavailable(String),

    #[error("insufficient privileges: {0}")]
    Privileges(String),

    #[error("failed to prepare {path}: {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("resource limit error: {0}")]
    ResourceLimit(String),

    #[error("cleanup failed: {0}")]
    Cleanup(String),
}

impl SandboxError {
    pub(crate) fn prepare(path: &Path, source: std::io::Error) -> Self {
        SandboxError::Prepare {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl From<SandboxError> for EngineError {
    fn from(err: SandboxError) -> Self {
        EngineError::Sandbox(err.to_string())
    }
}

/// Isolation properties a backend may establish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    Memory,
    Processes,
    CpuTime,
    FileDescriptors,
    Network,
    Filesystem,
    Privileges,
    SyscallFilter,
}

impl LimitKind {
    pub const ALL: [LimitKind; 8] = [
        LimitKind::Memory,
        LimitKind::Processes,
        LimitKind::CpuTime,
        LimitKind::FileDescriptors,
        LimitKind::Network,
        LimitKind::Filesystem,
        LimitKind::Privileges,
        LimitKind::SyscallFilter,
    ];
}

/// What happened to one isolation property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LimitOutcome {
    Applied,
    /// Host ceiling was lower than requested
    Clamped { requested: u64, applied: u64 },
    Unsupported,
    NotRequested,
}

/// Outcome of every isolation property for one `apply`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxReport {
    pub backend: SandboxKind,
    pub limits: Vec<(LimitKind, LimitOutcome)>,
}

impl SandboxReport {
    /// A report with every property unsupported
    pub fn new(backend: SandboxKind) -> Self {
        Self {
            backend,
            limits: LimitKind::ALL
                .iter()
                .map(|kind| (*kind, LimitOutcome::Unsupported))
                .collect(),
        }
    }

    pub fn set(&mut self, kind: LimitKind, outcome: LimitOutcome) {
        if let Some(entry) = self.limits.iter_mut().find(|(k, _)| *k == kind) {
            entry.1 = outcome;
        }
    }

    pub fn outcome(&self, kind: LimitKind) -> Option<LimitOutcome> {
        self.limits
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, outcome)| *outcome)
    }

    /// Properties the backend could not establish
    pub fn unsupported(&self) -> impl Iterator<Item = LimitKind> + '_ {
        self.limits
            .iter()
            .filter(|(_, outcome)| *outcome == LimitOutcome::Unsupported)
            .map(|(kind, _)| *kind)
    }

    /// Warn about every property that is unsupported or clamped
    pub fn log_outcomes(&self) {
        for (kind, outcome) in &self.limits {
            match outcome {
                LimitOutcome::Unsupported => {
                    tracing::warn!("Sandbox ({}): {:?} not enforced", self.backend, kind)
                }
                LimitOutcome::Clamped { requested, applied } => tracing::warn!(
                    "Sandbox ({}): {:?} clamped from {} to {}",
                    self.backend,
                    kind,
                    requested,
                    applied
                ),
                LimitOutcome::Applied | LimitOutcome::NotRequested => {
                    tracing::debug!("Sandbox ({}): {:?} {:?}", self.backend, kind, outcome)
                }
            }
        }
    }
}

/// Isolation applied to a provider process before it starts
///
/// `apply` configures a command that has not been spawned; it never mutates
/// the configuration. `cleanup` releases whatever `stage_program` and
/// `apply` created and must be safe to call after a partial failure.
pub trait Sandbox: Send + Sync {
    fn kind(&self) -> SandboxKind;

    /// Place the program where the sandboxed process can reach it
    ///
    /// Returns the path to pass to `Command::new`. Backends that do not
    /// change the filesystem root return `program` unchanged.
    fn stage_program(
        &mut self,
        program: &Path,
        _config: &SandboxConfig,
    ) -> Result<PathBuf, SandboxError> {
        Ok(program.to_path_buf())
    }

    /// Configure `cmd` for isolated execution
    fn apply(
        &mut self,
        cmd: &mut Command,
        config: &SandboxConfig,
    ) -> Result<SandboxReport, SandboxError>;

    /// Release resources held for the last invocation
    fn cleanup(&mut self) -> Result<(), SandboxError>;
}

/// Resolve a configured backend to a concrete one for this host
pub fn resolve_kind(backend: SandboxBackend) -> Result<SandboxKind, SandboxError> {
    let platform = Platform::current();
    match backend {
        SandboxBackend::Auto => Ok(SandboxKind::default_for(platform)),
        SandboxBackend::Strict if platform != Platform::Linux => Err(SandboxError::Unavailable(
            format!("strict backend requires linux, running on {}", platform.name()),
        )),
        SandboxBackend::Relaxed if !cfg!(unix) => Err(SandboxError::Unavailable(format!(
            "relaxed backend requires a unix host, running on {}",
            platform.name()
        ))),
        SandboxBackend::Strict => Ok(SandboxKind::Strict),
        SandboxBackend::Relaxed => Ok(SandboxKind::Relaxed),
        SandboxBackend::Basic => Ok(SandboxKind::Basic),
    }
}

/// Create a fresh sandbox instance for one invocation
pub fn create_sandbox(backend: SandboxBackend) -> Result<Box<dyn Sandbox>, SandboxError> {
    let kind = resolve_kind(backend)?;
    tracing::debug!("Using {} sandbox on {}", kind, Platform::current().name());

    match kind {
        #[cfg(target_os = "linux")]
        SandboxKind::Strict => Ok(Box::new(strict::StrictSandbox::new())),
        #[cfg(unix)]
        SandboxKind::Relaxed => Ok(Box::new(relaxed::RelaxedSandbox::new())),
        SandboxKind::Basic => Ok(Box::new(basic::BasicSandbox::new())),
        #[allow(unreachable_patterns)]
        other => Err(SandboxError::Unavailable(format!(
            "{} backend is not compiled for this platform",
            other
        ))),
    }
}

/// Create the working directory if absent
pub(crate) fn ensure_work_dir(config: &SandboxConfig) -> Result<(), SandboxError> {
    std::fs::create_dir_all(&config.work_dir)
        .map_err(|e| SandboxError::prepare(&config.work_dir, e))
}

/// Replace the child's environment with a minimal allow-list
pub(crate) fn scrub_environment(cmd: &mut Command, home: &Path, tmp: &Path) {
    cmd.env_clear()
        .env("PATH", SANDBOX_PATH)
        .env("HOME", home)
        .env("TMPDIR", tmp);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.backend, SandboxBackend::Auto);
        assert_eq!(config.work_dir, PathBuf::from("/opt/provisio/runtime"));
        assert_eq!(config.max_memory_mb, 512);
        assert_eq!(config.max_cpu_percent, 50);
        assert_eq!(config.max_processes, 10);
        assert!(config.network_isolation);
        assert_eq!(config.run_as_uid, 65534);
        assert!(config.read_only_paths.contains(&PathBuf::from("/usr")));
        assert_eq!(config.max_memory_bytes(), 512 * 1024 * 1024);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: SandboxConfig = toml::from_str("backend = \"basic\"\nmax_memory_mb = 64\n").unwrap();
        assert_eq!(config.backend, SandboxBackend::Basic);
        assert_eq!(config.max_memory_mb, 64);
        assert_eq!(config.max_processes, 10);
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("relaxed".parse::<SandboxBackend>().unwrap(), SandboxBackend::Relaxed);
        assert!("chroot".parse::<SandboxBackend>().is_err());
    }

    #[test]
    fn test_auto_resolution() {
        let kind = resolve_kind(SandboxBackend::Auto).unwrap();
        #[cfg(target_os = "linux")]
        assert_eq!(kind, SandboxKind::Strict);
        #[cfg(target_os = "macos")]
        assert_eq!(kind, SandboxKind::Relaxed);
        assert_eq!(resolve_kind(SandboxBackend::Basic).unwrap(), SandboxKind::Basic);
    }

    #[cfg(target_os = "macos")]
    #[test]
    fn test_strict_unavailable_off_linux() {
        assert!(matches!(
            resolve_kind(SandboxBackend::Strict),
            Err(SandboxError::Unavailable(_))
        ));
    }

    #[test]
    fn test_report_starts_unsupported() {
        let mut report = SandboxReport::new(SandboxKind::Basic);
        assert_eq!(report.limits.len(), LimitKind::ALL.len());
        assert_eq!(report.unsupported().count(), LimitKind::ALL.len());

        report.set(LimitKind::Network, LimitOutcome::NotRequested);
        assert_eq!(
            report.outcome(LimitKind::Network),
            Some(LimitOutcome::NotRequested)
        );
        assert_eq!(
            report.outcome(LimitKind::SyscallFilter),
            Some(LimitOutcome::Unsupported)
        );
    }

    #[test]
    fn test_factory_builds_requested_kind() {
        let sandbox = create_sandbox(SandboxBackend::Basic).unwrap();
        assert_eq!(sandbox.kind(), SandboxKind::Basic);

        #[cfg(unix)]
        {
            let sandbox = create_sandbox(SandboxBackend::Relaxed).unwrap();
            assert_eq!(sandbox.kind(), SandboxKind::Relaxed);
        }
    }

    #[test]
    fn test_sandbox_error_is_fatal_engine_error() {
        use sdk::errors::ErrorExt;
        let err: EngineError = SandboxError::Privileges("need root".to_string()).into();
        assert!(matches!(err, EngineError::Sandbox(_)));
        assert!(!err.is_recoverable());
    }
}
