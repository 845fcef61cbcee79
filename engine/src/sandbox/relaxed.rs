//! Relaxed sandbox for hosts without namespaces
//!
//! Applies the rlimits the host supports, runs the provider in its own
//! process group inside the working directory, and scrubs the environment.
//! Memory is bounded through `RLIMIT_DATA`. Process count, network and
//! filesystem confinement are reported as unsupported.

use super::rlimit::{self, PlannedLimit};
use super::{
    ensure_work_dir, scrub_environment, LimitKind, LimitOutcome, Sandbox, SandboxConfig,
    SandboxError, SandboxKind, SandboxReport, CPU_TIME_LIMIT_SECS, MAX_OPEN_FILES,
};
use nix::sys::resource::Resource;
use std::os::unix::process::CommandExt;
use std::process::Command;

#[derive(Debug, Default)]
pub struct RelaxedSandbox;

impl RelaxedSandbox {
    pub fn new() -> Self {
        Self
    }
}

impl Sandbox for RelaxedSandbox {
    fn kind(&self) -> SandboxKind {
        SandboxKind::Relaxed
    }

    fn apply(
        &mut self,
        cmd: &mut Command,
        config: &SandboxConfig,
    ) -> Result<SandboxReport, SandboxError> {
        ensure_work_dir(config)?;
        let tmp = config.work_dir.join("tmp");
        std::fs::create_dir_all(&tmp).map_err(|e| SandboxError::prepare(&tmp, e))?;

        let mut report = SandboxReport::new(SandboxKind::Relaxed);
        let mut limits: Vec<PlannedLimit> = Vec::with_capacity(3);

        for (kind, resource, requested) in [
            (LimitKind::Memory, Resource::RLIMIT_DATA, config.max_memory_bytes()),
            (LimitKind::FileDescriptors, Resource::RLIMIT_NOFILE, MAX_OPEN_FILES),
            (LimitKind::CpuTime, Resource::RLIMIT_CPU, CPU_TIME_LIMIT_SECS),
        ] {
            let (planned, outcome) = rlimit::plan(resource, requested);
            limits.extend(planned);
            report.set(kind, outcome);
        }

        if !config.network_isolation {
            report.set(LimitKind::Network, LimitOutcome::NotRequested);
        }

        cmd.current_dir(&config.work_dir).process_group(0);
        scrub_environment(cmd, &config.work_dir, &tmp);

        // SAFETY: the closure only issues setrlimit syscalls on values
        // computed before fork and does not allocate.
        unsafe {
            cmd.pre_exec(move || rlimit::install(&limits));
        }

        report.log_outcomes();
        Ok(report)
    }

    fn cleanup(&mut self) -> Result<(), SandboxError> {
        Ok(())
    }
}
