//! Fallback sandbox
//!
//! Sets the working directory and replaces the environment with a minimal
//! allow-list. Nothing else is enforced, and every `apply` says so.

use super::{
    ensure_work_dir, scrub_environment, LimitKind, LimitOutcome, Sandbox, SandboxConfig,
    SandboxError, SandboxKind, SandboxReport,
};
use std::process::Command;

#[derive(Debug, Default)]
pub struct BasicSandbox;

impl BasicSandbox {
    pub fn new() -> Self {
        Self
    }
}

impl Sandbox for BasicSandbox {
    fn kind(&self) -> SandboxKind {
        SandboxKind::Basic
    }

    fn apply(
        &mut self,
        cmd: &mut Command,
        config: &SandboxConfig,
    ) -> Result<SandboxReport, SandboxError> {
        ensure_work_dir(config)?;
        let tmp = config.work_dir.join("tmp");
        std::fs::create_dir_all(&tmp).map_err(|e| SandboxError::prepare(&tmp, e))?;

        cmd.current_dir(&config.work_dir);
        scrub_environment(cmd, &config.work_dir, &tmp);

        tracing::warn!(
            "Basic sandbox in use: provider runs with host privileges, only the working directory and environment are restricted"
        );

        let mut report = SandboxReport::new(SandboxKind::Basic);
        if !config.network_isolation {
            report.set(LimitKind::Network, LimitOutcome::NotRequested);
        }
        Ok(report)
    }

    fn cleanup(&mut self) -> Result<(), SandboxError> {
        Ok(())
    }
}
