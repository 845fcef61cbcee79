//! Plan, probe, apply, verify
//!
//! The orchestrator drives one provider through a fixed sequence:
//!
//! ```text
//! Plan ──fail──▶ stop
//!   │
//! Probe ──matches desired state──▶ Converged (idempotent, no apply)
//!   │
//! Apply
//!   │
//! Verify (always after apply; success is apply's success)
//! ```
//!
//! Steps run strictly in order. Execution errors become failed steps carrying
//! whatever logs were captured; only a configuration that fails the
//! provider's schema is returned as an `Err`, and then no step runs.

pub mod convergence;

use crate::executor::{duration_ms, ExecutionResult, ProviderRunner};
use crate::log_bus::LogSink;
use crate::schema::ProviderSchema;
use chrono::{DateTime, Utc};
pub use convergence::ConvergencePolicy;
use sdk::errors::EngineError;
use sdk::protocol::{DesiredConfig, LogEntry, LogLevel, Verb};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Name of an orchestration step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepName {
    Plan,
    Probe,
    Apply,
    Verify,
}

impl StepName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::Plan => "plan",
            StepName::Probe => "probe",
            StepName::Apply => "apply",
            StepName::Verify => "verify",
        }
    }

    /// Verb the step runs; verify re-probes
    pub fn verb(&self) -> Verb {
        match self {
            StepName::Plan => Verb::Plan,
            StepName::Probe | StepName::Verify => Verb::Probe,
            StepName::Apply => Verb::Apply,
        }
    }

    fn position(&self) -> usize {
        match self {
            StepName::Plan => 1,
            StepName::Probe => 2,
            StepName::Apply => 3,
            StepName::Verify => 4,
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of one step
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub name: StepName,
    pub success: bool,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
    pub data: Map<String, Value>,
    pub logs: Vec<LogEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    fn from_execution(name: StepName, result: ExecutionResult) -> Self {
        let success = result.is_success();
        let error = (!success).then(|| result.failure_reason());
        Self {
            name,
            success,
            duration: result.duration,
            data: result.data,
            logs: result.logs,
            error,
        }
    }

    fn from_error(name: StepName, duration: Duration, err: &EngineError) -> Self {
        Self {
            name,
            success: false,
            duration,
            data: Map::new(),
            logs: err.partial_logs().to_vec(),
            error: Some(err.to_string()),
        }
    }
}

/// Outcome of a full orchestration
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorResult {
    pub success: bool,
    /// Apply was skipped because the desired state already existed
    pub idempotent: bool,
    pub message: String,
    pub steps: Vec<StepResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
}

impl OrchestratorResult {
    /// First step that did not succeed
    pub fn failed_step(&self) -> Option<&StepResult> {
        self.steps.iter().find(|step| !step.success)
    }

    pub fn step_by_name(&self, name: StepName) -> Option<&StepResult> {
        self.steps.iter().find(|step| step.name == name)
    }
}

/// Runs the plan/probe/apply/verify sequence against one provider
pub struct Orchestrator {
    runner: Arc<dyn ProviderRunner>,
    sink: Option<(Arc<dyn LogSink>, String)>,
    schema: Option<ProviderSchema>,
    convergence: ConvergencePolicy,
}

impl Orchestrator {
    pub fn new(runner: Arc<dyn ProviderRunner>) -> Self {
        Self {
            runner,
            sink: None,
            schema: None,
            convergence: ConvergencePolicy::default(),
        }
    }

    /// Publish narration and provider logs for `job_id`
    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>, job_id: impl Into<String>) -> Self {
        self.sink = Some((sink, job_id.into()));
        self
    }

    /// Validate configurations against `schema` before any step runs
    pub fn with_schema(mut self, schema: ProviderSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_convergence(mut self, policy: ConvergencePolicy) -> Self {
        self.convergence = policy;
        self
    }

    fn narrate(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Error => tracing::error!("{}", message),
            LogLevel::Warn => tracing::warn!("{}", message),
            LogLevel::Info => tracing::info!("{}", message),
            LogLevel::Debug => tracing::debug!("{}", message),
        }
        if let Some((sink, job_id)) = &self.sink {
            sink.publish(job_id, level, message);
        }
    }

    fn forward_logs(&self, logs: &[LogEntry]) {
        if let Some((sink, job_id)) = &self.sink {
            for entry in logs {
                sink.publish(job_id, entry.level, &format!("[{}] {}", entry.component, entry.msg));
            }
        }
    }

    async fn run_step(
        &self,
        name: StepName,
        total: usize,
        config: Option<&DesiredConfig>,
    ) -> StepResult {
        self.narrate(
            LogLevel::Info,
            &format!("Step {}/{}: {}", name.position(), total, name),
        );

        let started = Instant::now();
        let step = match self.runner.execute(name.verb(), config).await {
            Ok(result) => StepResult::from_execution(name, result),
            Err(e) => StepResult::from_error(name, started.elapsed(), &e),
        };

        self.forward_logs(&step.logs);

        match &step.error {
            None => self.narrate(
                LogLevel::Info,
                &format!("Step {} succeeded in {}ms", name, step.duration.as_millis()),
            ),
            Some(error) => {
                self.narrate(LogLevel::Error, &format!("Step {} failed: {}", name, error))
            }
        }

        step
    }

    /// Converge the provider's hardware toward `config`
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidConfig` if `config` does not satisfy the
    /// provider's schema. Provider failures are reported in the result.
    pub async fn apply_with_plan(
        &self,
        config: &DesiredConfig,
    ) -> Result<OrchestratorResult, EngineError> {
        if let Some(schema) = &self.schema {
            schema.validate_config(&config.to_object()?)?;
        }

        let started_at = Utc::now();
        let started = Instant::now();
        let mut steps = Vec::with_capacity(4);
        let total = 4;

        let finish = |steps: Vec<StepResult>, success: bool, idempotent: bool, message: String| {
            let error = steps.iter().find(|s| !s.success).and_then(|s| s.error.clone());
            OrchestratorResult {
                success,
                idempotent,
                message,
                steps,
                error: if success { None } else { error },
                started_at,
                duration: started.elapsed(),
            }
        };

        let plan = self.run_step(StepName::Plan, total, Some(config)).await;
        let plan_ok = plan.success;
        steps.push(plan);
        if !plan_ok {
            let message = "Plan failed; no changes were made".to_string();
            self.narrate(LogLevel::Error, &message);
            return Ok(finish(steps, false, false, message));
        }

        let probe = self.run_step(StepName::Probe, total, None).await;
        let matched = match (&config.desired_state, probe.success) {
            (Some(desired), true) => {
                convergence::find_match(desired, &probe.data, self.convergence)
            }
            _ => None,
        };
        steps.push(probe);

        if let Some(existing) = matched {
            let message = match existing.id {
                Some(id) => format!("Desired state already present as {}; apply skipped", id),
                None => "Desired state already present; apply skipped".to_string(),
            };
            self.narrate(LogLevel::Info, &message);
            return Ok(finish(steps, true, true, message));
        }

        let apply = self.run_step(StepName::Apply, total, Some(config)).await;
        let apply_ok = apply.success;
        steps.push(apply);

        // Verify always records post-apply state; only Apply decides success
        let verify = self.run_step(StepName::Verify, total, None).await;
        let message = match (apply_ok, verify.success) {
            (true, true) => "Apply completed and verified".to_string(),
            (true, false) => "Apply completed; verification probe failed".to_string(),
            (false, _) => "Apply failed".to_string(),
        };
        steps.push(verify);
        if apply_ok {
            self.narrate(LogLevel::Info, &message);
        } else {
            self.narrate(LogLevel::Error, &message);
        }

        Ok(finish(steps, apply_ok, false, message))
    }
}
