use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::process::Command;

use crate::config::SandboxConfig;
use crate::engine::{Engine, EngineError, WorkUnit};
use crate::persistence::{FlowDetail, FlowStep, FlowStore};

/// Outcome of one flow step.
#[derive(Debug)]
pub struct StepResult {
    pub step: String,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Runs flows step by step, each step as its own child process.
///
/// With the sandbox enabled every step runs in a Docker container with:
/// - Network isolation (disabled by default)
/// - Dropped capabilities
/// - Read-only root filesystem
/// - Memory and CPU limits
///
/// A flow goes through compilation, preparation, validation and running;
/// `<stage>_start` / `<stage>_end` events are logged around each. The job's
/// store is exported to every step as `JOB_<KEY>` variables.
pub struct ProcessEngine {
    flows: Arc<dyn FlowStore>,
    sandbox: SandboxConfig,
}

impl ProcessEngine {
    pub fn new(flows: Arc<dyn FlowStore>, sandbox: SandboxConfig) -> Self {
        Self { flows, sandbox }
    }

    async fn compile(&self, unit: &WorkUnit) -> Result<FlowDetail, EngineError> {
        self.flows
            .load(unit.flow_uuid)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    fn validate(flow: &FlowDetail) -> Result<(), EngineError> {
        if flow.steps.is_empty() {
            return Err(EngineError::Execution(format!(
                "flow {} ({}) has no steps",
                flow.name, flow.uuid
            )));
        }
        Ok(())
    }

    /// Run a single step, capturing its output.
    pub async fn run_step(
        &self,
        step: &FlowStep,
        env: &[(String, String)],
    ) -> std::io::Result<StepResult> {
        let output = self.command(step, env).output().await?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code();
        let success = output.status.success();

        let error = if success {
            None
        } else if stderr.is_empty() {
            Some(format!("Exit code: {:?}", exit_code))
        } else {
            Some(stderr)
        };

        Ok(StepResult {
            step: step.name.clone(),
            success,
            exit_code,
            output: if stdout.is_empty() { None } else { Some(stdout) },
            error,
        })
    }

    fn command(&self, step: &FlowStep, env: &[(String, String)]) -> Command {
        let mut command = if self.sandbox.enabled {
            let mut args = vec!["run".to_string(), "--rm".to_string()];

            if self.sandbox.network_disabled {
                args.push("--network=none".to_string());
            }
            if let Some(ref limit) = self.sandbox.memory_limit {
                args.push(format!("--memory={}", limit));
            }
            if let Some(ref limit) = self.sandbox.cpu_limit {
                args.push(format!("--cpus={}", limit));
            }

            args.push("--cap-drop=ALL".to_string());
            args.push("--security-opt=no-new-privileges".to_string());
            args.push("--read-only".to_string());

            for (key, value) in env {
                args.push("-e".to_string());
                args.push(format!("{}={}", key, value));
            }

            args.push(self.sandbox.image.clone());
            args.push("sh".to_string());
            args.push("-c".to_string());
            args.push(step.command.clone());

            let mut command = Command::new("docker");
            command.args(&args);
            command
        } else {
            let mut command = Command::new("sh");
            command.arg("-c").arg(&step.command);
            command.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            command
        };

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

/// `JOB_<KEY>` environment for a store snapshot. Strings are passed raw,
/// other values as JSON.
pub fn store_env(store: &Map<String, Value>) -> Vec<(String, String)> {
    store
        .iter()
        .map(|(key, value)| {
            let name: String = key
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() {
                        c.to_ascii_uppercase()
                    } else {
                        '_'
                    }
                })
                .collect();
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (format!("JOB_{}", name), value)
        })
        .collect()
}

#[async_trait]
impl Engine for ProcessEngine {
    async fn run(&self, unit: WorkUnit) -> Result<(), EngineError> {
        let job = unit.job.path().to_string();
        tracing::debug!(job = %job, flow = %unit.flow_uuid, "Dispatching engine for job");

        tracing::debug!(job = %job, event = "compilation_start");
        let flow = self.compile(&unit).await?;
        tracing::debug!(job = %job, event = "compilation_end");

        tracing::debug!(job = %job, event = "preparation_start");
        let env = store_env(&unit.store);
        tracing::debug!(job = %job, event = "preparation_end");

        tracing::debug!(job = %job, event = "validation_start");
        Self::validate(&flow)?;
        tracing::debug!(job = %job, event = "validation_end");

        tracing::debug!(job = %job, event = "running_start");
        for step in &flow.steps {
            let result = self.run_step(step, &env).await.map_err(|e| {
                EngineError::Execution(format!("failed to spawn step {}: {}", step.name, e))
            })?;

            if !result.success {
                tracing::warn!(
                    job = %job,
                    step = %result.step,
                    exit_code = ?result.exit_code,
                    "Flow step failed"
                );
                return Err(EngineError::Task {
                    task: result.step,
                    reason: result.error.unwrap_or_default(),
                });
            }
            tracing::info!(job = %job, step = %result.step, "Flow step completed");
        }
        tracing::debug!(job = %job, event = "running_end");

        Ok(())
    }
}
