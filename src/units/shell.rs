//! Shell command unit

use crate::models::{ShellConfig, MAX_OUTPUT_SIZE};
use crate::parser::validate_shell_config;
use crate::units::{truncate_output_bytes, Invocable, TaskContext, UnitError};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{debug, error, info};

/// Characters of stderr kept in the failure message
const STDERR_TAIL: usize = 512;

/// Runs an absolute-path binary with explicit arguments (no shell
/// interpolation). The invocation context is exported as `TRIBUTARY_*`
/// environment variables; upstream outputs arrive as JSON in
/// `TRIBUTARY_UPSTREAM`.
///
/// Output value: `{"stdout": "...", "exit_code": 0, "truncated": false}`.
#[derive(Debug, Clone, Default)]
pub struct ShellUnit;

impl ShellUnit {
    pub fn new() -> Self {
        Self
    }

    fn parse_params(params: &Value) -> Result<ShellConfig, UnitError> {
        let config: ShellConfig = serde_json::from_value(params.clone())
            .map_err(|e| UnitError::InvalidParams(e.to_string()))?;
        validate_shell_config(&config).map_err(|e| UnitError::InvalidParams(e.to_string()))?;
        Ok(config)
    }

    fn build_command(config: &ShellConfig, ctx: &TaskContext) -> Result<Command, UnitError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);

        if let Some(workdir) = &config.workdir {
            cmd.current_dir(workdir);
        }

        cmd.env("TRIBUTARY_WORKFLOW", &ctx.workflow)
            .env("TRIBUTARY_RUN_ID", ctx.run_id.to_string())
            .env("TRIBUTARY_LOGICAL_DATE", ctx.logical_date.to_rfc3339())
            .env("TRIBUTARY_TASK_ID", &ctx.task_id)
            .env("TRIBUTARY_ATTEMPT", ctx.attempt.to_string())
            .env(
                "TRIBUTARY_UPSTREAM",
                serde_json::to_string(&ctx.upstream)
                    .map_err(|e| UnitError::Failed(format!("Cannot encode upstream: {}", e)))?,
            );

        // User-provided variables win over the context ones
        if let Some(env) = &config.env {
            for (key, value) in env {
                cmd.env(key, value);
            }
        }

        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        // A cancelled or timed-out invocation drops this future; the child must die with it
        cmd.kill_on_drop(true);

        Ok(cmd)
    }
}

#[async_trait]
impl Invocable for ShellUnit {
    async fn invoke(&self, ctx: &TaskContext) -> Result<Value, UnitError> {
        let config = Self::parse_params(&ctx.params)?;

        info!(
            "Executing shell command for {}.{}: {}",
            ctx.workflow, ctx.task_id, config.command
        );
        debug!("Command args: {:?}", config.args);

        let output = Self::build_command(&config, ctx)?
            .output()
            .await
            .map_err(|e| {
                error!("Command execution failed: {}", e);
                UnitError::Io(e)
            })?;

        let (stdout, stdout_truncated) = truncate_output_bytes(&output.stdout);
        if stdout_truncated {
            debug!("Output truncated to {} bytes", MAX_OUTPUT_SIZE);
        }

        if output.status.success() {
            info!("Command completed (exit code: {:?})", output.status.code());
            return Ok(json!({
                "stdout": stdout,
                "exit_code": output.status.code(),
                "truncated": stdout_truncated,
            }));
        }

        let (stderr, _) = truncate_output_bytes(&output.stderr);
        let tail: String = {
            let trimmed = stderr.trim_end();
            let skip = trimmed.chars().count().saturating_sub(STDERR_TAIL);
            trimmed.chars().skip(skip).collect()
        };
        let code = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());

        Err(UnitError::Failed(if tail.is_empty() {
            format!("Command exited with {}", code)
        } else {
            format!("Command exited with {}: {}", code, tail)
        }))
    }

    fn validate(&self, params: &Value) -> Result<(), String> {
        Self::parse_params(params)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}
