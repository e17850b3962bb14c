//! Core data models for the Tributary orchestrator

use crate::retry::Backoff;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// Input validation limits
pub const MAX_YAML_SIZE: usize = 1_048_576; // 1 MB
pub const MAX_TASK_COUNT: usize = 1_000;
pub const MAX_TASK_NAME_LEN: usize = 64;
pub const MAX_COMMAND_LEN: usize = 4_096; // 4 KB
pub const MAX_ARG_COUNT: usize = 256;
pub const MAX_ARG_LEN: usize = 4_096; // 4 KB
pub const MAX_OUTPUT_SIZE: usize = 1_048_576; // 1 MB, stored per task instance
pub const MAX_RESPONSE_SIZE: usize = 1_048_576; // 1 MB
pub const MAX_ERROR_LEN: usize = 4_096;

/// Workflow definition parsed from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// `@once`, `@hourly`, `@daily`, `@weekly`, `@every <duration>` or a bare
    /// duration. Absent means manual triggering only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default)]
    pub default_args: DefaultArgs,
    #[serde(default)]
    pub config: WorkflowSettings,
    pub tasks: Vec<TaskConfig>,
}

/// Workflow-level execution policy defaults, overridable per task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultArgs {
    #[serde(default = "default_owner")]
    pub owner: String,
    #[serde(default)]
    pub retries: u32,
    #[serde(with = "humantime_serde", default = "default_retry_delay")]
    pub retry_delay: Duration,
    #[serde(default)]
    pub retry_backoff: Backoff,
    #[serde(with = "humantime_serde", default = "default_max_retry_delay")]
    pub max_retry_delay: Duration,
    #[serde(
        with = "humantime_serde",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub execution_timeout: Option<Duration>,
    /// Reference instant schedule instants are aligned to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
}

impl Default for DefaultArgs {
    fn default() -> Self {
        Self {
            owner: default_owner(),
            retries: 0,
            retry_delay: default_retry_delay(),
            retry_backoff: Backoff::default(),
            max_retry_delay: default_max_retry_delay(),
            execution_timeout: None,
            start_date: None,
        }
    }
}

fn default_owner() -> String {
    "tributary".to_string()
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(300)
}

fn default_max_retry_delay() -> Duration {
    Duration::from_secs(3600)
}

/// Workflow-level scheduling settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Per-workflow parallelism limit on top of the executor's global one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_active_tasks: Option<usize>,
    /// Maximum number of open scheduled runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_active_runs: Option<usize>,
    /// Create runs for every missed schedule instant, not only the latest
    #[serde(default)]
    pub catchup: bool,
    #[serde(default)]
    pub paused_on_create: bool,
}

/// Individual task definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    /// Name of the invocable unit in the unit registry
    #[serde(alias = "type")]
    pub unit: String,
    #[serde(default, alias = "config")]
    pub params: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub downstream: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(
        with = "humantime_serde",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub retry_delay: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_backoff: Option<Backoff>,
    #[serde(
        with = "humantime_serde",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub max_retry_delay: Option<Duration>,
    #[serde(
        with = "humantime_serde",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub execution_timeout: Option<Duration>,
}

impl TaskConfig {
    /// Bare task definition with no dependencies and no overrides
    pub fn new(name: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            params: serde_json::Value::Null,
            depends_on: Vec::new(),
            downstream: Vec::new(),
            owner: None,
            retries: None,
            retry_delay: None,
            retry_backoff: None,
            max_retry_delay: None,
            execution_timeout: None,
        }
    }

    pub fn with_depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }
}

/// Parameters of the built-in `shell` unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    pub command: String, // Absolute path to binary
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
}

/// Parameters of the built-in `http` unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub url: String,
    #[serde(default = "default_http_method")]
    pub method: HttpMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_http_timeout")]
    pub timeout: u64, // seconds
    #[serde(default)]
    pub allow_private_ips: bool,
}

fn default_http_method() -> HttpMethod {
    HttpMethod::Get
}

fn default_http_timeout() -> u64 {
    30
}

/// HTTP methods
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

/// Lifecycle state of a task instance
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Queued,
    Running,
    Success,
    Failed,
    UpForRetry,
    UpstreamFailed,
    Skipped,
}

impl TaskState {
    pub const ALL: [TaskState; 8] = [
        TaskState::Pending,
        TaskState::Queued,
        TaskState::Running,
        TaskState::Success,
        TaskState::Failed,
        TaskState::UpForRetry,
        TaskState::UpstreamFailed,
        TaskState::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Success => "success",
            TaskState::Failed => "failed",
            TaskState::UpForRetry => "up_for_retry",
            TaskState::UpstreamFailed => "upstream_failed",
            TaskState::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Failed | TaskState::UpstreamFailed | TaskState::Skipped
        )
    }

    /// Terminal states that block dependents
    pub fn is_failure(&self) -> bool {
        matches!(self, TaskState::Failed | TaskState::UpstreamFailed)
    }

    /// States a dependency may be in for its dependents to become eligible
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, TaskState::Success | TaskState::Skipped)
    }

    /// Legal edges of the task instance state machine.
    ///
    /// `Failed` is reachable from every non-terminal state because run
    /// cancellation fails whatever has not finished yet.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        match (self, next) {
            (TaskState::Pending, TaskState::Queued)
            | (TaskState::Pending, TaskState::UpstreamFailed)
            | (TaskState::Queued, TaskState::Running)
            | (TaskState::Running, TaskState::Success)
            | (TaskState::Running, TaskState::UpForRetry)
            | (TaskState::UpForRetry, TaskState::Queued) => true,
            (from, TaskState::Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Operator overrides: any non-terminal instance may be forced to a
    /// terminal outcome, a terminal one never is.
    pub fn can_mark(&self, next: TaskState) -> bool {
        !self.is_terminal()
            && matches!(
                next,
                TaskState::Success | TaskState::Failed | TaskState::Skipped
            )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown task state '{}'", s))
    }
}

/// Aggregate state of a run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Success,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Running => "running",
            RunState::Success => "success",
            RunState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::Running)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunState::Running),
            "success" => Ok(RunState::Success),
            "failed" => Ok(RunState::Failed),
            other => Err(format!("unknown run state '{}'", other)),
        }
    }
}

/// How a run came into existence
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Scheduled,
    Manual,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Scheduled => "scheduled",
            RunKind::Manual => "manual",
        }
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(RunKind::Scheduled),
            "manual" => Ok(RunKind::Manual),
            other => Err(format!("unknown run kind '{}'", other)),
        }
    }
}

/// Persisted run record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub id: i64,
    pub workflow: String,
    pub logical_date: DateTime<Utc>,
    pub kind: RunKind,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Persisted task instance record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskInstance {
    pub id: i64,
    pub run_id: i64,
    pub task_id: String,
    pub state: TaskState,
    /// Attempts started so far
    pub attempt: u32,
    pub max_retries: u32,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub last_error: Option<String>,
    pub output: Option<serde_json::Value>,
}

/// One finished attempt, kept for history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAttempt {
    pub run_id: i64,
    pub task_id: String,
    pub attempt: u32,
    pub state: TaskState,
    pub worker_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// Everything needed to materialize a run in the store
#[derive(Debug, Clone, Default)]
pub struct RunPlan {
    /// (task id, max retries)
    pub tasks: Vec<(String, u32)>,
    /// (upstream, downstream)
    pub edges: Vec<(String, String)>,
}

/// Registry row for a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub name: String,
    pub definition: WorkflowConfig,
    pub schedule: Option<String>,
    pub paused: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Workflow summary with run statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub name: String,
    pub schedule: Option<String>,
    pub paused: bool,
    pub run_count: i64,
    pub success_count: i64,
    pub failed_count: i64,
    pub last_run: Option<DateTime<Utc>>,
}

/// Aggregated run statistics for one workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatistics {
    pub total_runs: i64,
    pub success_count: i64,
    pub failed_count: i64,
    pub running_count: i64,
    pub success_rate: f64,
    pub avg_duration_seconds: Option<f64>,
    pub last_run: Option<DateTime<Utc>>,
}

/// Convert a std duration to a chrono one, saturating at a century
pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_args() {
        let args = DefaultArgs::default();
        assert_eq!(args.owner, "tributary");
        assert_eq!(args.retries, 0);
        assert_eq!(args.retry_delay, Duration::from_secs(300));
        assert_eq!(args.retry_backoff, Backoff::Linear);
        assert!(args.start_date.is_none());
    }

    #[test]
    fn test_task_state_round_trip_names() {
        for state in TaskState::ALL {
            assert_eq!(state.as_str().parse::<TaskState>().unwrap(), state);
        }
        assert!("zombie".parse::<TaskState>().is_err());
        assert_eq!(TaskState::UpForRetry.to_string(), "up_for_retry");
    }

    #[test]
    fn test_legal_transitions() {
        use TaskState::*;
        assert!(Pending.can_transition_to(Queued));
        assert!(Pending.can_transition_to(UpstreamFailed));
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Success));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(UpForRetry));
        assert!(UpForRetry.can_transition_to(Queued));
        assert!(UpForRetry.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Running));
        assert!(!Queued.can_transition_to(Success));
        assert!(!Running.can_transition_to(Queued));
        assert!(!UpForRetry.can_transition_to(Running));
    }

    #[test]
    fn test_terminal_states_are_final() {
        for from in TaskState::ALL.iter().filter(|s| s.is_terminal()) {
            for to in TaskState::ALL {
                assert!(
                    !from.can_transition_to(to),
                    "{} must not move to {}",
                    from,
                    to
                );
                assert!(!from.can_mark(to));
            }
        }
    }

    #[test]
    fn test_operator_marks() {
        assert!(TaskState::Pending.can_mark(TaskState::Skipped));
        assert!(TaskState::Running.can_mark(TaskState::Success));
        assert!(!TaskState::Pending.can_mark(TaskState::Queued));
    }

    #[test]
    fn test_task_config_yaml() {
        let yaml = r#"
name: train
type: shell
params:
  command: "/usr/bin/python3"
  args: ["train.py"]
depends_on: [preprocess]
retries: 2
retry_delay: 30s
execution_timeout: 1h
"#;
        let task: TaskConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(task.unit, "shell");
        assert_eq!(task.depends_on, vec!["preprocess"]);
        assert_eq!(task.retries, Some(2));
        assert_eq!(task.retry_delay, Some(Duration::from_secs(30)));
        assert_eq!(task.execution_timeout, Some(Duration::from_secs(3600)));
        assert_eq!(task.params["args"][0], "train.py");
    }

    #[test]
    fn test_shell_config_serde() {
        let yaml = r#"
command: "/usr/bin/ls"
args:
  - "-la"
  - "/tmp"
workdir: "/home/user"
"#;
        let config: ShellConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.command, "/usr/bin/ls");
        assert_eq!(config.args.len(), 2);
        assert_eq!(config.workdir, Some("/home/user".to_string()));
    }
}
