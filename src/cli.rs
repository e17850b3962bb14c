//! CLI interface for tributary

use crate::config::OrchestratorConfig;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::models::{RunState, TaskState};
use crate::orchestrator::Orchestrator;
use crate::parser::parse_workflow_file;
use crate::templates;
use crate::units::UnitRegistry;
use crate::workflow::Workflow;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// tributary - DAG workflow orchestrator with durable run state
#[derive(Parser, Debug)]
#[command(name = "tributary")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "DAG workflow orchestrator with durable run state, retries and failure isolation", long_about = None)]
pub struct Cli {
    /// Configuration file (YAML or TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Log format (json or pretty)
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    /// Database path for state persistence
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate workflow YAML and DAG
    Validate {
        /// Path to workflow YAML file
        workflow: PathBuf,
    },

    /// Load a workflow, trigger one run and drive it to completion in this process
    Run {
        /// Path to workflow YAML file
        workflow: PathBuf,

        /// Give up after this long (e.g. "30m")
        #[arg(long)]
        timeout: Option<humantime::Duration>,
    },

    /// Daemon management commands
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },

    /// Create a manual run of a registered workflow
    Trigger {
        workflow: String,

        /// Logical date (RFC 3339); defaults to now
        #[arg(long)]
        logical_date: Option<DateTime<Utc>>,
    },

    /// Create runs for every schedule instant in a date range
    Backfill {
        workflow: String,

        /// Range start (RFC 3339, inclusive)
        #[arg(long)]
        from: DateTime<Utc>,

        /// Range end (RFC 3339, inclusive)
        #[arg(long)]
        to: DateTime<Utc>,
    },

    /// Stop creating and queuing runs for a workflow
    Pause { workflow: String },

    /// Resume a paused workflow
    Unpause { workflow: String },

    /// Cancel a run, failing every unfinished task instance
    Cancel { run_id: i64 },

    /// Force an unfinished task instance to a final state
    Mark {
        run_id: i64,
        task: String,
        #[arg(value_enum)]
        state: MarkState,
    },

    /// Reset a finished task instance so it runs again
    Clear {
        run_id: i64,
        task: String,

        /// Also reset every downstream task instance
        #[arg(long)]
        downstream: bool,
    },

    /// Workflow management commands
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommands,
    },

    /// List runs
    Runs {
        #[arg(short, long)]
        workflow: Option<String>,

        /// Filter by state (running, success, failed)
        #[arg(short, long)]
        state: Option<String>,

        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Show the task instances of a run
    Tasks { run_id: i64 },

    /// Show the attempt history of a run
    Logs {
        run_id: i64,

        /// Task filter
        #[arg(short, long)]
        task: Option<String>,
    },

    /// Show workflow run statistics
    Stats { workflow: String },

    /// Delete finished runs older than a duration
    Purge {
        /// e.g. "30d"
        #[arg(long)]
        older_than: humantime::Duration,

        #[arg(short, long)]
        workflow: Option<String>,
    },

    /// Generate example workflow YAML templates
    Template {
        /// Template type (omit to list available templates)
        #[arg(short = 't', long = "type")]
        template_type: Option<TemplateType>,

        /// Write output to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum MarkState {
    Success,
    Failed,
    Skipped,
}

impl From<MarkState> for TaskState {
    fn from(state: MarkState) -> Self {
        match state {
            MarkState::Success => TaskState::Success,
            MarkState::Failed => TaskState::Failed,
            MarkState::Skipped => TaskState::Skipped,
        }
    }
}

/// Available template types for the `template` subcommand.
#[derive(Debug, Clone, ValueEnum)]
pub enum TemplateType {
    /// Single shell task, no dependencies
    Minimal,
    /// Scheduled ingest/train/evaluate pipeline with retries
    MlPipeline,
    /// HTTP calls passing data downstream
    Http,
    /// Fan-out/fan-in diamond
    Diamond,
}

impl TemplateType {
    fn name(&self) -> &'static str {
        match self {
            TemplateType::Minimal => "minimal",
            TemplateType::MlPipeline => "ml-pipeline",
            TemplateType::Http => "http",
            TemplateType::Diamond => "diamond",
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum WorkflowCommands {
    /// List registered workflows with run statistics
    List,
}

#[derive(Subcommand, Debug)]
pub enum DaemonCommands {
    /// Run the scheduler in the foreground until SIGTERM/SIGINT
    Start {
        /// Directory of workflow YAML files (overrides workflows_dir)
        #[arg(long)]
        workflows_dir: Option<PathBuf>,

        /// Path to PID file
        #[arg(long, default_value = "/tmp/tributary.pid")]
        pid_file: PathBuf,
    },

    /// Stop running daemon
    Stop {
        #[arg(long, default_value = "/tmp/tributary.pid")]
        pid_file: PathBuf,
    },

    /// Check daemon status
    Status {
        #[arg(long, default_value = "/tmp/tributary.pid")]
        pid_file: PathBuf,
    },
}

impl Cli {
    /// Configuration file and environment, then command-line overrides
    pub fn load_config(&self) -> anyhow::Result<OrchestratorConfig> {
        let mut config = OrchestratorConfig::load(self.config.as_deref())?;

        if let Some(level) = &self.log_level {
            config.log.level = LogLevel::from(level.as_str());
        }
        if let Some(format) = &self.log_format {
            config.log.format = format.parse::<LogFormat>().map_err(anyhow::Error::msg)?;
        }
        if let Some(db_path) = &self.db_path {
            config.db_path = db_path.clone();
        }
        if let Commands::Daemon {
            command:
                DaemonCommands::Start {
                    workflows_dir: Some(dir),
                    ..
                },
        } = &self.command
        {
            config.workflows_dir = Some(dir.clone());
        }

        Ok(config)
    }

    pub fn init_logging(&self, config: &OrchestratorConfig) -> anyhow::Result<()> {
        init_logging(&config.log)
    }

    fn orchestrator(&self, config: &OrchestratorConfig) -> anyhow::Result<Orchestrator> {
        Ok(Orchestrator::new(config.clone(), UnitRegistry::with_builtin()?)?)
    }

    /// Orchestrator with one registered workflow loaded from its stored
    /// definition
    async fn orchestrator_for(
        &self,
        config: &OrchestratorConfig,
        workflow: &str,
    ) -> anyhow::Result<Orchestrator> {
        let orch = self.orchestrator(config)?;
        let record = orch
            .store()
            .get_workflow_record(workflow)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Workflow '{}' is not registered", workflow))?;
        orch.load_workflow(record.definition).await?;
        Ok(orch)
    }

    /// Execute the CLI command
    pub async fn execute(&self, config: OrchestratorConfig) -> anyhow::Result<()> {
        match &self.command {
            Commands::Validate { workflow } => self.validate_workflow(workflow)?,
            Commands::Run { workflow, timeout } => {
                self.run_workflow(&config, workflow, timeout.map(Into::into))
                    .await?
            }
            Commands::Daemon { command } => self.handle_daemon_command(config, command).await?,
            Commands::Trigger {
                workflow,
                logical_date,
            } => {
                let orch = self.orchestrator_for(&config, workflow).await?;
                let (run, created) = orch.trigger_run(workflow, *logical_date).await?;
                if created {
                    println!("Created run {} of '{}' for {}", run.id, workflow, run.logical_date);
                } else {
                    println!("Run {} already exists for {}", run.id, run.logical_date);
                }
            }
            Commands::Backfill { workflow, from, to } => {
                let orch = self.orchestrator_for(&config, workflow).await?;
                let runs = orch.backfill(workflow, *from, *to).await?;
                println!("Created {} run(s)", runs.len());
                for run in runs {
                    println!("  {:<8} {}", run.id, run.logical_date);
                }
            }
            Commands::Pause { workflow } => {
                self.orchestrator(&config)?.pause(workflow).await?;
                println!("Paused '{}'", workflow);
            }
            Commands::Unpause { workflow } => {
                self.orchestrator(&config)?.unpause(workflow).await?;
                println!("Unpaused '{}'", workflow);
            }
            Commands::Cancel { run_id } => {
                self.orchestrator(&config)?.cancel_run(*run_id).await?;
                println!("Cancelled run {}", run_id);
            }
            Commands::Mark {
                run_id,
                task,
                state,
            } => {
                let instance = self
                    .orchestrator(&config)?
                    .mark_task(*run_id, task, (*state).into())
                    .await?;
                println!("{} -> {}", instance.task_id, instance.state);
            }
            Commands::Clear {
                run_id,
                task,
                downstream,
            } => {
                let cleared = self
                    .orchestrator(&config)?
                    .clear_task(*run_id, task, *downstream)
                    .await?;
                println!("Cleared: {}", cleared.join(", "));
            }
            Commands::Workflow { command } => match command {
                WorkflowCommands::List => self.list_workflows(&config).await?,
            },
            Commands::Runs {
                workflow,
                state,
                limit,
            } => {
                let state = state
                    .as_deref()
                    .map(str::parse::<RunState>)
                    .transpose()
                    .map_err(anyhow::Error::msg)?;
                self.show_runs(&config, workflow.as_deref(), state, *limit)
                    .await?
            }
            Commands::Tasks { run_id } => self.show_tasks(&config, *run_id).await?,
            Commands::Logs { run_id, task } => {
                self.show_logs(&config, *run_id, task.as_deref()).await?
            }
            Commands::Stats { workflow } => self.show_stats(&config, workflow).await?,
            Commands::Purge {
                older_than,
                workflow,
            } => {
                let age = chrono::Duration::from_std((*older_than).into())?;
                let purged = self
                    .orchestrator(&config)?
                    .purge(workflow.as_deref(), Utc::now() - age)
                    .await?;
                println!("Purged {} run(s)", purged);
            }
            Commands::Template {
                template_type,
                output,
            } => self.handle_template(template_type.as_ref(), output.as_ref())?,
        }
        Ok(())
    }

    /// Validate a workflow without executing
    fn validate_workflow(&self, workflow_path: &PathBuf) -> anyhow::Result<()> {
        info!("Validating workflow: {}", workflow_path.display());

        let config = parse_workflow_file(workflow_path)?;
        let units = UnitRegistry::with_builtin()?;
        let workflow = Workflow::load(config, &units)?;

        println!("Workflow '{}' is valid", workflow.name());
        println!("Schedule: {}", workflow.schedule());
        println!("Tasks: {}", workflow.task_count());
        println!(
            "Execution order: {}",
            workflow.dag().topological_order().join(" -> ")
        );
        for (level, tasks) in workflow.dag().parallel_levels().iter().enumerate() {
            println!("  level {}: {}", level, tasks.join(", "));
        }

        Ok(())
    }

    /// Load a workflow and drive one manual run in this process
    async fn run_workflow(
        &self,
        config: &OrchestratorConfig,
        workflow_path: &PathBuf,
        timeout: Option<std::time::Duration>,
    ) -> anyhow::Result<()> {
        let orch = self.orchestrator(config)?;
        let workflow = orch.load_workflow_file(workflow_path).await?;
        info!("Workflow '{}' loaded", workflow.name());

        let (run, _) = orch.trigger_run(workflow.name(), None).await?;
        let run = orch.run_until_complete(run.id, timeout).await?;

        for instance in orch.task_instances(run.id).await? {
            println!(
                "  {:<30} {:<16} attempts {}",
                instance.task_id, instance.state, instance.attempt
            );
        }

        if run.state == RunState::Success {
            info!("Run {} completed successfully", run.id);
            Ok(())
        } else {
            error!("Run {} failed", run.id);
            std::process::exit(1);
        }
    }

    fn handle_template(
        &self,
        template_type: Option<&TemplateType>,
        output: Option<&PathBuf>,
    ) -> anyhow::Result<()> {
        let Some(tt) = template_type else {
            println!("Available templates:\n");
            println!("{:<12} DESCRIPTION", "TYPE");
            println!("{}", "-".repeat(60));
            for info in templates::list_templates() {
                println!("{:<12} {}", info.name, info.description);
            }
            println!();
            println!("Usage: tributary template --type <TYPE> [-o <FILE>]");
            return Ok(());
        };

        let content = templates::get_template(tt.name())
            .ok_or_else(|| anyhow::anyhow!("Unknown template type: {}", tt.name()))?;

        if let Some(path) = output {
            use std::fs::OpenOptions;
            use std::io::Write as _;
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .map_err(|e| {
                    if e.kind() == std::io::ErrorKind::AlreadyExists {
                        anyhow::anyhow!(
                            "File '{}' already exists. Remove it first or choose a different name.",
                            path.display()
                        )
                    } else {
                        e.into()
                    }
                })?;
            file.write_all(content.as_bytes())?;
            println!("Template written to {}", path.display());
        } else {
            print!("{content}");
        }

        Ok(())
    }

    async fn handle_daemon_command(
        &self,
        config: OrchestratorConfig,
        command: &DaemonCommands,
    ) -> anyhow::Result<()> {
        use crate::daemon::{check_daemon_running, stop_daemon, Daemon};

        match command {
            DaemonCommands::Start { pid_file, .. } => {
                if config.workflows_dir.is_none() {
                    return Err(anyhow::anyhow!(
                        "No workflows directory: pass --workflows-dir or set workflows_dir"
                    ));
                }

                let orchestrator = Arc::new(self.orchestrator(&config)?);
                let mut daemon = Daemon::new(orchestrator, pid_file.clone())?;

                println!("Starting tributary daemon (PID file: {})", pid_file.display());
                println!("Press Ctrl+C to stop");

                daemon.run().await?;

                println!("Daemon stopped");
            }

            DaemonCommands::Stop { pid_file } => match check_daemon_running(pid_file)? {
                Some(pid) => {
                    println!("Stopping daemon (PID: {})", pid);
                    stop_daemon(pid_file)?;
                    println!("Daemon stopped");
                }
                None => println!("Daemon is not running"),
            },

            DaemonCommands::Status { pid_file } => match check_daemon_running(pid_file)? {
                Some(pid) => println!("Daemon is running (PID: {})", pid),
                None => println!("Daemon is not running"),
            },
        }

        Ok(())
    }

    async fn list_workflows(&self, config: &OrchestratorConfig) -> anyhow::Result<()> {
        let workflows = self.orchestrator(config)?.list_workflows().await?;

        if workflows.is_empty() {
            println!("No workflows found");
            return Ok(());
        }

        println!(
            "{:<30} {:<16} {:<8} {:<8} {:<8} {:<8} {:<20}",
            "Name", "Schedule", "Paused", "Runs", "Success", "Failed", "Last Run"
        );
        println!("{}", "-".repeat(104));

        for workflow in workflows {
            let last_run = workflow
                .last_run
                .map(|dt| {
                    dt.with_timezone(&chrono::Local)
                        .format("%Y-%m-%d %H:%M:%S")
                        .to_string()
                })
                .unwrap_or_else(|| "Never".to_string());

            println!(
                "{:<30} {:<16} {:<8} {:<8} {:<8} {:<8} {:<20}",
                workflow.name,
                workflow.schedule.as_deref().unwrap_or("manual"),
                if workflow.paused { "yes" } else { "no" },
                workflow.run_count,
                workflow.success_count,
                workflow.failed_count,
                last_run
            );
        }

        Ok(())
    }

    async fn show_runs(
        &self,
        config: &OrchestratorConfig,
        workflow: Option<&str>,
        state: Option<RunState>,
        limit: usize,
    ) -> anyhow::Result<()> {
        let runs = self
            .orchestrator(config)?
            .list_runs(workflow, state, limit)
            .await?;

        if runs.is_empty() {
            println!("No runs found");
            return Ok(());
        }

        println!(
            "{:<8} {:<24} {:<20} {:<10} {:<10} {:<12}",
            "ID", "Workflow", "Logical Date", "Kind", "State", "Duration"
        );
        println!("{:-<88}", "");

        for run in &runs {
            let duration = run
                .ended_at
                .map(|ended| format_duration((ended - run.created_at).num_seconds()))
                .unwrap_or_else(|| "N/A".to_string());

            println!(
                "{:<8} {:<24} {:<20} {:<10} {:<10} {:<12}",
                run.id,
                run.workflow,
                run.logical_date.format("%Y-%m-%d %H:%M:%S").to_string(),
                run.kind.to_string(),
                run.state.to_string(),
                duration
            );
        }

        Ok(())
    }

    async fn show_tasks(&self, config: &OrchestratorConfig, run_id: i64) -> anyhow::Result<()> {
        let orch = self.orchestrator(config)?;
        let run = orch.get_run(run_id).await?;

        println!(
            "Run {} of '{}' ({}, {})",
            run.id, run.workflow, run.logical_date, run.state
        );
        println!();
        println!(
            "{:<30} {:<16} {:<10} {:<20} {}",
            "Task", "State", "Attempts", "Ended", "Last Error"
        );
        println!("{:-<100}", "");

        for ti in orch.task_instances(run_id).await? {
            println!(
                "{:<30} {:<16} {:<10} {:<20} {}",
                ti.task_id,
                ti.state.to_string(),
                format!("{}/{}", ti.attempt, ti.max_retries + 1),
                ti.ended_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default(),
                ti.last_error.as_deref().unwrap_or("")
            );
        }

        Ok(())
    }

    async fn show_logs(
        &self,
        config: &OrchestratorConfig,
        run_id: i64,
        task: Option<&str>,
    ) -> anyhow::Result<()> {
        let orch = self.orchestrator(config)?;
        let attempts = orch.attempts(run_id, task).await?;

        if attempts.is_empty() {
            println!("No attempts recorded for run {}", run_id);
            return Ok(());
        }

        for attempt in &attempts {
            println!("{:-<80}", "");
            println!("Task: {} (attempt {})", attempt.task_id, attempt.attempt);
            println!("State: {}", attempt.state);
            if let Some(worker) = &attempt.worker_id {
                println!("Worker: {}", worker);
            }
            if let Some(started) = attempt.started_at {
                println!("Started: {}", started.format("%Y-%m-%d %H:%M:%S"));
                println!(
                    "Duration: {}",
                    format_duration((attempt.ended_at - started).num_seconds())
                );
            }
            println!("Ended: {}", attempt.ended_at.format("%Y-%m-%d %H:%M:%S"));
            if let Some(error) = &attempt.error {
                println!("\nError:\n{}", error);
            }
            println!();
        }

        if let Some(task) = task {
            if let Some(output) = orch
                .task_instances(run_id)
                .await?
                .into_iter()
                .find(|ti| ti.task_id == task)
                .and_then(|ti| ti.output)
            {
                println!("Output:\n{}", serde_json::to_string_pretty(&output)?);
            }
        }

        Ok(())
    }

    async fn show_stats(&self, config: &OrchestratorConfig, workflow: &str) -> anyhow::Result<()> {
        let stats = self
            .orchestrator(config)?
            .workflow_statistics(workflow)
            .await?;

        println!("\nStatistics for workflow '{}'", workflow);
        println!("{:-<50}", "");
        println!("Total Runs:            {}", stats.total_runs);
        println!("Success Count:         {}", stats.success_count);
        println!("Failed Count:          {}", stats.failed_count);
        println!("Running:               {}", stats.running_count);
        println!("Success Rate:          {:.1}%", stats.success_rate);

        match stats.avg_duration_seconds {
            Some(avg) => println!("Average Duration:      {}", format_duration(avg as i64)),
            None => println!("Average Duration:      N/A"),
        }
        match stats.last_run {
            Some(last) => println!("Last Run:              {}", last.format("%Y-%m-%d %H:%M:%S")),
            None => println!("Last Run:              N/A"),
        }

        println!();
        Ok(())
    }
}

/// Format duration in seconds to human-readable string
fn format_duration(seconds: i64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!(
            "{}h {}m {}s",
            seconds / 3600,
            (seconds % 3600) / 60,
            seconds % 60
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_validate() {
        let cli = Cli::parse_from(["tributary", "validate", "workflow.yaml"]);
        assert!(matches!(cli.command, Commands::Validate { .. }));
    }

    #[test]
    fn test_cli_run_with_timeout() {
        let cli = Cli::parse_from(["tributary", "run", "workflow.yaml", "--timeout", "10m"]);
        match cli.command {
            Commands::Run { timeout, .. } => {
                let timeout: std::time::Duration = timeout.unwrap().into();
                assert_eq!(timeout, std::time::Duration::from_secs(600));
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_cli_trigger_with_logical_date() {
        let cli = Cli::parse_from([
            "tributary",
            "trigger",
            "etl",
            "--logical-date",
            "2024-03-01T00:00:00Z",
        ]);
        match cli.command {
            Commands::Trigger {
                workflow,
                logical_date,
            } => {
                assert_eq!(workflow, "etl");
                assert_eq!(
                    logical_date.unwrap(),
                    "2024-03-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap()
                );
            }
            _ => panic!("Expected Trigger command"),
        }
    }

    #[test]
    fn test_cli_mark() {
        let cli = Cli::parse_from(["tributary", "mark", "7", "train", "skipped"]);
        match cli.command {
            Commands::Mark {
                run_id,
                task,
                state,
            } => {
                assert_eq!(run_id, 7);
                assert_eq!(task, "train");
                assert_eq!(TaskState::from(state), TaskState::Skipped);
            }
            _ => panic!("Expected Mark command"),
        }
    }

    #[test]
    fn test_cli_clear_downstream() {
        let cli = Cli::parse_from(["tributary", "clear", "3", "ingest", "--downstream"]);
        assert!(matches!(
            cli.command,
            Commands::Clear {
                run_id: 3,
                downstream: true,
                ..
            }
        ));
    }

    #[test]
    fn test_cli_global_overrides() {
        let cli = Cli::parse_from([
            "tributary",
            "--db-path",
            "/tmp/test.db",
            "--log-format",
            "json",
            "workflow",
            "list",
        ]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/test.db"));
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn test_cli_daemon_start_workflows_dir() {
        let cli = Cli::parse_from([
            "tributary",
            "daemon",
            "start",
            "--workflows-dir",
            "/etc/tributary/workflows",
        ]);
        let config = cli.load_config().unwrap();
        assert_eq!(
            config.workflows_dir,
            Some(PathBuf::from("/etc/tributary/workflows"))
        );
    }

    #[test]
    fn test_cli_template_with_type() {
        let cli = Cli::parse_from(["tributary", "template", "--type", "ml-pipeline"]);
        if let Commands::Template {
            template_type: Some(tt),
            output,
        } = &cli.command
        {
            assert_eq!(tt.name(), "ml-pipeline");
            assert!(output.is_none());
        } else {
            panic!("Expected Template command");
        }
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(42), "42s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(3725), "1h 2m 5s");
    }
}
