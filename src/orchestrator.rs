//! Orchestrator: wires the store, workflow registry, executor and scheduler
//! together and exposes the control and query surfaces used by the CLI and
//! the daemon.

use crate::config::OrchestratorConfig;
use crate::error::{Result, TributaryError};
use crate::executor::Executor;
use crate::metrics::Metrics;
use crate::models::{
    Run, RunKind, RunState, TaskAttempt, TaskInstance, TaskState, WorkflowConfig,
    WorkflowStatistics, WorkflowSummary,
};
use crate::registry::WorkflowRegistry;
use crate::scheduler::{Scheduler, TickSummary};
use crate::state::MetadataStore;
use crate::units::UnitRegistry;
use crate::workflow::Workflow;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// How long a stopping daemon waits for running invocations
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Owns the store, registry, executor and scheduler for one process
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: MetadataStore,
    registry: Arc<WorkflowRegistry>,
    executor: Executor,
    scheduler: Scheduler,
    metrics: Arc<Metrics>,
}

impl Orchestrator {
    /// Open the store at `config.db_path`
    pub fn new(config: OrchestratorConfig, units: UnitRegistry) -> Result<Self> {
        let store = MetadataStore::open(&config.db_path)?;
        Self::with_store(config, store, units)
    }

    pub fn with_store(
        config: OrchestratorConfig,
        store: MetadataStore,
        units: UnitRegistry,
    ) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(Metrics::new()?);
        let registry = Arc::new(WorkflowRegistry::new(Arc::new(units)));
        let executor = Executor::new(store.clone(), Arc::clone(&metrics), config.executor.clone());
        let scheduler = Scheduler::new(
            store.clone(),
            Arc::clone(&registry),
            executor.clone(),
            Arc::clone(&metrics),
            config.scheduler.clone(),
        );

        Ok(Self {
            config,
            store,
            registry,
            executor,
            scheduler,
            metrics,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    // ---- workflow lifecycle ----

    /// Load (or reload) a definition and persist it in the registry table
    pub async fn load_workflow(&self, config: WorkflowConfig) -> Result<Arc<Workflow>> {
        let paused_on_create = config.config.paused_on_create;
        let workflow = self.registry.load(config)?;
        let paused = self
            .store
            .register_workflow(workflow.definition(), paused_on_create)
            .await?;
        if paused {
            info!("Workflow '{}' is paused", workflow.name());
        }
        Ok(workflow)
    }

    pub async fn load_workflow_file<P: AsRef<Path>>(&self, path: P) -> Result<Arc<Workflow>> {
        let workflow = self.registry.load_file(path)?;
        self.store
            .register_workflow(workflow.definition(), workflow.settings().paused_on_create)
            .await?;
        Ok(workflow)
    }

    /// Load every definition in a directory, skipping invalid files.
    ///
    /// Returns the number of workflows loaded.
    pub async fn load_workflows_dir<P: AsRef<Path>>(&self, dir: P) -> Result<usize> {
        let (loaded, failed) = self.registry.load_dir(dir.as_ref())?;
        for workflow in &loaded {
            self.store
                .register_workflow(workflow.definition(), workflow.settings().paused_on_create)
                .await?;
        }
        if !failed.is_empty() {
            warn!(
                "{} workflow file(s) in {} failed to load",
                failed.len(),
                dir.as_ref().display()
            );
        }
        Ok(loaded.len())
    }

    /// Reload `workflows_dir`, if configured
    pub async fn reload(&self) -> Result<usize> {
        match self.config.workflows_dir.clone() {
            Some(dir) => self.load_workflows_dir(dir).await,
            None => Ok(0),
        }
    }

    /// Stop scheduling a workflow. Its stored runs are kept; open runs
    /// resume when it is loaded again.
    pub fn unload_workflow(&self, name: &str) -> bool {
        let unloaded = self.registry.unload(name).is_some();
        if unloaded {
            info!("Unloaded workflow '{}'", name);
        }
        unloaded
    }

    pub fn workflow(&self, name: &str) -> Option<Arc<Workflow>> {
        self.registry.get(name)
    }

    pub fn workflows(&self) -> Vec<Arc<Workflow>> {
        self.registry.list()
    }

    fn loaded(&self, name: &str) -> Result<Arc<Workflow>> {
        self.registry
            .get(name)
            .ok_or_else(|| TributaryError::NotFound(format!("workflow '{}' is not loaded", name)))
    }

    // ---- control ----

    /// Create a manual run. Defaults the logical date to now.
    ///
    /// # Returns
    ///
    /// The run and whether it was newly created (a run for the same logical
    /// date may already exist).
    pub async fn trigger_run(
        &self,
        workflow: &str,
        logical_date: Option<DateTime<Utc>>,
    ) -> Result<(Run, bool)> {
        let workflow = self.loaded(workflow)?;
        let logical_date = logical_date.unwrap_or_else(Utc::now);

        let (run, created) = self
            .store
            .create_run_if_absent(
                workflow.name(),
                logical_date,
                RunKind::Manual,
                &workflow.run_plan(),
            )
            .await?;

        if created {
            info!("Triggered run {} of '{}' for {}", run.id, workflow.name(), logical_date);
            self.metrics
                .record_run_created(workflow.name(), RunKind::Manual.as_str());
        }
        Ok((run, created))
    }

    /// Create runs for every schedule instant in `[from, to]`
    ///
    /// # Returns
    ///
    /// The runs created by this call; instants that already had a run are
    /// left alone.
    pub async fn backfill(
        &self,
        workflow: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Run>> {
        let workflow = self.loaded(workflow)?;
        if from > to {
            return Err(TributaryError::Validation(format!(
                "Backfill range is empty: {} is after {}",
                from, to
            )));
        }

        let start = workflow.start_date().ok_or_else(|| {
            TributaryError::Validation(format!(
                "Workflow '{}' has no schedule to backfill",
                workflow.name()
            ))
        })?;

        let plan = workflow.run_plan();
        let mut created_runs = Vec::new();
        for instant in workflow.schedule().instants_between(start, from, to) {
            let (run, created) = self
                .store
                .create_run_if_absent(workflow.name(), instant, RunKind::Manual, &plan)
                .await?;
            if created {
                self.metrics
                    .record_run_created(workflow.name(), RunKind::Manual.as_str());
                created_runs.push(run);
            }
        }

        info!(
            "Backfill of '{}' from {} to {} created {} runs",
            workflow.name(),
            from,
            to,
            created_runs.len()
        );
        Ok(created_runs)
    }

    pub async fn pause(&self, workflow: &str) -> Result<()> {
        self.store.set_paused(workflow, true).await?;
        info!("Paused workflow '{}'", workflow);
        Ok(())
    }

    pub async fn unpause(&self, workflow: &str) -> Result<()> {
        self.store.set_paused(workflow, false).await?;
        info!("Unpaused workflow '{}'", workflow);
        Ok(())
    }

    /// Fail every unfinished instance of a run, then signal local workers.
    ///
    /// Workers in other processes stop at their next heartbeat.
    pub async fn cancel_run(&self, run_id: i64) -> Result<usize> {
        let was_open = matches!(
            self.store.get_run(run_id).await?,
            Some(Run {
                state: RunState::Running,
                ..
            })
        );

        let running = self.store.cancel_run(run_id, "cancelled").await?;
        let task_ids: Vec<String> = running.into_iter().map(|ti| ti.task_id).collect();
        let signalled = self.executor.cancel(run_id, &task_ids);

        if was_open {
            if let Some(run) = self.store.get_run(run_id).await? {
                self.metrics
                    .record_run_finished(&run.workflow, RunState::Failed.as_str());
            }
        }
        Ok(signalled)
    }

    /// Force an unfinished task instance to `success`, `failed` or `skipped`
    pub async fn mark_task(
        &self,
        run_id: i64,
        task_id: &str,
        state: TaskState,
    ) -> Result<TaskInstance> {
        let instance = self.store.mark_task_instance(run_id, task_id, state).await?;
        self.executor.cancel(run_id, &[task_id.to_string()]);
        Ok(instance)
    }

    /// Reset a finished task instance (and optionally its downstream) so it
    /// runs again
    pub async fn clear_task(
        &self,
        run_id: i64,
        task_id: &str,
        include_downstream: bool,
    ) -> Result<Vec<String>> {
        self.store
            .clear_task_instance(run_id, task_id, include_downstream)
            .await
    }

    pub async fn purge(&self, workflow: Option<&str>, before: DateTime<Utc>) -> Result<usize> {
        self.store.purge_runs(workflow, before).await
    }

    // ---- queries ----

    pub async fn list_workflows(&self) -> Result<Vec<WorkflowSummary>> {
        self.store.list_workflows().await
    }

    pub async fn workflow_statistics(&self, workflow: &str) -> Result<WorkflowStatistics> {
        self.store.get_workflow_statistics(workflow).await
    }

    pub async fn list_runs(
        &self,
        workflow: Option<&str>,
        state: Option<RunState>,
        limit: usize,
    ) -> Result<Vec<Run>> {
        self.store.list_runs(workflow, state, limit).await
    }

    pub async fn get_run(&self, run_id: i64) -> Result<Run> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| TributaryError::NotFound(format!("run {}", run_id)))
    }

    pub async fn task_instances(&self, run_id: i64) -> Result<Vec<TaskInstance>> {
        self.store.list_task_instances(run_id).await
    }

    pub async fn attempts(&self, run_id: i64, task_id: Option<&str>) -> Result<Vec<TaskAttempt>> {
        self.store.list_attempts(run_id, task_id).await
    }

    // ---- driving ----

    /// One scheduler pass
    pub async fn tick(&self) -> Result<TickSummary> {
        self.scheduler.tick().await
    }

    /// Drive the scheduler in this process until `run_id` finishes.
    ///
    /// # Errors
    ///
    /// `Infrastructure` if `timeout` elapses first.
    pub async fn run_until_complete(&self, run_id: i64, timeout: Option<Duration>) -> Result<Run> {
        let drive = async {
            loop {
                self.scheduler.tick().await?;

                let run = self.get_run(run_id).await?;
                if run.state.is_terminal() {
                    return Ok(run);
                }

                if self.executor.in_flight() > 0 {
                    let _ = tokio::time::timeout(
                        self.config.scheduler.poll_interval,
                        self.executor.wait_idle(),
                    )
                    .await;
                } else {
                    tokio::time::sleep(self.config.scheduler.poll_interval).await;
                }
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, drive).await.map_err(|_| {
                TributaryError::Infrastructure(format!(
                    "run {} did not finish within {}",
                    run_id,
                    humantime::format_duration(limit)
                ))
            })?,
            None => drive.await,
        }
    }

    /// Serve metrics (if enabled) and run the scheduler loop until
    /// `shutdown` flips to true, then give running invocations a grace
    /// period to finish.
    pub async fn run_daemon(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let metrics_server = if self.config.metrics.enabled {
            Some(
                Arc::clone(&self.metrics)
                    .serve(self.config.metrics.port, shutdown.clone())
                    .await?,
            )
        } else {
            None
        };

        self.scheduler.run(shutdown).await;

        let in_flight = self.executor.in_flight();
        if in_flight > 0 {
            info!("Waiting for {} running task(s) to finish", in_flight);
            if tokio::time::timeout(SHUTDOWN_GRACE, self.executor.wait_idle())
                .await
                .is_err()
            {
                warn!(
                    "{} task(s) still running at shutdown; they will be reclaimed by heartbeat timeout",
                    self.executor.in_flight()
                );
            }
        }

        if let Some(handle) = metrics_server {
            let _ = handle.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_workflow_yaml;
    use serde_json::{json, Value};

    fn orchestrator() -> Orchestrator {
        let mut units = UnitRegistry::new();
        units.register_fn("ok", |_ctx| async { Ok(json!("done")) });
        units.register_fn("slow", |_ctx| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        });

        let mut config = OrchestratorConfig::default();
        config.scheduler.poll_interval = Duration::from_millis(20);

        Orchestrator::with_store(config, MetadataStore::in_memory().unwrap(), units).unwrap()
    }

    const HOURLY: &str = r#"
name: hourly
schedule: "@hourly"
default_args:
  start_date: 2024-01-01T00:00:00Z
config:
  paused_on_create: true
tasks:
  - name: a
    unit: ok
"#;

    #[tokio::test]
    async fn test_trigger_and_run_to_completion() {
        let orch = orchestrator();
        orch.load_workflow(parse_workflow_yaml("name: wf\ntasks:\n  - name: a\n    unit: ok\n").unwrap())
            .await
            .unwrap();

        let (run, created) = orch.trigger_run("wf", None).await.unwrap();
        assert!(created);

        let run = orch
            .run_until_complete(run.id, Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(run.state, RunState::Success);
        assert_eq!(run.kind, RunKind::Manual);
    }

    #[tokio::test]
    async fn test_trigger_unknown_workflow() {
        let orch = orchestrator();
        assert!(matches!(
            orch.trigger_run("missing", None).await,
            Err(TributaryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reload_dropping_task_still_finishes_open_run() {
        let orch = orchestrator();
        orch.load_workflow(
            parse_workflow_yaml("name: wf\ntasks:\n  - name: a\n    unit: ok\n  - name: b\n    unit: ok\n")
                .unwrap(),
        )
        .await
        .unwrap();
        let (run, _) = orch.trigger_run("wf", None).await.unwrap();

        orch.load_workflow(parse_workflow_yaml("name: wf\ntasks:\n  - name: a\n    unit: ok\n").unwrap())
            .await
            .unwrap();

        let run = orch
            .run_until_complete(run.id, Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(run.state, RunState::Failed);

        let instances = orch.task_instances(run.id).await.unwrap();
        let find = |id: &str| instances.iter().find(|ti| ti.task_id == id).cloned().unwrap();
        assert_eq!(find("a").state, TaskState::Success);
        let b = find("b");
        assert_eq!(b.state, TaskState::Failed);
        assert_eq!(b.last_error.as_deref(), Some(crate::executor::TASK_REMOVED));
    }

    #[tokio::test]
    async fn test_unloaded_workflow_cannot_be_triggered() {
        let orch = orchestrator();
        orch.load_workflow(parse_workflow_yaml("name: wf\ntasks:\n  - name: a\n    unit: ok\n").unwrap())
            .await
            .unwrap();

        assert!(orch.unload_workflow("wf"));
        assert!(!orch.unload_workflow("wf"));
        assert!(orch.workflow("wf").is_none());
        assert!(matches!(
            orch.trigger_run("wf", None).await,
            Err(TributaryError::NotFound(_))
        ));

        // The registration survives in the store
        assert_eq!(orch.list_workflows().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_backfill_creates_each_instant_once() {
        let orch = orchestrator();
        orch.load_workflow(parse_workflow_yaml(HOURLY).unwrap())
            .await
            .unwrap();

        let from = "2024-01-02T00:00:00Z".parse().unwrap();
        let to = "2024-01-02T03:00:00Z".parse().unwrap();

        let runs = orch.backfill("hourly", from, to).await.unwrap();
        assert_eq!(runs.len(), 4);
        assert!(runs.iter().all(|r| r.kind == RunKind::Manual));

        let again = orch.backfill("hourly", from, to).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_paused_on_create_and_unpause() {
        let orch = orchestrator();
        orch.load_workflow(parse_workflow_yaml(HOURLY).unwrap())
            .await
            .unwrap();
        assert!(orch.store().is_paused("hourly").await.unwrap());
        assert_eq!(orch.tick().await.unwrap().runs_created, 0);

        orch.unpause("hourly").await.unwrap();
        // catchup defaults to off: one run for the latest instant
        assert_eq!(orch.tick().await.unwrap().runs_created, 1);
        orch.pause("hourly").await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_running_run() {
        let orch = orchestrator();
        orch.load_workflow(
            parse_workflow_yaml("name: wf\ntasks:\n  - name: a\n    unit: slow\n").unwrap(),
        )
        .await
        .unwrap();

        let (run, _) = orch.trigger_run("wf", None).await.unwrap();
        orch.tick().await.unwrap();

        for _ in 0..100 {
            let a = orch.store().get_task_instance(run.id, "a").await.unwrap().unwrap();
            if a.state == TaskState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(orch.cancel_run(run.id).await.unwrap(), 1);
        orch.executor().wait_idle().await;

        let run = orch.get_run(run.id).await.unwrap();
        assert_eq!(run.state, RunState::Failed);
        let instances = orch.task_instances(run.id).await.unwrap();
        assert_eq!(instances[0].state, TaskState::Failed);
    }

    #[tokio::test]
    async fn test_mark_and_clear() {
        let orch = orchestrator();
        orch.load_workflow(
            parse_workflow_yaml(
                "name: wf\ntasks:\n  - name: a\n    unit: ok\n  - name: b\n    unit: ok\n    depends_on: [a]\n",
            )
            .unwrap(),
        )
        .await
        .unwrap();

        let (run, _) = orch.trigger_run("wf", None).await.unwrap();
        let a = orch.mark_task(run.id, "a", TaskState::Skipped).await.unwrap();
        assert_eq!(a.state, TaskState::Skipped);

        // Skipped satisfies dependents
        let run = orch
            .run_until_complete(run.id, Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(run.state, RunState::Success);

        let cleared = orch.clear_task(run.id, "a", true).await.unwrap();
        assert_eq!(cleared, vec!["a".to_string(), "b".to_string()]);

        let run = orch
            .run_until_complete(run.id, Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(run.state, RunState::Success);
        let attempts = orch.attempts(run.id, Some("a")).await.unwrap();
        assert_eq!(attempts.len(), 1);
    }
}
