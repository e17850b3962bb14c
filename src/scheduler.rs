//! Polling scheduler
//!
//! Every tick the scheduler reads the metadata store and moves work forward:
//! it creates due runs, reclaims instances whose worker stopped heartbeating,
//! requeues retries, propagates upstream failures, queues eligible instances
//! and closes finished runs. All decisions come from the store, so any number
//! of scheduler processes may share one database; conditional writes decide
//! who wins each transition.

use crate::error::Result;
use crate::executor::{Executor, WorkItem};
use crate::metrics::Metrics;
use crate::models::{chrono_duration, Run, RunKind, RunState, TaskInstance, TaskState};
use crate::registry::WorkflowRegistry;
use crate::retry::{Decision, Outcome};
use crate::state::{Completion, MetadataStore};
use crate::workflow::Workflow;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Error recorded on instances reclaimed from a silent worker
pub const HEARTBEAT_LOST: &str = "heartbeat lost";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// A running instance without a heartbeat for this long is reclaimed
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,
    /// A queued instance nobody claimed for this long is resubmitted
    #[serde(with = "humantime_serde")]
    pub queued_timeout: Duration,
    /// Upper bound on runs created per workflow per tick when catching up
    pub max_catchup_runs: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(60),
            queued_timeout: Duration::from_secs(300),
            max_catchup_runs: 16,
        }
    }
}

/// What one tick did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickSummary {
    pub runs_created: usize,
    pub reclaimed: usize,
    pub retries_queued: usize,
    pub resubmitted: usize,
    pub upstream_failed: usize,
    pub queued: usize,
    pub runs_finished: usize,
    /// Workflows or runs whose processing failed this tick
    pub errors: usize,
}

/// Store-driven poll loop that moves runs forward tick by tick
pub struct Scheduler {
    store: MetadataStore,
    registry: Arc<WorkflowRegistry>,
    executor: Executor,
    metrics: Arc<Metrics>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: MetadataStore,
        registry: Arc<WorkflowRegistry>,
        executor: Executor,
        metrics: Arc<Metrics>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            executor,
            metrics,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run one scheduling pass
    pub async fn tick(&self) -> Result<TickSummary> {
        let now = Utc::now();
        let mut summary = TickSummary::default();

        for workflow in self.registry.list() {
            if let Err(e) = self.create_due_runs(&workflow, now, &mut summary).await {
                error!("Failed to create runs for '{}': {}", workflow.name(), e);
                summary.errors += 1;
            }
        }

        let open_runs = self.store.list_open_runs().await?;
        self.metrics.set_open_runs(open_runs.len());

        for run in open_runs {
            let result = match self.registry.get(&run.workflow) {
                Some(workflow) => self.advance_run(&workflow, &run, &mut summary).await,
                None => self.settle_unloaded_run(&run, &mut summary).await,
            };

            if let Err(e) = result {
                error!("Failed to advance run {} of '{}': {}", run.id, run.workflow, e);
                summary.errors += 1;
            }
        }

        if summary != TickSummary::default() {
            debug!("Tick: {:?}", summary);
        }
        Ok(summary)
    }

    /// Tick every `poll_interval` until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Scheduler started (poll interval {})",
            humantime::format_duration(self.config.poll_interval)
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let started = Instant::now();
                    let ok = match self.tick().await {
                        Ok(summary) => summary.errors == 0,
                        Err(e) => {
                            error!("Scheduler tick failed: {}", e);
                            false
                        }
                    };
                    self.metrics.record_tick(ok, started.elapsed().as_secs_f64());
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Scheduler stopping");
                        break;
                    }
                }
            }
        }
    }

    async fn create_due_runs(
        &self,
        workflow: &Workflow,
        now: DateTime<Utc>,
        summary: &mut TickSummary,
    ) -> Result<()> {
        let schedule = workflow.schedule();
        let start = match workflow.start_date() {
            Some(start) if !schedule.is_manual() => start,
            _ => return Ok(()),
        };

        if self.store.is_paused(workflow.name()).await? {
            return Ok(());
        }

        let last = self
            .store
            .latest_run(workflow.name(), Some(RunKind::Scheduled))
            .await?
            .map(|run| run.logical_date);

        let due = schedule.due_instants(
            start,
            last,
            now,
            workflow.settings().catchup,
            self.config.max_catchup_runs,
        );

        for logical_date in due {
            if let Some(limit) = workflow.settings().max_active_runs {
                let open = self
                    .store
                    .count_open_runs(workflow.name(), Some(RunKind::Scheduled))
                    .await?;
                if open >= limit {
                    debug!(
                        "'{}' has {} open runs (max_active_runs {}), deferring",
                        workflow.name(),
                        open,
                        limit
                    );
                    break;
                }
            }

            let (run, created) = self
                .store
                .create_run_if_absent(
                    workflow.name(),
                    logical_date,
                    RunKind::Scheduled,
                    &workflow.run_plan(),
                )
                .await?;

            if created {
                info!(
                    "Created run {} of '{}' for {}",
                    run.id,
                    workflow.name(),
                    logical_date
                );
                self.metrics
                    .record_run_created(workflow.name(), RunKind::Scheduled.as_str());
                summary.runs_created += 1;
            }
        }

        Ok(())
    }

    async fn advance_run(
        &self,
        workflow: &Arc<Workflow>,
        run: &Run,
        summary: &mut TickSummary,
    ) -> Result<()> {
        let now = Utc::now();
        let paused = self.store.is_paused(workflow.name()).await?;

        self.reclaim_stale(Some(workflow), run, now, summary).await?;

        if !paused {
            for instance in self
                .store
                .list_task_instances_in_state(run.id, TaskState::UpForRetry)
                .await?
            {
                let due = instance.next_retry_at.map(|at| at <= now).unwrap_or(true);
                if due
                    && self
                        .store
                        .mark_queued(run.id, &instance.task_id, TaskState::UpForRetry)
                        .await?
                {
                    debug!(
                        "Requeued {}.{} for attempt {}",
                        run.workflow,
                        instance.task_id,
                        instance.attempt + 1
                    );
                    self.submit(workflow, run, &instance.task_id);
                    summary.retries_queued += 1;
                }
            }
        }

        let queued_cutoff = now - chrono_duration(self.config.queued_timeout);
        for instance in self
            .store
            .list_task_instances_in_state(run.id, TaskState::Queued)
            .await?
        {
            let stale = instance.queued_at.map(|at| at < queued_cutoff).unwrap_or(true);
            if stale
                && !self.executor.is_tracking(run.id, &instance.task_id)
                && self.store.refresh_queued_at(run.id, &instance.task_id).await?
            {
                info!(
                    "Resubmitting {}.{} (queued since {:?})",
                    run.workflow, instance.task_id, instance.queued_at
                );
                self.submit(workflow, run, &instance.task_id);
                summary.resubmitted += 1;
            }
        }

        summary.upstream_failed += self.propagate_upstream_failures(run).await?;

        if !paused {
            for instance in self.store.list_eligible_task_instances(run.id).await? {
                if self
                    .store
                    .mark_queued(run.id, &instance.task_id, TaskState::Pending)
                    .await?
                {
                    self.submit(workflow, run, &instance.task_id);
                    summary.queued += 1;
                }
            }
        }

        if self.finish_if_complete(run).await? {
            summary.runs_finished += 1;
        }

        Ok(())
    }

    /// Nothing new is queued for a workflow that is not loaded, but silent
    /// workers are still reclaimed and finished runs still closed
    async fn settle_unloaded_run(&self, run: &Run, summary: &mut TickSummary) -> Result<()> {
        debug!(
            "Run {} belongs to unloaded workflow '{}', settling only",
            run.id, run.workflow
        );
        self.reclaim_stale(None, run, Utc::now(), summary).await?;
        summary.upstream_failed += self.propagate_upstream_failures(run).await?;
        if self.finish_if_complete(run).await? {
            summary.runs_finished += 1;
        }
        Ok(())
    }

    /// Fail or retry running instances whose heartbeat is older than the
    /// timeout, on behalf of their silent worker. Without a loaded workflow
    /// there is no retry policy and the attempt fails.
    async fn reclaim_stale(
        &self,
        workflow: Option<&Workflow>,
        run: &Run,
        now: DateTime<Utc>,
        summary: &mut TickSummary,
    ) -> Result<()> {
        let cutoff = now - chrono_duration(self.config.heartbeat_timeout);

        for instance in self
            .store
            .list_task_instances_in_state(run.id, TaskState::Running)
            .await?
        {
            let alive = instance
                .heartbeat_at
                .or(instance.started_at)
                .map(|at| at >= cutoff)
                .unwrap_or(false);
            if alive {
                continue;
            }
            let worker_id = match instance.worker_id.as_deref() {
                Some(worker_id) => worker_id,
                None => continue,
            };

            let completion = reclaim_completion(workflow, &instance, now);
            warn!(
                "Reclaiming {}.{} from worker {}: {} ({})",
                run.workflow,
                instance.task_id,
                worker_id,
                HEARTBEAT_LOST,
                completion.state()
            );

            if self
                .store
                .complete_task_instance(run.id, &instance.task_id, worker_id, completion)
                .await?
            {
                self.executor.cancel(run.id, &[instance.task_id.clone()]);
                summary.reclaimed += 1;
            }
        }

        Ok(())
    }

    /// Move `pending` instances behind a failed dependency to
    /// `upstream_failed`, transitively
    async fn propagate_upstream_failures(&self, run: &Run) -> Result<usize> {
        let instances = self.store.list_task_instances(run.id).await?;
        let mut states: HashMap<String, TaskState> = instances
            .into_iter()
            .map(|ti| (ti.task_id, ti.state))
            .collect();

        let mut queue: VecDeque<String> = states
            .iter()
            .filter(|(_, state)| state.is_failure())
            .map(|(id, _)| id.clone())
            .collect();
        if queue.is_empty() {
            return Ok(0);
        }

        let edges = self.store.list_edges(run.id).await?;
        let mut changed = 0;

        while let Some(failed) = queue.pop_front() {
            for (_, downstream) in edges.iter().filter(|(up, _)| *up == failed) {
                if states.get(downstream) != Some(&TaskState::Pending) {
                    continue;
                }
                if self
                    .store
                    .compare_and_set_state(
                        run.id,
                        downstream,
                        TaskState::Pending,
                        TaskState::UpstreamFailed,
                        Some(&format!("upstream task '{}' failed", failed)),
                    )
                    .await?
                {
                    debug!("{}.{} -> upstream_failed", run.workflow, downstream);
                    states.insert(downstream.clone(), TaskState::UpstreamFailed);
                    queue.push_back(downstream.clone());
                    changed += 1;
                }
            }
        }

        Ok(changed)
    }

    /// Close the run once every instance is terminal.
    ///
    /// Returns whether this call finished it.
    async fn finish_if_complete(&self, run: &Run) -> Result<bool> {
        let instances = self.store.list_task_instances(run.id).await?;
        if instances.iter().any(|ti| !ti.state.is_terminal()) {
            return Ok(false);
        }

        let state = if instances.iter().all(|ti| ti.state.satisfies_dependents()) {
            RunState::Success
        } else {
            RunState::Failed
        };

        if !self
            .store
            .set_run_state(run.id, RunState::Running, state)
            .await?
        {
            return Ok(false);
        }

        info!(
            "Run {} of '{}' ({}) finished: {}",
            run.id, run.workflow, run.logical_date, state
        );
        self.metrics.record_run_finished(&run.workflow, state.as_str());
        Ok(true)
    }

    fn submit(&self, workflow: &Arc<Workflow>, run: &Run, task_id: &str) {
        self.executor.submit(WorkItem {
            workflow: Arc::clone(workflow),
            run_id: run.id,
            logical_date: run.logical_date,
            task_id: task_id.to_string(),
        });
    }
}

/// Outcome recorded for an attempt whose worker went silent, following the
/// task's retry policy
fn reclaim_completion(
    workflow: Option<&Workflow>,
    instance: &TaskInstance,
    now: DateTime<Utc>,
) -> Completion {
    let decision = match workflow.and_then(|wf| wf.task(&instance.task_id)) {
        Some(task) => task.policy.retry.decide(instance.attempt, Outcome::Failure),
        None => Decision::Fail,
    };

    match decision {
        Decision::Retry(delay) => Completion::Retry {
            error: HEARTBEAT_LOST.to_string(),
            next_retry_at: now + chrono_duration(delay),
        },
        Decision::Fail | Decision::Succeed => Completion::Failed {
            error: HEARTBEAT_LOST.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorConfig;
    use crate::parser::parse_workflow_yaml;
    use crate::units::{UnitError, UnitRegistry};
    use serde_json::{json, Value};

    fn units() -> Arc<UnitRegistry> {
        let mut units = UnitRegistry::new();
        units.register_fn("ok", |ctx| async move { Ok(json!(ctx.task_id)) });
        units.register_fn("fail", |_ctx| async {
            Err(UnitError::Failed("boom".to_string()))
        });
        Arc::new(units)
    }

    fn scheduler(store: &MetadataStore, registry: Arc<WorkflowRegistry>) -> Scheduler {
        let metrics = Arc::new(Metrics::new().unwrap());
        let executor = Executor::new(
            store.clone(),
            Arc::clone(&metrics),
            ExecutorConfig {
                max_parallel: 4,
                heartbeat_interval: Duration::from_millis(50),
            },
        );
        Scheduler::new(
            store.clone(),
            registry,
            executor,
            metrics,
            SchedulerConfig {
                poll_interval: Duration::from_millis(20),
                heartbeat_timeout: Duration::from_secs(1),
                queued_timeout: Duration::from_secs(60),
                max_catchup_runs: 16,
            },
        )
    }

    async fn drive(scheduler: &Scheduler, run_id: i64) -> Run {
        for _ in 0..200 {
            scheduler.tick().await.unwrap();
            scheduler.executor.wait_idle().await;
            let run = scheduler.store.get_run(run_id).await.unwrap().unwrap();
            if run.state.is_terminal() {
                return run;
            }
        }
        panic!("run {} did not finish", run_id);
    }

    async fn manual_run(store: &MetadataStore, workflow: &Workflow) -> i64 {
        store
            .create_run_if_absent(
                workflow.name(),
                Utc::now(),
                RunKind::Manual,
                &workflow.run_plan(),
            )
            .await
            .unwrap()
            .0
            .id
    }

    #[tokio::test]
    async fn test_chain_runs_to_success() {
        let store = MetadataStore::in_memory().unwrap();
        let registry = Arc::new(WorkflowRegistry::new(units()));
        let wf = registry
            .load(
                parse_workflow_yaml(
                    r#"
name: chain
tasks:
  - name: a
    unit: ok
  - name: b
    unit: ok
    depends_on: [a]
  - name: c
    unit: ok
    depends_on: [b]
"#,
                )
                .unwrap(),
            )
            .unwrap();

        let scheduler = scheduler(&store, Arc::clone(&registry));
        let run_id = manual_run(&store, &wf).await;
        let run = drive(&scheduler, run_id).await;

        assert_eq!(run.state, RunState::Success);
        let c = store.get_task_instance(run_id, "c").await.unwrap().unwrap();
        assert_eq!(c.state, TaskState::Success);
        assert_eq!(c.output, Some(Value::String("c".to_string())));
    }

    #[tokio::test]
    async fn test_failure_propagates_downstream() {
        let store = MetadataStore::in_memory().unwrap();
        let registry = Arc::new(WorkflowRegistry::new(units()));
        let wf = registry
            .load(
                parse_workflow_yaml(
                    r#"
name: broken
tasks:
  - name: a
    unit: fail
  - name: b
    unit: ok
    depends_on: [a]
  - name: c
    unit: ok
    depends_on: [b]
  - name: side
    unit: ok
"#,
                )
                .unwrap(),
            )
            .unwrap();

        let scheduler = scheduler(&store, Arc::clone(&registry));
        let run_id = manual_run(&store, &wf).await;
        let run = drive(&scheduler, run_id).await;

        assert_eq!(run.state, RunState::Failed);
        let state = |id: &'static str| {
            let store = store.clone();
            async move { store.get_task_instance(run_id, id).await.unwrap().unwrap().state }
        };
        assert_eq!(state("a").await, TaskState::Failed);
        assert_eq!(state("b").await, TaskState::UpstreamFailed);
        assert_eq!(state("c").await, TaskState::UpstreamFailed);
        assert_eq!(state("side").await, TaskState::Success);
    }

    #[tokio::test]
    async fn test_scheduled_runs_created_once() {
        let store = MetadataStore::in_memory().unwrap();
        let registry = Arc::new(WorkflowRegistry::new(units()));
        let start = (Utc::now() - chrono::Duration::minutes(150)).to_rfc3339();
        let yaml = format!(
            r#"
name: hourly
schedule: "@hourly"
default_args:
  start_date: "{}"
config:
  catchup: true
tasks:
  - name: a
    unit: ok
"#,
            start
        );
        let wf = registry.load(parse_workflow_yaml(&yaml).unwrap()).unwrap();
        store.register_workflow(wf.definition(), false).await.unwrap();

        let scheduler = scheduler(&store, Arc::clone(&registry));
        let first = scheduler.tick().await.unwrap();
        assert_eq!(first.runs_created, 3);

        let second = scheduler.tick().await.unwrap();
        assert_eq!(second.runs_created, 0);
        scheduler.executor.wait_idle().await;

        let runs = store.list_runs(Some("hourly"), None, 10).await.unwrap();
        assert_eq!(runs.len(), 3);
    }

    #[tokio::test]
    async fn test_paused_workflow_gets_no_runs() {
        let store = MetadataStore::in_memory().unwrap();
        let registry = Arc::new(WorkflowRegistry::new(units()));
        let start = (Utc::now() - chrono::Duration::minutes(30)).to_rfc3339();
        let yaml = format!(
            "name: paused\nschedule: \"@every 10m\"\ndefault_args:\n  start_date: \"{}\"\ntasks:\n  - name: a\n    unit: ok\n",
            start
        );
        let wf = registry.load(parse_workflow_yaml(&yaml).unwrap()).unwrap();
        store.register_workflow(wf.definition(), true).await.unwrap();

        let scheduler = scheduler(&store, Arc::clone(&registry));
        assert_eq!(scheduler.tick().await.unwrap().runs_created, 0);

        store.set_paused("paused", false).await.unwrap();
        // No catchup: only the latest instant
        assert_eq!(scheduler.tick().await.unwrap().runs_created, 1);
        scheduler.executor.wait_idle().await;
    }

    #[tokio::test]
    async fn test_stale_running_instance_reclaimed() {
        let store = MetadataStore::in_memory().unwrap();
        let registry = Arc::new(WorkflowRegistry::new(units()));
        let wf = registry
            .load(
                parse_workflow_yaml(
                    "name: wf\ndefault_args:\n  retries: 1\n  retry_delay: 1h\ntasks:\n  - name: a\n    unit: ok\n",
                )
                .unwrap(),
            )
            .unwrap();
        let run_id = manual_run(&store, &wf).await;

        // A worker in another process claims and then goes silent
        store
            .mark_queued(run_id, "a", TaskState::Pending)
            .await
            .unwrap();
        store
            .claim_task_instance(run_id, "a", "dead-worker")
            .await
            .unwrap()
            .unwrap();

        let scheduler = scheduler(&store, Arc::clone(&registry));
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let summary = scheduler.tick().await.unwrap();
        assert_eq!(summary.reclaimed, 1);

        let a = store.get_task_instance(run_id, "a").await.unwrap().unwrap();
        assert_eq!(a.state, TaskState::UpForRetry);
        assert_eq!(a.last_error.as_deref(), Some(HEARTBEAT_LOST));

        // The dead worker can no longer complete the attempt
        assert!(!store
            .complete_task_instance(run_id, "a", "dead-worker", Completion::Success(None))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_max_active_runs_holds_back_catchup() {
        let store = MetadataStore::in_memory().unwrap();
        let registry = Arc::new(WorkflowRegistry::new(units()));
        let start = (Utc::now() - chrono::Duration::minutes(150)).to_rfc3339();
        let yaml = format!(
            r#"
name: serial
schedule: "@hourly"
default_args:
  start_date: "{}"
config:
  catchup: true
  max_active_runs: 1
tasks:
  - name: a
    unit: ok
"#,
            start
        );
        let wf = registry.load(parse_workflow_yaml(&yaml).unwrap()).unwrap();
        store.register_workflow(wf.definition(), false).await.unwrap();
        let scheduler = scheduler(&store, Arc::clone(&registry));

        let mut finished = 0;
        for expected_runs in 1..=3 {
            let created = scheduler.tick().await.unwrap();
            assert_eq!(created.runs_created, 1);
            scheduler.executor.wait_idle().await;

            // Still open while its task result is unseen: nothing new
            let closing = scheduler.tick().await.unwrap();
            assert_eq!(closing.runs_created, 0);
            assert_eq!(closing.runs_finished, 1);
            finished += closing.runs_finished;

            let runs = store.list_runs(Some("serial"), None, 10).await.unwrap();
            assert_eq!(runs.len(), expected_runs);
        }
        assert_eq!(finished, 3);

        // All three missed instants are covered
        assert_eq!(scheduler.tick().await.unwrap().runs_created, 0);
        let runs = store
            .list_runs(Some("serial"), Some(RunState::Success), 10)
            .await
            .unwrap();
        assert_eq!(runs.len(), 3);
    }

    #[tokio::test]
    async fn test_stale_instance_of_unloaded_workflow_fails() {
        let store = MetadataStore::in_memory().unwrap();
        let registry = Arc::new(WorkflowRegistry::new(units()));
        let wf = Workflow::load(
            parse_workflow_yaml(
                "name: gone
default_args:
  retries: 3
tasks:
  - name: a
    unit: ok
",
            )
            .unwrap(),
            &units(),
        )
        .unwrap();
        let run_id = manual_run(&store, &wf).await;

        store
            .mark_queued(run_id, "a", TaskState::Pending)
            .await
            .unwrap();
        store
            .claim_task_instance(run_id, "a", "dead-worker")
            .await
            .unwrap()
            .unwrap();

        // Never loaded into the registry
        let scheduler = scheduler(&store, registry);
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let summary = scheduler.tick().await.unwrap();
        assert_eq!(summary.reclaimed, 1);
        assert_eq!(summary.runs_finished, 1);

        let a = store.get_task_instance(run_id, "a").await.unwrap().unwrap();
        assert_eq!(a.state, TaskState::Failed);
        assert_eq!(a.last_error.as_deref(), Some(HEARTBEAT_LOST));
        let run = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.state, RunState::Failed);
    }

    #[tokio::test]
    async fn test_run_loop_stops_on_shutdown() {
        let store = MetadataStore::in_memory().unwrap();
        let registry = Arc::new(WorkflowRegistry::new(units()));
        let scheduler = Arc::new(scheduler(&store, registry));

        let (tx, rx) = watch::channel(false);
        let handle = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run(rx).await })
        };

        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
