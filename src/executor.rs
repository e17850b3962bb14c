//! Bounded-parallel task executor
//!
//! The scheduler hands queued task instances to [`Executor::submit`], which
//! never blocks. Each item waits for a global permit and a per-workflow
//! permit, claims the instance in the store (losing the claim drops the item),
//! invokes the unit while heartbeating, and records the outcome through the
//! retry policy.

use crate::metrics::Metrics;
use crate::retry::{Decision, Outcome};
use crate::state::{Completion, MetadataStore};
use crate::units::{TaskContext, UnitError};
use crate::models::TaskState;
use crate::workflow::{Task, Workflow};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Deserialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Store writes that record an outcome are retried this many times
const COMPLETION_ATTEMPTS: u32 = 3;

/// Error recorded on instances whose task was removed by a reload
pub const TASK_REMOVED: &str = "task no longer in workflow definition";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Global cap on concurrently running invocations
    pub max_parallel: usize,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel: 8,
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

/// One queued task instance to execute
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub workflow: Arc<Workflow>,
    pub run_id: i64,
    pub logical_date: DateTime<Utc>,
    pub task_id: String,
}

type ItemKey = (i64, String);

/// How an invocation ended from the executor's point of view
enum Ending {
    Finished(Result<Value, UnitError>),
    /// Heartbeat rejected: the instance was cancelled, marked or reclaimed
    Lost,
    /// Local cancellation signal
    Cancelled,
}

/// Runs queued task instances under the global and per-workflow limits
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

struct Inner {
    store: MetadataStore,
    metrics: Arc<Metrics>,
    config: ExecutorConfig,
    global: Arc<Semaphore>,
    per_workflow: Mutex<HashMap<(String, usize), Arc<Semaphore>>>,
    tracked: Mutex<HashMap<ItemKey, watch::Sender<bool>>>,
    in_flight: AtomicUsize,
    idle: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // The maps stay consistent even if a holder panicked mid-insert
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Releases a submitted item's bookkeeping when its task ends, unwinding
/// included
struct TrackedItem {
    inner: Arc<Inner>,
    key: ItemKey,
}

impl Drop for TrackedItem {
    fn drop(&mut self) {
        lock(&self.inner.tracked).remove(&self.key);
        if self.inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl Executor {
    pub fn new(store: MetadataStore, metrics: Arc<Metrics>, config: ExecutorConfig) -> Self {
        let permits = config.max_parallel.max(1);
        Self {
            inner: Arc::new(Inner {
                store,
                metrics,
                global: Arc::new(Semaphore::new(permits)),
                config,
                per_workflow: Mutex::new(HashMap::new()),
                tracked: Mutex::new(HashMap::new()),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Hand over a queued instance. Returns `false` if this executor is
    /// already handling it.
    pub fn submit(&self, item: WorkItem) -> bool {
        let key = (item.run_id, item.task_id.clone());
        let cancel_rx = {
            let mut tracked = lock(&self.inner.tracked);
            if tracked.contains_key(&key) {
                return false;
            }
            let (tx, rx) = watch::channel(false);
            tracked.insert(key.clone(), tx);
            rx
        };

        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Submitted {}.{} (run {})",
            item.workflow.name(),
            item.task_id,
            item.run_id
        );

        let guard = TrackedItem {
            inner: Arc::clone(&self.inner),
            key,
        };
        tokio::spawn(async move {
            guard.inner.execute(item, cancel_rx).await;
            drop(guard);
        });

        true
    }

    /// Whether this executor currently holds the instance
    pub fn is_tracking(&self, run_id: i64, task_id: &str) -> bool {
        lock(&self.inner.tracked).contains_key(&(run_id, task_id.to_string()))
    }

    /// Signal local invocations of the given tasks to stop
    pub fn cancel(&self, run_id: i64, task_ids: &[String]) -> usize {
        let tracked = lock(&self.inner.tracked);
        let mut signalled = 0;
        for task_id in task_ids {
            if let Some(tx) = tracked.get(&(run_id, task_id.clone())) {
                let _ = tx.send(true);
                signalled += 1;
            }
        }
        signalled
    }

    /// Signal every local invocation of a run to stop
    pub fn cancel_run(&self, run_id: i64) -> usize {
        let tracked = lock(&self.inner.tracked);
        let mut signalled = 0;
        for ((id, _), tx) in tracked.iter() {
            if *id == run_id {
                let _ = tx.send(true);
                signalled += 1;
            }
        }
        signalled
    }

    /// Items submitted and not yet finished
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until every submitted item has finished
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Inner {
    fn workflow_semaphore(&self, workflow: &Workflow) -> Option<Arc<Semaphore>> {
        let limit = workflow.settings().max_active_tasks?;
        let mut semaphores = lock(&self.per_workflow);
        let semaphore = semaphores
            .entry((workflow.name().to_string(), limit))
            .or_insert_with(|| Arc::new(Semaphore::new(limit.max(1))));
        Some(Arc::clone(semaphore))
    }

    async fn execute(&self, item: WorkItem, mut cancel_rx: watch::Receiver<bool>) {
        let workflow = Arc::clone(&item.workflow);
        let task = match workflow.task(&item.task_id) {
            Some(task) => task,
            None => {
                self.fail_removed_task(&item).await;
                return;
            }
        };

        let _global = match Arc::clone(&self.global).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let _local = match self.workflow_semaphore(&workflow) {
            Some(semaphore) => match semaphore.acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => return,
            },
            None => None,
        };

        if *cancel_rx.borrow() {
            debug!("{}.{} cancelled before start", workflow.name(), task.id);
            return;
        }

        let worker_id = Uuid::new_v4().to_string();
        let instance = match self
            .store
            .claim_task_instance(item.run_id, &task.id, &worker_id)
            .await
        {
            Ok(Some(instance)) => instance,
            Ok(None) => {
                debug!(
                    "Lost claim for {}.{} (run {}), dropping",
                    workflow.name(),
                    task.id,
                    item.run_id
                );
                return;
            }
            Err(e) => {
                error!("Failed to claim {}.{}: {}", workflow.name(), task.id, e);
                return;
            }
        };

        let upstream = match self.store.upstream_outputs(item.run_id, &task.id).await {
            Ok(upstream) => upstream,
            Err(e) => {
                // Claimed but unable to start: record as a failed attempt
                warn!("Failed to load upstream outputs for {}: {}", task.id, e);
                let ending = Ending::Finished(Err(UnitError::Failed(format!(
                    "Failed to load upstream outputs: {}",
                    e
                ))));
                self.record(&workflow, task, &item, instance.attempt, &worker_id, ending, 0.0)
                    .await;
                return;
            }
        };

        let ctx = TaskContext {
            workflow: workflow.name().to_string(),
            run_id: item.run_id,
            logical_date: item.logical_date,
            task_id: task.id.clone(),
            attempt: instance.attempt,
            params: task.params.clone(),
            upstream,
        };

        info!(
            "Running {}.{} (run {}, attempt {}/{})",
            ctx.workflow,
            ctx.task_id,
            ctx.run_id,
            ctx.attempt,
            task.policy.retry.max_retries + 1
        );

        self.metrics.inc_running_tasks();
        let started = Instant::now();

        let call = AssertUnwindSafe(task.unit.invoke(&ctx))
            .catch_unwind()
            .map(|caught| {
                caught.unwrap_or_else(|payload| {
                    Err(UnitError::Failed(format!(
                        "unit panicked: {}",
                        panic_message(payload.as_ref())
                    )))
                })
            });
        let invocation = async {
            match task.policy.execution_timeout {
                Some(limit) => tokio::time::timeout(limit, call)
                    .await
                    .unwrap_or(Err(UnitError::Timeout(limit))),
                None => call.await,
            }
        };

        let ending = tokio::select! {
            result = invocation => Ending::Finished(result),
            _ = self.heartbeat_until_rejected(item.run_id, &task.id, &worker_id) => Ending::Lost,
            _ = cancel_rx.wait_for(|cancelled| *cancelled) => Ending::Cancelled,
        };

        self.metrics.dec_running_tasks();
        let elapsed = started.elapsed().as_secs_f64();

        self.record(
            &workflow,
            task,
            &item,
            instance.attempt,
            &worker_id,
            ending,
            elapsed,
        )
        .await;
    }

    /// A reload dropped the task: fail its queued instance so the run can
    /// finish
    async fn fail_removed_task(&self, item: &WorkItem) {
        warn!(
            "Task '{}' is not part of workflow '{}' anymore; failing it in run {}",
            item.task_id,
            item.workflow.name(),
            item.run_id
        );

        match self
            .store
            .compare_and_set_state(
                item.run_id,
                &item.task_id,
                TaskState::Queued,
                TaskState::Failed,
                Some(TASK_REMOVED),
            )
            .await
        {
            Ok(true) => {
                self.metrics
                    .record_task_attempt(item.workflow.name(), &item.task_id, "failed", 0.0);
            }
            Ok(false) => debug!("{} was no longer queued", item.task_id),
            Err(e) => error!("Failed to fail removed task {}: {}", item.task_id, e),
        }
    }

    /// Resolves once the store stops accepting this worker's heartbeats
    async fn heartbeat_until_rejected(&self, run_id: i64, task_id: &str, worker_id: &str) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match self.store.heartbeat(run_id, task_id, worker_id).await {
                Ok(true) => {}
                Ok(false) => return,
                // Transient store trouble; the next beat may succeed
                Err(e) => warn!("Heartbeat for {} failed: {}", task_id, e),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record(
        &self,
        workflow: &Workflow,
        task: &Task,
        item: &WorkItem,
        attempt: u32,
        worker_id: &str,
        ending: Ending,
        elapsed: f64,
    ) {
        let result = match ending {
            Ending::Finished(result) => result,
            Ending::Lost => {
                warn!(
                    "{}.{} (run {}) lost ownership; stopping invocation",
                    workflow.name(),
                    task.id,
                    item.run_id
                );
                self.metrics
                    .record_task_attempt(workflow.name(), &task.id, "lost", elapsed);
                return;
            }
            Ending::Cancelled => {
                info!(
                    "{}.{} (run {}) cancelled",
                    workflow.name(),
                    task.id,
                    item.run_id
                );
                self.metrics
                    .record_task_attempt(workflow.name(), &task.id, "cancelled", elapsed);
                return;
            }
        };

        let completion = match result {
            Ok(output) => {
                info!("{}.{} succeeded in {:.2}s", workflow.name(), task.id, elapsed);
                Completion::Success(Some(output))
            }
            Err(err) => match task.policy.retry.decide(attempt, Outcome::Failure) {
                Decision::Retry(delay) => {
                    warn!(
                        "{}.{} failed (attempt {}): {}; retrying in {}",
                        workflow.name(),
                        task.id,
                        attempt,
                        err,
                        humantime::format_duration(delay)
                    );
                    Completion::Retry {
                        error: err.to_string(),
                        next_retry_at: Utc::now() + crate::models::chrono_duration(delay),
                    }
                }
                Decision::Fail | Decision::Succeed => {
                    error!(
                        "{}.{} failed (attempt {}): {}",
                        workflow.name(),
                        task.id,
                        attempt,
                        err
                    );
                    Completion::Failed {
                        error: err.to_string(),
                    }
                }
            },
        };

        let state = completion.state();
        self.metrics
            .record_task_attempt(workflow.name(), &task.id, state.as_str(), elapsed);

        for tries in 1..=COMPLETION_ATTEMPTS {
            match self
                .store
                .complete_task_instance(item.run_id, &task.id, worker_id, completion.clone())
                .await
            {
                Ok(true) => return,
                Ok(false) => {
                    warn!(
                        "Completion of {}.{} rejected: instance changed while running",
                        workflow.name(),
                        task.id
                    );
                    return;
                }
                Err(e) if tries < COMPLETION_ATTEMPTS => {
                    warn!("Failed to record {} for {}: {}; retrying", state, task.id, e);
                    tokio::time::sleep(Duration::from_millis(200 * tries as u64)).await;
                }
                Err(e) => {
                    // Left running; the heartbeat reaper reclaims it
                    error!("Failed to record {} for {}: {}", state, task.id, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunKind, TaskState, WorkflowConfig};
    use crate::units::UnitRegistry;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn workflow(yaml: &str, units: &UnitRegistry) -> Arc<Workflow> {
        let config: WorkflowConfig = serde_yaml::from_str(yaml).unwrap();
        Arc::new(Workflow::load(config, units).unwrap())
    }

    async fn setup(wf: &Workflow, store: &MetadataStore) -> i64 {
        let (run, _) = store
            .create_run_if_absent(wf.name(), Utc::now(), RunKind::Manual, &wf.run_plan())
            .await
            .unwrap();
        run.id
    }

    fn executor(store: &MetadataStore) -> Executor {
        executor_with(store, 4)
    }

    fn executor_with(store: &MetadataStore, max_parallel: usize) -> Executor {
        Executor::new(
            store.clone(),
            Arc::new(Metrics::new().unwrap()),
            ExecutorConfig {
                max_parallel,
                heartbeat_interval: Duration::from_millis(50),
            },
        )
    }

    fn item(wf: &Arc<Workflow>, run_id: i64, task: &str) -> WorkItem {
        WorkItem {
            workflow: Arc::clone(wf),
            run_id,
            logical_date: Utc::now(),
            task_id: task.to_string(),
        }
    }

    /// Unit that records the highest number of overlapping invocations
    fn gauge_units(peak: Arc<AtomicUsize>) -> UnitRegistry {
        let current = Arc::new(AtomicUsize::new(0));
        let mut units = UnitRegistry::new();
        units.register_fn("gauge", move |_ctx| {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        });
        units
    }

    fn wide_yaml(header: &str, tasks: usize) -> String {
        let mut yaml = format!("name: wide\n{}tasks:\n", header);
        for i in 0..tasks {
            yaml.push_str(&format!("  - name: t{}\n    unit: gauge\n", i));
        }
        yaml
    }

    async fn run_wide(wf: &Arc<Workflow>, exec: &Executor, store: &MetadataStore) -> i64 {
        let run_id = setup(wf, store).await;
        for task in wf.dag().topological_order() {
            queue(store, run_id, task).await;
            assert!(exec.submit(item(wf, run_id, task)));
        }
        tokio::time::timeout(Duration::from_secs(10), exec.wait_idle())
            .await
            .unwrap();
        run_id
    }

    async fn queue(store: &MetadataStore, run_id: i64, task: &str) {
        assert!(store
            .mark_queued(run_id, task, TaskState::Pending)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_success_records_output() {
        let mut units = UnitRegistry::new();
        units.register_fn("echo", |ctx| async move { Ok(json!({"task": ctx.task_id})) });
        let wf = workflow("name: wf\ntasks:\n  - name: a\n    unit: echo\n", &units);

        let store = MetadataStore::in_memory().unwrap();
        let run_id = setup(&wf, &store).await;
        queue(&store, run_id, "a").await;

        let exec = executor(&store);
        assert!(exec.submit(WorkItem {
            workflow: Arc::clone(&wf),
            run_id,
            logical_date: Utc::now(),
            task_id: "a".to_string(),
        }));
        exec.wait_idle().await;

        let a = store.get_task_instance(run_id, "a").await.unwrap().unwrap();
        assert_eq!(a.state, TaskState::Success);
        assert_eq!(a.output, Some(json!({"task": "a"})));
        assert_eq!(a.attempt, 1);
    }

    #[tokio::test]
    async fn test_failure_schedules_retry() {
        let mut units = UnitRegistry::new();
        units.register_fn("fail", |_ctx| async {
            Err(UnitError::Failed("nope".to_string()))
        });
        let wf = workflow(
            "name: wf\ndefault_args:\n  retries: 1\n  retry_delay: 1m\ntasks:\n  - name: a\n    unit: fail\n",
            &units,
        );

        let store = MetadataStore::in_memory().unwrap();
        let run_id = setup(&wf, &store).await;
        queue(&store, run_id, "a").await;

        let exec = executor(&store);
        exec.submit(WorkItem {
            workflow: Arc::clone(&wf),
            run_id,
            logical_date: Utc::now(),
            task_id: "a".to_string(),
        });
        exec.wait_idle().await;

        let a = store.get_task_instance(run_id, "a").await.unwrap().unwrap();
        assert_eq!(a.state, TaskState::UpForRetry);
        assert_eq!(a.last_error.as_deref(), Some("nope"));
        let wait = a.next_retry_at.unwrap() - Utc::now();
        assert!(wait > chrono::Duration::seconds(50));
    }

    #[tokio::test]
    async fn test_execution_timeout_fails_task() {
        let mut units = UnitRegistry::new();
        units.register_fn("slow", |_ctx| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        });
        let wf = workflow(
            "name: wf\ndefault_args:\n  execution_timeout: 100ms\ntasks:\n  - name: a\n    unit: slow\n",
            &units,
        );

        let store = MetadataStore::in_memory().unwrap();
        let run_id = setup(&wf, &store).await;
        queue(&store, run_id, "a").await;

        let exec = executor(&store);
        exec.submit(WorkItem {
            workflow: Arc::clone(&wf),
            run_id,
            logical_date: Utc::now(),
            task_id: "a".to_string(),
        });
        exec.wait_idle().await;

        let a = store.get_task_instance(run_id, "a").await.unwrap().unwrap();
        assert_eq!(a.state, TaskState::Failed);
        assert!(a.last_error.unwrap().contains("Timed out"));
    }

    #[tokio::test]
    async fn test_unqueued_item_is_dropped() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let mut units = UnitRegistry::new();
        units.register_fn("count", move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        });
        let wf = workflow("name: wf\ntasks:\n  - name: a\n    unit: count\n", &units);

        let store = MetadataStore::in_memory().unwrap();
        let run_id = setup(&wf, &store).await;

        // Still pending: the claim must fail
        let exec = executor(&store);
        exec.submit(WorkItem {
            workflow: Arc::clone(&wf),
            run_id,
            logical_date: Utc::now(),
            task_id: "a".to_string(),
        });
        exec.wait_idle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let a = store.get_task_instance(run_id, "a").await.unwrap().unwrap();
        assert_eq!(a.state, TaskState::Pending);
    }

    #[tokio::test]
    async fn test_cancel_stops_running_invocation() {
        let mut units = UnitRegistry::new();
        units.register_fn("hang", |_ctx| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        });
        let wf = workflow("name: wf\ntasks:\n  - name: a\n    unit: hang\n", &units);

        let store = MetadataStore::in_memory().unwrap();
        let run_id = setup(&wf, &store).await;
        queue(&store, run_id, "a").await;

        let exec = executor(&store);
        exec.submit(WorkItem {
            workflow: Arc::clone(&wf),
            run_id,
            logical_date: Utc::now(),
            task_id: "a".to_string(),
        });

        // Wait for the claim
        for _ in 0..100 {
            let a = store.get_task_instance(run_id, "a").await.unwrap().unwrap();
            if a.state == TaskState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(exec.is_tracking(run_id, "a"));

        store.cancel_run(run_id, "cancelled").await.unwrap();
        assert_eq!(exec.cancel_run(run_id), 1);

        tokio::time::timeout(Duration::from_secs(5), exec.wait_idle())
            .await
            .unwrap();
        assert!(!exec.is_tracking(run_id, "a"));

        let a = store.get_task_instance(run_id, "a").await.unwrap().unwrap();
        assert_eq!(a.state, TaskState::Failed);
        assert_eq!(a.last_error.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_panicking_unit_counts_as_failure() {
        let mut units = UnitRegistry::new();
        units.register_fn("boom", |ctx| async move {
            if ctx.attempt > 0 {
                panic!("boom on attempt {}", ctx.attempt);
            }
            Ok(Value::Null)
        });
        let wf = workflow(
            "name: wf\ndefault_args:\n  retries: 1\n  retry_delay: 10ms\ntasks:\n  - name: a\n    unit: boom\n",
            &units,
        );

        let store = MetadataStore::in_memory().unwrap();
        let run_id = setup(&wf, &store).await;
        queue(&store, run_id, "a").await;

        let exec = executor(&store);
        assert!(exec.submit(item(&wf, run_id, "a")));
        tokio::time::timeout(Duration::from_secs(5), exec.wait_idle())
            .await
            .unwrap();
        assert_eq!(exec.in_flight(), 0);
        assert!(!exec.is_tracking(run_id, "a"));

        let a = store.get_task_instance(run_id, "a").await.unwrap().unwrap();
        assert_eq!(a.state, TaskState::UpForRetry);
        assert_eq!(a.last_error.as_deref(), Some("unit panicked: boom on attempt 1"));

        // The retry is accepted and exhausts the policy
        assert!(store
            .mark_queued(run_id, "a", TaskState::UpForRetry)
            .await
            .unwrap());
        assert!(exec.submit(item(&wf, run_id, "a")));
        tokio::time::timeout(Duration::from_secs(5), exec.wait_idle())
            .await
            .unwrap();

        let a = store.get_task_instance(run_id, "a").await.unwrap().unwrap();
        assert_eq!(a.state, TaskState::Failed);
        assert_eq!(a.attempt, 2);
    }

    #[tokio::test]
    async fn test_removed_task_is_failed() {
        let mut units = UnitRegistry::new();
        units.register_fn("ok", |_ctx| async { Ok(Value::Null) });
        let before = workflow(
            "name: wf\ntasks:\n  - name: a\n    unit: ok\n  - name: b\n    unit: ok\n",
            &units,
        );
        let after = workflow("name: wf\ntasks:\n  - name: a\n    unit: ok\n", &units);

        let store = MetadataStore::in_memory().unwrap();
        let run_id = setup(&before, &store).await;
        queue(&store, run_id, "b").await;

        let exec = executor(&store);
        assert!(exec.submit(item(&after, run_id, "b")));
        exec.wait_idle().await;

        let b = store.get_task_instance(run_id, "b").await.unwrap().unwrap();
        assert_eq!(b.state, TaskState::Failed);
        assert_eq!(b.attempt, 0);
        assert_eq!(b.last_error.as_deref(), Some(TASK_REMOVED));
    }

    #[tokio::test]
    async fn test_max_parallel_bounds_invocations() {
        let peak = Arc::new(AtomicUsize::new(0));
        let units = gauge_units(Arc::clone(&peak));
        let wf = workflow(&wide_yaml("", 6), &units);

        let store = MetadataStore::in_memory().unwrap();
        let exec = executor_with(&store, 2);
        let run_id = run_wide(&wf, &exec, &store).await;

        let peak = peak.load(Ordering::SeqCst);
        assert!((1..=2).contains(&peak), "peak {}", peak);
        let instances = store.list_task_instances(run_id).await.unwrap();
        assert!(instances.iter().all(|ti| ti.state == TaskState::Success));
    }

    #[tokio::test]
    async fn test_max_active_tasks_bounds_one_workflow() {
        let peak = Arc::new(AtomicUsize::new(0));
        let units = gauge_units(Arc::clone(&peak));
        let wf = workflow(&wide_yaml("config:\n  max_active_tasks: 1\n", 4), &units);

        let store = MetadataStore::in_memory().unwrap();
        let exec = executor_with(&store, 8);
        let run_id = run_wide(&wf, &exec, &store).await;

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        let instances = store.list_task_instances(run_id).await.unwrap();
        assert_eq!(instances.len(), 4);
        assert!(instances.iter().all(|ti| ti.state == TaskState::Success));
    }

    #[tokio::test]
    async fn test_duplicate_submit_rejected() {
        let mut units = UnitRegistry::new();
        units.register_fn("hang", |_ctx| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(Value::Null)
        });
        let wf = workflow("name: wf\ntasks:\n  - name: a\n    unit: hang\n", &units);

        let store = MetadataStore::in_memory().unwrap();
        let run_id = setup(&wf, &store).await;
        queue(&store, run_id, "a").await;

        let exec = executor(&store);
        let item = WorkItem {
            workflow: Arc::clone(&wf),
            run_id,
            logical_date: Utc::now(),
            task_id: "a".to_string(),
        };
        assert!(exec.submit(item.clone()));
        assert!(!exec.submit(item));
        exec.wait_idle().await;
        assert_eq!(exec.in_flight(), 0);
    }
}
