//! SQLite-backed metadata store
//!
//! The store is the single source of truth for runs and task instances and
//! the only synchronization point between schedulers and executors. Every
//! state change is a conditional write (expected state, and worker ownership
//! where it matters), so concurrent writers can never overwrite each other's
//! terminal states. Several processes may share one database file: WAL mode
//! plus a busy timeout lets them queue on the write lock.

use crate::error::{Result, TributaryError};
use crate::models::{
    Run, RunKind, RunPlan, RunState, TaskAttempt, TaskInstance, TaskState, WorkflowConfig,
    WorkflowRecord, WorkflowStatistics, WorkflowSummary, MAX_ERROR_LEN,
};
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

const RUN_COLUMNS: &str = "id, workflow, logical_date, kind, state, created_at, ended_at";

const INSTANCE_COLUMNS: &str = "id, run_id, task_id, state, attempt, max_retries, queued_at, \
     started_at, ended_at, heartbeat_at, next_retry_at, worker_id, last_error, output";

const NON_TERMINAL: &str = "('pending', 'queued', 'running', 'up_for_retry')";

/// How a running attempt ended, as recorded by its owning worker
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Success(Option<Value>),
    Retry {
        error: String,
        next_retry_at: DateTime<Utc>,
    },
    Failed {
        error: String,
    },
}

impl Completion {
    pub fn state(&self) -> TaskState {
        match self {
            Completion::Success(_) => TaskState::Success,
            Completion::Retry { .. } => TaskState::UpForRetry,
            Completion::Failed { .. } => TaskState::Failed,
        }
    }
}

/// Metadata store for workflows, runs and task instances
#[derive(Clone)]
pub struct MetadataStore {
    conn: Arc<Mutex<Connection>>,
}

impl MetadataStore {
    /// Open (or create) a database file
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(30))?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            ",
        )?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Private in-memory database
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS workflows (
                name TEXT PRIMARY KEY,
                definition TEXT NOT NULL,
                schedule TEXT,
                paused INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY,
                workflow TEXT NOT NULL,
                logical_date TEXT NOT NULL,
                kind TEXT NOT NULL,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                ended_at TEXT,
                UNIQUE (workflow, logical_date)
            );

            CREATE TABLE IF NOT EXISTS task_instances (
                id INTEGER PRIMARY KEY,
                run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                task_id TEXT NOT NULL,
                state TEXT NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 0,
                queued_at TEXT,
                started_at TEXT,
                ended_at TEXT,
                heartbeat_at TEXT,
                next_retry_at TEXT,
                worker_id TEXT,
                last_error TEXT,
                output TEXT,
                UNIQUE (run_id, task_id)
            );

            CREATE TABLE IF NOT EXISTS task_edges (
                run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                upstream TEXT NOT NULL,
                downstream TEXT NOT NULL,
                PRIMARY KEY (run_id, upstream, downstream)
            );

            CREATE TABLE IF NOT EXISTS task_attempts (
                id INTEGER PRIMARY KEY,
                run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                task_id TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                state TEXT NOT NULL,
                worker_id TEXT,
                started_at TEXT,
                ended_at TEXT NOT NULL,
                error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_runs_workflow_state ON runs(workflow, state);
            CREATE INDEX IF NOT EXISTS idx_runs_state ON runs(state);
            CREATE INDEX IF NOT EXISTS idx_task_instances_run_state ON task_instances(run_id, state);
            CREATE INDEX IF NOT EXISTS idx_task_edges_downstream ON task_edges(run_id, downstream);
            CREATE INDEX IF NOT EXISTS idx_task_attempts_run_task ON task_attempts(run_id, task_id);
            ",
        )?;

        Ok(())
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| {
                TributaryError::Infrastructure("metadata store lock poisoned".to_string())
            })?;
            f(&mut guard)
        })
        .await
        .map_err(|e| TributaryError::Infrastructure(format!("metadata store task failed: {}", e)))?
    }

    // ---- workflow registry ----

    /// Insert or update a workflow definition. The paused flag of an existing
    /// row is preserved; new rows start with `paused_on_create`.
    ///
    /// # Returns
    ///
    /// Whether the workflow is currently paused.
    pub async fn register_workflow(
        &self,
        definition: &WorkflowConfig,
        paused_on_create: bool,
    ) -> Result<bool> {
        let name = definition.name.clone();
        let schedule = definition.schedule.clone();
        let json = serde_json::to_string(definition)?;

        self.with_conn(move |conn| {
            let now = Utc::now();
            conn.execute(
                "INSERT INTO workflows (name, definition, schedule, paused, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT(name) DO UPDATE SET
                    definition = excluded.definition,
                    schedule = excluded.schedule,
                    updated_at = excluded.updated_at",
                params![name, json, schedule, paused_on_create, now],
            )?;

            let paused: bool = conn.query_row(
                "SELECT paused FROM workflows WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )?;
            Ok(paused)
        })
        .await
    }

    pub async fn set_paused(&self, workflow: &str, paused: bool) -> Result<()> {
        let workflow = workflow.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE workflows SET paused = ?1, updated_at = ?2 WHERE name = ?3",
                params![paused, Utc::now(), workflow],
            )?;
            if changed == 0 {
                return Err(TributaryError::NotFound(format!("workflow '{}'", workflow)));
            }
            Ok(())
        })
        .await
    }

    /// Unregistered workflows count as not paused
    pub async fn is_paused(&self, workflow: &str) -> Result<bool> {
        let workflow = workflow.to_string();
        self.with_conn(move |conn| {
            let paused: Option<bool> = conn
                .query_row(
                    "SELECT paused FROM workflows WHERE name = ?1",
                    params![workflow],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(paused.unwrap_or(false))
        })
        .await
    }

    pub async fn get_workflow_record(&self, workflow: &str) -> Result<Option<WorkflowRecord>> {
        let workflow = workflow.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT name, definition, schedule, paused, created_at, updated_at
                     FROM workflows WHERE name = ?1",
                    params![workflow],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, bool>(3)?,
                            row.get::<_, DateTime<Utc>>(4)?,
                            row.get::<_, DateTime<Utc>>(5)?,
                        ))
                    },
                )
                .optional()?;

            match row {
                Some((name, definition, schedule, paused, created_at, updated_at)) => {
                    Ok(Some(WorkflowRecord {
                        name,
                        definition: serde_json::from_str(&definition)?,
                        schedule,
                        paused,
                        created_at,
                        updated_at,
                    }))
                }
                None => Ok(None),
            }
        })
        .await
    }

    /// All registered workflows with run counts
    pub async fn list_workflows(&self) -> Result<Vec<WorkflowSummary>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT w.name, w.schedule, w.paused,
                        COUNT(r.id),
                        COALESCE(SUM(CASE WHEN r.state = 'success' THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN r.state = 'failed' THEN 1 ELSE 0 END), 0),
                        MAX(r.logical_date)
                 FROM workflows w
                 LEFT JOIN runs r ON r.workflow = w.name
                 GROUP BY w.name
                 ORDER BY w.name",
            )?;

            let rows = stmt.query_map([], |row| {
                Ok(WorkflowSummary {
                    name: row.get(0)?,
                    schedule: row.get(1)?,
                    paused: row.get(2)?,
                    run_count: row.get(3)?,
                    success_count: row.get(4)?,
                    failed_count: row.get(5)?,
                    last_run: row.get(6)?,
                })
            })?;

            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
        .await
    }

    pub async fn get_workflow_statistics(&self, workflow: &str) -> Result<WorkflowStatistics> {
        let workflow = workflow.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT state, created_at, ended_at, logical_date FROM runs WHERE workflow = ?1",
            )?;
            let rows = stmt
                .query_map(params![workflow], |row| {
                    Ok((
                        row.get::<_, RunState>(0)?,
                        row.get::<_, DateTime<Utc>>(1)?,
                        row.get::<_, Option<DateTime<Utc>>>(2)?,
                        row.get::<_, DateTime<Utc>>(3)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let total_runs = rows.len() as i64;
            let count = |state: RunState| rows.iter().filter(|r| r.0 == state).count() as i64;
            let success_count = count(RunState::Success);
            let failed_count = count(RunState::Failed);
            let running_count = count(RunState::Running);

            let finished = success_count + failed_count;
            let success_rate = if finished > 0 {
                success_count as f64 / finished as f64 * 100.0
            } else {
                0.0
            };

            let durations: Vec<f64> = rows
                .iter()
                .filter_map(|(_, created, ended, _)| {
                    ended.map(|e| (e - *created).num_milliseconds() as f64 / 1000.0)
                })
                .collect();
            let avg_duration_seconds = if durations.is_empty() {
                None
            } else {
                Some(durations.iter().sum::<f64>() / durations.len() as f64)
            };

            Ok(WorkflowStatistics {
                total_runs,
                success_count,
                failed_count,
                running_count,
                success_rate,
                avg_duration_seconds,
                last_run: rows.iter().map(|r| r.3).max(),
            })
        })
        .await
    }

    // ---- runs ----

    /// Create the run for (workflow, logical_date) unless it already exists.
    ///
    /// The insert, its task instances and the edge snapshot are written in
    /// one immediate transaction, so concurrent callers observe exactly one
    /// run.
    ///
    /// # Returns
    ///
    /// The run and whether this call created it.
    pub async fn create_run_if_absent(
        &self,
        workflow: &str,
        logical_date: DateTime<Utc>,
        kind: RunKind,
        plan: &RunPlan,
    ) -> Result<(Run, bool)> {
        let workflow = workflow.to_string();
        let plan = plan.clone();

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = Utc::now();

            let inserted = tx.execute(
                "INSERT OR IGNORE INTO runs (workflow, logical_date, kind, state, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![workflow, logical_date, kind, RunState::Running, now],
            )?;

            if inserted == 1 {
                let run_id = tx.last_insert_rowid();
                {
                    let mut insert_ti = tx.prepare(
                        "INSERT INTO task_instances (run_id, task_id, state, max_retries)
                         VALUES (?1, ?2, ?3, ?4)",
                    )?;
                    for (task_id, max_retries) in &plan.tasks {
                        insert_ti.execute(params![
                            run_id,
                            task_id,
                            TaskState::Pending,
                            max_retries
                        ])?;
                    }

                    let mut insert_edge = tx.prepare(
                        "INSERT OR IGNORE INTO task_edges (run_id, upstream, downstream)
                         VALUES (?1, ?2, ?3)",
                    )?;
                    for (upstream, downstream) in &plan.edges {
                        insert_edge.execute(params![run_id, upstream, downstream])?;
                    }
                }
                debug!(
                    "Created run {} for {} at {} ({} tasks)",
                    run_id,
                    workflow,
                    logical_date,
                    plan.tasks.len()
                );
            }

            let run = tx.query_row(
                &format!(
                    "SELECT {} FROM runs WHERE workflow = ?1 AND logical_date = ?2",
                    RUN_COLUMNS
                ),
                params![workflow, logical_date],
                run_from_row,
            )?;

            tx.commit()?;
            Ok((run, inserted == 1))
        })
        .await
    }

    pub async fn get_run(&self, run_id: i64) -> Result<Option<Run>> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
                    params![run_id],
                    run_from_row,
                )
                .optional()?)
        })
        .await
    }

    /// Run of `workflow` for exactly `logical_date`
    pub async fn find_run(
        &self,
        workflow: &str,
        logical_date: DateTime<Utc>,
    ) -> Result<Option<Run>> {
        let workflow = workflow.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {} FROM runs WHERE workflow = ?1 AND logical_date = ?2",
                        RUN_COLUMNS
                    ),
                    params![workflow, logical_date],
                    run_from_row,
                )
                .optional()?)
        })
        .await
    }

    /// Run with the greatest logical date, optionally restricted to one kind
    pub async fn latest_run(&self, workflow: &str, kind: Option<RunKind>) -> Result<Option<Run>> {
        let workflow = workflow.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {} FROM runs
                         WHERE workflow = ?1 AND (?2 IS NULL OR kind = ?2)
                         ORDER BY logical_date DESC LIMIT 1",
                        RUN_COLUMNS
                    ),
                    params![workflow, kind],
                    run_from_row,
                )
                .optional()?)
        })
        .await
    }

    /// Most recent runs first
    pub async fn list_runs(
        &self,
        workflow: Option<&str>,
        state: Option<RunState>,
        limit: usize,
    ) -> Result<Vec<Run>> {
        let workflow = workflow.map(str::to_string);
        let limit = limit.min(i64::MAX as usize) as i64;
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM runs
                 WHERE (?1 IS NULL OR workflow = ?1) AND (?2 IS NULL OR state = ?2)
                 ORDER BY logical_date DESC, id DESC
                 LIMIT ?3",
                RUN_COLUMNS
            ))?;
            let rows = stmt.query_map(params![workflow, state, limit], run_from_row)?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
        .await
    }

    /// Runs still in `running`, oldest first
    pub async fn list_open_runs(&self) -> Result<Vec<Run>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM runs WHERE state = 'running' ORDER BY logical_date, id",
                RUN_COLUMNS
            ))?;
            let rows = stmt.query_map([], run_from_row)?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
        .await
    }

    pub async fn count_open_runs(&self, workflow: &str, kind: Option<RunKind>) -> Result<usize> {
        let workflow = workflow.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM runs
                 WHERE workflow = ?1 AND state = 'running' AND (?2 IS NULL OR kind = ?2)",
                params![workflow, kind],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }

    /// Move a run from `expected` to `new`. Returns `false` if the run was not
    /// in `expected`.
    pub async fn set_run_state(
        &self,
        run_id: i64,
        expected: RunState,
        new: RunState,
    ) -> Result<bool> {
        self.with_conn(move |conn| {
            let ended_at = if new.is_terminal() {
                Some(Utc::now())
            } else {
                None
            };
            let changed = conn.execute(
                "UPDATE runs SET state = ?1, ended_at = ?2 WHERE id = ?3 AND state = ?4",
                params![new, ended_at, run_id, expected],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    // ---- task instances ----

    pub async fn get_task_instance(
        &self,
        run_id: i64,
        task_id: &str,
    ) -> Result<Option<TaskInstance>> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| Ok(query_instance(conn, run_id, &task_id)?))
            .await
    }

    /// Instances of a run in plan (topological) order
    pub async fn list_task_instances(&self, run_id: i64) -> Result<Vec<TaskInstance>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM task_instances WHERE run_id = ?1 ORDER BY id",
                INSTANCE_COLUMNS
            ))?;
            let rows = stmt.query_map(params![run_id], instance_from_row)?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
        .await
    }

    pub async fn list_task_instances_in_state(
        &self,
        run_id: i64,
        state: TaskState,
    ) -> Result<Vec<TaskInstance>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM task_instances WHERE run_id = ?1 AND state = ?2 ORDER BY id",
                INSTANCE_COLUMNS
            ))?;
            let rows = stmt.query_map(params![run_id, state], instance_from_row)?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
        .await
    }

    /// Pending instances whose every upstream edge is `success` or `skipped`
    pub async fn list_eligible_task_instances(&self, run_id: i64) -> Result<Vec<TaskInstance>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM task_instances ti
                 WHERE ti.run_id = ?1 AND ti.state = 'pending'
                   AND NOT EXISTS (
                     SELECT 1 FROM task_edges e
                     JOIN task_instances up ON up.run_id = e.run_id AND up.task_id = e.upstream
                     WHERE e.run_id = ti.run_id
                       AND e.downstream = ti.task_id
                       AND up.state NOT IN ('success', 'skipped')
                   )
                 ORDER BY ti.id",
                INSTANCE_COLUMNS
            ))?;
            let rows = stmt.query_map(params![run_id], instance_from_row)?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
        .await
    }

    /// Edge snapshot of a run as (upstream, downstream)
    pub async fn list_edges(&self, run_id: i64) -> Result<Vec<(String, String)>> {
        self.with_conn(move |conn| Ok(query_edges(conn, run_id)?))
            .await
    }

    /// Conditional state change along a legal edge of the state machine.
    ///
    /// # Returns
    ///
    /// `false` when the instance was no longer in `expected` (lost race).
    ///
    /// # Errors
    ///
    /// `IllegalTransition` if `expected -> new` is not a legal edge.
    pub async fn compare_and_set_state(
        &self,
        run_id: i64,
        task_id: &str,
        expected: TaskState,
        new: TaskState,
        error: Option<&str>,
    ) -> Result<bool> {
        if !expected.can_transition_to(new) {
            return Err(TributaryError::IllegalTransition {
                task: task_id.to_string(),
                from: expected,
                to: new,
            });
        }

        let task_id = task_id.to_string();
        let error = error.map(truncate_error);

        self.with_conn(move |conn| {
            let now = Utc::now();
            let changed = conn.execute(
                "UPDATE task_instances SET
                    state = ?1,
                    queued_at = CASE WHEN ?1 = 'queued' THEN ?2 ELSE queued_at END,
                    next_retry_at = CASE WHEN ?1 = 'queued' THEN NULL ELSE next_retry_at END,
                    ended_at = CASE WHEN ?3 THEN ?2 ELSE ended_at END,
                    last_error = COALESCE(?4, last_error)
                 WHERE run_id = ?5 AND task_id = ?6 AND state = ?7",
                params![new, now, new.is_terminal(), error, run_id, task_id, expected],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    /// `pending`/`up_for_retry` -> `queued`
    pub async fn mark_queued(&self, run_id: i64, task_id: &str, from: TaskState) -> Result<bool> {
        self.compare_and_set_state(run_id, task_id, from, TaskState::Queued, None)
            .await
    }

    /// Restart the queued clock of an instance that is being resubmitted
    pub async fn refresh_queued_at(&self, run_id: i64, task_id: &str) -> Result<bool> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE task_instances SET queued_at = ?1
                 WHERE run_id = ?2 AND task_id = ?3 AND state = 'queued'",
                params![Utc::now(), run_id, task_id],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    /// `queued -> running` for `worker_id`, starting a new attempt.
    ///
    /// # Returns
    ///
    /// The claimed instance, or `None` if someone else got there first.
    pub async fn claim_task_instance(
        &self,
        run_id: i64,
        task_id: &str,
        worker_id: &str,
    ) -> Result<Option<TaskInstance>> {
        let task_id = task_id.to_string();
        let worker_id = worker_id.to_string();

        self.with_conn(move |conn| {
            let now = Utc::now();
            let changed = conn.execute(
                "UPDATE task_instances SET
                    state = 'running',
                    attempt = attempt + 1,
                    worker_id = ?1,
                    started_at = ?2,
                    heartbeat_at = ?2,
                    ended_at = NULL,
                    next_retry_at = NULL
                 WHERE run_id = ?3 AND task_id = ?4 AND state = 'queued'",
                params![worker_id, now, run_id, task_id],
            )?;

            if changed == 0 {
                return Ok(None);
            }
            Ok(query_instance(conn, run_id, &task_id)?)
        })
        .await
    }

    /// Refresh the heartbeat of a running instance owned by `worker_id`.
    ///
    /// Returns `false` once the instance was cancelled, marked or reclaimed,
    /// which tells the worker to stop.
    pub async fn heartbeat(&self, run_id: i64, task_id: &str, worker_id: &str) -> Result<bool> {
        let task_id = task_id.to_string();
        let worker_id = worker_id.to_string();

        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE task_instances SET heartbeat_at = ?1
                 WHERE run_id = ?2 AND task_id = ?3 AND state = 'running' AND worker_id = ?4",
                params![Utc::now(), run_id, task_id, worker_id],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    /// Record the end of the attempt owned by `worker_id` and append it to
    /// the attempt history.
    ///
    /// Returns `false` if the instance is no longer running under that worker.
    pub async fn complete_task_instance(
        &self,
        run_id: i64,
        task_id: &str,
        worker_id: &str,
        completion: Completion,
    ) -> Result<bool> {
        let task_id = task_id.to_string();
        let worker_id = worker_id.to_string();

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = Utc::now();
            let state = completion.state();

            let (output, error, next_retry_at) = match completion {
                Completion::Success(output) => (output, None, None),
                Completion::Retry {
                    error,
                    next_retry_at,
                } => (None, Some(truncate_error(&error)), Some(next_retry_at)),
                Completion::Failed { error } => (None, Some(truncate_error(&error)), None),
            };

            let changed = tx.execute(
                "UPDATE task_instances SET
                    state = ?1,
                    ended_at = ?2,
                    output = ?3,
                    last_error = ?4,
                    next_retry_at = ?5
                 WHERE run_id = ?6 AND task_id = ?7 AND state = 'running' AND worker_id = ?8",
                params![state, now, output, error, next_retry_at, run_id, task_id, worker_id],
            )?;

            if changed == 0 {
                return Ok(false);
            }

            tx.execute(
                "INSERT INTO task_attempts (run_id, task_id, attempt, state, worker_id, started_at, ended_at, error)
                 SELECT run_id, task_id, attempt, ?1, worker_id, started_at, ?2, ?3
                 FROM task_instances WHERE run_id = ?4 AND task_id = ?5",
                params![state, now, error, run_id, task_id],
            )?;

            tx.commit()?;
            Ok(true)
        })
        .await
    }

    /// Outputs of the direct dependencies of `task_id`, from the edge snapshot
    pub async fn upstream_outputs(
        &self,
        run_id: i64,
        task_id: &str,
    ) -> Result<BTreeMap<String, Value>> {
        let task_id = task_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT e.upstream, up.output
                 FROM task_edges e
                 JOIN task_instances up ON up.run_id = e.run_id AND up.task_id = e.upstream
                 WHERE e.run_id = ?1 AND e.downstream = ?2",
            )?;
            let rows = stmt.query_map(params![run_id, task_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<Value>>(1)?.unwrap_or(Value::Null),
                ))
            })?;
            Ok(rows.collect::<std::result::Result<BTreeMap<_, _>, _>>()?)
        })
        .await
    }

    /// Attempt history of a run, optionally for one task
    pub async fn list_attempts(
        &self,
        run_id: i64,
        task_id: Option<&str>,
    ) -> Result<Vec<TaskAttempt>> {
        let task_id = task_id.map(str::to_string);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT run_id, task_id, attempt, state, worker_id, started_at, ended_at, error
                 FROM task_attempts
                 WHERE run_id = ?1 AND (?2 IS NULL OR task_id = ?2)
                 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![run_id, task_id], |row| {
                Ok(TaskAttempt {
                    run_id: row.get(0)?,
                    task_id: row.get(1)?,
                    attempt: row.get(2)?,
                    state: row.get(3)?,
                    worker_id: row.get(4)?,
                    started_at: row.get(5)?,
                    ended_at: row.get(6)?,
                    error: row.get(7)?,
                })
            })?;
            Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
        })
        .await
    }

    // ---- control ----

    /// Fail every non-terminal instance of a run and the run itself.
    ///
    /// # Returns
    ///
    /// The instances that were `running`, so their workers can be signalled.
    pub async fn cancel_run(&self, run_id: i64, reason: &str) -> Result<Vec<TaskInstance>> {
        let reason = truncate_error(reason);

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = Utc::now();

            let exists: Option<i64> = tx
                .query_row("SELECT id FROM runs WHERE id = ?1", params![run_id], |row| {
                    row.get(0)
                })
                .optional()?;
            if exists.is_none() {
                return Err(TributaryError::NotFound(format!("run {}", run_id)));
            }

            let running = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {} FROM task_instances WHERE run_id = ?1 AND state = 'running'",
                    INSTANCE_COLUMNS
                ))?;
                let rows = stmt.query_map(params![run_id], instance_from_row)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            };

            tx.execute(
                "INSERT INTO task_attempts (run_id, task_id, attempt, state, worker_id, started_at, ended_at, error)
                 SELECT run_id, task_id, attempt, 'failed', worker_id, started_at, ?1, ?2
                 FROM task_instances WHERE run_id = ?3 AND state = 'running'",
                params![now, reason, run_id],
            )?;

            let failed = tx.execute(
                &format!(
                    "UPDATE task_instances SET state = 'failed', ended_at = ?1, last_error = ?2
                     WHERE run_id = ?3 AND state IN {}",
                    NON_TERMINAL
                ),
                params![now, reason, run_id],
            )?;

            tx.execute(
                "UPDATE runs SET state = 'failed', ended_at = ?1 WHERE id = ?2 AND state = 'running'",
                params![now, run_id],
            )?;

            tx.commit()?;
            info!(
                "Cancelled run {} ({} task instances failed, {} were running)",
                run_id,
                failed,
                running.len()
            );
            Ok(running)
        })
        .await
    }

    /// Operator override: force a non-terminal instance to `success`,
    /// `failed` or `skipped`.
    pub async fn mark_task_instance(
        &self,
        run_id: i64,
        task_id: &str,
        new: TaskState,
    ) -> Result<TaskInstance> {
        let task_id = task_id.to_string();

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = Utc::now();

            let current = query_instance(&tx, run_id, &task_id)?.ok_or_else(|| {
                TributaryError::NotFound(format!("task instance {}/{}", run_id, task_id))
            })?;

            if !current.state.can_mark(new) {
                return Err(TributaryError::IllegalTransition {
                    task: task_id,
                    from: current.state,
                    to: new,
                });
            }

            let note = format!("marked {} by operator", new);

            if current.state == TaskState::Running {
                tx.execute(
                    "INSERT INTO task_attempts (run_id, task_id, attempt, state, worker_id, started_at, ended_at, error)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        run_id,
                        task_id,
                        current.attempt,
                        new,
                        current.worker_id,
                        current.started_at,
                        now,
                        note
                    ],
                )?;
            }

            let error = if new == TaskState::Failed {
                Some(note)
            } else {
                current.last_error.clone()
            };

            tx.execute(
                "UPDATE task_instances SET state = ?1, ended_at = ?2, worker_id = NULL, last_error = ?3
                 WHERE run_id = ?4 AND task_id = ?5 AND state = ?6",
                params![new, now, error, run_id, task_id, current.state],
            )?;

            let updated = query_instance(&tx, run_id, &task_id)?.ok_or_else(|| {
                TributaryError::NotFound(format!("task instance {}/{}", run_id, task_id))
            })?;

            tx.commit()?;
            Ok(updated)
        })
        .await
    }

    /// Reset a terminal instance (and optionally its terminal downstream) to
    /// `pending` with a fresh attempt count, reopening the run.
    ///
    /// # Returns
    ///
    /// Task ids that were reset.
    pub async fn clear_task_instance(
        &self,
        run_id: i64,
        task_id: &str,
        include_downstream: bool,
    ) -> Result<Vec<String>> {
        let task_id = task_id.to_string();

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let current = query_instance(&tx, run_id, &task_id)?.ok_or_else(|| {
                TributaryError::NotFound(format!("task instance {}/{}", run_id, task_id))
            })?;

            if !current.state.is_terminal() {
                return Err(TributaryError::IllegalTransition {
                    task: task_id,
                    from: current.state,
                    to: TaskState::Pending,
                });
            }

            let mut targets = vec![task_id.clone()];
            if include_downstream {
                let edges = query_edges(&tx, run_id)?;
                let mut seen: HashSet<String> = HashSet::from([task_id.clone()]);
                let mut queue = VecDeque::from([task_id.clone()]);
                while let Some(node) = queue.pop_front() {
                    for (_, down) in edges.iter().filter(|(up, _)| *up == node) {
                        if seen.insert(down.clone()) {
                            targets.push(down.clone());
                            queue.push_back(down.clone());
                        }
                    }
                }
            }

            let mut cleared = Vec::new();
            for target in targets {
                let changed = tx.execute(
                    "UPDATE task_instances SET
                        state = 'pending', attempt = 0, queued_at = NULL, started_at = NULL,
                        ended_at = NULL, heartbeat_at = NULL, next_retry_at = NULL,
                        worker_id = NULL, last_error = NULL, output = NULL
                     WHERE run_id = ?1 AND task_id = ?2
                       AND state IN ('success', 'failed', 'upstream_failed', 'skipped')",
                    params![run_id, target],
                )?;
                if changed == 1 {
                    cleared.push(target);
                }
            }

            tx.execute(
                "UPDATE runs SET state = 'running', ended_at = NULL WHERE id = ?1",
                params![run_id],
            )?;

            tx.commit()?;
            info!("Cleared {:?} in run {}", cleared, run_id);
            Ok(cleared)
        })
        .await
    }

    // ---- retention ----

    /// Delete finished runs whose logical date precedes `before`, with their
    /// instances, edges and attempts.
    pub async fn purge_runs(&self, workflow: Option<&str>, before: DateTime<Utc>) -> Result<usize> {
        let workflow = workflow.map(str::to_string);
        self.with_conn(move |conn| {
            let runs: Vec<(i64, DateTime<Utc>)> = {
                let mut stmt = conn.prepare(
                    "SELECT id, logical_date FROM runs
                     WHERE state != 'running' AND (?1 IS NULL OR workflow = ?1)",
                )?;
                let rows = stmt.query_map(params![workflow], |row| Ok((row.get(0)?, row.get(1)?)))?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            };

            let tx = conn.transaction()?;
            let mut deleted = 0;
            for (id, logical_date) in runs {
                if logical_date < before {
                    deleted += tx.execute("DELETE FROM runs WHERE id = ?1", params![id])?;
                }
            }
            tx.commit()?;

            info!("Purged {} runs older than {}", deleted, before);
            Ok(deleted)
        })
        .await
    }
}

fn truncate_error(error: &str) -> String {
    if error.len() <= MAX_ERROR_LEN {
        return error.to_string();
    }
    let mut end = MAX_ERROR_LEN;
    while !error.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &error[..end])
}

fn query_instance(
    conn: &Connection,
    run_id: i64,
    task_id: &str,
) -> rusqlite::Result<Option<TaskInstance>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM task_instances WHERE run_id = ?1 AND task_id = ?2",
            INSTANCE_COLUMNS
        ),
        params![run_id, task_id],
        instance_from_row,
    )
    .optional()
}

fn query_edges(conn: &Connection, run_id: i64) -> rusqlite::Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT upstream, downstream FROM task_edges WHERE run_id = ?1 ORDER BY upstream, downstream",
    )?;
    let rows = stmt.query_map(params![run_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        id: row.get(0)?,
        workflow: row.get(1)?,
        logical_date: row.get(2)?,
        kind: row.get(3)?,
        state: row.get(4)?,
        created_at: row.get(5)?,
        ended_at: row.get(6)?,
    })
}

fn instance_from_row(row: &Row<'_>) -> rusqlite::Result<TaskInstance> {
    Ok(TaskInstance {
        id: row.get(0)?,
        run_id: row.get(1)?,
        task_id: row.get(2)?,
        state: row.get(3)?,
        attempt: row.get(4)?,
        max_retries: row.get(5)?,
        queued_at: row.get(6)?,
        started_at: row.get(7)?,
        ended_at: row.get(8)?,
        heartbeat_at: row.get(9)?,
        next_retry_at: row.get(10)?,
        worker_id: row.get(11)?,
        last_error: row.get(12)?,
        output: row.get(13)?,
    })
}

fn parse_column<T: std::str::FromStr<Err = String>>(value: ValueRef<'_>) -> FromSqlResult<T> {
    value
        .as_str()?
        .parse()
        .map_err(|e: String| FromSqlError::Other(e.into()))
}

impl ToSql for TaskState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TaskState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        parse_column(value)
    }
}

impl ToSql for RunState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for RunState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        parse_column(value)
    }
}

impl ToSql for RunKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for RunKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        parse_column(value)
    }
}
