//! Validated, immutable workflow definitions
//!
//! A [`Workflow`] is built once from a [`WorkflowConfig`] and never changes.
//! Reloading a definition builds a new value and swaps it in the registry.

use crate::dag::DagEngine;
use crate::error::{Result, TributaryError};
use crate::models::{RunPlan, WorkflowConfig, WorkflowSettings};
use crate::parser::validate_workflow_config;
use crate::retry::RetryPolicy;
use crate::schedule::Schedule;
use crate::units::{Invocable, UnitRegistry};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Policy resolved for one task: task override, then `default_args`, then
/// the built-in default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPolicy {
    pub owner: String,
    pub retry: RetryPolicy,
    pub execution_timeout: Option<Duration>,
}

/// A task bound to its resolved unit
#[derive(Clone)]
pub struct Task {
    pub id: String,
    pub unit_name: String,
    pub unit: Arc<dyn Invocable>,
    pub params: Value,
    pub policy: ExecutionPolicy,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("unit", &self.unit_name)
            .field("params", &self.params)
            .field("policy", &self.policy)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Workflow {
    name: String,
    description: Option<String>,
    schedule: Schedule,
    start_date: Option<DateTime<Utc>>,
    settings: WorkflowSettings,
    tasks: HashMap<String, Task>,
    dag: DagEngine,
    definition: WorkflowConfig,
}

impl Workflow {
    /// Validate a definition and resolve every task's unit
    ///
    /// # Errors
    ///
    /// Any validation error: bad names, duplicates, missing dependencies,
    /// cycles, unknown units, invalid params, bad schedule, or a scheduled
    /// workflow without `start_date`.
    pub fn load(config: WorkflowConfig, units: &UnitRegistry) -> Result<Self> {
        validate_workflow_config(&config)?;

        let dag = DagEngine::build(&config.tasks)?;
        let schedule = Schedule::parse(config.schedule.as_deref())?;
        let start_date = config.default_args.start_date;

        if !schedule.is_manual() && start_date.is_none() {
            return Err(TributaryError::Validation(format!(
                "Workflow '{}' has schedule '{}' but no default_args.start_date",
                config.name, schedule
            )));
        }

        let defaults = &config.default_args;
        let mut tasks = HashMap::with_capacity(config.tasks.len());

        for task in &config.tasks {
            let unit = units.resolve(&task.name, &task.unit, &task.params)?;

            let policy = ExecutionPolicy {
                owner: task.owner.clone().unwrap_or_else(|| defaults.owner.clone()),
                retry: RetryPolicy::new(
                    task.retries.unwrap_or(defaults.retries),
                    task.retry_delay.unwrap_or(defaults.retry_delay),
                    task.retry_backoff.unwrap_or(defaults.retry_backoff),
                    task.max_retry_delay.unwrap_or(defaults.max_retry_delay),
                ),
                execution_timeout: task.execution_timeout.or(defaults.execution_timeout),
            };

            tasks.insert(
                task.name.clone(),
                Task {
                    id: task.name.clone(),
                    unit_name: task.unit.clone(),
                    unit,
                    params: task.params.clone(),
                    policy,
                },
            );
        }

        Ok(Self {
            name: config.name.clone(),
            description: config.description.clone(),
            schedule,
            start_date,
            settings: config.config.clone(),
            tasks,
            dag,
            definition: config,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    pub fn start_date(&self) -> Option<DateTime<Utc>> {
        self.start_date
    }

    pub fn settings(&self) -> &WorkflowSettings {
        &self.settings
    }

    pub fn dag(&self) -> &DagEngine {
        &self.dag
    }

    /// Original definition, persisted in the registry table
    pub fn definition(&self) -> &WorkflowConfig {
        &self.definition
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Tasks in topological order
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.dag
            .topological_order()
            .iter()
            .filter_map(|id| self.tasks.get(id))
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Task instances and edge snapshot for a new run
    pub fn run_plan(&self) -> RunPlan {
        RunPlan {
            tasks: self
                .tasks()
                .map(|t| (t.id.clone(), t.policy.retry.max_retries))
                .collect(),
            edges: self.dag.edges(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_workflow_yaml;
    use crate::retry::Backoff;

    fn registry() -> UnitRegistry {
        let mut units = UnitRegistry::new();
        units.register_fn("noop", |_ctx| async { Ok(Value::Null) });
        units
    }

    #[test]
    fn test_policy_precedence() {
        let yaml = r#"
name: wf
default_args:
  owner: team-a
  retries: 2
  retry_delay: 1m
tasks:
  - name: a
    unit: noop
  - name: b
    unit: noop
    depends_on: [a]
    retries: 5
    retry_backoff: fixed
    owner: team-b
    execution_timeout: 30s
"#;
        let wf = Workflow::load(parse_workflow_yaml(yaml).unwrap(), &registry()).unwrap();

        let a = wf.task("a").unwrap();
        assert_eq!(a.policy.owner, "team-a");
        assert_eq!(a.policy.retry.max_retries, 2);
        assert_eq!(a.policy.retry.retry_delay, Duration::from_secs(60));
        assert_eq!(a.policy.retry.backoff, Backoff::Linear);
        assert_eq!(a.policy.retry.max_delay, Duration::from_secs(3600));
        assert_eq!(a.policy.execution_timeout, None);

        let b = wf.task("b").unwrap();
        assert_eq!(b.policy.owner, "team-b");
        assert_eq!(b.policy.retry.max_retries, 5);
        assert_eq!(b.policy.retry.backoff, Backoff::Fixed);
        assert_eq!(b.policy.execution_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_unknown_unit_rejected() {
        let yaml = r#"
name: wf
tasks:
  - name: a
    unit: spark
"#;
        let result = Workflow::load(parse_workflow_yaml(yaml).unwrap(), &registry());
        assert!(matches!(result, Err(TributaryError::UnknownUnit { .. })));
    }

    #[test]
    fn test_cycle_rejected() {
        let yaml = r#"
name: wf
tasks:
  - name: a
    unit: noop
    depends_on: [b]
  - name: b
    unit: noop
    depends_on: [a]
"#;
        let result = Workflow::load(parse_workflow_yaml(yaml).unwrap(), &registry());
        assert!(matches!(result, Err(TributaryError::CycleDetected(_))));
    }

    #[test]
    fn test_scheduled_workflow_needs_start_date() {
        let yaml = r#"
name: wf
schedule: "@hourly"
tasks:
  - name: a
    unit: noop
"#;
        let result = Workflow::load(parse_workflow_yaml(yaml).unwrap(), &registry());
        assert!(matches!(result, Err(TributaryError::Validation(_))));
    }

    #[test]
    fn test_run_plan() {
        let yaml = r#"
name: wf
default_args:
  retries: 1
tasks:
  - name: c
    unit: noop
    depends_on: [a, b]
  - name: b
    unit: noop
  - name: a
    unit: noop
    retries: 0
"#;
        let wf = Workflow::load(parse_workflow_yaml(yaml).unwrap(), &registry()).unwrap();
        let plan = wf.run_plan();
        assert_eq!(
            plan.tasks,
            vec![
                ("a".to_string(), 0),
                ("b".to_string(), 1),
                ("c".to_string(), 1)
            ]
        );
        assert_eq!(plan.edges.len(), 2);
    }
}
