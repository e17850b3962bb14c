//! Invocable units: the work performed inside a task
//!
//! A task names a unit; the unit is resolved through an explicit
//! [`UnitRegistry`] when the workflow is loaded. The orchestrator only sees
//! the unit's output value or its error.

pub mod http;
pub mod shell;

use crate::error::{Result, TributaryError};
use crate::models::MAX_OUTPUT_SIZE;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Everything a unit gets to know about the invocation
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub workflow: String,
    pub run_id: i64,
    pub logical_date: DateTime<Utc>,
    pub task_id: String,
    /// 1-based attempt number
    pub attempt: u32,
    pub params: Value,
    /// Outputs of direct dependencies, keyed by task id
    pub upstream: BTreeMap<String, Value>,
}

/// Failure of a single invocation. Recorded as the instance's `last_error`.
#[derive(Error, Debug)]
pub enum UnitError {
    #[error("{0}")]
    Failed(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Timed out after {}", human_duration(.0))]
    Timeout(Duration),

    #[error("Cancelled")]
    Cancelled,
}

fn human_duration(duration: &Duration) -> String {
    humantime::format_duration(*duration).to_string()
}

/// A unit of work that can be invoked by the executor.
///
/// Invocations may be repeated (retries, reclaimed workers), so units must be
/// idempotent.
#[async_trait]
pub trait Invocable: Send + Sync {
    async fn invoke(&self, ctx: &TaskContext) -> std::result::Result<Value, UnitError>;

    /// Check task params at load time
    fn validate(&self, _params: &Value) -> std::result::Result<(), String> {
        Ok(())
    }
}

type UnitFn =
    dyn Fn(TaskContext) -> BoxFuture<'static, std::result::Result<Value, UnitError>> + Send + Sync;

/// Unit backed by an async closure
pub struct FnUnit {
    func: Box<UnitFn>,
}

impl FnUnit {
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, UnitError>> + Send + 'static,
    {
        Self {
            func: Box::new(move |ctx| -> BoxFuture<'static, _> { Box::pin(func(ctx)) }),
        }
    }
}

#[async_trait]
impl Invocable for FnUnit {
    async fn invoke(&self, ctx: &TaskContext) -> std::result::Result<Value, UnitError> {
        (self.func)(ctx.clone()).await
    }
}

impl fmt::Debug for FnUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnUnit")
    }
}

/// Name-to-unit lookup used when loading workflows
#[derive(Clone, Default)]
pub struct UnitRegistry {
    units: HashMap<String, Arc<dyn Invocable>>,
}

impl UnitRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `shell` and `http` units
    pub fn with_builtin() -> Result<Self> {
        let mut registry = Self::new();
        registry.register("shell", shell::ShellUnit::new());
        registry.register("http", http::HttpUnit::new()?);
        Ok(registry)
    }

    /// Register a unit, replacing any previous unit of the same name
    pub fn register(&mut self, name: impl Into<String>, unit: impl Invocable + 'static) {
        self.units.insert(name.into(), Arc::new(unit));
    }

    /// Register an async closure as a unit
    ///
    /// # Example
    ///
    /// ```
    /// use tributary::units::UnitRegistry;
    ///
    /// let mut registry = UnitRegistry::new();
    /// registry.register_fn("noop", |_ctx| async { Ok(serde_json::Value::Null) });
    /// assert!(registry.get("noop").is_some());
    /// ```
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, func: F)
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, UnitError>> + Send + 'static,
    {
        self.register(name, FnUnit::new(func));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Invocable>> {
        self.units.get(name).cloned()
    }

    /// Resolve a unit for a task, checking its params
    pub fn resolve(&self, task: &str, unit: &str, params: &Value) -> Result<Arc<dyn Invocable>> {
        let invocable = self.get(unit).ok_or_else(|| TributaryError::UnknownUnit {
            task: task.to_string(),
            unit: unit.to_string(),
        })?;

        invocable
            .validate(params)
            .map_err(|reason| TributaryError::InvalidParams {
                task: task.to_string(),
                unit: unit.to_string(),
                reason,
            })?;

        Ok(invocable)
    }

    /// Registered unit names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.units.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for UnitRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitRegistry")
            .field("units", &self.names())
            .finish()
    }
}

/// Truncate byte output to MAX_OUTPUT_SIZE
///
/// Returns (truncated_string, was_truncated)
pub(crate) fn truncate_output_bytes(data: &[u8]) -> (String, bool) {
    let truncated = data.len() > MAX_OUTPUT_SIZE;
    let bytes = if truncated {
        &data[..MAX_OUTPUT_SIZE]
    } else {
        data
    };

    let output = String::from_utf8_lossy(bytes).to_string();
    (output, truncated)
}
