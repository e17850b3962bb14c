//! YAML parser with validation for workflow definitions

use crate::error::{Result, TributaryError};
use crate::models::*;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Parse a workflow definition from a YAML file.
///
/// Enforces the structural limits:
/// - YAML file size must be <= 1MB
/// - Task count must be between 1 and 1,000
/// - Workflow and task names must be alphanumeric + underscore/dash only
/// - Task names are unique and every dependency names an existing task
///
/// Unit resolution and cycle detection happen in [`crate::workflow::Workflow::load`].
///
/// # Errors
///
/// * `TributaryError::Io` - If file cannot be read
/// * `TributaryError::YamlSizeExceeded` - If file exceeds 1MB
/// * `TributaryError::TaskCountExceeded` - If workflow has > 1,000 tasks
/// * `TributaryError::YamlParse` - If YAML is malformed
/// * `TributaryError::InvalidTaskName` - If a name is invalid
/// * `TributaryError::DuplicateTask` / `MissingDependency`
///
/// # Example
///
/// ```no_run
/// use tributary::parser::parse_workflow_file;
///
/// let config = parse_workflow_file("workflow.yaml")?;
/// println!("Loaded workflow: {}", config.name);
/// # Ok::<(), tributary::error::TributaryError>(())
/// ```
pub fn parse_workflow_file<P: AsRef<Path>>(path: P) -> Result<WorkflowConfig> {
    let content = fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

/// Parse a workflow definition from a YAML string.
///
/// # Example
///
/// ```
/// use tributary::parser::parse_workflow_yaml;
///
/// let yaml = r#"
/// name: test-workflow
/// schedule: "@daily"
/// default_args:
///   retries: 2
///   start_date: 2024-01-01T00:00:00Z
/// tasks:
///   - name: task1
///     unit: shell
///     params:
///       command: "/bin/echo"
///       args: ["hello"]
/// "#;
///
/// let config = parse_workflow_yaml(yaml)?;
/// assert_eq!(config.name, "test-workflow");
/// assert_eq!(config.default_args.retries, 2);
/// # Ok::<(), tributary::error::TributaryError>(())
/// ```
pub fn parse_workflow_yaml(content: &str) -> Result<WorkflowConfig> {
    if content.len() > MAX_YAML_SIZE {
        return Err(TributaryError::YamlSizeExceeded(content.len()));
    }

    let config: WorkflowConfig = serde_yaml::from_str(content)?;
    validate_workflow_config(&config)?;

    Ok(config)
}

/// Structural validation shared by the YAML path and programmatic definitions
pub fn validate_workflow_config(config: &WorkflowConfig) -> Result<()> {
    validate_name(&config.name)?;

    if config.tasks.is_empty() {
        return Err(TributaryError::Validation(format!(
            "Workflow '{}' has no tasks",
            config.name
        )));
    }

    if config.tasks.len() > MAX_TASK_COUNT {
        return Err(TributaryError::TaskCountExceeded {
            count: config.tasks.len(),
            limit: MAX_TASK_COUNT,
        });
    }

    let mut seen_names = HashSet::with_capacity(config.tasks.len());
    for task in &config.tasks {
        validate_name(&task.name)?;
        if !seen_names.insert(task.name.as_str()) {
            return Err(TributaryError::DuplicateTask(task.name.clone()));
        }
    }

    for task in &config.tasks {
        for dep in task.depends_on.iter().chain(task.downstream.iter()) {
            if !seen_names.contains(dep.as_str()) {
                return Err(TributaryError::MissingDependency {
                    task: task.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    if let Some(0) = config.config.max_active_tasks {
        return Err(TributaryError::Validation(
            "max_active_tasks must be at least 1".to_string(),
        ));
    }
    if let Some(0) = config.config.max_active_runs {
        return Err(TributaryError::Validation(
            "max_active_runs must be at least 1".to_string(),
        ));
    }

    Ok(())
}

/// Validate workflow/task name format and length
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(TributaryError::InvalidTaskName {
            name: name.to_string(),
        });
    }

    if name.len() > MAX_TASK_NAME_LEN {
        return Err(TributaryError::TaskNameTooLong {
            name: name.to_string(),
            max: MAX_TASK_NAME_LEN,
        });
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(TributaryError::InvalidTaskName {
            name: name.to_string(),
        });
    }

    Ok(())
}

/// Validate shell unit params for security compliance.
///
/// - Command must be an absolute path (no relative paths like `echo`)
/// - Command length, argument count and argument length are bounded
/// - Working directory must be absolute with no `..` traversal
///
/// # Errors
///
/// * `TributaryError::CommandTooLong`
/// * `TributaryError::InvalidPath` - If command is not an absolute path
/// * `TributaryError::ArgCountExceeded` / `ArgTooLong`
/// * `TributaryError::PathTraversal` - If workdir contains `..`
///
/// # Example
///
/// ```
/// use tributary::parser::validate_shell_config;
/// use tributary::models::ShellConfig;
///
/// let config = ShellConfig {
///     command: "/bin/echo".to_string(),
///     args: vec!["hello".to_string()],
///     workdir: Some("/tmp".to_string()),
///     env: None,
/// };
///
/// validate_shell_config(&config)?;
/// # Ok::<(), tributary::error::TributaryError>(())
/// ```
pub fn validate_shell_config(config: &ShellConfig) -> Result<()> {
    if config.command.len() > MAX_COMMAND_LEN {
        return Err(TributaryError::CommandTooLong {
            limit: MAX_COMMAND_LEN,
        });
    }

    if !config.command.starts_with('/') {
        return Err(TributaryError::InvalidPath(
            "Command must be an absolute path".to_string(),
        ));
    }

    if config.args.len() > MAX_ARG_COUNT {
        return Err(TributaryError::ArgCountExceeded {
            count: config.args.len(),
            limit: MAX_ARG_COUNT,
        });
    }

    if config.args.iter().any(|arg| arg.len() > MAX_ARG_LEN) {
        return Err(TributaryError::ArgTooLong { limit: MAX_ARG_LEN });
    }

    if let Some(workdir) = &config.workdir {
        validate_path(workdir)?;
    }

    Ok(())
}

/// Validate filesystem path: absolute and free of `..` components.
///
/// ```
/// use tributary::parser::validate_path;
///
/// validate_path("/tmp")?;
/// assert!(validate_path("tmp").is_err());
/// assert!(validate_path("/tmp/../etc").is_err());
/// # Ok::<(), tributary::error::TributaryError>(())
/// ```
pub fn validate_path(path: &str) -> Result<()> {
    if path.contains("..") {
        return Err(TributaryError::PathTraversal(path.to_string()));
    }

    if !path.starts_with('/') {
        return Err(TributaryError::InvalidPath(
            "Path must be absolute".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_full_workflow() {
        let yaml = r#"
name: ml-pipeline
description: "Nightly training"
schedule: "@daily"
default_args:
  owner: data-team
  retries: 2
  retry_delay: 30s
  retry_backoff: exponential
  max_retry_delay: 10m
  execution_timeout: 1h
  start_date: 2024-01-01T00:00:00Z
config:
  max_active_tasks: 4
  max_active_runs: 1
  catchup: true
tasks:
  - name: ingest
    unit: shell
    params: { command: /usr/bin/python3, args: [ingest.py] }
    downstream: [preprocess]
  - name: preprocess
    unit: shell
    params: { command: /usr/bin/python3, args: [preprocess.py] }
    retries: 3
"#;
        let config = parse_workflow_yaml(yaml).unwrap();
        assert_eq!(config.name, "ml-pipeline");
        assert_eq!(config.schedule.as_deref(), Some("@daily"));
        assert_eq!(config.default_args.owner, "data-team");
        assert_eq!(config.default_args.retry_delay, Duration::from_secs(30));
        assert_eq!(config.default_args.max_retry_delay, Duration::from_secs(600));
        assert!(config.default_args.start_date.is_some());
        assert_eq!(config.config.max_active_tasks, Some(4));
        assert!(config.config.catchup);
        assert_eq!(config.tasks[0].downstream, vec!["preprocess"]);
        assert_eq!(config.tasks[1].retries, Some(3));
    }

    #[test]
    fn test_yaml_size_limit() {
        let large_yaml = "name: test\ntasks:\n".to_string() + &"  - name: x\n".repeat(100_000);
        let result = parse_workflow_yaml(&large_yaml);
        assert!(matches!(result, Err(TributaryError::YamlSizeExceeded(_))));
    }

    #[test]
    fn test_task_count_limit() {
        let mut yaml = "name: test\ntasks:\n".to_string();
        for i in 0..1001 {
            yaml.push_str(&format!("  - name: task{}\n    unit: noop\n", i));
        }
        let result = parse_workflow_yaml(&yaml);
        assert!(matches!(
            result,
            Err(TributaryError::TaskCountExceeded { .. })
        ));
    }

    #[test]
    fn test_empty_workflow_rejected() {
        let result = parse_workflow_yaml("name: test\ntasks: []\n");
        assert!(matches!(result, Err(TributaryError::Validation(_))));
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name("task1").is_ok());
        assert!(validate_name("task_1").is_ok());
        assert!(validate_name("task-1").is_ok());
        assert!(validate_name("TASK_1").is_ok());

        assert!(matches!(
            validate_name("task 1"),
            Err(TributaryError::InvalidTaskName { .. })
        ));
        assert!(matches!(
            validate_name("task@1"),
            Err(TributaryError::InvalidTaskName { .. })
        ));
        assert!(matches!(
            validate_name("a".repeat(65).as_str()),
            Err(TributaryError::TaskNameTooLong { .. })
        ));
    }

    #[test]
    fn test_missing_dependency() {
        let yaml = r#"
name: test
tasks:
  - name: task1
    unit: noop
    depends_on: [nonexistent]
"#;
        let result = parse_workflow_yaml(yaml);
        assert!(matches!(
            result,
            Err(TributaryError::MissingDependency { .. })
        ));
    }

    #[test]
    fn test_missing_downstream() {
        let yaml = r#"
name: test
tasks:
  - name: task1
    unit: noop
    downstream: [ghost]
"#;
        let result = parse_workflow_yaml(yaml);
        assert!(matches!(
            result,
            Err(TributaryError::MissingDependency { ref dependency, .. }) if dependency == "ghost"
        ));
    }

    #[test]
    fn test_duplicate_task_names_rejected() {
        let yaml = r#"
name: test
tasks:
  - name: task1
    unit: noop
  - name: task1
    unit: noop
"#;
        let result = parse_workflow_yaml(yaml);
        assert!(matches!(result, Err(TributaryError::DuplicateTask(name)) if name == "task1"));
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        let yaml = r#"
name: test
config:
  max_active_tasks: 0
tasks:
  - name: task1
    unit: noop
"#;
        assert!(parse_workflow_yaml(yaml).is_err());
    }

    #[test]
    fn test_validate_shell_config() {
        let config = ShellConfig {
            command: "/bin/echo".to_string(),
            args: vec!["hello".to_string()],
            workdir: Some("/tmp".to_string()),
            env: None,
        };
        assert!(validate_shell_config(&config).is_ok());

        let config = ShellConfig {
            command: "echo".to_string(),
            args: vec![],
            workdir: None,
            env: None,
        };
        assert!(matches!(
            validate_shell_config(&config),
            Err(TributaryError::InvalidPath(_))
        ));

        let config = ShellConfig {
            command: "/bin/echo".to_string(),
            args: vec!["x".to_string(); MAX_ARG_COUNT + 1],
            workdir: None,
            env: None,
        };
        assert!(matches!(
            validate_shell_config(&config),
            Err(TributaryError::ArgCountExceeded { .. })
        ));
    }
}
