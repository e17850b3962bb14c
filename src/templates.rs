//! Built-in workflow templates for the `tributary template` subcommand.

/// Metadata for a template type.
#[derive(Debug, Clone)]
pub struct TemplateInfo {
    /// Template name (matches the CLI `--type` value).
    pub name: &'static str,
    /// Short description shown in the listing table.
    pub description: &'static str,
}

/// Returns metadata for every available template.
pub fn list_templates() -> Vec<TemplateInfo> {
    vec![
        TemplateInfo {
            name: "minimal",
            description: "Single shell task, no dependencies",
        },
        TemplateInfo {
            name: "ml-pipeline",
            description: "Daily ingest/train/evaluate pipeline with retries and timeouts",
        },
        TemplateInfo {
            name: "http",
            description: "HTTP calls whose outputs flow to downstream tasks",
        },
        TemplateInfo {
            name: "diamond",
            description: "Fan-out/fan-in graph limited by max_active_tasks",
        },
    ]
}

/// Returns the YAML content for a given template type.
pub fn get_template(template_type: &str) -> Option<&'static str> {
    match template_type {
        "minimal" => Some(TEMPLATE_MINIMAL),
        "ml-pipeline" => Some(TEMPLATE_ML_PIPELINE),
        "http" => Some(TEMPLATE_HTTP),
        "diamond" => Some(TEMPLATE_DIAMOND),
        _ => None,
    }
}

const TEMPLATE_MINIMAL: &str = r#"# Minimal workflow: one shell task, triggered manually
name: minimal-workflow
description: "A minimal workflow with a single task"

tasks:
  - name: hello
    unit: shell
    params:
      command: /bin/echo
      args: ["Hello from tributary"]
"#;

const TEMPLATE_ML_PIPELINE: &str = r#"# Daily training pipeline
#
# Each task receives its context as TRIBUTARY_* environment variables;
# TRIBUTARY_UPSTREAM holds the JSON outputs of its direct dependencies.
name: ml-pipeline
description: "Ingest, preprocess, train and evaluate once a day"
schedule: "@daily"

default_args:
  owner: data-team
  retries: 2
  retry_delay: 5m
  retry_backoff: exponential
  max_retry_delay: 1h
  execution_timeout: 2h
  start_date: 2024-01-01T00:00:00Z

config:
  max_active_runs: 1
  max_active_tasks: 2
  catchup: false

tasks:
  - name: ingest
    unit: shell
    params:
      command: /usr/bin/python3
      args: ["pipelines/ingest.py"]
      workdir: /opt/ml
    downstream: [preprocess]

  - name: preprocess
    unit: shell
    params:
      command: /usr/bin/python3
      args: ["pipelines/preprocess.py"]
      workdir: /opt/ml

  - name: train
    unit: shell
    depends_on: [preprocess]
    execution_timeout: 6h
    retries: 1
    params:
      command: /usr/bin/python3
      args: ["pipelines/train.py"]
      workdir: /opt/ml

  - name: evaluate
    unit: shell
    depends_on: [train]
    params:
      command: /usr/bin/python3
      args: ["pipelines/evaluate.py"]
      workdir: /opt/ml
"#;

const TEMPLATE_HTTP: &str = r#"# HTTP workflow
#
# Responses are stored as task outputs and passed to downstream tasks.
name: http-workflow
description: "Check an API, fetch data and post a summary"
schedule: "@every 30m"

default_args:
  retries: 3
  retry_delay: 30s
  retry_backoff: linear
  start_date: 2024-01-01T00:00:00Z

tasks:
  - name: health_check
    unit: http
    params:
      url: "https://api.example.com/health"
      method: GET
      timeout: 10

  - name: fetch_data
    unit: http
    depends_on: [health_check]
    params:
      url: "https://api.example.com/v1/metrics"
      method: GET
      headers:
        Accept: application/json

  - name: post_results
    unit: http
    depends_on: [fetch_data]
    params:
      url: "https://hooks.example.com/results"
      method: POST
      body:
        source: tributary
        status: complete
"#;

const TEMPLATE_DIAMOND: &str = r#"# Fan-out/fan-in
#
# extract runs first, the three transforms run in parallel (at most two at a
# time), and load runs only after all of them succeed.
name: diamond-workflow
description: "Parallel transforms between a shared extract and load"

default_args:
  retries: 1
  retry_delay: 10s

config:
  max_active_tasks: 2

tasks:
  - name: extract
    unit: shell
    params:
      command: /bin/sh
      args: ["-c", "echo extracted"]

  - name: transform_a
    unit: shell
    depends_on: [extract]
    params:
      command: /bin/sh
      args: ["-c", "echo a"]

  - name: transform_b
    unit: shell
    depends_on: [extract]
    params:
      command: /bin/sh
      args: ["-c", "echo b"]

  - name: transform_c
    unit: shell
    depends_on: [extract]
    params:
      command: /bin/sh
      args: ["-c", "echo c"]

  - name: load
    unit: shell
    depends_on: [transform_a, transform_b, transform_c]
    params:
      command: /bin/sh
      args: ["-c", "echo loaded"]
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_workflow_yaml;
    use crate::units::UnitRegistry;
    use crate::workflow::Workflow;

    const NAMES: &[&str] = &["minimal", "ml-pipeline", "http", "diamond"];

    #[test]
    fn test_list_matches_lookup() {
        let templates = list_templates();
        assert_eq!(templates.len(), NAMES.len());
        for info in templates {
            assert!(get_template(info.name).is_some());
            assert!(!info.description.is_empty());
        }
    }

    #[test]
    fn test_get_template_unknown_returns_none() {
        assert!(get_template("nonexistent").is_none());
    }

    #[test]
    fn test_all_templates_load_with_builtin_units() {
        let units = UnitRegistry::with_builtin().unwrap();
        for name in NAMES {
            let content = get_template(name).unwrap();
            let config = parse_workflow_yaml(content)
                .unwrap_or_else(|e| panic!("template '{}' failed to parse: {}", name, e));
            let result = Workflow::load(config, &units);
            assert!(
                result.is_ok(),
                "template '{}' failed to load: {:?}",
                name,
                result.err()
            );
        }
    }

    #[test]
    fn test_diamond_levels() {
        let units = UnitRegistry::with_builtin().unwrap();
        let wf = Workflow::load(
            parse_workflow_yaml(get_template("diamond").unwrap()).unwrap(),
            &units,
        )
        .unwrap();
        let levels = wf.dag().parallel_levels();
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[1].len(), 3);
    }
}
