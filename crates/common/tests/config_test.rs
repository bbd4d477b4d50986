use analytics_common::config::SystemConfig;
use analytics_common::{AgentType, PipelineError};
use std::fs;
use tempfile::TempDir;

#[test]
fn test_config_load_from_toml() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("test_config.toml");

    let config_content = r#"
[pipeline]
max_retries = 3
retry_backoff_ms = 250
task_timeout_secs = 30
max_concurrency = 2
default_route = "viz"

[datasets]
root = "/var/lib/analytics/uploads"

[server]
host = "0.0.0.0"
port = 9090

[agents.planning]
endpoint = "http://localhost:7001/planning"

[agents.viz]
endpoint = "http://localhost:7001/viz"
timeout_secs = 45
"#;

    fs::write(&config_path, config_content).unwrap();

    let config = SystemConfig::from_file(config_path.to_str().unwrap()).unwrap();

    assert_eq!(config.pipeline.max_retries, 3);
    assert_eq!(config.pipeline.max_attempts(), 4);
    assert_eq!(config.pipeline.max_concurrency, 2);
    assert_eq!(config.pipeline.default_route, AgentType::Viz);
    // untouched fields keep their defaults
    assert_eq!(config.pipeline.event_buffer, 1024);
    assert_eq!(config.pipeline.graph.fork.gate, AgentType::Planning);
    assert_eq!(config.server.bind_address(), "0.0.0.0:9090");
    assert_eq!(config.agents.len(), 2);
    assert_eq!(config.agents[&AgentType::Viz].timeout_secs, Some(45));
}

#[test]
fn test_empty_file_uses_defaults() {
    let config = SystemConfig::from_toml_str("").unwrap();
    assert_eq!(config.pipeline.max_retries, 2);
    assert_eq!(config.pipeline.task_timeout_secs, 120);
    assert_eq!(config.pipeline.graph.edges.len(), 5);
    assert!(config.agents.is_empty());
}

#[test]
fn test_config_validation_zero_concurrency() {
    let result = SystemConfig::from_toml_str(
        r#"
[pipeline]
max_concurrency = 0
"#,
    );
    assert!(matches!(result, Err(PipelineError::Config(_))));
}

#[test]
fn test_config_validation_default_route_must_be_branch() {
    let result = SystemConfig::from_toml_str(
        r#"
[pipeline]
default_route = "report"
"#,
    );
    match result {
        Err(PipelineError::Config(msg)) => assert!(msg.contains("default_route")),
        other => panic!("expected config error, got {:?}", other),
    }
}

#[test]
fn test_unknown_agent_is_rejected() {
    let result = SystemConfig::from_toml_str(
        r#"
[agents.summarizer]
endpoint = "http://localhost:7001/summarize"
"#,
    );
    assert!(matches!(result, Err(PipelineError::Toml(_))));
}

#[test]
fn test_custom_graph_edges() {
    let config = SystemConfig::from_toml_str(
        r#"
[pipeline.graph]
edges = [
    ["file_upload", "data_profile"],
    ["data_profile", "planning"],
    ["planning", "critique"],
    ["critique", "report"],
]

[pipeline.graph.fork]
gate = "planning"
branches = ["insight", "viz"]
join = "critique"
"#,
    )
    .unwrap();

    assert_eq!(config.pipeline.graph.edges.len(), 4);
    assert_eq!(
        config.pipeline.graph.edges[3],
        (AgentType::Critique, AgentType::Report)
    );
}

#[test]
fn test_missing_file_is_io_error() {
    let result = SystemConfig::from_file("/definitely/not/here.toml");
    assert!(matches!(result, Err(PipelineError::Io(_))));
}
