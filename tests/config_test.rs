use importq::config::{Config, WorkflowConfig, WorkflowRegistry};
use std::time::Duration;

const MINIMAL: &str = r#"
[workflow]
name = "acme"
legal_entity_id = 42

[workflow.layout]
row_kind_column = "rowType"
entity_key_column = "placementId"
primary_kind = "placement"

[workflow.source]
inbox = "data/acme/inbox"
processed = "data/acme/processed"
bad = "data/acme/bad"

[workflow.processor]
command = "hooks/acme.sh"
"#;

fn with_name(name: &str, entity: u32) -> String {
    MINIMAL
        .replace("name = \"acme\"", &format!("name = \"{name}\""))
        .replace("legal_entity_id = 42", &format!("legal_entity_id = {entity}"))
}

#[test]
fn minimal_workflow_gets_defaults() {
    let wf = WorkflowConfig::from_toml_str(MINIMAL).unwrap();

    assert_eq!(wf.name, "acme");
    assert_eq!(wf.legal_entity_id, "42");
    assert_eq!(wf.queue_name().as_str(), "plac:ins:42");
    assert_eq!(wf.tick_interval, Duration::from_secs(60));
    assert_eq!(wf.claim_batch_size, 10);
    assert_eq!(wf.report_limit(), 10);
    assert_eq!(wf.monitor_scan_limit(), 30);
    assert_eq!(wf.max_queue_age, Duration::from_secs(30 * 60));
    assert_eq!(wf.alert_cooldown, Duration::from_secs(60 * 60));
    assert_eq!(wf.processor_timeout, Duration::from_secs(5 * 60));
    assert!(wf.layout.children.is_empty());
    assert!(wf.processor.args.is_empty());
    assert!(wf.processor.skip_unchanged_for.is_none());
    assert!(wf.alerts.dir.is_none());
}

#[test]
fn full_workflow_parses() {
    let toml = r#"
[workflow]
name = "globex"
legal_entity_id = "LE-7"
queue_prefix = "imports"
tick_interval = "30s"
claim_batch_size = 25
report_limit = 100
max_queue_age = "1h 30m"
alert_cooldown = "2h"
processor_timeout = "90s"

[workflow.layout]
row_kind_column = "type"
entity_key_column = "id"
primary_kind = "P"

[[workflow.layout.children]]
kind = "R"
collection = "rates"
key_column = "rateName"

[workflow.source]
inbox = "in"
processed = "done"
bad = "bad"

[workflow.processor]
command = "/usr/local/bin/push"
args = ["--tenant", "globex"]
skip_unchanged_for = "10m"

[workflow.alerts]
dir = "reports"
"#;
    let wf = WorkflowConfig::from_toml_str(toml).unwrap();

    assert_eq!(wf.queue_name().as_str(), "imports:LE-7");
    assert_eq!(wf.tick_interval, Duration::from_secs(30));
    assert_eq!(wf.report_limit(), 100);
    assert_eq!(wf.monitor_scan_limit(), 75);
    assert_eq!(wf.max_queue_age, Duration::from_secs(90 * 60));
    assert_eq!(wf.layout.children[0].collection, "rates");
    assert_eq!(wf.processor.args, ["--tenant", "globex"]);
    assert_eq!(wf.processor.skip_unchanged_for, Some(Duration::from_secs(600)));
    assert_eq!(wf.alerts.dir.as_deref(), Some(std::path::Path::new("reports")));
}

#[test]
fn zero_batch_size_is_rejected() {
    let toml = MINIMAL.replace(
        "legal_entity_id = 42",
        "legal_entity_id = 42\nclaim_batch_size = 0",
    );
    let err = WorkflowConfig::from_toml_str(&toml).unwrap_err();
    assert!(err.to_string().contains("claim_batch_size"));
}

#[test]
fn bad_duration_is_rejected() {
    let toml = MINIMAL.replace(
        "legal_entity_id = 42",
        "legal_entity_id = 42\ntick_interval = \"soon\"",
    );
    assert!(WorkflowConfig::from_toml_str(&toml).is_err());
}

#[test]
fn missing_layout_is_rejected() {
    let toml = MINIMAL.replace("primary_kind = \"placement\"", "");
    assert!(WorkflowConfig::from_toml_str(&toml).is_err());
}

#[test]
fn registry_rejects_duplicate_names() {
    let a = WorkflowConfig::from_toml_str(&with_name("acme", 1)).unwrap();
    let b = WorkflowConfig::from_toml_str(&with_name("acme", 2)).unwrap();
    let err = WorkflowRegistry::from_configs([a, b]).err().unwrap();
    assert!(err.to_string().contains("duplicate workflow"));
}

#[test]
fn registry_rejects_shared_queue() {
    let a = WorkflowConfig::from_toml_str(&with_name("acme", 1)).unwrap();
    let b = WorkflowConfig::from_toml_str(&with_name("globex", 1)).unwrap();
    let err = WorkflowRegistry::from_configs([a, b]).err().unwrap();
    assert!(err.to_string().contains("share queue"));
}

#[test]
fn registry_loads_toml_files_from_dir() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("acme.toml"), with_name("acme", 1)).unwrap();
    std::fs::write(dir.path().join("globex.toml"), with_name("globex", 2)).unwrap();
    std::fs::write(dir.path().join("README.md"), "not a workflow").unwrap();

    let registry = WorkflowRegistry::load_from_dir(dir.path()).unwrap();
    assert_eq!(registry.len(), 2);
    assert!(registry.get("acme").is_some());
    assert_eq!(
        registry.get("globex").unwrap().queue_name().as_str(),
        "plac:ins:2"
    );
    assert!(registry.get("initech").is_none());
}

#[test]
fn registry_reports_which_file_is_broken() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("broken.toml"), "[workflow]\nname = 3").unwrap();

    let err = WorkflowRegistry::load_from_dir(dir.path()).err().unwrap();
    assert!(err.to_string().contains("broken.toml"));
}

#[test]
fn config_from_env_defaults() {
    unsafe {
        std::env::remove_var("LOG_LEVEL");
        std::env::remove_var("IMPORTQ_WORKFLOWS");
    }

    let config = Config::from_env().unwrap();
    assert_eq!(config.log_level, "info");
    assert_eq!(config.workflows_dir, std::path::PathBuf::from("workflows"));
}

#[test]
fn missing_database_url_is_a_config_error() {
    let config = Config {
        database_url: None,
        otel_endpoint: None,
        log_level: "info".into(),
        workflows_dir: "workflows".into(),
    };
    assert!(config.require_database_url().is_err());
}
