//! Workflow configuration and registry.
//!
//! A workflow is one tenant's import: where its batches arrive, how rows
//! aggregate into records, which processor handles them, and the limits
//! the pipeline runs under. Each workflow lives in its own TOML file with a
//! single `[workflow]` table.

use crate::error::{Error, Result};
use crate::ingest::aggregate::RowLayout;
use crate::model::QueueName;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct WorkflowFile {
    workflow: WorkflowConfig,
}

/// Settings for one workflow.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowConfig {
    pub name: String,
    /// Tenant identifier the queue name is derived from.
    #[serde(deserialize_with = "string_or_number")]
    pub legal_entity_id: String,
    #[serde(default = "default_queue_prefix")]
    pub queue_prefix: String,
    #[serde(default = "default_tick_interval", deserialize_with = "duration")]
    pub tick_interval: Duration,
    #[serde(default = "default_claim_batch_size")]
    pub claim_batch_size: usize,
    /// Quarantine entries per report. Defaults to `claim_batch_size`.
    #[serde(default)]
    pub report_limit: Option<usize>,
    /// Oldest claim age above which the queue counts as backed up.
    #[serde(default = "default_max_queue_age", deserialize_with = "duration")]
    pub max_queue_age: Duration,
    /// Minimum time between backpressure alerts.
    #[serde(default = "default_alert_cooldown", deserialize_with = "duration")]
    pub alert_cooldown: Duration,
    #[serde(default = "default_processor_timeout", deserialize_with = "duration")]
    pub processor_timeout: Duration,
    pub layout: RowLayout,
    pub source: SourceConfig,
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
}

/// Directories of a local batch source.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub inbox: PathBuf,
    pub processed: PathBuf,
    pub bad: PathBuf,
}

/// Hook executable that processes one record.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorConfig {
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Skip the hook for an entry whose identical payload it accepted within
    /// this long. Unset runs the hook every time.
    #[serde(default, deserialize_with = "optional_duration")]
    pub skip_unchanged_for: Option<Duration>,
}

/// Where quarantine reports go. Reports are only logged when `dir` is unset.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertConfig {
    pub dir: Option<PathBuf>,
}

impl WorkflowConfig {
    /// Parse a single workflow file's contents.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: WorkflowFile =
            toml::from_str(content).map_err(|e| Error::Config(format!("bad workflow config: {e}")))?;
        file.workflow.validate()?;
        Ok(file.workflow)
    }

    pub fn queue_name(&self) -> QueueName {
        QueueName::for_tenant(&self.queue_prefix, &self.legal_entity_id)
    }

    pub fn report_limit(&self) -> usize {
        self.report_limit.unwrap_or(self.claim_batch_size)
    }

    /// Bound on the claimed-entry scan done by the health check.
    pub fn monitor_scan_limit(&self) -> usize {
        self.claim_batch_size * 3
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("workflow name must not be empty".into()));
        }
        if self.claim_batch_size == 0 {
            return Err(Error::Config(format!(
                "workflow {}: claim_batch_size must be at least 1",
                self.name
            )));
        }
        if self.report_limit == Some(0) {
            return Err(Error::Config(format!(
                "workflow {}: report_limit must be at least 1",
                self.name
            )));
        }
        if self.processor_timeout.is_zero() || self.tick_interval.is_zero() {
            return Err(Error::Config(format!(
                "workflow {}: tick_interval and processor_timeout must be non-zero",
                self.name
            )));
        }
        self.layout.validate().map_err(|e| {
            Error::Config(format!("workflow {}: {e}", self.name))
        })
    }
}

/// Loaded workflows, indexed by name.
pub struct WorkflowRegistry {
    workflows: BTreeMap<String, WorkflowConfig>,
}

impl WorkflowRegistry {
    /// Load all `.toml` files from a directory and build the registry.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            Error::Config(format!("cannot read workflow dir {}: {e}", dir.display()))
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut configs = Vec::with_capacity(paths.len());
        for path in paths {
            let content = std::fs::read_to_string(&path)?;
            let config = WorkflowConfig::from_toml_str(&content)
                .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
            configs.push(config);
        }

        Self::from_configs(configs)
    }

    /// Build a registry, rejecting duplicate names or queue names.
    pub fn from_configs(configs: impl IntoIterator<Item = WorkflowConfig>) -> Result<Self> {
        let mut workflows = BTreeMap::new();
        let mut queues = BTreeMap::new();

        for config in configs {
            if workflows.contains_key(&config.name) {
                return Err(Error::Config(format!("duplicate workflow {}", config.name)));
            }
            if let Some(other) = queues.insert(config.queue_name(), config.name.clone()) {
                return Err(Error::Config(format!(
                    "workflows {other} and {} share queue {}",
                    config.name,
                    config.queue_name()
                )));
            }
            workflows.insert(config.name.clone(), config);
        }

        Ok(Self { workflows })
    }

    /// Look up a workflow by name.
    pub fn get(&self, name: &str) -> Option<&WorkflowConfig> {
        self.workflows.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkflowConfig> {
        self.workflows.values()
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

fn default_queue_prefix() -> String {
    "plac:ins".to_string()
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_claim_batch_size() -> usize {
    10
}

fn default_max_queue_age() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_alert_cooldown() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_processor_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

/// Humantime duration string such as `"90s"` or `"1h 30m"`.
fn duration<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn optional_duration<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error> {
    duration(deserializer).map(Some)
}

fn string_or_number<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}
