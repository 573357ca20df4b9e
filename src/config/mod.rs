//! Typed configuration.
//!
//! Process settings come from environment variables and load once at
//! startup. Per-workflow settings live in TOML files, see [`workflow`].
//! Sensitive values are wrapped in secrecy::SecretString to prevent log leaks.

pub mod workflow;

pub use workflow::{WorkflowConfig, WorkflowRegistry};

use crate::error::{Error, Result};
use secrecy::SecretString;
use std::path::PathBuf;

#[derive(Debug)]
pub struct Config {
    pub database_url: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Directory holding one TOML file per workflow.
    pub workflows_dir: PathBuf,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok().map(SecretString::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            workflows_dir: std::env::var("IMPORTQ_WORKFLOWS")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("workflows")),
        })
    }

    /// The database URL, or a config error if it is not set.
    pub fn require_database_url(&self) -> Result<&SecretString> {
        self.database_url.as_ref().ok_or_else(|| {
            Error::Config("required environment variable DATABASE_URL is not set".to_string())
        })
    }
}
