use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConnectError;
use crate::sink::KeyStrategy;

pub const DEFAULT_SLOT_NAME: &str = "pg_row_capture";
pub const DEFAULT_PUBLICATION_NAME: &str = "pg_row_capture_pub";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub source: ConnectionConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub kafka: Option<KafkaConfig>,
}

/// Where and how to reach the source database.
///
/// `table` is opaque: its separator means whatever the source dialect says
/// (`schema.table` on PostgreSQL, `database.table` on MySQL).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub table: String,
    #[serde(default)]
    pub connector_properties: Vec<String>,
    pub schema_history_path: PathBuf,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryPolicy {
    /// Keep streaming after the initial snapshot instead of stopping.
    #[serde(default = "default_unbounded")]
    pub unbounded: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_batch_changes")]
    pub max_batch_changes: i32,
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub topic: String,
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default = "default_acks")]
    pub acks: String,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u32,
    #[serde(default)]
    pub key_strategy: KeyStrategy,
    #[serde(default)]
    pub with_schema: bool,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("PG_ROW_CAPTURE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        settings.try_deserialize()
    }
}

impl ConnectionConfig {
    /// Checks everything that can be checked without touching the network.
    pub fn validate(&self) -> Result<(), ConnectError> {
        if self.host.trim().is_empty() {
            return Err(ConnectError::configuration("host must not be empty"));
        }
        if self.port == 0 {
            return Err(ConnectError::configuration("port must be non-zero"));
        }
        if self.username.is_empty() {
            return Err(ConnectError::configuration("username must not be empty"));
        }
        if self.database.is_empty() {
            return Err(ConnectError::configuration("database must not be empty"));
        }
        validate_table_identifier(&self.table)?;
        for property in &self.connector_properties {
            match property.split_once('=') {
                Some((key, _)) if !key.trim().is_empty() => {}
                _ => {
                    return Err(ConnectError::configuration(format!(
                        "connector property '{}' is not of the form key=value",
                        property
                    )))
                }
            }
        }
        if self.schema_history_path.as_os_str().is_empty() {
            return Err(ConnectError::configuration(
                "schema history path must not be empty",
            ));
        }
        Ok(())
    }

    /// Connector properties as a map. Later duplicates win.
    pub fn properties(&self) -> BTreeMap<&str, &str> {
        self.connector_properties
            .iter()
            .filter_map(|p| p.split_once('='))
            .map(|(k, v)| (k.trim(), v.trim()))
            .collect()
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties().get(key).copied()
    }

    pub fn slot_name(&self) -> String {
        self.property("slot.name")
            .unwrap_or(DEFAULT_SLOT_NAME)
            .to_string()
    }

    pub fn publication_name(&self) -> String {
        self.property("publication.name")
            .unwrap_or(DEFAULT_PUBLICATION_NAME)
            .to_string()
    }

    /// Logical server name recorded in `source.name`.
    pub fn server_name(&self) -> String {
        self.property("topic.prefix")
            .unwrap_or(&self.database)
            .to_string()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// The identifier is opaque, so only structural damage is rejected: empty
/// segments, surrounding whitespace and control characters.
fn validate_table_identifier(table: &str) -> Result<(), ConnectError> {
    if table.is_empty() {
        return Err(ConnectError::configuration("table identifier is empty"));
    }
    if table.trim() != table || table.chars().any(char::is_control) {
        return Err(ConnectError::configuration(format!(
            "table identifier '{}' contains whitespace or control characters at its edges",
            table
        )));
    }
    if table.starts_with('.') || table.ends_with('.') || table.contains("..") {
        return Err(ConnectError::configuration(format!(
            "table identifier '{}' has an empty segment",
            table
        )));
    }
    Ok(())
}

impl RetryPolicy {
    pub fn new(unbounded: bool, max_retries: u32, retry_interval: Duration) -> Self {
        Self {
            unbounded,
            max_retries,
            retry_interval_ms: retry_interval.as_millis() as u64,
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            unbounded: default_unbounded(),
            max_retries: default_max_retries(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

impl CaptureConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_batch_changes: default_max_batch_changes(),
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_unbounded() -> bool {
    true
}

fn default_max_retries() -> u32 {
    10
}

fn default_retry_interval_ms() -> u64 {
    100
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_max_batch_changes() -> i32 {
    1000
}

fn default_checkpoint_interval_secs() -> u64 {
    10
}

fn default_compression() -> String {
    "snappy".to_string()
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_linger_ms() -> u32 {
    100
}
