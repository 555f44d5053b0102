//! On-disk node configuration.
//!
//! ```toml
//! [node]
//! peer_id = "node-a"
//! peers = ["node-b", "node-c"]
//!
//! [storage]
//! backend = "sqlite"
//! path = "node-a.db"
//!
//! [sync]
//! tables = ["users"]
//! round_timeout_ms = 30000
//! batch_size = 10000
//!
//! [scheduler]
//! enabled = true
//! interval_ms = 5000
//!
//! [tables.users]
//! email = { type = "text", required = true }
//! age = { type = "integer" }
//! ```
//!
//! Every section except `[node]` is optional. An empty `sync.tables`
//! replicates every declared table.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use peerbase_core::{FieldType, PeerId, Schema, TableSchema};
use peerbase_sync::{limits, SyncConfig};

use crate::error::ConfigError;
use crate::scheduler::SchedulerConfig;

/// Parsed configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub node: NodeSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    /// Table name to field name to field definition.
    #[serde(default)]
    pub tables: BTreeMap<String, BTreeMap<String, FieldSection>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeSection {
    pub peer_id: String,
    #[serde(default)]
    pub peers: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageSection {
    #[serde(default)]
    pub backend: StorageBackend,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSection {
    pub tables: Vec<String>,
    pub round_timeout_ms: u64,
    pub message_timeout_ms: u64,
    pub max_clock_drift_ms: u64,
    /// Most records per Offer or Answer.
    pub batch_size: usize,
}

impl Default for SyncSection {
    fn default() -> Self {
        let defaults = SyncConfig::default();
        Self {
            tables: Vec::new(),
            round_timeout_ms: millis(defaults.round_timeout),
            message_timeout_ms: millis(defaults.message_timeout),
            max_clock_drift_ms: millis(defaults.max_clock_drift),
            batch_size: defaults.batch_size,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerSection {
    pub enabled: bool,
    pub interval_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_factor: f64,
    pub jitter: f64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            enabled: defaults.enabled,
            interval_ms: millis(defaults.interval),
            initial_backoff_ms: millis(defaults.initial_backoff),
            max_backoff_ms: millis(defaults.max_backoff),
            backoff_factor: defaults.backoff_factor,
            jitter: defaults.jitter,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldSection {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl NodeConfig {
    /// Read and parse a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate a configuration document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.node.peer_id.is_empty() {
            return Err(ConfigError::Invalid("node.peer_id must not be empty".into()));
        }
        if self.node.peers.iter().any(|p| *p == self.node.peer_id) {
            return Err(ConfigError::Invalid("node.peers must not contain the node itself".into()));
        }
        if self.storage.backend == StorageBackend::Sqlite && self.storage.path.is_none() {
            return Err(ConfigError::Invalid("storage.path is required for the sqlite backend".into()));
        }
        if self.tables.is_empty() {
            return Err(ConfigError::Invalid("at least one table must be declared".into()));
        }
        if let Some(t) = self.sync.tables.iter().find(|t| !self.tables.contains_key(*t)) {
            return Err(ConfigError::Invalid(format!("sync.tables names undeclared table {}", t)));
        }
        if self.sync.round_timeout_ms == 0 || self.sync.message_timeout_ms == 0 {
            return Err(ConfigError::Invalid("sync timeouts must be positive".into()));
        }
        if self.sync.batch_size == 0 || self.sync.batch_size > limits::MAX_RECORDS_PER_MESSAGE {
            return Err(ConfigError::Invalid(format!(
                "sync.batch_size must be between 1 and {}",
                limits::MAX_RECORDS_PER_MESSAGE
            )));
        }

        let s = &self.scheduler;
        if s.interval_ms == 0 || s.initial_backoff_ms == 0 {
            return Err(ConfigError::Invalid("scheduler intervals must be positive".into()));
        }
        if s.max_backoff_ms < s.initial_backoff_ms {
            return Err(ConfigError::Invalid(
                "scheduler.max_backoff_ms is below initial_backoff_ms".into(),
            ));
        }
        if !(s.backoff_factor >= 1.0 && s.backoff_factor.is_finite()) {
            return Err(ConfigError::Invalid("scheduler.backoff_factor must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&s.jitter) {
            return Err(ConfigError::Invalid("scheduler.jitter must be within 0..=1".into()));
        }

        self.schema().map(|_| ())
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::new(self.node.peer_id.as_str())
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.node.peers.iter().map(|p| PeerId::new(p.as_str())).collect()
    }

    /// The declared tables as a store schema.
    pub fn schema(&self) -> Result<Schema, ConfigError> {
        let mut schema = Schema::new();
        for (name, fields) in &self.tables {
            let mut table = TableSchema::new(name.as_str());
            for (field, def) in fields {
                table = if def.required {
                    table.required(field.as_str(), def.field_type)
                } else {
                    table.field(field.as_str(), def.field_type)
                };
            }
            schema.add_table(table)?;
        }
        Ok(schema)
    }

    pub fn sync_config(&self) -> SyncConfig {
        let tables = if self.sync.tables.is_empty() {
            self.tables.keys().cloned().collect()
        } else {
            self.sync.tables.clone()
        };
        SyncConfig {
            tables,
            round_timeout: Duration::from_millis(self.sync.round_timeout_ms),
            message_timeout: Duration::from_millis(self.sync.message_timeout_ms),
            max_clock_drift: Duration::from_millis(self.sync.max_clock_drift_ms),
            batch_size: self.sync.batch_size,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        let s = &self.scheduler;
        SchedulerConfig {
            enabled: s.enabled,
            interval: Duration::from_millis(s.interval_ms),
            initial_backoff: Duration::from_millis(s.initial_backoff_ms),
            max_backoff: Duration::from_millis(s.max_backoff_ms),
            backoff_factor: s.backoff_factor,
            jitter: s.jitter,
        }
    }
}
