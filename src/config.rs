//! Runtime configuration.
//!
//! Values come from built-in defaults, then an optional JSON file, then
//! `PLANTKEEPER_*` environment variables, in that order of precedence.

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::Backoff;

pub const ENV_PREFIX: &str = "PLANTKEEPER_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("environment variable {var} has invalid value {value:?}")]
    Env { var: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Optimistic read-modify-write attempts inside one handler invocation.
    #[serde(default = "default_handler_max_attempts")]
    pub handler_max_attempts: u32,
    /// Deadline for one handler attempt.
    #[serde(default = "default_handler_deadline_ms")]
    pub handler_deadline_ms: u64,
    /// Deliveries of one event before it is dead-lettered.
    #[serde(default = "default_delivery_max_attempts")]
    pub delivery_max_attempts: u32,
    /// Pending-write dispatch attempts before the write is marked failed.
    #[serde(default = "default_queue_max_attempts")]
    pub queue_max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Deadline for one reconciliation attempt against the authoritative store.
    #[serde(default = "default_reconcile_deadline_ms")]
    pub reconcile_deadline_ms: u64,
    /// Last-writer-wins merge attempts when the stored record keeps moving.
    #[serde(default = "default_reconcile_merge_attempts")]
    pub reconcile_merge_attempts: u32,
    /// Events claimed from the bus per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub authority_db: Option<PathBuf>,
    #[serde(default)]
    pub client_db: Option<PathBuf>,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

const fn default_handler_max_attempts() -> u32 {
    5
}
const fn default_handler_deadline_ms() -> u64 {
    5_000
}
const fn default_delivery_max_attempts() -> u32 {
    8
}
const fn default_queue_max_attempts() -> u32 {
    6
}
const fn default_backoff_base_ms() -> u64 {
    1_000
}
const fn default_backoff_cap_ms() -> u64 {
    300_000
}
const fn default_reconcile_deadline_ms() -> u64 {
    10_000
}
const fn default_reconcile_merge_attempts() -> u32 {
    3
}
const fn default_batch_size() -> u32 {
    64
}
const fn default_poll_interval_ms() -> u64 {
    1_000
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            handler_max_attempts: default_handler_max_attempts(),
            handler_deadline_ms: default_handler_deadline_ms(),
            delivery_max_attempts: default_delivery_max_attempts(),
            queue_max_attempts: default_queue_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            reconcile_deadline_ms: default_reconcile_deadline_ms(),
            reconcile_merge_attempts: default_reconcile_merge_attempts(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            authority_db: None,
            client_db: None,
            log_dir: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    let var = format!("{ENV_PREFIX}{name}");
    if let Some(value) = lookup(&var) {
        *slot = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Env { var, value })?;
    }
    Ok(())
}

impl SyncConfig {
    /// Defaults, overlaid with `path` when given, then with the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        env_parse(&lookup, "HANDLER_MAX_ATTEMPTS", &mut self.handler_max_attempts)?;
        env_parse(&lookup, "HANDLER_DEADLINE_MS", &mut self.handler_deadline_ms)?;
        env_parse(&lookup, "DELIVERY_MAX_ATTEMPTS", &mut self.delivery_max_attempts)?;
        env_parse(&lookup, "QUEUE_MAX_ATTEMPTS", &mut self.queue_max_attempts)?;
        env_parse(&lookup, "BACKOFF_BASE_MS", &mut self.backoff_base_ms)?;
        env_parse(&lookup, "BACKOFF_CAP_MS", &mut self.backoff_cap_ms)?;
        env_parse(&lookup, "RECONCILE_DEADLINE_MS", &mut self.reconcile_deadline_ms)?;
        env_parse(&lookup, "RECONCILE_MERGE_ATTEMPTS", &mut self.reconcile_merge_attempts)?;
        env_parse(&lookup, "BATCH_SIZE", &mut self.batch_size)?;
        env_parse(&lookup, "POLL_INTERVAL_MS", &mut self.poll_interval_ms)?;
        if let Some(path) = lookup(&format!("{ENV_PREFIX}AUTHORITY_DB")) {
            self.authority_db = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup(&format!("{ENV_PREFIX}CLIENT_DB")) {
            self.client_db = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup(&format!("{ENV_PREFIX}LOG_DIR")) {
            self.log_dir = Some(PathBuf::from(path));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let budgets = [
            ("handler_max_attempts", self.handler_max_attempts),
            ("delivery_max_attempts", self.delivery_max_attempts),
            ("queue_max_attempts", self.queue_max_attempts),
            ("reconcile_merge_attempts", self.reconcile_merge_attempts),
            ("batch_size", self.batch_size),
        ];
        if let Some((name, _)) = budgets.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be at least 1")));
        }
        if self.backoff_base_ms == 0 || self.backoff_base_ms > self.backoff_cap_ms {
            return Err(ConfigError::Invalid(
                "backoff_base_ms must be non-zero and not above backoff_cap_ms".into(),
            ));
        }
        if self.handler_deadline_ms == 0 || self.reconcile_deadline_ms == 0 {
            return Err(ConfigError::Invalid("deadlines must be non-zero".into()));
        }
        Ok(())
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.backoff_base_ms, self.backoff_cap_ms)
    }

    pub fn authority_db_path(&self) -> PathBuf {
        self.authority_db
            .clone()
            .unwrap_or_else(|| default_data_dir().join("authority.sqlite3"))
    }

    pub fn client_db_path(&self) -> PathBuf {
        self.client_db
            .clone()
            .unwrap_or_else(|| default_data_dir().join("client.sqlite3"))
    }
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(env::temp_dir)
        .join("plantkeeper")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{ "queue_max_attempts": 3, "backoff_base_ms": 50 }}"#).expect("write");
        let config = SyncConfig::from_file(file.path()).expect("parse config");
        assert_eq!(config.queue_max_attempts, 3);
        assert_eq!(config.backoff_base_ms, 50);
        assert_eq!(config.handler_max_attempts, default_handler_max_attempts());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{ "queue_max_attempt": 3 }}"#).expect("write");
        let err = SyncConfig::from_file(file.path()).expect_err("typo rejected");
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn env_overrides_file_values() {
        let vars: HashMap<String, String> = [
            ("PLANTKEEPER_HANDLER_MAX_ATTEMPTS", "9"),
            ("PLANTKEEPER_CLIENT_DB", "/tmp/client.sqlite3"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let mut config = SyncConfig::default();
        config
            .apply_env(|name| vars.get(name).cloned())
            .expect("apply env");
        assert_eq!(config.handler_max_attempts, 9);
        assert_eq!(config.client_db_path(), PathBuf::from("/tmp/client.sqlite3"));
    }

    #[test]
    fn bad_env_value_names_the_variable() {
        let mut config = SyncConfig::default();
        let err = config
            .apply_env(|name| (name == "PLANTKEEPER_BATCH_SIZE").then(|| "lots".to_string()))
            .expect_err("non-numeric rejected");
        match err {
            ConfigError::Env { var, value } => {
                assert_eq!(var, "PLANTKEEPER_BATCH_SIZE");
                assert_eq!(value, "lots");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn zero_budgets_fail_validation() {
        let config = SyncConfig {
            handler_max_attempts: 0,
            ..SyncConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
