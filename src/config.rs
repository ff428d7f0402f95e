//! Daemon configuration.
//!
//! Values are layered: built-in defaults, an optional JSON file, then
//! `COHORTD_*` environment variables.  The CLI applies its flags last.

use crate::encryption::{AggregationKeyPair, Encryption, EncryptionError};
use crate::policy::CommissionerPolicy;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default coordinator base URL.
pub const DEFAULT_COORDINATOR_URL: &str = "http://localhost:8000";
/// Default commissioner trusted by a fresh install.
pub const DEFAULT_COMMISSIONER: &str = "KDE";
const DEFAULT_CYCLE_INTERVAL_SECS: u64 = 60;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const DATA_DIR_NAME: &str = ".cohortd";
const STORE_FILE: &str = "store.json";
const KEY_FILE: &str = "aggregation_key";

/// Which encryption provider the daemon runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMode {
    /// Pass-through provider; counts travel in the clear.
    Identity,
    /// Exponential ElGamal over secp256k1.
    Elgamal,
}

impl std::str::FromStr for EncryptionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "identity" => Ok(Self::Identity),
            "elgamal" => Ok(Self::Elgamal),
            other => Err(ConfigError::Invalid {
                field: "encryption",
                value: other.to_string(),
            }),
        }
    }
}

/// Errors raised while assembling the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("config I/O error: {0}")]
    Io(String),
    /// The configuration file was not valid JSON for this schema.
    #[error("config parse error: {0}")]
    Parse(String),
    /// A field held an unusable value.
    #[error("invalid value for {field}: {value}")]
    Invalid {
        /// Offending field name.
        field: &'static str,
        /// Rejected value.
        value: String,
    },
    /// The aggregation key could not be loaded or created.
    #[error(transparent)]
    Key(#[from] EncryptionError),
}

/// Process-wide settings threaded into the orchestrator at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Coordinator base URL.
    pub coordinator_url: String,
    /// Directory holding the store and the aggregation key.
    pub data_dir: PathBuf,
    /// Commissioners whose surveys this client answers.
    pub trusted_commissioners: Vec<String>,
    /// Delay between protocol cycles.
    pub cycle_interval_secs: u64,
    /// Upper bound on any single network exchange.
    pub request_timeout_ms: u64,
    /// Encryption provider.
    pub encryption: EncryptionMode,
    /// Address of the read-only status service, if enabled.
    pub status_listen: Option<SocketAddr>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let home = env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            coordinator_url: DEFAULT_COORDINATOR_URL.to_string(),
            data_dir: home.join(DATA_DIR_NAME),
            trusted_commissioners: vec![DEFAULT_COMMISSIONER.to_string()],
            cycle_interval_secs: DEFAULT_CYCLE_INTERVAL_SECS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            encryption: EncryptionMode::Elgamal,
            status_listen: None,
        }
    }
}

impl DaemonConfig {
    /// Reads a JSON config file; fields it omits keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        serde_json::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        cfg.apply_env(|key| env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Applies `COHORTD_*` overrides supplied by `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = get("COHORTD_COORDINATOR_URL") {
            self.coordinator_url = url;
        }
        if let Some(dir) = get("COHORTD_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(list) = get("COHORTD_TRUSTED_COMMISSIONERS") {
            self.trusted_commissioners = list.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Some(secs) = get("COHORTD_CYCLE_SECS") {
            self.cycle_interval_secs = parse_u64("cycle_interval_secs", &secs)?;
        }
        if let Some(ms) = get("COHORTD_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = parse_u64("request_timeout_ms", &ms)?;
        }
        if let Some(mode) = get("COHORTD_ENCRYPTION") {
            self.encryption = mode.parse()?;
        }
        if let Some(addr) = get("COHORTD_STATUS_LISTEN") {
            self.status_listen = Some(addr.parse().map_err(|_| ConfigError::Invalid {
                field: "status_listen",
                value: addr.clone(),
            })?);
        }
        Ok(())
    }

    /// Rejects values the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.coordinator_url.starts_with("http://") && !self.coordinator_url.starts_with("https://") {
            return Err(ConfigError::Invalid {
                field: "coordinator_url",
                value: self.coordinator_url.clone(),
            });
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "request_timeout_ms",
                value: "0".to_string(),
            });
        }
        if self.cycle_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "cycle_interval_secs",
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    /// Path of the JSON record store.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(STORE_FILE)
    }

    /// Path of the persisted aggregation secret key.
    pub fn key_path(&self) -> PathBuf {
        self.data_dir.join(KEY_FILE)
    }

    /// Delay between cycles.
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    /// Per-exchange time budget.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Commissioner trust policy.
    pub fn policy(&self) -> CommissionerPolicy {
        CommissionerPolicy::from_names(self.trusted_commissioners.iter().cloned())
    }

    /// Builds the configured encryption provider, creating a key if needed.
    pub fn encryption(&self) -> Result<Encryption, ConfigError> {
        Ok(match self.encryption {
            EncryptionMode::Identity => Encryption::Identity,
            EncryptionMode::Elgamal => {
                Encryption::ElGamal(AggregationKeyPair::load_or_generate(&self.key_path())?)
            }
        })
    }
}

fn parse_u64(field: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        field,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn defaults_are_usable() {
        let cfg = DaemonConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.coordinator_url, DEFAULT_COORDINATOR_URL);
        assert_eq!(cfg.trusted_commissioners, vec!["KDE"]);
        assert!(cfg.store_path().ends_with(".cohortd/store.json"));
    }

    #[test]
    fn env_overrides_fields() {
        let vars: HashMap<&str, &str> = [
            ("COHORTD_COORDINATOR_URL", "https://coord.example"),
            ("COHORTD_TRUSTED_COMMISSIONERS", "KDE, GNOME"),
            ("COHORTD_CYCLE_SECS", "5"),
            ("COHORTD_ENCRYPTION", "identity"),
            ("COHORTD_STATUS_LISTEN", "127.0.0.1:9700"),
            ("COHORTD_DATA_DIR", ""),
        ]
        .into_iter()
        .collect();
        let mut cfg = DaemonConfig::default();
        let before_dir = cfg.data_dir.clone();
        cfg.apply_env(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.coordinator_url, "https://coord.example");
        assert_eq!(cfg.trusted_commissioners, vec!["KDE", "GNOME"]);
        assert_eq!(cfg.cycle_interval(), Duration::from_secs(5));
        assert_eq!(cfg.encryption, EncryptionMode::Identity);
        assert_eq!(cfg.status_listen, Some("127.0.0.1:9700".parse().unwrap()));
        assert_eq!(cfg.data_dir, before_dir);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut cfg = DaemonConfig::default();
        let err = cfg
            .apply_env(|k| (k == "COHORTD_CYCLE_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "cycle_interval_secs", .. }));
        assert!("rot13".parse::<EncryptionMode>().is_err());

        cfg.coordinator_url = "ftp://nope".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn file_fields_override_defaults() {
        let mut path = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        path.push(format!("cohortd_config_{nanos}.json"));
        fs::write(&path, r#"{"encryption": "identity", "request_timeout_ms": 250}"#).unwrap();
        let cfg = DaemonConfig::from_file(&path).unwrap();
        fs::remove_file(&path).unwrap();
        assert_eq!(cfg.encryption, EncryptionMode::Identity);
        assert_eq!(cfg.request_timeout(), Duration::from_millis(250));
        assert_eq!(cfg.coordinator_url, DEFAULT_COORDINATOR_URL);
    }
}
