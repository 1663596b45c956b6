use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::auth::AuthSettings;
use crate::error::{RelayError, RelayResult};
use crate::logging::LogLevel;

/// Relay trust check. Without a floor every relay is accepted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrustConfig {
    #[serde(default)]
    pub relay_version_floor: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://127.0.0.1:4443".to_string()
}

fn default_call_timeout() -> u64 {
    10
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            call_timeout_secs: default_call_timeout(),
        }
    }
}

/// Top-level relay configuration, loaded from JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,

    #[serde(default = "default_evidence_path")]
    pub evidence_path: PathBuf,

    /// Idle time after which a session is dropped.
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,

    #[serde(default = "default_transfer_poll")]
    pub transfer_poll_millis: u64,

    /// Requests handled at the same time.
    #[serde(default = "default_request_workers")]
    pub request_workers: usize,

    /// Replaces the first four bytes of every elite build id.
    #[serde(default = "default_build_id_prefix")]
    pub build_id_prefix: String,

    #[serde(default)]
    pub trust: TrustConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub log_level: LogLevel,
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("relay-cache.db")
}

fn default_evidence_path() -> PathBuf {
    PathBuf::from("relay-evidence.db")
}

fn default_session_timeout() -> u64 {
    7200
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_reconnect_interval() -> u64 {
    30
}

fn default_transfer_poll() -> u64 {
    1000
}

fn default_request_workers() -> usize {
    16
}

fn default_build_id_prefix() -> String {
    "RLY_".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            cache_path: default_cache_path(),
            evidence_path: default_evidence_path(),
            session_timeout_secs: default_session_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            reconnect_interval_secs: default_reconnect_interval(),
            transfer_poll_millis: default_transfer_poll(),
            request_workers: default_request_workers(),
            build_id_prefix: default_build_id_prefix(),
            trust: TrustConfig::default(),
            database: DatabaseConfig::default(),
            log_level: LogLevel::default(),
        }
    }
}

impl RelayConfig {
    pub fn from_json_str(text: &str) -> RelayResult<Self> {
        let config: RelayConfig =
            serde_json::from_str(text).map_err(|e| RelayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the file, or the defaults when it does not exist.
    pub fn from_file(path: &Path) -> RelayResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    fn validate(&self) -> RelayResult<()> {
        self.build_prefix()?;
        if self.request_workers == 0 {
            return Err(RelayError::Config("request_workers must be at least 1".into()));
        }
        if self.transfer_poll_millis == 0 || self.sweep_interval_secs == 0 || self.reconnect_interval_secs == 0 {
            return Err(RelayError::Config("periodic intervals must be positive".into()));
        }
        Ok(())
    }

    fn build_prefix(&self) -> RelayResult<[u8; 4]> {
        self.build_id_prefix
            .as_bytes()
            .try_into()
            .map_err(|_| RelayError::Config(format!("build_id_prefix {:?} is not 4 bytes", self.build_id_prefix)))
    }

    pub fn auth_settings(&self) -> RelayResult<AuthSettings> {
        Ok(AuthSettings {
            build_prefix: self.build_prefix()?,
            relay_version_floor: self.trust.relay_version_floor,
        })
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn transfer_poll(&self) -> Duration {
        Duration::from_millis(self.transfer_poll_millis)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.database.call_timeout_secs)
    }
}
