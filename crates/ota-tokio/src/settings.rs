//! Deployment settings, read from a YAML file.
//!
//! ```yaml
//! ota_port: /dev/ttyUSB0
//! ota_baudrate: 115200
//! ota_id: 5
//! ping_interval: 10
//! procedures:
//!   0: /opt/tests/throughput
//!   1: /opt/tests/range --verbose
//! ```
//!
//! Only `ota_id` is required. Durations are whole seconds except
//! `send_spacing_ms` and `update_interval_ms`.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use ota_core::{Address, Config};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid settings: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default = "default_port")]
    pub ota_port: String,
    #[serde(default = "default_baudrate")]
    pub ota_baudrate: u32,
    pub ota_id: u16,

    #[serde(default)]
    pub ping_interval: Option<u64>,
    #[serde(default)]
    pub ping_timeout: Option<u64>,
    #[serde(default)]
    pub connect_retry: Option<u64>,
    #[serde(default)]
    pub connect_retry_max: Option<u64>,
    #[serde(default)]
    pub max_connect_attempts: Option<u32>,
    #[serde(default)]
    pub tick: Option<u64>,
    #[serde(default)]
    pub send_spacing_ms: Option<u64>,

    /// Highest role number a remote unit accepts.
    #[serde(default)]
    pub max_role: Option<u32>,
    /// Minimum gap between two `UPD`s from a running procedure.
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,
    /// Test procedure command line per configuration id (remote unit).
    #[serde(default)]
    pub procedures: BTreeMap<u32, String>,
}

fn default_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baudrate() -> u32 {
    115_200
}

fn default_update_interval_ms() -> u64 {
    400
}

impl Settings {
    /// # Errors
    ///
    /// If the file cannot be read or is not valid settings YAML.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let contents = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        serde_yaml::from_str(&contents).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    #[must_use]
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    /// Protocol configuration for this device.
    ///
    /// With procedures configured, the accepted configuration ids are
    /// narrowed to the range they span.
    ///
    /// # Errors
    ///
    /// If the address is the broadcast address or the timers are inconsistent.
    pub fn config(&self) -> Result<Config, SettingsError> {
        let address =
            Address::new(self.ota_id).map_err(|e| SettingsError::Invalid(e.to_string()))?;
        let mut config = Config::new(address);

        if let Some(secs) = self.ping_interval {
            config = config.with_ping_interval(Duration::from_secs(secs));
        }
        if let Some(secs) = self.ping_timeout {
            config = config.with_ping_timeout(Duration::from_secs(secs));
        }
        let base = self
            .connect_retry
            .map_or(config.connect_retry, Duration::from_secs);
        let max = self
            .connect_retry_max
            .map_or(config.connect_retry_max, Duration::from_secs);
        config = config
            .with_connect_retry(base, max)
            .with_max_connect_attempts(self.max_connect_attempts);
        if let Some(secs) = self.tick {
            config = config.with_tick(Duration::from_secs(secs));
        }
        if let Some(ms) = self.send_spacing_ms {
            config = config.with_send_spacing(Duration::from_millis(ms));
        }

        if let (Some(first), Some(last)) =
            (self.procedures.keys().next(), self.procedures.keys().next_back())
        {
            config.test_policy.configuration_ids = *first..=*last;
        }
        if let Some(max_role) = self.max_role {
            config.test_policy.roles = 0..=max_role;
        }

        config
            .validate()
            .map_err(|e| SettingsError::Invalid(e.to_string()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_settings_use_defaults() {
        let settings: Settings = serde_yaml::from_str("ota_id: 10").unwrap();
        assert_eq!(settings.ota_port, "/dev/ttyUSB0");
        assert_eq!(settings.ota_baudrate, 115_200);

        let config = settings.config().unwrap();
        assert_eq!(config.address.get(), 10);
        assert_eq!(config.ping_interval, Duration::from_secs(10));
        assert_eq!(config.ping_timeout, Duration::from_secs(30));
    }

    #[test]
    fn unit_settings() {
        let yaml = r"
ota_port: /dev/ttyS1
ota_baudrate: 9600
ota_id: 5
ping_interval: 2
max_connect_attempts: 4
send_spacing_ms: 400
max_role: 3
procedures:
  2: /bin/true
  4: /bin/false --quiet
";
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.procedures.len(), 2);

        let config = settings.config().unwrap();
        assert_eq!(config.ping_timeout, Duration::from_secs(6));
        assert_eq!(config.max_connect_attempts, Some(4));
        assert_eq!(config.send_spacing, Duration::from_millis(400));
        assert_eq!(config.test_policy.configuration_ids, 2..=4);
        assert_eq!(config.test_policy.roles, 0..=3);
    }

    #[test]
    fn rejects_broadcast_id() {
        let settings: Settings = serde_yaml::from_str("ota_id: 0").unwrap();
        assert!(matches!(settings.config(), Err(SettingsError::Invalid(_))));
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(serde_yaml::from_str::<Settings>("ota_id: 1\nota_speed: 3").is_err());
    }

    #[test]
    fn missing_file() {
        let err = Settings::load(Path::new("/nonexistent/ota.yaml")).unwrap_err();
        assert!(matches!(err, SettingsError::Read { .. }));
    }
}
