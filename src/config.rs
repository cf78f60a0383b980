//! Runtime settings, loaded from an optional JSON file.
//!
//! The file path comes from `--config <path>` or the `MACSTATS_CONFIG` environment variable,
//! in that order. Every field has a default, so an empty object is a valid file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::smc::{Bounds, DiscoveryPlan};

pub const CONFIG_ENV: &str = "MACSTATS_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Upper bound (exclusive) for a CPU temperature reading to count, in °C.
    #[serde(default = "default_cpu_ceiling_c")]
    pub cpu_ceiling_c: f64,

    /// Upper bound (exclusive) for a GPU temperature reading to count, in °C.
    #[serde(default = "default_gpu_ceiling_c")]
    pub gpu_ceiling_c: f64,

    /// CPU discovery probes hex suffixes only when the numeric pass found fewer keys.
    #[serde(default = "default_cpu_hex_pass_below")]
    pub cpu_hex_pass_below: usize,

    /// IOReport sampling window for CPU and GPU power.
    #[serde(default = "default_energy_sample_ms")]
    pub energy_sample_ms: u64,

    /// Query IOHID sensor services.
    #[serde(default = "default_hid_sensors")]
    pub hid_sensors: bool,
}

fn default_cpu_ceiling_c() -> f64 {
    110.0
}
fn default_gpu_ceiling_c() -> f64 {
    150.0
}
fn default_cpu_hex_pass_below() -> usize {
    20
}
fn default_energy_sample_ms() -> u64 {
    100
}
fn default_hid_sensors() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cpu_ceiling_c: default_cpu_ceiling_c(),
            gpu_ceiling_c: default_gpu_ceiling_c(),
            cpu_hex_pass_below: default_cpu_hex_pass_below(),
            energy_sample_ms: default_energy_sample_ms(),
            hid_sensors: default_hid_sensors(),
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    /// Loads from `explicit` if given, else from the path in `MACSTATS_CONFIG`, else returns
    /// the defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        match explicit.map(Path::to_path_buf).or(from_env) {
            Some(path) => {
                log::debug!("loading config from {}", path.display());
                Self::load(path)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, ceiling) in [
            ("cpu_ceiling_c", self.cpu_ceiling_c),
            ("gpu_ceiling_c", self.gpu_ceiling_c),
        ] {
            if !(ceiling > 0.0 && ceiling.is_finite()) {
                return Err(ConfigError::Invalid(format!(
                    "{} must be a positive number, got {}",
                    name, ceiling
                )));
            }
        }
        if self.energy_sample_ms == 0 {
            return Err(ConfigError::Invalid(
                "energy_sample_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cpu_bounds(&self) -> Bounds {
        Bounds::below(self.cpu_ceiling_c)
    }

    pub fn gpu_bounds(&self) -> Bounds {
        Bounds::below(self.gpu_ceiling_c)
    }

    pub fn cpu_discovery(&self) -> DiscoveryPlan {
        DiscoveryPlan::cpu(self.cpu_hex_pass_below)
    }

    pub fn gpu_discovery(&self) -> DiscoveryPlan {
        DiscoveryPlan::gpu()
    }

    pub fn energy_sample_interval(&self) -> Duration {
        Duration::from_millis(self.energy_sample_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_gives_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.cpu_ceiling_c, 110.0);
        assert_eq!(config.gpu_ceiling_c, 150.0);
        assert_eq!(config.cpu_hex_pass_below, 20);
        assert_eq!(config.energy_sample_interval(), Duration::from_millis(100));
        assert!(config.hid_sensors);
    }

    #[test]
    fn partial_file_overrides_named_fields() {
        let config = Config::from_json(r#"{ "gpu_ceiling_c": 120, "hid_sensors": false }"#).unwrap();
        assert_eq!(config.gpu_ceiling_c, 120.0);
        assert!(!config.hid_sensors);
        assert_eq!(config.cpu_ceiling_c, 110.0);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            Config::from_json(r#"{ "cpu_ceiling_c": 0 }"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_json(r#"{ "energy_sample_ms": 0 }"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_json(r#"{ "cpu_ceiling": 100 }"#),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            Config::from_json("not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = Config::load("/nonexistent/macstats.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { ref path, .. } if path.ends_with("macstats.json")));
    }

    #[test]
    fn bounds_follow_ceilings() {
        let config = Config {
            cpu_ceiling_c: 100.0,
            ..Config::default()
        };
        assert!(config.cpu_bounds().contains(99.0));
        assert!(!config.cpu_bounds().contains(100.0));
        assert!(config.gpu_bounds().contains(140.0));
    }
}
