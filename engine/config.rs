// ========================================================================================
//                               Run configuration
// ========================================================================================
//
// A run is described by a small TOML document. Every field is optional; anything
// left out falls back to the built-in default, and the command line can override
// any value afterwards.

use crate::types::{DEFAULT_ALLOWED_MISSING, KernelParams, Metric};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Distance metric to compute.
    pub metric: Metric,
    /// Worker count. `None` uses one worker per logical CPU.
    pub threads: Option<usize>,
    /// First row to compute; rows before it are assumed done by a previous run.
    pub start: usize,
    /// Fraction of loci a sample may leave uncalled without penalty.
    pub allowed_missing: f64,
    /// Upper bound on the wait for workers, in seconds. `None` waits forever.
    pub timeout_secs: Option<u64>,
    /// Field delimiter of the allele profile.
    pub delimiter: char,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            metric: Metric::Synchronized,
            threads: None,
            start: 0,
            allowed_missing: DEFAULT_ALLOWED_MISSING,
            timeout_secs: None,
            delimiter: '\t',
        }
    }
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == Some(0) {
            return Err(ConfigError::Invalid(
                "threads must be at least 1".to_string(),
            ));
        }
        if !self.delimiter.is_ascii() {
            return Err(ConfigError::Invalid(format!(
                "delimiter '{}' is not a single ASCII character",
                self.delimiter
            )));
        }
        self.kernel_params().validate().map_err(ConfigError::Invalid)
    }

    pub fn kernel_params(&self) -> KernelParams {
        KernelParams {
            allowed_missing: self.allowed_missing,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// The worker count to build the pool with.
    pub fn resolved_threads(&self) -> usize {
        self.threads.unwrap_or_else(num_cpus::get).max(1)
    }
}
