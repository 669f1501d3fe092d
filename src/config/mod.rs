pub mod duration;
mod loading;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

pub use loading::{load, load_from_str};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::discovery::{DnsSdConfig, FileSdConfig, TargetGroup};
use crate::relabel::RelabelConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("failed to parse configuration: {0}")]
    ParseStr(serde_yaml::Error),

    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub scrape_configs: Vec<ScrapeConfig>,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = vec![];
        let mut jobs = HashSet::new();

        for config in &self.scrape_configs {
            if let Err(errs) = config.validate() {
                errors.extend(errs);
            }

            if !jobs.insert(&config.job_name) {
                errors.push(format!("duplicated job name {:?}", config.job_name));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }
}

/// Configuration of one scrape job: how to discover its targets and
/// how to scrape them.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ScrapeConfig {
    pub job_name: String,

    /// Duration between scrapes of each target.
    #[serde(default = "default_scrape_interval", with = "duration")]
    pub scrape_interval: Duration,

    /// Per-scrape request timeout.
    #[serde(default = "default_scrape_timeout", with = "duration")]
    pub scrape_timeout: Duration,

    /// HTTP path metrics are fetched from.
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,

    /// URL scheme, `http` or `https`.
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// URL query parameters appended to every scrape.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub params: HashMap<String, Vec<String>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relabel_configs: Vec<RelabelConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub static_configs: Vec<TargetGroup>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_sd_configs: Vec<FileSdConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_sd_configs: Vec<DnsSdConfig>,
}

impl ScrapeConfig {
    fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = vec![];

        if self.job_name.is_empty() {
            errors.push("job_name must not be empty".to_string());
        }

        if self.scheme != "http" && self.scheme != "https" {
            errors.push(format!(
                "job {:?}: scheme must be \"http\" or \"https\", got {:?}",
                self.job_name, self.scheme
            ));
        }

        if self.scrape_timeout > self.scrape_interval {
            errors.push(format!(
                "job {:?}: scrape_timeout greater than scrape_interval",
                self.job_name
            ));
        }

        for config in &self.relabel_configs {
            if let Err(err) = config.validate() {
                errors.push(format!("job {:?}: {}", self.job_name, err));
            }
        }

        for group in &self.static_configs {
            for target in &group.targets {
                let address = target.get(crate::labels::ADDRESS_LABEL).unwrap_or("");
                if let Err(err) = check_target_address(address) {
                    errors.push(format!("job {:?}: {}", self.job_name, err));
                }
            }
        }

        for config in &self.file_sd_configs {
            if config.files.is_empty() {
                errors.push(format!(
                    "job {:?}: file_sd_configs entry with no files",
                    self.job_name
                ));
            }
        }

        for config in &self.dns_sd_configs {
            if let Err(err) = config.validate() {
                errors.push(format!("job {:?}: {}", self.job_name, err));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn default_scrape_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_scrape_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_metrics_path() -> String {
    "/metrics".into()
}

fn default_scheme() -> String {
    "http".into()
}

lazy_static! {
    static ref TARGET_ADDRESS_PATTERN: Regex = Regex::new(r"^[^\s/]+$").unwrap();
}

/// Check that `address` looks like a valid `host:port` / `host`. The
/// error is surfaced to operators, so it names the offending value.
pub fn check_target_address(address: &str) -> Result<(), String> {
    if TARGET_ADDRESS_PATTERN.is_match(address) {
        Ok(())
    } else {
        Err(format!("{:?} is not a valid hostname", address))
    }
}
