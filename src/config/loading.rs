use std::path::Path;

use super::{Config, ConfigError};

/// Load configuration from one or more YAML files. The scrape configs
/// of later files are appended to those of earlier ones.
pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Config, ConfigError> {
    let mut merged = Config::default();

    for path in paths {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Config =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        merged.scrape_configs.extend(config.scrape_configs);
    }

    merged.validate()?;

    Ok(merged)
}

/// Load and validate configuration from a YAML string.
pub fn load_from_str(content: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_yaml::from_str(content).map_err(ConfigError::ParseStr)?;
    config.validate()?;

    Ok(config)
}
