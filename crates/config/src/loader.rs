//! YAML document loading for the global and demo configurations.

use std::path::Path;

use crate::demo::DemoConfig;
use crate::model::{AppConfig, ConfigError};

/// Load and validate the global configuration document.
///
/// A missing file is an error; an empty file is a valid all-defaults
/// configuration.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AppConfig, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigError::Invalid(format!(
            "Config file not found: {}",
            path.display()
        )));
    }
    let text = std::fs::read_to_string(path)?;
    parse_config(&text)
}

/// Parse a configuration from YAML text.
pub fn parse_config(text: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = if text.trim().is_empty() {
        AppConfig::default()
    } else {
        serde_yaml::from_str(text)?
    };
    config.validate()?;
    Ok(config)
}

/// Load the demo configuration document, falling back to defaults when the
/// file is absent.
pub fn load_demo_config<P: AsRef<Path>>(path: P) -> Result<DemoConfig, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(DemoConfig::default());
    }
    let text = std::fs::read_to_string(path)?;
    if text.trim().is_empty() {
        return Ok(DemoConfig::default());
    }
    let config: DemoConfig = serde_yaml::from_str(&text)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_config_file_is_an_error() {
        let err = load_config("/nope/av1batch.yaml").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn empty_document_is_all_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, "").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn invalid_values_fail_at_load() {
        assert!(parse_config("general:\n  threads: 0\n").is_err());
        assert!(parse_config("general:\n  min_compression_ratio: 1.5\n").is_err());
    }

    #[test]
    fn missing_demo_config_uses_defaults() {
        let demo = load_demo_config("/nope/demo.yaml").unwrap();
        assert_eq!(demo, DemoConfig::default());
    }
}
