//! Demo-mode configuration: a seeded synthetic population of files and
//! outcomes, used by tests and for exercising the dashboard without any
//! real file I/O.

use serde::{Deserialize, Serialize};

use crate::model::ConfigError;

fn default_file_count() -> usize {
    40
}

fn default_extensions() -> Vec<String> {
    vec![".mp4".into(), ".mov".into(), ".mkv".into()]
}

fn default_camera_models() -> Vec<String> {
    vec![
        "Sony FX3".into(),
        "Sony A7S III".into(),
        "Panasonic GH6".into(),
        "DJI Pocket 3".into(),
        "Canon R5".into(),
        "GoPro HERO11".into(),
    ]
}

fn default_min_mb() -> f64 {
    20.0
}

fn default_max_mb() -> f64 {
    1800.0
}

fn default_throughput_mb_s() -> f64 {
    35.0
}

fn default_progress_interval_s() -> f64 {
    0.2
}

fn default_ratio_min() -> f64 {
    0.22
}

fn default_ratio_max() -> f64 {
    0.55
}

fn default_error_total() -> usize {
    6
}

fn default_hw_cap_total() -> usize {
    2
}

fn default_kept_original() -> usize {
    3
}

fn default_input_folders() -> Vec<String> {
    vec!["DEMO/Studio_A".into(), "DEMO/Studio_B".into()]
}

/// Synthetic-run parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemoConfig {
    /// Seed for the synthetic population; None derives one from the clock.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_input_folders")]
    pub input_folders: Vec<String>,
    #[serde(default = "default_file_count")]
    pub file_count: usize,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_camera_models")]
    pub camera_models: Vec<String>,
    #[serde(default = "default_min_mb")]
    pub min_mb: f64,
    #[serde(default = "default_max_mb")]
    pub max_mb: f64,
    /// Simulated transcode speed.
    #[serde(default = "default_throughput_mb_s")]
    pub throughput_mb_s: f64,
    #[serde(default = "default_progress_interval_s")]
    pub progress_interval_s: f64,
    /// Output/input size ratio range for completed jobs.
    #[serde(default = "default_ratio_min")]
    pub output_ratio_min: f64,
    #[serde(default = "default_ratio_max")]
    pub output_ratio_max: f64,
    /// How many jobs fail outright.
    #[serde(default = "default_error_total")]
    pub errors: usize,
    /// How many jobs hit the hardware-capability failure.
    #[serde(default = "default_hw_cap_total")]
    pub hw_cap: usize,
    /// How many jobs land below the savings threshold and keep the original.
    #[serde(default = "default_kept_original")]
    pub kept_original: usize,
}

impl Default for DemoConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty demo config uses defaults")
    }
}

impl DemoConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_mb <= 0.0 || self.max_mb < self.min_mb {
            return Err(ConfigError::Invalid(
                "demo size range requires 0 < min_mb <= max_mb".into(),
            ));
        }
        if self.throughput_mb_s <= 0.0 {
            return Err(ConfigError::Invalid("demo throughput_mb_s must be > 0".into()));
        }
        if self.progress_interval_s <= 0.0 {
            return Err(ConfigError::Invalid("demo progress_interval_s must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.output_ratio_min)
            || !(0.0..=1.0).contains(&self.output_ratio_max)
            || self.output_ratio_min > self.output_ratio_max
        {
            return Err(ConfigError::Invalid(
                "demo output ratio range must satisfy 0 <= min <= max <= 1".into(),
            ));
        }
        if self.errors + self.hw_cap + self.kept_original > self.file_count {
            return Err(ConfigError::Invalid(
                "demo outcome counts exceed file_count".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        DemoConfig::default().validate().expect("defaults are consistent");
    }

    #[test]
    fn outcome_counts_bounded_by_population() {
        let mut demo = DemoConfig::default();
        demo.file_count = 4;
        demo.errors = 3;
        demo.hw_cap = 1;
        demo.kept_original = 1;
        assert!(demo.validate().is_err());
    }

    #[test]
    fn size_range_must_be_ordered() {
        let mut demo = DemoConfig::default();
        demo.min_mb = 100.0;
        demo.max_mb = 50.0;
        assert!(demo.validate().is_err());
    }
}
