//! CLI overrides and per-root override documents.
//!
//! Precedence is CLI > per-root > global > defaults. A per-root document
//! (`AV1BATCH.YAML`) may appear anywhere under an input root; the nearest
//! ancestor wins for each file. Only an allow-list of keys is honored;
//! everything else is ignored with a warning.

use serde_yaml::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::encoder_args::replace_quality_value;
use crate::model::{AppConfig, ConfigError, QualityMode, QueueSort, VerifyFailAction};

/// File name of the per-root override document.
pub const LOCAL_CONFIG_FILENAME: &str = "AV1BATCH.YAML";

const ALLOWED_ROOT_KEYS: &[&str] = &["general", "gpu_encoder", "cpu_encoder", "autorotate", "cq"];
const ALLOWED_GENERAL_KEYS: &[&str] = &[
    "gpu",
    "cpu_fallback",
    "ffmpeg_cpu_threads",
    "copy_metadata",
    "use_exif",
    "filter_cameras",
    "dynamic_quality",
    "extensions",
    "min_size_bytes",
    "clean_errors",
    "skip_av1",
    "manual_rotation",
    "min_compression_ratio",
    "debug",
];

/// Where a job's effective configuration came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigSource {
    /// Global YAML document only.
    #[default]
    Global,
    /// A per-root override document applied.
    Local,
    /// CLI overrides applied on top.
    Cli,
}

impl ConfigSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigSource::Global => "G",
            ConfigSource::Local => "L",
            ConfigSource::Cli => "C",
        }
    }
}

/// Values captured from the command line, applied after YAML loading.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub threads: Option<u32>,
    pub quality: Option<u8>,
    pub quality_mode: Option<QualityMode>,
    pub bps: Option<String>,
    pub minrate: Option<String>,
    pub maxrate: Option<String>,
    pub gpu: Option<bool>,
    pub queue_sort: Option<QueueSort>,
    pub queue_seed: Option<u64>,
    pub log_path: Option<PathBuf>,
    pub clean_errors: bool,
    pub skip_av1: bool,
    pub min_size: Option<u64>,
    pub min_ratio: Option<f64>,
    pub camera: Option<Vec<String>>,
    pub rotate_180: bool,
    pub verify_fail_action: Option<VerifyFailAction>,
    pub wait_on_finish: Option<bool>,
    pub bell: Option<bool>,
    pub debug: Option<bool>,
}

impl CliOverrides {
    /// True when any field would change the loaded configuration.
    pub fn has_overrides(&self) -> bool {
        self.threads.is_some()
            || self.quality.is_some()
            || self.quality_mode.is_some()
            || self.bps.is_some()
            || self.minrate.is_some()
            || self.maxrate.is_some()
            || self.gpu.is_some()
            || self.queue_sort.is_some()
            || self.queue_seed.is_some()
            || self.log_path.is_some()
            || self.clean_errors
            || self.skip_av1
            || self.min_size.is_some()
            || self.min_ratio.is_some()
            || self.camera.is_some()
            || self.rotate_180
            || self.verify_fail_action.is_some()
            || self.wait_on_finish.is_some()
            || self.bell.is_some()
            || self.debug.is_some()
    }

    /// Apply the overrides onto a configuration in place.
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(threads) = self.threads {
            config.general.threads = threads;
        }
        if let Some(quality) = self.quality {
            apply_quality_override(config, quality);
        }
        if let Some(mode) = self.quality_mode {
            config.general.quality_mode = mode;
        }
        if let Some(bps) = &self.bps {
            config.general.bps = Some(bps.clone());
        }
        if let Some(minrate) = &self.minrate {
            config.general.minrate = Some(minrate.clone());
        }
        if let Some(maxrate) = &self.maxrate {
            config.general.maxrate = Some(maxrate.clone());
        }
        if let Some(gpu) = self.gpu {
            config.general.gpu = gpu;
        }
        if let Some(sort) = self.queue_sort {
            config.general.queue_sort = sort;
        }
        if let Some(seed) = self.queue_seed {
            config.general.queue_seed = Some(seed);
        }
        if let Some(path) = &self.log_path {
            config.general.log_path = Some(path.clone());
        }
        if self.clean_errors {
            config.general.clean_errors = true;
        }
        if self.skip_av1 {
            config.general.skip_av1 = true;
        }
        if let Some(min_size) = self.min_size {
            config.general.min_size_bytes = min_size;
        }
        if let Some(min_ratio) = self.min_ratio {
            config.general.min_compression_ratio = min_ratio;
        }
        if let Some(camera) = &self.camera {
            config.general.filter_cameras = camera.clone();
        }
        if self.rotate_180 {
            config.general.manual_rotation = Some(180);
        }
        if let Some(action) = self.verify_fail_action {
            config.general.verify_fail_action = action;
        }
        if let Some(wait) = self.wait_on_finish {
            config.general.wait_on_finish = wait;
        }
        if let Some(bell) = self.bell {
            config.general.bell = bell;
        }
        if let Some(debug) = self.debug {
            config.general.debug = debug;
        }
    }
}

/// Rewrite the quality entry in all four encoder argument lists.
fn apply_quality_override(config: &mut AppConfig, quality: u8) {
    config.gpu_encoder.common_args = replace_quality_value(&config.gpu_encoder.common_args, quality);
    config.gpu_encoder.advanced_args =
        replace_quality_value(&config.gpu_encoder.advanced_args, quality);
    config.cpu_encoder.common_args = replace_quality_value(&config.cpu_encoder.common_args, quality);
    config.cpu_encoder.advanced_args =
        replace_quality_value(&config.cpu_encoder.advanced_args, quality);
}

/// Read and filter a per-root override document.
///
/// Returns an empty mapping (rather than an error) on unreadable or
/// malformed files; the run should not die because one subtree carries a
/// broken override.
pub fn load_local_config_data(path: &Path) -> Value {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to read local config {}: {e}", path.display());
            return Value::Mapping(Default::default());
        }
    };
    let value: Value = match serde_yaml::from_str(&text) {
        Ok(Value::Null) => Value::Mapping(Default::default()),
        Ok(value) => value,
        Err(e) => {
            warn!("Failed to parse local config {}: {e}", path.display());
            return Value::Mapping(Default::default());
        }
    };
    let Value::Mapping(mapping) = value else {
        warn!("Local config {} must be a mapping; ignoring", path.display());
        return Value::Mapping(Default::default());
    };

    let mut filtered = serde_yaml::Mapping::new();
    for (key, value) in mapping {
        let Some(key_str) = key.as_str() else { continue };
        if !ALLOWED_ROOT_KEYS.contains(&key_str) {
            warn!(
                "Ignoring unsupported local config key '{key_str}' in {}",
                path.display()
            );
            continue;
        }
        if key_str == "general" {
            let Value::Mapping(general) = value else {
                warn!(
                    "Local config {} general section must be a mapping; ignoring",
                    path.display()
                );
                continue;
            };
            let mut allowed = serde_yaml::Mapping::new();
            for (gkey, gvalue) in general {
                let Some(gkey_str) = gkey.as_str() else { continue };
                if ALLOWED_GENERAL_KEYS.contains(&gkey_str) {
                    allowed.insert(gkey, gvalue);
                } else {
                    warn!(
                        "Ignoring unsupported general key '{gkey_str}' in {}",
                        path.display()
                    );
                }
            }
            if !allowed.is_empty() {
                filtered.insert(key, Value::Mapping(allowed));
            }
        } else if key_str == "autorotate" {
            // Normalize the shorthand form so the structural merge lines up
            // with the base document's `autorotate.patterns` shape.
            let normalized = match value {
                Value::Mapping(inner) if !inner.contains_key("patterns") => {
                    let mut wrapped = serde_yaml::Mapping::new();
                    wrapped.insert("patterns".into(), Value::Mapping(inner));
                    Value::Mapping(wrapped)
                }
                other => other,
            };
            filtered.insert(key, normalized);
        } else {
            filtered.insert(key, value);
        }
    }

    Value::Mapping(filtered)
}

fn deep_merge(base: Value, other: Value) -> Value {
    match (base, other) {
        (Value::Mapping(mut base_map), Value::Mapping(other_map)) => {
            for (key, value) in other_map {
                let merged = match base_map.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                base_map.insert(key, merged);
            }
            Value::Mapping(base_map)
        }
        (_, other) => other,
    }
}

/// Merge an override document onto a base configuration and re-apply the
/// CLI overrides (they always win).
pub fn merge_local_config(
    base: &AppConfig,
    override_data: &Value,
    cli: Option<&CliOverrides>,
) -> Result<AppConfig, ConfigError> {
    // Pull the single-key cq shortcut out before the structural merge.
    let mut data = override_data.clone();
    let cq_shortcut = match &mut data {
        Value::Mapping(mapping) => mapping
            .remove("cq")
            .and_then(|v| v.as_u64())
            .map(|v| v.min(u8::MAX as u64) as u8),
        _ => None,
    };

    let base_value = serde_yaml::to_value(base)?;
    let merged_value = deep_merge(base_value, data);
    let mut merged: AppConfig = serde_yaml::from_value(merged_value)?;

    if let Some(quality) = cq_shortcut {
        apply_quality_override(&mut merged, quality);
    }
    if let Some(cli) = cli {
        cli.apply(&mut merged);
    }
    merged.validate()?;
    Ok(merged)
}

/// A registered per-root override document.
#[derive(Debug, Clone)]
pub struct LocalConfigEntry {
    pub path: PathBuf,
    pub directory: PathBuf,
    pub data: Value,
}

/// Thread-safe registry of per-root override documents.
///
/// Built during discovery; resolution walks up from a file's directory and
/// the nearest registered ancestor wins.
#[derive(Debug, Default)]
pub struct LocalConfigRegistry {
    configs: Mutex<HashMap<PathBuf, LocalConfigEntry>>,
}

impl LocalConfigRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, config_path: PathBuf, data: Value) {
        let directory = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        debug!("Registered local config: {}", config_path.display());
        let entry = LocalConfigEntry {
            directory: directory.clone(),
            path: config_path,
            data,
        };
        self.configs
            .lock()
            .expect("local config registry lock")
            .insert(directory, entry);
    }

    /// Nearest-ancestor override for a file, if any.
    pub fn get_applicable(&self, file_path: &Path) -> Option<LocalConfigEntry> {
        let configs = self.configs.lock().expect("local config registry lock");
        let mut current = file_path.parent();
        while let Some(dir) = current {
            if let Some(entry) = configs.get(dir) {
                return Some(entry.clone());
            }
            current = dir.parent();
        }
        None
    }

    pub fn len(&self) -> usize {
        self.configs.lock().expect("local config registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Scan the roots for override documents and register every valid one.
    pub fn build_from_discovery(&self, roots: &[PathBuf]) {
        for root in roots {
            if !root.is_dir() {
                warn!("Root directory does not exist: {}", root.display());
                continue;
            }
            for entry in walkdir::WalkDir::new(root)
                .into_iter()
                .filter_map(|e| e.ok())
            {
                if entry.file_type().is_file()
                    && entry.file_name().to_str() == Some(LOCAL_CONFIG_FILENAME)
                {
                    let data = load_local_config_data(entry.path());
                    let non_empty = matches!(&data, Value::Mapping(m) if !m.is_empty());
                    if non_empty {
                        self.register(entry.path().to_path_buf(), data);
                    } else {
                        warn!("Skipping empty or invalid {}", entry.path().display());
                    }
                }
            }
        }
    }
}

/// Resolve the effective configuration for one file.
///
/// Returns the merged configuration and a tag describing where the winning
/// layer came from.
pub fn build_job_config(
    base: &AppConfig,
    registry: Option<&LocalConfigRegistry>,
    file_path: &Path,
    cli: Option<&CliOverrides>,
) -> Result<(AppConfig, ConfigSource), ConfigError> {
    if let Some(entry) = registry.and_then(|r| r.get_applicable(file_path)) {
        let merged = merge_local_config(base, &entry.data, cli)?;
        return Ok((merged, ConfigSource::Local));
    }
    let source = match cli {
        Some(cli) if cli.has_overrides() => ConfigSource::Cli,
        _ => ConfigSource::Global,
    };
    Ok((base.clone(), source))
}
