//! Configuration schema for the batch transcoding pipeline.
//!
//! Every section is optional in the YAML document; missing fields fall back
//! to defaults, so an empty file is a valid configuration. Range and
//! cross-field rules that serde cannot express live in [`AppConfig::validate`].

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::str::FromStr;

use crate::rate::{parse_rate_value, validate_rate_inputs, RateClass, RateError};

/// Error type for configuration operations
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// IO error reading a config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A value was out of range or sections contradict each other
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// Rate-control fields failed validation
    #[error("Invalid rate control: {0}")]
    Rate(#[from] RateError),
}

/// Queue ordering applied to discovered files before submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum QueueSort {
    /// Lexicographic by file name (the default).
    #[default]
    Name,
    /// Seeded (or unseeded) shuffle.
    Rand,
    /// Grouped by input root, lexicographic within each root.
    Dir,
    /// Smallest files first. `size` is accepted as an alias.
    #[serde(alias = "size")]
    SizeAsc,
    /// Largest files first.
    SizeDesc,
    /// Partitioned by the configured extension order.
    Ext,
}

impl QueueSort {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueSort::Name => "name",
            QueueSort::Rand => "rand",
            QueueSort::Dir => "dir",
            QueueSort::SizeAsc => "size-asc",
            QueueSort::SizeDesc => "size-desc",
            QueueSort::Ext => "ext",
        }
    }
}

impl FromStr for QueueSort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "name" => Ok(QueueSort::Name),
            "rand" => Ok(QueueSort::Rand),
            "dir" => Ok(QueueSort::Dir),
            "size" | "size-asc" => Ok(QueueSort::SizeAsc),
            "size-desc" => Ok(QueueSort::SizeDesc),
            "ext" => Ok(QueueSort::Ext),
            other => Err(format!(
                "Invalid queue_sort '{other}'. Use one of: name, rand, dir, size, size-asc, size-desc, ext."
            )),
        }
    }
}

/// Quality target selection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QualityMode {
    /// Constant-quality index taken from the encoder args (default).
    #[default]
    Cq,
    /// Bitrate targets resolved from bps/minrate/maxrate.
    Rate,
}

impl FromStr for QualityMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cq" => Ok(QualityMode::Cq),
            "rate" => Ok(QualityMode::Rate),
            other => Err(format!("Invalid quality_mode '{other}'. Use 'cq' or 'rate'.")),
        }
    }
}

/// Action taken when verify-on-complete fails for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VerifyFailAction {
    /// Verification disabled.
    #[default]
    Off,
    /// Mark the job failed and continue.
    Log,
    /// Freeze the queue until a refresh or shutdown arrives.
    Pause,
    /// Tear the run down.
    Exit,
}

impl FromStr for VerifyFailAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "false" | "off" => Ok(VerifyFailAction::Off),
            "log" => Ok(VerifyFailAction::Log),
            "pause" => Ok(VerifyFailAction::Pause),
            "exit" => Ok(VerifyFailAction::Exit),
            other => Err(format!(
                "Invalid verify-fail-action '{other}'. Use false, log, pause or exit."
            )),
        }
    }
}

/// Per-camera bitrate rule used when `quality_mode = rate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraRateRule {
    pub bps: String,
    #[serde(default)]
    pub minrate: Option<String>,
    #[serde(default)]
    pub maxrate: Option<String>,
    /// Absolute-only ceiling on the resolved target.
    #[serde(default)]
    pub cap: Option<String>,
}

/// Per-camera quality override. First pattern match wins.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraQualityRule {
    pub cq: u8,
    pub rate: Option<CameraRateRule>,
}

impl<'de> Deserialize<'de> for CameraQualityRule {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct RuleVisitor;

        impl<'de> Visitor<'de> for RuleVisitor {
            type Value = CameraQualityRule;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping with required 'cq' and optional 'rate'")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut cq: Option<u8> = None;
                let mut rate: Option<CameraRateRule> = None;
                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "cq" => cq = Some(map.next_value()?),
                        "rate" => rate = Some(map.next_value()?),
                        other => {
                            return Err(serde::de::Error::custom(format!(
                                "Unknown camera override key '{other}'. Expected 'cq' or 'rate'."
                            )))
                        }
                    }
                }
                let cq = cq.ok_or_else(|| serde::de::Error::custom("camera override requires 'cq'"))?;
                Ok(CameraQualityRule { cq, rate })
            }

            // Reject the legacy scalar form with a pointed message.
            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Err(E::custom(format!(
                    "Legacy scalar camera override '{v}' is not supported. Use the object form: {{ cq: {v} }}."
                )))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                self.visit_u64(v.max(0) as u64)
            }
        }

        deserializer.deserialize_any(RuleVisitor)
    }
}

/// Deserialize a YAML mapping into a `Vec<(String, V)>`, preserving document
/// order. Used for per-camera overrides and rotation patterns, where
/// first-match-wins makes ordering load-bearing.
fn ordered_map<'de, D, V>(deserializer: D) -> Result<Vec<(String, V)>, D::Error>
where
    D: Deserializer<'de>,
    V: Deserialize<'de>,
{
    struct OrderedVisitor<V>(PhantomData<V>);

    impl<'de, V: Deserialize<'de>> Visitor<'de> for OrderedVisitor<V> {
        type Value = Vec<(String, V)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a mapping")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut entries = Vec::new();
            while let Some((key, value)) = map.next_entry::<String, V>()? {
                entries.push((key, value));
            }
            Ok(entries)
        }
    }

    deserializer.deserialize_map(OrderedVisitor(PhantomData))
}

fn serialize_ordered_map<S, V>(entries: &[(String, V)], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    V: Serialize,
{
    let mut map = serializer.serialize_map(Some(entries.len()))?;
    for (key, value) in entries {
        map.serialize_entry(key, value)?;
    }
    map.end()
}

fn default_threads() -> u32 {
    1
}

fn default_prefetch_factor() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_log_path() -> Option<PathBuf> {
    Some(PathBuf::from("/tmp/av1-batch/transcode.log"))
}

fn default_extensions() -> Vec<String> {
    vec![
        ".mp4".into(),
        ".mov".into(),
        ".avi".into(),
        ".flv".into(),
        ".webm".into(),
    ]
}

fn default_min_size_bytes() -> u64 {
    1_048_576
}

fn default_min_compression_ratio() -> f64 {
    0.1
}

/// Core compression and scheduling settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Maximum concurrent transcodes at start.
    #[serde(default = "default_threads")]
    pub threads: u32,
    /// Submit-on-demand multiplier: live jobs <= threads * prefetch_factor.
    #[serde(default = "default_prefetch_factor")]
    pub prefetch_factor: u32,
    /// Use the GPU encoder args (NVENC) instead of the CPU args.
    #[serde(default = "default_true")]
    pub gpu: bool,
    #[serde(default)]
    pub queue_sort: QueueSort,
    #[serde(default)]
    pub queue_seed: Option<u64>,
    /// Log file destination. The dashboard owns stdout, so logs always go to a file.
    #[serde(default = "default_log_path")]
    pub log_path: Option<PathBuf>,
    /// Retry on the CPU encoder when the GPU reports a capability failure.
    #[serde(default)]
    pub cpu_fallback: bool,
    /// Thread cap handed to the CPU encoder (None = encoder decides).
    #[serde(default)]
    pub ffmpeg_cpu_threads: Option<u32>,
    /// Copy preserved EXIF/XMP metadata onto completed outputs.
    #[serde(default = "default_true")]
    pub copy_metadata: bool,
    /// Read camera metadata for per-camera overrides and filtering.
    #[serde(default = "default_true")]
    pub use_exif: bool,
    /// Only process files whose camera string contains one of these patterns.
    #[serde(default)]
    pub filter_cameras: Vec<String>,
    /// Ordered per-camera overrides; first matching pattern wins.
    #[serde(
        default,
        deserialize_with = "ordered_map",
        serialize_with = "serialize_ordered_map"
    )]
    pub dynamic_quality: Vec<(String, CameraQualityRule)>,
    #[serde(default)]
    pub quality_mode: QualityMode,
    /// Rate-mode target. Absolute (`24M`, `8000k`) or a bare multiplier of the
    /// source bitrate; bps/minrate/maxrate must all use the same class.
    #[serde(default)]
    pub bps: Option<String>,
    #[serde(default)]
    pub minrate: Option<String>,
    #[serde(default)]
    pub maxrate: Option<String>,
    /// Absolute-only ceiling applied after resolution.
    #[serde(default)]
    pub rate_cap: Option<String>,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_min_size_bytes")]
    pub min_size_bytes: u64,
    /// Remove stale .err markers before the run and retry those files.
    #[serde(default)]
    pub clean_errors: bool,
    /// Skip files already in the target codec.
    #[serde(default)]
    pub skip_av1: bool,
    /// Force one rotation for every file (degrees), overriding autorotate.
    #[serde(default)]
    pub manual_rotation: Option<u16>,
    /// Required savings fraction; outputs saving less keep the original.
    #[serde(default = "default_min_compression_ratio")]
    pub min_compression_ratio: f64,
    #[serde(default)]
    pub verify_fail_action: VerifyFailAction,
    /// Keep the dashboard open after processing finishes.
    #[serde(default)]
    pub wait_on_finish: bool,
    /// Ring the terminal bell when the run completes.
    #[serde(default)]
    pub bell: bool,
    #[serde(default)]
    pub debug: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty general config uses defaults")
    }
}

/// Filename-pattern rotation rules, evaluated in configuration order.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct AutorotateConfig {
    #[serde(serialize_with = "serialize_ordered_map")]
    pub patterns: Vec<(String, u16)>,
}

impl<'de> Deserialize<'de> for AutorotateConfig {
    // Accepts either `autorotate: { patterns: {regex: angle} }` or the
    // shorthand `autorotate: {regex: angle}`.
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_yaml::Value::deserialize(deserializer)?;
        let mapping = match value {
            serde_yaml::Value::Null => return Ok(AutorotateConfig::default()),
            serde_yaml::Value::Mapping(m) => m,
            _ => return Err(serde::de::Error::custom("autorotate must be a mapping")),
        };

        let inner = match mapping.get("patterns") {
            Some(serde_yaml::Value::Mapping(patterns)) => patterns.clone(),
            Some(serde_yaml::Value::Null) => serde_yaml::Mapping::new(),
            Some(_) => return Err(serde::de::Error::custom("autorotate.patterns must be a mapping")),
            None => mapping,
        };

        let mut patterns = Vec::with_capacity(inner.len());
        for (key, value) in inner {
            let pattern = key
                .as_str()
                .ok_or_else(|| serde::de::Error::custom("autorotate pattern must be a string"))?
                .to_string();
            let angle = value
                .as_u64()
                .ok_or_else(|| serde::de::Error::custom("autorotate angle must be an integer"))?;
            patterns.push((pattern, angle as u16));
        }
        Ok(AutorotateConfig { patterns })
    }
}

fn default_gpu_common_args() -> Vec<String> {
    vec![
        "-c:v av1_nvenc".into(),
        "-preset p7".into(),
        "-tune hq".into(),
        "-b:v 0".into(),
        "-cq 45".into(),
        "-f mp4".into(),
    ]
}

fn default_gpu_advanced_args() -> Vec<String> {
    vec![
        "-c:v av1_nvenc".into(),
        "-preset p7".into(),
        "-tune hq".into(),
        "-b:v 0".into(),
        "-cq 45".into(),
        "-rc vbr".into(),
        "-multipass fullres".into(),
        "-rc-lookahead 32".into(),
        "-spatial-aq 1".into(),
        "-temporal-aq 1".into(),
        "-aq-strength 8".into(),
        "-b_ref_mode middle".into(),
        "-f mp4".into(),
    ]
}

fn default_cpu_common_args() -> Vec<String> {
    vec![
        "-c:v libsvtav1".into(),
        "-preset 6".into(),
        "-crf 32".into(),
        "-svtav1-params tune=0:enable-overlays=1".into(),
        "-f mp4".into(),
    ]
}

fn default_cpu_advanced_args() -> Vec<String> {
    vec![
        "-c:v libaom-av1".into(),
        "-crf 30".into(),
        "-b:v 0".into(),
        "-cpu-used 0".into(),
        "-tune ssim".into(),
        "-lag-in-frames 35".into(),
        "-aq-mode 1".into(),
        "-row-mt 1".into(),
        "-threads 0".into(),
        "-f matroska".into(),
    ]
}

/// NVENC AV1 encoder argument sets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuEncoderConfig {
    #[serde(default)]
    pub advanced: bool,
    #[serde(default = "default_gpu_common_args")]
    pub common_args: Vec<String>,
    #[serde(default = "default_gpu_advanced_args")]
    pub advanced_args: Vec<String>,
}

impl Default for GpuEncoderConfig {
    fn default() -> Self {
        Self {
            advanced: false,
            common_args: default_gpu_common_args(),
            advanced_args: default_gpu_advanced_args(),
        }
    }
}

/// Software encoder argument sets (SVT-AV1 common, AOM advanced).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuEncoderConfig {
    #[serde(default)]
    pub advanced: bool,
    #[serde(default = "default_cpu_common_args")]
    pub common_args: Vec<String>,
    #[serde(default = "default_cpu_advanced_args")]
    pub advanced_args: Vec<String>,
}

impl Default for CpuEncoderConfig {
    fn default() -> Self {
        Self {
            advanced: false,
            common_args: default_cpu_common_args(),
            advanced_args: default_cpu_advanced_args(),
        }
    }
}

fn default_activity_feed_max_items() -> usize {
    5
}

fn default_active_jobs_max_display() -> usize {
    8
}

/// Dashboard display limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiConfig {
    #[serde(default = "default_activity_feed_max_items")]
    pub activity_feed_max_items: usize,
    #[serde(default = "default_active_jobs_max_display")]
    pub active_jobs_max_display: usize,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            activity_feed_max_items: default_activity_feed_max_items(),
            active_jobs_max_display: default_active_jobs_max_display(),
        }
    }
}

fn default_suffix_output_dirs() -> Option<String> {
    Some("_out".into())
}

fn default_suffix_errors_dirs() -> Option<String> {
    Some("_err".into())
}

/// Top-level configuration container.
///
/// Directory mapping modes, per input root `R`:
/// 1. Suffix mode: output root is `R + suffix_output_dirs` (same for errors).
/// 2. Explicit mode: `input_dirs[i] -> output_dirs[i]`, one-to-one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub input_dirs: Vec<String>,
    #[serde(default)]
    pub output_dirs: Vec<String>,
    #[serde(default = "default_suffix_output_dirs")]
    pub suffix_output_dirs: Option<String>,
    #[serde(default)]
    pub errors_dirs: Vec<String>,
    #[serde(default = "default_suffix_errors_dirs")]
    pub suffix_errors_dirs: Option<String>,
    #[serde(default)]
    pub autorotate: AutorotateConfig,
    #[serde(default)]
    pub gpu_encoder: GpuEncoderConfig,
    #[serde(default)]
    pub cpu_encoder: CpuEncoderConfig,
    #[serde(default)]
    pub ui: UiConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty config uses defaults")
    }
}

impl AppConfig {
    /// Check range and cross-field rules that the schema cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let general = &self.general;
        if general.threads == 0 {
            return Err(ConfigError::Invalid("threads must be > 0".into()));
        }
        if general.prefetch_factor == 0 {
            return Err(ConfigError::Invalid("prefetch_factor must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&general.min_compression_ratio) {
            return Err(ConfigError::Invalid(
                "min_compression_ratio must be within [0, 1]".into(),
            ));
        }
        if let Some(angle) = general.manual_rotation {
            if !matches!(angle, 0 | 90 | 180 | 270) {
                return Err(ConfigError::Invalid(format!(
                    "manual_rotation must be 0, 90, 180 or 270 (got {angle})"
                )));
            }
        }
        if general.queue_sort == QueueSort::Ext && general.extensions.is_empty() {
            return Err(ConfigError::Invalid(
                "queue_sort 'ext' requires a non-empty extensions list".into(),
            ));
        }

        for (pattern, rule) in &general.dynamic_quality {
            if rule.cq > 63 {
                return Err(ConfigError::Invalid(format!(
                    "camera override '{pattern}' has cq {} outside [0, 63]",
                    rule.cq
                )));
            }
            if let Some(rate) = &rule.rate {
                validate_rate_inputs(
                    QualityMode::Rate,
                    Some(rate.bps.as_str()),
                    rate.minrate.as_deref(),
                    rate.maxrate.as_deref(),
                    false,
                )?;
                validate_cap(rate.cap.as_deref())?;
            }
        }

        for (pattern, angle) in &self.autorotate.patterns {
            if !matches!(*angle, 0 | 90 | 180 | 270) {
                return Err(ConfigError::Invalid(format!(
                    "autorotate angle {angle} for pattern '{pattern}' must be 0, 90, 180 or 270"
                )));
            }
            regex::Regex::new(pattern).map_err(|e| {
                ConfigError::Invalid(format!("autorotate pattern '{pattern}' is not a valid regex: {e}"))
            })?;
        }

        validate_rate_inputs(
            general.quality_mode,
            general.bps.as_deref(),
            general.minrate.as_deref(),
            general.maxrate.as_deref(),
            true,
        )?;
        validate_cap(general.rate_cap.as_deref())?;

        if !self.output_dirs.is_empty() && self.suffix_output_dirs.is_some() {
            return Err(ConfigError::Invalid(
                "output_dirs cannot be combined with suffix_output_dirs".into(),
            ));
        }
        if self.output_dirs.is_empty() && self.suffix_output_dirs.is_none() {
            return Err(ConfigError::Invalid(
                "suffix_output_dirs must be set when output_dirs is empty".into(),
            ));
        }
        if !self.errors_dirs.is_empty() && self.suffix_errors_dirs.is_some() {
            return Err(ConfigError::Invalid(
                "errors_dirs cannot be combined with suffix_errors_dirs".into(),
            ));
        }
        if self.errors_dirs.is_empty() && self.suffix_errors_dirs.is_none() {
            return Err(ConfigError::Invalid(
                "suffix_errors_dirs must be set when errors_dirs is empty".into(),
            ));
        }

        Ok(())
    }

    /// Accepted extensions, normalized to lowercase with a leading dot.
    pub fn normalized_extensions(&self) -> Vec<String> {
        self.general
            .extensions
            .iter()
            .map(|ext| {
                let lower = ext.to_lowercase();
                if lower.starts_with('.') {
                    lower
                } else {
                    format!(".{lower}")
                }
            })
            .collect()
    }
}

fn validate_cap(cap: Option<&str>) -> Result<(), ConfigError> {
    if let Some(raw) = cap {
        let parsed = parse_rate_value(raw)?;
        if parsed.class != RateClass::Absolute {
            return Err(ConfigError::Invalid(format!(
                "rate cap '{raw}' must be an absolute bitrate, not a multiplier"
            )));
        }
    }
    Ok(())
}
