//! Configuration for the av1-batch transcoding pipeline.
//!
//! Assembles the effective configuration for a run from the global YAML
//! document, per-root override documents, and CLI flags, with precedence
//! CLI > per-root > global > defaults.

pub mod demo;
pub mod encoder_args;
pub mod input_dirs;
pub mod loader;
pub mod model;
pub mod overrides;
pub mod rate;

pub use demo::DemoConfig;
pub use encoder_args::{
    container_for_args, extract_quality_flag, extract_quality_value, infer_encoder_label,
    output_extension_for_args, replace_quality_value, select_encoder_args,
};
pub use input_dirs::{
    dedupe_preserve_order, find_root_for, parse_cli_input_dirs, resolve_root_mapping, RootPaths,
};
pub use loader::{load_config, load_demo_config, parse_config};
pub use model::{
    AppConfig, AutorotateConfig, CameraQualityRule, CameraRateRule, ConfigError, CpuEncoderConfig,
    GeneralConfig, GpuEncoderConfig, QualityMode, QueueSort, UiConfig, VerifyFailAction,
};
pub use overrides::{
    build_job_config, load_local_config_data, merge_local_config, CliOverrides, ConfigSource,
    LocalConfigEntry, LocalConfigRegistry, LOCAL_CONFIG_FILENAME,
};
pub use rate::{
    describe_rate_target, format_bps_human, parse_rate_value, resolve_rate_control,
    validate_rate_inputs, ParsedRate, RateClass, RateError, ResolvedRateControl,
};
