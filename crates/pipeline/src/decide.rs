//! Per-job decisions: effective quality target and rotation.

use regex::Regex;
use thiserror::Error;

use av1_batch_config::{
    extract_quality_flag, extract_quality_value, format_bps_human, resolve_rate_control,
    select_encoder_args, AppConfig, CameraRateRule, QualityMode, RateError,
};

use crate::domain::{QualityDecision, Rotation, VideoFile};

/// Fallback quality indices when the encoder args carry no quality entry.
const DEFAULT_GPU_CQ: u8 = 45;
const DEFAULT_CPU_CQ: u8 = 32;

#[derive(Debug, Error)]
pub enum DecideError {
    #[error(transparent)]
    Rate(#[from] RateError),
}

/// Effective rate fields for one file: the global block unless a per-camera
/// override carries its own.
fn select_rate_fields<'a>(
    file: &'a VideoFile,
    config: &'a AppConfig,
) -> (
    Option<&'a str>,
    Option<&'a str>,
    Option<&'a str>,
    Option<&'a str>,
    &'static str,
) {
    let general = &config.general;
    if let Some(metadata) = &file.metadata {
        if let Some(model) = &metadata.camera_model {
            for (pattern, rule) in &general.dynamic_quality {
                let Some(rate) = &rule.rate else { continue };
                if model.to_lowercase().contains(&pattern.to_lowercase()) {
                    let CameraRateRule {
                        bps,
                        minrate,
                        maxrate,
                        cap,
                    } = rate;
                    // Per-camera cap wins; otherwise the global ceiling
                    // still applies.
                    let cap = cap.as_deref().or(general.rate_cap.as_deref());
                    return (
                        Some(bps.as_str()),
                        minrate.as_deref(),
                        maxrate.as_deref(),
                        cap,
                        "camera",
                    );
                }
            }
        }
    }
    (
        general.bps.as_deref(),
        general.minrate.as_deref(),
        general.maxrate.as_deref(),
        general.rate_cap.as_deref(),
        "global",
    )
}

/// Resolve the constant-quality index for one file.
fn decide_cq(file: &VideoFile, config: &AppConfig, use_gpu: bool) -> u8 {
    let encoder_args = select_encoder_args(config, use_gpu);
    let baseline = extract_quality_value(encoder_args)
        .unwrap_or(if use_gpu { DEFAULT_GPU_CQ } else { DEFAULT_CPU_CQ });

    let Some(metadata) = &file.metadata else {
        return baseline;
    };
    if let Some(rule) = &metadata.quality_override {
        return rule.cq;
    }
    let Some(model) = &metadata.camera_model else {
        return baseline;
    };
    for (pattern, rule) in &config.general.dynamic_quality {
        if model.to_lowercase().contains(&pattern.to_lowercase()) {
            return rule.cq;
        }
    }
    baseline
}

/// Resolve the effective quality target for one job.
pub fn decide_quality(
    file: &VideoFile,
    config: &AppConfig,
    use_gpu: bool,
) -> Result<QualityDecision, DecideError> {
    match config.general.quality_mode {
        QualityMode::Cq => Ok(QualityDecision::Cq(decide_cq(file, config, use_gpu))),
        QualityMode::Rate => {
            let source_bps = file.metadata.as_ref().and_then(|m| m.source_bps());
            let (bps, minrate, maxrate, cap, _source) = select_rate_fields(file, config);
            let resolved = resolve_rate_control(bps, minrate, maxrate, cap, source_bps)?;
            Ok(QualityDecision::Rate(resolved))
        }
    }
}

/// Short quality string for the dashboard and the encode tags.
pub fn quality_display(decision: &QualityDecision, config: &AppConfig, use_gpu: bool) -> String {
    match decision {
        QualityDecision::Cq(value) => {
            let flag = extract_quality_flag(select_encoder_args(config, use_gpu));
            let label = match flag {
                Some("-cq") => "CQ",
                Some("-crf") => "CRF",
                _ => "Q",
            };
            format!("{label}{value}")
        }
        QualityDecision::Rate(rate) => format_bps_human(rate.target_bps),
    }
}

/// Resolve the rotation for one job: manual override first, then the
/// filename pattern table in configuration order, first match wins.
pub fn decide_rotation(file: &VideoFile, config: &AppConfig) -> Rotation {
    if let Some(angle) = config.general.manual_rotation {
        return Rotation::from_degrees(angle).unwrap_or(Rotation::None);
    }
    let filename = file.file_name();
    for (pattern, angle) in &config.autorotate.patterns {
        // Patterns were validated at config load; a rejected one here would
        // mean the config changed underneath us, so skip it.
        let Ok(regex) = Regex::new(pattern) else {
            continue;
        };
        if regex.is_match(&filename) {
            return Rotation::from_degrees(*angle).unwrap_or(Rotation::None);
        }
    }
    Rotation::None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::VideoMetadata;
    use av1_batch_config::CameraQualityRule;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn file_with_metadata(metadata: VideoMetadata) -> VideoFile {
        let mut file = VideoFile::new(PathBuf::from("/in/clip.mp4"), 1 << 20);
        file.metadata = Some(Arc::new(metadata));
        file
    }

    fn config_with_rules(rules: Vec<(&str, CameraQualityRule)>) -> AppConfig {
        let mut config = AppConfig::default();
        config.general.dynamic_quality = rules
            .into_iter()
            .map(|(pattern, rule)| (pattern.to_string(), rule))
            .collect();
        config
    }

    #[test]
    fn cq_baseline_comes_from_encoder_args() {
        let config = AppConfig::default();
        let file = VideoFile::new(PathBuf::from("/in/clip.mp4"), 1 << 20);
        assert_eq!(
            decide_quality(&file, &config, true).unwrap(),
            QualityDecision::Cq(45)
        );
        assert_eq!(
            decide_quality(&file, &config, false).unwrap(),
            QualityDecision::Cq(32)
        );
    }

    #[test]
    fn carried_override_beats_everything() {
        let config = config_with_rules(vec![("DJI", CameraQualityRule { cq: 41, rate: None })]);
        let file = file_with_metadata(VideoMetadata {
            camera_model: Some("DJI Pocket 3".into()),
            quality_override: Some(CameraQualityRule { cq: 39, rate: None }),
            ..Default::default()
        });
        assert_eq!(
            decide_quality(&file, &config, true).unwrap(),
            QualityDecision::Cq(39)
        );
    }

    #[test]
    fn camera_model_matches_rule_table() {
        let config = config_with_rules(vec![
            ("ILCE", CameraQualityRule { cq: 38, rate: None }),
            ("DJI", CameraQualityRule { cq: 41, rate: None }),
        ]);
        let file = file_with_metadata(VideoMetadata {
            camera_model: Some("dji pocket".into()),
            ..Default::default()
        });
        assert_eq!(
            decide_quality(&file, &config, true).unwrap(),
            QualityDecision::Cq(41)
        );
    }

    #[test]
    fn rate_mode_resolves_against_source_bitrate() {
        let mut config = AppConfig::default();
        config.general.quality_mode = QualityMode::Rate;
        config.general.bps = Some("0.5".into());

        let file = file_with_metadata(VideoMetadata {
            bitrate_kbps: Some(40_000.0),
            ..Default::default()
        });
        let decision = decide_quality(&file, &config, true).unwrap();
        match decision {
            QualityDecision::Rate(rate) => assert_eq!(rate.target_bps, 20_000_000),
            other => panic!("expected rate decision, got {other:?}"),
        }
    }

    #[test]
    fn rate_mode_without_source_bitrate_fails_for_ratios() {
        let mut config = AppConfig::default();
        config.general.quality_mode = QualityMode::Rate;
        config.general.bps = Some("0.5".into());

        let file = VideoFile::new(PathBuf::from("/in/clip.mp4"), 1 << 20);
        assert!(decide_quality(&file, &config, true).is_err());
    }

    #[test]
    fn per_camera_rate_block_wins() {
        let mut config = config_with_rules(vec![(
            "DJI",
            CameraQualityRule {
                cq: 41,
                rate: Some(CameraRateRule {
                    bps: "12M".into(),
                    minrate: None,
                    maxrate: None,
                    cap: None,
                }),
            },
        )]);
        config.general.quality_mode = QualityMode::Rate;
        config.general.bps = Some("24M".into());

        let file = file_with_metadata(VideoMetadata {
            camera_model: Some("DJI".into()),
            ..Default::default()
        });
        match decide_quality(&file, &config, true).unwrap() {
            QualityDecision::Rate(rate) => assert_eq!(rate.target_bps, 12_000_000),
            other => panic!("expected rate decision, got {other:?}"),
        }
    }

    #[test]
    fn global_cap_applies_to_camera_rate_without_own_cap() {
        let mut config = config_with_rules(vec![(
            "DJI",
            CameraQualityRule {
                cq: 41,
                rate: Some(CameraRateRule {
                    bps: "40M".into(),
                    minrate: None,
                    maxrate: None,
                    cap: None,
                }),
            },
        )]);
        config.general.quality_mode = QualityMode::Rate;
        config.general.bps = Some("24M".into());
        config.general.rate_cap = Some("20M".into());

        let file = file_with_metadata(VideoMetadata {
            camera_model: Some("DJI".into()),
            ..Default::default()
        });
        match decide_quality(&file, &config, true).unwrap() {
            QualityDecision::Rate(rate) => assert_eq!(rate.target_bps, 20_000_000),
            other => panic!("expected rate decision, got {other:?}"),
        }
    }

    #[test]
    fn quality_display_reflects_flag_and_mode() {
        let config = AppConfig::default();
        assert_eq!(quality_display(&QualityDecision::Cq(45), &config, true), "CQ45");
        assert_eq!(quality_display(&QualityDecision::Cq(32), &config, false), "CRF32");
        let rate = QualityDecision::Rate(av1_batch_config::ResolvedRateControl {
            target_bps: 24_000_000,
            minrate_bps: None,
            maxrate_bps: None,
        });
        assert_eq!(quality_display(&rate, &config, true), "24 Mbps");
    }

    #[test]
    fn manual_rotation_wins_over_patterns() {
        let mut config = AppConfig::default();
        config.general.manual_rotation = Some(180);
        config.autorotate.patterns = vec![("clip".into(), 90)];

        let file = VideoFile::new(PathBuf::from("/in/clip.mp4"), 1);
        assert_eq!(decide_rotation(&file, &config), Rotation::R180);
    }

    #[test]
    fn first_matching_pattern_wins() {
        let mut config = AppConfig::default();
        // Both patterns match the filename; configuration order decides.
        config.autorotate.patterns = vec![
            (r"GOPR.*\.mp4".into(), 180),
            (r"GOPR0042.*".into(), 90),
        ];

        let file = VideoFile::new(PathBuf::from("/in/GOPR0042.mp4"), 1);
        assert_eq!(decide_rotation(&file, &config), Rotation::R180);
    }

    #[test]
    fn no_match_means_no_rotation() {
        let mut config = AppConfig::default();
        config.autorotate.patterns = vec![(r"DJI_.*".into(), 270)];
        let file = VideoFile::new(PathBuf::from("/in/holiday.mp4"), 1);
        assert_eq!(decide_rotation(&file, &config), Rotation::None);
    }
}
