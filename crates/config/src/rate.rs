//! Parsing, validation and resolution of bitrate-mode quality targets.
//!
//! A rate value is either absolute (`8000000`, `8000k`, `24M`, `24Mbps`) or a
//! bare multiplier of the source bitrate (`0.5`, `1.5`). bps, minrate and
//! maxrate must all use the same class within one configuration.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::model::QualityMode;

/// Largest bare number still interpreted as a source-bitrate multiplier.
/// Anything above it is taken as absolute bits per second.
const MAX_RATIO: f64 = 10.0;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RateError {
    #[error("Rate value cannot be empty.")]
    Empty,
    #[error("Invalid rate value '{0}'. Use numeric bps, a multiplier, or suffixes like k, M, Mbps.")]
    Malformed(String),
    #[error("Unsupported bitrate suffix '{suffix}' in '{raw}'. Supported: k, M, G, Mbps, bps.")]
    BadSuffix { raw: String, suffix: String },
    #[error("Bitrate must be > 0 (got '{0}').")]
    NonPositive(String),
    #[error("bps/minrate/maxrate require quality_mode=rate.")]
    ValuesWithoutRateMode,
    #[error("quality_mode=rate requires bps.")]
    MissingBps,
    #[error("bps/minrate/maxrate must use the same numeric class (all absolute or all multipliers).")]
    MixedClasses,
    #[error("minrate must be <= maxrate.")]
    MinAboveMax,
    #[error("bps must be >= minrate.")]
    BpsBelowMin,
    #[error("bps must be <= maxrate.")]
    BpsAboveMax,
    #[error("Source bitrate unavailable; cannot resolve multiplier-based bitrate.")]
    NoSourceBitrate,
}

/// Numeric class of a parsed rate value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateClass {
    /// Bits per second.
    Absolute,
    /// Multiplier of the source bitrate.
    Ratio,
}

/// A single parsed bps/minrate/maxrate value.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRate {
    pub raw: String,
    pub class: RateClass,
    pub value: f64,
}

/// Fully resolved bitrate targets, in bits per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedRateControl {
    pub target_bps: u64,
    pub minrate_bps: Option<u64>,
    pub maxrate_bps: Option<u64>,
}

fn rate_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(?P<number>\d+(?:\.\d+)?)(?P<suffix>[A-Za-z]*)$").unwrap())
}

fn suffix_multiplier(suffix: &str) -> Option<f64> {
    match suffix {
        "bps" => Some(1.0),
        "k" | "kbps" => Some(1_000.0),
        "m" | "mbps" => Some(1_000_000.0),
        "g" | "gbps" => Some(1_000_000_000.0),
        _ => None,
    }
}

/// Parse one rate value into its class and numeric value.
pub fn parse_rate_value(raw: &str) -> Result<ParsedRate, RateError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(RateError::Empty);
    }

    let compact = text.replace(' ', "");
    let captures = rate_pattern()
        .captures(&compact)
        .ok_or_else(|| RateError::Malformed(text.to_string()))?;

    let number: f64 = captures["number"].parse().map_err(|_| RateError::Malformed(text.to_string()))?;
    let suffix = captures["suffix"].to_lowercase();

    if suffix.is_empty() {
        if number <= 0.0 {
            return Err(RateError::NonPositive(text.to_string()));
        }
        // A bare number up to MAX_RATIO is a multiplier of the source
        // bitrate; larger bare numbers are absolute bits per second.
        if number <= MAX_RATIO {
            return Ok(ParsedRate {
                raw: text.to_string(),
                class: RateClass::Ratio,
                value: number,
            });
        }
        return Ok(ParsedRate {
            raw: text.to_string(),
            class: RateClass::Absolute,
            value: number,
        });
    }

    let multiplier =
        suffix_multiplier(&suffix).ok_or_else(|| RateError::BadSuffix {
            raw: text.to_string(),
            suffix,
        })?;
    let bps = number * multiplier;
    if bps <= 0.0 {
        return Err(RateError::NonPositive(text.to_string()));
    }
    Ok(ParsedRate {
        raw: text.to_string(),
        class: RateClass::Absolute,
        value: bps,
    })
}

/// Parsed bps/minrate/maxrate triple.
#[derive(Debug, Clone, Default)]
pub struct ParsedRateSet {
    pub bps: Option<ParsedRate>,
    pub minrate: Option<ParsedRate>,
    pub maxrate: Option<ParsedRate>,
}

/// Validate the rate fields against the quality mode.
///
/// When `allow_values_when_non_rate` is false, any rate field outside rate
/// mode is an error (used for per-camera rules, which always mean rate mode).
pub fn validate_rate_inputs(
    mode: QualityMode,
    bps: Option<&str>,
    minrate: Option<&str>,
    maxrate: Option<&str>,
    allow_values_when_non_rate: bool,
) -> Result<ParsedRateSet, RateError> {
    let parsed = ParsedRateSet {
        bps: bps.map(parse_rate_value).transpose()?,
        minrate: minrate.map(parse_rate_value).transpose()?,
        maxrate: maxrate.map(parse_rate_value).transpose()?,
    };

    if mode != QualityMode::Rate {
        let any_set = parsed.bps.is_some() || parsed.minrate.is_some() || parsed.maxrate.is_some();
        if any_set && !allow_values_when_non_rate {
            return Err(RateError::ValuesWithoutRateMode);
        }
        return Ok(parsed);
    }

    let target = parsed.bps.as_ref().ok_or(RateError::MissingBps)?;

    let mut classes = vec![target.class];
    classes.extend(parsed.minrate.iter().map(|p| p.class));
    classes.extend(parsed.maxrate.iter().map(|p| p.class));
    if classes.windows(2).any(|pair| pair[0] != pair[1]) {
        return Err(RateError::MixedClasses);
    }

    if let (Some(min), Some(max)) = (&parsed.minrate, &parsed.maxrate) {
        if min.value > max.value {
            return Err(RateError::MinAboveMax);
        }
    }
    if let Some(min) = &parsed.minrate {
        if target.value < min.value {
            return Err(RateError::BpsBelowMin);
        }
    }
    if let Some(max) = &parsed.maxrate {
        if target.value > max.value {
            return Err(RateError::BpsAboveMax);
        }
    }

    Ok(parsed)
}

fn resolve_one(parsed: &ParsedRate, source_bps: Option<f64>) -> Result<u64, RateError> {
    match parsed.class {
        RateClass::Absolute => Ok((parsed.value.round() as u64).max(1)),
        RateClass::Ratio => {
            let source = source_bps.filter(|b| *b > 0.0).ok_or(RateError::NoSourceBitrate)?;
            Ok(((source * parsed.value).round() as u64).max(1))
        }
    }
}

/// Resolve bps/minrate/maxrate into concrete bits-per-second targets,
/// applying the optional absolute cap last.
pub fn resolve_rate_control(
    bps: Option<&str>,
    minrate: Option<&str>,
    maxrate: Option<&str>,
    cap: Option<&str>,
    source_bps: Option<f64>,
) -> Result<ResolvedRateControl, RateError> {
    let parsed = validate_rate_inputs(QualityMode::Rate, bps, minrate, maxrate, false)?;

    let target = resolve_one(parsed.bps.as_ref().expect("validated above"), source_bps)?;
    let minrate_bps = parsed
        .minrate
        .as_ref()
        .map(|p| resolve_one(p, source_bps))
        .transpose()?;
    let maxrate_bps = parsed
        .maxrate
        .as_ref()
        .map(|p| resolve_one(p, source_bps))
        .transpose()?;

    if let (Some(min), Some(max)) = (minrate_bps, maxrate_bps) {
        if min > max {
            return Err(RateError::MinAboveMax);
        }
    }
    if let Some(min) = minrate_bps {
        if target < min {
            return Err(RateError::BpsBelowMin);
        }
    }
    if let Some(max) = maxrate_bps {
        if target > max {
            return Err(RateError::BpsAboveMax);
        }
    }

    let mut resolved = ResolvedRateControl {
        target_bps: target,
        minrate_bps,
        maxrate_bps,
    };

    if let Some(cap_raw) = cap {
        let parsed_cap = parse_rate_value(cap_raw)?;
        if parsed_cap.class != RateClass::Absolute {
            return Err(RateError::Malformed(format!("cap '{cap_raw}' must be absolute")));
        }
        let ceiling = parsed_cap.value.round() as u64;
        resolved.target_bps = resolved.target_bps.min(ceiling);
        resolved.maxrate_bps = resolved.maxrate_bps.map(|m| m.min(ceiling));
        resolved.minrate_bps = resolved.minrate_bps.map(|m| m.min(ceiling));
    }

    Ok(resolved)
}

fn format_float(value: f64) -> String {
    let text = format!("{value:.3}");
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Human-readable bitrate, e.g. `24 Mbps`, `8000 kbps`, `500 bps`.
pub fn format_bps_human(bps: u64) -> String {
    if bps >= 1_000_000 {
        format!("{} Mbps", format_float(bps as f64 / 1_000_000.0))
    } else if bps >= 1_000 {
        format!("{} kbps", format_float(bps as f64 / 1_000.0))
    } else {
        format!("{bps} bps")
    }
}

/// Short description of a configured target for log and UI lines.
pub fn describe_rate_target(value: Option<&str>) -> String {
    let Some(raw) = value else {
        return "rate".to_string();
    };
    match parse_rate_value(raw) {
        Ok(parsed) if parsed.class == RateClass::Absolute => {
            format_bps_human(parsed.value.round() as u64)
        }
        Ok(parsed) => format!("input x{}", format_float(parsed.value)),
        Err(_) => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn absolute_suffixes_parse() {
        assert_eq!(parse_rate_value("8000k").unwrap().value, 8_000_000.0);
        assert_eq!(parse_rate_value("24M").unwrap().value, 24_000_000.0);
        assert_eq!(parse_rate_value("24Mbps").unwrap().value, 24_000_000.0);
        assert_eq!(parse_rate_value("1G").unwrap().value, 1_000_000_000.0);
        assert_eq!(parse_rate_value("500bps").unwrap().value, 500.0);
        assert_eq!(parse_rate_value("24 M").unwrap().class, RateClass::Absolute);
    }

    #[test]
    fn bare_numbers_split_at_ratio_bound() {
        let ratio = parse_rate_value("0.5").unwrap();
        assert_eq!(ratio.class, RateClass::Ratio);
        assert_eq!(ratio.value, 0.5);

        let boundary = parse_rate_value("10").unwrap();
        assert_eq!(boundary.class, RateClass::Ratio);

        let absolute = parse_rate_value("8000000").unwrap();
        assert_eq!(absolute.class, RateClass::Absolute);
    }

    #[test]
    fn malformed_values_rejected() {
        assert_eq!(parse_rate_value("  "), Err(RateError::Empty));
        assert!(matches!(parse_rate_value("fast"), Err(RateError::Malformed(_))));
        assert!(matches!(
            parse_rate_value("24X"),
            Err(RateError::BadSuffix { .. })
        ));
        assert!(matches!(parse_rate_value("0"), Err(RateError::NonPositive(_))));
    }

    #[test]
    fn mixed_classes_rejected() {
        let err = validate_rate_inputs(
            QualityMode::Rate,
            Some("24M"),
            Some("0.5"),
            None,
            false,
        )
        .unwrap_err();
        assert_eq!(err, RateError::MixedClasses);
    }

    #[test]
    fn ordering_constraints_enforced() {
        assert_eq!(
            validate_rate_inputs(QualityMode::Rate, Some("8M"), Some("10M"), Some("12M"), false)
                .unwrap_err(),
            RateError::BpsBelowMin
        );
        assert_eq!(
            validate_rate_inputs(QualityMode::Rate, Some("8M"), Some("10M"), Some("9M"), false)
                .unwrap_err(),
            RateError::MinAboveMax
        );
    }

    #[test]
    fn cq_mode_tolerates_values_only_when_allowed() {
        validate_rate_inputs(QualityMode::Cq, Some("24M"), None, None, true)
            .expect("global config keeps rate fields around in cq mode");
        assert_eq!(
            validate_rate_inputs(QualityMode::Cq, Some("24M"), None, None, false).unwrap_err(),
            RateError::ValuesWithoutRateMode
        );
    }

    #[test]
    fn ratio_resolution_uses_source_bitrate() {
        let resolved =
            resolve_rate_control(Some("0.5"), None, None, None, Some(40_000_000.0)).unwrap();
        assert_eq!(resolved.target_bps, 20_000_000);

        let err = resolve_rate_control(Some("0.5"), None, None, None, None).unwrap_err();
        assert_eq!(err, RateError::NoSourceBitrate);
    }

    #[test]
    fn cap_is_a_ceiling() {
        let resolved =
            resolve_rate_control(Some("40M"), None, Some("48M"), Some("24M"), None).unwrap();
        assert_eq!(resolved.target_bps, 24_000_000);
        assert_eq!(resolved.maxrate_bps, Some(24_000_000));

        let untouched =
            resolve_rate_control(Some("8M"), None, None, Some("24M"), None).unwrap();
        assert_eq!(untouched.target_bps, 8_000_000);
    }

    #[test]
    fn format_bps_human_picks_units() {
        assert_eq!(format_bps_human(500), "500 bps");
        assert_eq!(format_bps_human(8_000), "8 kbps");
        assert_eq!(format_bps_human(24_500_000), "24.5 Mbps");
    }

    proptest! {
        // Any suffixed value is absolute; any bare value within the ratio
        // bound is a multiplier; resolution never produces zero.
        #[test]
        fn prop_suffixed_values_are_absolute(
            number in 1u64..100_000u64,
            suffix in prop_oneof![Just("k"), Just("M"), Just("Mbps"), Just("kbps")],
        ) {
            let parsed = parse_rate_value(&format!("{number}{suffix}")).unwrap();
            prop_assert_eq!(parsed.class, RateClass::Absolute);
            prop_assert!(parsed.value > 0.0);
        }

        #[test]
        fn prop_bare_small_values_are_ratios(number in 0.001f64..10.0f64) {
            let parsed = parse_rate_value(&format!("{number:.3}")).unwrap();
            prop_assert_eq!(parsed.class, RateClass::Ratio);
        }

        #[test]
        fn prop_resolution_is_positive(
            target_mbps in 1u64..400u64,
            source_mbps in 1u64..400u64,
        ) {
            let resolved = resolve_rate_control(
                Some(&format!("{target_mbps}M")),
                None,
                None,
                None,
                Some((source_mbps * 1_000_000) as f64),
            ).unwrap();
            prop_assert!(resolved.target_bps >= 1);
            prop_assert_eq!(resolved.target_bps, target_mbps * 1_000_000);
        }
    }
}
