//! Helpers over the configured encoder argument lists.
//!
//! Encoder args are stored as `"flag value"` strings (e.g. `"-cq 45"`), the
//! shape they take in the YAML document. These helpers select the active
//! list, inspect or rewrite the quality flag, and derive the output
//! container from a `-f` entry.

use crate::model::AppConfig;

/// Select the active encoder argument list for the given mode.
pub fn select_encoder_args(config: &AppConfig, use_gpu: bool) -> &[String] {
    if use_gpu {
        if config.gpu_encoder.advanced {
            &config.gpu_encoder.advanced_args
        } else {
            &config.gpu_encoder.common_args
        }
    } else if config.cpu_encoder.advanced {
        &config.cpu_encoder.advanced_args
    } else {
        &config.cpu_encoder.common_args
    }
}

fn split_entry(entry: &str) -> Option<(&str, &str)> {
    let trimmed = entry.trim();
    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let flag = parts.next()?;
    let value = parts.next()?.trim();
    Some((flag, value))
}

/// The quality flag used by the argument list (`-cq` or `-crf`), if any.
pub fn extract_quality_flag(args: &[String]) -> Option<&'static str> {
    for entry in args {
        match split_entry(entry) {
            Some(("-cq", _)) => return Some("-cq"),
            Some(("-crf", _)) => return Some("-crf"),
            _ => {}
        }
    }
    None
}

/// The baseline quality index carried by the argument list, if any.
pub fn extract_quality_value(args: &[String]) -> Option<u8> {
    for entry in args {
        if let Some((flag, value)) = split_entry(entry) {
            if flag == "-cq" || flag == "-crf" {
                return value.parse().ok();
            }
        }
    }
    None
}

/// Rewrite the quality entry to the given index, leaving other args alone.
pub fn replace_quality_value(args: &[String], quality: u8) -> Vec<String> {
    args.iter()
        .map(|entry| match split_entry(entry) {
            Some((flag @ ("-cq" | "-crf"), _)) => format!("{flag} {quality}"),
            _ => entry.clone(),
        })
        .collect()
}

/// Output file extension derived from the `-f` entry (default `.mp4`).
pub fn output_extension_for_args(args: &[String]) -> &'static str {
    for entry in args {
        if let Some(("-f", value)) = split_entry(entry) {
            return match value {
                "matroska" => ".mkv",
                "mov" => ".mov",
                _ => ".mp4",
            };
        }
    }
    ".mp4"
}

/// Container format name passed to the transcoder `-f` flag (default `mp4`).
pub fn container_for_args(args: &[String]) -> String {
    for entry in args {
        if let Some(("-f", value)) = split_entry(entry) {
            return value.to_string();
        }
    }
    "mp4".to_string()
}

/// Human label for the encoder selected by the argument list.
pub fn infer_encoder_label(args: &[String], use_gpu: bool) -> String {
    for entry in args {
        if let Some(("-c:v", value)) = split_entry(entry) {
            return value.to_string();
        }
    }
    if use_gpu {
        "av1_nvenc".to_string()
    } else {
        "libsvtav1".to_string()
    }
}
