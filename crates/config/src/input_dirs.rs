//! Input-root handling: CLI parsing, limits, and the per-root output and
//! error directory mapping.
//!
//! Each input root is canonicalized once at startup so that files reached
//! through a symlinked root still map to a stable output tree.

use std::path::{Path, PathBuf};

use crate::model::{AppConfig, ConfigError};

pub const MAX_INPUT_DIRS: usize = 50;
pub const MAX_INPUT_DIR_LEN: usize = 150;

/// One input root with its derived output and error roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootPaths {
    pub input: PathBuf,
    pub output: PathBuf,
    pub errors: PathBuf,
}

impl RootPaths {
    /// Leaf name of the output root, used by the scanner for pruning.
    pub fn output_leaf(&self) -> Option<&str> {
        self.output.file_name().and_then(|n| n.to_str())
    }

    /// Leaf name of the error root, used by the scanner for pruning.
    pub fn errors_leaf(&self) -> Option<&str> {
        self.errors.file_name().and_then(|n| n.to_str())
    }
}

fn strip_wrapping_quotes(value: &str) -> &str {
    let trimmed = value.trim();
    if trimmed.len() >= 2 {
        let bytes = trimmed.as_bytes();
        let first = bytes[0];
        if (first == b'"' || first == b'\'') && bytes[bytes.len() - 1] == first {
            return &trimmed[1..trimmed.len() - 1];
        }
    }
    trimmed
}

/// Split a comma-separated CLI argument into cleaned root entries.
pub fn parse_cli_input_dirs(arg: Option<&str>) -> Vec<String> {
    let Some(raw) = arg else {
        return Vec::new();
    };
    raw.split(',')
        .map(strip_wrapping_quotes)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

/// Drop duplicate entries, keeping first occurrences in order.
pub fn dedupe_preserve_order(entries: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    entries
        .into_iter()
        .filter(|entry| seen.insert(entry.clone()))
        .collect()
}

/// Reject pathological root lists before any filesystem work happens.
pub fn validate_input_dir_entries(entries: &[String]) -> Result<(), ConfigError> {
    if entries.is_empty() {
        return Err(ConfigError::Invalid(
            "No input directories given (config input_dirs or CLI argument)".into(),
        ));
    }
    if entries.len() > MAX_INPUT_DIRS {
        return Err(ConfigError::Invalid(format!(
            "Too many input directories ({}). Max {MAX_INPUT_DIRS}.",
            entries.len()
        )));
    }
    if let Some(too_long) = entries.iter().find(|entry| entry.len() > MAX_INPUT_DIR_LEN) {
        return Err(ConfigError::Invalid(format!(
            "Input directory path too long (>{MAX_INPUT_DIR_LEN} chars): {too_long}"
        )));
    }
    Ok(())
}

fn sibling_with_suffix(input: &Path, suffix: &str) -> Result<PathBuf, ConfigError> {
    let name = input
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ConfigError::Invalid(format!("Input root {} has no usable leaf name", input.display())))?;
    Ok(input.with_file_name(format!("{name}{suffix}")))
}

/// Build the input → output/error root mapping for a run.
///
/// Explicit `output_dirs`/`errors_dirs` pair one-to-one with the roots;
/// otherwise the configured suffix is appended to each root's leaf.
/// Roots are canonicalized once here.
pub fn resolve_root_mapping(
    entries: &[String],
    config: &AppConfig,
) -> Result<Vec<RootPaths>, ConfigError> {
    validate_input_dir_entries(entries)?;

    if !config.output_dirs.is_empty() && config.output_dirs.len() != entries.len() {
        return Err(ConfigError::Invalid(format!(
            "output_dirs count ({}) must match input_dirs count ({})",
            config.output_dirs.len(),
            entries.len()
        )));
    }
    if !config.errors_dirs.is_empty() && config.errors_dirs.len() != entries.len() {
        return Err(ConfigError::Invalid(format!(
            "errors_dirs count ({}) must match input_dirs count ({})",
            config.errors_dirs.len(),
            entries.len()
        )));
    }

    let mut mapping = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let raw = PathBuf::from(entry);
        if !raw.is_dir() {
            return Err(ConfigError::Invalid(format!(
                "Input directory does not exist: {}",
                raw.display()
            )));
        }
        let input = raw.canonicalize().map_err(|e| {
            ConfigError::Invalid(format!("Cannot resolve input root {}: {e}", raw.display()))
        })?;

        let output = if let Some(explicit) = config.output_dirs.get(index) {
            PathBuf::from(explicit)
        } else {
            let suffix = config.suffix_output_dirs.as_deref().ok_or_else(|| {
                ConfigError::Invalid("suffix_output_dirs is not set".into())
            })?;
            sibling_with_suffix(&input, suffix)?
        };

        let errors = if let Some(explicit) = config.errors_dirs.get(index) {
            PathBuf::from(explicit)
        } else {
            let suffix = config.suffix_errors_dirs.as_deref().ok_or_else(|| {
                ConfigError::Invalid("suffix_errors_dirs is not set".into())
            })?;
            sibling_with_suffix(&input, suffix)?
        };

        mapping.push(RootPaths { input, output, errors });
    }

    Ok(mapping)
}

/// Find the mapping entry whose input root contains `path`.
pub fn find_root_for<'a>(mapping: &'a [RootPaths], path: &Path) -> Option<&'a RootPaths> {
    mapping.iter().find(|root| path.starts_with(&root.input))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_comma_separated_roots() {
        let roots = parse_cli_input_dirs(Some("/a/videos, '/b/more videos' , ,\"/c\""));
        assert_eq!(roots, vec!["/a/videos", "/b/more videos", "/c"]);
        assert!(parse_cli_input_dirs(None).is_empty());
    }

    #[test]
    fn dedupe_keeps_first_occurrence() {
        let deduped = dedupe_preserve_order(vec![
            "/a".to_string(),
            "/b".to_string(),
            "/a".to_string(),
        ]);
        assert_eq!(deduped, vec!["/a", "/b"]);
    }

    #[test]
    fn rejects_oversized_entry_lists() {
        let entries: Vec<String> = (0..=MAX_INPUT_DIRS).map(|i| format!("/root{i}")).collect();
        assert!(validate_input_dir_entries(&entries).is_err());

        let long = vec!["x".repeat(MAX_INPUT_DIR_LEN + 1)];
        assert!(validate_input_dir_entries(&long).is_err());

        assert!(validate_input_dir_entries(&[]).is_err());
    }

    #[test]
    fn suffix_mode_derives_sibling_roots() {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("shoots");
        std::fs::create_dir(&input).unwrap();

        let config = AppConfig::default();
        let mapping =
            resolve_root_mapping(&[input.to_string_lossy().into_owned()], &config).unwrap();

        assert_eq!(mapping.len(), 1);
        let root = &mapping[0];
        assert_eq!(root.output.file_name().unwrap().to_str().unwrap(), "shoots_out");
        assert_eq!(root.errors.file_name().unwrap().to_str().unwrap(), "shoots_err");
        assert_eq!(root.output_leaf(), Some("shoots_out"));
    }

    #[test]
    fn explicit_mode_requires_matching_counts() {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("in");
        std::fs::create_dir(&input).unwrap();

        let mut config = AppConfig::default();
        config.suffix_output_dirs = None;
        config.output_dirs = vec!["/data/out-a".into(), "/data/out-b".into()];

        let err =
            resolve_root_mapping(&[input.to_string_lossy().into_owned()], &config).unwrap_err();
        assert!(err.to_string().contains("must match"));
    }

    #[test]
    fn missing_root_is_an_error() {
        let config = AppConfig::default();
        let err = resolve_root_mapping(&["/definitely/not/here".to_string()], &config).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn find_root_matches_prefix() {
        let mapping = vec![RootPaths {
            input: PathBuf::from("/data/videos"),
            output: PathBuf::from("/data/videos_out"),
            errors: PathBuf::from("/data/videos_err"),
        }];
        assert!(find_root_for(&mapping, Path::new("/data/videos/trip/a.mp4")).is_some());
        assert!(find_root_for(&mapping, Path::new("/data/other/a.mp4")).is_none());
    }
}
