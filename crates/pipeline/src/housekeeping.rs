//! Pre-run cleanup of temporary files and error markers.

use std::path::Path;
use tracing::{info, warn};
use walkdir::WalkDir;

/// Result of the pre-run sweep over one output root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub tmp_removed: usize,
    pub markers_removed: usize,
    pub markers_found: usize,
}

fn files_with_extension<'a>(
    root: &Path,
    extension: &'a str,
) -> impl Iterator<Item = std::path::PathBuf> + 'a {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(move |path| {
            path.extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case(extension))
                .unwrap_or(false)
        })
}

/// Delete stale `.tmp` partial outputs under a root.
pub fn cleanup_tmp_files(root: &Path) -> usize {
    if !root.is_dir() {
        return 0;
    }
    let mut removed = 0;
    for path in files_with_extension(root, "tmp") {
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to remove stale tmp {}: {e}", path.display()),
        }
    }
    removed
}

/// Delete every `.err` marker under a root.
pub fn cleanup_error_markers(root: &Path) -> usize {
    if !root.is_dir() {
        return 0;
    }
    let mut removed = 0;
    for path in files_with_extension(root, "err") {
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to remove error marker {}: {e}", path.display()),
        }
    }
    removed
}

/// Count `.err` markers under a root without touching them.
pub fn count_error_markers(root: &Path) -> usize {
    if !root.is_dir() {
        return 0;
    }
    files_with_extension(root, "err").count()
}

/// Pre-run housekeeping for one output root: always drop `.tmp` leftovers;
/// drop or count markers depending on clean-errors.
pub fn pre_run_sweep(output_root: &Path, clean_errors: bool) -> SweepReport {
    let tmp_removed = cleanup_tmp_files(output_root);
    let (markers_removed, markers_found) = if clean_errors {
        (cleanup_error_markers(output_root), 0)
    } else {
        (0, count_error_markers(output_root))
    };

    if tmp_removed > 0 || markers_removed > 0 {
        info!(
            "Housekeeping for {}: removed {tmp_removed} tmp files, {markers_removed} error markers",
            output_root.display()
        );
    }

    SweepReport {
        tmp_removed,
        markers_removed,
        markers_found,
    }
}
