//! Post-run relocation of error markers and their source files into the
//! error roots, preserving the relative tree.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use walkdir::WalkDir;

use av1_batch_config::RootPaths;

use crate::bus::EventBus;
use crate::events::Event;

/// Above this many markers, relocation requires operator confirmation.
pub const CONFIRMATION_THRESHOLD: usize = 100;

/// Result of the post-run relocation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    /// Markers (and found sources) were relocated.
    Moved { markers: usize, sources: usize },
    /// Too many markers and no confirmation; nothing was touched.
    NeedsConfirmation { markers: usize },
}

/// One marker found under an output root.
#[derive(Debug, Clone)]
struct ErrorEntry {
    marker: PathBuf,
    relative: PathBuf,
}

fn collect_markers(output_root: &Path) -> Vec<ErrorEntry> {
    if !output_root.is_dir() {
        return Vec::new();
    }
    let mut entries: Vec<ErrorEntry> = WalkDir::new(output_root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("err"))
                .unwrap_or(false)
        })
        .filter_map(|entry| {
            let relative = entry.path().strip_prefix(output_root).ok()?.to_path_buf();
            Some(ErrorEntry {
                marker: entry.into_path(),
                relative,
            })
        })
        .collect();
    entries.sort_by(|a, b| a.marker.cmp(&b.marker));
    entries
}

/// Locate the source file a marker refers to.
///
/// The marker's relative path carries the output stem; the source keeps the
/// same stem under the input root but with one of the accepted extensions.
fn find_source_for_marker(
    input_root: &Path,
    relative_marker: &Path,
    extensions: &[String],
) -> Option<PathBuf> {
    let stem_relative = relative_marker.with_extension("");
    let parent = input_root.join(stem_relative.parent().unwrap_or(Path::new("")));
    let stem = stem_relative.file_name()?.to_str()?.to_string();

    if !parent.is_dir() {
        return None;
    }

    let mut candidates: Vec<PathBuf> = std::fs::read_dir(&parent)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_stem()
                .and_then(|s| s.to_str())
                .map(|s| s.eq_ignore_ascii_case(&stem))
                .unwrap_or(false)
        })
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .map(|e| {
                    let dotted = format!(".{}", e.to_lowercase());
                    extensions.iter().any(|accepted| accepted == &dotted)
                })
                .unwrap_or(false)
        })
        .collect();

    candidates.sort();
    candidates.into_iter().next()
}

fn move_preserving_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        // Rename fails across filesystems; fall back to copy + remove.
        Err(_) => {
            std::fs::copy(from, to)?;
            std::fs::remove_file(from)
        }
    }
}

/// Relocate every marker under the output roots (and the source file each
/// one refers to) into the matching error root.
///
/// `extensions` must be normalized (lowercase, leading dot). When more than
/// [`CONFIRMATION_THRESHOLD`] markers are present and `confirmed` is false,
/// nothing is touched: a pause request goes out on the bus and the caller
/// decides (non-interactive policy: warn and skip).
pub fn move_failed_files(
    mapping: &[RootPaths],
    extensions: &[String],
    confirmed: bool,
    bus: Option<&Arc<EventBus>>,
) -> MoveOutcome {
    let per_root: Vec<(usize, Vec<ErrorEntry>)> = mapping
        .iter()
        .enumerate()
        .map(|(index, root)| (index, collect_markers(&root.output)))
        .collect();
    let total: usize = per_root.iter().map(|(_, entries)| entries.len()).sum();

    if total == 0 {
        return MoveOutcome::Moved {
            markers: 0,
            sources: 0,
        };
    }

    if total > CONFIRMATION_THRESHOLD && !confirmed {
        warn!(
            "{total} error markers found (threshold {CONFIRMATION_THRESHOLD}); \
             skipping relocation without confirmation"
        );
        if let Some(bus) = bus {
            bus.publish(Event::PauseRequested {
                reason: format!("{total} error markers await relocation"),
            });
        }
        return MoveOutcome::NeedsConfirmation { markers: total };
    }

    info!("Relocating {total} failed files to error directories");
    let mut markers_moved = 0;
    let mut sources_moved = 0;

    for (index, entries) in per_root {
        let root = &mapping[index];
        for entry in entries {
            let dest_marker = root.errors.join(&entry.relative);
            if entry.marker != dest_marker {
                match move_preserving_tree(&entry.marker, &dest_marker) {
                    Ok(()) => markers_moved += 1,
                    Err(e) => {
                        warn!("Failed to move marker {}: {e}", entry.marker.display());
                        continue;
                    }
                }
            }

            match find_source_for_marker(&root.input, &entry.relative, extensions) {
                Some(source) => {
                    let rel_source = source
                        .strip_prefix(&root.input)
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|_| entry.relative.clone());
                    let dest_source = root.errors.join(rel_source);
                    match move_preserving_tree(&source, &dest_source) {
                        Ok(()) => sources_moved += 1,
                        Err(e) => warn!("Failed to move source {}: {e}", source.display()),
                    }
                }
                None => warn!(
                    "Failed source file not found for {}",
                    entry.relative.display()
                ),
            }
        }
    }

    info!("Failed file relocation finished ({markers_moved} markers, {sources_moved} sources)");
    MoveOutcome::Moved {
        markers: markers_moved,
        sources: sources_moved,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn setup() -> (TempDir, Vec<RootPaths>) {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("in");
        let output = tmp.path().join("in_out");
        let errors = tmp.path().join("in_err");
        std::fs::create_dir_all(&input).unwrap();
        std::fs::create_dir_all(&output).unwrap();
        let mapping = vec![RootPaths {
            input,
            output,
            errors,
        }];
        (tmp, mapping)
    }

    #[test]
    fn relocates_marker_and_source_preserving_tree() {
        let (_tmp, mapping) = setup();
        let root = &mapping[0];
        touch(&root.input.join("trip/clip.mov"), "source");
        touch(&root.output.join("trip/clip.err"), "corrupted");

        let outcome = move_failed_files(&mapping, &[".mov".to_string()], false, None);
        assert_eq!(
            outcome,
            MoveOutcome::Moved {
                markers: 1,
                sources: 1
            }
        );
        assert!(root.errors.join("trip/clip.err").exists());
        assert!(root.errors.join("trip/clip.mov").exists());
        assert!(!root.input.join("trip/clip.mov").exists());
        assert!(!root.output.join("trip/clip.err").exists());
    }

    #[test]
    fn source_lookup_matches_stem_case_insensitively() {
        let (_tmp, mapping) = setup();
        let root = &mapping[0];
        touch(&root.input.join("CLIP.MOV"), "source");
        touch(&root.output.join("clip.err"), "failed");

        let outcome = move_failed_files(&mapping, &[".mov".to_string()], false, None);
        assert_eq!(
            outcome,
            MoveOutcome::Moved {
                markers: 1,
                sources: 1
            }
        );
        assert!(root.errors.join("CLIP.MOV").exists());
    }

    #[test]
    fn missing_source_still_moves_marker() {
        let (_tmp, mapping) = setup();
        let root = &mapping[0];
        touch(&root.output.join("gone.err"), "failed");

        let outcome = move_failed_files(&mapping, &[".mov".to_string()], false, None);
        assert_eq!(
            outcome,
            MoveOutcome::Moved {
                markers: 1,
                sources: 0
            }
        );
        assert!(root.errors.join("gone.err").exists());
    }

    #[test]
    fn over_threshold_requires_confirmation() {
        let (_tmp, mapping) = setup();
        let root = &mapping[0];
        for index in 0..=CONFIRMATION_THRESHOLD {
            touch(&root.output.join(format!("clip{index}.err")), "failed");
        }

        let outcome = move_failed_files(&mapping, &[".mov".to_string()], false, None);
        assert_eq!(
            outcome,
            MoveOutcome::NeedsConfirmation {
                markers: CONFIRMATION_THRESHOLD + 1
            }
        );
        // Nothing moved without confirmation.
        assert!(root.output.join("clip0.err").exists());

        let outcome = move_failed_files(&mapping, &[".mov".to_string()], true, None);
        assert!(matches!(outcome, MoveOutcome::Moved { markers, .. } if markers > 0));
    }

    #[test]
    fn empty_output_root_is_a_noop() {
        let (_tmp, mapping) = setup();
        let outcome = move_failed_files(&mapping, &[".mov".to_string()], false, None);
        assert_eq!(
            outcome,
            MoveOutcome::Moved {
                markers: 0,
                sources: 0
            }
        );
    }
}
