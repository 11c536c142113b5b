//! Recursive discovery of candidate video files under one input root.
//!
//! Traversal is depth-first with lexicographic order inside each directory,
//! so two scans of an unchanged tree yield the same sequence. Directories
//! whose name matches the root's configured output or error leaf are pruned.
//! File symlinks are followed; directory-symlink cycles are detected by the
//! walker and skipped.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::domain::VideoFile;

/// One observation from the scanner.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanItem {
    /// Passed the extension and size filters.
    Accepted(VideoFile),
    /// Matching extension but below the minimum size.
    IgnoredSmall(PathBuf),
    /// Regular file with an extension outside the accepted set.
    IgnoredWrongExt(PathBuf),
}

/// Extension- and size-filtered recursive scanner.
#[derive(Debug, Clone)]
pub struct Scanner {
    extensions: Vec<String>,
    min_size_bytes: u64,
}

impl Scanner {
    /// `extensions` are normalized to lowercase with a leading dot.
    pub fn new(extensions: &[String], min_size_bytes: u64) -> Self {
        let extensions = extensions
            .iter()
            .map(|ext| {
                let lower = ext.to_lowercase();
                if lower.starts_with('.') {
                    lower
                } else {
                    format!(".{lower}")
                }
            })
            .collect();
        Self {
            extensions,
            min_size_bytes,
        }
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    pub fn min_size_bytes(&self) -> u64 {
        self.min_size_bytes
    }

    fn matches_extension(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        let dotted = format!(".{}", ext.to_lowercase());
        self.extensions.iter().any(|accepted| accepted == &dotted)
    }

    /// Lazily walk one input root.
    ///
    /// `prune_leaves` carries the output- and error-root leaf names for this
    /// root; any directory with one of those names is not descended into.
    pub fn scan<'a>(
        &'a self,
        root: &Path,
        prune_leaves: &[String],
    ) -> impl Iterator<Item = ScanItem> + 'a {
        let prune: HashSet<String> = prune_leaves.iter().cloned().collect();

        WalkDir::new(root)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| {
                if entry.depth() > 0 && entry.file_type().is_dir() {
                    if let Some(name) = entry.file_name().to_str() {
                        if prune.contains(name) {
                            return false;
                        }
                    }
                }
                true
            })
            .filter_map(|entry| entry.ok())
            .filter_map(move |entry| {
                if !entry.file_type().is_file() {
                    return None;
                }
                let path = entry.path().to_path_buf();
                if !self.matches_extension(&path) {
                    return Some(ScanItem::IgnoredWrongExt(path));
                }
                let size = match entry.metadata() {
                    Ok(metadata) => metadata.len(),
                    // Unreadable files are silently skipped, matching the
                    // stat-failure behavior of the discovery pass.
                    Err(_) => return None,
                };
                if size < self.min_size_bytes {
                    return Some(ScanItem::IgnoredSmall(path));
                }
                Some(ScanItem::Accepted(VideoFile::new(path, size)))
            })
    }

    /// Only the accepted files from a scan.
    pub fn scan_accepted<'a>(
        &'a self,
        root: &Path,
        prune_leaves: &[String],
    ) -> impl Iterator<Item = VideoFile> + 'a {
        self.scan(root, prune_leaves).filter_map(|item| match item {
            ScanItem::Accepted(file) => Some(file),
            _ => None,
        })
    }
}
