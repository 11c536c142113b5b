//! Thread-safe metadata cache keyed by source path.
//!
//! Entries are only ever inserted, never mutated, so a cached value can be
//! shared freely. A one-shot failure ledger keeps corrupted files from
//! being probed over and over.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::domain::VideoMetadata;

/// Coarse-lock insert-or-get cache. The adapters behind it dominate
/// latency, so one mutex is plenty.
#[derive(Debug, Default)]
pub struct MetadataCache {
    inner: Mutex<CacheState>,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<PathBuf, Arc<VideoMetadata>>,
    failed: HashSet<PathBuf>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &Path) -> Option<Arc<VideoMetadata>> {
        self.inner
            .lock()
            .expect("metadata cache lock")
            .entries
            .get(path)
            .cloned()
    }

    /// Insert a resolved value; an existing entry wins (first writer keeps
    /// the monotonic guarantee under racing workers).
    pub fn insert(&self, path: PathBuf, metadata: Arc<VideoMetadata>) -> Arc<VideoMetadata> {
        let mut state = self.inner.lock().expect("metadata cache lock");
        state.failed.remove(&path);
        state.entries.entry(path).or_insert(metadata).clone()
    }

    /// Record that extraction failed for a path; at most one attempt is
    /// retried.
    pub fn record_failure(&self, path: PathBuf) {
        self.inner
            .lock()
            .expect("metadata cache lock")
            .failed
            .insert(path);
    }

    pub fn has_failed(&self, path: &Path) -> bool {
        self.inner
            .lock()
            .expect("metadata cache lock")
            .failed
            .contains(path)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("metadata cache lock").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(codec: &str) -> Arc<VideoMetadata> {
        Arc::new(VideoMetadata {
            codec: codec.into(),
            ..Default::default()
        })
    }

    #[test]
    fn insert_then_get() {
        let cache = MetadataCache::new();
        let path = PathBuf::from("/in/a.mp4");
        assert!(cache.get(&path).is_none());

        cache.insert(path.clone(), metadata("hevc"));
        assert_eq!(cache.get(&path).unwrap().codec, "hevc");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn first_insert_wins() {
        let cache = MetadataCache::new();
        let path = PathBuf::from("/in/a.mp4");
        cache.insert(path.clone(), metadata("hevc"));
        let kept = cache.insert(path.clone(), metadata("h264"));
        assert_eq!(kept.codec, "hevc");
        assert_eq!(cache.get(&path).unwrap().codec, "hevc");
    }

    #[test]
    fn failure_ledger_is_cleared_by_success() {
        let cache = MetadataCache::new();
        let path = PathBuf::from("/in/bad.mp4");
        cache.record_failure(path.clone());
        assert!(cache.has_failed(&path));

        cache.insert(path.clone(), metadata("h264"));
        assert!(!cache.has_failed(&path));
    }
}
