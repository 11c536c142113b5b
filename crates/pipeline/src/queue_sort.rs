//! Ordering of the pending queue before submission.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::PathBuf;

use av1_batch_config::{QueueSort, RootPaths};

use crate::domain::VideoFile;

fn name_key(file: &VideoFile) -> (String, String) {
    (file.file_name(), file.path.display().to_string())
}

/// Sort discovered files according to the configured queue mode.
///
/// `extensions` must be the normalized accepted-extension list; it defines
/// the partition order for [`QueueSort::Ext`]. The `rand` mode shuffles a
/// name-sorted list so a fixed seed yields a reproducible order.
pub fn sort_files(
    mut files: Vec<VideoFile>,
    mapping: &[RootPaths],
    mode: QueueSort,
    seed: Option<u64>,
    extensions: &[String],
) -> Vec<VideoFile> {
    match mode {
        QueueSort::Name => {
            files.sort_by_key(name_key);
            files
        }
        QueueSort::SizeAsc => {
            files.sort_by_key(|f| (f.size_bytes, name_key(f)));
            files
        }
        QueueSort::SizeDesc => {
            files.sort_by_key(|f| (std::cmp::Reverse(f.size_bytes), name_key(f)));
            files
        }
        QueueSort::Ext => {
            let order: Vec<String> = extensions.to_vec();
            files.sort_by_key(|f| {
                let ext = f
                    .path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| format!(".{}", e.to_lowercase()))
                    .unwrap_or_default();
                let rank = order
                    .iter()
                    .position(|accepted| accepted == &ext)
                    .unwrap_or(order.len());
                (rank, name_key(f))
            });
            files
        }
        QueueSort::Dir => sort_by_input_root(files, mapping),
        QueueSort::Rand => {
            files.sort_by_key(name_key);
            match seed {
                Some(seed) => {
                    let mut rng = StdRng::seed_from_u64(seed);
                    files.shuffle(&mut rng);
                }
                None => files.shuffle(&mut rand::thread_rng()),
            }
            files
        }
    }
}

/// Group by input root in mapping order; within a root, sort by relative
/// path. Files outside every root go last, name-sorted.
fn sort_by_input_root(files: Vec<VideoFile>, mapping: &[RootPaths]) -> Vec<VideoFile> {
    let mut buckets: Vec<Vec<(PathBuf, VideoFile)>> = vec![Vec::new(); mapping.len()];
    let mut leftovers: Vec<VideoFile> = Vec::new();

    for file in files {
        let mut placed = false;
        for (index, root) in mapping.iter().enumerate() {
            if let Ok(relative) = file.path.strip_prefix(&root.input) {
                buckets[index].push((relative.to_path_buf(), file.clone()));
                placed = true;
                break;
            }
        }
        if !placed {
            leftovers.push(file);
        }
    }

    let mut ordered = Vec::new();
    for mut bucket in buckets {
        bucket.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| name_key(&a.1).cmp(&name_key(&b.1))));
        ordered.extend(bucket.into_iter().map(|(_, file)| file));
    }
    leftovers.sort_by_key(name_key);
    ordered.extend(leftovers);
    ordered
}
