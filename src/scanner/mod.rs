//! Cache usage scanner.
//!
//! Walks the tile cache root on demand and reports size and file count per
//! top-level bucket directory. Nothing is cached between scans: every call
//! recomputes from disk. Per-entry failures (a tile removed mid-scan, a
//! permission error) drop that entry from the totals instead of failing the
//! whole scan.

use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};

use crate::constants::DEFAULT_LOCK_DIR_NAME;

/// Usage of one top-level cache directory at scan time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheBucketSnapshot {
    pub name: String,
    pub total_bytes: u64,
    pub tile_count: u64,
}

#[derive(Debug, Clone)]
pub struct CacheUsageScanner {
    root: PathBuf,
    excluded: String,
}

impl CacheUsageScanner {
    pub fn new(root: impl Into<PathBuf>, lock_dir_name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            excluded: lock_dir_name.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scan every bucket under the root, sorted by bucket name.
    ///
    /// A missing or non-directory root yields an empty result.
    pub fn scan(&self) -> Vec<CacheBucketSnapshot> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(root = %self.root.display(), error = %e, "Cache root not readable");
                return Vec::new();
            }
        };

        let buckets: Vec<(String, PathBuf)> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|entry| (entry.file_name().to_string_lossy().into_owned(), entry.path()))
            .filter(|(name, _)| *name != self.excluded)
            .collect();

        let mut snapshots: Vec<CacheBucketSnapshot> = buckets
            .into_par_iter()
            .map(|(name, path)| {
                let (total_bytes, tile_count) = walk(&path);
                CacheBucketSnapshot {
                    name,
                    total_bytes,
                    tile_count,
                }
            })
            .collect();

        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}

/// Scan `root` excluding the default lock directory
pub fn scan(root: impl AsRef<Path>) -> Vec<CacheBucketSnapshot> {
    CacheUsageScanner::new(root.as_ref(), DEFAULT_LOCK_DIR_NAME).scan()
}

// Returns (bytes, files) under `dir`. Symlinks are not followed.
fn walk(dir: &Path) -> (u64, u64) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return (0, 0),
    };

    let mut bytes = 0u64;
    let mut files = 0u64;
    for entry in entries.filter_map(Result::ok) {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            let (sub_bytes, sub_files) = walk(&entry.path());
            bytes += sub_bytes;
            files += sub_files;
        } else if file_type.is_file() {
            // File may vanish between listing and stat
            if let Ok(metadata) = entry.metadata() {
                bytes += metadata.len();
                files += 1;
            }
        }
    }
    (bytes, files)
}
