//! Multi-process metric aggregation.
//!
//! Every process owns one snapshot file `{process_id}.json` in the shared
//! directory and rewrites it atomically (temp file + rename), so a reader
//! never sees a torn file and a crashed process leaves its last snapshot in
//! place. Exposition merges all snapshot files: counters and histograms are
//! summed, gauges keep the most recent write.
//!
//! A process that shuts down cleanly folds its snapshot into the shared
//! `compacted.json` and removes its own file, so restarts do not leave one
//! file per past process behind. Folding and exposition reads hold the
//! directory lock (`.lock`). Files of crashed processes stay until the
//! directory is cleared.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::{Family, MetricKind};
use crate::error::MetricsError;

const SNAPSHOT_EXTENSION: &str = "json";

/// Process id of the snapshot holding every retired process
pub const COMPACTED_PROCESS_ID: &str = "compacted";

const LOCK_FILE: &str = ".lock";
const LOCK_RETRY: Duration = Duration::from_millis(5);
// A holder that died mid-fold leaves its lock behind
const STALE_LOCK_AGE: Duration = Duration::from_secs(10);

/// State of one process's registry at a point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub process_id: String,
    /// Wall-clock micros when the snapshot was taken
    pub written_at: i64,
    pub families: Vec<FamilySnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FamilySnapshot {
    pub name: String,
    pub help: String,
    pub kind: MetricKind,
    pub label_names: Vec<String>,
    pub samples: Vec<Sample>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Values in `label_names` order
    pub labels: Vec<String>,
    pub value: SampleValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SampleValue {
    Counter {
        value: f64,
    },
    Gauge {
        value: f64,
        written_at: i64,
    },
    Histogram {
        /// Finite upper bounds with cumulative counts; +Inf is `count`
        buckets: Vec<BucketCount>,
        sum: f64,
        count: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketCount {
    pub upper_bound: f64,
    pub cumulative: u64,
}

/// Exclusive hold on the aggregation directory, released on drop
struct DirLock {
    path: PathBuf,
}

impl DirLock {
    fn acquire(dir: &Path) -> Result<Self, MetricsError> {
        let path = dir.join(LOCK_FILE);
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path) {
                        tracing::warn!(
                            path = %path.display(),
                            "Removing stale metrics directory lock"
                        );
                        let _ = std::fs::remove_file(&path);
                        continue;
                    }
                    std::thread::sleep(LOCK_RETRY);
                }
                Err(e) => return Err(MetricsError::io(&path, e)),
            }
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn lock_is_stale(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .map_or(false, |age| age > STALE_LOCK_AGE)
}

/// The shared aggregation directory, seen from one process
#[derive(Debug)]
pub struct MultiProcessStore {
    dir: PathBuf,
    process_id: String,
    // Set once this process's counts live in the compacted snapshot
    retired: AtomicBool,
}

impl MultiProcessStore {
    /// Open (creating if needed) the shared directory under a fresh process id.
    ///
    /// Process ids are random rather than OS pids: containers sharing a
    /// volume commonly all run as pid 1.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, MetricsError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| MetricsError::io(&dir, e))?;
        Ok(Self {
            dir,
            process_id: uuid::Uuid::new_v4().simple().to_string(),
            retired: AtomicBool::new(false),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    fn snapshot_path(&self, process_id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", process_id, SNAPSHOT_EXTENSION))
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Atomically replace this process's snapshot file.
    ///
    /// A no-op once the process is retired.
    pub fn write(&self, snapshot: &ProcessSnapshot) -> Result<(), MetricsError> {
        let _lock = DirLock::acquire(&self.dir)?;
        if self.is_retired() {
            return Ok(());
        }
        self.write_file(&self.process_id, snapshot)
    }

    fn write_file(
        &self,
        process_id: &str,
        snapshot: &ProcessSnapshot,
    ) -> Result<(), MetricsError> {
        let target = self.snapshot_path(process_id);
        // Dot-prefixed so read_all never picks up a half-written file
        let temp = self.dir.join(format!(".{}.{}.tmp", process_id, self.process_id));
        let body = serde_json::to_vec(snapshot).map_err(|source| MetricsError::Snapshot {
            path: target.clone(),
            source,
        })?;
        std::fs::write(&temp, body).map_err(|e| MetricsError::io(&temp, e))?;
        std::fs::rename(&temp, &target).map_err(|e| MetricsError::io(&target, e))?;
        Ok(())
    }

    /// Fold this process's final snapshot into the compacted snapshot and
    /// remove its own file. Later writes from this process are ignored.
    pub fn retire(&self, snapshot: &ProcessSnapshot) -> Result<(), MetricsError> {
        if self.is_retired() {
            return Ok(());
        }
        let _lock = DirLock::acquire(&self.dir)?;

        let compacted_path = self.snapshot_path(COMPACTED_PROCESS_ID);
        let mut parts = vec![snapshot.clone()];
        match std::fs::read(&compacted_path) {
            Ok(bytes) => parts.push(serde_json::from_slice(&bytes).map_err(|source| {
                MetricsError::Snapshot {
                    path: compacted_path.clone(),
                    source,
                }
            })?),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(MetricsError::io(&compacted_path, e)),
        }

        let folded = ProcessSnapshot {
            process_id: COMPACTED_PROCESS_ID.to_string(),
            written_at: chrono::Utc::now().timestamp_micros(),
            families: merge(&parts),
        };
        self.write_file(COMPACTED_PROCESS_ID, &folded)?;
        self.retired.store(true, Ordering::Release);

        let own = self.snapshot_path(&self.process_id);
        match std::fs::remove_file(&own) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MetricsError::io(&own, e)),
        }
    }

    /// Load every process snapshot in the directory
    pub fn read_all(&self) -> Result<Vec<ProcessSnapshot>, MetricsError> {
        let _lock = DirLock::acquire(&self.dir)?;
        let entries = std::fs::read_dir(&self.dir).map_err(|e| MetricsError::io(&self.dir, e))?;
        let mut snapshots = Vec::new();

        for entry in entries {
            let entry = entry.map_err(|e| MetricsError::io(&self.dir, e))?;
            let path = entry.path();
            let is_snapshot = path.extension().and_then(|e| e.to_str()) == Some(SNAPSHOT_EXTENSION)
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_snapshot {
                continue;
            }

            let bytes = match std::fs::read(&path) {
                Ok(bytes) => bytes,
                // Another process may be replacing its file right now
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(MetricsError::io(&path, e)),
            };
            let snapshot = serde_json::from_slice(&bytes)
                .map_err(|source| MetricsError::Snapshot { path, source })?;
            snapshots.push(snapshot);
        }

        Ok(snapshots)
    }
}

/// Convert gathered prometheus families into a serializable snapshot
pub(crate) fn snapshot_from_gathered(
    process_id: String,
    gathered: &[prometheus::proto::MetricFamily],
    families: &HashMap<String, Family>,
    gauge_writes: &HashMap<(Family, Vec<String>), i64>,
) -> ProcessSnapshot {
    let written_at = chrono::Utc::now().timestamp_micros();
    let mut out = Vec::new();

    for mf in gathered {
        let Some(&family) = families.get(mf.get_name()) else {
            continue;
        };
        let label_names = family.label_names();
        let mut samples = Vec::with_capacity(mf.get_metric().len());

        for metric in mf.get_metric() {
            let labels: Vec<String> = label_names
                .iter()
                .map(|name| {
                    metric
                        .get_label()
                        .iter()
                        .find(|pair| pair.get_name() == *name)
                        .map(|pair| pair.get_value().to_string())
                        .unwrap_or_default()
                })
                .collect();

            let value = match family.kind() {
                MetricKind::Counter => SampleValue::Counter {
                    value: metric.get_counter().get_value(),
                },
                MetricKind::Gauge => SampleValue::Gauge {
                    value: metric.get_gauge().get_value(),
                    written_at: gauge_writes
                        .get(&(family, labels.clone()))
                        .copied()
                        .unwrap_or(0),
                },
                MetricKind::Histogram => {
                    let histogram = metric.get_histogram();
                    SampleValue::Histogram {
                        buckets: histogram
                            .get_bucket()
                            .iter()
                            .filter(|b| b.get_upper_bound().is_finite())
                            .map(|b| BucketCount {
                                upper_bound: b.get_upper_bound(),
                                cumulative: b.get_cumulative_count(),
                            })
                            .collect(),
                        sum: histogram.get_sample_sum(),
                        count: histogram.get_sample_count(),
                    }
                }
            };
            samples.push(Sample { labels, value });
        }

        out.push(FamilySnapshot {
            name: mf.get_name().to_string(),
            help: mf.get_help().to_string(),
            kind: family.kind(),
            label_names: label_names.iter().map(|n| n.to_string()).collect(),
            samples,
        });
    }

    ProcessSnapshot {
        process_id,
        written_at,
        families: out,
    }
}

/// Merge snapshots from all processes into one view, sorted by family name
/// and label values.
pub fn merge(snapshots: &[ProcessSnapshot]) -> Vec<FamilySnapshot> {
    let mut merged: BTreeMap<String, (FamilySnapshot, BTreeMap<Vec<String>, SampleValue>)> =
        BTreeMap::new();

    for snapshot in snapshots {
        for family in &snapshot.families {
            let (meta, series) = merged.entry(family.name.clone()).or_insert_with(|| {
                let meta = FamilySnapshot {
                    samples: Vec::new(),
                    ..family.clone()
                };
                (meta, BTreeMap::new())
            });
            if meta.kind != family.kind || meta.label_names != family.label_names {
                tracing::debug!(
                    family = %family.name,
                    process_id = %snapshot.process_id,
                    "Skipping family with a conflicting schema"
                );
                continue;
            }

            for sample in &family.samples {
                match series.get_mut(&sample.labels) {
                    Some(existing) => combine(existing, &sample.value),
                    None => {
                        series.insert(sample.labels.clone(), sample.value.clone());
                    }
                }
            }
        }
    }

    merged
        .into_values()
        .map(|(mut meta, series)| {
            meta.samples = series
                .into_iter()
                .map(|(labels, value)| Sample { labels, value })
                .collect();
            meta
        })
        .filter(|family| !family.samples.is_empty())
        .collect()
}

fn combine(existing: &mut SampleValue, incoming: &SampleValue) {
    match (existing, incoming) {
        (SampleValue::Counter { value }, SampleValue::Counter { value: other }) => {
            *value += other;
        }
        (
            SampleValue::Gauge { value, written_at },
            SampleValue::Gauge {
                value: other,
                written_at: other_at,
            },
        ) => {
            if *other_at > *written_at {
                *value = *other;
                *written_at = *other_at;
            }
        }
        (
            SampleValue::Histogram {
                buckets,
                sum,
                count,
            },
            SampleValue::Histogram {
                buckets: other_buckets,
                sum: other_sum,
                count: other_count,
            },
        ) => {
            *sum += other_sum;
            *count += other_count;
            for incoming in other_buckets {
                match buckets
                    .iter_mut()
                    .find(|b| b.upper_bound == incoming.upper_bound)
                {
                    Some(bucket) => bucket.cumulative += incoming.cumulative,
                    None => buckets.push(*incoming),
                }
            }
            buckets.sort_by(|a, b| a.upper_bound.total_cmp(&b.upper_bound));
        }
        (existing, incoming) => {
            tracing::debug!(?existing, ?incoming, "Skipping sample with mismatched kind");
        }
    }
}
