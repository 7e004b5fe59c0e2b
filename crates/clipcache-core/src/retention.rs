//! Size and age bounds for the clip directory.
//!
//! The index and its running byte total live behind one async mutex that is
//! held across file deletion, so no caller ever sees the total decremented for
//! a file that is still on disk (or the reverse).

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::key::CacheKey;

const RECENCY_WEIGHT: f64 = 100.0;
const RECENCY_HALF_LIFE_HOURS: f64 = 12.0;
const FREQUENCY_POINTS_PER_ACCESS: f64 = 2.5;
const FREQUENCY_CAP: f64 = 50.0;
const SMALL_FILE_BONUS: f64 = 10.0;
const SMALL_FILE_REFERENCE_BYTES: f64 = 50.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Serialize)]
pub struct CacheEntryMetadata {
    pub filename: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    pub priority_score: f64,
    pub camera_id: u32,
    pub timestamp: i64,
}

impl CacheEntryMetadata {
    pub fn new(key: &CacheKey, size_bytes: u64, now: DateTime<Utc>) -> Self {
        let mut entry = Self {
            filename: key.as_str().to_string(),
            size_bytes,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            priority_score: 0.0,
            camera_id: key.camera_id(),
            timestamp: key.timestamp(),
        };
        entry.priority_score = priority_score(&entry, now);
        entry
    }
}

/// Higher means more worth keeping: recency decays with a twelve hour
/// half-life, frequency is capped, and small files get a slight bonus.
pub fn priority_score(entry: &CacheEntryMetadata, now: DateTime<Utc>) -> f64 {
    let idle_hours = (now - entry.last_accessed_at).num_seconds().max(0) as f64 / 3600.0;
    let recency = RECENCY_WEIGHT * 0.5f64.powf(idle_hours / RECENCY_HALF_LIFE_HOURS);
    let frequency = (entry.access_count as f64 * FREQUENCY_POINTS_PER_ACCESS).min(FREQUENCY_CAP);
    let small_file =
        SMALL_FILE_BONUS * (1.0 - entry.size_bytes as f64 / SMALL_FILE_REFERENCE_BYTES).clamp(0.0, 1.0);
    recency + frequency + small_file
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct EvictionReport {
    pub evicted: Vec<String>,
    pub expired: Vec<String>,
    pub orphaned: Vec<String>,
    pub bytes_freed: u64,
}

impl EvictionReport {
    pub fn is_empty(&self) -> bool {
        self.evicted.is_empty() && self.expired.is_empty() && self.orphaned.is_empty()
    }

    fn merge(&mut self, other: EvictionReport) {
        self.evicted.extend(other.evicted);
        self.expired.extend(other.expired);
        self.orphaned.extend(other.orphaned);
        self.bytes_freed += other.bytes_freed;
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ScanReport {
    pub registered: usize,
    pub registered_bytes: u64,
    pub removed_partials: usize,
    pub ignored: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetentionSnapshot {
    pub entries: usize,
    pub total_bytes: u64,
    pub max_entries: usize,
    pub max_bytes: u64,
}

#[derive(Default)]
struct RetentionIndex {
    entries: HashMap<String, CacheEntryMetadata>,
    total_bytes: u64,
}

impl RetentionIndex {
    fn insert(&mut self, entry: CacheEntryMetadata) {
        if let Some(previous) = self.entries.remove(&entry.filename) {
            self.total_bytes = self.total_bytes.saturating_sub(previous.size_bytes);
        }
        self.total_bytes = self.total_bytes.saturating_add(entry.size_bytes);
        self.entries.insert(entry.filename.clone(), entry);
    }

    fn take(&mut self, filename: &str) -> Option<CacheEntryMetadata> {
        let entry = self.entries.remove(filename)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    fn lowest_priority(
        &self,
        now: DateTime<Utc>,
        skip: &HashSet<String>,
    ) -> Option<String> {
        self.entries
            .values()
            .filter(|entry| !skip.contains(&entry.filename))
            .map(|entry| (priority_score(entry, now), entry))
            .min_by(|(a_score, a), (b_score, b)| {
                a_score
                    .total_cmp(b_score)
                    .then(a.last_accessed_at.cmp(&b.last_accessed_at))
            })
            .map(|(_, entry)| entry.filename.clone())
    }
}

pub struct RetentionManager {
    root: PathBuf,
    max_bytes: u64,
    max_entries: usize,
    ttl: chrono::Duration,
    safety_margin_bytes: u64,
    index: Mutex<RetentionIndex>,
}

impl RetentionManager {
    pub fn new(root: impl Into<PathBuf>, config: &CacheConfig) -> Self {
        let ttl = chrono::Duration::from_std(config.entry_ttl())
            .unwrap_or_else(|_| chrono::Duration::days(7));
        Self {
            root: root.into(),
            max_bytes: config.max_bytes,
            max_entries: config.max_entries.max(1),
            ttl,
            safety_margin_bytes: config.safety_margin_bytes,
            index: Mutex::new(RetentionIndex::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Register a finished clip, then evict others if the budgets are exceeded.
    pub async fn on_add(&self, entry: CacheEntryMetadata) -> EvictionReport {
        let mut index = self.index.lock().await;
        let filename = entry.filename.clone();
        debug!(file = %filename, bytes = entry.size_bytes, "cache entry added");
        index.insert(entry);
        let keep = HashSet::from([filename]);
        self.shrink_locked(&mut index, 0, 0, keep, Utc::now()).await
    }

    pub async fn on_access(&self, filename: &str) -> bool {
        self.on_access_at(filename, Utc::now()).await
    }

    async fn on_access_at(&self, filename: &str, now: DateTime<Utc>) -> bool {
        let mut index = self.index.lock().await;
        let Some(entry) = index.entries.get_mut(filename) else {
            return false;
        };
        entry.last_accessed_at = now;
        entry.access_count = entry.access_count.saturating_add(1);
        entry.priority_score = priority_score(entry, now);
        true
    }

    /// Make room for an incoming clip of `needed_bytes` (plus the safety margin)
    /// and one more entry, evicting the lowest-priority clips first.
    pub async fn ensure_space(&self, needed_bytes: u64) -> EvictionReport {
        let mut index = self.index.lock().await;
        let needed = needed_bytes.saturating_add(self.safety_margin_bytes);
        self.shrink_locked(&mut index, needed, 1, HashSet::new(), Utc::now())
            .await
    }

    pub async fn run_periodic_sweep(&self) -> EvictionReport {
        self.sweep_at(Utc::now()).await
    }

    async fn sweep_at(&self, now: DateTime<Utc>) -> EvictionReport {
        let mut index = self.index.lock().await;
        let mut report = EvictionReport::default();

        let expired: Vec<String> = index
            .entries
            .values()
            .filter(|entry| now - entry.created_at > self.ttl)
            .map(|entry| entry.filename.clone())
            .collect();
        for filename in expired {
            if let Some(bytes) = self.delete_locked(&mut index, &filename).await {
                report.bytes_freed += bytes;
                report.expired.push(filename);
            }
        }

        let tracked: Vec<String> = index.entries.keys().cloned().collect();
        for filename in tracked {
            if let Ok(false) = fs::try_exists(self.root.join(&filename)).await {
                if index.take(&filename).is_some() {
                    warn!(file = %filename, "cache file vanished; dropping its metadata");
                    report.orphaned.push(filename);
                }
            }
        }

        let budget = self.shrink_locked(&mut index, 0, 0, HashSet::new(), now).await;
        report.merge(budget);
        if !report.is_empty() {
            info!(
                expired = report.expired.len(),
                evicted = report.evicted.len(),
                orphaned = report.orphaned.len(),
                bytes_freed = report.bytes_freed,
                total_bytes = index.total_bytes,
                "cache sweep finished"
            );
        }
        report
    }

    /// Register clips already present in the cache directory and delete
    /// partial downloads left behind by an earlier process.
    pub async fn scan_existing(&self) -> std::io::Result<ScanReport> {
        fs::create_dir_all(&self.root).await?;
        let mut report = ScanReport::default();
        let mut dir = fs::read_dir(&self.root).await?;
        let mut found = Vec::new();
        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name().to_string_lossy().into_owned();
            if name.ends_with(".part") {
                match fs::remove_file(item.path()).await {
                    Ok(()) => report.removed_partials += 1,
                    Err(err) => warn!(file = %name, error = %err, "failed to remove stale partial"),
                }
                continue;
            }
            let Ok(key) = CacheKey::parse(&name) else {
                report.ignored += 1;
                continue;
            };
            let meta = match item.metadata().await {
                Ok(meta) if meta.is_file() => meta,
                _ => {
                    report.ignored += 1;
                    continue;
                }
            };
            let modified: DateTime<Utc> = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            let mut entry = CacheEntryMetadata::new(&key, meta.len(), modified);
            entry.priority_score = priority_score(&entry, Utc::now());
            report.registered += 1;
            report.registered_bytes += meta.len();
            found.push(entry);
        }

        let mut index = self.index.lock().await;
        for entry in found {
            index.insert(entry);
        }
        info!(
            root = %self.root.display(),
            registered = report.registered,
            bytes = report.registered_bytes,
            removed_partials = report.removed_partials,
            "cache directory scanned"
        );
        Ok(report)
    }

    pub async fn contains(&self, filename: &str) -> bool {
        self.index.lock().await.entries.contains_key(filename)
    }

    pub async fn entry(&self, filename: &str) -> Option<CacheEntryMetadata> {
        self.index.lock().await.entries.get(filename).cloned()
    }

    pub async fn total_bytes(&self) -> u64 {
        self.index.lock().await.total_bytes
    }

    pub async fn snapshot(&self) -> RetentionSnapshot {
        let index = self.index.lock().await;
        RetentionSnapshot {
            entries: index.entries.len(),
            total_bytes: index.total_bytes,
            max_entries: self.max_entries,
            max_bytes: self.max_bytes,
        }
    }

    fn over_budget(&self, index: &RetentionIndex, needed: u64, incoming: usize) -> bool {
        index.total_bytes.saturating_add(needed) > self.max_bytes
            || index.entries.len() + incoming > self.max_entries
    }

    async fn shrink_locked(
        &self,
        index: &mut RetentionIndex,
        needed: u64,
        incoming: usize,
        mut skip: HashSet<String>,
        now: DateTime<Utc>,
    ) -> EvictionReport {
        let mut report = EvictionReport::default();
        while self.over_budget(index, needed, incoming) {
            let Some(victim) = index.lowest_priority(now, &skip) else {
                break;
            };
            match self.delete_locked(index, &victim).await {
                Some(bytes) => {
                    debug!(file = %victim, bytes, "evicted cache entry");
                    report.bytes_freed += bytes;
                    report.evicted.push(victim);
                }
                None => {
                    skip.insert(victim);
                }
            }
        }
        report
    }

    /// Delete the backing file and its metadata together. A file that cannot
    /// be removed keeps its metadata so the index never loses track of it.
    async fn delete_locked(&self, index: &mut RetentionIndex, filename: &str) -> Option<u64> {
        if !index.entries.contains_key(filename) {
            return None;
        }
        match fs::remove_file(self.root.join(filename)).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                warn!(file = %filename, error = %err, "failed to delete cache file");
                return None;
            }
        }
        index.take(filename).map(|entry| entry.size_bytes)
    }
}
