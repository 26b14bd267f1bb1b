use std::collections::VecDeque;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::Reading;

const HISTORY_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("io error on {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct HistoryFile {
    version: u32,
    readings: Vec<Reading>,
}

/// Sole owner and writer of the retained reading series.
///
/// Append and prune share one lock so two concurrent monitoring cycles can
/// never interleave inside a single growth step. Every other component works
/// on cloned snapshots.
#[derive(Debug)]
pub struct HistoryStore {
    path: Option<PathBuf>,
    readings: Mutex<VecDeque<Reading>>,
    save_lock: Mutex<()>,
}

impl HistoryStore {
    pub fn in_memory() -> Self {
        Self::with_readings(None, Vec::new())
    }

    /// Opens the persisted history at `path`. A missing or corrupt file
    /// yields an empty history instead of an error.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let readings = match Self::load(path) {
            Ok(readings) => {
                debug!(target: "history", path = %path.display(), count = readings.len(), "history loaded");
                readings
            }
            Err(HistoryError::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
                info!(target: "history", path = %path.display(), "no persisted history, starting empty");
                Vec::new()
            }
            Err(err) => {
                warn!(target: "history", path = %path.display(), error = %err, "unreadable history, starting empty");
                Vec::new()
            }
        };
        Self::with_readings(Some(path.to_path_buf()), readings)
    }

    fn with_readings(path: Option<PathBuf>, mut readings: Vec<Reading>) -> Self {
        readings.sort_by_key(|reading| reading.timestamp);
        Self {
            path,
            readings: Mutex::new(readings.into()),
            save_lock: Mutex::new(()),
        }
    }

    /// Strict read of a persisted history file.
    pub fn load(path: impl AsRef<Path>) -> Result<Vec<Reading>, HistoryError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| HistoryError::Io {
            source,
            path: path.to_path_buf(),
        })?;
        let file: HistoryFile = serde_json::from_str(&content)?;
        Ok(file.readings)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Reading>> {
        // A panic while holding the lock cannot leave a half-grown series:
        // push_back and pop_front are the only mutations.
        self.readings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Appends a reading, re-stamping it just after the previous one when
    /// its timestamp would break strict ordering. Returns the stored copy.
    pub fn append(&self, reading: Reading) -> Reading {
        let mut readings = self.lock();
        Self::push(&mut readings, reading)
    }

    /// Append followed by prune, under one lock acquisition.
    pub fn append_and_prune(
        &self,
        reading: Reading,
        retention_days: u32,
        now: DateTime<Utc>,
    ) -> (Reading, usize) {
        let mut readings = self.lock();
        let stored = Self::push(&mut readings, reading);
        let removed = Self::evict(&mut readings, retention_days, now);
        (stored, removed)
    }

    fn push(readings: &mut VecDeque<Reading>, mut reading: Reading) -> Reading {
        if let Some(last) = readings.back() {
            if reading.timestamp <= last.timestamp {
                let adjusted = last.timestamp + Duration::microseconds(1);
                debug!(
                    target: "history",
                    original = %reading.timestamp,
                    adjusted = %adjusted,
                    "re-stamping out-of-order reading"
                );
                reading.timestamp = adjusted;
            }
        }
        readings.push_back(reading.clone());
        reading
    }

    /// Removes every reading older than `now - retention_days`. Remaining
    /// readings keep their order.
    pub fn prune(&self, retention_days: u32, now: DateTime<Utc>) -> usize {
        let mut readings = self.lock();
        Self::evict(&mut readings, retention_days, now)
    }

    fn evict(readings: &mut VecDeque<Reading>, retention_days: u32, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::days(i64::from(retention_days));
        let mut removed = 0;
        while readings
            .front()
            .map(|reading| reading.timestamp < cutoff)
            .unwrap_or(false)
        {
            readings.pop_front();
            removed += 1;
        }
        if removed > 0 {
            debug!(target: "history", removed, retention_days, "pruned expired readings");
        }
        removed
    }

    /// The last `n` readings in chronological order.
    pub fn window(&self, n: usize) -> Vec<Reading> {
        let readings = self.lock();
        let skip = readings.len().saturating_sub(n);
        readings.iter().skip(skip).cloned().collect()
    }

    pub fn latest(&self) -> Option<Reading> {
        self.lock().back().cloned()
    }

    pub fn snapshot(&self) -> Vec<Reading> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Persists the full series atomically. In-memory stores are a no-op.
    pub fn save(&self) -> Result<(), HistoryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self
            .save_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let file = HistoryFile {
            version: HISTORY_VERSION,
            readings: self.snapshot(),
        };
        let content = serde_json::to_vec_pretty(&file)?;
        write_atomic(path, &content).map_err(|source| HistoryError::Io {
            source,
            path: path.clone(),
        })
    }
}

/// Writes through a temp file in the target directory and renames it into
/// place, so readers never observe a partially written file.
pub(crate) fn write_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading_at(timestamp: DateTime<Utc>, value: f64) -> Reading {
        Reading::new(timestamp).with_metric("uat.successRate", value)
    }

    #[test]
    fn window_returns_most_recent_in_order() {
        let store = HistoryStore::in_memory();
        let start = Utc::now();
        for i in 0..5 {
            store.append(reading_at(start + Duration::seconds(i), i as f64));
        }
        let window = store.window(3);
        let values: Vec<f64> = window
            .iter()
            .map(|r| r.value("uat.successRate").unwrap())
            .collect();
        assert_eq!(values, vec![2.0, 3.0, 4.0]);
        assert_eq!(store.window(10).len(), 5);
        assert!(store.window(0).is_empty());
    }

    #[test]
    fn out_of_order_readings_are_restamped() {
        let store = HistoryStore::in_memory();
        let now = Utc::now();
        store.append(reading_at(now, 1.0));
        let stored = store.append(reading_at(now - Duration::seconds(5), 2.0));
        assert!(stored.timestamp > now);
        let snapshot = store.snapshot();
        assert!(snapshot[0].timestamp < snapshot[1].timestamp);
    }

    #[test]
    fn prune_keeps_boundary_readings() {
        let store = HistoryStore::in_memory();
        let now = Utc::now();
        store.append(reading_at(now - Duration::days(31), 1.0));
        store.append(reading_at(now - Duration::days(30), 2.0));
        store.append(reading_at(now - Duration::days(1), 3.0));
        let removed = store.prune(30, now);
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 2);
        assert_eq!(store.latest().unwrap().value("uat.successRate"), Some(3.0));
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = HistoryStore::open(&path);
        assert!(store.is_empty());
        assert!(HistoryStore::load(&path).is_err());
    }

    #[test]
    fn in_memory_save_is_noop() {
        let store = HistoryStore::in_memory();
        store.append(reading_at(Utc::now(), 1.0));
        store.save().unwrap();
        assert!(store.path().is_none());
    }
}
