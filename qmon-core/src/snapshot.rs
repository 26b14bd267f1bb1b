use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::MonitoringConfig;
use crate::history::write_atomic;

const STAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";
const LATEST_PREFIX: &str = "latest-";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("io error on {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot<T> {
    pub tag: String,
    pub generated_at: DateTime<Utc>,
    pub data: T,
}

/// Report artifacts: one `latest-<tag>.json` overwritten every cycle, plus a
/// timestamped copy per cycle kept for `retention_days`.
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    dir: PathBuf,
    retention_days: u32,
}

impl SnapshotWriter {
    pub fn new(dir: impl Into<PathBuf>, retention_days: u32) -> Self {
        Self {
            dir: dir.into(),
            retention_days,
        }
    }

    pub fn from_config(config: &MonitoringConfig) -> Self {
        Self::new(config.reports_dir(), config.alert_log_retention_days)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn latest_path(&self, tag: &str) -> PathBuf {
        self.dir.join(format!("{LATEST_PREFIX}{tag}.json"))
    }

    pub fn stamped_path(&self, tag: &str, at: DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("{tag}-{}.json", at.format(STAMP_FORMAT)))
    }

    /// Writes both artifacts for `tag` and returns the timestamped path.
    pub fn write<T: Serialize>(
        &self,
        tag: &str,
        data: &T,
        now: DateTime<Utc>,
    ) -> Result<PathBuf, SnapshotError> {
        let snapshot = Snapshot {
            tag: tag.to_string(),
            generated_at: now,
            data,
        };
        let content = serde_json::to_vec_pretty(&snapshot)?;

        let latest = self.latest_path(tag);
        write_atomic(&latest, &content).map_err(|source| SnapshotError::Io {
            source,
            path: latest.clone(),
        })?;
        let stamped = self.stamped_path(tag, now);
        write_atomic(&stamped, &content).map_err(|source| SnapshotError::Io {
            source,
            path: stamped.clone(),
        })?;
        debug!(target: "snapshot", tag, path = %stamped.display(), "snapshot written");
        Ok(stamped)
    }

    pub fn read_latest(&self, tag: &str) -> Result<Snapshot<serde_json::Value>, SnapshotError> {
        let path = self.latest_path(tag);
        let content = std::fs::read_to_string(&path).map_err(|source| SnapshotError::Io {
            source,
            path: path.clone(),
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Deletes timestamped artifacts whose embedded stamp is older than the
    /// retention window. `latest-*` files and unrelated files are kept.
    pub fn prune(&self, now: DateTime<Utc>) -> Result<usize, SnapshotError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(SnapshotError::Io {
                    source,
                    path: self.dir.clone(),
                })
            }
        };

        let cutoff = now - Duration::days(i64::from(self.retention_days));
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(stamp) = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(parse_stamp)
            else {
                continue;
            };
            if stamp >= cutoff {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) => {
                    warn!(target: "snapshot", path = %path.display(), error = %err, "failed to remove expired snapshot")
                }
            }
        }
        if removed > 0 {
            debug!(target: "snapshot", removed, "pruned expired snapshots");
        }
        Ok(removed)
    }
}

/// `quick-20250101T120000Z.json` → its timestamp.
fn parse_stamp(file_name: &str) -> Option<DateTime<Utc>> {
    if file_name.starts_with(LATEST_PREFIX) {
        return None;
    }
    let stem = file_name.strip_suffix(".json")?;
    let (_, stamp) = stem.rsplit_once('-')?;
    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn stamp_round_trips_through_file_name() {
        let at = Utc.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap();
        let writer = SnapshotWriter::new("reports", 7);
        let path = writer.stamped_path("full", at);
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(name, "full-20250304T050607Z.json");
        assert_eq!(parse_stamp(name), Some(at));
        assert_eq!(parse_stamp("latest-full.json"), None);
        assert_eq!(parse_stamp("notes.txt"), None);
    }

    #[test]
    fn write_overwrites_latest_and_prune_drops_old_stamps() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path(), 7);
        let now = Utc.with_ymd_and_hms(2025, 3, 20, 0, 0, 0).unwrap();

        writer
            .write("quick", &json!({"n": 1}), now - Duration::days(10))
            .unwrap();
        writer.write("quick", &json!({"n": 2}), now).unwrap();

        let latest = writer.read_latest("quick").unwrap();
        assert_eq!(latest.data["n"], 2);

        assert_eq!(writer.prune(now).unwrap(), 1);
        assert!(writer.latest_path("quick").exists());
        assert!(writer.stamped_path("quick", now).exists());
    }

    #[test]
    fn prune_of_missing_dir_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let writer = SnapshotWriter::new(dir.path().join("absent"), 7);
        assert_eq!(writer.prune(Utc::now()).unwrap(), 0);
    }
}
