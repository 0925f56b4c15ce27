//! Filesystem-backed checkpoint markers.
//!
//! Each checkpoint is one JSON file `<dir>/<name>.json` holding the name and
//! the time it was written. Presence means the gate is satisfied; freshness is
//! left to the consumer (see [`crate::gate::PhaseGate`]). Markers are
//! independent of each other, so writes are plain atomic overwrites.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::CheckpointError;
use crate::util::{atomic_write, is_valid_marker_name};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRecord {
    pub name: String,
    pub completed_at: DateTime<Utc>,
}

pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, CheckpointError> {
        if !is_valid_marker_name(name) {
            return Err(CheckpointError::InvalidName {
                name: name.to_string(),
            });
        }
        Ok(self.dir.join(format!("{name}.json")))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_for(name).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Write (or overwrite) the marker for `name` with the current time.
    pub fn write(&self, name: &str) -> Result<CheckpointRecord, CheckpointError> {
        self.write_at(name, Utc::now())
    }

    pub fn write_at(
        &self,
        name: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<CheckpointRecord, CheckpointError> {
        let path = self.path_for(name)?;
        let record = CheckpointRecord {
            name: name.to_string(),
            completed_at,
        };
        let json = serde_json::to_vec_pretty(&record).map_err(|source| {
            CheckpointError::Malformed {
                name: name.to_string(),
                source,
            }
        })?;
        atomic_write(&path, &json).map_err(|source| CheckpointError::Io {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(checkpoint = name, at = %completed_at, "checkpoint written");
        Ok(record)
    }

    pub fn read(&self, name: &str) -> Result<CheckpointRecord, CheckpointError> {
        let path = self.path_for(name)?;
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CheckpointError::NotFound {
                    name: name.to_string(),
                });
            }
            Err(source) => return Err(CheckpointError::Io { path, source }),
        };
        serde_json::from_str(&content).map_err(|source| CheckpointError::Malformed {
            name: name.to_string(),
            source,
        })
    }

    pub fn age_of(&self, name: &str) -> Result<Duration, CheckpointError> {
        self.age_of_at(name, Utc::now())
    }

    /// Age of the marker relative to `now`. Clock skew never yields a
    /// negative age.
    pub fn age_of_at(&self, name: &str, now: DateTime<Utc>) -> Result<Duration, CheckpointError> {
        let record = self.read(name)?;
        Ok((now - record.completed_at).max(Duration::zero()))
    }

    /// All markers, sorted by completion time.
    pub fn list(&self) -> Result<Vec<CheckpointRecord>, CheckpointError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&self.dir).map_err(|source| CheckpointError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            records.push(self.read(stem)?);
        }
        records.sort_by_key(|r| r.completed_at);
        Ok(records)
    }

    /// Remove every marker. `gantry start --reset` uses this.
    pub fn clear(&self) -> Result<(), CheckpointError> {
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir).map_err(|source| CheckpointError::Io {
                path: self.dir.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_store() -> (CheckpointStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("checkpoints"));
        (store, dir)
    }

    #[test]
    fn test_missing_checkpoint() {
        let (store, _dir) = make_store();
        assert!(!store.exists("prd_complete"));
        assert!(matches!(
            store.read("prd_complete"),
            Err(CheckpointError::NotFound { .. })
        ));
        assert!(matches!(
            store.age_of("prd_complete"),
            Err(CheckpointError::NotFound { .. })
        ));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_write_then_exists() {
        let (store, _dir) = make_store();
        let record = store.write("prd_complete").unwrap();
        assert!(store.exists("prd_complete"));
        assert_eq!(store.read("prd_complete").unwrap(), record);
    }

    #[test]
    fn test_rewrite_overwrites_timestamp_without_duplicating() {
        let (store, _dir) = make_store();
        let first = Utc::now() - Duration::days(3);
        let second = Utc::now();
        store.write_at("prd_complete", first).unwrap();
        store.write_at("prd_complete", second).unwrap();

        let records = store.list().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].completed_at, second);
    }

    #[test]
    fn test_age_of_at() {
        let (store, _dir) = make_store();
        let now = Utc::now();
        store.write_at("codebase_mapped", now - Duration::days(31)).unwrap();
        let age = store.age_of_at("codebase_mapped", now).unwrap();
        assert_eq!(age.num_days(), 31);
    }

    #[test]
    fn test_age_is_never_negative() {
        let (store, _dir) = make_store();
        let now = Utc::now();
        store.write_at("future", now + Duration::hours(2)).unwrap();
        assert_eq!(store.age_of_at("future", now).unwrap(), Duration::zero());
    }

    #[test]
    fn test_invalid_names_rejected() {
        let (store, _dir) = make_store();
        assert!(matches!(
            store.write("../outside"),
            Err(CheckpointError::InvalidName { .. })
        ));
        assert!(!store.exists("../outside"));
    }

    #[test]
    fn test_list_sorted_and_clear() {
        let (store, _dir) = make_store();
        let now = Utc::now();
        store.write_at("b", now).unwrap();
        store.write_at("a", now - Duration::hours(1)).unwrap();
        let names: Vec<_> = store.list().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a", "b"]);

        store.clear().unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_recovery_after_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoints");
        {
            let store = CheckpointStore::new(path.clone());
            store.write("intent_complete").unwrap();
        }
        let store = CheckpointStore::new(path);
        assert!(store.exists("intent_complete"));
    }
}
