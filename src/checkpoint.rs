//! Resume points for batch runs, one per run key.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Next page to process. `year` is `None` for feeds that are not scanned by year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub year: Option<i32>,
    pub page: u32,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(year: Option<i32>, page: u32) -> Self {
        Self {
            year,
            page,
            updated_at: Utc::now(),
        }
    }
}

pub trait CheckpointStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<Checkpoint>>;
    fn save(&self, key: &str, checkpoint: &Checkpoint) -> Result<()>;
    fn clear(&self, key: &str) -> Result<()>;
}

/// `<dir>/<key>.json`, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self, key: &str) -> Result<Option<Checkpoint>> {
        let path = self.path_for(key);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        let cp = serde_json::from_str(&raw)
            .with_context(|| format!("parse checkpoint {}", path.display()))?;
        Ok(Some(cp))
    }

    fn save(&self, key: &str, checkpoint: &Checkpoint) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("create {}", self.dir.display()))?;
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(checkpoint)?;
        std::fs::write(&tmp, body).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path).with_context(|| format!("rename to {}", path.display()))?;
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    inner: Mutex<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self, key: &str) -> Result<Option<Checkpoint>> {
        let inner = self.inner.lock().map_err(|_| anyhow!("checkpoint lock poisoned"))?;
        Ok(inner.get(key).cloned())
    }

    fn save(&self, key: &str, checkpoint: &Checkpoint) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| anyhow!("checkpoint lock poisoned"))?;
        inner.insert(key.to_string(), checkpoint.clone());
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| anyhow!("checkpoint lock poisoned"))?;
        inner.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_round_trip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("state"));
        assert_eq!(store.dir(), dir.path().join("state"));
        assert!(store.load("discover-movie").unwrap().is_none());

        let cp = Checkpoint::new(Some(2023), 7);
        store.save("discover-movie", &cp).unwrap();
        assert_eq!(store.load("discover-movie").unwrap(), Some(cp));
        assert!(store.load("discover-series").unwrap().is_none());
        assert!(!dir.path().join("state/discover-movie.json.tmp").exists());

        store.clear("discover-movie").unwrap();
        assert!(store.load("discover-movie").unwrap().is_none());
        store.clear("discover-movie").unwrap();
    }

    #[test]
    fn keys_are_sanitised_into_file_names() {
        let store = FileCheckpointStore::new("/tmp/x");
        assert_eq!(
            store.path_for("../backlog series"),
            PathBuf::from("/tmp/x/___backlog_series.json")
        );
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("k.json"), "{not json").unwrap();
        let store = FileCheckpointStore::new(dir.path());
        assert!(store.load("k").is_err());
    }
}
