use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::{page_offset, InsertResult, MediaKey, MediaStore};
use crate::media::{CastMember, MediaKind, PersistedRecord};

#[derive(Default)]
struct Inner {
    media: BTreeMap<MediaKey, PersistedRecord>,
    people: HashMap<i64, CastMember>,
    links: BTreeSet<(MediaKey, i64)>,
    fail_links: bool,
    fail_writes: bool,
}

/// Process-local store for `--dry-run` and tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))
    }

    /// Make every `link_person` call fail (cast persistence error path).
    pub fn fail_links(&self, on: bool) -> Result<()> {
        self.lock()?.fail_links = on;
        Ok(())
    }

    /// Make media inserts and updates fail.
    pub fn fail_writes(&self, on: bool) -> Result<()> {
        self.lock()?.fail_writes = on;
        Ok(())
    }

    pub fn people_count(&self) -> Result<usize> {
        Ok(self.lock()?.people.len())
    }

    pub fn linked_people(&self, key: MediaKey) -> Result<Vec<i64>> {
        Ok(self
            .lock()?
            .links
            .iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, person)| *person)
            .collect())
    }
}

#[async_trait]
impl MediaStore for MemoryStore {
    async fn fetch_media(&self, key: MediaKey) -> Result<Option<PersistedRecord>> {
        Ok(self.lock()?.media.get(&key).cloned())
    }

    async fn insert_media(&self, record: &PersistedRecord) -> Result<InsertResult> {
        let mut inner = self.lock()?;
        if inner.fail_writes {
            bail!("injected write failure");
        }
        let key = MediaKey::of(record);
        if inner.media.contains_key(&key) {
            return Ok(InsertResult::AlreadyExists);
        }
        inner.media.insert(key, record.clone());
        Ok(InsertResult::Inserted)
    }

    async fn update_media(&self, record: &PersistedRecord) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.fail_writes {
            bail!("injected write failure");
        }
        let key = MediaKey::of(record);
        match inner.media.get_mut(&key) {
            Some(row) => {
                *row = record.clone();
                Ok(())
            }
            None => bail!("no media row for {} {}", key.kind, key.tmdb_id),
        }
    }

    async fn upsert_person(&self, person: &CastMember) -> Result<()> {
        self.lock()?
            .people
            .entry(person.person_id)
            .or_insert_with(|| person.clone());
        Ok(())
    }

    async fn link_person(&self, key: MediaKey, person: &CastMember) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.fail_links {
            bail!("injected link failure");
        }
        inner.links.insert((key, person.person_id));
        Ok(())
    }

    async fn list_media(
        &self,
        kind: MediaKind,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<PersistedRecord>> {
        let offset = usize::try_from(page_offset(page, per_page)).unwrap_or(usize::MAX);
        Ok(self
            .lock()?
            .media
            .values()
            .filter(|r| r.kind == kind)
            .skip(offset)
            .take(per_page as usize)
            .cloned()
            .collect())
    }

    async fn count_media(&self, kind: MediaKind) -> Result<i64> {
        let n = self.lock()?.media.values().filter(|r| r.kind == kind).count();
        Ok(n as i64)
    }
}
