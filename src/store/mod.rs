//! Durable media rows behind one trait, so the writer's merge policy is
//! independent of Postgres and can run against memory in dry runs and tests.

pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;

use crate::media::{CastMember, MediaKind, PersistedRecord};

pub use memory::MemoryStore;
pub use postgres::PgMediaStore;

/// TMDB keeps movies and series in separate id spaces, so a row is keyed by both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MediaKey {
    pub kind: MediaKind,
    pub tmdb_id: i64,
}

impl MediaKey {
    pub fn new(kind: MediaKind, tmdb_id: i64) -> Self {
        Self { kind, tmdb_id }
    }

    pub fn of(record: &PersistedRecord) -> Self {
        Self::new(record.kind, record.tmdb_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    Inserted,
    /// Lost a race or the row was already there; nothing written.
    AlreadyExists,
}

#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn fetch_media(&self, key: MediaKey) -> Result<Option<PersistedRecord>>;

    /// Insert-if-absent.
    async fn insert_media(&self, record: &PersistedRecord) -> Result<InsertResult>;

    /// Overwrite every column of an existing row.
    async fn update_media(&self, record: &PersistedRecord) -> Result<()>;

    /// Insert-if-absent by person id.
    async fn upsert_person(&self, person: &CastMember) -> Result<()>;

    /// Insert-if-absent by `(media, person)`.
    async fn link_person(&self, key: MediaKey, person: &CastMember) -> Result<()>;

    /// Rows of one kind ordered by tmdb id; `page` is 1-based.
    async fn list_media(
        &self,
        kind: MediaKind,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<PersistedRecord>>;

    async fn count_media(&self, kind: MediaKind) -> Result<i64>;
}

pub(crate) fn page_offset(page: u32, per_page: u32) -> i64 {
    i64::from(page.saturating_sub(1)) * i64::from(per_page)
}
