//! Upsert/dedup writer: one row per title, with the overwrite rules of the
//! current run mode applied on top of whatever the store already holds.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::media::{CastMember, PersistedRecord};
use crate::store::{InsertResult, MediaKey, MediaStore};

pub const DEFAULT_CAST_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Existing rows are never touched.
    InsertOnly,
    /// Existing rows only improve: nulls and zeros never replace stored values,
    /// and a stored kp id only yields to an equal or higher confidence tier.
    Refresh,
    /// Incoming values overwrite unconditionally.
    ForceResync,
}

impl WriteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMode::InsertOnly => "insert_only",
            WriteMode::Refresh => "refresh",
            WriteMode::ForceResync => "force_resync",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Inserted,
    SkippedExists,
    Updated,
    Failed(String),
}

impl WriteOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            WriteOutcome::Inserted => "inserted",
            WriteOutcome::SkippedExists => "skipped_exists",
            WriteOutcome::Updated => "updated",
            WriteOutcome::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for WriteOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteOutcome::Failed(reason) => write!(f, "failed: {reason}"),
            other => f.write_str(other.label()),
        }
    }
}

pub struct UpsertWriter {
    store: Arc<dyn MediaStore>,
    cast_limit: usize,
}

impl UpsertWriter {
    pub fn new(store: Arc<dyn MediaStore>) -> Self {
        Self {
            store,
            cast_limit: DEFAULT_CAST_LIMIT,
        }
    }

    pub fn with_cast_limit(mut self, cast_limit: usize) -> Self {
        self.cast_limit = cast_limit;
        self
    }

    pub fn store(&self) -> &Arc<dyn MediaStore> {
        &self.store
    }

    /// Write one record. Never returns an error: failures become
    /// [`WriteOutcome::Failed`] so the batch can keep going.
    #[instrument(skip_all, fields(tmdb_id = record.tmdb_id, mode = mode.as_str()))]
    pub async fn upsert(
        &self,
        record: &PersistedRecord,
        cast: &[CastMember],
        mode: WriteMode,
    ) -> WriteOutcome {
        match self.try_upsert(record, cast, mode).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "write failed");
                WriteOutcome::Failed(format!("{e:#}"))
            }
        }
    }

    async fn try_upsert(
        &self,
        record: &PersistedRecord,
        cast: &[CastMember],
        mode: WriteMode,
    ) -> anyhow::Result<WriteOutcome> {
        let key = MediaKey::of(record);
        if mode == WriteMode::InsertOnly {
            return self.insert_new(key, record, cast).await;
        }

        let Some(existing) = self.store.fetch_media(key).await? else {
            return self.insert_new(key, record, cast).await;
        };
        let merged = match mode {
            WriteMode::ForceResync => record.clone(),
            _ => merge_refresh(&existing, record),
        };
        if mode == WriteMode::Refresh && same_content(&existing, &merged) {
            debug!("refresh brought nothing new");
            return Ok(WriteOutcome::SkippedExists);
        }
        self.store.update_media(&merged).await?;
        Ok(WriteOutcome::Updated)
    }

    async fn insert_new(
        &self,
        key: MediaKey,
        record: &PersistedRecord,
        cast: &[CastMember],
    ) -> anyhow::Result<WriteOutcome> {
        match self.store.insert_media(record).await? {
            InsertResult::AlreadyExists => Ok(WriteOutcome::SkippedExists),
            InsertResult::Inserted => Ok(match self.link_cast(key, cast).await {
                Ok(()) => WriteOutcome::Inserted,
                // The media row stays; only the cast is missing.
                Err(e) => WriteOutcome::Failed(format!("cast: {e:#}")),
            }),
        }
    }

    async fn link_cast(&self, key: MediaKey, cast: &[CastMember]) -> anyhow::Result<()> {
        let mut members: Vec<&CastMember> = cast.iter().collect();
        members.sort_by_key(|m| m.order);
        for member in members.into_iter().take(self.cast_limit) {
            self.store.upsert_person(member).await?;
            self.store.link_person(key, member).await?;
        }
        Ok(())
    }
}

/// Refresh rules: the kp id moves only to a known value from an equal or
/// higher confidence tier, and each rating scale only to a known value.
/// Ratings travel with the kp id: when it changes, the old title's ratings go.
/// Descriptive columns are filled when the stored row lacks them.
pub fn merge_refresh(existing: &PersistedRecord, incoming: &PersistedRecord) -> PersistedRecord {
    let mut out = existing.clone();
    let adopt_id = match (existing.kp_id, incoming.kp_id) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(_), Some(_)) => incoming.kp_confidence >= existing.kp_confidence,
    };
    if adopt_id {
        out.kp_id = incoming.kp_id;
        out.kp_source = incoming.kp_source.clone();
        out.kp_confidence = incoming.kp_confidence;
    }

    if adopt_id && incoming.kp_id != existing.kp_id {
        out.ratings = incoming.ratings;
    } else if incoming.kp_id.is_none() || incoming.kp_id == out.kp_id {
        if incoming.ratings.has_kp() {
            out.ratings.kp_rating = incoming.ratings.kp_rating;
            out.ratings.kp_votes = incoming.ratings.kp_votes;
        }
        if incoming.ratings.has_imdb() {
            out.ratings.imdb_rating = incoming.ratings.imdb_rating;
            out.ratings.imdb_votes = incoming.ratings.imdb_votes;
        }
    } else {
        debug!(
            stored = ?existing.kp_id,
            offered = ?incoming.kp_id,
            "lower-confidence kp id ignored with its ratings"
        );
    }

    fill(&mut out.original_title, &incoming.original_title);
    fill(&mut out.imdb_id, &incoming.imdb_id);
    fill(&mut out.wikidata_id, &incoming.wikidata_id);
    fill(&mut out.overview, &incoming.overview);
    fill(&mut out.poster_path, &incoming.poster_path);
    if out.year.is_none() {
        out.year = incoming.year;
    }
    if out.title.trim().is_empty() {
        out.title = incoming.title.clone();
    }
    out.updated_at = incoming.updated_at;
    out
}

fn fill(slot: &mut Option<String>, incoming: &Option<String>) {
    let blank = slot.as_deref().map_or(true, |s| s.trim().is_empty());
    if blank {
        if let Some(v) = incoming.as_deref().filter(|v| !v.trim().is_empty()) {
            *slot = Some(v.to_string());
        }
    }
}

fn same_content(a: &PersistedRecord, b: &PersistedRecord) -> bool {
    let mut b = b.clone();
    b.updated_at = a.updated_at;
    *a == b
}
