use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::instrument;

use super::{page_offset, InsertResult, MediaKey, MediaStore};
use crate::media::{CastMember, Confidence, MediaKind, PersistedRecord, RatingSet};
use crate::util::db::Db;

const MEDIA_COLUMNS: &str = "kind, tmdb_id, title, original_title, year, imdb_id, wikidata_id, \
     kp_id, kp_source, kp_confidence, kp_rating, kp_votes, imdb_rating, imdb_votes, \
     overview, poster_path, updated_at";

/// `media` / `people` / `media_people` tables from `migrations/0001_kinonest_media.sql`.
#[derive(Clone)]
pub struct PgMediaStore {
    db: Db,
}

impl PgMediaStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

fn record_from_row(row: &PgRow) -> Result<PersistedRecord> {
    let kind: String = row.try_get("kind")?;
    let confidence: Option<String> = row.try_get("kp_confidence")?;
    Ok(PersistedRecord {
        tmdb_id: row.try_get("tmdb_id")?,
        kind: kind.parse()?,
        title: row.try_get("title")?,
        original_title: row.try_get("original_title")?,
        year: row.try_get("year")?,
        imdb_id: row.try_get("imdb_id")?,
        wikidata_id: row.try_get("wikidata_id")?,
        kp_id: row.try_get("kp_id")?,
        kp_source: row.try_get("kp_source")?,
        kp_confidence: confidence.as_deref().and_then(Confidence::parse),
        ratings: RatingSet {
            kp_rating: row.try_get("kp_rating")?,
            kp_votes: row.try_get("kp_votes")?,
            imdb_rating: row.try_get("imdb_rating")?,
            imdb_votes: row.try_get("imdb_votes")?,
        },
        overview: row.try_get("overview")?,
        poster_path: row.try_get("poster_path")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

#[async_trait]
impl MediaStore for PgMediaStore {
    async fn fetch_media(&self, key: MediaKey) -> Result<Option<PersistedRecord>> {
        let sql = format!("SELECT {MEDIA_COLUMNS} FROM media WHERE kind = $1 AND tmdb_id = $2");
        let row = sqlx::query(&sql)
            .persistent(false)
            .bind(key.kind.as_str())
            .bind(key.tmdb_id)
            .fetch_optional(&self.db.pool)
            .await
            .context("select media")?;
        row.as_ref().map(record_from_row).transpose()
    }

    #[instrument(skip_all, fields(tmdb_id = record.tmdb_id, kind = %record.kind))]
    async fn insert_media(&self, record: &PersistedRecord) -> Result<InsertResult> {
        let sql = format!(
            "INSERT INTO media ({MEDIA_COLUMNS}) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17) \
             ON CONFLICT DO NOTHING \
             RETURNING tmdb_id"
        );
        let res = sqlx::query(&sql)
            .persistent(false)
            .bind(record.kind.as_str())
            .bind(record.tmdb_id)
            .bind(&record.title)
            .bind(&record.original_title)
            .bind(record.year)
            .bind(&record.imdb_id)
            .bind(&record.wikidata_id)
            .bind(record.kp_id)
            .bind(&record.kp_source)
            .bind(record.kp_confidence.map(|c| c.as_str()))
            .bind(record.ratings.kp_rating)
            .bind(record.ratings.kp_votes)
            .bind(record.ratings.imdb_rating)
            .bind(record.ratings.imdb_votes)
            .bind(&record.overview)
            .bind(&record.poster_path)
            .bind(record.updated_at)
            .fetch_optional(&self.db.pool)
            .await;
        match res {
            Ok(Some(_)) => Ok(InsertResult::Inserted),
            Ok(None) => Ok(InsertResult::AlreadyExists),
            // 23505 = unique_violation (another process won the race on a secondary index)
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("23505") => {
                Ok(InsertResult::AlreadyExists)
            }
            Err(e) => Err(e).context("insert media"),
        }
    }

    #[instrument(skip_all, fields(tmdb_id = record.tmdb_id, kind = %record.kind))]
    async fn update_media(&self, record: &PersistedRecord) -> Result<()> {
        let res = sqlx::query(
            "UPDATE media SET title = $3, original_title = $4, year = $5, imdb_id = $6, \
             wikidata_id = $7, kp_id = $8, kp_source = $9, kp_confidence = $10, \
             kp_rating = $11, kp_votes = $12, imdb_rating = $13, imdb_votes = $14, \
             overview = $15, poster_path = $16, updated_at = $17 \
             WHERE kind = $1 AND tmdb_id = $2",
        )
        .persistent(false)
        .bind(record.kind.as_str())
        .bind(record.tmdb_id)
        .bind(&record.title)
        .bind(&record.original_title)
        .bind(record.year)
        .bind(&record.imdb_id)
        .bind(&record.wikidata_id)
        .bind(record.kp_id)
        .bind(&record.kp_source)
        .bind(record.kp_confidence.map(|c| c.as_str()))
        .bind(record.ratings.kp_rating)
        .bind(record.ratings.kp_votes)
        .bind(record.ratings.imdb_rating)
        .bind(record.ratings.imdb_votes)
        .bind(&record.overview)
        .bind(&record.poster_path)
        .bind(record.updated_at)
        .execute(&self.db.pool)
        .await
        .context("update media")?;
        if res.rows_affected() == 0 {
            bail!("no media row for {} {}", record.kind, record.tmdb_id);
        }
        Ok(())
    }

    async fn upsert_person(&self, person: &CastMember) -> Result<()> {
        sqlx::query(
            "INSERT INTO people (tmdb_person_id, name, original_name, profile_path) \
             VALUES ($1,$2,$3,$4) \
             ON CONFLICT DO NOTHING",
        )
        .persistent(false)
        .bind(person.person_id)
        .bind(&person.name)
        .bind(&person.original_name)
        .bind(&person.profile_path)
        .execute(&self.db.pool)
        .await
        .context("insert person")?;
        Ok(())
    }

    async fn link_person(&self, key: MediaKey, person: &CastMember) -> Result<()> {
        sqlx::query(
            "INSERT INTO media_people (kind, tmdb_id, tmdb_person_id, character, cast_order) \
             VALUES ($1,$2,$3,$4,$5) \
             ON CONFLICT DO NOTHING",
        )
        .persistent(false)
        .bind(key.kind.as_str())
        .bind(key.tmdb_id)
        .bind(person.person_id)
        .bind(&person.character)
        .bind(person.order)
        .execute(&self.db.pool)
        .await
        .context("link person")?;
        Ok(())
    }

    async fn list_media(
        &self,
        kind: MediaKind,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<PersistedRecord>> {
        let sql = format!(
            "SELECT {MEDIA_COLUMNS} FROM media WHERE kind = $1 \
             ORDER BY tmdb_id LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&sql)
            .persistent(false)
            .bind(kind.as_str())
            .bind(i64::from(per_page))
            .bind(page_offset(page, per_page))
            .fetch_all(&self.db.pool)
            .await
            .context("list media")?;
        rows.iter().map(record_from_row).collect()
    }

    async fn count_media(&self, kind: MediaKind) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM media WHERE kind = $1")
            .persistent(false)
            .bind(kind.as_str())
            .fetch_one(&self.db.pool)
            .await
            .context("count media")?;
        Ok(n)
    }
}
