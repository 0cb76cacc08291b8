//! Candidate feeds: where the scheduler gets its pages of titles from.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::media::{CandidateMedia, CastMember, MediaDetails, MediaKind, PersistedRecord};
use crate::sources::HttpClient;
use crate::store::MediaStore;

/// TMDB refuses discover pages past this one.
pub const TMDB_MAX_PAGE: u32 = 500;
pub const BACKLOG_PAGE_SIZE: u32 = 50;

/// One entry of a feed page; enough to log and to ask for details.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    pub tmdb_id: i64,
    pub kind: MediaKind,
    pub title: String,
    /// Present for backlog items: the row as currently stored.
    pub stored: Option<PersistedRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedPage {
    pub items: Vec<FeedItem>,
    pub total_pages: u32,
}

#[async_trait]
pub trait CandidateFeed: Send + Sync {
    /// Checkpoint key; distinct per feed and kind.
    fn key(&self) -> String;

    /// Whether pages are enumerated per release year.
    fn scans_years(&self) -> bool;

    /// `page` is 1-based; `year` is `None` when [`Self::scans_years`] is false.
    async fn fetch_page(&self, year: Option<i32>, page: u32) -> Result<FeedPage>;

    async fn details(&self, item: &FeedItem) -> Result<MediaDetails>;
}

#[derive(Debug, Deserialize)]
struct DiscoverResponse {
    #[serde(default)]
    total_pages: u32,
    #[serde(default)]
    results: Vec<DiscoverRow>,
}

#[derive(Debug, Deserialize)]
struct DiscoverRow {
    id: i64,
    title: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DetailsResponse {
    id: i64,
    title: Option<String>,
    name: Option<String>,
    original_title: Option<String>,
    original_name: Option<String>,
    release_date: Option<String>,
    first_air_date: Option<String>,
    overview: Option<String>,
    poster_path: Option<String>,
    imdb_id: Option<String>,
    #[serde(default)]
    external_ids: ExternalIds,
    #[serde(default)]
    credits: Credits,
}

#[derive(Debug, Default, Deserialize)]
struct ExternalIds {
    imdb_id: Option<String>,
    wikidata_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Credits {
    #[serde(default)]
    cast: Vec<CastRow>,
}

#[derive(Debug, Deserialize)]
struct CastRow {
    id: i64,
    name: String,
    original_name: Option<String>,
    character: Option<String>,
    #[serde(default)]
    order: i32,
    profile_path: Option<String>,
}

/// Minimal TMDB v3 client, Russian locale.
#[derive(Debug, Clone)]
pub struct TmdbClient {
    base_url: String,
    api_key: String,
    language: String,
    http: HttpClient,
}

impl TmdbClient {
    pub fn new(http: HttpClient, api_key: String) -> Self {
        Self {
            base_url: "https://api.themoviedb.org/3".to_string(),
            api_key,
            language: "ru-RU".to_string(),
            http,
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    #[instrument(skip(self))]
    pub async fn discover(&self, kind: MediaKind, year: i32, page: u32) -> Result<FeedPage> {
        let url = format!("{}/discover/{}", self.base_url, kind.tmdb_path());
        let year_param = match kind {
            MediaKind::Movie => "primary_release_year",
            MediaKind::Series => "first_air_date_year",
        };
        let year_s = year.to_string();
        let page_s = page.to_string();
        let req = self.http.get(&url).query(&[
            ("api_key", self.api_key.as_str()),
            ("language", self.language.as_str()),
            ("sort_by", "popularity.desc"),
            (year_param, year_s.as_str()),
            ("page", page_s.as_str()),
        ]);
        let body: DiscoverResponse = self
            .http
            .fetch_json(req)
            .await
            .with_context(|| format!("tmdb discover {kind} {year} page {page}"))?;
        Ok(discover_page(kind, body))
    }

    #[instrument(skip(self))]
    pub async fn details(&self, kind: MediaKind, tmdb_id: i64) -> Result<MediaDetails> {
        let url = format!("{}/{}/{}", self.base_url, kind.tmdb_path(), tmdb_id);
        let req = self.http.get(&url).query(&[
            ("api_key", self.api_key.as_str()),
            ("language", self.language.as_str()),
            ("append_to_response", "credits,external_ids"),
        ]);
        let body: DetailsResponse = self
            .http
            .fetch_json(req)
            .await
            .with_context(|| format!("tmdb details {kind} {tmdb_id}"))?;
        Ok(details_from(kind, body))
    }
}

fn discover_page(kind: MediaKind, body: DiscoverResponse) -> FeedPage {
    let items = body
        .results
        .into_iter()
        .map(|row| FeedItem {
            tmdb_id: row.id,
            kind,
            title: row.title.or(row.name).unwrap_or_default(),
            stored: None,
        })
        .collect();
    FeedPage {
        items,
        total_pages: body.total_pages.min(TMDB_MAX_PAGE),
    }
}

fn details_from(kind: MediaKind, body: DetailsResponse) -> MediaDetails {
    let (title, original, date) = match kind {
        MediaKind::Movie => (body.title, body.original_title, body.release_date),
        MediaKind::Series => (body.name, body.original_name, body.first_air_date),
    };
    let non_blank = |s: &String| !s.trim().is_empty();
    let imdb_id = body
        .external_ids
        .imdb_id
        .filter(non_blank)
        .or(body.imdb_id.filter(non_blank));
    let candidate = CandidateMedia {
        tmdb_id: body.id,
        kind,
        title: title.unwrap_or_default(),
        original_title: original.filter(|s| !s.trim().is_empty()),
        year: date.as_deref().and_then(year_of),
        imdb_id,
        wikidata_id: body.external_ids.wikidata_id.filter(|s| !s.trim().is_empty()),
    };
    let cast = body
        .credits
        .cast
        .into_iter()
        .map(|c| CastMember {
            person_id: c.id,
            name: c.name,
            original_name: c.original_name,
            character: c.character.filter(|s| !s.is_empty()),
            order: c.order,
            profile_path: c.profile_path,
        })
        .collect();
    MediaDetails {
        candidate,
        overview: body.overview.filter(|s| !s.trim().is_empty()),
        poster_path: body.poster_path,
        cast,
    }
}

/// `"2024-03-01"` -> 2024; empty strings (unreleased titles) -> None.
fn year_of(date: &str) -> Option<i32> {
    date.get(..4)?.parse().ok()
}

/// New titles from TMDB discover, by release year.
pub struct TmdbDiscoverFeed {
    tmdb: TmdbClient,
    kind: MediaKind,
}

impl TmdbDiscoverFeed {
    pub fn new(tmdb: TmdbClient, kind: MediaKind) -> Self {
        Self { tmdb, kind }
    }
}

#[async_trait]
impl CandidateFeed for TmdbDiscoverFeed {
    fn key(&self) -> String {
        format!("discover-{}", self.kind)
    }

    fn scans_years(&self) -> bool {
        true
    }

    async fn fetch_page(&self, year: Option<i32>, page: u32) -> Result<FeedPage> {
        let year = year.context("discover feed needs a year")?;
        self.tmdb.discover(self.kind, year, page).await
    }

    async fn details(&self, item: &FeedItem) -> Result<MediaDetails> {
        self.tmdb.details(item.kind, item.tmdb_id).await
    }
}

/// Rows already in the store, for resync runs.
///
/// With a TMDB client the details are refetched so late-arriving external ids
/// are picked up; without one (or when TMDB fails) the stored row is replayed.
pub struct BacklogFeed {
    store: Arc<dyn MediaStore>,
    kind: MediaKind,
    tmdb: Option<TmdbClient>,
}

impl BacklogFeed {
    pub fn new(store: Arc<dyn MediaStore>, kind: MediaKind) -> Self {
        Self {
            store,
            kind,
            tmdb: None,
        }
    }

    pub fn with_tmdb(mut self, tmdb: TmdbClient) -> Self {
        self.tmdb = Some(tmdb);
        self
    }
}

#[async_trait]
impl CandidateFeed for BacklogFeed {
    fn key(&self) -> String {
        format!("backlog-{}", self.kind)
    }

    fn scans_years(&self) -> bool {
        false
    }

    async fn fetch_page(&self, _year: Option<i32>, page: u32) -> Result<FeedPage> {
        let total = self.store.count_media(self.kind).await?;
        let per_page = i64::from(BACKLOG_PAGE_SIZE);
        let total_pages = u32::try_from((total + per_page - 1) / per_page).unwrap_or(u32::MAX);
        let rows = self.store.list_media(self.kind, page, BACKLOG_PAGE_SIZE).await?;
        debug!(page, total_pages, rows = rows.len(), "backlog page");
        let items = rows
            .into_iter()
            .map(|row| FeedItem {
                tmdb_id: row.tmdb_id,
                kind: row.kind,
                title: row.title.clone(),
                stored: Some(row),
            })
            .collect();
        Ok(FeedPage { items, total_pages })
    }

    async fn details(&self, item: &FeedItem) -> Result<MediaDetails> {
        let stored = item
            .stored
            .as_ref()
            .map(|row| MediaDetails {
                candidate: row.to_candidate(),
                overview: row.overview.clone(),
                poster_path: row.poster_path.clone(),
                cast: Vec::new(),
            });
        if let Some(tmdb) = &self.tmdb {
            match tmdb.details(item.kind, item.tmdb_id).await {
                Ok(mut fresh) => {
                    if let Some(stored) = &stored {
                        keep_stored_ids(&mut fresh.candidate, &stored.candidate);
                    }
                    return Ok(fresh);
                }
                Err(e) if stored.is_some() => {
                    warn!(tmdb_id = item.tmdb_id, error = %e, "tmdb details failed; using stored row");
                }
                Err(e) => return Err(e),
            }
        }
        stored.with_context(|| format!("backlog item {} has no stored row", item.tmdb_id))
    }
}

fn keep_stored_ids(fresh: &mut CandidateMedia, stored: &CandidateMedia) {
    if fresh.imdb_id.is_none() {
        fresh.imdb_id = stored.imdb_id.clone();
    }
    if fresh.wikidata_id.is_none() {
        fresh.wikidata_id = stored.wikidata_id.clone();
    }
    if fresh.title.trim().is_empty() {
        fresh.title = stored.title.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{RatingSet, ResolvedIdentifier};
    use crate::store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn unreachable_tmdb_is_an_error() {
        let http = HttpClient::new(std::time::Duration::from_secs(1)).unwrap();
        let tmdb = TmdbClient::new(http, "key".into()).with_base_url("http://127.0.0.1:9/3/");
        assert!(tmdb.discover(MediaKind::Movie, 2024, 1).await.is_err());
    }

    #[test]
    fn discover_page_caps_total_and_picks_title_or_name() {
        let body: DiscoverResponse = serde_json::from_value(json!({
            "page": 1,
            "total_pages": 812,
            "results": [
                {"id": 1, "title": "Фильм"},
                {"id": 2, "name": "Сериал"}
            ]
        }))
        .unwrap();
        let page = discover_page(MediaKind::Movie, body);
        assert_eq!(page.total_pages, TMDB_MAX_PAGE);
        assert_eq!(page.items[0].title, "Фильм");
        assert_eq!(page.items[1].title, "Сериал");
    }

    #[test]
    fn movie_details_with_credits_and_external_ids() {
        let body: DetailsResponse = serde_json::from_value(json!({
            "id": 603,
            "title": "Матрица",
            "original_title": "The Matrix",
            "release_date": "1999-03-30",
            "overview": "",
            "poster_path": "/m.jpg",
            "imdb_id": "tt0133093",
            "external_ids": {"imdb_id": "tt0133093", "wikidata_id": "Q83495"},
            "credits": {"cast": [
                {"id": 6384, "name": "Киану Ривз", "original_name": "Keanu Reeves", "character": "Neo", "order": 0, "profile_path": null}
            ]}
        }))
        .unwrap();
        let d = details_from(MediaKind::Movie, body);
        assert_eq!(d.candidate.title, "Матрица");
        assert_eq!(d.candidate.original_title.as_deref(), Some("The Matrix"));
        assert_eq!(d.candidate.year, Some(1999));
        assert_eq!(d.candidate.wikidata_id.as_deref(), Some("Q83495"));
        assert_eq!(d.overview, None);
        assert_eq!(d.cast.len(), 1);
        assert_eq!(d.cast[0].person_id, 6384);
    }

    #[test]
    fn series_details_use_name_and_first_air_date() {
        let body: DetailsResponse = serde_json::from_value(json!({
            "id": 1399,
            "name": "Игра престолов",
            "original_name": "Game of Thrones",
            "first_air_date": "2011-04-17",
            "external_ids": {"imdb_id": "", "wikidata_id": null}
        }))
        .unwrap();
        let d = details_from(MediaKind::Series, body);
        assert_eq!(d.candidate.title, "Игра престолов");
        assert_eq!(d.candidate.year, Some(2011));
        assert_eq!(d.candidate.imdb_id, None);
        assert!(d.cast.is_empty());
    }

    #[test]
    fn unreleased_dates_have_no_year() {
        assert_eq!(year_of(""), None);
        assert_eq!(year_of("2025-12-31"), Some(2025));
    }

    #[tokio::test]
    async fn backlog_pages_stored_rows() {
        let store = Arc::new(MemoryStore::new());
        for id in 1..=60 {
            let mut c = crate::resolve::tests::candidate("Пример", None);
            c.tmdb_id = id;
            let rec = PersistedRecord::assemble(
                &MediaDetails::bare(c),
                &ResolvedIdentifier::unresolved(id),
                RatingSet::default(),
            );
            store.insert_media(&rec).await.unwrap();
        }
        let feed = BacklogFeed::new(store, MediaKind::Movie);
        assert_eq!(feed.key(), "backlog-movie");
        let first = feed.fetch_page(None, 1).await.unwrap();
        assert_eq!(first.total_pages, 2);
        assert_eq!(first.items.len(), 50);
        let second = feed.fetch_page(None, 2).await.unwrap();
        assert_eq!(second.items.len(), 10);
        let details = feed.details(&second.items[0]).await.unwrap();
        assert_eq!(details.candidate.tmdb_id, 51);
    }
}
