use async_trait::async_trait;
use serde_json::Value;

use super::matching::{best_similarity, has_cyrillic, MIN_TITLE_SIMILARITY};
use super::{
    outcome_from, value_as_f64, value_as_i64, value_as_year, HttpClient, IdSource, LookupQuery,
    Plausibility, QueryKind, Rejections, SourceError, SourceHit, SourceOutcome,
};
use crate::media::{Confidence, MediaKind, RatingSet};

/// Kodik aggregator search API. Every player entry carries the Kinopoisk id of
/// the title it embeds, so one search response usually repeats the same id
/// across several translations.
#[derive(Debug, Clone)]
pub struct KodikClient {
    base_url: String,
    http: HttpClient,
    token: String,
    plausibility: Plausibility,
}

impl KodikClient {
    pub fn new(http: HttpClient, token: String, plausibility: Plausibility) -> Self {
        Self {
            base_url: "https://kodikapi.com".to_string(),
            http,
            token,
            plausibility,
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    async fn search(&self, params: &[(&str, String)]) -> Result<Value, SourceError> {
        let url = format!("{}/search", self.base_url);
        let mut query: Vec<(&str, String)> = vec![
            ("token", self.token.clone()),
            ("with_material_data", "true".to_string()),
            ("limit", "50".to_string()),
        ];
        query.extend(params.iter().cloned());
        let req = self.http.get(&url).query(&query);
        self.http.fetch_json(req).await
    }
}

/// Kodik search keyed by IMDb id.
#[derive(Debug, Clone)]
pub struct KodikImdbSource {
    client: KodikClient,
}

impl KodikImdbSource {
    pub fn new(client: KodikClient) -> Self {
        Self { client }
    }

    async fn lookup(&self, query: &LookupQuery) -> Result<SourceOutcome, SourceError> {
        let Some(imdb_id) = query.imdb_id.as_deref() else {
            return Ok(SourceOutcome::Empty);
        };
        let body = self
            .client
            .search(&[("imdb_id", imdb_id.to_string())])
            .await?;
        Ok(pick_result(
            &body,
            query,
            &self.client.plausibility,
            Match::Imdb(imdb_id),
        ))
    }
}

#[async_trait]
impl IdSource for KodikImdbSource {
    fn name(&self) -> &'static str {
        "kodik_imdb"
    }

    fn confidence(&self) -> Confidence {
        Confidence::ExactId
    }

    fn query_kind(&self) -> QueryKind {
        QueryKind::ExternalId
    }

    fn timeout(&self) -> std::time::Duration {
        self.client.http.timeout()
    }

    async fn resolve(&self, query: &LookupQuery) -> SourceOutcome {
        if query.imdb_id.is_none() {
            return SourceOutcome::Empty;
        }
        outcome_from(self.lookup(query).await)
    }
}

/// Kodik search keyed by display title (and year).
#[derive(Debug, Clone)]
pub struct KodikTitleSource {
    client: KodikClient,
}

impl KodikTitleSource {
    pub fn new(client: KodikClient) -> Self {
        Self { client }
    }

    async fn lookup(&self, query: &LookupQuery) -> Result<SourceOutcome, SourceError> {
        let Some(title) = query.title.as_deref() else {
            return Ok(SourceOutcome::Empty);
        };
        let mut params = vec![("title", title.to_string())];
        if let Some(year) = query.year {
            params.push(("year", year.to_string()));
        }
        let body = self.client.search(&params).await?;
        Ok(pick_result(
            &body,
            query,
            &self.client.plausibility,
            Match::Title,
        ))
    }
}

#[async_trait]
impl IdSource for KodikTitleSource {
    fn name(&self) -> &'static str {
        "kodik_title"
    }

    fn confidence(&self) -> Confidence {
        Confidence::TitleSearch
    }

    fn query_kind(&self) -> QueryKind {
        QueryKind::FreeText
    }

    fn timeout(&self) -> std::time::Duration {
        self.client.http.timeout()
    }

    async fn resolve(&self, query: &LookupQuery) -> SourceOutcome {
        if !query.title.as_deref().is_some_and(has_cyrillic) {
            return SourceOutcome::Empty;
        }
        outcome_from(self.lookup(query).await)
    }
}

#[derive(Clone, Copy)]
enum Match<'a> {
    Imdb(&'a str),
    Title,
}

fn result_kind(item: &Value) -> Option<MediaKind> {
    let ty = item.get("type")?.as_str()?;
    if ty.contains("serial") {
        Some(MediaKind::Series)
    } else if ty.contains("movie") {
        Some(MediaKind::Movie)
    } else {
        None
    }
}

fn material_ratings(item: &Value) -> RatingSet {
    let Some(material) = item.get("material_data") else {
        return RatingSet::default();
    };
    RatingSet {
        kp_rating: material
            .get("kinopoisk_rating")
            .and_then(value_as_f64)
            .unwrap_or(0.0),
        kp_votes: material
            .get("kinopoisk_votes")
            .and_then(value_as_i64)
            .unwrap_or(0),
        imdb_rating: material
            .get("imdb_rating")
            .and_then(value_as_f64)
            .unwrap_or(0.0),
        imdb_votes: material
            .get("imdb_votes")
            .and_then(value_as_i64)
            .unwrap_or(0),
    }
}

fn pick_result(
    body: &Value,
    query: &LookupQuery,
    plausibility: &Plausibility,
    matcher: Match<'_>,
) -> SourceOutcome {
    let Some(results) = body.get("results").and_then(Value::as_array) else {
        return SourceOutcome::Empty;
    };
    let wanted_titles: Vec<&str> = query
        .title
        .iter()
        .chain(query.original_title.iter())
        .map(String::as_str)
        .collect();

    let mut rejections = Rejections::default();
    let hit = results.iter().find_map(|item| {
        let kp_id = item.get("kinopoisk_id").and_then(value_as_i64)?;
        if !rejections.admit(plausibility, kp_id) {
            return None;
        }
        if result_kind(item).is_some_and(|k| k != query.kind) {
            return None;
        }
        let year = item.get("year").and_then(value_as_year);
        if !plausibility.year_ok(query.kind, query.year, year) {
            return None;
        }
        let confidence = match matcher {
            Match::Imdb(wanted) => {
                let found = item.get("imdb_id").and_then(|v| v.as_str())?;
                if !found.eq_ignore_ascii_case(wanted) {
                    return None;
                }
                Confidence::ExactId
            }
            Match::Title => {
                let offered: Vec<&str> = ["title", "title_orig", "other_title"]
                    .iter()
                    .filter_map(|k| item.get(*k).and_then(|v| v.as_str()))
                    .collect();
                if best_similarity(wanted_titles.iter().copied(), offered.iter().copied())
                    < MIN_TITLE_SIMILARITY
                {
                    return None;
                }
                Confidence::TitleSearch
            }
        };
        Some(SourceHit::new(kp_id, confidence).with_ratings(material_ratings(item)))
    });
    rejections.outcome(hit)
}
