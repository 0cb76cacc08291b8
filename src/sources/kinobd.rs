use async_trait::async_trait;
use serde_json::Value;

use super::matching::{best_similarity, has_cyrillic, MIN_TITLE_SIMILARITY};
use super::{
    outcome_from, value_as_f64, value_as_i64, value_as_year, HttpClient, IdSource, LookupQuery,
    Plausibility, QueryKind, Rejections, SourceError, SourceHit, SourceOutcome,
};
use crate::media::{Confidence, RatingSet};

/// KinoBD title search (`/api/films/search/title?q=...`). No key required.
#[derive(Debug, Clone)]
pub struct KinoBdTitleSource {
    base_url: String,
    http: HttpClient,
    plausibility: Plausibility,
}

impl KinoBdTitleSource {
    pub fn new(http: HttpClient, plausibility: Plausibility) -> Self {
        Self {
            base_url: "https://kinobd.net".to_string(),
            http,
            plausibility,
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    async fn lookup(&self, query: &LookupQuery) -> Result<SourceOutcome, SourceError> {
        let Some(title) = query.title.as_deref() else {
            return Ok(SourceOutcome::Empty);
        };
        let url = format!("{}/api/films/search/title", self.base_url);
        let req = self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .query(&[("q", title)]);
        let body: Value = self.http.fetch_json(req).await?;
        Ok(parse_search(&body, query, &self.plausibility))
    }
}

#[async_trait]
impl IdSource for KinoBdTitleSource {
    fn name(&self) -> &'static str {
        "kinobd_title"
    }

    fn confidence(&self) -> Confidence {
        Confidence::TitleSearch
    }

    fn query_kind(&self) -> QueryKind {
        QueryKind::FreeText
    }

    fn timeout(&self) -> std::time::Duration {
        self.http.timeout()
    }

    async fn resolve(&self, query: &LookupQuery) -> SourceOutcome {
        if !query.title.as_deref().is_some_and(has_cyrillic) {
            return SourceOutcome::Empty;
        }
        outcome_from(self.lookup(query).await)
    }
}

fn parse_search(body: &Value, query: &LookupQuery, plausibility: &Plausibility) -> SourceOutcome {
    // Older deployments return a bare array, newer ones wrap it in `data`.
    let Some(items) = body
        .get("data")
        .and_then(|d| d.as_array())
        .or_else(|| body.as_array())
    else {
        return SourceOutcome::Empty;
    };
    let wanted: Vec<&str> = query
        .title
        .iter()
        .chain(query.original_title.iter())
        .map(String::as_str)
        .collect();

    let mut rejections = Rejections::default();
    let hit = items.iter().find_map(|item| {
        let kp_id = item.get("kinopoisk_id").and_then(value_as_i64)?;
        if !rejections.admit(plausibility, kp_id) {
            return None;
        }
        let year = item.get("year").and_then(value_as_year);
        // A title search without a year on either side is too loose to trust.
        if year.is_none() || !plausibility.year_ok(query.kind, query.year, year) {
            return None;
        }
        let offered: Vec<&str> = ["name_russian", "name_original", "name"]
            .iter()
            .filter_map(|k| item.get(*k).and_then(|v| v.as_str()))
            .collect();
        if best_similarity(wanted.iter().copied(), offered.iter().copied()) < MIN_TITLE_SIMILARITY {
            return None;
        }
        let ratings = RatingSet {
            kp_rating: item.get("rating_kp").and_then(value_as_f64).unwrap_or(0.0),
            kp_votes: item.get("votes_kp").and_then(value_as_i64).unwrap_or(0),
            imdb_rating: item.get("rating_imdb").and_then(value_as_f64).unwrap_or(0.0),
            imdb_votes: item.get("votes_imdb").and_then(value_as_i64).unwrap_or(0),
        };
        Some(SourceHit::new(kp_id, Confidence::TitleSearch).with_ratings(ratings))
    });
    rejections.outcome(hit)
}
