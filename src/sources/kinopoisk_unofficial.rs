use async_trait::async_trait;
use serde_json::Value;

use super::{
    outcome_from, value_as_f64, value_as_i64, value_as_year, HttpClient, IdSource, LookupQuery,
    Plausibility, QueryKind, Rejections, SourceError, SourceHit, SourceOutcome,
};
use crate::media::{Confidence, RatingSet};

/// Unofficial Kinopoisk API, queried by IMDb id.
///
/// `GET /api/v2.2/films?imdbId=tt...` with an `X-API-KEY` header. The film
/// list also carries both ratings, which are passed along as hints.
#[derive(Debug, Clone)]
pub struct KinopoiskUnofficialSource {
    base_url: String,
    http: HttpClient,
    api_key: String,
    plausibility: Plausibility,
}

impl KinopoiskUnofficialSource {
    pub fn new(http: HttpClient, api_key: String, plausibility: Plausibility) -> Self {
        Self {
            base_url: "https://kinopoiskapiunofficial.tech".to_string(),
            http,
            api_key,
            plausibility,
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    async fn lookup(&self, query: &LookupQuery) -> Result<SourceOutcome, SourceError> {
        let Some(imdb_id) = query.imdb_id.as_deref() else {
            return Ok(SourceOutcome::Empty);
        };
        let url = format!("{}/api/v2.2/films", self.base_url);
        let req = self
            .http
            .get(&url)
            .header("X-API-KEY", &self.api_key)
            .header("Accept", "application/json")
            .query(&[("imdbId", imdb_id)]);
        let body: Value = self.http.fetch_json(req).await?;
        Ok(parse_films(&body, query, &self.plausibility))
    }
}

#[async_trait]
impl IdSource for KinopoiskUnofficialSource {
    fn name(&self) -> &'static str {
        "kinopoisk_unofficial"
    }

    fn confidence(&self) -> Confidence {
        Confidence::ExactId
    }

    fn query_kind(&self) -> QueryKind {
        QueryKind::ExternalId
    }

    fn timeout(&self) -> std::time::Duration {
        self.http.timeout()
    }

    async fn resolve(&self, query: &LookupQuery) -> SourceOutcome {
        if query.imdb_id.is_none() {
            return SourceOutcome::Empty;
        }
        outcome_from(self.lookup(query).await)
    }
}

fn parse_films(body: &Value, query: &LookupQuery, plausibility: &Plausibility) -> SourceOutcome {
    let Some(items) = body.get("items").and_then(Value::as_array) else {
        return SourceOutcome::Empty;
    };
    let wanted_imdb = query.imdb_id.as_deref().map(str::to_ascii_lowercase);
    let mut rejections = Rejections::default();

    let hit = items
        .iter()
        .filter(|item| {
            // The endpoint filters server-side, but older deployments ignore unknown params.
            match (&wanted_imdb, item.get("imdbId").and_then(|v| v.as_str())) {
                (Some(wanted), Some(found)) => found.eq_ignore_ascii_case(wanted),
                _ => true,
            }
        })
        .filter(|item| {
            let year = item.get("year").and_then(value_as_year);
            plausibility.year_ok(query.kind, query.year, year)
        })
        .find_map(|item| {
            let kp_id = item.get("kinopoiskId").and_then(value_as_i64)?;
            if !rejections.admit(plausibility, kp_id) {
                return None;
            }
            let ratings = RatingSet {
                kp_rating: item
                    .get("ratingKinopoisk")
                    .and_then(value_as_f64)
                    .unwrap_or(0.0),
                kp_votes: 0,
                imdb_rating: item.get("ratingImdb").and_then(value_as_f64).unwrap_or(0.0),
                imdb_votes: 0,
            };
            Some(SourceHit::new(kp_id, Confidence::ExactId).with_ratings(ratings))
        });
    rejections.outcome(hit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaKind;
    use serde_json::json;

    fn query(imdb: &str, year: i32) -> LookupQuery {
        LookupQuery {
            kind: MediaKind::Movie,
            title: Some("Пример".into()),
            original_title: None,
            year: Some(year),
            imdb_id: Some(imdb.into()),
            wikidata_id: None,
        }
    }

    #[test]
    fn picks_matching_imdb_item_with_rating_hints() {
        let body = json!({"total": 2, "items": [
            {"kinopoiskId": 111111, "imdbId": "tt0000001", "year": 2024},
            {"kinopoiskId": 555555, "imdbId": "tt9999999", "year": 2024,
             "ratingKinopoisk": 7.4, "ratingImdb": "6.9"}
        ]});
        let SourceOutcome::Found(hit) =
            parse_films(&body, &query("tt9999999", 2024), &Plausibility::default())
        else {
            panic!("expected a hit");
        };
        assert_eq!(hit.kp_id, 555_555);
        assert_eq!(hit.ratings_hint.kp_rating, 7.4);
        assert_eq!(hit.ratings_hint.imdb_rating, 6.9);
    }

    #[test]
    fn rejects_year_mismatch() {
        let body = json!({"items": [{"kinopoiskId": 555555, "imdbId": "tt9999999", "year": 1999}]});
        assert_eq!(
            parse_films(&body, &query("tt9999999", 2024), &Plausibility::default()),
            SourceOutcome::Empty
        );
    }

    #[test]
    fn missing_items_is_empty() {
        assert_eq!(
            parse_films(&json!({"total": 0}), &query("tt1", 2024), &Plausibility::default()),
            SourceOutcome::Empty
        );
    }

    #[test]
    fn implausible_only_item_is_rejected() {
        let body = json!({"items": [{"kinopoiskId": 12, "imdbId": "tt9999999", "year": 2024}]});
        assert!(matches!(
            parse_films(&body, &query("tt9999999", 2024), &Plausibility::default()),
            SourceOutcome::Rejected(_)
        ));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transient() {
        let http = HttpClient::new(std::time::Duration::from_secs(1)).unwrap();
        let source = KinopoiskUnofficialSource::new(http, "key".into(), Plausibility::default())
            .with_base_url("http://127.0.0.1:9/");
        assert!(matches!(
            source.resolve(&query("tt9999999", 2024)).await,
            SourceOutcome::Transient(_)
        ));
    }
}
