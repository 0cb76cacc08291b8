use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{
    outcome_from, HttpClient, IdSource, LookupQuery, Plausibility, QueryKind, Rejections,
    SourceError, SourceHit, SourceOutcome,
};
use crate::media::Confidence;

/// Wikidata property "Kinopoisk film ID".
const KINOPOISK_PROPERTY: &str = "P2603";
/// Wikidata property "IMDb ID".
const IMDB_PROPERTY: &str = "P345";

/// Structured-data lookup: Wikidata entity → P2603 claim.
///
/// Uses the candidate's Wikidata id when TMDB supplied one; otherwise finds the
/// entity through a `haswbstatement` search on the IMDb id.
#[derive(Debug, Clone)]
pub struct WikidataSource {
    base_url: String,
    http: HttpClient,
    plausibility: Plausibility,
}

impl WikidataSource {
    pub fn new(http: HttpClient, plausibility: Plausibility) -> Self {
        Self {
            base_url: "https://www.wikidata.org".to_string(),
            http,
            plausibility,
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    async fn find_entity_by_imdb(&self, imdb_id: &str) -> Result<Option<String>, SourceError> {
        let url = format!("{}/w/api.php", self.base_url);
        let search = format!("haswbstatement:{IMDB_PROPERTY}={imdb_id}");
        let req = self.http.get(&url).query(&[
            ("action", "query"),
            ("list", "search"),
            ("srsearch", search.as_str()),
            ("srlimit", "1"),
            ("format", "json"),
        ]);
        let body: Value = self.http.fetch_json(req).await?;
        Ok(parse_search_entity(&body))
    }

    async fn lookup(&self, query: &LookupQuery) -> Result<SourceOutcome, SourceError> {
        let entity = match (&query.wikidata_id, &query.imdb_id) {
            (Some(qid), _) => Some(qid.clone()),
            (None, Some(imdb)) => self.find_entity_by_imdb(imdb).await?,
            (None, None) => None,
        };
        let Some(entity) = entity else {
            return Ok(SourceOutcome::Empty);
        };
        let url = format!("{}/wiki/Special:EntityData/{}.json", self.base_url, entity);
        let body: Value = self.http.fetch_json(self.http.get(&url)).await?;
        debug!(entity = %entity, "wikidata entity fetched");
        Ok(parse_entity(&body, &self.plausibility))
    }
}

#[async_trait]
impl IdSource for WikidataSource {
    fn name(&self) -> &'static str {
        "wikidata"
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
        if !query.has_external_id() {
            return SourceOutcome::Empty;
        }
        outcome_from(self.lookup(query).await)
    }
}

/// `query.search[0].title` is the entity id ("Q123").
fn parse_search_entity(body: &Value) -> Option<String> {
    body.get("query")?
        .get("search")?
        .as_array()?
        .first()?
        .get("title")?
        .as_str()
        .filter(|t| t.starts_with('Q'))
        .map(str::to_string)
}

/// First plausible P2603 value of the (single) entity in an EntityData payload.
///
/// The entities map is keyed by the canonical id, which differs from the
/// requested one after a merge redirect, so the key is not checked.
fn parse_entity(body: &Value, plausibility: &Plausibility) -> SourceOutcome {
    let Some(claims) = kp_claims(body) else {
        return SourceOutcome::Empty;
    };
    let mut rejections = Rejections::default();
    let kp_id = claims
        .iter()
        .filter_map(|claim| {
            claim
                .get("mainsnak")?
                .get("datavalue")?
                .get("value")?
                .as_str()?
                .trim()
                .parse::<i64>()
                .ok()
        })
        .find(|id| rejections.admit(plausibility, *id));
    rejections.outcome(kp_id.map(|id| SourceHit::new(id, Confidence::ExactId)))
}

fn kp_claims(body: &Value) -> Option<&Vec<Value>> {
    let entity = body.get("entities")?.as_object()?.values().next()?;
    entity.get("claims")?.get(KINOPOISK_PROPERTY)?.as_array()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity_with_claims(values: &[&str]) -> Value {
        let claims: Vec<Value> = values
            .iter()
            .map(|v| json!({"mainsnak": {"datavalue": {"value": v, "type": "string"}}}))
            .collect();
        json!({"entities": {"Q1000": {"id": "Q1000", "claims": {"P2603": claims}}}})
    }

    fn found(kp_id: i64) -> SourceOutcome {
        SourceOutcome::Found(SourceHit::new(kp_id, Confidence::ExactId))
    }

    #[test]
    fn extracts_kinopoisk_claim() {
        let body = entity_with_claims(&["555555"]);
        assert_eq!(parse_entity(&body, &Plausibility::default()), found(555_555));
    }

    #[test]
    fn skips_poisoned_claim_and_takes_next() {
        let body = entity_with_claims(&["430", "777777"]);
        assert_eq!(parse_entity(&body, &Plausibility::default()), found(777_777));
    }

    #[test]
    fn poisoned_only_claim_is_reported_as_rejected() {
        let body = entity_with_claims(&["430"]);
        assert!(matches!(
            parse_entity(&body, &Plausibility::default()),
            SourceOutcome::Rejected(reason) if reason.contains("430")
        ));
    }

    #[test]
    fn entity_without_property_yields_empty() {
        let body = json!({"entities": {"Q1": {"claims": {"P345": []}}}});
        assert_eq!(parse_entity(&body, &Plausibility::default()), SourceOutcome::Empty);
    }

    #[test]
    fn search_returns_entity_title() {
        let body = json!({"query": {"search": [{"ns": 0, "title": "Q42"}]}});
        assert_eq!(parse_search_entity(&body).as_deref(), Some("Q42"));
        assert_eq!(parse_search_entity(&json!({"query": {"search": []}})), None);
    }

    #[tokio::test]
    async fn no_external_ids_means_no_network_call() {
        let http = HttpClient::new(std::time::Duration::from_secs(1)).unwrap();
        // An unroutable base url would surface as Transient if it were contacted.
        let source = WikidataSource::new(http, Plausibility::default())
            .with_base_url("http://127.0.0.1:9");
        let query = LookupQuery {
            kind: crate::media::MediaKind::Movie,
            title: Some("Example".into()),
            original_title: None,
            year: Some(2020),
            imdb_id: None,
            wikidata_id: None,
        };
        assert_eq!(source.resolve(&query).await, SourceOutcome::Empty);
    }
}
