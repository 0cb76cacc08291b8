//! Rating merge policy: ordered rating sources, per-scale "first positive wins".

use async_trait::async_trait;
use quick_xml::events::Event;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

use crate::media::RatingSet;
use crate::sources::{value_as_f64, HttpClient, SourceError};

/// Keys a rating source can be asked about.
#[derive(Debug, Clone, PartialEq)]
pub struct RatingQuery {
    pub kp_id: Option<i64>,
    pub imdb_id: Option<String>,
}

#[async_trait]
pub trait RatingSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn timeout(&self) -> Duration;

    /// Whether the query carries the key this source needs.
    fn applies_to(&self, query: &RatingQuery) -> bool;

    /// Partial sets are fine; `None` on any failure.
    async fn fetch(&self, query: &RatingQuery) -> Option<RatingSet>;
}

/// Fill each scale from `partial` only if it is still unknown in `acc`.
/// A scale's vote count travels with the value that won.
pub fn merge_missing(acc: &mut RatingSet, partial: &RatingSet) {
    if !acc.has_kp() && partial.has_kp() {
        acc.kp_rating = partial.kp_rating;
        acc.kp_votes = partial.kp_votes.max(0);
    }
    if !acc.has_imdb() && partial.has_imdb() {
        acc.imdb_rating = partial.imdb_rating;
        acc.imdb_votes = partial.imdb_votes.max(0);
    }
}

/// Ordered list of rating sources.
pub struct RatingMerger {
    sources: Vec<Arc<dyn RatingSource>>,
}

impl RatingMerger {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn RatingSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn source_names(&self) -> Vec<&'static str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    /// Query sources in order, then fall back to `hint` (ratings the resolving
    /// source returned alongside the id). Stops early once both scales are known.
    pub async fn collect(&self, query: &RatingQuery, hint: Option<&RatingSet>) -> RatingSet {
        let mut acc = RatingSet::default();
        for source in &self.sources {
            if acc.is_complete() {
                break;
            }
            if !source.applies_to(query) {
                continue;
            }
            match timeout(source.timeout(), source.fetch(query)).await {
                Ok(Some(partial)) => merge_missing(&mut acc, &partial),
                Ok(None) => debug!(source = source.name(), "rating source returned nothing"),
                Err(_) => debug!(source = source.name(), "rating source timed out"),
            }
        }
        if let Some(hint) = hint {
            merge_missing(&mut acc, hint);
        }
        acc
    }
}

impl Default for RatingMerger {
    fn default() -> Self {
        Self::new()
    }
}

/// `https://rating.kinopoisk.ru/<kp_id>.xml`.
#[derive(Debug, Clone)]
pub struct KinopoiskXmlRatings {
    base_url: String,
    http: HttpClient,
}

impl KinopoiskXmlRatings {
    pub fn new(http: HttpClient) -> Self {
        Self {
            base_url: "https://rating.kinopoisk.ru".to_string(),
            http,
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    async fn fetch_xml(&self, kp_id: i64) -> Result<RatingSet, SourceError> {
        let url = format!("{}/{}.xml", self.base_url, kp_id);
        let body = self.http.fetch_text(self.http.get(&url)).await?;
        parse_rating_xml(&body)
    }
}

#[async_trait]
impl RatingSource for KinopoiskXmlRatings {
    fn name(&self) -> &'static str {
        "kinopoisk_xml"
    }

    fn timeout(&self) -> Duration {
        self.http.timeout()
    }

    fn applies_to(&self, query: &RatingQuery) -> bool {
        query.kp_id.is_some()
    }

    async fn fetch(&self, query: &RatingQuery) -> Option<RatingSet> {
        let kp_id = query.kp_id?;
        match self.fetch_xml(kp_id).await {
            Ok(set) => Some(set),
            Err(err) => {
                debug!(kp_id, error = %err, "kinopoisk xml rating failed");
                None
            }
        }
    }
}

/// Parse `<rating><kp_rating num_vote="..">7.8</kp_rating><imdb_rating num_vote="..">7.5</imdb_rating></rating>`.
pub fn parse_rating_xml(xml: &str) -> Result<RatingSet, SourceError> {
    #[derive(Clone, Copy)]
    enum Scale {
        Kp,
        Imdb,
    }

    let mut reader = quick_xml::Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut set = RatingSet::default();
    let mut current: Option<Scale> = None;
    let mut saw_root = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                let scale = match e.name().as_ref() {
                    b"rating" => {
                        saw_root = true;
                        None
                    }
                    b"kp_rating" => Some(Scale::Kp),
                    b"imdb_rating" => Some(Scale::Imdb),
                    _ => None,
                };
                if let Some(scale) = scale {
                    let mut votes = 0i64;
                    for attr in e.attributes().flatten() {
                        if attr.key.as_ref() == b"num_vote" {
                            if let Ok(raw) = attr.unescape_value() {
                                votes = raw.trim().parse().unwrap_or(0);
                            }
                        }
                    }
                    match scale {
                        Scale::Kp => set.kp_votes = votes,
                        Scale::Imdb => set.imdb_votes = votes,
                    }
                }
                current = scale;
            }
            Ok(Event::Text(t)) => {
                if let Some(scale) = current {
                    let value = t
                        .unescape()
                        .ok()
                        .and_then(|s| s.trim().parse::<f64>().ok())
                        .unwrap_or(0.0);
                    match scale {
                        Scale::Kp => set.kp_rating = value,
                        Scale::Imdb => set.imdb_rating = value,
                    }
                }
            }
            Ok(Event::End(_)) => current = None,
            Ok(Event::Eof) => break,
            Err(e) => return Err(SourceError::Decode(e.to_string())),
            _ => {}
        }
    }

    if !saw_root {
        return Err(SourceError::Decode("missing <rating> root".to_string()));
    }
    // A vote count without a rating is meaningless downstream.
    if !set.has_kp() {
        set.kp_votes = 0;
    }
    if !set.has_imdb() {
        set.imdb_votes = 0;
    }
    Ok(set)
}

/// OMDb lookup by IMDb id; only contributes the IMDb scale.
#[derive(Debug, Clone)]
pub struct OmdbRatings {
    base_url: String,
    http: HttpClient,
    api_key: String,
}

impl OmdbRatings {
    pub fn new(http: HttpClient, api_key: String) -> Self {
        Self {
            base_url: "https://www.omdbapi.com".to_string(),
            http,
            api_key,
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    async fn fetch_json(&self, imdb_id: &str) -> Result<Value, SourceError> {
        let url = format!("{}/", self.base_url);
        let req = self
            .http
            .get(&url)
            .query(&[("i", imdb_id), ("apikey", self.api_key.as_str())]);
        self.http.fetch_json(req).await
    }
}

#[async_trait]
impl RatingSource for OmdbRatings {
    fn name(&self) -> &'static str {
        "omdb"
    }

    fn timeout(&self) -> Duration {
        self.http.timeout()
    }

    fn applies_to(&self, query: &RatingQuery) -> bool {
        query.imdb_id.is_some()
    }

    async fn fetch(&self, query: &RatingQuery) -> Option<RatingSet> {
        let imdb_id = query.imdb_id.as_deref()?;
        match self.fetch_json(imdb_id).await {
            Ok(body) => parse_omdb(&body),
            Err(err) => {
                debug!(imdb_id, error = %err, "omdb rating failed");
                None
            }
        }
    }
}

/// `"N/A"` and unparsable values become 0 (unknown).
pub fn parse_omdb(body: &Value) -> Option<RatingSet> {
    if body.get("Response").and_then(|v| v.as_str()) != Some("True") {
        return None;
    }
    let imdb_rating = body
        .get("imdbRating")
        .and_then(value_as_f64)
        .filter(|r| r.is_finite() && *r > 0.0)
        .unwrap_or(0.0);
    let imdb_votes = body
        .get("imdbVotes")
        .and_then(|v| v.as_str())
        .and_then(|s| s.replace(',', "").trim().parse::<i64>().ok())
        .unwrap_or(0);
    Some(RatingSet {
        imdb_rating,
        imdb_votes: if imdb_rating > 0.0 { imdb_votes } else { 0 },
        ..RatingSet::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedRatings {
        name: &'static str,
        set: Option<RatingSet>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl FixedRatings {
        fn new(name: &'static str, set: Option<RatingSet>) -> Arc<Self> {
            Arc::new(Self {
                name,
                set,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RatingSource for FixedRatings {
        fn name(&self) -> &'static str {
            self.name
        }

        fn timeout(&self) -> Duration {
            Duration::from_millis(50)
        }

        fn applies_to(&self, _query: &RatingQuery) -> bool {
            true
        }

        async fn fetch(&self, _query: &RatingQuery) -> Option<RatingSet> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.set
        }
    }

    fn query() -> RatingQuery {
        RatingQuery {
            kp_id: Some(555_555),
            imdb_id: Some("tt9999999".into()),
        }
    }

    #[tokio::test]
    async fn scales_merge_independently_across_sources() {
        let xml = FixedRatings::new(
            "xml",
            Some(RatingSet {
                kp_rating: 7.8,
                kp_votes: 1200,
                imdb_rating: 0.0,
                imdb_votes: 0,
            }),
        );
        let omdb = FixedRatings::new(
            "omdb",
            Some(RatingSet {
                kp_rating: 5.0,
                kp_votes: 1,
                imdb_rating: 7.2,
                imdb_votes: 3400,
            }),
        );
        let merger = RatingMerger::new().with_source(xml).with_source(omdb);
        let set = merger.collect(&query(), None).await;
        assert_eq!(set.kp_rating, 7.8);
        assert_eq!(set.kp_votes, 1200);
        assert_eq!(set.imdb_rating, 7.2);
        assert_eq!(set.imdb_votes, 3400);
    }

    #[tokio::test]
    async fn stops_once_both_scales_known() {
        let full = FixedRatings::new(
            "full",
            Some(RatingSet {
                kp_rating: 8.0,
                kp_votes: 10,
                imdb_rating: 7.0,
                imdb_votes: 10,
            }),
        );
        let later = FixedRatings::new("later", Some(RatingSet::default()));
        let merger = RatingMerger::new()
            .with_source(full)
            .with_source(later.clone());
        merger.collect(&query(), None).await;
        assert_eq!(later.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failures_and_timeouts_contribute_nothing() {
        let failing = FixedRatings::new("failing", None);
        let slow = Arc::new(FixedRatings {
            name: "slow",
            set: Some(RatingSet {
                kp_rating: 9.9,
                ..RatingSet::default()
            }),
            delay: Duration::from_millis(500),
            calls: AtomicUsize::new(0),
        });
        let hint = RatingSet {
            kp_rating: 6.1,
            kp_votes: 50,
            ..RatingSet::default()
        };
        let merger = RatingMerger::new().with_source(failing).with_source(slow);
        let set = merger.collect(&query(), Some(&hint)).await;
        assert_eq!(set.kp_rating, 6.1);
        assert_eq!(set.imdb_rating, 0.0);
    }

    #[tokio::test]
    async fn unreachable_rating_endpoints_yield_nothing() {
        let http = HttpClient::new(Duration::from_secs(1)).unwrap();
        let merger = RatingMerger::new()
            .with_source(Arc::new(
                KinopoiskXmlRatings::new(http.clone()).with_base_url("http://127.0.0.1:9/"),
            ))
            .with_source(Arc::new(
                OmdbRatings::new(http, "key".into()).with_base_url("http://127.0.0.1:9"),
            ));
        assert_eq!(merger.collect(&query(), None).await, RatingSet::default());
    }

    #[test]
    fn parses_rating_feed() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
            <rating><kp_rating num_vote="392441">8.337</kp_rating><imdb_rating num_vote="629818">8.20</imdb_rating></rating>"#;
        let set = parse_rating_xml(xml).unwrap();
        assert_eq!(set.kp_rating, 8.337);
        assert_eq!(set.kp_votes, 392_441);
        assert_eq!(set.imdb_rating, 8.2);
        assert_eq!(set.imdb_votes, 629_818);
    }

    #[test]
    fn feed_without_imdb_leaves_scale_unknown() {
        let xml = r#"<rating><kp_rating num_vote="12">0</kp_rating></rating>"#;
        let set = parse_rating_xml(xml).unwrap();
        assert_eq!(set, RatingSet::default());
    }

    #[test]
    fn html_error_page_is_a_decode_error() {
        assert!(parse_rating_xml("<html><body>captcha</body></html>").is_err());
    }

    #[test]
    fn omdb_na_is_unknown() {
        let body = json!({"Response": "True", "imdbRating": "N/A", "imdbVotes": "N/A"});
        assert_eq!(parse_omdb(&body), Some(RatingSet::default()));
        let body = json!({"Response": "True", "imdbRating": "7.5", "imdbVotes": "1,234"});
        let set = parse_omdb(&body).unwrap();
        assert_eq!(set.imdb_rating, 7.5);
        assert_eq!(set.imdb_votes, 1234);
        assert_eq!(parse_omdb(&json!({"Response": "False", "Error": "Invalid API key!"})), None);
    }
}
