//! Identifier-resolution sources.
//!
//! Every source answers one question: "give me zero or one plausible Kinopoisk
//! id for this query". Network errors, non-2xx statuses, malformed payloads and
//! timeouts all come back as [`SourceOutcome::Transient`]; nothing here panics
//! or propagates an error to the orchestrator.

pub mod http;
pub mod kinobd;
pub mod kinopoisk_unofficial;
pub mod kodik;
pub mod matching;
pub mod search_scrape;
pub mod wikidata;

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::media::{CandidateMedia, Confidence, MediaKind, RatingSet};

pub use http::HttpClient;
pub use kinobd::KinoBdTitleSource;
pub use kinopoisk_unofficial::KinopoiskUnofficialSource;
pub use kodik::{KodikClient, KodikImdbSource, KodikTitleSource};
pub use search_scrape::SearchScrapeSource;
pub use wikidata::WikidataSource;

/// Default per-call budget for an uncontrolled third-party endpoint.
pub const DEFAULT_SOURCE_TIMEOUT: Duration = Duration::from_secs(6);

/// The highly-linked title that search engines keep returning for unrelated queries.
pub const POISON_KP_ID: i64 = 430;

/// Kinopoisk ids below this are service pages or stale redirects, never real titles.
pub const DEFAULT_MIN_KP_ID: i64 = 300;

/// What a source keys its lookup on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// Direct join on IMDb / Wikidata ids.
    ExternalId,
    /// Title (and year) text search; only meaningful for Cyrillic titles.
    FreeText,
}

/// Query handed to every source.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupQuery {
    pub kind: MediaKind,
    pub title: Option<String>,
    pub original_title: Option<String>,
    pub year: Option<i32>,
    pub imdb_id: Option<String>,
    pub wikidata_id: Option<String>,
}

impl LookupQuery {
    pub fn from_candidate(candidate: &CandidateMedia) -> Self {
        Self {
            kind: candidate.kind,
            title: non_blank(Some(candidate.title.as_str())),
            original_title: non_blank(candidate.original_title.as_deref()),
            year: candidate.year,
            imdb_id: non_blank(candidate.imdb_id.as_deref()),
            wikidata_id: non_blank(candidate.wikidata_id.as_deref()),
        }
    }

    pub fn has_external_id(&self) -> bool {
        self.imdb_id.is_some() || self.wikidata_id.is_some()
    }
}

fn non_blank(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// A candidate id returned by one source, with whatever ratings it carried along.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceHit {
    pub kp_id: i64,
    pub confidence: Confidence,
    pub ratings_hint: RatingSet,
}

impl SourceHit {
    pub fn new(kp_id: i64, confidence: Confidence) -> Self {
        Self {
            kp_id,
            confidence,
            ratings_hint: RatingSet::default(),
        }
    }

    pub fn with_ratings(mut self, ratings: RatingSet) -> Self {
        self.ratings_hint = ratings;
        self
    }
}

/// Result of asking one source. The orchestrator branches on this explicitly.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceOutcome {
    Found(SourceHit),
    /// The source answered but had nothing usable (or was not applicable).
    Empty,
    /// The source answered with something implausible.
    Rejected(String),
    /// Network error, bad status, malformed payload or timeout.
    Transient(String),
}

impl SourceOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            SourceOutcome::Found(_) => "found",
            SourceOutcome::Empty => "empty",
            SourceOutcome::Rejected(_) => "rejected",
            SourceOutcome::Transient(_) => "transient",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed payload: {0}")]
    Decode(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl From<SourceError> for SourceOutcome {
    fn from(err: SourceError) -> Self {
        SourceOutcome::Transient(err.to_string())
    }
}

/// Fold an adapter's internal result into the outcome the orchestrator sees.
pub fn outcome_from(result: Result<SourceOutcome, SourceError>) -> SourceOutcome {
    result.unwrap_or_else(SourceOutcome::from)
}

/// Remembers the first implausible id an adapter dropped, so a response that
/// offered nothing else reads as [`SourceOutcome::Rejected`] in the item trail.
#[derive(Debug, Default)]
pub(crate) struct Rejections {
    first: Option<String>,
}

impl Rejections {
    /// `true` when the id may be used; otherwise the reason is kept.
    pub(crate) fn admit(&mut self, plausibility: &Plausibility, kp_id: i64) -> bool {
        match plausibility.check_id(kp_id) {
            Ok(()) => true,
            Err(reason) => {
                self.first.get_or_insert(reason);
                false
            }
        }
    }

    pub(crate) fn outcome(self, hit: Option<SourceHit>) -> SourceOutcome {
        match (hit, self.first) {
            (Some(hit), _) => SourceOutcome::Found(hit),
            (None, Some(reason)) => SourceOutcome::Rejected(reason),
            (None, None) => SourceOutcome::Empty,
        }
    }
}

/// One capability every resolution source implements.
#[async_trait]
pub trait IdSource: Send + Sync {
    /// Stable name recorded as the source attribution of a resolved id.
    fn name(&self) -> &'static str;

    fn confidence(&self) -> Confidence;

    fn query_kind(&self) -> QueryKind;

    fn timeout(&self) -> Duration {
        DEFAULT_SOURCE_TIMEOUT
    }

    async fn resolve(&self, query: &LookupQuery) -> SourceOutcome;
}

/// Plausibility rules shared by sources and the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct Plausibility {
    pub min_kp_id: i64,
    pub poison_ids: Vec<i64>,
    pub movie_year_tolerance: i32,
    pub series_year_tolerance: i32,
}

impl Default for Plausibility {
    fn default() -> Self {
        Self {
            min_kp_id: DEFAULT_MIN_KP_ID,
            poison_ids: vec![POISON_KP_ID],
            movie_year_tolerance: 1,
            series_year_tolerance: 3,
        }
    }
}

impl Plausibility {
    /// `Err(reason)` when the id must not be accepted from any source.
    pub fn check_id(&self, kp_id: i64) -> Result<(), String> {
        if self.poison_ids.contains(&kp_id) {
            return Err(format!("kp id {kp_id} is blacklisted"));
        }
        if kp_id < self.min_kp_id {
            return Err(format!(
                "kp id {kp_id} below plausible minimum {}",
                self.min_kp_id
            ));
        }
        Ok(())
    }

    /// Series years drift between first air date and latest season, so they get more slack.
    pub fn year_ok(&self, kind: MediaKind, wanted: Option<i32>, found: Option<i32>) -> bool {
        let (Some(wanted), Some(found)) = (wanted, found) else {
            return true;
        };
        let tolerance = match kind {
            MediaKind::Movie => self.movie_year_tolerance,
            MediaKind::Series => self.series_year_tolerance,
        };
        (wanted - found).abs() <= tolerance
    }
}

/// Accept ids encoded either as JSON numbers or numeric strings.
pub(crate) fn value_as_i64(v: &Value) -> Option<i64> {
    if let Some(n) = v.as_i64() {
        return Some(n);
    }
    if let Some(f) = v.as_f64() {
        return Some(f as i64);
    }
    v.as_str().and_then(|s| s.trim().parse::<i64>().ok())
}

pub(crate) fn value_as_f64(v: &Value) -> Option<f64> {
    if let Some(n) = v.as_f64() {
        return Some(n);
    }
    v.as_str()
        .and_then(|s| s.trim().replace(',', ".").parse::<f64>().ok())
}

/// Year fields arrive as numbers, "2024", or "2019-2023" ranges; take the first year.
pub(crate) fn value_as_year(v: &Value) -> Option<i32> {
    if let Some(n) = v.as_i64() {
        return i32::try_from(n).ok();
    }
    let s = v.as_str()?.trim();
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.len() == 4 {
        digits.parse().ok()
    } else {
        None
    }
}
