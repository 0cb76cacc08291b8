use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Movie or series; TMDB keeps them in separate id spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Movie,
    Series,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Movie => "movie",
            MediaKind::Series => "series",
        }
    }

    /// Path segment TMDB uses for this kind.
    pub fn tmdb_path(&self) -> &'static str {
        match self {
            MediaKind::Movie => "movie",
            MediaKind::Series => "tv",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "movie" | "film" | "movies" => Ok(MediaKind::Movie),
            "series" | "tv" | "show" => Ok(MediaKind::Series),
            other => Err(anyhow::anyhow!("unknown media kind: {other}")),
        }
    }
}

/// One title to resolve, as enumerated by a feed. Read-only during resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateMedia {
    pub tmdb_id: i64,
    pub kind: MediaKind,
    /// Display title in the site language (Russian).
    pub title: String,
    pub original_title: Option<String>,
    pub year: Option<i32>,
    pub imdb_id: Option<String>,
    pub wikidata_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CastMember {
    pub person_id: i64,
    pub name: String,
    pub original_name: Option<String>,
    pub character: Option<String>,
    pub order: i32,
    pub profile_path: Option<String>,
}

/// Candidate plus the extended metadata the details endpoint returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaDetails {
    pub candidate: CandidateMedia,
    pub overview: Option<String>,
    pub poster_path: Option<String>,
    pub cast: Vec<CastMember>,
}

impl MediaDetails {
    pub fn bare(candidate: CandidateMedia) -> Self {
        Self {
            candidate,
            overview: None,
            poster_path: None,
            cast: Vec::new(),
        }
    }
}

/// How much a resolved Kinopoisk id can be trusted. Ordered low to high.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Free-text search engine scrape.
    ScrapedHeuristic,
    /// Aggregator title/year search.
    TitleSearch,
    /// Direct key join on an external id (IMDb, Wikidata).
    ExactId,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::ScrapedHeuristic => "scraped_heuristic",
            Confidence::TitleSearch => "title_search",
            Confidence::ExactId => "exact_id",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "scraped_heuristic" => Some(Confidence::ScrapedHeuristic),
            "title_search" => Some(Confidence::TitleSearch),
            "exact_id" => Some(Confidence::ExactId),
            _ => None,
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Two independent rating scales plus vote counts. Zero means "unknown".
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RatingSet {
    pub kp_rating: f64,
    pub kp_votes: i64,
    pub imdb_rating: f64,
    pub imdb_votes: i64,
}

impl RatingSet {
    pub fn has_kp(&self) -> bool {
        self.kp_rating > 0.0
    }

    pub fn has_imdb(&self) -> bool {
        self.imdb_rating > 0.0
    }

    pub fn is_complete(&self) -> bool {
        self.has_kp() && self.has_imdb()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_kp() && !self.has_imdb()
    }
}

/// Outcome of resolution for one candidate. `kp_id == None` is a valid terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedIdentifier {
    pub tmdb_id: i64,
    pub kp_id: Option<i64>,
    pub source: Option<String>,
    pub confidence: Option<Confidence>,
}

impl ResolvedIdentifier {
    pub fn unresolved(tmdb_id: i64) -> Self {
        Self {
            tmdb_id,
            kp_id: None,
            source: None,
            confidence: None,
        }
    }
}

/// The durable row, unique by `tmdb_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub tmdb_id: i64,
    pub kind: MediaKind,
    pub title: String,
    pub original_title: Option<String>,
    pub year: Option<i32>,
    pub imdb_id: Option<String>,
    pub wikidata_id: Option<String>,
    pub kp_id: Option<i64>,
    pub kp_source: Option<String>,
    pub kp_confidence: Option<Confidence>,
    pub ratings: RatingSet,
    pub overview: Option<String>,
    pub poster_path: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl PersistedRecord {
    /// Fold candidate, resolution and ratings into one row.
    pub fn assemble(
        details: &MediaDetails,
        resolved: &ResolvedIdentifier,
        ratings: RatingSet,
    ) -> Self {
        let c = &details.candidate;
        Self {
            tmdb_id: c.tmdb_id,
            kind: c.kind,
            title: c.title.clone(),
            original_title: c.original_title.clone(),
            year: c.year,
            imdb_id: c.imdb_id.clone(),
            wikidata_id: c.wikidata_id.clone(),
            kp_id: resolved.kp_id,
            kp_source: resolved.source.clone(),
            kp_confidence: resolved.confidence,
            ratings,
            overview: details.overview.clone(),
            poster_path: details.poster_path.clone(),
            updated_at: Utc::now(),
        }
    }

    /// Rebuild the candidate a stored row was created from (backlog resyncs).
    pub fn to_candidate(&self) -> CandidateMedia {
        CandidateMedia {
            tmdb_id: self.tmdb_id,
            kind: self.kind,
            title: self.title.clone(),
            original_title: self.original_title.clone(),
            year: self.year,
            imdb_id: self.imdb_id.clone(),
            wikidata_id: self.wikidata_id.clone(),
        }
    }
}
