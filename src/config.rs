//! Run configuration from the environment (`.env` honoured), plus wiring of
//! the source chains it enables.

use anyhow::Result;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::context::{DelaySpec, RunOptions};
use crate::ratings::{KinopoiskXmlRatings, OmdbRatings, RatingMerger};
use crate::resolve::Resolver;
use crate::sources::{
    HttpClient, KinoBdTitleSource, KinopoiskUnofficialSource, KodikClient, KodikImdbSource,
    KodikTitleSource, Plausibility, SearchScrapeSource, WikidataSource, DEFAULT_MIN_KP_ID,
    DEFAULT_SOURCE_TIMEOUT, POISON_KP_ID,
};
use crate::util::env::{env_flag, env_opt};
use crate::writer::{WriteMode, DEFAULT_CAST_LIMIT};

/// Problems that stop a run before the first item.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("missing required env var {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub tmdb_api_key: Option<String>,
    pub kodik_token: Option<String>,
    pub kinopoisk_api_key: Option<String>,
    pub omdb_api_key: Option<String>,
    pub item_delay: DelaySpec,
    pub page_delay: Duration,
    pub page_retries: u32,
    pub page_backoff: Duration,
    pub max_pages: Option<u32>,
    pub cast_limit: usize,
    pub persist_unresolved: bool,
    pub state_dir: PathBuf,
    pub source_timeout: Duration,
    pub plausibility: Plausibility,
}

impl SyncConfig {
    /// `DATABASE_URL` may only be absent for dry runs.
    pub fn from_env(require_database: bool) -> Result<Self, ConfigError> {
        let database_url = env_opt("DATABASE_URL");
        if require_database && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }
        let delay_min = parse_var("SYNC_ITEM_DELAY_MIN_MS", 400u64)?;
        let delay_max = parse_var("SYNC_ITEM_DELAY_MAX_MS", 1200u64)?;
        let timeout_secs = parse_var("SOURCE_TIMEOUT_SECS", DEFAULT_SOURCE_TIMEOUT.as_secs())?;
        if timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "SOURCE_TIMEOUT_SECS",
                value: "0".to_string(),
            });
        }
        let poison_ids = match env_opt("SYNC_POISON_IDS") {
            Some(raw) => parse_list("SYNC_POISON_IDS", &raw)?,
            None => vec![POISON_KP_ID],
        };

        Ok(Self {
            database_url,
            tmdb_api_key: env_opt("TMDB_API_KEY"),
            kodik_token: env_opt("KODIK_TOKEN"),
            kinopoisk_api_key: env_opt("KINOPOISK_API_KEY"),
            omdb_api_key: env_opt("OMDB_API_KEY"),
            item_delay: DelaySpec::between(
                Duration::from_millis(delay_min),
                Duration::from_millis(delay_max),
            ),
            page_delay: Duration::from_millis(parse_var("SYNC_PAGE_DELAY_MS", 3000u64)?),
            page_retries: parse_var("SYNC_PAGE_RETRIES", 3u32)?,
            page_backoff: Duration::from_millis(parse_var("SYNC_PAGE_BACKOFF_MS", 10_000u64)?),
            max_pages: env_opt("SYNC_MAX_PAGES")
                .map(|raw| parse_value("SYNC_MAX_PAGES", &raw))
                .transpose()?,
            cast_limit: parse_var("SYNC_CAST_LIMIT", DEFAULT_CAST_LIMIT)?,
            persist_unresolved: env_flag("SYNC_PERSIST_UNRESOLVED", true),
            state_dir: PathBuf::from(
                env_opt("SYNC_STATE_DIR").unwrap_or_else(|| "./.sync-state".to_string()),
            ),
            source_timeout: Duration::from_secs(timeout_secs),
            plausibility: Plausibility {
                min_kp_id: parse_var("SYNC_MIN_KP_ID", DEFAULT_MIN_KP_ID)?,
                poison_ids,
                ..Plausibility::default()
            },
        })
    }

    /// Required by every command that reads TMDB; checked before the first item.
    pub fn tmdb_key(&self) -> Result<&str, ConfigError> {
        self.tmdb_api_key
            .as_deref()
            .ok_or(ConfigError::Missing("TMDB_API_KEY"))
    }

    pub fn run_options(&self, mode: WriteMode) -> RunOptions {
        RunOptions {
            mode,
            persist_unresolved: self.persist_unresolved,
            item_delay: self.item_delay,
            page_delay: self.page_delay,
            page_retries: self.page_retries,
            page_backoff: self.page_backoff,
            year_range: None,
            max_pages: self.max_pages,
            cast_limit: self.cast_limit,
            only_missing: false,
        }
    }

    pub fn http(&self) -> Result<HttpClient> {
        HttpClient::new(self.source_timeout)
    }

    /// Sources in precedence order; a source whose credential is missing is left out.
    pub fn build_resolver(&self, http: &HttpClient) -> Result<Resolver> {
        let p = &self.plausibility;
        let mut resolver = Resolver::new(p.clone())
            .with_source(Arc::new(WikidataSource::new(http.clone(), p.clone())));
        if let Some(key) = &self.kinopoisk_api_key {
            resolver = resolver.with_source(Arc::new(KinopoiskUnofficialSource::new(
                http.clone(),
                key.clone(),
                p.clone(),
            )));
        }
        if let Some(token) = &self.kodik_token {
            let kodik = KodikClient::new(http.clone(), token.clone(), p.clone());
            resolver = resolver
                .with_source(Arc::new(KodikImdbSource::new(kodik.clone())))
                .with_source(Arc::new(KodikTitleSource::new(kodik)));
        }
        resolver = resolver
            .with_source(Arc::new(KinoBdTitleSource::new(http.clone(), p.clone())))
            .with_source(Arc::new(SearchScrapeSource::new(http.clone(), p.clone())?));
        info!(sources = ?resolver.source_names(), "resolver chain");
        Ok(resolver)
    }

    pub fn build_merger(&self, http: &HttpClient) -> RatingMerger {
        let mut merger =
            RatingMerger::new().with_source(Arc::new(KinopoiskXmlRatings::new(http.clone())));
        if let Some(key) = &self.omdb_api_key {
            merger = merger.with_source(Arc::new(OmdbRatings::new(http.clone(), key.clone())));
        }
        info!(sources = ?merger.source_names(), "rating chain");
        merger
    }
}

fn parse_var<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env_opt(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: raw.to_string(),
    })
}

fn parse_list(key: &'static str, raw: &str) -> Result<Vec<i64>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_value(key, s))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_parse_or_fail_loudly() {
        assert_eq!(parse_value::<u32>("SYNC_PAGE_RETRIES", " 5 "), Ok(5));
        assert_eq!(
            parse_value::<u32>("SYNC_PAGE_RETRIES", "five"),
            Err(ConfigError::Invalid {
                key: "SYNC_PAGE_RETRIES",
                value: "five".to_string()
            })
        );
    }

    #[test]
    fn poison_list_allows_spaces_and_trailing_comma() {
        assert_eq!(parse_list("SYNC_POISON_IDS", "430, 12345,"), Ok(vec![430, 12345]));
        assert!(parse_list("SYNC_POISON_IDS", "430,abc").is_err());
    }

    #[test]
    fn missing_var_message_names_the_key() {
        assert_eq!(
            ConfigError::Missing("TMDB_API_KEY").to_string(),
            "missing required env var TMDB_API_KEY"
        );
    }
}
