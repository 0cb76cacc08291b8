use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use scraper::{Html, Selector};
use tracing::debug;

use super::matching::has_cyrillic;
use super::{
    outcome_from, HttpClient, IdSource, LookupQuery, Plausibility, QueryKind, Rejections,
    SourceError, SourceHit, SourceOutcome,
};
use crate::media::{Confidence, MediaKind};

/// DuckDuckGo HTML endpoint; no script, stable result markup.
const DDG_SEARCH_URL: &str = "https://html.duckduckgo.com/html/";

/// Organic results only; sponsored blocks carry `result--ad`.
const RESULT_LINK_SELECTOR: &str = "div.result:not(.result--ad) a.result__a";

/// A Kinopoisk title page, matched against the decoded result target.
const KP_TITLE_URL: &str = r"(?i)^https?://(?:www\.|m\.)?kinopoisk\.ru/(?:film|series)/(\d{3,9})(?:/|$|\?)";

/// Last-resort source: search DuckDuckGo and take the first organic result
/// that points at a Kinopoisk title page. Free-text matching, lowest confidence.
#[derive(Debug, Clone)]
pub struct SearchScrapeSource {
    http: HttpClient,
    plausibility: Plausibility,
    result_links: Selector,
    kp_url: Regex,
}

impl SearchScrapeSource {
    pub fn new(http: HttpClient, plausibility: Plausibility) -> Result<Self> {
        let result_links = Selector::parse(RESULT_LINK_SELECTOR)
            .map_err(|e| anyhow::anyhow!("result selector: {e:?}"))?;
        Ok(Self {
            http,
            plausibility,
            result_links,
            kp_url: Regex::new(KP_TITLE_URL)?,
        })
    }

    async fn lookup(&self, query: &LookupQuery) -> Result<SourceOutcome, SourceError> {
        let Some(text) = search_text(query) else {
            return Ok(SourceOutcome::Empty);
        };
        let req = self
            .http
            .get(DDG_SEARCH_URL)
            .header("Accept-Language", "ru-RU,ru;q=0.9")
            .query(&[("q", text.as_str()), ("kl", "ru-ru")]);
        let html = self.http.fetch_text(req).await?;
        // `Html` is not Send; it must be dropped before the next await.
        let ids = self.result_kp_ids(&html);
        debug!(query = %text, found = ids.len(), "search scrape parsed");

        let mut rejections = Rejections::default();
        let hit = ids
            .into_iter()
            .find(|id| rejections.admit(&self.plausibility, *id))
            .map(|kp_id| SourceHit::new(kp_id, Confidence::ScrapedHeuristic));
        Ok(rejections.outcome(hit))
    }

    /// Kinopoisk ids of organic results in page order, deduplicated.
    fn result_kp_ids(&self, html: &str) -> Vec<i64> {
        let document = Html::parse_document(html);
        let mut out: Vec<i64> = Vec::new();
        for link in document.select(&self.result_links) {
            let Some(target) = link.value().attr("href").and_then(result_target) else {
                continue;
            };
            let Some(id) = self
                .kp_url
                .captures(&target)
                .and_then(|caps| caps.get(1))
                .and_then(|m| m.as_str().parse::<i64>().ok())
            else {
                continue;
            };
            if !out.contains(&id) {
                out.push(id);
            }
        }
        out
    }
}

#[async_trait]
impl IdSource for SearchScrapeSource {
    fn name(&self) -> &'static str {
        "search_scrape"
    }

    fn confidence(&self) -> Confidence {
        Confidence::ScrapedHeuristic
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

/// The real destination of a result link. DuckDuckGo wraps targets in
/// `//duckduckgo.com/l/?uddg=<encoded>`; direct links pass through.
fn result_target(href: &str) -> Option<String> {
    let absolute = if href.starts_with("//") {
        format!("https:{href}")
    } else {
        href.to_string()
    };
    let parsed = url::Url::parse(&absolute).ok()?;
    if parsed.host_str() == Some("duckduckgo.com") && parsed.path().starts_with("/l/") {
        return parsed
            .query_pairs()
            .find(|(k, _)| k == "uddg")
            .map(|(_, v)| v.into_owned());
    }
    matches!(parsed.scheme(), "http" | "https").then_some(absolute)
}

fn search_text(query: &LookupQuery) -> Option<String> {
    let title = query.title.as_deref()?;
    let mut text = title.to_string();
    if let Some(year) = query.year {
        text.push_str(&format!(" {year}"));
    }
    text.push_str(match query.kind {
        MediaKind::Movie => " фильм кинопоиск",
        MediaKind::Series => " сериал кинопоиск",
    });
    Some(text)
}
