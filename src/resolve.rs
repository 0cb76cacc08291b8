//! Resolution orchestrator: walks the ordered source list until one of them
//! yields a plausible Kinopoisk id.

use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, instrument};

use crate::media::{CandidateMedia, ResolvedIdentifier};
use crate::sources::matching::has_cyrillic;
use crate::sources::{IdSource, LookupQuery, Plausibility, QueryKind, SourceHit, SourceOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionState {
    NotStarted,
    TryingSource(usize),
    Resolved,
    Exhausted,
}

/// What happened when the orchestrator reached one source.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptResult {
    Called(SourceOutcome),
    /// Not called; the reason is a static label for the log line.
    Skipped(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceAttempt {
    pub source: &'static str,
    pub result: AttemptResult,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub state: ResolutionState,
    pub resolved: ResolvedIdentifier,
    /// The accepted hit, carrying its rating hints.
    pub hit: Option<SourceHit>,
    pub attempts: Vec<SourceAttempt>,
    /// Every state the run passed through, from `NotStarted` to the final one.
    pub transitions: Vec<ResolutionState>,
}

impl Resolution {
    pub fn calls(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| matches!(a.result, AttemptResult::Called(_)))
            .count()
    }

    /// Compact `source=outcome` trail for the per-item log line.
    pub fn trail(&self) -> String {
        self.attempts
            .iter()
            .map(|a| match &a.result {
                AttemptResult::Called(o) => format!("{}={}", a.source, o.label()),
                AttemptResult::Skipped(why) => format!("{}=skipped:{}", a.source, why),
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Ordered, data-driven fallback chain over [`IdSource`]s.
pub struct Resolver {
    sources: Vec<Arc<dyn IdSource>>,
    plausibility: Plausibility,
}

impl Resolver {
    pub fn new(plausibility: Plausibility) -> Self {
        Self {
            sources: Vec::new(),
            plausibility,
        }
    }

    /// Append a source; registration order is precedence order.
    pub fn with_source(mut self, source: Arc<dyn IdSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn source_names(&self) -> Vec<&'static str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Try sources strictly in order and stop at the first plausible hit.
    ///
    /// Free-text sources are never reached for titles without a Cyrillic letter.
    /// Each call is bounded by the source's own timeout.
    #[instrument(skip_all, fields(tmdb_id = candidate.tmdb_id))]
    pub async fn resolve(&self, candidate: &CandidateMedia) -> Resolution {
        let query = LookupQuery::from_candidate(candidate);
        let free_text_allowed = query.title.as_deref().is_some_and(has_cyrillic);
        let mut attempts = Vec::with_capacity(self.sources.len());
        let mut transitions = vec![ResolutionState::NotStarted];

        for (idx, source) in self.sources.iter().enumerate() {
            if source.query_kind() == QueryKind::FreeText && !free_text_allowed {
                attempts.push(SourceAttempt {
                    source: source.name(),
                    result: AttemptResult::Skipped("non_cyrillic_title"),
                });
                continue;
            }

            let state = ResolutionState::TryingSource(idx);
            transitions.push(state);
            let outcome = match timeout(source.timeout(), source.resolve(&query)).await {
                Ok(outcome) => outcome,
                Err(_) => SourceOutcome::Transient(format!(
                    "timed out after {:?}",
                    source.timeout()
                )),
            };
            debug!(state = ?state, source = source.name(), outcome = outcome.label(), "source answered");

            let outcome = match outcome {
                SourceOutcome::Found(hit) => match self.plausibility.check_id(hit.kp_id) {
                    Ok(()) => {
                        attempts.push(SourceAttempt {
                            source: source.name(),
                            result: AttemptResult::Called(SourceOutcome::Found(hit.clone())),
                        });
                        // A source never vouches for more than its own tier.
                        let confidence = hit.confidence.min(source.confidence());
                        transitions.push(ResolutionState::Resolved);
                        return Resolution {
                            state: ResolutionState::Resolved,
                            resolved: ResolvedIdentifier {
                                tmdb_id: candidate.tmdb_id,
                                kp_id: Some(hit.kp_id),
                                source: Some(source.name().to_string()),
                                confidence: Some(confidence),
                            },
                            hit: Some(hit),
                            attempts,
                            transitions,
                        };
                    }
                    Err(reason) => SourceOutcome::Rejected(reason),
                },
                other => other,
            };
            attempts.push(SourceAttempt {
                source: source.name(),
                result: AttemptResult::Called(outcome),
            });
        }

        transitions.push(ResolutionState::Exhausted);
        Resolution {
            state: ResolutionState::Exhausted,
            resolved: ResolvedIdentifier::unresolved(candidate.tmdb_id),
            hit: None,
            attempts,
            transitions,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::media::{Confidence, MediaKind};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Scripted source that counts how often it was called.
    pub(crate) struct FakeSource {
        pub name: &'static str,
        pub kind: QueryKind,
        pub confidence: Confidence,
        pub outcome: SourceOutcome,
        pub delay: Duration,
        pub calls: AtomicUsize,
    }

    impl FakeSource {
        pub(crate) fn new(
            name: &'static str,
            kind: QueryKind,
            confidence: Confidence,
            outcome: SourceOutcome,
        ) -> Arc<Self> {
            Arc::new(Self {
                name,
                kind,
                confidence,
                outcome,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            })
        }

        pub(crate) fn found(
            name: &'static str,
            kind: QueryKind,
            confidence: Confidence,
            kp_id: i64,
        ) -> Arc<Self> {
            Self::new(
                name,
                kind,
                confidence,
                SourceOutcome::Found(SourceHit::new(kp_id, confidence)),
            )
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl IdSource for FakeSource {
        fn name(&self) -> &'static str {
            self.name
        }

        fn confidence(&self) -> Confidence {
            self.confidence
        }

        fn query_kind(&self) -> QueryKind {
            self.kind
        }

        fn timeout(&self) -> Duration {
            Duration::from_millis(50)
        }

        async fn resolve(&self, _query: &LookupQuery) -> SourceOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.outcome.clone()
        }
    }

    pub(crate) fn candidate(title: &str, imdb: Option<&str>) -> CandidateMedia {
        CandidateMedia {
            tmdb_id: 42,
            kind: MediaKind::Movie,
            title: title.to_string(),
            original_title: None,
            year: Some(2024),
            imdb_id: imdb.map(str::to_string),
            wikidata_id: None,
        }
    }

    #[tokio::test]
    async fn imdb_source_wins_and_scraper_is_never_called() {
        let by_imdb = FakeSource::found("by_imdb", QueryKind::ExternalId, Confidence::ExactId, 555_555);
        let scraper = FakeSource::found(
            "scraper",
            QueryKind::FreeText,
            Confidence::ScrapedHeuristic,
            430,
        );
        let resolver = Resolver::new(Plausibility::default())
            .with_source(by_imdb.clone())
            .with_source(scraper.clone());

        let res = resolver
            .resolve(&candidate("Пример", Some("tt9999999")))
            .await;

        assert_eq!(res.state, ResolutionState::Resolved);
        assert_eq!(res.resolved.kp_id, Some(555_555));
        assert_eq!(res.resolved.source.as_deref(), Some("by_imdb"));
        assert_eq!(res.resolved.confidence, Some(Confidence::ExactId));
        assert_eq!(by_imdb.calls(), 1);
        assert_eq!(scraper.calls(), 0);
        assert_eq!(
            res.transitions,
            vec![
                ResolutionState::NotStarted,
                ResolutionState::TryingSource(0),
                ResolutionState::Resolved
            ]
        );
    }

    #[tokio::test]
    async fn higher_priority_source_is_recorded_when_both_would_succeed() {
        let first = FakeSource::found("wikidata", QueryKind::ExternalId, Confidence::ExactId, 1_000_001);
        let second = FakeSource::found("kodik_title", QueryKind::FreeText, Confidence::TitleSearch, 2_000_002);
        let resolver = Resolver::new(Plausibility::default())
            .with_source(first)
            .with_source(second.clone());

        let res = resolver.resolve(&candidate("Пример", Some("tt1"))).await;
        assert_eq!(res.resolved.source.as_deref(), Some("wikidata"));
        assert_eq!(res.resolved.kp_id, Some(1_000_001));
        assert_eq!(second.calls(), 0);
    }

    #[tokio::test]
    async fn poison_id_is_rejected_from_any_source() {
        let exact = FakeSource::found("kodik_imdb", QueryKind::ExternalId, Confidence::ExactId, 430);
        let scraper = FakeSource::found("scraper", QueryKind::FreeText, Confidence::ScrapedHeuristic, 430);
        let resolver = Resolver::new(Plausibility::default())
            .with_source(exact.clone())
            .with_source(scraper.clone());

        let res = resolver.resolve(&candidate("Пример", Some("tt1"))).await;
        assert_eq!(res.state, ResolutionState::Exhausted);
        assert_eq!(res.resolved.kp_id, None);
        assert_eq!(exact.calls(), 1);
        assert_eq!(scraper.calls(), 1);
        assert!(res
            .attempts
            .iter()
            .all(|a| matches!(a.result, AttemptResult::Called(SourceOutcome::Rejected(_)))));
    }

    #[tokio::test]
    async fn latin_title_without_ids_never_reaches_free_text_sources() {
        let wikidata = FakeSource::new("wikidata", QueryKind::ExternalId, Confidence::ExactId, SourceOutcome::Empty);
        let kodik = FakeSource::found("kodik_title", QueryKind::FreeText, Confidence::TitleSearch, 300_003);
        let scraper = FakeSource::found("scraper", QueryKind::FreeText, Confidence::ScrapedHeuristic, 555_555);
        let resolver = Resolver::new(Plausibility::default())
            .with_source(wikidata.clone())
            .with_source(kodik.clone())
            .with_source(scraper.clone());

        let res = resolver.resolve(&candidate("Example", None)).await;
        assert_eq!(res.state, ResolutionState::Exhausted);
        assert_eq!(res.calls(), 1);
        assert_eq!(kodik.calls(), 0);
        assert_eq!(scraper.calls(), 0);
        assert_eq!(res.trail(), "wikidata=empty,kodik_title=skipped:non_cyrillic_title,scraper=skipped:non_cyrillic_title");
        // Skipped sources are never entered.
        assert_eq!(
            res.transitions,
            vec![
                ResolutionState::NotStarted,
                ResolutionState::TryingSource(0),
                ResolutionState::Exhausted
            ]
        );
    }

    #[tokio::test]
    async fn slow_source_times_out_and_chain_continues() {
        let slow = Arc::new(FakeSource {
            name: "slow",
            kind: QueryKind::ExternalId,
            confidence: Confidence::ExactId,
            outcome: SourceOutcome::Found(SourceHit::new(900_000, Confidence::ExactId)),
            delay: Duration::from_millis(500),
            calls: AtomicUsize::new(0),
        });
        let next = FakeSource::found("next", QueryKind::FreeText, Confidence::TitleSearch, 800_000);
        let resolver = Resolver::new(Plausibility::default())
            .with_source(slow)
            .with_source(next);

        let res = resolver.resolve(&candidate("Пример", Some("tt1"))).await;
        assert_eq!(res.resolved.kp_id, Some(800_000));
        assert!(matches!(
            res.attempts[0].result,
            AttemptResult::Called(SourceOutcome::Transient(_))
        ));
    }

    #[tokio::test]
    async fn source_cannot_claim_more_than_its_tier() {
        let lying = Arc::new(FakeSource {
            name: "lying",
            kind: QueryKind::FreeText,
            confidence: Confidence::ScrapedHeuristic,
            outcome: SourceOutcome::Found(SourceHit::new(600_000, Confidence::ExactId)),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        });
        let resolver = Resolver::new(Plausibility::default()).with_source(lying);
        let res = resolver.resolve(&candidate("Пример", None)).await;
        assert_eq!(res.resolved.confidence, Some(Confidence::ScrapedHeuristic));
    }

    #[tokio::test]
    async fn empty_chain_is_exhausted() {
        let res = Resolver::new(Plausibility::default())
            .resolve(&candidate("Пример", None))
            .await;
        assert_eq!(res.state, ResolutionState::Exhausted);
        assert!(res.attempts.is_empty());
        assert_eq!(
            res.transitions,
            vec![ResolutionState::NotStarted, ResolutionState::Exhausted]
        );
    }
}
