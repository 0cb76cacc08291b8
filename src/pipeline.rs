//! One item through the whole chain: resolve, rate, write, report.

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::context::RunContext;
use crate::media::{Confidence, MediaDetails, PersistedRecord};
use crate::ratings::{RatingMerger, RatingQuery};
use crate::resolve::Resolver;
use crate::store::MediaKey;
use crate::writer::{UpsertWriter, WriteMode, WriteOutcome};

/// What happened to one candidate; every processed item yields exactly one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemReport {
    pub tmdb_id: i64,
    pub kp_id: Option<i64>,
    pub source: Option<String>,
    pub confidence: Option<Confidence>,
    #[serde(skip)]
    pub write: Option<WriteOutcome>,
    /// Set when nothing was written.
    pub skip_reason: Option<String>,
}

impl ItemReport {
    pub fn skipped(tmdb_id: i64, reason: impl Into<String>) -> Self {
        Self {
            tmdb_id,
            kp_id: None,
            source: None,
            confidence: None,
            write: None,
            skip_reason: Some(reason.into()),
        }
    }
}

pub struct SyncPipeline {
    resolver: Arc<Resolver>,
    merger: Arc<RatingMerger>,
    writer: UpsertWriter,
}

impl SyncPipeline {
    pub fn new(resolver: Arc<Resolver>, merger: Arc<RatingMerger>, writer: UpsertWriter) -> Self {
        Self {
            resolver,
            merger,
            writer,
        }
    }

    pub async fn process(&self, details: &MediaDetails, ctx: &mut RunContext) -> ItemReport {
        let candidate = &details.candidate;
        ctx.summary.items += 1;
        let key = MediaKey::new(candidate.kind, candidate.tmdb_id);
        let stored = self.stored_row(key).await;

        match (ctx.options.mode, stored.as_ref()) {
            // Nothing would be written, so the sources are not worth calling.
            (WriteMode::InsertOnly, Some(_)) => {
                ctx.summary.record_write(&WriteOutcome::SkippedExists);
                let report = ItemReport {
                    write: Some(WriteOutcome::SkippedExists),
                    ..ItemReport::skipped(candidate.tmdb_id, "exists")
                };
                log_skip(&report, &candidate.title);
                return report;
            }
            (WriteMode::Refresh, Some(row)) if ctx.options.only_missing && is_complete(row) => {
                let report = ItemReport::skipped(candidate.tmdb_id, "already_complete");
                return self.skip(ctx, report, &candidate.title);
            }
            _ => {}
        }

        let resolution = self.resolver.resolve(candidate).await;
        let resolved = resolution.resolved.clone();
        ctx.summary.record_resolution(resolved.source.as_deref());

        if resolved.kp_id.is_none() && !ctx.options.persist_unresolved {
            let reason = format!("unresolved [{}]", resolution.trail());
            let report = ItemReport::skipped(candidate.tmdb_id, reason);
            return self.skip(ctx, report, &candidate.title);
        }

        // A refresh that resolves nothing still re-rates the stored title.
        let fallback_kp_id = match ctx.options.mode {
            WriteMode::Refresh => stored.as_ref().and_then(|row| row.kp_id),
            _ => None,
        };
        let query = RatingQuery {
            kp_id: resolved.kp_id.or(fallback_kp_id),
            imdb_id: candidate.imdb_id.clone(),
        };
        let hint = resolution.hit.as_ref().map(|h| &h.ratings_hint);
        let ratings = self.merger.collect(&query, hint).await;

        let record = PersistedRecord::assemble(details, &resolved, ratings);
        let outcome = self.writer.upsert(&record, &details.cast, ctx.options.mode).await;
        ctx.summary.record_write(&outcome);

        match &outcome {
            WriteOutcome::Failed(reason) => warn!(
                tmdb_id = candidate.tmdb_id,
                title = %candidate.title,
                kp_id = ?resolved.kp_id,
                source = resolved.source.as_deref().unwrap_or("-"),
                error = %reason,
                "item failed"
            ),
            ok => info!(
                tmdb_id = candidate.tmdb_id,
                title = %candidate.title,
                kp_id = ?resolved.kp_id,
                source = resolved.source.as_deref().unwrap_or("-"),
                confidence = resolved.confidence.map(|c| c.as_str()).unwrap_or("-"),
                kp_rating = ratings.kp_rating,
                imdb_rating = ratings.imdb_rating,
                write = ok.label(),
                trail = %resolution.trail(),
                "item processed"
            ),
        }

        ItemReport {
            tmdb_id: candidate.tmdb_id,
            kp_id: resolved.kp_id,
            source: resolved.source,
            confidence: resolved.confidence,
            write: Some(outcome),
            skip_reason: None,
        }
    }

    /// Log and count an item that is not written.
    pub fn skip(&self, ctx: &mut RunContext, report: ItemReport, title: &str) -> ItemReport {
        ctx.summary.skipped += 1;
        log_skip(&report, title);
        report
    }

    async fn stored_row(&self, key: MediaKey) -> Option<PersistedRecord> {
        match self.writer.store().fetch_media(key).await {
            Ok(row) => row,
            Err(e) => {
                warn!(tmdb_id = key.tmdb_id, error = %e, "could not read stored row; processing anyway");
                None
            }
        }
    }
}

fn is_complete(row: &PersistedRecord) -> bool {
    row.kp_id.is_some() && row.ratings.is_complete()
}

fn log_skip(report: &ItemReport, title: &str) {
    info!(
        tmdb_id = report.tmdb_id,
        title = %title,
        reason = report.skip_reason.as_deref().unwrap_or("-"),
        "item skipped"
    );
}
