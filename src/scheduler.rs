//! Batch scheduler and rate governor.
//!
//! Items are processed strictly one at a time with a jittered pause between
//! them and a longer pause between pages. After every page the checkpoint is
//! moved to the next page, so a crash or an aborted run resumes where it
//! stopped; a completed run clears it.

use anyhow::{bail, Result};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::context::RunContext;
use crate::feed::{CandidateFeed, FeedPage};
use crate::pipeline::{ItemReport, SyncPipeline};

pub struct BatchScheduler {
    feed: Arc<dyn CandidateFeed>,
    pipeline: Arc<SyncPipeline>,
    checkpoints: Arc<dyn CheckpointStore>,
}

impl BatchScheduler {
    pub fn new(
        feed: Arc<dyn CandidateFeed>,
        pipeline: Arc<SyncPipeline>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            feed,
            pipeline,
            checkpoints,
        }
    }

    #[instrument(skip_all, fields(key = %ctx.checkpoint_key))]
    pub async fn run(&self, ctx: &mut RunContext) -> Result<()> {
        let t0 = Instant::now();
        let years = self.years(ctx)?;
        ctx.checkpoint = self.checkpoints.load(&ctx.checkpoint_key)?;

        let mut start_idx = 0;
        let mut start_page = 1;
        if let Some(cp) = &ctx.checkpoint {
            match years.iter().position(|y| *y == cp.year) {
                Some(idx) => {
                    start_idx = idx;
                    start_page = cp.page.max(1);
                    info!(year = ?cp.year, page = cp.page, "resuming from checkpoint");
                }
                None => warn!(year = ?cp.year, "checkpoint outside the requested range; starting over"),
            }
        }

        for (idx, year) in years.iter().copied().enumerate().skip(start_idx) {
            let mut page = if idx == start_idx { start_page } else { 1 };
            loop {
                if ctx.options.max_pages.is_some_and(|max| page > max) {
                    break;
                }
                let fetched = self.fetch_with_retry(ctx, year, page).await?;
                let total_pages = fetched.total_pages;
                let had_items = !fetched.items.is_empty();
                self.process_page(ctx, fetched).await;
                ctx.summary.pages += 1;

                let next = page + 1;
                let year_done = !had_items || next > total_pages;
                let cp = if year_done {
                    years.get(idx + 1).map(|y| Checkpoint::new(*y, 1))
                } else {
                    Some(Checkpoint::new(year, next))
                };
                if let Some(cp) = cp {
                    self.checkpoints.save(&ctx.checkpoint_key, &cp)?;
                    ctx.checkpoint = Some(cp);
                }
                info!(year = ?year, page, total_pages, items = ctx.summary.items, "page done");
                if year_done {
                    break;
                }
                page = next;
                if !ctx.options.page_delay.is_zero() {
                    tokio::time::sleep(ctx.options.page_delay).await;
                }
            }
        }

        self.checkpoints.clear(&ctx.checkpoint_key)?;
        ctx.checkpoint = None;
        let s = &ctx.summary;
        info!(
            elapsed_ms = t0.elapsed().as_millis() as u64,
            pages = s.pages,
            items = s.items,
            resolved = s.resolved,
            unresolved = s.unresolved,
            inserted = s.inserted,
            updated = s.updated,
            skipped = s.skipped + s.skipped_exists,
            failed = s.failed,
            "run complete"
        );
        Ok(())
    }

    fn years(&self, ctx: &RunContext) -> Result<Vec<Option<i32>>> {
        if !self.feed.scans_years() {
            return Ok(vec![None]);
        }
        let Some(range) = ctx.options.year_range.clone() else {
            bail!("feed {} needs a year range", self.feed.key());
        };
        let (from, to) = range.into_inner();
        Ok(if from <= to {
            (from..=to).map(Some).collect()
        } else {
            (to..=from).rev().map(Some).collect()
        })
    }

    /// A failing page is retried after a fixed backoff without advancing. Giving up
    /// leaves the checkpoint on this page.
    async fn fetch_with_retry(
        &self,
        ctx: &mut RunContext,
        year: Option<i32>,
        page: u32,
    ) -> Result<FeedPage> {
        let mut attempt = 0;
        loop {
            match self.feed.fetch_page(year, page).await {
                Ok(fetched) => return Ok(fetched),
                Err(e) if attempt < ctx.options.page_retries => {
                    attempt += 1;
                    warn!(year = ?year, page, attempt, error = %e, "page fetch failed; retrying");
                    if !ctx.options.page_backoff.is_zero() {
                        tokio::time::sleep(ctx.options.page_backoff).await;
                    }
                }
                Err(e) => {
                    let cp = Checkpoint::new(year, page);
                    self.checkpoints.save(&ctx.checkpoint_key, &cp)?;
                    ctx.checkpoint = Some(cp);
                    return Err(e.context(format!(
                        "page {page} (year {year:?}) failed after {attempt} retries"
                    )));
                }
            }
        }
    }

    async fn process_page(&self, ctx: &mut RunContext, fetched: FeedPage) {
        for (i, item) in fetched.items.iter().enumerate() {
            if i > 0 {
                ctx.options.item_delay.pause().await;
            }
            match self.feed.details(item).await {
                Ok(details) => {
                    self.pipeline.process(&details, ctx).await;
                }
                Err(e) => {
                    ctx.summary.items += 1;
                    let report = ItemReport::skipped(item.tmdb_id, format!("details: {e:#}"));
                    self.pipeline.skip(ctx, report, &item.title);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::context::{DelaySpec, RunOptions};
    use crate::feed::FeedItem;
    use crate::media::{MediaDetails, MediaKind};
    use crate::ratings::RatingMerger;
    use crate::resolve::tests::candidate;
    use crate::resolve::Resolver;
    use crate::sources::Plausibility;
    use crate::store::{MediaStore, MemoryStore};
    use crate::writer::{UpsertWriter, WriteMode};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Two pages of three items per year; ids are `year * 100 + page * 10 + n`.
    #[derive(Default)]
    struct FakeFeed {
        failures: Mutex<HashMap<(Option<i32>, u32), u32>>,
        broken_details: HashSet<i64>,
        fetched: Mutex<Vec<(Option<i32>, u32)>>,
    }

    impl FakeFeed {
        fn failing(year: i32, page: u32, times: u32) -> Self {
            let feed = Self::default();
            feed.failures.lock().unwrap().insert((Some(year), page), times);
            feed
        }

        fn fetched(&self) -> Vec<(Option<i32>, u32)> {
            self.fetched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CandidateFeed for FakeFeed {
        fn key(&self) -> String {
            "discover-movie".to_string()
        }

        fn scans_years(&self) -> bool {
            true
        }

        async fn fetch_page(&self, year: Option<i32>, page: u32) -> Result<FeedPage> {
            self.fetched.lock().unwrap().push((year, page));
            if let Some(left) = self.failures.lock().unwrap().get_mut(&(year, page)) {
                if *left > 0 {
                    *left -= 1;
                    return Err(anyhow!("HTTP 503"));
                }
            }
            let y = i64::from(year.unwrap_or(0));
            let items = (1..=3)
                .map(|n| FeedItem {
                    tmdb_id: y * 100 + i64::from(page) * 10 + n,
                    kind: MediaKind::Movie,
                    title: "Пример".to_string(),
                    stored: None,
                })
                .collect();
            Ok(FeedPage {
                items,
                total_pages: 2,
            })
        }

        async fn details(&self, item: &FeedItem) -> Result<MediaDetails> {
            if self.broken_details.contains(&item.tmdb_id) {
                return Err(anyhow!("HTTP 404"));
            }
            let mut c = candidate(&item.title, None);
            c.tmdb_id = item.tmdb_id;
            Ok(MediaDetails::bare(c))
        }
    }

    fn setup(
        feed: Arc<FakeFeed>,
        checkpoints: Arc<MemoryCheckpointStore>,
    ) -> (Arc<MemoryStore>, BatchScheduler) {
        let store = Arc::new(MemoryStore::new());
        let pipeline = SyncPipeline::new(
            Arc::new(Resolver::new(Plausibility::default())),
            Arc::new(RatingMerger::new()),
            UpsertWriter::new(store.clone()),
        );
        let scheduler = BatchScheduler::new(feed, Arc::new(pipeline), checkpoints);
        (store, scheduler)
    }

    fn ctx(years: std::ops::RangeInclusive<i32>, retries: u32) -> RunContext {
        RunContext::new(
            RunOptions {
                mode: WriteMode::InsertOnly,
                item_delay: DelaySpec::none(),
                page_delay: Duration::ZERO,
                page_backoff: Duration::ZERO,
                page_retries: retries,
                year_range: Some(years),
                ..RunOptions::default()
            },
            "discover-movie",
        )
    }

    #[tokio::test]
    async fn full_run_covers_every_page_and_clears_checkpoint() {
        let feed = Arc::new(FakeFeed::default());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let (store, scheduler) = setup(feed.clone(), checkpoints.clone());
        let mut ctx = ctx(2023..=2024, 0);

        scheduler.run(&mut ctx).await.unwrap();

        assert_eq!(
            feed.fetched(),
            vec![(Some(2023), 1), (Some(2023), 2), (Some(2024), 1), (Some(2024), 2)]
        );
        assert_eq!(ctx.summary.items, 12);
        assert_eq!(ctx.summary.inserted, 12);
        assert_eq!(store.count_media(MediaKind::Movie).await.unwrap(), 12);
        assert!(checkpoints.load("discover-movie").unwrap().is_none());
    }

    #[tokio::test]
    async fn transient_page_failure_is_retried_in_place() {
        let feed = Arc::new(FakeFeed::failing(2024, 2, 2));
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let (_store, scheduler) = setup(feed.clone(), checkpoints);
        let mut ctx = ctx(2024..=2024, 2);

        scheduler.run(&mut ctx).await.unwrap();

        let page2 = feed.fetched().iter().filter(|f| **f == (Some(2024), 2)).count();
        assert_eq!(page2, 3);
        assert_eq!(ctx.summary.items, 6);
    }

    #[tokio::test]
    async fn aborted_run_resumes_without_reprocessing() {
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let broken = Arc::new(FakeFeed::failing(2024, 1, 5));
        let (store, scheduler) = setup(broken, checkpoints.clone());
        let mut first = ctx(2023..=2024, 1);

        assert!(scheduler.run(&mut first).await.is_err());
        let cp = checkpoints.load("discover-movie").unwrap().unwrap();
        assert_eq!((cp.year, cp.page), (Some(2024), 1));
        assert_eq!(first.summary.items, 6);

        let healthy = Arc::new(FakeFeed::default());
        let pipeline = SyncPipeline::new(
            Arc::new(Resolver::new(Plausibility::default())),
            Arc::new(RatingMerger::new()),
            UpsertWriter::new(store.clone()),
        );
        let resumed = BatchScheduler::new(healthy.clone(), Arc::new(pipeline), checkpoints.clone());
        let mut second = ctx(2023..=2024, 1);
        resumed.run(&mut second).await.unwrap();

        assert_eq!(healthy.fetched(), vec![(Some(2024), 1), (Some(2024), 2)]);
        assert_eq!(second.summary.inserted, 6);
        assert_eq!(store.count_media(MediaKind::Movie).await.unwrap(), 12);
        assert!(checkpoints.load("discover-movie").unwrap().is_none());
    }

    #[tokio::test]
    async fn details_failure_skips_one_item() {
        let feed = Arc::new(FakeFeed {
            broken_details: HashSet::from([202_412]),
            ..FakeFeed::default()
        });
        let (store, scheduler) = setup(feed, Arc::new(MemoryCheckpointStore::new()));
        let mut ctx = ctx(2024..=2024, 0);

        scheduler.run(&mut ctx).await.unwrap();

        assert_eq!(ctx.summary.items, 6);
        assert_eq!(ctx.summary.skipped, 1);
        assert_eq!(store.count_media(MediaKind::Movie).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn max_pages_bounds_each_year() {
        let feed = Arc::new(FakeFeed::default());
        let (_store, scheduler) = setup(feed.clone(), Arc::new(MemoryCheckpointStore::new()));
        let mut ctx = ctx(2024..=2023, 0);
        ctx.options.max_pages = Some(1);

        scheduler.run(&mut ctx).await.unwrap();

        assert_eq!(feed.fetched(), vec![(Some(2024), 1), (Some(2023), 1)]);
    }

    #[tokio::test]
    async fn year_feed_without_range_is_rejected() {
        let feed = Arc::new(FakeFeed::default());
        let (_store, scheduler) = setup(feed, Arc::new(MemoryCheckpointStore::new()));
        let mut ctx = RunContext::new(RunOptions::default(), "discover-movie");
        assert!(scheduler.run(&mut ctx).await.is_err());
    }
}
