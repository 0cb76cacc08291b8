//! Per-run state, passed `&mut` through the scheduler and pipeline.

use rand::{thread_rng, Rng};
use serde::Serialize;
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::time::Duration;

use crate::checkpoint::Checkpoint;
use crate::writer::{WriteMode, WriteOutcome, DEFAULT_CAST_LIMIT};

/// Uniformly jittered pause between `min` and `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelaySpec {
    pub min: Duration,
    pub max: Duration,
}

impl DelaySpec {
    pub fn between(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    pub fn fixed(d: Duration) -> Self {
        Self { min: d, max: d }
    }

    pub fn none() -> Self {
        Self::fixed(Duration::ZERO)
    }

    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let lo = self.min.as_millis() as u64;
        let hi = self.max.as_millis() as u64;
        Duration::from_millis(thread_rng().gen_range(lo..=hi))
    }

    pub async fn pause(&self) {
        let d = self.sample();
        if !d.is_zero() {
            tokio::time::sleep(d).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: WriteMode,
    /// Write candidates no source could resolve (kp id left null).
    pub persist_unresolved: bool,
    pub item_delay: DelaySpec,
    pub page_delay: Duration,
    pub page_retries: u32,
    pub page_backoff: Duration,
    /// Release years to scan, for year-scanning feeds.
    pub year_range: Option<RangeInclusive<i32>>,
    pub max_pages: Option<u32>,
    pub cast_limit: usize,
    /// Backlog runs: skip rows that already carry a kp id and both ratings.
    pub only_missing: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            mode: WriteMode::InsertOnly,
            persist_unresolved: true,
            item_delay: DelaySpec::between(Duration::from_millis(400), Duration::from_millis(1200)),
            page_delay: Duration::from_secs(3),
            page_retries: 3,
            page_backoff: Duration::from_secs(10),
            year_range: None,
            max_pages: None,
            cast_limit: DEFAULT_CAST_LIMIT,
            only_missing: false,
        }
    }
}

/// Run totals, logged at the end and printed by the CLI.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub pages: usize,
    pub items: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped_exists: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Accepted kp ids per source name.
    pub by_source: BTreeMap<String, usize>,
}

impl RunSummary {
    pub fn record_resolution(&mut self, source: Option<&str>) {
        match source {
            Some(name) => {
                self.resolved += 1;
                *self.by_source.entry(name.to_string()).or_default() += 1;
            }
            None => self.unresolved += 1,
        }
    }

    pub fn record_write(&mut self, outcome: &WriteOutcome) {
        match outcome {
            WriteOutcome::Inserted => self.inserted += 1,
            WriteOutcome::Updated => self.updated += 1,
            WriteOutcome::SkippedExists => self.skipped_exists += 1,
            WriteOutcome::Failed(_) => self.failed += 1,
        }
    }
}

pub struct RunContext {
    pub options: RunOptions,
    pub checkpoint_key: String,
    /// Position loaded at start, advanced after every page.
    pub checkpoint: Option<Checkpoint>,
    pub summary: RunSummary,
}

impl RunContext {
    pub fn new(options: RunOptions, checkpoint_key: impl Into<String>) -> Self {
        Self {
            options,
            checkpoint_key: checkpoint_key.into(),
            checkpoint: None,
            summary: RunSummary::default(),
        }
    }
}
