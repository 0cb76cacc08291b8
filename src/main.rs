use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kinonest_sync::checkpoint::{CheckpointStore, FileCheckpointStore};
use kinonest_sync::config::{ConfigError, SyncConfig};
use kinonest_sync::context::RunContext;
use kinonest_sync::feed::{BacklogFeed, CandidateFeed, TmdbClient, TmdbDiscoverFeed};
use kinonest_sync::media::{CandidateMedia, MediaKind};
use kinonest_sync::pipeline::SyncPipeline;
use kinonest_sync::ratings::RatingQuery;
use kinonest_sync::scheduler::BatchScheduler;
use kinonest_sync::store::{MediaStore, MemoryStore, PgMediaStore};
use kinonest_sync::tracing::init_tracing;
use kinonest_sync::util::db::Db;
use kinonest_sync::util::env::{bootstrap_cli, init_env, redact_postgres_url};
use kinonest_sync::writer::{UpsertWriter, WriteMode};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kinonest-sync", version, about = "KinoNest catalog sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Discover new titles on TMDB by release year and insert the ones not stored yet
    SyncNew {
        /// movie | series
        #[arg(long)]
        kind: MediaKind,
        #[arg(long)]
        from_year: i32,
        #[arg(long)]
        to_year: i32,
        /// Pages per year (TMDB caps discover at 500)
        #[arg(long)]
        max_pages: Option<u32>,
        /// Store titles no source could resolve (overrides SYNC_PERSIST_UNRESOLVED)
        #[arg(long)]
        persist_unresolved: Option<bool>,
        /// Write to an in-memory store instead of Postgres
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Re-resolve stored titles and refresh their Kinopoisk ids and ratings
    Resync {
        #[arg(long)]
        kind: MediaKind,
        /// Overwrite stored values even with empty results
        #[arg(long, default_value_t = false)]
        force: bool,
        /// Only rows missing a kp id or a rating
        #[arg(long, default_value_t = false)]
        only_missing: bool,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Resolve one title and print the result as JSON
    Resolve {
        #[arg(long)]
        title: String,
        #[arg(long)]
        year: Option<i32>,
        #[arg(long)]
        original_title: Option<String>,
        #[arg(long)]
        imdb_id: Option<String>,
        #[arg(long)]
        wikidata_id: Option<String>,
        #[arg(long, default_value = "movie")]
        kind: MediaKind,
    },
    /// Inspect or drop a stored resume point
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum CheckpointAction {
    Show {
        #[arg(long)]
        key: String,
    },
    Clear {
        #[arg(long)]
        key: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env may carry RUST_LOG, so load it before the subscriber reads the filter.
    init_env();
    init_tracing("info,sqlx=warn,reqwest=warn,hyper=warn")?;
    bootstrap_cli("kinonest-sync");

    let cli = Cli::parse();
    match cli.command {
        Commands::SyncNew {
            kind,
            from_year,
            to_year,
            max_pages,
            persist_unresolved,
            dry_run,
        } => {
            let cfg = SyncConfig::from_env(!dry_run)?;
            let tmdb = TmdbClient::new(cfg.http()?, cfg.tmdb_key()?.to_string());
            let store = open_store(&cfg, dry_run).await?;
            let feed: Arc<dyn CandidateFeed> = Arc::new(TmdbDiscoverFeed::new(tmdb, kind));

            let mut options = cfg.run_options(WriteMode::InsertOnly);
            options.year_range = Some(from_year..=to_year);
            options.max_pages = max_pages.or(options.max_pages);
            if let Some(flag) = persist_unresolved {
                options.persist_unresolved = flag;
            }
            let mut ctx = RunContext::new(options, feed.key());
            run_batch(&cfg, store, feed, &mut ctx).await?;
        }
        Commands::Resync {
            kind,
            force,
            only_missing,
            dry_run,
        } => {
            let cfg = SyncConfig::from_env(!dry_run)?;
            let tmdb = TmdbClient::new(cfg.http()?, cfg.tmdb_key()?.to_string());
            let store = open_store(&cfg, dry_run).await?;
            let feed: Arc<dyn CandidateFeed> =
                Arc::new(BacklogFeed::new(store.clone(), kind).with_tmdb(tmdb));

            let mode = if force {
                WriteMode::ForceResync
            } else {
                WriteMode::Refresh
            };
            let mut options = cfg.run_options(mode);
            options.only_missing = only_missing;
            // Every stored row is revisited on a resync; unresolved ones stay as they are.
            options.persist_unresolved = true;
            let mut ctx = RunContext::new(options, feed.key());
            run_batch(&cfg, store, feed, &mut ctx).await?;
        }
        Commands::Resolve {
            title,
            year,
            original_title,
            imdb_id,
            wikidata_id,
            kind,
        } => {
            let cfg = SyncConfig::from_env(false)?;
            let http = cfg.http()?;
            let resolver = cfg.build_resolver(&http)?;
            let merger = cfg.build_merger(&http);
            let candidate = CandidateMedia {
                tmdb_id: 0,
                kind,
                title,
                original_title,
                year,
                imdb_id,
                wikidata_id,
            };
            let resolution = resolver.resolve(&candidate).await;
            let query = RatingQuery {
                kp_id: resolution.resolved.kp_id,
                imdb_id: candidate.imdb_id.clone(),
            };
            let ratings = merger
                .collect(&query, resolution.hit.as_ref().map(|h| &h.ratings_hint))
                .await;
            let out = json!({
                "candidate": &candidate,
                "state": format!("{:?}", resolution.state),
                "resolved": &resolution.resolved,
                "ratings": &ratings,
                "trail": resolution.trail(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Commands::Checkpoint { action } => {
            let cfg = SyncConfig::from_env(false)?;
            let store = FileCheckpointStore::new(cfg.state_dir.clone());
            match action {
                CheckpointAction::Show { key } => match store.load(&key)? {
                    Some(cp) => println!("{}", serde_json::to_string_pretty(&cp)?),
                    None => println!("no checkpoint for {key} in {}", store.dir().display()),
                },
                CheckpointAction::Clear { key } => {
                    store.clear(&key)?;
                    info!(key = %key, "checkpoint cleared");
                }
            }
        }
    }
    Ok(())
}

async fn open_store(cfg: &SyncConfig, dry_run: bool) -> Result<Arc<dyn MediaStore>> {
    if dry_run {
        warn!("dry run: writes go to an in-memory store and are discarded");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let Some(url) = cfg.database_url.as_deref() else {
        return Err(ConfigError::Missing("DATABASE_URL").into());
    };
    info!(url = %redact_postgres_url(url), "connecting");
    let db = Db::connect(url, 5).await?;
    Ok(Arc::new(PgMediaStore::new(db)))
}

async fn run_batch(
    cfg: &SyncConfig,
    store: Arc<dyn MediaStore>,
    feed: Arc<dyn CandidateFeed>,
    ctx: &mut RunContext,
) -> Result<()> {
    let http = cfg.http()?;
    let resolver = cfg.build_resolver(&http)?;
    if resolver.is_empty() {
        bail!("no identifier sources configured");
    }
    let merger = cfg.build_merger(&http);
    let writer = UpsertWriter::new(store).with_cast_limit(ctx.options.cast_limit);
    let pipeline = SyncPipeline::new(Arc::new(resolver), Arc::new(merger), writer);
    let checkpoints = Arc::new(FileCheckpointStore::new(cfg.state_dir.clone()));

    let scheduler = BatchScheduler::new(feed, Arc::new(pipeline), checkpoints);
    let result = scheduler.run(ctx).await;
    println!("{}", serde_json::to_string_pretty(&ctx.summary)?);
    result.with_context(|| format!("run {} stopped; rerun to resume", ctx.checkpoint_key))
}
