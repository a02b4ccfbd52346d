use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use swgraph::crawl::{CrawlDriver, HttpSource};
use swgraph::db::{migrate, Db};
use swgraph::graph::store;
use swgraph::Config;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "swgraph")]
#[command(version, about = "Crawl the Star Wars API into a local property graph")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Seed the root set and drain until every discovered entity is hydrated or failed
    Crawl {
        /// Skip seeding and only drain what the store already knows about
        #[arg(long)]
        no_seed: bool,

        /// Number of concurrent drain workers (overrides workers.count)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Move failed entities back to unhydrated before draining
        #[arg(long)]
        retry_failed: bool,
    },
    /// Apply migrations and check the database schema (default)
    Verify,
    /// Move every failed entity back to unhydrated
    ResetFailed,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load()?;
    env_logger::Builder::from_env(
        env_logger::Env::default().filter_or("RUST_LOG", config.crawler.log_level.as_str()),
    )
    .init();

    log::info!("Starting swgraph v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Database path: {}", config.db_path().display());

    let db = Db::new(config.db_path());
    let migrations_dir = config.migrations_dir().to_path_buf();
    db.with_connection(move |conn| migrate::run_migrations(conn, &migrations_dir))
        .await?;

    match cli.command.unwrap_or(Command::Verify) {
        Command::Crawl {
            no_seed,
            workers,
            retry_failed,
        } => run_crawl(&config, db, no_seed, workers, retry_failed).await,
        Command::Verify => run_schema_verification(&db).await,
        Command::ResetFailed => {
            let reset = db.with_connection(|conn| store::reset_failed(conn)).await?;
            log::info!("Reset {} failed entities to unhydrated", reset);
            Ok(())
        }
    }
}

async fn run_crawl(
    config: &Config,
    db: Db,
    no_seed: bool,
    workers: Option<usize>,
    retry_failed: bool,
) -> Result<()> {
    if retry_failed {
        let reset = db.with_connection(|conn| store::reset_failed(conn)).await?;
        log::info!("Reset {} failed entities to unhydrated", reset);
    }

    let source = HttpSource::from_config(&config.source).context("Failed to create HTTP source")?;
    log::info!("Source: {}", source.base_url());

    let workers = workers.unwrap_or(config.workers.count);
    let driver = CrawlDriver::new(db, Arc::new(source), config.retry_policy())
        .with_workers(workers)
        .with_idle_poll(config.idle_poll());

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupt received, stopping after the current cycle");
            on_signal.cancel();
        }
    });

    if no_seed {
        log::info!("Skipping seed phase");
    } else {
        let kind = config.seed_kind()?;
        let keys = config.seed_keys()?;
        log::info!("Seeding {} {} root(s)", keys.len(), kind);
        let seeded = driver.seed(kind, &keys, &cancel).await?;
        log::info!("Seeded {} of {} root(s)", seeded.seeded, keys.len());
        if seeded.cancelled {
            log::info!("Run `swgraph crawl` again to finish seeding");
            return Ok(());
        }
    }

    log::info!("Draining with {} worker(s)", workers.max(1));
    let report = driver.drain(&cancel).await?;
    report.log_summary();

    if report.cancelled {
        log::info!("Run `swgraph crawl --no-seed` to resume");
    }
    Ok(())
}

/// Check tables, indexes, pragmas and integrity of an already migrated database
async fn run_schema_verification(db: &Db) -> Result<()> {
    use swgraph::SwgraphError;

    db.with_connection(|conn| {
        let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;

        let missing: Vec<&str> = ["entities", "relationships", "schema_migrations"]
            .into_iter()
            .filter(|t| !tables.iter().any(|name| name == t))
            .collect();
        for table in &missing {
            log::error!("Missing table: {}", table);
        }
        if !missing.is_empty() {
            return Err(SwgraphError::Config("Not all required tables exist".to_string()));
        }
        log::debug!("✓ Tables exist");

        let applied = migrate::get_applied_migrations(conn)?;
        if applied.len() < 2 {
            return Err(SwgraphError::Config(format!(
                "Expected at least 2 migrations, found {}",
                applied.len()
            )));
        }
        log::debug!("✓ {} migrations applied", applied.len());

        let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type='index' AND name LIKE 'idx_%'")?;
        let indexes: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
        for index in ["idx_entities_selection", "idx_relationships_target"] {
            if !indexes.iter().any(|i| i == index) {
                return Err(SwgraphError::Config(format!("Missing index: {}", index)));
            }
        }
        log::debug!("✓ Selection and traversal indexes exist");

        let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        if !journal_mode.eq_ignore_ascii_case("wal") {
            return Err(SwgraphError::Config(format!("Journal mode is not WAL: {}", journal_mode)));
        }

        let foreign_keys: i32 = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        if foreign_keys != 1 {
            return Err(SwgraphError::Config("Foreign keys not enabled".to_string()));
        }

        let integrity: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if integrity != "ok" {
            return Err(SwgraphError::Config(format!("Database integrity check failed: {}", integrity)));
        }
        log::info!("✓ Database integrity: OK");

        let stats = store::graph_stats(conn)?;
        log::info!(
            "Graph: {} entities ({} unhydrated, {} failed), {} relationships",
            stats.total_entities(),
            stats.count_with_status(swgraph::graph::EntityStatus::Unhydrated),
            stats.count_with_status(swgraph::graph::EntityStatus::Failed),
            stats.total_relationships()
        );
        Ok(())
    })
    .await?;

    log::info!("✓ Database schema verification complete");
    Ok(())
}
