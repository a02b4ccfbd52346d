//! Seed-then-drain crawl loop.
//!
//! The store is the work queue: each cycle claims one unhydrated entity,
//! fetches its document, and upserts it, which may create more unhydrated
//! stubs. Draining ends when no unclaimed unhydrated entity is left and no
//! worker is still holding a claim.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::Connection;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::crawl::source::DocumentSource;
use crate::db::Db;
use crate::error::{Result, SwgraphError};
use crate::graph::store::{self, canonical_key, FailedEntity, PendingEntity};
use crate::graph::upsert::{resolve_key, upsert_in_tx};
use crate::graph::{Document, EntityKind, UpsertOutcome};

/// Bounded retry with exponential backoff for fetches and store transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Fetch attempts per entity, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Extra attempts for a store transaction that failed to commit.
    pub store_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            store_retries: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based): doubles each time, capped.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Result of one select-fetch-upsert cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Hydrated(UpsertOutcome),
    Failed { key: String, kind: String, error: String },
}

/// Result of seeding the root set.
#[derive(Debug, Clone, Default)]
pub struct SeedReport {
    pub seeded: usize,
    /// Seeding stopped early because the token was cancelled.
    pub cancelled: bool,
    /// `(key, error)` for roots that could not be fetched or upserted.
    pub failed: Vec<(String, String)>,
}

/// Summary of one drain pass.
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    pub cycles: usize,
    pub hydrated: usize,
    pub failed_this_run: usize,
    pub stubs_discovered: usize,
    pub relationships_created: usize,
    pub cancelled: bool,
    /// Every entity in the failed state when the pass ended, including earlier runs.
    pub failed: Vec<FailedEntity>,
    pub elapsed: Duration,
}

impl DrainReport {
    fn absorb(&mut self, worker: WorkerStats) {
        self.cycles += worker.cycles;
        self.hydrated += worker.hydrated;
        self.failed_this_run += worker.failed;
        self.stubs_discovered += worker.stubs_discovered;
        self.relationships_created += worker.relationships_created;
    }

    /// Log the end-of-pass summary, one line per failed entity.
    pub fn log_summary(&self) {
        log::info!("=== Drain {} ===", if self.cancelled { "Interrupted" } else { "Complete" });
        log::info!("Cycles: {} (hydrated: {}, failed: {})", self.cycles, self.hydrated, self.failed_this_run);
        log::info!("Stubs discovered: {}", self.stubs_discovered);
        log::info!("Relationships created: {}", self.relationships_created);
        log::info!("Time: {:?}", self.elapsed);
        if self.failed.is_empty() {
            log::info!("No entities in failed state");
            return;
        }
        log::warn!("{} entities in failed state (run `swgraph reset-failed` to retry them):", self.failed.len());
        for f in &self.failed {
            log::warn!(
                "  {} {} after {} attempt(s): {}",
                f.kind,
                f.key,
                f.attempts,
                f.last_error.as_deref().unwrap_or("unknown error")
            );
        }
    }
}

#[derive(Debug, Default)]
struct WorkerStats {
    cycles: usize,
    hydrated: usize,
    failed: usize,
    stubs_discovered: usize,
    relationships_created: usize,
}

impl WorkerStats {
    fn record(&mut self, outcome: &CycleOutcome) {
        self.cycles += 1;
        match outcome {
            CycleOutcome::Hydrated(o) => {
                self.hydrated += 1;
                self.stubs_discovered += o.stubs_created;
                self.relationships_created += o.relationships_created;
            }
            CycleOutcome::Failed { .. } => self.failed += 1,
        }
    }
}

/// Orchestrates seeding and draining against one store and one document source.
#[derive(Clone)]
pub struct CrawlDriver {
    db: Db,
    source: Arc<dyn DocumentSource>,
    policy: RetryPolicy,
    workers: usize,
    idle_poll: Duration,
    run_id: String,
}

impl CrawlDriver {
    pub fn new(db: Db, source: Arc<dyn DocumentSource>, policy: RetryPolicy) -> Self {
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        Self {
            db,
            source,
            policy,
            workers: 1,
            idle_poll: Duration::from_millis(200),
            run_id: run_id[..8].to_string(),
        }
    }

    /// Number of concurrent drain workers (at least one).
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// How long an idle worker waits before re-checking for work others may discover.
    pub fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }

    /// Fetch and upsert the root set unconditionally.
    ///
    /// A root that can't be fetched is recorded as a failed entity so it shows
    /// up in the failure summary and can be retried with `reset-failed`.
    /// `cancel` is checked between roots.
    pub async fn seed(&self, kind: EntityKind, keys: &[String], cancel: &CancellationToken) -> Result<SeedReport> {
        let mut report = SeedReport::default();

        for (idx, raw_key) in keys.iter().enumerate() {
            if cancel.is_cancelled() {
                log::info!("Seeding cancelled after {} of {} root(s)", idx, keys.len());
                report.cancelled = true;
                break;
            }
            let Some(key) = canonical_key(raw_key) else {
                return Err(SwgraphError::InvalidInput(format!("blank seed key at position {}", idx)));
            };
            log::info!("[seed {}/{}] {} {}", idx + 1, keys.len(), kind, key);

            let (fetched, attempts) = self.fetch_with_retry(&key).await;
            let result = match fetched {
                Ok(document) => self.checked_upsert(kind, &key, document).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(outcome) => {
                    report.seeded += 1;
                    log::info!(
                        "✓ {} ({} new stubs, {} new relationships)",
                        key,
                        outcome.stubs_created,
                        outcome.relationships_created
                    );
                }
                Err(e) if e.is_store_failure() => return Err(e),
                Err(e) => {
                    log::error!("✗ seed {}: {}", key, e);
                    let message = e.to_string();
                    let stub_key = key.clone();
                    self.with_store_retry(move |conn| {
                        let (id, _) = store::ensure_stub(conn, kind, &stub_key)?;
                        store::mark_failed(conn, id, &message, attempts)
                    })
                    .await?;
                    report.failed.push((key, e.to_string()));
                }
            }
        }

        Ok(report)
    }

    /// Drain until no unhydrated entity remains or `cancel` fires.
    ///
    /// Cancellation is honoured between cycles only, so the store is always
    /// left at a cycle boundary and a later drain resumes where this one stopped.
    pub async fn drain(&self, cancel: &CancellationToken) -> Result<DrainReport> {
        let start = Instant::now();

        let released = self.with_store_retry(|conn| store::release_all_claims(conn)).await?;
        if released > 0 {
            log::info!("Released {} stale claim(s) from an interrupted run", released);
        }

        let stop = cancel.child_token();
        let mut workers = JoinSet::new();
        for n in 0..self.workers {
            let driver = self.clone();
            let stop = stop.clone();
            let worker_id = format!("{}-w{}", self.run_id, n);
            workers.spawn(async move { driver.run_worker(worker_id, stop).await });
        }

        let mut report = DrainReport::default();
        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            let result = joined
                .map_err(|e| SwgraphError::Io(std::io::Error::other(format!("drain worker panicked: {}", e))))
                .and_then(|r| r);
            match result {
                Ok(stats) => report.absorb(stats),
                Err(e) => {
                    log::error!("Drain worker stopped: {}", e);
                    stop.cancel();
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        report.cancelled = cancel.is_cancelled();
        report.failed = self.with_store_retry(|conn| store::list_failed(conn)).await?;
        report.elapsed = start.elapsed();
        Ok(report)
    }

    async fn run_worker(&self, worker_id: String, stop: CancellationToken) -> Result<WorkerStats> {
        let mut stats = WorkerStats::default();
        log::debug!("Worker {} started", worker_id);

        loop {
            if stop.is_cancelled() {
                log::info!("Worker {} cancelled after {} cycle(s)", worker_id, stats.cycles);
                break;
            }

            let claimer = worker_id.clone();
            let claimed = self
                .with_store_retry(move |conn| store::claim_next_unhydrated(conn, &claimer))
                .await?;

            let Some(pending) = claimed else {
                let in_flight = self.with_store_retry(|conn| store::count_in_flight(conn)).await?;
                if in_flight == 0 {
                    break;
                }
                // Another worker may still discover new stubs.
                tokio::select! {
                    _ = stop.cancelled() => {}
                    _ = tokio::time::sleep(self.idle_poll) => {}
                }
                continue;
            };

            let outcome = self.run_cycle(pending).await?;
            stats.record(&outcome);
        }

        log::debug!("Worker {} finished: {:?}", worker_id, stats);
        Ok(stats)
    }

    /// Fetch and upsert one claimed entity.
    ///
    /// Per-entity problems end in `CycleOutcome::Failed` with the entity marked
    /// failed. Only a store that stays unavailable is returned as an error.
    pub async fn run_cycle(&self, pending: PendingEntity) -> Result<CycleOutcome> {
        let kind = match pending.kind.parse::<EntityKind>() {
            Ok(kind) if kind.is_tag() => {
                let err = SwgraphError::InvalidInput(format!("tag kind {} has no remote document", kind));
                return self.fail(&pending, err, 0).await;
            }
            Ok(kind) => kind,
            Err(e) => return self.fail(&pending, e, 0).await,
        };

        let (fetched, attempts) = self.fetch_with_retry(&pending.key).await;
        let document = match fetched {
            Ok(document) => document,
            Err(e) => return self.fail(&pending, e, attempts).await,
        };

        match self.checked_upsert(kind, &pending.key, document).await {
            Ok(outcome) => {
                log::info!(
                    "✓ {} {} ({} new stubs, {} new relationships)",
                    kind,
                    pending.key,
                    outcome.stubs_created,
                    outcome.relationships_created
                );
                Ok(CycleOutcome::Hydrated(outcome))
            }
            Err(e) if e.is_store_failure() => Err(e),
            Err(e) => self.fail(&pending, e, attempts).await,
        }
    }

    /// Fetch with bounded retry. Returns the final result and the attempts spent.
    pub async fn fetch_with_retry(&self, key: &str) -> (Result<Document>, u32) {
        let mut attempt = 1;
        loop {
            match self.source.fetch(key).await {
                Ok(document) => return (Ok(document), attempt),
                Err(e) if e.is_transient() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.backoff_for(attempt);
                    log::warn!(
                        "Retry {}/{} for {} in {:?} after error: {}",
                        attempt,
                        self.policy.max_attempts,
                        key,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return (Err(e), attempt),
            }
        }
    }

    /// Upsert a document fetched for `expected_key`, refusing documents that
    /// describe a different entity (that would leave the claimed one unhydrated).
    async fn checked_upsert(&self, kind: EntityKind, expected_key: &str, document: Document) -> Result<UpsertOutcome> {
        let key = resolve_key(kind, &document)?;
        if key != expected_key {
            return Err(SwgraphError::MalformedDocument(format!(
                "document for {} carries key {}",
                expected_key, key
            )));
        }
        let document = Arc::new(document);
        self.with_store_retry(move |conn| upsert_in_tx(conn, kind, &document)).await
    }

    async fn fail(&self, pending: &PendingEntity, error: SwgraphError, attempts: u32) -> Result<CycleOutcome> {
        log::error!("✗ {} {}: {}", pending.kind, pending.key, error);
        let id = pending.id;
        let message = error.to_string();
        let stored = message.clone();
        self.with_store_retry(move |conn| store::mark_failed(conn, id, &stored, attempts))
            .await?;
        Ok(CycleOutcome::Failed {
            key: pending.key.clone(),
            kind: pending.kind.clone(),
            error: message,
        })
    }

    /// Run a store operation, retrying the whole transaction on store failures.
    async fn with_store_retry<F, T>(&self, f: F) -> Result<T>
    where
        F: Fn(&mut Connection) -> Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let f = Arc::new(f);
        let mut attempt = 0;
        loop {
            let op = Arc::clone(&f);
            match self.db.with_connection(move |conn| (*op)(conn)).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_store_failure() && attempt < self.policy.store_retries => {
                    attempt += 1;
                    let delay = self.policy.backoff_for(attempt);
                    log::warn!("Store retry {}/{} in {:?}: {}", attempt, self.policy.store_retries, delay, e);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
