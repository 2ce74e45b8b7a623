//! Periodic ingestion cycles over a fixed-width worker pool.
//!
//! One cycle: read the clock, pick due sources, push a [`FetchJob`] per source onto a work
//! queue drained by `W` workers, and consume their results on a single channel. The cycle
//! ends once every worker has exited, so cycles never overlap and a source is never fetched
//! twice at the same time.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use billy_adapters::FetchError;
use billy_core::SourceId;
use billy_storage::{CatalogStore, StoreError};
use chrono::Utc;
use metrics::{counter, gauge};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::merge::{MergeReport, Merger};
use crate::registry::{FetchJob, SourceRegistry};

pub trait Clock: Send + Sync {
    /// Epoch seconds.
    fn now(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self(AtomicI64::new(start))
    }

    pub fn set(&self, ts: i64) {
        self.0.store(ts, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Pool width; also the cap on concurrent fetches.
    pub workers: usize,
    pub check_interval: Duration,
    pub fetch_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            check_interval: Duration::from_secs(3600),
            fetch_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Error)]
enum SourceFailure {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("abandoned on shutdown")]
    Abandoned,
}

impl SourceFailure {
    fn kind(&self) -> &'static str {
        match self {
            SourceFailure::Fetch(err) => err.kind(),
            SourceFailure::Store(_) => "store",
            SourceFailure::Abandoned => "abandoned",
        }
    }
}

struct Completion {
    job: FetchJob,
    fetched: usize,
    result: Result<MergeReport, SourceFailure>,
}

/// Per-cycle outcome, also logged at the end of every cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    /// Clock reading taken before dispatch; successful sources advance to it.
    pub started_at: i64,
    pub due: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub abandoned: usize,
    pub fetched_items: usize,
    pub merge: MergeReport,
    pub failed_sources: Vec<SourceId>,
}

pub struct Scheduler {
    registry: SourceRegistry,
    store: Arc<dyn CatalogStore>,
    merger: Merger,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        registry: SourceRegistry,
        store: Arc<dyn CatalogStore>,
        merger: Merger,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            store,
            merger,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut SourceRegistry {
        &mut self.registry
    }

    /// Runs cycles until `cancel` fires, sleeping `check_interval` between them.
    pub async fn run(&mut self, cancel: CancellationToken) {
        info!(
            sources = self.registry.len(),
            workers = self.config.workers,
            interval_secs = self.config.check_interval.as_secs(),
            "ingestion loop started"
        );
        while !cancel.is_cancelled() {
            self.run_cycle(&cancel).await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.check_interval) => {}
            }
        }
        info!("ingestion loop stopped");
    }

    /// One full cycle. Returns after every dispatched fetch has succeeded, failed or been
    /// abandoned.
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> CycleSummary {
        let started_at = self.clock.now();
        let interval = self.config.check_interval.as_secs() as i64;
        let due = self.registry.due(started_at, interval);
        let mut summary = CycleSummary {
            started_at,
            due: due.len(),
            ..CycleSummary::default()
        };
        counter!("ingest_cycles_total").increment(1);
        if due.is_empty() {
            debug!(started_at, "no sources due");
            gauge!("ingest_last_cycle_ts").set(started_at as f64);
            return summary;
        }

        let (job_tx, job_rx) = async_channel::bounded::<FetchJob>(due.len());
        let (result_tx, mut result_rx) = mpsc::channel::<Completion>(due.len());

        let mut workers = JoinSet::new();
        for worker in 0..self.config.workers.clamp(1, due.len()) {
            let jobs = job_rx.clone();
            let results = result_tx.clone();
            let merger = self.merger.clone();
            let cancel = cancel.clone();
            let timeout = self.config.fetch_timeout;
            workers.spawn(
                async move {
                    while let Ok(job) = jobs.recv().await {
                        let completion = process(job, &merger, &cancel, timeout).await;
                        if results.send(completion).await.is_err() {
                            break;
                        }
                    }
                }
                .instrument(info_span!("ingest_worker", worker)),
            );
        }
        drop(result_tx);
        drop(job_rx);

        for id in due {
            if let Some(job) = self.registry.dispatch(id) {
                if job_tx.send(job).await.is_err() {
                    break;
                }
            }
        }
        job_tx.close();

        while let Some(completion) = result_rx.recv().await {
            self.settle(completion, &mut summary).await;
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "ingest worker panicked");
            }
        }
        for id in self.registry.release_all() {
            let label = self.registry.get(id).map(|e| e.source.label()).unwrap_or_default();
            warn!(source_id = %id, source = %label, "worker died mid-fetch; watermark kept");
            summary.failed += 1;
            summary.failed_sources.push(id);
        }

        gauge!("ingest_last_cycle_ts").set(started_at as f64);
        info!(
            started_at,
            due = summary.due,
            succeeded = summary.succeeded,
            failed = summary.failed,
            abandoned = summary.abandoned,
            inserted = summary.merge.inserted,
            attributed = summary.merge.attributed,
            "ingest cycle finished"
        );
        summary
    }

    /// Single-owner bookkeeping for one finished job. The watermark is persisted first and
    /// mirrored in memory only once the store accepted it.
    async fn settle(&mut self, completion: Completion, summary: &mut CycleSummary) {
        let Completion { job, fetched, result } = completion;
        summary.fetched_items += fetched;

        let result = match result {
            Ok(report) => self
                .store
                .update_source_watermark(job.source_id, summary.started_at)
                .await
                .map(|()| report)
                .map_err(SourceFailure::from),
            Err(err) => Err(err),
        };

        match result {
            Ok(report) => {
                self.registry.complete(job.source_id, Some(summary.started_at));
                summary.succeeded += 1;
                summary.merge.absorb(report);
            }
            Err(err) => {
                self.registry.complete(job.source_id, None);
                summary.failed_sources.push(job.source_id);
                match &err {
                    SourceFailure::Abandoned => {
                        summary.abandoned += 1;
                        debug!(source_id = %job.source_id, source = %job.label, "fetch abandoned");
                    }
                    SourceFailure::Store(_) => {
                        summary.failed += 1;
                        counter!("ingest_store_failures_total").increment(1);
                        warn!(source_id = %job.source_id, source = %job.label, error = %err, "catalog write failed; watermark kept");
                    }
                    SourceFailure::Fetch(_) => {
                        summary.failed += 1;
                        counter!("ingest_fetch_failures_total", "kind" => err.kind()).increment(1);
                        warn!(
                            source_id = %job.source_id,
                            source = %job.label,
                            watermark = job.watermark,
                            kind = err.kind(),
                            error = %err,
                            "fetch failed; will retry next cycle"
                        );
                    }
                }
            }
        }
    }
}

/// Worker body: fetch under a timeout, then merge the whole batch in one call.
async fn process(job: FetchJob, merger: &Merger, cancel: &CancellationToken, timeout: Duration) -> Completion {
    let fetch = tokio::time::timeout(timeout, job.adapter.fetch(job.watermark));
    let fetched = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SourceFailure::Abandoned),
        outcome = fetch => match outcome {
            Ok(Ok(items)) => Ok(items),
            Ok(Err(err)) => Err(SourceFailure::Fetch(err)),
            Err(_) => Err(SourceFailure::Fetch(FetchError::Timeout(timeout))),
        },
    };

    match fetched {
        Ok(items) => {
            let count = items.len();
            let batch = items.into_iter().map(|item| (job.source_id, item)).collect();
            let result = merger.merge(batch).await.map_err(SourceFailure::from);
            Completion {
                job,
                fetched: count,
                result,
            }
        }
        Err(err) => Completion {
            job,
            fetched: 0,
            result: Err(err),
        },
    }
}
