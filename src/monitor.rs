//! Refresh and page rotation loops.

use crate::aggregate::{AggregatedView, Aggregator, AggregatorConfig};
use crate::client::TransitFeed;
use crate::display::DisplaySurface;
use crate::health::{FetchError, FetchOutcome, HealthRegistry, RetryPolicy};
use crate::normalize::Normalizer;
use crate::paginate::Paginator;
use crate::types::{Departure, DepartureSource, SourceId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant, MissedTickBehavior};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Display task failed: {0}")]
    Display(#[from] tokio::task::JoinError),
}

/// Statistics for the monitor.
#[derive(Debug, Default)]
pub struct MonitorStats {
    pub cycles: AtomicU64,
    pub fetch_successes: AtomicU64,
    pub fetch_failures: AtomicU64,
    pub records_received: AtomicU64,
    pub malformed_records: AtomicU64,
    pub departures_shown: AtomicU64,
    pub frames_rendered: AtomicU64,
    pub last_cycle_ms: AtomicU64,
}

impl MonitorStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            fetch_successes: self.fetch_successes.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            records_received: self.records_received.load(Ordering::Relaxed),
            malformed_records: self.malformed_records.load(Ordering::Relaxed),
            departures_shown: self.departures_shown.load(Ordering::Relaxed),
            frames_rendered: self.frames_rendered.load(Ordering::Relaxed),
            last_cycle_ms: self.last_cycle_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub cycles: u64,
    pub fetch_successes: u64,
    pub fetch_failures: u64,
    pub records_received: u64,
    pub malformed_records: u64,
    pub departures_shown: u64,
    pub frames_rendered: u64,
    pub last_cycle_ms: u64,
}

/// Configuration for the monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Interval between refresh cycles
    pub refresh_interval: Duration,
    /// Interval between page flips on the display
    pub page_rotation: Duration,
    /// Wall-clock budget of one refresh cycle
    pub cycle_deadline: Duration,
    /// Fetches allowed in flight at once
    pub max_concurrent_fetches: usize,
    /// Consecutive failures after which a source is stale
    pub stale_threshold: u32,
    pub retry: RetryPolicy,
    pub aggregator: AggregatorConfig,
    pub normalizer: Normalizer,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(30),
            page_rotation: Duration::from_secs(5),
            cycle_deadline: Duration::from_secs(20),
            max_concurrent_fetches: 4,
            stale_threshold: 3,
            retry: RetryPolicy::default(),
            aggregator: AggregatorConfig::default(),
            normalizer: Normalizer::default(),
        }
    }
}

/// Periodically refreshes departures and drives a display.
///
/// The refresh path is the only writer of the health registry and of the
/// published view; the rotation task only ever reads the latest view.
pub struct Monitor<F> {
    feed: Arc<F>,
    sources: Vec<DepartureSource>,
    config: MonitorConfig,
    aggregator: Aggregator,
    health: Arc<RwLock<HealthRegistry>>,
    stats: Arc<MonitorStats>,
    view_tx: watch::Sender<Arc<AggregatedView>>,
}

impl<F: TransitFeed + 'static> Monitor<F> {
    /// Create a new monitor.
    pub fn new(feed: F, sources: Vec<DepartureSource>, config: MonitorConfig) -> Self {
        let aggregator = Aggregator::new(config.aggregator, &sources);
        let health = HealthRegistry::new(config.stale_threshold);
        let (view_tx, _) = watch::channel(Arc::new(AggregatedView::empty(Utc::now())));

        Self {
            feed: Arc::new(feed),
            sources,
            config,
            aggregator,
            health: Arc::new(RwLock::new(health)),
            stats: Arc::new(MonitorStats::new()),
            view_tx,
        }
    }

    pub fn sources(&self) -> &[DepartureSource] {
        &self.sources
    }

    /// Get a reference to the monitor stats.
    pub fn stats(&self) -> Arc<MonitorStats> {
        Arc::clone(&self.stats)
    }

    /// Read-only handle on source health, for reporting.
    pub fn health(&self) -> Arc<RwLock<HealthRegistry>> {
        Arc::clone(&self.health)
    }

    /// Receiver of every view published by the refresh path.
    pub fn subscribe(&self) -> watch::Receiver<Arc<AggregatedView>> {
        self.view_tx.subscribe()
    }

    pub fn current_view(&self) -> Arc<AggregatedView> {
        Arc::clone(&self.view_tx.borrow())
    }

    /// Run one refresh cycle and publish its view.
    pub async fn refresh(&mut self) -> Arc<AggregatedView> {
        let cycle_start = Utc::now();
        let started = Instant::now();

        let fetched = self.fetch_all(cycle_start).await;

        let view = {
            let health = self.health.read();
            Arc::new(self.aggregator.aggregate(cycle_start, fetched, &health))
        };

        let elapsed = started.elapsed();
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);
        self.stats
            .departures_shown
            .store(view.len() as u64, Ordering::Relaxed);
        self.stats
            .last_cycle_ms
            .store(elapsed.as_millis() as u64, Ordering::Relaxed);

        tracing::debug!(
            "Refresh cycle done in {:?}: {} departures, {} stale sources",
            elapsed,
            view.len(),
            view.stale_sources().count()
        );

        self.view_tx.send_replace(Arc::clone(&view));
        view
    }

    /// Fetch every source concurrently, bounded by the semaphore and the
    /// cycle deadline. Only sources that succeeded appear in the result.
    async fn fetch_all(&self, cycle_start: DateTime<Utc>) -> HashMap<SourceId, Vec<Departure>> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_fetches.max(1)));
        let mut tasks = JoinSet::new();

        for source in &self.sources {
            let feed = Arc::clone(&self.feed);
            let semaphore = Arc::clone(&semaphore);
            let policy = self.config.retry;
            let source = source.clone();

            tasks.spawn(async move {
                // The semaphore is never closed
                let _permit = semaphore.acquire_owned().await.ok();
                let outcome = policy.fetch(feed.as_ref(), &source).await;
                (source, outcome)
            });
        }

        let deadline = Instant::now() + self.config.cycle_deadline;
        let mut pending: HashSet<SourceId> = self.sources.iter().map(|s| s.id.clone()).collect();
        let mut fetched = HashMap::new();
        let mut deadline_passed = false;

        loop {
            match timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((source, outcome)))) => {
                    pending.remove(&source.id);
                    self.record(&source, outcome, cycle_start, &mut fetched);
                }
                Ok(Some(Err(e))) => {
                    tracing::error!("Fetch task failed: {}", e);
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        "Refresh deadline of {:?} passed with {} sources outstanding",
                        self.config.cycle_deadline,
                        pending.len()
                    );
                    tasks.abort_all();
                    deadline_passed = true;
                    break;
                }
            }
        }

        if !pending.is_empty() {
            let mut health = self.health.write();
            for id in &pending {
                let err = if deadline_passed {
                    FetchError::DeadlineExceeded
                } else {
                    FetchError::Task("fetch task ended abnormally".to_string())
                };
                health.record_failure(id, &err, Duration::ZERO);
                self.stats.fetch_failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        fetched
    }

    /// Fold one fetch outcome into health, stats and the cycle's results.
    fn record(
        &self,
        source: &DepartureSource,
        outcome: FetchOutcome,
        cycle_start: DateTime<Utc>,
        fetched: &mut HashMap<SourceId, Vec<Departure>>,
    ) {
        self.health.write().apply(&source.id, &outcome, cycle_start);

        let records = match outcome.result {
            Ok(records) => records,
            Err(_) => {
                self.stats.fetch_failures.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        self.stats.fetch_successes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .records_received
            .fetch_add(records.len() as u64, Ordering::Relaxed);

        let mut departures = Vec::with_capacity(records.len());
        for raw in &records {
            match self.config.normalizer.normalize(source, raw) {
                Ok(dep) => departures.push(dep),
                Err(e) if e.is_filtered() => {
                    tracing::trace!("Source {}: skipping record: {}", source.id, e);
                }
                Err(e) => {
                    tracing::warn!("Source {}: malformed record: {}", source.id, e);
                    self.stats.malformed_records.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        tracing::debug!(
            "Source {}: {} departures from {} records in {} attempts",
            source.id,
            departures.len(),
            records.len(),
            outcome.attempts
        );

        fetched.insert(source.id.clone(), departures);
    }

    /// Run until `shutdown` turns true (or its sender is dropped).
    ///
    /// Refreshing and page rotation run as independent loops. On stop, an
    /// in-flight refresh is abandoned and the rotation task exits after its
    /// current write.
    pub async fn run<D>(
        mut self,
        display: D,
        paginator: Paginator,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), MonitorError>
    where
        D: DisplaySurface + 'static,
    {
        tracing::info!(
            "Monitoring {} sources, refresh every {:?}, page rotation every {:?}",
            self.sources.len(),
            self.config.refresh_interval,
            self.config.page_rotation
        );

        let rotation = tokio::spawn(rotate_pages(
            display,
            paginator,
            self.subscribe(),
            shutdown.clone(),
            self.config.page_rotation,
            Arc::clone(&self.stats),
        ));

        let mut interval = tokio::time::interval(self.config.refresh_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => break,
                _ = interval.tick() => {}
            }

            tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => {
                    tracing::info!("Stop requested, abandoning refresh in progress");
                    break;
                }
                _ = self.refresh() => {}
            }
        }

        rotation.await?;
        tracing::info!("Monitor stopped");
        Ok(())
    }
}

/// Resolves once a stop is requested or the stop sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Show one frame per tick, starting over whenever a new view arrives.
async fn rotate_pages<D: DisplaySurface>(
    mut display: D,
    paginator: Paginator,
    mut views: watch::Receiver<Arc<AggregatedView>>,
    mut shutdown: watch::Receiver<bool>,
    every: Duration,
    stats: Arc<MonitorStats>,
) {
    let mut frames = paginator.paginate(&views.borrow_and_update());
    let mut page = 0usize;

    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => break,
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                frames = paginator.paginate(&views.borrow_and_update());
                display.render(&frames[0]);
                stats.frames_rendered.fetch_add(1, Ordering::Relaxed);
                page = 1;
                ticker.reset();
            }
            _ = ticker.tick() => {
                display.render(&frames[page % frames.len()]);
                stats.frames_rendered.fetch_add(1, Ordering::Relaxed);
                page = (page + 1) % frames.len();
            }
        }
    }
}
