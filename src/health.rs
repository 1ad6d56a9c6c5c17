//! Per-source fetch retry policy and health tracking.
//!
//! Every fetch goes through [`RetryPolicy::fetch`], which bounds each attempt
//! with a timeout and retries with capped exponential backoff. The outcome is
//! folded into a [`SourceHealth`] entry by the refresh path; nothing here ever
//! propagates an error to the monitor loop.

use crate::client::{ClientError, TransitFeed};
use crate::types::{DepartureSource, RawRecord, SourceId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("Client error: {0}")]
    Client(#[from] ClientError),
    #[error("Refresh cycle deadline passed")]
    DeadlineExceeded,
    #[error("Fetch task failed: {0}")]
    Task(String),
}

/// Retry and backoff parameters for one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Timeout applied to each attempt
    pub attempt_timeout: Duration,
    /// Total attempts per cycle, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles afterwards
    pub base_delay: Duration,
    /// Upper bound for any single backoff delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(5),
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

/// Result of one policy-wrapped fetch.
#[derive(Debug)]
pub struct FetchOutcome {
    pub result: Result<Vec<RawRecord>, FetchError>,
    pub attempts: u32,
    /// Last backoff delay waited, zero if none
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Backoff before attempt `attempt + 1`, for `attempt >= 1`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Fetch `source` with timeout and retries.
    pub async fn fetch<F: TransitFeed>(
        &self,
        feed: &F,
        source: &DepartureSource,
    ) -> FetchOutcome {
        let max_attempts = self.max_attempts.max(1);
        let mut backoff = Duration::ZERO;
        let mut attempt = 0;

        loop {
            attempt += 1;

            let err = match timeout(self.attempt_timeout, feed.fetch_departures(source)).await {
                Ok(Ok(records)) => {
                    return FetchOutcome {
                        result: Ok(records),
                        attempts: attempt,
                        backoff,
                    };
                }
                Ok(Err(e)) => FetchError::Client(e),
                Err(_) => FetchError::Timeout(self.attempt_timeout),
            };

            if attempt >= max_attempts {
                tracing::warn!(
                    "Source {} failed after {} attempts: {}",
                    source.id,
                    attempt,
                    err
                );
                return FetchOutcome {
                    result: Err(err),
                    attempts: attempt,
                    backoff,
                };
            }

            backoff = match &err {
                FetchError::Client(ClientError::RateLimited {
                    retry_after: Some(wait),
                }) => (*wait).min(self.max_delay),
                _ => self.backoff_for(attempt),
            };

            tracing::debug!(
                "Source {} attempt {} failed ({}), retrying in {:?}",
                source.id,
                attempt,
                err,
                backoff
            );
            sleep(backoff).await;
        }
    }
}

/// Coarse health state of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    /// Failing, but below the stale threshold
    Degraded(u32),
    /// At or above the stale threshold
    Stale(u32),
}

/// Fetch history of a single source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceHealth {
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub current_backoff: Duration,
    pub last_error: Option<String>,
}

impl SourceHealth {
    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.consecutive_failures = 0;
        self.last_success = Some(at);
        self.current_backoff = Duration::ZERO;
        self.last_error = None;
    }

    pub fn record_failure(&mut self, error: &FetchError, backoff: Duration) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.current_backoff = backoff;
        self.last_error = Some(error.to_string());
    }

    pub fn state(&self, stale_threshold: u32) -> HealthState {
        match self.consecutive_failures {
            0 => HealthState::Healthy,
            n if n >= stale_threshold => HealthState::Stale(n),
            n => HealthState::Degraded(n),
        }
    }
}

/// Health of every configured source.
///
/// Written only by the refresh path; everyone else uses the read-only queries.
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    stale_threshold: u32,
    sources: HashMap<SourceId, SourceHealth>,
}

impl HealthRegistry {
    pub fn new(stale_threshold: u32) -> Self {
        Self {
            stale_threshold: stale_threshold.max(1),
            sources: HashMap::new(),
        }
    }

    pub fn stale_threshold(&self) -> u32 {
        self.stale_threshold
    }

    /// Fold a fetch outcome into the source's health.
    pub fn apply(&mut self, id: &SourceId, outcome: &FetchOutcome, at: DateTime<Utc>) {
        match &outcome.result {
            Ok(_) => self.record_success(id, at),
            Err(e) => self.record_failure(id, e, outcome.backoff),
        }
    }

    pub fn record_success(&mut self, id: &SourceId, at: DateTime<Utc>) {
        self.sources.entry(id.clone()).or_default().record_success(at);
    }

    pub fn record_failure(&mut self, id: &SourceId, error: &FetchError, backoff: Duration) {
        let health = self.sources.entry(id.clone()).or_default();
        health.record_failure(error, backoff);

        if health.consecutive_failures == self.stale_threshold {
            tracing::warn!(
                "Source {} is stale after {} consecutive failures",
                id,
                health.consecutive_failures
            );
        }
    }

    pub fn get(&self, id: &SourceId) -> Option<&SourceHealth> {
        self.sources.get(id)
    }

    pub fn state(&self, id: &SourceId) -> HealthState {
        self.sources
            .get(id)
            .map(|h| h.state(self.stale_threshold))
            .unwrap_or(HealthState::Healthy)
    }

    /// Whether the source's data should be treated as unreliable.
    pub fn is_stale(&self, id: &SourceId) -> bool {
        matches!(self.state(id), HealthState::Stale(_))
    }

    pub fn last_success(&self, id: &SourceId) -> Option<DateTime<Utc>> {
        self.sources.get(id).and_then(|h| h.last_success)
    }

    /// Ids of all sources currently stale, sorted.
    pub fn stale_sources(&self) -> Vec<SourceId> {
        let mut ids: Vec<_> = self
            .sources
            .keys()
            .filter(|id| self.is_stale(id))
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Feed that plays back a script of results, one per call.
    struct ScriptedFeed {
        script: Mutex<Vec<Result<Vec<RawRecord>, ClientError>>>,
        calls: AtomicU32,
        hang: bool,
    }

    impl ScriptedFeed {
        fn new(mut script: Vec<Result<Vec<RawRecord>, ClientError>>) -> Self {
            script.reverse();
            Self {
                script: Mutex::new(script),
                calls: AtomicU32::new(0),
                hang: false,
            }
        }

        fn hanging() -> Self {
            Self {
                hang: true,
                ..Self::new(Vec::new())
            }
        }
    }

    impl TransitFeed for ScriptedFeed {
        async fn fetch_departures(
            &self,
            _source: &DepartureSource,
        ) -> Result<Vec<RawRecord>, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            let next = self.script.lock().pop();
            next.unwrap_or_else(|| Err(ClientError::Feed("script exhausted".into())))
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            attempt_timeout: Duration::from_secs(2),
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.backoff_for(1), Duration::from_millis(500));
        assert_eq!(p.backoff_for(2), Duration::from_secs(1));
        assert_eq!(p.backoff_for(3), Duration::from_secs(2));
        assert_eq!(p.backoff_for(5), Duration::from_secs(8));
        assert_eq!(p.backoff_for(40), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let feed = ScriptedFeed::new(vec![
            Err(ClientError::Feed("boom".into())),
            Ok(vec![RawRecord::default()]),
        ]);
        let source = DepartureSource::new("1");

        let outcome = policy().fetch(&feed, &source).await;
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.result.unwrap().len(), 1);
        assert_eq!(feed.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_on_every_attempt() {
        let feed = ScriptedFeed::hanging();
        let source = DepartureSource::new("C");

        let outcome = policy().fetch(&feed, &source).await;
        assert_eq!(outcome.attempts, 3);
        assert!(matches!(outcome.result, Err(FetchError::Timeout(_))));
        assert_eq!(outcome.backoff, Duration::from_secs(1));
        assert_eq!(feed.calls.load(Ordering::SeqCst), 3);

        let mut registry = HealthRegistry::new(3);
        registry.apply(&source.id, &outcome, Utc::now());
        assert_eq!(registry.get(&source.id).unwrap().consecutive_failures, 1);
        assert_eq!(registry.state(&source.id), HealthState::Degraded(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_uses_retry_after() {
        let feed = ScriptedFeed::new(vec![
            Err(ClientError::RateLimited {
                retry_after: Some(Duration::from_secs(60)),
            }),
            Ok(Vec::new()),
        ]);
        let outcome = policy().fetch(&feed, &DepartureSource::new("1")).await;
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.backoff, Duration::from_secs(8));
    }

    #[test]
    fn test_state_machine() {
        let id = SourceId::new("a");
        let mut registry = HealthRegistry::new(2);
        assert_eq!(registry.state(&id), HealthState::Healthy);

        let err = FetchError::Timeout(Duration::from_secs(1));
        registry.record_failure(&id, &err, Duration::from_secs(1));
        assert_eq!(registry.state(&id), HealthState::Degraded(1));
        assert!(!registry.is_stale(&id));

        registry.record_failure(&id, &err, Duration::from_secs(2));
        assert_eq!(registry.state(&id), HealthState::Stale(2));
        assert!(registry.is_stale(&id));
        assert_eq!(registry.stale_sources(), vec![id.clone()]);

        let now = Utc::now();
        registry.record_success(&id, now);
        assert_eq!(registry.state(&id), HealthState::Healthy);
        let health = registry.get(&id).unwrap();
        assert_eq!(health.last_success, Some(now));
        assert_eq!(health.current_backoff, Duration::ZERO);
        assert_eq!(health.last_error, None);
    }
}
