//! Merging of per-source departures into one ordered view.

use crate::health::HealthRegistry;
use crate::types::{Departure, DepartureSource, SourceId};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

/// Freshness of one source as seen by a view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFreshness {
    /// Time of the last successful fetch, if any
    pub last_success: Option<DateTime<Utc>>,
    /// Data is missing from this cycle or the source keeps failing
    pub stale: bool,
}

/// Merged, sorted and deduplicated departures of all sources.
///
/// Views are immutable once built; the monitor publishes them behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedView {
    generated_at: DateTime<Utc>,
    departures: Vec<Departure>,
    freshness: BTreeMap<SourceId, SourceFreshness>,
}

impl AggregatedView {
    /// Build a view. `departures` is sorted into display order.
    pub fn new(
        generated_at: DateTime<Utc>,
        mut departures: Vec<Departure>,
        freshness: BTreeMap<SourceId, SourceFreshness>,
    ) -> Self {
        departures.sort_by(display_order);
        Self {
            generated_at,
            departures,
            freshness,
        }
    }

    /// A view with no departures and no known sources.
    pub fn empty(generated_at: DateTime<Utc>) -> Self {
        Self::new(generated_at, Vec::new(), BTreeMap::new())
    }

    /// Cycle start time the view was computed against.
    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }

    pub fn departures(&self) -> &[Departure] {
        &self.departures
    }

    pub fn len(&self) -> usize {
        self.departures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.departures.is_empty()
    }

    pub fn freshness(&self, id: &SourceId) -> Option<&SourceFreshness> {
        self.freshness.get(id)
    }

    pub fn is_stale(&self, id: &SourceId) -> bool {
        self.freshness.get(id).is_some_and(|f| f.stale)
    }

    pub fn stale_sources(&self) -> impl Iterator<Item = &SourceId> {
        self.freshness
            .iter()
            .filter(|(_, f)| f.stale)
            .map(|(id, _)| id)
    }
}

/// Effective time, then source id, then line label. The remaining keys only
/// make the order total.
fn display_order(a: &Departure, b: &Departure) -> Ordering {
    a.effective_time()
        .cmp(&b.effective_time())
        .then_with(|| a.source.cmp(&b.source))
        .then_with(|| a.line.cmp(&b.line))
        .then_with(|| a.destination.cmp(&b.destination))
        .then_with(|| a.trip_id.cmp(&b.trip_id))
}

/// Aggregation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorConfig {
    /// Departures further ahead than this are dropped. `None` = unbounded.
    pub horizon: Option<ChronoDuration>,
    /// How long a failing source's last departures are kept.
    pub retention: ChronoDuration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            horizon: None,
            retention: ChronoDuration::minutes(15),
        }
    }
}

/// The last successful fetch of a source.
#[derive(Debug, Clone)]
struct Generation {
    departures: Vec<Departure>,
    fetched_at: DateTime<Utc>,
}

/// Builds [`AggregatedView`]s and keeps the last known generation per source.
#[derive(Debug)]
pub struct Aggregator {
    config: AggregatorConfig,
    /// Configured sources with their per-source departure cap
    sources: BTreeMap<SourceId, Option<usize>>,
    generations: HashMap<SourceId, Generation>,
}

impl Aggregator {
    pub fn new(config: AggregatorConfig, sources: &[DepartureSource]) -> Self {
        Self {
            config,
            sources: sources
                .iter()
                .map(|s| (s.id.clone(), s.max_departures))
                .collect(),
            generations: HashMap::new(),
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Merge this cycle's fetch results into a new view.
    ///
    /// Sources missing from `fetched` failed this cycle: their previous
    /// generation is kept, flagged stale, until the retention window runs out.
    pub fn aggregate(
        &mut self,
        cycle_start: DateTime<Utc>,
        mut fetched: HashMap<SourceId, Vec<Departure>>,
        health: &HealthRegistry,
    ) -> AggregatedView {
        fetched.retain(|id, _| {
            let known = self.sources.contains_key(id);
            if !known {
                tracing::warn!("Dropping departures of unconfigured source {}", id);
            }
            known
        });

        let mut freshness = BTreeMap::new();
        let mut departures = Vec::new();

        for (id, cap) in &self.sources {
            let present = match fetched.remove(id) {
                Some(fresh) => {
                    self.generations.insert(
                        id.clone(),
                        Generation {
                            departures: fresh,
                            fetched_at: cycle_start,
                        },
                    );
                    true
                }
                None => false,
            };

            if !present {
                let expired = self
                    .generations
                    .get(id)
                    .is_some_and(|g| cycle_start - g.fetched_at > self.config.retention);
                if expired {
                    tracing::info!("Dropping outdated departures of source {}", id);
                    self.generations.remove(id);
                }
            }

            let generation = self.generations.get(id);

            freshness.insert(
                id.clone(),
                SourceFreshness {
                    last_success: health
                        .last_success(id)
                        .or_else(|| generation.map(|g| g.fetched_at)),
                    stale: !present || health.is_stale(id),
                },
            );

            if let Some(generation) = generation {
                departures.extend(self.select(&generation.departures, cycle_start, *cap));
            }
        }

        AggregatedView::new(cycle_start, departures, freshness)
    }

    /// Window filter, dedup by trip id (last wins), then the per-source cap.
    fn select(
        &self,
        departures: &[Departure],
        cycle_start: DateTime<Utc>,
        cap: Option<usize>,
    ) -> Vec<Departure> {
        let in_window: Vec<&Departure> = departures
            .iter()
            .filter(|d| self.in_window(d, cycle_start))
            .collect();

        let mut latest: HashMap<&str, usize> = HashMap::with_capacity(in_window.len());
        for (i, dep) in in_window.iter().enumerate() {
            latest.insert(dep.trip_id.as_str(), i);
        }

        let mut selected: Vec<Departure> = in_window
            .iter()
            .enumerate()
            .filter(|(i, dep)| latest.get(dep.trip_id.as_str()) == Some(i))
            .map(|(_, dep)| (*dep).clone())
            .collect();

        if let Some(cap) = cap {
            selected.sort_by(display_order);
            selected.truncate(cap);
        }

        selected
    }

    fn in_window(&self, departure: &Departure, cycle_start: DateTime<Utc>) -> bool {
        let at = departure.effective_time();
        if at < cycle_start {
            return false;
        }
        match self.config.horizon {
            Some(horizon) => cycle_start
                .checked_add_signed(horizon)
                .map_or(true, |end| at <= end),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::FetchError;
    use chrono::TimeZone;
    use std::time::Duration;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn dep(source: &str, line: &str, trip: &str, minutes: i64) -> Departure {
        Departure {
            source: SourceId::new(source),
            line: line.into(),
            destination: format!("dest-{}", trip),
            scheduled: t0() + ChronoDuration::minutes(minutes),
            delay: None,
            trip_id: trip.into(),
        }
    }

    fn sources(ids: &[&str]) -> Vec<DepartureSource> {
        ids.iter().map(|id| DepartureSource::new(*id)).collect()
    }

    fn fetched(entries: Vec<(&str, Vec<Departure>)>) -> HashMap<SourceId, Vec<Departure>> {
        entries
            .into_iter()
            .map(|(id, deps)| (SourceId::new(id), deps))
            .collect()
    }

    #[test]
    fn test_sorted_with_tie_break() {
        let mut agg = Aggregator::new(AggregatorConfig::default(), &sources(&["A", "B"]));
        let health = HealthRegistry::new(3);

        let view = agg.aggregate(
            t0(),
            fetched(vec![
                ("B", vec![dep("B", "2", "b1", 5), dep("B", "1", "b2", 5)]),
                ("A", vec![dep("A", "9", "a1", 10), dep("A", "9", "a2", 5)]),
            ]),
            &health,
        );

        let order: Vec<_> = view.departures().iter().map(|d| d.trip_id.as_str()).collect();
        assert_eq!(order, vec!["a2", "b2", "b1", "a1"]);

        let times: Vec<_> = view.departures().iter().map(Departure::effective_time).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_dedup_keeps_later_fetched() {
        let mut agg = Aggregator::new(AggregatorConfig::default(), &sources(&["A"]));
        let health = HealthRegistry::new(3);

        let first = dep("A", "13A", "trip", 3);
        let mut second = dep("A", "13A", "trip", 3);
        second.delay = Some(ChronoDuration::minutes(2));

        let view = agg.aggregate(
            t0(),
            fetched(vec![("A", vec![first, second.clone()])]),
            &health,
        );
        assert_eq!(view.departures(), &[second]);
    }

    #[test]
    fn test_same_trip_on_different_sources_is_kept() {
        let mut agg = Aggregator::new(AggregatorConfig::default(), &sources(&["A", "B"]));
        let view = agg.aggregate(
            t0(),
            fetched(vec![
                ("A", vec![dep("A", "1", "trip", 3)]),
                ("B", vec![dep("B", "1", "trip", 3)]),
            ]),
            &HealthRegistry::new(3),
        );
        assert_eq!(view.len(), 2);
    }

    #[test]
    fn test_past_and_horizon_exclusion() {
        let config = AggregatorConfig {
            horizon: Some(ChronoDuration::minutes(30)),
            ..Default::default()
        };
        let mut agg = Aggregator::new(config, &sources(&["A"]));

        let mut late = dep("A", "1", "late", -2);
        late.delay = Some(ChronoDuration::minutes(4));

        let view = agg.aggregate(
            t0(),
            fetched(vec![(
                "A",
                vec![
                    dep("A", "1", "gone", -1),
                    dep("A", "1", "now", 0),
                    late,
                    dep("A", "1", "edge", 30),
                    dep("A", "1", "far", 31),
                ],
            )]),
            &HealthRegistry::new(3),
        );

        let trips: Vec<_> = view.departures().iter().map(|d| d.trip_id.as_str()).collect();
        assert_eq!(trips, vec!["now", "late", "edge"]);
    }

    #[test]
    fn test_no_horizon_is_unbounded() {
        let mut agg = Aggregator::new(AggregatorConfig::default(), &sources(&["A"]));
        let view = agg.aggregate(
            t0(),
            fetched(vec![("A", vec![dep("A", "1", "far", 60 * 24 * 3)])]),
            &HealthRegistry::new(3),
        );
        assert_eq!(view.len(), 1);
    }

    #[test]
    fn test_unconfigured_source_is_dropped() {
        let mut agg = Aggregator::new(AggregatorConfig::default(), &sources(&["A"]));
        let health = HealthRegistry::new(3);
        let stray = SourceId::new("X");

        let view = agg.aggregate(
            t0(),
            fetched(vec![
                ("A", vec![dep("A", "1", "a1", 5)]),
                ("X", vec![dep("X", "9", "x1", 3)]),
            ]),
            &health,
        );
        assert_eq!(view.len(), 1);
        assert_eq!(view.departures()[0].trip_id, "a1");
        assert_eq!(view.freshness(&stray), None);

        // Not remembered as a failing source in later cycles
        let view = agg.aggregate(
            t0() + ChronoDuration::minutes(1),
            fetched(vec![("A", vec![dep("A", "1", "a1", 5)])]),
            &health,
        );
        assert_eq!(view.stale_sources().count(), 0);
        assert_eq!(view.freshness(&stray), None);
    }

    #[test]
    fn test_max_departures_cap() {
        let src = vec![DepartureSource::new("A").with_max_departures(2)];
        let mut agg = Aggregator::new(AggregatorConfig::default(), &src);
        let view = agg.aggregate(
            t0(),
            fetched(vec![(
                "A",
                vec![dep("A", "1", "c", 9), dep("A", "1", "a", 1), dep("A", "1", "b", 4)],
            )]),
            &HealthRegistry::new(3),
        );
        let trips: Vec<_> = view.departures().iter().map(|d| d.trip_id.as_str()).collect();
        assert_eq!(trips, vec!["a", "b"]);
    }

    #[test]
    fn test_stale_source_retained_then_purged() {
        let config = AggregatorConfig {
            horizon: None,
            retention: ChronoDuration::minutes(10),
        };
        let mut agg = Aggregator::new(config, &sources(&["A", "B"]));
        let mut health = HealthRegistry::new(2);
        let a = SourceId::new("A");

        health.record_success(&a, t0());
        let view = agg.aggregate(
            t0(),
            fetched(vec![
                ("A", vec![dep("A", "1", "a1", 30)]),
                ("B", vec![dep("B", "2", "b1", 30)]),
            ]),
            &health,
        );
        assert!(!view.is_stale(&a));
        assert_eq!(view.len(), 2);

        let err = FetchError::Timeout(Duration::from_secs(5));
        for _ in 0..2 {
            health.record_failure(&a, &err, Duration::from_secs(1));
        }
        assert!(health.is_stale(&a));

        // Within the retention window: still shown, flagged stale
        let view = agg.aggregate(
            t0() + ChronoDuration::minutes(5),
            fetched(vec![("B", vec![dep("B", "2", "b1", 30)])]),
            &health,
        );
        assert!(view.is_stale(&a));
        assert!(!view.is_stale(&SourceId::new("B")));
        assert_eq!(view.len(), 2);
        assert_eq!(view.freshness(&a).unwrap().last_success, Some(t0()));
        assert_eq!(view.stale_sources().collect::<Vec<_>>(), vec![&a]);

        // Past the retention window: purged
        let view = agg.aggregate(
            t0() + ChronoDuration::minutes(11),
            fetched(vec![("B", vec![dep("B", "2", "b1", 30)])]),
            &health,
        );
        assert!(view.is_stale(&a));
        assert_eq!(view.len(), 1);
        assert_eq!(view.departures()[0].source.as_str(), "B");
    }

    #[test]
    fn test_present_but_failing_source_is_stale() {
        let mut agg = Aggregator::new(AggregatorConfig::default(), &sources(&["A"]));
        let mut health = HealthRegistry::new(1);
        let a = SourceId::new("A");
        health.record_failure(&a, &FetchError::DeadlineExceeded, Duration::ZERO);

        let view = agg.aggregate(t0(), fetched(vec![("A", vec![])]), &health);
        assert!(view.is_stale(&a));
    }

    #[test]
    fn test_empty_input_yields_empty_view() {
        let mut agg = Aggregator::new(AggregatorConfig::default(), &sources(&["A"]));
        let view = agg.aggregate(t0(), HashMap::new(), &HealthRegistry::new(3));
        assert!(view.is_empty());
        assert!(view.is_stale(&SourceId::new("A")));
        assert_eq!(view.generated_at(), t0());
    }
}
