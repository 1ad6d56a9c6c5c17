//! Core data types for departure monitoring.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::fmt;

/// Identifier of one configured stop/line subscription.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Transit network a source is fetched from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FeedKind {
    /// Wiener Linien realtime monitor, stops addressed by RBL number
    #[default]
    WienerLinien,
    /// ÖBB station board, stops addressed by EVA number
    Oebb,
}

impl FeedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WienerLinien => "wienerLinien",
            Self::Oebb => "oebb",
        }
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One monitored stop with optional line and direction filters.
///
/// Built once from configuration and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepartureSource {
    pub id: SourceId,
    pub feed: FeedKind,
    /// Stop identifier understood by the feed (RBL or EVA number).
    pub stop_id: String,
    /// Accepted line labels. Empty means every line at the stop.
    pub lines: Vec<String>,
    /// Accepted direction code, e.g. `H` or `R`.
    pub direction: Option<String>,
    /// Keep at most this many departures per cycle.
    pub max_departures: Option<usize>,
}

impl DepartureSource {
    pub fn new(stop_id: impl Into<String>) -> Self {
        let stop_id = stop_id.into();
        Self {
            id: SourceId::new(stop_id.clone()),
            feed: FeedKind::default(),
            stop_id,
            lines: Vec::new(),
            direction: None,
            max_departures: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = SourceId::new(id);
        self
    }

    pub fn with_feed(mut self, feed: FeedKind) -> Self {
        self.feed = feed;
        self
    }

    pub fn with_lines<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lines = lines.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_direction(mut self, direction: impl Into<String>) -> Self {
        self.direction = Some(direction.into());
        self
    }

    pub fn with_max_departures(mut self, max: usize) -> Self {
        self.max_departures = Some(max);
        self
    }

    /// Derive the default id: `stop[:line,line][:direction]`.
    pub fn derived_id(stop_id: &str, lines: &[String], direction: Option<&str>) -> SourceId {
        let mut id = stop_id.to_string();
        if !lines.is_empty() {
            id.push(':');
            id.push_str(&lines.join(","));
        }
        if let Some(dir) = direction {
            id.push(':');
            id.push_str(dir);
        }
        SourceId::new(id)
    }

    /// Whether `line` passes the line filter.
    pub fn accepts_line(&self, line: &str) -> bool {
        self.lines.is_empty() || self.lines.iter().any(|l| l.eq_ignore_ascii_case(line))
    }

    /// Whether `direction` passes the direction filter.
    pub fn accepts_direction(&self, direction: Option<&str>) -> bool {
        match (&self.direction, direction) {
            (None, _) => true,
            // Feeds that omit the direction can't be filtered on it
            (Some(_), None) => true,
            (Some(want), Some(got)) => want.eq_ignore_ascii_case(got),
        }
    }
}

/// A raw departure record as delivered by a transit feed.
///
/// All fields are optional text; validation happens in the normalizer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRecord {
    pub line: Option<String>,
    pub destination: Option<String>,
    pub direction: Option<String>,
    pub scheduled: Option<String>,
    pub realtime: Option<String>,
    /// Delay in seconds, as sent by the feed.
    pub delay: Option<String>,
    pub trip_id: Option<String>,
}

/// A single upcoming departure at a monitored stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub source: SourceId,
    pub line: String,
    pub destination: String,
    pub scheduled: DateTime<Utc>,
    /// Realtime deviation from the schedule; negative when early.
    pub delay: Option<ChronoDuration>,
    pub trip_id: String,
}

impl Departure {
    /// Scheduled time corrected by the realtime delay, if known.
    ///
    /// A delay that would leave the representable range is ignored.
    pub fn effective_time(&self) -> DateTime<Utc> {
        self.delay
            .and_then(|delay| self.scheduled.checked_add_signed(delay))
            .unwrap_or(self.scheduled)
    }

    pub fn has_realtime(&self) -> bool {
        self.delay.is_some()
    }
}
