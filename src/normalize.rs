//! Conversion of raw feed records into canonical departures.

use crate::types::{Departure, DepartureSource, RawRecord};
use chrono::{
    DateTime, Duration as ChronoDuration, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc,
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedRecord {
    #[error("Record has no scheduled time")]
    MissingScheduledTime,
    #[error("Unparseable timestamp: {0:?}")]
    InvalidTimestamp(String),
    #[error("Record has no line label")]
    MissingLine,
    #[error("Line {0:?} is not monitored by this source")]
    UnknownLine(String),
    #[error("Direction {0:?} is not monitored by this source")]
    DirectionMismatch(String),
}

impl MalformedRecord {
    /// Records that were well-formed but excluded by the source filters.
    pub fn is_filtered(&self) -> bool {
        matches!(self, Self::UnknownLine(_) | Self::DirectionMismatch(_))
    }
}

/// Offset-aware formats, tried after RFC 3339.
const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M:%S%z",
    "%Y-%m-%d %H:%M:%S%.f%z",
];

/// Formats without offset, interpreted in the configured naive offset.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%d.%m.%Y %H:%M:%S",
    "%d.%m.%Y %H:%M",
];

/// Delays beyond a day either way are feed garbage, not realtime data.
const MAX_DELAY_SECONDS: i64 = 24 * 60 * 60;

/// Turns [`RawRecord`]s into [`Departure`]s.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    naive_offset: FixedOffset,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self {
            naive_offset: Utc.fix(),
        }
    }
}

impl Normalizer {
    /// Create a normalizer that reads offset-less timestamps as `naive_offset`.
    pub fn new(naive_offset: FixedOffset) -> Self {
        Self { naive_offset }
    }

    pub fn naive_offset(&self) -> FixedOffset {
        self.naive_offset
    }

    /// Normalize one record fetched for `source`.
    pub fn normalize(
        &self,
        source: &DepartureSource,
        raw: &RawRecord,
    ) -> Result<Departure, MalformedRecord> {
        let scheduled_text = non_empty(raw.scheduled.as_deref())
            .ok_or(MalformedRecord::MissingScheduledTime)?;
        let scheduled = self.parse_timestamp(scheduled_text)?;

        let line = non_empty(raw.line.as_deref()).ok_or(MalformedRecord::MissingLine)?;
        if !source.accepts_line(line) {
            return Err(MalformedRecord::UnknownLine(line.to_string()));
        }

        let direction = non_empty(raw.direction.as_deref());
        if !source.accepts_direction(direction) {
            return Err(MalformedRecord::DirectionMismatch(
                direction.unwrap_or_default().to_string(),
            ));
        }

        let destination = non_empty(raw.destination.as_deref())
            .unwrap_or_default()
            .to_string();

        let delay = self.delay(raw, scheduled);

        let trip_id = match non_empty(raw.trip_id.as_deref()) {
            Some(id) => id.to_string(),
            None => format!("{}|{}|{}", line, destination, scheduled.timestamp()),
        };

        Ok(Departure {
            source: source.id.clone(),
            line: line.to_string(),
            destination,
            scheduled,
            delay,
            trip_id,
        })
    }

    /// Parse a feed timestamp into UTC.
    pub fn parse_timestamp(&self, text: &str) -> Result<DateTime<Utc>, MalformedRecord> {
        let text = text.trim();

        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Ok(dt.with_timezone(&Utc));
        }

        for format in OFFSET_FORMATS {
            if let Ok(dt) = DateTime::parse_from_str(text, format) {
                return Ok(dt.with_timezone(&Utc));
            }
        }

        for format in NAIVE_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
                if let Some(dt) = self.naive_offset.from_local_datetime(&naive).single() {
                    return Ok(dt.with_timezone(&Utc));
                }
            }
        }

        Err(MalformedRecord::InvalidTimestamp(text.to_string()))
    }

    /// Realtime delay: the explicit delay field wins, else realtime minus scheduled.
    /// Anything unparseable or beyond a day either way means "no realtime data".
    fn delay(&self, raw: &RawRecord, scheduled: DateTime<Utc>) -> Option<ChronoDuration> {
        let delay = match non_empty(raw.delay.as_deref()) {
            Some(text) => text
                .parse::<i64>()
                .ok()
                .and_then(ChronoDuration::try_seconds)?,
            None => {
                let realtime = non_empty(raw.realtime.as_deref())?;
                self.parse_timestamp(realtime).ok()? - scheduled
            }
        };
        (delay.num_seconds().abs() <= MAX_DELAY_SECONDS).then_some(delay)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> DepartureSource {
        DepartureSource::new("4111").with_id("stop").with_lines(["13A"])
    }

    fn raw(scheduled: &str) -> RawRecord {
        RawRecord {
            line: Some("13A".into()),
            destination: Some("Hauptbahnhof".into()),
            scheduled: Some(scheduled.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_mixed_timezones_normalize_to_same_instant() {
        let n = Normalizer::new(FixedOffset::east_opt(3600).unwrap());

        let a = n.parse_timestamp("2024-03-01T12:30:00.000+0100").unwrap();
        let b = n.parse_timestamp("2024-03-01T11:30:00Z").unwrap();
        let c = n.parse_timestamp("2024-03-01 12:30:00").unwrap();
        let d = n.parse_timestamp("2024-03-01T12:30:00+01:00").unwrap();
        let e = n.parse_timestamp("01.03.2024 12:30").unwrap();

        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a, d);
        assert_eq!(a, e);
    }

    #[test]
    fn test_missing_scheduled_time() {
        let mut record = raw("");
        assert_eq!(
            Normalizer::default().normalize(&source(), &record),
            Err(MalformedRecord::MissingScheduledTime)
        );
        record.scheduled = None;
        assert_eq!(
            Normalizer::default().normalize(&source(), &record),
            Err(MalformedRecord::MissingScheduledTime)
        );
    }

    #[test]
    fn test_invalid_timestamp() {
        let err = Normalizer::default()
            .normalize(&source(), &raw("half past twelve"))
            .unwrap_err();
        assert!(matches!(err, MalformedRecord::InvalidTimestamp(_)));
        assert!(!err.is_filtered());
    }

    #[test]
    fn test_unknown_line_is_rejected() {
        let mut record = raw("2024-03-01T12:30:00Z");
        record.line = Some("U3".into());
        let err = Normalizer::default().normalize(&source(), &record).unwrap_err();
        assert_eq!(err, MalformedRecord::UnknownLine("U3".into()));
        assert!(err.is_filtered());
    }

    #[test]
    fn test_direction_filter() {
        let source = source().with_direction("H");
        let mut record = raw("2024-03-01T12:30:00Z");
        record.direction = Some("R".into());
        assert_eq!(
            Normalizer::default().normalize(&source, &record),
            Err(MalformedRecord::DirectionMismatch("R".into()))
        );
        record.direction = Some("H".into());
        assert!(Normalizer::default().normalize(&source, &record).is_ok());
    }

    #[test]
    fn test_non_numeric_delay_means_no_realtime() {
        let mut record = raw("2024-03-01T12:30:00Z");
        record.delay = Some("n/a".into());
        // Realtime is ignored when an explicit delay field is present
        record.realtime = Some("2024-03-01T12:35:00Z".into());

        let dep = Normalizer::default().normalize(&source(), &record).unwrap();
        assert_eq!(dep.delay, None);
        assert_eq!(dep.effective_time(), dep.scheduled);
    }

    #[test]
    fn test_delay_sources() {
        let mut record = raw("2024-03-01T12:30:00Z");
        record.delay = Some("120".into());
        let dep = Normalizer::default().normalize(&source(), &record).unwrap();
        assert_eq!(dep.delay, Some(ChronoDuration::seconds(120)));

        record.delay = None;
        record.realtime = Some("2024-03-01T12:29:00Z".into());
        let dep = Normalizer::default().normalize(&source(), &record).unwrap();
        assert_eq!(dep.delay, Some(ChronoDuration::seconds(-60)));

        record.realtime = Some("garbage".into());
        let dep = Normalizer::default().normalize(&source(), &record).unwrap();
        assert_eq!(dep.delay, None);
    }

    #[test]
    fn test_out_of_range_delay_means_no_realtime() {
        let mut record = raw("2024-03-01T12:30:00Z");

        // Beyond what a duration can hold
        record.delay = Some("9999999999999999".into());
        let dep = Normalizer::default().normalize(&source(), &record).unwrap();
        assert_eq!(dep.delay, None);

        // Representable, but would push the instant past the calendar
        record.delay = Some("9000000000000000".into());
        let dep = Normalizer::default().normalize(&source(), &record).unwrap();
        assert_eq!(dep.delay, None);
        assert_eq!(dep.effective_time(), dep.scheduled);

        record.delay = Some("-86401".into());
        let dep = Normalizer::default().normalize(&source(), &record).unwrap();
        assert_eq!(dep.delay, None);

        record.delay = Some("86400".into());
        let dep = Normalizer::default().normalize(&source(), &record).unwrap();
        assert_eq!(dep.delay, Some(ChronoDuration::days(1)));

        record.delay = None;
        record.realtime = Some("2024-03-03T12:30:00Z".into());
        let dep = Normalizer::default().normalize(&source(), &record).unwrap();
        assert_eq!(dep.delay, None);
    }

    #[test]
    fn test_trip_id_synthesized_when_missing() {
        let record = raw("2024-03-01T12:30:00Z");
        let a = Normalizer::default().normalize(&source(), &record).unwrap();
        let b = Normalizer::default().normalize(&source(), &record).unwrap();
        assert_eq!(a.trip_id, b.trip_id);
        assert!(a.trip_id.starts_with("13A|Hauptbahnhof|"));

        let mut record = record;
        record.trip_id = Some("trip-7".into());
        let c = Normalizer::default().normalize(&source(), &record).unwrap();
        assert_eq!(c.trip_id, "trip-7");
        assert_eq!(c.source.as_str(), "stop");
    }
}
