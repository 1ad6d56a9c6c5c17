//! Layout of aggregated departures into fixed-size display frames.
//!
//! Each departure becomes one row of exactly `cols` characters:
//!
//! ```text
//! 13A Hauptbahnh~ 4'
//! U3 Simmering  due*
//! ```
//!
//! The line label is always kept whole, the countdown is right-aligned and
//! the destination absorbs whatever space is left, truncated with an
//! ellipsis marker when it does not fit. Rows of stale sources get a suffix
//! marker. When the line label leaves no room for the countdown, the
//! countdown is left out entirely rather than cut; the stale marker stays.

use crate::aggregate::AggregatedView;
use crate::types::Departure;
use chrono::{DateTime, Utc};
use std::fmt;

/// Character dimensions of a display surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayLimits {
    pub rows: usize,
    pub cols: usize,
}

impl DisplayLimits {
    pub const fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }
}

/// Marker strings used when formatting rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameFormat {
    pub ellipsis: String,
    pub stale_marker: String,
    pub empty_message: String,
}

impl Default for FrameFormat {
    fn default() -> Self {
        Self {
            ellipsis: "~".to_string(),
            stale_marker: "*".to_string(),
            empty_message: "no departures".to_string(),
        }
    }
}

/// One page of display rows, each padded to the display width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayFrame {
    rows: Vec<String>,
}

impl DisplayFrame {
    pub fn rows(&self) -> &[String] {
        &self.rows
    }

    /// Whether the row holds nothing but padding.
    pub fn is_blank_row(&self, row: usize) -> bool {
        self.rows.get(row).is_some_and(|r| r.trim().is_empty())
    }
}

impl fmt::Display for DisplayFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, row) in self.rows.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            f.write_str(row)?;
        }
        Ok(())
    }
}

/// Splits an [`AggregatedView`] into [`DisplayFrame`]s.
///
/// Pure: the same view, limits and format always produce the same frames.
/// Countdowns are measured from the view's generation time.
#[derive(Debug, Clone)]
pub struct Paginator {
    limits: DisplayLimits,
    format: FrameFormat,
}

impl Paginator {
    pub fn new(limits: DisplayLimits, format: FrameFormat) -> Self {
        Self {
            limits: DisplayLimits::new(limits.rows.max(1), limits.cols.max(1)),
            format,
        }
    }

    pub fn limits(&self) -> DisplayLimits {
        self.limits
    }

    /// All frames for `view`, in display order. Never empty.
    pub fn paginate(&self, view: &AggregatedView) -> Vec<DisplayFrame> {
        if view.is_empty() {
            let message = clip(&self.format.empty_message, self.limits.cols);
            return vec![self.frame(vec![message])];
        }

        view.departures()
            .chunks(self.limits.rows)
            .map(|page| {
                let rows = page
                    .iter()
                    .map(|dep| {
                        self.format_row(dep, view.generated_at(), view.is_stale(&dep.source))
                    })
                    .collect();
                self.frame(rows)
            })
            .collect()
    }

    /// Render one departure as a row of exactly `cols` characters.
    pub fn format_row(&self, departure: &Departure, now: DateTime<Utc>, stale: bool) -> String {
        let cols = self.limits.cols;
        let mut tail = countdown(departure, now);
        if stale {
            tail.push_str(&self.format.stale_marker);
        }

        let line = departure.line.as_str();
        let line_w = width(line);
        let tail_w = width(&tail);

        // No room for the countdown next to the line: drop it whole, but
        // never the stale marker
        if line_w + 1 + tail_w > cols {
            let marker = if stale {
                self.format.stale_marker.as_str()
            } else {
                ""
            };
            let line_room = cols.saturating_sub(width(marker));
            let mut row = pad(line, line_room);
            row.push_str(marker);
            return pad(&row, cols);
        }

        // Room for the destination plus one separator on each side
        let room = cols - line_w - tail_w - 1;
        let destination = self.fit_destination(&departure.destination, room.saturating_sub(1));

        let mut row = String::with_capacity(cols);
        row.push_str(line);
        row.push(' ');
        row.push_str(&destination);
        let used = line_w + 1 + width(&destination);
        row.push_str(&" ".repeat(cols - used - tail_w));
        row.push_str(&tail);
        row
    }

    fn fit_destination(&self, destination: &str, available: usize) -> String {
        let destination = destination.trim();
        if width(destination) <= available {
            return destination.to_string();
        }

        let ellipsis_w = width(&self.format.ellipsis);
        if available <= ellipsis_w {
            return String::new();
        }

        let mut fitted: String = destination.chars().take(available - ellipsis_w).collect();
        let trimmed_len = fitted.trim_end().len();
        fitted.truncate(trimmed_len);
        fitted.push_str(&self.format.ellipsis);
        fitted
    }

    /// Pad rows to the display width and fill up with blank rows.
    fn frame(&self, rows: Vec<String>) -> DisplayFrame {
        let cols = self.limits.cols;
        let mut rows: Vec<String> = rows.into_iter().map(|r| pad(&r, cols)).collect();
        rows.resize(self.limits.rows, " ".repeat(cols));
        DisplayFrame { rows }
    }
}

/// Whole minutes until departure, or `due`.
fn countdown(departure: &Departure, now: DateTime<Utc>) -> String {
    let seconds = (departure.effective_time() - now).num_seconds().max(0);
    match seconds / 60 {
        0 => "due".to_string(),
        minutes => format!("{}'", minutes),
    }
}

fn width(s: &str) -> usize {
    s.chars().count()
}

fn clip(s: &str, cols: usize) -> String {
    s.chars().take(cols).collect()
}

fn pad(s: &str, cols: usize) -> String {
    let mut out = clip(s, cols);
    let missing = cols - width(&out);
    out.push_str(&" ".repeat(missing));
    out
}
