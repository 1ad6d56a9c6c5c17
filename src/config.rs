//! YAML configuration, loaded and validated once at startup.

use crate::aggregate::AggregatorConfig;
use crate::client::ClientConfig;
use crate::health::RetryPolicy;
use crate::monitor::MonitorConfig;
use crate::normalize::Normalizer;
use crate::paginate::{DisplayLimits, FrameFormat};
use crate::types::{DepartureSource, FeedKind, SourceId};
use chrono::{Duration as ChronoDuration, FixedOffset};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid configuration file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("No sources configured")]
    NoSources,
    #[error("Invalid display dimensions {rows}x{cols}")]
    InvalidDisplay { rows: usize, cols: usize },
    #[error("Duplicate source id {0}")]
    DuplicateSource(SourceId),
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub feed: FeedConfig,
    pub sources: Vec<SourceConfig>,
    #[serde(default = "defaults::refresh_interval")]
    pub refresh_interval_seconds: u64,
    #[serde(default = "defaults::page_rotation")]
    pub page_rotation_seconds: u64,
    #[serde(default = "defaults::fetch_timeout")]
    pub fetch_timeout_seconds: u64,
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,
    #[serde(default = "defaults::stale_threshold")]
    pub stale_threshold_failures: u32,
    #[serde(default)]
    pub future_horizon_minutes: Option<u32>,
    #[serde(default = "defaults::retention")]
    pub retention_minutes: u32,
    #[serde(default = "defaults::cycle_deadline")]
    pub cycle_deadline_seconds: u64,
    #[serde(default = "defaults::max_concurrent")]
    pub max_concurrent_fetches: usize,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub display: DisplayConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FeedConfig {
    /// Wiener Linien monitor endpoint
    #[serde(default = "defaults::base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// ÖBB station board endpoint
    #[serde(default = "defaults::oebb_base_url")]
    pub oebb_base_url: String,
    /// Offset applied to timestamps that carry none
    #[serde(default)]
    pub naive_utc_offset_minutes: i32,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::base_url(),
            api_key: None,
            oebb_base_url: defaults::oebb_base_url(),
            naive_utc_offset_minutes: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SourceConfig {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub kind: FeedKind,
    pub stop_id: String,
    #[serde(default, alias = "lineFilter")]
    pub lines: Vec<String>,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub max_departures: Option<usize>,
}

impl SourceConfig {
    pub fn to_source(&self) -> DepartureSource {
        let id = match &self.id {
            Some(id) => SourceId::new(id.clone()),
            None => DepartureSource::derived_id(
                &self.stop_id,
                &self.lines,
                self.direction.as_deref(),
            ),
        };
        DepartureSource {
            id,
            feed: self.kind,
            stop_id: self.stop_id.clone(),
            lines: self.lines.clone(),
            direction: self.direction.clone(),
            max_departures: self.max_departures,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BackoffConfig {
    #[serde(default = "defaults::backoff_base")]
    pub base_millis: u64,
    #[serde(default = "defaults::backoff_max")]
    pub max_millis: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_millis: defaults::backoff_base(),
            max_millis: defaults::backoff_max(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayOutput {
    Terminal,
    File,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DisplayConfig {
    #[serde(default = "defaults::rows")]
    pub rows: usize,
    #[serde(default = "defaults::cols")]
    pub cols: usize,
    #[serde(default = "defaults::output")]
    pub output: DisplayOutput,
    /// Target file for `output: file`
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "defaults::ellipsis")]
    pub ellipsis: String,
    #[serde(default = "defaults::stale_marker")]
    pub stale_marker: String,
    #[serde(default = "defaults::empty_message")]
    pub empty_message: String,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            rows: defaults::rows(),
            cols: defaults::cols(),
            output: defaults::output(),
            path: None,
            ellipsis: defaults::ellipsis(),
            stale_marker: defaults::stale_marker(),
            empty_message: defaults::empty_message(),
        }
    }
}

mod defaults {
    use super::DisplayOutput;
    use crate::client::ClientConfig;
    use crate::oebb::OebbClient;

    pub fn refresh_interval() -> u64 {
        30
    }
    pub fn page_rotation() -> u64 {
        5
    }
    pub fn fetch_timeout() -> u64 {
        5
    }
    pub fn max_retries() -> u32 {
        3
    }
    pub fn stale_threshold() -> u32 {
        3
    }
    pub fn retention() -> u32 {
        15
    }
    pub fn cycle_deadline() -> u64 {
        20
    }
    pub fn max_concurrent() -> usize {
        4
    }
    pub fn backoff_base() -> u64 {
        500
    }
    pub fn backoff_max() -> u64 {
        8_000
    }
    pub fn base_url() -> String {
        ClientConfig::DEFAULT_BASE_URL.to_string()
    }
    pub fn oebb_base_url() -> String {
        OebbClient::DEFAULT_BASE_URL.to_string()
    }
    pub fn rows() -> usize {
        4
    }
    pub fn cols() -> usize {
        20
    }
    pub fn output() -> DisplayOutput {
        DisplayOutput::Terminal
    }
    pub fn ellipsis() -> String {
        "~".to_string()
    }
    pub fn stale_marker() -> String {
        "*".to_string()
    }
    pub fn empty_message() -> String {
        "no departures".to_string()
    }
}

impl Config {
    /// Read, parse and validate a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Parse and validate configuration text.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::NoSources);
        }

        let mut ids = HashSet::new();
        for source in &self.sources {
            if source.stop_id.trim().is_empty() {
                return Err(invalid("stopId", "must not be empty"));
            }
            if source.max_departures == Some(0) {
                return Err(invalid("maxDepartures", "must be at least 1"));
            }
            let id = source.to_source().id;
            if !ids.insert(id.clone()) {
                return Err(ConfigError::DuplicateSource(id));
            }
        }

        let display = &self.display;
        if display.rows == 0 || display.cols == 0 {
            return Err(ConfigError::InvalidDisplay {
                rows: display.rows,
                cols: display.cols,
            });
        }
        if display.output == DisplayOutput::File && display.path.is_none() {
            return Err(invalid("display.path", "required for file output"));
        }

        if self.refresh_interval_seconds == 0 {
            return Err(invalid("refreshIntervalSeconds", "must be positive"));
        }
        if self.page_rotation_seconds == 0 {
            return Err(invalid("pageRotationSeconds", "must be positive"));
        }
        if self.fetch_timeout_seconds == 0 {
            return Err(invalid("fetchTimeoutSeconds", "must be positive"));
        }
        if self.max_retries == 0 {
            return Err(invalid("maxRetries", "must be at least 1"));
        }
        if self.stale_threshold_failures == 0 {
            return Err(invalid("staleThresholdFailures", "must be at least 1"));
        }
        if self.max_concurrent_fetches == 0 {
            return Err(invalid("maxConcurrentFetches", "must be at least 1"));
        }
        if self.cycle_deadline_seconds == 0
            || self.cycle_deadline_seconds > self.refresh_interval_seconds
        {
            return Err(invalid(
                "cycleDeadlineSeconds",
                "must be positive and not exceed refreshIntervalSeconds",
            ));
        }
        if self.backoff.base_millis == 0 || self.backoff.base_millis > self.backoff.max_millis {
            return Err(invalid(
                "backoff",
                "baseMillis must be positive and not exceed maxMillis",
            ));
        }
        if self.naive_offset().is_none() {
            return Err(invalid(
                "feed.naiveUtcOffsetMinutes",
                "must be within one day",
            ));
        }

        Ok(())
    }

    pub fn departure_sources(&self) -> Vec<DepartureSource> {
        self.sources.iter().map(SourceConfig::to_source).collect()
    }

    fn naive_offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.feed.naive_utc_offset_minutes.checked_mul(60)?)
    }

    pub fn normalizer(&self) -> Normalizer {
        self.naive_offset()
            .map(Normalizer::new)
            .unwrap_or_default()
    }

    /// Wiener Linien client settings.
    pub fn client_config(&self) -> ClientConfig {
        let mut config =
            ClientConfig::new(self.feed.base_url.clone()).with_timeout(self.transport_timeout());
        if let Some(key) = &self.feed.api_key {
            config = config.with_api_key(key.clone());
        }
        config
    }

    /// ÖBB client settings.
    pub fn oebb_client_config(&self) -> ClientConfig {
        ClientConfig::new(self.feed.oebb_base_url.clone()).with_timeout(self.transport_timeout())
    }

    fn transport_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds.saturating_mul(2))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempt_timeout: Duration::from_secs(self.fetch_timeout_seconds),
            max_attempts: self.max_retries,
            base_delay: Duration::from_millis(self.backoff.base_millis),
            max_delay: Duration::from_millis(self.backoff.max_millis),
        }
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            horizon: self
                .future_horizon_minutes
                .map(|m| ChronoDuration::minutes(i64::from(m))),
            retention: ChronoDuration::minutes(i64::from(self.retention_minutes)),
        }
    }

    pub fn display_limits(&self) -> DisplayLimits {
        DisplayLimits::new(self.display.rows, self.display.cols)
    }

    pub fn frame_format(&self) -> FrameFormat {
        FrameFormat {
            ellipsis: self.display.ellipsis.clone(),
            stale_marker: self.display.stale_marker.clone(),
            empty_message: self.display.empty_message.clone(),
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            refresh_interval: Duration::from_secs(self.refresh_interval_seconds),
            page_rotation: Duration::from_secs(self.page_rotation_seconds),
            cycle_deadline: Duration::from_secs(self.cycle_deadline_seconds),
            max_concurrent_fetches: self.max_concurrent_fetches,
            stale_threshold: self.stale_threshold_failures,
            retry: self.retry_policy(),
            aggregator: self.aggregator_config(),
            normalizer: self.normalizer(),
        }
    }
}
