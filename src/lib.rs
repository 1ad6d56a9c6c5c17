//! Realtime public transport departure monitor for small character displays.
//!
//! This library provides functionality to:
//! - Fetch realtime departures for configured stops from Wiener Linien and ÖBB
//! - Normalize and merge them into one deduplicated, time-ordered view
//! - Track per-source health with timeouts, retries and staleness
//! - Lay the view out into fixed-size pages and rotate them on a display
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐    ┌─────────────┐    ┌─────────────┐    ┌─────────────┐
//! │   Client    │───▶│ Normalizer  │───▶│ Aggregator  │───▶│  Paginator  │
//! │ (+ retries) │    │             │    │  (+ health) │    │             │
//! └─────────────┘    └─────────────┘    └─────────────┘    └─────────────┘
//!        ▲                                     │                  │
//!        │              ┌─────────────┐        │                  ▼
//!        └──────────────│   Monitor   │◀───────┘           ┌─────────────┐
//!                       │ (refresh +  │───────────────────▶│   Display   │
//!                       │  rotation)  │                    └─────────────┘
//!                       └─────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use omegalines::{
//!     client::{ClientConfig, WienerLinienClient},
//!     display::TerminalDisplay,
//!     monitor::{Monitor, MonitorConfig},
//!     paginate::{DisplayLimits, FrameFormat, Paginator},
//!     types::DepartureSource,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = WienerLinienClient::new(ClientConfig::default())?;
//!     let sources = vec![DepartureSource::new("4111").with_lines(["13A"])];
//!     let monitor = Monitor::new(client, sources, MonitorConfig::default());
//!
//!     let limits = DisplayLimits::new(4, 20);
//!     let paginator = Paginator::new(limits, FrameFormat::default());
//!     let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);
//!
//!     monitor.run(TerminalDisplay::new(limits), paginator, stop_rx).await?;
//!     Ok(())
//! }
//! ```

pub mod aggregate;
pub mod client;
pub mod config;
pub mod display;
pub mod health;
pub mod monitor;
pub mod normalize;
pub mod oebb;
pub mod paginate;
pub mod types;

pub use aggregate::{AggregatedView, Aggregator, AggregatorConfig};
pub use client::{ClientConfig, FeedClient, TransitFeed, WienerLinienClient};
pub use config::{Config, ConfigError};
pub use display::{DisplaySurface, FileDisplay, MemoryDisplay, TerminalDisplay};
pub use health::{HealthRegistry, HealthState, RetryPolicy, SourceHealth};
pub use monitor::{Monitor, MonitorConfig};
pub use normalize::{MalformedRecord, Normalizer};
pub use oebb::OebbClient;
pub use paginate::{DisplayFrame, DisplayLimits, FrameFormat, Paginator};
pub use types::{Departure, DepartureSource, FeedKind, RawRecord, SourceId};
