//! Departure monitor CLI
//!
//! Periodically fetches realtime departures and shows them on a small display.

use clap::{Parser, Subcommand};
use omegalines::{
    client::FeedClient,
    config::{Config, DisplayOutput},
    display::{DisplaySurface, FileDisplay, TerminalDisplay},
    monitor::Monitor,
    paginate::Paginator,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "omegalines")]
#[command(about = "Realtime public transport departure monitor", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the YAML configuration
    #[arg(short, long, env = "OMEGALINES_CONFIG", default_value = "omegalines.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the monitor until interrupted
    Run {
        /// Interval for logging statistics, in seconds
        #[arg(long, default_value = "300")]
        stats_interval: u64,
    },

    /// Validate the configuration and list the monitored sources
    Check,

    /// Fetch once and print every page to stdout
    Once,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::load(&cli.config)?;

    match cli.command {
        Commands::Run { stats_interval } => {
            run_monitor(&cli.config, config, stats_interval).await?;
        }
        Commands::Check => {
            check_config(&cli.config, &config);
        }
        Commands::Once => {
            fetch_once(config).await?;
        }
    }

    Ok(())
}

async fn run_monitor(
    config_path: &Path,
    config: Config,
    stats_interval: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!("Starting departure monitor");
    tracing::info!("Config: {}", config_path.display());
    tracing::info!("Feeds: {}, {}", config.feed.base_url, config.feed.oebb_base_url);
    tracing::info!(
        "Display: {}x{} ({:?})",
        config.display.rows,
        config.display.cols,
        config.display.output
    );

    let limits = config.display_limits();
    match (config.display.output, config.display.path.clone()) {
        (DisplayOutput::File, Some(path)) => {
            tracing::info!("Writing frames to {}", path.display());
            drive(config, FileDisplay::new(limits, path), stats_interval).await
        }
        _ => drive(config, TerminalDisplay::new(limits), stats_interval).await,
    }
}

async fn drive<D: DisplaySurface + 'static>(
    config: Config,
    display: D,
    stats_interval: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = FeedClient::new(config.client_config(), config.oebb_client_config())?;
    let paginator = Paginator::new(display.limits(), config.frame_format());
    let monitor = Monitor::new(client, config.departure_sources(), config.monitor_config());

    let stats = monitor.stats();
    let health = monitor.health();

    // Spawn stats reporting task
    let stats_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(stats_interval.max(1)));
        interval.tick().await;
        loop {
            interval.tick().await;
            let s = stats.snapshot();
            let stale = health.read().stale_sources();
            tracing::info!(
                "Stats: cycles={}, fetched={}, failed={}, records={}, malformed={}, shown={}, frames={}, last_cycle={}ms",
                s.cycles,
                s.fetch_successes,
                s.fetch_failures,
                s.records_received,
                s.malformed_records,
                s.departures_shown,
                s.frames_rendered,
                s.last_cycle_ms
            );
            if !stale.is_empty() {
                let names: Vec<_> = stale.iter().map(|id| id.as_str()).collect();
                tracing::warn!("Stale sources: {}", names.join(", "));
            }
        }
    });

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut monitor_handle = tokio::spawn(monitor.run(display, paginator, stop_rx));

    // Handle Ctrl+C
    let interrupted = tokio::select! {
        _ = tokio::signal::ctrl_c() => true,
        result = &mut monitor_handle => {
            report_exit(result);
            false
        }
    };

    if interrupted {
        tracing::info!("Received Ctrl+C, shutting down...");
        stop_tx.send_replace(true);
        report_exit(monitor_handle.await);
    }

    stats_handle.abort();
    Ok(())
}

fn report_exit(
    result: Result<Result<(), omegalines::monitor::MonitorError>, tokio::task::JoinError>,
) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("Monitor error: {}", e),
        Err(e) => tracing::error!("Monitor task failed: {}", e),
    }
}

fn check_config(config_path: &Path, config: &Config) {
    println!("Configuration {} is valid", config_path.display());
    println!();
    println!("Sources:");
    for source in config.departure_sources() {
        let lines = if source.lines.is_empty() {
            "all".to_string()
        } else {
            source.lines.join(", ")
        };
        println!(
            "  {}: {} stop {}, lines {}, direction {}",
            source.id,
            source.feed,
            source.stop_id,
            lines,
            source.direction.as_deref().unwrap_or("any")
        );
    }
    println!();
    println!("Refresh interval: {}s", config.refresh_interval_seconds);
    println!("Page rotation: {}s", config.page_rotation_seconds);
    println!(
        "Fetch: timeout {}s, {} attempts, stale after {} failures",
        config.fetch_timeout_seconds, config.max_retries, config.stale_threshold_failures
    );
    match config.future_horizon_minutes {
        Some(m) => println!("Horizon: {} min", m),
        None => println!("Horizon: unbounded"),
    }
    println!("Display: {}x{}", config.display.rows, config.display.cols);
}

async fn fetch_once(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let client = FeedClient::new(config.client_config(), config.oebb_client_config())?;
    let paginator = Paginator::new(config.display_limits(), config.frame_format());
    let mut monitor = Monitor::new(client, config.departure_sources(), config.monitor_config());

    let view = monitor.refresh().await;
    let frames = paginator.paginate(&view);

    for (i, frame) in frames.iter().enumerate() {
        println!("Page {}/{}", i + 1, frames.len());
        println!("{}", frame);
        println!();
    }

    let stale: Vec<_> = view.stale_sources().map(|id| id.as_str()).collect();
    if !stale.is_empty() {
        println!("Stale sources: {}", stale.join(", "));
    }

    Ok(())
}
