//! HTTP clients for fetching realtime departures from the transit feeds.

use crate::oebb::OebbClient;
use crate::types::{DepartureSource, FeedKind, RawRecord};
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, CACHE_CONTROL},
    Client, RequestBuilder, Response, StatusCode,
};
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Server returned error status: {status}")]
    ServerError { status: StatusCode },
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },
    #[error("Invalid response: {0}")]
    InvalidResponse(#[from] serde_json::Error),
    #[error("Feed reported error: {0}")]
    Feed(String),
}

/// A source of raw departure records.
///
/// Implementations must be cheap to share between tasks; the monitor holds
/// one behind an `Arc` and calls it concurrently for every source.
pub trait TransitFeed: Send + Sync {
    /// Fetch the raw departures currently announced for `source`'s stop.
    fn fetch_departures(
        &self,
        source: &DepartureSource,
    ) -> impl Future<Output = Result<Vec<RawRecord>, ClientError>> + Send;
}

/// Configuration for one feed client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Monitor or station board endpoint
    pub base_url: String,
    /// Optional `sender` key, required by the legacy Wiener Linien endpoint
    pub api_key: Option<String>,
    /// Transport-level timeout, on top of the per-attempt timeout
    pub timeout: Duration,
}

impl ClientConfig {
    pub const DEFAULT_BASE_URL: &'static str =
        "https://www.wienerlinien.at/ogd_realtime/monitor";

    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_api_key(mut self, key: String) -> Self {
        self.api_key = Some(key);
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BASE_URL)
    }
}

/// Client for the Wiener Linien OGD realtime monitor API.
pub struct WienerLinienClient {
    client: Client,
    config: ClientConfig,
}

impl WienerLinienClient {
    /// Create a new client.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let client = http_client(&config, "application/json")?;
        Ok(Self { client, config })
    }

    fn request(&self, stop_id: &str) -> RequestBuilder {
        let mut request = self
            .client
            .get(&self.config.base_url)
            .query(&[("rbl", stop_id)]);
        if let Some(ref key) = self.config.api_key {
            request = request.query(&[("sender", key)]);
        }
        request
    }
}

impl TransitFeed for WienerLinienClient {
    async fn fetch_departures(
        &self,
        source: &DepartureSource,
    ) -> Result<Vec<RawRecord>, ClientError> {
        tracing::debug!("Fetching stop {} for {}", source.stop_id, source.id);

        let response = self.request(&source.stop_id).send().await?;
        let body = response_body(response).await?;
        parse_monitor_response(&body)
    }
}

/// Build the shared reqwest client setup used by every feed.
pub(crate) fn http_client(
    config: &ClientConfig,
    accept: &'static str,
) -> Result<Client, ClientError> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(accept));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));

    let client = Client::builder()
        .default_headers(headers)
        .user_agent(concat!("omegalines/", env!("CARGO_PKG_VERSION")))
        .timeout(config.timeout)
        .gzip(true)
        .build()?;

    Ok(client)
}

/// Body of a successful response, or the error its status maps to.
pub(crate) async fn response_body(response: Response) -> Result<String, ClientError> {
    match response.status() {
        StatusCode::OK => Ok(response.text().await?),
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);

            Err(ClientError::RateLimited { retry_after })
        }
        status => Err(ClientError::ServerError { status }),
    }
}

/// Routes every source to the client of its network.
pub struct FeedClient {
    wiener_linien: WienerLinienClient,
    oebb: OebbClient,
}

impl FeedClient {
    pub fn new(wiener_linien: ClientConfig, oebb: ClientConfig) -> Result<Self, ClientError> {
        Ok(Self {
            wiener_linien: WienerLinienClient::new(wiener_linien)?,
            oebb: OebbClient::new(oebb)?,
        })
    }
}

impl TransitFeed for FeedClient {
    async fn fetch_departures(
        &self,
        source: &DepartureSource,
    ) -> Result<Vec<RawRecord>, ClientError> {
        match source.feed {
            FeedKind::WienerLinien => self.wiener_linien.fetch_departures(source).await,
            FeedKind::Oebb => self.oebb.fetch_departures(source).await,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MonitorResponse {
    #[serde(default)]
    data: Option<MonitorData>,
    #[serde(default)]
    message: Option<FeedMessage>,
}

#[derive(Debug, Deserialize)]
struct FeedMessage {
    #[serde(default)]
    value: Option<String>,
    #[serde(rename = "messageCode", default)]
    message_code: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct MonitorData {
    #[serde(default)]
    monitors: Vec<Monitor>,
}

#[derive(Debug, Deserialize)]
struct Monitor {
    #[serde(default)]
    lines: Vec<Line>,
}

#[derive(Debug, Deserialize)]
struct Line {
    name: Option<String>,
    towards: Option<String>,
    direction: Option<String>,
    #[serde(default)]
    departures: Departures,
}

#[derive(Debug, Default, Deserialize)]
struct Departures {
    #[serde(default)]
    departure: Vec<LineDeparture>,
}

#[derive(Debug, Deserialize)]
struct LineDeparture {
    #[serde(rename = "departureTime", default)]
    departure_time: DepartureTime,
    #[serde(default)]
    vehicle: Option<Vehicle>,
}

#[derive(Debug, Default, Deserialize)]
struct DepartureTime {
    #[serde(rename = "timePlanned")]
    time_planned: Option<String>,
    #[serde(rename = "timeReal")]
    time_real: Option<String>,
}

/// Per-departure overrides; set when a run deviates from the line's defaults.
#[derive(Debug, Deserialize)]
struct Vehicle {
    name: Option<String>,
    towards: Option<String>,
    direction: Option<String>,
    #[serde(rename = "trainId", alias = "linienId", default)]
    trip_id: Option<serde_json::Value>,
}

/// Map a monitor response body to raw records, in feed order.
pub fn parse_monitor_response(body: &str) -> Result<Vec<RawRecord>, ClientError> {
    let response: MonitorResponse = serde_json::from_str(body)?;

    if let Some(message) = &response.message {
        // 1 = OK, everything else is an API level error
        if let Some(code) = message.message_code {
            if code != 1 {
                return Err(ClientError::Feed(
                    message.value.clone().unwrap_or_else(|| format!("code {}", code)),
                ));
            }
        }
    }

    let mut records = Vec::new();

    for monitor in response.data.unwrap_or_default().monitors {
        for line in monitor.lines {
            for dep in line.departures.departure {
                let vehicle = dep.vehicle.as_ref();
                records.push(RawRecord {
                    line: vehicle
                        .and_then(|v| v.name.clone())
                        .or_else(|| line.name.clone()),
                    destination: vehicle
                        .and_then(|v| v.towards.clone())
                        .or_else(|| line.towards.clone()),
                    direction: vehicle
                        .and_then(|v| v.direction.clone())
                        .or_else(|| line.direction.clone()),
                    scheduled: dep.departure_time.time_planned,
                    realtime: dep.departure_time.time_real,
                    delay: None,
                    trip_id: vehicle.and_then(|v| v.trip_id.as_ref()).map(json_to_text),
                });
            }
        }
    }

    Ok(records)
}

fn json_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
