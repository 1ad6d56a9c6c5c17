//! ÖBB station board feed.
//!
//! The live ticker endpoint answers with a JavaScript assignment,
//! `journeysObj = {...}`, wrapping a JSON object. Times come as separate
//! `dd.mm.yyyy` dates and `HH:MM` clock times in Austrian local time without
//! an offset, so they rely on the normalizer's naive offset.

use crate::client::{http_client, response_body, ClientConfig, ClientError, TransitFeed};
use crate::types::{DepartureSource, RawRecord};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;

/// Journeys requested per board; line filters are applied afterwards.
const JOURNEYS_PER_BOARD: u32 = 30;

/// Realtime status of a journey that will not run.
const CANCELLED: &str = "Ausfall";

/// Client for the ÖBB Scotty live departure board.
pub struct OebbClient {
    client: Client,
    config: ClientConfig,
}

impl OebbClient {
    pub const DEFAULT_BASE_URL: &'static str = "https://fahrplan.oebb.at/bin/stboard.exe/dn";

    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let client = http_client(&config, "application/javascript, application/json")?;
        Ok(Self { client, config })
    }

    fn request(&self, eva_id: &str) -> RequestBuilder {
        let journeys = JOURNEYS_PER_BOARD.to_string();
        self.client.get(&self.config.base_url).query(&[
            ("L", "vs_scotty.vs_liveticker"),
            ("evaId", eva_id),
            ("boardType", "dep"),
            ("productsFilter", "1111111111111111"),
            ("tickerID", "dep"),
            ("start", "yes"),
            ("eqstops", "false"),
            ("showJourneys", journeys.as_str()),
            ("additionalTime", "0"),
            ("outputMode", "tickerDataOnly"),
        ])
    }
}

impl TransitFeed for OebbClient {
    async fn fetch_departures(
        &self,
        source: &DepartureSource,
    ) -> Result<Vec<RawRecord>, ClientError> {
        tracing::debug!("Fetching station {} for {}", source.stop_id, source.id);

        let response = self.request(&source.stop_id).send().await?;
        let body = response_body(response).await?;
        parse_station_board(&body)
    }
}

#[derive(Debug, Deserialize)]
struct StationBoard {
    #[serde(default)]
    journey: Vec<Journey>,
}

#[derive(Debug, Deserialize)]
struct Journey {
    id: Option<String>,
    /// Scheduled clock time
    ti: Option<String>,
    /// Scheduled date
    da: Option<String>,
    /// Product and line, e.g. `S 7` or `REX 1`
    pr: Option<String>,
    /// Destination
    st: Option<String>,
    #[serde(default)]
    rt: Option<Realtime>,
}

/// `rt` is `false` when no realtime data exists.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Realtime {
    Info {
        status: Option<String>,
        /// Realtime clock time
        dlt: Option<String>,
        /// Realtime date
        dld: Option<String>,
    },
    Absent(bool),
}

/// Map a station board response body to raw records, in feed order.
///
/// Cancelled journeys are left out.
pub fn parse_station_board(body: &str) -> Result<Vec<RawRecord>, ClientError> {
    let board: StationBoard = serde_json::from_str(strip_assignment(body))?;

    let mut records = Vec::with_capacity(board.journey.len());
    for journey in board.journey {
        let (status, realtime) = match journey.rt {
            Some(Realtime::Info { status, dlt, dld }) => {
                let date = dld.as_deref().or(journey.da.as_deref());
                (status, date_time(date, dlt.as_deref()))
            }
            Some(Realtime::Absent(_)) | None => (None, None),
        };

        if status.as_deref() == Some(CANCELLED) {
            tracing::debug!(
                "Skipping cancelled journey {}",
                journey.id.as_deref().unwrap_or("?")
            );
            continue;
        }

        records.push(RawRecord {
            line: journey.pr.map(|pr| collapse_whitespace(&pr)),
            destination: journey.st,
            direction: None,
            scheduled: date_time(journey.da.as_deref(), journey.ti.as_deref()),
            realtime,
            delay: None,
            trip_id: journey.id,
        });
    }

    Ok(records)
}

/// Strip the `journeysObj =` prefix and trailing semicolon, if present.
fn strip_assignment(body: &str) -> &str {
    let body = body.trim();
    let body = match body.strip_prefix("journeysObj") {
        Some(rest) => rest.trim_start().trim_start_matches('=').trim_start(),
        None => body,
    };
    body.trim_end_matches(';').trim_end()
}

fn date_time(date: Option<&str>, time: Option<&str>) -> Option<String> {
    match (date, time) {
        (Some(date), Some(time)) => Some(format!("{} {}", date.trim(), time.trim())),
        _ => None,
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::Normalizer;
    use chrono::{FixedOffset, TimeZone, Utc};

    const SAMPLE: &str = r#"journeysObj = {"headTexts":["Zeit","Fahrt","Nach"],"stationName":"Wien Hbf","stationEvaId":"1290401","boardType":"dep","journey":[
        {"id":"1|17|S7","ti":"12:30","da":"01.03.2024","pr":"S  7","st":"Wolfsthal","lastStop":"Wolfsthal Bahnhof","tr":"1","rt":{"status":null,"dlm":"3","dlt":"12:33","dld":"01.03.2024"}},
        {"id":"1|18|REX1","ti":"23:58","da":"01.03.2024","pr":"REX 1","st":"Bratislava","tr":"2","rt":false},
        {"id":"1|19|S60","ti":"12:45","da":"01.03.2024","pr":"S 60","st":"Bruck/Leitha","rt":{"status":"Ausfall","dlm":null,"dlt":null,"dld":null}}
    ],"maxJ":30};"#;

    #[test]
    fn test_parse_station_board() {
        let records = parse_station_board(SAMPLE).unwrap();
        assert_eq!(records.len(), 2);

        assert_eq!(records[0].line.as_deref(), Some("S 7"));
        assert_eq!(records[0].destination.as_deref(), Some("Wolfsthal"));
        assert_eq!(records[0].scheduled.as_deref(), Some("01.03.2024 12:30"));
        assert_eq!(records[0].realtime.as_deref(), Some("01.03.2024 12:33"));
        assert_eq!(records[0].trip_id.as_deref(), Some("1|17|S7"));

        assert_eq!(records[1].line.as_deref(), Some("REX 1"));
        assert_eq!(records[1].realtime, None);
        assert_eq!(records[1].direction, None);
    }

    #[test]
    fn test_board_times_normalize_in_local_offset() {
        let records = parse_station_board(SAMPLE).unwrap();
        let normalizer = Normalizer::new(FixedOffset::east_opt(3600).unwrap());
        let source = DepartureSource::new("1290401");

        let dep = normalizer.normalize(&source, &records[0]).unwrap();
        assert_eq!(
            dep.scheduled,
            Utc.with_ymd_and_hms(2024, 3, 1, 11, 30, 0).unwrap()
        );
        assert_eq!(dep.delay, Some(chrono::Duration::minutes(3)));
    }

    #[test]
    fn test_plain_json_body() {
        let body = r#"{"journey":[{"id":"x","ti":"08:05","da":"02.03.2024","pr":"R 21","st":"Retz"}]}"#;
        let records = parse_station_board(body).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].scheduled.as_deref(), Some("02.03.2024 08:05"));
    }

    #[test]
    fn test_invalid_body() {
        assert!(matches!(
            parse_station_board("journeysObj = <html>"),
            Err(ClientError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_request_url() {
        let client = OebbClient::new(ClientConfig::new("http://localhost/stboard")).unwrap();
        let request = client.request("1290401").build().unwrap();
        let url = request.url();
        assert_eq!(url.path(), "/stboard");
        assert!(url
            .query_pairs()
            .any(|(k, v)| k == "evaId" && v == "1290401"));
        assert!(url
            .query_pairs()
            .any(|(k, v)| k == "outputMode" && v == "tickerDataOnly"));
    }
}
