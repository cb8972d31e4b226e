//! Hourly weather from the Open-Meteo historical archive.
//!
//! The archive is queried for the partition's first through last day at a
//! fixed point, in local time. It lags real time by a few days, so a month
//! counts as published once its last day plus the publication lag is past.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, NaiveDateTime, Utc};
use futures::stream;
use serde::Deserialize;
use velo_core::PartitionKey;

use super::{Availability, RecordSource, RecordStream};
use crate::error::{Error, Result};
use crate::record::WeatherObservation;

/// Default archive endpoint.
pub const DEFAULT_WEATHER_API_URL: &str = "https://archive-api.open-meteo.com/v1/archive";

/// Default days between a month's end and its appearance in the archive.
pub const DEFAULT_PUBLICATION_LAG_DAYS: u32 = 5;

const SOURCE_NAME: &str = "open-meteo";
const HOURLY_VARIABLES: &str = "temperature_2m,precipitation,cloudcover";

/// Query parameters for the weather archive.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenMeteoConfig {
    /// Archive endpoint.
    pub api_url: String,
    /// Latitude of the observation point.
    pub latitude: f64,
    /// Longitude of the observation point.
    pub longitude: f64,
    /// IANA timezone the hourly series is expressed in.
    pub timezone: String,
    /// Days after month end before the month is considered published.
    pub publication_lag_days: u32,
}

impl Default for OpenMeteoConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_WEATHER_API_URL.to_string(),
            latitude: 40.7128,
            longitude: -74.0060,
            timezone: "America/New_York".to_string(),
            publication_lag_days: DEFAULT_PUBLICATION_LAG_DAYS,
        }
    }
}

impl OpenMeteoConfig {
    /// Returns availability of `partition` as of `today`.
    #[must_use]
    pub fn availability_on(&self, partition: PartitionKey, today: NaiveDate) -> Availability {
        let published_on = partition
            .last_day()
            .checked_add_days(chrono::Days::new(u64::from(self.publication_lag_days)))
            .unwrap_or(NaiveDate::MAX);
        if today > published_on {
            Availability::Ready
        } else {
            Availability::NotReady {
                reason: format!(
                    "weather archive for {partition} expected after {}",
                    published_on.format("%Y-%m-%d")
                ),
            }
        }
    }
}

/// Weather archive client.
#[derive(Debug, Clone)]
pub struct OpenMeteoWeatherSource {
    client: reqwest::Client,
    config: OpenMeteoConfig,
}

impl OpenMeteoWeatherSource {
    /// Creates a source with its own HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the HTTP client cannot be built.
    pub fn new(config: OpenMeteoConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::configuration(format!("failed to create HTTP client: {e}")))?;
        Ok(Self::with_client(client, config))
    }

    /// Creates a source using an existing HTTP client.
    #[must_use]
    pub const fn with_client(client: reqwest::Client, config: OpenMeteoConfig) -> Self {
        Self { client, config }
    }

    /// Returns the query configuration.
    #[must_use]
    pub const fn config(&self) -> &OpenMeteoConfig {
        &self.config
    }
}

#[async_trait]
impl RecordSource<WeatherObservation> for OpenMeteoWeatherSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    async fn check_availability(&self, partition: PartitionKey) -> Result<Availability> {
        Ok(self
            .config
            .availability_on(partition, Utc::now().date_naive()))
    }

    #[tracing::instrument(skip(self), fields(source = SOURCE_NAME))]
    async fn fetch(&self, partition: PartitionKey) -> Result<RecordStream<WeatherObservation>> {
        let start = partition.first_day().format("%Y-%m-%d").to_string();
        let end = partition.last_day().format("%Y-%m-%d").to_string();
        let latitude = self.config.latitude.to_string();
        let longitude = self.config.longitude.to_string();
        let response = self
            .client
            .get(&self.config.api_url)
            .query(&[
                ("latitude", latitude.as_str()),
                ("longitude", longitude.as_str()),
                ("start_date", start.as_str()),
                ("end_date", end.as_str()),
                ("hourly", HOURLY_VARIABLES),
                ("temperature_unit", "fahrenheit"),
                ("timezone", self.config.timezone.as_str()),
            ])
            .send()
            .await
            .map_err(|e| {
                Error::source_error_with_cause(SOURCE_NAME, "archive request failed", e)
            })?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| {
            Error::source_error_with_cause(SOURCE_NAME, "failed to read archive response", e)
        })?;
        if !status.is_success() {
            let reason = serde_json::from_slice::<ArchiveResponse>(&body)
                .ok()
                .and_then(|r| r.reason)
                .unwrap_or_default();
            return Err(Error::source_error(
                SOURCE_NAME,
                format!("archive returned {status} {reason}").trim_end().to_string(),
            ));
        }

        let observations = parse_hourly_response(&body, partition)?;
        tracing::info!(hours = observations.len(), "fetched hourly weather");
        Ok(Box::pin(stream::iter(observations.into_iter().map(Ok))))
    }
}

#[derive(Debug, Deserialize)]
struct ArchiveResponse {
    hourly: Option<Hourly>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Hourly {
    time: Vec<String>,
    temperature_2m: Vec<Option<f64>>,
    precipitation: Vec<Option<f64>>,
    #[serde(alias = "cloud_cover")]
    cloudcover: Vec<Option<f64>>,
}

/// Decodes and validates an archive response for `partition`.
///
/// A timestamp repeated back-to-back (the local hour replayed when daylight
/// saving ends) keeps its first reading. Any other repeat is malformed.
pub(crate) fn parse_hourly_response(
    body: &[u8],
    partition: PartitionKey,
) -> Result<Vec<WeatherObservation>> {
    let malformed = |message: String| Error::source_format(SOURCE_NAME, message);
    let response: ArchiveResponse = serde_json::from_slice(body)
        .map_err(|e| malformed(format!("undecodable archive response: {e}")))?;
    let hourly = response
        .hourly
        .ok_or_else(|| malformed("response has no hourly block".to_string()))?;

    let n = hourly.time.len();
    if hourly.temperature_2m.len() != n
        || hourly.precipitation.len() != n
        || hourly.cloudcover.len() != n
    {
        return Err(malformed(format!(
            "hourly arrays differ in length (time={n}, temperature_2m={}, precipitation={}, cloudcover={})",
            hourly.temperature_2m.len(),
            hourly.precipitation.len(),
            hourly.cloudcover.len()
        )));
    }

    let mut seen = HashSet::with_capacity(n);
    let mut previous: Option<NaiveDateTime> = None;
    let mut observations = Vec::with_capacity(n);
    for (i, raw) in hourly.time.iter().enumerate() {
        let hour = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M")
            .map_err(|_| malformed(format!("invalid timestamp '{raw}'")))?;
        let obs = WeatherObservation::new(
            hour,
            hourly.temperature_2m.get(i).copied().flatten(),
            hourly.precipitation.get(i).copied().flatten(),
            hourly.cloudcover.get(i).copied().flatten(),
        );
        if !obs.is_hour_aligned() {
            return Err(malformed(format!("timestamp '{raw}' is not on the hour")));
        }
        if !partition.contains(hour.date()) {
            return Err(malformed(format!(
                "timestamp '{raw}' is outside {partition} ({}-{:02})",
                hour.year(),
                hour.month()
            )));
        }
        if !seen.insert(hour) {
            if previous == Some(hour) {
                tracing::debug!(hour = %raw, "dropping repeated local hour");
                continue;
            }
            return Err(malformed(format!("duplicate timestamp '{raw}'")));
        }
        previous = Some(hour);
        observations.push(obs);
    }
    Ok(observations)
}
