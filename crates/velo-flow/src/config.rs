//! Pipeline configuration from the environment.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::executor::DEFAULT_MAX_CONCURRENCY;
use crate::source::{
    DEFAULT_PUBLICATION_LAG_DAYS, DEFAULT_TRIPDATA_BASE_URL, DEFAULT_WEATHER_API_URL,
    OpenMeteoConfig,
};
use crate::warehouse::{DEFAULT_INSERT_CHUNK_ROWS, Dataset, TableRef};

const ENV_PROJECT_ID: &str = "VELO_PROJECT_ID";
const ENV_DATASET: &str = "VELO_DATASET";
const ENV_TRIPS_TABLE: &str = "VELO_TRIPS_TABLE";
const ENV_WEATHER_TABLE: &str = "VELO_WEATHER_TABLE";
const ENV_TRIPDATA_BASE_URL: &str = "VELO_TRIPDATA_BASE_URL";
const ENV_WEATHER_API_URL: &str = "VELO_WEATHER_API_URL";
const ENV_WEATHER_LATITUDE: &str = "VELO_WEATHER_LATITUDE";
const ENV_WEATHER_LONGITUDE: &str = "VELO_WEATHER_LONGITUDE";
const ENV_WEATHER_TIMEZONE: &str = "VELO_WEATHER_TIMEZONE";
const ENV_WEATHER_PUBLICATION_LAG_DAYS: &str = "VELO_WEATHER_PUBLICATION_LAG_DAYS";
const ENV_INSERT_CHUNK_ROWS: &str = "VELO_INSERT_CHUNK_ROWS";
const ENV_MAX_CONCURRENCY: &str = "VELO_MAX_CONCURRENCY";
const ENV_STEP_TIMEOUT_SECS: &str = "VELO_STEP_TIMEOUT_SECS";
const ENV_HTTP_TIMEOUT_SECS: &str = "VELO_HTTP_TIMEOUT_SECS";
const ENV_LOCK_DIR: &str = "VELO_LOCK_DIR";
const ENV_LEDGER_DIR: &str = "VELO_LEDGER_DIR";
const ENV_LOCK_TTL_SECS: &str = "VELO_LOCK_TTL_SECS";

const DEFAULT_PROJECT_ID: &str = "citibike-portfolio";
const DEFAULT_DATASET: &str = "citibike";
const DEFAULT_TRIPS_TABLE: &str = "trips";
const DEFAULT_WEATHER_TABLE: &str = "weather";
const DEFAULT_STEP_TIMEOUT_SECS: u64 = 2 * 60 * 60;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 300;
const DEFAULT_LOCK_DIR: &str = ".velo/locks";
const DEFAULT_LEDGER_DIR: &str = ".velo/runs";

/// Settings for one pipeline deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Warehouse project and dataset.
    pub dataset: Dataset,
    /// Raw trips table name.
    pub trips_table: String,
    /// Raw weather table name.
    pub weather_table: String,
    /// Trip archive base URL.
    pub tripdata_base_url: String,
    /// Weather archive query settings.
    pub weather: OpenMeteoConfig,
    /// Rows per warehouse insert request.
    pub insert_chunk_rows: usize,
    /// Statements run at once by the DAG executor and quality gate.
    pub max_concurrency: usize,
    /// Budget for each pipeline step.
    pub step_timeout: Duration,
    /// Budget for each HTTP request to a source.
    pub http_timeout: Duration,
    /// Directory holding partition lock files.
    pub lock_dir: PathBuf,
    /// Directory holding run records.
    pub ledger_dir: PathBuf,
    /// Age after which a partition lock may be taken over.
    pub lock_ttl: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dataset: Dataset::new(DEFAULT_PROJECT_ID, DEFAULT_DATASET),
            trips_table: DEFAULT_TRIPS_TABLE.to_string(),
            weather_table: DEFAULT_WEATHER_TABLE.to_string(),
            tripdata_base_url: DEFAULT_TRIPDATA_BASE_URL.to_string(),
            weather: OpenMeteoConfig::default(),
            insert_chunk_rows: DEFAULT_INSERT_CHUNK_ROWS,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            step_timeout: Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECS),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            lock_dir: PathBuf::from(DEFAULT_LOCK_DIR),
            ledger_dir: PathBuf::from(DEFAULT_LEDGER_DIR),
            lock_ttl: velo_core::lock::DEFAULT_LOCK_TTL,
        }
    }
}

impl PipelineConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a variable is set to an invalid value.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads configuration with a custom variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a variable is set to an invalid value.
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |key: &str, default: String| -> Result<String> {
            match get_env(key) {
                None => Ok(default),
                Some(v) if v.trim().is_empty() => {
                    Err(Error::configuration(format!("{key} cannot be empty")))
                }
                Some(v) => Ok(v.trim().to_string()),
            }
        };

        let weather = OpenMeteoConfig {
            api_url: parse_url_env(&get_env, ENV_WEATHER_API_URL, DEFAULT_WEATHER_API_URL)?,
            latitude: parse_coordinate_env(&get_env, ENV_WEATHER_LATITUDE, defaults.weather.latitude, 90.0)?,
            longitude: parse_coordinate_env(
                &get_env,
                ENV_WEATHER_LONGITUDE,
                defaults.weather.longitude,
                180.0,
            )?,
            timezone: text(ENV_WEATHER_TIMEZONE, defaults.weather.timezone.clone())?,
            publication_lag_days: u32::try_from(parse_u64_env(
                &get_env,
                ENV_WEATHER_PUBLICATION_LAG_DAYS,
                u64::from(DEFAULT_PUBLICATION_LAG_DAYS),
                false,
            )?)
            .map_err(|_| {
                Error::configuration(format!(
                    "{ENV_WEATHER_PUBLICATION_LAG_DAYS} exceeds supported range"
                ))
            })?,
        };

        Ok(Self {
            dataset: Dataset::new(
                text(ENV_PROJECT_ID, defaults.dataset.project.clone())?,
                text(ENV_DATASET, defaults.dataset.dataset.clone())?,
            ),
            trips_table: text(ENV_TRIPS_TABLE, defaults.trips_table.clone())?,
            weather_table: text(ENV_WEATHER_TABLE, defaults.weather_table.clone())?,
            tripdata_base_url: parse_url_env(&get_env, ENV_TRIPDATA_BASE_URL, DEFAULT_TRIPDATA_BASE_URL)?,
            weather,
            insert_chunk_rows: parse_usize_env(&get_env, ENV_INSERT_CHUNK_ROWS, defaults.insert_chunk_rows)?,
            max_concurrency: parse_usize_env(&get_env, ENV_MAX_CONCURRENCY, defaults.max_concurrency)?,
            step_timeout: Duration::from_secs(parse_u64_env(
                &get_env,
                ENV_STEP_TIMEOUT_SECS,
                DEFAULT_STEP_TIMEOUT_SECS,
                true,
            )?),
            http_timeout: Duration::from_secs(parse_u64_env(
                &get_env,
                ENV_HTTP_TIMEOUT_SECS,
                DEFAULT_HTTP_TIMEOUT_SECS,
                true,
            )?),
            lock_dir: get_env(ENV_LOCK_DIR).map_or(defaults.lock_dir, PathBuf::from),
            ledger_dir: get_env(ENV_LEDGER_DIR).map_or(defaults.ledger_dir, PathBuf::from),
            lock_ttl: Duration::from_secs(parse_u64_env(
                &get_env,
                ENV_LOCK_TTL_SECS,
                defaults.lock_ttl.as_secs(),
                true,
            )?),
        })
    }

    /// Returns the raw trips table definition.
    #[must_use]
    pub fn trips_table_ref(&self) -> TableRef {
        TableRef::trips(&self.dataset, &self.trips_table)
    }

    /// Returns the raw weather table definition.
    #[must_use]
    pub fn weather_table_ref(&self) -> TableRef {
        TableRef::weather(&self.dataset, &self.weather_table)
    }
}

fn parse_u64_env<F>(get_env: &F, key: &str, default: u64, positive: bool) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default);
    };
    let parsed = raw.trim().parse::<u64>().map_err(|_| {
        Error::configuration(format!("{key} must be a non-negative integer, got '{raw}'"))
    })?;
    if positive && parsed == 0 {
        return Err(Error::configuration(format!(
            "{key} must be greater than zero"
        )));
    }
    Ok(parsed)
}

fn parse_usize_env<F>(get_env: &F, key: &str, default: usize) -> Result<usize>
where
    F: Fn(&str) -> Option<String>,
{
    let default = u64::try_from(default).unwrap_or(u64::MAX);
    let parsed = parse_u64_env(get_env, key, default, true)?;
    usize::try_from(parsed)
        .map_err(|_| Error::configuration(format!("{key} value {parsed} exceeds supported range")))
}

fn parse_coordinate_env<F>(get_env: &F, key: &str, default: f64, bound: f64) -> Result<f64>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default);
    };
    let parsed = raw
        .trim()
        .parse::<f64>()
        .map_err(|_| Error::configuration(format!("{key} must be a number, got '{raw}'")))?;
    if !parsed.is_finite() || parsed.abs() > bound {
        return Err(Error::configuration(format!(
            "{key} must be within ±{bound}, got {parsed}"
        )));
    }
    Ok(parsed)
}

fn parse_url_env<F>(get_env: &F, key: &str, default: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default.to_string());
    };
    let url = reqwest::Url::parse(raw.trim())
        .map_err(|e| Error::configuration(format!("{key} is not a valid URL: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::configuration(format!(
            "{key} must use http or https, got '{}'",
            url.scheme()
        )));
    }
    Ok(raw.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from(vars: &[(&str, &str)]) -> Result<PipelineConfig> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        PipelineConfig::from_env_with(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_match_reference_deployment() {
        let config = from(&[]).unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.trips_table_ref().relation, "citibike-portfolio.citibike.trips");
        assert_eq!(config.step_timeout, Duration::from_secs(7200));
        assert_eq!(config.max_concurrency, 4);
    }

    #[test]
    fn overrides_are_applied() {
        let config = from(&[
            ("VELO_PROJECT_ID", "other"),
            ("VELO_INSERT_CHUNK_ROWS", "500"),
            ("VELO_WEATHER_LATITUDE", "51.5"),
            ("VELO_TRIPDATA_BASE_URL", "http://localhost:9000/tripdata/"),
            ("VELO_WEATHER_PUBLICATION_LAG_DAYS", "0"),
        ])
        .unwrap();
        assert_eq!(config.weather_table_ref().relation, "other.citibike.weather");
        assert_eq!(config.insert_chunk_rows, 500);
        assert!((config.weather.latitude - 51.5).abs() < f64::EPSILON);
        assert_eq!(config.weather.publication_lag_days, 0);
    }

    #[test]
    fn invalid_values_are_rejected() {
        for vars in [
            [("VELO_MAX_CONCURRENCY", "0")],
            [("VELO_STEP_TIMEOUT_SECS", "soon")],
            [("VELO_WEATHER_LONGITUDE", "200")],
            [("VELO_WEATHER_API_URL", "not a url")],
            [("VELO_TRIPDATA_BASE_URL", "ftp://example.com/")],
            [("VELO_DATASET", "  ")],
        ] {
            assert!(
                matches!(from(&vars), Err(Error::Configuration { .. })),
                "{vars:?} should be rejected"
            );
        }
    }
}
