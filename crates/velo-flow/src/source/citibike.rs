//! Monthly trip archives.
//!
//! The publisher drops one zip per month under a public bucket. Depending on
//! the month the object is named `{YYYYMM}-citibike-tripdata.csv.zip` or
//! `{YYYYMM}-citibike-tripdata.zip`, and each archive holds one or more CSV
//! members of up to ~1M rows. Members are read in lexical order.

use std::io::Cursor;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::NaiveDateTime;
use csv::StringRecord;
use reqwest::StatusCode;
use velo_core::PartitionKey;
use zip::ZipArchive;

use super::{Availability, RecordSource, RecordStream, blocking_record_stream};
use crate::error::{Error, Result};
use crate::record::{RiderClass, StationRef, TRIP_COLUMNS, TripRecord, VehicleType};

/// Default location of the monthly trip archives.
pub const DEFAULT_TRIPDATA_BASE_URL: &str = "https://s3.amazonaws.com/tripdata/";

const SOURCE_NAME: &str = "citibike";

/// Candidate archive object names for a month, in lookup order.
#[must_use]
pub fn archive_names(partition: PartitionKey) -> [String; 2] {
    let month = partition.compact();
    [
        format!("{month}-citibike-tripdata.csv.zip"),
        format!("{month}-citibike-tripdata.zip"),
    ]
}

fn not_published_reason(partition: PartitionKey) -> String {
    let [primary, fallback] = archive_names(partition);
    format!("trip archive for {partition} not published (tried {primary}, {fallback})")
}

/// Trip archives served over HTTP.
#[derive(Debug, Clone)]
pub struct CitiBikeTripSource {
    client: reqwest::Client,
    base_url: String,
}

impl CitiBikeTripSource {
    /// Creates a source reading archives under `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::configuration(format!("failed to create HTTP client: {e}")))?;
        Ok(Self::with_client(client, base_url))
    }

    /// Creates a source using an existing HTTP client.
    #[must_use]
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self { client, base_url }
    }

    /// Returns the base URL archives are resolved against.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, name: &str) -> String {
        format!("{}{name}", self.base_url)
    }
}

/// Missing objects come back as 404, or 403 from buckets that deny listing.
fn is_missing(status: StatusCode) -> bool {
    status == StatusCode::NOT_FOUND || status == StatusCode::FORBIDDEN
}

#[async_trait]
impl RecordSource<TripRecord> for CitiBikeTripSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    #[tracing::instrument(skip(self), fields(source = SOURCE_NAME))]
    async fn check_availability(&self, partition: PartitionKey) -> Result<Availability> {
        for name in archive_names(partition) {
            let url = self.url_for(&name);
            let response = self.client.head(&url).send().await.map_err(|e| {
                Error::source_error_with_cause(SOURCE_NAME, format!("HEAD {url} failed"), e)
            })?;
            let status = response.status();
            if status.is_success() {
                tracing::debug!(%url, "trip archive found");
                return Ok(Availability::Ready);
            }
            if !is_missing(status) {
                return Err(Error::source_error(
                    SOURCE_NAME,
                    format!("HEAD {url} returned {status}"),
                ));
            }
        }
        Ok(Availability::NotReady {
            reason: not_published_reason(partition),
        })
    }

    #[tracing::instrument(skip(self), fields(source = SOURCE_NAME))]
    async fn fetch(&self, partition: PartitionKey) -> Result<RecordStream<TripRecord>> {
        for name in archive_names(partition) {
            let url = self.url_for(&name);
            let response = self.client.get(&url).send().await.map_err(|e| {
                Error::source_error_with_cause(SOURCE_NAME, format!("GET {url} failed"), e)
            })?;
            let status = response.status();
            if is_missing(status) {
                continue;
            }
            if !status.is_success() {
                return Err(Error::source_error(
                    SOURCE_NAME,
                    format!("GET {url} returned {status}"),
                ));
            }
            let body = response.bytes().await.map_err(|e| {
                Error::source_error_with_cause(SOURCE_NAME, format!("download of {url} failed"), e)
            })?;
            tracing::info!(%url, bytes = body.len(), "downloaded trip archive");
            return Ok(TripArchive::open(body)?.into_stream());
        }
        Err(Error::SourceUnavailable {
            source_name: SOURCE_NAME.to_string(),
            reason: not_published_reason(partition),
        })
    }
}

/// Trip archives previously downloaded to a local directory.
#[derive(Debug, Clone)]
pub struct LocalArchiveTripSource {
    dir: PathBuf,
}

impl LocalArchiveTripSource {
    /// Creates a source reading archives from `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn locate(&self, partition: PartitionKey) -> Result<Option<PathBuf>> {
        for name in archive_names(partition) {
            let path = self.dir.join(name);
            let exists = tokio::fs::try_exists(&path).await.map_err(|e| {
                Error::source_error_with_cause(
                    SOURCE_NAME,
                    format!("failed to stat {}", path.display()),
                    e,
                )
            })?;
            if exists {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl RecordSource<TripRecord> for LocalArchiveTripSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    async fn check_availability(&self, partition: PartitionKey) -> Result<Availability> {
        Ok(match self.locate(partition).await? {
            Some(_) => Availability::Ready,
            None => Availability::NotReady {
                reason: not_published_reason(partition),
            },
        })
    }

    async fn fetch(&self, partition: PartitionKey) -> Result<RecordStream<TripRecord>> {
        let Some(path) = self.locate(partition).await? else {
            return Err(Error::SourceUnavailable {
                source_name: SOURCE_NAME.to_string(),
                reason: not_published_reason(partition),
            });
        };
        let data = tokio::fs::read(&path).await.map_err(|e| {
            Error::source_error_with_cause(
                SOURCE_NAME,
                format!("failed to read {}", path.display()),
                e,
            )
        })?;
        tracing::info!(path = %path.display(), bytes = data.len(), "read local trip archive");
        Ok(TripArchive::open(Bytes::from(data))?.into_stream())
    }
}

/// An opened trip archive with its CSV members resolved.
pub(crate) struct TripArchive {
    archive: ZipArchive<Cursor<Bytes>>,
    members: Vec<String>,
}

impl TripArchive {
    /// Opens an archive and lists its CSV members.
    pub(crate) fn open(data: Bytes) -> Result<Self> {
        let archive = ZipArchive::new(Cursor::new(data)).map_err(|e| {
            Error::source_format(SOURCE_NAME, format!("not a readable zip archive: {e}"))
        })?;
        let mut members: Vec<String> = archive
            .file_names()
            .filter(|name| {
                !name.ends_with('/')
                    && !name.starts_with("__MACOSX/")
                    && name.to_ascii_lowercase().ends_with(".csv")
            })
            .map(ToString::to_string)
            .collect();
        if members.is_empty() {
            return Err(Error::source_format(
                SOURCE_NAME,
                "archive contains no CSV member",
            ));
        }
        members.sort();
        Ok(Self { archive, members })
    }

    /// Streams every member's rows, members in lexical order.
    pub(crate) fn into_stream(self) -> RecordStream<TripRecord> {
        blocking_record_stream(SOURCE_NAME, move |emit| {
            let Self {
                mut archive,
                members,
            } = self;
            for member in members {
                if read_member(&mut archive, &member, emit).is_break() {
                    return;
                }
            }
        })
    }
}

fn read_member(
    archive: &mut ZipArchive<Cursor<Bytes>>,
    member: &str,
    emit: &mut dyn FnMut(Result<TripRecord>) -> ControlFlow<()>,
) -> ControlFlow<()> {
    let file = match archive.by_name(member) {
        Ok(file) => file,
        Err(e) => {
            let _ = emit(Err(Error::source_format(
                SOURCE_NAME,
                format!("failed to open member {member}: {e}"),
            )));
            return ControlFlow::Break(());
        }
    };
    let mut reader = csv::ReaderBuilder::new().from_reader(file);
    let columns = match reader.headers() {
        Ok(headers) => ColumnIndex::resolve(headers),
        Err(e) => Err(format!("unreadable header: {e}")),
    };
    let columns = match columns {
        Ok(columns) => columns,
        Err(message) => {
            let _ = emit(Err(Error::source_format(
                SOURCE_NAME,
                format!("{member}: {message}"),
            )));
            return ControlFlow::Break(());
        }
    };

    tracing::debug!(member, "reading trip archive member");
    for record in reader.records() {
        let parsed = record
            .map_err(|e| e.to_string())
            .and_then(|record| {
                let line = record.position().map_or(0, csv::Position::line);
                columns
                    .parse(&record)
                    .map_err(|message| format!("line {line}: {message}"))
            })
            .map_err(|message| Error::source_format(SOURCE_NAME, format!("{member}: {message}")));
        let failed = parsed.is_err();
        if emit(parsed).is_break() || failed {
            return ControlFlow::Break(());
        }
    }
    ControlFlow::Continue(())
}

/// Positions of the expected columns within a member's header.
struct ColumnIndex([usize; 13]);

impl ColumnIndex {
    fn resolve(headers: &StringRecord) -> std::result::Result<Self, String> {
        let names: Vec<&str> = headers
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').trim())
            .collect();
        let mut positions = [0_usize; 13];
        let mut missing = Vec::new();
        for (slot, expected) in positions.iter_mut().zip(TRIP_COLUMNS) {
            match names.iter().position(|n| *n == expected) {
                Some(pos) => *slot = pos,
                None => missing.push(expected),
            }
        }
        if missing.is_empty() {
            Ok(Self(positions))
        } else {
            Err(format!("missing columns: {}", missing.join(", ")))
        }
    }

    fn field<'r>(&self, record: &'r StringRecord, column: usize) -> Option<&'r str> {
        self.0
            .get(column)
            .and_then(|&pos| record.get(pos))
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    fn parse(&self, record: &StringRecord) -> std::result::Result<TripRecord, String> {
        let text = |column: usize| self.field(record, column).map(ToString::to_string);
        let required = |column: usize| {
            self.field(record, column)
                .ok_or_else(|| format!("{} is empty", TRIP_COLUMNS[column]))
        };
        let float = |column: usize| {
            self.field(record, column)
                .map(|v| {
                    v.parse::<f64>()
                        .map_err(|_| format!("{} is not a number: '{v}'", TRIP_COLUMNS[column]))
                })
                .transpose()
        };

        Ok(TripRecord {
            ride_id: required(0)?.to_string(),
            vehicle_type: required(1)?.parse::<VehicleType>()?,
            started_at: parse_timestamp(required(2)?)?,
            ended_at: self.field(record, 3).map(parse_timestamp).transpose()?,
            start: StationRef {
                name: text(4),
                id: text(5),
                lat: float(8)?,
                lng: float(9)?,
            },
            end: StationRef {
                name: text(6),
                id: text(7),
                lat: float(10)?,
                lng: float(11)?,
            },
            rider_class: required(12)?.parse::<RiderClass>()?,
        })
    }
}

fn parse_timestamp(value: &str) -> std::result::Result<NaiveDateTime, String> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M"))
        .map_err(|_| format!("invalid timestamp '{value}'"))
}
