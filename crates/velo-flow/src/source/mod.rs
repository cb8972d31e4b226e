//! Source adapters for trip and weather data.
//!
//! A [`RecordSource`] answers two questions for a monthly partition: is the
//! month published yet, and what are its records. Availability probes are
//! metadata-only. `fetch` issues the request and validates the payload's
//! envelope up front, then yields records lazily; calling `fetch` again
//! re-issues the request from scratch.
//!
//! ## Failure classes
//!
//! | Condition | Returned as |
//! |-----------|-------------|
//! | Month not published | [`Availability::NotReady`] from `check_availability` |
//! | Network, auth, 5xx | [`Error::Source`] |
//! | Malformed payload | [`Error::SourceFormat`] |

mod citibike;
mod memory;
mod open_meteo;

pub use citibike::{
    CitiBikeTripSource, DEFAULT_TRIPDATA_BASE_URL, LocalArchiveTripSource, archive_names,
};
pub use memory::{StaticSource, StaticTripSource, StaticWeatherSource};
pub use open_meteo::{
    DEFAULT_PUBLICATION_LAG_DAYS, DEFAULT_WEATHER_API_URL, OpenMeteoConfig,
    OpenMeteoWeatherSource,
};

use std::ops::ControlFlow;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use velo_core::PartitionKey;

use crate::error::{Error, Result};
use crate::record::{TripRecord, WeatherObservation};

/// Number of parsed records buffered between a blocking parser and its consumer.
const RECORD_CHANNEL_CAPACITY: usize = 4096;

/// A lazy, single-pass sequence of records.
pub type RecordStream<T> = BoxStream<'static, Result<T>>;

/// Whether a partition's data can be fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Availability {
    /// The month is published.
    Ready,
    /// The month is not published yet.
    NotReady {
        /// Human-readable reason.
        reason: String,
    },
}

impl Availability {
    /// Returns true for [`Availability::Ready`].
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// A typed client for one external dataset.
#[async_trait]
pub trait RecordSource<T>: Send + Sync
where
    T: Send + 'static,
{
    /// Short name used in logs, errors and metrics.
    fn name(&self) -> &str;

    /// Probes whether `partition` is published. Side-effect free.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Source`] if the probe itself fails.
    async fn check_availability(&self, partition: PartitionKey) -> Result<Availability>;

    /// Fetches the records of `partition`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Source`] on transport failure, [`Error::SourceFormat`]
    /// if the payload envelope is malformed, and [`Error::SourceUnavailable`]
    /// if the month turned out not to exist. Row-level format errors surface
    /// as items of the returned stream.
    async fn fetch(&self, partition: PartitionKey) -> Result<RecordStream<T>>;
}

/// A source of trip records.
pub type DynTripSource = std::sync::Arc<dyn RecordSource<TripRecord>>;

/// A source of weather observations.
pub type DynWeatherSource = std::sync::Arc<dyn RecordSource<WeatherObservation>>;

/// Runs a blocking producer on the blocking pool and exposes its output as a
/// stream.
///
/// The producer pushes records through `emit`, which returns
/// [`ControlFlow::Break`] once the consumer has gone away. The channel is
/// bounded, so the producer never runs more than one buffer ahead.
pub(crate) fn blocking_record_stream<T, F>(source_name: &str, produce: F) -> RecordStream<T>
where
    T: Send + 'static,
    F: FnOnce(&mut dyn FnMut(Result<T>) -> ControlFlow<()>) + Send + 'static,
{
    let (tx, rx) = mpsc::channel(RECORD_CHANNEL_CAPACITY);
    let handle = tokio::task::spawn_blocking(move || {
        let mut emit = |item: Result<T>| match tx.blocking_send(item) {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()), // receiver dropped
        };
        produce(&mut emit);
    });

    let source_name = source_name.to_string();
    Box::pin(stream::unfold(
        (rx, Some(handle), source_name),
        |(mut rx, handle, source_name)| async move {
            if let Some(item) = rx.recv().await {
                return Some((item, (rx, handle, source_name)));
            }
            // Channel closed: surface a parser panic instead of silently truncating.
            let handle = handle?;
            match handle.await {
                Ok(()) => None,
                Err(e) => Some((
                    Err(Error::source_error(
                        source_name.clone(),
                        format!("record parser terminated abnormally: {e}"),
                    )),
                    (rx, None, source_name),
                )),
            }
        },
    ))
}
