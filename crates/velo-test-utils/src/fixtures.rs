//! Pre-built test fixtures for common pipeline scenarios.
//!
//! Record generators are seeded, so the same seed always yields the same
//! records.

use std::io::{Cursor, Write};

use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime};
use futures::stream;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use velo_core::PartitionKey;
use velo_flow::error::{Error, Result};
use velo_flow::model::Manifest;
use velo_flow::record::{
    RiderClass, StationRef, TRIP_COLUMNS, TripRecord, VehicleType, WeatherObservation,
};
use velo_flow::source::{Availability, RecordSource, RecordStream};

/// The reference model manifest shipped in `manifests/citibike.json`.
pub const REFERENCE_MANIFEST_JSON: &str = include_str!("../../../manifests/citibike.json");

/// Parses the reference manifest.
#[must_use]
pub fn reference_manifest() -> Manifest {
    Manifest::from_json(REFERENCE_MANIFEST_JSON).expect("reference manifest is valid")
}

/// Number of distinct stations generated trips use.
pub const STATION_COUNT: usize = 40;

/// Generates trips for one month.
///
/// Trips start and end inside the month, last 2 to 90 minutes, and carry
/// ride ids that are unique per generator.
#[derive(Debug)]
pub struct TripFactory {
    rng: StdRng,
    partition: PartitionKey,
    next_id: u64,
}

impl TripFactory {
    /// Creates a generator for `partition`.
    #[must_use]
    pub fn new(partition: PartitionKey, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            partition,
            next_id: 0,
        }
    }

    /// Generates the next trip.
    pub fn trip(&mut self) -> TripRecord {
        let id = self.next_id;
        self.next_id += 1;

        let month_start = self.partition.first_day().and_hms_opt(0, 0, 0).expect("midnight");
        // Latest start leaves room for the longest trip before month end.
        let span_minutes = i64::from(self.partition.days()) * 24 * 60 - 91;
        let started_at = month_start
            + Duration::minutes(self.rng.gen_range(0..span_minutes))
            + Duration::seconds(self.rng.gen_range(0..60));
        let ended_at = started_at + Duration::seconds(self.rng.gen_range(120..=90 * 60));

        let start = self.station();
        let end = if self.rng.gen_bool(0.05) {
            StationRef::default()
        } else {
            self.station()
        };

        TripRecord {
            ride_id: format!("{}{id:010}", self.partition.compact()),
            vehicle_type: match self.rng.gen_range(0..10) {
                0..=5 => VehicleType::Electric,
                6..=8 => VehicleType::Classic,
                _ => VehicleType::Docked,
            },
            started_at,
            ended_at: Some(ended_at),
            start,
            end,
            rider_class: if self.rng.gen_bool(0.8) {
                RiderClass::Member
            } else {
                RiderClass::Casual
            },
        }
    }

    /// Generates `count` trips.
    pub fn trips(&mut self, count: usize) -> Vec<TripRecord> {
        (0..count).map(|_| self.trip()).collect()
    }

    /// Returns a lazy iterator over `count` trips.
    pub fn generate(mut self, count: usize) -> impl Iterator<Item = TripRecord> + Send {
        (0..count).map(move |_| self.trip())
    }

    fn station(&mut self) -> StationRef {
        let n = self.rng.gen_range(0..STATION_COUNT);
        let offset = f64::from(u32::try_from(n).expect("small station index"));
        StationRef {
            name: Some(format!("Station {n:02}")),
            id: Some(format!("{}.{:02}", 5000 + n, n % 7)),
            lat: Some(40.70 + offset * 0.002),
            lng: Some(-74.01 + offset * 0.001),
        }
    }
}

/// A trip that starts on the last evening of `partition` and ends in the
/// following month, so it belongs to the next partition.
#[must_use]
pub fn month_crossing_trip(partition: PartitionKey, ride_id: &str) -> TripRecord {
    let started_at = partition.last_day().and_hms_opt(23, 50, 0).expect("valid time");
    TripRecord {
        ride_id: ride_id.to_string(),
        vehicle_type: VehicleType::Classic,
        started_at,
        ended_at: Some(started_at + Duration::minutes(20)),
        start: StationRef::default(),
        end: StationRef::default(),
        rider_class: RiderClass::Casual,
    }
}

/// Returns one observation per hour of `partition`, from the first hour.
#[must_use]
pub fn month_weather(partition: PartitionKey) -> Vec<WeatherObservation> {
    weather_observations(partition, partition.hours() as usize)
}

/// Returns `count` consecutive hourly observations starting at the first
/// hour of `partition`.
#[must_use]
pub fn weather_observations(partition: PartitionKey, count: usize) -> Vec<WeatherObservation> {
    let start = partition.first_day().and_hms_opt(0, 0, 0).expect("midnight");
    (0..count)
        .map(|i| {
            let hour = start + Duration::hours(i64::try_from(i).expect("small index"));
            let step = f64::from(u32::try_from(i % 24).expect("hour of day"));
            let cloud = u32::try_from((i * 37) % 101).expect("percentage");
            WeatherObservation::new(
                hour,
                Some(28.0 + step * 0.75),
                Some(if i % 9 == 0 { 0.6 } else { 0.0 }),
                if i % 50 == 49 { None } else { Some(f64::from(cloud)) },
            )
        })
        .collect()
}

/// Builds a trip archive zip holding `records` split over `members` CSV files.
#[must_use]
pub fn trip_archive_zip(records: &[TripRecord], members: usize) -> Vec<u8> {
    let members = members.max(1);
    let per_member = records.len().div_ceil(members).max(1);
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();

    let mut chunks: Vec<&[TripRecord]> = records.chunks(per_member).collect();
    chunks.resize(members, &[]);
    for (idx, chunk) in chunks.into_iter().enumerate() {
        zip.start_file(format!("tripdata_{}.csv", idx + 1), options)
            .expect("start zip member");
        zip.write_all(&trips_csv(chunk)).expect("write zip member");
    }
    zip.finish().expect("finish zip").into_inner()
}

/// Renders `records` in the trip archive's CSV layout.
#[must_use]
pub fn trips_csv(records: &[TripRecord]) -> Vec<u8> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(TRIP_COLUMNS).expect("write header");
    let opt = |v: Option<f64>| v.map(|v| v.to_string()).unwrap_or_default();
    for r in records {
        writer
            .write_record([
                r.ride_id.clone(),
                r.vehicle_type.as_source_str().to_string(),
                format_timestamp(r.started_at),
                r.ended_at.map(format_timestamp).unwrap_or_default(),
                r.start.name.clone().unwrap_or_default(),
                r.start.id.clone().unwrap_or_default(),
                r.end.name.clone().unwrap_or_default(),
                r.end.id.clone().unwrap_or_default(),
                opt(r.start.lat),
                opt(r.start.lng),
                opt(r.end.lat),
                opt(r.end.lng),
                r.rider_class.as_source_str().to_string(),
            ])
            .expect("write record");
    }
    writer.into_inner().expect("flush csv")
}

fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

/// Trip source generating records on the fly, for volumes too large to hold
/// in memory twice.
#[derive(Debug, Clone)]
pub struct GeneratedTripSource {
    partition: PartitionKey,
    count: usize,
    seed: u64,
}

impl GeneratedTripSource {
    /// Serves `count` generated trips for `partition` only.
    #[must_use]
    pub fn new(partition: PartitionKey, count: usize, seed: u64) -> Self {
        Self {
            partition,
            count,
            seed,
        }
    }
}

#[async_trait]
impl RecordSource<TripRecord> for GeneratedTripSource {
    fn name(&self) -> &str {
        "generated-trips"
    }

    async fn check_availability(&self, partition: PartitionKey) -> Result<Availability> {
        Ok(if partition == self.partition {
            Availability::Ready
        } else {
            Availability::NotReady {
                reason: format!("no generated trips for {partition}"),
            }
        })
    }

    async fn fetch(&self, partition: PartitionKey) -> Result<RecordStream<TripRecord>> {
        if partition != self.partition {
            return Err(Error::SourceUnavailable {
                source_name: self.name().to_string(),
                reason: format!("no generated trips for {partition}"),
            });
        }
        let trips = TripFactory::new(partition, self.seed).generate(self.count);
        Ok(Box::pin(stream::iter(trips.map(Ok))))
    }
}
