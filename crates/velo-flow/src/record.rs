//! Source record types.
//!
//! [`TripRecord`] mirrors one row of the monthly trip archive and
//! [`WeatherObservation`] one hour of the weather archive. Timestamps are
//! local wall-clock times (America/New_York) exactly as the sources publish
//! them.

use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::row::{ColumnType, Row, WarehouseRecord};

/// Vehicle used for a trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleType {
    /// Pedal-assist electric bike.
    Electric,
    /// Classic bike.
    Classic,
    /// Docked bike (legacy classification).
    Docked,
}

impl VehicleType {
    /// Returns the source vocabulary for this vehicle type.
    #[must_use]
    pub const fn as_source_str(&self) -> &'static str {
        match self {
            Self::Electric => "electric_bike",
            Self::Classic => "classic_bike",
            Self::Docked => "docked_bike",
        }
    }
}

impl fmt::Display for VehicleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_source_str())
    }
}

impl FromStr for VehicleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "electric_bike" => Ok(Self::Electric),
            "classic_bike" => Ok(Self::Classic),
            "docked_bike" => Ok(Self::Docked),
            other => Err(format!("unknown rideable_type '{other}'")),
        }
    }
}

/// Rider membership class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiderClass {
    /// Annual member.
    Member,
    /// Casual rider.
    Casual,
}

impl RiderClass {
    /// Returns the source vocabulary for this rider class.
    #[must_use]
    pub const fn as_source_str(&self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Casual => "casual",
        }
    }
}

impl fmt::Display for RiderClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_source_str())
    }
}

impl FromStr for RiderClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "member" => Ok(Self::Member),
            "casual" => Ok(Self::Casual),
            other => Err(format!("unknown member_casual '{other}'")),
        }
    }
}

/// One end of a trip. Every field is nullable (dockless rides).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StationRef {
    /// Station name.
    pub name: Option<String>,
    /// Station identifier.
    pub id: Option<String>,
    /// Latitude.
    pub lat: Option<f64>,
    /// Longitude.
    pub lng: Option<f64>,
}

/// One ride from the trip archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripRecord {
    /// Ride identifier, unique within a partition.
    pub ride_id: String,
    /// Vehicle used.
    pub vehicle_type: VehicleType,
    /// Start time.
    pub started_at: NaiveDateTime,
    /// End time, when recorded.
    pub ended_at: Option<NaiveDateTime>,
    /// Origin.
    pub start: StationRef,
    /// Destination.
    pub end: StationRef,
    /// Rider class.
    pub rider_class: RiderClass,
}

/// Columns of the raw trips table, in source order.
pub const TRIP_COLUMNS: [&str; 13] = [
    "ride_id",
    "rideable_type",
    "started_at",
    "ended_at",
    "start_station_name",
    "start_station_id",
    "end_station_name",
    "end_station_id",
    "start_lat",
    "start_lng",
    "end_lat",
    "end_lng",
    "member_casual",
];

const TRIP_SCHEMA: [(&str, ColumnType); 13] = [
    ("ride_id", ColumnType::String),
    ("rideable_type", ColumnType::String),
    ("started_at", ColumnType::Timestamp),
    ("ended_at", ColumnType::Timestamp),
    ("start_station_name", ColumnType::String),
    ("start_station_id", ColumnType::String),
    ("end_station_name", ColumnType::String),
    ("end_station_id", ColumnType::String),
    ("start_lat", ColumnType::Float64),
    ("start_lng", ColumnType::Float64),
    ("end_lat", ColumnType::Float64),
    ("end_lng", ColumnType::Float64),
    ("member_casual", ColumnType::String),
];

impl TripRecord {
    /// Returns the trip duration, if the end time is recorded.
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.ended_at.map(|end| end - self.started_at)
    }
}

impl WarehouseRecord for TripRecord {
    fn schema() -> &'static [(&'static str, ColumnType)] {
        &TRIP_SCHEMA
    }

    /// The end date, falling back to the start date for open trips.
    fn partition_date(&self) -> Option<NaiveDate> {
        Some(self.ended_at.unwrap_or(self.started_at).date())
    }

    fn to_row(&self) -> Row {
        Row::new()
            .with("ride_id", self.ride_id.as_str())
            .with("rideable_type", self.vehicle_type.as_source_str())
            .with("started_at", self.started_at)
            .with("ended_at", self.ended_at)
            .with("start_station_name", self.start.name.clone())
            .with("start_station_id", self.start.id.clone())
            .with("end_station_name", self.end.name.clone())
            .with("end_station_id", self.end.id.clone())
            .with("start_lat", self.start.lat)
            .with("start_lng", self.start.lng)
            .with("end_lat", self.end.lat)
            .with("end_lng", self.end.lng)
            .with("member_casual", self.rider_class.as_source_str())
    }
}

/// Sky condition derived from cloud cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WeatherCondition {
    /// Cloud cover at most 25%.
    Sunny,
    /// Cloud cover at most 75%.
    #[serde(rename = "Partly Cloudy")]
    PartlyCloudy,
    /// Cloud cover above 75%.
    Cloudy,
    /// Cloud cover not reported.
    Unknown,
}

impl WeatherCondition {
    /// Derives the condition from a cloud cover percentage.
    #[must_use]
    pub fn from_cloud_cover(cloud_cover_pct: Option<f64>) -> Self {
        match cloud_cover_pct {
            None => Self::Unknown,
            Some(pct) if pct <= 25.0 => Self::Sunny,
            Some(pct) if pct <= 75.0 => Self::PartlyCloudy,
            Some(_) => Self::Cloudy,
        }
    }

    /// Returns the label stored in the warehouse.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Sunny => "Sunny",
            Self::PartlyCloudy => "Partly Cloudy",
            Self::Cloudy => "Cloudy",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for WeatherCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One hour of weather at the fixed observation point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherObservation {
    /// Start of the hour.
    pub hour: NaiveDateTime,
    /// Temperature in °F.
    pub temperature_f: Option<f64>,
    /// Precipitation in mm.
    pub precipitation_mm: Option<f64>,
    /// Cloud cover in percent.
    pub cloud_cover_pct: Option<f64>,
    /// Derived condition label.
    pub condition: WeatherCondition,
}

const WEATHER_SCHEMA: [(&str, ColumnType); 5] = [
    ("datetime", ColumnType::Timestamp),
    ("temperature_f", ColumnType::Float64),
    ("precipitation_mm", ColumnType::Float64),
    ("cloud_cover_pct", ColumnType::Float64),
    ("conditions", ColumnType::String),
];

impl WeatherObservation {
    /// Creates an observation, deriving the condition from cloud cover.
    #[must_use]
    pub fn new(
        hour: NaiveDateTime,
        temperature_f: Option<f64>,
        precipitation_mm: Option<f64>,
        cloud_cover_pct: Option<f64>,
    ) -> Self {
        Self {
            hour,
            temperature_f,
            precipitation_mm,
            cloud_cover_pct,
            condition: WeatherCondition::from_cloud_cover(cloud_cover_pct),
        }
    }

    /// Returns true if the timestamp sits exactly on an hour boundary.
    #[must_use]
    pub fn is_hour_aligned(&self) -> bool {
        self.hour.minute() == 0 && self.hour.second() == 0 && self.hour.nanosecond() == 0
    }
}

impl WarehouseRecord for WeatherObservation {
    fn schema() -> &'static [(&'static str, ColumnType)] {
        &WEATHER_SCHEMA
    }

    fn partition_date(&self) -> Option<NaiveDate> {
        Some(self.hour.date())
    }

    fn to_row(&self) -> Row {
        Row::new()
            .with("datetime", self.hour)
            .with("temperature_f", self.temperature_f)
            .with("precipitation_mm", self.precipitation_mm)
            .with("cloud_cover_pct", self.cloud_cover_pct)
            .with("conditions", self.condition.label())
    }
}
