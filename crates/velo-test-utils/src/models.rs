//! Row-level evaluators mirroring the reference manifest's SQL.
//!
//! The in-memory warehouse does not interpret SQL, so each reference model
//! gets an evaluator computing the same rows its SQL would.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{NaiveDateTime, Timelike};
use velo_core::PartitionKey;
use velo_flow::error::Result;
use velo_flow::row::{Row, Value};
use velo_flow::warehouse::{InMemoryWarehouse, ModelEvaluator, TableSet};

/// Registers evaluators for every non-ephemeral model of the reference manifest.
///
/// # Errors
///
/// Returns an error if the warehouse's internal lock is poisoned.
pub fn register_reference_models(warehouse: &InMemoryWarehouse) -> Result<()> {
    let evaluators: [(&str, ModelEvaluator); 6] = [
        ("stg_trips", Arc::new(stg_trips)),
        ("stg_weather", Arc::new(stg_weather)),
        ("fct_trips", Arc::new(fct_trips)),
        ("agg_daily_rides", Arc::new(agg_daily_rides)),
        ("agg_station_usage", Arc::new(agg_station_usage)),
        ("agg_weather_impact", Arc::new(agg_weather_impact)),
    ];
    for (model, evaluator) in evaluators {
        warehouse.register_evaluator(model, evaluator)?;
    }
    Ok(())
}

fn hour_start(ts: NaiveDateTime) -> Option<NaiveDateTime> {
    ts.with_minute(0)?.with_second(0)?.with_nanosecond(0)
}

fn stg_trips(tables: &TableSet<'_>, _: Option<PartitionKey>) -> Result<Vec<Row>> {
    let raw = tables.rows("trips")?;
    Ok(raw
        .iter()
        .filter_map(|r| {
            let started = r.value("started_at").as_timestamp()?;
            let ended = r.value("ended_at").as_timestamp()?;
            Some(
                Row::new()
                    .with("ride_id", r.value("ride_id").clone())
                    .with("rideable_type", r.value("rideable_type").clone())
                    .with("started_at", started)
                    .with("ended_at", ended)
                    .with("start_station_id", r.value("start_station_id").clone())
                    .with("start_station_name", r.value("start_station_name").clone())
                    .with("end_station_id", r.value("end_station_id").clone())
                    .with("end_station_name", r.value("end_station_name").clone())
                    .with("member_casual", r.value("member_casual").clone())
                    .with("duration_minutes", (ended - started).num_minutes())
                    .with("trip_date", started.date())
                    .with("trip_hour", i64::from(started.hour()))
                    .with("trip_hour_ts", hour_start(started)),
            )
        })
        .collect())
}

fn stg_weather(tables: &TableSet<'_>, _: Option<PartitionKey>) -> Result<Vec<Row>> {
    let raw = tables.rows("weather")?;
    Ok(raw
        .iter()
        .map(|r| {
            let hour = r.value("datetime");
            Row::new()
                .with("weather_hour", hour.clone())
                .with("weather_date", hour.as_date())
                .with("temperature_f", r.value("temperature_f").clone())
                .with("precipitation_mm", r.value("precipitation_mm").clone())
                .with("cloud_cover_pct", r.value("cloud_cover_pct").clone())
                .with("conditions", r.value("conditions").clone())
        })
        .collect())
}

/// The ephemeral join: trips with their hour's weather, plausible durations only.
fn trips_with_weather(tables: &TableSet<'_>) -> Result<Vec<Row>> {
    let weather = tables.rows("stg_weather")?;
    let by_hour: HashMap<NaiveDateTime, &Row> = weather
        .iter()
        .filter_map(|w| Some((w.value("weather_hour").as_timestamp()?, w)))
        .collect();

    Ok(tables
        .rows("stg_trips")?
        .iter()
        .filter(|t| {
            t.value("duration_minutes")
                .as_int()
                .is_some_and(|d| (1..=1440).contains(&d))
        })
        .map(|t| {
            let w = t
                .value("trip_hour_ts")
                .as_timestamp()
                .and_then(|h| by_hour.get(&h));
            let field = |name: &str| w.map_or(Value::Null, |w| w.value(name).clone());
            let mut row = t.clone();
            row.set("temperature_f", field("temperature_f"));
            row.set("precipitation_mm", field("precipitation_mm"));
            row.set("conditions", field("conditions"));
            row
        })
        .collect())
}

fn in_month(row: &Row, partition: Option<PartitionKey>) -> bool {
    partition.is_none_or(|p| row.value("trip_date").as_date().is_some_and(|d| p.contains(d)))
}

fn fct_trips(tables: &TableSet<'_>, partition: Option<PartitionKey>) -> Result<Vec<Row>> {
    Ok(trips_with_weather(tables)?
        .into_iter()
        .filter(|t| in_month(t, partition))
        .map(|t| {
            let is_member = t.value("member_casual").as_text() == Some("member");
            let copy = |name: &str| t.value(name).clone();
            Row::new()
                .with("ride_id", copy("ride_id"))
                .with("rideable_type", copy("rideable_type"))
                .with("started_at", copy("started_at"))
                .with("ended_at", copy("ended_at"))
                .with("trip_date", copy("trip_date"))
                .with("trip_hour", copy("trip_hour"))
                .with("duration_minutes", copy("duration_minutes"))
                .with("member_casual", copy("member_casual"))
                .with("is_member", is_member)
                .with("start_station_id", copy("start_station_id"))
                .with("start_station_name", copy("start_station_name"))
                .with("end_station_id", copy("end_station_id"))
                .with("end_station_name", copy("end_station_name"))
                .with("temperature_f", copy("temperature_f"))
                .with("precipitation_mm", copy("precipitation_mm"))
                .with("conditions", copy("conditions"))
        })
        .collect())
}

#[derive(Default)]
struct RideStats {
    total: i64,
    member: i64,
    wet: i64,
    duration_sum: i64,
    temperature_sum: f64,
    temperature_n: u32,
}

impl RideStats {
    fn add(&mut self, row: &Row) {
        self.total += 1;
        if row.value("member_casual").as_text() == Some("member") {
            self.member += 1;
        }
        if row.value("precipitation_mm").as_float().is_some_and(|p| p > 0.0) {
            self.wet += 1;
        }
        self.duration_sum += row.value("duration_minutes").as_int().unwrap_or(0);
        if let Some(t) = row.value("temperature_f").as_float() {
            self.temperature_sum += t;
            self.temperature_n += 1;
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn avg_duration(&self) -> f64 {
        self.duration_sum as f64 / self.total as f64
    }

    fn avg_temperature(&self) -> Option<f64> {
        (self.temperature_n > 0).then(|| self.temperature_sum / f64::from(self.temperature_n))
    }
}

fn agg_daily_rides(tables: &TableSet<'_>, partition: Option<PartitionKey>) -> Result<Vec<Row>> {
    let mut days: BTreeMap<chrono::NaiveDate, RideStats> = BTreeMap::new();
    for row in tables.rows("fct_trips")?.iter().filter(|r| in_month(r, partition)) {
        if let Some(day) = row.value("trip_date").as_date() {
            days.entry(day).or_default().add(row);
        }
    }
    Ok(days
        .into_iter()
        .map(|(day, s)| {
            Row::new()
                .with("trip_date", day)
                .with("total_rides", s.total)
                .with("member_rides", s.member)
                .with("casual_rides", s.total - s.member)
                .with("wet_hour_rides", s.wet)
                .with("avg_duration_minutes", s.avg_duration())
                .with("avg_temperature_f", s.avg_temperature())
        })
        .collect())
}

fn agg_station_usage(tables: &TableSet<'_>, _: Option<PartitionKey>) -> Result<Vec<Row>> {
    let mut stations: BTreeMap<String, (String, RideStats)> = BTreeMap::new();
    for row in tables.rows("fct_trips")?.iter() {
        let (Some(id), Some(name)) = (
            row.value("start_station_id").as_text(),
            row.value("start_station_name").as_text(),
        ) else {
            continue;
        };
        stations
            .entry(id.to_string())
            .or_insert_with(|| (name.to_string(), RideStats::default()))
            .1
            .add(row);
    }
    Ok(stations
        .into_iter()
        .map(|(id, (name, s))| {
            Row::new()
                .with("start_station_id", id)
                .with("start_station_name", name)
                .with("total_departures", s.total)
                .with("member_departures", s.member)
                .with("casual_departures", s.total - s.member)
                .with("avg_duration_minutes", s.avg_duration())
        })
        .collect())
}

fn agg_weather_impact(tables: &TableSet<'_>, _: Option<PartitionKey>) -> Result<Vec<Row>> {
    let mut conditions: BTreeMap<String, RideStats> = BTreeMap::new();
    for row in trips_with_weather(tables)? {
        let label = row
            .value("conditions")
            .as_text()
            .unwrap_or("Unknown")
            .to_string();
        conditions.entry(label).or_default().add(&row);
    }
    Ok(conditions
        .into_iter()
        .map(|(label, s)| {
            Row::new()
                .with("conditions", label)
                .with("total_rides", s.total)
                .with("member_rides", s.member)
                .with("casual_rides", s.total - s.member)
                .with("avg_duration_minutes", s.avg_duration())
                .with("avg_temperature_f", s.avg_temperature())
        })
        .collect())
}
