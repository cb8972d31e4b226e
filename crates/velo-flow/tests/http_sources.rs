//! Trip and weather sources against a local HTTP server.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::time::Duration;

use futures::TryStreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use velo_core::PartitionKey;
use velo_flow::config::PipelineConfig;
use velo_flow::orchestrator::{Orchestrator, PipelineSources, RunOptions};
use velo_flow::record::TripRecord;
use velo_flow::source::{
    Availability, CitiBikeTripSource, OpenMeteoConfig, OpenMeteoWeatherSource, RecordSource,
};
use velo_flow::warehouse::InMemoryWarehouse;
use velo_test_utils::{
    SourceServer, TripFactory, assert_run_succeeded, month_weather, trip_archive_zip,
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn jan() -> PartitionKey {
    PartitionKey::new(2025, 1).unwrap()
}

fn weather_source(server: &SourceServer) -> OpenMeteoWeatherSource {
    OpenMeteoWeatherSource::new(
        OpenMeteoConfig {
            api_url: server.weather_url(),
            ..OpenMeteoConfig::default()
        },
        TIMEOUT,
    )
    .unwrap()
}

#[tokio::test]
async fn trip_archive_falls_back_to_second_name() {
    let trips = TripFactory::new(jan(), 5).trips(250);
    let server = SourceServer::builder()
        .archive("202501-citibike-tripdata.zip", trip_archive_zip(&trips, 3))
        .start()
        .await
        .unwrap();
    let source = CitiBikeTripSource::new(server.tripdata_url(), TIMEOUT).unwrap();

    assert_eq!(source.check_availability(jan()).await.unwrap(), Availability::Ready);
    let fetched: Vec<TripRecord> = source.fetch(jan()).await.unwrap().try_collect().await.unwrap();

    let mut expected: Vec<&str> = trips.iter().map(|t| t.ride_id.as_str()).collect();
    let mut got: Vec<&str> = fetched.iter().map(|t| t.ride_id.as_str()).collect();
    expected.sort_unstable();
    got.sort_unstable();
    assert_eq!(got, expected);

    let again: Vec<TripRecord> = source.fetch(jan()).await.unwrap().try_collect().await.unwrap();
    assert_eq!(again, fetched);

    let requests = server.requests();
    assert_eq!(requests[0], "HEAD /tripdata/202501-citibike-tripdata.csv.zip");
    assert_eq!(requests[1], "HEAD /tripdata/202501-citibike-tripdata.zip");
}

#[tokio::test]
async fn forbidden_archive_counts_as_unpublished() {
    let server = SourceServer::builder()
        .forbidden("202502-citibike-tripdata.csv.zip")
        .forbidden("202502-citibike-tripdata.zip")
        .start()
        .await
        .unwrap();
    let source = CitiBikeTripSource::new(server.tripdata_url(), TIMEOUT).unwrap();
    let feb = jan().next().unwrap();

    let availability = source.check_availability(feb).await.unwrap();
    assert!(matches!(availability, Availability::NotReady { .. }));

    let err = match source.fetch(feb).await {
        Ok(_) => panic!("fetch of an unpublished month should fail"),
        Err(e) => e,
    };
    assert_eq!(err.kind(), "SOURCE_UNAVAILABLE");
}

#[tokio::test]
async fn corrupt_archive_is_a_format_error() {
    let server = SourceServer::builder()
        .archive("202501-citibike-tripdata.csv.zip", b"not a zip".to_vec())
        .start()
        .await
        .unwrap();
    let source = CitiBikeTripSource::new(server.tripdata_url(), TIMEOUT).unwrap();

    let err = match source.fetch(jan()).await {
        Ok(_) => panic!("corrupt archive should be rejected"),
        Err(e) => e,
    };
    assert_eq!(err.kind(), "SOURCE_FORMAT_ERROR");
}

#[tokio::test]
async fn weather_month_is_fetched_hour_by_hour() {
    let server = SourceServer::builder()
        .weather(jan(), &month_weather(jan()))
        .start()
        .await
        .unwrap();
    let source = weather_source(&server);

    let observations: Vec<_> = source.fetch(jan()).await.unwrap().try_collect().await.unwrap();

    assert_eq!(observations.len(), 744);
    assert_eq!(observations, month_weather(jan()));
    assert_eq!(
        server.requests(),
        vec!["GET /v1/archive?start_date=2025-01-01".to_string()]
    );
}

#[tokio::test]
async fn weather_api_error_carries_reason() {
    let server = SourceServer::builder().start().await.unwrap();
    let source = weather_source(&server);

    let err = match source.fetch(jan()).await {
        Ok(_) => panic!("unpublished weather should fail"),
        Err(e) => e,
    };
    assert_eq!(err.kind(), "SOURCE_ERROR");
    assert!(err.to_string().contains("No data is available"), "{err}");
}

#[tokio::test]
async fn ragged_weather_columns_are_rejected() {
    let server = SourceServer::builder()
        .weather_body(
            jan(),
            json!({
                "hourly": {
                    "time": ["2025-01-01T00:00", "2025-01-01T01:00"],
                    "temperature_2m": [30.1],
                    "precipitation": [0.0, 0.0],
                    "cloudcover": [10, 20],
                }
            }),
        )
        .start()
        .await
        .unwrap();

    let err = match weather_source(&server).fetch(jan()).await {
        Ok(_) => panic!("ragged response should be rejected"),
        Err(e) => e,
    };
    assert_eq!(err.kind(), "SOURCE_FORMAT_ERROR");
}

#[tokio::test]
async fn pipeline_loads_month_over_http() {
    let trips = TripFactory::new(jan(), 9).trips(400);
    let server = SourceServer::builder()
        .archive("202501-citibike-tripdata.csv.zip", trip_archive_zip(&trips, 2))
        .weather(jan(), &month_weather(jan()))
        .start()
        .await
        .unwrap();
    let config = PipelineConfig {
        tripdata_base_url: server.tripdata_url(),
        weather: OpenMeteoConfig {
            api_url: server.weather_url(),
            ..OpenMeteoConfig::default()
        },
        http_timeout: TIMEOUT,
        ..PipelineConfig::default()
    };
    let warehouse = std::sync::Arc::new(InMemoryWarehouse::new());
    let sources = PipelineSources::http(&config).unwrap();
    let orchestrator =
        Orchestrator::new(config.clone(), sources, warehouse.clone(), Default::default()).unwrap();

    let run = orchestrator
        .run(
            jan(),
            RunOptions {
                skip_transform: true,
                ..RunOptions::default()
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_run_succeeded(&run);
    assert_eq!(warehouse.row_count(&config.trips_table_ref().relation).unwrap(), 400);
    assert_eq!(warehouse.row_count(&config.weather_table_ref().relation).unwrap(), 744);
}
