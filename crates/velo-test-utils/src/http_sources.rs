//! Local HTTP server standing in for the public trip bucket and the weather
//! archive API.
//!
//! Sources under test point at [`SourceServer::tripdata_url`] and
//! [`SourceServer::weather_url`] and talk real HTTP:
//! - Trip archives are served by object name; unknown names return 404 and
//!   names marked forbidden return 403, as an unlistable bucket does
//! - The weather endpoint answers archive queries by `start_date` with the
//!   `hourly` column layout, and a 400 with a `reason` otherwise

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde_json::json;
use tokio::sync::oneshot;
use velo_core::PartitionKey;
use velo_flow::record::WeatherObservation;

#[derive(Default)]
struct Published {
    archives: HashMap<String, Vec<u8>>,
    forbidden: HashSet<String>,
    weather: HashMap<String, serde_json::Value>,
}

#[derive(Clone)]
struct ServerState {
    published: Arc<Published>,
    requests: Arc<Mutex<Vec<String>>>,
}

/// Builder for a [`SourceServer`].
#[derive(Default)]
pub struct SourceServerBuilder {
    published: Published,
}

impl std::fmt::Debug for SourceServerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceServerBuilder")
            .field("archives", &self.published.archives.len())
            .finish_non_exhaustive()
    }
}

impl SourceServerBuilder {
    /// Publishes `body` under the object name `name`.
    #[must_use]
    pub fn archive(mut self, name: impl Into<String>, body: Vec<u8>) -> Self {
        self.published.archives.insert(name.into(), body);
        self
    }

    /// Answers 403 for `name`.
    #[must_use]
    pub fn forbidden(mut self, name: impl Into<String>) -> Self {
        self.published.forbidden.insert(name.into());
        self
    }

    /// Publishes `observations` as the archive response for `partition`.
    #[must_use]
    pub fn weather(self, partition: PartitionKey, observations: &[WeatherObservation]) -> Self {
        let hourly = json!({
            "time": observations
                .iter()
                .map(|o| o.hour.format("%Y-%m-%dT%H:%M").to_string())
                .collect::<Vec<_>>(),
            "temperature_2m": observations.iter().map(|o| o.temperature_f).collect::<Vec<_>>(),
            "precipitation": observations.iter().map(|o| o.precipitation_mm).collect::<Vec<_>>(),
            "cloudcover": observations.iter().map(|o| o.cloud_cover_pct).collect::<Vec<_>>(),
        });
        self.weather_body(partition, json!({
            "latitude": 40.71,
            "longitude": -74.01,
            "timezone": "America/New_York",
            "hourly_units": { "time": "iso8601", "temperature_2m": "°F" },
            "hourly": hourly,
        }))
    }

    /// Publishes a raw JSON body as the archive response for `partition`.
    #[must_use]
    pub fn weather_body(mut self, partition: PartitionKey, body: serde_json::Value) -> Self {
        self.published
            .weather
            .insert(partition.first_day().format("%Y-%m-%d").to_string(), body);
        self
    }

    /// Binds `127.0.0.1:0` and starts serving.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound or its address read.
    pub async fn start(self) -> std::io::Result<SourceServer> {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let state = ServerState {
            published: Arc::new(self.published),
            requests: Arc::clone(&requests),
        };

        let app = Router::new()
            .route("/tripdata/{name}", get(get_archive))
            .route("/v1/archive", get(get_weather))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr: SocketAddr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            let _ = server.await;
        });

        Ok(SourceServer {
            base_url: format!("http://{addr}"),
            requests,
            shutdown_tx: Some(shutdown_tx),
            _task: task,
        })
    }
}

/// Running stand-in for the public data endpoints.
pub struct SourceServer {
    base_url: String,
    requests: Arc<Mutex<Vec<String>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    _task: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for SourceServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceServer")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl SourceServer {
    /// Starts building a server.
    pub fn builder() -> SourceServerBuilder {
        SourceServerBuilder::default()
    }

    /// Returns the trip bucket URL, with trailing slash.
    pub fn tripdata_url(&self) -> String {
        format!("{}/tripdata/", self.base_url)
    }

    /// Returns the weather archive endpoint.
    pub fn weather_url(&self) -> String {
        format!("{}/v1/archive", self.base_url)
    }

    /// Returns every request served so far as `METHOD path`.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("request log").clone()
    }
}

impl Drop for SourceServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn get_archive(
    State(state): State<ServerState>,
    method: Method,
    Path(name): Path<String>,
) -> Response {
    state
        .requests
        .lock()
        .expect("request log")
        .push(format!("{method} /tripdata/{name}"));

    if state.published.forbidden.contains(&name) {
        return StatusCode::FORBIDDEN.into_response();
    }
    match state.published.archives.get(&name) {
        Some(body) => (StatusCode::OK, body.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn get_weather(
    State(state): State<ServerState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let start = params.get("start_date").cloned().unwrap_or_default();
    state
        .requests
        .lock()
        .expect("request log")
        .push(format!("GET /v1/archive?start_date={start}"));

    if params.get("hourly").is_none_or(|h| !h.contains("temperature_2m")) {
        return bad_request("Parameter 'hourly' is required");
    }
    match state.published.weather.get(&start) {
        Some(body) => axum::Json(body.clone()).into_response(),
        None => bad_request(&format!("No data is available for {start}")),
    }
}

fn bad_request(reason: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        axum::Json(json!({ "error": true, "reason": reason })),
    )
        .into_response()
}
