//! BigQuery warehouse over the REST API.
//!
//! Statements and assertions go through `jobs.query` (polling
//! `jobs.getQueryResults` until complete). Inserts run as batch load jobs,
//! one newline-delimited JSON upload per chunk, so loaded rows never sit in
//! the streaming buffer where a later partition `DELETE` would be refused.
//! Credentials come from application-default discovery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gcp_auth::TokenProvider;
use serde::{Deserialize, Serialize};
use velo_core::PartitionKey;

use super::statement::delete_partition_sql;
use super::{AssertionOutcome, ExecuteOutcome, Statement, TableRef, Warehouse};
use crate::error::{Error, Result};
use crate::quality::QualityAssertion;
use crate::row::{Row, Value};

const API_BASE: &str = "https://bigquery.googleapis.com/bigquery/v2";
const UPLOAD_BASE: &str = "https://bigquery.googleapis.com/upload/bigquery/v2";
const SCOPES: &[&str] = &["https://www.googleapis.com/auth/bigquery"];
const QUERY_WAIT_MS: u64 = 10_000;
const LOAD_POLL_INTERVAL: Duration = Duration::from_secs(1);
const MULTIPART_BOUNDARY: &str = "velo-load-job-boundary";

/// BigQuery connection settings.
#[derive(Debug, Clone)]
pub struct BigQueryConfig {
    /// Project that runs (and is billed for) query jobs.
    pub project_id: String,
    /// Dataset location, e.g. `US`.
    pub location: Option<String>,
    /// Rows per load job.
    pub insert_chunk_rows: usize,
    /// HTTP timeout per request.
    pub request_timeout: Duration,
}

impl BigQueryConfig {
    /// Creates settings for `project_id` with default limits.
    #[must_use]
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            location: None,
            insert_chunk_rows: super::DEFAULT_INSERT_CHUNK_ROWS,
            request_timeout: Duration::from_secs(120),
        }
    }
}

/// [`Warehouse`] backed by BigQuery.
pub struct BigQueryWarehouse {
    config: BigQueryConfig,
    token_provider: Arc<dyn TokenProvider>,
    client: reqwest::Client,
}

impl std::fmt::Debug for BigQueryWarehouse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BigQueryWarehouse")
            .field("config", &self.config)
            .field("token_provider", &"<TokenProvider>")
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    query: &'a str,
    use_legacy_sql: bool,
    timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    job_reference: Option<JobReference>,
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<TableRow>,
    num_dml_affected_rows: Option<String>,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<FieldSchema>,
}

#[derive(Debug, Deserialize)]
struct FieldSchema {
    name: String,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    #[serde(default)]
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    v: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoadJobRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    job_reference: Option<LoadJobReference<'a>>,
    configuration: LoadJobConfiguration<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoadJobReference<'a> {
    project_id: &'a str,
    location: &'a str,
}

#[derive(Debug, Serialize)]
struct LoadJobConfiguration<'a> {
    load: LoadConfiguration<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoadConfiguration<'a> {
    destination_table: DestinationTable<'a>,
    source_format: &'static str,
    write_disposition: &'static str,
    create_disposition: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DestinationTable<'a> {
    project_id: &'a str,
    dataset_id: &'a str,
    table_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Job {
    job_reference: Option<JobReference>,
    status: Option<JobStatus>,
    statistics: Option<JobStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    state: String,
    error_result: Option<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct JobStatistics {
    load: Option<LoadStatistics>,
    query: Option<QueryStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadStatistics {
    output_rows: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryStatistics {
    statement_type: Option<String>,
    num_dml_affected_rows: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobList {
    #[serde(default)]
    jobs: Vec<Job>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

impl BigQueryWarehouse {
    /// Connects using application-default credentials.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the project is empty, credentials
    /// cannot be discovered, or the HTTP client cannot be built.
    pub async fn new(config: BigQueryConfig) -> Result<Self> {
        if config.project_id.is_empty() {
            return Err(Error::configuration("project_id cannot be empty"));
        }
        let token_provider = gcp_auth::provider()
            .await
            .map_err(|e| Error::configuration(format!("failed to initialize GCP auth: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::configuration(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            config,
            token_provider,
            client,
        })
    }

    async fn access_token(&self) -> Result<String> {
        let token = self
            .token_provider
            .token(SCOPES)
            .await
            .map_err(|e| Error::warehouse(format!("failed to get GCP access token: {e}")))?;
        Ok(token.as_str().to_string())
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        what: &str,
    ) -> Result<T> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::warehouse_with_source(format!("{what}: unreadable response"), e))?;
        if !status.is_success() {
            let message = serde_json::from_str::<ApiErrorResponse>(&body)
                .map_or(body, |r| r.error.message);
            return Err(Error::warehouse(format!("{what}: {status} {message}")));
        }
        serde_json::from_str(&body)
            .map_err(|e| Error::warehouse_with_source(format!("{what}: undecodable response"), e))
    }

    /// Runs a query job to completion.
    #[tracing::instrument(skip(self, sql), fields(project = %self.config.project_id))]
    async fn query(&self, sql: &str) -> Result<QueryResponse> {
        let token = self.access_token().await?;
        let url = format!("{API_BASE}/projects/{}/queries", self.config.project_id);
        let request = QueryRequest {
            query: sql,
            use_legacy_sql: false,
            timeout_ms: QUERY_WAIT_MS,
            location: self.config.location.as_deref(),
        };
        let response = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::warehouse_with_source("jobs.query request failed", e))?;
        let mut result: QueryResponse = Self::read_json(response, "jobs.query").await?;

        while !result.job_complete {
            let job = result
                .job_reference
                .as_ref()
                .ok_or_else(|| Error::warehouse("incomplete query job has no reference"))?;
            let url = format!(
                "{API_BASE}/projects/{}/queries/{}",
                self.config.project_id, job.job_id
            );
            let mut query = vec![("timeoutMs", QUERY_WAIT_MS.to_string())];
            if let Some(location) = job.location.as_ref().or(self.config.location.as_ref()) {
                query.push(("location", location.clone()));
            }
            let token = self.access_token().await?;
            let response = self
                .client
                .get(&url)
                .bearer_auth(&token)
                .query(&query)
                .send()
                .await
                .map_err(|e| Error::warehouse_with_source("jobs.getQueryResults request failed", e))?;
            result = Self::read_json(response, "jobs.getQueryResults").await?;
        }

        if let Some(first) = result.errors.first() {
            return Err(Error::warehouse(format!("query failed: {}", first.message)));
        }
        Ok(result)
    }

    /// Sums rows inserted by the child jobs of a multi-statement script.
    async fn script_inserted_rows(&self, script: &JobReference) -> Result<Option<u64>> {
        let url = format!("{API_BASE}/projects/{}/jobs", self.config.project_id);
        let token = self.access_token().await?;
        let response = self
            .client
            .get(&url)
            .bearer_auth(&token)
            .query(&[("parentJobId", script.job_id.as_str())])
            .send()
            .await
            .map_err(|e| Error::warehouse_with_source("jobs.list request failed", e))?;
        let children: JobList = Self::read_json(response, "jobs.list").await?;
        Ok(children.inserted_rows())
    }

    fn job_url(&self, job: &JobReference) -> (String, Vec<(&'static str, String)>) {
        let url = format!("{API_BASE}/projects/{}/jobs/{}", self.config.project_id, job.job_id);
        let location = job.location.as_ref().or(self.config.location.as_ref());
        (url, location.map(|l| vec![("location", l.clone())]).unwrap_or_default())
    }

    /// Uploads `rows` as one append-only load job and waits for it.
    #[tracing::instrument(skip(self, rows), fields(relation = %table.relation, rows = rows.len()))]
    async fn load(&self, table: &TableRef, rows: &[Row]) -> Result<u64> {
        let (project, dataset, name) = split_relation(&table.relation)?;
        let request = LoadJobRequest {
            job_reference: self.config.location.as_deref().map(|location| LoadJobReference {
                project_id: &self.config.project_id,
                location,
            }),
            configuration: LoadJobConfiguration {
                load: LoadConfiguration {
                    destination_table: DestinationTable {
                        project_id: project,
                        dataset_id: dataset,
                        table_id: name,
                    },
                    source_format: "NEWLINE_DELIMITED_JSON",
                    write_disposition: "WRITE_APPEND",
                    create_disposition: "CREATE_NEVER",
                },
            },
        };
        let body = multipart_body(&request, rows)?;

        let url = format!(
            "{UPLOAD_BASE}/projects/{}/jobs?uploadType=multipart",
            self.config.project_id
        );
        let token = self.access_token().await?;
        let response = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={MULTIPART_BOUNDARY}"),
            )
            .body(body)
            .send()
            .await
            .map_err(|e| Error::warehouse_with_source("load job upload failed", e))?;
        let mut job: Job = Self::read_json(response, "jobs.insert").await?;

        while !job.is_done() {
            tokio::time::sleep(LOAD_POLL_INTERVAL).await;
            let reference = job
                .job_reference
                .as_ref()
                .ok_or_else(|| Error::warehouse("running load job has no reference"))?;
            let (url, query) = self.job_url(reference);
            let token = self.access_token().await?;
            let response = self
                .client
                .get(&url)
                .bearer_auth(&token)
                .query(&query)
                .send()
                .await
                .map_err(|e| Error::warehouse_with_source("jobs.get request failed", e))?;
            job = Self::read_json(response, "jobs.get").await?;
        }
        job.loaded_rows(rows.len() as u64)
    }
}

fn multipart_body(request: &LoadJobRequest<'_>, rows: &[Row]) -> Result<Vec<u8>> {
    let mut body = Vec::with_capacity(rows.len() * 256);
    body.extend_from_slice(
        format!("--{MULTIPART_BOUNDARY}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n")
            .as_bytes(),
    );
    serde_json::to_writer(&mut body, request)?;
    body.extend_from_slice(
        format!("\r\n--{MULTIPART_BOUNDARY}\r\nContent-Type: application/octet-stream\r\n\r\n")
            .as_bytes(),
    );
    for row in rows {
        serde_json::to_writer(&mut body, row)?;
        body.push(b'\n');
    }
    body.extend_from_slice(format!("\r\n--{MULTIPART_BOUNDARY}--\r\n").as_bytes());
    Ok(body)
}

impl Job {
    fn is_done(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.state == "DONE")
    }

    /// Returns rows written by a finished load job, or its error.
    fn loaded_rows(&self, submitted: u64) -> Result<u64> {
        if let Some(error) = self.status.as_ref().and_then(|s| s.error_result.as_ref()) {
            return Err(Error::warehouse(format!("load job failed: {}", error.message)));
        }
        Ok(self
            .statistics
            .as_ref()
            .and_then(|s| s.load.as_ref())
            .and_then(|l| l.output_rows.as_deref())
            .and_then(|n| n.parse().ok())
            .unwrap_or(submitted))
    }
}

impl JobList {
    /// Sums `numDmlAffectedRows` over `INSERT` children; `None` if there are none.
    fn inserted_rows(&self) -> Option<u64> {
        self.jobs
            .iter()
            .filter_map(|job| job.statistics.as_ref()?.query.as_ref())
            .filter(|q| q.statement_type.as_deref() == Some("INSERT"))
            .map(|q| q.num_dml_affected_rows.as_deref().and_then(|n| n.parse::<u64>().ok()))
            .fold(None, |total, rows| match (total, rows) {
                (total, None) => total,
                (None, Some(rows)) => Some(rows),
                (Some(total), Some(rows)) => Some(total + rows),
            })
    }
}

impl QueryResponse {
    fn into_outcome(self) -> ExecuteOutcome {
        let names: Vec<String> = self
            .schema
            .map(|s| s.fields.into_iter().map(|f| f.name).collect())
            .unwrap_or_default();
        let rows: Vec<Row> = self
            .rows
            .into_iter()
            .map(|row| {
                names
                    .iter()
                    .zip(row.f)
                    .fold(Row::new(), |acc, (name, cell)| {
                        acc.with(name.clone(), cell_value(cell.v))
                    })
            })
            .collect();
        let rows_affected = self.num_dml_affected_rows.and_then(|n| n.parse().ok());
        ExecuteOutcome {
            rows_affected,
            rows,
        }
    }
}

// The REST API returns every scalar as a JSON string.
fn cell_value(v: Option<serde_json::Value>) -> Value {
    match v {
        None | Some(serde_json::Value::Null) => Value::Null,
        Some(serde_json::Value::String(s)) => Value::Text(s),
        Some(serde_json::Value::Bool(b)) => Value::Bool(b),
        Some(other) => Value::Text(other.to_string()),
    }
}

fn split_relation(relation: &str) -> Result<(&str, &str, &str)> {
    let mut parts = relation.splitn(3, '.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(project), Some(dataset), Some(table)) => Ok((project, dataset, table)),
        _ => Err(Error::configuration(format!(
            "relation '{relation}' is not project.dataset.table"
        ))),
    }
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    fn insert_chunk_rows(&self) -> usize {
        self.config.insert_chunk_rows
    }

    async fn delete_partition(&self, table: &TableRef, partition: PartitionKey) -> Result<u64> {
        let outcome = self
            .query(&delete_partition_sql(table, partition))
            .await?
            .into_outcome();
        Ok(outcome.rows_affected.unwrap_or(0))
    }

    async fn insert_chunk(&self, table: &TableRef, rows: Vec<Row>) -> Result<u64> {
        self.load(table, &rows).await
    }

    async fn execute(&self, statement: &Statement) -> Result<ExecuteOutcome> {
        tracing::debug!(kind = statement.kind(), relation = ?statement.relation(), "executing statement");
        let response = self.query(&statement.to_sql()).await?;
        let script = match statement {
            Statement::MergePartition { .. } if response.num_dml_affected_rows.is_none() => {
                response.job_reference.as_ref().map(|job| job.job_id.clone())
            }
            _ => None,
        };
        let mut outcome = response.into_outcome();
        if let Some(job_id) = script {
            let reference = JobReference {
                job_id,
                location: self.config.location.clone(),
            };
            outcome.rows_affected = self.script_inserted_rows(&reference).await?;
        }
        Ok(outcome)
    }

    async fn run_assertion(
        &self,
        relation: &str,
        assertion: &QualityAssertion,
    ) -> Result<AssertionOutcome> {
        let outcome = self.query(&assertion.to_sql(relation)).await?.into_outcome();
        let violations = outcome
            .rows
            .first()
            .map(|row| row.value("violations").to_string())
            .ok_or_else(|| Error::warehouse(format!("assertion {assertion} returned no rows")))?
            .parse::<u64>()
            .map_err(|e| Error::warehouse(format!("assertion {assertion}: {e}")))?;
        Ok(AssertionOutcome::from_violations(violations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_qualified_relation() {
        assert_eq!(
            split_relation("citibike-portfolio.citibike.trips").unwrap(),
            ("citibike-portfolio", "citibike", "trips")
        );
        assert!(split_relation("trips").is_err());
    }

    #[test]
    fn decodes_query_rows() {
        let body = r#"{
            "jobComplete": true,
            "schema": {"fields": [{"name": "violations", "type": "INTEGER"}]},
            "rows": [{"f": [{"v": "3"}]}]
        }"#;
        let response: QueryResponse = serde_json::from_str(body).unwrap();
        let outcome = response.into_outcome();
        assert_eq!(outcome.rows[0].value("violations"), &Value::Text("3".into()));
        assert_eq!(outcome.rows_affected, None);
    }

    #[test]
    fn reads_dml_row_count() {
        let body = r#"{"jobComplete": true, "numDmlAffectedRows": "42"}"#;
        let response: QueryResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.into_outcome().rows_affected, Some(42));
    }

    #[test]
    fn script_response_reports_no_row_count() {
        let body = r#"{
            "jobComplete": true,
            "jobReference": {"projectId": "p", "jobId": "script_1", "location": "US"}
        }"#;
        let response: QueryResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.job_reference.as_ref().unwrap().job_id, "script_1");
        assert_eq!(response.into_outcome().rows_affected, None);
    }

    #[test]
    fn script_children_sum_inserted_rows() {
        let body = r#"{"jobs": [
            {"statistics": {"query": {"statementType": "INSERT", "numDmlAffectedRows": "31"}}},
            {"statistics": {"query": {"statementType": "DELETE", "numDmlAffectedRows": "29"}}},
            {"statistics": {"query": {"statementType": "CREATE_TABLE"}}}
        ]}"#;
        let children: JobList = serde_json::from_str(body).unwrap();
        assert_eq!(children.inserted_rows(), Some(31));

        let empty: JobList = serde_json::from_str("{}").unwrap();
        assert_eq!(empty.inserted_rows(), None);
    }

    #[test]
    fn load_job_status_decodes() {
        let running: Job = serde_json::from_str(
            r#"{"jobReference": {"jobId": "load_1"}, "status": {"state": "RUNNING"}}"#,
        )
        .unwrap();
        assert!(!running.is_done());

        let done: Job = serde_json::from_str(
            r#"{"status": {"state": "DONE"}, "statistics": {"load": {"outputRows": "1000"}}}"#,
        )
        .unwrap();
        assert!(done.is_done());
        assert_eq!(done.loaded_rows(1_000).unwrap(), 1_000);

        let failed: Job = serde_json::from_str(
            r#"{"status": {"state": "DONE", "errorResult": {"message": "invalid JSON"}}}"#,
        )
        .unwrap();
        assert!(failed.loaded_rows(10).unwrap_err().to_string().contains("invalid JSON"));
    }

    #[test]
    fn multipart_body_carries_config_then_ndjson() {
        let request = LoadJobRequest {
            job_reference: None,
            configuration: LoadJobConfiguration {
                load: LoadConfiguration {
                    destination_table: DestinationTable {
                        project_id: "p",
                        dataset_id: "d",
                        table_id: "trips",
                    },
                    source_format: "NEWLINE_DELIMITED_JSON",
                    write_disposition: "WRITE_APPEND",
                    create_disposition: "CREATE_NEVER",
                },
            },
        };
        let rows = vec![Row::new().with("ride_id", "A"), Row::new().with("ride_id", "B")];
        let body = String::from_utf8(multipart_body(&request, &rows).unwrap()).unwrap();

        let config = body.find("\"writeDisposition\":\"WRITE_APPEND\"").unwrap();
        let first = body.find("{\"ride_id\":\"A\"}\n").unwrap();
        let second = body.find("{\"ride_id\":\"B\"}\n").unwrap();
        assert!(config < first && first < second);
        assert!(body.ends_with(&format!("--{MULTIPART_BOUNDARY}--\r\n")));
    }
}
