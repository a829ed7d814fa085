//! Query client for the metrics backend
//!
//! The scheduler only knows the [`QueryClient`] trait; the production
//! implementation speaks the Prometheus HTTP API. Tests inject fakes.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::{Sample, Series};

/// Request timeout for a single backend query.
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from a single query execution.
///
/// `Timeout` and `BackendUnavailable` are transient: the alert state machine
/// treats them as "no observation this cycle". `MalformedQuery` and
/// `EmptyResult` are evaluation failures surfaced as diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// The backend did not answer within the deadline
    Timeout,

    /// The backend could not be reached or answered with a server error
    BackendUnavailable(String),

    /// The backend rejected the query expression
    MalformedQuery(String),

    /// The query succeeded but matched no series
    EmptyResult,
}

impl QueryError {
    /// Transient errors leave alert state untouched and are retried next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueryError::Timeout | QueryError::BackendUnavailable(_))
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryError::Timeout => write!(f, "query timed out"),
            QueryError::BackendUnavailable(msg) => {
                write!(f, "metrics backend unavailable: {msg}")
            }
            QueryError::MalformedQuery(msg) => write!(f, "malformed query: {msg}"),
            QueryError::EmptyResult => write!(f, "query returned no series"),
        }
    }
}

impl std::error::Error for QueryError {}

/// A queryable metrics backend.
///
/// Queries must be idempotent and side-effect-free; the scheduler will
/// re-issue them every cycle.
#[async_trait]
pub trait QueryClient: Send + Sync {
    /// Execute one instant query evaluated at `at`.
    async fn execute(&self, query: &str, at: DateTime<Utc>) -> Result<Vec<Series>, QueryError>;
}

/// Query client for a Prometheus-compatible HTTP API.
#[derive(Debug, Clone)]
pub struct PrometheusClient {
    query_url: String,
    client: reqwest::Client,
}

/// Wire format of `/api/v1/query` responses.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: String,
    error: Option<String>,
    data: Option<ApiData>,
}

#[derive(Debug, Deserialize)]
struct ApiData {
    #[serde(default)]
    result: Vec<ApiItem>,
}

#[derive(Debug, Deserialize)]
struct ApiItem {
    #[serde(default)]
    metric: BTreeMap<String, String>,

    /// Instant vector: `[unix_ts, "value"]`
    value: Option<(f64, String)>,

    /// Range vector: list of `[unix_ts, "value"]` pairs
    #[serde(default)]
    values: Vec<(f64, String)>,
}

impl PrometheusClient {
    pub fn new(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            query_url: format!("{base}/api/v1/query"),
            client: reqwest::Client::builder()
                .timeout(QUERY_TIMEOUT)
                .build()
                .expect("Failed to build HTTP client"),
        }
    }

    fn convert_pair(pair: &(f64, String)) -> Option<Sample> {
        let timestamp = DateTime::from_timestamp_millis((pair.0 * 1000.0) as i64)?;
        match pair.1.parse::<f64>() {
            Ok(value) => Some(Sample { timestamp, value }),
            Err(e) => {
                // skip unparseable samples instead of failing the whole query
                warn!("could not parse sample value `{}`: {e}", pair.1);
                None
            }
        }
    }

    fn convert_item(item: &ApiItem) -> Series {
        let mut samples: Vec<Sample> = item
            .value
            .iter()
            .chain(item.values.iter())
            .filter_map(Self::convert_pair)
            .collect();
        samples.sort_by_key(|s| s.timestamp);

        Series { labels: item.metric.clone(), samples }
    }
}

#[async_trait]
impl QueryClient for PrometheusClient {
    #[instrument(skip(self, query))]
    async fn execute(&self, query: &str, at: DateTime<Utc>) -> Result<Vec<Series>, QueryError> {
        if query.trim().is_empty() {
            return Err(QueryError::MalformedQuery("empty expression".to_string()));
        }

        let started = Instant::now();
        let result = self.execute_inner(query, at).await;

        let latency = started.elapsed();
        match &result {
            Ok(series) => debug!(?latency, series = series.len(), "query succeeded"),
            Err(e) => debug!(?latency, error = %e, "query failed"),
        }

        result
    }
}

impl PrometheusClient {
    async fn execute_inner(
        &self,
        query: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<Series>, QueryError> {
        let response = self
            .client
            .get(&self.query_url)
            .query(&[("query", query), ("time", &at.timestamp().to_string())])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    QueryError::Timeout
                } else {
                    QueryError::BackendUnavailable(e.to_string())
                }
            })?;

        let status = response.status();
        let body: ApiResponse = response
            .json()
            .await
            .map_err(|e| QueryError::BackendUnavailable(format!("invalid response body: {e}")))?;

        if body.status != "success" {
            let reason = body.error.unwrap_or_else(|| format!("HTTP {status}"));
            // Prometheus answers expression errors with 400 + status "error"
            if status == reqwest::StatusCode::BAD_REQUEST {
                return Err(QueryError::MalformedQuery(reason));
            }
            return Err(QueryError::BackendUnavailable(reason));
        }

        let items = body.data.map(|d| d.result).unwrap_or_default();
        if items.is_empty() {
            return Err(QueryError::EmptyResult);
        }

        Ok(items.iter().map(Self::convert_item).collect())
    }
}
