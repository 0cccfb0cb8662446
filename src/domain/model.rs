use crate::utils::error::{EtlError, Result};
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Timestamp format the Observe API expects, UTC with microseconds.
pub const API_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

pub fn format_api_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(API_TIMESTAMP_FORMAT).to_string()
}

/// Query metadata from the Observe API. Maps a warehouse query id back to
/// the asset / deployment / task that issued it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalQuery {
    pub query_id: String,
    pub asset_id: String,
    pub deployment_id: String,
    #[serde(default)]
    pub workspace_id: Option<String>,
    pub run_id: String,
    pub dag_id: String,
    pub task_id: String,
    pub namespace: String,
}

/// One row of `account_usage.query_attribution_history`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryCost {
    pub query_id: String,
    pub end_time: DateTime<Utc>,
    /// NULL in the view is normalized to 0.0
    pub credits: f64,
}

/// One row of `account_usage.query_history`. The counters are nullable in
/// the view and post as 0 when absent.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryUsage {
    pub query_id: String,
    pub rows_produced: Option<i64>,
    pub rows_inserted: Option<i64>,
    pub rows_updated: Option<i64>,
    pub rows_deleted: Option<i64>,
    pub rows_unloaded: Option<i64>,
    pub total_elapsed_time: Option<i64>,
    pub bytes_scanned: Option<i64>,
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricCategory {
    Cost,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageSeries {
    RowsProduced,
    RowsInserted,
    RowsUpdated,
    RowsDeleted,
    RowsUnloaded,
    TotalElapsedTime,
    BytesScanned,
}

impl UsageSeries {
    pub const ALL: [UsageSeries; 7] = [
        UsageSeries::RowsProduced,
        UsageSeries::RowsInserted,
        UsageSeries::RowsUpdated,
        UsageSeries::RowsDeleted,
        UsageSeries::RowsUnloaded,
        UsageSeries::TotalElapsedTime,
        UsageSeries::BytesScanned,
    ];

    pub fn metric_type(&self) -> &'static str {
        match self {
            UsageSeries::RowsProduced => "SNOWFLAKE_ROWS_PRODUCED",
            UsageSeries::RowsInserted => "SNOWFLAKE_ROWS_INSERTED",
            UsageSeries::RowsUpdated => "SNOWFLAKE_ROWS_UPDATED",
            UsageSeries::RowsDeleted => "SNOWFLAKE_ROWS_DELETED",
            UsageSeries::RowsUnloaded => "SNOWFLAKE_ROWS_UNLOADED",
            UsageSeries::TotalElapsedTime => "SNOWFLAKE_TOTAL_ELAPSED_TIME",
            UsageSeries::BytesScanned => "SNOWFLAKE_BYTES_SCANNED",
        }
    }

    pub fn value(&self, usage: &QueryUsage) -> f64 {
        let raw = match self {
            UsageSeries::RowsProduced => usage.rows_produced,
            UsageSeries::RowsInserted => usage.rows_inserted,
            UsageSeries::RowsUpdated => usage.rows_updated,
            UsageSeries::RowsDeleted => usage.rows_deleted,
            UsageSeries::RowsUnloaded => usage.rows_unloaded,
            UsageSeries::TotalElapsedTime => usage.total_elapsed_time,
            UsageSeries::BytesScanned => usage.bytes_scanned,
        };
        raw.unwrap_or(0) as f64
    }
}

/// A single attributed data point. The serialized form is exactly what the
/// metrics endpoint accepts (camelCase, `workspaceId` null when unknown).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricPoint {
    pub value: f64,
    pub asset_id: String,
    pub deployment_id: String,
    pub workspace_id: Option<String>,
    pub run_id: String,
    pub dag_id: String,
    pub task_id: String,
    pub namespace: String,
    pub timestamp: String,
}

impl MetricPoint {
    pub fn from_attribution(query: &ExternalQuery, value: f64, end_time: DateTime<Utc>) -> Self {
        Self {
            value,
            asset_id: query.asset_id.clone(),
            deployment_id: query.deployment_id.clone(),
            workspace_id: query.workspace_id.clone(),
            run_id: query.run_id.clone(),
            dag_id: query.dag_id.clone(),
            task_id: query.task_id.clone(),
            namespace: query.namespace.clone(),
            timestamp: format_api_timestamp(end_time),
        }
    }
}

/// POST body for the metrics endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricBatch {
    pub category: MetricCategory,
    #[serde(rename = "type")]
    pub metric_type: String,
    pub metrics: Vec<MetricPoint>,
}

impl MetricBatch {
    pub fn cost(metrics: Vec<MetricPoint>) -> Self {
        Self {
            category: MetricCategory::Cost,
            metric_type: "SNOWFLAKE_CREDITS".to_string(),
            metrics,
        }
    }

    pub fn usage(series: UsageSeries, metrics: Vec<MetricPoint>) -> Self {
        Self {
            category: MetricCategory::Custom,
            metric_type: series.metric_type().to_string(),
            metrics,
        }
    }
}

/// Half-open UTC interval a single run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl RunWindow {
    pub fn from_bounds(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start >= end {
            return Err(EtlError::ValidationError {
                message: format!("window start {} is not before end {}", start, end),
            });
        }
        Ok(Self { start, end })
    }

    /// 以 interval 為界取「上一個完整區間」
    pub fn containing(now: DateTime<Utc>, interval: TimeDelta) -> Result<Self> {
        let end = now
            .duration_trunc(interval)
            .map_err(|e| EtlError::ProcessingError {
                message: format!("cannot truncate {} to {}: {}", now, interval, e),
            })?;
        Ok(Self {
            start: end - interval,
            end,
        })
    }

    pub fn current(interval: TimeDelta) -> Result<Self> {
        Self::containing(Utc::now(), interval)
    }

    /// Shifts both bounds back, keeping the width.
    pub fn lagged(&self, hours: i64) -> Self {
        let lag = TimeDelta::hours(hours);
        Self {
            start: self.start - lag,
            end: self.end - lag,
        }
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }
}

impl fmt::Display for RunWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} .. {}",
            self.start.format("%Y-%m-%dT%H:%M:%SZ"),
            self.end.format("%Y-%m-%dT%H:%M:%SZ")
        )
    }
}

/// Per-run context threaded through every pipeline stage.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub execution_id: String,
    pub window: RunWindow,
}

impl RunContext {
    pub fn for_window(window: RunWindow) -> Self {
        Self {
            execution_id: format!("run_{}", window.end.format("%Y%m%d_%H%M")),
            window,
        }
    }

    pub fn with_execution_id(execution_id: String, window: RunWindow) -> Self {
        Self {
            execution_id,
            window,
        }
    }
}

/// Everything the extract stage pulled for one window.
#[derive(Debug, Clone)]
pub struct ExtractBatch {
    /// The lagged window the fetches actually used
    pub window: RunWindow,
    pub queries: Vec<ExternalQuery>,
    pub costs: Vec<QueryCost>,
    pub usage: Vec<QueryUsage>,
}

impl ExtractBatch {
    pub fn empty(window: RunWindow) -> Self {
        Self {
            window,
            queries: Vec::new(),
            costs: Vec::new(),
            usage: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn query_ids(&self) -> Vec<String> {
        self.queries.iter().map(|q| q.query_id.clone()).collect()
    }

    pub fn query_map(&self) -> HashMap<&str, &ExternalQuery> {
        self.queries
            .iter()
            .map(|q| (q.query_id.as_str(), q))
            .collect()
    }
}

/// Transform stage output: ready-to-post batches plus the audit rendering.
#[derive(Debug, Clone)]
pub struct AttributionResult {
    pub batches: Vec<MetricBatch>,
    pub cost_points: usize,
    pub usage_points: usize,
    pub skipped_unknown: usize,
    pub audit_csv: String,
}

#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub batches_posted: usize,
    pub points_posted: usize,
    pub audit_path: Option<String>,
    pub dry_run: bool,
}

/// Summary of one engine run, exportable as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub execution_id: String,
    pub window: RunWindow,
    pub external_queries: usize,
    pub cost_points: usize,
    pub usage_points: usize,
    pub batches_posted: usize,
    pub points_posted: usize,
    pub skipped_unknown: usize,
    pub short_circuited: bool,
    pub dry_run: bool,
    pub audit_path: Option<String>,
    pub duration_ms: u64,
}
