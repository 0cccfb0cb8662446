pub mod attribution_config;
pub mod cli;

pub use attribution_config::{AttributionConfig, PipelineOptions};

#[cfg(feature = "cli")]
use crate::domain::model::RunWindow;
#[cfg(feature = "cli")]
use crate::utils::error::{EtlError, Result};
#[cfg(feature = "cli")]
use crate::utils::validation::{self, Validate};
#[cfg(feature = "cli")]
use chrono::{DateTime, TimeDelta, Utc};
#[cfg(feature = "cli")]
use clap::Parser;

#[cfg(feature = "cli")]
#[derive(Debug, Clone, Parser)]
#[command(name = "cost-attribution-etl")]
#[command(about = "Attributes Snowflake credits and query stats to the tasks that caused them")]
pub struct CliConfig {
    /// TOML config file; assembled from environment variables when omitted
    #[arg(long)]
    pub config: Option<String>,

    /// Keep running, one window per interval
    #[arg(long)]
    pub schedule: bool,

    /// Build everything but POST nothing
    #[arg(long)]
    pub dry_run: bool,

    /// Window start (RFC 3339) for a manual backfill run
    #[arg(long)]
    pub start: Option<String>,

    /// Window end (RFC 3339); defaults to start + interval
    #[arg(long)]
    pub end: Option<String>,

    /// Override the derived execution id
    #[arg(long)]
    pub execution_id: Option<String>,

    /// Directory for audit bundles and exported run reports
    #[arg(long)]
    pub output_path: Option<String>,

    #[arg(long, help = "Enable verbose output")]
    pub verbose: bool,

    /// 顯示系統資源統計
    #[arg(long)]
    pub monitor: bool,

    /// JSON logs for supervised runs
    #[arg(long)]
    pub log_json: bool,
}

#[cfg(feature = "cli")]
impl CliConfig {
    /// 明確給定視窗的手動執行（驗證部署或回補用）
    pub fn manual_window(&self, interval_minutes: i64) -> Result<Option<RunWindow>> {
        let Some(start_raw) = &self.start else {
            if self.end.is_some() {
                return Err(EtlError::ValidationError {
                    message: "--end requires --start".to_string(),
                });
            }
            return Ok(None);
        };

        let start = parse_rfc3339("--start", start_raw)?;
        let end = match &self.end {
            Some(end_raw) => parse_rfc3339("--end", end_raw)?,
            None => start + TimeDelta::minutes(interval_minutes),
        };

        RunWindow::from_bounds(start, end).map(Some)
    }
}

#[cfg(feature = "cli")]
impl Validate for CliConfig {
    fn validate(&self) -> Result<()> {
        if let Some(output_path) = &self.output_path {
            validation::validate_path("--output-path", output_path)?;
        }
        if let Some(start) = &self.start {
            parse_rfc3339("--start", start)?;
        }
        if let Some(end) = &self.end {
            parse_rfc3339("--end", end)?;
            if self.start.is_none() {
                return Err(EtlError::ValidationError {
                    message: "--end requires --start".to_string(),
                });
            }
        }
        if self.schedule && self.start.is_some() {
            return Err(EtlError::ValidationError {
                message: "--start/--end only apply to single runs, not --schedule".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(feature = "cli")]
fn parse_rfc3339(field: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EtlError::InvalidConfigValueError {
            field: field.to_string(),
            value: raw.to_string(),
            reason: format!("expected an RFC 3339 timestamp: {}", e),
        })
}
