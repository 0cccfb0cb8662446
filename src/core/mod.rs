pub mod etl;
pub mod observe_api;
pub mod pipeline;
pub mod scheduler;
pub mod snowflake;

pub use crate::domain::model::{
    AttributionResult, ExternalQuery, ExtractBatch, LoadOutcome, MetricBatch, MetricCategory,
    MetricPoint, QueryCost, QueryUsage, RunContext, RunReport, RunWindow, UsageSeries,
};
pub use crate::domain::ports::{ConfigProvider, ObserveApi, Pipeline, Storage, Warehouse};
pub use crate::utils::error::Result;
